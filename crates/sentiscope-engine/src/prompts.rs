//! Structured-output instructions sent to the model.

use sentiscope_contracts::records::{MODEL_FIELDS, STORE_HEADER};
use sentiscope_contracts::store::OutputFormat;

const FIELD_GUIDE: &[(&str, &str)] = &[
    ("completeness", "1 if the tweet is fully visible, 0 otherwise"),
    (
        "content_type",
        "\"tweet\" for an original post by Donald J. Trump, \"reply\" for everything else",
    ),
    ("text_body", "the tweet text"),
    (
        "username",
        "the handle attached to this tweet only; several handles may be visible, pick the author's; empty if none",
    ),
    (
        "image_text_description",
        "describe any attached image from its creator's point of view, including the emotion it conveys",
    ),
    ("likes, replies, retweets, views", "integers as displayed"),
    ("time_of_post", "date and time as displayed"),
    (
        "promotional_or_irrelevant",
        "true if the tweet is promotional or unrelated to the campaign, false otherwise",
    ),
    ("pro_trump", "-1 strongly anti-Trump, 0 neutral, 1 strongly pro-Trump"),
    ("hostile_to_trump", "-1 friendly to Trump, 0 neutral, 1 extremely hostile"),
    ("sarcastic_about_trump", "-1 no sarcasm, 1 highly sarcastic"),
    ("ambivalent_about_trump", "-1 clear stance, 1 extremely ambivalent"),
    (
        "nationalist_pro_trump",
        "-1 anti-nationalist, 1 highly nationalist in support of Trump",
    ),
    (
        "anti_elite_pro_trump",
        "-1 pro-elite, 1 highly anti-elite in support of Trump",
    ),
    ("fearful_pro_trump", "-1 no fear, 1 extreme fear"),
    ("optimistic_about_trump", "-1 pessimistic, 1 highly optimistic"),
    ("skeptical_of_trump", "-1 trusting, 1 highly skeptical"),
    ("disengaged_from_trump", "-1 highly engaged, 1 extremely disengaged"),
];

const CSV_SAMPLE_ROW: &str = "1,\"tweet\",\"Tweet text here\",\"username\",\"Image description here\",0,0,0,0,\"time\",false,0.0,0.0,0.0,0.0,0.0,0.0,0.0,0.0,0.0,0.0";

fn field_guide() -> String {
    FIELD_GUIDE
        .iter()
        .map(|(field, meaning)| format!("{field}: {meaning}"))
        .collect::<Vec<String>>()
        .join("\n")
}

fn json_tweet_template() -> String {
    let body = MODEL_FIELDS
        .iter()
        .map(|field| {
            let placeholder = match *field {
                "completeness" => "\"<1 or 0>\"",
                "content_type" => "\"<tweet or reply>\"",
                "likes" | "replies" | "retweets" | "views" => "<integer>",
                "promotional_or_irrelevant" => "<true or false>",
                "text_body" | "username" | "image_text_description" | "time_of_post" => {
                    "\"<text>\""
                }
                _ => "<float between -1 and 1>",
            };
            format!("      \"{field}\": {placeholder}")
        })
        .collect::<Vec<String>>()
        .join(",\n");
    format!("{{\n  \"tweets\": [\n    {{\n{body}\n    }}\n  ]\n}}")
}

/// Prompt for analyzing one screenshot. With a reference image, the first
/// attached image is the exemplar and the second the screenshot.
pub fn analysis_prompt(format: OutputFormat, with_reference: bool) -> String {
    let mut prompt = String::from(
        "Analyze the attached image. Extract the Twitter interaction details of every complete tweet, reply or quote and ignore incomplete ones.\n",
    );
    if with_reference {
        prompt.push_str(
            "The first image is a reference showing the difference between a complete and an incomplete tweet and labels the parts of a complete tweet. Only analyze the second image.\n",
        );
    }
    prompt.push('\n');
    match format {
        OutputFormat::Csv => {
            prompt.push_str("Answer in CSV with exactly this header and one row per tweet:\n\n");
            prompt.push_str(&MODEL_FIELDS.join(","));
            prompt.push('\n');
            prompt.push_str(CSV_SAMPLE_ROW);
            prompt.push_str(
                "\n\nQuote every text field with double quotes and escape inner double quotes by doubling them.\n",
            );
        }
        OutputFormat::Json => {
            prompt.push_str("Answer with a single JSON object of this shape and nothing else:\n\n");
            prompt.push_str(&json_tweet_template());
            prompt.push('\n');
        }
    }
    prompt.push_str("\nField meanings:\n");
    prompt.push_str(&field_guide());
    prompt
}

/// Prompt asking the model to rewrite an earlier answer into the strict
/// output format.
pub fn correction_prompt(
    format: OutputFormat,
    tweet_id: &str,
    file_name: &str,
    previous: &str,
) -> String {
    match format {
        OutputFormat::Json => format!(
            "The response below is not valid JSON. Convert it into a single valid JSON object for tweet_id \"{tweet_id}\" and file_name \"{file_name}\", following this format strictly:\n\n{}\n\nConvert the following response:\n{previous}",
            json_tweet_template()
        ),
        OutputFormat::Csv => format!(
            "Convert the following entry to CSV. Flatten nested values so that every key has its own column, and output exactly this header followed by one row per tweet:\n\n{}\n\nUse tweet_id \"{tweet_id}\" and file_name \"{file_name}\". Quote text fields with double quotes.\n\nEntry:\n{previous}",
            STORE_HEADER.join(",")
        ),
    }
}

#[cfg(test)]
mod tests {
    use sentiscope_contracts::store::OutputFormat;

    use super::{analysis_prompt, correction_prompt, json_tweet_template};

    #[test]
    fn csv_prompt_embeds_header_and_reference_hint() {
        let prompt = analysis_prompt(OutputFormat::Csv, true);
        assert!(prompt.contains("completeness,content_type,text_body"));
        assert!(prompt.contains("Only analyze the second image"));
        assert!(!analysis_prompt(OutputFormat::Csv, false).contains("second image"));
    }

    #[test]
    fn json_template_lists_every_model_field() {
        let template = json_tweet_template();
        for field in sentiscope_contracts::records::MODEL_FIELDS {
            assert!(template.contains(&format!("\"{field}\":")), "missing {field}");
        }
    }

    #[test]
    fn correction_prompt_carries_previous_text() {
        let prompt = correction_prompt(OutputFormat::Csv, "42", "s.png", "{broken");
        assert!(prompt.contains("tweet_id,file_name,completeness"));
        assert!(prompt.ends_with("{broken"));
        assert!(correction_prompt(OutputFormat::Json, "42", "s.png", "x").contains("\"42\""));
    }
}
