use indexmap::IndexMap;
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::{Map, Value};

use crate::errors::PipelineError;

/// Field name → raw text value, in the order the model produced them.
pub type FieldMap = IndexMap<String, String>;

pub const SENTIMENT_FIELDS: [&str; 10] = [
    "pro_trump",
    "hostile_to_trump",
    "sarcastic_about_trump",
    "ambivalent_about_trump",
    "nationalist_pro_trump",
    "anti_elite_pro_trump",
    "fearful_pro_trump",
    "optimistic_about_trump",
    "skeptical_of_trump",
    "disengaged_from_trump",
];

pub const COUNTER_FIELDS: [&str; 4] = ["likes", "replies", "retweets", "views"];

/// Columns the model emits per tweet (analysis rows).
pub const MODEL_FIELDS: [&str; 21] = [
    "completeness",
    "content_type",
    "text_body",
    "username",
    "image_text_description",
    "likes",
    "replies",
    "retweets",
    "views",
    "time_of_post",
    "promotional_or_irrelevant",
    "pro_trump",
    "hostile_to_trump",
    "sarcastic_about_trump",
    "ambivalent_about_trump",
    "nationalist_pro_trump",
    "anti_elite_pro_trump",
    "fearful_pro_trump",
    "optimistic_about_trump",
    "skeptical_of_trump",
    "disengaged_from_trump",
];

/// Columns of the CSV output store.
pub const STORE_HEADER: [&str; 23] = [
    "tweet_id",
    "file_name",
    "completeness",
    "content_type",
    "text_body",
    "username",
    "image_text_description",
    "likes",
    "replies",
    "retweets",
    "views",
    "time_of_post",
    "promotional_or_irrelevant",
    "pro_trump",
    "hostile_to_trump",
    "sarcastic_about_trump",
    "ambivalent_about_trump",
    "nationalist_pro_trump",
    "anti_elite_pro_trump",
    "fearful_pro_trump",
    "optimistic_about_trump",
    "skeptical_of_trump",
    "disengaged_from_trump",
];

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SentimentScores {
    pub pro_trump: f64,
    pub hostile_to_trump: f64,
    pub sarcastic_about_trump: f64,
    pub ambivalent_about_trump: f64,
    pub nationalist_pro_trump: f64,
    pub anti_elite_pro_trump: f64,
    pub fearful_pro_trump: f64,
    pub optimistic_about_trump: f64,
    pub skeptical_of_trump: f64,
    pub disengaged_from_trump: f64,
}

impl SentimentScores {
    pub fn values(&self) -> [f64; 10] {
        [
            self.pro_trump,
            self.hostile_to_trump,
            self.sarcastic_about_trump,
            self.ambivalent_about_trump,
            self.nationalist_pro_trump,
            self.anti_elite_pro_trump,
            self.fearful_pro_trump,
            self.optimistic_about_trump,
            self.skeptical_of_trump,
            self.disengaged_from_trump,
        ]
    }

    fn from_values(values: [f64; 10]) -> Self {
        let [
            pro_trump,
            hostile_to_trump,
            sarcastic_about_trump,
            ambivalent_about_trump,
            nationalist_pro_trump,
            anti_elite_pro_trump,
            fearful_pro_trump,
            optimistic_about_trump,
            skeptical_of_trump,
            disengaged_from_trump,
        ] = values;
        Self {
            pro_trump,
            hostile_to_trump,
            sarcastic_about_trump,
            ambivalent_about_trump,
            nationalist_pro_trump,
            anti_elite_pro_trump,
            fearful_pro_trump,
            optimistic_about_trump,
            skeptical_of_trump,
            disengaged_from_trump,
        }
    }
}

/// One validated tweet/reply extracted from a screenshot.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnalysisRecord {
    pub completeness: u8,
    pub content_type: String,
    pub text_body: String,
    pub username: String,
    pub image_text_description: String,
    pub likes: u64,
    pub replies: u64,
    pub retweets: u64,
    pub views: u64,
    pub time_of_post: String,
    pub promotional_or_irrelevant: bool,
    #[serde(flatten)]
    pub sentiment: SentimentScores,
}

impl AnalysisRecord {
    /// Validates a raw field map. The first missing or invalid field, in
    /// schema order, is reported.
    pub fn from_fields(fields: &FieldMap) -> Result<Self, PipelineError> {
        for name in MODEL_FIELDS {
            if !fields.contains_key(name) {
                return Err(PipelineError::schema(name, "missing"));
            }
        }
        let text = |name: &str| fields[name].trim().to_string();

        let completeness = parse_completeness(&fields["completeness"])?;
        let counts = COUNTER_FIELDS.map(|name| parse_count(name, &fields[name]));
        let [likes, replies, retweets, views] = counts;
        let (likes, replies, retweets, views) = (likes?, replies?, retweets?, views?);
        let promotional_or_irrelevant =
            parse_flag("promotional_or_irrelevant", &fields["promotional_or_irrelevant"])?;

        let mut scores = [0.0; 10];
        for (slot, name) in scores.iter_mut().zip(SENTIMENT_FIELDS) {
            *slot = parse_score(name, &fields[name])?;
        }

        Ok(Self {
            completeness,
            content_type: text("content_type"),
            text_body: text("text_body"),
            username: text("username"),
            image_text_description: text("image_text_description"),
            likes,
            replies,
            retweets,
            views,
            time_of_post: text("time_of_post"),
            promotional_or_irrelevant,
            sentiment: SentimentScores::from_values(scores),
        })
    }

    /// Builds a field map from a model-produced JSON tweet object.
    pub fn fields_from_json(object: &Map<String, Value>) -> FieldMap {
        object
            .iter()
            .map(|(key, value)| (key.trim().to_string(), json_scalar_text(value)))
            .collect()
    }

    pub fn model_row(&self) -> Vec<String> {
        let mut row = vec![
            self.completeness.to_string(),
            self.content_type.clone(),
            self.text_body.clone(),
            self.username.clone(),
            self.image_text_description.clone(),
            self.likes.to_string(),
            self.replies.to_string(),
            self.retweets.to_string(),
            self.views.to_string(),
            self.time_of_post.clone(),
            self.promotional_or_irrelevant.to_string(),
        ];
        row.extend(self.sentiment.values().iter().map(f64::to_string));
        row
    }

    /// Full 23-column store row.
    pub fn store_row(&self, tweet_id: &str, file_name: &str) -> Vec<String> {
        let mut row = vec![tweet_id.to_string(), file_name.to_string()];
        row.extend(self.model_row());
        row
    }
}

/// `{"tweets": [...]}` payload as stored in normalized JSON envelopes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct TweetBatch {
    pub tweets: Vec<AnalysisRecord>,
}

/// JSON store entry. `response` is raw model text before normalization and
/// a [`TweetBatch`] object afterwards.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    #[serde(deserialize_with = "string_or_number", default)]
    pub tweet_id: String,
    #[serde(default)]
    pub file_name: String,
    #[serde(default)]
    pub response: Value,
}

impl Envelope {
    pub fn raw(tweet_id: &str, file_name: &str, text: &str) -> Self {
        Self {
            tweet_id: tweet_id.to_string(),
            file_name: file_name.to_string(),
            response: Value::String(text.to_string()),
        }
    }

    pub fn normalized(tweet_id: &str, file_name: &str, records: &[AnalysisRecord]) -> Self {
        let batch = TweetBatch {
            tweets: records.to_vec(),
        };
        Self {
            tweet_id: tweet_id.to_string(),
            file_name: file_name.to_string(),
            response: serde_json::to_value(batch).unwrap_or(Value::Null),
        }
    }

    pub fn raw_text(&self) -> Option<&str> {
        self.response.as_str()
    }

    pub fn key(&self) -> (String, String) {
        (self.tweet_id.clone(), self.file_name.clone())
    }
}

fn string_or_number<'de, D>(deserializer: D) -> Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Value::deserialize(deserializer)?;
    Ok(json_scalar_text(&value))
}

fn json_scalar_text(value: &Value) -> String {
    match value {
        Value::Null => String::new(),
        Value::String(text) => text.clone(),
        Value::Bool(flag) => flag.to_string(),
        Value::Number(number) => number.to_string(),
        other => other.to_string(),
    }
}

fn parse_completeness(raw: &str) -> Result<u8, PipelineError> {
    let trimmed = raw.trim();
    let value = trimmed
        .parse::<i64>()
        .or_else(|_| {
            trimmed
                .parse::<f64>()
                .ok()
                .filter(|value| value.fract() == 0.0)
                .map(|value| value as i64)
                .ok_or(())
        })
        .map_err(|_| {
            PipelineError::schema("completeness", format!("`{trimmed}` is not an integer"))
        })?;
    match value {
        0 | 1 => Ok(value as u8),
        other => Err(PipelineError::schema(
            "completeness",
            format!("{other} is not 0 or 1"),
        )),
    }
}

fn parse_count(field: &str, raw: &str) -> Result<u64, PipelineError> {
    let cleaned = raw.trim().replace([',', '_'], "");
    if cleaned.is_empty() {
        return Ok(0);
    }
    let (number, scale) = match cleaned.chars().last().map(|ch| ch.to_ascii_uppercase()) {
        Some('K') => (&cleaned[..cleaned.len() - 1], 1_000.0),
        Some('M') => (&cleaned[..cleaned.len() - 1], 1_000_000.0),
        Some('B') => (&cleaned[..cleaned.len() - 1], 1_000_000_000.0),
        _ => (cleaned.as_str(), 1.0),
    };
    let value = number
        .trim()
        .parse::<f64>()
        .map_err(|_| PipelineError::schema(field, format!("`{}` is not a count", raw.trim())))?
        * scale;
    if !value.is_finite() || value < 0.0 {
        return Err(PipelineError::schema(
            field,
            format!("`{}` is not a non-negative count", raw.trim()),
        ));
    }
    Ok(value.round() as u64)
}

fn parse_flag(field: &str, raw: &str) -> Result<bool, PipelineError> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "true" | "1" | "yes" => Ok(true),
        "false" | "0" | "no" => Ok(false),
        other => Err(PipelineError::schema(
            field,
            format!("`{other}` is not a boolean"),
        )),
    }
}

fn parse_score(field: &str, raw: &str) -> Result<f64, PipelineError> {
    let trimmed = raw.trim();
    let value = trimmed
        .parse::<f64>()
        .map_err(|_| PipelineError::schema(field, format!("`{trimmed}` is not a number")))?;
    if !(-1.0..=1.0).contains(&value) {
        return Err(PipelineError::schema(
            field,
            format!("{value} outside [-1, 1]"),
        ));
    }
    Ok(value)
}

#[cfg(test)]
mod tests {
    use serde_json::{json, Value};

    use super::{AnalysisRecord, Envelope, FieldMap, MODEL_FIELDS, STORE_HEADER};
    use crate::errors::PipelineError;

    fn sample_fields() -> FieldMap {
        let values = [
            "1", "reply", "Great rally", "@voter", "crowd photo", "1.2K", "", "3", "1,024",
            "Oct 5", "false", "0.8", "-0.5", "0.1", "0", "0.4", "0.2", "-0.3", "0.9", "-1", "1.0",
        ];
        MODEL_FIELDS
            .iter()
            .zip(values)
            .map(|(key, value)| (key.to_string(), value.to_string()))
            .collect()
    }

    #[test]
    fn store_header_is_ids_plus_model_fields() {
        assert_eq!(STORE_HEADER.len(), 23);
        assert_eq!(&STORE_HEADER[2..], &MODEL_FIELDS[..]);
    }

    #[test]
    fn from_fields_coerces_counters_and_scores() -> anyhow::Result<()> {
        let record = AnalysisRecord::from_fields(&sample_fields())?;
        assert_eq!(record.completeness, 1);
        assert_eq!(record.likes, 1200);
        assert_eq!(record.replies, 0);
        assert_eq!(record.views, 1024);
        assert!(!record.promotional_or_irrelevant);
        assert_eq!(record.sentiment.skeptical_of_trump, -1.0);
        assert_eq!(record.sentiment.disengaged_from_trump, 1.0);
        Ok(())
    }

    #[test]
    fn out_of_range_score_is_rejected_not_clamped() {
        let mut fields = sample_fields();
        fields.insert("hostile_to_trump".to_string(), "1.5".to_string());
        let err = AnalysisRecord::from_fields(&fields).unwrap_err();
        match err {
            PipelineError::SchemaViolation { field, .. } => assert_eq!(field, "hostile_to_trump"),
            other => panic!("unexpected error {other:?}"),
        }
    }

    #[test]
    fn first_missing_field_is_reported() {
        let mut fields = sample_fields();
        fields.shift_remove("username");
        fields.shift_remove("views");
        let err = AnalysisRecord::from_fields(&fields).unwrap_err();
        assert_eq!(err.to_string(), "schema violation on field `username`: missing");
    }

    #[test]
    fn completeness_must_be_integer_flag() {
        let mut fields = sample_fields();
        fields.insert("completeness".to_string(), "yes".to_string());
        assert!(AnalysisRecord::from_fields(&fields).is_err());
        fields.insert("completeness".to_string(), "2".to_string());
        assert!(AnalysisRecord::from_fields(&fields).is_err());
        fields.insert("completeness".to_string(), "0".to_string());
        assert!(AnalysisRecord::from_fields(&fields).is_ok());
    }

    #[test]
    fn negative_counter_is_rejected() {
        let mut fields = sample_fields();
        fields.insert("likes".to_string(), "-4".to_string());
        assert!(AnalysisRecord::from_fields(&fields).is_err());
    }

    #[test]
    fn json_numbers_and_strings_both_validate() -> anyhow::Result<()> {
        let mut object = serde_json::Map::new();
        for (key, value) in sample_fields() {
            object.insert(key, Value::String(value));
        }
        object.insert("completeness".to_string(), json!(1));
        object.insert("pro_trump".to_string(), json!(0.25));
        object.insert("promotional_or_irrelevant".to_string(), json!(true));
        let record = AnalysisRecord::from_fields(&AnalysisRecord::fields_from_json(&object))?;
        assert_eq!(record.sentiment.pro_trump, 0.25);
        assert!(record.promotional_or_irrelevant);
        Ok(())
    }

    #[test]
    fn store_row_has_store_arity() -> anyhow::Result<()> {
        let record = AnalysisRecord::from_fields(&sample_fields())?;
        let row = record.store_row("1851", "screenshot_0.png");
        assert_eq!(row.len(), STORE_HEADER.len());
        assert_eq!(row[0], "1851");
        assert_eq!(row[13], "0.8");
        Ok(())
    }

    #[test]
    fn envelope_accepts_numeric_tweet_id() -> anyhow::Result<()> {
        let envelope: Envelope = serde_json::from_value(json!({
            "tweet_id": 1851,
            "file_name": "screenshot_1.png",
            "response": "```json {}```"
        }))?;
        assert_eq!(envelope.tweet_id, "1851");
        assert_eq!(envelope.raw_text(), Some("```json {}```"));
        Ok(())
    }

    #[test]
    fn normalized_envelope_serializes_flat_sentiment() -> anyhow::Result<()> {
        let record = AnalysisRecord::from_fields(&sample_fields())?;
        let envelope = Envelope::normalized("1", "a.png", &[record]);
        assert_eq!(envelope.response["tweets"][0]["pro_trump"], json!(0.8));
        assert_eq!(envelope.response["tweets"][0]["likes"], json!(1200));
        Ok(())
    }
}
