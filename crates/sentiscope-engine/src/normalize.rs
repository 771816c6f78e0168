//! Turns raw model text into validated [`AnalysisRecord`]s.
//!
//! Model output is untrusted: it may arrive fenced, wrapped in an envelope,
//! truncated, or with rows of the wrong width. Whole-payload failures are
//! `MalformedPayload`; per-row failures are collected so the good rows of a
//! response still reach the store.

use sentiscope_contracts::csv::parse_rows;
use sentiscope_contracts::errors::PipelineError;
use sentiscope_contracts::records::{AnalysisRecord, FieldMap, MODEL_FIELDS, STORE_HEADER};
use sentiscope_contracts::store::OutputFormat;
use serde_json::Value;

use crate::prompts::correction_prompt;
use crate::providers::{AnalysisProvider, AnalysisRequest};
use crate::resilience::ResilientInvoker;
use crate::units::WorkUnit;

const FENCE_MARKERS: [&str; 3] = ["```json", "```csv", "```"];
const MAX_ENVELOPE_DEPTH: usize = 4;

/// One row or tweet object found in a payload, before validation.
#[derive(Debug)]
pub struct Candidate {
    /// Where the row came from, e.g. `row 2` or `tweet 1`.
    pub origin: String,
    pub fields: Result<FieldMap, PipelineError>,
}

#[derive(Debug)]
pub struct Rejection {
    pub origin: String,
    pub error: PipelineError,
}

#[derive(Debug, Default)]
pub struct Normalized {
    pub records: Vec<AnalysisRecord>,
    pub rejected: Vec<Rejection>,
}

impl Normalized {
    /// True when the payload had rows but none survived validation.
    pub fn all_rejected(&self) -> bool {
        self.records.is_empty() && !self.rejected.is_empty()
    }
}

/// Removes code-fence markers until none remain, then trims.
pub fn strip_wrappers(raw: &str) -> String {
    let mut text = raw.to_string();
    loop {
        let before = text.len();
        for marker in FENCE_MARKERS {
            text = text.replace(marker, "");
        }
        if text.len() == before {
            break;
        }
    }
    text.trim().to_string()
}

/// Splits a response into candidate rows. Row-level problems (wrong CSV
/// width, non-object tweet) are reported per candidate.
pub fn parse(raw: &str, format: OutputFormat) -> Result<Vec<Candidate>, PipelineError> {
    let text = strip_wrappers(raw);
    if text.is_empty() {
        return Err(PipelineError::malformed("empty response"));
    }
    match format {
        OutputFormat::Csv => Ok(parse_csv(&text)),
        OutputFormat::Json => parse_json(&text),
    }
}

pub fn validate(fields: &FieldMap) -> Result<AnalysisRecord, PipelineError> {
    AnalysisRecord::from_fields(fields)
}

pub fn normalize(raw: &str, format: OutputFormat) -> Result<Normalized, PipelineError> {
    let mut normalized = Normalized::default();
    for candidate in parse(raw, format)? {
        match candidate.fields.and_then(|fields| validate(&fields)) {
            Ok(record) => normalized.records.push(record),
            Err(error) => normalized.rejected.push(Rejection {
                origin: candidate.origin,
                error,
            }),
        }
    }
    Ok(normalized)
}

/// Asks the model to rewrite `raw` in the strict `format`, through the same
/// attempt budget as analysis calls, and normalizes the answer.
pub fn repair<P: AnalysisProvider>(
    invoker: &mut ResilientInvoker<P>,
    unit: &WorkUnit,
    raw: &str,
    format: OutputFormat,
) -> Result<Normalized, PipelineError> {
    let request = AnalysisRequest {
        prompt: correction_prompt(format, &unit.unit_id, &unit.file_name, raw),
        assets: Vec::new(),
        format,
    };
    let invocation = invoker.call_with_resilience(unit, &request)?;
    normalize(&invocation.text, format)
}

/// Offline fix for stored raw responses: the decoded JSON value, if the
/// unfenced text (or the object embedded in it) parses.
pub fn fix_embedded_json(raw: &str) -> Option<Value> {
    decode_json(&strip_wrappers(raw)).ok()
}

fn parse_csv(text: &str) -> Vec<Candidate> {
    parse_rows(text)
        .into_iter()
        .enumerate()
        .filter(|(_, row)| !is_header(row))
        .map(|(idx, row)| {
            let origin = format!("row {}", idx + 1);
            let fields = match row.len() {
                len if len == MODEL_FIELDS.len() => Ok(zip_fields(&MODEL_FIELDS, row)),
                len if len == STORE_HEADER.len() => Ok(zip_fields(&STORE_HEADER, row)),
                len => Err(PipelineError::malformed(format!(
                    "{origin} has {len} fields, expected {} or {}",
                    MODEL_FIELDS.len(),
                    STORE_HEADER.len()
                ))),
            };
            Candidate { origin, fields }
        })
        .collect()
}

fn is_header(row: &[String]) -> bool {
    row.first()
        .map(|cell| {
            let cell = cell.trim().to_ascii_lowercase();
            cell == "completeness" || cell == "tweet_id"
        })
        .unwrap_or(false)
}

fn zip_fields(names: &[&str], row: Vec<String>) -> FieldMap {
    names
        .iter()
        .zip(row)
        .map(|(name, value)| (name.to_string(), value))
        .collect()
}

fn parse_json(text: &str) -> Result<Vec<Candidate>, PipelineError> {
    let value = decode_json(text)?;
    let tweets = tweet_values(value, 0)?;
    Ok(tweets
        .into_iter()
        .enumerate()
        .map(|(idx, tweet)| {
            let origin = format!("tweet {}", idx + 1);
            let fields = match tweet {
                Value::Object(object) => Ok(AnalysisRecord::fields_from_json(&object)),
                other => Err(PipelineError::malformed(format!(
                    "{origin} is not an object: {other}"
                ))),
            };
            Candidate { origin, fields }
        })
        .collect())
}

fn decode_json(text: &str) -> Result<Value, PipelineError> {
    serde_json::from_str(text).or_else(|err| {
        embedded_json(text)
            .ok_or_else(|| PipelineError::malformed(format!("not valid JSON: {err}")))
    })
}

/// Decodes the outermost `{...}` or `[...]` span when the model surrounded
/// the payload with prose.
fn embedded_json(text: &str) -> Option<Value> {
    [('{', '}'), ('[', ']')].into_iter().find_map(|(open, close)| {
        let start = text.find(open)?;
        let end = text.rfind(close)?;
        if end <= start {
            return None;
        }
        serde_json::from_str(&text[start..=end]).ok()
    })
}

fn tweet_values(value: Value, depth: usize) -> Result<Vec<Value>, PipelineError> {
    if depth > MAX_ENVELOPE_DEPTH {
        return Err(PipelineError::malformed("response nested too deeply"));
    }
    match value {
        Value::Object(mut object) => {
            if let Some(tweets) = object.remove("tweets") {
                return match tweets {
                    Value::Array(items) => Ok(items),
                    Value::Null => Ok(Vec::new()),
                    single @ Value::Object(_) => Ok(vec![single]),
                    other => Err(PipelineError::malformed(format!(
                        "`tweets` is not a list: {other}"
                    ))),
                };
            }
            if let Some(response) = object.remove("response") {
                return match response {
                    Value::String(text) => {
                        tweet_values(decode_json(&strip_wrappers(&text))?, depth + 1)
                    }
                    other => tweet_values(other, depth + 1),
                };
            }
            if object.contains_key("completeness") {
                return Ok(vec![Value::Object(object)]);
            }
            Err(PipelineError::malformed("no tweets found in JSON object"))
        }
        Value::Array(items) => {
            let mut tweets = Vec::new();
            for item in items {
                let wrapped = item
                    .as_object()
                    .map(|object| object.contains_key("tweets") || object.contains_key("response"))
                    .unwrap_or(false);
                if wrapped {
                    tweets.extend(tweet_values(item, depth + 1)?);
                } else {
                    tweets.push(item);
                }
            }
            Ok(tweets)
        }
        other => Err(PipelineError::malformed(format!(
            "expected a JSON object or array, got {other}"
        ))),
    }
}

#[cfg(test)]
mod tests {
    use sentiscope_contracts::credentials::{Credential, CredentialPool};
    use sentiscope_contracts::csv::encode_row;
    use sentiscope_contracts::errors::PipelineError;
    use sentiscope_contracts::events::EventWriter;
    use sentiscope_contracts::records::MODEL_FIELDS;
    use sentiscope_contracts::store::OutputFormat;
    use serde_json::{json, Map, Value};
    use std::time::Duration;

    use super::*;
    use crate::resilience::RetryPolicy;
    use crate::test_support::ScriptedProvider;

    fn sample_values(score: &str) -> Vec<String> {
        [
            "1", "reply", "Vote, please", "@someone", "no image", "12", "3", "1", "1.5K",
            "Oct 5, 2024", "false", score, "0", "0", "0", "0", "0", "0", "0", "0", "-0.2",
        ]
        .iter()
        .map(|value| value.to_string())
        .collect()
    }

    fn sample_tweet(score: f64) -> Value {
        let object = MODEL_FIELDS
            .iter()
            .zip(sample_values("0"))
            .map(|(key, value)| (key.to_string(), Value::String(value)))
            .collect::<Map<String, Value>>();
        let mut tweet = Value::Object(object);
        tweet["pro_trump"] = json!(score);
        tweet
    }

    #[test]
    fn strip_wrappers_removes_fences_only() {
        let inner = r#"{"tweets":[{"text_body":"a ``` b"}]}"#;
        let raw = format!("```json\n{inner}\n```");
        assert_eq!(strip_wrappers(&raw), inner.replace("```", ""));
        assert_eq!(
            strip_wrappers("```json\n{\"tweets\":[]}\n```"),
            "{\"tweets\":[]}"
        );
        assert_eq!(strip_wrappers("  plain  "), "plain");
        assert_eq!(strip_wrappers(""), "");
    }

    #[test]
    fn strip_wrappers_is_idempotent() {
        for raw in [
            "```json\n{}\n```",
            "``````json```csv",
            "``\n`x`\n``",
            "```c```sv```",
            "no fences",
        ] {
            let once = strip_wrappers(raw);
            assert_eq!(strip_wrappers(&once), once, "input {raw:?}");
        }
    }

    #[test]
    fn csv_row_one_field_short_is_malformed_and_others_survive() -> anyhow::Result<()> {
        let good = sample_values("0.4");
        let mut short = sample_values("0.1");
        short.pop();
        assert_eq!(short.len(), 20);
        let raw = format!(
            "```csv\n{}\n{}\n{}\n```",
            MODEL_FIELDS.join(","),
            encode_row(short.as_slice()),
            encode_row(good.as_slice())
        );

        let candidates = parse(&raw, OutputFormat::Csv)?;
        assert_eq!(candidates.len(), 2);
        assert!(matches!(
            candidates[0].fields,
            Err(PipelineError::MalformedPayload { .. })
        ));

        let normalized = normalize(&raw, OutputFormat::Csv)?;
        assert_eq!(normalized.records.len(), 1);
        assert_eq!(normalized.records[0].sentiment.pro_trump, 0.4);
        assert_eq!(normalized.records[0].views, 1500);
        assert_eq!(normalized.rejected.len(), 1);
        assert_eq!(normalized.rejected[0].origin, "row 2");
        Ok(())
    }

    #[test]
    fn csv_store_width_rows_are_accepted() -> anyhow::Result<()> {
        let mut row = vec!["1851".to_string(), "s.png".to_string()];
        row.extend(sample_values("0.3"));
        let normalized = normalize(&encode_row(row.as_slice()), OutputFormat::Csv)?;
        assert_eq!(normalized.records.len(), 1);
        assert!(normalized.rejected.is_empty());
        Ok(())
    }

    #[test]
    fn json_shapes_are_all_located() -> anyhow::Result<()> {
        let tweet = sample_tweet(0.5);
        let shapes = [
            json!({ "tweets": [tweet.clone(), tweet.clone()] }).to_string(),
            tweet.to_string(),
            json!([tweet.clone()]).to_string(),
            json!({
                "tweet_id": "1",
                "file_name": "a.png",
                "response": format!("```json\n{}\n```", json!({ "tweets": [tweet.clone()] })),
            })
            .to_string(),
            format!("Here you go: {} Hope it helps.", json!({ "tweets": [tweet.clone()] })),
        ];
        let counts = shapes
            .iter()
            .map(|raw| normalize(raw, OutputFormat::Json).map(|n| n.records.len()))
            .collect::<Result<Vec<usize>, PipelineError>>()?;
        assert_eq!(counts, vec![2, 1, 1, 1, 1]);
        Ok(())
    }

    #[test]
    fn undecodable_json_is_malformed() {
        for raw in ["```json\n{\"tweets\": [\n```", "", "42", "{\"other\": 1}"] {
            assert!(
                matches!(
                    normalize(raw, OutputFormat::Json),
                    Err(PipelineError::MalformedPayload { .. })
                ),
                "input {raw:?}"
            );
        }
    }

    #[test]
    fn out_of_range_tweet_is_rejected_with_field() -> anyhow::Result<()> {
        let raw = json!({ "tweets": [sample_tweet(2.0), sample_tweet(-0.5)] }).to_string();
        let normalized = normalize(&raw, OutputFormat::Json)?;
        assert_eq!(normalized.records.len(), 1);
        assert_eq!(normalized.rejected[0].origin, "tweet 1");
        assert!(matches!(
            &normalized.rejected[0].error,
            PipelineError::SchemaViolation { field, .. } if field == "pro_trump"
        ));
        Ok(())
    }

    #[test]
    fn empty_tweet_list_is_not_a_rejection() -> anyhow::Result<()> {
        let normalized = normalize("{\"tweets\": []}", OutputFormat::Json)?;
        assert!(normalized.records.is_empty());
        assert!(!normalized.all_rejected());
        Ok(())
    }

    #[test]
    fn fix_embedded_json_decodes_fenced_text() {
        assert_eq!(
            fix_embedded_json("```json\n{\"a\": 1}\n```"),
            Some(json!({ "a": 1 }))
        );
        assert_eq!(fix_embedded_json("```json\n{\"a\": \n```"), None);
    }

    #[test]
    fn repair_sends_correction_prompt_and_parses_answer() -> anyhow::Result<()> {
        let fixed = json!({ "tweets": [sample_tweet(0.1)] }).to_string();
        let provider = ScriptedProvider::new(vec![Ok(format!("```json\n{fixed}\n```"))]);
        let calls = provider.calls();
        let pool = CredentialPool::new(vec![Credential::new("k1", "s1")])?;
        let policy = RetryPolicy {
            backoff: Duration::ZERO,
            cycles: 1,
        };
        let mut invoker =
            ResilientInvoker::new(provider, pool, policy, EventWriter::discard("run"));
        let unit = WorkUnit::from_envelope(&serde_json::from_value(json!({
            "tweet_id": "7",
            "file_name": "s.png",
            "response": "{ tweets: broken",
        }))?);

        let normalized = repair(&mut invoker, &unit, "{ tweets: broken", OutputFormat::Json)?;
        assert_eq!(normalized.records.len(), 1);
        let prompts = calls.borrow();
        assert_eq!(prompts.len(), 1);
        assert!(prompts[0].prompt.ends_with("{ tweets: broken"));
        assert!(prompts[0].assets.is_empty());
        Ok(())
    }
}
