use std::env;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{bail, Context, Result};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use reqwest::blocking::{Client as HttpClient, Response as HttpResponse};
use sentiscope_contracts::credentials::Credential;
use sentiscope_contracts::csv::encode_row;
use sentiscope_contracts::records::{MODEL_FIELDS, SENTIMENT_FIELDS};
use sentiscope_contracts::store::OutputFormat;
use serde_json::{json, Map, Value};
use sha2::{Digest, Sha256};

pub const DEFAULT_MODEL: &str = "gemini-1.5-flash-8b";
pub const DEFAULT_API_BASE: &str = "https://generativelanguage.googleapis.com/v1beta";

/// One "analyze this" call: a structured-output prompt plus the images to
/// attach, in order.
#[derive(Debug, Clone)]
pub struct AnalysisRequest {
    pub prompt: String,
    pub assets: Vec<PathBuf>,
    pub format: OutputFormat,
}

/// Remote (or simulated) multimodal model.
///
/// Every failure is reported the same way; callers do not branch on the
/// error kind.
pub trait AnalysisProvider {
    fn name(&self) -> &str;

    /// Binds the credential used by subsequent `invoke` calls. Calling it
    /// again with the same credential changes nothing.
    fn configure(&mut self, credential: &Credential);

    fn invoke(&self, request: &AnalysisRequest) -> Result<String>;
}

impl<P: AnalysisProvider + ?Sized> AnalysisProvider for Box<P> {
    fn name(&self) -> &str {
        (**self).name()
    }

    fn configure(&mut self, credential: &Credential) {
        (**self).configure(credential)
    }

    fn invoke(&self, request: &AnalysisRequest) -> Result<String> {
        (**self).invoke(request)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct GenerationSettings {
    pub model: String,
    pub temperature: f64,
    pub top_p: f64,
    pub top_k: u32,
    pub max_output_tokens: u32,
    pub request_timeout: Duration,
}

impl Default for GenerationSettings {
    fn default() -> Self {
        Self {
            model: DEFAULT_MODEL.to_string(),
            temperature: 0.3,
            top_p: 0.95,
            top_k: 40,
            max_output_tokens: 1024,
            request_timeout: Duration::from_secs(90),
        }
    }
}

pub struct GeminiProvider {
    api_base: String,
    http: HttpClient,
    settings: GenerationSettings,
    api_key: Option<String>,
}

impl GeminiProvider {
    pub fn new(settings: GenerationSettings) -> Self {
        Self {
            api_base: non_empty_env("GEMINI_API_BASE")
                .map(|value| value.trim_end_matches('/').to_string())
                .unwrap_or_else(|| DEFAULT_API_BASE.to_string()),
            http: HttpClient::new(),
            settings,
            api_key: None,
        }
    }

    pub fn with_api_base(mut self, api_base: impl Into<String>) -> Self {
        self.api_base = api_base.into().trim_end_matches('/').to_string();
        self
    }

    fn endpoint(&self) -> String {
        let trimmed = self.settings.model.trim();
        let model_path = if trimmed.starts_with("models/") {
            trimmed.to_string()
        } else {
            format!("models/{trimmed}")
        };
        format!("{}/{}:generateContent", self.api_base, model_path)
    }

    fn build_payload(&self, request: &AnalysisRequest) -> Result<Value> {
        let mut parts = vec![json!({ "text": request.prompt })];
        for asset in &request.assets {
            parts.push(image_part_from_path(asset)?);
        }

        let mut payload = Map::new();
        payload.insert(
            "contents".to_string(),
            json!([{ "role": "user", "parts": parts }]),
        );
        payload.insert(
            "generationConfig".to_string(),
            json!({
                "temperature": self.settings.temperature,
                "topP": self.settings.top_p,
                "topK": self.settings.top_k,
                "maxOutputTokens": self.settings.max_output_tokens,
            }),
        );
        payload.insert(
            "safetySettings".to_string(),
            Value::Array(default_safety_settings()),
        );
        Ok(Value::Object(payload))
    }

    fn extract_text(response_payload: &Value) -> Result<String> {
        let text = response_payload
            .get("candidates")
            .and_then(Value::as_array)
            .and_then(|candidates| candidates.first())
            .and_then(|candidate| candidate.pointer("/content/parts"))
            .and_then(Value::as_array)
            .map(|parts| {
                parts
                    .iter()
                    .filter_map(|part| part.get("text").and_then(Value::as_str))
                    .collect::<String>()
            })
            .unwrap_or_default();
        if !text.trim().is_empty() {
            return Ok(text);
        }
        if let Some(reason) = response_payload
            .pointer("/promptFeedback/blockReason")
            .and_then(Value::as_str)
        {
            bail!("Gemini blocked the prompt ({reason})");
        }
        let finish = response_payload
            .pointer("/candidates/0/finishReason")
            .and_then(Value::as_str)
            .unwrap_or("none");
        bail!("Gemini returned no text (finish reason: {finish})")
    }
}

impl AnalysisProvider for GeminiProvider {
    fn name(&self) -> &str {
        "gemini"
    }

    fn configure(&mut self, credential: &Credential) {
        self.api_key = Some(credential.secret().to_string());
    }

    fn invoke(&self, request: &AnalysisRequest) -> Result<String> {
        let Some(api_key) = self.api_key.as_deref() else {
            bail!("Gemini provider used before a credential was configured");
        };
        let endpoint = self.endpoint();
        let payload = self.build_payload(request)?;
        let response = self
            .http
            .post(&endpoint)
            .query(&[("key", api_key)])
            .timeout(self.settings.request_timeout)
            .json(&payload)
            .send()
            .with_context(|| format!("Gemini request failed ({endpoint})"))?;
        let response_payload = response_json_or_error("Gemini", response)?;
        Self::extract_text(&response_payload)
    }
}

/// Offline provider producing deterministic, well-formed answers.
///
/// Every answer holds one synthetic record seeded from the screenshot's
/// folder and file name, or from the prompt when no image is attached.
#[derive(Debug, Default, Clone)]
pub struct DryrunProvider {
    credential: Option<String>,
}

impl DryrunProvider {
    pub fn new() -> Self {
        Self::default()
    }

    fn sample_row(seed: u64) -> Vec<String> {
        let score = |shift: u32| {
            let bucket = ((seed >> shift) % 21) as f64;
            format!("{:.1}", bucket / 10.0 - 1.0)
        };
        let mut row = vec![
            "1".to_string(),
            "reply".to_string(),
            format!("Sample reply #{}", seed % 1000),
            format!("user{}", seed % 97),
            "No image".to_string(),
            (seed % 500).to_string(),
            (seed % 50).to_string(),
            (seed % 20).to_string(),
            (seed % 10_000).to_string(),
            "2024-10-01 12:00".to_string(),
            (seed % 7 == 0).to_string(),
        ];
        row.extend((0..SENTIMENT_FIELDS.len() as u32).map(|idx| score(idx * 5)));
        row
    }
}

impl AnalysisProvider for DryrunProvider {
    fn name(&self) -> &str {
        "dryrun"
    }

    fn configure(&mut self, credential: &Credential) {
        self.credential = Some(credential.label().to_string());
    }

    fn invoke(&self, request: &AnalysisRequest) -> Result<String> {
        let row = Self::sample_row(dryrun_seed(request)?);

        Ok(match request.format {
            OutputFormat::Csv => format!(
                "```csv\n{}\n{}\n```",
                MODEL_FIELDS.join(","),
                encode_row(row.as_slice())
            ),
            OutputFormat::Json => {
                let tweet = MODEL_FIELDS
                    .iter()
                    .zip(row)
                    .map(|(key, value)| (key.to_string(), Value::String(value)))
                    .collect::<Map<String, Value>>();
                format!(
                    "```json\n{}\n```",
                    serde_json::to_string_pretty(&json!({ "tweets": [tweet] }))?
                )
            }
        })
    }
}

fn dryrun_seed(request: &AnalysisRequest) -> Result<u64> {
    let mut hasher = Sha256::new();
    match request.assets.last() {
        Some(asset) => {
            fs::metadata(asset).with_context(|| format!("failed reading {}", asset.display()))?;
            let folder = asset.parent().and_then(Path::file_name).unwrap_or_default();
            let name = asset.file_name().unwrap_or_default();
            hasher.update(folder.to_string_lossy().as_bytes());
            hasher.update(b"/");
            hasher.update(name.to_string_lossy().as_bytes());
        }
        None => hasher.update(request.prompt.as_bytes()),
    }
    let digest = hasher.finalize();
    let mut seed = [0u8; 8];
    seed.copy_from_slice(&digest[..8]);
    Ok(u64::from_be_bytes(seed))
}

fn default_safety_settings() -> Vec<Value> {
    [
        "HARM_CATEGORY_HATE_SPEECH",
        "HARM_CATEGORY_SEXUALLY_EXPLICIT",
        "HARM_CATEGORY_DANGEROUS_CONTENT",
        "HARM_CATEGORY_HARASSMENT",
    ]
    .into_iter()
    .map(|category| {
        json!({
            "category": category,
            "threshold": "BLOCK_NONE",
        })
    })
    .collect()
}

fn response_json_or_error(provider: &str, response: HttpResponse) -> Result<Value> {
    let status = response.status();
    let code = status.as_u16();
    let body = response
        .text()
        .with_context(|| format!("{provider} response body read failed"))?;
    if !status.is_success() {
        bail!(
            "{provider} request failed ({code}): {}",
            truncate_text(&body, 512)
        );
    }
    let parsed: Value = serde_json::from_str(&body)
        .with_context(|| format!("{provider} returned invalid JSON payload"))?;
    Ok(parsed)
}

pub(crate) fn error_chain_text(err: &anyhow::Error, max_chars: usize) -> String {
    let mut parts: Vec<String> = Vec::new();
    for cause in err.chain() {
        let text = cause.to_string();
        let trimmed = text.trim();
        if trimmed.is_empty() || parts.last().map(String::as_str) == Some(trimmed) {
            continue;
        }
        parts.push(trimmed.to_string());
    }
    if parts.is_empty() {
        return truncate_text(&err.to_string(), max_chars);
    }
    truncate_text(&parts.join(" | caused by: "), max_chars)
}

pub(crate) fn truncate_text(value: &str, max_chars: usize) -> String {
    if value.chars().count() <= max_chars {
        return value.to_string();
    }
    value.chars().take(max_chars).collect::<String>() + "…"
}

fn image_part_from_path(path: &Path) -> Result<Value> {
    let bytes = fs::read(path).with_context(|| format!("failed reading {}", path.display()))?;
    let mime = mime_for_path(path).unwrap_or("image/png");
    Ok(json!({
        "inlineData": {
            "mimeType": mime,
            "data": BASE64.encode(bytes),
        }
    }))
}

fn mime_for_path(path: &Path) -> Option<&'static str> {
    let ext = path.extension()?.to_str()?.to_ascii_lowercase();
    match ext.as_str() {
        "png" => Some("image/png"),
        "jpg" | "jpeg" => Some("image/jpeg"),
        "webp" => Some("image/webp"),
        "gif" => Some("image/gif"),
        _ => None,
    }
}

fn non_empty_env(key: &str) -> Option<String> {
    env::var(key)
        .ok()
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}

#[cfg(test)]
mod tests {
    use std::fs;
    use std::path::Path;

    use sentiscope_contracts::credentials::Credential;
    use sentiscope_contracts::store::OutputFormat;
    use serde_json::{json, Value};

    use super::{
        dryrun_seed, error_chain_text, mime_for_path, AnalysisProvider, AnalysisRequest,
        DryrunProvider, GeminiProvider, GenerationSettings,
    };

    #[test]
    fn gemini_payload_puts_prompt_first_then_images() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        let reference = temp.path().join("Completeness.jpg");
        let shot = temp.path().join("screenshot_0.png");
        fs::write(&reference, b"jpg-bytes")?;
        fs::write(&shot, b"png-bytes")?;

        let provider = GeminiProvider::new(GenerationSettings::default());
        let payload = provider.build_payload(&AnalysisRequest {
            prompt: "analyze".to_string(),
            assets: vec![reference, shot],
            format: OutputFormat::Csv,
        })?;

        let parts = payload["contents"][0]["parts"].as_array().cloned().unwrap_or_default();
        assert_eq!(parts.len(), 3);
        assert_eq!(parts[0]["text"], json!("analyze"));
        assert_eq!(parts[1]["inlineData"]["mimeType"], json!("image/jpeg"));
        assert_eq!(parts[2]["inlineData"]["mimeType"], json!("image/png"));
        assert_eq!(payload["generationConfig"]["topK"], json!(40));
        assert_eq!(payload["generationConfig"]["maxOutputTokens"], json!(1024));
        assert_eq!(payload["safetySettings"][0]["threshold"], json!("BLOCK_NONE"));
        Ok(())
    }

    #[test]
    fn gemini_endpoint_accepts_prefixed_model_names() {
        let settings = GenerationSettings {
            model: "models/gemini-1.5-pro".to_string(),
            ..GenerationSettings::default()
        };
        let provider = GeminiProvider::new(settings).with_api_base("https://example.test/v1/");
        assert_eq!(
            provider.endpoint(),
            "https://example.test/v1/models/gemini-1.5-pro:generateContent"
        );
    }

    #[test]
    fn gemini_text_extraction_joins_parts_and_reports_blocks() {
        let ok = json!({
            "candidates": [{ "content": { "parts": [{ "text": "a," }, { "text": "b" }] } }]
        });
        assert_eq!(GeminiProvider::extract_text(&ok).unwrap_or_default(), "a,b");

        let blocked = json!({ "promptFeedback": { "blockReason": "SAFETY" } });
        let err = GeminiProvider::extract_text(&blocked).unwrap_err();
        assert!(err.to_string().contains("SAFETY"));

        let empty: Value = json!({ "candidates": [{ "finishReason": "MAX_TOKENS" }] });
        let err = GeminiProvider::extract_text(&empty).unwrap_err();
        assert!(err.to_string().contains("MAX_TOKENS"));
    }

    #[test]
    fn gemini_refuses_to_call_without_credential() {
        let provider = GeminiProvider::new(GenerationSettings::default());
        let err = provider
            .invoke(&AnalysisRequest {
                prompt: "x".to_string(),
                assets: Vec::new(),
                format: OutputFormat::Json,
            })
            .unwrap_err();
        assert!(err.to_string().contains("credential"));
    }

    #[test]
    fn dryrun_is_deterministic_per_screenshot() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        let shot = temp.path().join("screenshot_3.png");
        fs::write(&shot, b"png")?;
        let mut provider = DryrunProvider::new();
        provider.configure(&Credential::new("dryrun", ""));
        let request = AnalysisRequest {
            prompt: "p".to_string(),
            assets: vec![shot],
            format: OutputFormat::Csv,
        };
        let first = provider.invoke(&request)?;
        assert_eq!(first, provider.invoke(&request)?);
        assert!(first.starts_with("```csv\ncompleteness,content_type"));
        Ok(())
    }

    #[test]
    fn dryrun_seed_follows_unit_folder_and_file_name() -> anyhow::Result<()> {
        let first = tempfile::tempdir()?;
        let second = tempfile::tempdir()?;
        let request_for = |root: &Path, folder: &str| -> anyhow::Result<AnalysisRequest> {
            fs::create_dir_all(root.join(folder))?;
            let shot = root.join(folder).join("screenshot_0.png");
            fs::write(&shot, b"png")?;
            Ok(AnalysisRequest {
                prompt: "p".to_string(),
                assets: vec![shot],
                format: OutputFormat::Json,
            })
        };

        let same_a = dryrun_seed(&request_for(first.path(), "1851")?)?;
        let same_b = dryrun_seed(&request_for(second.path(), "1851")?)?;
        let other = dryrun_seed(&request_for(second.path(), "1852")?)?;
        assert_eq!(same_a, same_b);
        assert_ne!(same_a, other);

        let prompt_only = AnalysisRequest {
            prompt: "fix this".to_string(),
            assets: Vec::new(),
            format: OutputFormat::Json,
        };
        assert_eq!(dryrun_seed(&prompt_only)?, dryrun_seed(&prompt_only.clone())?);
        Ok(())
    }

    #[test]
    fn dryrun_fails_on_missing_asset() {
        let provider = DryrunProvider::new();
        let request = AnalysisRequest {
            prompt: "p".to_string(),
            assets: vec!["/definitely/missing.png".into()],
            format: OutputFormat::Json,
        };
        assert!(provider.invoke(&request).is_err());
    }

    #[test]
    fn mime_detection_and_error_chain() {
        assert_eq!(mime_for_path("a/b.JPEG".as_ref()), Some("image/jpeg"));
        assert_eq!(mime_for_path("a/b".as_ref()), None);
        let err = anyhow::anyhow!("root cause").context("outer");
        assert_eq!(error_chain_text(&err, 200), "outer | caused by: root cause");
    }
}
