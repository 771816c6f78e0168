use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use sentiscope_contracts::records::Envelope;
use serde_json::Value;

#[derive(Debug, Clone, PartialEq)]
pub enum UnitInput {
    /// Screenshot to send to the model.
    Screenshot(PathBuf),
    /// Earlier model output that needs re-parsing or correction.
    PriorResponse(String),
}

/// One screenshot or one stored response, processed once per run.
#[derive(Debug, Clone, PartialEq)]
pub struct WorkUnit {
    pub unit_id: String,
    pub file_name: String,
    pub input: UnitInput,
}

impl WorkUnit {
    pub fn screenshot(unit_id: impl Into<String>, path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let file_name = path
            .file_name()
            .map(|name| name.to_string_lossy().to_string())
            .unwrap_or_default();
        Self {
            unit_id: unit_id.into(),
            file_name,
            input: UnitInput::Screenshot(path),
        }
    }

    pub fn from_envelope(envelope: &Envelope) -> Self {
        let text = match &envelope.response {
            Value::String(text) => text.clone(),
            Value::Null => String::new(),
            other => other.to_string(),
        };
        Self {
            unit_id: envelope.tweet_id.clone(),
            file_name: envelope.file_name.clone(),
            input: UnitInput::PriorResponse(text),
        }
    }

    pub fn label(&self) -> String {
        format!("{}/{}", self.unit_id, self.file_name)
    }
}

/// Lists `root/<unit-id>/*.png` in name order. Files directly under `root`
/// and non-PNG files are ignored.
pub fn enumerate_screenshots(root: &Path) -> Result<Vec<WorkUnit>> {
    let mut folders = fs::read_dir(root)
        .with_context(|| format!("failed to list {}", root.display()))?
        .filter_map(|entry| entry.ok())
        .map(|entry| entry.path())
        .filter(|path| path.is_dir())
        .collect::<Vec<PathBuf>>();
    folders.sort();

    let mut units = Vec::new();
    for folder in folders {
        let Some(unit_id) = folder
            .file_name()
            .map(|name| name.to_string_lossy().to_string())
        else {
            continue;
        };
        let mut shots = fs::read_dir(&folder)
            .with_context(|| format!("failed to list {}", folder.display()))?
            .filter_map(|entry| entry.ok())
            .map(|entry| entry.path())
            .filter(|path| path.is_file() && is_png(path))
            .collect::<Vec<PathBuf>>();
        shots.sort_by(|left, right| natural_key(left).cmp(&natural_key(right)));
        units.extend(shots.into_iter().map(|shot| WorkUnit::screenshot(&unit_id, shot)));
    }
    Ok(units)
}

pub fn units_from_envelopes(envelopes: &[Envelope]) -> Vec<WorkUnit> {
    envelopes.iter().map(WorkUnit::from_envelope).collect()
}

fn is_png(path: &Path) -> bool {
    path.extension()
        .and_then(|ext| ext.to_str())
        .map(|ext| ext.eq_ignore_ascii_case("png"))
        .unwrap_or(false)
}

/// Orders `screenshot_2.png` before `screenshot_10.png`.
fn natural_key(path: &Path) -> (String, u64, String) {
    let name = path
        .file_name()
        .map(|name| name.to_string_lossy().to_string())
        .unwrap_or_default();
    let stem = path
        .file_stem()
        .map(|stem| stem.to_string_lossy().to_string())
        .unwrap_or_default();
    let digits = stem
        .chars()
        .rev()
        .take_while(char::is_ascii_digit)
        .collect::<Vec<char>>();
    let prefix = stem[..stem.len() - digits.len()].to_string();
    let number = digits
        .into_iter()
        .rev()
        .collect::<String>()
        .parse::<u64>()
        .unwrap_or(0);
    (prefix, number, name)
}
