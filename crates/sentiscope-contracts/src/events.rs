use std::fs::OpenOptions;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use chrono::{SecondsFormat, Utc};
use serde_json::{Map, Value};

pub type EventPayload = Map<String, Value>;

/// Append-only run log (`*.events.jsonl`).
///
/// - default fields are `type`, `run_id`, `ts`
/// - caller payload is merged last and can override defaults
/// - one compact JSON object per line, written before `emit` returns
///
/// A writer built with [`EventWriter::discard`] formats events but never
/// touches the filesystem.
#[derive(Debug, Clone)]
pub struct EventWriter {
    inner: Arc<EventWriterInner>,
}

#[derive(Debug)]
struct EventWriterInner {
    path: Option<PathBuf>,
    run_id: String,
    lock: Mutex<()>,
}

impl EventWriter {
    pub fn new(path: impl Into<PathBuf>, run_id: impl Into<String>) -> Self {
        Self::build(Some(path.into()), run_id.into())
    }

    pub fn discard(run_id: impl Into<String>) -> Self {
        Self::build(None, run_id.into())
    }

    fn build(path: Option<PathBuf>, run_id: String) -> Self {
        Self {
            inner: Arc::new(EventWriterInner {
                path,
                run_id,
                lock: Mutex::new(()),
            }),
        }
    }

    pub fn path(&self) -> Option<&Path> {
        self.inner.path.as_deref()
    }

    pub fn run_id(&self) -> &str {
        &self.inner.run_id
    }

    pub fn emit(&self, event_type: &str, payload: EventPayload) -> anyhow::Result<Value> {
        let mut event = Map::new();
        event.insert("type".to_string(), Value::String(event_type.to_string()));
        event.insert(
            "run_id".to_string(),
            Value::String(self.inner.run_id.clone()),
        );
        event.insert("ts".to_string(), Value::String(now_utc_iso()));
        for (key, value) in payload {
            event.insert(key, value);
        }

        let Some(path) = self.inner.path.as_ref() else {
            return Ok(Value::Object(event));
        };
        if let Some(parent) = path.parent().filter(|dir| !dir.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)?;
        }

        let line = serde_json::to_string(&event)?;
        let _guard = self
            .inner
            .lock
            .lock()
            .map_err(|_| anyhow::anyhow!("event writer lock poisoned"))?;
        let mut file = OpenOptions::new().create(true).append(true).open(path)?;
        file.write_all(line.as_bytes())?;
        file.write_all(b"\n")?;

        Ok(Value::Object(event))
    }

    /// Like [`emit`](Self::emit) for a unit-scoped event, but a failing log
    /// write is reported through `log` instead of interrupting the unit.
    pub fn unit_event(
        &self,
        event_type: &str,
        unit_id: &str,
        file_name: &str,
        mut payload: EventPayload,
    ) {
        payload
            .entry("unit_id")
            .or_insert_with(|| Value::String(unit_id.to_string()));
        payload
            .entry("file_name")
            .or_insert_with(|| Value::String(file_name.to_string()));
        if let Err(err) = self.emit(event_type, payload) {
            log::warn!("could not record {event_type} for unit {unit_id}: {err:#}");
        }
    }
}

fn now_utc_iso() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Micros, false)
}
