use std::fmt;
use std::fs::File;
use std::path::{Path, PathBuf};

use sentiscope_contracts::errors::PipelineError;
use sentiscope_contracts::events::{EventPayload, EventWriter};
use sentiscope_contracts::runs::summary::RunSummary;
use sentiscope_contracts::store::{OutputFormat, OutputStore};
use serde_json::Value;

use crate::normalize::{normalize, repair, Normalized};
use crate::prompts::analysis_prompt;
use crate::providers::{AnalysisProvider, AnalysisRequest};
use crate::resilience::ResilientInvoker;
use crate::units::{UnitInput, WorkUnit};

#[derive(Debug, Clone, PartialEq)]
pub struct PipelineOptions {
    /// Format the model is asked for, and the format repaired answers are
    /// parsed in.
    pub format: OutputFormat,
    /// Exemplar image sent ahead of every screenshot.
    pub reference: Option<PathBuf>,
    /// Store the unnormalized response (JSON stores only).
    pub keep_raw: bool,
    /// Send unusable responses back to the model with a correction prompt.
    pub repair: bool,
    /// Skip units the store already holds.
    pub resume: bool,
}

impl PipelineOptions {
    pub fn new(format: OutputFormat) -> Self {
        Self {
            format,
            reference: None,
            keep_raw: false,
            repair: false,
            resume: false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UnitOutcome {
    Written(usize),
    KeptRaw,
    Dropped(String),
    Abandoned,
    AlreadyDone,
}

impl UnitOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Written(_) => "written",
            Self::KeptRaw => "kept_raw",
            Self::Dropped(_) => "dropped",
            Self::Abandoned => "abandoned",
            Self::AlreadyDone => "already_done",
        }
    }
}

impl fmt::Display for UnitOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Written(1) => write!(f, "1 record"),
            Self::Written(count) => write!(f, "{count} records"),
            Self::KeptRaw => write!(f, "raw response kept"),
            Self::Dropped(reason) => write!(f, "dropped ({reason})"),
            Self::Abandoned => write!(f, "abandoned, credentials exhausted"),
            Self::AlreadyDone => write!(f, "already done"),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct RunReport {
    pub output: PathBuf,
    pub units_total: usize,
    pub units_written: usize,
    pub units_kept_raw: usize,
    pub units_dropped: usize,
    pub units_abandoned: usize,
    pub units_already_done: usize,
    pub records_written: usize,
    pub pending_flush: bool,
}

impl RunReport {
    fn record(&mut self, outcome: &UnitOutcome) {
        match outcome {
            UnitOutcome::Written(count) => {
                self.units_written += 1;
                self.records_written += count;
            }
            UnitOutcome::KeptRaw => self.units_kept_raw += 1,
            UnitOutcome::Dropped(_) => self.units_dropped += 1,
            UnitOutcome::Abandoned => self.units_abandoned += 1,
            UnitOutcome::AlreadyDone => self.units_already_done += 1,
        }
    }

    pub fn summary(&self, run_id: &str, started_at: &str, finished_at: &str) -> RunSummary {
        RunSummary {
            run_id: run_id.to_string(),
            started_at: started_at.to_string(),
            finished_at: finished_at.to_string(),
            output: self.output.display().to_string(),
            units_total: self.units_total as u64,
            units_written: self.units_written as u64,
            units_kept_raw: self.units_kept_raw as u64,
            units_already_done: self.units_already_done as u64,
            units_dropped: self.units_dropped as u64,
            units_abandoned: self.units_abandoned as u64,
            records_written: self.records_written as u64,
            pending_flush: self.pending_flush,
        }
    }
}

/// Drives units one at a time: invoke, normalize, append and flush, then
/// the next unit.
pub struct AnalysisPipeline<P: AnalysisProvider> {
    invoker: ResilientInvoker<P>,
    store: Box<dyn OutputStore>,
    options: PipelineOptions,
    events: EventWriter,
}

impl<P: AnalysisProvider> AnalysisPipeline<P> {
    pub fn new(
        invoker: ResilientInvoker<P>,
        store: Box<dyn OutputStore>,
        options: PipelineOptions,
        events: EventWriter,
    ) -> Self {
        Self {
            invoker,
            store,
            options,
            events,
        }
    }

    pub fn store(&self) -> &dyn OutputStore {
        self.store.as_ref()
    }

    pub fn invoker(&self) -> &ResilientInvoker<P> {
        &self.invoker
    }

    pub fn run(&mut self, units: &[WorkUnit]) -> RunReport {
        let mut report = RunReport {
            output: self.store.path().to_path_buf(),
            units_total: units.len(),
            ..RunReport::default()
        };
        let mut payload = EventPayload::new();
        payload.insert("units".to_string(), Value::from(units.len()));
        payload.insert("output".to_string(), Value::from(report.output.display().to_string()));
        payload.insert("provider".to_string(), Value::from(self.invoker.provider().name()));
        if let Err(err) = self.events.emit("run_started", payload) {
            log::warn!("could not record run_started: {err:#}");
        }

        for (idx, unit) in units.iter().enumerate() {
            let outcome = self.process_unit(unit);
            println!("[{}/{}] {}: {outcome}", idx + 1, units.len(), unit.label());
            report.record(&outcome);
        }

        report.pending_flush = !self.finish();
        let mut payload = EventPayload::new();
        payload.insert("records_written".to_string(), Value::from(report.records_written));
        payload.insert("units_abandoned".to_string(), Value::from(report.units_abandoned));
        payload.insert("pending_flush".to_string(), Value::from(report.pending_flush));
        if let Err(err) = self.events.emit("run_finished", payload) {
            log::warn!("could not record run_finished: {err:#}");
        }
        report
    }

    /// Retries any pending store writes. Returns `false` if data is still
    /// only in memory.
    pub fn finish(&mut self) -> bool {
        match self.store.flush() {
            Ok(()) => true,
            Err(err) => {
                log::error!("output not fully persisted: {err}");
                false
            }
        }
    }

    pub fn process_unit(&mut self, unit: &WorkUnit) -> UnitOutcome {
        if self.options.resume && self.store.contains(&unit.unit_id, &unit.file_name) {
            return UnitOutcome::AlreadyDone;
        }
        self.unit_event("unit_started", unit, EventPayload::new());
        let outcome = self.analyze(unit);

        let mut payload = EventPayload::new();
        payload.insert("outcome".to_string(), Value::from(outcome.as_str()));
        if let UnitOutcome::Written(count) = &outcome {
            payload.insert("records".to_string(), Value::from(*count));
        }
        if let UnitOutcome::Dropped(reason) = &outcome {
            payload.insert("reason".to_string(), Value::from(reason.as_str()));
        }
        self.unit_event("unit_finished", unit, payload);
        outcome
    }

    fn analyze(&mut self, unit: &WorkUnit) -> UnitOutcome {
        let (raw, parse_format) = match &unit.input {
            UnitInput::Screenshot(path) => {
                if let Err(err) = File::open(path) {
                    log::warn!("{}: cannot read {}: {err}", unit.label(), path.display());
                    return UnitOutcome::Dropped(format!("unreadable screenshot: {err}"));
                }
                let request = self.analysis_request(path);
                match self.invoker.call_with_resilience(unit, &request) {
                    Ok(invocation) => (invocation.text, self.options.format),
                    Err(err) => {
                        log::warn!("{}: {err}", unit.label());
                        return UnitOutcome::Abandoned;
                    }
                }
            }
            UnitInput::PriorResponse(text) => (text.clone(), OutputFormat::Json),
        };

        if self.options.keep_raw {
            match self.store.append_raw(&unit.unit_id, &unit.file_name, &raw) {
                Ok(true) => return UnitOutcome::KeptRaw,
                Ok(false) => {}
                Err(err) => {
                    self.persist_failed(unit, &err);
                    return UnitOutcome::KeptRaw;
                }
            }
        }

        let normalized = match self.normalize_or_repair(unit, &raw, parse_format) {
            Ok(normalized) => normalized,
            Err(err) => {
                log::warn!("{}: dropped response: {err}", unit.label());
                self.record_dropped(unit, "response", &err);
                return UnitOutcome::Dropped(err.to_string());
            }
        };
        for rejection in &normalized.rejected {
            log::warn!(
                "{}: dropped {}: {}",
                unit.label(),
                rejection.origin,
                rejection.error
            );
            self.record_dropped(unit, &rejection.origin, &rejection.error);
        }
        if normalized.all_rejected() {
            return UnitOutcome::Dropped(format!(
                "all {} records rejected",
                normalized.rejected.len()
            ));
        }

        let count = normalized.records.len();
        if let Err(err) = self
            .store
            .append_records(&unit.unit_id, &unit.file_name, &normalized.records)
        {
            self.persist_failed(unit, &err);
        }
        UnitOutcome::Written(count)
    }

    fn normalize_or_repair(
        &mut self,
        unit: &WorkUnit,
        raw: &str,
        format: OutputFormat,
    ) -> Result<Normalized, PipelineError> {
        let first = normalize(raw, format);
        let usable = matches!(&first, Ok(normalized) if !normalized.all_rejected());
        if usable || !self.options.repair {
            return first;
        }

        self.unit_event("repair_started", unit, EventPayload::new());
        match repair(&mut self.invoker, unit, raw, self.options.format) {
            Ok(repaired) => Ok(repaired),
            Err(err) => {
                log::warn!("{}: repair failed: {err}", unit.label());
                first
            }
        }
    }

    fn analysis_request(&self, screenshot: &Path) -> AnalysisRequest {
        let mut assets = Vec::new();
        if let Some(reference) = &self.options.reference {
            assets.push(reference.clone());
        }
        assets.push(screenshot.to_path_buf());
        AnalysisRequest {
            prompt: analysis_prompt(self.options.format, self.options.reference.is_some()),
            assets,
            format: self.options.format,
        }
    }

    fn record_dropped(&self, unit: &WorkUnit, origin: &str, err: &PipelineError) {
        let mut payload = EventPayload::new();
        payload.insert("origin".to_string(), Value::from(origin));
        payload.insert("kind".to_string(), Value::from(err.kind()));
        payload.insert("error".to_string(), Value::from(err.to_string()));
        self.unit_event("record_dropped", unit, payload);
    }

    fn persist_failed(&self, unit: &WorkUnit, err: &PipelineError) {
        log::error!("{}: {err}; will retry at next flush", unit.label());
        let mut payload = EventPayload::new();
        payload.insert("error".to_string(), Value::from(err.to_string()));
        self.unit_event("persist_failed", unit, payload);
    }

    fn unit_event(&self, event_type: &str, unit: &WorkUnit, payload: EventPayload) {
        self.events
            .unit_event(event_type, &unit.unit_id, &unit.file_name, payload);
    }
}
