use std::path::PathBuf;

use thiserror::Error;

/// Failure kinds surfaced by the analysis pipeline.
///
/// Only `StartupConfig` is fatal to a run; every other variant is contained
/// at the unit boundary and reported with the unit id.
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("every credential failed for unit {unit_id} after {attempts} attempts")]
    CredentialExhausted { unit_id: String, attempts: usize },

    #[error("malformed payload: {detail}")]
    MalformedPayload { detail: String },

    #[error("schema violation on field `{field}`: {reason}")]
    SchemaViolation { field: String, reason: String },

    #[error("startup configuration error: {0}")]
    StartupConfig(String),

    #[error("failed to persist {}: {source}", path.display())]
    Persistence {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

impl PipelineError {
    pub fn malformed(detail: impl Into<String>) -> Self {
        Self::MalformedPayload {
            detail: detail.into(),
        }
    }

    pub fn schema(field: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::SchemaViolation {
            field: field.into(),
            reason: reason.into(),
        }
    }

    /// Short machine-friendly tag used in the run event log.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::CredentialExhausted { .. } => "credential_exhausted",
            Self::MalformedPayload { .. } => "malformed_payload",
            Self::SchemaViolation { .. } => "schema_violation",
            Self::StartupConfig(_) => "startup_config",
            Self::Persistence { .. } => "persistence",
        }
    }
}
