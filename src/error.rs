use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

use crate::artifact::ArtifactId;

pub type Result<T, E = PipelineError> = std::result::Result<T, E>;

/// Every failure the engine surfaces to callers.
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("artifact '{id}' not found")]
    NotFound { id: ArtifactId },

    #[error("hash mismatch for '{id}': {field} recorded {recorded}, recomputed {recomputed}")]
    HashMismatch {
        id: ArtifactId,
        field: &'static str,
        recorded: String,
        recomputed: String,
    },

    #[error("schema error in '{location}': {message}")]
    Schema { location: String, message: String },

    #[error("artifact '{id}' references missing input '{missing}'")]
    DanglingReference { id: ArtifactId, missing: ArtifactId },

    #[error("stage '{stage}' failed after {attempts} attempt(s): {message}")]
    StageExecution {
        stage: String,
        message: String,
        retryable: bool,
        attempts: u32,
    },

    #[error("stage '{stage}' is non-deterministic and no stored artifact covers '{id}'")]
    NonReplayableStage { stage: String, id: ArtifactId },

    #[error(
        "replay of stage '{stage}' diverged for '{id}': stored payload {stored}, replayed {replayed}"
    )]
    ReplayDivergence {
        stage: String,
        id: ArtifactId,
        stored: String,
        replayed: String,
    },

    #[error("configuration error: {0}")]
    Config(String),

    #[error("stage '{stage}' exceeded its {budget:?} budget")]
    Timeout { stage: String, budget: Duration },

    #[error("invocation of stage '{stage}' was cancelled")]
    Cancelled { stage: String },

    #[error("I/O error at {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to (de)serialize {what}: {source}")]
    Serialization {
        what: String,
        #[source]
        source: serde_json::Error,
    },
}

impl PipelineError {
    /// Stable name of the error class, printed by the CLI and stored in reports.
    pub fn kind(&self) -> &'static str {
        match self {
            PipelineError::NotFound { .. } => "NotFound",
            PipelineError::HashMismatch { .. } => "HashMismatch",
            PipelineError::Schema { .. } => "SchemaError",
            PipelineError::DanglingReference { .. } => "DanglingReference",
            PipelineError::StageExecution { .. } => "StageExecutionError",
            PipelineError::NonReplayableStage { .. } => "NonReplayableStage",
            PipelineError::ReplayDivergence { .. } => "ReplayDivergence",
            PipelineError::Config(_) => "ConfigError",
            PipelineError::Timeout { .. } => "Timeout",
            PipelineError::Cancelled { .. } => "Cancelled",
            PipelineError::Io { .. } => "IoError",
            PipelineError::Serialization { .. } => "SerializationError",
        }
    }

    pub fn config(message: impl Into<String>) -> Self {
        PipelineError::Config(message.into())
    }

    pub fn schema(location: impl Into<String>, message: impl Into<String>) -> Self {
        PipelineError::Schema {
            location: location.into(),
            message: message.into(),
        }
    }

    pub(crate) fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        PipelineError::Io {
            path: path.into(),
            source,
        }
    }

    pub(crate) fn serde(what: impl Into<String>, source: serde_json::Error) -> Self {
        PipelineError::Serialization {
            what: what.into(),
            source,
        }
    }
}
