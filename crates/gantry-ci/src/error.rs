//! Error taxonomy for pipeline validation and execution.

use gantry_state::StorageError;

/// Errors produced while loading, validating or executing a pipeline.
///
/// Job-level kinds (`Execution`, `MissingArtifact`, `Expired`) are attached
/// to the failing job's result and surface to the run as `Failed`.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum CiError {
    #[error("invalid pipeline definition: {0}")]
    Definition(String),

    #[error("pipeline validation failed: {0}")]
    Validation(String),

    #[error("job '{job}' failed at `{line}`: {reason}")]
    Execution {
        job: String,
        line: String,
        exit_code: Option<i32>,
        reason: String,
    },

    #[error("job '{job}' is missing artifacts from '{dependency}': {reason}")]
    MissingArtifact {
        job: String,
        dependency: String,
        reason: String,
    },

    #[error("artifact expired: {key}")]
    Expired { key: String },

    #[error("invalid run transition: {from} -> {to}")]
    InvalidTransition { from: String, to: String },

    #[error("publish failed: {0}")]
    Publish(String),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("storage error: {0}")]
    Storage(String),

    #[error("io error: {0}")]
    Io(String),
}

impl CiError {
    /// Exit code of the failing script line, when there was one.
    pub fn exit_code(&self) -> Option<i32> {
        match self {
            CiError::Execution { exit_code, .. } => *exit_code,
            _ => None,
        }
    }

    /// The script line a job failed on, when the failure was a script line.
    pub fn failed_line(&self) -> Option<&str> {
        match self {
            CiError::Execution { line, .. } => Some(line),
            _ => None,
        }
    }
}

impl From<StorageError> for CiError {
    fn from(err: StorageError) -> Self {
        match err {
            StorageError::Expired { key, .. } => CiError::Expired { key },
            other => CiError::Storage(other.to_string()),
        }
    }
}

impl From<std::io::Error> for CiError {
    fn from(err: std::io::Error) -> Self {
        CiError::Io(err.to_string())
    }
}

impl From<serde_yaml::Error> for CiError {
    fn from(err: serde_yaml::Error) -> Self {
        CiError::Definition(err.to_string())
    }
}

/// Result type for pipeline operations.
pub type Result<T> = std::result::Result<T, CiError>;
