//! Error types for gantry-state

use thiserror::Error;

/// Errors produced by artifact stores and run ledgers.
#[derive(Error, Debug)]
pub enum StorageError {
    /// No artifact stored under the key
    #[error("Artifact not found: {key}")]
    NotFound { key: String },

    /// Artifact existed but its retention window has elapsed
    #[error("Artifact expired: {key} (expired at {expired_at})")]
    Expired { key: String, expired_at: String },

    /// Artifacts are put-once per key
    #[error("Artifact already exists: {key}")]
    AlreadyExists { key: String },

    /// Artifact path escapes the job workspace or is empty
    #[error("Invalid artifact path: {path}")]
    InvalidPath { path: String },

    /// Run not found in the ledger
    #[error("Run not found: {run_id}")]
    RunNotFound { run_id: String },

    /// Run is not in the state the operation requires
    #[error("Run {run_id} is {status}, expected {expected}")]
    InvalidRunState {
        run_id: String,
        status: String,
        expected: String,
    },

    /// Digest string is not 64 hex characters
    #[error("Invalid digest: {digest}")]
    InvalidDigest { digest: String },

    /// Serialization error
    #[error("Serialization failed: {0}")]
    Serialization(String),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<serde_json::Error> for StorageError {
    fn from(err: serde_json::Error) -> Self {
        StorageError::Serialization(err.to_string())
    }
}
