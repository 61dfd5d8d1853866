//! Storage trait definitions for Gantry
//!
//! These traits define the two storage abstractions the runner needs:
//! - `ArtifactStore`: Job outputs keyed by (run, job, path) with retention
//! - `RunLedger`: Execution run persistence (events, summaries)
//!
//! All traits are async and backend-agnostic. In-memory fakes are provided
//! for testing via the `fakes` module; `FsArtifactStore` persists to disk.

use std::path::{Component, Path};

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use sha2::Sha256;

use crate::error::StorageError;

/// Result type for storage operations
pub type StorageResult<T> = std::result::Result<T, StorageError>;

// ---------------------------------------------------------------------------
// ContentDigest
// ---------------------------------------------------------------------------

/// Content digest (SHA-256 hex string).
///
/// The inner field is private to guarantee the string is always valid
/// lowercase hex produced by `from_bytes` or validated via `TryFrom<String>`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ContentDigest(String);

impl ContentDigest {
    /// Compute the SHA-256 digest of the given bytes.
    pub fn from_bytes(data: &[u8]) -> Self {
        use sha2::Digest;
        let mut hasher = Sha256::new();
        hasher.update(data);
        ContentDigest(hex::encode(hasher.finalize()))
    }

    /// Return the full hex string.
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Short form (first 12 hex chars).
    pub fn short(&self) -> &str {
        &self.0[..12.min(self.0.len())]
    }
}

impl TryFrom<String> for ContentDigest {
    type Error = StorageError;

    fn try_from(s: String) -> std::result::Result<Self, Self::Error> {
        if s.len() != 64 || !s.chars().all(|c| c.is_ascii_hexdigit()) {
            return Err(StorageError::InvalidDigest { digest: s });
        }
        Ok(ContentDigest(s.to_ascii_lowercase()))
    }
}

impl std::fmt::Display for ContentDigest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

// ---------------------------------------------------------------------------
// ArtifactStore — job outputs with retention
// ---------------------------------------------------------------------------

/// Unique identifier for an execution run
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct RunId(pub String);

impl RunId {
    /// Generate a new random RunId
    pub fn new() -> Self {
        RunId(uuid::Uuid::new_v4().to_string())
    }
}

impl Default for RunId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for RunId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Address of a single artifact file.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ArtifactKey {
    pub run_id: RunId,
    pub job_name: String,
    /// Normalized relative path (forward slashes, no `.` or `..`).
    pub path: String,
}

impl ArtifactKey {
    /// Build a key, normalizing `path`.
    pub fn new(
        run_id: &RunId,
        job_name: impl Into<String>,
        path: impl AsRef<str>,
    ) -> StorageResult<Self> {
        Ok(Self {
            run_id: run_id.clone(),
            job_name: job_name.into(),
            path: normalize_artifact_path(path.as_ref())?,
        })
    }
}

impl std::fmt::Display for ArtifactKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}/{}", self.run_id, self.job_name, self.path)
    }
}

/// Normalize a relative artifact path.
///
/// Rejects empty paths, absolute paths and any `..` component so an
/// artifact can never be restored outside the job workspace.
pub fn normalize_artifact_path(raw: &str) -> StorageResult<String> {
    let invalid = || StorageError::InvalidPath {
        path: raw.to_string(),
    };
    let mut parts = Vec::new();
    for component in Path::new(raw).components() {
        match component {
            Component::Normal(part) => parts.push(part.to_str().ok_or_else(invalid)?.to_string()),
            Component::CurDir => {}
            Component::ParentDir | Component::RootDir | Component::Prefix(_) => {
                return Err(invalid())
            }
        }
    }
    if parts.is_empty() {
        return Err(invalid());
    }
    Ok(parts.join("/"))
}

/// Longest retention accepted from pipeline definitions and configuration
/// (100 years).
pub const MAX_RETENTION_SECS: i64 = 100 * 365 * 86_400;

/// How long an artifact stays retrievable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Retention {
    /// Retained for this many seconds after being stored.
    Seconds(i64),
    /// Never expires.
    Never,
}

impl Retention {
    pub fn hours(hours: i64) -> Self {
        Retention::Seconds(hours.saturating_mul(3600))
    }

    /// Expiry instant for an artifact stored at `stored_at`.
    ///
    /// Saturates at the latest representable instant.
    pub fn expires_at(&self, stored_at: DateTime<Utc>) -> Option<DateTime<Utc>> {
        match self {
            Retention::Seconds(secs) => Some(
                Duration::try_seconds(*secs)
                    .and_then(|delta| stored_at.checked_add_signed(delta))
                    .unwrap_or(DateTime::<Utc>::MAX_UTC),
            ),
            Retention::Never => None,
        }
    }
}

/// Metadata recorded alongside every artifact.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArtifactMeta {
    pub key: ArtifactKey,
    pub digest: ContentDigest,
    pub size: u64,
    pub created_at: DateTime<Utc>,
    pub expires_at: Option<DateTime<Utc>>,
}

impl ArtifactMeta {
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at.map(|at| now >= at).unwrap_or(false)
    }
}

/// Artifact store.
///
/// Guarantees:
/// - `put` is put-once per key; a second put fails with `AlreadyExists`.
/// - `get` returns the exact bytes stored until the retention window elapses.
/// - After expiry `get` fails with `Expired`, also once the bytes were pruned.
#[async_trait]
pub trait ArtifactStore: Send + Sync {
    /// Store an artifact. Fails with `AlreadyExists` if the key is taken.
    async fn put(
        &self,
        key: &ArtifactKey,
        data: &[u8],
        retention: Retention,
    ) -> StorageResult<ArtifactMeta>;

    /// Retrieve artifact bytes as seen at `now`.
    async fn get_at(&self, key: &ArtifactKey, now: DateTime<Utc>) -> StorageResult<Vec<u8>>;

    /// Retrieve artifact bytes. Fails with `NotFound` or `Expired`.
    async fn get(&self, key: &ArtifactKey) -> StorageResult<Vec<u8>> {
        self.get_at(key, Utc::now()).await
    }

    /// Metadata of every artifact of a job whose bytes are still held,
    /// ordered by path.
    async fn list(&self, run_id: &RunId, job_name: &str) -> StorageResult<Vec<ArtifactMeta>>;

    /// Destroy every artifact expired at `now`. Returns how many were removed.
    async fn prune(&self, now: DateTime<Utc>) -> StorageResult<usize>;
}

// ---------------------------------------------------------------------------
// RunLedger — Execution Run Persistence
// ---------------------------------------------------------------------------

/// Metadata attached to a run at creation time
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunMetadata {
    /// Ref (branch or tag) that triggered the run
    pub git_ref: String,
    /// Commit SHA of the triggering event
    pub git_sha: Option<String>,
    /// Pipeline name (usually the definition file name)
    pub pipeline_name: String,
    /// Arbitrary key-value tags
    pub tags: serde_json::Value,
}

/// A single event in an execution run
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunEvent {
    /// Monotonic sequence number within the run
    pub seq: u64,
    /// Event kind (e.g. "stage_started", "job_started", "job_failed")
    pub kind: String,
    /// Event payload
    pub payload: serde_json::Value,
    /// Timestamp
    pub timestamp: DateTime<Utc>,
}

/// Summary produced when a run completes
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunSummary {
    /// Total events recorded
    pub total_events: u64,
    /// Number of jobs that reached `Succeeded`
    pub jobs_succeeded: usize,
    /// Number of jobs that reached `Failed`
    pub jobs_failed: usize,
    /// Duration in milliseconds
    pub duration_ms: u64,
    /// Whether the run succeeded
    pub success: bool,
}

/// Status of a run as persisted in the ledger
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum RunStatus {
    Running,
    Succeeded,
    Failed,
}

/// Full run record
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunRecord {
    pub run_id: RunId,
    pub spec_digest: ContentDigest,
    pub metadata: RunMetadata,
    pub status: RunStatus,
    pub summary: Option<RunSummary>,
    pub created_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

/// Execution run ledger.
///
/// Guarantees:
/// - Events are ordered by monotonic `seq` within a run.
/// - A run transitions: Running → Succeeded | Failed (terminal).
/// - Finished runs are immutable until pruned.
#[async_trait]
pub trait RunLedger: Send + Sync {
    /// Create a new run under a caller-chosen ID.
    async fn create_run(
        &self,
        run_id: &RunId,
        spec_digest: &ContentDigest,
        metadata: RunMetadata,
    ) -> StorageResult<()>;

    /// Append an event to an active run. Fails if the run is finished.
    async fn append_event(&self, run_id: &RunId, event: RunEvent) -> StorageResult<()>;

    /// Mark a run as succeeded with a summary.
    async fn complete_run(&self, run_id: &RunId, summary: RunSummary) -> StorageResult<()>;

    /// Mark a run as failed with a summary.
    async fn fail_run(&self, run_id: &RunId, summary: RunSummary) -> StorageResult<()>;

    /// Retrieve a run record by ID.
    async fn get_run(&self, run_id: &RunId) -> StorageResult<RunRecord>;

    /// Retrieve all events for a run, ordered by seq.
    async fn get_events(&self, run_id: &RunId) -> StorageResult<Vec<RunEvent>>;

    /// List runs, optionally filtered by spec digest, oldest first.
    async fn list_runs(&self, spec_digest: Option<&ContentDigest>)
        -> StorageResult<Vec<RunRecord>>;

    /// Drop finished runs completed before `cutoff`. Returns how many were removed.
    async fn prune_runs(&self, cutoff: DateTime<Utc>) -> StorageResult<usize>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalize_strips_cur_dir() {
        assert_eq!(
            normalize_artifact_path("./frontend/index.html").unwrap(),
            "frontend/index.html"
        );
    }

    #[test]
    fn normalize_rejects_escape() {
        assert!(normalize_artifact_path("../etc/passwd").is_err());
        assert!(normalize_artifact_path("/etc/passwd").is_err());
        assert!(normalize_artifact_path("").is_err());
        assert!(normalize_artifact_path(".").is_err());
    }

    #[test]
    fn retention_expiry() {
        let now = Utc::now();
        assert_eq!(
            Retention::hours(2).expires_at(now),
            Some(now + Duration::hours(2))
        );
        assert_eq!(Retention::Never.expires_at(now), None);
    }

    #[test]
    fn retention_expiry_saturates_instead_of_overflowing() {
        let now = Utc::now();
        assert_eq!(
            Retention::Seconds(604_800 * 100_000_000).expires_at(now),
            Some(DateTime::<Utc>::MAX_UTC)
        );
        assert_eq!(
            Retention::Seconds(i64::MAX).expires_at(now),
            Some(DateTime::<Utc>::MAX_UTC)
        );
        assert_eq!(Retention::hours(i64::MAX), Retention::Seconds(i64::MAX));
    }

    #[test]
    fn digest_try_from_rejects_short() {
        let err = ContentDigest::try_from("abc".to_string()).unwrap_err();
        assert!(matches!(err, StorageError::InvalidDigest { .. }));
    }
}
