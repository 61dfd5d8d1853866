//! Gantry-State: artifact storage and run persistence
//!
//! This crate owns everything a pipeline run leaves behind: the files its
//! jobs produced and the ordered event log of what happened.
//!
//! ## Key Components
//!
//! - `ArtifactStore`: put-once artifact storage keyed by (run, job, path),
//!   with retention windows and pruning
//! - `RunLedger`: run records and their ordered events
//! - `MemoryArtifactStore` / `MemoryRunLedger`: in-process implementations
//! - `FsArtifactStore`: on-disk artifact storage shared across invocations

mod error;
pub mod fakes;
pub mod fs_store;
pub mod storage_traits;

pub use error::StorageError;
pub use fs_store::FsArtifactStore;
pub use storage_traits::{
    normalize_artifact_path, ArtifactKey, ArtifactMeta, ArtifactStore, ContentDigest, Retention,
    RunEvent, RunId, RunLedger, RunMetadata, RunRecord, RunStatus, RunSummary, StorageResult,
    MAX_RETENTION_SECS,
};
