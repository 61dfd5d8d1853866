//! In-memory implementations of the storage traits
//!
//! `MemoryArtifactStore` and `MemoryRunLedger` satisfy the trait contracts
//! without touching disk. The runner uses them for single-process runs and
//! the test suites use them everywhere.

use std::collections::{BTreeMap, HashMap};
use std::sync::Mutex;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::error::StorageError;
use crate::storage_traits::*;

// ---------------------------------------------------------------------------
// MemoryArtifactStore
// ---------------------------------------------------------------------------

#[derive(Debug)]
struct StoredArtifact {
    meta: ArtifactMeta,
    /// `None` once pruned; the metadata stays behind as a tombstone.
    data: Option<Vec<u8>>,
}

/// In-memory artifact store backed by a `BTreeMap<ArtifactKey, StoredArtifact>`.
#[derive(Debug, Default)]
pub struct MemoryArtifactStore {
    artifacts: Mutex<BTreeMap<ArtifactKey, StoredArtifact>>,
}

impl MemoryArtifactStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl ArtifactStore for MemoryArtifactStore {
    async fn put(
        &self,
        key: &ArtifactKey,
        data: &[u8],
        retention: Retention,
    ) -> StorageResult<ArtifactMeta> {
        let mut artifacts = self.artifacts.lock().unwrap();
        if artifacts.contains_key(key) {
            return Err(StorageError::AlreadyExists {
                key: key.to_string(),
            });
        }
        let created_at = Utc::now();
        let meta = ArtifactMeta {
            key: key.clone(),
            digest: ContentDigest::from_bytes(data),
            size: data.len() as u64,
            created_at,
            expires_at: retention.expires_at(created_at),
        };
        artifacts.insert(
            key.clone(),
            StoredArtifact {
                meta: meta.clone(),
                data: Some(data.to_vec()),
            },
        );
        Ok(meta)
    }

    async fn get_at(&self, key: &ArtifactKey, now: DateTime<Utc>) -> StorageResult<Vec<u8>> {
        let artifacts = self.artifacts.lock().unwrap();
        let stored = artifacts.get(key).ok_or_else(|| StorageError::NotFound {
            key: key.to_string(),
        })?;
        if stored.meta.is_expired(now) || stored.data.is_none() {
            return Err(expired(&stored.meta));
        }
        Ok(stored.data.clone().unwrap_or_default())
    }

    async fn list(&self, run_id: &RunId, job_name: &str) -> StorageResult<Vec<ArtifactMeta>> {
        let artifacts = self.artifacts.lock().unwrap();
        Ok(artifacts
            .values()
            .filter(|s| s.data.is_some())
            .filter(|s| &s.meta.key.run_id == run_id && s.meta.key.job_name == job_name)
            .map(|s| s.meta.clone())
            .collect())
    }

    async fn prune(&self, now: DateTime<Utc>) -> StorageResult<usize> {
        let mut artifacts = self.artifacts.lock().unwrap();
        let mut removed = 0;
        for stored in artifacts.values_mut() {
            if stored.data.is_some() && stored.meta.is_expired(now) {
                stored.data = None;
                removed += 1;
            }
        }
        Ok(removed)
    }
}

pub(crate) fn expired(meta: &ArtifactMeta) -> StorageError {
    StorageError::Expired {
        key: meta.key.to_string(),
        expired_at: meta
            .expires_at
            .map(|at| at.to_rfc3339())
            .unwrap_or_else(|| "pruned".to_string()),
    }
}

// ---------------------------------------------------------------------------
// MemoryRunLedger
// ---------------------------------------------------------------------------

#[derive(Debug)]
struct RunState {
    record: RunRecord,
    events: Vec<RunEvent>,
}

/// In-memory run ledger backed by a `HashMap<RunId, RunState>`.
#[derive(Debug, Default)]
pub struct MemoryRunLedger {
    runs: Mutex<HashMap<String, RunState>>,
}

impl MemoryRunLedger {
    pub fn new() -> Self {
        Self::default()
    }

    fn finish(
        &self,
        run_id: &RunId,
        status: RunStatus,
        summary: RunSummary,
    ) -> StorageResult<()> {
        let mut runs = self.runs.lock().unwrap();
        let state = runs
            .get_mut(&run_id.0)
            .ok_or_else(|| StorageError::RunNotFound {
                run_id: run_id.0.clone(),
            })?;
        if state.record.status != RunStatus::Running {
            return Err(StorageError::InvalidRunState {
                run_id: run_id.0.clone(),
                status: format!("{:?}", state.record.status),
                expected: "Running".to_string(),
            });
        }
        state.record.status = status;
        state.record.summary = Some(summary);
        state.record.completed_at = Some(Utc::now());
        Ok(())
    }
}

#[async_trait]
impl RunLedger for MemoryRunLedger {
    async fn create_run(
        &self,
        run_id: &RunId,
        spec_digest: &ContentDigest,
        metadata: RunMetadata,
    ) -> StorageResult<()> {
        let record = RunRecord {
            run_id: run_id.clone(),
            spec_digest: spec_digest.clone(),
            metadata,
            status: RunStatus::Running,
            summary: None,
            created_at: Utc::now(),
            completed_at: None,
        };
        let mut runs = self.runs.lock().unwrap();
        if runs.contains_key(&run_id.0) {
            return Err(StorageError::InvalidRunState {
                run_id: run_id.0.clone(),
                status: "existing".to_string(),
                expected: "absent".to_string(),
            });
        }
        runs.insert(
            run_id.0.clone(),
            RunState {
                record,
                events: Vec::new(),
            },
        );
        Ok(())
    }

    async fn append_event(&self, run_id: &RunId, event: RunEvent) -> StorageResult<()> {
        let mut runs = self.runs.lock().unwrap();
        let state = runs
            .get_mut(&run_id.0)
            .ok_or_else(|| StorageError::RunNotFound {
                run_id: run_id.0.clone(),
            })?;
        if state.record.status != RunStatus::Running {
            return Err(StorageError::InvalidRunState {
                run_id: run_id.0.clone(),
                status: format!("{:?}", state.record.status),
                expected: "Running".to_string(),
            });
        }
        state.events.push(event);
        Ok(())
    }

    async fn complete_run(&self, run_id: &RunId, summary: RunSummary) -> StorageResult<()> {
        self.finish(run_id, RunStatus::Succeeded, summary)
    }

    async fn fail_run(&self, run_id: &RunId, summary: RunSummary) -> StorageResult<()> {
        self.finish(run_id, RunStatus::Failed, summary)
    }

    async fn get_run(&self, run_id: &RunId) -> StorageResult<RunRecord> {
        let runs = self.runs.lock().unwrap();
        runs.get(&run_id.0)
            .map(|s| s.record.clone())
            .ok_or_else(|| StorageError::RunNotFound {
                run_id: run_id.0.clone(),
            })
    }

    async fn get_events(&self, run_id: &RunId) -> StorageResult<Vec<RunEvent>> {
        let runs = self.runs.lock().unwrap();
        let state = runs
            .get(&run_id.0)
            .ok_or_else(|| StorageError::RunNotFound {
                run_id: run_id.0.clone(),
            })?;
        let mut events = state.events.clone();
        events.sort_by_key(|e| e.seq);
        Ok(events)
    }

    async fn list_runs(
        &self,
        spec_digest: Option<&ContentDigest>,
    ) -> StorageResult<Vec<RunRecord>> {
        let runs = self.runs.lock().unwrap();
        let mut records: Vec<RunRecord> = runs
            .values()
            .filter(|s| {
                spec_digest
                    .map(|d| s.record.spec_digest == *d)
                    .unwrap_or(true)
            })
            .map(|s| s.record.clone())
            .collect();
        records.sort_by(|a, b| {
            a.created_at
                .cmp(&b.created_at)
                .then_with(|| a.run_id.cmp(&b.run_id))
        });
        Ok(records)
    }

    async fn prune_runs(&self, cutoff: DateTime<Utc>) -> StorageResult<usize> {
        let mut runs = self.runs.lock().unwrap();
        let before = runs.len();
        runs.retain(|_, s| match s.record.completed_at {
            Some(done) => done >= cutoff,
            None => true,
        });
        Ok(before - runs.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    #[tokio::test]
    async fn pruned_artifact_still_reports_expired() {
        let store = MemoryArtifactStore::new();
        let key = ArtifactKey::new(&RunId::new(), "build", "out.txt").unwrap();
        store
            .put(&key, b"payload", Retention::Seconds(60))
            .await
            .unwrap();

        let later = Utc::now() + Duration::minutes(5);
        assert_eq!(store.prune(later).await.unwrap(), 1);
        let err = store.get_at(&key, Utc::now()).await.unwrap_err();
        assert!(matches!(err, StorageError::Expired { .. }));
    }

    #[tokio::test]
    async fn never_retention_survives_prune() {
        let store = MemoryArtifactStore::new();
        let key = ArtifactKey::new(&RunId::new(), "build", "keep.txt").unwrap();
        store.put(&key, b"k", Retention::Never).await.unwrap();

        let far = Utc::now() + Duration::days(3650);
        assert_eq!(store.prune(far).await.unwrap(), 0);
        assert_eq!(store.get_at(&key, far).await.unwrap(), b"k");
    }
}
