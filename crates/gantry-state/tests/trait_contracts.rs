//! Trait contract tests for ArtifactStore and RunLedger.
//!
//! These tests verify the behavioral contracts of the storage traits.
//! Artifact contracts run against both the in-memory and on-disk stores.

use chrono::{Duration, Utc};
use gantry_state::fakes::{MemoryArtifactStore, MemoryRunLedger};
use gantry_state::storage_traits::*;
use gantry_state::{FsArtifactStore, StorageError};

// ===========================================================================
// ArtifactStore contract tests
// ===========================================================================

async fn check_round_trip(store: &dyn ArtifactStore) {
    let run = RunId::new();
    let key = ArtifactKey::new(&run, "build", "frontend/main.js").unwrap();
    let meta = store
        .put(&key, b"bundle", Retention::hours(1))
        .await
        .unwrap();

    assert_eq!(meta.digest, ContentDigest::from_bytes(b"bundle"));
    assert_eq!(store.get(&key).await.unwrap(), b"bundle");
}

async fn check_not_found(store: &dyn ArtifactStore) {
    let key = ArtifactKey::new(&RunId::new(), "build", "missing.txt").unwrap();
    let err = store.get(&key).await.unwrap_err();

    assert!(matches!(err, StorageError::NotFound { .. }));
}

async fn check_expired_never_stale(store: &dyn ArtifactStore) {
    let key = ArtifactKey::new(&RunId::new(), "build", "out.bin").unwrap();
    store
        .put(&key, b"old bytes", Retention::hours(2))
        .await
        .unwrap();

    let inside = Utc::now() + Duration::hours(1);
    assert_eq!(store.get_at(&key, inside).await.unwrap(), b"old bytes");

    for hours in [2, 3, 48, 24 * 365] {
        let after = Utc::now() + Duration::hours(hours) + Duration::seconds(1);
        let err = store.get_at(&key, after).await.unwrap_err();
        assert!(
            matches!(err, StorageError::Expired { .. }),
            "expected Expired after {hours}h, got {err:?}"
        );
    }
}

async fn check_put_once(store: &dyn ArtifactStore) {
    let key = ArtifactKey::new(&RunId::new(), "build", "app.tar").unwrap();
    store.put(&key, b"first", Retention::Never).await.unwrap();
    let err = store
        .put(&key, b"second", Retention::Never)
        .await
        .unwrap_err();

    assert!(matches!(err, StorageError::AlreadyExists { .. }));
    assert_eq!(store.get(&key).await.unwrap(), b"first");
}

async fn check_list_scoped_to_job(store: &dyn ArtifactStore) {
    let run = RunId::new();
    for (job, path) in [
        ("build", "frontend/b.js"),
        ("build", "frontend/a.js"),
        ("lint", "report.txt"),
    ] {
        let key = ArtifactKey::new(&run, job, path).unwrap();
        store.put(&key, path.as_bytes(), Retention::Never).await.unwrap();
    }

    let listed = store.list(&run, "build").await.unwrap();
    let paths: Vec<&str> = listed.iter().map(|m| m.key.path.as_str()).collect();
    assert_eq!(paths, vec!["frontend/a.js", "frontend/b.js"]);
    assert!(store.list(&RunId::new(), "build").await.unwrap().is_empty());
}

async fn check_prune_only_expired(store: &dyn ArtifactStore) {
    let run = RunId::new();
    let short = ArtifactKey::new(&run, "build", "short.txt").unwrap();
    let long = ArtifactKey::new(&run, "build", "long.txt").unwrap();
    store.put(&short, b"s", Retention::hours(1)).await.unwrap();
    store.put(&long, b"l", Retention::hours(100)).await.unwrap();

    let removed = store.prune(Utc::now() + Duration::hours(2)).await.unwrap();
    assert_eq!(removed, 1);
    assert!(matches!(
        store.get(&short).await.unwrap_err(),
        StorageError::Expired { .. }
    ));
    assert_eq!(store.get(&long).await.unwrap(), b"l");
}

#[tokio::test]
async fn memory_store_contracts() {
    let store = MemoryArtifactStore::new();
    check_round_trip(&store).await;
    check_not_found(&store).await;
    check_expired_never_stale(&store).await;
    check_put_once(&store).await;
    check_list_scoped_to_job(&store).await;
    check_prune_only_expired(&store).await;
}

#[tokio::test]
async fn fs_store_contracts() {
    let dir = tempfile::tempdir().unwrap();
    let store = FsArtifactStore::new(dir.path()).unwrap();
    check_round_trip(&store).await;
    check_not_found(&store).await;
    check_expired_never_stale(&store).await;
    check_put_once(&store).await;
    check_list_scoped_to_job(&store).await;
    check_prune_only_expired(&store).await;
}

#[tokio::test]
async fn artifact_key_rejects_escaping_paths() {
    let run = RunId::new();
    let err = ArtifactKey::new(&run, "build", "../../etc/shadow").unwrap_err();
    assert!(matches!(err, StorageError::InvalidPath { .. }));
}

// ===========================================================================
// RunLedger contract tests
// ===========================================================================

fn sample_metadata() -> RunMetadata {
    RunMetadata {
        git_ref: "main".to_string(),
        git_sha: Some("abc123".to_string()),
        pipeline_name: "frontend".to_string(),
        tags: serde_json::json!({"env": "test"}),
    }
}

fn sample_event(seq: u64, kind: &str) -> RunEvent {
    RunEvent {
        seq,
        kind: kind.to_string(),
        payload: serde_json::json!({"job": "build"}),
        timestamp: Utc::now(),
    }
}

fn sample_summary(success: bool) -> RunSummary {
    RunSummary {
        total_events: 2,
        jobs_succeeded: if success { 1 } else { 0 },
        jobs_failed: if success { 0 } else { 1 },
        duration_ms: 42,
        success,
    }
}

#[tokio::test]
async fn ledger_create_and_get() {
    let ledger = MemoryRunLedger::new();
    let digest = ContentDigest::from_bytes(b"pipeline");
    let run_id = RunId::new();
    ledger
        .create_run(&run_id, &digest, sample_metadata())
        .await
        .unwrap();

    let record = ledger.get_run(&run_id).await.unwrap();
    assert_eq!(record.status, RunStatus::Running);
    assert_eq!(record.spec_digest, digest);
    assert!(record.summary.is_none());
}

#[tokio::test]
async fn ledger_duplicate_run_id_rejected() {
    let ledger = MemoryRunLedger::new();
    let digest = ContentDigest::from_bytes(b"pipeline");
    let run_id = RunId::new();
    ledger
        .create_run(&run_id, &digest, sample_metadata())
        .await
        .unwrap();
    assert!(ledger
        .create_run(&run_id, &digest, sample_metadata())
        .await
        .is_err());
}

#[tokio::test]
async fn ledger_events_ordered_by_seq() {
    let ledger = MemoryRunLedger::new();
    let run_id = RunId::new();
    ledger
        .create_run(&run_id, &ContentDigest::from_bytes(b"p"), sample_metadata())
        .await
        .unwrap();

    ledger
        .append_event(&run_id, sample_event(2, "job_succeeded"))
        .await
        .unwrap();
    ledger
        .append_event(&run_id, sample_event(1, "job_started"))
        .await
        .unwrap();

    let events = ledger.get_events(&run_id).await.unwrap();
    assert_eq!(events[0].seq, 1);
    assert_eq!(events[1].seq, 2);
}

#[tokio::test]
async fn ledger_finished_run_rejects_events() {
    let ledger = MemoryRunLedger::new();
    let run_id = RunId::new();
    ledger
        .create_run(&run_id, &ContentDigest::from_bytes(b"p"), sample_metadata())
        .await
        .unwrap();
    ledger.fail_run(&run_id, sample_summary(false)).await.unwrap();

    let err = ledger
        .append_event(&run_id, sample_event(1, "job_started"))
        .await
        .unwrap_err();
    assert!(matches!(err, StorageError::InvalidRunState { .. }));

    let err = ledger
        .complete_run(&run_id, sample_summary(true))
        .await
        .unwrap_err();
    assert!(matches!(err, StorageError::InvalidRunState { .. }));
    assert_eq!(
        ledger.get_run(&run_id).await.unwrap().status,
        RunStatus::Failed
    );
}

#[tokio::test]
async fn ledger_unknown_run() {
    let ledger = MemoryRunLedger::new();
    let err = ledger.get_run(&RunId::new()).await.unwrap_err();
    assert!(matches!(err, StorageError::RunNotFound { .. }));
}

#[tokio::test]
async fn ledger_list_filters_by_digest() {
    let ledger = MemoryRunLedger::new();
    let a = ContentDigest::from_bytes(b"a");
    let b = ContentDigest::from_bytes(b"b");
    for digest in [&a, &a, &b] {
        ledger
            .create_run(&RunId::new(), digest, sample_metadata())
            .await
            .unwrap();
    }

    assert_eq!(ledger.list_runs(Some(&a)).await.unwrap().len(), 2);
    assert_eq!(ledger.list_runs(None).await.unwrap().len(), 3);
}

#[tokio::test]
async fn ledger_prune_drops_only_finished_runs() {
    let ledger = MemoryRunLedger::new();
    let digest = ContentDigest::from_bytes(b"p");
    let finished = RunId::new();
    let active = RunId::new();
    for id in [&finished, &active] {
        ledger.create_run(id, &digest, sample_metadata()).await.unwrap();
    }
    ledger
        .complete_run(&finished, sample_summary(true))
        .await
        .unwrap();

    let removed = ledger
        .prune_runs(Utc::now() + Duration::seconds(1))
        .await
        .unwrap();
    assert_eq!(removed, 1);
    assert!(ledger.get_run(&finished).await.is_err());
    assert!(ledger.get_run(&active).await.is_ok());
}
