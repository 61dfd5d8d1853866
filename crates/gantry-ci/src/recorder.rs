//! Bridges run lifecycle events into a [`RunLedger`].

use std::sync::Arc;

use chrono::Utc;
use gantry_state::{
    ContentDigest, RunEvent, RunId, RunLedger, RunMetadata, RunSummary, StorageResult,
};
use tokio::sync::Mutex;

/// Records the events of one run.
///
/// Jobs of a wave record concurrently; sequence numbers are assigned under
/// a lock together with the append, so the ledger sees them in order.
///
/// 1. [`RunRecorder::start`] creates the run.
/// 2. [`RunRecorder::record`] appends events.
/// 3. [`RunRecorder::finish_ok`] or [`RunRecorder::finish_err`] closes it.
pub struct RunRecorder {
    ledger: Arc<dyn RunLedger>,
    run_id: RunId,
    next_seq: Mutex<u64>,
}

impl RunRecorder {
    pub async fn start(
        ledger: Arc<dyn RunLedger>,
        run_id: RunId,
        spec_digest: &ContentDigest,
        metadata: RunMetadata,
    ) -> StorageResult<Self> {
        ledger.create_run(&run_id, spec_digest, metadata).await?;
        Ok(Self {
            ledger,
            run_id,
            next_seq: Mutex::new(1),
        })
    }

    /// Append one event of `kind`.
    pub async fn record(&self, kind: &str, payload: serde_json::Value) -> StorageResult<()> {
        let mut next = self.next_seq.lock().await;
        let event = RunEvent {
            seq: *next,
            kind: kind.to_string(),
            payload,
            timestamp: Utc::now(),
        };
        self.ledger.append_event(&self.run_id, event).await?;
        *next += 1;
        Ok(())
    }

    /// Number of events appended so far.
    pub async fn events_recorded(&self) -> u64 {
        *self.next_seq.lock().await - 1
    }

    pub async fn finish_ok(self, summary: RunSummary) -> StorageResult<()> {
        self.ledger.complete_run(&self.run_id, summary).await
    }

    pub async fn finish_err(self, summary: RunSummary) -> StorageResult<()> {
        self.ledger.fail_run(&self.run_id, summary).await
    }

    pub fn run_id(&self) -> &RunId {
        &self.run_id
    }
}
