//! Structured lifecycle events for pipeline runs.
//!
//! Every function emits one `tracing` event with a stable `event` field so
//! log pipelines can filter on it. Verbosity follows `RUST_LOG`; JSON output
//! is selected by the binary through [`crate::telemetry::init_tracing`].

use tracing::{info, warn, Span};

/// Span tagging everything logged during a run with its `run_id`.
///
/// Attach it with `tracing::Instrument` so the run future stays `Send`.
pub fn run_span(run_id: &str) -> Span {
    tracing::info_span!("gantry.run", run_id = %run_id)
}

pub fn emit_run_started(run_id: &str, pipeline: &str, git_ref: &str) {
    info!(event = "run.started", run_id = %run_id, pipeline = %pipeline, git_ref = %git_ref);
}

pub fn emit_stage_started(run_id: &str, stage: &str, jobs: usize) {
    info!(event = "stage.started", run_id = %run_id, stage = %stage, jobs = jobs);
}

pub fn emit_job_finished(run_id: &str, job: &str, status: &str, duration_ms: u64) {
    info!(
        event = "job.finished",
        run_id = %run_id,
        job = %job,
        status = %status,
        duration_ms = duration_ms,
    );
}

pub fn emit_run_finished(run_id: &str, duration_ms: u64, total_events: u64, success: bool) {
    info!(
        event = "run.finished",
        run_id = %run_id,
        duration_ms = duration_ms,
        total_events = total_events,
        success = success,
    );
}

pub fn emit_artifact_pruned(removed: usize) {
    info!(event = "artifact.pruned", removed = removed);
}

/// Warn-level: an environment could not be torn down cleanly.
pub fn emit_teardown_error(job: &str, error: &dyn std::fmt::Display) {
    warn!(event = "job.teardown_error", job = %job, error = %error);
}
