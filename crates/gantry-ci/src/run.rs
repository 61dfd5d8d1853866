//! Run and job state.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::{CiError, Result};

/// Lifecycle of a run.
///
/// `Pending -> Running -> {Succeeded, Failed}`. Both outcomes are terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunState {
    Pending,
    Running,
    Succeeded,
    Failed,
}

impl RunState {
    pub fn is_terminal(self) -> bool {
        matches!(self, RunState::Succeeded | RunState::Failed)
    }

    /// Move to `next`, rejecting anything outside the lifecycle.
    pub fn transition(self, next: RunState) -> Result<RunState> {
        match (self, next) {
            (RunState::Pending, RunState::Running)
            | (RunState::Running, RunState::Succeeded)
            | (RunState::Running, RunState::Failed) => Ok(next),
            (from, to) => Err(CiError::InvalidTransition {
                from: from.to_string(),
                to: to.to_string(),
            }),
        }
    }
}

impl fmt::Display for RunState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            RunState::Pending => "pending",
            RunState::Running => "running",
            RunState::Succeeded => "succeeded",
            RunState::Failed => "failed",
        };
        f.write_str(s)
    }
}

/// Final (or current) state of one job within a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Pending,
    Running,
    Succeeded,
    Failed,
    /// The trigger gate excluded the job.
    Skipped,
    /// Never started because an earlier job failed.
    Canceled,
}

impl JobStatus {
    pub fn is_terminal(self) -> bool {
        !matches!(self, JobStatus::Pending | JobStatus::Running)
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            JobStatus::Pending => "pending",
            JobStatus::Running => "running",
            JobStatus::Succeeded => "succeeded",
            JobStatus::Failed => "failed",
            JobStatus::Skipped => "skipped",
            JobStatus::Canceled => "canceled",
        };
        f.write_str(s)
    }
}
