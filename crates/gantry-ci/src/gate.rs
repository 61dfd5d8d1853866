//! Gate evaluation over a recorded run.

use std::collections::{BTreeSet, HashSet};

use gantry_state::RunEvent;
use serde::{Deserialize, Serialize};

/// Gate evaluation verdict.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GateVerdict {
    /// Whether the gate passed.
    pub passed: bool,

    /// Violations that caused failure (empty if passed).
    pub violations: Vec<String>,

    /// Summary message.
    pub message: String,
}

/// Pass/fail rules for a run's event stream.
pub struct RunGate;

impl RunGate {
    /// Evaluate a run's events.
    ///
    /// - every `job_failed` is a violation;
    /// - a `job_started` with no later `job_succeeded` or `job_failed` is a
    ///   violation.
    ///
    /// Skipped and canceled jobs are not violations on their own: a canceled
    /// job always follows a recorded failure.
    pub fn evaluate(events: &[RunEvent]) -> GateVerdict {
        let mut violations = Vec::new();
        let mut started = BTreeSet::new();
        let mut finished = HashSet::new();

        let job_of = |event: &RunEvent| {
            event.payload["job"]
                .as_str()
                .unwrap_or("unknown")
                .to_string()
        };

        for event in events {
            match event.kind.as_str() {
                "job_started" => {
                    started.insert(job_of(event));
                }
                "job_succeeded" => {
                    finished.insert(job_of(event));
                }
                "job_failed" => {
                    let job = job_of(event);
                    let error = event.payload["error"].as_str().unwrap_or("unknown error");
                    violations.push(format!("Job '{job}' failed: {error}"));
                    finished.insert(job);
                }
                _ => {}
            }
        }

        for job in &started {
            if !finished.contains(job) {
                violations.push(format!("Job '{job}' was started but never completed"));
            }
        }

        let passed = violations.is_empty();
        let message = if passed {
            "All jobs passed".to_string()
        } else {
            format!("Gate failed with {} violation(s)", violations.len())
        };

        GateVerdict {
            passed,
            violations,
            message,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use serde_json::json;

    fn event(seq: u64, kind: &str, payload: serde_json::Value) -> RunEvent {
        RunEvent {
            seq,
            kind: kind.to_string(),
            payload,
            timestamp: Utc::now(),
        }
    }

    #[test]
    fn test_empty_events_passes() {
        let verdict = RunGate::evaluate(&[]);
        assert!(verdict.passed);
        assert_eq!(verdict.message, "All jobs passed");
    }

    #[test]
    fn test_successful_run() {
        let events = vec![
            event(1, "stage_started", json!({ "stage": "build" })),
            event(2, "job_started", json!({ "job": "build" })),
            event(3, "job_succeeded", json!({ "job": "build" })),
            event(4, "job_skipped", json!({ "job": "deploy" })),
        ];
        let verdict = RunGate::evaluate(&events);
        assert!(verdict.passed);
        assert!(verdict.violations.is_empty());
    }

    #[test]
    fn test_failed_job() {
        let events = vec![
            event(1, "job_started", json!({ "job": "build" })),
            event(
                2,
                "job_failed",
                json!({ "job": "build", "error": "job 'build' failed at `npm run build`" }),
            ),
            event(3, "job_canceled", json!({ "job": "test" })),
        ];
        let verdict = RunGate::evaluate(&events);
        assert!(!verdict.passed);
        assert_eq!(verdict.violations.len(), 1);
        assert!(verdict.violations[0].contains("npm run build"));
    }

    #[test]
    fn test_failed_without_start() {
        let events = vec![event(
            1,
            "job_failed",
            json!({ "job": "test", "error": "missing artifacts" }),
        )];
        let verdict = RunGate::evaluate(&events);
        assert!(!verdict.passed);
        assert_eq!(verdict.violations.len(), 1);
    }

    #[test]
    fn test_started_but_never_completed() {
        let events = vec![event(1, "job_started", json!({ "job": "deploy" }))];
        let verdict = RunGate::evaluate(&events);
        assert!(!verdict.passed);
        assert!(verdict.violations[0].contains("never completed"));
    }
}
