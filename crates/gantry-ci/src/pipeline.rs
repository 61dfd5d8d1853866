//! Run orchestration: stages in order, jobs of a wave concurrently.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use futures::future::join_all;
use gantry_state::{
    ArtifactMeta, ArtifactStore, ContentDigest, RunId, RunLedger, RunMetadata, RunSummary,
};
use serde_json::json;
use tokio::sync::Semaphore;
use tokio::time::Instant;
use tracing::{info, Instrument};

use crate::config::RunnerConfig;
use crate::environment::EnvironmentProvider;
use crate::error::{CiError, Result};
use crate::graph::{JobSpec, StageGraph};
use crate::obs;
use crate::publish::{Publisher, PUBLISH_IMAGE_VAR};
use crate::recorder::RunRecorder;
use crate::resolver::DependencyResolver;
use crate::run::{JobStatus, RunState};
use crate::runner::{JobResult, JobRunner};
use crate::trigger::{TriggerEvent, TriggerGate};

/// Result of a complete pipeline run.
#[derive(Debug, Clone)]
pub struct PipelineResult {
    pub run_id: RunId,

    /// `Succeeded` or `Failed`.
    pub state: RunState,

    /// One result per job, in execution order.
    pub jobs: Vec<JobResult>,

    /// Total duration in milliseconds.
    pub duration_ms: u64,

    /// Digest of the pipeline definition.
    pub spec_digest: ContentDigest,
}

impl PipelineResult {
    pub fn success(&self) -> bool {
        self.state == RunState::Succeeded
    }

    /// Number of jobs that succeeded.
    pub fn passed_count(&self) -> usize {
        self.jobs.iter().filter(|j| j.passed()).count()
    }

    /// Number of jobs that failed.
    pub fn failed_count(&self) -> usize {
        self.jobs
            .iter()
            .filter(|j| j.status == JobStatus::Failed)
            .count()
    }

    /// `(job, status)` pairs in execution order.
    pub fn statuses(&self) -> Vec<(&str, JobStatus)> {
        self.jobs
            .iter()
            .map(|j| (j.job_name.as_str(), j.status))
            .collect()
    }

    pub fn job(&self, name: &str) -> Option<&JobResult> {
        self.jobs.iter().find(|j| j.job_name == name)
    }
}

/// Per-run collaborators shared by every job of the run.
struct RunContext<'a> {
    run_id: &'a RunId,
    event: &'a TriggerEvent,
    recorder: &'a RunRecorder,
    runner: &'a JobRunner,
    resolver: &'a DependencyResolver,
    slots: &'a Semaphore,
}

/// Drives pipeline runs.
pub struct PipelineRunner {
    config: RunnerConfig,
    store: Arc<dyn ArtifactStore>,
    ledger: Arc<dyn RunLedger>,
    provider: Arc<dyn EnvironmentProvider>,
    publisher: Option<Publisher>,
    pipeline_name: String,
}

impl PipelineRunner {
    pub fn new(
        config: RunnerConfig,
        store: Arc<dyn ArtifactStore>,
        ledger: Arc<dyn RunLedger>,
        provider: Arc<dyn EnvironmentProvider>,
    ) -> Self {
        Self {
            config,
            store,
            ledger,
            provider,
            publisher: None,
            pipeline_name: "pipeline".to_string(),
        }
    }

    /// Enable publishing for jobs with a `publish` block.
    pub fn with_publisher(mut self, publisher: Publisher) -> Self {
        self.publisher = Some(publisher);
        self
    }

    /// Name recorded in run metadata.
    pub fn with_pipeline_name(mut self, name: impl Into<String>) -> Self {
        self.pipeline_name = name.into();
        self
    }

    /// Execute `graph` for `event` under a fresh run id.
    pub async fn execute(&self, graph: &StageGraph, event: &TriggerEvent) -> Result<PipelineResult> {
        self.execute_with_id(RunId::new(), graph, event).await
    }

    /// Execute `graph` for `event` under `run_id`.
    ///
    /// Job failures do not make this return `Err`; they show up as a
    /// `Failed` run. `Err` means the run itself could not be carried out,
    /// e.g. the ledger rejected it.
    pub async fn execute_with_id(
        &self,
        run_id: RunId,
        graph: &StageGraph,
        event: &TriggerEvent,
    ) -> Result<PipelineResult> {
        let span = obs::run_span(&run_id.0);
        self.drive(run_id, graph, event).instrument(span).await
    }

    async fn drive(
        &self,
        run_id: RunId,
        graph: &StageGraph,
        event: &TriggerEvent,
    ) -> Result<PipelineResult> {
        let start = Instant::now();
        let mut state = RunState::Pending;

        let metadata = RunMetadata {
            git_ref: event.git_ref.clone(),
            git_sha: event.sha.clone(),
            pipeline_name: self.pipeline_name.clone(),
            tags: json!({
                "stages": graph.execution_order(),
                "executor": self.config.executor,
                "is_tag": event.is_tag,
            }),
        };
        let recorder =
            RunRecorder::start(self.ledger.clone(), run_id.clone(), graph.digest(), metadata)
                .await?;
        state = state.transition(RunState::Running)?;
        obs::emit_run_started(&run_id.0, &self.pipeline_name, &event.git_ref);

        let mut runner = JobRunner::new(
            self.store.clone(),
            self.config.default_retention(),
            self.config.default_timeout(),
        );
        if let Some(publisher) = &self.publisher {
            runner = runner.with_publisher(publisher.clone());
        }
        let resolver = DependencyResolver::new(self.store.clone());
        let slots = Semaphore::new(self.config.max_parallel_jobs);
        let ctx = RunContext {
            run_id: &run_id,
            event,
            recorder: &recorder,
            runner: &runner,
            resolver: &resolver,
            slots: &slots,
        };

        let mut statuses: HashMap<String, JobStatus> = graph
            .jobs()
            .map(|j| (j.name.clone(), JobStatus::Pending))
            .collect();
        let mut produced: HashMap<String, Vec<ArtifactMeta>> = HashMap::new();
        let mut results: HashMap<String, JobResult> = HashMap::new();
        let mut failed = false;

        for stage in graph.stages() {
            if failed {
                for job in stage.job_names().filter_map(|n| graph.job(n)) {
                    let result = self.settle(&ctx, job, JobStatus::Canceled).await?;
                    statuses.insert(job.name.clone(), result.status);
                    results.insert(job.name.clone(), result);
                }
                continue;
            }

            let names: Vec<&String> = stage.job_names().collect();
            recorder
                .record("stage_started", json!({ "stage": stage.name, "jobs": names }))
                .await?;
            obs::emit_stage_started(&run_id.0, &stage.name, names.len());

            for wave in &stage.waves {
                let jobs: Vec<&JobSpec> = wave.iter().filter_map(|n| graph.job(n)).collect();
                let mut runnable = Vec::with_capacity(jobs.len());
                for job in jobs {
                    let verdict = if failed {
                        Some(JobStatus::Canceled)
                    } else if !TriggerGate::allows(job, event) {
                        Some(JobStatus::Skipped)
                    } else {
                        None
                    };
                    match verdict {
                        Some(status) => {
                            let result = self.settle(&ctx, job, status).await?;
                            statuses.insert(job.name.clone(), result.status);
                            results.insert(job.name.clone(), result);
                        }
                        None => runnable.push(job),
                    }
                }

                let outcomes = join_all(
                    runnable
                        .iter()
                        .map(|job| self.run_job(&ctx, job, &statuses, &produced)),
                )
                .await;
                for outcome in outcomes {
                    let result = outcome?;
                    match result.status {
                        JobStatus::Succeeded => {
                            produced.insert(result.job_name.clone(), result.artifacts.clone());
                        }
                        JobStatus::Failed => failed = true,
                        _ => {}
                    }
                    statuses.insert(result.job_name.clone(), result.status);
                    results.insert(result.job_name.clone(), result);
                }
            }

            recorder
                .record(
                    "stage_finished",
                    json!({
                        "stage": stage.name,
                        "status": if failed { "failed" } else { "succeeded" },
                    }),
                )
                .await?;
        }

        let jobs: Vec<JobResult> = graph
            .jobs_in_order()
            .iter()
            .filter_map(|j| results.remove(&j.name))
            .collect();
        let success = !failed;
        state = state.transition(if success {
            RunState::Succeeded
        } else {
            RunState::Failed
        })?;

        let duration_ms = start.elapsed().as_millis() as u64;
        let total_events = recorder.events_recorded().await;
        let summary = RunSummary {
            total_events,
            jobs_succeeded: jobs.iter().filter(|j| j.passed()).count(),
            jobs_failed: jobs.iter().filter(|j| j.status == JobStatus::Failed).count(),
            duration_ms,
            success,
        };
        if success {
            recorder.finish_ok(summary).await?;
            info!(run_id = %run_id, "pipeline succeeded");
        } else {
            recorder.finish_err(summary).await?;
            info!(run_id = %run_id, "pipeline failed");
        }
        obs::emit_run_finished(&run_id.0, duration_ms, total_events, success);

        Ok(PipelineResult {
            run_id,
            state,
            jobs,
            duration_ms,
            spec_digest: graph.digest().clone(),
        })
    }

    /// Record a job that will not run.
    async fn settle(
        &self,
        ctx: &RunContext<'_>,
        job: &JobSpec,
        status: JobStatus,
    ) -> Result<JobResult> {
        let (kind, result) = match status {
            JobStatus::Skipped => ("job_skipped", JobResult::skipped(job)),
            _ => ("job_canceled", JobResult::canceled(job)),
        };
        ctx.recorder
            .record(kind, json!({ "job": job.name, "stage": job.stage }))
            .await?;
        obs::emit_job_finished(&ctx.run_id.0, &job.name, &result.status.to_string(), 0);
        Ok(result)
    }

    async fn run_job(
        &self,
        ctx: &RunContext<'_>,
        job: &JobSpec,
        statuses: &HashMap<String, JobStatus>,
        produced: &HashMap<String, Vec<ArtifactMeta>>,
    ) -> Result<JobResult> {
        let _slot = ctx.slots.acquire().await.map_err(|e| CiError::Execution {
            job: job.name.clone(),
            line: "<schedule>".to_string(),
            exit_code: None,
            reason: e.to_string(),
        })?;
        let start = Instant::now();

        let result = match DependencyResolver::check(job, statuses) {
            Err(err) => JobResult::failed(job, err, 0),
            Ok(()) => {
                ctx.recorder
                    .record(
                        "job_started",
                        json!({ "job": job.name, "stage": job.stage, "image": job.image }),
                    )
                    .await?;
                match self.provision_and_run(ctx, job, produced).await {
                    Ok(result) => result,
                    Err(err) => JobResult::failed(job, err, start.elapsed().as_millis() as u64),
                }
            }
        };

        if result.passed() {
            let artifacts: Vec<&str> = result.artifacts.iter().map(|m| m.key.path.as_str()).collect();
            ctx.recorder
                .record(
                    "job_succeeded",
                    json!({
                        "job": job.name,
                        "stage": job.stage,
                        "duration_ms": result.duration_ms,
                        "artifacts": artifacts,
                        "published_image": result.published_image,
                    }),
                )
                .await?;
        } else {
            let error = result.error.as_ref().map(|e| e.to_string());
            let line = result.error.as_ref().and_then(|e| e.failed_line());
            ctx.recorder
                .record(
                    "job_failed",
                    json!({
                        "job": job.name,
                        "stage": job.stage,
                        "duration_ms": result.duration_ms,
                        "exit_code": result.exit_code,
                        "line": line,
                        "error": error,
                    }),
                )
                .await?;
        }
        obs::emit_job_finished(
            &ctx.run_id.0,
            &job.name,
            &result.status.to_string(),
            result.duration_ms,
        );
        Ok(result)
    }

    async fn provision_and_run(
        &self,
        ctx: &RunContext<'_>,
        job: &JobSpec,
        produced: &HashMap<String, Vec<ArtifactMeta>>,
    ) -> Result<JobResult> {
        let variables = self.job_variables(ctx.run_id, job, ctx.event);
        let env = self.provider.provision(job, &variables).await?;

        let result = match ctx.resolver.fetch(job, produced, env.workspace()).await {
            Ok(_) => ctx.runner.run(ctx.run_id, job, env.as_ref(), &variables).await,
            Err(err) => JobResult::failed(job, err, 0),
        };

        if let Err(err) = env.teardown().await {
            obs::emit_teardown_error(&job.name, &err);
        }
        Ok(result)
    }

    /// Pipeline and job variables, event variables, then the `CI_*` set.
    fn job_variables(
        &self,
        run_id: &RunId,
        job: &JobSpec,
        event: &TriggerEvent,
    ) -> BTreeMap<String, String> {
        let mut vars = job.variables.clone();
        vars.extend(event.variables.clone());
        vars.insert("CI".to_string(), "true".to_string());
        vars.insert("CI_PIPELINE_ID".to_string(), run_id.to_string());
        vars.insert("CI_JOB_NAME".to_string(), job.name.clone());
        vars.insert("CI_JOB_STAGE".to_string(), job.stage.clone());
        vars.insert("CI_COMMIT_REF_NAME".to_string(), event.git_ref.clone());
        vars.insert(
            "CI_COMMIT_SHA".to_string(),
            event.sha.clone().unwrap_or_default(),
        );
        if event.is_tag {
            vars.insert("CI_COMMIT_TAG".to_string(), event.git_ref.clone());
        }
        if let Some(image) = self.publisher.as_ref().and_then(|p| p.image_name()) {
            vars.insert(PUBLISH_IMAGE_VAR.to_string(), image.to_string());
        }
        vars
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::environment::LocalProvider;
    use gantry_state::fakes::{MemoryArtifactStore, MemoryRunLedger};

    fn result(name: &str, status: JobStatus) -> JobResult {
        let graph = StageGraph::from_yaml(&format!(
            "{name}:\n  image: alpine\n  script: [\"true\"]\n"
        ))
        .unwrap();
        let job = graph.job(name).unwrap();
        match status {
            JobStatus::Skipped => JobResult::skipped(job),
            JobStatus::Canceled => JobResult::canceled(job),
            _ => {
                let mut r = JobResult::skipped(job);
                r.status = status;
                r
            }
        }
    }

    #[test]
    fn pipeline_result_counts() {
        let result = PipelineResult {
            run_id: RunId("run123".to_string()),
            state: RunState::Failed,
            jobs: vec![
                result("build", JobStatus::Succeeded),
                result("test", JobStatus::Failed),
                result("deploy", JobStatus::Canceled),
            ],
            duration_ms: 300,
            spec_digest: ContentDigest::from_bytes(b"abc"),
        };
        assert_eq!(result.passed_count(), 1);
        assert_eq!(result.failed_count(), 1);
        assert!(!result.success());
        assert_eq!(
            result.statuses(),
            vec![
                ("build", JobStatus::Succeeded),
                ("test", JobStatus::Failed),
                ("deploy", JobStatus::Canceled)
            ]
        );
        assert!(result.job("deploy").is_some());
    }

    #[tokio::test]
    async fn job_variables_carry_run_context_but_no_credentials() {
        let runner = PipelineRunner::new(
            RunnerConfig::default(),
            Arc::new(MemoryArtifactStore::new()),
            Arc::new(MemoryRunLedger::new()),
            Arc::new(LocalProvider::default()),
        );
        let graph = StageGraph::from_yaml(
            "variables:\n  NODE_ENV: production\nj:\n  image: alpine\n  script: [env]\n",
        )
        .unwrap();
        let event = TriggerEvent::tag("v1.0.0")
            .with_sha("abc123")
            .with_variable("NODE_ENV", "staging");
        let vars = runner.job_variables(&RunId("r9".to_string()), graph.job("j").unwrap(), &event);

        assert_eq!(vars["CI_PIPELINE_ID"], "r9");
        assert_eq!(vars["CI_JOB_NAME"], "j");
        assert_eq!(vars["CI_JOB_STAGE"], "test");
        assert_eq!(vars["CI_COMMIT_REF_NAME"], "v1.0.0");
        assert_eq!(vars["CI_COMMIT_SHA"], "abc123");
        assert_eq!(vars["CI_COMMIT_TAG"], "v1.0.0");
        assert_eq!(vars["NODE_ENV"], "staging");
        assert!(!vars.keys().any(|k| k.contains("PASSWORD")));
    }
}
