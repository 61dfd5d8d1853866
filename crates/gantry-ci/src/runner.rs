//! Job execution and artifact capture.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use gantry_state::{
    normalize_artifact_path, ArtifactKey, ArtifactMeta, ArtifactStore, Retention, RunId,
};
use tokio::time::Instant;
use tracing::debug;

use crate::environment::Environment;
use crate::error::{CiError, Result};
use crate::graph::JobSpec;
use crate::publish::Publisher;
use crate::run::JobStatus;

/// Outcome of one job.
#[derive(Debug, Clone)]
pub struct JobResult {
    pub job_name: String,
    pub stage: String,
    pub status: JobStatus,
    /// `$ <line>` echoes and captured output, up to the failing line.
    pub logs: String,
    /// Exit code of the failing line, when a line failed.
    pub exit_code: Option<i32>,
    pub error: Option<CiError>,
    /// Artifacts stored by this job, ordered by path.
    pub artifacts: Vec<ArtifactMeta>,
    /// Image reference pushed to the registry.
    pub published_image: Option<String>,
    pub duration_ms: u64,
}

impl JobResult {
    fn terminal(job: &JobSpec, status: JobStatus) -> Self {
        Self {
            job_name: job.name.clone(),
            stage: job.stage.clone(),
            status,
            logs: String::new(),
            exit_code: None,
            error: None,
            artifacts: Vec::new(),
            published_image: None,
            duration_ms: 0,
        }
    }

    pub fn skipped(job: &JobSpec) -> Self {
        Self::terminal(job, JobStatus::Skipped)
    }

    pub fn canceled(job: &JobSpec) -> Self {
        Self::terminal(job, JobStatus::Canceled)
    }

    /// A job that failed before its script could run.
    pub fn failed(job: &JobSpec, error: CiError, duration_ms: u64) -> Self {
        let mut result = Self::terminal(job, JobStatus::Failed);
        result.logs = format!("ERROR: {error}\n");
        result.exit_code = error.exit_code();
        result.error = Some(error);
        result.duration_ms = duration_ms;
        result
    }

    pub fn passed(&self) -> bool {
        self.status == JobStatus::Succeeded
    }
}

/// Runs a job's script inside a provisioned environment and stores what it
/// produced.
#[derive(Clone)]
pub struct JobRunner {
    store: Arc<dyn ArtifactStore>,
    default_retention: Retention,
    default_timeout: Duration,
    publisher: Option<Publisher>,
}

impl JobRunner {
    pub fn new(
        store: Arc<dyn ArtifactStore>,
        default_retention: Retention,
        default_timeout: Duration,
    ) -> Self {
        Self {
            store,
            default_retention,
            default_timeout,
            publisher: None,
        }
    }

    pub fn with_publisher(mut self, publisher: Publisher) -> Self {
        self.publisher = Some(publisher);
        self
    }

    /// Execute `job` in `env`.
    ///
    /// Script lines run in order; the first non-zero exit stops the job.
    /// On success the declared artifacts are stored and, for jobs with a
    /// publish block, the image is pushed.
    pub async fn run(
        &self,
        run_id: &RunId,
        job: &JobSpec,
        env: &dyn Environment,
        variables: &BTreeMap<String, String>,
    ) -> JobResult {
        let started = Instant::now();
        let mut result = JobResult::terminal(job, JobStatus::Running);

        let outcome = self.execute(run_id, job, env, variables, &mut result).await;
        result.duration_ms = started.elapsed().as_millis() as u64;
        match outcome {
            Ok(()) => result.status = JobStatus::Succeeded,
            Err(err) => {
                result.status = JobStatus::Failed;
                result.exit_code = err.exit_code();
                result.logs.push_str(&format!("ERROR: {err}\n"));
                result.error = Some(err);
            }
        }
        result
    }

    async fn execute(
        &self,
        run_id: &RunId,
        job: &JobSpec,
        env: &dyn Environment,
        variables: &BTreeMap<String, String>,
        result: &mut JobResult,
    ) -> Result<()> {
        let timeout = job
            .timeout_secs
            .map(Duration::from_secs)
            .unwrap_or(self.default_timeout);
        let deadline = Instant::now() + timeout;

        for line in &job.script {
            result.logs.push_str(&format!("$ {line}\n"));
            let output = tokio::time::timeout_at(deadline, env.exec(line))
                .await
                .map_err(|_| CiError::Execution {
                    job: job.name.clone(),
                    line: line.clone(),
                    exit_code: None,
                    reason: format!("timed out after {} seconds", timeout.as_secs()),
                })??;
            result.logs.push_str(&output.stdout);
            result.logs.push_str(&output.stderr);
            if !output.success() {
                return Err(CiError::Execution {
                    job: job.name.clone(),
                    line: line.clone(),
                    exit_code: Some(output.exit_code),
                    reason: format!("exit status {}", output.exit_code),
                });
            }
        }

        result.artifacts = self.store_artifacts(run_id, job, env.workspace()).await?;

        if job.publish.is_some() {
            let publisher = self.publisher.as_ref().ok_or_else(|| CiError::Execution {
                job: job.name.clone(),
                line: "<publish>".to_string(),
                exit_code: None,
                reason: "no registry credentials configured".to_string(),
            })?;
            result.published_image = Some(publisher.publish(job, variables).await?);
        }
        Ok(())
    }

    async fn store_artifacts(
        &self,
        run_id: &RunId,
        job: &JobSpec,
        workspace: &Path,
    ) -> Result<Vec<ArtifactMeta>> {
        let retention = job.retention.unwrap_or(self.default_retention);
        let mut files = Vec::new();
        for declared in &job.artifact_paths {
            let rel = normalize_artifact_path(declared)?;
            let full = workspace.join(&rel);
            if !full.exists() {
                return Err(CiError::Execution {
                    job: job.name.clone(),
                    line: format!("<artifacts: {declared}>"),
                    exit_code: None,
                    reason: "declared artifact path was not produced".to_string(),
                });
            }
            collect_files(&full, &rel, &mut files)?;
        }
        files.sort();
        files.dedup();

        let mut stored = Vec::with_capacity(files.len());
        for (rel, full) in files {
            let data = tokio::fs::read(&full).await?;
            let key = ArtifactKey::new(run_id, job.name.clone(), &rel)?;
            let meta = self.store.put(&key, &data, retention).await?;
            debug!(artifact = %key, size = meta.size, "artifact stored");
            stored.push(meta);
        }
        Ok(stored)
    }
}

/// Regular files below `full`, paired with their path relative to the
/// workspace. Symlinks are skipped so nothing outside the workspace is archived.
fn collect_files(full: &Path, rel: &str, out: &mut Vec<(String, PathBuf)>) -> Result<()> {
    let file_type = std::fs::symlink_metadata(full)?.file_type();
    if file_type.is_symlink() {
        debug!(path = %rel, "skipping symlink in artifact path");
    } else if file_type.is_dir() {
        let mut entries = std::fs::read_dir(full)?.collect::<std::io::Result<Vec<_>>>()?;
        entries.sort_by_key(|e| e.file_name());
        for entry in entries {
            let name = entry.file_name().to_string_lossy().to_string();
            collect_files(&entry.path(), &format!("{rel}/{name}"), out)?;
        }
    } else if file_type.is_file() {
        out.push((rel.to_string(), full.to_path_buf()));
    }
    Ok(())
}
