//! Isolated execution environments for jobs.
//!
//! Every job gets a fresh workspace directory on the host. The local
//! provider runs script lines directly in it; the docker provider starts a
//! container from the job's image with the workspace bind-mounted and runs
//! each line through `docker exec`.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::process::Stdio;

use async_trait::async_trait;
use tempfile::TempDir;
use tokio::process::Command;
use tracing::{debug, warn};

use crate::error::{CiError, Result};
use crate::graph::JobSpec;

/// Output of a single script line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecOutput {
    /// Exit code (-1 when killed by a signal).
    pub exit_code: i32,
    pub stdout: String,
    pub stderr: String,
}

impl ExecOutput {
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }
}

/// A provisioned environment bound to one job.
#[async_trait]
pub trait Environment: Send + Sync {
    /// Host directory that is the job's working directory.
    fn workspace(&self) -> &Path;

    /// Run one script line through the shell.
    async fn exec(&self, line: &str) -> Result<ExecOutput>;

    /// Release everything the environment holds.
    async fn teardown(self: Box<Self>) -> Result<()>;
}

/// Creates environments from a job's image reference.
#[async_trait]
pub trait EnvironmentProvider: Send + Sync {
    async fn provision(
        &self,
        job: &JobSpec,
        variables: &BTreeMap<String, String>,
    ) -> Result<Box<dyn Environment>>;
}

fn workspace_dir(base: Option<&Path>, job: &JobSpec) -> Result<TempDir> {
    let prefix = format!("gantry-{}-", job.name);
    let dir = match base {
        Some(base) => {
            std::fs::create_dir_all(base)?;
            tempfile::Builder::new().prefix(&prefix).tempdir_in(base)?
        }
        None => tempfile::Builder::new().prefix(&prefix).tempdir()?,
    };
    Ok(dir)
}

async fn capture(mut cmd: Command, job: &str, line: &str) -> Result<ExecOutput> {
    let output = cmd
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .output()
        .await
        .map_err(|e| CiError::Execution {
            job: job.to_string(),
            line: line.to_string(),
            exit_code: None,
            reason: format!("failed to spawn: {e}"),
        })?;

    Ok(ExecOutput {
        exit_code: output.status.code().unwrap_or(-1),
        stdout: String::from_utf8_lossy(&output.stdout).to_string(),
        stderr: String::from_utf8_lossy(&output.stderr).to_string(),
    })
}

// ---------------------------------------------------------------------------
// Local
// ---------------------------------------------------------------------------

/// Runs jobs on the host in a throwaway workspace. The image is only logged.
#[derive(Debug, Clone)]
pub struct LocalProvider {
    shell: String,
    work_root: Option<PathBuf>,
}

impl LocalProvider {
    pub fn new(shell: impl Into<String>) -> Self {
        Self {
            shell: shell.into(),
            work_root: None,
        }
    }

    /// Create workspaces below `root` instead of the system temp dir.
    pub fn with_work_root(mut self, root: impl Into<PathBuf>) -> Self {
        self.work_root = Some(root.into());
        self
    }
}

impl Default for LocalProvider {
    fn default() -> Self {
        Self::new("sh")
    }
}

#[async_trait]
impl EnvironmentProvider for LocalProvider {
    async fn provision(
        &self,
        job: &JobSpec,
        variables: &BTreeMap<String, String>,
    ) -> Result<Box<dyn Environment>> {
        let dir = workspace_dir(self.work_root.as_deref(), job)?;
        debug!(job = %job.name, image = %job.image, workspace = %dir.path().display(), "local environment ready");
        Ok(Box::new(LocalEnvironment {
            job: job.name.clone(),
            shell: self.shell.clone(),
            variables: variables.clone(),
            dir,
        }))
    }
}

struct LocalEnvironment {
    job: String,
    shell: String,
    variables: BTreeMap<String, String>,
    dir: TempDir,
}

#[async_trait]
impl Environment for LocalEnvironment {
    fn workspace(&self) -> &Path {
        self.dir.path()
    }

    async fn exec(&self, line: &str) -> Result<ExecOutput> {
        let mut cmd = Command::new(&self.shell);
        cmd.arg("-c")
            .arg(line)
            .current_dir(self.dir.path())
            .envs(&self.variables);
        capture(cmd, &self.job, line).await
    }

    async fn teardown(self: Box<Self>) -> Result<()> {
        let this = *self;
        this.dir.close()?;
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Docker
// ---------------------------------------------------------------------------

/// Mount point of the workspace inside job containers.
pub const CONTAINER_WORKDIR: &str = "/builds/workspace";

/// Runs each job in a container started from the job's image.
#[derive(Debug, Clone)]
pub struct DockerProvider {
    docker_bin: String,
    shell: String,
    work_root: Option<PathBuf>,
}

impl DockerProvider {
    pub fn new(docker_bin: impl Into<String>, shell: impl Into<String>) -> Self {
        Self {
            docker_bin: docker_bin.into(),
            shell: shell.into(),
            work_root: None,
        }
    }

    pub fn with_work_root(mut self, root: impl Into<PathBuf>) -> Self {
        self.work_root = Some(root.into());
        self
    }
}

#[async_trait]
impl EnvironmentProvider for DockerProvider {
    async fn provision(
        &self,
        job: &JobSpec,
        variables: &BTreeMap<String, String>,
    ) -> Result<Box<dyn Environment>> {
        let dir = workspace_dir(self.work_root.as_deref(), job)?;

        let mut cmd = Command::new(&self.docker_bin);
        cmd.arg("run")
            .arg("--detach")
            .arg("--rm")
            .arg("--volume")
            .arg(format!("{}:{}", dir.path().display(), CONTAINER_WORKDIR))
            .arg("--workdir")
            .arg(CONTAINER_WORKDIR)
            .arg("--entrypoint")
            .arg(&self.shell);
        for (key, value) in variables {
            cmd.arg("--env").arg(format!("{key}={value}"));
        }
        cmd.arg(&job.image)
            .arg("-c")
            .arg("while :; do sleep 3600; done");

        let started = capture(cmd, &job.name, "<provision>").await?;
        if !started.success() {
            return Err(CiError::Execution {
                job: job.name.clone(),
                line: "<provision>".to_string(),
                exit_code: Some(started.exit_code),
                reason: format!("cannot start image '{}': {}", job.image, started.stderr.trim()),
            });
        }
        let container_id = started.stdout.trim().to_string();
        debug!(job = %job.name, image = %job.image, container = %container_id, "container environment ready");

        Ok(Box::new(DockerEnvironment {
            job: job.name.clone(),
            docker_bin: self.docker_bin.clone(),
            shell: self.shell.clone(),
            container_id,
            dir,
        }))
    }
}

struct DockerEnvironment {
    job: String,
    docker_bin: String,
    shell: String,
    container_id: String,
    dir: TempDir,
}

#[async_trait]
impl Environment for DockerEnvironment {
    fn workspace(&self) -> &Path {
        self.dir.path()
    }

    async fn exec(&self, line: &str) -> Result<ExecOutput> {
        let mut cmd = Command::new(&self.docker_bin);
        cmd.arg("exec")
            .arg("--workdir")
            .arg(CONTAINER_WORKDIR)
            .arg(&self.container_id)
            .arg(&self.shell)
            .arg("-c")
            .arg(line);
        capture(cmd, &self.job, line).await
    }

    async fn teardown(self: Box<Self>) -> Result<()> {
        let this = *self;
        let mut cmd = Command::new(&this.docker_bin);
        cmd.arg("rm").arg("--force").arg(&this.container_id);
        let removed = capture(cmd, &this.job, "<teardown>").await?;
        if !removed.success() {
            warn!(job = %this.job, container = %this.container_id, stderr = %removed.stderr.trim(), "container removal failed");
        }
        this.dir.close()?;
        Ok(())
    }
}
