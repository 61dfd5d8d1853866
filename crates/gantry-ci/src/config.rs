//! Runner configuration.
//!
//! Resolution order: built-in defaults, then an optional `gantry.toml`, then
//! `GANTRY_*` environment variables, then explicit `with_*` calls.

use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use gantry_state::{Retention, MAX_RETENTION_SECS};
use serde::{Deserialize, Serialize};

use crate::environment::{DockerProvider, EnvironmentProvider, LocalProvider};
use crate::error::{CiError, Result};

/// Default configuration file name, looked up in the working directory.
pub const CONFIG_FILE: &str = "gantry.toml";

/// Where jobs execute.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Executor {
    #[default]
    Local,
    Docker,
}

impl FromStr for Executor {
    type Err = CiError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "local" => Ok(Executor::Local),
            "docker" => Ok(Executor::Docker),
            other => Err(CiError::Config(format!(
                "unknown executor '{other}' (expected local or docker)"
            ))),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RunnerConfig {
    /// Root of the on-disk artifact store.
    pub artifact_dir: PathBuf,
    /// Retention for artifacts without `expire_in`.
    pub default_retention_hours: i64,
    /// Timeout for jobs without `timeout`.
    pub default_timeout_secs: u64,
    /// Upper bound on concurrently running jobs.
    pub max_parallel_jobs: usize,
    pub executor: Executor,
    pub docker_bin: String,
    pub shell: String,
    /// Parent directory of job workspaces; system temp dir when unset.
    pub work_dir: Option<PathBuf>,
}

impl Default for RunnerConfig {
    fn default() -> Self {
        Self {
            artifact_dir: PathBuf::from(".gantry/artifacts"),
            default_retention_hours: 720,
            default_timeout_secs: 3600,
            max_parallel_jobs: 4,
            executor: Executor::Local,
            docker_bin: "docker".to_string(),
            shell: "sh".to_string(),
            work_dir: None,
        }
    }
}

impl RunnerConfig {
    /// Parse a TOML document. Missing keys keep their defaults.
    pub fn from_toml(source: &str) -> Result<Self> {
        let config: RunnerConfig =
            toml::from_str(source).map_err(|e| CiError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_file(path: &Path) -> Result<Self> {
        let source = std::fs::read_to_string(path)
            .map_err(|e| CiError::Config(format!("cannot read {}: {e}", path.display())))?;
        Self::from_toml(&source)
    }

    /// Load `path` (or `gantry.toml` when present) and apply environment
    /// overrides.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let base = match path {
            Some(path) => Self::from_file(path)?,
            None if Path::new(CONFIG_FILE).exists() => Self::from_file(Path::new(CONFIG_FILE))?,
            None => Self::default(),
        };
        base.with_env_overrides(|key| std::env::var(key).ok())
    }

    /// Apply overrides:
    /// - GANTRY_ARTIFACT_DIR
    /// - GANTRY_RETENTION_HOURS
    /// - GANTRY_TIMEOUT_SECS
    /// - GANTRY_MAX_PARALLEL_JOBS
    /// - GANTRY_EXECUTOR (`local` or `docker`)
    /// - GANTRY_DOCKER_BIN
    /// - GANTRY_SHELL
    /// - GANTRY_WORK_DIR
    pub fn with_env_overrides(mut self, lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        fn parse<T: FromStr>(key: &str, raw: &str) -> Result<T> {
            raw.trim()
                .parse()
                .map_err(|_| CiError::Config(format!("{key} has invalid value '{raw}'")))
        }

        if let Some(v) = lookup("GANTRY_ARTIFACT_DIR") {
            self.artifact_dir = PathBuf::from(v);
        }
        if let Some(v) = lookup("GANTRY_RETENTION_HOURS") {
            self.default_retention_hours = parse("GANTRY_RETENTION_HOURS", &v)?;
        }
        if let Some(v) = lookup("GANTRY_TIMEOUT_SECS") {
            self.default_timeout_secs = parse("GANTRY_TIMEOUT_SECS", &v)?;
        }
        if let Some(v) = lookup("GANTRY_MAX_PARALLEL_JOBS") {
            self.max_parallel_jobs = parse("GANTRY_MAX_PARALLEL_JOBS", &v)?;
        }
        if let Some(v) = lookup("GANTRY_EXECUTOR") {
            self.executor = v.parse()?;
        }
        if let Some(v) = lookup("GANTRY_DOCKER_BIN") {
            self.docker_bin = v;
        }
        if let Some(v) = lookup("GANTRY_SHELL") {
            self.shell = v;
        }
        if let Some(v) = lookup("GANTRY_WORK_DIR") {
            self.work_dir = Some(PathBuf::from(v));
        }
        self.validate()?;
        Ok(self)
    }

    pub fn with_artifact_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.artifact_dir = dir.into();
        self
    }

    pub fn with_default_retention_hours(mut self, hours: i64) -> Self {
        self.default_retention_hours = hours;
        self
    }

    pub fn with_default_timeout_secs(mut self, secs: u64) -> Self {
        self.default_timeout_secs = secs;
        self
    }

    pub fn with_max_parallel_jobs(mut self, n: usize) -> Self {
        self.max_parallel_jobs = n;
        self
    }

    pub fn with_executor(mut self, executor: Executor) -> Self {
        self.executor = executor;
        self
    }

    pub fn with_work_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.work_dir = Some(dir.into());
        self
    }

    fn validate(&self) -> Result<()> {
        if self.max_parallel_jobs == 0 {
            return Err(CiError::Config("max_parallel_jobs must be at least 1".to_string()));
        }
        if self.default_retention_hours <= 0 {
            return Err(CiError::Config(
                "default_retention_hours must be positive".to_string(),
            ));
        }
        if self.default_retention_hours > MAX_RETENTION_SECS / 3600 {
            return Err(CiError::Config(format!(
                "default_retention_hours must be at most {}",
                MAX_RETENTION_SECS / 3600
            )));
        }
        if self.default_timeout_secs == 0 {
            return Err(CiError::Config("default_timeout_secs must be positive".to_string()));
        }
        Ok(())
    }

    pub fn default_retention(&self) -> Retention {
        Retention::hours(self.default_retention_hours)
    }

    pub fn default_timeout(&self) -> Duration {
        Duration::from_secs(self.default_timeout_secs)
    }

    /// The environment provider selected by `executor`.
    pub fn environment_provider(&self) -> Arc<dyn EnvironmentProvider> {
        match self.executor {
            Executor::Local => {
                let mut provider = LocalProvider::new(self.shell.clone());
                if let Some(dir) = &self.work_dir {
                    provider = provider.with_work_root(dir);
                }
                Arc::new(provider)
            }
            Executor::Docker => {
                let mut provider = DockerProvider::new(self.docker_bin.clone(), self.shell.clone());
                if let Some(dir) = &self.work_dir {
                    provider = provider.with_work_root(dir);
                }
                Arc::new(provider)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults() {
        let config = RunnerConfig::default();
        assert_eq!(config.default_retention_hours, 720);
        assert_eq!(config.default_timeout_secs, 3600);
        assert_eq!(config.max_parallel_jobs, 4);
        assert_eq!(config.executor, Executor::Local);
        assert_eq!(config.default_retention(), Retention::Seconds(720 * 3600));
    }

    #[test]
    fn toml_overrides_some_keys() {
        let config = RunnerConfig::from_toml(
            "artifact_dir = \"/var/lib/gantry\"\nexecutor = \"docker\"\nmax_parallel_jobs = 2\n",
        )
        .unwrap();
        assert_eq!(config.artifact_dir, PathBuf::from("/var/lib/gantry"));
        assert_eq!(config.executor, Executor::Docker);
        assert_eq!(config.max_parallel_jobs, 2);
        assert_eq!(config.shell, "sh");
    }

    #[test]
    fn env_overrides_apply_after_file() {
        let config = RunnerConfig::default()
            .with_env_overrides(|key| match key {
                "GANTRY_EXECUTOR" => Some("docker".to_string()),
                "GANTRY_TIMEOUT_SECS" => Some("90".to_string()),
                _ => None,
            })
            .unwrap();
        assert_eq!(config.executor, Executor::Docker);
        assert_eq!(config.default_timeout_secs, 90);
    }

    #[test]
    fn invalid_values_are_config_errors() {
        let err = RunnerConfig::default()
            .with_env_overrides(|key| (key == "GANTRY_MAX_PARALLEL_JOBS").then(|| "many".to_string()))
            .unwrap_err();
        assert!(matches!(err, CiError::Config(_)));

        assert!(RunnerConfig::from_toml("max_parallel_jobs = 0\n").is_err());
        assert!("podman".parse::<Executor>().is_err());
    }

    #[test]
    fn retention_hours_are_capped() {
        let err = RunnerConfig::default()
            .with_env_overrides(|key| {
                (key == "GANTRY_RETENTION_HOURS").then(|| i64::MAX.to_string())
            })
            .unwrap_err();
        assert!(matches!(err, CiError::Config(_)));

        assert!(RunnerConfig::from_toml("default_retention_hours = 876001
").is_err());
        assert!(RunnerConfig::from_toml("default_retention_hours = 876000
").is_ok());
    }

    #[test]
    fn builder_methods() {
        let config = RunnerConfig::default()
            .with_artifact_dir("/tmp/a")
            .with_max_parallel_jobs(1)
            .with_default_retention_hours(2)
            .with_default_timeout_secs(5);
        assert_eq!(config.artifact_dir, PathBuf::from("/tmp/a"));
        assert_eq!(config.default_retention(), Retention::Seconds(7200));
        assert_eq!(config.default_timeout(), Duration::from_secs(5));
    }
}
