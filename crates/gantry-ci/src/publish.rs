//! Container registry publishing.
//!
//! Credentials are handed in explicitly through [`PublishConfig`] and only
//! ever reach the registry's `login`. They never enter job environments,
//! ledger events or logs.

use std::collections::BTreeMap;
use std::fmt;
use std::process::Stdio;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::info;

use crate::definition::expand_vars;
use crate::error::{CiError, Result};
use crate::graph::JobSpec;

/// Job variable carrying the configured target image name.
pub const PUBLISH_IMAGE_VAR: &str = "GANTRY_PUBLISH_IMAGE";

/// Registry login credentials.
#[derive(Clone, PartialEq, Eq)]
pub struct RegistryCredentials {
    /// Registry host, e.g. `registry.example.com`. Empty means the default registry.
    pub registry: String,
    pub username: String,
    password: String,
}

impl RegistryCredentials {
    pub fn new(
        registry: impl Into<String>,
        username: impl Into<String>,
        password: impl Into<String>,
    ) -> Self {
        Self {
            registry: registry.into(),
            username: username.into(),
            password: password.into(),
        }
    }

    pub fn password(&self) -> &str {
        &self.password
    }
}

impl fmt::Debug for RegistryCredentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RegistryCredentials")
            .field("registry", &self.registry)
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .finish()
    }
}

/// Run-time publishing configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PublishConfig {
    pub credentials: RegistryCredentials,
    /// Image reference used when a job's publish block names none.
    pub image_name: Option<String>,
}

impl PublishConfig {
    pub fn new(credentials: RegistryCredentials) -> Self {
        Self {
            credentials,
            image_name: None,
        }
    }

    pub fn with_image_name(mut self, image: impl Into<String>) -> Self {
        self.image_name = Some(image.into());
        self
    }

    /// Read `GANTRY_REGISTRY`, `GANTRY_REGISTRY_USER`,
    /// `GANTRY_REGISTRY_PASSWORD` and `GANTRY_IMAGE_NAME`.
    ///
    /// Returns `None` when neither user nor password is set. Setting only one
    /// of them is a configuration error.
    pub fn from_env() -> Result<Option<Self>> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Option<Self>> {
        let user = lookup("GANTRY_REGISTRY_USER").filter(|v| !v.is_empty());
        let password = lookup("GANTRY_REGISTRY_PASSWORD").filter(|v| !v.is_empty());
        let (username, password) = match (user, password) {
            (None, None) => return Ok(None),
            (Some(u), Some(p)) => (u, p),
            _ => {
                return Err(CiError::Config(
                    "GANTRY_REGISTRY_USER and GANTRY_REGISTRY_PASSWORD must be set together"
                        .to_string(),
                ))
            }
        };
        let registry = lookup("GANTRY_REGISTRY").unwrap_or_default();
        let mut config = Self::new(RegistryCredentials::new(registry, username, password));
        config.image_name = lookup("GANTRY_IMAGE_NAME").filter(|v| !v.is_empty());
        Ok(Some(config))
    }
}

/// The registry black box.
#[async_trait]
pub trait Registry: Send + Sync {
    async fn login(&self, credentials: &RegistryCredentials) -> Result<()>;

    async fn push(&self, image_ref: &str) -> Result<()>;
}

/// Talks to a registry through the `docker` CLI.
#[derive(Debug, Clone)]
pub struct DockerCliRegistry {
    docker_bin: String,
}

impl DockerCliRegistry {
    pub fn new(docker_bin: impl Into<String>) -> Self {
        Self {
            docker_bin: docker_bin.into(),
        }
    }
}

impl Default for DockerCliRegistry {
    fn default() -> Self {
        Self::new("docker")
    }
}

#[async_trait]
impl Registry for DockerCliRegistry {
    async fn login(&self, credentials: &RegistryCredentials) -> Result<()> {
        let mut cmd = Command::new(&self.docker_bin);
        cmd.arg("login")
            .arg("--username")
            .arg(&credentials.username)
            .arg("--password-stdin");
        if !credentials.registry.is_empty() {
            cmd.arg(&credentials.registry);
        }
        let mut child = cmd
            .stdin(Stdio::piped())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| CiError::Publish(format!("cannot run {}: {e}", self.docker_bin)))?;

        if let Some(mut stdin) = child.stdin.take() {
            stdin
                .write_all(credentials.password().as_bytes())
                .await
                .map_err(|e| CiError::Publish(format!("cannot pass password: {e}")))?;
        }

        let output = child
            .wait_with_output()
            .await
            .map_err(|e| CiError::Publish(e.to_string()))?;
        if !output.status.success() {
            return Err(CiError::Publish(format!(
                "login to '{}' failed: {}",
                credentials.registry,
                String::from_utf8_lossy(&output.stderr).trim()
            )));
        }
        Ok(())
    }

    async fn push(&self, image_ref: &str) -> Result<()> {
        let output = Command::new(&self.docker_bin)
            .arg("push")
            .arg(image_ref)
            .stdin(Stdio::null())
            .kill_on_drop(true)
            .output()
            .await
            .map_err(|e| CiError::Publish(format!("cannot run {}: {e}", self.docker_bin)))?;
        if !output.status.success() {
            return Err(CiError::Publish(format!(
                "push of '{image_ref}' failed: {}",
                String::from_utf8_lossy(&output.stderr).trim()
            )));
        }
        Ok(())
    }
}

/// Publishes the images of jobs carrying a `publish` block.
#[derive(Clone)]
pub struct Publisher {
    registry: Arc<dyn Registry>,
    config: PublishConfig,
}

impl Publisher {
    pub fn new(registry: Arc<dyn Registry>, config: PublishConfig) -> Self {
        Self { registry, config }
    }

    pub fn image_name(&self) -> Option<&str> {
        self.config.image_name.as_deref()
    }

    /// Image reference a job publishes: its own `publish.image` with
    /// variables expanded, else the configured image name.
    pub fn resolve_image(&self, job: &JobSpec, vars: &BTreeMap<String, String>) -> Result<String> {
        let declared = job
            .publish
            .as_ref()
            .and_then(|p| p.image.as_deref())
            .map(|template| expand_vars(template, vars));
        let image = declared
            .or_else(|| self.config.image_name.clone())
            .unwrap_or_default();
        if image.trim().is_empty() {
            return Err(CiError::Publish(format!(
                "job '{}' has no image reference to publish",
                job.name
            )));
        }
        Ok(image)
    }

    /// Log in and push. Returns the pushed reference.
    pub async fn publish(&self, job: &JobSpec, vars: &BTreeMap<String, String>) -> Result<String> {
        let image = self.resolve_image(job, vars)?;
        self.registry.login(&self.config.credentials).await?;
        self.registry.push(&image).await?;
        info!(job = %job.name, image = %image, "image published");
        Ok(image)
    }
}

impl fmt::Debug for Publisher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Publisher")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::StageGraph;
    use std::sync::Mutex;

    #[derive(Default)]
    struct RecordingRegistry {
        calls: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl Registry for RecordingRegistry {
        async fn login(&self, credentials: &RegistryCredentials) -> Result<()> {
            self.calls
                .lock()
                .unwrap()
                .push(format!("login {}", credentials.username));
            Ok(())
        }

        async fn push(&self, image_ref: &str) -> Result<()> {
            self.calls.lock().unwrap().push(format!("push {image_ref}"));
            Ok(())
        }
    }

    fn deploy_job(image: Option<&str>) -> JobSpec {
        let publish = match image {
            Some(i) => format!("  publish:\n    image: \"{i}\"\n"),
            None => "  publish: {}\n".to_string(),
        };
        let yaml = format!("deploy:\n  image: docker:24\n  script: [\"true\"]\n{publish}");
        StageGraph::from_yaml(&yaml)
            .unwrap()
            .job("deploy")
            .unwrap()
            .clone()
    }

    fn config() -> PublishConfig {
        PublishConfig::new(RegistryCredentials::new("registry.local", "ci", "s3cret"))
            .with_image_name("registry.local/app:latest")
    }

    #[test]
    fn debug_redacts_password() {
        let rendered = format!("{:?}", config());
        assert!(!rendered.contains("s3cret"));
        assert!(rendered.contains("<redacted>"));
    }

    #[test]
    fn from_env_requires_both_credentials() {
        let none = PublishConfig::from_lookup(|_| None).unwrap();
        assert!(none.is_none());

        let partial = PublishConfig::from_lookup(|k| {
            (k == "GANTRY_REGISTRY_USER").then(|| "ci".to_string())
        });
        assert!(matches!(partial, Err(CiError::Config(_))));

        let full = PublishConfig::from_lookup(|k| match k {
            "GANTRY_REGISTRY" => Some("registry.local".to_string()),
            "GANTRY_REGISTRY_USER" => Some("ci".to_string()),
            "GANTRY_REGISTRY_PASSWORD" => Some("pw".to_string()),
            "GANTRY_IMAGE_NAME" => Some("registry.local/app".to_string()),
            _ => None,
        })
        .unwrap()
        .unwrap();
        assert_eq!(full.credentials.registry, "registry.local");
        assert_eq!(full.credentials.password(), "pw");
        assert_eq!(full.image_name.as_deref(), Some("registry.local/app"));
    }

    #[test]
    fn resolves_declared_image_with_variables() {
        let publisher = Publisher::new(Arc::new(RecordingRegistry::default()), config());
        let mut vars = BTreeMap::new();
        vars.insert("TAG".to_string(), "v2".to_string());
        let job = deploy_job(Some("registry.local/web:${TAG}"));
        assert_eq!(
            publisher.resolve_image(&job, &vars).unwrap(),
            "registry.local/web:v2"
        );
    }

    #[test]
    fn falls_back_to_configured_image() {
        let publisher = Publisher::new(Arc::new(RecordingRegistry::default()), config());
        let job = deploy_job(None);
        assert_eq!(
            publisher.resolve_image(&job, &BTreeMap::new()).unwrap(),
            "registry.local/app:latest"
        );
    }

    #[test]
    fn empty_image_is_publish_error() {
        let cfg = PublishConfig::new(RegistryCredentials::new("", "ci", "pw"));
        let publisher = Publisher::new(Arc::new(RecordingRegistry::default()), cfg);
        let err = publisher.resolve_image(&deploy_job(None), &BTreeMap::new()).unwrap_err();
        assert!(matches!(err, CiError::Publish(_)));
    }

    #[tokio::test]
    async fn publish_logs_in_then_pushes() {
        let registry = Arc::new(RecordingRegistry::default());
        let publisher = Publisher::new(registry.clone(), config());
        let pushed = publisher
            .publish(&deploy_job(None), &BTreeMap::new())
            .await
            .unwrap();
        assert_eq!(pushed, "registry.local/app:latest");
        assert_eq!(
            *registry.calls.lock().unwrap(),
            vec!["login ci", "push registry.local/app:latest"]
        );
    }
}
