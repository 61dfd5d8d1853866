//! Dependency resolution: hands a job the artifacts of the jobs it depends on.

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;

use gantry_state::{ArtifactMeta, ArtifactStore};
use tracing::debug;

use crate::error::{CiError, Result};
use crate::graph::JobSpec;
use crate::run::JobStatus;

#[derive(Clone)]
pub struct DependencyResolver {
    store: Arc<dyn ArtifactStore>,
}

impl DependencyResolver {
    pub fn new(store: Arc<dyn ArtifactStore>) -> Self {
        Self { store }
    }

    /// Every dependency must have succeeded in this run.
    ///
    /// Runs before the job's environment is provisioned, so a job with an
    /// unmet dependency never executes a script line.
    pub fn check(job: &JobSpec, statuses: &HashMap<String, JobStatus>) -> Result<()> {
        for dep in &job.dependencies {
            match statuses.get(dep) {
                Some(JobStatus::Succeeded) => {}
                other => {
                    let state = other
                        .map(|s| s.to_string())
                        .unwrap_or_else(|| "not run".to_string());
                    return Err(CiError::MissingArtifact {
                        job: job.name.clone(),
                        dependency: dep.clone(),
                        reason: format!("dependency is {state}"),
                    });
                }
            }
        }
        Ok(())
    }

    /// Copy each dependency's artifacts into `workspace` at the relative
    /// paths they were produced under. Returns the number of files written.
    pub async fn fetch(
        &self,
        job: &JobSpec,
        produced: &HashMap<String, Vec<ArtifactMeta>>,
        workspace: &Path,
    ) -> Result<usize> {
        let mut written = 0;
        for dep in &job.dependencies {
            let artifacts = produced.get(dep).map(Vec::as_slice).unwrap_or_default();
            for meta in artifacts {
                let data = self.store.get(&meta.key).await?;
                let target = workspace.join(&meta.key.path);
                if let Some(parent) = target.parent() {
                    tokio::fs::create_dir_all(parent).await?;
                }
                tokio::fs::write(&target, &data).await?;
                written += 1;
            }
            debug!(job = %job.name, dependency = %dep, files = artifacts.len(), "dependency artifacts fetched");
        }
        Ok(written)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::StageGraph;
    use chrono::{Duration, Utc};
    use gantry_state::fakes::MemoryArtifactStore;
    use gantry_state::{ArtifactKey, Retention, RunId};

    fn test_job() -> JobSpec {
        let yaml = r#"
default:
  image: alpine
build:
  stage: build
  script: [make]
test:
  stage: test
  dependencies: [build]
  script: [make test]
"#;
        StageGraph::from_yaml(yaml).unwrap().job("test").unwrap().clone()
    }

    #[test]
    fn check_requires_success() {
        let job = test_job();
        let mut statuses = HashMap::new();
        statuses.insert("build".to_string(), JobStatus::Succeeded);
        assert!(DependencyResolver::check(&job, &statuses).is_ok());

        for status in [JobStatus::Failed, JobStatus::Skipped, JobStatus::Canceled] {
            statuses.insert("build".to_string(), status);
            let err = DependencyResolver::check(&job, &statuses).unwrap_err();
            assert!(matches!(err, CiError::MissingArtifact { ref dependency, .. } if dependency == "build"));
        }

        let err = DependencyResolver::check(&job, &HashMap::new()).unwrap_err();
        assert!(err.to_string().contains("not run"));
    }

    #[tokio::test]
    async fn fetch_writes_same_relative_paths() {
        let store = Arc::new(MemoryArtifactStore::new());
        let run = RunId("r1".to_string());
        let key = ArtifactKey::new(&run, "build", "frontend/index.html").unwrap();
        let meta = store.put(&key, b"<html/>", Retention::hours(1)).await.unwrap();

        let mut produced = HashMap::new();
        produced.insert("build".to_string(), vec![meta]);

        let workspace = tempfile::tempdir().unwrap();
        let resolver = DependencyResolver::new(store);
        let written = resolver
            .fetch(&test_job(), &produced, workspace.path())
            .await
            .unwrap();
        assert_eq!(written, 1);
        let copied = std::fs::read(workspace.path().join("frontend/index.html")).unwrap();
        assert_eq!(copied, b"<html/>");
    }

    #[tokio::test]
    async fn expired_dependency_artifact_surfaces_expired() {
        let store = Arc::new(MemoryArtifactStore::new());
        let run = RunId("r1".to_string());
        let key = ArtifactKey::new(&run, "build", "frontend").unwrap();
        let meta = store.put(&key, b"x", Retention::Seconds(1)).await.unwrap();
        store.prune(Utc::now() + Duration::seconds(5)).await.unwrap();

        let mut produced = HashMap::new();
        produced.insert("build".to_string(), vec![meta]);

        let workspace = tempfile::tempdir().unwrap();
        let err = DependencyResolver::new(store)
            .fetch(&test_job(), &produced, workspace.path())
            .await
            .unwrap_err();
        assert!(matches!(err, CiError::Expired { .. }));
    }
}
