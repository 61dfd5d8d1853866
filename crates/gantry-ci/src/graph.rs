//! Stage graph: the validated, ordered execution plan of a pipeline.
//!
//! Stages run in declaration order. A job may depend on jobs of an earlier
//! stage or of its own stage; same-stage dependencies split the stage into
//! waves that run one after another.

use std::collections::{BTreeMap, HashMap, HashSet};

use gantry_state::{ContentDigest, Retention};
use indexmap::IndexMap;
use serde::Serialize;

use crate::definition::{parse_expire_in, PipelineDef, PublishDef, DEFAULT_JOB_STAGE};
use crate::error::{CiError, Result};
use crate::trigger::TriggerPredicate;

/// A job after defaults have been applied and references checked.
#[derive(Debug, Clone)]
pub struct JobSpec {
    pub name: String,
    pub stage: String,
    pub image: String,
    pub script: Vec<String>,
    /// Pipeline variables overlaid with the job's own.
    pub variables: BTreeMap<String, String>,
    pub artifact_paths: Vec<String>,
    /// `None` falls back to the runner's default retention.
    pub retention: Option<Retention>,
    pub dependencies: Vec<String>,
    pub trigger: Option<TriggerPredicate>,
    pub timeout_secs: Option<u64>,
    pub publish: Option<PublishDef>,
}

/// One stage of the plan.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StagePlan {
    pub name: String,
    /// Job names grouped into waves; jobs in a wave run concurrently.
    pub waves: Vec<Vec<String>>,
}

impl StagePlan {
    pub fn job_names(&self) -> impl Iterator<Item = &String> {
        self.waves.iter().flatten()
    }
}

/// Validated pipeline.
#[derive(Debug, Clone)]
pub struct StageGraph {
    digest: ContentDigest,
    stages: Vec<StagePlan>,
    jobs: IndexMap<String, JobSpec>,
}

impl StageGraph {
    /// Validate a definition and build its execution plan.
    ///
    /// Every problem found is reported in a single `Validation` error.
    pub fn build(def: &PipelineDef) -> Result<Self> {
        let mut errors = Vec::new();

        if def.stages.is_empty() {
            errors.push("pipeline declares no stages".to_string());
        }
        let mut stage_pos: HashMap<&str, usize> = HashMap::new();
        for (idx, stage) in def.stages.iter().enumerate() {
            if stage.trim().is_empty() {
                errors.push(format!("stage #{} has an empty name", idx + 1));
            } else if stage_pos.insert(stage.as_str(), idx).is_some() {
                errors.push(format!("stage '{stage}' is declared more than once"));
            }
        }

        let mut jobs: IndexMap<String, JobSpec> = IndexMap::new();
        for (name, job) in def.runnable_jobs() {
            let stage = job
                .stage
                .clone()
                .unwrap_or_else(|| DEFAULT_JOB_STAGE.to_string());
            if !stage_pos.contains_key(stage.as_str()) {
                errors.push(format!("job '{name}' uses undeclared stage '{stage}'"));
            }

            let image = job.image.clone().or_else(|| def.default.image.clone());
            if image.is_none() {
                errors.push(format!("job '{name}' has no image and no default image is set"));
            }
            if job.script.is_empty() {
                errors.push(format!("job '{name}' has an empty script"));
            }

            let (artifact_paths, retention) = match &job.artifacts {
                Some(artifacts) => {
                    let retention = match artifacts.expire_in.as_deref() {
                        Some(raw) => match parse_expire_in(raw) {
                            Ok(r) => Some(r),
                            Err(e) => {
                                errors.push(format!("job '{name}': {e}"));
                                None
                            }
                        },
                        None => None,
                    };
                    for path in &artifacts.paths {
                        if let Err(e) = gantry_state::normalize_artifact_path(path) {
                            errors.push(format!("job '{name}': {e}"));
                        }
                    }
                    (artifacts.paths.clone(), retention)
                }
                None => (Vec::new(), None),
            };

            let trigger = match TriggerPredicate::parse(&job.only, &job.except) {
                Ok(t) => t,
                Err(e) => {
                    errors.push(format!("job '{name}': {e}"));
                    None
                }
            };

            let mut variables = def.variables.clone();
            variables.extend(job.variables.clone());

            jobs.insert(
                name.clone(),
                JobSpec {
                    name: name.clone(),
                    stage,
                    image: image.unwrap_or_default(),
                    script: job.script.clone(),
                    variables,
                    artifact_paths,
                    retention,
                    dependencies: job.dependencies.clone(),
                    trigger,
                    timeout_secs: job.timeout,
                    publish: job.publish.clone(),
                },
            );
        }

        // Dependencies may only point to an earlier or the same stage.
        for job in jobs.values() {
            let own = stage_pos.get(job.stage.as_str()).copied();
            for dep in &job.dependencies {
                if dep == &job.name {
                    errors.push(format!("job '{}' depends on itself", job.name));
                    continue;
                }
                let Some(target) = jobs.get(dep) else {
                    errors.push(format!("job '{}' depends on unknown job '{dep}'", job.name));
                    continue;
                };
                let theirs = stage_pos.get(target.stage.as_str()).copied();
                if let (Some(own), Some(theirs)) = (own, theirs) {
                    if theirs > own {
                        errors.push(format!(
                            "job '{}' in stage '{}' depends on '{dep}' in later stage '{}'",
                            job.name, job.stage, target.stage
                        ));
                    }
                }
            }
        }

        if !errors.is_empty() {
            return Err(CiError::Validation(errors.join("; ")));
        }

        let mut stages = Vec::with_capacity(def.stages.len());
        for stage in &def.stages {
            let members: Vec<&JobSpec> = jobs.values().filter(|j| &j.stage == stage).collect();
            stages.push(StagePlan {
                name: stage.clone(),
                waves: plan_waves(&members)?,
            });
        }

        Ok(Self {
            digest: def.digest()?,
            stages,
            jobs,
        })
    }

    /// Parse and validate YAML in one step.
    pub fn from_yaml(source: &str) -> Result<Self> {
        Self::build(&PipelineDef::from_yaml(source)?)
    }

    /// Stage names in execution order.
    pub fn execution_order(&self) -> Vec<&str> {
        self.stages.iter().map(|s| s.name.as_str()).collect()
    }

    pub fn stages(&self) -> &[StagePlan] {
        &self.stages
    }

    pub fn job(&self, name: &str) -> Option<&JobSpec> {
        self.jobs.get(name)
    }

    /// Jobs in declaration order.
    pub fn jobs(&self) -> impl Iterator<Item = &JobSpec> {
        self.jobs.values()
    }

    /// Jobs in execution order: by stage, then wave, then declaration.
    pub fn jobs_in_order(&self) -> Vec<&JobSpec> {
        self.stages
            .iter()
            .flat_map(|s| s.job_names())
            .filter_map(|name| self.jobs.get(name))
            .collect()
    }

    /// Digest of the definition this graph was built from.
    pub fn digest(&self) -> &ContentDigest {
        &self.digest
    }
}

/// Split the jobs of one stage into waves by their same-stage dependencies.
fn plan_waves(members: &[&JobSpec]) -> Result<Vec<Vec<String>>> {
    let in_stage: HashSet<&str> = members.iter().map(|j| j.name.as_str()).collect();
    let mut placed: HashSet<&str> = HashSet::new();
    let mut waves = Vec::new();

    while placed.len() < members.len() {
        let wave: Vec<&str> = members
            .iter()
            .filter(|j| !placed.contains(j.name.as_str()))
            .filter(|j| {
                j.dependencies
                    .iter()
                    .filter(|d| in_stage.contains(d.as_str()))
                    .all(|d| placed.contains(d.as_str()))
            })
            .map(|j| j.name.as_str())
            .collect();

        if wave.is_empty() {
            let mut stuck: Vec<&str> = members
                .iter()
                .map(|j| j.name.as_str())
                .filter(|n| !placed.contains(n))
                .collect();
            stuck.sort_unstable();
            return Err(CiError::Validation(format!(
                "dependency cycle between jobs: {}",
                stuck.join(", ")
            )));
        }

        placed.extend(wave.iter().copied());
        waves.push(wave.into_iter().map(str::to_string).collect());
    }

    Ok(waves)
}
