//! Pipeline definition file format.
//!
//! A GitLab-flavoured YAML document: the reserved top-level keys `stages`,
//! `variables` and `default`, and every other top-level key is a job.
//! Jobs keep their declaration order.

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::OnceLock;

use gantry_state::{ContentDigest, Retention, MAX_RETENTION_SECS};
use indexmap::IndexMap;
use regex::Regex;
use serde::{Deserialize, Deserializer, Serialize};

use crate::error::{CiError, Result};

/// Stages used when a definition does not declare any.
pub const DEFAULT_STAGES: [&str; 3] = ["build", "test", "deploy"];

/// Stage a job lands in when it does not name one.
pub const DEFAULT_JOB_STAGE: &str = "test";

fn default_stages() -> Vec<String> {
    DEFAULT_STAGES.iter().map(|s| s.to_string()).collect()
}

/// A parsed pipeline definition, before validation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PipelineDef {
    /// Ordered stage names.
    #[serde(default = "default_stages")]
    pub stages: Vec<String>,

    /// Variables visible to every job.
    #[serde(default, deserialize_with = "scalar_map")]
    pub variables: BTreeMap<String, String>,

    /// Defaults applied to jobs that leave a field unset.
    #[serde(default)]
    pub default: DefaultsDef,

    /// Jobs in declaration order. Names starting with `.` are templates
    /// and never run.
    #[serde(flatten)]
    pub jobs: IndexMap<String, JobDef>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DefaultsDef {
    pub image: Option<String>,
}

/// One job as written in the definition file.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct JobDef {
    pub stage: Option<String>,

    pub image: Option<String>,

    #[serde(default)]
    pub script: Vec<String>,

    #[serde(default, deserialize_with = "scalar_map")]
    pub variables: BTreeMap<String, String>,

    pub artifacts: Option<ArtifactsDef>,

    /// Jobs whose artifacts this job consumes.
    #[serde(default)]
    pub dependencies: Vec<String>,

    /// Ref patterns that must match for the job to run.
    #[serde(default)]
    pub only: Vec<String>,

    /// Ref patterns that prevent the job from running.
    #[serde(default)]
    pub except: Vec<String>,

    /// Job timeout in seconds.
    pub timeout: Option<u64>,

    pub publish: Option<PublishDef>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ArtifactsDef {
    #[serde(default)]
    pub paths: Vec<String>,

    /// e.g. `1 hour`, `30 mins`, `2 days`, `never`.
    pub expire_in: Option<String>,
}

/// Publish the image built by the job to a registry once its script succeeds.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PublishDef {
    /// Image reference to push; `${VAR}` is expanded. Falls back to the
    /// image name configured for the run.
    pub image: Option<String>,
}

impl PipelineDef {
    /// Parse a YAML definition.
    pub fn from_yaml(source: &str) -> Result<Self> {
        let def: PipelineDef = serde_yaml::from_str(source)?;
        Ok(def)
    }

    /// Read and parse a YAML definition file.
    pub fn from_path(path: &Path) -> Result<Self> {
        let source = std::fs::read_to_string(path).map_err(|e| {
            CiError::Definition(format!("cannot read {}: {}", path.display(), e))
        })?;
        Self::from_yaml(&source)
    }

    /// Digest of the canonical JSON form. Identical definitions share a digest.
    pub fn digest(&self) -> Result<ContentDigest> {
        let canonical =
            serde_json::to_vec(self).map_err(|e| CiError::Definition(e.to_string()))?;
        Ok(ContentDigest::from_bytes(&canonical))
    }

    /// Jobs that will actually run (templates excluded), in declaration order.
    pub fn runnable_jobs(&self) -> impl Iterator<Item = (&String, &JobDef)> {
        self.jobs.iter().filter(|(name, _)| !name.starts_with('.'))
    }
}

/// Accept any YAML scalar as a variable value (`PORT: 8080` is common).
fn scalar_map<'de, D>(deserializer: D) -> std::result::Result<BTreeMap<String, String>, D::Error>
where
    D: Deserializer<'de>,
{
    use serde::de::Error;

    let raw = Option::<BTreeMap<String, serde_yaml::Value>>::deserialize(deserializer)?;
    let mut out = BTreeMap::new();
    for (key, value) in raw.unwrap_or_default() {
        let text = match value {
            serde_yaml::Value::String(s) => s,
            serde_yaml::Value::Number(n) => n.to_string(),
            serde_yaml::Value::Bool(b) => b.to_string(),
            serde_yaml::Value::Null => String::new(),
            _ => {
                return Err(D::Error::custom(format!(
                    "variable '{key}' must be a scalar"
                )))
            }
        };
        out.insert(key, text);
    }
    Ok(out)
}

/// Parse an `expire_in` value.
///
/// Accepts `never` or one or more `<n> <unit>` pairs such as `1 hour`,
/// `1h 30min` or `2 days`.
pub fn parse_expire_in(raw: &str) -> Result<Retention> {
    let text = raw.trim().to_ascii_lowercase();
    if text == "never" {
        return Ok(Retention::Never);
    }

    let invalid = || CiError::Validation(format!("invalid expire_in value: '{raw}'"));

    static PAIR: OnceLock<Regex> = OnceLock::new();
    let pair = PAIR.get_or_init(|| {
        Regex::new(r"(\d+)\s*([a-z]+)").expect("expire_in pattern is valid")
    });

    let mut total: i64 = 0;
    let mut consumed = 0;
    for caps in pair.captures_iter(&text) {
        let amount: i64 = caps[1].parse().map_err(|_| invalid())?;
        let unit_secs = match &caps[2] {
            "s" | "sec" | "secs" | "second" | "seconds" => 1,
            "m" | "min" | "mins" | "minute" | "minutes" => 60,
            "h" | "hr" | "hrs" | "hour" | "hours" => 3600,
            "d" | "day" | "days" => 86_400,
            "w" | "wk" | "wks" | "week" | "weeks" => 604_800,
            _ => return Err(invalid()),
        };
        total = total
            .checked_add(amount.checked_mul(unit_secs).ok_or_else(invalid)?)
            .ok_or_else(invalid)?;
        consumed += caps[0].len();
    }

    // Everything except separators must have been part of a pair.
    let significant = text
        .chars()
        .filter(|c| !c.is_whitespace() && *c != ',')
        .count();
    let matched: usize = pair
        .find_iter(&text)
        .map(|m| m.as_str().chars().filter(|c| !c.is_whitespace()).count())
        .sum();
    if consumed == 0 || matched != significant || total <= 0 {
        return Err(invalid());
    }
    if total > MAX_RETENTION_SECS {
        return Err(CiError::Validation(format!(
            "expire_in value '{raw}' exceeds the 100 year maximum"
        )));
    }
    Ok(Retention::Seconds(total))
}

/// Expand `${NAME}` and `$NAME` references. Unknown names expand to "".
pub fn expand_vars(template: &str, vars: &BTreeMap<String, String>) -> String {
    static VAR: OnceLock<Regex> = OnceLock::new();
    let var = VAR.get_or_init(|| {
        Regex::new(r"\$\{([A-Za-z_][A-Za-z0-9_]*)\}|\$([A-Za-z_][A-Za-z0-9_]*)")
            .expect("variable pattern is valid")
    });
    var.replace_all(template, |caps: &regex::Captures<'_>| {
        let name = caps
            .get(1)
            .or_else(|| caps.get(2))
            .map(|m| m.as_str())
            .unwrap_or_default();
        vars.get(name).cloned().unwrap_or_default()
    })
    .into_owned()
}

#[cfg(test)]
mod tests {
    use super::*;

    const FRONTEND: &str = r#"
stages: [build, test, deploy]
variables:
  NODE_ENV: production
  PORT: 8080
default:
  image: node:20
build-frontend:
  stage: build
  script:
    - npm ci
    - npm run build
  artifacts:
    paths: [frontend]
    expire_in: 1 hour
test-frontend:
  stage: test
  dependencies: [build-frontend]
  script: [npm test]
deploy-frontend:
  stage: deploy
  image: docker:24
  script: ["docker build -t ${IMAGE_NAME} ."]
  only: [main]
  publish:
    image: ${IMAGE_NAME}
.template:
  script: [echo hidden]
"#;

    #[test]
    fn parses_jobs_in_declaration_order() {
        let def = PipelineDef::from_yaml(FRONTEND).unwrap();
        let names: Vec<&str> = def.runnable_jobs().map(|(n, _)| n.as_str()).collect();
        assert_eq!(names, vec!["build-frontend", "test-frontend", "deploy-frontend"]);
        assert_eq!(def.jobs.len(), 4);
        assert_eq!(def.default.image.as_deref(), Some("node:20"));
        assert_eq!(def.variables["PORT"], "8080");
    }

    #[test]
    fn parses_job_fields() {
        let def = PipelineDef::from_yaml(FRONTEND).unwrap();
        let build = &def.jobs["build-frontend"];
        assert_eq!(build.stage.as_deref(), Some("build"));
        assert_eq!(build.script, vec!["npm ci", "npm run build"]);
        let artifacts = build.artifacts.as_ref().unwrap();
        assert_eq!(artifacts.paths, vec!["frontend"]);
        assert_eq!(artifacts.expire_in.as_deref(), Some("1 hour"));

        let deploy = &def.jobs["deploy-frontend"];
        assert_eq!(deploy.only, vec!["main"]);
        assert!(deploy.publish.is_some());
    }

    #[test]
    fn stages_default_when_omitted() {
        let def = PipelineDef::from_yaml("job:\n  script: [\"true\"]\n").unwrap();
        assert_eq!(def.stages, vec!["build", "test", "deploy"]);
    }

    #[test]
    fn malformed_yaml_is_definition_error() {
        let err = PipelineDef::from_yaml("stages: [build\n").unwrap_err();
        assert!(matches!(err, CiError::Definition(_)));
    }

    #[test]
    fn digest_is_stable_and_content_sensitive() {
        let a = PipelineDef::from_yaml(FRONTEND).unwrap();
        let b = PipelineDef::from_yaml(FRONTEND).unwrap();
        assert_eq!(a.digest().unwrap(), b.digest().unwrap());

        let c = PipelineDef::from_yaml(&FRONTEND.replace("npm test", "npm run test")).unwrap();
        assert_ne!(a.digest().unwrap(), c.digest().unwrap());
    }

    #[test]
    fn expire_in_units() {
        assert_eq!(parse_expire_in("1 hour").unwrap(), Retention::Seconds(3600));
        assert_eq!(parse_expire_in("30 mins").unwrap(), Retention::Seconds(1800));
        assert_eq!(parse_expire_in("2 days").unwrap(), Retention::Seconds(172_800));
        assert_eq!(parse_expire_in("1 week").unwrap(), Retention::Seconds(604_800));
        assert_eq!(parse_expire_in("1h 30min").unwrap(), Retention::Seconds(5400));
        assert_eq!(parse_expire_in("Never").unwrap(), Retention::Never);
    }

    #[test]
    fn expire_in_rejects_garbage() {
        assert!(parse_expire_in("soon").is_err());
        assert!(parse_expire_in("3 fortnights").is_err());
        assert!(parse_expire_in("0 hours").is_err());
        assert!(parse_expire_in("1 hour later").is_err());
    }

    #[test]
    fn expire_in_rejects_values_past_the_cap() {
        assert!(parse_expire_in("36500 days").is_ok());
        let err = parse_expire_in("100000000 weeks").unwrap_err();
        assert!(matches!(err, CiError::Validation(_)));
        assert!(err.to_string().contains("100 year"));
        assert!(parse_expire_in("36501 days").is_err());
    }

    #[test]
    fn expands_variables() {
        let mut vars = BTreeMap::new();
        vars.insert("IMAGE_NAME".to_string(), "registry.local/frontend".to_string());
        vars.insert("TAG".to_string(), "v1".to_string());
        assert_eq!(
            expand_vars("${IMAGE_NAME}:$TAG", &vars),
            "registry.local/frontend:v1"
        );
        assert_eq!(expand_vars("$MISSING/x", &vars), "/x");
    }
}
