//! Trigger gate: decides whether a job runs for a given event.

use std::collections::BTreeMap;

use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::error::{CiError, Result};
use crate::graph::JobSpec;

/// The event that created a run.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TriggerEvent {
    /// Branch or tag name, e.g. `main` or `v1.2.0`.
    pub git_ref: String,

    /// Commit the event points at.
    pub sha: Option<String>,

    /// Whether `git_ref` names a tag.
    pub is_tag: bool,

    /// Extra variables supplied with the event.
    pub variables: BTreeMap<String, String>,
}

impl TriggerEvent {
    /// A push to a branch.
    pub fn branch(name: impl Into<String>) -> Self {
        Self {
            git_ref: name.into(),
            ..Default::default()
        }
    }

    /// A pushed tag.
    pub fn tag(name: impl Into<String>) -> Self {
        Self {
            git_ref: name.into(),
            is_tag: true,
            ..Default::default()
        }
    }

    pub fn with_sha(mut self, sha: impl Into<String>) -> Self {
        self.sha = Some(sha.into());
        self
    }

    pub fn with_variable(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.variables.insert(key.into(), value.into());
        self
    }
}

/// One entry of an `only` / `except` list.
#[derive(Debug, Clone)]
pub enum RefPattern {
    /// Exact ref name.
    Exact(String),
    /// `/regex/`
    Regex(Regex),
    /// Keyword `branches`: any branch.
    Branches,
    /// Keyword `tags`: any tag.
    Tags,
}

impl RefPattern {
    pub fn parse(raw: &str) -> Result<Self> {
        match raw {
            "branches" => return Ok(RefPattern::Branches),
            "tags" => return Ok(RefPattern::Tags),
            _ => {}
        }
        if raw.len() >= 2 && raw.starts_with('/') && raw.ends_with('/') {
            let body = &raw[1..raw.len() - 1];
            let re = Regex::new(body).map_err(|e| {
                CiError::Validation(format!("invalid ref pattern '{raw}': {e}"))
            })?;
            return Ok(RefPattern::Regex(re));
        }
        if raw.is_empty() {
            return Err(CiError::Validation("empty ref pattern".to_string()));
        }
        Ok(RefPattern::Exact(raw.to_string()))
    }

    pub fn matches(&self, event: &TriggerEvent) -> bool {
        match self {
            RefPattern::Exact(name) => *name == event.git_ref,
            RefPattern::Regex(re) => re.is_match(&event.git_ref),
            RefPattern::Branches => !event.is_tag,
            RefPattern::Tags => event.is_tag,
        }
    }
}

/// A job's trigger predicate.
///
/// `only` must match at least once when non-empty; `except` must not match.
#[derive(Debug, Clone, Default)]
pub struct TriggerPredicate {
    pub only: Vec<RefPattern>,
    pub except: Vec<RefPattern>,
}

impl TriggerPredicate {
    /// Build a predicate, or `None` when both lists are empty.
    pub fn parse(only: &[String], except: &[String]) -> Result<Option<Self>> {
        if only.is_empty() && except.is_empty() {
            return Ok(None);
        }
        let only = only
            .iter()
            .map(|p| RefPattern::parse(p))
            .collect::<Result<Vec<_>>>()?;
        let except = except
            .iter()
            .map(|p| RefPattern::parse(p))
            .collect::<Result<Vec<_>>>()?;
        Ok(Some(Self { only, except }))
    }

    pub fn evaluate(&self, event: &TriggerEvent) -> bool {
        let included = self.only.is_empty() || self.only.iter().any(|p| p.matches(event));
        let excluded = self.except.iter().any(|p| p.matches(event));
        included && !excluded
    }
}

/// Evaluates trigger predicates.
pub struct TriggerGate;

impl TriggerGate {
    /// Whether `job` runs for `event`. Jobs without a predicate always run.
    pub fn allows(job: &JobSpec, event: &TriggerEvent) -> bool {
        job.trigger
            .as_ref()
            .map(|predicate| predicate.evaluate(event))
            .unwrap_or(true)
    }
}
