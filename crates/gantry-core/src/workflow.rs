//! Workflow definition types.
//!
//! These types represent the declarative workflow configuration: triggers,
//! the concurrency policy, and the job templates with their ordered steps.

use crate::{Error, Result};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap, HashSet};

/// Ordered matrix axes: axis name to the list of values, in declaration order.
pub type MatrixAxes = serde_json::Map<String, serde_json::Value>;

/// A single matrix combination (or an include/exclude entry).
pub type MatrixPoint = serde_json::Map<String, serde_json::Value>;

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct WorkflowDefinition {
    pub name: String,
    #[serde(default)]
    pub triggers: Vec<TriggerConfig>,
    #[serde(default)]
    pub concurrency: Option<ConcurrencyConfig>,
    /// Environment applied to every step of every job.
    #[serde(default)]
    pub env: HashMap<String, String>,
    pub jobs: Vec<JobTemplate>,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct TriggerConfig {
    #[serde(rename = "type")]
    pub kind: TriggerKind,
    /// Branch globs. Empty matches every branch.
    #[serde(default)]
    pub branches: Vec<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum TriggerKind {
    Push,
    PullRequest,
    WorkflowDispatch,
}

impl TriggerKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            TriggerKind::Push => "push",
            TriggerKind::PullRequest => "pull_request",
            TriggerKind::WorkflowDispatch => "workflow_dispatch",
        }
    }
}

impl std::fmt::Display for TriggerKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct ConcurrencyConfig {
    /// Group key template, e.g. `${{ workflow }}-${{ ref_name }}-${{ pr_number || sha }}`.
    pub group: String,
    #[serde(default)]
    pub cancel_in_progress: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct JobTemplate {
    pub name: String,
    #[serde(default)]
    pub strategy: Strategy,
    /// Capability labels an agent must carry. May reference `${{ matrix.* }}`.
    #[serde(default, rename = "runs_on")]
    pub required_labels: BTreeSet<String>,
    #[serde(default)]
    pub env: HashMap<String, String>,
    pub steps: Vec<StepSpec>,
    #[serde(default = "default_true")]
    pub fail_fast: bool,
    #[serde(default)]
    pub max_parallel: Option<u32>,
    #[serde(default)]
    pub cache: Vec<CacheConfig>,
}

fn default_true() -> bool {
    true
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, JsonSchema)]
pub struct Strategy {
    #[serde(default, alias = "matrix")]
    pub axes: MatrixAxes,
    #[serde(default)]
    pub include: Vec<MatrixPoint>,
    #[serde(default)]
    pub exclude: Vec<MatrixPoint>,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct StepSpec {
    pub name: String,
    /// Opaque command handed to the command runner.
    #[serde(alias = "run")]
    pub command: String,
    #[serde(default)]
    pub env: HashMap<String, String>,
    #[serde(default, alias = "retry")]
    pub retry_policy: Option<RetryPolicy>,
    #[serde(default)]
    pub continue_on_error: bool,
    #[serde(default)]
    pub timeout_seconds: Option<u64>,
    /// Cache scopes this step depends on; looked up before the step runs.
    #[serde(default)]
    pub cache: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct RetryPolicy {
    /// Total attempts, including the first one.
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_base_delay_ms")]
    pub base_delay_ms: u64,
}

fn default_max_attempts() -> u32 {
    3
}

fn default_base_delay_ms() -> u64 {
    1000
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct CacheConfig {
    /// Scope name; steps refer to the cache by this name.
    pub scope: String,
    /// Key prefix template, e.g. `cargo-${{ matrix.os }}`.
    pub key: String,
    /// Files (relative to the workspace) whose contents feed the key.
    #[serde(default)]
    pub hash_files: Vec<String>,
    /// Paths (relative to the workspace) stored in the payload.
    #[serde(default)]
    pub paths: Vec<String>,
}

impl WorkflowDefinition {
    /// Check structural invariants the engine relies on.
    pub fn validate(&self) -> Result<()> {
        if self.name.trim().is_empty() {
            return Err(Error::InvalidWorkflow("workflow name is empty".to_string()));
        }
        if self.jobs.is_empty() {
            return Err(Error::InvalidWorkflow("workflow declares no jobs".to_string()));
        }

        let mut job_names = HashSet::new();
        for job in &self.jobs {
            if !job_names.insert(job.name.as_str()) {
                return Err(Error::InvalidWorkflow(format!(
                    "duplicate job name: {}",
                    job.name
                )));
            }
            job.validate()?;
        }
        Ok(())
    }

    pub fn job(&self, name: &str) -> Option<&JobTemplate> {
        self.jobs.iter().find(|j| j.name == name)
    }
}

impl JobTemplate {
    fn validate(&self) -> Result<()> {
        if self.steps.is_empty() {
            return Err(Error::InvalidWorkflow(format!(
                "job {} declares no steps",
                self.name
            )));
        }
        if self.max_parallel == Some(0) {
            return Err(Error::InvalidWorkflow(format!(
                "job {}: max_parallel must be at least 1",
                self.name
            )));
        }

        for (axis, values) in &self.strategy.axes {
            match values.as_array() {
                Some(list) if !list.is_empty() => {}
                _ => {
                    return Err(Error::InvalidWorkflow(format!(
                        "job {}: matrix axis {} must be a non-empty list",
                        self.name, axis
                    )));
                }
            }
        }

        let scopes: HashSet<&str> = self.cache.iter().map(|c| c.scope.as_str()).collect();
        let mut step_names = HashSet::new();
        for step in &self.steps {
            if !step_names.insert(step.name.as_str()) {
                return Err(Error::InvalidWorkflow(format!(
                    "job {}: duplicate step name {}",
                    self.name, step.name
                )));
            }
            if let Some(policy) = &step.retry_policy
                && policy.max_attempts == 0
            {
                return Err(Error::InvalidWorkflow(format!(
                    "job {} step {}: max_attempts must be at least 1",
                    self.name, step.name
                )));
            }
            if let Some(missing) = step.cache.iter().find(|s| !scopes.contains(s.as_str())) {
                return Err(Error::InvalidWorkflow(format!(
                    "job {} step {}: unknown cache scope {}",
                    self.name, step.name, missing
                )));
            }
        }
        Ok(())
    }

    pub fn cache_config(&self, scope: &str) -> Option<&CacheConfig> {
        self.cache.iter().find(|c| c.scope == scope)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn step(name: &str) -> StepSpec {
        StepSpec {
            name: name.to_string(),
            command: "true".to_string(),
            env: HashMap::new(),
            retry_policy: None,
            continue_on_error: false,
            timeout_seconds: None,
            cache: vec![],
        }
    }

    fn job(name: &str, steps: Vec<StepSpec>) -> JobTemplate {
        JobTemplate {
            name: name.to_string(),
            strategy: Strategy::default(),
            required_labels: BTreeSet::new(),
            env: HashMap::new(),
            steps,
            fail_fast: true,
            max_parallel: None,
            cache: vec![],
        }
    }

    fn workflow(jobs: Vec<JobTemplate>) -> WorkflowDefinition {
        WorkflowDefinition {
            name: "ci".to_string(),
            triggers: vec![],
            concurrency: None,
            env: HashMap::new(),
            jobs,
        }
    }

    #[test]
    fn test_validate_accepts_simple_workflow() {
        let wf = workflow(vec![job("fmt", vec![step("check")])]);
        assert!(wf.validate().is_ok());
    }

    #[test]
    fn test_validate_rejects_duplicate_jobs() {
        let wf = workflow(vec![
            job("fmt", vec![step("check")]),
            job("fmt", vec![step("check")]),
        ]);
        assert!(matches!(wf.validate(), Err(Error::InvalidWorkflow(_))));
    }

    #[test]
    fn test_validate_rejects_empty_steps() {
        let wf = workflow(vec![job("fmt", vec![])]);
        assert!(wf.validate().is_err());
    }

    #[test]
    fn test_validate_rejects_unknown_cache_scope() {
        let mut s = step("build");
        s.cache = vec!["cargo".to_string()];
        let wf = workflow(vec![job("build", vec![s])]);
        let err = wf.validate().unwrap_err();
        assert!(err.to_string().contains("unknown cache scope"));
    }

    #[test]
    fn test_validate_rejects_scalar_axis() {
        let mut j = job("test", vec![step("run")]);
        j.strategy
            .axes
            .insert("os".to_string(), serde_json::json!("linux"));
        assert!(workflow(vec![j]).validate().is_err());
    }
}
