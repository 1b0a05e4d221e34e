//! Run and execution types.

use crate::cache::CacheEntry;
use crate::ids::{AgentId, JobId, RunId};
use crate::interpolation::InterpolationContext;
use crate::workflow::{JobTemplate, MatrixPoint, TriggerKind};
use chrono::{DateTime, Utc};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;

/// Canonical, immutable description of one trigger occurrence.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct RunRequest {
    pub trigger_kind: TriggerKind,
    /// Fully qualified ref, e.g. `refs/heads/main` or `refs/pull/42/merge`.
    pub git_ref: String,
    /// Short ref name, e.g. `main` or `42/merge`.
    pub ref_name: String,
    pub pull_request_id: Option<u64>,
    pub commit_sha: String,
    pub dispatched_at: DateTime<Utc>,
}

impl RunRequest {
    /// Variables a concurrency group template may reference.
    pub fn interpolation_context(&self, workflow: &str) -> InterpolationContext {
        let mut ctx = InterpolationContext::new();
        ctx.variables.insert("workflow".to_string(), workflow.to_string());
        ctx.variables.insert("ref".to_string(), self.git_ref.clone());
        ctx.variables.insert("ref_name".to_string(), self.ref_name.clone());
        ctx.variables.insert("sha".to_string(), self.commit_sha.clone());
        ctx.variables.insert(
            "event_name".to_string(),
            self.trigger_kind.as_str().to_string(),
        );
        if let Some(pr) = self.pull_request_id {
            ctx.variables.insert("pr_number".to_string(), pr.to_string());
        }
        ctx
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Queued,
    Running,
    Success,
    Failure,
    Cancelled,
}

impl RunStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            RunStatus::Success | RunStatus::Failure | RunStatus::Cancelled
        )
    }

    /// Process exit code surfaced for a finished run.
    ///
    /// `0` success, `1` failure, `2` cancelled. Non-terminal states map to `1`.
    pub fn exit_code(&self) -> i32 {
        match self {
            RunStatus::Success => 0,
            RunStatus::Cancelled => 2,
            RunStatus::Failure | RunStatus::Queued | RunStatus::Running => 1,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum CancelReason {
    UserRequested,
    Superseded,
}

/// A job template bound to one concrete matrix point.
#[derive(Debug, Clone)]
pub struct JobInstance {
    pub id: JobId,
    pub template: Arc<JobTemplate>,
    /// Display name, e.g. `test (os=linux, arch=x86_64)`.
    pub name: String,
    pub index: usize,
    pub matrix: MatrixPoint,
    /// Template env with matrix values bound.
    pub env: HashMap<String, String>,
    pub required_labels: BTreeSet<String>,
}

impl JobInstance {
    pub fn template_name(&self) -> &str {
        &self.template.name
    }

    /// Matrix values rendered as strings.
    pub fn matrix_strings(&self) -> HashMap<String, String> {
        self.matrix
            .iter()
            .map(|(k, v)| (k.clone(), value_to_string(v)))
            .collect()
    }
}

/// Render a matrix value the way it is substituted into strings.
pub fn value_to_string(value: &serde_json::Value) -> String {
    match value {
        serde_json::Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    Success,
    Failure,
    TimedOut,
    Skipped,
    Cancelled,
}

impl StepStatus {
    pub fn is_success(&self) -> bool {
        matches!(self, StepStatus::Success)
    }

    /// Failure and timeout both count as a failed step.
    pub fn is_failure(&self) -> bool {
        matches!(self, StepStatus::Failure | StepStatus::TimedOut)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct StepResult {
    pub name: String,
    pub status: StepStatus,
    pub exit_code: Option<i32>,
    /// Number of times the command was executed.
    pub attempts: u32,
    pub duration_ms: u64,
    pub continue_on_error: bool,
    pub error: Option<String>,
}

impl StepResult {
    /// A step that never ran.
    pub fn not_run(name: impl Into<String>, status: StepStatus, continue_on_error: bool) -> Self {
        Self {
            name: name.into(),
            status,
            exit_code: None,
            attempts: 0,
            duration_ms: 0,
            continue_on_error,
            error: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Success,
    Failure,
    Cancelled,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct JobResult {
    pub job_id: JobId,
    pub template: String,
    pub name: String,
    pub matrix: MatrixPoint,
    pub agent: Option<AgentId>,
    pub status: JobStatus,
    pub steps: Vec<StepResult>,
    /// Job-level failure not tied to a step, e.g. a scheduling error.
    pub error: Option<String>,
    #[serde(default)]
    pub caches_restored: Vec<CacheEntry>,
    #[serde(default)]
    pub caches_saved: Vec<CacheEntry>,
    pub duration_ms: u64,
}

impl JobResult {
    /// Result for an instance that never reached an agent.
    pub fn unstarted(instance: &JobInstance, status: JobStatus, error: Option<String>) -> Self {
        let step_status = match status {
            JobStatus::Cancelled => StepStatus::Cancelled,
            JobStatus::Success | JobStatus::Failure => StepStatus::Skipped,
        };
        Self {
            job_id: instance.id,
            template: instance.template.name.clone(),
            name: instance.name.clone(),
            matrix: instance.matrix.clone(),
            agent: None,
            status,
            steps: instance
                .template
                .steps
                .iter()
                .map(|s| StepResult::not_run(&s.name, step_status, s.continue_on_error))
                .collect(),
            error,
            caches_restored: vec![],
            caches_saved: vec![],
            duration_ms: 0,
        }
    }

    /// The first non-ignorable step that failed or timed out.
    pub fn failed_step(&self) -> Option<&StepResult> {
        self.steps
            .iter()
            .find(|s| s.status.is_failure() && !s.continue_on_error)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct RunResult {
    pub run_id: RunId,
    pub workflow: String,
    pub group_key: String,
    pub job_results: Vec<JobResult>,
    pub overall_status: RunStatus,
    pub cancel_reason: Option<CancelReason>,
    pub started_at: DateTime<Utc>,
    pub completed_at: DateTime<Utc>,
}

impl RunResult {
    pub fn exit_code(&self) -> i32 {
        self.overall_status.exit_code()
    }

    pub fn count(&self, status: JobStatus) -> usize {
        self.job_results.iter().filter(|j| j.status == status).count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exit_codes_are_distinct() {
        assert_eq!(RunStatus::Success.exit_code(), 0);
        assert_eq!(RunStatus::Failure.exit_code(), 1);
        assert_eq!(RunStatus::Cancelled.exit_code(), 2);
    }

    #[test]
    fn test_group_context_includes_pr_number() {
        let request = RunRequest {
            trigger_kind: TriggerKind::PullRequest,
            git_ref: "refs/pull/7/merge".to_string(),
            ref_name: "7/merge".to_string(),
            pull_request_id: Some(7),
            commit_sha: "abc".to_string(),
            dispatched_at: Utc::now(),
        };
        let ctx = request.interpolation_context("ci");
        assert_eq!(ctx.interpolate("${{ workflow }}-${{ pr_number || sha }}"), "ci-7");
    }

    #[test]
    fn test_value_to_string_unquotes_strings() {
        assert_eq!(value_to_string(&serde_json::json!("linux")), "linux");
        assert_eq!(value_to_string(&serde_json::json!(18)), "18");
    }
}
