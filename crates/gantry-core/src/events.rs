//! Lifecycle events emitted by the engine.

use crate::ids::{AgentId, JobId, RunId};
use crate::run::{CancelReason, JobStatus, RunStatus, StepStatus};
use crate::workflow::TriggerKind;
use chrono::{DateTime, Utc};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// All events in the Gantry system.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Event {
    // Run lifecycle
    RunQueued(RunQueuedPayload),
    RunStarted(RunStartedPayload),
    RunCancelled(RunCancelledPayload),
    RunCompleted(RunCompletedPayload),

    // Job lifecycle
    JobStarted(JobStartedPayload),
    JobCompleted(JobCompletedPayload),

    // Step lifecycle
    StepStarted(StepStartedPayload),
    StepRetrying(StepRetryingPayload),
    StepCompleted(StepCompletedPayload),

    // Cache
    CacheHit(CachePayload),
    CacheMiss(CachePayload),
    CacheSaved(CachePayload),
}

impl Event {
    /// Dotted subject for routing and log filtering.
    pub fn subject(&self) -> String {
        match self {
            Event::RunQueued(p) => format!("run.queued.{}", p.run_id),
            Event::RunStarted(p) => format!("run.started.{}", p.run_id),
            Event::RunCancelled(p) => format!("run.cancelled.{}", p.run_id),
            Event::RunCompleted(p) => format!("run.completed.{}", p.run_id),
            Event::JobStarted(p) => format!("job.started.{}.{}", p.run_id, p.job_id),
            Event::JobCompleted(p) => format!("job.completed.{}.{}", p.run_id, p.job_id),
            Event::StepStarted(p) => format!("step.started.{}.{}", p.run_id, p.job_id),
            Event::StepRetrying(p) => format!("step.retrying.{}.{}", p.run_id, p.job_id),
            Event::StepCompleted(p) => format!("step.completed.{}.{}", p.run_id, p.job_id),
            Event::CacheHit(p) => format!("cache.hit.{}", p.scope),
            Event::CacheMiss(p) => format!("cache.miss.{}", p.scope),
            Event::CacheSaved(p) => format!("cache.saved.{}", p.scope),
        }
    }

    pub fn run_id(&self) -> RunId {
        match self {
            Event::RunQueued(p) => p.run_id,
            Event::RunStarted(p) => p.run_id,
            Event::RunCancelled(p) => p.run_id,
            Event::RunCompleted(p) => p.run_id,
            Event::JobStarted(p) => p.run_id,
            Event::JobCompleted(p) => p.run_id,
            Event::StepStarted(p) => p.run_id,
            Event::StepRetrying(p) => p.run_id,
            Event::StepCompleted(p) => p.run_id,
            Event::CacheHit(p) | Event::CacheMiss(p) | Event::CacheSaved(p) => p.run_id,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct RunQueuedPayload {
    pub run_id: RunId,
    pub workflow: String,
    pub group_key: String,
    pub trigger: TriggerKind,
    pub git_ref: String,
    pub commit_sha: String,
    pub queued_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct RunStartedPayload {
    pub run_id: RunId,
    pub workflow: String,
    pub job_count: u32,
    pub started_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct RunCancelledPayload {
    pub run_id: RunId,
    pub reason: CancelReason,
    pub cancelled_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct RunCompletedPayload {
    pub run_id: RunId,
    pub workflow: String,
    pub status: RunStatus,
    pub jobs_passed: u32,
    pub jobs_failed: u32,
    pub jobs_cancelled: u32,
    pub duration_ms: u64,
    pub completed_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct JobStartedPayload {
    pub run_id: RunId,
    pub job_id: JobId,
    pub name: String,
    pub agent: AgentId,
    pub started_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct JobCompletedPayload {
    pub run_id: RunId,
    pub job_id: JobId,
    pub name: String,
    pub status: JobStatus,
    pub failed_step: Option<String>,
    pub duration_ms: u64,
    pub completed_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct StepStartedPayload {
    pub run_id: RunId,
    pub job_id: JobId,
    pub step: String,
    pub step_index: u32,
    pub started_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct StepRetryingPayload {
    pub run_id: RunId,
    pub job_id: JobId,
    pub step: String,
    pub attempt: u32,
    pub max_attempts: u32,
    pub delay_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct StepCompletedPayload {
    pub run_id: RunId,
    pub job_id: JobId,
    pub step: String,
    pub status: StepStatus,
    pub exit_code: Option<i32>,
    pub attempts: u32,
    pub duration_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct CachePayload {
    pub run_id: RunId,
    pub job_id: JobId,
    pub scope: String,
    pub key: String,
}
