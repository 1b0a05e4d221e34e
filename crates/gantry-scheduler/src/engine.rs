//! Engine: drives a workflow run from trigger to aggregated result.

use crate::aggregator::{RunAggregator, RunSummary};
use crate::concurrency::{ConcurrencyCoordinator, RunHandle, RunSignal};
use crate::matrix::MatrixExpander;
use crate::scheduler::{Lease, Placement, Schedule, Scheduler, SchedulerConfig};
use crate::triggers::{EventIngest, TriggerEvent};
use chrono::Utc;
use futures::StreamExt;
use gantry_core::events::{
    Event, JobCompletedPayload, RunCancelledPayload, RunCompletedPayload, RunQueuedPayload,
    RunStartedPayload,
};
use gantry_core::interpolation::InterpolationContext;
use gantry_core::ports::{AgentProvider, CacheStore, CommandRunner, EventBus};
use gantry_core::run::{CancelReason, JobInstance, JobResult, JobStatus, RunRequest, RunResult};
use gantry_core::workflow::{JobTemplate, WorkflowDefinition};
use gantry_core::{Error, JobId, Result, RunId};
use gantry_runner::{ExecutionContext, ExecutorConfig, StepExecutor};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::task::{JoinHandle, JoinSet};
use tracing::{error, info, warn};

/// Engine settings.
#[derive(Debug, Clone, Default)]
pub struct EngineOptions {
    pub executor: ExecutorConfig,
    pub scheduler: SchedulerConfig,
}

/// A submitted run.
#[derive(Debug)]
pub struct RunTicket {
    pub run_id: RunId,
    pub group_key: String,
    join: JoinHandle<RunResult>,
}

impl RunTicket {
    /// Wait for the run to reach a terminal status.
    pub async fn wait(self) -> Result<RunResult> {
        self.join
            .await
            .map_err(|e| Error::Internal(format!("run task failed: {}", e)))
    }
}

/// Executes runs of one workflow.
pub struct Engine {
    shared: Arc<Shared>,
    coordinator: ConcurrencyCoordinator,
    ingest: EventIngest,
}

struct Shared {
    workflow: WorkflowDefinition,
    templates: Vec<Arc<JobTemplate>>,
    expander: MatrixExpander,
    scheduler: Scheduler,
    executor: StepExecutor,
    aggregator: RunAggregator,
    events: Arc<dyn EventBus>,
}

impl Engine {
    pub fn new(
        workflow: WorkflowDefinition,
        agents: Arc<dyn AgentProvider>,
        runner: Arc<dyn CommandRunner>,
        cache: Arc<dyn CacheStore>,
        events: Arc<dyn EventBus>,
        options: EngineOptions,
    ) -> Result<Self> {
        workflow.validate()?;
        let templates = workflow.jobs.iter().cloned().map(Arc::new).collect();

        Ok(Self {
            shared: Arc::new(Shared {
                templates,
                expander: MatrixExpander::new(),
                scheduler: Scheduler::new(agents, options.scheduler),
                executor: StepExecutor::new(runner, cache, Arc::clone(&events), options.executor),
                aggregator: RunAggregator::new(),
                events,
                workflow,
            }),
            coordinator: ConcurrencyCoordinator::new(),
            ingest: EventIngest::new(),
        })
    }

    pub fn workflow(&self) -> &WorkflowDefinition {
        &self.shared.workflow
    }

    pub fn coordinator(&self) -> &ConcurrencyCoordinator {
        &self.coordinator
    }

    /// Job instances a run for `request` would execute.
    pub fn expand(&self, request: &RunRequest) -> Vec<JobInstance> {
        self.shared
            .expand(&request.interpolation_context(&self.shared.workflow.name))
    }

    /// Ingest a trigger event. Returns `None` when no trigger matches.
    pub async fn handle_event(&self, event: &TriggerEvent) -> Option<RunTicket> {
        let request = self.ingest.ingest(&self.shared.workflow, event)?;
        Some(self.submit(request).await)
    }

    /// Submit a run request to its concurrency group and start it once
    /// admitted.
    pub async fn submit(&self, request: RunRequest) -> RunTicket {
        let handle = self.coordinator.submit(&self.shared.workflow, &request);
        let run_id = handle.run_id();
        let group_key = handle.group_key().to_string();

        info!(
            run_id = %run_id,
            workflow = %self.shared.workflow.name,
            group = %group_key,
            git_ref = %request.git_ref,
            "Run queued"
        );
        self.shared
            .emit(Event::RunQueued(RunQueuedPayload {
                run_id,
                workflow: self.shared.workflow.name.clone(),
                group_key: group_key.clone(),
                trigger: request.trigger_kind,
                git_ref: request.git_ref.clone(),
                commit_sha: request.commit_sha.clone(),
                queued_at: Utc::now(),
            }))
            .await;

        let shared = Arc::clone(&self.shared);
        let join = tokio::spawn(async move { shared.execute(handle, request).await });

        RunTicket {
            run_id,
            group_key,
            join,
        }
    }

    /// Cancel a queued or running run on behalf of a user.
    pub fn cancel(&self, run_id: RunId) -> bool {
        let found = self.coordinator.cancel(run_id, CancelReason::UserRequested);
        if found {
            info!(run_id = %run_id, "Run cancellation requested");
        }
        found
    }
}

impl Shared {
    fn expand(&self, variables: &InterpolationContext) -> Vec<JobInstance> {
        self.templates
            .iter()
            .flat_map(|t| self.expander.expand_with(t, variables))
            .collect()
    }

    async fn execute(self: Arc<Self>, mut handle: RunHandle, request: RunRequest) -> RunResult {
        let run_id = handle.run_id();
        let variables = request.interpolation_context(&self.workflow.name);
        let instances = self.expand(&variables);

        if let Err(reason) = handle.admitted().await {
            info!(run_id = %run_id, ?reason, "Run cancelled while queued");
            self.emit_cancelled(run_id, reason).await;
            let job_results = instances
                .iter()
                .map(|i| JobResult::unstarted(i, JobStatus::Cancelled, None))
                .collect();
            return self.complete(handle, Utc::now(), job_results, false).await;
        }

        let started_at = Utc::now();
        info!(run_id = %run_id, jobs = instances.len(), "Run started");
        self.emit(Event::RunStarted(RunStartedPayload {
            run_id,
            workflow: self.workflow.name.clone(),
            job_count: instances.len() as u32,
            started_at,
        }))
        .await;

        let signal = handle.signal().clone();
        let (job_results, settled_before_cancel) =
            self.run_jobs(run_id, &variables, instances, &signal).await;
        self.complete(handle, started_at, job_results, settled_before_cancel)
            .await
    }

    async fn run_jobs(
        self: &Arc<Self>,
        run_id: RunId,
        variables: &InterpolationContext,
        instances: Vec<JobInstance>,
        signal: &RunSignal,
    ) -> (Vec<JobResult>, bool) {
        let slots: HashMap<JobId, usize> = instances
            .iter()
            .enumerate()
            .map(|(slot, instance)| (instance.id, slot))
            .collect();
        let mut results: Vec<Option<JobResult>> = vec![None; instances.len()];
        let mut schedule = self.scheduler.schedule(instances.clone(), signal.token());
        let mut jobs: JoinSet<(JobResult, Lease)> = JoinSet::new();
        let mut task_slots = HashMap::new();
        let mut placements_done = false;
        let mut cancel_reported = false;
        // Whether a job had settled as non-cancelled when the signal fired.
        let mut settled_at_cancel: Option<bool> = None;

        while !placements_done || !jobs.is_empty() {
            tokio::select! {
                biased;
                _ = signal.cancelled(), if !cancel_reported => {
                    cancel_reported = true;
                    settled_at_cancel = Some(
                        results
                            .iter()
                            .flatten()
                            .any(|r| r.status != JobStatus::Cancelled),
                    );
                    let reason = signal.reason().unwrap_or(CancelReason::UserRequested);
                    info!(run_id = %run_id, ?reason, "Run cancelled");
                    self.emit_cancelled(run_id, reason).await;
                }
                placement = schedule.next(), if !placements_done => {
                    let Some(placement) = placement else {
                        placements_done = true;
                        continue;
                    };
                    let Some(&slot) = slots.get(&placement.instance().id) else {
                        continue;
                    };
                    match placement {
                        Placement::Assigned(lease) => {
                            let ctx = ExecutionContext {
                                run_id,
                                agent: lease.agent().clone(),
                                variables: variables
                                    .clone()
                                    .with_matrix(lease.instance.matrix_strings()),
                                env: self.job_env(run_id, &lease.instance, variables),
                                cancel: lease.cancel.clone(),
                            };
                            let shared = Arc::clone(self);
                            let task = jobs.spawn(async move {
                                let result = shared.executor.run(&lease.instance, &ctx).await;
                                (result, lease)
                            });
                            task_slots.insert(task.id(), slot);
                        }
                        Placement::Unschedulable { instance, error } => {
                            let result = JobResult::unstarted(
                                &instance,
                                JobStatus::Failure,
                                Some(error.to_string()),
                            );
                            self.emit_unstarted(run_id, &result).await;
                            self.record(&schedule, &instances, &mut results, slot, result);
                        }
                        Placement::Cancelled { instance } => {
                            let result = JobResult::unstarted(&instance, JobStatus::Cancelled, None);
                            self.emit_unstarted(run_id, &result).await;
                            self.record(&schedule, &instances, &mut results, slot, result);
                        }
                    }
                }
                Some(joined) = jobs.join_next_with_id() => {
                    let (slot, result, lease) = match joined {
                        Ok((id, (result, lease))) => (task_slots.remove(&id), result, Some(lease)),
                        Err(e) => {
                            let slot = task_slots.remove(&e.id());
                            error!(run_id = %run_id, error = %e, "Job task failed");
                            let Some(instance) = slot.and_then(|s| instances.get(s)) else {
                                continue;
                            };
                            let result = JobResult::unstarted(
                                instance,
                                JobStatus::Failure,
                                Some(format!("job task failed: {}", e)),
                            );
                            (slot, result, None)
                        }
                    };
                    // Record first so fail-fast siblings cannot take the agent.
                    if let Some(slot) = slot {
                        self.record(&schedule, &instances, &mut results, slot, result);
                    }
                    if let Some(lease) = lease {
                        lease.release().await;
                    }
                }
                else => break,
            }
        }

        // A cancel that lands after the loop finds every job settled.
        let settled_before_cancel = settled_at_cancel
            .unwrap_or_else(|| results.iter().flatten().any(|r| r.status != JobStatus::Cancelled));
        let job_results = results
            .into_iter()
            .zip(&instances)
            .map(|(result, instance)| {
                result.unwrap_or_else(|| JobResult::unstarted(instance, JobStatus::Cancelled, None))
            })
            .collect();
        (job_results, settled_before_cancel)
    }

    fn record(
        &self,
        schedule: &Schedule,
        instances: &[JobInstance],
        results: &mut [Option<JobResult>],
        slot: usize,
        result: JobResult,
    ) {
        if result.status == JobStatus::Failure {
            let fail_fast = instances.get(slot).is_some_and(|i| i.template.fail_fast);
            if fail_fast && schedule.cancel_template(&result.template) {
                warn!(
                    job = %result.name,
                    template = %result.template,
                    "Job failed, cancelling remaining matrix instances"
                );
            }
        }
        if let Some(entry) = results.get_mut(slot) {
            *entry = Some(result);
        }
    }

    /// Workflow env, then the instance's env, then engine-provided variables.
    fn job_env(
        &self,
        run_id: RunId,
        instance: &JobInstance,
        variables: &InterpolationContext,
    ) -> HashMap<String, String> {
        let ctx = variables.clone().with_matrix(instance.matrix_strings());
        let mut env: HashMap<String, String> = self
            .workflow
            .env
            .iter()
            .map(|(k, v)| (k.clone(), ctx.interpolate(v)))
            .collect();
        env.extend(instance.env.clone());
        env.insert("GANTRY_RUN_ID".to_string(), run_id.to_string());
        env.insert("GANTRY_JOB".to_string(), instance.name.clone());
        env
    }

    async fn complete(
        &self,
        handle: RunHandle,
        started_at: chrono::DateTime<Utc>,
        job_results: Vec<JobResult>,
        settled_before_cancel: bool,
    ) -> RunResult {
        let summary = RunSummary {
            run_id: handle.run_id(),
            workflow: self.workflow.name.clone(),
            group_key: handle.group_key().to_string(),
            cancel_reason: handle.signal().reason(),
            settled_before_cancel,
            started_at,
        };
        let result = self.aggregator.aggregate(summary, job_results);
        let duration_ms = (result.completed_at - result.started_at)
            .num_milliseconds()
            .max(0) as u64;

        info!(
            run_id = %result.run_id,
            status = ?result.overall_status,
            passed = result.count(JobStatus::Success),
            failed = result.count(JobStatus::Failure),
            cancelled = result.count(JobStatus::Cancelled),
            duration_ms,
            "Run completed"
        );
        self.emit(Event::RunCompleted(RunCompletedPayload {
            run_id: result.run_id,
            workflow: result.workflow.clone(),
            status: result.overall_status,
            jobs_passed: result.count(JobStatus::Success) as u32,
            jobs_failed: result.count(JobStatus::Failure) as u32,
            jobs_cancelled: result.count(JobStatus::Cancelled) as u32,
            duration_ms,
            completed_at: result.completed_at,
        }))
        .await;

        // Leaving the group admits the next queued run.
        handle.finish();
        result
    }

    async fn emit_unstarted(&self, run_id: RunId, result: &JobResult) {
        self.emit(Event::JobCompleted(JobCompletedPayload {
            run_id,
            job_id: result.job_id,
            name: result.name.clone(),
            status: result.status,
            failed_step: None,
            duration_ms: 0,
            completed_at: Utc::now(),
        }))
        .await;
    }

    async fn emit_cancelled(&self, run_id: RunId, reason: CancelReason) {
        self.emit(Event::RunCancelled(RunCancelledPayload {
            run_id,
            reason,
            cancelled_at: Utc::now(),
        }))
        .await;
    }

    async fn emit(&self, event: Event) {
        if let Err(e) = self.events.publish(event).await {
            warn!(error = %e, "Failed to publish event");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agents::AgentPool;
    use crate::bus::BroadcastEventBus;
    use async_trait::async_trait;
    use gantry_cache::MemoryCacheStore;
    use gantry_core::agent::Agent;
    use gantry_core::ports::{CommandOutput, CommandRequest, NullEventBus};
    use gantry_core::run::{RunStatus, StepStatus};
    use gantry_core::workflow::{ConcurrencyConfig, StepSpec, Strategy, TriggerKind};
    use serde_json::json;
    use std::time::Duration;

    /// Fails commands containing `fail`, sleeps on commands containing `slow`.
    struct KeywordRunner;

    #[async_trait]
    impl CommandRunner for KeywordRunner {
        async fn execute(&self, request: &CommandRequest) -> Result<CommandOutput> {
            if request.command.contains("slow") {
                tokio::time::sleep(Duration::from_millis(100)).await;
            }
            let code = if request.command.contains("fail") { 1 } else { 0 };
            Ok(CommandOutput {
                exit_code: Some(code),
                duration: Duration::from_millis(1),
                timed_out: false,
            })
        }
    }

    fn job(name: &str, axes: serde_json::Value, commands: &[&str]) -> JobTemplate {
        JobTemplate {
            name: name.to_string(),
            strategy: Strategy {
                axes: axes.as_object().cloned().unwrap_or_default(),
                ..Default::default()
            },
            required_labels: Default::default(),
            env: Default::default(),
            steps: commands
                .iter()
                .enumerate()
                .map(|(i, cmd)| StepSpec {
                    name: format!("step-{}", i),
                    command: cmd.to_string(),
                    env: Default::default(),
                    retry_policy: None,
                    continue_on_error: false,
                    timeout_seconds: None,
                    cache: vec![],
                })
                .collect(),
            fail_fast: true,
            max_parallel: None,
            cache: vec![],
        }
    }

    fn engine(jobs: Vec<JobTemplate>, agents: usize, events: Arc<dyn EventBus>) -> Engine {
        let workflow = WorkflowDefinition {
            name: "ci".to_string(),
            triggers: vec![],
            concurrency: Some(ConcurrencyConfig {
                group: "${{ workflow }}-${{ ref_name }}".to_string(),
                cancel_in_progress: true,
            }),
            env: Default::default(),
            jobs,
        };
        let pool = AgentPool::new((0..agents).map(|i| Agent::new(format!("a{}", i), ["os=linux"])));
        Engine::new(
            workflow,
            Arc::new(pool),
            Arc::new(KeywordRunner),
            Arc::new(MemoryCacheStore::new()),
            events,
            EngineOptions::default(),
        )
        .unwrap()
    }

    fn push(sha: &str) -> TriggerEvent {
        TriggerEvent::Push {
            branch: "main".to_string(),
            sha: sha.to_string(),
        }
    }

    #[tokio::test]
    async fn test_successful_run() {
        let engine = engine(
            vec![job("fmt", json!({}), &["ok"]), job("test", json!({"os": ["a", "b"]}), &["ok"])],
            3,
            Arc::new(NullEventBus),
        );
        let ticket = engine.handle_event(&push("abc")).await.unwrap();
        let result = ticket.wait().await.unwrap();

        assert_eq!(result.overall_status, RunStatus::Success);
        assert_eq!(result.job_results.len(), 3);
        let names: Vec<_> = result.job_results.iter().map(|j| j.name.as_str()).collect();
        assert_eq!(names, vec!["fmt", "test (os=a)", "test (os=b)"]);
    }

    #[tokio::test]
    async fn test_fail_fast_cancels_unstarted_siblings() {
        // One agent: siblings wait for it and are cancelled once the first fails.
        let engine = engine(
            vec![job("test", json!({"n": [1, 2, 3]}), &["fail"])],
            1,
            Arc::new(NullEventBus),
        );
        let result = engine.handle_event(&push("abc")).await.unwrap().wait().await.unwrap();

        assert_eq!(result.overall_status, RunStatus::Failure);
        assert_eq!(result.count(JobStatus::Failure), 1);
        assert_eq!(result.count(JobStatus::Cancelled), 2);
    }

    #[tokio::test]
    async fn test_superseded_run_is_cancelled() {
        let bus = Arc::new(BroadcastEventBus::default());
        let mut rx = bus.subscribe();
        let engine = engine(vec![job("build", json!({}), &["slow", "ok"])], 2, bus.clone());

        let first = engine.handle_event(&push("a")).await.unwrap();
        // Let the first run reach its slow step.
        loop {
            if let Ok(Event::StepStarted(_)) = rx.recv().await {
                break;
            }
        }
        let second = engine.handle_event(&push("b")).await.unwrap();

        let first = first.wait().await.unwrap();
        let second = second.wait().await.unwrap();
        assert_eq!(first.overall_status, RunStatus::Cancelled);
        assert_eq!(first.cancel_reason, Some(CancelReason::Superseded));
        assert_eq!(second.overall_status, RunStatus::Success);
    }

    #[tokio::test]
    async fn test_superseded_run_with_failing_step_is_cancelled() {
        let bus = Arc::new(BroadcastEventBus::default());
        let mut rx = bus.subscribe();
        let engine = engine(vec![job("build", json!({}), &["slow fail", "ok"])], 2, bus.clone());

        let first = engine.handle_event(&push("a")).await.unwrap();
        loop {
            if let Ok(Event::StepStarted(_)) = rx.recv().await {
                break;
            }
        }
        let second = engine.handle_event(&push("b")).await.unwrap();

        let first = first.wait().await.unwrap();
        assert_eq!(first.overall_status, RunStatus::Cancelled);
        assert_eq!(first.exit_code(), 2);
        assert_eq!(first.cancel_reason, Some(CancelReason::Superseded));

        let build = &first.job_results[0];
        assert_eq!(build.status, JobStatus::Cancelled);
        assert_eq!(build.steps[0].status, StepStatus::Failure);
        assert_eq!(build.steps[1].status, StepStatus::Cancelled);

        // The superseding run is not cancelled, so its failure stands.
        assert_eq!(second.wait().await.unwrap().overall_status, RunStatus::Failure);
    }

    #[tokio::test]
    async fn test_failure_before_cancel_keeps_run_failed() {
        let bus = Arc::new(BroadcastEventBus::default());
        let mut rx = bus.subscribe();
        let engine = engine(
            vec![job("lint", json!({}), &["fail"]), job("build", json!({}), &["slow", "ok"])],
            2,
            bus.clone(),
        );

        let ticket = engine.handle_event(&push("a")).await.unwrap();
        loop {
            if let Ok(Event::JobCompleted(p)) = rx.recv().await
                && p.status == JobStatus::Failure
            {
                break;
            }
        }
        // Let the engine record the failed job before cancelling.
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(engine.cancel(ticket.run_id));

        let result = ticket.wait().await.unwrap();
        assert_eq!(result.cancel_reason, Some(CancelReason::UserRequested));
        assert_eq!(result.overall_status, RunStatus::Failure);
        assert_eq!(result.job_results[1].status, JobStatus::Cancelled);
    }

    #[tokio::test]
    async fn test_user_cancel() {
        let engine = engine(vec![job("build", json!({}), &["slow", "ok"])], 1, Arc::new(NullEventBus));
        let ticket = engine.handle_event(&push("a")).await.unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(engine.cancel(ticket.run_id));

        let result = ticket.wait().await.unwrap();
        assert_eq!(result.overall_status, RunStatus::Cancelled);
        assert_eq!(result.cancel_reason, Some(CancelReason::UserRequested));
        assert!(!engine.cancel(result.run_id));
    }

    #[tokio::test]
    async fn test_expand_uses_request_variables() {
        let mut template = job("build", json!({}), &["ok"]);
        template.required_labels = ["os=${{ ref_name }}".to_string()].into_iter().collect();
        let engine = engine(vec![template], 1, Arc::new(NullEventBus));
        let request = EventIngest::new().normalize(&push("abc"));
        assert_eq!(request.trigger_kind, TriggerKind::Push);

        let instances = engine.expand(&request);
        assert!(instances[0].required_labels.contains("os=main"));
    }
}
