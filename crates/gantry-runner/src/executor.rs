//! Step executor: runs one job instance on a leased agent.

use crate::retry::{backoff_delay, max_attempts};
use chrono::Utc;
use gantry_cache::{KeyInputs, archiver, compute_key};
use gantry_core::agent::Agent;
use gantry_core::cache::CacheEntry;
use gantry_core::events::{
    CachePayload, Event, JobCompletedPayload, JobStartedPayload, StepCompletedPayload,
    StepRetryingPayload, StepStartedPayload,
};
use gantry_core::interpolation::InterpolationContext;
use gantry_core::ports::{CacheStore, CommandOutput, CommandRequest, CommandRunner, EventBus};
use gantry_core::run::{JobInstance, JobResult, JobStatus, StepResult, StepStatus};
use gantry_core::workflow::{CacheConfig, StepSpec};
use gantry_core::{Error, Result, RunId};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Executor settings.
#[derive(Debug, Clone)]
pub struct ExecutorConfig {
    /// Directory commands run in; cache paths and hashed files are relative to it.
    pub workspace_root: PathBuf,
    /// Timeout for steps that do not set `timeout_seconds`.
    pub default_step_timeout: Duration,
    /// Ceiling for retry backoff.
    pub max_retry_delay: Duration,
    /// When set, a step still running this long after cancellation is killed
    /// and reported `Cancelled`. When unset the running step always finishes.
    pub cancel_grace: Option<Duration>,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            workspace_root: PathBuf::from("."),
            default_step_timeout: Duration::from_secs(30 * 60),
            max_retry_delay: Duration::from_secs(60),
            cancel_grace: None,
        }
    }
}

/// Per-job inputs supplied by the engine.
#[derive(Debug, Clone)]
pub struct ExecutionContext {
    pub run_id: RunId,
    pub agent: Agent,
    /// Run variables and matrix values for `${{ }}` substitution.
    pub variables: InterpolationContext,
    /// Workflow, job and matrix environment, already interpolated.
    pub env: HashMap<String, String>,
    /// Fires when the run is cancelled or a fail-fast sibling failed.
    pub cancel: CancellationToken,
}

enum Attempt {
    Finished(CommandOutput),
    SpawnFailed(String),
    Killed,
}

/// Runs the steps of a job instance in order.
pub struct StepExecutor {
    runner: Arc<dyn CommandRunner>,
    cache: Arc<dyn CacheStore>,
    events: Arc<dyn EventBus>,
    config: ExecutorConfig,
}

impl StepExecutor {
    pub fn new(
        runner: Arc<dyn CommandRunner>,
        cache: Arc<dyn CacheStore>,
        events: Arc<dyn EventBus>,
        config: ExecutorConfig,
    ) -> Self {
        Self {
            runner,
            cache,
            events,
            config,
        }
    }

    pub fn config(&self) -> &ExecutorConfig {
        &self.config
    }

    /// Execute every step of `instance` on `ctx.agent`.
    ///
    /// Never returns an error: step failures, timeouts and cancellation are
    /// all folded into the returned `JobResult`.
    pub async fn run(&self, instance: &JobInstance, ctx: &ExecutionContext) -> JobResult {
        let start = Instant::now();
        let template = &instance.template;

        info!(
            run_id = %ctx.run_id,
            job = %instance.name,
            agent = %ctx.agent.id,
            steps = template.steps.len(),
            "Starting job"
        );
        self.emit(Event::JobStarted(JobStartedPayload {
            run_id: ctx.run_id,
            job_id: instance.id,
            name: instance.name.clone(),
            agent: ctx.agent.id.clone(),
            started_at: Utc::now(),
        }))
        .await;

        let mut restored: HashMap<String, String> = HashMap::new();
        let mut caches_restored = Vec::new();
        for cfg in &template.cache {
            self.restore_cache(instance, cfg, ctx, &mut restored, &mut caches_restored)
                .await;
        }

        let mut steps: Vec<StepResult> = Vec::with_capacity(template.steps.len());
        let mut status = JobStatus::Success;

        for (index, step) in template.steps.iter().enumerate() {
            if ctx.cancel.is_cancelled() {
                info!(job = %instance.name, step = %step.name, "Job cancelled before step");
                status = JobStatus::Cancelled;
                break;
            }

            for scope in &step.cache {
                if let Some(cfg) = template.cache_config(scope) {
                    self.restore_cache(instance, cfg, ctx, &mut restored, &mut caches_restored)
                        .await;
                }
            }

            let result = self.run_step(instance, step, index, ctx).await;
            let stop = match result.status {
                StepStatus::Cancelled => {
                    status = JobStatus::Cancelled;
                    true
                }
                s if s.is_failure() && !result.continue_on_error => {
                    // A step that fails after the cancel signal ends a cancelled job.
                    status = if ctx.cancel.is_cancelled() {
                        JobStatus::Cancelled
                    } else {
                        JobStatus::Failure
                    };
                    true
                }
                _ => false,
            };
            steps.push(result);
            if stop {
                break;
            }
        }

        // Steps that never started.
        let remaining = match status {
            JobStatus::Failure => StepStatus::Skipped,
            _ => StepStatus::Cancelled,
        };
        for step in template.steps.iter().skip(steps.len()) {
            steps.push(StepResult::not_run(&step.name, remaining, step.continue_on_error));
        }

        let mut caches_saved = Vec::new();
        if status == JobStatus::Success {
            for cfg in &template.cache {
                if let Some(entry) = self.save_cache(instance, cfg, ctx, &restored).await {
                    caches_saved.push(entry);
                }
            }
        }

        let mut result = JobResult {
            job_id: instance.id,
            template: template.name.clone(),
            name: instance.name.clone(),
            matrix: instance.matrix.clone(),
            agent: Some(ctx.agent.id.clone()),
            status,
            steps,
            error: None,
            caches_restored,
            caches_saved,
            duration_ms: start.elapsed().as_millis() as u64,
        };
        result.error = result.failed_step().and_then(|s| s.error.clone());

        info!(
            run_id = %ctx.run_id,
            job = %instance.name,
            status = ?result.status,
            duration_ms = result.duration_ms,
            "Job finished"
        );
        self.emit(Event::JobCompleted(JobCompletedPayload {
            run_id: ctx.run_id,
            job_id: instance.id,
            name: instance.name.clone(),
            status: result.status,
            failed_step: result.failed_step().map(|s| s.name.clone()),
            duration_ms: result.duration_ms,
            completed_at: Utc::now(),
        }))
        .await;

        result
    }

    async fn run_step(
        &self,
        instance: &JobInstance,
        step: &StepSpec,
        index: usize,
        ctx: &ExecutionContext,
    ) -> StepResult {
        let start = Instant::now();
        let max = max_attempts(step.retry_policy.as_ref());
        let timeout = step
            .timeout_seconds
            .map(Duration::from_secs)
            .unwrap_or(self.config.default_step_timeout);

        let job_vars = ctx.variables.clone().with_env(ctx.env.clone());
        let mut env = ctx.env.clone();
        for (key, value) in &step.env {
            env.insert(key.clone(), job_vars.interpolate(value));
        }
        let step_vars = ctx.variables.clone().with_env(env.clone());

        let request = CommandRequest {
            agent: ctx.agent.id.clone(),
            label: format!("{} / {}", instance.name, step.name),
            command: step_vars.interpolate(&step.command),
            env,
            working_dir: Some(self.config.workspace_root.clone()),
            timeout,
        };

        self.emit(Event::StepStarted(StepStartedPayload {
            run_id: ctx.run_id,
            job_id: instance.id,
            step: step.name.clone(),
            step_index: index as u32,
            started_at: Utc::now(),
        }))
        .await;

        let mut attempt = 0;
        let result = loop {
            attempt += 1;
            debug!(job = %instance.name, step = %step.name, attempt, max, "Running step");

            let (status, exit_code, error) = match self.attempt(&request, &ctx.cancel).await {
                Attempt::Finished(output) if output.success() => {
                    (StepStatus::Success, output.exit_code, None)
                }
                Attempt::Finished(output) if output.timed_out => {
                    let err = Error::StepTimeout {
                        step: step.name.clone(),
                        seconds: timeout.as_secs(),
                    };
                    (StepStatus::TimedOut, None, Some(err.to_string()))
                }
                Attempt::Finished(output) => {
                    let err = Error::StepFailed {
                        step: step.name.clone(),
                        exit_code: output.exit_code,
                    };
                    (StepStatus::Failure, output.exit_code, Some(err.to_string()))
                }
                Attempt::SpawnFailed(e) => (StepStatus::Failure, None, Some(e)),
                Attempt::Killed => {
                    warn!(job = %instance.name, step = %step.name, "Step killed after cancellation");
                    (StepStatus::Cancelled, None, Some("killed after cancellation".to_string()))
                }
            };

            let mut result = StepResult {
                name: step.name.clone(),
                status,
                exit_code,
                attempts: attempt,
                duration_ms: 0,
                continue_on_error: step.continue_on_error,
                error,
            };

            if !status.is_failure() || attempt >= max {
                break result;
            }
            let Some(policy) = step.retry_policy.as_ref() else {
                break result;
            };

            let delay = backoff_delay(policy, attempt, self.config.max_retry_delay);
            warn!(
                job = %instance.name,
                step = %step.name,
                attempt,
                max_attempts = max,
                delay_ms = delay.as_millis() as u64,
                "Step failed, retrying"
            );
            self.emit(Event::StepRetrying(StepRetryingPayload {
                run_id: ctx.run_id,
                job_id: instance.id,
                step: step.name.clone(),
                attempt,
                max_attempts: max,
                delay_ms: delay.as_millis() as u64,
            }))
            .await;

            tokio::select! {
                biased;
                _ = ctx.cancel.cancelled() => {
                    info!(job = %instance.name, step = %step.name, "Retry abandoned after cancellation");
                    result.status = StepStatus::Cancelled;
                    break result;
                }
                _ = tokio::time::sleep(delay) => {}
            }
        };

        let result = StepResult {
            duration_ms: start.elapsed().as_millis() as u64,
            ..result
        };

        self.emit(Event::StepCompleted(StepCompletedPayload {
            run_id: ctx.run_id,
            job_id: instance.id,
            step: step.name.clone(),
            status: result.status,
            exit_code: result.exit_code,
            attempts: result.attempts,
            duration_ms: result.duration_ms,
        }))
        .await;

        result
    }

    async fn attempt(&self, request: &CommandRequest, cancel: &CancellationToken) -> Attempt {
        let Some(grace) = self.config.cancel_grace else {
            return Self::classify(self.runner.execute(request).await);
        };

        let exec = self.runner.execute(request);
        tokio::pin!(exec);
        tokio::select! {
            res = &mut exec => Self::classify(res),
            _ = cancel.cancelled() => {
                match tokio::time::timeout(grace, &mut exec).await {
                    Ok(res) => Self::classify(res),
                    // Dropping the future kills the child process.
                    Err(_) => Attempt::Killed,
                }
            }
        }
    }

    fn classify(res: Result<CommandOutput>) -> Attempt {
        match res {
            Ok(output) => Attempt::Finished(output),
            Err(e) => Attempt::SpawnFailed(e.to_string()),
        }
    }

    async fn cache_key(
        &self,
        instance: &JobInstance,
        cfg: &CacheConfig,
        ctx: &ExecutionContext,
    ) -> String {
        let prefix = ctx
            .variables
            .clone()
            .with_env(ctx.env.clone())
            .interpolate(&cfg.key);

        let mut files = Vec::with_capacity(cfg.hash_files.len());
        for file in &cfg.hash_files {
            let path = self.config.workspace_root.join(file);
            let contents = match tokio::fs::read(&path).await {
                Ok(bytes) => Some(bytes),
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => None,
                Err(e) => {
                    warn!(path = %path.display(), error = %e, "Failed to read cache key file");
                    None
                }
            };
            files.push((file.clone(), contents));
        }

        compute_key(&KeyInputs {
            scope: &cfg.scope,
            prefix: &prefix,
            labels: Some(&instance.required_labels),
            files,
        })
    }

    /// Look up and restore one cache scope. Misses and store errors are
    /// reported and otherwise ignored.
    async fn restore_cache(
        &self,
        instance: &JobInstance,
        cfg: &CacheConfig,
        ctx: &ExecutionContext,
        restored: &mut HashMap<String, String>,
        entries: &mut Vec<CacheEntry>,
    ) {
        let key = self.cache_key(instance, cfg, ctx).await;
        if restored.get(&cfg.scope) == Some(&key) {
            return;
        }
        let payload = CachePayload {
            run_id: ctx.run_id,
            job_id: instance.id,
            scope: cfg.scope.clone(),
            key: key.clone(),
        };

        let bytes = match self.cache.get(&key).await {
            Ok(Some(bytes)) => bytes,
            Ok(None) => {
                debug!(job = %instance.name, scope = %cfg.scope, key = %key, "Cache miss");
                self.emit(Event::CacheMiss(payload)).await;
                return;
            }
            Err(e) => {
                warn!(job = %instance.name, key = %key, error = %e, "Cache lookup failed");
                self.emit(Event::CacheMiss(payload)).await;
                return;
            }
        };

        let size_bytes = bytes.len() as u64;
        match unpack_in_background(bytes, self.config.workspace_root.clone()).await {
            Ok(()) => {
                info!(job = %instance.name, scope = %cfg.scope, key = %key, size_bytes, "Cache restored");
                restored.insert(cfg.scope.clone(), key.clone());
                entries.push(CacheEntry {
                    key: key.clone(),
                    scope: cfg.scope.clone(),
                    payload_ref: key,
                    size_bytes,
                    created_at: Utc::now(),
                });
                self.emit(Event::CacheHit(payload)).await;
            }
            Err(e) => {
                warn!(job = %instance.name, key = %key, error = %e, "Cache restore failed");
                self.emit(Event::CacheMiss(payload)).await;
            }
        }
    }

    /// Write-through save of one scope; failures are logged only.
    async fn save_cache(
        &self,
        instance: &JobInstance,
        cfg: &CacheConfig,
        ctx: &ExecutionContext,
        restored: &HashMap<String, String>,
    ) -> Option<CacheEntry> {
        let key = self.cache_key(instance, cfg, ctx).await;
        if restored.get(&cfg.scope) == Some(&key) {
            debug!(job = %instance.name, key = %key, "Cache hit on same key, not saving");
            return None;
        }

        let paths: Vec<PathBuf> = cfg.paths.iter().map(PathBuf::from).collect();
        let saved = async {
            let bytes = pack_in_background(paths, self.config.workspace_root.clone()).await?;
            let size_bytes = bytes.len() as u64;
            let payload_ref = self.cache.put(&key, bytes).await?;
            Ok::<_, Error>((payload_ref, size_bytes))
        }
        .await;

        match saved {
            Ok((payload_ref, size_bytes)) => {
                info!(job = %instance.name, scope = %cfg.scope, key = %key, size_bytes, "Cache saved");
                self.emit(Event::CacheSaved(CachePayload {
                    run_id: ctx.run_id,
                    job_id: instance.id,
                    scope: cfg.scope.clone(),
                    key: key.clone(),
                }))
                .await;
                Some(CacheEntry {
                    key,
                    scope: cfg.scope.clone(),
                    payload_ref,
                    size_bytes,
                    created_at: Utc::now(),
                })
            }
            Err(e) => {
                warn!(job = %instance.name, key = %key, error = %e, "Cache save failed");
                None
            }
        }
    }

    async fn emit(&self, event: Event) {
        if let Err(e) = self.events.publish(event).await {
            warn!(error = %e, "Failed to publish event");
        }
    }
}

async fn pack_in_background(paths: Vec<PathBuf>, base: PathBuf) -> Result<Vec<u8>> {
    tokio::task::spawn_blocking(move || archiver::pack(&paths, &base))
        .await
        .map_err(|e| Error::Internal(format!("cache pack task failed: {}", e)))?
}

async fn unpack_in_background(payload: Vec<u8>, dest: PathBuf) -> Result<()> {
    tokio::task::spawn_blocking(move || archiver::unpack(&payload, Path::new(&dest)))
        .await
        .map_err(|e| Error::Internal(format!("cache unpack task failed: {}", e)))?
}
