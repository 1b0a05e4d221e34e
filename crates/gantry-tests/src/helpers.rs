//! Test doubles and engine builders.

use crate::fixtures::AgentFixture;
use async_trait::async_trait;
use gantry_cache::MemoryCacheStore;
use gantry_core::Result;
use gantry_core::agent::Agent;
use gantry_core::events::Event;
use gantry_core::ports::{CacheStore, CommandOutput, CommandRequest, CommandRunner, EventBus};
use gantry_core::workflow::WorkflowDefinition;
use gantry_runner::ExecutorConfig;
use gantry_scheduler::{AgentPool, Engine, EngineOptions, SchedulerConfig};
use std::collections::{HashMap, VecDeque};
use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// Command runner that answers from per-command exit code scripts.
///
/// Each call pops the next code for its command; the last code repeats.
/// Commands without a script exit 0.
#[derive(Default)]
pub struct ScriptedRunner {
    scripts: Mutex<HashMap<String, VecDeque<i32>>>,
    delays: HashMap<String, Duration>,
    calls: Mutex<Vec<String>>,
    active: AtomicUsize,
    peak: AtomicUsize,
}

impl ScriptedRunner {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn script(mut self, command: &str, codes: impl IntoIterator<Item = i32>) -> Self {
        self.scripts
            .get_mut()
            .unwrap()
            .insert(command.to_string(), codes.into_iter().collect());
        self
    }

    /// Make every call of `command` take `delay`.
    pub fn delay(mut self, command: &str, delay: Duration) -> Self {
        self.delays.insert(command.to_string(), delay);
        self
    }

    /// Commands executed so far, in call order.
    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }

    pub fn call_count(&self, command: &str) -> usize {
        self.calls.lock().unwrap().iter().filter(|c| *c == command).count()
    }

    /// Highest number of commands observed running at once.
    pub fn peak_concurrency(&self) -> usize {
        self.peak.load(Ordering::SeqCst)
    }

    fn next_code(&self, command: &str) -> i32 {
        let mut scripts = self.scripts.lock().unwrap();
        match scripts.get_mut(command) {
            Some(codes) if codes.len() > 1 => codes.pop_front().unwrap_or(0),
            Some(codes) => codes.front().copied().unwrap_or(0),
            None => 0,
        }
    }
}

struct ActiveGuard<'a>(&'a AtomicUsize);

impl Drop for ActiveGuard<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

#[async_trait]
impl CommandRunner for ScriptedRunner {
    async fn execute(&self, request: &CommandRequest) -> Result<CommandOutput> {
        self.calls.lock().unwrap().push(request.command.clone());
        let now = self.active.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now, Ordering::SeqCst);
        let _guard = ActiveGuard(&self.active);

        let delay = self.delays.get(&request.command).copied().unwrap_or_default();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }

        Ok(CommandOutput {
            exit_code: Some(self.next_code(&request.command)),
            duration: delay,
            timed_out: false,
        })
    }
}

/// Event bus that keeps every published event in order.
#[derive(Default)]
pub struct RecordingBus {
    events: Mutex<Vec<Event>>,
}

impl RecordingBus {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<Event> {
        self.events.lock().unwrap().clone()
    }

    pub fn subjects(&self) -> Vec<String> {
        self.events().iter().map(Event::subject).collect()
    }

    pub fn count(&self, predicate: impl Fn(&Event) -> bool) -> usize {
        self.events.lock().unwrap().iter().filter(|e| predicate(e)).count()
    }
}

#[async_trait]
impl EventBus for RecordingBus {
    async fn publish(&self, event: Event) -> Result<()> {
        self.events.lock().unwrap().push(event);
        Ok(())
    }
}

/// Builder for an [`Engine`] wired to test doubles.
pub struct TestEngine {
    workflow: WorkflowDefinition,
    agents: Vec<Agent>,
    runner: Arc<dyn CommandRunner>,
    cache: Arc<dyn CacheStore>,
    events: Arc<dyn EventBus>,
    options: EngineOptions,
}

impl TestEngine {
    pub fn new(workflow: WorkflowDefinition) -> Self {
        Self {
            workflow,
            agents: AgentFixture::ci_pool(),
            runner: Arc::new(ScriptedRunner::new()),
            cache: Arc::new(MemoryCacheStore::new()),
            events: Arc::new(RecordingBus::new()),
            options: EngineOptions {
                executor: ExecutorConfig {
                    workspace_root: std::env::temp_dir(),
                    max_retry_delay: Duration::from_millis(10),
                    ..Default::default()
                },
                scheduler: SchedulerConfig::default(),
            },
        }
    }

    pub fn agents(mut self, agents: Vec<Agent>) -> Self {
        self.agents = agents;
        self
    }

    pub fn runner(mut self, runner: Arc<dyn CommandRunner>) -> Self {
        self.runner = runner;
        self
    }

    pub fn cache(mut self, cache: Arc<dyn CacheStore>) -> Self {
        self.cache = cache;
        self
    }

    pub fn events(mut self, events: Arc<dyn EventBus>) -> Self {
        self.events = events;
        self
    }

    pub fn workspace(mut self, root: PathBuf) -> Self {
        self.options.executor.workspace_root = root;
        self
    }

    pub fn max_concurrent_jobs(mut self, limit: usize) -> Self {
        self.options.scheduler.max_concurrent_jobs = Some(limit);
        self
    }

    pub fn build(self) -> Engine {
        Engine::new(
            self.workflow,
            Arc::new(AgentPool::new(self.agents)),
            self.runner,
            self.cache,
            self.events,
            self.options,
        )
        .expect("test workflow should be valid")
    }
}

/// Poll `condition` until it holds or `timeout` elapses.
pub async fn wait_for(timeout: Duration, condition: impl Fn() -> bool) -> bool {
    let deadline = tokio::time::Instant::now() + timeout;
    while tokio::time::Instant::now() < deadline {
        if condition() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    condition()
}

#[cfg(test)]
mod tests {
    use super::*;
    use gantry_core::ids::AgentId;

    fn request(command: &str) -> CommandRequest {
        CommandRequest {
            agent: AgentId::new("a"),
            label: "job".to_string(),
            command: command.to_string(),
            env: HashMap::new(),
            working_dir: None,
            timeout: Duration::from_secs(1),
        }
    }

    #[tokio::test]
    async fn test_scripted_runner_repeats_last_code() {
        let runner = ScriptedRunner::new().script("flaky", [1, 0]);
        let codes: Vec<_> = [
            runner.execute(&request("flaky")).await.unwrap(),
            runner.execute(&request("flaky")).await.unwrap(),
            runner.execute(&request("flaky")).await.unwrap(),
            runner.execute(&request("other")).await.unwrap(),
        ]
        .iter()
        .map(|o| o.exit_code)
        .collect();

        assert_eq!(codes, vec![Some(1), Some(0), Some(0), Some(0)]);
        assert_eq!(runner.call_count("flaky"), 3);
        assert_eq!(runner.peak_concurrency(), 1);
    }
}
