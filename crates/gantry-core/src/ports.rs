//! Port traits (hexagonal architecture).
//!
//! These traits define the interfaces between the engine and its external
//! collaborators: the agent provider, the command runner, the cache store
//! and the event sink.

use crate::agent::Agent;
use crate::events::Event;
use crate::ids::AgentId;
use crate::Result;
use async_trait::async_trait;
use std::collections::{BTreeSet, HashMap};
use std::path::PathBuf;
use std::time::Duration;

/// Event bus for publishing lifecycle events.
#[async_trait]
pub trait EventBus: Send + Sync {
    /// Publish an event.
    async fn publish(&self, event: Event) -> Result<()>;
}

/// Event bus that drops everything.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullEventBus;

#[async_trait]
impl EventBus for NullEventBus {
    async fn publish(&self, _event: Event) -> Result<()> {
        Ok(())
    }
}

/// Source of execution agents. The engine only leases agents, it never
/// provisions them.
#[async_trait]
pub trait AgentProvider: Send + Sync {
    /// Claim an idle agent carrying every label, waiting until one is free.
    ///
    /// Must be cancel-safe: dropping the future before it resolves must not
    /// leave an agent claimed.
    async fn acquire(&self, labels: &BTreeSet<String>) -> Result<Agent>;

    /// Return a previously acquired agent.
    async fn release(&self, agent: Agent);

    /// Whether any agent, busy or not, could ever satisfy the labels.
    fn can_satisfy(&self, labels: &BTreeSet<String>) -> bool;
}

/// A single command invocation on an agent.
#[derive(Debug, Clone)]
pub struct CommandRequest {
    pub agent: AgentId,
    /// Human-readable origin, e.g. `test (os=linux) / build`.
    pub label: String,
    pub command: String,
    pub env: HashMap<String, String>,
    pub working_dir: Option<PathBuf>,
    pub timeout: Duration,
}

/// Outcome of a command invocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandOutput {
    /// `None` when the process was killed or ended by a signal.
    pub exit_code: Option<i32>,
    pub duration: Duration,
    pub timed_out: bool,
}

impl CommandOutput {
    pub fn success(&self) -> bool {
        !self.timed_out && self.exit_code == Some(0)
    }
}

/// Runs opaque commands and reports their exit status.
#[async_trait]
pub trait CommandRunner: Send + Sync {
    /// Execute a command, returning once it exits or its timeout elapses.
    ///
    /// `Err` is reserved for commands that could not be started at all.
    async fn execute(&self, request: &CommandRequest) -> Result<CommandOutput>;
}

/// Content-addressed payload storage shared between runs.
#[async_trait]
pub trait CacheStore: Send + Sync {
    /// Fetch the payload stored under `key`, if any.
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>>;

    /// Store a payload under `key`, replacing any previous one. Returns the
    /// store-specific locator of the payload.
    async fn put(&self, key: &str, payload: Vec<u8>) -> Result<String>;
}
