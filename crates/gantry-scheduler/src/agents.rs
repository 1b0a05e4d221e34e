//! In-memory agent pool.

use async_trait::async_trait;
use gantry_core::agent::Agent;
use gantry_core::ports::AgentProvider;
use gantry_core::{Error, Result};
use std::collections::BTreeSet;
use std::sync::{Mutex, MutexGuard};
use tokio::sync::Notify;
use tracing::debug;

/// A fixed set of agents leased out exclusively, one job at a time.
#[derive(Debug, Default)]
pub struct AgentPool {
    agents: Mutex<Vec<Agent>>,
    released: Notify,
}

impl AgentPool {
    pub fn new(agents: impl IntoIterator<Item = Agent>) -> Self {
        Self {
            agents: Mutex::new(agents.into_iter().collect()),
            released: Notify::new(),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Vec<Agent>> {
        self.agents.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Add an agent; blocked acquirers are woken.
    pub fn register(&self, agent: Agent) {
        self.lock().push(agent);
        self.released.notify_waiters();
    }

    /// Snapshot of every agent and its busy flag.
    pub fn agents(&self) -> Vec<Agent> {
        self.lock().clone()
    }

    pub fn idle_count(&self) -> usize {
        self.lock().iter().filter(|a| a.is_available()).count()
    }

    fn try_claim(&self, labels: &BTreeSet<String>) -> Option<Agent> {
        let mut agents = self.lock();
        let agent = agents
            .iter_mut()
            .find(|a| a.is_available() && a.satisfies(labels))?;
        agent.busy = true;
        Some(agent.clone())
    }
}

#[async_trait]
impl AgentProvider for AgentPool {
    async fn acquire(&self, labels: &BTreeSet<String>) -> Result<Agent> {
        loop {
            // Register interest before checking so a release between the
            // check and the await is not missed.
            let released = self.released.notified();
            tokio::pin!(released);
            released.as_mut().enable();

            if let Some(agent) = self.try_claim(labels) {
                debug!(agent = %agent.id, ?labels, "Agent leased");
                return Ok(agent);
            }
            if !self.can_satisfy(labels) {
                return Err(Error::Scheduling {
                    labels: labels.iter().cloned().collect(),
                });
            }
            released.await;
        }
    }

    async fn release(&self, agent: Agent) {
        {
            let mut agents = self.lock();
            if let Some(slot) = agents.iter_mut().find(|a| a.id == agent.id) {
                slot.busy = false;
            }
        }
        debug!(agent = %agent.id, "Agent released");
        self.released.notify_waiters();
    }

    fn can_satisfy(&self, labels: &BTreeSet<String>) -> bool {
        self.lock().iter().any(|a| a.satisfies(labels))
    }
}
