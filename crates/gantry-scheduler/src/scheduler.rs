//! Job scheduling: pairs job instances with leased agents.

use futures::Stream;
use gantry_core::agent::Agent;
use gantry_core::ports::AgentProvider;
use gantry_core::run::JobInstance;
use gantry_core::Error;
use std::collections::HashMap;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use tokio::sync::{OwnedSemaphorePermit, Semaphore, mpsc};
use tokio::task::JoinSet;
use tokio_stream::wrappers::ReceiverStream;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Scheduler settings.
#[derive(Debug, Clone, Default)]
pub struct SchedulerConfig {
    /// Jobs running at once across every run of this scheduler.
    pub max_concurrent_jobs: Option<usize>,
}

/// Exclusive use of an agent by one job instance.
///
/// Holds the instance's concurrency permits until released. Dropping a lease
/// without calling [`Lease::release`] returns the agent in the background.
pub struct Lease {
    pub instance: JobInstance,
    /// Fires when the run is cancelled or a fail-fast sibling failed.
    pub cancel: CancellationToken,
    agent: Agent,
    agents: Arc<dyn AgentProvider>,
    released: bool,
    _permits: Vec<OwnedSemaphorePermit>,
}

impl Lease {
    pub fn agent(&self) -> &Agent {
        &self.agent
    }

    /// Return the agent to its provider and free the permits.
    pub async fn release(mut self) {
        self.released = true;
        self.agents.release(self.agent.clone()).await;
    }
}

impl Drop for Lease {
    fn drop(&mut self) {
        if self.released {
            return;
        }
        let agent = self.agent.clone();
        let agents = Arc::clone(&self.agents);
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(async move { agents.release(agent).await });
            }
            Err(_) => warn!(agent = %agent.id, "Lease dropped outside a runtime, agent not released"),
        }
    }
}

impl std::fmt::Debug for Lease {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Lease")
            .field("job", &self.instance.name)
            .field("agent", &self.agent.id)
            .finish()
    }
}

/// Outcome of scheduling one instance.
#[derive(Debug)]
pub enum Placement {
    Assigned(Lease),
    /// No agent can ever satisfy the instance's labels.
    Unschedulable { instance: JobInstance, error: Error },
    /// Cancelled while waiting for a permit or an agent.
    Cancelled { instance: JobInstance },
}

impl Placement {
    pub fn instance(&self) -> &JobInstance {
        match self {
            Placement::Assigned(lease) => &lease.instance,
            Placement::Unschedulable { instance, .. } | Placement::Cancelled { instance } => {
                instance
            }
        }
    }
}

/// Placements for one batch of instances, yielded as they are decided.
pub struct Schedule {
    placements: ReceiverStream<Placement>,
    templates: HashMap<String, CancellationToken>,
    _tasks: JoinSet<()>,
}

impl Schedule {
    /// Stop placing instances of `template`; instances already placed see
    /// their lease token fire.
    pub fn cancel_template(&self, template: &str) -> bool {
        match self.templates.get(template) {
            Some(token) if !token.is_cancelled() => {
                token.cancel();
                true
            }
            _ => false,
        }
    }
}

impl Stream for Schedule {
    type Item = Placement;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Placement>> {
        Pin::new(&mut self.placements).poll_next(cx)
    }
}

/// Assigns job instances to agents whose labels cover the instance's
/// required labels.
pub struct Scheduler {
    agents: Arc<dyn AgentProvider>,
    global: Option<Arc<Semaphore>>,
}

impl Scheduler {
    pub fn new(agents: Arc<dyn AgentProvider>, config: SchedulerConfig) -> Self {
        Self {
            agents,
            global: config
                .max_concurrent_jobs
                .map(|n| Arc::new(Semaphore::new(n.max(1)))),
        }
    }

    /// Schedule every instance concurrently. Instances of a template with
    /// `max_parallel` wait for one of that template's slots; all instances
    /// wait for the global limit and then for an eligible agent.
    pub fn schedule(&self, instances: Vec<JobInstance>, cancel: &CancellationToken) -> Schedule {
        let (tx, rx) = mpsc::channel(instances.len().max(1));
        let mut templates: HashMap<String, CancellationToken> = HashMap::new();
        let mut limits: HashMap<String, Arc<Semaphore>> = HashMap::new();
        let mut tasks = JoinSet::new();

        for instance in instances {
            let name = instance.template_name().to_string();
            let token = templates
                .entry(name.clone())
                .or_insert_with(|| cancel.child_token())
                .clone();
            let limit = instance.template.max_parallel.map(|n| {
                limits
                    .entry(name)
                    .or_insert_with(|| Arc::new(Semaphore::new(n.max(1) as usize)))
                    .clone()
            });

            let placer = Placer {
                agents: Arc::clone(&self.agents),
                global: self.global.clone(),
                limit,
                token,
            };
            let tx = tx.clone();
            tasks.spawn(async move {
                let placement = placer.place(instance).await;
                // Capacity covers every instance, so this only fails once the
                // schedule is dropped; the lease then releases itself.
                let _ = tx.try_send(placement);
            });
        }

        Schedule {
            placements: ReceiverStream::new(rx),
            templates,
            _tasks: tasks,
        }
    }
}

struct Placer {
    agents: Arc<dyn AgentProvider>,
    global: Option<Arc<Semaphore>>,
    limit: Option<Arc<Semaphore>>,
    token: CancellationToken,
}

impl Placer {
    async fn place(self, instance: JobInstance) -> Placement {
        let labels = &instance.required_labels;
        if !self.agents.can_satisfy(labels) {
            warn!(job = %instance.name, ?labels, "No agent can satisfy required labels");
            let error = Error::Scheduling {
                labels: labels.iter().cloned().collect(),
            };
            return Placement::Unschedulable { instance, error };
        }

        let mut permits = Vec::with_capacity(2);
        for semaphore in [self.limit.clone(), self.global.clone()].into_iter().flatten() {
            match self.wait(semaphore.acquire_owned()).await {
                Some(Ok(permit)) => permits.push(permit),
                _ => return Placement::Cancelled { instance },
            }
        }

        let agent = match self.wait(self.agents.acquire(labels)).await {
            None => return Placement::Cancelled { instance },
            Some(Ok(agent)) => agent,
            Some(Err(error)) => return Placement::Unschedulable { instance, error },
        };

        if self.token.is_cancelled() {
            self.agents.release(agent).await;
            return Placement::Cancelled { instance };
        }

        debug!(job = %instance.name, agent = %agent.id, "Job placed");
        Placement::Assigned(Lease {
            instance,
            cancel: self.token,
            agent,
            agents: self.agents,
            released: false,
            _permits: permits,
        })
    }

    /// Await `fut` unless the token fires first.
    async fn wait<F: std::future::Future>(&self, fut: F) -> Option<F::Output> {
        tokio::select! {
            biased;
            _ = self.token.cancelled() => None,
            out = fut => Some(out),
        }
    }
}
