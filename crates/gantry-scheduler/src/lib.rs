//! Run coordination and job scheduling for Gantry.
//!
//! Trigger events flow through [`EventIngest`] into the
//! [`ConcurrencyCoordinator`], are expanded by the [`MatrixExpander`],
//! placed on agents by the [`Scheduler`] and executed by the step executor;
//! the [`RunAggregator`] folds the outcome. [`Engine`] wires them together.

pub mod agents;
pub mod aggregator;
pub mod bus;
pub mod concurrency;
pub mod engine;
pub mod matrix;
pub mod scheduler;
pub mod triggers;

pub use agents::AgentPool;
pub use aggregator::{RunAggregator, RunSummary};
pub use bus::BroadcastEventBus;
pub use concurrency::{ConcurrencyCoordinator, RunHandle, RunSignal};
pub use engine::{Engine, EngineOptions, RunTicket};
pub use matrix::MatrixExpander;
pub use scheduler::{Lease, Placement, Schedule, Scheduler, SchedulerConfig};
pub use triggers::{EventIngest, TriggerEvent, TriggerMatcher};
