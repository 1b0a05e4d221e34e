//! Step execution engine for Gantry.

pub mod executor;
pub mod retry;
pub mod shell;

pub use executor::{ExecutionContext, ExecutorConfig, StepExecutor};
pub use retry::backoff_delay;
pub use shell::{OutputLine, OutputStream, ShellRunner};
