//! End-to-end test infrastructure for Gantry.
//!
//! Provides workflow fixtures, a scripted command runner and an event
//! recorder so engine tests can run whole workflows without spawning
//! processes.
//!
//! # Usage
//!
//! ```ignore
//! use gantry_tests::{ScriptedRunner, WorkflowFixture, TestEngine};
//!
//! #[tokio::test]
//! async fn test_something() {
//!     let runner = ScriptedRunner::new().script("cargo test", [1, 0]);
//!     let engine = TestEngine::new(WorkflowFixture::ci()).runner(runner).build();
//!     // engine.handle_event(...)
//! }
//! ```

pub mod fixtures;
pub mod helpers;

pub use fixtures::*;
pub use helpers::*;

/// Initialize test logging (call once per test binary).
pub fn init_test_logging() {
    use tracing_subscriber::{EnvFilter, fmt};

    let _ = fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("warn,gantry_scheduler=debug")),
        )
        .with_test_writer()
        .try_init();
}
