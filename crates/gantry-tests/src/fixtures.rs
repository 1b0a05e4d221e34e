//! Test fixtures for creating sample workflows, agents and events.

use gantry_core::agent::Agent;
use gantry_core::workflow::{
    ConcurrencyConfig, JobTemplate, RetryPolicy, StepSpec, Strategy, WorkflowDefinition,
};
use gantry_scheduler::TriggerEvent;

/// A Rust project's CI: format check, lint, and a test matrix over two
/// operating systems and two toolchains with a cargo cache.
pub const CI_WORKFLOW: &str = r#"
name: ci
triggers:
  - type: push
    branches: [main, "release/*"]
  - type: pull_request
  - type: workflow_dispatch
concurrency:
  group: ${{ workflow }}-${{ ref_name }}-${{ pr_number || sha }}
  cancel_in_progress: true
env:
  CARGO_TERM_COLOR: always
jobs:
  - name: fmt
    runs_on: [os=linux]
    steps:
      - name: check
        run: cargo fmt --all -- --check
  - name: clippy
    runs_on: [os=linux]
    steps:
      - name: lint
        run: cargo clippy --all-targets -- -D warnings
  - name: test
    runs_on: ["os=${{ matrix.os }}"]
    strategy:
      matrix:
        os: [linux, macos]
        toolchain: [stable, beta]
    cache:
      - scope: cargo
        key: cargo-${{ matrix.os }}
        hash_files: [Cargo.lock]
        paths: [target]
    steps:
      - name: fetch
        run: cargo fetch
        retry:
          max_attempts: 3
          base_delay_ms: 1
      - name: test
        run: cargo +${{ matrix.toolchain }} test
        cache: [cargo]
"#;

/// Factory for test workflows.
pub struct WorkflowFixture;

impl WorkflowFixture {
    /// The CI workflow above, parsed.
    pub fn ci() -> WorkflowDefinition {
        serde_yaml::from_str(CI_WORKFLOW).expect("CI fixture should parse")
    }

    /// A workflow named `ci` whose runs share a group per ref and supersede
    /// each other.
    pub fn with_jobs(jobs: Vec<JobTemplate>) -> WorkflowDefinition {
        WorkflowDefinition {
            name: "ci".to_string(),
            triggers: vec![],
            concurrency: Some(ConcurrencyConfig {
                group: "${{ workflow }}-${{ ref_name }}".to_string(),
                cancel_in_progress: true,
            }),
            env: Default::default(),
            jobs,
        }
    }

    /// Same as [`Self::with_jobs`] but runs queue instead of superseding.
    pub fn queued(jobs: Vec<JobTemplate>) -> WorkflowDefinition {
        let mut workflow = Self::with_jobs(jobs);
        if let Some(concurrency) = workflow.concurrency.as_mut() {
            concurrency.cancel_in_progress = false;
        }
        workflow
    }
}

/// Factory for job templates and steps.
pub struct JobFixture;

impl JobFixture {
    /// A job with one step per command, named `step-0`, `step-1`, ...
    pub fn job(name: &str, commands: &[&str]) -> JobTemplate {
        JobTemplate {
            name: name.to_string(),
            strategy: Strategy::default(),
            required_labels: Default::default(),
            env: Default::default(),
            steps: commands
                .iter()
                .enumerate()
                .map(|(i, cmd)| Self::step(&format!("step-{}", i), cmd))
                .collect(),
            fail_fast: true,
            max_parallel: None,
            cache: vec![],
        }
    }

    /// A job expanded over one matrix axis.
    pub fn matrix(name: &str, axis: &str, values: &[&str], commands: &[&str]) -> JobTemplate {
        let mut job = Self::job(name, commands);
        job.strategy.axes.insert(
            axis.to_string(),
            serde_json::Value::Array(values.iter().map(|v| serde_json::json!(v)).collect()),
        );
        job
    }

    pub fn step(name: &str, command: &str) -> StepSpec {
        StepSpec {
            name: name.to_string(),
            command: command.to_string(),
            env: Default::default(),
            retry_policy: None,
            continue_on_error: false,
            timeout_seconds: None,
            cache: vec![],
        }
    }

    /// A step retried with a 1ms base delay.
    pub fn retrying(name: &str, command: &str, max_attempts: u32) -> StepSpec {
        StepSpec {
            retry_policy: Some(RetryPolicy {
                max_attempts,
                base_delay_ms: 1,
            }),
            ..Self::step(name, command)
        }
    }
}

/// Factory for agents.
pub struct AgentFixture;

impl AgentFixture {
    pub fn linux(id: &str) -> Agent {
        Agent::new(id, ["os=linux", "arch=x86_64"])
    }

    pub fn macos(id: &str) -> Agent {
        Agent::new(id, ["os=macos", "arch=aarch64"])
    }

    /// Enough agents to run every instance of [`WorkflowFixture::ci`] at once.
    pub fn ci_pool() -> Vec<Agent> {
        vec![
            Self::linux("linux-1"),
            Self::linux("linux-2"),
            Self::linux("linux-3"),
            Self::linux("linux-4"),
            Self::macos("macos-1"),
            Self::macos("macos-2"),
        ]
    }
}

/// Factory for trigger events.
pub struct EventFixture;

impl EventFixture {
    pub fn push(branch: &str, sha: &str) -> TriggerEvent {
        TriggerEvent::Push {
            branch: branch.to_string(),
            sha: sha.to_string(),
        }
    }

    pub fn pull_request(number: u64, head_sha: &str) -> TriggerEvent {
        TriggerEvent::PullRequest {
            number,
            head_sha: head_sha.to_string(),
            base_branch: "main".to_string(),
        }
    }
}
