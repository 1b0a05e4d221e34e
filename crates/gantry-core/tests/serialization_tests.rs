//! Serialization tests for gantry-core types.

use chrono::Utc;
use gantry_core::events::*;
use gantry_core::ids::*;
use gantry_core::run::*;
use gantry_core::workflow::*;
use pretty_assertions::assert_eq;

const CI_WORKFLOW: &str = r#"
name: ci
triggers:
  - type: push
    branches: ["main"]
  - type: pull_request
  - type: workflow_dispatch
concurrency:
  group: "${{ workflow }}-${{ ref_name }}-${{ pr_number || sha }}"
  cancel_in_progress: true
env:
  CARGO_TERM_COLOR: always
jobs:
  - name: fmt
    runs_on: ["os=ubuntu-large"]
    steps:
      - name: check
        run: cargo fmt --all --check
  - name: test
    runs_on: ["os=${{ matrix.os }}"]
    fail_fast: false
    strategy:
      matrix:
        os: [ubuntu-large, windows-large, macos-14]
        toolchain: [stable]
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
          base_delay_ms: 500
      - name: test
        run: cargo test --no-fail-fast
        cache: [cargo]
"#;

#[test]
fn test_workflow_yaml_defaults_and_aliases() {
    let wf: WorkflowDefinition = serde_yaml::from_str(CI_WORKFLOW).expect("parse");
    wf.validate().expect("valid");

    assert_eq!(wf.triggers.len(), 3);
    assert_eq!(wf.triggers[2].kind, TriggerKind::WorkflowDispatch);
    assert!(wf.concurrency.as_ref().unwrap().cancel_in_progress);

    let fmt = wf.job("fmt").unwrap();
    assert!(fmt.fail_fast);
    assert_eq!(fmt.steps[0].command, "cargo fmt --all --check");
    assert!(fmt.steps[0].retry_policy.is_none());

    let test = wf.job("test").unwrap();
    assert!(!test.fail_fast);
    let retry = test.steps[0].retry_policy.as_ref().unwrap();
    assert_eq!(retry.max_attempts, 3);
    assert_eq!(retry.base_delay_ms, 500);
    assert_eq!(test.steps[1].cache, vec!["cargo".to_string()]);
}

#[test]
fn test_matrix_axes_keep_declaration_order() {
    let wf: WorkflowDefinition = serde_yaml::from_str(CI_WORKFLOW).expect("parse");
    let axes: Vec<&String> = wf.job("test").unwrap().strategy.axes.keys().collect();
    assert_eq!(axes, vec!["os", "toolchain"]);
}

#[test]
fn test_run_result_roundtrip() {
    let result = RunResult {
        run_id: RunId::new(),
        workflow: "ci".to_string(),
        group_key: "ci-main-abc".to_string(),
        job_results: vec![],
        overall_status: RunStatus::Cancelled,
        cancel_reason: Some(CancelReason::Superseded),
        started_at: Utc::now(),
        completed_at: Utc::now(),
    };

    let json = serde_json::to_string(&result).expect("serialize");
    let parsed: RunResult = serde_json::from_str(&json).expect("deserialize");

    assert_eq!(parsed.run_id, result.run_id);
    assert_eq!(parsed.overall_status, RunStatus::Cancelled);
    assert_eq!(parsed.cancel_reason, Some(CancelReason::Superseded));
}

#[test]
fn test_event_is_tagged_by_type() {
    let event = Event::StepRetrying(StepRetryingPayload {
        run_id: RunId::new(),
        job_id: JobId::new(),
        step: "fetch".to_string(),
        attempt: 2,
        max_attempts: 3,
        delay_ms: 1000,
    });

    let value = serde_json::to_value(&event).expect("serialize");
    assert_eq!(value["type"], "step_retrying");
    assert_eq!(value["attempt"], 2);
    assert!(event.subject().starts_with("step.retrying.run_"));
}
