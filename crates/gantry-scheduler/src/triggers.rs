//! Event ingest: trigger matching and normalization into run requests.

use chrono::Utc;
use gantry_core::run::RunRequest;
use gantry_core::workflow::{TriggerConfig, TriggerKind, WorkflowDefinition};

/// A raw trigger occurrence as reported by the source host.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TriggerEvent {
    Push {
        branch: String,
        sha: String,
    },
    PullRequest {
        number: u64,
        head_sha: String,
        /// Branch the pull request targets; branch filters apply to it.
        base_branch: String,
    },
    WorkflowDispatch {
        ref_name: String,
        sha: String,
    },
}

impl TriggerEvent {
    pub fn kind(&self) -> TriggerKind {
        match self {
            TriggerEvent::Push { .. } => TriggerKind::Push,
            TriggerEvent::PullRequest { .. } => TriggerKind::PullRequest,
            TriggerEvent::WorkflowDispatch { .. } => TriggerKind::WorkflowDispatch,
        }
    }

    /// Branch the trigger's `branches` filter is matched against.
    pub fn filter_branch(&self) -> &str {
        match self {
            TriggerEvent::Push { branch, .. } => short_branch(branch),
            TriggerEvent::PullRequest { base_branch, .. } => short_branch(base_branch),
            TriggerEvent::WorkflowDispatch { ref_name, .. } => short_branch(ref_name),
        }
    }
}

fn short_branch(name: &str) -> &str {
    name.strip_prefix("refs/heads/").unwrap_or(name)
}

/// Decides whether a workflow accepts an event.
#[derive(Debug, Default, Clone, Copy)]
pub struct TriggerMatcher;

impl TriggerMatcher {
    pub fn new() -> Self {
        Self
    }

    /// A workflow without triggers accepts every event.
    pub fn matches(&self, workflow: &WorkflowDefinition, event: &TriggerEvent) -> bool {
        if workflow.triggers.is_empty() {
            return true;
        }
        workflow
            .triggers
            .iter()
            .any(|trigger| self.trigger_matches(trigger, event))
    }

    fn trigger_matches(&self, trigger: &TriggerConfig, event: &TriggerEvent) -> bool {
        trigger.kind == event.kind() && self.branch_matches(&trigger.branches, event.filter_branch())
    }

    fn branch_matches(&self, patterns: &[String], branch: &str) -> bool {
        if patterns.is_empty() {
            return true;
        }
        patterns.iter().any(|p| glob_match(p, branch))
    }
}

/// Branch glob: `*` and `**` match anything, `prefix/*` one level,
/// `prefix/**` any depth, and a single `*` elsewhere matches any run of
/// characters.
pub fn glob_match(pattern: &str, text: &str) -> bool {
    if pattern == "*" || pattern == "**" {
        return true;
    }
    if let Some(prefix) = pattern.strip_suffix("/**") {
        return text
            .strip_prefix(prefix)
            .is_some_and(|rest| rest.starts_with('/'));
    }
    if let Some(prefix) = pattern.strip_suffix("/*") {
        return text
            .strip_prefix(prefix)
            .and_then(|rest| rest.strip_prefix('/'))
            .is_some_and(|rest| !rest.is_empty() && !rest.contains('/'));
    }
    if let Some((head, tail)) = pattern.split_once('*') {
        return text.len() >= head.len() + tail.len()
            && text.starts_with(head)
            && text.ends_with(tail);
    }
    pattern == text
}

/// Normalizes trigger events into canonical [`RunRequest`]s.
#[derive(Debug, Default, Clone, Copy)]
pub struct EventIngest {
    matcher: TriggerMatcher,
}

impl EventIngest {
    pub fn new() -> Self {
        Self::default()
    }

    /// Canonical request for an event, stamped with the current time.
    pub fn normalize(&self, event: &TriggerEvent) -> RunRequest {
        let (git_ref, ref_name, pull_request_id, commit_sha) = match event {
            TriggerEvent::Push { branch, sha } => {
                let name = short_branch(branch);
                (format!("refs/heads/{}", name), name.to_string(), None, sha.clone())
            }
            TriggerEvent::PullRequest {
                number, head_sha, ..
            } => (
                format!("refs/pull/{}/merge", number),
                format!("{}/merge", number),
                Some(*number),
                head_sha.clone(),
            ),
            TriggerEvent::WorkflowDispatch { ref_name, sha } => {
                let name = short_branch(ref_name);
                (format!("refs/heads/{}", name), name.to_string(), None, sha.clone())
            }
        };

        RunRequest {
            trigger_kind: event.kind(),
            git_ref,
            ref_name,
            pull_request_id,
            commit_sha,
            dispatched_at: Utc::now(),
        }
    }

    /// Request for `event` if `workflow` is triggered by it.
    pub fn ingest(&self, workflow: &WorkflowDefinition, event: &TriggerEvent) -> Option<RunRequest> {
        if !self.matcher.matches(workflow, event) {
            tracing::debug!(
                workflow = %workflow.name,
                kind = %event.kind(),
                branch = event.filter_branch(),
                "Event matches no trigger"
            );
            return None;
        }
        Some(self.normalize(event))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn workflow(triggers: Vec<TriggerConfig>) -> WorkflowDefinition {
        WorkflowDefinition {
            name: "ci".to_string(),
            triggers,
            concurrency: None,
            env: HashMap::new(),
            jobs: vec![],
        }
    }

    fn trigger(kind: TriggerKind, branches: &[&str]) -> TriggerConfig {
        TriggerConfig {
            kind,
            branches: branches.iter().map(|s| s.to_string()).collect(),
        }
    }

    #[test]
    fn test_glob_match() {
        assert!(glob_match("main", "main"));
        assert!(!glob_match("main", "develop"));
        assert!(glob_match("feature/*", "feature/foo"));
        assert!(!glob_match("feature/*", "feature/foo/bar"));
        assert!(!glob_match("feature/*", "feature"));
        assert!(glob_match("release/**", "release/v1/hotfix"));
        assert!(!glob_match("release/**", "releases/v1"));
        assert!(glob_match("v*-rc", "v1.2-rc"));
        assert!(glob_match("*", "anything/at/all"));
    }

    #[test]
    fn test_push_filtered_by_branch() {
        let wf = workflow(vec![trigger(TriggerKind::Push, &["main"])]);
        let ingest = EventIngest::new();

        let main = TriggerEvent::Push {
            branch: "refs/heads/main".to_string(),
            sha: "abc".to_string(),
        };
        let other = TriggerEvent::Push {
            branch: "topic".to_string(),
            sha: "abc".to_string(),
        };
        assert!(ingest.ingest(&wf, &main).is_some());
        assert!(ingest.ingest(&wf, &other).is_none());
    }

    #[test]
    fn test_pull_request_normalized() {
        let wf = workflow(vec![
            trigger(TriggerKind::Push, &["main"]),
            trigger(TriggerKind::PullRequest, &[]),
        ]);
        let event = TriggerEvent::PullRequest {
            number: 42,
            head_sha: "deadbeef".to_string(),
            base_branch: "main".to_string(),
        };

        let request = EventIngest::new().ingest(&wf, &event).unwrap();
        assert_eq!(request.trigger_kind, TriggerKind::PullRequest);
        assert_eq!(request.git_ref, "refs/pull/42/merge");
        assert_eq!(request.ref_name, "42/merge");
        assert_eq!(request.pull_request_id, Some(42));
        assert_eq!(request.commit_sha, "deadbeef");
    }

    #[test]
    fn test_kind_must_match() {
        let wf = workflow(vec![trigger(TriggerKind::Push, &[])]);
        let dispatch = TriggerEvent::WorkflowDispatch {
            ref_name: "main".to_string(),
            sha: "abc".to_string(),
        };
        assert!(!TriggerMatcher::new().matches(&wf, &dispatch));
        assert!(TriggerMatcher::new().matches(&workflow(vec![]), &dispatch));
    }
}
