//! Concurrency groups: at most one active run per group key.

use gantry_core::RunId;
use gantry_core::run::{CancelReason, RunRequest};
use gantry_core::workflow::WorkflowDefinition;
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard, OnceLock};
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

/// Cancellation signal of one run, remembering the first reason given.
#[derive(Debug, Clone, Default)]
pub struct RunSignal {
    token: CancellationToken,
    reason: Arc<OnceLock<CancelReason>>,
}

impl RunSignal {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self, reason: CancelReason) {
        let _ = self.reason.set(reason);
        self.token.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }

    pub fn reason(&self) -> Option<CancelReason> {
        self.reason.get().copied()
    }

    pub fn token(&self) -> &CancellationToken {
        &self.token
    }

    pub async fn cancelled(&self) {
        self.token.cancelled().await
    }
}

struct Active {
    run_id: RunId,
    signal: RunSignal,
}

struct Pending {
    run_id: RunId,
    signal: RunSignal,
    admit: oneshot::Sender<()>,
}

#[derive(Default)]
struct GroupState {
    current: Option<Active>,
    pending: VecDeque<Pending>,
}

#[derive(Default)]
struct Groups {
    groups: Mutex<HashMap<String, GroupState>>,
}

impl Groups {
    fn lock(&self) -> MutexGuard<'_, HashMap<String, GroupState>> {
        self.groups.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Drop `run_id` from its group, promoting the next live pending run if
    /// it was the current one.
    fn release(&self, key: &str, run_id: RunId) {
        let mut groups = self.lock();
        let Some(group) = groups.get_mut(key) else {
            return;
        };

        if group.current.as_ref().is_some_and(|c| c.run_id == run_id) {
            group.current = None;
            while let Some(next) = group.pending.pop_front() {
                if next.signal.is_cancelled() {
                    continue;
                }
                if next.admit.send(()).is_ok() {
                    debug!(group = %key, run_id = %next.run_id, "Queued run admitted");
                    group.current = Some(Active {
                        run_id: next.run_id,
                        signal: next.signal,
                    });
                    break;
                }
            }
        } else {
            group.pending.retain(|p| p.run_id != run_id);
        }

        if group.current.is_none() && group.pending.is_empty() {
            groups.remove(key);
        }
    }
}

enum Admission {
    Ready,
    Queued(oneshot::Receiver<()>),
    Done,
}

/// A submitted run's membership in its concurrency group.
///
/// Dropping the handle ends the run's membership and admits the next queued
/// run of the group.
pub struct RunHandle {
    run_id: RunId,
    group_key: String,
    signal: RunSignal,
    admission: Admission,
    groups: Arc<Groups>,
}

impl RunHandle {
    pub fn run_id(&self) -> RunId {
        self.run_id
    }

    pub fn group_key(&self) -> &str {
        &self.group_key
    }

    pub fn signal(&self) -> &RunSignal {
        &self.signal
    }

    /// Wait until the run may execute. Returns the cancel reason when the run
    /// was cancelled before being admitted.
    ///
    /// Cancel-safe: dropping the future keeps the run queued.
    pub async fn admitted(&mut self) -> Result<(), CancelReason> {
        let outcome = match &mut self.admission {
            Admission::Ready | Admission::Done => Ok(()),
            Admission::Queued(rx) => {
                tokio::select! {
                    biased;
                    _ = self.signal.cancelled() => Err(()),
                    res = rx => res.map_err(|_| ()),
                }
            }
        };
        self.admission = Admission::Done;
        match outcome {
            Ok(()) if !self.signal.is_cancelled() => Ok(()),
            _ => Err(self.signal.reason().unwrap_or(CancelReason::Superseded)),
        }
    }

    /// End the run's membership in its group.
    pub fn finish(self) {}
}

impl Drop for RunHandle {
    fn drop(&mut self) {
        self.groups.release(&self.group_key, self.run_id);
    }
}

impl std::fmt::Debug for RunHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RunHandle")
            .field("run_id", &self.run_id)
            .field("group_key", &self.group_key)
            .field("cancelled", &self.signal.is_cancelled())
            .finish()
    }
}

/// Serializes runs that share a group key.
#[derive(Clone, Default)]
pub struct ConcurrencyCoordinator {
    groups: Arc<Groups>,
}

impl ConcurrencyCoordinator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Group key for a request. Without a `concurrency` block every run is
    /// its own group.
    pub fn group_key(workflow: &WorkflowDefinition, request: &RunRequest, run_id: RunId) -> String {
        match &workflow.concurrency {
            Some(config) => request
                .interpolation_context(&workflow.name)
                .interpolate(&config.group),
            None => format!("{}-{}", workflow.name, run_id),
        }
    }

    /// Register a new run. With `cancel_in_progress` the group's active run
    /// and every queued request are cancelled; the new run is still only
    /// admitted once the active run has finished.
    pub fn submit(&self, workflow: &WorkflowDefinition, request: &RunRequest) -> RunHandle {
        let run_id = RunId::new();
        let group_key = Self::group_key(workflow, request, run_id);
        let cancel_in_progress = workflow
            .concurrency
            .as_ref()
            .is_some_and(|c| c.cancel_in_progress);
        let signal = RunSignal::new();

        let mut groups = self.groups.lock();
        let group = groups.entry(group_key.clone()).or_default();

        if cancel_in_progress {
            if let Some(current) = &group.current {
                info!(
                    group = %group_key,
                    run_id = %current.run_id,
                    superseded_by = %run_id,
                    "Cancelling in-progress run"
                );
                current.signal.cancel(CancelReason::Superseded);
            }
            for pending in group.pending.drain(..) {
                debug!(group = %group_key, run_id = %pending.run_id, "Dropping queued run");
                pending.signal.cancel(CancelReason::Superseded);
            }
        }

        let admission = if group.current.is_none() {
            group.current = Some(Active {
                run_id,
                signal: signal.clone(),
            });
            Admission::Ready
        } else {
            let (admit, rx) = oneshot::channel();
            group.pending.push_back(Pending {
                run_id,
                signal: signal.clone(),
                admit,
            });
            debug!(group = %group_key, run_id = %run_id, queued = group.pending.len(), "Run queued");
            Admission::Queued(rx)
        };
        drop(groups);

        RunHandle {
            run_id,
            group_key,
            signal,
            admission,
            groups: Arc::clone(&self.groups),
        }
    }

    /// Cancel a run, active or queued. Returns false for unknown runs.
    pub fn cancel(&self, run_id: RunId, reason: CancelReason) -> bool {
        let groups = self.groups.lock();
        for group in groups.values() {
            if let Some(current) = group.current.as_ref().filter(|c| c.run_id == run_id) {
                current.signal.cancel(reason);
                return true;
            }
            if let Some(pending) = group.pending.iter().find(|p| p.run_id == run_id) {
                pending.signal.cancel(reason);
                return true;
            }
        }
        false
    }

    /// The admitted run of a group, if any.
    pub fn current(&self, group_key: &str) -> Option<RunId> {
        self.groups
            .lock()
            .get(group_key)
            .and_then(|g| g.current.as_ref().map(|c| c.run_id))
    }

    /// Number of requests waiting behind the group's current run.
    pub fn queued(&self, group_key: &str) -> usize {
        self.groups
            .lock()
            .get(group_key)
            .map_or(0, |g| g.pending.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use gantry_core::workflow::{ConcurrencyConfig, TriggerKind};
    use std::time::Duration;

    fn workflow(cancel_in_progress: bool) -> WorkflowDefinition {
        WorkflowDefinition {
            name: "ci".to_string(),
            triggers: vec![],
            concurrency: Some(ConcurrencyConfig {
                group: "${{ workflow }}-${{ ref_name }}-${{ pr_number || sha }}".to_string(),
                cancel_in_progress,
            }),
            env: Default::default(),
            jobs: vec![],
        }
    }

    fn request(sha: &str) -> RunRequest {
        RunRequest {
            trigger_kind: TriggerKind::Push,
            git_ref: "refs/heads/main".to_string(),
            ref_name: "main".to_string(),
            pull_request_id: None,
            commit_sha: sha.to_string(),
            dispatched_at: Utc::now(),
        }
    }

    fn pr_request(number: u64, sha: &str) -> RunRequest {
        RunRequest {
            trigger_kind: TriggerKind::PullRequest,
            git_ref: format!("refs/pull/{}/merge", number),
            ref_name: format!("{}/merge", number),
            pull_request_id: Some(number),
            commit_sha: sha.to_string(),
            dispatched_at: Utc::now(),
        }
    }

    #[test]
    fn test_group_key_prefers_pr_number() {
        let wf = workflow(true);
        let run_id = RunId::new();
        assert_eq!(
            ConcurrencyCoordinator::group_key(&wf, &pr_request(7, "a"), run_id),
            "ci-7/merge-7"
        );
        assert_eq!(
            ConcurrencyCoordinator::group_key(&wf, &request("abc"), run_id),
            "ci-main-abc"
        );
    }

    #[test]
    fn test_without_concurrency_every_run_is_its_own_group() {
        let mut wf = workflow(true);
        wf.concurrency = None;
        let coordinator = ConcurrencyCoordinator::new();
        let a = coordinator.submit(&wf, &request("x"));
        let b = coordinator.submit(&wf, &request("x"));
        assert_ne!(a.group_key(), b.group_key());
    }

    #[tokio::test]
    async fn test_cancel_in_progress_supersedes_active_run() {
        let wf = workflow(true);
        let coordinator = ConcurrencyCoordinator::new();

        let mut first = coordinator.submit(&wf, &pr_request(1, "a"));
        assert!(first.admitted().await.is_ok());

        let mut second = coordinator.submit(&wf, &pr_request(1, "b"));
        assert_eq!(first.signal().reason(), Some(CancelReason::Superseded));
        assert_eq!(coordinator.current(first.group_key()), Some(first.run_id()));

        // The new run waits until the superseded one has wound down.
        let waiting = tokio::time::timeout(Duration::from_millis(20), second.admitted()).await;
        assert!(waiting.is_err());

        let key = first.group_key().to_string();
        first.finish();
        assert!(second.admitted().await.is_ok());
        assert_eq!(coordinator.current(&key), Some(second.run_id()));
    }

    #[tokio::test]
    async fn test_queues_without_cancel_in_progress() {
        let wf = workflow(false);
        let coordinator = ConcurrencyCoordinator::new();

        let mut first = coordinator.submit(&wf, &request("a"));
        first.admitted().await.unwrap();
        let mut second = coordinator.submit(&wf, &request("a"));
        let key = first.group_key().to_string();

        assert!(!first.signal().is_cancelled());
        assert_eq!(coordinator.queued(&key), 1);

        drop(first);
        assert!(second.admitted().await.is_ok());
        assert_eq!(coordinator.queued(&key), 0);
    }

    #[tokio::test]
    async fn test_queued_runs_cancelled_by_newer_submission() {
        let wf = workflow(true);
        let coordinator = ConcurrencyCoordinator::new();

        let mut first = coordinator.submit(&wf, &request("a"));
        first.admitted().await.unwrap();
        let mut second = coordinator.submit(&wf, &request("a"));
        let mut third = coordinator.submit(&wf, &request("a"));

        assert_eq!(second.admitted().await, Err(CancelReason::Superseded));
        drop(second);
        drop(first);
        assert!(third.admitted().await.is_ok());
    }

    #[tokio::test]
    async fn test_user_cancel_of_queued_run() {
        let wf = workflow(false);
        let coordinator = ConcurrencyCoordinator::new();

        let mut first = coordinator.submit(&wf, &request("a"));
        first.admitted().await.unwrap();
        let mut second = coordinator.submit(&wf, &request("a"));

        assert!(coordinator.cancel(second.run_id(), CancelReason::UserRequested));
        assert_eq!(second.admitted().await, Err(CancelReason::UserRequested));
        assert!(!coordinator.cancel(RunId::new(), CancelReason::UserRequested));
    }
}
