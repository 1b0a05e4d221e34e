//! Run aggregation: folds job results into a run result.

use chrono::{DateTime, Utc};
use gantry_core::RunId;
use gantry_core::run::{CancelReason, JobResult, JobStatus, RunResult, RunStatus};

/// Computes run outcomes from job outcomes.
#[derive(Debug, Default, Clone, Copy)]
pub struct RunAggregator;

impl RunAggregator {
    pub fn new() -> Self {
        Self
    }

    /// `Cancelled` if the run was cancelled before any job settled as
    /// non-cancelled. Otherwise `Failure` if any job failed, then `Cancelled`
    /// if the run or any job was cancelled, then `Success`.
    pub fn overall_status(
        &self,
        job_results: &[JobResult],
        cancelled: bool,
        settled_before_cancel: bool,
    ) -> RunStatus {
        if cancelled && !settled_before_cancel {
            RunStatus::Cancelled
        } else if job_results.iter().any(|j| j.status == JobStatus::Failure) {
            RunStatus::Failure
        } else if cancelled || job_results.iter().any(|j| j.status == JobStatus::Cancelled) {
            RunStatus::Cancelled
        } else {
            RunStatus::Success
        }
    }

    pub fn aggregate(&self, run: RunSummary, job_results: Vec<JobResult>) -> RunResult {
        let overall_status = self.overall_status(
            &job_results,
            run.cancel_reason.is_some(),
            run.settled_before_cancel,
        );
        RunResult {
            run_id: run.run_id,
            workflow: run.workflow,
            group_key: run.group_key,
            job_results,
            overall_status,
            cancel_reason: run.cancel_reason,
            started_at: run.started_at,
            completed_at: Utc::now(),
        }
    }
}

/// Run-level facts the aggregator does not derive from job results.
#[derive(Debug, Clone)]
pub struct RunSummary {
    pub run_id: RunId,
    pub workflow: String,
    pub group_key: String,
    pub cancel_reason: Option<CancelReason>,
    /// Some job finished as non-cancelled before the cancel signal.
    pub settled_before_cancel: bool,
    pub started_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use gantry_core::JobId;

    fn job(status: JobStatus) -> JobResult {
        JobResult {
            job_id: JobId::new(),
            template: "test".to_string(),
            name: "test".to_string(),
            matrix: Default::default(),
            agent: None,
            status,
            steps: vec![],
            error: None,
            caches_restored: vec![],
            caches_saved: vec![],
            duration_ms: 0,
        }
    }

    fn summary(cancel_reason: Option<CancelReason>) -> RunSummary {
        RunSummary {
            run_id: RunId::new(),
            workflow: "ci".to_string(),
            group_key: "ci-main".to_string(),
            cancel_reason,
            settled_before_cancel: false,
            started_at: Utc::now(),
        }
    }

    #[test]
    fn test_one_failure_fails_run() {
        let jobs = vec![
            job(JobStatus::Success),
            job(JobStatus::Failure),
            job(JobStatus::Success),
            job(JobStatus::Success),
        ];
        let result = RunAggregator::new().aggregate(summary(None), jobs);
        assert_eq!(result.overall_status, RunStatus::Failure);
        assert_eq!(result.exit_code(), 1);
        assert_eq!(result.count(JobStatus::Failure), 1);
        assert_eq!(result.count(JobStatus::Success), 3);
    }

    #[test]
    fn test_cancelled_run_is_never_success() {
        let agg = RunAggregator::new();
        let jobs = vec![job(JobStatus::Success)];
        assert_eq!(agg.overall_status(&jobs, true, true), RunStatus::Cancelled);
        assert_eq!(agg.overall_status(&[], true, false), RunStatus::Cancelled);

        let result = agg.aggregate(summary(Some(CancelReason::Superseded)), jobs);
        assert_eq!(result.overall_status, RunStatus::Cancelled);
        assert_eq!(result.exit_code(), 2);
    }

    #[test]
    fn test_all_success() {
        let jobs = vec![job(JobStatus::Success), job(JobStatus::Success)];
        assert_eq!(RunAggregator::new().overall_status(&jobs, false, false), RunStatus::Success);
    }

    #[test]
    fn test_cancelled_job_without_run_cancel() {
        let jobs = vec![job(JobStatus::Success), job(JobStatus::Cancelled)];
        assert_eq!(RunAggregator::new().overall_status(&jobs, false, false), RunStatus::Cancelled);
    }

    #[test]
    fn test_early_cancel_outranks_failure() {
        let agg = RunAggregator::new();
        let jobs = vec![job(JobStatus::Failure), job(JobStatus::Cancelled)];
        assert_eq!(agg.overall_status(&jobs, true, false), RunStatus::Cancelled);

        // A job already failed when the cancel arrived.
        assert_eq!(agg.overall_status(&jobs, true, true), RunStatus::Failure);

        let result = agg.aggregate(summary(Some(CancelReason::Superseded)), jobs);
        assert_eq!(result.overall_status, RunStatus::Cancelled);
        assert_eq!(result.exit_code(), 2);
    }
}
