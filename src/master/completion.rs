//! Job completion detection
//!
//! Every completion event runs a check-then-act sequence under the job's
//! accounting lock: record the task's terminal state, then, if every task of
//! the job is terminal and the job's declared task count is reached, persist
//! `FINISHED` and retire the accounting entry. Retiring happens while the
//! lock is still held, so a later or duplicate event finds no entry and has
//! no effect.
//!
//! [`JobCompletionDetector::reconcile`] runs the same check for a job whose
//! last event was skipped or whose finish failed to persist, taking task
//! outcomes from the recorded statistics.

use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{OwnedMutexGuard, broadcast};
use tokio::time::timeout;
use tracing::{debug, error, info, warn};

use super::accountant::{JobAccount, Recorded, TaskAccountant};
use crate::domain::{JobState, TaskCompletionEvent};
use crate::ledger::{FjallStore, LedgerError};
use crate::observability::Metrics;

#[derive(Debug, Error)]
pub enum CompletionError {
    #[error("Accounting query for job {job_id} exceeded {bound:?}")]
    CollaboratorTimeout { job_id: String, bound: Duration },

    #[error("Ledger error: {0}")]
    Ledger(#[from] LedgerError),
}

/// Effect of one event on its job
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompletionStatus {
    /// The job still has outstanding work
    Pending,
    /// This event finished the job
    Finished,
    /// The job is not accounted (unknown, or already finished)
    Ignored,
}

pub struct JobCompletionDetector {
    accountant: Arc<TaskAccountant>,
    ledger: FjallStore,
    metrics: Arc<Metrics>,
    query_timeout: Duration,
    finished: broadcast::Sender<String>,
}

impl JobCompletionDetector {
    pub fn new(
        accountant: Arc<TaskAccountant>,
        ledger: FjallStore,
        metrics: Arc<Metrics>,
        query_timeout: Duration,
        finished: broadcast::Sender<String>,
    ) -> Self {
        Self {
            accountant,
            ledger,
            metrics,
            query_timeout,
            finished,
        }
    }

    pub async fn on_completion(
        &self,
        event: &TaskCompletionEvent,
    ) -> Result<CompletionStatus, CompletionError> {
        let job_id = event.job_id.as_str();

        let Some(mut account) = self.lock_account(job_id).await? else {
            debug!(job_id, task_id = %event.task_id, "Completion for unaccounted job ignored");
            self.metrics.event_ignored();
            return Ok(CompletionStatus::Ignored);
        };

        let recorded = self
            .accountant
            .apply(&mut account, job_id, &event.task_id, event.task_state())
            .await;
        if recorded != Recorded::Updated {
            self.metrics.event_ignored();
        }

        self.finish_if_complete(job_id, account).await
    }

    /// Re-check a job outside the event path. Outstanding tasks with a
    /// recorded statistics entry take that entry's task state first.
    pub async fn reconcile(&self, job_id: &str) -> Result<CompletionStatus, CompletionError> {
        let Some(mut account) = self.lock_account(job_id).await? else {
            return Ok(CompletionStatus::Ignored);
        };

        for record in account.outstanding() {
            let task = &record.task;
            if let Some(stats) = self
                .ledger
                .get_statistics(&task.resource_id, job_id, task.task_type)?
            {
                debug!(job_id, task_id = %task.id, "Completion recovered from statistics");
                self.accountant
                    .apply(&mut account, job_id, &task.id, stats.measurements.task_state)
                    .await;
            }
        }

        let status = self.finish_if_complete(job_id, account).await?;
        if status == CompletionStatus::Finished {
            info!(job_id, "Job finished by reconciliation");
        }
        Ok(status)
    }

    async fn lock_account(
        &self,
        job_id: &str,
    ) -> Result<Option<OwnedMutexGuard<JobAccount>>, CompletionError> {
        match timeout(self.query_timeout, self.accountant.lock_job(job_id)).await {
            Ok(account) => Ok(account),
            Err(_) => {
                self.metrics.collaborator_timeout();
                warn!(job_id, bound = ?self.query_timeout, "Accounting query timed out");
                Err(CompletionError::CollaboratorTimeout {
                    job_id: job_id.to_string(),
                    bound: self.query_timeout,
                })
            }
        }
    }

    async fn finish_if_complete(
        &self,
        job_id: &str,
        account: OwnedMutexGuard<JobAccount>,
    ) -> Result<CompletionStatus, CompletionError> {
        if !account.all_terminal() {
            return Ok(CompletionStatus::Pending);
        }

        let expected = match self.ledger.get_job(job_id)? {
            Some(job) => job.tasks.len(),
            None => {
                warn!(job_id, "Accounted job missing from ledger");
                account.len()
            }
        };
        if account.len() < expected {
            debug!(job_id, accounted = account.len(), expected, "Job partially dispatched");
            return Ok(CompletionStatus::Pending);
        }

        if let Err(e) = self.ledger.update_job_state(job_id, JobState::Finished) {
            error!(job_id, error = %e, "Failed to persist finished job");
            return Err(e.into());
        }

        let tasks = account.len();
        self.accountant.retire(job_id, account).await;
        self.metrics.job_finished();
        // No receivers is fine
        let _ = self.finished.send(job_id.to_string());
        info!(job_id, tasks, "Job finished");

        Ok(CompletionStatus::Finished)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{
        Job, JobTask, ProcessingState, ReferenceOwner, RetrievalLimits, RetrievalOutcome,
        RetrieveTask, StatisticsRecord, StorageLocation, SubTaskStats, TaskState, TaskType,
        UrlSourceType,
    };
    use chrono::Utc;
    use std::collections::BTreeMap;
    use tempfile::TempDir;

    struct Fixture {
        detector: JobCompletionDetector,
        accountant: Arc<TaskAccountant>,
        ledger: FjallStore,
        metrics: Arc<Metrics>,
        finished: broadcast::Receiver<String>,
        _temp: TempDir,
    }

    fn fixture() -> Fixture {
        let temp = TempDir::new().unwrap();
        let ledger = FjallStore::open(temp.path().join("ledger")).unwrap();
        let accountant = Arc::new(TaskAccountant::new());
        let metrics = Arc::new(Metrics::new());
        let (sender, finished) = broadcast::channel(16);
        let detector = JobCompletionDetector::new(
            accountant.clone(),
            ledger.clone(),
            metrics.clone(),
            Duration::from_millis(100),
            sender,
        );
        Fixture {
            detector,
            accountant,
            ledger,
            metrics,
            finished,
            _temp: temp,
        }
    }

    async fn seed_job(fx: &Fixture, job_id: &str, declared: usize, assigned: usize) {
        let tasks = (0..declared)
            .map(|i| JobTask {
                task_type: TaskType::UnconditionalDownload,
                resource_id: format!("res-{i}"),
                sub_tasks: Vec::new(),
            })
            .collect();
        let job = Job::new(
            job_id,
            ReferenceOwner::default(),
            UrlSourceType::IsShownBy,
            RetrievalLimits::default(),
            tasks,
        );
        fx.ledger.upsert_job(&job).unwrap();

        for i in 0..assigned {
            let task = RetrieveTask {
                id: job.task_id(i),
                job_id: job_id.into(),
                resource_id: format!("res-{i}"),
                url: None,
                task_type: TaskType::UnconditionalDownload,
                limits: RetrievalLimits::default(),
                previous_headers: BTreeMap::new(),
                sub_tasks: Vec::new(),
                owner: ReferenceOwner::default(),
            };
            fx.accountant
                .assign(job_id, &task.id, task.clone(), "node-0")
                .await
                .unwrap();
        }
    }

    fn event(job_id: &str, index: usize, processing_state: ProcessingState) -> TaskCompletionEvent {
        TaskCompletionEvent {
            job_id: job_id.into(),
            task_id: format!("{job_id}:{index}"),
            resource_id: format!("res-{index}"),
            task_type: TaskType::UnconditionalDownload,
            processing_state,
            sub_task_stats: SubTaskStats::default(),
            outcome: RetrievalOutcome::new(StorageLocation::Memory),
            node_id: "node-0".into(),
            completed_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn test_job_finishes_after_last_task() {
        let mut fx = fixture();
        seed_job(&fx, "job-1", 2, 2).await;

        let first = fx.detector.on_completion(&event("job-1", 0, ProcessingState::Success)).await;
        assert_eq!(first.unwrap(), CompletionStatus::Pending);
        assert_eq!(fx.ledger.get_job("job-1").unwrap().unwrap().state, JobState::Ready);

        // An errored task still counts as terminal
        let second = fx.detector.on_completion(&event("job-1", 1, ProcessingState::Error)).await;
        assert_eq!(second.unwrap(), CompletionStatus::Finished);
        assert_eq!(fx.ledger.get_job("job-1").unwrap().unwrap().state, JobState::Finished);
        assert_eq!(fx.finished.recv().await.unwrap(), "job-1");
        assert!(fx.accountant.states_for_job("job-1").await.is_none());
    }

    #[tokio::test]
    async fn test_duplicate_after_finish_is_ignored() {
        let fx = fixture();
        seed_job(&fx, "job-1", 1, 1).await;

        let done = event("job-1", 0, ProcessingState::Success);
        assert_eq!(fx.detector.on_completion(&done).await.unwrap(), CompletionStatus::Finished);
        assert_eq!(fx.detector.on_completion(&done).await.unwrap(), CompletionStatus::Ignored);
        assert_eq!(fx.metrics.snapshot().jobs_finished, 1);
    }

    #[tokio::test]
    async fn test_partially_dispatched_job_stays_open() {
        let fx = fixture();
        seed_job(&fx, "job-1", 3, 2).await;

        for index in 0..2 {
            let status = fx
                .detector
                .on_completion(&event("job-1", index, ProcessingState::Success))
                .await
                .unwrap();
            assert_eq!(status, CompletionStatus::Pending);
        }
        assert_eq!(fx.metrics.snapshot().jobs_finished, 0);
    }

    #[tokio::test]
    async fn test_reconcile_recovers_skipped_completion_from_statistics() {
        let mut fx = fixture();
        seed_job(&fx, "job-1", 2, 2).await;
        let job = fx.ledger.get_job("job-1").unwrap().unwrap();

        let first = event("job-1", 0, ProcessingState::Success);
        assert_eq!(fx.detector.on_completion(&first).await.unwrap(), CompletionStatus::Pending);
        // The second event reached the recorder but not the detector
        let skipped = event("job-1", 1, ProcessingState::Error);
        fx.ledger
            .put_statistics(&StatisticsRecord::from_event(&skipped, &job, true, Utc::now()))
            .unwrap();

        assert_eq!(fx.detector.reconcile("job-1").await.unwrap(), CompletionStatus::Finished);
        assert_eq!(fx.ledger.get_job("job-1").unwrap().unwrap().state, JobState::Finished);
        assert_eq!(fx.finished.recv().await.unwrap(), "job-1");
        assert_eq!(fx.detector.reconcile("job-1").await.unwrap(), CompletionStatus::Ignored);
    }

    #[tokio::test]
    async fn test_reconcile_leaves_withdrawn_task_job_open() {
        let fx = fixture();
        seed_job(&fx, "job-1", 2, 2).await;
        fx.accountant.withdraw("job-1", "job-1:1").await;

        let first = event("job-1", 0, ProcessingState::Success);
        assert_eq!(fx.detector.on_completion(&first).await.unwrap(), CompletionStatus::Pending);

        assert_eq!(fx.detector.reconcile("job-1").await.unwrap(), CompletionStatus::Pending);
        assert_eq!(fx.ledger.get_job("job-1").unwrap().unwrap().state, JobState::Ready);
        assert_eq!(fx.metrics.snapshot().jobs_finished, 0);
    }

    #[tokio::test]
    async fn test_reconcile_finishes_fully_terminal_job() {
        let fx = fixture();
        seed_job(&fx, "job-1", 1, 1).await;
        // Terminal in accounting, but the finish was never persisted
        fx.accountant
            .record_completion("job-1", "job-1:0", TaskState::Done)
            .await;

        assert_eq!(fx.detector.reconcile("job-1").await.unwrap(), CompletionStatus::Finished);
        assert_eq!(fx.ledger.get_job("job-1").unwrap().unwrap().state, JobState::Finished);
    }

    #[tokio::test]
    async fn test_locked_job_times_out() {
        let fx = fixture();
        seed_job(&fx, "job-1", 1, 1).await;
        let _held = fx.accountant.lock_job("job-1").await.unwrap();

        let result = fx.detector.on_completion(&event("job-1", 0, ProcessingState::Success)).await;

        assert!(matches!(result, Err(CompletionError::CollaboratorTimeout { .. })));
        assert_eq!(fx.metrics.snapshot().collaborator_timeouts, 1);
    }
}
