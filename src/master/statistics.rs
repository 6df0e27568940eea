//! Durable bookkeeping of task outcomes
//!
//! Runs as an actor: the master sends every decoded event to the recorder's
//! inbox and the recorder task owns all statistics writes.

use chrono::Utc;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info};

use crate::domain::{LastStatisticsRecord, StatisticsRecord, TaskCompletionEvent};
use crate::ledger::{FjallStore, LedgerError};
use crate::observability::Metrics;

#[derive(Debug, Error)]
pub enum RecorderError {
    #[error("Ledger error: {0}")]
    Ledger(#[from] LedgerError),

    #[error("Job not found: {0}")]
    UnknownJob(String),
}

/// What one `record` call changed
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Recorded {
    pub statistics_id: String,
    /// False when the historical record already existed
    pub appended: bool,
    /// False when the stored last record is newer than the event
    pub last_updated: bool,
}

pub struct StatisticsRecorder {
    ledger: FjallStore,
    metrics: Arc<Metrics>,
}

impl StatisticsRecorder {
    pub fn new(ledger: FjallStore, metrics: Arc<Metrics>) -> Self {
        Self { ledger, metrics }
    }

    pub fn record(&self, event: &TaskCompletionEvent) -> Result<Recorded, RecorderError> {
        let job = self
            .ledger
            .get_job(&event.job_id)?
            .ok_or_else(|| RecorderError::UnknownJob(event.job_id.clone()))?;
        let resource = self.ledger.get_resource(&event.resource_id)?;
        let active = resource.as_ref().is_none_or(|r| r.active);
        let now = Utc::now();

        let record = StatisticsRecord::from_event(event, &job, active, now);
        let appended = self
            .ledger
            .get_statistics(&record.resource_id, &event.job_id, event.task_type)?
            .is_none();
        if appended {
            self.ledger.put_statistics(&record)?;
        }

        let last = match self.ledger.get_last_statistics(&record.key())? {
            None => Some(LastStatisticsRecord::from_statistics(&record, now)),
            Some(existing) if existing.is_superseded_by(&record) => {
                Some(existing.with_update(&record, now))
            }
            Some(existing) => {
                debug!(
                    resource_id = %record.resource_id,
                    stored = %existing.measurements.completed_at,
                    received = %record.measurements.completed_at,
                    "Stale completion, last statistics kept"
                );
                None
            }
        };
        let last_updated = last.is_some();

        if let Some(last) = last {
            self.ledger.put_last_statistics(&last)?;
            if let Some(resource) = resource {
                let pointed = resource.with_last_stats(&record.id, event.outcome.redirection_path.clone());
                self.ledger.upsert_resource(&pointed)?;
            }
        }

        self.metrics.statistics_recorded();
        debug!(
            statistics_id = %record.id,
            task_type = record.task_type.as_str(),
            appended,
            last_updated,
            "Statistics recorded"
        );

        Ok(Recorded {
            statistics_id: record.id,
            appended,
            last_updated,
        })
    }
}

/// Start the recorder actor; it stops once every inbox sender is dropped
pub fn spawn_recorder(
    recorder: StatisticsRecorder,
    inbox_size: usize,
) -> (mpsc::Sender<TaskCompletionEvent>, JoinHandle<()>) {
    let (sender, mut inbox) = mpsc::channel::<TaskCompletionEvent>(inbox_size);

    let handle = tokio::spawn(async move {
        info!("Statistics recorder started");
        while let Some(event) = inbox.recv().await {
            if let Err(e) = recorder.record(&event) {
                error!(job_id = %event.job_id, task_id = %event.task_id, error = %e, "Failed to record statistics");
            }
        }
        info!("Statistics recorder stopped");
    });

    (sender, handle)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{
        Job, JobTask, ProcessingState, ReferenceOwner, Resource, RetrievalLimits, RetrievalOutcome,
        RetrievingState, StatisticsKey, StorageLocation, SubTaskStats, TaskType, UrlSourceType,
    };
    use chrono::{DateTime, TimeDelta};
    use tempfile::TempDir;

    fn setup() -> (StatisticsRecorder, FjallStore, TempDir) {
        let temp = TempDir::new().unwrap();
        let ledger = FjallStore::open(temp.path().join("ledger")).unwrap();
        ledger
            .upsert_resource(&Resource {
                id: "res-1".into(),
                url: Some("http://origin.test/a".into()),
                owner: ReferenceOwner::default(),
                active: true,
                last_stats_id: None,
                redirection_path: Vec::new(),
            })
            .unwrap();
        for job_id in ["job-1", "job-2"] {
            ledger
                .upsert_job(&Job::new(
                    job_id,
                    ReferenceOwner::default(),
                    UrlSourceType::Object,
                    RetrievalLimits::default(),
                    vec![JobTask {
                        task_type: TaskType::UnconditionalDownload,
                        resource_id: "res-1".into(),
                        sub_tasks: Vec::new(),
                    }],
                ))
                .unwrap();
        }
        (
            StatisticsRecorder::new(ledger.clone(), Arc::new(Metrics::new())),
            ledger,
            temp,
        )
    }

    fn event(job_id: &str, status: u16, completed_at: DateTime<Utc>) -> TaskCompletionEvent {
        let mut outcome = RetrievalOutcome::new(StorageLocation::Memory);
        outcome.http_status = Some(status);
        outcome.redirection_path = vec![format!("http://origin.test/{job_id}")];
        outcome.transition(RetrievingState::Downloading);
        outcome.complete(10);
        TaskCompletionEvent {
            job_id: job_id.into(),
            task_id: format!("{job_id}:0"),
            resource_id: "res-1".into(),
            task_type: TaskType::UnconditionalDownload,
            processing_state: ProcessingState::Success,
            sub_task_stats: SubTaskStats::default(),
            outcome,
            node_id: "node-0".into(),
            completed_at,
        }
    }

    fn key() -> StatisticsKey {
        StatisticsKey {
            resource_id: "res-1".into(),
            task_type: TaskType::UnconditionalDownload,
            url_source_type: UrlSourceType::Object,
        }
    }

    #[test]
    fn test_record_creates_last_statistics_and_points_resource() {
        let (recorder, ledger, _temp) = setup();

        let recorded = recorder.record(&event("job-1", 200, Utc::now())).unwrap();

        assert_eq!(recorded.statistics_id, "res-1-job-1-UNCONDITIONAL_DOWNLOAD");
        assert!(recorded.appended && recorded.last_updated);
        let last = ledger.get_last_statistics(&key()).unwrap().unwrap();
        assert_eq!(last.statistics_id, "res-1-job-1-UNCONDITIONAL_DOWNLOAD");
        let resource = ledger.get_resource("res-1").unwrap().unwrap();
        assert_eq!(resource.last_stats_id.as_deref(), Some("res-1-job-1-UNCONDITIONAL_DOWNLOAD"));
        assert_eq!(resource.redirection_path, vec!["http://origin.test/job-1".to_string()]);
    }

    #[test]
    fn test_duplicate_delivery_appends_once() {
        let (recorder, ledger, _temp) = setup();
        let done = event("job-1", 200, Utc::now());

        recorder.record(&done).unwrap();
        let again = recorder.record(&done).unwrap();

        assert!(!again.appended);
        assert_eq!(ledger.statistics_for_resource("res-1").unwrap().len(), 1);
    }

    #[test]
    fn test_task_types_of_one_job_each_append() {
        let (recorder, ledger, _temp) = setup();
        let now = Utc::now();
        let mut check = event("job-1", 200, now);
        check.task_id = "job-1:1".into();
        check.task_type = TaskType::CheckLink;

        let downloaded = recorder.record(&event("job-1", 200, now)).unwrap();
        let checked = recorder.record(&check).unwrap();

        assert!(downloaded.appended && checked.appended);
        assert_eq!(checked.statistics_id, "res-1-job-1-CHECK_LINK");
        assert_eq!(ledger.statistics_for_resource("res-1").unwrap().len(), 2);
        let check_key = StatisticsKey {
            task_type: TaskType::CheckLink,
            ..key()
        };
        assert_eq!(
            ledger.get_last_statistics(&check_key).unwrap().unwrap().statistics_id,
            "res-1-job-1-CHECK_LINK"
        );
        assert_eq!(
            ledger.get_last_statistics(&key()).unwrap().unwrap().statistics_id,
            "res-1-job-1-UNCONDITIONAL_DOWNLOAD"
        );
        assert_eq!(
            ledger.get_resource("res-1").unwrap().unwrap().last_stats_id.as_deref(),
            Some("res-1-job-1-CHECK_LINK")
        );
    }

    #[test]
    fn test_stale_event_keeps_newer_last_statistics() {
        let (recorder, ledger, _temp) = setup();
        let now = Utc::now();

        recorder.record(&event("job-2", 404, now)).unwrap();
        let stale = recorder
            .record(&event("job-1", 200, now - TimeDelta::minutes(5)))
            .unwrap();

        assert!(stale.appended);
        assert!(!stale.last_updated);
        let last = ledger.get_last_statistics(&key()).unwrap().unwrap();
        assert_eq!(last.measurements.http_status, Some(404));
        assert_eq!(ledger.statistics_for_resource("res-1").unwrap().len(), 2);
    }

    #[test]
    fn test_unknown_job_is_rejected() {
        let (recorder, _ledger, _temp) = setup();
        assert!(matches!(
            recorder.record(&event("job-x", 200, Utc::now())),
            Err(RecorderError::UnknownJob(_))
        ));
    }

    #[tokio::test]
    async fn test_recorder_actor_drains_inbox() {
        let (recorder, ledger, _temp) = setup();
        let (inbox, handle) = spawn_recorder(recorder, 4);

        inbox.send(event("job-1", 200, Utc::now())).await.unwrap();
        drop(inbox);
        handle.await.unwrap();

        assert!(
            ledger
                .get_statistics("res-1", "job-1", TaskType::UnconditionalDownload)
                .unwrap()
                .is_some()
        );
    }
}
