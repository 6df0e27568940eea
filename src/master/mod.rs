//! Master side of the harvester
//!
//! Completion events arrive as protobuf bytes over an at-least-once channel.
//! Each decoded event goes to two independent consumers:
//! - the statistics recorder actor (inbox)
//! - the job completion detector, run concurrently up to
//!   `master.max_concurrent_events` events at a time
//!
//! Per-job ordering comes from the accountant's per-job lock; events of
//! different jobs never wait on each other.

pub mod accountant;
pub mod completion;
pub mod statistics;

pub use accountant::{AccountingError, JobAccount, Recorded, TaskAccountant, TaskRecord};
pub use completion::{CompletionError, CompletionStatus, JobCompletionDetector};
pub use statistics::{RecorderError, StatisticsRecorder, spawn_recorder};

use std::sync::Arc;
use tokio::sync::{Semaphore, broadcast, mpsc};
use tokio::task::{JoinHandle, JoinSet};
use tracing::{debug, error, info, warn};

use crate::config::MasterConfig;
use crate::domain::TaskCompletionEvent;
use crate::ledger::FjallStore;
use crate::observability::Metrics;
use crate::proto;

pub struct Master {
    detector: Arc<JobCompletionDetector>,
    statistics: mpsc::Sender<TaskCompletionEvent>,
    recorder: JoinHandle<()>,
    permits: Arc<Semaphore>,
    finished: broadcast::Sender<String>,
    metrics: Arc<Metrics>,
}

impl Master {
    /// Build the master and start its statistics recorder
    pub fn new(
        config: &MasterConfig,
        accountant: Arc<TaskAccountant>,
        ledger: FjallStore,
        metrics: Arc<Metrics>,
    ) -> Self {
        let (finished, _) = broadcast::channel(config.event_channel_size);
        let detector = JobCompletionDetector::new(
            accountant,
            ledger.clone(),
            metrics.clone(),
            config.query_timeout(),
            finished.clone(),
        );
        let (statistics, recorder) = spawn_recorder(
            StatisticsRecorder::new(ledger, metrics.clone()),
            config.statistics_inbox_size,
        );

        Self {
            detector: Arc::new(detector),
            statistics,
            recorder,
            permits: Arc::new(Semaphore::new(config.max_concurrent_events)),
            finished,
            metrics,
        }
    }

    /// Shared handle on the completion detector, usable after [`run`](Self::run)
    /// has consumed the master
    pub fn detector(&self) -> Arc<JobCompletionDetector> {
        self.detector.clone()
    }

    /// Ids of jobs as they transition to FINISHED
    pub fn subscribe_finished(&self) -> broadcast::Receiver<String> {
        self.finished.subscribe()
    }

    /// Consume events until the channel closes, then drain in-flight work
    pub async fn run(self, mut events: mpsc::Receiver<Vec<u8>>) {
        info!("Master started");
        let mut inflight = JoinSet::new();

        while let Some(bytes) = events.recv().await {
            let event = match proto::decode_event(&bytes) {
                Ok(event) => event,
                Err(e) => {
                    self.metrics.event_undecodable();
                    warn!(error = %e, len = bytes.len(), "Dropping undecodable completion event");
                    continue;
                }
            };
            self.metrics.event_received();
            debug!(job_id = %event.job_id, task_id = %event.task_id, node_id = %event.node_id, "Completion event received");

            if self.statistics.send(event.clone()).await.is_err() {
                error!(task_id = %event.task_id, "Statistics recorder stopped");
            }

            let permit = match self.permits.clone().acquire_owned().await {
                Ok(permit) => permit,
                Err(_) => break,
            };
            let detector = self.detector.clone();
            inflight.spawn(async move {
                let _permit = permit;
                if let Err(e) = detector.on_completion(&event).await {
                    warn!(job_id = %event.job_id, task_id = %event.task_id, error = %e, "Completion side effects skipped");
                }
            });

            while let Some(joined) = inflight.try_join_next() {
                if let Err(e) = joined {
                    error!(error = %e, "Completion handler panicked");
                }
            }
        }

        debug!(pending = inflight.len(), "Event channel closed, draining");
        while let Some(joined) = inflight.join_next().await {
            if let Err(e) = joined {
                error!(error = %e, "Completion handler panicked");
            }
        }

        drop(self.statistics);
        if let Err(e) = self.recorder.await {
            error!(error = %e, "Statistics recorder panicked");
        }
        info!("Master stopped");
    }
}
