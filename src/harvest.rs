//! In-process harvest: ledger, queue, master and worker nodes wired together

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use std::path::Path;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::broadcast::error::RecvError;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::config::Config;
use crate::domain::{
    Job, JobState, JobTask, ReferenceOwner, Resource, RetrievalLimits, RetrievalOutcome,
    RetrieveTask, TaskType, UrlSourceType,
};
use crate::ledger::{FjallStore, LedgerError};
use crate::master::{CompletionStatus, Master, TaskAccountant};
use crate::messaging;
use crate::observability::{Metrics, MetricsSnapshot};
use crate::queue::{DispatchError, Dispatcher, FjallQueue, QueueError};
use crate::storage::{MemorySink, ResponseSink};
use crate::worker::http::{DownloaderConfig, DownloaderError, HttpDownloader};
use crate::worker::runner::SkipPostProcessing;
use crate::worker::spawn_nodes;

#[derive(Debug, Error)]
pub enum HarvestError {
    #[error("Failed to read jobs file: {0}")]
    Io(#[from] std::io::Error),

    #[error("Invalid jobs file: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Ledger error: {0}")]
    Ledger(#[from] LedgerError),

    #[error("Queue error: {0}")]
    Queue(#[from] QueueError),

    #[error("Dispatch error: {0}")]
    Dispatch(#[from] DispatchError),

    #[error("Downloader error: {0}")]
    Downloader(#[from] DownloaderError),
}

/// Contents of a jobs file
#[derive(Debug, Clone, Deserialize)]
pub struct JobsFile {
    #[serde(default)]
    pub resources: Vec<Resource>,
    pub jobs: Vec<JobDefinition>,
}

/// A job as written in a jobs file; a missing id is generated
#[derive(Debug, Clone, Deserialize)]
pub struct JobDefinition {
    #[serde(default)]
    pub id: Option<String>,
    #[serde(default)]
    pub owner: ReferenceOwner,
    pub url_source_type: UrlSourceType,
    #[serde(default)]
    pub limits: RetrievalLimits,
    pub tasks: Vec<JobTask>,
}

impl JobDefinition {
    pub fn into_job(self) -> Job {
        let id = self.id.unwrap_or_else(|| Uuid::now_v7().to_string());
        Job::new(id, self.owner, self.url_source_type, self.limits, self.tasks)
    }
}

pub fn load_jobs(path: &Path) -> Result<JobsFile, HarvestError> {
    let raw = std::fs::read_to_string(path)?;
    Ok(serde_json::from_str(&raw)?)
}

#[derive(Debug, Clone, Serialize)]
pub struct RunSummary {
    /// Final state per job id
    pub jobs: BTreeMap<String, JobState>,
    /// Jobs that could not finish: a task never reached a node, or its
    /// completion was lost
    pub unfinished: Vec<String>,
    pub interrupted: bool,
    pub metrics: MetricsSnapshot,
}

/// Harvest every job of `jobs` and return once all of them are finished,
/// the worker nodes have drained, or a shutdown signal arrives.
///
/// Jobs still open once the nodes drained get one reconciliation pass; those
/// that remain open are reported in [`RunSummary::unfinished`].
pub async fn run(config: &Config, jobs: JobsFile) -> Result<RunSummary, HarvestError> {
    let ledger = FjallStore::open(&config.ledger.path)?;
    let pruned = ledger.prune_expired(config.retention.statistics_ttl_days)?;
    info!(pruned = pruned.statistics_pruned, "Retention applied");

    let queue = Arc::new(FjallQueue::open(&config.ledger.queue_path)?);
    let metrics = Arc::new(Metrics::new());
    let accountant = Arc::new(TaskAccountant::new());

    let (publisher, events) = messaging::channel(config.master.event_channel_size);
    let master = Master::new(&config.master, accountant.clone(), ledger.clone(), metrics.clone());
    let mut finished = master.subscribe_finished();
    let detector = master.detector();
    let master_handle = tokio::spawn(master.run(events));

    let (nodes, pool) = spawn_nodes(
        &config.worker,
        metrics.clone(),
        Arc::new(publisher),
        Arc::new(SkipPostProcessing),
    )?;
    let dispatcher = Dispatcher::new(
        queue.clone(),
        ledger.clone(),
        accountant,
        nodes,
        config.limits.to_limits(),
        metrics.clone(),
    );

    for resource in &jobs.resources {
        ledger.upsert_resource(resource)?;
    }

    let mut job_ids = Vec::new();
    let mut pending = HashSet::new();
    for definition in jobs.jobs {
        let job = definition.into_job();
        ledger.upsert_job(&job)?;
        job_ids.push(job.id.clone());

        if job.tasks.is_empty() {
            ledger.update_job_state(&job.id, JobState::Finished)?;
            continue;
        }
        match dispatcher.dispatch_job(&job.id).await {
            Ok(_) => {
                pending.insert(job.id);
            }
            Err(e) => error!(job_id = %job.id, error = %e, "Failed to dispatch job"),
        }
    }
    info!(jobs = job_ids.len(), pending = pending.len(), "Harvest started");

    // Nodes exit once their channels are empty and closed, which in turn
    // closes the event channel and stops the master
    drop(dispatcher);
    let drained = async move {
        pool.join().await;
        if let Err(e) = master_handle.await {
            error!(error = %e, "Master panicked");
        }
    };
    tokio::pin!(drained);

    let mut interrupted = false;
    let mut is_drained = false;
    let shutdown = shutdown_signal();
    tokio::pin!(shutdown);

    while !pending.is_empty() {
        tokio::select! {
            received = finished.recv() => match received {
                Ok(job_id) => {
                    pending.remove(&job_id);
                }
                Err(RecvError::Lagged(skipped)) => {
                    warn!(skipped, "Missed finished notifications, checking ledger");
                    for job_id in pending.clone() {
                        if ledger.get_job(&job_id)?.is_some_and(|job| job.state == JobState::Finished) {
                            pending.remove(&job_id);
                        }
                    }
                }
                Err(RecvError::Closed) => break,
            },
            () = &mut drained => {
                is_drained = true;
                break;
            }
            _ = &mut shutdown => {
                warn!(pending = pending.len(), "Interrupted, waiting for in-flight tasks");
                interrupted = true;
                break;
            }
        }
    }
    if !is_drained {
        drained.await;
    }

    for job_id in &pending {
        match detector.reconcile(job_id).await {
            Ok(CompletionStatus::Pending) => {
                warn!(job_id = %job_id, "Job cannot finish: tasks lost or never delivered");
            }
            Ok(_) => {}
            Err(e) => error!(job_id = %job_id, error = %e, "Reconciliation failed"),
        }
    }

    queue.flush()?;
    ledger.persist()?;

    let mut states = BTreeMap::new();
    for job_id in job_ids {
        if let Some(job) = ledger.get_job(&job_id)? {
            states.insert(job_id, job.state);
        }
    }
    let unfinished = states
        .iter()
        .filter(|(_, state)| **state != JobState::Finished)
        .map(|(job_id, _)| job_id.clone())
        .collect();

    Ok(RunSummary {
        jobs: states,
        unfinished,
        interrupted,
        metrics: metrics.snapshot(),
    })
}

/// Retrieve one URL into memory with the configured default limits
pub async fn fetch(config: &Config, url: &str, check_only: bool) -> Result<RetrievalOutcome, HarvestError> {
    let downloader = HttpDownloader::new(
        DownloaderConfig::from(&config.worker),
        Arc::new(Metrics::new()),
    )?;
    let job_id = Uuid::now_v7().to_string();
    let task = RetrieveTask {
        id: format!("{job_id}:0"),
        job_id,
        resource_id: url.to_string(),
        url: Some(url.to_string()),
        task_type: if check_only {
            TaskType::CheckLink
        } else {
            TaskType::UnconditionalDownload
        },
        limits: config.limits.to_limits(),
        previous_headers: BTreeMap::new(),
        sub_tasks: Vec::new(),
        owner: ReferenceOwner::default(),
    };

    let mut sink = MemorySink::new();
    let outcome = downloader.retrieve(&task, &mut sink).await;
    info!(url, state = outcome.state.as_str(), bytes = sink.bytes_accepted(), "Fetch finished");
    Ok(outcome)
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!(error = %e, "Failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{SignalKind, signal};
        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
    info!("Shutdown signal received");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_jobs_file_parses_with_defaults() {
        let raw = r#"{
            "resources": [{"id": "res-1", "url": "http://origin.test/a.jpg", "owner": {
                "provider_id": "p", "collection_id": "c", "record_id": "r", "execution_id": "e"}}],
            "jobs": [{
                "url_source_type": "IS_SHOWN_BY",
                "limits": {"connection_timeout_ms": 2000, "max_redirects": 3},
                "tasks": [{"task_type": "CONDITIONAL_DOWNLOAD", "resource_id": "res-1",
                           "sub_tasks": ["META_EXTRACTION"]}]
            }]
        }"#;

        let file: JobsFile = serde_json::from_str(raw).unwrap();
        assert!(file.resources[0].active);

        let job = file.jobs[0].clone().into_job();
        assert_eq!(job.state, JobState::Ready);
        assert!(Uuid::parse_str(&job.id).is_ok());
        assert_eq!(job.limits.max_redirects, 3);
        assert_eq!(job.tasks[0].task_type, TaskType::ConditionalDownload);
    }
}
