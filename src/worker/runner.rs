//! Task runner - executes one `RetrieveTask` and builds its completion event

use async_trait::async_trait;
use chrono::Utc;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::time::timeout;
use tracing::{debug, error, warn};

use super::http::HttpDownloader;
use crate::domain::{
    ProcessingState, RetrievalError, RetrievalOutcome, RetrieveTask, RetrievingState,
    StorageLocation, SubTaskState, SubTaskStats, TaskCompletionEvent,
};
use crate::storage::{ResponseSink, ResponseType, open_sink};

/// Hook for content analysis that runs after a successful retrieval.
///
/// Implementations report a state for every sub-task they handle; requested
/// sub-tasks left unreported are marked skipped by the runner.
#[async_trait]
pub trait PostProcessor: Send + Sync {
    async fn process(
        &self,
        task: &RetrieveTask,
        outcome: &RetrievalOutcome,
        stats: SubTaskStats,
    ) -> SubTaskStats;
}

/// Marks every requested sub-task skipped
#[derive(Debug, Clone, Copy, Default)]
pub struct SkipPostProcessing;

#[async_trait]
impl PostProcessor for SkipPostProcessing {
    async fn process(
        &self,
        task: &RetrieveTask,
        _outcome: &RetrievalOutcome,
        stats: SubTaskStats,
    ) -> SubTaskStats {
        skip_unfinished(stats, task)
    }
}

fn skip_unfinished(stats: SubTaskStats, task: &RetrieveTask) -> SubTaskStats {
    task.sub_tasks.iter().fold(stats, |stats, sub_task| {
        if stats.get(*sub_task).is_terminal() {
            stats
        } else {
            stats.with(*sub_task, SubTaskState::Skipped)
        }
    })
}

/// Relative sink path for a task: `{job_id}/{task_id}.{resource_id}`, each
/// part escaped.
///
/// Escaping keeps `[A-Za-z0-9_-]` and writes every other byte as `%XX`, so no
/// part can contain a separator or climb out of the save directory, and
/// distinct tasks never share a file.
pub fn determine_storage_path(task: &RetrieveTask) -> String {
    format!(
        "{}/{}.{}",
        escape_segment(&task.job_id),
        escape_segment(&task.id),
        escape_segment(&task.resource_id)
    )
}

fn escape_segment(raw: &str) -> String {
    if raw.is_empty() {
        return "%".to_string();
    }
    raw.bytes().fold(String::with_capacity(raw.len()), |mut out, b| {
        if b.is_ascii_alphanumeric() || matches!(b, b'-' | b'_') {
            out.push(char::from(b));
        } else {
            out.push_str(&format!("%{b:02X}"));
        }
        out
    })
}

pub struct TaskRunner {
    node_id: String,
    downloader: HttpDownloader,
    post_processor: Arc<dyn PostProcessor>,
    response_type: ResponseType,
    path_to_save: PathBuf,
}

impl TaskRunner {
    pub fn new(
        node_id: impl Into<String>,
        downloader: HttpDownloader,
        post_processor: Arc<dyn PostProcessor>,
        response_type: ResponseType,
        path_to_save: PathBuf,
    ) -> Self {
        Self {
            node_id: node_id.into(),
            downloader,
            post_processor,
            response_type,
            path_to_save,
        }
    }

    pub fn node_id(&self) -> &str {
        &self.node_id
    }

    /// Execute `task` to a terminal state. Never fails; problems end up in the
    /// event's outcome.
    pub async fn run(&self, task: RetrieveTask) -> TaskCompletionEvent {
        debug!(task_id = %task.id, node_id = %self.node_id, url = ?task.url, "Running task");

        let storage_path = determine_storage_path(&task);
        let (outcome, sub_task_stats) =
            match open_sink(self.response_type, &self.path_to_save, &storage_path).await {
                Ok(mut sink) => self.run_bounded(&task, sink.as_mut()).await,
                Err(e) => {
                    error!(task_id = %task.id, error = %e, "Failed to open sink");
                    let location = match self.response_type {
                        ResponseType::Disk => StorageLocation::Disk(self.path_to_save.join(&storage_path)),
                        ResponseType::Memory => StorageLocation::Memory,
                    };
                    let outcome =
                        RetrievalOutcome::failed(location, &RetrievalError::Sink(e.to_string()));
                    (outcome, failed_stats(&task))
                }
            };

        TaskCompletionEvent {
            processing_state: ProcessingState::from_retrieval(outcome.state, &sub_task_stats),
            job_id: task.job_id,
            task_id: task.id,
            resource_id: task.resource_id,
            task_type: task.task_type,
            sub_task_stats,
            outcome,
            node_id: self.node_id.clone(),
            completed_at: Utc::now(),
        }
    }

    /// Retrieval plus post-processing under the task's processing time limit
    async fn run_bounded(
        &self,
        task: &RetrieveTask,
        sink: &mut dyn ResponseSink,
    ) -> (RetrievalOutcome, SubTaskStats) {
        let mut outcome = RetrievalOutcome::new(sink.location());
        let Some(bound) = task.limits.max_processing_time() else {
            let stats = self.process(task, sink, &mut outcome).await;
            return (outcome, stats);
        };

        let processed = timeout(bound, self.process(task, &mut *sink, &mut outcome)).await;
        if let Ok(stats) = processed {
            return (outcome, stats);
        }

        let error = RetrievalError::ProcessingTimeout(bound);
        warn!(task_id = %task.id, bound = ?bound, "Task exceeded processing time limit");
        if outcome.state == RetrievingState::Completed {
            // Only post-processing overran; the body is kept
            outcome.note(error.to_string());
            let stats = SubTaskStats::default().with_retrieve(SubTaskState::Success);
            return (outcome, fail_unfinished(stats, task));
        }

        self.downloader
            .abandon(task, sink, &mut outcome, &error, bound)
            .await;
        (outcome, failed_stats(task))
    }

    async fn process(
        &self,
        task: &RetrieveTask,
        sink: &mut dyn ResponseSink,
        outcome: &mut RetrievalOutcome,
    ) -> SubTaskStats {
        self.downloader.retrieve_into(task, sink, outcome).await;

        if outcome.state != RetrievingState::Completed {
            return failed_stats(task);
        }

        let stats = SubTaskStats::default().with_retrieve(SubTaskState::Success);
        let stats = self.post_processor.process(task, outcome, stats).await;
        skip_unfinished(stats, task)
    }
}

fn fail_unfinished(stats: SubTaskStats, task: &RetrieveTask) -> SubTaskStats {
    task.sub_tasks.iter().fold(stats, |stats, sub_task| {
        if stats.get(*sub_task).is_terminal() {
            stats
        } else {
            stats.with(*sub_task, SubTaskState::Error)
        }
    })
}

fn failed_stats(task: &RetrieveTask) -> SubTaskStats {
    skip_unfinished(SubTaskStats::default().with_retrieve(SubTaskState::Error), task)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{ReferenceOwner, RetrievalLimits, SubTaskType, TaskType};
    use crate::observability::Metrics;
    use crate::worker::http::DownloaderConfig;
    use std::collections::BTreeMap;

    fn task(url: Option<&str>) -> RetrieveTask {
        RetrieveTask {
            id: "job-1:0".into(),
            job_id: "job-1".into(),
            resource_id: "/2021/item 7".into(),
            url: url.map(str::to_string),
            task_type: TaskType::UnconditionalDownload,
            limits: RetrievalLimits::default(),
            previous_headers: BTreeMap::new(),
            sub_tasks: vec![SubTaskType::MetaExtraction, SubTaskType::ThumbnailGeneration],
            owner: ReferenceOwner::default(),
        }
    }

    #[test]
    fn test_determine_storage_path_escapes_every_part() {
        assert_eq!(
            determine_storage_path(&task(None)),
            "job-1/job-1%3A0.%2F2021%2Fitem%207"
        );

        let mut escaped_job = task(None);
        escaped_job.job_id = "../x".into();
        assert!(determine_storage_path(&escaped_job).starts_with("%2E%2E%2Fx/"));
    }

    #[test]
    fn test_determine_storage_path_is_collision_free() {
        let first = task(None);
        let mut lookalike = task(None);
        lookalike.resource_id = "_2021_item_7".into();
        let mut sibling = task(None);
        sibling.id = "job-1:1".into();

        let paths = [&first, &lookalike, &sibling].map(determine_storage_path);
        assert_ne!(paths[0], paths[1]);
        assert_ne!(paths[0], paths[2]);
        assert_ne!(paths[1], paths[2]);
    }

    #[tokio::test]
    async fn test_missing_url_yields_error_event_with_skipped_sub_tasks() {
        let metrics = Arc::new(Metrics::new());
        let downloader = HttpDownloader::new(DownloaderConfig::default(), metrics.clone()).unwrap();
        let runner = TaskRunner::new(
            "node-0",
            downloader,
            Arc::new(SkipPostProcessing),
            ResponseType::Memory,
            PathBuf::new(),
        );

        let event = runner.run(task(None)).await;

        assert_eq!(event.outcome.state, RetrievingState::Error);
        assert_eq!(event.processing_state, ProcessingState::Error);
        assert_eq!(event.sub_task_stats.retrieve, SubTaskState::Error);
        assert_eq!(event.sub_task_stats.meta_extraction, SubTaskState::Skipped);
        assert!(event.sub_task_stats.is_terminal(&task(None).sub_tasks));
        assert_eq!(event.node_id, "node-0");
        assert_eq!(metrics.snapshot().network_attempts, 0);
    }
}
