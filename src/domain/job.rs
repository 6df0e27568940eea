use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use super::limits::RetrievalLimits;
use super::outcome::RetrievingState;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TaskType {
    UnconditionalDownload,
    ConditionalDownload,
    CheckLink,
}

impl TaskType {
    pub fn as_str(self) -> &'static str {
        match self {
            TaskType::UnconditionalDownload => "UNCONDITIONAL_DOWNLOAD",
            TaskType::ConditionalDownload => "CONDITIONAL_DOWNLOAD",
            TaskType::CheckLink => "CHECK_LINK",
        }
    }
}

/// Role of the URL inside the owning record
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum UrlSourceType {
    Object,
    HasView,
    IsShownBy,
    IsShownAt,
}

impl UrlSourceType {
    pub fn as_str(self) -> &'static str {
        match self {
            UrlSourceType::Object => "OBJECT",
            UrlSourceType::HasView => "HAS_VIEW",
            UrlSourceType::IsShownBy => "IS_SHOWN_BY",
            UrlSourceType::IsShownAt => "IS_SHOWN_AT",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum JobState {
    Ready,
    Running,
    Pause,
    Resume,
    Finished,
}

impl JobState {
    /// Whether new tasks of a job in this state may be dispatched
    pub fn accepts_dispatch(self) -> bool {
        matches!(self, JobState::Ready | JobState::Running | JobState::Resume)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReferenceOwner {
    pub provider_id: String,
    pub collection_id: String,
    pub record_id: String,
    pub execution_id: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SubTaskType {
    ColorExtraction,
    MetaExtraction,
    ThumbnailGeneration,
    ThumbnailStorage,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SubTaskState {
    #[default]
    NeverExecuted,
    Success,
    Error,
    Skipped,
}

impl SubTaskState {
    pub fn is_terminal(self) -> bool {
        !matches!(self, SubTaskState::NeverExecuted)
    }
}

/// States of the retrieval and of every post-processing sub-task of one task
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubTaskStats {
    pub retrieve: SubTaskState,
    pub color_extraction: SubTaskState,
    pub meta_extraction: SubTaskState,
    pub thumbnail_generation: SubTaskState,
    pub thumbnail_storage: SubTaskState,
}

impl SubTaskStats {
    pub fn get(&self, sub_task: SubTaskType) -> SubTaskState {
        match sub_task {
            SubTaskType::ColorExtraction => self.color_extraction,
            SubTaskType::MetaExtraction => self.meta_extraction,
            SubTaskType::ThumbnailGeneration => self.thumbnail_generation,
            SubTaskType::ThumbnailStorage => self.thumbnail_storage,
        }
    }

    pub fn with(mut self, sub_task: SubTaskType, state: SubTaskState) -> Self {
        match sub_task {
            SubTaskType::ColorExtraction => self.color_extraction = state,
            SubTaskType::MetaExtraction => self.meta_extraction = state,
            SubTaskType::ThumbnailGeneration => self.thumbnail_generation = state,
            SubTaskType::ThumbnailStorage => self.thumbnail_storage = state,
        }
        self
    }

    pub fn with_retrieve(mut self, state: SubTaskState) -> Self {
        self.retrieve = state;
        self
    }

    /// Terminal iff the retrieval and every requested sub-task are terminal
    pub fn is_terminal(&self, requested: &[SubTaskType]) -> bool {
        self.retrieve.is_terminal() && requested.iter().all(|s| self.get(*s).is_terminal())
    }

    pub fn has_error(&self) -> bool {
        [
            self.retrieve,
            self.color_extraction,
            self.meta_extraction,
            self.thumbnail_generation,
            self.thumbnail_storage,
        ]
        .contains(&SubTaskState::Error)
    }
}

/// Accounting state of a dispatched task
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TaskState {
    Pending,
    Running,
    Done,
    Error,
}

impl TaskState {
    pub fn is_terminal(self) -> bool {
        matches!(self, TaskState::Done | TaskState::Error)
    }
}

/// Final processing outcome reported by a worker
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ProcessingState {
    Success,
    Error,
}

impl ProcessingState {
    pub fn from_retrieval(state: RetrievingState, sub_tasks: &SubTaskStats) -> Self {
        if state == RetrievingState::Completed && !sub_tasks.has_error() {
            ProcessingState::Success
        } else {
            ProcessingState::Error
        }
    }
}

/// One unit of work inside a job, pointing at a resource
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobTask {
    pub task_type: TaskType,
    pub resource_id: String,
    #[serde(default)]
    pub sub_tasks: Vec<SubTaskType>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Job {
    pub id: String,
    pub owner: ReferenceOwner,
    pub tasks: Vec<JobTask>,
    pub state: JobState,
    pub url_source_type: UrlSourceType,
    #[serde(default)]
    pub limits: RetrievalLimits,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Job {
    pub fn new(
        id: impl Into<String>,
        owner: ReferenceOwner,
        url_source_type: UrlSourceType,
        limits: RetrievalLimits,
        tasks: Vec<JobTask>,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: id.into(),
            owner,
            tasks,
            state: JobState::Ready,
            url_source_type,
            limits,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn with_state(&self, state: JobState) -> Self {
        Self {
            state,
            updated_at: Utc::now(),
            ..self.clone()
        }
    }

    /// Stable id of the task at `index`
    pub fn task_id(&self, index: usize) -> String {
        format!("{}:{}", self.id, index)
    }
}

/// A remote resource (source document reference) harvested by jobs
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Resource {
    pub id: String,
    pub url: Option<String>,
    pub owner: ReferenceOwner,
    #[serde(default = "default_active")]
    pub active: bool,
    #[serde(default)]
    pub last_stats_id: Option<String>,
    #[serde(default)]
    pub redirection_path: Vec<String>,
}

fn default_active() -> bool {
    true
}

impl Resource {
    pub fn with_last_stats(&self, stats_id: impl Into<String>, redirection_path: Vec<String>) -> Self {
        Self {
            last_stats_id: Some(stats_id.into()),
            redirection_path,
            ..self.clone()
        }
    }
}

/// What a worker node executes
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetrieveTask {
    pub id: String,
    pub job_id: String,
    pub resource_id: String,
    pub url: Option<String>,
    pub task_type: TaskType,
    pub limits: RetrievalLimits,
    /// Response headers observed by the previous execution, for conditional checks
    #[serde(default)]
    pub previous_headers: BTreeMap<String, String>,
    #[serde(default)]
    pub sub_tasks: Vec<SubTaskType>,
    pub owner: ReferenceOwner,
}

impl RetrieveTask {
    /// Content length observed by the previous execution, if any
    pub fn previous_content_length(&self) -> Option<u64> {
        self.previous_headers
            .iter()
            .find(|(name, _)| name.eq_ignore_ascii_case("content-length"))
            .and_then(|(_, value)| value.trim().parse().ok())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sub_task_terminality() {
        let requested = [SubTaskType::MetaExtraction, SubTaskType::ThumbnailGeneration];
        let stats = SubTaskStats::default().with_retrieve(SubTaskState::Success);
        assert!(!stats.is_terminal(&requested));

        let stats = stats
            .with(SubTaskType::MetaExtraction, SubTaskState::Success)
            .with(SubTaskType::ThumbnailGeneration, SubTaskState::Error);
        assert!(stats.is_terminal(&requested));
        assert!(stats.has_error());

        // Unrequested sub-tasks do not hold the task open
        assert!(SubTaskStats::default()
            .with_retrieve(SubTaskState::Error)
            .is_terminal(&[]));
    }

    #[test]
    fn test_previous_content_length_is_case_insensitive() {
        let task = RetrieveTask {
            id: "job:0".into(),
            job_id: "job".into(),
            resource_id: "res".into(),
            url: None,
            task_type: TaskType::ConditionalDownload,
            limits: RetrievalLimits::default(),
            previous_headers: BTreeMap::from([("content-length".to_string(), " 1399538".to_string())]),
            sub_tasks: Vec::new(),
            owner: ReferenceOwner::default(),
        };
        assert_eq!(task.previous_content_length(), Some(1_399_538));
    }

    #[test]
    fn test_job_state_dispatch_gate() {
        assert!(JobState::Ready.accepts_dispatch());
        assert!(JobState::Resume.accepts_dispatch());
        assert!(!JobState::Pause.accepts_dispatch());
        assert!(!JobState::Finished.accepts_dispatch());
    }

    #[test]
    fn test_unknown_state_fails_to_decode() {
        let result: Result<JobState, _> = serde_json::from_str("\"ARCHIVED\"");
        assert!(result.is_err());
    }
}
