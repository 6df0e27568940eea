use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::job::{ProcessingState, SubTaskStats, TaskState, TaskType};
use super::outcome::RetrievalOutcome;

/// Emitted once per task execution attempt; may reach the master more than once
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskCompletionEvent {
    pub job_id: String,
    pub task_id: String,
    pub resource_id: String,
    pub task_type: TaskType,
    pub processing_state: ProcessingState,
    pub sub_task_stats: SubTaskStats,
    pub outcome: RetrievalOutcome,
    pub node_id: String,
    pub completed_at: DateTime<Utc>,
}

impl TaskCompletionEvent {
    /// Accounting state carried by this event
    pub fn task_state(&self) -> TaskState {
        match self.processing_state {
            ProcessingState::Success => TaskState::Done,
            ProcessingState::Error => TaskState::Error,
        }
    }
}
