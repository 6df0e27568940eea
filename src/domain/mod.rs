//! Domain model shared by worker nodes and the master
//!
//! - [`RetrievalLimits`] / [`RetrievalOutcome`] - input and result of one retrieval
//! - [`Job`], [`JobTask`], [`Resource`] - what the scheduler creates
//! - [`RetrieveTask`] - what a worker node executes
//! - [`TaskCompletionEvent`] - what a worker reports back
//! - [`StatisticsRecord`] / [`LastStatisticsRecord`] - what the master records

mod event;
mod job;
mod limits;
mod outcome;
mod statistics;

pub use event::TaskCompletionEvent;
pub use job::{
    Job, JobState, JobTask, ProcessingState, ReferenceOwner, Resource, RetrieveTask, SubTaskState,
    SubTaskStats, SubTaskType, TaskState, TaskType, UrlSourceType,
};
pub use limits::RetrievalLimits;
pub(crate) use outcome::Phase;
pub use outcome::{PhaseDurations, RetrievalError, RetrievalOutcome, RetrievingState, StorageLocation};
pub use statistics::{LastStatisticsRecord, ProcessingMeasurements, StatisticsKey, StatisticsRecord};
