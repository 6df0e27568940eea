//! Protobuf wire types for the harvesting queues
//!
//! Messages are declared with prost derives rather than generated from
//! `.proto` files:
//! - `RetrieveUrl` - queued retrieval task, consumed by worker nodes
//! - `DoneProcessing` - task completion event, consumed by the master
//! - `DeadLetterTask` - task that could not be handed to any node
//!
//! Enumerations keep `0` for "unspecified"; decoding any value that has no
//! domain counterpart fails with [`DecodeError::UnknownVariant`].
//!
//! ```rust,ignore
//! use harvester::proto::{decode_event, encode_event};
//!
//! let bytes = encode_event(&event);
//! let decoded = decode_event(&bytes)?;
//! ```

use chrono::{DateTime, Utc};
use prost::Message;
use std::collections::BTreeMap;
use std::net::IpAddr;
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

use crate::domain::{
    PhaseDurations, ProcessingState, ReferenceOwner, RetrievalLimits, RetrievalOutcome,
    RetrieveTask, RetrievingState, StorageLocation, SubTaskState, SubTaskStats, SubTaskType,
    TaskCompletionEvent, TaskType,
};

#[derive(Debug, Error)]
pub enum DecodeError {
    #[error("Protobuf decode failed: {0}")]
    Prost(#[from] prost::DecodeError),

    #[error("Unknown {field} value {value}")]
    UnknownVariant { field: &'static str, value: i32 },

    #[error("Missing field: {0}")]
    MissingField(&'static str),

    #[error("Invalid source IP: {0}")]
    InvalidIp(String),

    #[error("Invalid timestamp: {0}")]
    InvalidTimestamp(i64),
}

pub type Result<T> = std::result::Result<T, DecodeError>;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, prost::Enumeration)]
#[repr(i32)]
pub enum TaskKind {
    Unspecified = 0,
    UnconditionalDownload = 1,
    ConditionalDownload = 2,
    CheckLink = 3,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, prost::Enumeration)]
#[repr(i32)]
pub enum RetrievalStateKind {
    Unspecified = 0,
    Pending = 1,
    CheckingExistence = 2,
    SkippedCompleted = 3,
    Downloading = 4,
    Completed = 5,
    Error = 6,
    AbortedTimeLimit = 7,
    AbortedSizeLimit = 8,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, prost::Enumeration)]
#[repr(i32)]
pub enum SubTaskStateKind {
    NeverExecuted = 0,
    Success = 1,
    Error = 2,
    Skipped = 3,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, prost::Enumeration)]
#[repr(i32)]
pub enum SubTaskKind {
    Unspecified = 0,
    ColorExtraction = 1,
    MetaExtraction = 2,
    ThumbnailGeneration = 3,
    ThumbnailStorage = 4,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, prost::Enumeration)]
#[repr(i32)]
pub enum ProcessingStateKind {
    Unspecified = 0,
    Success = 1,
    Error = 2,
}

#[derive(Clone, PartialEq, Message)]
pub struct Limits {
    #[prost(uint64, tag = "1")]
    pub connection_timeout_ms: u64,
    #[prost(uint64, tag = "2")]
    pub min_throughput_bytes_per_sec: u64,
    #[prost(uint64, tag = "3")]
    pub max_retrieval_time_ms: u64,
    #[prost(uint32, tag = "4")]
    pub max_redirects: u32,
    #[prost(uint64, tag = "5")]
    pub max_processing_time_ms: u64,
    #[prost(uint64, tag = "6")]
    pub max_content_size: u64,
}

#[derive(Clone, PartialEq, Message)]
pub struct Owner {
    #[prost(string, tag = "1")]
    pub provider_id: String,
    #[prost(string, tag = "2")]
    pub collection_id: String,
    #[prost(string, tag = "3")]
    pub record_id: String,
    #[prost(string, tag = "4")]
    pub execution_id: String,
}

#[derive(Clone, PartialEq, Message)]
pub struct SubTaskStatsMessage {
    #[prost(enumeration = "SubTaskStateKind", tag = "1")]
    pub retrieve: i32,
    #[prost(enumeration = "SubTaskStateKind", tag = "2")]
    pub color_extraction: i32,
    #[prost(enumeration = "SubTaskStateKind", tag = "3")]
    pub meta_extraction: i32,
    #[prost(enumeration = "SubTaskStateKind", tag = "4")]
    pub thumbnail_generation: i32,
    #[prost(enumeration = "SubTaskStateKind", tag = "5")]
    pub thumbnail_storage: i32,
}

/// Queued retrieval task
#[derive(Clone, PartialEq, Message)]
pub struct RetrieveUrl {
    #[prost(string, tag = "1")]
    pub id: String,
    #[prost(string, tag = "2")]
    pub job_id: String,
    #[prost(string, tag = "3")]
    pub resource_id: String,
    #[prost(string, optional, tag = "4")]
    pub url: Option<String>,
    #[prost(enumeration = "TaskKind", tag = "5")]
    pub task_type: i32,
    #[prost(message, optional, tag = "6")]
    pub limits: Option<Limits>,
    #[prost(btree_map = "string, string", tag = "7")]
    pub previous_headers: BTreeMap<String, String>,
    #[prost(enumeration = "SubTaskKind", repeated, tag = "8")]
    pub sub_tasks: Vec<i32>,
    #[prost(message, optional, tag = "9")]
    pub owner: Option<Owner>,
}

/// Task completion event
#[derive(Clone, PartialEq, Message)]
pub struct DoneProcessing {
    #[prost(string, tag = "1")]
    pub job_id: String,
    #[prost(string, tag = "2")]
    pub task_id: String,
    #[prost(string, tag = "3")]
    pub resource_id: String,
    #[prost(enumeration = "TaskKind", tag = "4")]
    pub task_type: i32,
    #[prost(enumeration = "ProcessingStateKind", tag = "5")]
    pub processing_state: i32,
    #[prost(message, optional, tag = "6")]
    pub sub_task_stats: Option<SubTaskStatsMessage>,
    #[prost(enumeration = "RetrievalStateKind", tag = "7")]
    pub retrieving_state: i32,
    #[prost(enumeration = "RetrievalStateKind", repeated, tag = "8")]
    pub history: Vec<i32>,
    #[prost(uint64, tag = "9")]
    pub bytes_transferred: u64,
    #[prost(uint32, optional, tag = "10")]
    pub http_status: Option<u32>,
    #[prost(string, optional, tag = "11")]
    pub content_type: Option<String>,
    #[prost(btree_map = "string, string", tag = "12")]
    pub headers: BTreeMap<String, String>,
    #[prost(string, optional, tag = "13")]
    pub source_ip: Option<String>,
    #[prost(uint64, tag = "14")]
    pub connect_ms: u64,
    #[prost(uint64, tag = "15")]
    pub checking_ms: u64,
    #[prost(uint64, tag = "16")]
    pub retrieval_ms: u64,
    #[prost(string, repeated, tag = "17")]
    pub redirection_path: Vec<String>,
    #[prost(string, tag = "18")]
    pub log: String,
    /// Absent when the body was kept in memory
    #[prost(string, optional, tag = "19")]
    pub storage_path: Option<String>,
    #[prost(string, tag = "20")]
    pub node_id: String,
    #[prost(int64, tag = "21")]
    pub completed_at_ms: i64,
}

#[derive(Clone, PartialEq, Message)]
pub struct DeadLetterTask {
    #[prost(message, optional, tag = "1")]
    pub task: Option<RetrieveUrl>,
    #[prost(string, tag = "2")]
    pub reason: String,
    #[prost(int64, tag = "3")]
    pub failed_at_ms: i64,
}

fn unknown(field: &'static str, value: i32) -> DecodeError {
    DecodeError::UnknownVariant { field, value }
}

impl From<TaskType> for TaskKind {
    fn from(value: TaskType) -> Self {
        match value {
            TaskType::UnconditionalDownload => TaskKind::UnconditionalDownload,
            TaskType::ConditionalDownload => TaskKind::ConditionalDownload,
            TaskType::CheckLink => TaskKind::CheckLink,
        }
    }
}

fn task_type(value: i32) -> Result<TaskType> {
    match TaskKind::try_from(value) {
        Ok(TaskKind::UnconditionalDownload) => Ok(TaskType::UnconditionalDownload),
        Ok(TaskKind::ConditionalDownload) => Ok(TaskType::ConditionalDownload),
        Ok(TaskKind::CheckLink) => Ok(TaskType::CheckLink),
        _ => Err(unknown("task_type", value)),
    }
}

impl From<RetrievingState> for RetrievalStateKind {
    fn from(value: RetrievingState) -> Self {
        match value {
            RetrievingState::Pending => RetrievalStateKind::Pending,
            RetrievingState::CheckingExistence => RetrievalStateKind::CheckingExistence,
            RetrievingState::SkippedCompleted => RetrievalStateKind::SkippedCompleted,
            RetrievingState::Downloading => RetrievalStateKind::Downloading,
            RetrievingState::Completed => RetrievalStateKind::Completed,
            RetrievingState::Error => RetrievalStateKind::Error,
            RetrievingState::AbortedTimeLimit => RetrievalStateKind::AbortedTimeLimit,
            RetrievingState::AbortedSizeLimit => RetrievalStateKind::AbortedSizeLimit,
        }
    }
}

fn retrieving_state(value: i32) -> Result<RetrievingState> {
    let state = match RetrievalStateKind::try_from(value) {
        Ok(RetrievalStateKind::Pending) => RetrievingState::Pending,
        Ok(RetrievalStateKind::CheckingExistence) => RetrievingState::CheckingExistence,
        Ok(RetrievalStateKind::SkippedCompleted) => RetrievingState::SkippedCompleted,
        Ok(RetrievalStateKind::Downloading) => RetrievingState::Downloading,
        Ok(RetrievalStateKind::Completed) => RetrievingState::Completed,
        Ok(RetrievalStateKind::Error) => RetrievingState::Error,
        Ok(RetrievalStateKind::AbortedTimeLimit) => RetrievingState::AbortedTimeLimit,
        Ok(RetrievalStateKind::AbortedSizeLimit) => RetrievingState::AbortedSizeLimit,
        Ok(RetrievalStateKind::Unspecified) | Err(_) => {
            return Err(unknown("retrieving_state", value));
        }
    };
    Ok(state)
}

impl From<SubTaskState> for SubTaskStateKind {
    fn from(value: SubTaskState) -> Self {
        match value {
            SubTaskState::NeverExecuted => SubTaskStateKind::NeverExecuted,
            SubTaskState::Success => SubTaskStateKind::Success,
            SubTaskState::Error => SubTaskStateKind::Error,
            SubTaskState::Skipped => SubTaskStateKind::Skipped,
        }
    }
}

fn sub_task_state(value: i32) -> Result<SubTaskState> {
    match SubTaskStateKind::try_from(value) {
        Ok(SubTaskStateKind::NeverExecuted) => Ok(SubTaskState::NeverExecuted),
        Ok(SubTaskStateKind::Success) => Ok(SubTaskState::Success),
        Ok(SubTaskStateKind::Error) => Ok(SubTaskState::Error),
        Ok(SubTaskStateKind::Skipped) => Ok(SubTaskState::Skipped),
        Err(_) => Err(unknown("sub_task_state", value)),
    }
}

impl From<SubTaskType> for SubTaskKind {
    fn from(value: SubTaskType) -> Self {
        match value {
            SubTaskType::ColorExtraction => SubTaskKind::ColorExtraction,
            SubTaskType::MetaExtraction => SubTaskKind::MetaExtraction,
            SubTaskType::ThumbnailGeneration => SubTaskKind::ThumbnailGeneration,
            SubTaskType::ThumbnailStorage => SubTaskKind::ThumbnailStorage,
        }
    }
}

fn sub_task_type(value: i32) -> Result<SubTaskType> {
    match SubTaskKind::try_from(value) {
        Ok(SubTaskKind::ColorExtraction) => Ok(SubTaskType::ColorExtraction),
        Ok(SubTaskKind::MetaExtraction) => Ok(SubTaskType::MetaExtraction),
        Ok(SubTaskKind::ThumbnailGeneration) => Ok(SubTaskType::ThumbnailGeneration),
        Ok(SubTaskKind::ThumbnailStorage) => Ok(SubTaskType::ThumbnailStorage),
        _ => Err(unknown("sub_task", value)),
    }
}

fn processing_state(value: i32) -> Result<ProcessingState> {
    match ProcessingStateKind::try_from(value) {
        Ok(ProcessingStateKind::Success) => Ok(ProcessingState::Success),
        Ok(ProcessingStateKind::Error) => Ok(ProcessingState::Error),
        _ => Err(unknown("processing_state", value)),
    }
}

impl From<&RetrievalLimits> for Limits {
    fn from(limits: &RetrievalLimits) -> Self {
        Self {
            connection_timeout_ms: limits.connection_timeout.as_millis() as u64,
            min_throughput_bytes_per_sec: limits.min_throughput_bytes_per_sec,
            max_retrieval_time_ms: limits.max_retrieval_time.as_millis() as u64,
            max_redirects: limits.max_redirects,
            max_processing_time_ms: limits.max_processing_time.as_millis() as u64,
            max_content_size: limits.max_content_size,
        }
    }
}

impl From<Limits> for RetrievalLimits {
    fn from(limits: Limits) -> Self {
        Self {
            connection_timeout: Duration::from_millis(limits.connection_timeout_ms),
            min_throughput_bytes_per_sec: limits.min_throughput_bytes_per_sec,
            max_retrieval_time: Duration::from_millis(limits.max_retrieval_time_ms),
            max_redirects: limits.max_redirects,
            max_processing_time: Duration::from_millis(limits.max_processing_time_ms),
            max_content_size: limits.max_content_size,
        }
    }
}

impl From<&ReferenceOwner> for Owner {
    fn from(owner: &ReferenceOwner) -> Self {
        Self {
            provider_id: owner.provider_id.clone(),
            collection_id: owner.collection_id.clone(),
            record_id: owner.record_id.clone(),
            execution_id: owner.execution_id.clone(),
        }
    }
}

impl From<Owner> for ReferenceOwner {
    fn from(owner: Owner) -> Self {
        Self {
            provider_id: owner.provider_id,
            collection_id: owner.collection_id,
            record_id: owner.record_id,
            execution_id: owner.execution_id,
        }
    }
}

impl From<&SubTaskStats> for SubTaskStatsMessage {
    fn from(stats: &SubTaskStats) -> Self {
        let kind = |state: SubTaskState| SubTaskStateKind::from(state) as i32;
        Self {
            retrieve: kind(stats.retrieve),
            color_extraction: kind(stats.color_extraction),
            meta_extraction: kind(stats.meta_extraction),
            thumbnail_generation: kind(stats.thumbnail_generation),
            thumbnail_storage: kind(stats.thumbnail_storage),
        }
    }
}

impl TryFrom<SubTaskStatsMessage> for SubTaskStats {
    type Error = DecodeError;

    fn try_from(message: SubTaskStatsMessage) -> Result<Self> {
        Ok(Self {
            retrieve: sub_task_state(message.retrieve)?,
            color_extraction: sub_task_state(message.color_extraction)?,
            meta_extraction: sub_task_state(message.meta_extraction)?,
            thumbnail_generation: sub_task_state(message.thumbnail_generation)?,
            thumbnail_storage: sub_task_state(message.thumbnail_storage)?,
        })
    }
}

impl From<&RetrieveTask> for RetrieveUrl {
    fn from(task: &RetrieveTask) -> Self {
        Self {
            id: task.id.clone(),
            job_id: task.job_id.clone(),
            resource_id: task.resource_id.clone(),
            url: task.url.clone(),
            task_type: TaskKind::from(task.task_type) as i32,
            limits: Some(Limits::from(&task.limits)),
            previous_headers: task.previous_headers.clone(),
            sub_tasks: task
                .sub_tasks
                .iter()
                .map(|s| SubTaskKind::from(*s) as i32)
                .collect(),
            owner: Some(Owner::from(&task.owner)),
        }
    }
}

impl TryFrom<RetrieveUrl> for RetrieveTask {
    type Error = DecodeError;

    fn try_from(message: RetrieveUrl) -> Result<Self> {
        let sub_tasks = message
            .sub_tasks
            .iter()
            .map(|value| sub_task_type(*value))
            .collect::<Result<Vec<_>>>()?;

        Ok(Self {
            task_type: task_type(message.task_type)?,
            id: message.id,
            job_id: message.job_id,
            resource_id: message.resource_id,
            url: message.url,
            limits: message.limits.map(RetrievalLimits::from).unwrap_or_default(),
            previous_headers: message.previous_headers,
            sub_tasks,
            owner: message.owner.map(ReferenceOwner::from).unwrap_or_default(),
        })
    }
}

impl From<&TaskCompletionEvent> for DoneProcessing {
    fn from(event: &TaskCompletionEvent) -> Self {
        let outcome = &event.outcome;
        let processing = match event.processing_state {
            ProcessingState::Success => ProcessingStateKind::Success,
            ProcessingState::Error => ProcessingStateKind::Error,
        };
        let storage_path = match &outcome.storage {
            StorageLocation::Disk(path) => Some(path.display().to_string()),
            StorageLocation::Memory => None,
        };

        Self {
            job_id: event.job_id.clone(),
            task_id: event.task_id.clone(),
            resource_id: event.resource_id.clone(),
            task_type: TaskKind::from(event.task_type) as i32,
            processing_state: processing as i32,
            sub_task_stats: Some(SubTaskStatsMessage::from(&event.sub_task_stats)),
            retrieving_state: RetrievalStateKind::from(outcome.state) as i32,
            history: outcome
                .history
                .iter()
                .map(|s| RetrievalStateKind::from(*s) as i32)
                .collect(),
            bytes_transferred: outcome.bytes_transferred,
            http_status: outcome.http_status.map(u32::from),
            content_type: outcome.content_type.clone(),
            headers: outcome.headers.clone(),
            source_ip: outcome.source_ip.map(|ip| ip.to_string()),
            connect_ms: outcome.durations.connect.as_millis() as u64,
            checking_ms: outcome.durations.checking.as_millis() as u64,
            retrieval_ms: outcome.durations.retrieval.as_millis() as u64,
            redirection_path: outcome.redirection_path.clone(),
            log: outcome.log.clone(),
            storage_path,
            node_id: event.node_id.clone(),
            completed_at_ms: event.completed_at.timestamp_millis(),
        }
    }
}

impl TryFrom<DoneProcessing> for TaskCompletionEvent {
    type Error = DecodeError;

    fn try_from(message: DoneProcessing) -> Result<Self> {
        let history = message
            .history
            .iter()
            .map(|value| retrieving_state(*value))
            .collect::<Result<Vec<_>>>()?;
        let source_ip = message
            .source_ip
            .map(|ip| ip.parse::<IpAddr>().map_err(|_| DecodeError::InvalidIp(ip)))
            .transpose()?;
        let completed_at: DateTime<Utc> = DateTime::from_timestamp_millis(message.completed_at_ms)
            .ok_or(DecodeError::InvalidTimestamp(message.completed_at_ms))?;
        let sub_task_stats: SubTaskStats = message
            .sub_task_stats
            .ok_or(DecodeError::MissingField("sub_task_stats"))?
            .try_into()?;
        let http_status = message
            .http_status
            .map(|status| u16::try_from(status).map_err(|_| unknown("http_status", status as i32)))
            .transpose()?;

        let outcome = RetrievalOutcome {
            state: retrieving_state(message.retrieving_state)?,
            history,
            bytes_transferred: message.bytes_transferred,
            http_status,
            content_type: message.content_type,
            headers: message.headers,
            source_ip,
            durations: PhaseDurations {
                connect: Duration::from_millis(message.connect_ms),
                checking: Duration::from_millis(message.checking_ms),
                retrieval: Duration::from_millis(message.retrieval_ms),
            },
            redirection_path: message.redirection_path,
            log: message.log,
            storage: match message.storage_path {
                Some(path) => StorageLocation::Disk(PathBuf::from(path)),
                None => StorageLocation::Memory,
            },
            open_phase: None,
        };

        Ok(Self {
            task_type: task_type(message.task_type)?,
            processing_state: processing_state(message.processing_state)?,
            job_id: message.job_id,
            task_id: message.task_id,
            resource_id: message.resource_id,
            sub_task_stats,
            outcome,
            node_id: message.node_id,
            completed_at,
        })
    }
}

pub fn encode_task(task: &RetrieveTask) -> Vec<u8> {
    RetrieveUrl::from(task).encode_to_vec()
}

pub fn decode_task(bytes: &[u8]) -> Result<RetrieveTask> {
    RetrieveUrl::decode(bytes)?.try_into()
}

pub fn encode_event(event: &TaskCompletionEvent) -> Vec<u8> {
    DoneProcessing::from(event).encode_to_vec()
}

pub fn decode_event(bytes: &[u8]) -> Result<TaskCompletionEvent> {
    DoneProcessing::decode(bytes)?.try_into()
}
