//! Historical and "last known" processing statistics per resource.
//!
//! A [`StatisticsRecord`] is immutable once written. A
//! [`LastStatisticsRecord`] is replaced through [`LastStatisticsRecord::with_update`],
//! which returns a new value and keeps the original creation timestamp.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::net::IpAddr;

use super::event::TaskCompletionEvent;
use super::job::{Job, ProcessingState, ReferenceOwner, SubTaskStats, TaskState, TaskType, UrlSourceType};
use super::outcome::RetrievingState;

/// Composite key of the last-statistics record
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct StatisticsKey {
    pub resource_id: String,
    pub task_type: TaskType,
    pub url_source_type: UrlSourceType,
}

impl fmt::Display for StatisticsKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}:{}:{}",
            self.resource_id,
            self.task_type.as_str(),
            self.url_source_type.as_str()
        )
    }
}

/// Mutable measurement fields shared by both record kinds
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProcessingMeasurements {
    pub job_id: String,
    pub processing_state: ProcessingState,
    pub retrieving_state: RetrievingState,
    pub task_state: TaskState,
    pub http_status: Option<u16>,
    pub content_type: Option<String>,
    pub content_size: u64,
    pub connect_ms: u64,
    pub checking_ms: u64,
    pub retrieval_ms: u64,
    pub source_ip: Option<IpAddr>,
    pub headers: BTreeMap<String, String>,
    pub log: String,
    pub sub_task_stats: SubTaskStats,
    pub completed_at: DateTime<Utc>,
}

impl ProcessingMeasurements {
    pub fn from_event(event: &TaskCompletionEvent) -> Self {
        let outcome = &event.outcome;
        Self {
            job_id: event.job_id.clone(),
            processing_state: event.processing_state,
            retrieving_state: outcome.state,
            task_state: event.task_state(),
            http_status: outcome.http_status,
            content_type: outcome.content_type.clone(),
            content_size: outcome.bytes_transferred,
            connect_ms: outcome.durations.connect.as_millis() as u64,
            checking_ms: outcome.durations.checking.as_millis() as u64,
            retrieval_ms: outcome.durations.retrieval.as_millis() as u64,
            source_ip: outcome.source_ip,
            headers: outcome.headers.clone(),
            log: outcome.log.clone(),
            sub_task_stats: event.sub_task_stats,
            completed_at: event.completed_at,
        }
    }
}

/// One completed execution; append-only
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatisticsRecord {
    pub id: String,
    pub created_at: DateTime<Utc>,
    pub active: bool,
    pub task_type: TaskType,
    pub owner: ReferenceOwner,
    pub url_source_type: UrlSourceType,
    pub resource_id: String,
    #[serde(flatten)]
    pub measurements: ProcessingMeasurements,
}

impl StatisticsRecord {
    /// One record per (resource, job, task type) execution, so redelivery
    /// finds the record already written
    pub fn id_of(resource_id: &str, job_id: &str, task_type: TaskType) -> String {
        format!("{resource_id}-{job_id}-{}", task_type.as_str())
    }

    pub fn from_event(event: &TaskCompletionEvent, job: &Job, active: bool, now: DateTime<Utc>) -> Self {
        Self {
            id: Self::id_of(&event.resource_id, &event.job_id, event.task_type),
            created_at: now,
            active,
            task_type: event.task_type,
            owner: job.owner.clone(),
            url_source_type: job.url_source_type,
            resource_id: event.resource_id.clone(),
            measurements: ProcessingMeasurements::from_event(event),
        }
    }

    pub fn key(&self) -> StatisticsKey {
        StatisticsKey {
            resource_id: self.resource_id.clone(),
            task_type: self.task_type,
            url_source_type: self.url_source_type,
        }
    }
}

/// Latest known statistics for a `(resource, task type, source type)` key
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LastStatisticsRecord {
    pub id: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub active: bool,
    pub task_type: TaskType,
    pub owner: ReferenceOwner,
    pub url_source_type: UrlSourceType,
    pub resource_id: String,
    pub statistics_id: String,
    #[serde(flatten)]
    pub measurements: ProcessingMeasurements,
}

impl LastStatisticsRecord {
    pub fn from_statistics(record: &StatisticsRecord, now: DateTime<Utc>) -> Self {
        Self {
            id: record.key().to_string(),
            created_at: now,
            updated_at: now,
            active: record.active,
            task_type: record.task_type,
            owner: record.owner.clone(),
            url_source_type: record.url_source_type,
            resource_id: record.resource_id.clone(),
            statistics_id: record.id.clone(),
            measurements: record.measurements.clone(),
        }
    }

    /// New value carrying `record`'s measurements; creation time is kept
    pub fn with_update(&self, record: &StatisticsRecord, now: DateTime<Utc>) -> Self {
        Self {
            updated_at: now,
            active: record.active,
            owner: record.owner.clone(),
            statistics_id: record.id.clone(),
            measurements: record.measurements.clone(),
            ..self.clone()
        }
    }

    /// Whether `record` completed no earlier than the stored execution
    pub fn is_superseded_by(&self, record: &StatisticsRecord) -> bool {
        record.measurements.completed_at >= self.measurements.completed_at
    }

    pub fn key(&self) -> StatisticsKey {
        StatisticsKey {
            resource_id: self.resource_id.clone(),
            task_type: self.task_type,
            url_source_type: self.url_source_type,
        }
    }
}
