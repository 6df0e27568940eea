//! Key layout for Fjall partitions
//!
//! Partition structure:
//! - `jobs`: job:{job_id} -> Job (JSON)
//! - `resources`: ref:{resource_id} -> Resource (JSON)
//! - `statistics`: stat:{resource_id}\0{job_id}\0{task_type} -> StatisticsRecord (JSON)
//! - `last_statistics`: last:{resource_id}:{task_type}:{source_type} -> LastStatisticsRecord (JSON)
//! - `metadata`: meta:{key} -> value (string)
//!
//! Statistics keys separate their parts with a NUL byte so a
//! prefix scan for one resource never matches a longer resource id.

use crate::domain::{StatisticsKey, TaskType};

pub fn encode_job_key(job_id: &str) -> Vec<u8> {
    format!("job:{job_id}").into_bytes()
}

pub fn encode_resource_key(resource_id: &str) -> Vec<u8> {
    format!("ref:{resource_id}").into_bytes()
}

pub fn encode_statistics_key(resource_id: &str, job_id: &str, task_type: TaskType) -> Vec<u8> {
    format!("stat:{resource_id}\0{job_id}\0{}", task_type.as_str()).into_bytes()
}

/// Prefix covering every statistics record of one resource
pub fn encode_statistics_prefix(resource_id: &str) -> Vec<u8> {
    format!("stat:{resource_id}\0").into_bytes()
}

pub fn encode_last_statistics_key(key: &StatisticsKey) -> Vec<u8> {
    format!("last:{key}").into_bytes()
}

pub fn encode_meta_key(key: &str) -> Vec<u8> {
    format!("meta:{key}").into_bytes()
}
