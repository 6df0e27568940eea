use std::path::Path;
use std::sync::{Arc, Mutex, PoisonError};

use chrono::Utc;
use fjall::{Config, Keyspace, PartitionCreateOptions, PartitionHandle};
use serde::Serialize;
use serde::de::DeserializeOwned;
use tracing::{debug, info};

use crate::domain::{
    Job, JobState, LastStatisticsRecord, Resource, StatisticsKey, StatisticsRecord, TaskType,
};

use super::error::{LedgerError, Result};
use super::partitions::{
    encode_job_key, encode_last_statistics_key, encode_resource_key, encode_statistics_key,
    encode_statistics_prefix,
};
use super::pruning::{PruneStats, prune_statistics};

/// Fjall-backed persistence for jobs, resources and statistics
///
/// Every operation touches a single record; reads observe preceding writes
/// from the same process. Job state changes are serialized so a conditional
/// transition never overwrites a state written concurrently.
#[derive(Clone)]
pub struct FjallStore {
    keyspace: Keyspace,
    job_states: Arc<Mutex<()>>,
    jobs: PartitionHandle,
    resources: PartitionHandle,
    statistics: PartitionHandle,
    last_statistics: PartitionHandle,
    metadata: PartitionHandle,
}

impl FjallStore {
    /// Open or create a Fjall store at the given path
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        info!(path = %path.display(), "Opening Fjall store");

        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let keyspace = Config::new(path).open()?;
        let jobs = keyspace.open_partition("jobs", PartitionCreateOptions::default())?;
        let resources = keyspace.open_partition("resources", PartitionCreateOptions::default())?;
        let statistics = keyspace.open_partition("statistics", PartitionCreateOptions::default())?;
        let last_statistics =
            keyspace.open_partition("last_statistics", PartitionCreateOptions::default())?;
        let metadata = keyspace.open_partition("metadata", PartitionCreateOptions::default())?;

        Ok(Self {
            keyspace,
            job_states: Arc::new(Mutex::new(())),
            jobs,
            resources,
            statistics,
            last_statistics,
            metadata,
        })
    }

    fn put<T: Serialize>(partition: &PartitionHandle, key: Vec<u8>, value: &T) -> Result<()> {
        partition.insert(key, serde_json::to_vec(value)?)?;
        Ok(())
    }

    fn fetch<T: DeserializeOwned>(partition: &PartitionHandle, key: Vec<u8>) -> Result<Option<T>> {
        match partition.get(key)? {
            Some(value) => Ok(Some(serde_json::from_slice(&value)?)),
            None => Ok(None),
        }
    }

    pub fn upsert_job(&self, job: &Job) -> Result<()> {
        Self::put(&self.jobs, encode_job_key(&job.id), job)?;
        debug!(job_id = %job.id, state = ?job.state, "Upserted job");
        Ok(())
    }

    pub fn get_job(&self, job_id: &str) -> Result<Option<Job>> {
        Self::fetch(&self.jobs, encode_job_key(job_id))
    }

    /// Persist a new lifecycle state and return the updated job
    pub fn update_job_state(&self, job_id: &str, state: JobState) -> Result<Job> {
        let _guard = self.job_states.lock().unwrap_or_else(PoisonError::into_inner);
        let job = self.load_job(job_id)?.with_state(state);
        self.upsert_job(&job)?;
        Ok(job)
    }

    /// Move the job to `to` only if its stored state is one of `from`.
    /// Returns the job as stored afterwards; its state is `to` exactly when
    /// the transition happened.
    pub fn transition_job_state(&self, job_id: &str, from: &[JobState], to: JobState) -> Result<Job> {
        let _guard = self.job_states.lock().unwrap_or_else(PoisonError::into_inner);
        let job = self.load_job(job_id)?;
        if job.state == to || !from.contains(&job.state) {
            return Ok(job);
        }
        let job = job.with_state(to);
        self.upsert_job(&job)?;
        Ok(job)
    }

    fn load_job(&self, job_id: &str) -> Result<Job> {
        self.get_job(job_id)?
            .ok_or_else(|| LedgerError::JobNotFound(job_id.to_string()))
    }

    /// Every stored job, in key order
    pub fn list_jobs(&self) -> Result<Vec<Job>> {
        self.jobs
            .prefix("job:")
            .map(|item| -> Result<Job> {
                let (_, value) = item?;
                Ok(serde_json::from_slice(&value)?)
            })
            .collect()
    }

    pub fn upsert_resource(&self, resource: &Resource) -> Result<()> {
        Self::put(&self.resources, encode_resource_key(&resource.id), resource)
    }

    pub fn get_resource(&self, resource_id: &str) -> Result<Option<Resource>> {
        Self::fetch(&self.resources, encode_resource_key(resource_id))
    }

    /// Write a historical record; the same `(resource, job)` pair maps to the same key
    pub fn put_statistics(&self, record: &StatisticsRecord) -> Result<()> {
        let key = encode_statistics_key(
            &record.resource_id,
            &record.measurements.job_id,
            record.task_type,
        );
        Self::put(&self.statistics, key, record)
    }

    pub fn get_statistics(
        &self,
        resource_id: &str,
        job_id: &str,
        task_type: TaskType,
    ) -> Result<Option<StatisticsRecord>> {
        Self::fetch(&self.statistics, encode_statistics_key(resource_id, job_id, task_type))
    }

    /// All historical records of one resource
    pub fn statistics_for_resource(&self, resource_id: &str) -> Result<Vec<StatisticsRecord>> {
        self.statistics
            .prefix(encode_statistics_prefix(resource_id))
            .map(|item| -> Result<StatisticsRecord> {
                let (_, value) = item?;
                Ok(serde_json::from_slice(&value)?)
            })
            .collect()
    }

    pub fn get_last_statistics(&self, key: &StatisticsKey) -> Result<Option<LastStatisticsRecord>> {
        Self::fetch(&self.last_statistics, encode_last_statistics_key(key))
    }

    pub fn put_last_statistics(&self, record: &LastStatisticsRecord) -> Result<()> {
        Self::put(&self.last_statistics, encode_last_statistics_key(&record.key()), record)
    }

    /// Drop statistics records older than `ttl_days`
    pub fn prune_expired(&self, ttl_days: u32) -> Result<PruneStats> {
        let stats = prune_statistics(&self.statistics, &self.metadata, ttl_days, Utc::now())?;
        self.persist()?;
        Ok(stats)
    }

    /// Persist all pending writes to disk
    pub fn persist(&self) -> Result<()> {
        self.keyspace.persist(fjall::PersistMode::SyncAll)?;
        Ok(())
    }

    /// Record counts per partition
    pub fn stats(&self) -> Result<StoreStats> {
        let count = |partition: &PartitionHandle| -> Result<usize> {
            let mut total = 0;
            for item in partition.iter() {
                item?;
                total += 1;
            }
            Ok(total)
        };

        Ok(StoreStats {
            job_count: count(&self.jobs)?,
            resource_count: count(&self.resources)?,
            statistics_count: count(&self.statistics)?,
            last_statistics_count: count(&self.last_statistics)?,
        })
    }

    #[cfg(test)]
    pub(crate) fn statistics_partition(&self) -> &PartitionHandle {
        &self.statistics
    }

    #[cfg(test)]
    pub(crate) fn metadata_partition(&self) -> &PartitionHandle {
        &self.metadata
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoreStats {
    pub job_count: usize,
    pub resource_count: usize,
    pub statistics_count: usize,
    pub last_statistics_count: usize,
}
