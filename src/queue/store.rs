use crate::domain::RetrieveTask;
use crate::proto::{self, DeadLetterTask, RetrieveUrl};
use chrono::Utc;
use fjall::{Config, Keyspace, PartitionCreateOptions, PartitionHandle};
use prost::Message;
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use thiserror::Error;
use tracing::{debug, info, warn};

#[derive(Error, Debug)]
pub enum QueueError {
    #[error("Fjall error: {0}")]
    Fjall(#[from] fjall::Error),

    #[error("Protobuf decode error: {0}")]
    ProtobufDecode(#[from] prost::DecodeError),

    #[error("Task decode error: {0}")]
    TaskDecode(#[from] proto::DecodeError),

    #[error("Task not found: seq={0}")]
    TaskNotFound(u64),

    #[error("Invalid sequence key")]
    InvalidSequence,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, QueueError>;

const NEXT_SEQ: &[u8] = b"next_seq";

/// Durable log of dispatched tasks plus a dead-letter partition
///
/// - `tasks`: u64 (big-endian) → `RetrieveUrl` (protobuf)
/// - `metadata`: `next_seq` → u64
/// - `dlq`: u64 (big-endian) → `DeadLetterTask` (protobuf)
///
/// A task is persisted before it is handed to a node channel.
pub struct FjallQueue {
    keyspace: Keyspace,
    tasks: PartitionHandle,
    metadata: PartitionHandle,
    dlq: PartitionHandle,
    seq_counter: AtomicU64,
}

impl FjallQueue {
    /// Open or create a queue at the given path
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        info!(path = %path.display(), "Opening task queue");

        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let keyspace = Config::new(path).open()?;
        let tasks = keyspace.open_partition("tasks", PartitionCreateOptions::default())?;
        let metadata = keyspace.open_partition("metadata", PartitionCreateOptions::default())?;
        let dlq = keyspace.open_partition("dlq", PartitionCreateOptions::default())?;

        let current_seq = match metadata.get(NEXT_SEQ)? {
            Some(bytes) => decode_seq(&bytes)?,
            None => 0,
        };
        info!(current_seq, "Task queue opened");

        Ok(Self {
            keyspace,
            tasks,
            metadata,
            dlq,
            seq_counter: AtomicU64::new(current_seq),
        })
    }

    /// Persist a task and return its sequence number
    pub fn enqueue(&self, task: &RetrieveTask) -> Result<u64> {
        let seq = self.seq_counter.fetch_add(1, Ordering::SeqCst);

        self.tasks.insert(seq.to_be_bytes(), proto::encode_task(task))?;
        self.metadata.insert(NEXT_SEQ, (seq + 1).to_be_bytes())?;

        debug!(seq, task_id = %task.id, job_id = %task.job_id, "Task enqueued");
        Ok(seq)
    }

    pub fn get_task(&self, seq: u64) -> Result<Option<RetrieveTask>> {
        match self.tasks.get(seq.to_be_bytes())? {
            Some(bytes) => Ok(Some(proto::decode_task(&bytes)?)),
            None => Ok(None),
        }
    }

    /// Move a task that could not be delivered to the dead-letter partition
    pub fn move_to_dlq(&self, seq: u64, reason: impl Into<String>) -> Result<()> {
        let key = seq.to_be_bytes();
        let bytes = self.tasks.get(key)?.ok_or(QueueError::TaskNotFound(seq))?;
        let task = RetrieveUrl::decode(&*bytes)?;

        let entry = DeadLetterTask {
            task: Some(task),
            reason: reason.into(),
            failed_at_ms: Utc::now().timestamp_millis(),
        };
        self.dlq.insert(key, entry.encode_to_vec())?;
        self.tasks.remove(key)?;

        warn!(seq, reason = %entry.reason, "Task moved to DLQ");
        Ok(())
    }

    pub fn get_dlq_task(&self, seq: u64) -> Result<Option<DeadLetterTask>> {
        match self.dlq.get(seq.to_be_bytes())? {
            Some(bytes) => Ok(Some(DeadLetterTask::decode(&*bytes)?)),
            None => Ok(None),
        }
    }

    /// Dead-lettered tasks in sequence order
    pub fn list_dlq(&self, limit: usize) -> Result<Vec<(u64, DeadLetterTask)>> {
        let mut results = Vec::new();
        for item in self.dlq.iter().take(limit) {
            let (key, value) = item?;
            results.push((decode_seq(&key)?, DeadLetterTask::decode(&*value)?));
        }
        Ok(results)
    }

    pub fn current_seq(&self) -> u64 {
        self.seq_counter.load(Ordering::SeqCst)
    }

    /// Flush all writes to disk
    pub fn flush(&self) -> Result<()> {
        self.keyspace.persist(fjall::PersistMode::SyncAll)?;
        Ok(())
    }

    pub fn health_check(&self) -> Result<()> {
        let _ = self.metadata.get(NEXT_SEQ)?;
        Ok(())
    }
}

fn decode_seq(bytes: &[u8]) -> Result<u64> {
    let raw: [u8; 8] = bytes.try_into().map_err(|_| QueueError::InvalidSequence)?;
    Ok(u64::from_be_bytes(raw))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{ReferenceOwner, RetrievalLimits, TaskType};
    use std::collections::BTreeMap;
    use tempfile::TempDir;

    fn create_test_task(job_id: &str) -> RetrieveTask {
        RetrieveTask {
            id: format!("{job_id}:0"),
            job_id: job_id.to_string(),
            resource_id: "res1".to_string(),
            url: Some("https://example.com/file".to_string()),
            task_type: TaskType::UnconditionalDownload,
            limits: RetrievalLimits::default(),
            previous_headers: BTreeMap::new(),
            sub_tasks: Vec::new(),
            owner: ReferenceOwner::default(),
        }
    }

    #[test]
    fn test_enqueue_and_retrieve() {
        let temp_dir = TempDir::new().unwrap();
        let queue = FjallQueue::open(temp_dir.path()).unwrap();

        let task = create_test_task("job1");
        let seq = queue.enqueue(&task).unwrap();

        assert_eq!(seq, 0);
        assert_eq!(queue.get_task(seq).unwrap().unwrap(), task);
    }

    #[test]
    fn test_sequential_ids() {
        let temp_dir = TempDir::new().unwrap();
        let queue = FjallQueue::open(temp_dir.path()).unwrap();

        let seq1 = queue.enqueue(&create_test_task("job1")).unwrap();
        let seq2 = queue.enqueue(&create_test_task("job2")).unwrap();
        let seq3 = queue.enqueue(&create_test_task("job3")).unwrap();

        assert_eq!((seq1, seq2, seq3), (0, 1, 2));
    }

    #[test]
    fn test_move_to_dlq() {
        let temp_dir = TempDir::new().unwrap();
        let queue = FjallQueue::open(temp_dir.path()).unwrap();
        let seq = queue.enqueue(&create_test_task("failed_job")).unwrap();

        queue.move_to_dlq(seq, "node channel closed").unwrap();

        let entry = queue.get_dlq_task(seq).unwrap().unwrap();
        assert_eq!(entry.reason, "node channel closed");
        assert_eq!(entry.task.unwrap().job_id, "failed_job");
        assert!(queue.get_task(seq).unwrap().is_none());
        assert_eq!(queue.list_dlq(10).unwrap().len(), 1);

        assert!(matches!(
            queue.move_to_dlq(99, "missing"),
            Err(QueueError::TaskNotFound(99))
        ));
    }

    #[test]
    fn test_persistence_across_reopens() {
        let temp_dir = TempDir::new().unwrap();

        let seq = {
            let queue = FjallQueue::open(temp_dir.path()).unwrap();
            let seq = queue.enqueue(&create_test_task("job1")).unwrap();
            queue.flush().unwrap();
            seq
        };

        let queue = FjallQueue::open(temp_dir.path()).unwrap();
        assert_eq!(queue.current_seq(), 1);
        assert_eq!(queue.enqueue(&create_test_task("job2")).unwrap(), 1);
        assert_eq!(queue.get_task(seq).unwrap().unwrap().job_id, "job1");
        queue.health_check().unwrap();
    }
}
