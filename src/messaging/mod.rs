//! Completion event transport between worker nodes and the master
//!
//! Delivery is at-least-once: a publisher may hand the same event over more
//! than once and consumers must tolerate duplicates. Events travel as
//! protobuf-encoded `DoneProcessing` payloads.

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::mpsc;

use crate::domain::TaskCompletionEvent;
use crate::proto;

#[derive(Debug, Error)]
pub enum MessagingError {
    #[error("Publish failed: {0}")]
    PublishFailed(String),

    #[error("Channel closed")]
    Closed,
}

pub type Result<T> = std::result::Result<T, MessagingError>;

/// Publishes task completion events towards the master
#[async_trait]
pub trait EventPublisher: Send + Sync {
    async fn publish(&self, event: &TaskCompletionEvent) -> Result<()>;

    /// Health check
    async fn health(&self) -> bool;
}

/// In-process publisher over a bounded channel
#[derive(Debug, Clone)]
pub struct ChannelPublisher {
    sender: mpsc::Sender<Vec<u8>>,
}

impl ChannelPublisher {
    pub fn new(sender: mpsc::Sender<Vec<u8>>) -> Self {
        Self { sender }
    }
}

#[async_trait]
impl EventPublisher for ChannelPublisher {
    async fn publish(&self, event: &TaskCompletionEvent) -> Result<()> {
        let payload = proto::encode_event(event);
        tracing::debug!(
            job_id = %event.job_id,
            task_id = %event.task_id,
            size = payload.len(),
            "Publishing completion event"
        );
        self.sender
            .send(payload)
            .await
            .map_err(|_| MessagingError::Closed)
    }

    async fn health(&self) -> bool {
        !self.sender.is_closed()
    }
}

/// Bounded event channel: the publisher half goes to worker nodes, the
/// receiver half to the master
pub fn channel(capacity: usize) -> (ChannelPublisher, mpsc::Receiver<Vec<u8>>) {
    let (sender, receiver) = mpsc::channel(capacity);
    (ChannelPublisher::new(sender), receiver)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{
        ProcessingState, RetrievalError, RetrievalOutcome, StorageLocation, SubTaskState,
        SubTaskStats, TaskType,
    };

    fn failed_event() -> TaskCompletionEvent {
        TaskCompletionEvent {
            job_id: "job-1".into(),
            task_id: "job-1:0".into(),
            resource_id: "res-1".into(),
            task_type: TaskType::UnconditionalDownload,
            processing_state: ProcessingState::Error,
            sub_task_stats: SubTaskStats::default().with_retrieve(SubTaskState::Error),
            outcome: RetrievalOutcome::failed(
                StorageLocation::Memory,
                &RetrievalError::MalformedInput("missing url".into()),
            ),
            node_id: "node-0".into(),
            completed_at: chrono::Utc::now(),
        }
    }

    #[tokio::test]
    async fn test_channel_publisher_delivers_encoded_event() {
        let (publisher, mut receiver) = channel(4);
        let event = failed_event();

        publisher.publish(&event).await.unwrap();
        publisher.publish(&event).await.unwrap();

        let first = proto::decode_event(&receiver.recv().await.unwrap()).unwrap();
        let second = proto::decode_event(&receiver.recv().await.unwrap()).unwrap();
        assert_eq!(first.task_id, "job-1:0");
        assert_eq!(first, second);
    }

    #[tokio::test]
    async fn test_publish_fails_when_master_is_gone() {
        let (publisher, receiver) = channel(1);
        drop(receiver);

        assert!(!publisher.health().await);
        assert!(matches!(
            publisher.publish(&failed_event()).await,
            Err(MessagingError::Closed)
        ));
    }
}
