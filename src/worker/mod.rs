//! Worker nodes
//!
//! Each node receives `RetrieveTask`s over its own mpsc channel and runs them
//! through a tower `Service` wrapped in a `ConcurrencyLimit` equal to the
//! configured pool size. Every finished task is published as a
//! `TaskCompletionEvent`. Concurrent executions share nothing but the HTTP
//! connection pool.

pub mod http;
pub mod runner;

use std::convert::Infallible;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::{JoinHandle, JoinSet};
use tower::limit::ConcurrencyLimit;
use tower::{Service, ServiceExt};
use tracing::{debug, error, info};

use crate::config::WorkerConfig;
use crate::domain::{RetrieveTask, TaskCompletionEvent};
use crate::messaging::EventPublisher;
use crate::observability::Metrics;
use http::{DownloaderConfig, DownloaderError, HttpDownloader};
use runner::{PostProcessor, TaskRunner};

impl From<&WorkerConfig> for DownloaderConfig {
    fn from(config: &WorkerConfig) -> Self {
        Self {
            user_agent: config.user_agent.clone(),
            throughput_grace: Duration::from_millis(config.throughput_grace_ms),
            limit_check_interval: Duration::from_millis(config.limit_check_interval_ms),
            redirect_ceiling: config.redirect_ceiling,
        }
    }
}

/// Tower service executing one task per call
#[derive(Clone)]
pub struct RetrieveService {
    runner: Arc<TaskRunner>,
}

impl RetrieveService {
    pub fn new(runner: Arc<TaskRunner>) -> Self {
        Self { runner }
    }
}

impl Service<RetrieveTask> for RetrieveService {
    type Response = TaskCompletionEvent;
    type Error = Infallible;
    type Future = Pin<Box<dyn Future<Output = Result<TaskCompletionEvent, Infallible>> + Send>>;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, task: RetrieveTask) -> Self::Future {
        let runner = self.runner.clone();
        Box::pin(async move { Ok(runner.run(task).await) })
    }
}

/// Sending half of a node's task channel
#[derive(Debug, Clone)]
pub struct NodeChannel {
    pub node_id: String,
    pub sender: mpsc::Sender<RetrieveTask>,
}

/// One node loop: pull tasks, run them within the pool limit, publish events
pub async fn run_node(
    node_id: String,
    mut receiver: mpsc::Receiver<RetrieveTask>,
    mut service: ConcurrencyLimit<RetrieveService>,
    publisher: Arc<dyn EventPublisher>,
) {
    info!(node_id = %node_id, "Worker node started");
    let mut inflight = JoinSet::new();

    while let Some(task) = receiver.recv().await {
        // Waits for a free pool slot
        let ready = match service.ready().await {
            Ok(ready) => ready,
            Err(never) => match never {},
        };
        let execution = ready.call(task);
        let publisher = publisher.clone();
        let node = node_id.clone();

        inflight.spawn(async move {
            let event = match execution.await {
                Ok(event) => event,
                Err(never) => match never {},
            };
            if let Err(e) = publisher.publish(&event).await {
                error!(node_id = %node, task_id = %event.task_id, error = %e, "Failed to publish completion event");
            }
        });

        while let Some(joined) = inflight.try_join_next() {
            if let Err(e) = joined {
                error!(node_id = %node_id, error = %e, "Task execution panicked");
            }
        }
    }

    debug!(node_id = %node_id, pending = inflight.len(), "Task channel closed, draining");
    while let Some(joined) = inflight.join_next().await {
        if let Err(e) = joined {
            error!(node_id = %node_id, error = %e, "Task execution panicked");
        }
    }
    info!(node_id = %node_id, "Worker node stopped");
}

/// Running worker nodes
pub struct WorkerPool {
    handles: Vec<JoinHandle<()>>,
}

impl WorkerPool {
    /// Wait for every node to drain; nodes stop once all task senders are dropped
    pub async fn join(self) {
        for handle in self.handles {
            if let Err(e) = handle.await {
                error!(error = %e, "Worker node panicked");
            }
        }
    }
}

/// Spawn `config.nodes` worker nodes named `node-{i}`
pub fn spawn_nodes(
    config: &WorkerConfig,
    metrics: Arc<Metrics>,
    publisher: Arc<dyn EventPublisher>,
    post_processor: Arc<dyn PostProcessor>,
) -> Result<(Vec<NodeChannel>, WorkerPool), DownloaderError> {
    let mut channels = Vec::with_capacity(config.nodes);
    let mut handles = Vec::with_capacity(config.nodes);

    for index in 0..config.nodes {
        let node_id = format!("node-{index}");
        let downloader = HttpDownloader::new(DownloaderConfig::from(config), metrics.clone())?;
        let runner = TaskRunner::new(
            node_id.clone(),
            downloader,
            post_processor.clone(),
            config.response_type,
            config.path_to_save.clone(),
        );
        let service = ConcurrencyLimit::new(RetrieveService::new(Arc::new(runner)), config.pool_size);
        let (sender, receiver) = mpsc::channel(config.channel_size);

        handles.push(tokio::spawn(run_node(
            node_id.clone(),
            receiver,
            service,
            publisher.clone(),
        )));
        channels.push(NodeChannel { node_id, sender });
    }

    Ok((channels, WorkerPool { handles }))
}
