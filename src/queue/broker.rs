use crate::domain::{Job, JobState, RetrievalLimits, RetrieveTask, StatisticsKey, TaskType};
use crate::ledger::{FjallStore, LedgerError};
use crate::master::{AccountingError, TaskAccountant};
use crate::observability::Metrics;
use crate::queue::store::{FjallQueue, QueueError};
use crate::worker::NodeChannel;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use thiserror::Error;
use tracing::{debug, info, warn};

#[derive(Error, Debug)]
pub enum DispatchError {
    #[error("Queue error: {0}")]
    Queue(#[from] QueueError),

    #[error("Ledger error: {0}")]
    Ledger(#[from] LedgerError),

    #[error("Accounting error: {0}")]
    Accounting(#[from] AccountingError),

    #[error("Job not found: {0}")]
    JobNotFound(String),

    #[error("Job {job_id} has no task {index}")]
    TaskNotFound { job_id: String, index: usize },

    #[error("Job {job_id} is {state:?} and cannot be started")]
    JobNotStartable { job_id: String, state: JobState },

    #[error("Node {0} is not accepting tasks")]
    NodeUnavailable(String),

    #[error("No worker nodes configured")]
    NoNodes,
}

pub type Result<T> = std::result::Result<T, DispatchError>;

/// What happened to one dispatch request
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Dispatched {
    /// Persisted, accounted and handed to a node
    Sent { seq: u64, node_id: String },
    /// The task is already outstanding
    AlreadyAssigned,
    /// The job is paused or finished
    Held(JobState),
}

/// Hands tasks to worker nodes
///
/// Every task is persisted to the [`FjallQueue`] and registered with the
/// [`TaskAccountant`] before it is sent, so a completion can never arrive
/// for a task the master does not know about. Nodes are picked by lowest
/// outstanding load, ties broken round-robin. Sends wait on the node's
/// bounded channel.
pub struct Dispatcher {
    queue: Arc<FjallQueue>,
    ledger: FjallStore,
    accountant: Arc<TaskAccountant>,
    nodes: Vec<NodeChannel>,
    next_node: AtomicUsize,
    default_limits: RetrievalLimits,
    metrics: Arc<Metrics>,
}

impl Dispatcher {
    pub fn new(
        queue: Arc<FjallQueue>,
        ledger: FjallStore,
        accountant: Arc<TaskAccountant>,
        nodes: Vec<NodeChannel>,
        default_limits: RetrievalLimits,
        metrics: Arc<Metrics>,
    ) -> Self {
        info!(nodes = nodes.len(), "Creating dispatcher");
        Self {
            queue,
            ledger,
            accountant,
            nodes,
            next_node: AtomicUsize::new(0),
            default_limits,
            metrics,
        }
    }

    pub fn num_nodes(&self) -> usize {
        self.nodes.len()
    }

    /// True while every node channel is open
    pub fn health_check(&self) -> bool {
        self.nodes.iter().all(|node| !node.sender.is_closed())
    }

    /// Assign one task of `job_id` to a node
    pub async fn dispatch(&self, job_id: &str, task: RetrieveTask) -> Result<Dispatched> {
        let job = self.load_job(job_id)?;
        if !job.state.accepts_dispatch() {
            debug!(job_id, task_id = %task.id, state = ?job.state, "Dispatch held");
            return Ok(Dispatched::Held(job.state));
        }
        if self.accountant.has_task(job_id, &task.id).await {
            return Ok(Dispatched::AlreadyAssigned);
        }

        let node = self.pick_node().await?;
        let seq = self.queue.enqueue(&task)?;
        self.accountant
            .assign(job_id, &task.id, task.clone(), &node.node_id)
            .await?;

        if matches!(job.state, JobState::Ready | JobState::Resume) {
            let job = self.transition(
                job_id,
                &[JobState::Ready, JobState::Resume],
                JobState::Running,
            )?;
            if job.state == JobState::Running {
                info!(job_id, "Job running");
            }
        }

        let task_id = task.id.clone();
        if node.sender.send(task).await.is_err() {
            warn!(job_id, task_id = %task_id, node_id = %node.node_id, "Node channel closed");
            self.accountant.withdraw(job_id, &task_id).await;
            self.queue.move_to_dlq(seq, format!("node {} channel closed", node.node_id))?;
            return Err(DispatchError::NodeUnavailable(node.node_id.clone()));
        }

        self.metrics.task_dispatched();
        debug!(seq, job_id, task_id = %task_id, node_id = %node.node_id, "Task dispatched");
        Ok(Dispatched::Sent {
            seq,
            node_id: node.node_id.clone(),
        })
    }

    /// Dispatch every task of the job that is not yet outstanding; returns how many were sent
    pub async fn dispatch_job(&self, job_id: &str) -> Result<usize> {
        let job = self.load_job(job_id)?;
        let mut sent = 0;

        for index in 0..job.tasks.len() {
            let task = self.build_task(&job, index)?;
            match self.dispatch(job_id, task).await? {
                Dispatched::Sent { .. } => sent += 1,
                Dispatched::AlreadyAssigned => {}
                Dispatched::Held(state) => {
                    debug!(job_id, state = ?state, "Job stopped mid-dispatch");
                    break;
                }
            }
        }

        info!(job_id, sent, total = job.tasks.len(), "Job dispatched");
        Ok(sent)
    }

    /// Move the job to RESUME and dispatch whatever is not outstanding yet
    pub async fn start_job(&self, job_id: &str) -> Result<usize> {
        let job = self.transition(
            job_id,
            &[JobState::Ready, JobState::Running, JobState::Pause],
            JobState::Resume,
        )?;
        if job.state == JobState::Finished {
            return Err(DispatchError::JobNotStartable {
                job_id: job_id.to_string(),
                state: job.state,
            });
        }

        info!(job_id, "Job resumed");
        self.dispatch_job(job_id).await
    }

    /// Stop new dispatches for the job; tasks already on nodes run to completion.
    /// A job that finished meanwhile stays finished.
    pub fn stop_job(&self, job_id: &str) -> Result<JobState> {
        let job = self.transition(
            job_id,
            &[JobState::Ready, JobState::Running, JobState::Resume],
            JobState::Pause,
        )?;
        if job.state == JobState::Pause {
            info!(job_id, "Job paused");
        }
        Ok(job.state)
    }

    /// Descriptor for the job's task at `index`
    pub fn build_task(&self, job: &Job, index: usize) -> Result<RetrieveTask> {
        let job_task = job.tasks.get(index).ok_or_else(|| DispatchError::TaskNotFound {
            job_id: job.id.clone(),
            index,
        })?;
        let resource = self.ledger.get_resource(&job_task.resource_id)?;

        let previous_headers = if job_task.task_type == TaskType::ConditionalDownload {
            let key = StatisticsKey {
                resource_id: job_task.resource_id.clone(),
                task_type: job_task.task_type,
                url_source_type: job.url_source_type,
            };
            self.ledger
                .get_last_statistics(&key)?
                .map(|last| last.measurements.headers)
                .unwrap_or_default()
        } else {
            Default::default()
        };

        let limits = if job.limits == RetrievalLimits::unlimited() {
            self.default_limits.clone()
        } else {
            job.limits.clone()
        };

        Ok(RetrieveTask {
            id: job.task_id(index),
            job_id: job.id.clone(),
            resource_id: job_task.resource_id.clone(),
            url: resource.and_then(|r| r.url),
            task_type: job_task.task_type,
            limits,
            previous_headers,
            sub_tasks: job_task.sub_tasks.clone(),
            owner: job.owner.clone(),
        })
    }

    fn load_job(&self, job_id: &str) -> Result<Job> {
        self.ledger
            .get_job(job_id)?
            .ok_or_else(|| DispatchError::JobNotFound(job_id.to_string()))
    }

    fn transition(&self, job_id: &str, from: &[JobState], to: JobState) -> Result<Job> {
        self.ledger
            .transition_job_state(job_id, from, to)
            .map_err(|e| match e {
                LedgerError::JobNotFound(id) => DispatchError::JobNotFound(id),
                e => DispatchError::Ledger(e),
            })
    }

    async fn pick_node(&self) -> Result<&NodeChannel> {
        if self.nodes.is_empty() {
            return Err(DispatchError::NoNodes);
        }

        let start = self.next_node.fetch_add(1, Ordering::Relaxed) % self.nodes.len();
        let mut best: Option<(&NodeChannel, usize)> = None;
        for offset in 0..self.nodes.len() {
            let node = &self.nodes[(start + offset) % self.nodes.len()];
            let load = self.accountant.node_load(&node.node_id).await;
            if best.is_none_or(|(_, lowest)| load < lowest) {
                best = Some((node, load));
            }
        }
        best.map(|(node, _)| node).ok_or(DispatchError::NoNodes)
    }
}
