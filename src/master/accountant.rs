//! In-memory registry of outstanding tasks per job
//!
//! Each job's entry sits behind its own async mutex, so check-then-act
//! sequences on one job are serialized while different jobs never contend.
//! The outer map lock is held only to find, create or drop an entry.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::{Mutex, OwnedMutexGuard, RwLock};
use tracing::debug;

use crate::domain::{RetrieveTask, TaskState};

#[derive(Debug, Error, PartialEq, Eq)]
pub enum AccountingError {
    #[error("Unknown job: {0}")]
    UnknownJob(String),

    #[error("Unknown task {task_id} of job {job_id}")]
    UnknownTask { job_id: String, task_id: String },
}

/// One dispatched task as the accountant sees it
#[derive(Debug, Clone)]
pub struct TaskRecord {
    pub task: RetrieveTask,
    pub node_id: String,
    pub state: TaskState,
}

/// Result of applying a completion to a job's entry
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Recorded {
    /// The task moved to a terminal state
    Updated,
    /// The task was already terminal; nothing changed
    Duplicate,
    /// No such task in this job
    Unknown,
}

/// Accounting entry of one job. Obtain it through [`TaskAccountant::lock_job`].
#[derive(Debug, Default)]
pub struct JobAccount {
    tasks: HashMap<String, TaskRecord>,
    removed: bool,
}

impl JobAccount {
    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    pub fn states(&self) -> Vec<TaskState> {
        self.tasks.values().map(|record| record.state).collect()
    }

    /// True when every accounted task is DONE or ERROR
    pub fn all_terminal(&self) -> bool {
        self.tasks.values().all(|record| record.state.is_terminal())
    }

    pub fn is_removed(&self) -> bool {
        self.removed
    }

    /// Tasks not yet DONE or ERROR
    pub fn outstanding(&self) -> Vec<TaskRecord> {
        self.tasks
            .values()
            .filter(|record| !record.state.is_terminal())
            .cloned()
            .collect()
    }

    /// Apply a terminal state. A task is never moved out of a terminal state.
    pub fn record(&mut self, task_id: &str, state: TaskState) -> (Recorded, Option<String>) {
        match self.tasks.get_mut(task_id) {
            None => (Recorded::Unknown, None),
            Some(record) if record.state.is_terminal() => (Recorded::Duplicate, None),
            Some(record) => {
                record.state = state;
                (Recorded::Updated, Some(record.node_id.clone()))
            }
        }
    }

    fn outstanding_by_node(&self) -> HashMap<String, usize> {
        let mut loads = HashMap::new();
        for record in self.tasks.values().filter(|r| !r.state.is_terminal()) {
            *loads.entry(record.node_id.clone()).or_insert(0) += 1;
        }
        loads
    }
}

#[derive(Default)]
struct Registry {
    jobs: HashMap<String, Arc<Mutex<JobAccount>>>,
    retired: HashSet<String>,
}

/// Authoritative record of which tasks are outstanding for which job, and
/// on which node
#[derive(Default)]
pub struct TaskAccountant {
    registry: RwLock<Registry>,
    node_load: Mutex<HashMap<String, usize>>,
}

impl TaskAccountant {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an outstanding task. Re-assigning a known task is a no-op.
    pub async fn assign(
        &self,
        job_id: &str,
        task_id: &str,
        task: RetrieveTask,
        node_id: &str,
    ) -> Result<(), AccountingError> {
        let entry = {
            let mut registry = self.registry.write().await;
            if registry.retired.contains(job_id) {
                return Err(AccountingError::UnknownJob(job_id.to_string()));
            }
            registry.jobs.entry(job_id.to_string()).or_default().clone()
        };

        let mut account = entry.lock().await;
        if account.removed {
            return Err(AccountingError::UnknownJob(job_id.to_string()));
        }
        if account.tasks.contains_key(task_id) {
            return Ok(());
        }

        account.tasks.insert(
            task_id.to_string(),
            TaskRecord {
                task,
                node_id: node_id.to_string(),
                state: TaskState::Pending,
            },
        );
        *self.node_load.lock().await.entry(node_id.to_string()).or_insert(0) += 1;
        debug!(job_id, task_id, node_id, "Task assigned");
        Ok(())
    }

    /// Mark a task as picked up by its node
    pub async fn mark_running(&self, job_id: &str, task_id: &str) {
        if let Some(mut account) = self.lock_job(job_id).await {
            if let Some(record) = account.tasks.get_mut(task_id) {
                if record.state == TaskState::Pending {
                    record.state = TaskState::Running;
                }
            }
        }
    }

    /// Record a terminal state; unknown jobs and tasks are ignored
    pub async fn record_completion(&self, job_id: &str, task_id: &str, state: TaskState) -> Recorded {
        match self.lock_job(job_id).await {
            Some(mut account) => self.apply(&mut account, job_id, task_id, state).await,
            None => {
                debug!(job_id, task_id, "Completion for unknown job ignored");
                Recorded::Unknown
            }
        }
    }

    /// [`JobAccount::record`] plus node capacity bookkeeping
    pub async fn apply(
        &self,
        account: &mut JobAccount,
        job_id: &str,
        task_id: &str,
        state: TaskState,
    ) -> Recorded {
        let (recorded, node) = account.record(task_id, state);
        match (recorded, node) {
            (Recorded::Updated, Some(node_id)) => self.release(&node_id, 1).await,
            (Recorded::Unknown, _) => {
                let error = AccountingError::UnknownTask {
                    job_id: job_id.to_string(),
                    task_id: task_id.to_string(),
                };
                debug!(error = %error, "Completion ignored");
            }
            _ => debug!(job_id, task_id, "Duplicate completion ignored"),
        }
        recorded
    }

    /// Current state of every task of the job, `None` if the job is not accounted
    pub async fn states_for_job(&self, job_id: &str) -> Option<Vec<TaskState>> {
        self.lock_job(job_id).await.map(|account| account.states())
    }

    pub async fn task(&self, job_id: &str, task_id: &str) -> Option<TaskRecord> {
        self.lock_job(job_id)
            .await
            .and_then(|account| account.tasks.get(task_id).cloned())
    }

    pub async fn has_task(&self, job_id: &str, task_id: &str) -> bool {
        self.task(job_id, task_id).await.is_some()
    }

    /// Forget a task that never reached a node
    pub async fn withdraw(&self, job_id: &str, task_id: &str) {
        if let Some(mut account) = self.lock_job(job_id).await {
            if let Some(record) = account.tasks.remove(task_id) {
                if !record.state.is_terminal() {
                    self.release(&record.node_id, 1).await;
                }
            }
        }
    }

    /// Exclusive access to a job's entry; `None` if the job is not accounted
    pub async fn lock_job(&self, job_id: &str) -> Option<OwnedMutexGuard<JobAccount>> {
        let entry = self.registry.read().await.jobs.get(job_id).cloned()?;
        let account = entry.lock_owned().await;
        (!account.removed).then_some(account)
    }

    /// Drop the job held by `account` and free its node capacity
    pub async fn retire(&self, job_id: &str, mut account: OwnedMutexGuard<JobAccount>) {
        if account.removed {
            return;
        }
        account.removed = true;

        {
            let mut registry = self.registry.write().await;
            registry.jobs.remove(job_id);
            registry.retired.insert(job_id.to_string());
        }

        for (node_id, count) in account.outstanding_by_node() {
            self.release(&node_id, count).await;
        }
        account.tasks.clear();
        debug!(job_id, "Job accounting removed");
    }

    /// Delete a job's accounting entry; safe to call repeatedly
    pub async fn remove_job(&self, job_id: &str) {
        match self.lock_job(job_id).await {
            Some(account) => self.retire(job_id, account).await,
            None => {
                self.registry.write().await.retired.insert(job_id.to_string());
            }
        }
    }

    /// Outstanding (non-terminal) tasks assigned to a node
    pub async fn node_load(&self, node_id: &str) -> usize {
        self.node_load.lock().await.get(node_id).copied().unwrap_or(0)
    }

    async fn release(&self, node_id: &str, count: usize) {
        let mut loads = self.node_load.lock().await;
        if let Some(load) = loads.get_mut(node_id) {
            *load = load.saturating_sub(count);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{ReferenceOwner, RetrievalLimits, TaskType};
    use std::collections::BTreeMap;

    fn task(job_id: &str, index: usize) -> RetrieveTask {
        RetrieveTask {
            id: format!("{job_id}:{index}"),
            job_id: job_id.into(),
            resource_id: format!("res-{index}"),
            url: Some(format!("http://origin.test/{index}")),
            task_type: TaskType::UnconditionalDownload,
            limits: RetrievalLimits::default(),
            previous_headers: BTreeMap::new(),
            sub_tasks: Vec::new(),
            owner: ReferenceOwner::default(),
        }
    }

    #[tokio::test]
    async fn test_assign_and_complete() {
        let accountant = TaskAccountant::new();
        accountant.assign("job-1", "job-1:0", task("job-1", 0), "node-0").await.unwrap();
        accountant.assign("job-1", "job-1:1", task("job-1", 1), "node-1").await.unwrap();
        assert_eq!(accountant.node_load("node-0").await, 1);

        let recorded = accountant.record_completion("job-1", "job-1:0", TaskState::Done).await;
        assert_eq!(recorded, Recorded::Updated);
        assert_eq!(accountant.node_load("node-0").await, 0);

        let mut states = accountant.states_for_job("job-1").await.unwrap();
        states.sort_by_key(|s| s.is_terminal());
        assert_eq!(states, vec![TaskState::Pending, TaskState::Done]);
    }

    #[tokio::test]
    async fn test_completion_is_idempotent() {
        let accountant = TaskAccountant::new();
        accountant.assign("job-1", "job-1:0", task("job-1", 0), "node-0").await.unwrap();

        accountant.record_completion("job-1", "job-1:0", TaskState::Error).await;
        let again = accountant.record_completion("job-1", "job-1:0", TaskState::Done).await;

        assert_eq!(again, Recorded::Duplicate);
        assert_eq!(accountant.states_for_job("job-1").await.unwrap(), vec![TaskState::Error]);
        assert_eq!(
            accountant.record_completion("job-1", "job-1:9", TaskState::Done).await,
            Recorded::Unknown
        );
        assert_eq!(
            accountant.record_completion("job-x", "job-x:0", TaskState::Done).await,
            Recorded::Unknown
        );
    }

    #[tokio::test]
    async fn test_remove_job_is_idempotent_and_frees_capacity() {
        let accountant = TaskAccountant::new();
        accountant.assign("job-1", "job-1:0", task("job-1", 0), "node-0").await.unwrap();
        accountant.assign("job-1", "job-1:1", task("job-1", 1), "node-0").await.unwrap();
        assert_eq!(accountant.node_load("node-0").await, 2);

        accountant.remove_job("job-1").await;
        accountant.remove_job("job-1").await;

        assert_eq!(accountant.node_load("node-0").await, 0);
        assert!(accountant.states_for_job("job-1").await.is_none());
        assert!(!accountant.has_task("job-1", "job-1:0").await);
    }

    #[tokio::test]
    async fn test_assign_after_removal_fails() {
        let accountant = TaskAccountant::new();
        accountant.assign("job-1", "job-1:0", task("job-1", 0), "node-0").await.unwrap();
        accountant.remove_job("job-1").await;

        let result = accountant.assign("job-1", "job-1:1", task("job-1", 1), "node-0").await;
        assert_eq!(result, Err(AccountingError::UnknownJob("job-1".into())));
    }

    #[tokio::test]
    async fn test_withdraw_releases_node() {
        let accountant = TaskAccountant::new();
        accountant.assign("job-1", "job-1:0", task("job-1", 0), "node-0").await.unwrap();
        accountant.mark_running("job-1", "job-1:0").await;
        assert_eq!(
            accountant.task("job-1", "job-1:0").await.unwrap().state,
            TaskState::Running
        );

        accountant.withdraw("job-1", "job-1:0").await;

        assert_eq!(accountant.node_load("node-0").await, 0);
        assert_eq!(accountant.states_for_job("job-1").await.unwrap(), Vec::new());
    }

    #[tokio::test]
    async fn test_jobs_lock_independently() {
        let accountant = Arc::new(TaskAccountant::new());
        accountant.assign("job-1", "job-1:0", task("job-1", 0), "node-0").await.unwrap();
        accountant.assign("job-2", "job-2:0", task("job-2", 0), "node-0").await.unwrap();

        let _held = accountant.lock_job("job-1").await.unwrap();
        // job-2 stays reachable while job-1 is held
        let recorded = tokio::time::timeout(
            std::time::Duration::from_secs(1),
            accountant.record_completion("job-2", "job-2:0", TaskState::Done),
        )
        .await
        .unwrap();
        assert_eq!(recorded, Recorded::Updated);
    }
}
