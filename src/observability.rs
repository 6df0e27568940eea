//! Observability: tracing setup and the metrics handle injected into components

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use tracing_subscriber::EnvFilter;

use crate::config::TelemetryConfig;
use crate::domain::RetrievingState;

/// Install the global tracing subscriber.
///
/// `RUST_LOG` wins over the configured filter when set.
pub fn init_tracing(telemetry: &TelemetryConfig) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&telemetry.log_filter));

    // A subscriber may already be installed (tests, embedding)
    let _ = tracing_subscriber::fmt().with_env_filter(filter).try_init();
}

/// Counters and timers shared by worker and master components
#[derive(Debug, Default)]
pub struct Metrics {
    tasks_dispatched: AtomicU64,
    network_attempts: AtomicU64,
    retrievals_completed: AtomicU64,
    retrievals_failed: AtomicU64,
    retrievals_aborted: AtomicU64,
    retrieval_millis: AtomicU64,
    events_received: AtomicU64,
    events_ignored: AtomicU64,
    events_undecodable: AtomicU64,
    collaborator_timeouts: AtomicU64,
    jobs_finished: AtomicU64,
    statistics_recorded: AtomicU64,
}

impl Metrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn task_dispatched(&self) {
        self.tasks_dispatched.fetch_add(1, Ordering::Relaxed);
        tracing::trace!(counter = "tasks_dispatched", "Metric incremented");
    }

    pub fn network_attempt(&self) {
        self.network_attempts.fetch_add(1, Ordering::Relaxed);
    }

    /// Count a finished retrieval by terminal state and add its wall time
    pub fn retrieval_finished(&self, state: RetrievingState, elapsed: Duration) {
        let counter = match state {
            RetrievingState::Completed => &self.retrievals_completed,
            RetrievingState::AbortedTimeLimit | RetrievingState::AbortedSizeLimit => {
                &self.retrievals_aborted
            }
            _ => &self.retrievals_failed,
        };
        counter.fetch_add(1, Ordering::Relaxed);
        self.retrieval_millis
            .fetch_add(elapsed.as_millis() as u64, Ordering::Relaxed);
        tracing::trace!(state = state.as_str(), "Retrieval metric recorded");
    }

    pub fn event_received(&self) {
        self.events_received.fetch_add(1, Ordering::Relaxed);
    }

    /// A completion that changed nothing (duplicate or late delivery)
    pub fn event_ignored(&self) {
        self.events_ignored.fetch_add(1, Ordering::Relaxed);
    }

    pub fn event_undecodable(&self) {
        self.events_undecodable.fetch_add(1, Ordering::Relaxed);
    }

    pub fn collaborator_timeout(&self) {
        self.collaborator_timeouts.fetch_add(1, Ordering::Relaxed);
        tracing::debug!(counter = "collaborator_timeouts", "Metric incremented");
    }

    pub fn job_finished(&self) {
        self.jobs_finished.fetch_add(1, Ordering::Relaxed);
        tracing::debug!(counter = "jobs_finished", "Metric incremented");
    }

    pub fn statistics_recorded(&self) {
        self.statistics_recorded.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            tasks_dispatched: self.tasks_dispatched.load(Ordering::Relaxed),
            network_attempts: self.network_attempts.load(Ordering::Relaxed),
            retrievals_completed: self.retrievals_completed.load(Ordering::Relaxed),
            retrievals_failed: self.retrievals_failed.load(Ordering::Relaxed),
            retrievals_aborted: self.retrievals_aborted.load(Ordering::Relaxed),
            retrieval_millis: self.retrieval_millis.load(Ordering::Relaxed),
            events_received: self.events_received.load(Ordering::Relaxed),
            events_ignored: self.events_ignored.load(Ordering::Relaxed),
            events_undecodable: self.events_undecodable.load(Ordering::Relaxed),
            collaborator_timeouts: self.collaborator_timeouts.load(Ordering::Relaxed),
            jobs_finished: self.jobs_finished.load(Ordering::Relaxed),
            statistics_recorded: self.statistics_recorded.load(Ordering::Relaxed),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize)]
pub struct MetricsSnapshot {
    pub tasks_dispatched: u64,
    pub network_attempts: u64,
    pub retrievals_completed: u64,
    pub retrievals_failed: u64,
    pub retrievals_aborted: u64,
    pub retrieval_millis: u64,
    pub events_received: u64,
    pub events_ignored: u64,
    pub events_undecodable: u64,
    pub collaborator_timeouts: u64,
    pub jobs_finished: u64,
    pub statistics_recorded: u64,
}
