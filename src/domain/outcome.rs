use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::net::IpAddr;
use std::path::PathBuf;
use std::time::{Duration, Instant};
use thiserror::Error;

use super::limits::duration_ms;

/// Downloader state machine
///
/// `PENDING -> {CHECKING_EXISTENCE -> SKIPPED_COMPLETED | DOWNLOADING} ->
/// COMPLETED | ERROR | ABORTED_TIME_LIMIT | ABORTED_SIZE_LIMIT`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RetrievingState {
    Pending,
    CheckingExistence,
    SkippedCompleted,
    Downloading,
    Completed,
    Error,
    AbortedTimeLimit,
    AbortedSizeLimit,
}

impl RetrievingState {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            RetrievingState::Completed
                | RetrievingState::Error
                | RetrievingState::AbortedTimeLimit
                | RetrievingState::AbortedSizeLimit
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            RetrievingState::Pending => "PENDING",
            RetrievingState::CheckingExistence => "CHECKING_EXISTENCE",
            RetrievingState::SkippedCompleted => "SKIPPED_COMPLETED",
            RetrievingState::Downloading => "DOWNLOADING",
            RetrievingState::Completed => "COMPLETED",
            RetrievingState::Error => "ERROR",
            RetrievingState::AbortedTimeLimit => "ABORTED_TIME_LIMIT",
            RetrievingState::AbortedSizeLimit => "ABORTED_SIZE_LIMIT",
        }
    }
}

/// Failure taxonomy of a single retrieval. Never returned to callers of the
/// downloader; each variant resolves to a terminal [`RetrievingState`].
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum RetrievalError {
    #[error("malformed input: {0}")]
    MalformedInput(String),

    #[error("DNS resolution failed for {host}: {reason}")]
    DnsResolution { host: String, reason: String },

    #[error("connection not established within {0:?}")]
    ConnectTimeout(Duration),

    #[error("retrieval exceeded time limit of {0:?}")]
    ReadTimeout(Duration),

    #[error("task processing exceeded time limit of {0:?}")]
    ProcessingTimeout(Duration),

    #[error("throughput {observed} B/s below floor of {floor} B/s")]
    ThroughputTooLow { observed: u64, floor: u64 },

    #[error("more than {0} redirects")]
    RedirectLimitExceeded(u32),

    #[error("HTTP status {0}")]
    HttpStatus(u16),

    #[error("content size {observed} exceeds limit of {limit} bytes")]
    SizeLimitExceeded { observed: u64, limit: u64 },

    #[error("network failure: {0}")]
    Network(String),

    #[error("sink failure: {0}")]
    Sink(String),
}

impl RetrievalError {
    pub fn terminal_state(&self) -> RetrievingState {
        match self {
            RetrievalError::ConnectTimeout(_)
            | RetrievalError::ReadTimeout(_)
            | RetrievalError::ProcessingTimeout(_)
            | RetrievalError::ThroughputTooLow { .. } => RetrievingState::AbortedTimeLimit,
            RetrievalError::SizeLimitExceeded { .. } => RetrievingState::AbortedSizeLimit,
            RetrievalError::MalformedInput(_)
            | RetrievalError::DnsResolution { .. }
            | RetrievalError::RedirectLimitExceeded(_)
            | RetrievalError::HttpStatus(_)
            | RetrievalError::Network(_)
            | RetrievalError::Sink(_) => RetrievingState::Error,
        }
    }
}

/// Per-phase timings. Always populated; a phase that never ran stays zero.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PhaseDurations {
    /// Request start until the response headers of the transfer request
    #[serde(rename = "connect_ms", with = "duration_ms")]
    pub connect: Duration,
    /// Metadata-only existence check
    #[serde(rename = "checking_ms", with = "duration_ms")]
    pub checking: Duration,
    /// Body transfer
    #[serde(rename = "retrieval_ms", with = "duration_ms")]
    pub retrieval: Duration,
}

/// Phase whose duration is being measured
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Phase {
    Connect,
    Checking,
    Retrieval,
}

impl PhaseDurations {
    fn slot(&mut self, phase: Phase) -> &mut Duration {
        match phase {
            Phase::Connect => &mut self.connect,
            Phase::Checking => &mut self.checking,
            Phase::Retrieval => &mut self.retrieval,
        }
    }
}

/// Where a retrieved body was written
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "path", rename_all = "snake_case")]
pub enum StorageLocation {
    Disk(PathBuf),
    Memory,
}

impl StorageLocation {
    pub fn describe(&self) -> String {
        match self {
            StorageLocation::Disk(path) => path.display().to_string(),
            StorageLocation::Memory => "memory".to_string(),
        }
    }
}

/// Accumulated result of one retrieval
///
/// Mutated by the downloader while it runs; once the state is terminal every
/// further transition is ignored.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetrievalOutcome {
    pub state: RetrievingState,
    /// Every state visited, in order
    pub history: Vec<RetrievingState>,
    pub bytes_transferred: u64,
    pub http_status: Option<u16>,
    pub content_type: Option<String>,
    pub headers: BTreeMap<String, String>,
    pub source_ip: Option<IpAddr>,
    pub durations: PhaseDurations,
    pub redirection_path: Vec<String>,
    pub log: String,
    pub storage: StorageLocation,
    /// Phase still running; closed into `durations` on the terminal transition
    #[serde(skip)]
    pub(crate) open_phase: Option<(Phase, Instant)>,
}

impl RetrievalOutcome {
    pub fn new(storage: StorageLocation) -> Self {
        Self {
            state: RetrievingState::Pending,
            history: vec![RetrievingState::Pending],
            bytes_transferred: 0,
            http_status: None,
            content_type: None,
            headers: BTreeMap::new(),
            source_ip: None,
            durations: PhaseDurations::default(),
            redirection_path: Vec::new(),
            log: String::new(),
            storage,
            open_phase: None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.state.is_terminal()
    }

    pub(crate) fn transition(&mut self, next: RetrievingState) {
        if self.state.is_terminal() {
            return;
        }
        self.state = next;
        self.history.push(next);
    }

    pub(crate) fn begin_phase(&mut self, phase: Phase) {
        self.end_phase();
        self.open_phase = Some((phase, Instant::now()));
    }

    pub(crate) fn end_phase(&mut self) {
        if let Some((phase, started)) = self.open_phase.take() {
            *self.durations.slot(phase) = started.elapsed();
        }
    }

    pub(crate) fn note(&mut self, line: impl AsRef<str>) {
        if !self.log.is_empty() {
            self.log.push('\n');
        }
        self.log.push_str(line.as_ref());
    }

    pub(crate) fn complete(&mut self, bytes: u64) {
        self.end_phase();
        if self.state.is_terminal() {
            return;
        }
        self.bytes_transferred = bytes;
        self.transition(RetrievingState::Completed);
    }

    /// Terminate with the state the error maps to; bytes are discarded
    pub(crate) fn fail(&mut self, error: &RetrievalError) {
        self.end_phase();
        if self.state.is_terminal() {
            return;
        }
        self.bytes_transferred = 0;
        self.note(error.to_string());
        self.transition(error.terminal_state());
    }

    /// Terminal outcome built without running the downloader
    pub fn failed(storage: StorageLocation, error: &RetrievalError) -> Self {
        let mut outcome = Self::new(storage);
        outcome.fail(error);
        outcome
    }
}
