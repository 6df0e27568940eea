use crate::domain::RetrievalLimits;
use crate::humanize::ByteSize;
use crate::storage::ResponseType;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Top-level configuration
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct Config {
    #[serde(default)]
    pub master: MasterConfig,
    #[serde(default)]
    pub worker: WorkerConfig,
    #[serde(default)]
    pub limits: LimitsConfig,
    #[serde(default)]
    pub ledger: LedgerConfig,
    #[serde(default)]
    pub retention: RetentionConfig,
    #[serde(default)]
    pub telemetry: TelemetryConfig,
}

/// Master-side event processing
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct MasterConfig {
    /// Bound on waiting for a job's accounting entry
    #[serde(default = "default_query_timeout_ms")]
    pub query_timeout_ms: u64,
    /// Completion events processed concurrently (across jobs)
    #[serde(default = "default_max_concurrent_events")]
    pub max_concurrent_events: usize,
    #[serde(default = "default_event_channel_size")]
    pub event_channel_size: usize,
    #[serde(default = "default_statistics_inbox_size")]
    pub statistics_inbox_size: usize,
}

impl MasterConfig {
    pub fn query_timeout(&self) -> Duration {
        Duration::from_millis(self.query_timeout_ms)
    }
}

impl Default for MasterConfig {
    fn default() -> Self {
        Self {
            query_timeout_ms: default_query_timeout_ms(),
            max_concurrent_events: default_max_concurrent_events(),
            event_channel_size: default_event_channel_size(),
            statistics_inbox_size: default_statistics_inbox_size(),
        }
    }
}

fn default_query_timeout_ms() -> u64 {
    10_000
}

fn default_max_concurrent_events() -> usize {
    64
}

fn default_event_channel_size() -> usize {
    1024
}

fn default_statistics_inbox_size() -> usize {
    1024
}

/// Worker nodes and their download pools
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct WorkerConfig {
    #[serde(default = "default_nodes")]
    pub nodes: usize,
    /// Concurrent retrievals per node
    #[serde(default = "default_pool_size")]
    pub pool_size: usize,
    #[serde(default = "default_channel_size")]
    pub channel_size: usize,
    #[serde(default)]
    pub response_type: ResponseType,
    #[serde(default = "default_path_to_save")]
    pub path_to_save: PathBuf,
    #[serde(default = "default_user_agent")]
    pub user_agent: String,
    #[serde(default = "default_throughput_grace_ms")]
    pub throughput_grace_ms: u64,
    #[serde(default = "default_limit_check_interval_ms")]
    pub limit_check_interval_ms: u64,
    #[serde(default = "default_redirect_ceiling")]
    pub redirect_ceiling: u32,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            nodes: default_nodes(),
            pool_size: default_pool_size(),
            channel_size: default_channel_size(),
            response_type: ResponseType::default(),
            path_to_save: default_path_to_save(),
            user_agent: default_user_agent(),
            throughput_grace_ms: default_throughput_grace_ms(),
            limit_check_interval_ms: default_limit_check_interval_ms(),
            redirect_ceiling: default_redirect_ceiling(),
        }
    }
}

fn default_nodes() -> usize {
    2
}

fn default_pool_size() -> usize {
    8
}

fn default_channel_size() -> usize {
    100
}

fn default_path_to_save() -> PathBuf {
    PathBuf::from("data/downloads")
}

fn default_user_agent() -> String {
    concat!("harvester/", env!("CARGO_PKG_VERSION")).to_string()
}

fn default_throughput_grace_ms() -> u64 {
    5_000
}

fn default_limit_check_interval_ms() -> u64 {
    250
}

fn default_redirect_ceiling() -> u32 {
    30
}

/// Default limits for jobs that declare none. Zero means unlimited.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct LimitsConfig {
    #[serde(default = "default_connection_timeout_ms")]
    pub connection_timeout_ms: u64,
    /// Bytes per second
    #[serde(default)]
    pub min_throughput: ByteSize,
    #[serde(default = "default_max_retrieval_time_ms")]
    pub max_retrieval_time_ms: u64,
    #[serde(default = "default_max_redirects")]
    pub max_redirects: u32,
    #[serde(default)]
    pub max_processing_time_ms: u64,
    #[serde(default)]
    pub max_content_size: ByteSize,
}

impl LimitsConfig {
    pub fn to_limits(&self) -> RetrievalLimits {
        RetrievalLimits::builder()
            .connection_timeout(Duration::from_millis(self.connection_timeout_ms))
            .min_throughput_bytes_per_sec(self.min_throughput.as_u64())
            .max_retrieval_time(Duration::from_millis(self.max_retrieval_time_ms))
            .max_redirects(self.max_redirects)
            .max_processing_time(Duration::from_millis(self.max_processing_time_ms))
            .max_content_size(self.max_content_size.as_u64())
            .build()
    }
}

impl Default for LimitsConfig {
    fn default() -> Self {
        Self {
            connection_timeout_ms: default_connection_timeout_ms(),
            min_throughput: ByteSize(0),
            max_retrieval_time_ms: default_max_retrieval_time_ms(),
            max_redirects: default_max_redirects(),
            max_processing_time_ms: 0,
            max_content_size: ByteSize(0),
        }
    }
}

fn default_connection_timeout_ms() -> u64 {
    10_000
}

fn default_max_retrieval_time_ms() -> u64 {
    600_000
}

fn default_max_redirects() -> u32 {
    10
}

/// Fjall locations
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct LedgerConfig {
    #[serde(default = "default_ledger_path")]
    pub path: PathBuf,
    #[serde(default = "default_queue_path")]
    pub queue_path: PathBuf,
}

impl Default for LedgerConfig {
    fn default() -> Self {
        Self {
            path: default_ledger_path(),
            queue_path: default_queue_path(),
        }
    }
}

fn default_ledger_path() -> PathBuf {
    PathBuf::from("data/ledger")
}

fn default_queue_path() -> PathBuf {
    PathBuf::from("data/queue")
}

/// Retention configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct RetentionConfig {
    /// Historical statistics records older than this are pruned
    #[serde(default = "default_statistics_ttl_days")]
    pub statistics_ttl_days: u32,
}

impl Default for RetentionConfig {
    fn default() -> Self {
        Self {
            statistics_ttl_days: default_statistics_ttl_days(),
        }
    }
}

fn default_statistics_ttl_days() -> u32 {
    90
}

/// Telemetry configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct TelemetryConfig {
    /// `EnvFilter` directive used when `RUST_LOG` is unset
    #[serde(default = "default_log_filter")]
    pub log_filter: String,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            log_filter: default_log_filter(),
        }
    }
}

fn default_log_filter() -> String {
    "info".to_string()
}
