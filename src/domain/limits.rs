use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Per-task retrieval limits.
///
/// Every dimension uses zero as "unlimited". A task owns its own copy; limits
/// are never shared or aggregated across tasks.
///
/// ```rust,ignore
/// use std::time::Duration;
/// use harvester::domain::RetrievalLimits;
///
/// let limits = RetrievalLimits::builder()
///     .connection_timeout(Duration::from_secs(10))
///     .max_redirects(5)
///     .build();
/// ```
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize, bon::Builder)]
pub struct RetrievalLimits {
    /// Bound on opening the connection and receiving response headers
    #[builder(default)]
    #[serde(default, rename = "connection_timeout_ms", with = "duration_ms")]
    pub connection_timeout: Duration,

    /// Sustained throughput floor in bytes/sec, enforced after a grace window
    #[builder(default)]
    #[serde(default)]
    pub min_throughput_bytes_per_sec: u64,

    /// Wall-time bound on the whole retrieval (request + body transfer)
    #[builder(default)]
    #[serde(default, rename = "max_retrieval_time_ms", with = "duration_ms")]
    pub max_retrieval_time: Duration,

    #[builder(default)]
    #[serde(default)]
    pub max_redirects: u32,

    /// Wall-time bound on retrieval plus post-processing
    #[builder(default)]
    #[serde(default, rename = "max_processing_time_ms", with = "duration_ms")]
    pub max_processing_time: Duration,

    #[builder(default)]
    #[serde(default)]
    pub max_content_size: u64,
}

impl RetrievalLimits {
    /// Limits with every dimension unbounded
    pub fn unlimited() -> Self {
        Self::default()
    }

    pub fn connection_timeout(&self) -> Option<Duration> {
        bounded(self.connection_timeout)
    }

    pub fn max_retrieval_time(&self) -> Option<Duration> {
        bounded(self.max_retrieval_time)
    }

    pub fn max_processing_time(&self) -> Option<Duration> {
        bounded(self.max_processing_time)
    }

    pub fn min_throughput(&self) -> Option<u64> {
        (self.min_throughput_bytes_per_sec > 0).then_some(self.min_throughput_bytes_per_sec)
    }

    pub fn max_content_size(&self) -> Option<u64> {
        (self.max_content_size > 0).then_some(self.max_content_size)
    }

    /// Redirect budget; `ceiling` caps the "unlimited" case so redirect loops terminate
    pub fn redirect_budget(&self, ceiling: u32) -> u32 {
        if self.max_redirects == 0 {
            ceiling
        } else {
            self.max_redirects
        }
    }
}

fn bounded(value: Duration) -> Option<Duration> {
    (!value.is_zero()).then_some(value)
}

/// Serde adapter storing a `Duration` as integer milliseconds
pub(crate) mod duration_ms {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(value.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        let millis = u64::deserialize(deserializer)?;
        Ok(Duration::from_millis(millis))
    }
}
