//! Retention for historical statistics records
//!
//! Only append-only `StatisticsRecord`s expire. Jobs, resources and
//! last-statistics records are kept; archiving them is an operator task.

use chrono::{DateTime, TimeDelta, Utc};
use fjall::PartitionHandle;
use serde::Deserialize;
use tracing::{debug, info, warn};

use super::error::Result;
use super::partitions::encode_meta_key;

pub const META_LAST_PRUNE: &str = "last_prune_statistics";

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct PruneStats {
    pub statistics_scanned: usize,
    pub statistics_pruned: usize,
}

/// The only field pruning needs from a stored record
#[derive(Deserialize)]
struct CreatedAt {
    created_at: DateTime<Utc>,
}

/// Remove statistics records created more than `ttl_days` before `now`
pub fn prune_statistics(
    statistics: &PartitionHandle,
    metadata: &PartitionHandle,
    ttl_days: u32,
    now: DateTime<Utc>,
) -> Result<PruneStats> {
    let cutoff = now - TimeDelta::days(i64::from(ttl_days));
    let mut stats = PruneStats::default();
    let mut expired = Vec::new();

    for item in statistics.iter() {
        let (key, value) = item?;
        stats.statistics_scanned += 1;

        match serde_json::from_slice::<CreatedAt>(&value) {
            Ok(record) if record.created_at < cutoff => expired.push(key),
            Ok(_) => {}
            Err(e) => {
                warn!(key = %String::from_utf8_lossy(&key), error = %e, "Skipping unreadable statistics record");
            }
        }
    }

    for key in expired {
        statistics.remove(key)?;
        stats.statistics_pruned += 1;
    }

    metadata.insert(encode_meta_key(META_LAST_PRUNE), now.to_rfc3339().as_bytes())?;
    debug!(cutoff = %cutoff, "Recorded prune time");
    info!(
        scanned = stats.statistics_scanned,
        pruned = stats.statistics_pruned,
        "Pruned expired statistics"
    );

    Ok(stats)
}
