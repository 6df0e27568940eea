use super::models::Config;
use crate::storage::ResponseType;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ValidationError {
    #[error("{field} must be positive")]
    ZeroValue { field: &'static str },

    #[error("Retention TTL must be positive: {field} = {value}")]
    InvalidRetentionTTL { field: String, value: u32 },

    #[error("worker.path_to_save is required when response_type is disk")]
    MissingDownloadPath,

    #[error("worker.limit_check_interval_ms ({interval}) exceeds throughput_grace_ms ({grace})")]
    CheckIntervalExceedsGrace { interval: u64, grace: u64 },
}

/// Validate the entire configuration
pub fn validate(config: &Config) -> Result<(), ValidationError> {
    validate_master(config)?;
    validate_worker(config)?;
    validate_retention(config)?;
    Ok(())
}

fn positive(field: &'static str, value: u64) -> Result<(), ValidationError> {
    if value == 0 {
        return Err(ValidationError::ZeroValue { field });
    }
    Ok(())
}

fn validate_master(config: &Config) -> Result<(), ValidationError> {
    let master = &config.master;
    positive("master.query_timeout_ms", master.query_timeout_ms)?;
    positive("master.max_concurrent_events", master.max_concurrent_events as u64)?;
    positive("master.event_channel_size", master.event_channel_size as u64)?;
    positive("master.statistics_inbox_size", master.statistics_inbox_size as u64)?;
    Ok(())
}

/// Node and pool sizes, limit sampling, and the download directory
fn validate_worker(config: &Config) -> Result<(), ValidationError> {
    let worker = &config.worker;
    positive("worker.nodes", worker.nodes as u64)?;
    positive("worker.pool_size", worker.pool_size as u64)?;
    positive("worker.channel_size", worker.channel_size as u64)?;
    positive("worker.throughput_grace_ms", worker.throughput_grace_ms)?;
    positive("worker.limit_check_interval_ms", worker.limit_check_interval_ms)?;

    if worker.limit_check_interval_ms > worker.throughput_grace_ms {
        return Err(ValidationError::CheckIntervalExceedsGrace {
            interval: worker.limit_check_interval_ms,
            grace: worker.throughput_grace_ms,
        });
    }

    if worker.response_type == ResponseType::Disk && worker.path_to_save.as_os_str().is_empty() {
        return Err(ValidationError::MissingDownloadPath);
    }

    Ok(())
}

fn validate_retention(config: &Config) -> Result<(), ValidationError> {
    if config.retention.statistics_ttl_days == 0 {
        return Err(ValidationError::InvalidRetentionTTL {
            field: "statistics_ttl_days".to_string(),
            value: 0,
        });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    #[test]
    fn test_valid_config() {
        assert!(validate(&Config::default()).is_ok());
    }

    #[test]
    fn test_zero_pool_size() {
        let mut config = Config::default();
        config.worker.pool_size = 0;

        assert!(matches!(
            validate(&config),
            Err(ValidationError::ZeroValue { field: "worker.pool_size" })
        ));
    }

    #[test]
    fn test_zero_query_timeout() {
        let mut config = Config::default();
        config.master.query_timeout_ms = 0;

        assert!(matches!(
            validate(&config),
            Err(ValidationError::ZeroValue { field: "master.query_timeout_ms" })
        ));
    }

    #[test]
    fn test_check_interval_longer_than_grace() {
        let mut config = Config::default();
        config.worker.limit_check_interval_ms = 10_000;

        assert!(matches!(
            validate(&config),
            Err(ValidationError::CheckIntervalExceedsGrace { .. })
        ));
    }

    #[test]
    fn test_disk_sink_needs_path() {
        let mut config = Config::default();
        config.worker.path_to_save = PathBuf::new();
        assert!(matches!(validate(&config), Err(ValidationError::MissingDownloadPath)));

        config.worker.response_type = ResponseType::Memory;
        assert!(validate(&config).is_ok());
    }

    #[test]
    fn test_zero_retention_ttl() {
        let mut config = Config::default();
        config.retention.statistics_ttl_days = 0;

        assert!(matches!(
            validate(&config),
            Err(ValidationError::InvalidRetentionTTL { .. })
        ));
    }
}
