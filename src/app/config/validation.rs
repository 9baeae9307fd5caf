use super::{Config, ConfigError};
use crate::sender::normalize_host;
use crate::storage::StorageBackend;

impl Config {
    pub fn validate(&self) -> Result<(), ConfigError> {
        // Validate collector host
        normalize_host(&self.collector_host).map_err(|e| {
            ConfigError::InvalidUrl(format!(
                "Invalid collector host '{}': {}",
                self.collector_host, e
            ))
        })?;

        if self.port == Some(0) {
            return Err(ConfigError::InvalidConfig(
                "Port must be greater than 0".to_string(),
            ));
        }

        // Validate batching
        if self.send_limit == 0 {
            return Err(ConfigError::InvalidConfig(
                "Send limit must be greater than 0".to_string(),
            ));
        }

        if self.byte_limit_get == 0 || self.byte_limit_post == 0 {
            return Err(ConfigError::InvalidConfig(
                "Byte limits must be greater than 0".to_string(),
            ));
        }

        if self.max_concurrent_requests == 0 {
            return Err(ConfigError::InvalidConfig(
                "Max concurrent requests must be greater than 0".to_string(),
            ));
        }

        // Validate timeouts
        if self.request_timeout_secs == 0 {
            return Err(ConfigError::InvalidConfig(
                "Request timeout must be greater than 0".to_string(),
            ));
        }

        // Validate backoff window
        if self.backoff_min_ms > self.backoff_max_ms {
            return Err(ConfigError::InvalidConfig(format!(
                "Backoff min ({}ms) must not exceed backoff max ({}ms)",
                self.backoff_min_ms, self.backoff_max_ms
            )));
        }

        // Validate storage location
        if self.storage_backend != StorageBackend::Memory {
            if self.storage_path.as_os_str().is_empty() {
                return Err(ConfigError::InvalidConfig(
                    "Storage path must not be empty".to_string(),
                ));
            }
            if self.storage_path.is_file() {
                return Err(ConfigError::InvalidConfig(format!(
                    "Storage path is a regular file: {}",
                    self.storage_path.display()
                )));
            }
        }

        if self.storage_backend == StorageBackend::Spool && self.max_disk_usage_mb == 0 {
            return Err(ConfigError::InvalidConfig(
                "Max disk usage must be greater than 0".to_string(),
            ));
        }

        // Validate session timing
        if self.enable_session
            && (self.foreground_timeout_secs == 0
                || self.background_timeout_secs == 0
                || self.session_check_interval_secs == 0)
        {
            return Err(ConfigError::InvalidConfig(
                "Session timeouts and check interval must be greater than 0".to_string(),
            ));
        }

        Ok(())
    }
}
