// Runtime tunables for the consent central

use crate::transport::retry::RetryPolicy;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;
use uuid::Uuid;

/// Storage key of the consent ledger document
pub const DEFAULT_LEDGER_KEY: &str = "@devicesConsents";

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CentralConfig {
    /// Length of one discovery window in seconds
    pub scan_window_secs: u64,
    /// Report repeated advertisements so RSSI can be observed
    pub allow_duplicates: bool,
    /// Service UUIDs to filter advertisements by (empty = everything)
    pub service_filters: Vec<Uuid>,
    /// Settle time between connect and read when the transport cannot
    /// signal readiness
    pub settle_delay_ms: u64,
    /// Upper bound on waiting for a ready signal
    pub ready_timeout_ms: u64,
    /// Retry policy for scan and connect
    pub retry: RetryPolicy,
    /// Storage key of the ledger document
    pub storage_key: String,
    /// Start a discovery window as soon as the radio turns on
    pub scan_on_radio_on: bool,
}

impl Default for CentralConfig {
    fn default() -> Self {
        Self {
            scan_window_secs: 5,
            allow_duplicates: true,
            service_filters: Vec::new(),
            settle_delay_ms: 500,
            ready_timeout_ms: 5000,
            retry: RetryPolicy::default(),
            storage_key: DEFAULT_LEDGER_KEY.to_string(),
            scan_on_radio_on: true,
        }
    }
}

impl CentralConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.scan_window_secs == 0 {
            return Err(ConfigError::Invalid(
                "Scan window must be > 0 seconds".to_string(),
            ));
        }
        if self.retry.max_attempts == 0 {
            return Err(ConfigError::Invalid(
                "Retry policy needs at least one attempt".to_string(),
            ));
        }
        if self.retry.initial_backoff_ms > self.retry.max_backoff_ms {
            return Err(ConfigError::Invalid(
                "Initial backoff must be <= max backoff".to_string(),
            ));
        }
        if self.storage_key.is_empty() {
            return Err(ConfigError::Invalid("Storage key cannot be empty".to_string()));
        }
        Ok(())
    }

    pub fn scan_window(&self) -> Duration {
        Duration::from_secs(self.scan_window_secs)
    }

    pub fn settle_delay(&self) -> Duration {
        Duration::from_millis(self.settle_delay_ms)
    }

    pub fn ready_timeout(&self) -> Duration {
        Duration::from_millis(self.ready_timeout_ms)
    }
}
