use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::SemaphoreError;

/// Default lease length in seconds.
pub const DEFAULT_VALIDITY_SECS: u64 = 10;

/// Default delay between readiness checks in microseconds (1/20 of a second).
pub const DEFAULT_REFRESH_INTERVAL_MICROS: u64 = 50_000;

/// Options for [`SemaphoreService::wait`](crate::SemaphoreService::wait).
///
/// Deserializing from an option map merges it onto the defaults: keys that are
/// missing keep their default and unrecognized keys are ignored.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct SemaphoreOptions {
    /// Seconds after acquisition before other waiters may treat the ticket as
    /// abandoned.
    pub validity: u64,
    /// Microseconds to sleep between readiness checks.
    #[serde(alias = "refresh_interval")]
    pub refresh_interval: u64,
}

impl Default for SemaphoreOptions {
    fn default() -> Self {
        Self {
            validity: DEFAULT_VALIDITY_SECS,
            refresh_interval: DEFAULT_REFRESH_INTERVAL_MICROS,
        }
    }
}

impl SemaphoreOptions {
    /// Merge a JSON option map onto the defaults.
    pub fn from_value(value: serde_json::Value) -> Result<Self, SemaphoreError> {
        serde_json::from_value(value).map_err(|e| SemaphoreError::InvalidOptions(e.to_string()))
    }

    /// Merge a JSON object string onto the defaults.
    pub fn from_json(json: &str) -> Result<Self, SemaphoreError> {
        serde_json::from_str(json).map_err(|e| SemaphoreError::InvalidOptions(e.to_string()))
    }

    pub fn with_validity(mut self, validity: Duration) -> Self {
        self.validity = validity.as_secs();
        self
    }

    pub fn with_refresh_interval(mut self, refresh_interval: Duration) -> Self {
        self.refresh_interval = u64::try_from(refresh_interval.as_micros()).unwrap_or(u64::MAX);
        self
    }

    pub fn validity(&self) -> Duration {
        Duration::from_secs(self.validity)
    }

    pub fn refresh_interval(&self) -> Duration {
        Duration::from_micros(self.refresh_interval)
    }
}
