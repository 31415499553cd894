use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::time::Resolution;
use crate::types::OwnerId;

/// Errors raised while parsing or validating a [`LockConfig`].
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to parse lock configuration: {0}")]
    Parse(#[from] serde_json::Error),
    #[error("invalid lock configuration: {0}")]
    Invalid(&'static str),
}

/// Locking configuration injected into lockers and the transaction wrapper.
///
/// Every process sharing a lock store must use the same `lock_expire_ms` and
/// a distinct `owner_id`; clocks are assumed to agree within `lock_wait_ms`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct LockConfig {
    /// Identifier stamped on every claim written by this process.
    pub owner_id: OwnerId,
    /// Upper bound on the time for a lock write to become visible to readers.
    pub lock_wait_ms: u64,
    /// Age after which a claim is considered abandoned.
    pub lock_expire_ms: u64,
    /// Attempts per lock write, lock read and lock delete.
    pub lock_retry_count: u32,
    /// Whether expired claims observed while checking are reaped in the background.
    pub clean_expired: bool,
    /// Window during which repeated cleanup requests for one coordinate are dropped.
    pub cleaner_cooldown_ms: u64,
    /// Concurrent cleanup tasks per lock store.
    pub cleaner_max_workers: usize,
    /// Time budget for reading back an expected value before giving up.
    pub max_read_time_ms: u64,
    pub timestamp_resolution: Resolution,
}

impl Default for LockConfig {
    fn default() -> Self {
        Self {
            owner_id: OwnerId::random(),
            lock_wait_ms: 100,
            lock_expire_ms: 300_000,
            lock_retry_count: 3,
            clean_expired: false,
            cleaner_cooldown_ms: 30_000,
            cleaner_max_workers: 4,
            max_read_time_ms: 4_000,
            timestamp_resolution: Resolution::Micro,
        }
    }
}

impl LockConfig {
    pub fn new(owner_id: impl Into<String>) -> Self {
        Self {
            owner_id: OwnerId::new(owner_id),
            ..Self::default()
        }
    }

    /// Parses a JSON document; absent fields take their defaults.
    pub fn from_json_str(raw: &str) -> Result<Self, ConfigError> {
        let config: Self = serde_json::from_str(raw)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.owner_id.is_empty() {
            return Err(ConfigError::Invalid("owner_id must not be empty"));
        }
        if self.lock_retry_count == 0 {
            return Err(ConfigError::Invalid("lock_retry_count must be at least 1"));
        }
        if self.lock_expire_ms == 0 {
            return Err(ConfigError::Invalid("lock_expire_ms must be positive"));
        }
        if self.cleaner_max_workers == 0 {
            return Err(ConfigError::Invalid("cleaner_max_workers must be at least 1"));
        }
        Ok(())
    }

    pub fn with_lock_wait(mut self, wait: Duration) -> Self {
        self.lock_wait_ms = duration_ms(wait);
        self
    }

    pub fn with_lock_expire(mut self, expire: Duration) -> Self {
        self.lock_expire_ms = duration_ms(expire);
        self
    }

    pub fn with_retry_count(mut self, count: u32) -> Self {
        self.lock_retry_count = count;
        self
    }

    pub fn with_cleaner(mut self, cooldown: Duration) -> Self {
        self.clean_expired = true;
        self.cleaner_cooldown_ms = duration_ms(cooldown);
        self
    }

    pub fn with_resolution(mut self, resolution: Resolution) -> Self {
        self.timestamp_resolution = resolution;
        self
    }

    pub fn lock_wait(&self) -> Duration {
        Duration::from_millis(self.lock_wait_ms)
    }

    pub fn lock_expire(&self) -> Duration {
        Duration::from_millis(self.lock_expire_ms)
    }

    pub fn cleaner_cooldown(&self) -> Duration {
        Duration::from_millis(self.cleaner_cooldown_ms)
    }

    pub fn max_read_time(&self) -> Duration {
        Duration::from_millis(self.max_read_time_ms)
    }
}

fn duration_ms(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}
