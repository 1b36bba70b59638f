// Locker configuration
// Provides the settings for consistent-key locking and expired lock cleanup

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::LockingError;

/// Configuration for consistent-key locking
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LockerConfig {
    /// Identifier unique to this running instance; its UTF-8 bytes become the
    /// participant id written into every lock claim
    pub unique_instance_id: Option<String>,

    /// Lockers sharing this name share one local lock mediator
    pub local_mediator_group: String,

    /// Propagation wait in milliseconds (default: 100ms)
    /// A claim write slower than this is retried, and a check sleeps at least
    /// this long after the claim was written
    pub lock_wait_ms: u64,

    /// Claim time-to-live in milliseconds (default: 300000ms = 5 minutes)
    pub lock_expire_ms: u64,

    /// Attempts per store write, read and delete (default: 3)
    pub lock_retry: usize,

    /// Whether expired claims by other participants are deleted in the background
    pub clean_expired: bool,

    /// Minimum interval between cleanups of the same resource in milliseconds
    /// (default: 300000ms = 5 minutes)
    pub cleaner_cooldown_ms: u64,
}

impl Default for LockerConfig {
    fn default() -> Self {
        Self {
            unique_instance_id: None,
            local_mediator_group: "default".to_string(),
            lock_wait_ms: 100,
            lock_expire_ms: 300_000,
            lock_retry: 3,
            clean_expired: false,
            cleaner_cooldown_ms: 300_000,
        }
    }
}

impl LockerConfig {
    /// Parse a TOML document; missing fields keep their defaults
    pub fn from_toml_str(s: &str) -> Result<Self, LockingError> {
        toml::from_str(s).map_err(|e| LockingError::config(format!("invalid locker config: {}", e)))
    }

    /// Read and parse a TOML file
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, LockingError> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|e| {
            LockingError::config(format!("failed to read {}: {}", path.display(), e))
        })?;
        Self::from_toml_str(&content)
    }

    /// Get lock wait as Duration
    pub fn lock_wait(&self) -> Duration {
        Duration::from_millis(self.lock_wait_ms)
    }

    /// Get lock expiration as Duration
    pub fn lock_expire(&self) -> Duration {
        Duration::from_millis(self.lock_expire_ms)
    }

    /// Get cleaner cooldown as Duration
    pub fn cleaner_cooldown(&self) -> Duration {
        Duration::from_millis(self.cleaner_cooldown_ms)
    }

    /// Check the settings are usable together
    pub fn validate(&self) -> Result<(), LockingError> {
        match self.unique_instance_id.as_deref() {
            None | Some("") => {
                return Err(LockingError::config("unique_instance_id must be set"));
            }
            Some(_) => {}
        }
        if self.local_mediator_group.is_empty() {
            return Err(LockingError::config(
                "local_mediator_group must not be empty",
            ));
        }
        if self.lock_retry == 0 {
            return Err(LockingError::config("lock_retry must be at least 1"));
        }
        if self.lock_wait_ms >= self.lock_expire_ms {
            return Err(LockingError::config(format!(
                "lock_wait_ms ({}) must be less than lock_expire_ms ({})",
                self.lock_wait_ms, self.lock_expire_ms
            )));
        }
        Ok(())
    }
}
