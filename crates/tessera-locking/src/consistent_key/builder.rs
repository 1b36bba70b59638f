use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use chrono::TimeDelta;
use dashmap::DashSet;
use tessera_common::{KeyColumnValueStore, SystemTimestampProvider, TimestampProvider, TxId};

use super::locker::ConsistentKeyLocker;
use super::status::ConsistentKeyLockStatus;
use crate::cleaner::{LockCleanerService, StandardLockCleanerService};
use crate::config::LockerConfig;
use crate::error::LockingError;
use crate::mediator::{LocalLockMediator, LocalLockMediators};
use crate::state::{LockerState, StandardLockerState};

enum MediatorSource {
    Group(String),
    Instance(Arc<LocalLockMediator<TxId>>),
}

enum CleanerChoice {
    Disabled,
    Standard,
    Custom(Arc<dyn LockCleanerService>),
}

/// Builder for [`ConsistentKeyLocker`]
pub struct ConsistentKeyLockerBuilder {
    store: Arc<dyn KeyColumnValueStore>,
    rid: Option<Bytes>,
    times: Arc<dyn TimestampProvider>,
    mediator: MediatorSource,
    lock_wait: Duration,
    lock_expire: Duration,
    lock_retry_count: usize,
    state: Option<Arc<dyn LockerState<ConsistentKeyLockStatus>>>,
    cleaner: CleanerChoice,
    cleaner_cooldown: Duration,
}

impl ConsistentKeyLockerBuilder {
    pub fn new(store: Arc<dyn KeyColumnValueStore>) -> Self {
        let defaults = LockerConfig::default();
        Self {
            store,
            rid: None,
            times: Arc::new(SystemTimestampProvider::new()),
            mediator: MediatorSource::Group(defaults.local_mediator_group.clone()),
            lock_wait: defaults.lock_wait(),
            lock_expire: defaults.lock_expire(),
            lock_retry_count: defaults.lock_retry,
            state: None,
            cleaner: CleanerChoice::Disabled,
            cleaner_cooldown: defaults.cleaner_cooldown(),
        }
    }

    /// Apply every setting from a validated configuration
    pub fn from_config(mut self, config: &LockerConfig) -> Result<Self, LockingError> {
        config.validate()?;
        if let Some(id) = &config.unique_instance_id {
            self.rid = Some(Bytes::copy_from_slice(id.as_bytes()));
        }
        self.mediator = MediatorSource::Group(config.local_mediator_group.clone());
        self.lock_wait = config.lock_wait();
        self.lock_expire = config.lock_expire();
        self.lock_retry_count = config.lock_retry;
        self.cleaner_cooldown = config.cleaner_cooldown();
        self.cleaner = if config.clean_expired {
            CleanerChoice::Standard
        } else {
            CleanerChoice::Disabled
        };
        Ok(self)
    }

    pub fn rid(mut self, rid: impl Into<Bytes>) -> Self {
        self.rid = Some(rid.into());
        self
    }

    pub fn times(mut self, times: Arc<dyn TimestampProvider>) -> Self {
        self.times = times;
        self
    }

    /// Share an existing mediator
    pub fn mediator(mut self, mediator: Arc<LocalLockMediator<TxId>>) -> Self {
        self.mediator = MediatorSource::Instance(mediator);
        self
    }

    /// Use the process-wide mediator registered under `group`
    pub fn mediator_group(mut self, group: impl Into<String>) -> Self {
        self.mediator = MediatorSource::Group(group.into());
        self
    }

    pub fn lock_wait(mut self, lock_wait: Duration) -> Self {
        self.lock_wait = lock_wait;
        self
    }

    pub fn lock_expire(mut self, lock_expire: Duration) -> Self {
        self.lock_expire = lock_expire;
        self
    }

    pub fn lock_retry_count(mut self, count: usize) -> Self {
        self.lock_retry_count = count;
        self
    }

    pub fn internal_state(mut self, state: Arc<dyn LockerState<ConsistentKeyLockStatus>>) -> Self {
        self.state = Some(state);
        self
    }

    /// Enable the standard cleaner; requires a tokio runtime at build time
    pub fn standard_cleaner(mut self) -> Self {
        self.cleaner = CleanerChoice::Standard;
        self
    }

    pub fn custom_cleaner(mut self, cleaner: Arc<dyn LockCleanerService>) -> Self {
        self.cleaner = CleanerChoice::Custom(cleaner);
        self
    }

    pub fn cleaner_cooldown(mut self, cooldown: Duration) -> Self {
        self.cleaner_cooldown = cooldown;
        self
    }

    pub fn build(self) -> Result<ConsistentKeyLocker, LockingError> {
        let rid = match self.rid {
            Some(rid) if !rid.is_empty() => rid,
            _ => return Err(LockingError::config("locker requires a non-empty rid")),
        };
        if self.lock_retry_count == 0 {
            return Err(LockingError::config("lock retry count must be at least 1"));
        }
        if self.lock_wait >= self.lock_expire {
            return Err(LockingError::config(format!(
                "lock wait ({:?}) must be shorter than lock expiration ({:?})",
                self.lock_wait, self.lock_expire
            )));
        }
        let lock_wait = to_time_delta(self.lock_wait, "lock wait")?;
        let lock_expire = to_time_delta(self.lock_expire, "lock expiration")?;

        let mediator = match self.mediator {
            MediatorSource::Instance(mediator) => mediator,
            MediatorSource::Group(group) => {
                LocalLockMediators::global().get(&group, self.times.clone())?
            }
        };

        let cleaner: Option<Arc<dyn LockCleanerService>> = match self.cleaner {
            CleanerChoice::Disabled => None,
            CleanerChoice::Standard => Some(Arc::new(StandardLockCleanerService::spawn(
                self.store.clone(),
                self.times.clone(),
                self.cleaner_cooldown,
            )?)),
            CleanerChoice::Custom(cleaner) => Some(cleaner),
        };

        let state: Arc<dyn LockerState<ConsistentKeyLockStatus>> = match self.state {
            Some(state) => state,
            None => Arc::new(StandardLockerState::new()),
        };

        Ok(ConsistentKeyLocker {
            store: self.store,
            times: self.times,
            rid,
            mediator,
            state,
            lock_wait,
            lock_expire,
            lock_retry_count: self.lock_retry_count,
            cleaner,
            claiming: DashSet::new(),
        })
    }
}

fn to_time_delta(duration: Duration, what: &str) -> Result<TimeDelta, LockingError> {
    TimeDelta::from_std(duration)
        .map_err(|_| LockingError::config(format!("{} of {:?} is out of range", what, duration)))
}
