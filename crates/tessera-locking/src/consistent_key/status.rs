use chrono::TimeDelta;
use tessera_common::Timestamp;

use crate::state::Checkable;

/// Status of one claim held by a transaction
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConsistentKeyLockStatus {
    write_timestamp: Timestamp,
    expire_timestamp: Timestamp,
    checked: bool,
}

impl ConsistentKeyLockStatus {
    pub fn new(write_timestamp: Timestamp, lock_expire: TimeDelta) -> Self {
        Self {
            write_timestamp,
            expire_timestamp: write_timestamp + lock_expire,
            checked: false,
        }
    }

    /// Start time of the attempt whose claim column was confirmed
    pub fn write_timestamp(&self) -> Timestamp {
        self.write_timestamp
    }

    pub fn expire_timestamp(&self) -> Timestamp {
        self.expire_timestamp
    }

    pub fn is_checked(&self) -> bool {
        self.checked
    }
}

impl Checkable for ConsistentKeyLockStatus {
    fn mark_checked(&mut self) {
        self.checked = true;
    }
}
