// Claim attempt lifecycle
// Attempting -> Written -> Confirmed | Abandoned

use bytes::Bytes;
use chrono::TimeDelta;
use tessera_common::{BackendError, Timestamp};

/// A claim column about to be written
#[derive(Debug)]
pub(crate) struct ClaimAttempt {
    column: Bytes,
    started: Timestamp,
}

impl ClaimAttempt {
    pub(crate) fn new(column: Bytes, started: Timestamp) -> Self {
        Self { column, started }
    }

    pub(crate) fn column(&self) -> &Bytes {
        &self.column
    }

    pub(crate) fn started(&self) -> Timestamp {
        self.started
    }

    /// The store acknowledged the write at `ended`
    pub(crate) fn written(self, ended: Timestamp) -> WrittenClaim {
        WrittenClaim {
            elapsed: ended - self.started,
            column: self.column,
            started: self.started,
        }
    }

    /// The store rejected the write
    pub(crate) fn failed(self, error: BackendError) -> AbandonedClaim {
        AbandonedClaim {
            column: self.column,
            started: self.started,
            reason: AbandonReason::Failed(error),
        }
    }
}

/// A claim column the store accepted
#[derive(Debug)]
pub(crate) struct WrittenClaim {
    column: Bytes,
    started: Timestamp,
    elapsed: TimeDelta,
}

impl WrittenClaim {
    /// A write is only trusted when it completed within the propagation wait
    pub(crate) fn confirm(self, lock_wait: TimeDelta) -> Result<ConfirmedClaim, AbandonedClaim> {
        if self.elapsed <= lock_wait {
            Ok(ConfirmedClaim {
                column: self.column,
                started: self.started,
            })
        } else {
            Err(AbandonedClaim {
                column: self.column,
                started: self.started,
                reason: AbandonReason::TooSlow {
                    elapsed: self.elapsed,
                },
            })
        }
    }
}

/// A claim that holds the lock until checked
#[derive(Debug)]
pub(crate) struct ConfirmedClaim {
    column: Bytes,
    started: Timestamp,
}

impl ConfirmedClaim {
    pub(crate) fn column(&self) -> &Bytes {
        &self.column
    }

    /// Timestamp embedded in the claim column
    pub(crate) fn write_timestamp(&self) -> Timestamp {
        self.started
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum AbandonReason {
    TooSlow { elapsed: TimeDelta },
    Failed(BackendError),
}

/// A claim column that may or may not exist in the store and must be deleted
#[derive(Debug)]
pub(crate) struct AbandonedClaim {
    column: Bytes,
    started: Timestamp,
    reason: AbandonReason,
}

impl AbandonedClaim {
    pub(crate) fn column(&self) -> &Bytes {
        &self.column
    }

    pub(crate) fn started(&self) -> Timestamp {
        self.started
    }

    pub(crate) fn reason(&self) -> &AbandonReason {
        &self.reason
    }

    /// Whether another attempt with a fresh timestamp may succeed
    pub(crate) fn is_retryable(&self) -> bool {
        match &self.reason {
            AbandonReason::TooSlow { .. } => true,
            AbandonReason::Failed(error) => error.is_temporary(),
        }
    }

    pub(crate) fn into_column(self) -> Bytes {
        self.column
    }
}
