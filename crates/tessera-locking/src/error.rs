//! Error types for the locking subsystem
//!
//! This module defines:
//! - `LockingError`: outcome of a failed lock write, check or delete
//! - `CodecError`: malformed lock columns, unencodable timestamps or oversized keys

use tessera_common::{BackendError, Timestamp};

/// Locking failure surfaced to the transaction layer
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum LockingError {
    /// Another participant holds seniority, or the store kept failing
    /// transiently; the whole transaction may be retried later
    #[error("temporary locking failure: {0}")]
    Temporary(String),

    /// Unrecoverable for the current attempt; the transaction must abort
    #[error("permanent locking failure: {0}")]
    Permanent(String),

    /// Our own claim outlived its expiration before it was checked
    #[error("expired lock: {0}")]
    Expired(String),

    #[error("locker configuration error: {0}")]
    Config(String),
}

impl LockingError {
    pub fn temporary(msg: impl Into<String>) -> Self {
        Self::Temporary(msg.into())
    }

    pub fn permanent(msg: impl Into<String>) -> Self {
        Self::Permanent(msg.into())
    }

    pub fn expired(msg: impl Into<String>) -> Self {
        Self::Expired(msg.into())
    }

    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    /// Whether retrying the entire transaction later may succeed
    pub fn is_temporary(&self) -> bool {
        matches!(self, Self::Temporary(_))
    }
}

impl From<BackendError> for LockingError {
    fn from(value: BackendError) -> Self {
        match value {
            BackendError::Temporary(msg) => Self::Temporary(msg),
            BackendError::Permanent(msg) => Self::Permanent(msg),
        }
    }
}

impl From<CodecError> for LockingError {
    fn from(value: CodecError) -> Self {
        Self::Permanent(value.to_string())
    }
}

/// Lock coordinate encoding failure
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum CodecError {
    #[error("lock column too short: expected at least {min} bytes, found {actual}")]
    ColumnTooShort { min: usize, actual: usize },

    #[error("timestamp {0} is outside the encodable nanosecond range")]
    TimestampOutOfRange(Timestamp),

    #[error("participant id must not be empty")]
    EmptyRid,

    #[error("data key of {len} bytes does not fit the 4-byte length prefix")]
    KeyTooLong { len: usize },
}
