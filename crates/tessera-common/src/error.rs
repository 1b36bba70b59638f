//! Error types for storage backends
//!
//! Every backend failure is classified as either temporary (the operation may
//! succeed if retried) or permanent (retrying is pointless).

/// Failure reported by a key-column store
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum BackendError {
    #[error("temporary backend failure: {0}")]
    Temporary(String),

    #[error("permanent backend failure: {0}")]
    Permanent(String),
}

impl BackendError {
    pub fn temporary(msg: impl Into<String>) -> Self {
        Self::Temporary(msg.into())
    }

    pub fn permanent(msg: impl Into<String>) -> Self {
        Self::Permanent(msg.into())
    }

    /// Whether the failed operation may be retried
    pub fn is_temporary(&self) -> bool {
        matches!(self, Self::Temporary(_))
    }
}
