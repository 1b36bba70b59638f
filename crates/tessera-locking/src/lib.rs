//! Tessera Locking - Distributed locks over eventually consistent key-column stores
//!
//! This crate provides:
//! - The lock coordinate codec (lock rows and timestamped claim columns)
//! - A process-local lock mediator and its named registry
//! - Per-transaction lock state tracking
//! - The consistent-key locker (claim, verify, release)
//! - Transactions that verify expected values of locked cells before writing
//! - Background cleanup of expired claims
//! - Locker configuration and metrics

pub mod cleaner;
pub mod codec;
pub mod config;
pub mod consistent_key;
pub mod error;
pub mod expected_value;
pub mod locker;
pub mod mediator;
pub mod metrics;
pub mod state;

#[cfg(test)]
pub(crate) mod test_support;

// Re-exports for convenience
pub use cleaner::{CleanupTask, LockCleanerService, StandardLockCleanerService};
pub use config::LockerConfig;
pub use consistent_key::{ConsistentKeyLockStatus, ConsistentKeyLocker, ConsistentKeyLockerBuilder};
pub use error::{CodecError, LockingError};
pub use expected_value::{ExpectedValueCheckingStore, ExpectedValueCheckingTransaction};
pub use locker::Locker;
pub use mediator::{LocalLockMediator, LocalLockMediators};
pub use state::{Checkable, LockerState, StandardLockerState};
