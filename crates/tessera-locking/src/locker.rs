// Locker contract consumed by the transaction layer

use async_trait::async_trait;
use tessera_common::{KeyColumn, StoreTransaction};

use crate::error::LockingError;

/// Three-phase lock protocol: claim, verify, release
#[async_trait]
pub trait Locker: Send + Sync {
    /// Claim `kc` on behalf of `tx`; repeated claims of the same resource are no-ops
    ///
    /// A call made while another call for the same `tx` and `kc` is still
    /// writing fails with a permanent error instead of writing a second claim.
    async fn write_lock(&self, kc: &KeyColumn, tx: &StoreTransaction) -> Result<(), LockingError>;

    /// Verify every unchecked claim held by `tx`
    ///
    /// Must succeed before the changes of `tx` are made durable.
    async fn check_locks(&self, tx: &StoreTransaction) -> Result<(), LockingError>;

    /// Release every claim held by `tx`
    ///
    /// Attempts every resource before reporting at most one aggregated error.
    /// Called once when the transaction ends, whether it commits or aborts.
    async fn delete_locks(&self, tx: &StoreTransaction) -> Result<(), LockingError>;
}
