// Per-transaction lock bookkeeping
// Tracks which resources each transaction has claimed and their status

use std::collections::BTreeMap;

use dashmap::DashMap;
use tessera_common::{KeyColumn, TxId};

/// Lock status that records a successful verification
pub trait Checkable {
    fn mark_checked(&mut self);
}

/// Record of the locks each transaction believes it holds
///
/// Readers always receive owned snapshots; all mutation goes through the
/// trait so the locker stays in control of every transition.
pub trait LockerState<S>: Send + Sync {
    /// Whether `tx` has already claimed `kc`
    fn has(&self, tx: TxId, kc: &KeyColumn) -> bool;

    /// Record (or overwrite) the status of `kc` for `tx`
    fn take(&self, tx: TxId, kc: KeyColumn, status: S);

    /// Flag the status of `kc` for `tx` as verified; false if not held
    fn mark_checked(&self, tx: TxId, kc: &KeyColumn) -> bool;

    /// Forget `kc` for `tx`
    fn release(&self, tx: TxId, kc: &KeyColumn);

    /// Snapshot of every lock held by `tx`, ordered by resource
    fn locks_for_tx(&self, tx: TxId) -> BTreeMap<KeyColumn, S>;
}

/// Thread-safe `LockerState` backed by a sharded map
pub struct StandardLockerState<S> {
    locks: DashMap<TxId, BTreeMap<KeyColumn, S>>,
}

impl<S> StandardLockerState<S> {
    pub fn new() -> Self {
        Self {
            locks: DashMap::new(),
        }
    }

    /// Number of transactions currently holding at least one lock
    pub fn transaction_count(&self) -> usize {
        self.locks.len()
    }
}

impl<S> Default for StandardLockerState<S> {
    fn default() -> Self {
        Self::new()
    }
}

impl<S: Checkable + Clone + Send + Sync> LockerState<S> for StandardLockerState<S> {
    fn has(&self, tx: TxId, kc: &KeyColumn) -> bool {
        self.locks
            .get(&tx)
            .is_some_and(|held| held.contains_key(kc))
    }

    fn take(&self, tx: TxId, kc: KeyColumn, status: S) {
        self.locks.entry(tx).or_default().insert(kc, status);
    }

    fn mark_checked(&self, tx: TxId, kc: &KeyColumn) -> bool {
        match self.locks.get_mut(&tx) {
            Some(mut held) => match held.get_mut(kc) {
                Some(status) => {
                    status.mark_checked();
                    true
                }
                None => false,
            },
            None => false,
        }
    }

    fn release(&self, tx: TxId, kc: &KeyColumn) {
        if let Some(mut held) = self.locks.get_mut(&tx) {
            held.remove(kc);
        }
        self.locks.remove_if(&tx, |_, held| held.is_empty());
    }

    fn locks_for_tx(&self, tx: TxId) -> BTreeMap<KeyColumn, S> {
        self.locks
            .get(&tx)
            .map(|held| held.clone())
            .unwrap_or_default()
    }
}
