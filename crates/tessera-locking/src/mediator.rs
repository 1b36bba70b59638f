//! Local lock mediation
//!
//! Lockers in one process that share a mediator settle contention for a
//! resource among themselves before any claim reaches the store. A losing
//! transaction fails immediately without a network round trip.

use std::fmt::{Debug, Display, Formatter};
use std::hash::Hash;
use std::sync::{Arc, LazyLock};

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use tessera_common::{KeyColumn, Timestamp, TimestampProvider, TxId};
use tracing::{debug, trace, warn};

use crate::error::LockingError;

/// Holder and expiration of a locally granted lock
#[derive(Debug, Clone)]
struct AuditRecord<T> {
    holder: T,
    expires: Timestamp,
}

/// Per-process arbiter of lock ownership
///
/// Entries are keyed by resource in a sharded map, so contention on one
/// resource never blocks checks on unrelated resources. An entry whose
/// expiration has strictly passed may be taken over by another holder.
pub struct LocalLockMediator<T = TxId> {
    name: String,
    times: Arc<dyn TimestampProvider>,
    locks: DashMap<KeyColumn, AuditRecord<T>>,
}

impl<T> LocalLockMediator<T>
where
    T: Clone + Eq + Hash + Debug + Display + Send + Sync,
{
    pub fn new(name: impl Into<String>, times: Arc<dyn TimestampProvider>) -> Self {
        Self {
            name: name.into(),
            times,
            locks: DashMap::new(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Grant `kc` to `holder` until `expires`
    ///
    /// Succeeds when the resource is free, already held by `holder` (the
    /// expiration is refreshed), or held by someone whose grant has expired.
    /// Otherwise returns `false` and leaves the existing grant untouched.
    pub fn lock(&self, kc: &KeyColumn, holder: &T, expires: Timestamp) -> bool {
        let now = self.times.now();
        let record = AuditRecord {
            holder: holder.clone(),
            expires,
        };

        match self.locks.entry(kc.clone()) {
            Entry::Vacant(vacant) => {
                vacant.insert(record);
                trace!(
                    "New local lock created: {} namespace={} txn={}",
                    kc, self.name, holder
                );
                true
            }
            Entry::Occupied(mut occupied) => {
                let current = occupied.get();
                if current.holder == *holder {
                    trace!(
                        "Updated local lock expiration: {} namespace={} txn={} oldexp={} newexp={}",
                        kc, self.name, holder, current.expires, expires
                    );
                    occupied.insert(record);
                    true
                } else if current.expires < now {
                    trace!(
                        "Discarding expired lock: {} namespace={} txn={} expired={}",
                        kc, self.name, current.holder, current.expires
                    );
                    occupied.insert(record);
                    true
                } else {
                    trace!(
                        "Local lock failed: {} namespace={} txn={} (already owned by {} until {})",
                        kc, self.name, holder, current.holder, current.expires
                    );
                    false
                }
            }
        }
    }

    /// Release `kc` if, and only if, `holder` currently holds it
    pub fn unlock(&self, kc: &KeyColumn, holder: &T) -> bool {
        if self
            .locks
            .remove_if(kc, |_, record| record.holder == *holder)
            .is_some()
        {
            trace!(
                "Local unlock succeeded: {} namespace={} txn={}",
                kc, self.name, holder
            );
            return true;
        }

        match self.locks.get(kc) {
            Some(record) => warn!(
                "Local unlock of {} by {} failed: it is held by {}",
                kc, holder, record.holder
            ),
            None => debug!("Local unlock failed: no locks found for {}", kc),
        }
        false
    }

    /// Current holder of `kc`, expired or not
    pub fn holder(&self, kc: &KeyColumn) -> Option<T> {
        self.locks.get(kc).map(|record| record.holder.clone())
    }

    pub fn len(&self) -> usize {
        self.locks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.locks.is_empty()
    }
}

impl<T> Display for LocalLockMediator<T> {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "LocalLockMediator [{}, ~{} current locks]",
            self.name,
            self.locks.len()
        )
    }
}

static INSTANCE: LazyLock<LocalLockMediators> = LazyLock::new(LocalLockMediators::new);

/// Registry of named mediators
///
/// Every locker configured with the same mediator group name shares one
/// mediator, which is what makes same-process contention visible.
pub struct LocalLockMediators {
    mediators: DashMap<String, Arc<LocalLockMediator<TxId>>>,
}

impl LocalLockMediators {
    pub fn new() -> Self {
        Self {
            mediators: DashMap::new(),
        }
    }

    /// Process-wide registry
    pub fn global() -> &'static Self {
        &INSTANCE
    }

    /// Mediator registered under `name`, created with `times` on first use
    pub fn get(
        &self,
        name: &str,
        times: Arc<dyn TimestampProvider>,
    ) -> Result<Arc<LocalLockMediator<TxId>>, LockingError> {
        if name.is_empty() {
            return Err(LockingError::config(
                "local lock mediator name must not be empty",
            ));
        }

        let mediator = self
            .mediators
            .entry(name.to_string())
            .or_insert_with(|| {
                debug!(name = %name, "Creating local lock mediator");
                Arc::new(LocalLockMediator::new(name, times))
            })
            .clone();
        Ok(mediator)
    }

    /// Drop every registered mediator
    pub fn clear(&self) {
        self.mediators.clear();
    }
}

impl Default for LocalLockMediators {
    fn default() -> Self {
        Self::new()
    }
}
