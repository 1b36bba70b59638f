//! Expired claim cleanup
//!
//! A check that finds claims older than the expiration cutoff hands the
//! resource to a [`LockCleanerService`]. The standard service coalesces
//! repeated requests per resource over a cooldown window and deletes the
//! stale columns on a background task, off the checking caller's path.

use std::sync::Arc;
use std::time::Duration;

use chrono::TimeDelta;
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use tessera_common::{
    BackendError, KeyColumn, KeyColumnValueStore, StoreTransaction, Timestamp, TimestampProvider,
};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::codec;
use crate::error::LockingError;

/// Capacity of the pending cleanup queue
pub const CLEANER_QUEUE_CAPACITY: usize = 1024;

/// Block map size above which entries past their cooldown are pruned
const BLOCKED_PRUNE_THRESHOLD: usize = 10_000;

/// Receiver of expired claim reports
pub trait LockCleanerService: Send + Sync {
    /// Delete every claim on `kc` older than `cutoff`, eventually
    ///
    /// Must not block the caller on store I/O.
    fn clean(&self, kc: &KeyColumn, cutoff: Timestamp, tx: &StoreTransaction);
}

/// One scheduled scan-and-delete of stale claims
#[derive(Debug, Clone)]
pub struct CleanupTask {
    kc: KeyColumn,
    cutoff: Timestamp,
    tx: StoreTransaction,
}

impl CleanupTask {
    pub fn new(kc: KeyColumn, cutoff: Timestamp, tx: StoreTransaction) -> Self {
        Self { kc, cutoff, tx }
    }

    pub fn key_column(&self) -> &KeyColumn {
        &self.kc
    }

    pub fn cutoff(&self) -> Timestamp {
        self.cutoff
    }

    /// Delete, in one mutation, every claim strictly older than the cutoff
    ///
    /// Returns the number of columns deleted.
    pub async fn run(&self, store: &dyn KeyColumnValueStore) -> Result<usize, BackendError> {
        let lock_key = codec::to_lock_key(self.kc.key(), self.kc.column())
            .map_err(|e| BackendError::permanent(e.to_string()))?;
        let claims = store
            .get_slice(&codec::claim_slice(lock_key.clone()), &self.tx)
            .await?;

        let mut deletions = Vec::new();
        for entry in claims {
            match codec::from_lock_column(&entry.column) {
                Ok(claim) if claim.timestamp < self.cutoff => deletions.push(entry.column),
                Ok(_) => {}
                Err(e) => warn!("Skipping unreadable lock column on {}: {}", self.kc, e),
            }
        }

        if !deletions.is_empty() {
            store.mutate(&lock_key, &[], &deletions, &self.tx).await?;
            info!(
                "Deleted {} expired lock claims on {} older than {}",
                deletions.len(),
                self.kc,
                self.cutoff
            );
        }
        Ok(deletions.len())
    }
}

/// Cooldown-coalescing cleaner backed by a bounded queue and one worker task
pub struct StandardLockCleanerService {
    times: Arc<dyn TimestampProvider>,
    cooldown: TimeDelta,
    blocked: DashMap<KeyColumn, Timestamp>,
    queue: mpsc::Sender<CleanupTask>,
    _worker: Option<JoinHandle<()>>,
}

impl StandardLockCleanerService {
    /// Start a worker on the current tokio runtime that runs tasks against `store`
    pub fn spawn(
        store: Arc<dyn KeyColumnValueStore>,
        times: Arc<dyn TimestampProvider>,
        cooldown: Duration,
    ) -> Result<Self, LockingError> {
        let handle = tokio::runtime::Handle::try_current().map_err(|e| {
            LockingError::config(format!("lock cleaner requires a tokio runtime: {}", e))
        })?;

        let (sender, receiver) = mpsc::channel(CLEANER_QUEUE_CAPACITY);
        let worker = handle.spawn(Self::run_worker(store, receiver));

        let mut service = Self::with_queue(times, cooldown, sender);
        service._worker = Some(worker);
        Ok(service)
    }

    /// Service that only enqueues; whoever holds the receiver runs the tasks
    pub fn with_queue(
        times: Arc<dyn TimestampProvider>,
        cooldown: Duration,
        queue: mpsc::Sender<CleanupTask>,
    ) -> Self {
        Self {
            times,
            cooldown: TimeDelta::from_std(cooldown).unwrap_or(TimeDelta::MAX),
            blocked: DashMap::new(),
            queue,
            _worker: None,
        }
    }

    async fn run_worker(
        store: Arc<dyn KeyColumnValueStore>,
        mut receiver: mpsc::Receiver<CleanupTask>,
    ) {
        while let Some(task) = receiver.recv().await {
            match task.run(store.as_ref()).await {
                Ok(deleted) => debug!(
                    "Cleanup of {} finished: {} columns deleted",
                    task.key_column(),
                    deleted
                ),
                Err(e) => warn!("Cleanup of {} failed: {}", task.key_column(), e),
            }
        }
        debug!("Lock cleaner queue closed, worker exiting");
    }

    /// Number of resources currently under cooldown
    pub fn blocked_count(&self) -> usize {
        self.blocked.len()
    }

    fn prune_blocked(&self, now: Timestamp) {
        if self.blocked.len() > BLOCKED_PRUNE_THRESHOLD {
            self.blocked
                .retain(|_, blocked_at| now - *blocked_at < self.cooldown);
        }
    }
}

impl LockCleanerService for StandardLockCleanerService {
    fn clean(&self, kc: &KeyColumn, cutoff: Timestamp, tx: &StoreTransaction) {
        let now = self.times.now();
        self.prune_blocked(now);

        match self.blocked.entry(kc.clone()) {
            Entry::Occupied(occupied) if now - *occupied.get() < self.cooldown => {
                debug!(
                    "Ignoring cleanup of {} (cutoff {}): already scheduled at {}",
                    kc,
                    cutoff,
                    occupied.get()
                );
                return;
            }
            Entry::Occupied(mut occupied) => {
                occupied.insert(now);
            }
            Entry::Vacant(vacant) => {
                vacant.insert(now);
            }
        }

        match self
            .queue
            .try_send(CleanupTask::new(kc.clone(), cutoff, tx.clone()))
        {
            Ok(()) => debug!("Scheduled cleanup of {} with cutoff {}", kc, cutoff),
            Err(mpsc::error::TrySendError::Full(_)) => {
                warn!("Lock cleaner queue is full, dropping cleanup of {}", kc);
                self.blocked.remove(kc);
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                warn!("Lock cleaner is stopped, dropping cleanup of {}", kc);
            }
        }
    }
}
