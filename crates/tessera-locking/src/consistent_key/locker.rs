use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use chrono::TimeDelta;
use dashmap::DashSet;
use tessera_common::{
    BackendError, Entry, KeyColumn, KeyColumnValueStore, KeySliceQuery, StoreTransaction,
    TimestampProvider, TxId,
};
use tracing::{debug, error, warn};

use super::attempt::{AbandonReason, ClaimAttempt, ConfirmedClaim};
use super::builder::ConsistentKeyLockerBuilder;
use super::status::ConsistentKeyLockStatus;
use crate::cleaner::LockCleanerService;
use crate::codec::{self, TimestampRid};
use crate::error::LockingError;
use crate::locker::Locker;
use crate::mediator::LocalLockMediator;
use crate::metrics::{self, LockOp};
use crate::state::LockerState;

/// Locker that claims resources by writing timestamped columns to a
/// key-column store and resolves contention by claim seniority
pub struct ConsistentKeyLocker {
    pub(super) store: Arc<dyn KeyColumnValueStore>,
    pub(super) times: Arc<dyn TimestampProvider>,
    pub(super) rid: Bytes,
    pub(super) mediator: Arc<LocalLockMediator<TxId>>,
    pub(super) state: Arc<dyn LockerState<ConsistentKeyLockStatus>>,
    pub(super) lock_wait: TimeDelta,
    pub(super) lock_expire: TimeDelta,
    pub(super) lock_retry_count: usize,
    pub(super) cleaner: Option<Arc<dyn LockCleanerService>>,
    pub(super) claiming: DashSet<(TxId, KeyColumn)>,
}

/// Marks a claim by one transaction on one resource as in progress
struct ClaimGuard<'a> {
    claiming: &'a DashSet<(TxId, KeyColumn)>,
    entry: (TxId, KeyColumn),
}

impl<'a> ClaimGuard<'a> {
    fn acquire(claiming: &'a DashSet<(TxId, KeyColumn)>, tx: TxId, kc: &KeyColumn) -> Option<Self> {
        let entry = (tx, kc.clone());
        claiming
            .insert(entry.clone())
            .then(|| Self { claiming, entry })
    }
}

impl Drop for ClaimGuard<'_> {
    fn drop(&mut self) {
        self.claiming.remove(&self.entry);
    }
}

impl ConsistentKeyLocker {
    pub fn builder(store: Arc<dyn KeyColumnValueStore>) -> ConsistentKeyLockerBuilder {
        ConsistentKeyLockerBuilder::new(store)
    }

    /// Participant id written into every claim
    pub fn rid(&self) -> &Bytes {
        &self.rid
    }

    pub fn mediator(&self) -> &Arc<LocalLockMediator<TxId>> {
        &self.mediator
    }

    async fn lock_one(&self, kc: &KeyColumn, tx: &StoreTransaction) -> Result<(), LockingError> {
        // Held until the claim is recorded, so a concurrent call for the same
        // transaction cannot write a second column
        let Some(_claiming) = ClaimGuard::acquire(&self.claiming, tx.id(), kc) else {
            return Err(LockingError::permanent(format!(
                "Lock on {} is already being written by {}",
                kc, tx
            )));
        };

        if self.state.has(tx.id(), kc) {
            debug!("Transaction {} already wrote lock on {}", tx, kc);
            return Ok(());
        }

        let expires = self.times.now() + self.lock_expire;
        if !self.mediator.lock(kc, &tx.id(), expires) {
            return Err(LockingError::permanent(format!(
                "Local lock contention on {}",
                kc
            )));
        }

        let claim = match self.write_single_lock(kc, tx).await {
            Ok(claim) => claim,
            Err(e) => {
                self.mediator.unlock(kc, &tx.id());
                return Err(e);
            }
        };

        let status = ConsistentKeyLockStatus::new(claim.write_timestamp(), self.lock_expire);
        if !self
            .mediator
            .lock(kc, &tx.id(), status.expire_timestamp())
        {
            warn!(
                "Local lock on {} for {} was lost while writing its claim",
                kc, tx
            );
        }
        self.state.take(tx.id(), kc.clone(), status);
        debug!(
            "Wrote lock claim {} on {} for {}",
            const_hex::encode(claim.column()),
            kc,
            tx
        );
        Ok(())
    }

    /// Write a claim, retrying slow or temporarily failed attempts with a
    /// fresh timestamp
    ///
    /// Every column from an unconfirmed attempt may have reached the store.
    /// Each retry deletes all of them alongside its own write, and they are
    /// only forgotten once a mutation carrying those deletions succeeds.
    async fn write_single_lock(
        &self,
        kc: &KeyColumn,
        tx: &StoreTransaction,
    ) -> Result<ConfirmedClaim, LockingError> {
        let lock_key = codec::to_lock_key(kc.key(), kc.column())?;
        let mut unconfirmed: Vec<Bytes> = Vec::new();

        for attempt in 1..=self.lock_retry_count {
            let started = self.times.now();
            let claim = ClaimAttempt::new(codec::to_lock_column(started, &self.rid)?, started);
            // A retry within the same clock tick rewrites its own column
            let deletions: Vec<Bytes> = unconfirmed
                .iter()
                .filter(|column| *column != claim.column())
                .cloned()
                .collect();

            let outcome = match self
                .try_write_lock_once(&lock_key, &claim, &deletions, tx)
                .await
            {
                Ok(()) => {
                    unconfirmed.clear();
                    claim.written(self.times.now()).confirm(self.lock_wait)
                }
                Err(e) => Err(claim.failed(e)),
            };
            let abandoned = match outcome {
                Ok(confirmed) => return Ok(confirmed),
                Err(abandoned) => abandoned,
            };

            match abandoned.reason() {
                AbandonReason::TooSlow { elapsed } => warn!(
                    "Lock write on {} started at {} took {} ms, exceeding the {} ms wait (attempt {}/{})",
                    kc,
                    abandoned.started(),
                    elapsed.num_milliseconds(),
                    self.lock_wait.num_milliseconds(),
                    attempt,
                    self.lock_retry_count
                ),
                AbandonReason::Failed(e) if abandoned.is_retryable() => warn!(
                    "Temporary failure writing lock on {} (attempt {}/{}): {}",
                    kc, attempt, self.lock_retry_count, e
                ),
                AbandonReason::Failed(e) => {
                    error!("Permanent failure writing lock on {}: {}", kc, e);
                    let msg = format!("Permanent failure writing lock on {}: {}", kc, e);
                    remember(&mut unconfirmed, abandoned.into_column());
                    self.delete_abandoned(kc, &lock_key, &unconfirmed, tx).await;
                    return Err(LockingError::permanent(msg));
                }
            }
            remember(&mut unconfirmed, abandoned.into_column());
        }

        if !unconfirmed.is_empty() {
            self.delete_abandoned(kc, &lock_key, &unconfirmed, tx).await;
        }
        Err(LockingError::temporary(format!(
            "Lock write retry count exceeded on {}",
            kc
        )))
    }

    /// Add the attempt's column and delete earlier unconfirmed columns in
    /// one mutation stamped with the attempt's start time
    async fn try_write_lock_once(
        &self,
        lock_key: &Bytes,
        claim: &ClaimAttempt,
        deletions: &[Bytes],
        tx: &StoreTransaction,
    ) -> Result<(), BackendError> {
        let additions = [Entry::new(
            claim.column().clone(),
            Bytes::from_static(codec::LOCK_COL_VALUE),
        )];
        self.store
            .mutate(
                lock_key,
                &additions,
                deletions,
                &tx.with_commit_time(claim.started()),
            )
            .await
    }

    async fn try_delete_lock_once(
        &self,
        lock_key: &Bytes,
        columns: &[Bytes],
        tx: &StoreTransaction,
    ) -> Result<(), BackendError> {
        let started = self.times.now();
        self.store
            .mutate(lock_key, &[], columns, &tx.with_commit_time(started))
            .await
    }

    async fn delete_abandoned(
        &self,
        kc: &KeyColumn,
        lock_key: &Bytes,
        columns: &[Bytes],
        tx: &StoreTransaction,
    ) {
        if let Err(e) = self.try_delete_lock_once(lock_key, columns, tx).await {
            warn!(
                "Failed to delete {} abandoned lock claim(s) on {}: {}",
                columns.len(),
                kc,
                e
            );
        }
    }

    async fn check_single_lock(
        &self,
        kc: &KeyColumn,
        status: &ConsistentKeyLockStatus,
        tx: &StoreTransaction,
    ) -> Result<(), LockingError> {
        let now = self
            .times
            .sleep_past(status.write_timestamp() + self.lock_wait)
            .await;

        if now > status.expire_timestamp() {
            return Err(LockingError::expired(format!(
                "Lock on {} written at {} expired at {} (now {})",
                kc,
                status.write_timestamp(),
                status.expire_timestamp(),
                now
            )));
        }

        let query = codec::claim_slice(codec::to_lock_key(kc.key(), kc.column())?);
        let entries = self.get_slice_with_retries(kc, &query, tx).await?;

        let cutoff = now - self.lock_expire;
        let mut live = Vec::with_capacity(entries.len());
        let mut saw_expired = false;
        for entry in entries {
            let claim = match codec::from_lock_column(&entry.column) {
                Ok(claim) => claim,
                Err(e) => {
                    warn!("Skipping unreadable lock column on {}: {}", kc, e);
                    continue;
                }
            };
            if claim.timestamp < cutoff {
                if claim.rid == self.rid && claim.timestamp == status.write_timestamp() {
                    return Err(LockingError::expired(format!(
                        "Lock on {} written at {} is older than the {} ms expiration",
                        kc,
                        claim.timestamp,
                        self.lock_expire.num_milliseconds()
                    )));
                }
                warn!(
                    "Discarded expired claim on {} by {} written at {}",
                    kc,
                    const_hex::encode(&claim.rid),
                    claim.timestamp
                );
                saw_expired = true;
                continue;
            }
            live.push(claim);
        }

        if saw_expired && let Some(cleaner) = &self.cleaner {
            cleaner.clean(kc, cutoff, tx);
        }

        self.check_seniority(kc, status, &live)
    }

    /// Succeed iff our claim appears within the leading run of claims
    /// carrying our rid
    fn check_seniority(
        &self,
        kc: &KeyColumn,
        status: &ConsistentKeyLockStatus,
        claims: &[TimestampRid],
    ) -> Result<(), LockingError> {
        let mut own_mismatches = 0;
        for claim in claims {
            if claim.rid != self.rid {
                return Err(LockingError::temporary(format!(
                    "Lock on {} already held by {} (we are {})",
                    kc,
                    const_hex::encode(&claim.rid),
                    const_hex::encode(&self.rid)
                )));
            }
            if claim.timestamp == status.write_timestamp() {
                debug!("Lock check passed for {}", kc);
                return Ok(());
            }
            warn!(
                "Skipping our own claim on {} written at {} (expected {})",
                kc,
                claim.timestamp,
                status.write_timestamp()
            );
            own_mismatches += 1;
        }

        if own_mismatches == 0 {
            Err(LockingError::temporary(format!(
                "No lock columns found for {}",
                kc
            )))
        } else {
            Err(LockingError::permanent(format!(
                "Read {} of our own lock columns on {} but none contained our timestamp {}",
                own_mismatches,
                kc,
                status.write_timestamp()
            )))
        }
    }

    async fn get_slice_with_retries(
        &self,
        kc: &KeyColumn,
        query: &KeySliceQuery,
        tx: &StoreTransaction,
    ) -> Result<Vec<Entry>, LockingError> {
        for attempt in 1..=self.lock_retry_count {
            match self.store.get_slice(query, tx).await {
                Ok(entries) => return Ok(entries),
                Err(e) if e.is_temporary() => warn!(
                    "Temporary failure reading lock claims on {} (attempt {}/{}): {}",
                    kc, attempt, self.lock_retry_count, e
                ),
                Err(e) => {
                    error!("Permanent failure reading lock claims on {}: {}", kc, e);
                    return Err(e.into());
                }
            }
        }
        Err(LockingError::temporary(format!(
            "Maximum retries ({}) exceeded while checking locks on {}",
            self.lock_retry_count, kc
        )))
    }

    async fn delete_single_lock(
        &self,
        kc: &KeyColumn,
        status: &ConsistentKeyLockStatus,
        tx: &StoreTransaction,
    ) -> Result<(), LockingError> {
        let lock_key = codec::to_lock_key(kc.key(), kc.column())?;
        let columns = [codec::to_lock_column(status.write_timestamp(), &self.rid)?];

        for attempt in 1..=self.lock_retry_count {
            match self.try_delete_lock_once(&lock_key, &columns, tx).await {
                Ok(()) => return Ok(()),
                Err(e) if e.is_temporary() => warn!(
                    "Temporary failure deleting lock on {} (attempt {}/{}): {}",
                    kc, attempt, self.lock_retry_count, e
                ),
                Err(e) => {
                    error!("Permanent failure deleting lock on {}: {}", kc, e);
                    return Err(e.into());
                }
            }
        }
        Err(LockingError::temporary(format!(
            "Lock delete retry count exceeded on {}",
            kc
        )))
    }

    async fn check_all(&self, tx: &StoreTransaction) -> Result<(), LockingError> {
        for (kc, status) in self.state.locks_for_tx(tx.id()) {
            if status.is_checked() {
                debug!("Lock on {} already checked for {}", kc, tx);
                continue;
            }
            self.check_single_lock(&kc, &status, tx).await?;
            self.state.mark_checked(tx.id(), &kc);
        }
        Ok(())
    }

    async fn delete_all(&self, tx: &StoreTransaction) -> Result<(), LockingError> {
        let held = self.state.locks_for_tx(tx.id());
        let total = held.len();
        let mut failures = 0;
        let mut all_temporary = true;

        for (kc, status) in held {
            if let Err(e) = self.delete_single_lock(&kc, &status, tx).await {
                failures += 1;
                all_temporary &= e.is_temporary();
            }
            self.mediator.unlock(&kc, &tx.id());
            self.state.release(tx.id(), &kc);
        }

        if failures == 0 {
            return Ok(());
        }
        let msg = format!(
            "Failed to delete lock claims for {} of {} resources held by {}; they remain until expired",
            failures, total, tx
        );
        if all_temporary {
            Err(LockingError::temporary(msg))
        } else {
            Err(LockingError::permanent(msg))
        }
    }
}

fn remember(unconfirmed: &mut Vec<Bytes>, column: Bytes) {
    if !unconfirmed.contains(&column) {
        unconfirmed.push(column);
    }
}

#[async_trait]
impl Locker for ConsistentKeyLocker {
    async fn write_lock(&self, kc: &KeyColumn, tx: &StoreTransaction) -> Result<(), LockingError> {
        metrics::record_call(tx, LockOp::Write);
        let result = self.lock_one(kc, tx).await;
        if result.is_err() {
            metrics::record_exception(tx, LockOp::Write);
        }
        result
    }

    async fn check_locks(&self, tx: &StoreTransaction) -> Result<(), LockingError> {
        metrics::record_call(tx, LockOp::Check);
        let result = self.check_all(tx).await;
        if result.is_err() {
            metrics::record_exception(tx, LockOp::Check);
        }
        result
    }

    async fn delete_locks(&self, tx: &StoreTransaction) -> Result<(), LockingError> {
        metrics::record_call(tx, LockOp::Delete);
        let result = self.delete_all(tx).await;
        if result.is_err() {
            metrics::record_exception(tx, LockOp::Delete);
        }
        result
    }
}
