//! Expected-value checking transactions
//!
//! A transaction that wants to overwrite a cell only if it still holds the
//! value it read earlier first takes a lock on that cell through
//! [`ExpectedValueCheckingTransaction::acquire_lock`], passing the value it
//! expects. Nothing is verified at that point. The first mutation made
//! through the transaction checks every lock, re-reads every expected value
//! with the consistent transaction, and only then writes. Once a mutation has
//! started, no further locks may be taken.
//!
//! Transactions holding locks write through their consistent transaction;
//! transactions without locks write through the inconsistent one.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use bytes::{BufMut, Bytes, BytesMut};
use chrono::TimeDelta;
use tessera_common::{
    Entry, KeyColumn, KeyColumnValueStore, KeySliceQuery, StoreTransaction, TimestampProvider,
};
use tracing::{debug, warn};

use crate::error::LockingError;
use crate::locker::Locker;

const READ_RETRY_INITIAL_PAUSE: Duration = Duration::from_millis(10);
const READ_RETRY_MAX_PAUSE: Duration = Duration::from_secs(1);

/// A data store paired with the locker that guards its cells
pub struct ExpectedValueCheckingStore {
    store: Arc<dyn KeyColumnValueStore>,
    locker: Arc<dyn Locker>,
}

impl ExpectedValueCheckingStore {
    pub fn new(store: Arc<dyn KeyColumnValueStore>, locker: Arc<dyn Locker>) -> Self {
        Self { store, locker }
    }

    pub fn name(&self) -> &str {
        self.store.name()
    }

    pub fn backing_store(&self) -> &Arc<dyn KeyColumnValueStore> {
        &self.store
    }

    pub fn locker(&self) -> &Arc<dyn Locker> {
        &self.locker
    }
}

/// Expected values recorded against one store
struct LockedStore {
    store: Arc<ExpectedValueCheckingStore>,
    expected: BTreeMap<KeyColumn, Option<Bytes>>,
}

/// Transaction that defers lock checks and expected-value verification to
/// its first mutation
pub struct ExpectedValueCheckingTransaction {
    inconsistent_tx: StoreTransaction,
    consistent_tx: StoreTransaction,
    times: Arc<dyn TimestampProvider>,
    max_read_time: TimeDelta,
    mutation_started: bool,
    locked: Vec<LockedStore>,
}

impl ExpectedValueCheckingTransaction {
    /// `consistent_tx` is used for every lock operation and expected-value
    /// read; `max_read_time` bounds the retries of each such read
    pub fn new(
        inconsistent_tx: StoreTransaction,
        consistent_tx: StoreTransaction,
        times: Arc<dyn TimestampProvider>,
        max_read_time: Duration,
    ) -> Self {
        Self {
            inconsistent_tx,
            consistent_tx,
            times,
            max_read_time: TimeDelta::from_std(max_read_time).unwrap_or(TimeDelta::MAX),
            mutation_started: false,
            locked: Vec::new(),
        }
    }

    pub fn inconsistent_tx(&self) -> &StoreTransaction {
        &self.inconsistent_tx
    }

    pub fn consistent_tx(&self) -> &StoreTransaction {
        &self.consistent_tx
    }

    /// True once a mutation has passed the lock and expected-value checks
    pub fn is_mutation_started(&self) -> bool {
        self.mutation_started
    }

    /// Lock `(key, column)` in `store`, remembering the value the cell must
    /// hold when the first mutation runs
    ///
    /// `None` expects the cell to be absent. When a cell is locked more than
    /// once, the first expected value is kept.
    pub async fn acquire_lock(
        &mut self,
        store: &Arc<ExpectedValueCheckingStore>,
        key: impl Into<Bytes>,
        column: impl Into<Bytes>,
        expected: Option<Bytes>,
    ) -> Result<(), LockingError> {
        if self.mutation_started {
            return Err(LockingError::permanent(
                "Attempted to obtain a lock after mutations had been persisted",
            ));
        }

        let kc = KeyColumn::new(key, column);
        debug!("Attempting to acquire lock on {} in {}", kc, store.name());
        store.locker().write_lock(&kc, &self.consistent_tx).await?;
        self.store_expected_value(store, kc, expected);
        Ok(())
    }

    /// Write to `store`, verifying all locks and expected values first if
    /// this is the transaction's first mutation
    pub async fn mutate(
        &mut self,
        store: &ExpectedValueCheckingStore,
        key: &Bytes,
        additions: &[Entry],
        deletions: &[Bytes],
    ) -> Result<(), LockingError> {
        let tx = if self.prepare_for_mutations().await? {
            &self.consistent_tx
        } else {
            &self.inconsistent_tx
        };
        store
            .backing_store()
            .mutate(key, additions, deletions, tx)
            .await?;
        Ok(())
    }

    /// Check every lock and expected value unless a mutation already started
    ///
    /// Returns whether the transaction holds any lock. The transaction only
    /// counts as started once every check has passed.
    pub async fn prepare_for_mutations(&mut self) -> Result<bool, LockingError> {
        if !self.mutation_started {
            self.check_all_locks().await?;
            self.check_all_expected_values().await?;
            self.mutation_started = true;
        }
        Ok(!self.locked.is_empty())
    }

    /// Release every lock taken through this transaction
    pub async fn commit(self) -> Result<(), LockingError> {
        self.delete_all_locks().await
    }

    pub async fn rollback(self) -> Result<(), LockingError> {
        self.delete_all_locks().await
    }

    fn store_expected_value(
        &mut self,
        store: &Arc<ExpectedValueCheckingStore>,
        kc: KeyColumn,
        value: Option<Bytes>,
    ) {
        let index = match self
            .locked
            .iter()
            .position(|locked| Arc::ptr_eq(&locked.store, store))
        {
            Some(index) => index,
            None => {
                self.locked.push(LockedStore {
                    store: store.clone(),
                    expected: BTreeMap::new(),
                });
                self.locked.len() - 1
            }
        };

        let expected = &mut self.locked[index].expected;
        match expected.get(&kc) {
            Some(kept) => debug!(
                "Multiple expected values for {}: keeping initial value {} and discarding later value {}",
                kc,
                display_value(kept),
                display_value(&value)
            ),
            None => {
                debug!("Store expected value for {}: {}", kc, display_value(&value));
                expected.insert(kc, value);
            }
        }
    }

    async fn check_all_locks(&self) -> Result<(), LockingError> {
        for locked in &self.locked {
            locked.store.locker().check_locks(&self.consistent_tx).await?;
        }
        Ok(())
    }

    async fn check_all_expected_values(&self) -> Result<(), LockingError> {
        for locked in &self.locked {
            for (kc, expected) in &locked.expected {
                self.check_single_expected_value(&locked.store, kc, expected)
                    .await?;
            }
        }
        Ok(())
    }

    async fn check_single_expected_value(
        &self,
        store: &ExpectedValueCheckingStore,
        kc: &KeyColumn,
        expected: &Option<Bytes>,
    ) -> Result<(), LockingError> {
        let query = exact_column_slice(kc);
        let entries = self.read_with_retries(store, kc, &query).await?;

        // Slices may return columns that merely start with ours
        let actual: Vec<Bytes> = entries
            .into_iter()
            .filter(|entry| entry.column == *kc.column())
            .map(|entry| entry.value)
            .collect();
        let expected: Vec<Bytes> = expected.iter().cloned().collect();

        if actual != expected {
            return Err(LockingError::permanent(format!(
                "Expected value mismatch for {}: expected={:?} vs actual={:?} (store={})",
                kc,
                hex_values(&expected),
                hex_values(&actual),
                store.name()
            )));
        }
        Ok(())
    }

    async fn read_with_retries(
        &self,
        store: &ExpectedValueCheckingStore,
        kc: &KeyColumn,
        query: &KeySliceQuery,
    ) -> Result<Vec<Entry>, LockingError> {
        let deadline = self.times.now().checked_add_signed(self.max_read_time);
        let mut pause = READ_RETRY_INITIAL_PAUSE;

        loop {
            match store
                .backing_store()
                .get_slice(query, &self.consistent_tx)
                .await
            {
                Ok(entries) => return Ok(entries),
                Err(e) if e.is_temporary() => {
                    if deadline.is_some_and(|deadline| self.times.now() >= deadline) {
                        return Err(LockingError::temporary(format!(
                            "Could not read expected value of {} within {} ms: {}",
                            kc,
                            self.max_read_time.num_milliseconds(),
                            e
                        )));
                    }
                    warn!("Temporary failure reading expected value of {}: {}", kc, e);
                    self.times.sleep_for(pause).await;
                    pause = (pause * 2).min(READ_RETRY_MAX_PAUSE);
                }
                Err(e) => return Err(e.into()),
            }
        }
    }

    async fn delete_all_locks(&self) -> Result<(), LockingError> {
        let mut first_error = None;
        for locked in &self.locked {
            if let Err(e) = locked.store.locker().delete_locks(&self.consistent_tx).await {
                warn!("Failed to delete locks in {}: {}", locked.store.name(), e);
                first_error.get_or_insert(e);
            }
        }
        first_error.map_or(Ok(()), Err)
    }
}

/// Slice `[column, column ++ 0x00)`, which holds only `column` itself
fn exact_column_slice(kc: &KeyColumn) -> KeySliceQuery {
    let mut end = BytesMut::with_capacity(kc.column().len() + 1);
    end.put_slice(kc.column());
    end.put_u8(0x00);
    KeySliceQuery::new(kc.key().clone(), kc.column().clone(), end.freeze())
}

fn display_value(value: &Option<Bytes>) -> String {
    match value {
        Some(value) => format!("0x{}", const_hex::encode(value)),
        None => "absent".to_string(),
    }
}

fn hex_values(values: &[Bytes]) -> Vec<String> {
    values.iter().map(const_hex::encode).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    use async_trait::async_trait;
    use parking_lot::Mutex;
    use tessera_common::{BackendError, FakeTimestampProvider, Timestamp, TxId};

    use crate::test_support::{Call, RecordingStore, Response};

    const DATA_KEY: &[u8] = &[0, 0, 0, 1];
    const DATA_COL: &[u8] = &[0, 0, 0, 2];
    const DATA_VAL: &[u8] = &[0, 0, 0, 4];
    const LOCK_KEY: &[u8] = &[0, 0, 0, 32];
    const LOCK_COL: &[u8] = &[0, 0, 0, 64];
    const LOCK_VAL: &[u8] = &[0, 0, 0, 128];

    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    enum Op {
        Write,
        Check,
        Delete,
    }

    /// Locker that records each call with the transaction it was given
    #[derive(Default)]
    struct RecordingLocker {
        calls: Mutex<Vec<(Op, TxId)>>,
        check_error: Mutex<Option<LockingError>>,
    }

    impl RecordingLocker {
        fn calls(&self) -> Vec<(Op, TxId)> {
            self.calls.lock().clone()
        }

        fn fail_checks_with(&self, error: LockingError) {
            *self.check_error.lock() = Some(error);
        }
    }

    #[async_trait]
    impl Locker for RecordingLocker {
        async fn write_lock(&self, _kc: &KeyColumn, tx: &StoreTransaction) -> Result<(), LockingError> {
            self.calls.lock().push((Op::Write, tx.id()));
            Ok(())
        }

        async fn check_locks(&self, tx: &StoreTransaction) -> Result<(), LockingError> {
            self.calls.lock().push((Op::Check, tx.id()));
            match self.check_error.lock().clone() {
                Some(error) => Err(error),
                None => Ok(()),
            }
        }

        async fn delete_locks(&self, tx: &StoreTransaction) -> Result<(), LockingError> {
            self.calls.lock().push((Op::Delete, tx.id()));
            Ok(())
        }
    }

    struct Fixture {
        times: Arc<FakeTimestampProvider>,
        backing: Arc<RecordingStore>,
        locker: Arc<RecordingLocker>,
        store: Arc<ExpectedValueCheckingStore>,
        tx: ExpectedValueCheckingTransaction,
    }

    fn fixture() -> Fixture {
        let times = Arc::new(FakeTimestampProvider::new(
            Timestamp::UNIX_EPOCH + TimeDelta::seconds(1_000),
        ));
        let backing = Arc::new(RecordingStore::new(times.clone()));
        let locker = Arc::new(RecordingLocker::default());
        let store = Arc::new(ExpectedValueCheckingStore::new(
            backing.clone(),
            locker.clone(),
        ));
        let tx = ExpectedValueCheckingTransaction::new(
            StoreTransaction::new(),
            StoreTransaction::new(),
            times.clone(),
            Duration::from_secs(1),
        );
        Fixture {
            times,
            backing,
            locker,
            store,
            tx,
        }
    }

    fn data() -> Vec<Entry> {
        vec![Entry::new(Bytes::from_static(DATA_COL), Bytes::from_static(DATA_VAL))]
    }

    fn data_key() -> Bytes {
        Bytes::from_static(DATA_KEY)
    }

    fn lock_val() -> Option<Bytes> {
        Some(Bytes::from_static(LOCK_VAL))
    }

    #[tokio::test]
    async fn test_mutate_with_lock_uses_consistent_tx() {
        let mut f = fixture();
        let consistent = f.tx.consistent_tx().id();
        f.backing.seed(LOCK_KEY, LOCK_COL, LOCK_VAL).await;

        f.tx.acquire_lock(&f.store, LOCK_KEY, LOCK_COL, lock_val())
            .await
            .unwrap();
        assert!(!f.tx.is_mutation_started());
        f.tx.mutate(&f.store, &data_key(), &data(), &[]).await.unwrap();

        assert!(f.tx.is_mutation_started());
        assert_eq!(
            f.locker.calls(),
            vec![(Op::Write, consistent), (Op::Check, consistent)]
        );
        let calls = f.backing.calls();
        assert_eq!(calls.len(), 2);
        match &calls[0] {
            Call::Slice { query, tx } => {
                let kc = KeyColumn::new(LOCK_KEY, LOCK_COL);
                assert_eq!(query, &exact_column_slice(&kc));
                assert_eq!(*tx, consistent);
            }
            other => panic!("unexpected call {:?}", other),
        }
        match &calls[1] {
            Call::Mutate { key, tx, .. } => {
                assert_eq!(key, &data_key());
                assert_eq!(*tx, consistent);
            }
            other => panic!("unexpected call {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_mutate_without_lock_uses_inconsistent_tx() {
        let mut f = fixture();
        let inconsistent = f.tx.inconsistent_tx().id();

        f.tx.mutate(&f.store, &data_key(), &data(), &[]).await.unwrap();

        assert!(f.locker.calls().is_empty());
        let calls = f.backing.calls();
        assert_eq!(calls.len(), 1);
        assert!(matches!(&calls[0], Call::Mutate { tx, .. } if *tx == inconsistent));
    }

    #[tokio::test]
    async fn test_expected_value_mismatch_aborts_mutation() {
        let mut f = fixture();
        f.backing.seed(LOCK_KEY, LOCK_COL, &[0, 0, 0, 7]).await;

        f.tx.acquire_lock(&f.store, LOCK_KEY, LOCK_COL, lock_val())
            .await
            .unwrap();
        let err = f
            .tx
            .mutate(&f.store, &data_key(), &data(), &[])
            .await
            .unwrap_err();

        assert!(matches!(err, LockingError::Permanent(ref msg) if msg.contains("Expected value mismatch")));
        assert!(f.backing.mutations().is_empty());
    }

    #[tokio::test]
    async fn test_absent_expected_value() {
        let mut f = fixture();
        f.tx.acquire_lock(&f.store, LOCK_KEY, LOCK_COL, None)
            .await
            .unwrap();
        f.tx.mutate(&f.store, &data_key(), &data(), &[]).await.unwrap();

        // A cell that appeared since the read breaks the expectation
        let mut g = fixture();
        g.backing.seed(LOCK_KEY, LOCK_COL, LOCK_VAL).await;
        g.tx.acquire_lock(&g.store, LOCK_KEY, LOCK_COL, None)
            .await
            .unwrap();
        let err = g
            .tx
            .mutate(&g.store, &data_key(), &data(), &[])
            .await
            .unwrap_err();
        assert!(matches!(err, LockingError::Permanent(_)));
    }

    #[tokio::test]
    async fn test_longer_columns_are_not_compared() {
        let mut f = fixture();
        f.backing.seed(LOCK_KEY, &[0, 0, 0, 64, 0], &[9]).await;
        f.backing.seed(LOCK_KEY, LOCK_COL, LOCK_VAL).await;

        f.tx.acquire_lock(&f.store, LOCK_KEY, LOCK_COL, lock_val())
            .await
            .unwrap();
        f.tx.mutate(&f.store, &data_key(), &data(), &[]).await.unwrap();
    }

    #[tokio::test]
    async fn test_lock_after_mutation_is_refused() {
        let mut f = fixture();
        f.tx.mutate(&f.store, &data_key(), &data(), &[]).await.unwrap();

        let err = f
            .tx
            .acquire_lock(&f.store, LOCK_KEY, LOCK_COL, lock_val())
            .await
            .unwrap_err();

        assert!(matches!(err, LockingError::Permanent(ref msg) if msg.contains("after mutations")));
        assert!(f.locker.calls().is_empty());
    }

    #[tokio::test]
    async fn test_first_expected_value_is_kept() {
        let mut f = fixture();
        f.backing.seed(LOCK_KEY, LOCK_COL, LOCK_VAL).await;

        f.tx.acquire_lock(&f.store, LOCK_KEY, LOCK_COL, lock_val())
            .await
            .unwrap();
        f.tx.acquire_lock(&f.store, LOCK_KEY, LOCK_COL, Some(Bytes::from_static(&[1])))
            .await
            .unwrap();

        f.tx.mutate(&f.store, &data_key(), &data(), &[]).await.unwrap();
        assert_eq!(f.backing.slices(), 1);
    }

    #[tokio::test]
    async fn test_checks_run_only_before_first_mutation() {
        let mut f = fixture();
        f.backing.seed(LOCK_KEY, LOCK_COL, LOCK_VAL).await;
        f.tx.acquire_lock(&f.store, LOCK_KEY, LOCK_COL, lock_val())
            .await
            .unwrap();

        f.tx.mutate(&f.store, &data_key(), &data(), &[]).await.unwrap();
        f.tx.mutate(&f.store, &data_key(), &[], &[Bytes::from_static(DATA_COL)])
            .await
            .unwrap();

        let checks = f
            .locker
            .calls()
            .iter()
            .filter(|(op, _)| *op == Op::Check)
            .count();
        assert_eq!(checks, 1);
        assert_eq!(f.backing.slices(), 1);
        assert_eq!(f.backing.mutations().len(), 2);
    }

    #[tokio::test]
    async fn test_failed_lock_check_skips_value_reads() {
        let mut f = fixture();
        f.locker
            .fail_checks_with(LockingError::temporary("held elsewhere"));
        f.tx.acquire_lock(&f.store, LOCK_KEY, LOCK_COL, lock_val())
            .await
            .unwrap();

        let err = f
            .tx
            .mutate(&f.store, &data_key(), &data(), &[])
            .await
            .unwrap_err();

        assert!(err.is_temporary());
        assert_eq!(f.backing.slices(), 0);
        assert!(f.backing.mutations().is_empty());
        assert!(!f.tx.is_mutation_started());
    }

    #[tokio::test]
    async fn test_expected_value_read_retries_temporary_failures() {
        let mut f = fixture();
        f.backing.seed(LOCK_KEY, LOCK_COL, LOCK_VAL).await;
        for _ in 0..2 {
            f.backing
                .script_slice(Response::fail(BackendError::temporary("busy")));
        }
        f.tx.acquire_lock(&f.store, LOCK_KEY, LOCK_COL, lock_val())
            .await
            .unwrap();

        f.tx.mutate(&f.store, &data_key(), &data(), &[]).await.unwrap();
        assert_eq!(f.backing.slices(), 3);
    }

    #[tokio::test]
    async fn test_expected_value_read_gives_up_after_max_read_time() {
        let mut f = fixture();
        let start = f.times.now();
        for _ in 0..20 {
            f.backing
                .script_slice(Response::fail(BackendError::temporary("busy")));
        }
        f.tx.acquire_lock(&f.store, LOCK_KEY, LOCK_COL, lock_val())
            .await
            .unwrap();

        let err = f
            .tx
            .mutate(&f.store, &data_key(), &data(), &[])
            .await
            .unwrap_err();

        assert!(matches!(err, LockingError::Temporary(ref msg) if msg.contains("within 1000 ms")));
        // Pauses of 10, 20, 40, ... 640 ms pass the one second budget
        assert_eq!(f.backing.slices(), 8);
        assert_eq!(f.times.now() - start, TimeDelta::milliseconds(1270));
    }

    #[tokio::test]
    async fn test_commit_and_rollback_delete_locks() {
        let mut f = fixture();
        let consistent = f.tx.consistent_tx().id();
        f.tx.acquire_lock(&f.store, LOCK_KEY, LOCK_COL, None)
            .await
            .unwrap();

        f.tx.commit().await.unwrap();
        assert_eq!(
            f.locker.calls(),
            vec![(Op::Write, consistent), (Op::Delete, consistent)]
        );

        let mut g = fixture();
        let consistent = g.tx.consistent_tx().id();
        g.tx.acquire_lock(&g.store, LOCK_KEY, LOCK_COL, None)
            .await
            .unwrap();
        g.tx.rollback().await.unwrap();
        assert_eq!(g.locker.calls().last(), Some(&(Op::Delete, consistent)));

        // Nothing locked, nothing to release
        let h = fixture();
        h.tx.rollback().await.unwrap();
        assert!(h.locker.calls().is_empty());
    }
}
