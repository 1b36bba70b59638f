//! Key-column store abstraction
//!
//! A store maps a row key to an ordered set of columns. Reads are slice
//! queries over a half-open column range; writes are atomic batches of
//! insertions and deletions at a single key. No compare-and-swap is offered.

use std::fmt::{Display, Formatter};
use std::hash::{Hash, Hasher};
use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use bytes::Bytes;

use crate::error::BackendError;
use crate::time::Timestamp;

/// A single column/value cell
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Entry {
    pub column: Bytes,
    pub value: Bytes,
}

impl Entry {
    pub fn new(column: impl Into<Bytes>, value: impl Into<Bytes>) -> Self {
        Self {
            column: column.into(),
            value: value.into(),
        }
    }
}

/// Slice query over `[slice_start, slice_end)` of one row
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeySliceQuery {
    pub key: Bytes,
    pub slice_start: Bytes,
    pub slice_end: Bytes,
}

impl KeySliceQuery {
    pub fn new(key: impl Into<Bytes>, slice_start: impl Into<Bytes>, slice_end: impl Into<Bytes>) -> Self {
        Self {
            key: key.into(),
            slice_start: slice_start.into(),
            slice_end: slice_end.into(),
        }
    }
}

static NEXT_TX_ID: AtomicU64 = AtomicU64::new(1);

/// Process-unique identity of a store transaction
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TxId(u64);

impl TxId {
    /// Allocate a fresh identity
    pub fn next() -> Self {
        Self(NEXT_TX_ID.fetch_add(1, Ordering::Relaxed))
    }

    pub fn as_u64(self) -> u64 {
        self.0
    }
}

impl Display for TxId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "tx-{}", self.0)
    }
}

/// Handle identifying the caller on whose behalf a store operation runs
///
/// Equality and hashing only consider the transaction identity; the group
/// name and commit-time override are carried as metadata.
#[derive(Debug, Clone)]
pub struct StoreTransaction {
    id: TxId,
    group_name: Option<String>,
    commit_time: Option<Timestamp>,
}

impl StoreTransaction {
    pub fn new() -> Self {
        Self {
            id: TxId::next(),
            group_name: None,
            commit_time: None,
        }
    }

    /// Set the metrics group this transaction reports under
    pub fn with_group_name(mut self, group_name: impl Into<String>) -> Self {
        self.group_name = Some(group_name.into());
        self
    }

    /// Derive a handle for the same transaction whose mutations carry the
    /// given commit time
    pub fn with_commit_time(&self, commit_time: Timestamp) -> Self {
        Self {
            id: self.id,
            group_name: self.group_name.clone(),
            commit_time: Some(commit_time),
        }
    }

    pub fn id(&self) -> TxId {
        self.id
    }

    pub fn group_name(&self) -> Option<&str> {
        self.group_name.as_deref()
    }

    pub fn commit_time(&self) -> Option<Timestamp> {
        self.commit_time
    }
}

impl Default for StoreTransaction {
    fn default() -> Self {
        Self::new()
    }
}

impl PartialEq for StoreTransaction {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl Eq for StoreTransaction {}

impl Hash for StoreTransaction {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.id.hash(state);
    }
}

impl Display for StoreTransaction {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.id)
    }
}

/// Ordered key-column store
#[async_trait]
pub trait KeyColumnValueStore: Send + Sync {
    /// Return every column of `query.key` in `[slice_start, slice_end)`,
    /// ordered by column bytes ascending
    async fn get_slice(
        &self,
        query: &KeySliceQuery,
        tx: &StoreTransaction,
    ) -> Result<Vec<Entry>, BackendError>;

    /// Atomically apply `deletions` and `additions` to one row
    ///
    /// A column both deleted and added in the same batch ends up present.
    async fn mutate(
        &self,
        key: &Bytes,
        additions: &[Entry],
        deletions: &[Bytes],
        tx: &StoreTransaction,
    ) -> Result<(), BackendError>;

    /// Store name for log output
    fn name(&self) -> &str;
}
