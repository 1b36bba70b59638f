// In-memory key-column store
// Rows live in a sharded map; each row keeps its columns in byte order

use std::collections::BTreeMap;
use std::ops::Bound;

use async_trait::async_trait;
use bytes::Bytes;
use dashmap::DashMap;
use tracing::trace;

use crate::error::BackendError;
use crate::store::{Entry, KeyColumnValueStore, KeySliceQuery, StoreTransaction};

/// Ordered key-column store held entirely in memory
pub struct InMemoryStore {
    name: String,
    rows: DashMap<Bytes, BTreeMap<Bytes, Bytes>>,
}

impl InMemoryStore {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            rows: DashMap::new(),
        }
    }

    /// Number of columns currently stored under `key`
    pub fn column_count(&self, key: &[u8]) -> usize {
        self.rows.get(key).map(|row| row.len()).unwrap_or(0)
    }

    /// Whether any row holds data
    pub fn is_empty(&self) -> bool {
        self.rows.iter().all(|row| row.is_empty())
    }
}

#[async_trait]
impl KeyColumnValueStore for InMemoryStore {
    async fn get_slice(
        &self,
        query: &KeySliceQuery,
        _tx: &StoreTransaction,
    ) -> Result<Vec<Entry>, BackendError> {
        if query.slice_start >= query.slice_end {
            return Ok(Vec::new());
        }

        let Some(row) = self.rows.get(&query.key) else {
            return Ok(Vec::new());
        };

        let range = (
            Bound::Included(&query.slice_start[..]),
            Bound::Excluded(&query.slice_end[..]),
        );
        let entries: Vec<Entry> = row
            .range::<[u8], _>(range)
            .map(|(column, value)| Entry::new(column.clone(), value.clone()))
            .collect();

        trace!(store = %self.name, count = entries.len(), "Served slice");
        Ok(entries)
    }

    async fn mutate(
        &self,
        key: &Bytes,
        additions: &[Entry],
        deletions: &[Bytes],
        tx: &StoreTransaction,
    ) -> Result<(), BackendError> {
        let mut row = self.rows.entry(key.clone()).or_default();
        for column in deletions {
            row.remove(column);
        }
        for entry in additions {
            row.insert(entry.column.clone(), entry.value.clone());
        }
        let now_empty = row.is_empty();
        drop(row);

        if now_empty {
            self.rows.remove_if(key, |_, row| row.is_empty());
        }

        trace!(
            store = %self.name,
            tx = %tx,
            additions = additions.len(),
            deletions = deletions.len(),
            "Applied mutation"
        );
        Ok(())
    }

    fn name(&self) -> &str {
        &self.name
    }
}
