// Hand-written fakes shared by the unit tests

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use tessera_common::{
    BackendError, Entry, FakeTimestampProvider, InMemoryStore, KeyColumn, KeyColumnValueStore,
    KeySliceQuery, StoreTransaction, Timestamp, TxId,
};

use crate::cleaner::LockCleanerService;
use crate::codec::{self, TimestampRid};

/// A store call as observed by [`RecordingStore`]
#[derive(Debug, Clone)]
pub(crate) enum Call {
    Slice {
        query: KeySliceQuery,
        tx: TxId,
    },
    Mutate {
        key: Bytes,
        additions: Vec<Bytes>,
        deletions: Vec<Bytes>,
        commit_time: Option<Timestamp>,
        tx: TxId,
    },
}

/// Scripted outcome of the next store call
#[derive(Debug, Clone)]
pub(crate) struct Response {
    latency: Duration,
    apply: bool,
    yields: bool,
    result: Result<(), BackendError>,
}

impl Response {
    pub(crate) fn slow(latency: Duration) -> Self {
        Self {
            latency,
            apply: true,
            yields: false,
            result: Ok(()),
        }
    }

    pub(crate) fn fail(error: BackendError) -> Self {
        Self {
            latency: Duration::ZERO,
            apply: false,
            yields: false,
            result: Err(error),
        }
    }

    /// Succeeds instantly, but only after handing control back to the
    /// executor once
    pub(crate) fn yielding() -> Self {
        Self {
            yields: true,
            ..Self::slow(Duration::ZERO)
        }
    }
}

/// In-memory store that records every call and plays scripted responses
///
/// Latency is simulated by advancing the shared fake clock. Calls with no
/// scripted response succeed instantly.
pub(crate) struct RecordingStore {
    inner: InMemoryStore,
    times: Arc<FakeTimestampProvider>,
    calls: Mutex<Vec<Call>>,
    mutate_script: Mutex<VecDeque<Response>>,
    slice_script: Mutex<VecDeque<Response>>,
}

impl RecordingStore {
    pub(crate) fn new(times: Arc<FakeTimestampProvider>) -> Self {
        Self {
            inner: InMemoryStore::new("recording"),
            times,
            calls: Mutex::new(Vec::new()),
            mutate_script: Mutex::new(VecDeque::new()),
            slice_script: Mutex::new(VecDeque::new()),
        }
    }

    pub(crate) fn script_mutate(&self, response: Response) {
        self.mutate_script.lock().push_back(response);
    }

    pub(crate) fn script_slice(&self, response: Response) {
        self.slice_script.lock().push_back(response);
    }

    pub(crate) fn calls(&self) -> Vec<Call> {
        self.calls.lock().clone()
    }

    pub(crate) fn mutations(&self) -> Vec<Call> {
        self.calls()
            .into_iter()
            .filter(|c| matches!(c, Call::Mutate { .. }))
            .collect()
    }

    pub(crate) fn slices(&self) -> usize {
        self.calls()
            .iter()
            .filter(|c| matches!(c, Call::Slice { .. }))
            .count()
    }

    /// Write a claim directly, bypassing the recording
    pub(crate) async fn seed_claim(&self, kc: &KeyColumn, timestamp: Timestamp, rid: &[u8]) -> Bytes {
        let column = codec::to_lock_column(timestamp, rid).unwrap();
        self.inner
            .mutate(
                &lock_key(kc),
                &[Entry::new(column.clone(), Bytes::from_static(codec::LOCK_COL_VALUE))],
                &[],
                &StoreTransaction::new(),
            )
            .await
            .unwrap();
        column
    }

    /// Write a plain cell directly, bypassing the recording
    pub(crate) async fn seed(&self, key: &[u8], column: &[u8], value: &[u8]) {
        self.inner
            .mutate(
                &Bytes::copy_from_slice(key),
                &[Entry::new(Bytes::copy_from_slice(column), Bytes::copy_from_slice(value))],
                &[],
                &StoreTransaction::new(),
            )
            .await
            .unwrap();
    }

    /// Delete a column directly, bypassing the recording
    pub(crate) async fn remove_column(&self, kc: &KeyColumn, column: Bytes) {
        self.inner
            .mutate(&lock_key(kc), &[], &[column], &StoreTransaction::new())
            .await
            .unwrap();
    }

    /// Claims currently stored for `kc`, in column order
    pub(crate) async fn claims(&self, kc: &KeyColumn) -> Vec<TimestampRid> {
        self.inner
            .get_slice(&codec::claim_slice(lock_key(kc)), &StoreTransaction::new())
            .await
            .unwrap()
            .iter()
            .map(|e| codec::from_lock_column(&e.column).unwrap())
            .collect()
    }

    fn next_response(&self, script: &Mutex<VecDeque<Response>>) -> Option<Response> {
        let response = script.lock().pop_front();
        if let Some(response) = &response {
            self.times.advance(response.latency);
        }
        response
    }
}

pub(crate) fn lock_key(kc: &KeyColumn) -> Bytes {
    codec::to_lock_key(kc.key(), kc.column()).unwrap()
}

#[async_trait]
impl KeyColumnValueStore for RecordingStore {
    async fn get_slice(
        &self,
        query: &KeySliceQuery,
        tx: &StoreTransaction,
    ) -> Result<Vec<Entry>, BackendError> {
        self.calls.lock().push(Call::Slice {
            query: query.clone(),
            tx: tx.id(),
        });
        match self.next_response(&self.slice_script) {
            Some(Response { result: Err(e), .. }) => Err(e),
            _ => self.inner.get_slice(query, tx).await,
        }
    }

    async fn mutate(
        &self,
        key: &Bytes,
        additions: &[Entry],
        deletions: &[Bytes],
        tx: &StoreTransaction,
    ) -> Result<(), BackendError> {
        self.calls.lock().push(Call::Mutate {
            key: key.clone(),
            additions: additions.iter().map(|e| e.column.clone()).collect(),
            deletions: deletions.to_vec(),
            commit_time: tx.commit_time(),
            tx: tx.id(),
        });
        let response = self
            .next_response(&self.mutate_script)
            .unwrap_or(Response::slow(Duration::ZERO));
        if response.yields {
            tokio::task::yield_now().await;
        }
        if response.apply {
            self.inner.mutate(key, additions, deletions, tx).await?;
        }
        response.result
    }

    fn name(&self) -> &str {
        "recording"
    }
}

/// Cleaner that only remembers what it was asked to do
#[derive(Default)]
pub(crate) struct RecordingCleaner {
    requests: Mutex<Vec<(KeyColumn, Timestamp)>>,
}

impl RecordingCleaner {
    pub(crate) fn requests(&self) -> Vec<(KeyColumn, Timestamp)> {
        self.requests.lock().clone()
    }
}

impl LockCleanerService for RecordingCleaner {
    fn clean(&self, kc: &KeyColumn, cutoff: Timestamp, _tx: &StoreTransaction) {
        self.requests.lock().push((kc.clone(), cutoff));
    }
}
