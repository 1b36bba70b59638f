//! Tessera Common - Shared storage types, traits, and time sources
//!
//! This crate provides the foundational types used by the Tessera storage layer:
//! - Backend error taxonomy (temporary vs. permanent failures)
//! - `KeyColumn` resource coordinates
//! - The key-column store abstraction and transaction handles
//! - Timestamp providers (wall clock and a manually driven test clock)
//! - An in-memory key-column store

pub mod error;
pub mod key_column;
pub mod memory;
pub mod store;
pub mod time;

// Re-exports for convenience
pub use error::BackendError;
pub use key_column::KeyColumn;
pub use memory::InMemoryStore;
pub use store::{Entry, KeyColumnValueStore, KeySliceQuery, StoreTransaction, TxId};
pub use time::{SystemTimestampProvider, Timestamp, TimestampProvider};

#[cfg(any(test, feature = "testing"))]
pub use time::FakeTimestampProvider;
