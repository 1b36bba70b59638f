//! Consistent-key locking
//!
//! A lock on a `(key, column)` resource is a claim column written under a
//! dedicated lock row. Every participant writes its own claim, waits for the
//! store to propagate it, then reads the row back: the oldest live claim
//! wins. Claims are never updated in place. A retried write always creates a
//! new column with a fresh timestamp and, in the same mutation, deletes every
//! earlier column that was never confirmed.

mod attempt;
mod builder;
mod locker;
mod status;

pub use builder::ConsistentKeyLockerBuilder;
pub use locker::ConsistentKeyLocker;
pub use status::ConsistentKeyLockStatus;
