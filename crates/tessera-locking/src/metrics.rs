// Lock operation counters
// Reported per transaction group through the `metrics` facade

use ::metrics::{counter, describe_counter};
use tessera_common::StoreTransaction;

pub const LOCK_CALLS_TOTAL: &str = "tessera_locks_calls_total";
pub const LOCK_EXCEPTIONS_TOTAL: &str = "tessera_locks_exceptions_total";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockOp {
    Write,
    Check,
    Delete,
}

impl LockOp {
    pub fn as_str(&self) -> &'static str {
        match self {
            LockOp::Write => "write",
            LockOp::Check => "check",
            LockOp::Delete => "delete",
        }
    }
}

/// Register metric descriptions with the installed recorder
/// Should be called once after the recorder is installed
pub fn describe_metrics() {
    describe_counter!(
        LOCK_CALLS_TOTAL,
        "Total number of lock write, check and delete calls"
    );
    describe_counter!(
        LOCK_EXCEPTIONS_TOTAL,
        "Total number of failed lock write, check and delete calls"
    );
}

/// Count a call; transactions without a group name are not counted
pub fn record_call(tx: &StoreTransaction, op: LockOp) {
    if let Some(group) = tx.group_name() {
        counter!(LOCK_CALLS_TOTAL, "group" => group.to_string(), "op" => op.as_str())
            .increment(1);
    }
}

/// Count a failed call; transactions without a group name are not counted
pub fn record_exception(tx: &StoreTransaction, op: LockOp) {
    if let Some(group) = tx.group_name() {
        counter!(LOCK_EXCEPTIONS_TOTAL, "group" => group.to_string(), "op" => op.as_str())
            .increment(1);
    }
}
