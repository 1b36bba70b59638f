//! Timestamp sources
//!
//! All protocol code reads time through a [`TimestampProvider`] so that
//! expiration and wait-period logic can run against a simulated clock.

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, TimeDelta, Utc};

/// Point in time with nanosecond resolution
pub type Timestamp = DateTime<Utc>;

/// Source of the current time and of timed sleeps
#[async_trait]
pub trait TimestampProvider: Send + Sync {
    /// Current time
    fn now(&self) -> Timestamp;

    /// Sleep until the current time is strictly after `future`, then return
    /// the current time
    async fn sleep_past(&self, future: Timestamp) -> Timestamp;

    /// Sleep for the given duration
    async fn sleep_for(&self, duration: Duration);
}

/// Wall-clock provider backed by `tokio::time`
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemTimestampProvider;

impl SystemTimestampProvider {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl TimestampProvider for SystemTimestampProvider {
    fn now(&self) -> Timestamp {
        Utc::now()
    }

    async fn sleep_past(&self, future: Timestamp) -> Timestamp {
        loop {
            let now = self.now();
            if now > future {
                return now;
            }
            // Wall clock may be coarser than the requested instant; always sleep
            // at least one millisecond so the loop makes progress
            let remaining = (future - now)
                .to_std()
                .unwrap_or(Duration::ZERO)
                .max(Duration::from_millis(1));
            tokio::time::sleep(remaining).await;
        }
    }

    async fn sleep_for(&self, duration: Duration) {
        tokio::time::sleep(duration).await;
    }
}

#[cfg(any(test, feature = "testing"))]
pub use fake::FakeTimestampProvider;

#[cfg(any(test, feature = "testing"))]
mod fake {
    use super::*;
    use parking_lot::Mutex;

    /// Manually driven clock
    ///
    /// Time only moves through [`advance`](Self::advance), [`set`](Self::set)
    /// or a sleep, and sleeps return immediately after moving the clock.
    /// Every `sleep_past` target is recorded for later assertions.
    #[derive(Debug)]
    pub struct FakeTimestampProvider {
        now: Mutex<Timestamp>,
        sleeps: Mutex<Vec<Timestamp>>,
    }

    impl FakeTimestampProvider {
        pub fn new(start: Timestamp) -> Self {
            Self {
                now: Mutex::new(start),
                sleeps: Mutex::new(Vec::new()),
            }
        }

        /// Clock starting at the Unix epoch
        pub fn at_epoch() -> Self {
            Self::new(Timestamp::UNIX_EPOCH)
        }

        pub fn advance(&self, duration: Duration) -> Timestamp {
            let delta = TimeDelta::from_std(duration).expect("duration fits in a TimeDelta");
            let mut now = self.now.lock();
            *now += delta;
            *now
        }

        pub fn set(&self, to: Timestamp) {
            *self.now.lock() = to;
        }

        /// Targets passed to `sleep_past`, in call order
        pub fn sleeps(&self) -> Vec<Timestamp> {
            self.sleeps.lock().clone()
        }
    }

    #[async_trait]
    impl TimestampProvider for FakeTimestampProvider {
        fn now(&self) -> Timestamp {
            *self.now.lock()
        }

        async fn sleep_past(&self, future: Timestamp) -> Timestamp {
            self.sleeps.lock().push(future);
            let mut now = self.now.lock();
            if *now <= future {
                *now = future + TimeDelta::nanoseconds(1);
            }
            *now
        }

        async fn sleep_for(&self, duration: Duration) {
            self.advance(duration);
        }
    }
}
