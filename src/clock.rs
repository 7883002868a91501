//! Wall Clock
//!
//! Cache timestamps and session access times are unix seconds. Handlers read
//! the time through [`Clock`] so staleness decisions can be exercised with a
//! manual clock.

use std::sync::atomic::{AtomicU64, Ordering};

/// Unix timestamp in seconds
pub type Timestamp = u64;

/// Source of the current time
pub trait Clock: Send + Sync {
    /// Current unix time in seconds
    fn now(&self) -> Timestamp;
}

/// The system wall clock
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> Timestamp {
        chrono::Utc::now().timestamp().max(0) as Timestamp
    }
}

/// A clock that only moves when told to
#[derive(Debug, Default)]
pub struct ManualClock {
    now: AtomicU64,
}

impl ManualClock {
    pub fn new(start: Timestamp) -> Self {
        Self { now: AtomicU64::new(start) }
    }

    pub fn set(&self, now: Timestamp) {
        self.now.store(now, Ordering::SeqCst);
    }

    pub fn advance(&self, secs: u64) {
        self.now.fetch_add(secs, Ordering::SeqCst);
    }
}

impl Clock for ManualClock {
    fn now(&self) -> Timestamp {
        self.now.load(Ordering::SeqCst)
    }
}

/// Age of a timestamp relative to `now`, saturating at zero for timestamps
/// in the future.
pub fn age(now: Timestamp, then: Timestamp) -> u64 {
    now.saturating_sub(then)
}
