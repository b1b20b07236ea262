//! Monotonic clock source with skew mitigation
//!
//! Every slot transition must strictly advance `updated_time_epoch_ms`, and
//! staleness decisions must not fire early because one node's clock runs
//! ahead of another's. `BoundedClock` never goes backward and carries a skew
//! margin that is subtracted from every cutoff.

use chrono::Utc;
use std::sync::atomic::{AtomicI64, Ordering};
use std::time::Duration;

/// Source of epoch-millisecond timestamps.
pub trait Clock: Send + Sync {
    /// Current time in epoch milliseconds.
    fn now_millis(&self) -> i64;

    /// Maximum tolerated clock skew between processes.
    fn max_skew(&self) -> Duration {
        Duration::ZERO
    }

    /// Timestamp before which a record last touched is considered older than
    /// `window`, shifted earlier by the skew margin.
    fn cutoff_millis(&self, window: Duration) -> i64 {
        self.now_millis() - window.as_millis() as i64 - self.max_skew().as_millis() as i64
    }
}

/// A clock source that guarantees monotonically increasing timestamps
/// and provides skew-aware cutoffs.
pub struct BoundedClock {
    /// Largest timestamp handed out so far
    high_water_ms: AtomicI64,
    max_skew_ms: i64,
}

impl BoundedClock {
    /// Create a new BoundedClock with the given maximum skew tolerance.
    pub fn new(max_skew: Duration) -> Self {
        Self {
            high_water_ms: AtomicI64::new(0),
            max_skew_ms: max_skew.as_millis() as i64,
        }
    }
}

impl Clock for BoundedClock {
    /// Returns a monotonically increasing millisecond timestamp.
    ///
    /// If the wall clock has gone backward (e.g. NTP adjustment),
    /// returns the previous high-water mark + 1ms instead.
    fn now_millis(&self) -> i64 {
        let wall = Utc::now().timestamp_millis();
        loop {
            let prev = self.high_water_ms.load(Ordering::Acquire);
            let ts = wall.max(prev + 1);
            match self.high_water_ms.compare_exchange_weak(
                prev,
                ts,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return ts,
                Err(_) => continue,
            }
        }
    }

    fn max_skew(&self) -> Duration {
        Duration::from_millis(self.max_skew_ms as u64)
    }
}

impl Default for BoundedClock {
    fn default() -> Self {
        Self::new(Duration::from_secs(30))
    }
}

/// Manually advanced clock for deterministic tests and simulations.
#[derive(Debug)]
pub struct ManualClock {
    now_ms: AtomicI64,
}

impl ManualClock {
    pub fn new(start_ms: i64) -> Self {
        Self {
            now_ms: AtomicI64::new(start_ms),
        }
    }

    pub fn set(&self, now_ms: i64) {
        self.now_ms.store(now_ms, Ordering::Release);
    }

    pub fn advance(&self, by: Duration) {
        self.now_ms
            .fetch_add(by.as_millis() as i64, Ordering::AcqRel);
    }
}

impl Clock for ManualClock {
    fn now_millis(&self) -> i64 {
        self.now_ms.load(Ordering::Acquire)
    }
}
