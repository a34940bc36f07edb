// Time sources for ingest, extraction and the max-duration watchdog

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};

use super::frame::Timestamp;

/// Source of "now" for the recording engine
pub trait Clock: Send + Sync {
    fn now(&self) -> Timestamp;
}

/// Real clock: monotonic offset from process-local origin, wall time from the system
pub struct SystemClock {
    origin: Instant,
}

impl SystemClock {
    pub fn new() -> Self {
        Self {
            origin: Instant::now(),
        }
    }
}

impl Default for SystemClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for SystemClock {
    fn now(&self) -> Timestamp {
        Timestamp::new(self.origin.elapsed(), Utc::now())
    }
}

/// Manually advanced clock.
///
/// Used to replay recorded material at its original timing and to drive
/// time-dependent behaviour deterministically.
pub struct ManualClock {
    base_wall: DateTime<Utc>,
    offset_ns: AtomicU64,
}

impl ManualClock {
    pub fn new(base_wall: DateTime<Utc>) -> Self {
        Self {
            base_wall,
            offset_ns: AtomicU64::new(0),
        }
    }

    pub fn advance(&self, delta: Duration) {
        self.offset_ns
            .fetch_add(delta.as_nanos() as u64, Ordering::SeqCst);
    }

    pub fn set(&self, offset: Duration) {
        self.offset_ns
            .store(offset.as_nanos() as u64, Ordering::SeqCst);
    }

    /// Timestamp at a given offset from this clock's origin, without moving the clock
    pub fn at(&self, offset: Duration) -> Timestamp {
        let wall = self.base_wall + chrono::Duration::nanoseconds(offset.as_nanos() as i64);
        Timestamp::new(offset, wall)
    }
}

impl Default for ManualClock {
    fn default() -> Self {
        Self::new(Utc::now())
    }
}

impl Clock for ManualClock {
    fn now(&self) -> Timestamp {
        self.at(Duration::from_nanos(self.offset_ns.load(Ordering::SeqCst)))
    }
}
