//! Wall-clock abstraction
//!
//! Queue leases, proxy TTLs and fingerprint discovery times are all
//! millisecond timestamps. Components read time through [`Clock`] so tests
//! can move it explicitly instead of sleeping.

use std::sync::{PoisonError, RwLock};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

pub trait Clock: Send + Sync {
    fn now(&self) -> SystemTime;

    /// Milliseconds since the Unix epoch. Times before the epoch read as 0.
    fn now_ms(&self) -> i64 {
        self.now()
            .duration_since(UNIX_EPOCH)
            .map(|elapsed| elapsed.as_millis() as i64)
            .unwrap_or(0)
    }
}

#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> SystemTime {
        SystemTime::now()
    }
}

/// Manually driven clock for deterministic lease and TTL tests
#[derive(Debug)]
pub struct MockClock {
    now: RwLock<SystemTime>,
}

impl Clock for MockClock {
    fn now(&self) -> SystemTime {
        *self.now.read().unwrap_or_else(PoisonError::into_inner)
    }
}

impl MockClock {
    #[must_use]
    pub const fn with_time(time: SystemTime) -> Self {
        Self {
            now: RwLock::new(time),
        }
    }

    /// Clock pinned to `ms` milliseconds after the epoch
    #[must_use]
    pub fn at_millis(ms: u64) -> Self {
        Self::with_time(UNIX_EPOCH + Duration::from_millis(ms))
    }

    #[must_use]
    pub fn new() -> Self {
        Self::with_time(SystemTime::now())
    }

    pub fn advance(&self, duration: Duration) {
        let mut now = self.now.write().unwrap_or_else(PoisonError::into_inner);
        *now += duration;
    }

    pub fn set_time(&self, time: SystemTime) {
        *self.now.write().unwrap_or_else(PoisonError::into_inner) = time;
    }
}

impl Default for MockClock {
    fn default() -> Self {
        Self::new()
    }
}
