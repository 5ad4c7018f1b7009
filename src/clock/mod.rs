use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

/// Source of monotonic microsecond timestamps.
///
/// The profiler only ever computes differences between two readings, so
/// the origin is arbitrary. Implementations must be monotonic within one
/// process.
pub trait Clock: Send + Sync {
    /// Return the current time in microseconds since an arbitrary origin.
    fn now_micros(&self) -> u64;
}

/// Production clock backed by `Instant`.
pub struct MonotonicClock {
    origin: Instant,
}

impl MonotonicClock {
    pub fn new() -> Self {
        Self {
            origin: Instant::now(),
        }
    }
}

impl Default for MonotonicClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for MonotonicClock {
    fn now_micros(&self) -> u64 {
        self.origin.elapsed().as_micros() as u64
    }
}

/// Manually driven clock for tests and trace replay.
pub struct ManualClock {
    now: AtomicU64,
}

impl ManualClock {
    pub fn new() -> Self {
        Self {
            now: AtomicU64::new(0),
        }
    }

    /// Set the absolute time in microseconds.
    pub fn set(&self, micros: u64) {
        self.now.store(micros, Ordering::Relaxed);
    }

    /// Advance the clock by the given number of microseconds.
    pub fn advance(&self, micros: u64) {
        self.now.fetch_add(micros, Ordering::Relaxed);
    }
}

impl Default for ManualClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for ManualClock {
    fn now_micros(&self) -> u64 {
        self.now.load(Ordering::Relaxed)
    }
}
