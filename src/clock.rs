//! Monotonic clock capability.
//!
//! The engine never reads wall-clock time directly; everything flows through
//! a [`MonotonicClock`] so deadline math is deterministic under test.

use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;

/// A monotonically non-decreasing nanosecond clock.
pub trait MonotonicClock: Send + Sync {
    /// Returns the current monotonic time in nanoseconds.
    ///
    /// The epoch is arbitrary but fixed for the life of the clock.
    fn now(&self) -> i64;
}

/// The default clock, backed by tokio's time source.
///
/// Under `tokio::time::pause()` (or `#[tokio::test(start_paused = true)]`)
/// this clock advances with virtual time, which makes deadline-driven tests
/// deterministic.
#[derive(Debug)]
pub struct TokioClock {
    epoch: tokio::time::Instant,
}

impl TokioClock {
    /// Creates a clock whose epoch is "now".
    ///
    /// Must be called within a tokio runtime.
    pub fn new() -> Self {
        Self {
            epoch: tokio::time::Instant::now(),
        }
    }
}

impl Default for TokioClock {
    fn default() -> Self {
        Self::new()
    }
}

impl MonotonicClock for TokioClock {
    fn now(&self) -> i64 {
        tokio::time::Instant::now()
            .duration_since(self.epoch)
            .as_nanos() as i64
    }
}

/// A manually advanced clock for tests.
///
/// # Example
///
/// ```
/// use capture_mix::{ManualClock, MonotonicClock};
///
/// let clock = ManualClock::new();
/// clock.advance_nanos(5_000);
/// assert_eq!(clock.now(), 5_000);
/// ```
#[derive(Debug, Default)]
pub struct ManualClock {
    nanos: AtomicI64,
}

impl ManualClock {
    /// Creates a clock at time zero.
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a shared clock at time zero.
    pub fn shared() -> Arc<Self> {
        Arc::new(Self::new())
    }

    /// Advances the clock by the given number of nanoseconds.
    pub fn advance_nanos(&self, nanos: i64) {
        self.nanos.fetch_add(nanos, Ordering::SeqCst);
    }

    /// Sets the clock to an absolute time.
    pub fn set_nanos(&self, nanos: i64) {
        self.nanos.store(nanos, Ordering::SeqCst);
    }
}

impl MonotonicClock for ManualClock {
    fn now(&self) -> i64 {
        self.nanos.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_manual_clock_advances() {
        let clock = ManualClock::new();
        assert_eq!(clock.now(), 0);
        clock.advance_nanos(1_000_000);
        clock.advance_nanos(500);
        assert_eq!(clock.now(), 1_000_500);
        clock.set_nanos(42);
        assert_eq!(clock.now(), 42);
    }
}
