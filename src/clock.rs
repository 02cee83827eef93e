//! Clock and timer source.
//!
//! Every time-dependent component (rate limiter windows, readiness polling,
//! retry backoff) reads time and schedules delays through a [`Clock`] so that
//! tests can drive time explicitly.

use futures_util::future::BoxFuture;
use std::fmt::Debug;
use std::sync::Mutex;
use std::time::Duration;
use tokio::time::Instant;

// ============================================================================
// Clock trait
// ============================================================================

/// Monotonic time plus schedule-after-delay.
pub trait Clock: Send + Sync + Debug {
    /// Current monotonic instant.
    fn now(&self) -> Instant;

    /// A future that completes after `duration`.
    fn sleep(&self, duration: Duration) -> BoxFuture<'static, ()>;
}

/// Clock backed by `tokio::time`.
///
/// Honors tokio's paused test time, so `#[tokio::test(start_paused = true)]`
/// drives it deterministically.
#[derive(Debug, Clone, Copy, Default)]
pub struct TokioClock;

impl Clock for TokioClock {
    fn now(&self) -> Instant {
        Instant::now()
    }

    fn sleep(&self, duration: Duration) -> BoxFuture<'static, ()> {
        Box::pin(tokio::time::sleep(duration))
    }
}

/// Roughly thirty years; stands in for "never" when a deadline overflows.
const FAR_FUTURE: Duration = Duration::from_secs(86_400 * 365 * 30);

/// `now + duration`, clamped to a far-future instant instead of overflowing.
///
/// Durations come from callers and config files, so `Duration::MAX` or a
/// policy measured in billions of years must not panic.
#[must_use]
pub fn deadline_after(now: Instant, duration: Duration) -> Instant {
    now.checked_add(duration)
        .or_else(|| now.checked_add(FAR_FUTURE))
        .unwrap_or(now)
}

// ============================================================================
// Manual clock
// ============================================================================

/// Explicitly advanced clock for tests and simulations.
///
/// `now()` is a fixed origin plus an offset that only moves when
/// [`ManualClock::advance`] is called or a `sleep` is scheduled. Sleeping
/// advances the offset and completes immediately, so retry and readiness
/// loops run without real waiting while still observing elapsed time.
#[derive(Debug)]
pub struct ManualClock {
    origin: Instant,
    offset: Mutex<Duration>,
}

impl ManualClock {
    /// Create a clock whose origin is the current tokio instant.
    #[must_use]
    pub fn new() -> Self {
        Self {
            origin: Instant::now(),
            offset: Mutex::new(Duration::ZERO),
        }
    }

    /// Move time forward by `by`.
    pub fn advance(&self, by: Duration) {
        let mut offset = self.offset.lock().unwrap_or_else(|p| p.into_inner());
        *offset += by;
    }

    /// Total time advanced since construction.
    #[must_use]
    pub fn elapsed(&self) -> Duration {
        *self.offset.lock().unwrap_or_else(|p| p.into_inner())
    }

}

impl Default for ManualClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for ManualClock {
    fn now(&self) -> Instant {
        deadline_after(self.origin, self.elapsed())
    }

    fn sleep(&self, duration: Duration) -> BoxFuture<'static, ()> {
        self.advance(duration);
        Box::pin(tokio::task::yield_now())
    }
}
