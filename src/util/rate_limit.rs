//! Rate limiting utilities

use governor::{
    clock::{Clock, FakeRelativeClock},
    middleware::NoOpMiddleware,
    state::{InMemoryState, NotKeyed},
    Quota, RateLimiter,
};
use std::time::Duration;

/// Rate limiter driven by the engine's injected clock instead of the wall clock
pub type Limiter =
    RateLimiter<NotKeyed, InMemoryState, FakeRelativeClock, NoOpMiddleware<<FakeRelativeClock as Clock>::Instant>>;

/// Minimum spacing between forced resumes issued by the self-echo guard
pub const FORCED_RESUME_INTERVAL_MS: u64 = 750;

/// A single-permit limiter that follows caller-supplied timestamps.
///
/// The engine never reads the wall clock itself, so the governor clock is
/// advanced by the delta between successive `check_at` calls.
pub struct SteppedLimiter {
    limiter: Limiter,
    clock: FakeRelativeClock,
    last_ms: Option<f64>,
}

impl SteppedLimiter {
    /// One permit per `interval_ms`
    pub fn with_interval_ms(interval_ms: u64) -> Self {
        let period = Duration::from_millis(interval_ms.max(1));
        let quota = Quota::with_period(period).unwrap_or_else(|| Quota::per_second(nonzero_one()));
        let clock = FakeRelativeClock::default();
        let limiter = RateLimiter::direct_with_clock(quota, &clock);
        Self {
            limiter,
            clock,
            last_ms: None,
        }
    }

    /// Check if an action is allowed at `now_ms` (returns true if allowed)
    pub fn check_at(&mut self, now_ms: f64) -> bool {
        if let Some(last) = self.last_ms {
            let delta = now_ms - last;
            if delta > 0.0 {
                self.clock
                    .advance(Duration::from_micros((delta * 1000.0).round() as u64));
                self.last_ms = Some(now_ms);
            }
        } else {
            self.last_ms = Some(now_ms);
        }
        self.limiter.check().is_ok()
    }
}

fn nonzero_one() -> std::num::NonZeroU32 {
    std::num::NonZeroU32::MIN
}
