//! Time utilities for the session engine

use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use parking_lot::Mutex;

/// Get current Unix timestamp in milliseconds
pub fn unix_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or(Duration::ZERO)
        .as_millis() as u64
}

/// Simulation slice length (seconds)
pub const MAX_STEP_SECONDS: f64 = 0.1;
/// Catch-up bound per scheduler invocation
pub const MAX_STEPS_PER_TICK: u32 = 1000;
/// Re-check interval while the pause gate is closed
pub const GATED_POLL_MS: f64 = 33.0;
/// Frame interval while stepping (~60 fps)
pub const FRAME_INTERVAL_MS: f64 = 16.0;
/// Outbound damage / position cadence
pub const REPORT_HZ: f64 = 15.0;

/// Interval in ms for a rate given in Hz
pub fn hz_to_ms(hz: f64) -> f64 {
    1000.0 / hz
}

/// Monotonic millisecond clock consumed by the engine.
///
/// Every component takes `now_ms` as a plain argument; this trait is only the
/// source the runner reads it from.
pub trait MonotonicClock: Send + Sync {
    fn now_ms(&self) -> f64;
}

/// Wall clock backed by [`Instant`]
#[derive(Debug, Clone)]
pub struct SystemClock {
    start: Instant,
}

impl SystemClock {
    pub fn new() -> Self {
        Self {
            start: Instant::now(),
        }
    }
}

impl Default for SystemClock {
    fn default() -> Self {
        Self::new()
    }
}

impl MonotonicClock for SystemClock {
    fn now_ms(&self) -> f64 {
        self.start.elapsed().as_secs_f64() * 1000.0
    }
}

/// Hand-driven clock for simulations and tests
#[derive(Debug, Clone, Default)]
pub struct ManualClock {
    now: Arc<Mutex<f64>>,
}

impl ManualClock {
    pub fn new(start_ms: f64) -> Self {
        Self {
            now: Arc::new(Mutex::new(start_ms)),
        }
    }

    pub fn advance(&self, ms: f64) {
        *self.now.lock() += ms.max(0.0);
    }

    pub fn set(&self, ms: f64) {
        *self.now.lock() = ms;
    }
}

impl MonotonicClock for ManualClock {
    fn now_ms(&self) -> f64 {
        *self.now.lock()
    }
}

/// Fixed-cadence deadline tracker
#[derive(Debug, Clone)]
pub struct Cadence {
    interval_ms: f64,
    next_due_ms: Option<f64>,
}

impl Cadence {
    pub fn new(interval_ms: f64) -> Self {
        Self {
            interval_ms,
            next_due_ms: None,
        }
    }

    pub fn from_hz(hz: f64) -> Self {
        Self::new(hz_to_ms(hz))
    }

    pub fn interval_ms(&self) -> f64 {
        self.interval_ms
    }

    /// Returns true (and re-arms) when the deadline has passed.
    /// The first call always fires.
    pub fn poll(&mut self, now_ms: f64) -> bool {
        match self.next_due_ms {
            Some(due) if now_ms < due => false,
            _ => {
                self.next_due_ms = Some(now_ms + self.interval_ms);
                true
            }
        }
    }

    pub fn reset(&mut self) {
        self.next_due_ms = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cadence_fires_once_per_interval() {
        let mut cadence = Cadence::new(100.0);
        assert!(cadence.poll(0.0));
        assert!(!cadence.poll(50.0));
        assert!(!cadence.poll(99.9));
        assert!(cadence.poll(100.0));
        assert!(!cadence.poll(150.0));
    }

    #[test]
    fn manual_clock_is_shared_between_clones() {
        let clock = ManualClock::new(10.0);
        let other = clock.clone();
        clock.advance(5.0);
        assert_eq!(other.now_ms(), 15.0);
        clock.advance(-3.0);
        assert_eq!(other.now_ms(), 15.0);
    }
}
