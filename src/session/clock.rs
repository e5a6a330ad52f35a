//! Authority clock offset estimation and elapsed match time

use tracing::{debug, trace};

/// Current estimate of `authority_now - local_now`
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct ClockEstimate {
    pub offset_ms: f64,
    /// False until the first sample arrives
    pub smoothed: bool,
}

/// EWMA estimator of the offset between local and authority clocks
#[derive(Debug, Clone)]
pub struct ClockSynchronizer {
    estimate: ClockEstimate,
    alpha: f64,
    samples: u64,
}

impl ClockSynchronizer {
    pub fn new(alpha: f64) -> Self {
        Self {
            estimate: ClockEstimate::default(),
            alpha: alpha.clamp(0.0, 1.0),
            samples: 0,
        }
    }

    pub fn estimate(&self) -> ClockEstimate {
        self.estimate
    }

    pub fn samples(&self) -> u64 {
        self.samples
    }

    /// Feed one authority reading taken at `local_now_ms`.
    /// The first sample snaps; later samples move the offset by `alpha` of the error.
    pub fn sample(&mut self, server_time_ms: f64, local_now_ms: f64) -> f64 {
        let candidate = server_time_ms - local_now_ms;
        if !candidate.is_finite() {
            debug!(server_time_ms, local_now_ms, "Ignoring non-finite clock sample");
            return self.estimate.offset_ms;
        }

        if self.estimate.smoothed {
            self.estimate.offset_ms += self.alpha * (candidate - self.estimate.offset_ms);
        } else {
            self.estimate = ClockEstimate {
                offset_ms: candidate,
                smoothed: true,
            };
        }
        self.samples += 1;
        trace!(candidate, offset_ms = self.estimate.offset_ms, "Clock sample");
        self.estimate.offset_ms
    }

    /// Authority time now, or `None` before the first sample
    pub fn authoritative_now(&self, local_now_ms: f64) -> Option<f64> {
        self.estimate
            .smoothed
            .then(|| local_now_ms + self.estimate.offset_ms)
    }

    pub fn reset(&mut self) {
        self.estimate = ClockEstimate::default();
        self.samples = 0;
    }
}

/// Elapsed match time.
///
/// Prefers `authority_now - origin`; falls back to summed local steps until
/// both an origin and a clock sample exist. The reported value never moves
/// backwards while an origin is in force.
#[derive(Debug, Clone, Default)]
pub struct MatchClock {
    origin_server_ms: Option<f64>,
    local_elapsed_secs: f64,
    reported_secs: f64,
}

impl MatchClock {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn origin(&self) -> Option<f64> {
        self.origin_server_ms
    }

    /// Set the match origin. Returns true when it replaces a different origin.
    pub fn set_origin(&mut self, server_start_ms: f64) -> bool {
        if !server_start_ms.is_finite() {
            return false;
        }
        let replaced = matches!(self.origin_server_ms, Some(old) if old != server_start_ms);
        if replaced {
            self.local_elapsed_secs = 0.0;
            self.reported_secs = 0.0;
        }
        self.origin_server_ms = Some(server_start_ms);
        replaced
    }

    /// Account one locally simulated slice
    pub fn advance_local(&mut self, dt_secs: f64) {
        if dt_secs.is_finite() && dt_secs > 0.0 {
            self.local_elapsed_secs += dt_secs;
        }
    }

    pub fn elapsed_secs(&mut self, sync: &ClockSynchronizer, local_now_ms: f64) -> f64 {
        let candidate = match (self.origin_server_ms, sync.authoritative_now(local_now_ms)) {
            (Some(origin), Some(now)) => ((now - origin) / 1000.0).max(0.0),
            _ => self.local_elapsed_secs,
        };
        self.reported_secs = self.reported_secs.max(candidate);
        self.local_elapsed_secs = self.reported_secs;
        self.reported_secs
    }

    pub fn reset(&mut self) {
        *self = Self::default();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn first_sample_snaps_then_smooths() {
        let mut sync = ClockSynchronizer::new(0.08);
        assert_eq!(sync.authoritative_now(10.0), None);
        assert_eq!(sync.sample(1_100.0, 1_000.0), 100.0);
        assert_eq!(sync.authoritative_now(2_000.0), Some(2_100.0));
        let after = sync.sample(1_140.0, 1_000.0);
        assert!((after - 103.2).abs() < 1e-9);
    }

    #[test]
    fn outlier_moves_offset_only_by_alpha() {
        let mut sync = ClockSynchronizer::new(0.08);
        let mut previous = sync.sample(100.0, 0.0);
        for candidate in [140.0, 90.0] {
            let next = sync.sample(candidate, 0.0);
            let step = (next - previous).abs();
            assert!(step <= 0.08 * (candidate - previous).abs() + 1e-9);
            previous = next;
        }
        // the 90ms outlier moved the estimate by roughly a millisecond
        assert!((previous - 102.144).abs() < 1e-3);

        let truth = 120.0;
        let initial_error = (previous - truth).abs();
        let mut last_error = initial_error;
        for _ in 0..10 {
            let error = (sync.sample(truth, 0.0) - truth).abs();
            assert!(error < last_error);
            last_error = error;
        }
        assert!(last_error < initial_error * 0.5);
    }

    #[test]
    fn non_finite_samples_are_ignored() {
        let mut sync = ClockSynchronizer::new(0.08);
        sync.sample(f64::NAN, 0.0);
        assert!(!sync.estimate().smoothed);
        assert_eq!(sync.samples(), 0);
    }

    #[test]
    fn elapsed_uses_local_sum_until_authority_is_known() {
        let sync = ClockSynchronizer::new(0.08);
        let mut clock = MatchClock::new();
        clock.advance_local(0.1);
        clock.advance_local(0.1);
        assert!((clock.elapsed_secs(&sync, 0.0) - 0.2).abs() < 1e-9);
    }

    #[test]
    fn suspended_client_snaps_to_authority_time() {
        let mut sync = ClockSynchronizer::new(0.08);
        let mut clock = MatchClock::new();
        clock.set_origin(10_000.0);
        sync.sample(15_000.0, 0.0);
        clock.advance_local(0.1);
        // local clock jumped a minute while no steps ran
        assert!((clock.elapsed_secs(&sync, 60_000.0) - 65.0).abs() < 1e-9);
    }

    #[test]
    fn switching_to_authority_never_goes_backwards() {
        let mut sync = ClockSynchronizer::new(0.08);
        let mut clock = MatchClock::new();
        clock.set_origin(0.0);
        for _ in 0..50 {
            clock.advance_local(0.1);
        }
        let local = clock.elapsed_secs(&sync, 0.0);
        assert!((local - 5.0).abs() < 1e-9);

        // authority says only 3s have elapsed
        sync.sample(3_000.0, 0.0);
        assert!((clock.elapsed_secs(&sync, 0.0) - 5.0).abs() < 1e-9);
        assert!((clock.elapsed_secs(&sync, 2_500.0) - 5.5).abs() < 1e-9);
    }

    #[test]
    fn new_origin_restarts_elapsed_time() {
        let sync = ClockSynchronizer::new(0.08);
        let mut clock = MatchClock::new();
        assert!(!clock.set_origin(1_000.0));
        assert!(!clock.set_origin(1_000.0));
        clock.advance_local(3.0);
        assert!(clock.set_origin(9_000.0));
        assert_eq!(clock.elapsed_secs(&sync, 0.0), 0.0);
    }
}
