//! Bounded fixed-step catch-up scheduling behind the pause gate

use tracing::{debug, info};

use crate::config::EngineConfig;

/// Slices shorter than this are rounding noise
const SLICE_EPSILON_SECS: f64 = 1e-9;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SchedulerState {
    /// Nothing to do this tick
    Idle,
    /// Pause gate closed; polling
    Gated,
    Stepping,
}

/// What the caller should run for one scheduler invocation
#[derive(Debug, Clone, PartialEq)]
pub struct TickPlan {
    pub state: SchedulerState,
    /// Slice lengths in seconds, each at most the configured step
    pub steps: Vec<f64>,
    /// Wall time beyond the catch-up cap, discarded
    pub dropped_secs: f64,
    /// When to invoke the scheduler again
    pub next_delay_ms: f64,
    /// The gate opened since the previous tick
    pub resumed: bool,
}

impl TickPlan {
    pub fn simulated_secs(&self) -> f64 {
        self.steps.iter().sum()
    }
}

/// Turns wall-clock deltas into bounded fixed-size simulation slices.
///
/// While gated it does not block: it asks to be called again after
/// `gated_poll_ms`, which bounds resume latency to one poll interval at the
/// cost of a cheap wake-up per interval.
#[derive(Debug, Clone)]
pub struct SimulationScheduler {
    last_tick_ms: Option<f64>,
    state: SchedulerState,
    freeze_until_ms: f64,
    max_step_secs: f64,
    max_steps: u32,
    gated_poll_ms: f64,
    frame_interval_ms: f64,
    config: EngineConfig,
}

impl SimulationScheduler {
    pub fn new(config: &EngineConfig) -> Self {
        Self {
            last_tick_ms: None,
            state: SchedulerState::Idle,
            freeze_until_ms: f64::NEG_INFINITY,
            max_step_secs: config.max_step_seconds,
            max_steps: config.max_steps_per_tick,
            gated_poll_ms: config.gated_poll_ms,
            frame_interval_ms: config.frame_interval_ms,
            config: config.clone(),
        }
    }

    pub fn state(&self) -> SchedulerState {
        self.state
    }

    /// Plan the work for a tick at `now_ms`
    pub fn tick(&mut self, now_ms: f64, gated: bool, party_size: usize) -> TickPlan {
        let wall_delta_ms = match self.last_tick_ms {
            Some(last) if now_ms > last => now_ms - last,
            _ => 0.0,
        };
        self.last_tick_ms = Some(now_ms);

        if gated {
            if self.state != SchedulerState::Gated {
                debug!("Scheduler gated");
            }
            self.state = SchedulerState::Gated;
            return TickPlan {
                state: SchedulerState::Gated,
                steps: Vec::new(),
                dropped_secs: 0.0,
                next_delay_ms: self.gated_poll_ms,
                resumed: false,
            };
        }

        let resumed = self.state == SchedulerState::Gated;
        if resumed {
            let freeze_ms = self.config.freeze_ms_for_party(party_size);
            self.freeze_until_ms = now_ms + freeze_ms;
            info!(party_size, freeze_ms, "Resuming simulation");
        }

        let (steps, dropped_secs) = self.slice(wall_delta_ms / 1000.0);
        if dropped_secs > 0.0 {
            debug!(dropped_secs, steps = steps.len(), "Catch-up capped");
        }

        self.state = if steps.is_empty() {
            SchedulerState::Idle
        } else {
            SchedulerState::Stepping
        };

        TickPlan {
            state: self.state,
            steps,
            dropped_secs,
            next_delay_ms: self.frame_interval_ms,
            resumed,
        }
    }

    /// Non-player entities hold still until the post-resume freeze window ends
    pub fn is_frozen(&self, now_ms: f64) -> bool {
        now_ms < self.freeze_until_ms
    }

    pub fn freeze_remaining_ms(&self, now_ms: f64) -> f64 {
        (self.freeze_until_ms - now_ms).max(0.0)
    }

    /// Forget the last tick time so the next tick starts from "now"
    pub fn reset(&mut self) {
        self.last_tick_ms = None;
        self.state = SchedulerState::Idle;
        self.freeze_until_ms = f64::NEG_INFINITY;
    }

    fn slice(&self, delta_secs: f64) -> (Vec<f64>, f64) {
        let mut remaining = delta_secs;
        let mut steps = Vec::new();
        while remaining > SLICE_EPSILON_SECS && steps.len() < self.max_steps as usize {
            let slice = remaining.min(self.max_step_secs);
            steps.push(slice);
            remaining -= slice;
        }
        let dropped = if remaining > SLICE_EPSILON_SECS {
            remaining
        } else {
            0.0
        };
        (steps, dropped)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn scheduler() -> SimulationScheduler {
        SimulationScheduler::new(&EngineConfig::default())
    }

    #[test]
    fn delta_is_split_into_bounded_slices() {
        let mut s = scheduler();
        assert_eq!(s.tick(1_000.0, false, 1).state, SchedulerState::Idle);

        let plan = s.tick(1_250.0, false, 1);
        assert_eq!(plan.state, SchedulerState::Stepping);
        assert_eq!(plan.steps.len(), 3);
        assert!(plan.steps.iter().all(|dt| *dt <= 0.1 + 1e-12));
        assert!((plan.simulated_secs() - 0.25).abs() < 1e-9);
        assert_eq!(plan.dropped_secs, 0.0);
    }

    #[test]
    fn long_suspension_is_capped_and_not_deferred() {
        let mut s = scheduler();
        s.tick(0.0, false, 1);
        let plan = s.tick(250_000.0, false, 1);
        assert_eq!(plan.steps.len(), 1000);
        assert!((plan.dropped_secs - 150.0).abs() < 1e-6);

        let next = s.tick(250_016.0, false, 1);
        assert_eq!(next.steps.len(), 1);
        assert!((next.simulated_secs() - 0.016).abs() < 1e-9);
    }

    #[test]
    fn gated_ticks_poll_without_stepping_or_accumulating() {
        let mut s = scheduler();
        s.tick(0.0, false, 2);
        let gated = s.tick(500.0, true, 2);
        assert_eq!(gated.state, SchedulerState::Gated);
        assert!(gated.steps.is_empty());
        assert_eq!(gated.next_delay_ms, 33.0);
        s.tick(10_000.0, true, 2);

        let resumed = s.tick(10_020.0, false, 2);
        assert!(resumed.resumed);
        assert!((resumed.simulated_secs() - 0.02).abs() < 1e-9);
    }

    #[test]
    fn resume_freeze_scales_with_party() {
        let mut s = scheduler();
        s.tick(0.0, true, 3);
        s.tick(100.0, false, 3);
        assert!(s.is_frozen(100.0));
        assert!(s.is_frozen(849.0));
        assert!(!s.is_frozen(850.0));

        let mut solo = scheduler();
        solo.tick(0.0, true, 1);
        solo.tick(100.0, false, 1);
        assert!(!solo.is_frozen(100.0));
    }

    #[test]
    fn backwards_clock_counts_as_no_time() {
        let mut s = scheduler();
        s.tick(1_000.0, false, 1);
        let plan = s.tick(900.0, false, 1);
        assert_eq!(plan.state, SchedulerState::Idle);
        assert!(plan.steps.is_empty());
    }
}
