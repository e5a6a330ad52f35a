//! Configuration module - environment variable parsing

use std::env;
use std::str::FromStr;

use crate::util::rate_limit::FORCED_RESUME_INTERVAL_MS;
use crate::util::time::{FRAME_INTERVAL_MS, GATED_POLL_MS, MAX_STEPS_PER_TICK, MAX_STEP_SECONDS, REPORT_HZ};

/// Application configuration loaded from environment variables
#[derive(Clone, Debug)]
pub struct Config {
    /// Log level (trace, debug, info, warn, error)
    pub log_level: String,
    /// Number of peers the demo binary spawns
    pub demo_peers: usize,
    /// How long the demo runs before shutting down (0 = until Ctrl+C)
    pub demo_duration_secs: u64,
    /// Engine tuning
    pub engine: EngineConfig,
}

impl Config {
    /// Load configuration from environment variables
    pub fn from_env() -> Result<Self, ConfigError> {
        let demo_peers = parse_or("SESSION_PEERS", 3usize)?;
        if demo_peers == 0 {
            return Err(ConfigError::Invalid("SESSION_PEERS"));
        }

        Ok(Self {
            log_level: env::var("LOG_LEVEL").unwrap_or_else(|_| "info".to_string()),
            demo_peers,
            demo_duration_secs: parse_or("DEMO_DURATION_SECS", 20u64)?,
            engine: EngineConfig::from_env()?,
        })
    }
}

/// Tuning constants for the coordination engine
#[derive(Clone, Debug, PartialEq)]
pub struct EngineConfig {
    /// Paused peers without a refresh for longer than this are dropped
    pub pause_stale_ms: f64,
    /// Interval between heartbeats of an active local pause
    pub pause_heartbeat_ms: f64,
    /// Minimum spacing between forced resumes from the self-echo guard
    pub forced_resume_interval_ms: u64,
    /// Scheduler re-check interval while gated
    pub gated_poll_ms: f64,
    /// Scheduler frame interval while stepping
    pub frame_interval_ms: f64,
    /// Longest simulation slice (seconds)
    pub max_step_seconds: f64,
    /// Catch-up cap per scheduler invocation
    pub max_steps_per_tick: u32,
    /// Post-resume freeze window per party size (index = peer count, last entry covers the rest)
    pub resume_freeze_ms: Vec<f64>,
    /// EWMA weight for clock samples
    pub clock_alpha: f64,
    /// Damage flush rate
    pub damage_flush_hz: f64,
    /// Stuns are reported this long before they would expire locally
    pub stun_safety_margin_ms: f64,
    /// Floor for the adaptive stun flush delay
    pub min_flush_interval_ms: f64,
    /// Position report rate
    pub pos_report_hz: f64,
    /// Capacity of the processed death-event set
    pub death_memory: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            pause_stale_ms: 20_000.0,
            pause_heartbeat_ms: 5_000.0,
            forced_resume_interval_ms: FORCED_RESUME_INTERVAL_MS,
            gated_poll_ms: GATED_POLL_MS,
            frame_interval_ms: FRAME_INTERVAL_MS,
            max_step_seconds: MAX_STEP_SECONDS,
            max_steps_per_tick: MAX_STEPS_PER_TICK,
            resume_freeze_ms: vec![0.0, 0.0, 500.0, 750.0, 1000.0, 1500.0, 2000.0],
            clock_alpha: 0.08,
            damage_flush_hz: REPORT_HZ,
            stun_safety_margin_ms: 25.0,
            min_flush_interval_ms: 8.0,
            pos_report_hz: REPORT_HZ,
            death_memory: 256,
        }
    }
}

impl EngineConfig {
    /// Defaults overridden by any `SESSION_*` variables that are set
    pub fn from_env() -> Result<Self, ConfigError> {
        let defaults = Self::default();
        let config = Self {
            pause_stale_ms: parse_or("SESSION_PAUSE_STALE_MS", defaults.pause_stale_ms)?,
            pause_heartbeat_ms: parse_or("SESSION_PAUSE_HEARTBEAT_MS", defaults.pause_heartbeat_ms)?,
            forced_resume_interval_ms: parse_or(
                "SESSION_FORCED_RESUME_INTERVAL_MS",
                defaults.forced_resume_interval_ms,
            )?,
            gated_poll_ms: parse_or("SESSION_GATED_POLL_MS", defaults.gated_poll_ms)?,
            frame_interval_ms: parse_or("SESSION_FRAME_INTERVAL_MS", defaults.frame_interval_ms)?,
            max_steps_per_tick: parse_or("SESSION_MAX_STEPS_PER_TICK", defaults.max_steps_per_tick)?,
            damage_flush_hz: parse_or("SESSION_DAMAGE_FLUSH_HZ", defaults.damage_flush_hz)?,
            pos_report_hz: parse_or("SESSION_POS_REPORT_HZ", defaults.pos_report_hz)?,
            ..defaults
        };
        config.validate()?;
        Ok(config)
    }

    /// Reject values that would stall or spin the scheduler
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !positive(self.pause_stale_ms) {
            return Err(ConfigError::Invalid("SESSION_PAUSE_STALE_MS"));
        }
        if !positive(self.pause_heartbeat_ms) || self.pause_heartbeat_ms >= self.pause_stale_ms {
            return Err(ConfigError::Invalid("SESSION_PAUSE_HEARTBEAT_MS"));
        }
        if !positive(self.gated_poll_ms) {
            return Err(ConfigError::Invalid("SESSION_GATED_POLL_MS"));
        }
        if !positive(self.frame_interval_ms) {
            return Err(ConfigError::Invalid("SESSION_FRAME_INTERVAL_MS"));
        }
        if self.max_steps_per_tick == 0 {
            return Err(ConfigError::Invalid("SESSION_MAX_STEPS_PER_TICK"));
        }
        if !positive(self.damage_flush_hz) {
            return Err(ConfigError::Invalid("SESSION_DAMAGE_FLUSH_HZ"));
        }
        if !positive(self.pos_report_hz) {
            return Err(ConfigError::Invalid("SESSION_POS_REPORT_HZ"));
        }
        Ok(())
    }

    /// Freeze window applied to non-player entities after a resume
    pub fn freeze_ms_for_party(&self, party_size: usize) -> f64 {
        match self.resume_freeze_ms.last() {
            Some(last) => self
                .resume_freeze_ms
                .get(party_size)
                .copied()
                .unwrap_or(*last),
            None => 0.0,
        }
    }
}

/// Finite and strictly positive
fn positive(value: f64) -> bool {
    value.is_finite() && value > 0.0
}

fn parse_or<T: FromStr>(key: &'static str, default: T) -> Result<T, ConfigError> {
    match env::var(key) {
        Ok(raw) => raw.trim().parse().map_err(|_| ConfigError::Invalid(key)),
        Err(_) => Ok(default),
    }
}

/// Configuration errors
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Invalid value for environment variable: {0}")]
    Invalid(&'static str),
}
