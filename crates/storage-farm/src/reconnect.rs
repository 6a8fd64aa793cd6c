//! Reconnect backoff schedule
//!
//! Failed attempts are retried forever. The delay grows geometrically from
//! `initial_delay` up to `max_delay`, with a random spread of `jitter` (as a
//! fraction of the delay) so that many clients do not retry in lockstep.

use crate::config::ReconnectConfig;
use rand::Rng;
use std::time::Duration;

/// Growth stops mattering long before this many attempts
const MAX_EXPONENT: u32 = 1024;

/// Per-connection retry state
#[derive(Debug, Clone)]
pub struct Backoff {
    config: ReconnectConfig,
    attempt: u32,
}

impl Backoff {
    pub fn new(config: ReconnectConfig) -> Self {
        Self { config, attempt: 0 }
    }

    /// Failed attempts since the last success
    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    /// Delay before the next attempt, advancing the schedule
    pub fn next_delay(&mut self) -> Duration {
        let delay = calculate_backoff(self.attempt, &self.config);
        self.attempt = self.attempt.saturating_add(1);
        delay
    }

    /// Start over after a successful connection
    pub fn reset(&mut self) {
        self.attempt = 0;
    }
}

/// Capped delay for `attempt`, before jitter
pub fn base_delay(attempt: u32, config: &ReconnectConfig) -> Duration {
    let exponent = attempt.min(MAX_EXPONENT) as i32;
    let delay = config.initial_delay.as_secs_f64() * config.multiplier.powi(exponent);
    let capped = delay.min(config.max_delay.as_secs_f64());
    Duration::try_from_secs_f64(capped).unwrap_or(config.max_delay)
}

/// Jittered delay for `attempt`
pub fn calculate_backoff(attempt: u32, config: &ReconnectConfig) -> Duration {
    let base = base_delay(attempt, config);
    if config.jitter <= 0.0 {
        return base;
    }
    let spread: f64 = rand::thread_rng().gen_range(-1.0..=1.0);
    apply_jitter(base, config.jitter, spread)
}

fn apply_jitter(base: Duration, jitter: f64, spread: f64) -> Duration {
    let factor = (1.0 + jitter * spread).max(0.0);
    Duration::try_from_secs_f64(base.as_secs_f64() * factor).unwrap_or(base)
}
