//! How long to wait before re-arming a retry after a failed start.
//!
//! The lifecycle itself never retries; the [`supervisor`](crate::supervisor)
//! or an integrator's own loop picks the next `retry_with_seconds` delay
//! from here.

use std::time::Duration;

use cs_domain::config::RetryConfig;

/// Up to a quarter of the delay is added as jitter.
const JITTER: f64 = 0.25;

/// Exponential retry schedule, capped, with deterministic jitter.
#[derive(Debug, Clone)]
pub struct RetryBackoff {
    pub initial_delay: Duration,
    /// Cap applied before jitter.
    pub max_delay: Duration,
    pub backoff_factor: f64,
    /// Consecutive failed retries tolerated; `0` never gives up.
    pub max_attempts: u32,
}

impl Default for RetryBackoff {
    fn default() -> Self {
        Self::from_config(&RetryConfig::default())
    }
}

impl RetryBackoff {
    pub fn from_config(cfg: &RetryConfig) -> Self {
        Self {
            initial_delay: Duration::from_secs(cfg.initial_delay_secs),
            max_delay: Duration::from_secs(cfg.max_delay_secs),
            backoff_factor: cfg.backoff_factor,
            max_attempts: cfg.max_attempts,
        }
    }

    /// Delay before retry number `attempt` (0 is the first retry).
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        if self.initial_delay.is_zero() {
            return Duration::ZERO;
        }
        let growth = self.backoff_factor.max(1.0).powi(attempt.min(64) as i32);
        let capped = (self.initial_delay.as_secs_f64() * growth).min(self.max_delay.as_secs_f64());
        let secs = capped * (1.0 + JITTER * jitter_fraction(attempt));
        Duration::try_from_secs_f64(secs).unwrap_or(self.max_delay)
    }

    /// [`delay_for_attempt`](Self::delay_for_attempt) rounded up to the
    /// whole seconds `retry_with_seconds` takes.
    pub fn delay_secs_for_attempt(&self, attempt: u32) -> u64 {
        let d = self.delay_for_attempt(attempt);
        d.as_secs() + u64::from(d.subsec_nanos() > 0)
    }

    pub fn should_give_up(&self, attempt: u32) -> bool {
        self.max_attempts > 0 && attempt >= self.max_attempts
    }
}

/// Fraction in `[0, 1)` spread by a multiplicative hash; `0` for attempt 0.
fn jitter_fraction(attempt: u32) -> f64 {
    f64::from(attempt.wrapping_mul(0x9E37_79B1)) / (f64::from(u32::MAX) + 1.0)
}
