//! Retry backoff

use std::time::Duration;

use rand::Rng;

pub const DEFAULT_MAX_ATTEMPTS: i32 = 5;
pub const DEFAULT_BASE_DELAY_SECS: u64 = 30;
pub const DEFAULT_MAX_DELAY_SECS: u64 = 1800;
pub const DEFAULT_JITTER_FRACTION: f64 = 0.2;

/// Capped exponential backoff with proportional jitter
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    /// Total attempts including the first one
    pub max_attempts: i32,
    pub base_delay: Duration,
    pub max_delay: Duration,
    /// Jitter as a fraction of the computed delay, in `[0, 1]`
    pub jitter_fraction: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            base_delay: Duration::from_secs(DEFAULT_BASE_DELAY_SECS),
            max_delay: Duration::from_secs(DEFAULT_MAX_DELAY_SECS),
            jitter_fraction: DEFAULT_JITTER_FRACTION,
        }
    }
}

impl RetryPolicy {
    /// Delay before the retry following the given (1-based) attempt, without jitter.
    pub fn base_backoff(&self, attempt: i32) -> Duration {
        let exponent = attempt.saturating_sub(1).clamp(0, 20) as u32;
        self.base_delay
            .saturating_mul(2u32.saturating_pow(exponent))
            .min(self.max_delay)
    }

    /// Delay with jitter applied, never above `max_delay`.
    pub fn backoff(&self, attempt: i32) -> Duration {
        let base = self.base_backoff(attempt);
        let fraction = self.jitter_fraction.clamp(0.0, 1.0);
        if fraction == 0.0 {
            return base;
        }

        let factor = rand::thread_rng().gen_range(1.0 - fraction..=1.0 + fraction);
        base.mul_f64(factor).min(self.max_delay)
    }

    /// Whether a job on its `attempt`-th try may be retried.
    pub fn has_attempts_left(&self, attempt: i32) -> bool {
        attempt < self.max_attempts
    }
}
