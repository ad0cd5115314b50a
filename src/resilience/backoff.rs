//! Exponential backoff with full jitter
//!
//! `delay(attempt) = min(base * 2^attempt, max)`, then drawn uniformly from
//! `[0, delay]` when jitter is enabled. The random source is seedable so
//! tests can reproduce a schedule exactly.

use crate::config::RetryConfig;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::sync::Mutex;
use std::time::Duration;

/// Largest exponent applied before capping; keeps the shift in range.
const MAX_SHIFT: u32 = 31;

/// Retry delay calculator
pub struct BackoffPolicy {
    base: Duration,
    max: Duration,
    jitter: bool,
    rng: Mutex<StdRng>,
}

impl BackoffPolicy {
    /// Create a policy seeded from the OS
    pub fn new(base: Duration, max: Duration, jitter: bool) -> Self {
        Self {
            base,
            max,
            jitter,
            rng: Mutex::new(StdRng::from_entropy()),
        }
    }

    /// Create a policy with a fixed seed
    pub fn with_seed(base: Duration, max: Duration, jitter: bool, seed: u64) -> Self {
        Self {
            base,
            max,
            jitter,
            rng: Mutex::new(StdRng::seed_from_u64(seed)),
        }
    }

    /// Build from retry configuration
    pub fn from_config(config: &RetryConfig) -> Self {
        Self::new(
            Duration::from_millis(config.base_delay_ms),
            Duration::from_millis(config.max_delay_ms),
            config.jitter,
        )
    }

    /// Upper bound of the delay for `attempt` (0-based), before jitter
    pub fn ceiling(&self, attempt: u32) -> Duration {
        let factor = 1u32 << attempt.min(MAX_SHIFT);
        self.base
            .checked_mul(factor)
            .map_or(self.max, |d| d.min(self.max))
    }

    /// Delay to sleep before retry number `attempt` (0-based)
    pub fn next_delay(&self, attempt: u32) -> Duration {
        let ceiling = self.ceiling(attempt);
        if !self.jitter || ceiling.is_zero() {
            return ceiling;
        }
        let nanos = ceiling.as_nanos().min(u64::MAX as u128) as u64;
        let drawn = match self.rng.lock() {
            Ok(mut rng) => rng.gen_range(0..=nanos),
            Err(poisoned) => poisoned.into_inner().gen_range(0..=nanos),
        };
        Duration::from_nanos(drawn)
    }
}
