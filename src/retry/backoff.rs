//! Backoff strategies
//!
//! ## Jittered exponential ("full jitter")
//!
//! Each call draws uniformly from `[0, min(base * 2^n, max)]` and then bumps
//! `n`. The exponent is capped so the shift never overflows; once the bound
//! reaches `max` it stays there.
//!
//! ## Jittered lower bound
//!
//! Built from a rate-limit reset header: draws from
//! `[interval, 1.5 * interval)` so a rate-limited upstream is never hit
//! before it asked to be.

use std::sync::Arc;
use std::time::Duration;

use crate::constants::MAX_BACKOFF_EXPONENT;
use crate::runtime::RandomGenerator;

/// Produces the wait before the next retry
pub trait BackOffStrategy: Send {
    fn next_back_off(&mut self) -> Duration;

    /// Forget accumulated attempts (the last retry succeeded)
    fn reset(&mut self);
}

/// Exponential backoff with full jitter
pub struct JitteredExponentialBackOff {
    base_interval_ms: u64,
    max_interval_ms: u64,
    attempt: u32,
    random: Arc<dyn RandomGenerator>,
}

impl JitteredExponentialBackOff {
    pub fn new(base_interval: Duration, max_interval: Duration, random: Arc<dyn RandomGenerator>) -> Self {
        let base_interval_ms = millis(base_interval);
        Self {
            base_interval_ms,
            max_interval_ms: millis(max_interval).max(base_interval_ms),
            attempt: 0,
            random,
        }
    }

    /// Upper bound of the next draw
    pub fn current_ceiling(&self) -> Duration {
        Duration::from_millis(self.ceiling_ms())
    }

    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    fn ceiling_ms(&self) -> u64 {
        let multiplier = 1u64 << self.attempt.min(MAX_BACKOFF_EXPONENT);
        self.base_interval_ms
            .saturating_mul(multiplier)
            .min(self.max_interval_ms)
    }
}

impl BackOffStrategy for JitteredExponentialBackOff {
    fn next_back_off(&mut self) -> Duration {
        let ceiling = self.ceiling_ms();
        if self.attempt < MAX_BACKOFF_EXPONENT {
            self.attempt += 1;
        }
        // Inclusive upper bound
        let drawn = match ceiling.checked_add(1) {
            Some(span) => self.random.random() % span,
            None => self.random.random(),
        };
        Duration::from_millis(drawn)
    }

    fn reset(&mut self) {
        self.attempt = 0;
    }
}

impl std::fmt::Debug for JitteredExponentialBackOff {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JitteredExponentialBackOff")
            .field("base_interval_ms", &self.base_interval_ms)
            .field("max_interval_ms", &self.max_interval_ms)
            .field("attempt", &self.attempt)
            .finish()
    }
}

/// Single-use backoff of at least `min_interval`
pub struct JitteredLowerBoundBackOff {
    min_interval_ms: u64,
    random: Arc<dyn RandomGenerator>,
}

impl JitteredLowerBoundBackOff {
    pub fn new(min_interval: Duration, random: Arc<dyn RandomGenerator>) -> Self {
        Self {
            min_interval_ms: millis(min_interval),
            random,
        }
    }
}

impl BackOffStrategy for JitteredLowerBoundBackOff {
    fn next_back_off(&mut self) -> Duration {
        let spread = (self.min_interval_ms >> 1).max(1);
        Duration::from_millis(self.min_interval_ms.saturating_add(self.random.random() % spread))
    }

    fn reset(&mut self) {}
}

impl std::fmt::Debug for JitteredLowerBoundBackOff {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JitteredLowerBoundBackOff")
            .field("min_interval_ms", &self.min_interval_ms)
            .finish()
    }
}

fn millis(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}
