//! Retry policy for transient task failures
//!
//! Bounded strategy:
//! - Max retries: configurable ceiling (default 3)
//! - Countdown: binary exponential from the base delay, capped
//! - Jitter: ±25% so retried invocations do not land in lockstep

use std::time::Duration;

/// Default retry ceiling
pub const MAX_RETRIES: u32 = 3;

/// Base countdown before the first retry (1 second)
const BASE_DELAY_MS: u64 = 1000;

/// Countdown cap (16 seconds)
const MAX_DELAY_MS: u64 = 16000;

/// What the worker does after a transient failure
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    /// Re-enqueue after this countdown
    RetryAfter(Duration),
    /// Ceiling reached; record FAILURE
    GiveUp,
}

/// Retry policy with exponential backoff
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Maximum number of retries after the first attempt
    max_retries: u32,

    /// Base delay in milliseconds
    base_delay_ms: u64,

    /// Maximum delay cap in milliseconds
    max_delay_ms: u64,

    /// Enable jitter
    enable_jitter: bool,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new()
    }
}

impl RetryPolicy {
    /// Create retry policy with default settings
    pub fn new() -> Self {
        Self {
            max_retries: MAX_RETRIES,
            base_delay_ms: BASE_DELAY_MS,
            max_delay_ms: MAX_DELAY_MS,
            enable_jitter: true,
        }
    }

    /// Create retry policy with custom settings
    pub fn with_config(max_retries: u32, base_delay_ms: u64) -> Self {
        Self {
            max_retries,
            base_delay_ms,
            max_delay_ms: MAX_DELAY_MS.max(base_delay_ms),
            enable_jitter: true,
        }
    }

    /// Disable jitter (deterministic countdowns)
    pub fn without_jitter(mut self) -> Self {
        self.enable_jitter = false;
        self
    }

    /// Decide what follows a transient failure on `attempt` (1-based)
    pub fn decide(&self, attempt: u32) -> RetryDecision {
        if attempt > self.max_retries {
            RetryDecision::GiveUp
        } else {
            RetryDecision::RetryAfter(self.countdown(attempt))
        }
    }

    /// Countdown before re-enqueueing after failed `attempt`
    pub fn countdown(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1);
        let exponential_delay = 2u64
            .checked_pow(exponent)
            .and_then(|factor| self.base_delay_ms.checked_mul(factor))
            .unwrap_or(u64::MAX);

        let delay_ms = exponential_delay.min(self.max_delay_ms);

        let final_delay = if self.enable_jitter && delay_ms > 0 {
            let jitter = (delay_ms / 4) as f64;
            let random_jitter = (rand::random::<f64>() * 2.0 - 1.0) * jitter;
            ((delay_ms as f64) + random_jitter).max(0.0) as u64
        } else {
            delay_ms
        };

        Duration::from_millis(final_delay)
    }

    /// Upper bound on total countdown across all retries (without jitter)
    pub fn max_total_wait_time(&self) -> Duration {
        let unjittered = self.clone().without_jitter();
        (1..=self.max_retries)
            .map(|attempt| unjittered.countdown(attempt))
            .sum()
    }

    /// Get max retries
    pub fn max_retries(&self) -> u32 {
        self.max_retries
    }

    /// Largest countdown the policy can produce, jitter included
    pub fn max_countdown(&self) -> Duration {
        let cap = if self.enable_jitter {
            self.max_delay_ms + self.max_delay_ms / 4
        } else {
            self.max_delay_ms
        };
        Duration::from_millis(cap)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use quickcheck_macros::quickcheck;

    #[test]
    fn test_countdown_doubles() {
        let policy = RetryPolicy::new().without_jitter();

        assert_eq!(policy.countdown(1), Duration::from_millis(1000));
        assert_eq!(policy.countdown(2), Duration::from_millis(2000));
        assert_eq!(policy.countdown(3), Duration::from_millis(4000));
        assert_eq!(policy.countdown(4), Duration::from_millis(8000));
        assert_eq!(policy.countdown(5), Duration::from_millis(16000));
    }

    #[test]
    fn test_delay_cap() {
        let policy = RetryPolicy::new().without_jitter();
        assert_eq!(policy.countdown(10), Duration::from_millis(MAX_DELAY_MS));
        assert_eq!(policy.countdown(u32::MAX), Duration::from_millis(MAX_DELAY_MS));
    }

    #[test]
    fn test_decide_respects_ceiling() {
        let policy = RetryPolicy::with_config(2, 10).without_jitter();
        assert_eq!(policy.decide(1), RetryDecision::RetryAfter(Duration::from_millis(10)));
        assert_eq!(policy.decide(2), RetryDecision::RetryAfter(Duration::from_millis(20)));
        assert_eq!(policy.decide(3), RetryDecision::GiveUp);
    }

    #[test]
    fn test_zero_retries_never_retries() {
        let policy = RetryPolicy::with_config(0, 10);
        assert_eq!(policy.decide(1), RetryDecision::GiveUp);
    }

    #[test]
    fn test_max_total_wait_time() {
        let policy = RetryPolicy::new();
        // 1s + 2s + 4s
        assert_eq!(policy.max_total_wait_time(), Duration::from_secs(7));
    }

    #[quickcheck]
    fn prop_countdown_is_bounded(attempt: u32, base_delay_ms: u16) -> bool {
        let policy = RetryPolicy::with_config(5, base_delay_ms as u64);
        policy.countdown(attempt) <= policy.max_countdown()
    }

    #[quickcheck]
    fn prop_unjittered_countdown_is_monotonic(attempt: u8) -> bool {
        let policy = RetryPolicy::new().without_jitter();
        let attempt = attempt as u32;
        policy.countdown(attempt) <= policy.countdown(attempt + 1)
    }
}
