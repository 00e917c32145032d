//! Per-category retry schedules with exponential backoff and jitter.
//!
//! Each failure class gets its own attempt budget and delay curve: network
//! blips retry quickly, 429s wait out the server's window, 4xx fail fast.
//! Delays are `min(base_delay * exponential_base^(attempt-1), max_delay)`
//! with a random ±jitter so concurrent tasks don't retry in lockstep.

use std::time::Duration;

use crate::error::{CollectError, ErrorCategory};

/// Backoff parameters for a single error category.
#[derive(Debug, Clone)]
pub struct RetrySchedule {
    /// Total attempts allowed, including the first (1 = never retry).
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
    pub exponential_base: f64,
    /// Jitter fraction in [0, 1]: the computed delay is scaled by a uniform
    /// factor in [1 - jitter, 1 + jitter].
    pub jitter: f64,
}

impl RetrySchedule {
    pub fn new(max_attempts: u32, base_delay: Duration, max_delay: Duration) -> Self {
        Self {
            max_attempts,
            base_delay,
            max_delay,
            exponential_base: 2.0,
            jitter: 0.25,
        }
    }

    /// A schedule that never retries.
    pub fn never() -> Self {
        Self {
            max_attempts: 1,
            base_delay: Duration::ZERO,
            max_delay: Duration::ZERO,
            exponential_base: 1.0,
            jitter: 0.0,
        }
    }

    pub fn with_exponential_base(mut self, base: f64) -> Self {
        self.exponential_base = base;
        self
    }

    pub fn with_jitter(mut self, jitter: f64) -> Self {
        self.jitter = jitter.clamp(0.0, 1.0);
        self
    }

    /// Whether another attempt is allowed after `attempts_so_far` attempts.
    pub fn allows_attempt(&self, attempts_so_far: u32) -> bool {
        attempts_so_far < self.max_attempts
    }

    /// Delay before retry attempt `attempt` (1-indexed).
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let attempt = attempt.max(1);
        let exp = self.exponential_base.powi(attempt as i32 - 1);
        let raw = self.base_delay.as_secs_f64() * exp;
        let capped = raw.min(self.max_delay.as_secs_f64());
        apply_jitter(Duration::from_secs_f64(capped.max(0.0)), self.jitter)
    }
}

/// The full retry policy: one schedule per error category.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    network: RetrySchedule,
    rate_limit: RetrySchedule,
    server: RetrySchedule,
    client: RetrySchedule,
    content: RetrySchedule,
    validation: RetrySchedule,
    storage: RetrySchedule,
    configuration: RetrySchedule,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            // Connection blips: quick, few attempts.
            network: RetrySchedule::new(3, Duration::from_secs(1), Duration::from_secs(10)),
            // 429s: long waits, more attempts allowed.
            rate_limit: RetrySchedule::new(5, Duration::from_secs(60), Duration::from_secs(300)),
            // 5xx: moderate exponential backoff.
            server: RetrySchedule::new(4, Duration::from_secs(5), Duration::from_secs(60)),
            // 4xx: the request is wrong, retrying can't fix it.
            client: RetrySchedule::never(),
            // Parse/decode failures: one more try, then give up.
            content: RetrySchedule::new(2, Duration::from_secs(1), Duration::from_secs(5)),
            validation: RetrySchedule::never(),
            storage: RetrySchedule::new(3, Duration::from_secs(2), Duration::from_secs(30)),
            configuration: RetrySchedule::never(),
        }
    }
}

impl RetryPolicy {
    pub fn schedule(&self, category: ErrorCategory) -> &RetrySchedule {
        match category {
            ErrorCategory::Network => &self.network,
            ErrorCategory::RateLimit => &self.rate_limit,
            ErrorCategory::Server => &self.server,
            ErrorCategory::Client => &self.client,
            ErrorCategory::Content => &self.content,
            ErrorCategory::Validation => &self.validation,
            ErrorCategory::Storage => &self.storage,
            ErrorCategory::Configuration => &self.configuration,
        }
    }

    /// Replace the schedule for one category.
    pub fn with_schedule(mut self, category: ErrorCategory, schedule: RetrySchedule) -> Self {
        match category {
            ErrorCategory::Network => self.network = schedule,
            ErrorCategory::RateLimit => self.rate_limit = schedule,
            ErrorCategory::Server => self.server = schedule,
            ErrorCategory::Client => self.client = schedule,
            ErrorCategory::Content => self.content = schedule,
            ErrorCategory::Validation => self.validation = schedule,
            ErrorCategory::Storage => self.storage = schedule,
            ErrorCategory::Configuration => self.configuration = schedule,
        }
        self
    }

    /// A policy with all delays collapsed to zero. Attempt budgets stay
    /// intact, so retry counting behaves identically without the waiting.
    pub fn immediate() -> Self {
        let zero = |max_attempts| RetrySchedule {
            max_attempts,
            base_delay: Duration::ZERO,
            max_delay: Duration::ZERO,
            exponential_base: 1.0,
            jitter: 0.0,
        };
        Self {
            network: zero(3),
            rate_limit: zero(5),
            server: zero(4),
            client: RetrySchedule::never(),
            content: zero(2),
            validation: RetrySchedule::never(),
            storage: zero(3),
            configuration: RetrySchedule::never(),
        }
    }

    /// Delay before retry attempt `attempt` (1-indexed) for this category.
    pub fn delay_for(&self, category: ErrorCategory, attempt: u32) -> Duration {
        self.schedule(category).delay_for_attempt(attempt)
    }

    /// Delay for a concrete error. A `Retry-After` hint from the server
    /// becomes the enforced minimum, overriding a shorter computed backoff.
    pub fn delay_for_error(&self, error: &CollectError, attempt: u32) -> Duration {
        let computed = self.delay_for(error.category(), attempt);
        match error.retry_after() {
            Some(hint) => computed.max(hint),
            None => computed,
        }
    }
}

/// Scale a duration by a uniform random factor in [1 - fraction, 1 + fraction].
///
/// Seeded from the clock via xorshift; good enough for de-synchronizing
/// retries, not crypto.
fn apply_jitter(base: Duration, fraction: f64) -> Duration {
    if fraction <= 0.0 || base.is_zero() {
        return base;
    }
    let mut x = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_nanos() as u64;
    // xorshift64
    x ^= x << 13;
    x ^= x >> 7;
    x ^= x << 17;
    // Map to [0, 1), then to [1 - fraction, 1 + fraction].
    let unit = (x % 1_000_000) as f64 / 1_000_000.0;
    let factor = 1.0 - fraction + 2.0 * fraction * unit;
    Duration::from_secs_f64(base.as_secs_f64() * factor)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn no_jitter(schedule: RetrySchedule) -> RetrySchedule {
        schedule.with_jitter(0.0)
    }

    #[test]
    fn test_delay_grows_exponentially() {
        let s = no_jitter(RetrySchedule::new(
            5,
            Duration::from_secs(1),
            Duration::from_secs(60),
        ));
        assert_eq!(s.delay_for_attempt(1), Duration::from_secs(1));
        assert_eq!(s.delay_for_attempt(2), Duration::from_secs(2));
        assert_eq!(s.delay_for_attempt(3), Duration::from_secs(4));
        assert_eq!(s.delay_for_attempt(4), Duration::from_secs(8));
    }

    #[test]
    fn test_delay_caps_at_max() {
        let s = no_jitter(RetrySchedule::new(
            10,
            Duration::from_secs(1),
            Duration::from_secs(5),
        ));
        assert_eq!(s.delay_for_attempt(10), Duration::from_secs(5));
    }

    #[test]
    fn test_jitter_is_bounded() {
        let s = RetrySchedule::new(5, Duration::from_secs(4), Duration::from_secs(60))
            .with_jitter(0.25);
        for _ in 0..100 {
            let d = s.delay_for_attempt(1);
            assert!(d >= Duration::from_secs(3), "below jitter floor: {d:?}");
            assert!(d <= Duration::from_secs(5), "above jitter ceiling: {d:?}");
        }
    }

    #[test]
    fn test_attempt_budgets() {
        let policy = RetryPolicy::default();
        // Client errors never get a second attempt.
        assert!(!policy.schedule(ErrorCategory::Client).allows_attempt(1));
        // Content errors get exactly one retry.
        assert!(policy.schedule(ErrorCategory::Content).allows_attempt(1));
        assert!(!policy.schedule(ErrorCategory::Content).allows_attempt(2));
        // Rate limits get the most headroom.
        assert!(policy.schedule(ErrorCategory::RateLimit).allows_attempt(4));
        assert!(!policy.schedule(ErrorCategory::RateLimit).allows_attempt(5));
    }

    #[test]
    fn test_rate_limit_base_delay_is_long() {
        let policy = RetryPolicy::default();
        assert!(policy.schedule(ErrorCategory::RateLimit).base_delay >= Duration::from_secs(60));
    }

    #[test]
    fn test_retry_after_overrides_shorter_computed_delay() {
        let policy = RetryPolicy::immediate();
        let err = CollectError::RateLimit {
            message: "slow down".into(),
            retry_after: Some(Duration::from_secs(90)),
        };
        assert_eq!(policy.delay_for_error(&err, 1), Duration::from_secs(90));
    }

    #[test]
    fn test_retry_after_does_not_shorten_longer_delay() {
        let policy = RetryPolicy::default().with_schedule(
            ErrorCategory::RateLimit,
            RetrySchedule::new(5, Duration::from_secs(120), Duration::from_secs(300))
                .with_jitter(0.0),
        );
        let err = CollectError::RateLimit {
            message: "slow down".into(),
            retry_after: Some(Duration::from_secs(10)),
        };
        assert_eq!(policy.delay_for_error(&err, 1), Duration::from_secs(120));
    }
}
