//! Retry policy for failed node bodies
//!
//! A [`RetryPolicy`] re-invokes a node whose body returned an error, waiting an
//! exponentially growing delay between attempts:
//!
//! ```text
//! delay(n) = min(initial_interval × backoff_factor^(n-1), max_interval)
//! jitter:    delay(n) × random(0.5..=1.5)
//! ```
//!
//! where `n` is the number of the attempt that just failed (1-based).
//!
//! Only body failures are retried. Interrupts, node timeouts, cancellations and
//! hook errors end the invocation immediately. Retries happen inside a single
//! dispatch, so they do not count against `max_steps` in either engine.
//!
//! ```rust
//! use std::time::Duration;
//! use stepgraph_core::RetryPolicy;
//!
//! let policy = RetryPolicy::new(4)
//!     .with_initial_interval(Duration::from_millis(100))
//!     .with_backoff_factor(3.0)
//!     .with_jitter(false);
//!
//! assert_eq!(policy.delay_after(2), Duration::from_millis(300));
//! assert!(policy.allows_attempt(4));
//! assert!(!policy.allows_attempt(5));
//! ```

use rand::Rng;
use std::time::Duration;

#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    /// Total attempts, including the first
    pub max_attempts: u32,
    pub initial_interval: Duration,
    pub backoff_factor: f64,
    pub max_interval: Duration,
    pub jitter: bool,
}

impl RetryPolicy {
    pub fn new(max_attempts: u32) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            initial_interval: Duration::from_millis(500),
            backoff_factor: 2.0,
            max_interval: Duration::from_secs(30),
            jitter: true,
        }
    }

    /// A policy that never retries
    pub fn none() -> Self {
        Self::new(1)
    }

    pub fn with_initial_interval(mut self, interval: Duration) -> Self {
        self.initial_interval = interval;
        self
    }

    pub fn with_backoff_factor(mut self, factor: f64) -> Self {
        self.backoff_factor = factor;
        self
    }

    pub fn with_max_interval(mut self, interval: Duration) -> Self {
        self.max_interval = interval;
        self
    }

    pub fn with_jitter(mut self, jitter: bool) -> Self {
        self.jitter = jitter;
        self
    }

    /// Whether attempt number `attempt` (1-based) may run
    pub fn allows_attempt(&self, attempt: u32) -> bool {
        attempt >= 1 && attempt <= self.max_attempts
    }

    /// Wait before the attempt following failed attempt `attempt`
    pub fn delay_after(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(i32::MAX as u32) as i32;
        let base = self.initial_interval.as_secs_f64() * self.backoff_factor.powi(exponent);
        let capped = base.min(self.max_interval.as_secs_f64()).max(0.0);

        let delay = if self.jitter {
            capped * rand::thread_rng().gen_range(0.5..=1.5)
        } else {
            capped
        };

        if delay.is_finite() {
            Duration::from_secs_f64(delay)
        } else {
            self.max_interval
        }
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new(3)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.max_attempts, 3);
        assert_eq!(policy.initial_interval, Duration::from_millis(500));
        assert!(policy.jitter);
        assert_eq!(RetryPolicy::new(0).max_attempts, 1);
    }

    #[test]
    fn test_exponential_backoff_without_jitter() {
        let policy = RetryPolicy::new(5)
            .with_initial_interval(Duration::from_secs(1))
            .with_jitter(false);

        assert_eq!(policy.delay_after(1), Duration::from_secs(1));
        assert_eq!(policy.delay_after(2), Duration::from_secs(2));
        assert_eq!(policy.delay_after(3), Duration::from_secs(4));
    }

    #[test]
    fn test_delay_is_capped() {
        let policy = RetryPolicy::new(10)
            .with_initial_interval(Duration::from_secs(10))
            .with_max_interval(Duration::from_secs(25))
            .with_jitter(false);
        assert_eq!(policy.delay_after(6), Duration::from_secs(25));
    }

    #[test]
    fn test_jitter_stays_in_range() {
        let policy = RetryPolicy::new(5).with_initial_interval(Duration::from_secs(2));
        for _ in 0..50 {
            let delay = policy.delay_after(2).as_secs_f64();
            assert!((2.0..=6.0).contains(&delay), "delay {} out of range", delay);
        }
    }

    #[test]
    fn test_attempt_limits() {
        let policy = RetryPolicy::new(2);
        assert!(!policy.allows_attempt(0));
        assert!(policy.allows_attempt(1));
        assert!(policy.allows_attempt(2));
        assert!(!policy.allows_attempt(3));
        assert!(!RetryPolicy::none().allows_attempt(2));
    }
}
