//! Retry policy and backoff schedule.
//!
//! Exponential backoff with symmetric jitter:
//! `delay = base × 2^(n−1) + base × jitter × U(−1, 1)`, clamped to zero.
//! Cancellation is never retried; timeouts, statusless transport errors,
//! and a fixed set of status codes are, up to `max_retries` attempts.

use std::time::Duration;

use http::StatusCode;
use rand::Rng;
use serde::{Deserialize, Serialize};

use courier_core::{Error, RetryOptions};

/// Status codes retried by default.
pub const RETRYABLE_STATUS: &[u16] = &[408, 429, 500, 502, 503, 504];

/// Resolved retry policy for one logical request.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RetryPolicy {
    /// Retries after the initial attempt.
    pub max_retries: u32,
    /// Base delay for the exponential schedule.
    #[serde(with = "humantime_serde")]
    pub base_delay: Duration,
    /// Jitter factor in `[0, 1]`.
    pub jitter: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        RetryPolicy {
            max_retries: 3,
            base_delay: Duration::from_secs(1),
            jitter: 0.3,
        }
    }
}

impl RetryPolicy {
    /// Applies per-request overrides on top of this policy.
    pub fn with_overrides(&self, overrides: &RetryOptions) -> RetryPolicy {
        RetryPolicy {
            max_retries: overrides.max_retries.unwrap_or(self.max_retries),
            base_delay: overrides.delay.unwrap_or(self.base_delay),
            jitter: overrides.jitter.unwrap_or(self.jitter),
        }
    }

    /// Backoff before retry attempt `n` (1-based).
    pub fn backoff_delay(&self, attempt: u32) -> Duration {
        let base = self.base_delay.as_secs_f64();
        let exponential = base * f64::powi(2.0, attempt.saturating_sub(1) as i32);
        let jitter = base * self.jitter * rand::rng().random_range(-1.0..=1.0);
        Duration::from_secs_f64((exponential + jitter).max(0.0))
    }

    /// Whether `error` is retryable under the default classification.
    pub fn default_should_retry(error: &Error) -> bool {
        match error {
            Error::Canceled { .. } => false,
            Error::Timeout { .. } => true,
            // Transport failures carry no status.
            Error::Network { .. } | Error::SendFailed { .. } => true,
            Error::Http { status, .. } => RETRYABLE_STATUS.contains(&status.as_u16()),
            Error::QueueClosed { .. } | Error::AbortedWhileWaiting | Error::Config { .. } => false,
        }
    }

    /// Whether status `status` is in the default retryable set.
    pub fn is_retryable_status(status: StatusCode) -> bool {
        RETRYABLE_STATUS.contains(&status.as_u16())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn backoff_stays_within_the_jitter_envelope() {
        let policy = RetryPolicy {
            max_retries: 5,
            base_delay: Duration::from_millis(100),
            jitter: 0.3,
        };
        for attempt in 1..=5u32 {
            let exponential = 0.1 * f64::powi(2.0, attempt as i32 - 1);
            let lo = exponential - 0.1 * 0.3;
            let hi = exponential + 0.1 * 0.3;
            for _ in 0..50 {
                let d = policy.backoff_delay(attempt).as_secs_f64();
                assert!(d >= (lo - 1e-9).max(0.0) && d <= hi + 1e-9, "attempt {attempt}: {d}");
            }
        }
    }

    #[test]
    fn zero_jitter_is_deterministic() {
        let policy = RetryPolicy {
            max_retries: 3,
            base_delay: Duration::from_millis(200),
            jitter: 0.0,
        };
        assert_eq!(policy.backoff_delay(1), Duration::from_millis(200));
        assert_eq!(policy.backoff_delay(2), Duration::from_millis(400));
        assert_eq!(policy.backoff_delay(3), Duration::from_millis(800));
    }

    #[test]
    fn default_classification() {
        assert!(RetryPolicy::default_should_retry(&Error::Timeout {
            elapsed: Duration::from_secs(1)
        }));
        assert!(RetryPolicy::default_should_retry(&Error::network("dns")));
        assert!(!RetryPolicy::default_should_retry(&Error::Canceled {
            origin: courier_core::AbortOrigin::User,
            reason: None,
        }));
        for status in [408u16, 429, 500, 502, 503, 504] {
            assert!(RetryPolicy::is_retryable_status(
                StatusCode::from_u16(status).unwrap()
            ));
        }
        assert!(!RetryPolicy::is_retryable_status(StatusCode::NOT_FOUND));
        assert!(!RetryPolicy::is_retryable_status(StatusCode::BAD_REQUEST));
    }

    #[test]
    fn overrides_take_precedence() {
        let policy = RetryPolicy::default();
        let resolved = policy.with_overrides(&RetryOptions {
            max_retries: Some(1),
            delay: Some(Duration::from_millis(50)),
            jitter: None,
        });
        assert_eq!(resolved.max_retries, 1);
        assert_eq!(resolved.base_delay, Duration::from_millis(50));
        assert_eq!(resolved.jitter, policy.jitter);
    }
}
