//! Retry with exponential backoff.
//!
//! A retry policy is a base delay doubled per attempt plus additive random
//! jitter. Callers decide which errors are worth another attempt.
//!
//! ```rust,ignore
//! use routely_core::retry::{RetryPolicy, with_retry_outcome};
//!
//! let outcome = with_retry_outcome(&policy, TransportError::is_retryable, || async {
//!     backend.send(&request).await
//! })
//! .await;
//! ```

use std::future::Future;
use std::time::Duration;

use rand::Rng;
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::config::TransportConfig;

/// Configuration for retry behavior with exponential backoff.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Delay before the first retry (default: 1s).
    pub initial_delay: Duration,
    /// Cap on the exponential part of the delay (default: 30s).
    pub max_delay: Duration,
    /// Multiplier applied after each retry (default: 2.0).
    pub backoff_factor: f64,
    /// Upper bound of the uniform jitter added to every delay (default: 400ms).
    pub jitter_max: Duration,
    /// Retries after the first attempt (default: 3).
    pub max_retries: u32,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(30),
            backoff_factor: 2.0,
            jitter_max: Duration::from_millis(400),
            max_retries: 3,
        }
    }
}

impl RetryPolicy {
    #[must_use]
    pub fn new(
        initial_delay: Duration,
        max_delay: Duration,
        backoff_factor: f64,
        jitter_max: Duration,
        max_retries: u32,
    ) -> Self {
        Self {
            initial_delay,
            max_delay,
            backoff_factor: backoff_factor.max(1.0),
            jitter_max,
            max_retries,
        }
    }

    #[must_use]
    pub fn from_config(config: &TransportConfig) -> Self {
        Self {
            initial_delay: Duration::from_millis(config.backoff_base_ms),
            jitter_max: Duration::from_millis(config.jitter_max_ms),
            max_retries: config.max_retries,
            ..Self::default()
        }
    }

    /// Policy with no delay and no jitter, for tests.
    #[must_use]
    pub fn immediate(max_retries: u32) -> Self {
        Self {
            initial_delay: Duration::ZERO,
            max_delay: Duration::ZERO,
            backoff_factor: 1.0,
            jitter_max: Duration::ZERO,
            max_retries,
        }
    }

    /// Total attempts including the first.
    #[must_use]
    pub fn max_attempts(&self) -> u32 {
        self.max_retries.saturating_add(1)
    }

    /// Exponential part of the delay for a 0-indexed retry.
    #[must_use]
    #[allow(clippy::cast_precision_loss)]
    #[allow(clippy::cast_possible_wrap)]
    pub fn base_delay(&self, attempt: u32) -> Duration {
        let initial_ms = u64::try_from(self.initial_delay.as_millis()).unwrap_or(u64::MAX);
        let max_ms = u64::try_from(self.max_delay.as_millis()).unwrap_or(u64::MAX);
        let exp = attempt.min(31) as i32;
        let base_ms = (initial_ms as f64) * self.backoff_factor.powi(exp);
        Duration::from_millis(base_ms.min(max_ms as f64) as u64)
    }

    /// Delay before a 0-indexed retry: `initial * factor^attempt + U(0, jitter_max)`.
    #[must_use]
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        self.base_delay(attempt) + uniform_jitter(Duration::ZERO, self.jitter_max)
    }
}

/// Uniformly distributed duration in `[low, high]`.
#[must_use]
pub fn uniform_jitter(low: Duration, high: Duration) -> Duration {
    if high <= low {
        return low;
    }
    let low_ms = u64::try_from(low.as_millis()).unwrap_or(u64::MAX);
    let high_ms = u64::try_from(high.as_millis()).unwrap_or(u64::MAX);
    Duration::from_millis(rand::rng().random_range(low_ms..=high_ms))
}

/// Outcome of a retry operation.
#[derive(Debug)]
pub struct RetryOutcome<T, E> {
    /// The result (success or final error).
    pub result: Result<T, E>,
    /// Number of attempts made.
    pub attempts: u32,
    /// Total time spent (including delays).
    pub elapsed: Duration,
}

/// Execute an async operation with retry and exponential backoff.
///
/// Errors for which `is_retryable` returns false are surfaced after the
/// attempt that produced them.
pub async fn with_retry_outcome<T, E, R, F, Fut>(
    policy: &RetryPolicy,
    is_retryable: R,
    mut operation: F,
) -> RetryOutcome<T, E>
where
    E: std::fmt::Display,
    R: Fn(&E) -> bool,
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
{
    let start = Instant::now();
    let mut attempt = 0u32;

    loop {
        match operation().await {
            Ok(value) => {
                if attempt > 0 {
                    debug!(
                        total_attempts = attempt + 1,
                        retries = attempt,
                        "Operation succeeded after retries"
                    );
                }
                return RetryOutcome {
                    result: Ok(value),
                    attempts: attempt + 1,
                    elapsed: start.elapsed(),
                };
            }
            Err(e) => {
                attempt += 1;

                if !is_retryable(&e) {
                    debug!(attempt, error = %e, "Operation failed with non-retryable error");
                    return RetryOutcome {
                        result: Err(e),
                        attempts: attempt,
                        elapsed: start.elapsed(),
                    };
                }

                if attempt >= policy.max_attempts() {
                    warn!(
                        attempt,
                        max_attempts = policy.max_attempts(),
                        error = %e,
                        "Operation failed after all retry attempts"
                    );
                    return RetryOutcome {
                        result: Err(e),
                        attempts: attempt,
                        elapsed: start.elapsed(),
                    };
                }

                let delay = policy.delay_for_attempt(attempt - 1);
                debug!(
                    attempt,
                    delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
                    error = %e,
                    "Retrying operation after failure"
                );
                tokio::time::sleep(delay).await;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[test]
    fn base_delays_double() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.base_delay(0), Duration::from_secs(1));
        assert_eq!(policy.base_delay(1), Duration::from_secs(2));
        assert_eq!(policy.base_delay(2), Duration::from_secs(4));
        assert_eq!(policy.max_attempts(), 4);
    }

    #[test]
    fn jitter_stays_within_bounds() {
        let policy = RetryPolicy::default();
        for _ in 0..100 {
            let delay = policy.delay_for_attempt(1);
            assert!(delay >= Duration::from_secs(2));
            assert!(delay <= Duration::from_millis(2400));
        }
    }

    #[test]
    fn base_delay_is_capped() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.base_delay(40), Duration::from_secs(30));
    }

    #[test]
    fn uniform_jitter_degenerate_range() {
        let d = Duration::from_secs(2);
        assert_eq!(uniform_jitter(d, d), d);
        assert_eq!(uniform_jitter(d, Duration::ZERO), d);
    }

    #[tokio::test(start_paused = true)]
    async fn retries_until_success() {
        let calls = Arc::new(AtomicU32::new(0));
        let counter = Arc::clone(&calls);
        let outcome = with_retry_outcome(&RetryPolicy::default(), |_: &String| true, || {
            let counter = Arc::clone(&counter);
            async move {
                if counter.fetch_add(1, Ordering::SeqCst) < 2 {
                    Err("transient".to_string())
                } else {
                    Ok(7)
                }
            }
        })
        .await;
        assert_eq!(outcome.result.unwrap(), 7);
        assert_eq!(outcome.attempts, 3);
        assert!(outcome.elapsed >= Duration::from_secs(3));
    }

    #[tokio::test(start_paused = true)]
    async fn gives_up_after_max_attempts() {
        let calls = Arc::new(AtomicU32::new(0));
        let counter = Arc::clone(&calls);
        let outcome: RetryOutcome<(), String> =
            with_retry_outcome(&RetryPolicy::default(), |_| true, || {
                let counter = Arc::clone(&counter);
                async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                    Err("down".to_string())
                }
            })
            .await;
        assert!(outcome.result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 4);
        assert_eq!(outcome.attempts, 4);
    }

    #[tokio::test]
    async fn non_retryable_error_returns_immediately() {
        let calls = Arc::new(AtomicU32::new(0));
        let counter = Arc::clone(&calls);
        let outcome: RetryOutcome<(), String> =
            with_retry_outcome(&RetryPolicy::default(), |_| false, || {
                let counter = Arc::clone(&counter);
                async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                    Err("bad request".to_string())
                }
            })
            .await;
        assert_eq!(outcome.attempts, 1);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
