//! Explicit retry policy for model API calls.
//!
//! A [`RetryPolicy`] is a plain value; [`retry_with_policy`] executes an
//! operation under it and returns the final `Result` instead of relying on
//! error propagation for control flow.

use std::future::Future;
use std::time::{Duration, Instant};

use super::error::LlmError;

/// How the delay grows between attempts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Backoff {
    /// `base * (retry + 1)`
    Linear,
    /// `base * 2^retry`
    Exponential,
}

impl Backoff {
    fn delay(&self, base: Duration, retry: u32) -> Duration {
        match self {
            Backoff::Linear => base.saturating_mul(retry.saturating_add(1)),
            Backoff::Exponential => base.saturating_mul(2u32.saturating_pow(retry.min(16))),
        }
    }
}

/// Retry configuration for one kind of call.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Retries after the first attempt
    pub max_retries: u32,
    /// Backoff used after a rate-limit response
    pub rate_limit_backoff: Backoff,
    pub rate_limit_base: Duration,
    /// Backoff used after any other retryable failure
    pub transient_backoff: Backoff,
    pub transient_base: Duration,
    /// Upper bound for a single delay
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            rate_limit_backoff: Backoff::Exponential,
            rate_limit_base: Duration::from_secs(1),
            transient_backoff: Backoff::Linear,
            transient_base: Duration::from_millis(500),
            max_delay: Duration::from_secs(30),
        }
    }
}

impl RetryPolicy {
    /// Policy with the default backoff shape and a custom retry ceiling.
    pub fn with_max_retries(max_retries: u32) -> Self {
        Self {
            max_retries,
            ..Self::default()
        }
    }

    /// A policy that never waits (useful for testing).
    pub fn immediate(max_retries: u32) -> Self {
        Self {
            max_retries,
            rate_limit_base: Duration::ZERO,
            transient_base: Duration::ZERO,
            max_delay: Duration::ZERO,
            ..Self::default()
        }
    }

    /// Delay before retry number `retry` (0-based) after `error`.
    pub fn delay_for(&self, error: &LlmError, retry: u32) -> Duration {
        let delay = if error.is_rate_limited() {
            error
                .retry_after
                .unwrap_or_else(|| self.rate_limit_backoff.delay(self.rate_limit_base, retry))
        } else {
            self.transient_backoff.delay(self.transient_base, retry)
        };
        delay.min(self.max_delay)
    }
}

/// Run `op` until it succeeds, fails permanently, or the retry ceiling is hit.
///
/// `op` receives the 0-based attempt number.
pub async fn retry_with_policy<T, F, Fut>(
    policy: &RetryPolicy,
    label: &str,
    mut op: F,
) -> Result<T, LlmError>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<T, LlmError>>,
{
    let start = Instant::now();
    let mut attempt = 0u32;

    loop {
        match op(attempt).await {
            Ok(value) => {
                if attempt > 0 {
                    tracing::info!(
                        "{} succeeded after {} retries (total time: {:?})",
                        label,
                        attempt,
                        start.elapsed()
                    );
                }
                return Ok(value);
            }
            Err(error) => {
                if !error.is_retryable() || attempt >= policy.max_retries {
                    if attempt > 0 {
                        tracing::error!(
                            "{} failed after {} retries (total time: {:?}): {}",
                            label,
                            attempt,
                            start.elapsed(),
                            error
                        );
                    } else {
                        tracing::error!("{} failed (non-retryable): {}", label, error);
                    }
                    return Err(error);
                }

                let delay = policy.delay_for(&error, attempt);
                tracing::warn!(
                    "{} attempt {} failed with {}, retrying in {:?}: {}",
                    label,
                    attempt + 1,
                    error.kind,
                    delay,
                    error.message
                );
                if !delay.is_zero() {
                    tokio::time::sleep(delay).await;
                }
                attempt += 1;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[test]
    fn rate_limits_back_off_exponentially_and_cap() {
        let policy = RetryPolicy::default();
        let err = LlmError::rate_limited("slow down".into(), None);
        let d0 = policy.delay_for(&err, 0);
        let d1 = policy.delay_for(&err, 1);
        let d2 = policy.delay_for(&err, 2);
        assert_eq!(d0, Duration::from_secs(1));
        assert_eq!(d1, Duration::from_secs(2));
        assert_eq!(d2, Duration::from_secs(4));
        assert_eq!(policy.delay_for(&err, 12), policy.max_delay);
    }

    #[test]
    fn other_failures_back_off_linearly() {
        let policy = RetryPolicy::default();
        let err = LlmError::server_error(503, "unavailable".into());
        assert_eq!(policy.delay_for(&err, 0), Duration::from_millis(500));
        assert_eq!(policy.delay_for(&err, 2), Duration::from_millis(1500));
    }

    #[test]
    fn retry_after_header_is_respected_up_to_cap() {
        let policy = RetryPolicy::default();
        let err = LlmError::rate_limited("slow".into(), Some(Duration::from_secs(7)));
        assert_eq!(policy.delay_for(&err, 3), Duration::from_secs(7));
        let long = LlmError::rate_limited("slow".into(), Some(Duration::from_secs(600)));
        assert_eq!(policy.delay_for(&long, 0), policy.max_delay);
    }

    #[tokio::test]
    async fn succeeds_after_transient_failures() {
        let calls = AtomicU32::new(0);
        let result = retry_with_policy(&RetryPolicy::immediate(3), "test", |_| {
            let n = calls.fetch_add(1, Ordering::SeqCst);
            async move {
                if n < 2 {
                    Err(LlmError::rate_limited("busy".into(), None))
                } else {
                    Ok(n)
                }
            }
        })
        .await;
        assert_eq!(result.unwrap(), 2);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn stops_at_retry_ceiling() {
        let calls = AtomicU32::new(0);
        let result: Result<(), _> = retry_with_policy(&RetryPolicy::immediate(2), "test", |_| {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Err(LlmError::server_error(500, "boom".into())) }
        })
        .await;
        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn permanent_errors_are_not_retried() {
        let calls = AtomicU32::new(0);
        let result: Result<(), _> = retry_with_policy(&RetryPolicy::immediate(5), "test", |_| {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Err(LlmError::client_error(401, "bad key".into())) }
        })
        .await;
        assert_eq!(result.unwrap_err().status_code, Some(401));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
