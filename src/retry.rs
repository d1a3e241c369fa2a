//! Bounded retry with exponential backoff and jitter for venue calls.
//!
//! Every outbound request goes through [`retry_venue_call`] so transient
//! network and 5xx failures are absorbed inside the adapter instead of
//! surfacing as missed opportunities. Only failures classified retryable
//! by [`VenueError::is_retryable`] are re-attempted.

use rand::Rng;
use std::time::Duration;
use tracing::{debug, warn};

use crate::venue::{VenueError, VenueResult};

/// Retry policy configuration.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Maximum number of attempts, including the initial try.
    pub max_attempts: u32,
    /// Base delay in milliseconds for exponential backoff.
    pub base_delay_ms: u64,
    /// Cap on a single backoff delay in milliseconds.
    pub max_delay_ms: u64,
    /// Maximum total elapsed time across all attempts in milliseconds.
    pub max_elapsed_ms: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            base_delay_ms: 500,
            max_delay_ms: 8_000,
            max_elapsed_ms: 30_000,
        }
    }
}

impl RetryPolicy {
    /// Load retry policy from environment variables with safe defaults.
    pub fn from_env() -> Self {
        let d = Self::default();
        Self {
            max_attempts: std::env::var("RETRY_MAX_ATTEMPTS")
                .ok()
                .and_then(|s| s.parse().ok())
                .filter(|&n| n > 0 && n <= 10)
                .unwrap_or(d.max_attempts),
            base_delay_ms: std::env::var("RETRY_BASE_DELAY_MS")
                .ok()
                .and_then(|s| s.parse().ok())
                .filter(|&n| n > 0)
                .unwrap_or(d.base_delay_ms),
            max_delay_ms: std::env::var("RETRY_MAX_DELAY_MS")
                .ok()
                .and_then(|s| s.parse().ok())
                .filter(|&n| n > 0)
                .unwrap_or(d.max_delay_ms),
            max_elapsed_ms: std::env::var("RETRY_MAX_ELAPSED_MS")
                .ok()
                .and_then(|s| s.parse().ok())
                .filter(|&n| n > 0)
                .unwrap_or(d.max_elapsed_ms),
        }
    }

    /// Backoff delay for the given attempt with full jitter.
    ///
    /// min(max_delay, base_delay * 2^(attempt-1)), then a random value in
    /// [0, capped) to spread retry storms across time.
    pub fn backoff_ms(&self, attempt: u32) -> u64 {
        let capped = self.capped_backoff_ms(attempt);
        if capped == 0 {
            0
        } else {
            rand::thread_rng().gen_range(0..capped)
        }
    }

    fn capped_backoff_ms(&self, attempt: u32) -> u64 {
        let exponent = attempt.saturating_sub(1);
        let multiplier = if exponent >= 32 {
            u64::MAX
        } else {
            1u64 << exponent
        };
        self.base_delay_ms
            .saturating_mul(multiplier)
            .min(self.max_delay_ms)
    }

    /// Deterministic-jitter variant for tests.
    #[cfg(test)]
    pub fn backoff_ms_with_jitter(&self, attempt: u32, jitter_fn: impl Fn(u64) -> u64) -> u64 {
        jitter_fn(self.capped_backoff_ms(attempt))
    }
}

/// Run a venue operation under the retry policy.
///
/// Retryable failures are re-attempted until the attempt or elapsed budget
/// is exhausted; a venue-supplied Retry-After is honored (capped to the
/// policy's max delay). Non-retryable failures return immediately.
pub async fn retry_venue_call<T, Fut, F>(
    policy: &RetryPolicy,
    op_name: &str,
    mut operation: F,
) -> VenueResult<T>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = VenueResult<T>>,
{
    let start = std::time::Instant::now();
    let mut attempt = 1;

    loop {
        match operation().await {
            Ok(value) => {
                if attempt > 1 {
                    debug!(
                        "retry op={} succeeded after {} attempts (elapsed={}ms)",
                        op_name,
                        attempt,
                        start.elapsed().as_millis()
                    );
                }
                return Ok(value);
            }
            Err(err) => {
                if !err.is_retryable() {
                    debug!("retry op={} non-retryable: {}", op_name, err);
                    return Err(err);
                }

                if attempt >= policy.max_attempts {
                    warn!(
                        "retry op={} failed after {} attempts (elapsed={}ms): {}",
                        op_name,
                        attempt,
                        start.elapsed().as_millis(),
                        err
                    );
                    return Err(err);
                }

                let elapsed_ms = start.elapsed().as_millis() as u64;
                if elapsed_ms >= policy.max_elapsed_ms {
                    warn!(
                        "retry op={} timeout after {}ms (max={}ms): {}",
                        op_name, elapsed_ms, policy.max_elapsed_ms, err
                    );
                    return Err(err);
                }

                let mut backoff_ms = match err.retry_after() {
                    Some(wait) => (wait.as_millis() as u64).min(policy.max_delay_ms),
                    None => policy.backoff_ms(attempt),
                };
                backoff_ms = backoff_ms.min(policy.max_elapsed_ms.saturating_sub(elapsed_ms));

                debug!(
                    "retry op={} attempt={} backoff_ms={} reason={}",
                    op_name, attempt, backoff_ms, err
                );

                if backoff_ms > 0 {
                    tokio::time::sleep(Duration::from_millis(backoff_ms)).await;
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
    fn test_policy_defaults() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.max_attempts, 5);
        assert_eq!(policy.base_delay_ms, 500);
        assert_eq!(policy.max_delay_ms, 8_000);
        assert_eq!(policy.max_elapsed_ms, 30_000);
    }

    #[test]
    fn test_backoff_schedule() {
        let policy = RetryPolicy::default();
        let jitter = |cap: u64| cap;

        // 500 * 2^(n-1), capped at 8000
        assert_eq!(policy.backoff_ms_with_jitter(1, jitter), 500);
        assert_eq!(policy.backoff_ms_with_jitter(2, jitter), 1_000);
        assert_eq!(policy.backoff_ms_with_jitter(3, jitter), 2_000);
        assert_eq!(policy.backoff_ms_with_jitter(4, jitter), 4_000);
        assert_eq!(policy.backoff_ms_with_jitter(5, jitter), 8_000);
        assert_eq!(policy.backoff_ms_with_jitter(6, jitter), 8_000);
    }

    #[test]
    fn test_backoff_respects_max_delay() {
        let policy = RetryPolicy {
            max_attempts: 10,
            base_delay_ms: 500,
            max_delay_ms: 3_000,
            max_elapsed_ms: 60_000,
        };
        let jitter = |cap: u64| cap;
        assert_eq!(policy.backoff_ms_with_jitter(10, jitter), 3_000);
        assert_eq!(policy.backoff_ms_with_jitter(40, jitter), 3_000);
    }

    #[tokio::test]
    async fn test_retry_succeeds_on_second_attempt() {
        let policy = RetryPolicy {
            max_attempts: 5,
            base_delay_ms: 1,
            max_delay_ms: 5,
            max_elapsed_ms: 1_000,
        };

        let attempts = AtomicU32::new(0);
        let result = retry_venue_call(&policy, "test_op", || {
            let n = attempts.fetch_add(1, Ordering::SeqCst) + 1;
            async move {
                if n < 2 {
                    Err(VenueError::Transport("connection reset".into()))
                } else {
                    Ok(42)
                }
            }
        })
        .await;

        assert_eq!(result.unwrap(), 42);
        assert_eq!(attempts.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_retry_fails_after_max_attempts() {
        let policy = RetryPolicy {
            max_attempts: 3,
            base_delay_ms: 1,
            max_delay_ms: 5,
            max_elapsed_ms: 1_000,
        };

        let attempts = AtomicU32::new(0);
        let result: VenueResult<i32> = retry_venue_call(&policy, "test_op", || {
            attempts.fetch_add(1, Ordering::SeqCst);
            async move { Err(VenueError::Transport("persistent 503".into())) }
        })
        .await;

        assert!(result.is_err());
        assert_eq!(attempts.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_non_retryable_fails_fast() {
        let policy = RetryPolicy::default();
        let attempts = AtomicU32::new(0);

        let result: VenueResult<i32> = retry_venue_call(&policy, "test_op", || {
            attempts.fetch_add(1, Ordering::SeqCst);
            async move { Err(VenueError::Validation("price off grid".into())) }
        })
        .await;

        assert!(result.is_err());
        assert_eq!(attempts.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_retry_after_is_honored_and_capped() {
        let policy = RetryPolicy {
            max_attempts: 2,
            base_delay_ms: 1,
            max_delay_ms: 10,
            max_elapsed_ms: 5_000,
        };

        let attempts = AtomicU32::new(0);
        let start = std::time::Instant::now();
        let result: VenueResult<i32> = retry_venue_call(&policy, "test_op", || {
            attempts.fetch_add(1, Ordering::SeqCst);
            async move {
                Err(VenueError::RateLimited {
                    // 60s suggestion must be capped to max_delay_ms
                    retry_after: Some(Duration::from_secs(60)),
                })
            }
        })
        .await;

        assert!(result.is_err());
        assert_eq!(attempts.load(Ordering::SeqCst), 2);
        assert!(start.elapsed() < Duration::from_secs(1));
    }
}
