use std::future::Future;
use std::time::Duration;

use tokio::time::{sleep, timeout};
use tracing::debug;

use crate::error::{FetchError, FetchResult};

/// Bounded retry with exponential backoff (`base_delay * 2^attempt`) and a
/// deadline on every attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub timeout: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_millis(250),
            timeout: Duration::from_secs(8),
        }
    }
}

impl RetryPolicy {
    pub fn backoff(&self, attempt: u32) -> Duration {
        self.base_delay.saturating_mul(2u32.saturating_pow(attempt))
    }
}

/// Runs `op` until it succeeds, fails with a non-retryable error, or the
/// attempts are used up. A timed-out attempt counts as a failure.
pub async fn with_retry<T, F, Fut>(policy: &RetryPolicy, operation: &str, mut op: F) -> FetchResult<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = FetchResult<T>>,
{
    let attempts = policy.max_attempts.max(1);
    let mut last_err = None;

    for attempt in 0..attempts {
        let err = match timeout(policy.timeout, op()).await {
            Ok(Ok(value)) => return Ok(value),
            Ok(Err(e)) if !e.is_retryable() => return Err(e),
            Ok(Err(e)) => e,
            Err(_) => FetchError::Timeout {
                operation: operation.to_string(),
                timeout: policy.timeout,
            },
        };

        debug!(operation, attempt, error = %err, "fetch attempt failed");
        last_err = Some(err);

        if attempt + 1 < attempts {
            sleep(policy.backoff(attempt)).await;
        }
    }

    Err(last_err.unwrap_or_else(|| FetchError::Empty(operation.to_string())))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn policy() -> RetryPolicy {
        RetryPolicy {
            max_attempts: 3,
            base_delay: Duration::from_millis(100),
            timeout: Duration::from_secs(1),
        }
    }

    #[test]
    fn test_backoff_doubles() {
        let p = policy();
        assert_eq!(p.backoff(0), Duration::from_millis(100));
        assert_eq!(p.backoff(1), Duration::from_millis(200));
        assert_eq!(p.backoff(2), Duration::from_millis(400));
    }

    #[tokio::test(start_paused = true)]
    async fn test_recovers_after_transient_failures() {
        let calls = AtomicU32::new(0);
        let result = with_retry(&policy(), "ticker", || {
            let n = calls.fetch_add(1, Ordering::SeqCst);
            async move {
                if n < 2 {
                    Err(FetchError::Empty("ticker".into()))
                } else {
                    Ok(42)
                }
            }
        })
        .await;
        assert_eq!(result.unwrap(), 42);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_unsupported_is_not_retried() {
        let calls = AtomicU32::new(0);
        let result: FetchResult<()> = with_retry(&policy(), "risk_limits", || {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Err(FetchError::Unsupported("fetch_risk_limits")) }
        })
        .await;
        assert!(matches!(result, Err(FetchError::Unsupported(_))));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_counts_as_failure() {
        let result: FetchResult<()> = with_retry(&policy(), "orderbook", || async {
            sleep(Duration::from_secs(5)).await;
            Ok(())
        })
        .await;
        assert!(matches!(result, Err(FetchError::Timeout { .. })));
    }
}
