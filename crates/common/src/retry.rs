//! Bounded retry with exponential backoff for transient infrastructure errors.
//!
//! Call sites wrap single store or broker operations; exhaustion hands the last error
//! back to the caller.

use std::future::Future;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

/// Attempt budget and backoff schedule for a retried operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryStrategy {
    /// Total attempts, including the first one.
    pub attempts: u32,
    /// Sleep before the second attempt.
    pub delay: Duration,
    /// Multiplier applied to the sleep after each failure.
    pub backoff: u32,
}

impl RetryStrategy {
    /// Store commands and broker publishes.
    pub const OPERATION: RetryStrategy = RetryStrategy {
        attempts: 3,
        delay: Duration::from_millis(100),
        backoff: 2,
    };

    /// Initial connection to Redis.
    pub const CONNECT: RetryStrategy = RetryStrategy {
        attempts: 5,
        delay: Duration::from_secs(1),
        backoff: 2,
    };

    /// Sleep that follows the `failures`-th failed attempt (1-indexed).
    pub fn delay_after(&self, failures: u32) -> Duration {
        let factor = self.backoff.saturating_pow(failures.saturating_sub(1));
        self.delay.saturating_mul(factor)
    }
}

/// Run `op` until it succeeds or the budget is spent.
pub async fn retry<T, E, F, Fut>(strategy: RetryStrategy, op: F) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: std::fmt::Display,
{
    retry_until(strategy, &CancellationToken::new(), op).await
}

/// Like [`retry`], but a cancelled token cuts the backoff sleep short and returns the last error.
pub async fn retry_until<T, E, F, Fut>(
    strategy: RetryStrategy,
    cancel: &CancellationToken,
    mut op: F,
) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: std::fmt::Display,
{
    let attempts = strategy.attempts.max(1);
    let mut failures = 0;

    loop {
        match op().await {
            Ok(value) => return Ok(value),
            Err(e) => {
                failures += 1;
                if failures >= attempts || cancel.is_cancelled() {
                    return Err(e);
                }

                let delay = strategy.delay_after(failures);
                tracing::debug!(
                    attempt = failures,
                    delay_ms = delay.as_millis() as u64,
                    error = %e,
                    "Transient failure, retrying"
                );

                tokio::select! {
                    _ = tokio::time::sleep(delay) => {}
                    _ = cancel.cancelled() => return Err(e),
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    const FAST: RetryStrategy = RetryStrategy {
        attempts: 3,
        delay: Duration::from_millis(1),
        backoff: 2,
    };

    #[test]
    fn test_delay_after_grows_exponentially() {
        let strategy = RetryStrategy::CONNECT;
        assert_eq!(strategy.delay_after(1), Duration::from_secs(1));
        assert_eq!(strategy.delay_after(2), Duration::from_secs(2));
        assert_eq!(strategy.delay_after(3), Duration::from_secs(4));
    }

    #[tokio::test]
    async fn test_retry_succeeds_after_transient_failures() {
        let calls = &AtomicU32::new(0);
        let result: Result<u32, String> = retry(FAST, || async move {
            let n = calls.fetch_add(1, Ordering::SeqCst) + 1;
            if n < 3 { Err(format!("fail {n}")) } else { Ok(n) }
        })
        .await;
        assert_eq!(result, Ok(3));
    }

    #[tokio::test]
    async fn test_retry_returns_last_error_when_exhausted() {
        let calls = &AtomicU32::new(0);
        let result: Result<(), String> = retry(FAST, || async move {
            let n = calls.fetch_add(1, Ordering::SeqCst) + 1;
            Err(format!("fail {n}"))
        })
        .await;
        assert_eq!(result, Err("fail 3".to_string()));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_cancelled_token_stops_retrying() {
        let cancel = CancellationToken::new();
        cancel.cancel();
        let calls = &AtomicU32::new(0);
        let result: Result<(), String> = retry_until(RetryStrategy::CONNECT, &cancel, || async move {
            calls.fetch_add(1, Ordering::SeqCst);
            Err("down".to_string())
        })
        .await;
        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
