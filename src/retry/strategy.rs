// src/retry/strategy.rs
use crate::config::RetryConfig;
use hyper::StatusCode;
use std::future::Future;
use std::time::Duration;
use tokio::time::sleep;
use tracing::{debug, warn};

#[derive(Debug, Clone)]
pub struct RetryStrategy {
    config: RetryConfig,
}

#[derive(Debug)]
pub enum RetryDecision {
    Retry,
    NoRetry,
}

impl RetryStrategy {
    pub fn new(config: RetryConfig) -> Self {
        Self { config }
    }

    pub fn max_attempts(&self) -> u32 {
        self.config.max_attempts
    }

    /// Execute a function with retry logic
    pub async fn execute<F, Fut, T, E>(&self, mut f: F) -> Result<T, E>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: std::fmt::Display,
    {
        self.execute_with_decision(&mut f, |_| RetryDecision::Retry)
            .await
    }

    /// Execute with custom retry decision logic
    pub async fn execute_with_decision<F, Fut, T, E>(
        &self,
        mut f: F,
        should_retry: impl Fn(&E) -> RetryDecision,
    ) -> Result<T, E>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: std::fmt::Display,
    {
        let mut attempt = 0;

        loop {
            attempt += 1;

            match f().await {
                Ok(result) => return Ok(result),
                Err(error) => {
                    if let RetryDecision::NoRetry = should_retry(&error) {
                        debug!("Error is non-retryable: {}", error);
                        return Err(error);
                    }

                    if attempt >= self.config.max_attempts {
                        warn!("Retry failed after {} attempts: {}", attempt, error);
                        return Err(error);
                    }

                    let backoff = self.backoff_for(attempt);
                    debug!(
                        "Attempt {} failed: {}. Retrying in {:?}",
                        attempt, error, backoff
                    );

                    sleep(backoff).await;
                }
            }
        }
    }

    /// Exponential backoff with jitter: `base * 2^(attempt - 1)` capped at
    /// the configured maximum, plus 0-25% random jitter.
    pub fn backoff_for(&self, attempt: u32) -> Duration {
        let base = self.config.backoff_base().as_millis() as u64;
        let max = self.config.backoff_max().as_millis() as u64;

        let exponential = base.saturating_mul(2u64.saturating_pow(attempt.saturating_sub(1)));
        let capped = exponential.min(max);
        let jitter = (capped as f64 * rand::random::<f64>() * 0.25) as u64;

        Duration::from_millis(capped + jitter)
    }

    /// Whether an upstream HTTP status is worth another attempt.
    pub fn is_retryable_status(status: StatusCode) -> RetryDecision {
        match status {
            StatusCode::REQUEST_TIMEOUT
            | StatusCode::TOO_MANY_REQUESTS
            | StatusCode::INTERNAL_SERVER_ERROR
            | StatusCode::BAD_GATEWAY
            | StatusCode::SERVICE_UNAVAILABLE
            | StatusCode::GATEWAY_TIMEOUT => RetryDecision::Retry,

            s if s.is_client_error() => RetryDecision::NoRetry,
            s if s.is_server_error() => RetryDecision::Retry,
            _ => RetryDecision::NoRetry,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn strategy(max_attempts: u32) -> RetryStrategy {
        RetryStrategy::new(RetryConfig {
            max_attempts,
            backoff_base_ms: 10,
            backoff_max_ms: 100,
        })
    }

    #[tokio::test]
    async fn test_retry_success_after_failures() {
        let strategy = strategy(3);
        let counter = AtomicU32::new(0);

        let result = strategy
            .execute(|| async {
                let count = counter.fetch_add(1, Ordering::SeqCst);
                if count < 2 {
                    Err("Temporary failure")
                } else {
                    Ok("Success")
                }
            })
            .await;

        assert_eq!(result.unwrap(), "Success");
        assert_eq!(counter.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_retry_max_attempts() {
        let strategy = strategy(2);

        let result: Result<(), &str> = strategy.execute(|| async { Err("Always fails") }).await;

        assert!(result.is_err());
    }

    #[tokio::test]
    async fn test_non_retryable_short_circuits() {
        let strategy = strategy(5);
        let counter = AtomicU32::new(0);

        let result: Result<(), &str> = strategy
            .execute_with_decision(
                || async {
                    counter.fetch_add(1, Ordering::SeqCst);
                    Err("fatal")
                },
                |_| RetryDecision::NoRetry,
            )
            .await;

        assert!(result.is_err());
        assert_eq!(counter.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_status_classification() {
        assert!(matches!(
            RetryStrategy::is_retryable_status(StatusCode::BAD_GATEWAY),
            RetryDecision::Retry
        ));
        assert!(matches!(
            RetryStrategy::is_retryable_status(StatusCode::TOO_MANY_REQUESTS),
            RetryDecision::Retry
        ));
        assert!(matches!(
            RetryStrategy::is_retryable_status(StatusCode::NOT_FOUND),
            RetryDecision::NoRetry
        ));
        assert!(matches!(
            RetryStrategy::is_retryable_status(StatusCode::OK),
            RetryDecision::NoRetry
        ));
    }

    proptest! {
        #[test]
        fn backoff_stays_within_cap_plus_jitter(attempt in 1u32..64, base in 1u64..500, max in 1u64..5000) {
            let strategy = RetryStrategy::new(RetryConfig {
                max_attempts: 3,
                backoff_base_ms: base,
                backoff_max_ms: max,
            });

            let backoff = strategy.backoff_for(attempt).as_millis() as u64;
            let cap = base.saturating_mul(2u64.saturating_pow(attempt - 1)).min(max);

            // At most cap + 25% jitter, never less than the uncapped floor of 0.
            prop_assert!(backoff >= cap);
            prop_assert!(backoff <= cap + cap / 4 + 1);
        }
    }
}
