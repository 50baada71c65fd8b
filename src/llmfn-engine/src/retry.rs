//! Retry with exponential backoff.
//!
//! Every wait is cancellable and a server requested delay (`retry-after`)
//! is honoured as a lower bound.

use std::future::Future;
use std::time::Duration;

use rand::Rng;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::config::RetryConfig;
use crate::error::{FunError, Result};

/// Failure of a single attempt.
#[derive(Debug)]
pub enum AttemptError {
    /// Try again after a backoff delay.
    Retry {
        error: FunError,
        /// Delay requested by the server.
        retry_after: Option<Duration>,
        /// HTTP status of the response, if any.
        status: Option<u16>,
        /// Response body, if any.
        body: String,
    },
    /// Give up immediately.
    Fail(FunError),
}

impl AttemptError {
    pub fn retry(error: FunError) -> Self {
        Self::Retry {
            error,
            retry_after: None,
            status: None,
            body: String::new(),
        }
    }

    pub fn response(error: FunError, status: u16, body: String, retry_after: Option<Duration>) -> Self {
        Self::Retry {
            error,
            retry_after,
            status: Some(status),
            body,
        }
    }
}

impl From<FunError> for AttemptError {
    fn from(error: FunError) -> Self {
        Self::Fail(error)
    }
}

/// Retry executor.
#[derive(Debug, Clone)]
pub struct Retry {
    config: RetryConfig,
}

impl Retry {
    pub fn new(config: RetryConfig) -> Self {
        Self { config }
    }

    /// Run `f` until it succeeds, fails permanently, or the attempts are
    /// exhausted. `f` receives the 1-based attempt number.
    pub async fn execute<F, Fut, T>(&self, cancel: &CancellationToken, mut f: F) -> Result<T>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = std::result::Result<T, AttemptError>>,
    {
        let max_attempts = self.config.max_attempts.max(1);
        let mut attempt = 0;

        loop {
            attempt += 1;

            let (error, retry_after, status, body) = match f(attempt).await {
                Ok(result) => return Ok(result),
                Err(AttemptError::Fail(error)) => return Err(error),
                Err(AttemptError::Retry {
                    error,
                    retry_after,
                    status,
                    body,
                }) => (error, retry_after, status, body),
            };

            if attempt >= max_attempts {
                warn!(attempt, error = %error, "Giving up retrying");
                return Err(FunError::GaveUpRetrying {
                    attempts: attempt,
                    status,
                    body,
                    message: error.to_string(),
                });
            }

            let delay = self.delay(attempt, retry_after);
            warn!(
                attempt,
                max_attempts,
                delay_ms = delay.as_millis(),
                error = %error,
                "Retrying after error"
            );

            tokio::select! {
                _ = sleep(delay) => {}
                _ = cancel.cancelled() => return Err(FunError::Cancelled),
            }
        }
    }

    /// Delay before the retry following `attempt`.
    pub fn delay(&self, attempt: u32, retry_after: Option<Duration>) -> Duration {
        let backoff = self.backoff(attempt);
        match retry_after {
            Some(retry_after) if retry_after > backoff => {
                debug!(
                    retry_after_ms = retry_after.as_millis(),
                    backoff_ms = backoff.as_millis(),
                    "Respecting Retry-After header"
                );
                retry_after.min(self.config.max_wait())
            }
            _ => backoff,
        }
    }

    /// Exponential backoff between the configured minimum and maximum wait,
    /// with jitter added on top.
    fn backoff(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(32) as i32;
        let base_ms = self.config.min_wait_ms as f64 * self.config.multiplier.max(1.0).powi(exponent);
        let max_ms = self.config.max_wait_ms as f64;
        let mut delay_ms = base_ms.min(max_ms);

        let jitter = self.config.jitter.clamp(0.0, 1.0);
        if jitter > 0.0 && delay_ms > 0.0 {
            delay_ms += rand::rng().random_range(0.0..=delay_ms * jitter);
        }
        Duration::from_micros((delay_ms.min(max_ms) * 1_000.0).round() as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn config() -> RetryConfig {
        RetryConfig {
            max_attempts: 3,
            min_wait_ms: 100,
            max_wait_ms: 1_000,
            multiplier: 2.0,
            jitter: 0.0,
        }
    }

    #[test]
    fn test_backoff_grows_and_caps() {
        let retry = Retry::new(config());
        assert_eq!(retry.delay(1, None), Duration::from_millis(100));
        assert_eq!(retry.delay(2, None), Duration::from_millis(200));
        assert_eq!(retry.delay(3, None), Duration::from_millis(400));
        assert_eq!(retry.delay(10, None), Duration::from_secs(1));
    }

    #[test]
    fn test_retry_after_is_lower_bound() {
        let retry = Retry::new(config());
        assert_eq!(
            retry.delay(1, Some(Duration::from_millis(500))),
            Duration::from_millis(500)
        );
        assert_eq!(
            retry.delay(3, Some(Duration::from_millis(10))),
            Duration::from_millis(400)
        );
        assert_eq!(retry.delay(1, Some(Duration::from_secs(60))), Duration::from_secs(1));
    }

    #[test]
    fn test_jitter_stays_within_bounds() {
        let retry = Retry::new(RetryConfig {
            jitter: 0.5,
            ..config()
        });
        for _ in 0..100 {
            let delay = retry.delay(1, None);
            assert!(delay >= Duration::from_millis(100));
            assert!(delay <= Duration::from_millis(150));
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_until_success() {
        let retry = Retry::new(config());
        let counter = Arc::new(AtomicU32::new(0));
        let cancel = CancellationToken::new();

        let result = retry
            .execute(&cancel, |_| {
                let counter = Arc::clone(&counter);
                async move {
                    let count = counter.fetch_add(1, Ordering::SeqCst);
                    if count < 2 {
                        Err(AttemptError::retry(FunError::malformed("bad", "")))
                    } else {
                        Ok("success")
                    }
                }
            })
            .await;

        assert_eq!(result.unwrap(), "success");
        assert_eq!(counter.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_gives_up_with_last_response() {
        let retry = Retry::new(config());
        let cancel = CancellationToken::new();

        let result: Result<()> = retry
            .execute(&cancel, |attempt| async move {
                Err(AttemptError::response(
                    FunError::ApiResponseError {
                        status: 503,
                        body: format!("down {attempt}"),
                    },
                    503,
                    format!("down {attempt}"),
                    None,
                ))
            })
            .await;

        match result.unwrap_err() {
            FunError::GaveUpRetrying {
                attempts,
                status,
                body,
                ..
            } => {
                assert_eq!(attempts, 3);
                assert_eq!(status, Some(503));
                assert_eq!(body, "down 3");
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_permanent_failure_not_retried() {
        let retry = Retry::new(config());
        let counter = Arc::new(AtomicU32::new(0));
        let cancel = CancellationToken::new();

        let result: Result<()> = retry
            .execute(&cancel, |_| {
                let counter = Arc::clone(&counter);
                async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                    Err(FunError::ApiResponseError {
                        status: 400,
                        body: "bad request".to_string(),
                    }
                    .into())
                }
            })
            .await;

        assert!(matches!(result, Err(FunError::ApiResponseError { status: 400, .. })));
        assert_eq!(counter.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_during_backoff() {
        let retry = Retry::new(RetryConfig {
            min_wait_ms: 60_000,
            max_wait_ms: 60_000,
            ..config()
        });
        let cancel = CancellationToken::new();
        let trigger = cancel.clone();

        let result: Result<()> = retry
            .execute(&cancel, |_| {
                let trigger = trigger.clone();
                async move {
                    trigger.cancel();
                    Err(AttemptError::retry(FunError::malformed("bad", "")))
                }
            })
            .await;

        assert!(matches!(result, Err(FunError::Cancelled)));
    }
}
