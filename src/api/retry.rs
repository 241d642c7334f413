// Retry executor - exponential backoff with jitter around a single upstream call

use rand::Rng;
use std::fmt::Display;
use std::future::Future;
use std::time::Duration;

use crate::config::RetryConfig;
use crate::error::RetryClassify;

#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Retries after the first attempt; total attempts are `max_retries + 1`
    pub max_retries: u32,
    pub base_delay: Duration,
    pub max_jitter: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_millis(1000),
            max_jitter: Duration::from_millis(1000),
        }
    }
}

impl From<&RetryConfig> for RetryPolicy {
    fn from(config: &RetryConfig) -> Self {
        Self {
            max_retries: config.max_retries,
            base_delay: Duration::from_millis(config.base_delay_ms),
            max_jitter: Duration::from_millis(config.max_jitter_ms),
        }
    }
}

impl RetryPolicy {
    /// `base * 2^attempt + jitter`, attempt being 0 for the first retry.
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let backoff = self.base_delay.saturating_mul(1u32 << attempt.min(16));
        let jitter_ms = self.max_jitter.as_millis() as u64;
        let jitter = if jitter_ms == 0 {
            0
        } else {
            rand::rng().random_range(0..=jitter_ms)
        };
        backoff.saturating_add(Duration::from_millis(jitter))
    }

    /// Run `invoke` until it succeeds, fails with a client error, or the
    /// retries are used up. The last error is returned in the failure cases.
    pub async fn run<F, Fut, T, E>(&self, label: &str, mut invoke: F) -> Result<T, E>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: RetryClassify + Display,
    {
        let mut attempt = 0;
        loop {
            match invoke().await {
                Ok(value) => {
                    if attempt > 0 {
                        tracing::info!("[Retry] {} recovered after {} retries", label, attempt);
                    }
                    return Ok(value);
                }
                Err(err) => {
                    if !err.is_retryable() {
                        tracing::debug!(
                            "[Retry] {} failed with non-retryable error: {}",
                            label,
                            err
                        );
                        return Err(err);
                    }
                    if attempt >= self.max_retries {
                        tracing::warn!(
                            "[Retry] {} giving up after {} attempts: {}",
                            label,
                            attempt + 1,
                            err
                        );
                        return Err(err);
                    }
                    let delay = self.delay_for_attempt(attempt);
                    tracing::warn!(
                        "[Retry] {} attempt {} failed: {}, retrying in {:?}",
                        label,
                        attempt + 1,
                        err,
                        delay
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[derive(Debug)]
    struct StatusError(Option<u16>);

    impl Display for StatusError {
        fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
            write!(f, "status {:?}", self.0)
        }
    }

    impl RetryClassify for StatusError {
        fn status_code(&self) -> Option<u16> {
            self.0
        }
    }

    fn fast_policy(max_retries: u32) -> RetryPolicy {
        RetryPolicy {
            max_retries,
            base_delay: Duration::from_millis(1),
            max_jitter: Duration::ZERO,
        }
    }

    #[tokio::test]
    async fn test_client_error_attempted_once() {
        let attempts = AtomicU32::new(0);
        let result: Result<(), _> = fast_policy(3)
            .run("test", || async {
                attempts.fetch_add(1, Ordering::SeqCst);
                Err(StatusError(Some(404)))
            })
            .await;
        assert!(result.is_err());
        assert_eq!(attempts.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_server_error_then_success() {
        let attempts = AtomicU32::new(0);
        let result = fast_policy(3)
            .run("test", || async {
                let n = attempts.fetch_add(1, Ordering::SeqCst);
                if n < 2 {
                    Err(StatusError(Some(503)))
                } else {
                    Ok("ok")
                }
            })
            .await;
        assert_eq!(result.unwrap(), "ok");
        assert_eq!(attempts.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_attempts_bounded_by_max_retries() {
        let attempts = AtomicU32::new(0);
        let result: Result<(), _> = fast_policy(2)
            .run("test", || async {
                attempts.fetch_add(1, Ordering::SeqCst);
                Err(StatusError(None))
            })
            .await;
        assert_eq!(result.unwrap_err().0, None);
        assert_eq!(attempts.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn test_delay_grows_exponentially_with_bounded_jitter() {
        let policy = RetryPolicy {
            max_retries: 3,
            base_delay: Duration::from_millis(100),
            max_jitter: Duration::from_millis(50),
        };
        for attempt in 0..3 {
            let delay = policy.delay_for_attempt(attempt);
            let base = Duration::from_millis(100 * (1 << attempt));
            assert!(delay >= base);
            assert!(delay <= base + Duration::from_millis(50));
        }
    }
}
