use crate::config::RemoteConfig;
use crate::error::{AppError, Result};
use std::future::Future;
use std::time::Duration;

/// Timeout and rate-limit backoff applied to each remote request.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    /// Per-attempt timeout.
    pub timeout: Duration,
    /// Retries after a rate-limit response.
    pub rate_limit_retries: u32,
    /// Sleep before each rate-limit retry.
    pub backoff: Duration,
}

impl From<&RemoteConfig> for RetryPolicy {
    fn from(config: &RemoteConfig) -> Self {
        Self {
            timeout: Duration::from_secs(config.request_timeout_seconds),
            rate_limit_retries: config.rate_limit_retries,
            backoff: Duration::from_secs(config.rate_limit_backoff_seconds),
        }
    }
}

impl RetryPolicy {
    /// Run `call`, retrying while the archive answers "too many requests".
    ///
    /// Other errors are returned as-is. Once retries are exhausted the last
    /// [`AppError::RateLimited`] is returned.
    pub async fn run<T, F, Fut>(&self, what: &str, mut call: F) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let mut retries = 0;
        loop {
            let outcome = tokio::time::timeout(self.timeout, call())
                .await
                .map_err(|_| AppError::Timeout(self.timeout.as_secs()))?;

            match outcome {
                Err(AppError::RateLimited(reason)) if retries < self.rate_limit_retries => {
                    retries += 1;
                    tracing::warn!(
                        call = what,
                        retry = retries,
                        delay_secs = self.backoff.as_secs(),
                        reason = %reason,
                        "Rate limited, backing off"
                    );
                    tokio::time::sleep(self.backoff).await;
                }
                other => return other,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn policy() -> RetryPolicy {
        RetryPolicy {
            timeout: Duration::from_millis(200),
            rate_limit_retries: 2,
            backoff: Duration::ZERO,
        }
    }

    #[tokio::test]
    async fn retries_rate_limits_then_succeeds() {
        let counter = AtomicU32::new(0);
        let calls = &counter;
        let result = policy()
            .run("list", move || async move {
                if calls.fetch_add(1, Ordering::SeqCst) < 2 {
                    Err(AppError::RateLimited("429".into()))
                } else {
                    Ok(7)
                }
            })
            .await;
        assert_eq!(result.unwrap(), 7);
        assert_eq!(counter.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn gives_up_after_bounded_retries() {
        let counter = AtomicU32::new(0);
        let calls = &counter;
        let result: Result<()> = policy()
            .run("list", move || async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Err(AppError::RateLimited("429".into()))
            })
            .await;
        assert!(matches!(result, Err(AppError::RateLimited(_))));
        assert_eq!(counter.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn other_errors_are_not_retried() {
        let counter = AtomicU32::new(0);
        let calls = &counter;
        let result: Result<()> = policy()
            .run("load", move || async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Err(AppError::NotFound("work 5".into()))
            })
            .await;
        assert!(matches!(result, Err(AppError::NotFound(_))));
        assert_eq!(counter.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn slow_calls_time_out() {
        let result: Result<()> = policy()
            .run("load", || async {
                tokio::time::sleep(Duration::from_secs(5)).await;
                Ok(())
            })
            .await;
        assert!(matches!(result, Err(AppError::Timeout(_))));
    }
}
