//! Bounded exponential backoff for external calls.
//!
//! Only errors classified as [`PipelineError::Transient`] are retried.
//! HTTP backends use [`status_error`] and [`send_error`] to classify
//! failures: 429, 5xx, connection failures, and request timeouts are
//! transient; other 4xx responses fail immediately.

use std::future::Future;
use std::time::Duration;

use anyhow::Result;
use docent_core::error::{is_transient, PipelineError};

/// Backoff is capped at this multiple of the initial delay.
const MAX_BACKOFF_FACTOR: u32 = 32;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub initial_backoff: Duration,
}

impl RetryPolicy {
    pub fn new(max_retries: u32, initial_backoff_ms: u64) -> Self {
        Self {
            max_retries,
            initial_backoff: Duration::from_millis(initial_backoff_ms),
        }
    }

    /// Delay before retry number `attempt` (1-based): initial, 2x, 4x, ...
    /// capped at 32x.
    pub fn delay(&self, attempt: u32) -> Duration {
        let factor = 1u32 << attempt.saturating_sub(1).min(5);
        self.initial_backoff * factor.min(MAX_BACKOFF_FACTOR)
    }
}

/// Run `op` until it succeeds, fails with a non-transient error, or the
/// retry budget is spent. The last error is returned.
pub async fn with_retry<T, F, Fut>(policy: RetryPolicy, what: &str, mut op: F) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let mut attempt = 0u32;
    loop {
        match op().await {
            Ok(v) => return Ok(v),
            Err(e) if attempt < policy.max_retries && is_transient(&e) => {
                attempt += 1;
                let delay = policy.delay(attempt);
                tracing::warn!(
                    what,
                    attempt,
                    max_retries = policy.max_retries,
                    delay_ms = delay.as_millis() as u64,
                    error = %format!("{:#}", e),
                    "transient failure, retrying"
                );
                tokio::time::sleep(delay).await;
            }
            Err(e) => return Err(e),
        }
    }
}

/// Classify a non-success HTTP response.
pub fn status_error(service: &str, status: reqwest::StatusCode, body: &str) -> anyhow::Error {
    let message = format!("{} API error {}: {}", service, status, body);
    if status.as_u16() == 429 || status.is_server_error() {
        PipelineError::Transient(message).into()
    } else {
        anyhow::anyhow!(message)
    }
}

/// Classify a failure to get any HTTP response.
pub fn send_error(service: &str, err: reqwest::Error) -> anyhow::Error {
    if err.is_timeout() || err.is_connect() || err.is_request() {
        PipelineError::Transient(format!("{} connection error: {}", service, err)).into()
    } else {
        anyhow::anyhow!("{} request failed: {}", service, err)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[test]
    fn test_delay_doubles_and_caps() {
        let p = RetryPolicy::new(10, 100);
        assert_eq!(p.delay(1), Duration::from_millis(100));
        assert_eq!(p.delay(2), Duration::from_millis(200));
        assert_eq!(p.delay(4), Duration::from_millis(800));
        assert_eq!(p.delay(6), Duration::from_millis(3200));
        assert_eq!(p.delay(9), Duration::from_millis(3200));
    }

    #[tokio::test]
    async fn test_retries_transient_until_success() {
        let counter = AtomicU32::new(0);
        let calls = &counter;
        let out = with_retry(RetryPolicy::new(3, 1), "test", || async move {
            let n = calls.fetch_add(1, Ordering::SeqCst);
            if n < 2 {
                Err(anyhow::Error::from(PipelineError::Transient("busy".into())))
            } else {
                Ok(n)
            }
        })
        .await
        .unwrap();
        assert_eq!(out, 2);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_gives_up_after_budget() {
        let counter = AtomicU32::new(0);
        let calls = &counter;
        let res: Result<()> = with_retry(RetryPolicy::new(2, 1), "test", || async move {
            calls.fetch_add(1, Ordering::SeqCst);
            Err(anyhow::Error::from(PipelineError::Transient("busy".into())))
        })
        .await;
        assert!(res.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_permanent_errors_not_retried() {
        let counter = AtomicU32::new(0);
        let calls = &counter;
        let res: Result<()> = with_retry(RetryPolicy::new(5, 1), "test", || async move {
            calls.fetch_add(1, Ordering::SeqCst);
            Err(anyhow::anyhow!("HTTP 401"))
        })
        .await;
        assert!(res.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_status_classification() {
        let e = status_error("OpenAI", reqwest::StatusCode::TOO_MANY_REQUESTS, "slow down");
        assert!(is_transient(&e));
        let e = status_error("OpenAI", reqwest::StatusCode::BAD_GATEWAY, "");
        assert!(is_transient(&e));
        let e = status_error("OpenAI", reqwest::StatusCode::UNAUTHORIZED, "bad key");
        assert!(!is_transient(&e));
    }
}
