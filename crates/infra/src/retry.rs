//! Bounded async retries with backoff.

use std::fmt::Display;
use std::future::Future;

use tracing::warn;

use swarmrouter_core::RetryPolicy;

/// Run `op` until it succeeds or the policy's attempts are used up.
///
/// `op` receives the 1-indexed attempt number. The last error is returned.
pub async fn with_retry<T, E, F, Fut>(policy: &RetryPolicy, operation: &str, op: F) -> Result<T, E>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: Display,
{
    retry_if(policy, operation, op, |_| true).await
}

/// Like [`with_retry`], but stops early on errors `retryable` rejects.
pub async fn retry_if<T, E, F, Fut, P>(
    policy: &RetryPolicy,
    operation: &str,
    mut op: F,
    retryable: P,
) -> Result<T, E>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: Display,
    P: Fn(&E) -> bool,
{
    let attempts = policy.attempts();
    let mut attempt = 1;
    loop {
        match op(attempt).await {
            Ok(value) => return Ok(value),
            Err(err) if attempt < attempts && retryable(&err) => {
                let delay = policy.delay_for_attempt(attempt);
                warn!(
                    operation,
                    attempt,
                    attempts,
                    delay_ms = delay.as_millis() as u64,
                    error = %err,
                    "attempt failed, retrying"
                );
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
            Err(err) => {
                warn!(operation, attempt, attempts, error = %err, "giving up");
                return Err(err);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::time::Duration;

    fn fast(attempts: u32) -> RetryPolicy {
        RetryPolicy::exponential(attempts, Duration::from_millis(1), Duration::from_millis(4))
    }

    #[tokio::test]
    async fn succeeds_after_transient_failures() {
        let calls = AtomicU32::new(0);
        let out: Result<u32, String> = with_retry(&fast(3), "flaky", |attempt| {
            calls.fetch_add(1, Ordering::SeqCst);
            async move {
                if attempt < 3 {
                    Err(format!("fail {attempt}"))
                } else {
                    Ok(attempt)
                }
            }
        })
        .await;

        assert_eq!(out, Ok(3));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn returns_last_error_when_exhausted() {
        let out: Result<(), String> =
            with_retry(&fast(2), "down", |attempt| async move { Err(format!("fail {attempt}")) }).await;
        assert_eq!(out, Err("fail 2".to_string()));
    }

    #[tokio::test]
    async fn stops_on_non_retryable_error() {
        let calls = AtomicU32::new(0);
        let out: Result<(), String> = retry_if(
            &fast(5),
            "unconfigured",
            |_| {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Err("not configured".to_string()) }
            },
            |e| e != "not configured",
        )
        .await;

        assert!(out.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
