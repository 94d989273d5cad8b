// Retry Helpers
// Exponential backoff for flaky remote operations such as asset downloads

use crate::parser::models::RetryPolicy;

use std::fmt::Display;
use std::future::Future;
use std::time::Duration;

/// Delay before a retry: `base * 2^retry_count` (0 = first retry), capped at `max`
pub fn retry_delay(retry_count: u32, base: Duration, max: Duration) -> Duration {
    let multiplier = 2_u32.saturating_pow(retry_count);
    base.saturating_mul(multiplier).min(max)
}

/// Run `op` until it succeeds, fails with an error `should_retry` rejects, or
/// `policy.max_attempts` attempts are used up. The last error is returned.
pub async fn with_retry<T, E, F, Fut, R>(
    policy: &RetryPolicy,
    label: &str,
    should_retry: R,
    mut op: F,
) -> Result<T, E>
where
    E: Display,
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<T, E>>,
    R: Fn(&E) -> bool,
{
    let max_attempts = policy.max_attempts.max(1);
    let base = Duration::from_millis(policy.backoff_ms);
    let max_delay = Duration::from_millis(policy.max_backoff_ms);
    let mut attempt = 1;

    loop {
        match op(attempt).await {
            Ok(value) => return Ok(value),
            Err(e) if attempt < max_attempts && should_retry(&e) => {
                let delay = retry_delay(attempt - 1, base, max_delay);
                tracing::warn!(
                    operation = label,
                    attempt,
                    max_attempts,
                    delay_ms = delay.as_millis() as u64,
                    error = %e,
                    "attempt failed, retrying"
                );
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
            Err(e) => return Err(e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn policy(max_attempts: u32) -> RetryPolicy {
        RetryPolicy {
            max_attempts,
            backoff_ms: 1,
            max_backoff_ms: 5,
        }
    }

    #[test]
    fn test_retry_delay_basic() {
        let base = Duration::from_millis(100);
        let max = Duration::from_secs(60);
        assert_eq!(retry_delay(0, base, max), Duration::from_millis(100));
        assert_eq!(retry_delay(1, base, max), Duration::from_millis(200));
        assert_eq!(retry_delay(3, base, max), Duration::from_millis(800));
    }

    #[test]
    fn test_retry_delay_is_capped() {
        let base = Duration::from_millis(500);
        let max = Duration::from_secs(2);
        assert_eq!(retry_delay(2, base, max), Duration::from_secs(2));
        assert_eq!(retry_delay(40, Duration::from_secs(u64::MAX / 2), max), max);
        assert_eq!(retry_delay(10, Duration::ZERO, max), Duration::ZERO);
    }

    #[tokio::test]
    async fn test_with_retry_succeeds_after_failures() {
        let calls = AtomicU32::new(0);
        let result: Result<&str, String> = with_retry(&policy(3), "test", |_| true, |attempt| {
            calls.fetch_add(1, Ordering::SeqCst);
            async move {
                if attempt < 3 {
                    Err(format!("attempt {} failed", attempt))
                } else {
                    Ok("done")
                }
            }
        })
        .await;

        assert_eq!(result, Ok("done"));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_with_retry_returns_last_error() {
        let calls = AtomicU32::new(0);
        let result: Result<(), String> = with_retry(&policy(2), "test", |_| true, |attempt| {
            calls.fetch_add(1, Ordering::SeqCst);
            async move { Err(format!("failure {}", attempt)) }
        })
        .await;

        assert_eq!(result, Err("failure 2".to_string()));
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_zero_attempts_still_runs_once() {
        let result: Result<u8, String> =
            with_retry(&policy(0), "test", |_| true, |_| async { Ok(7) }).await;
        assert_eq!(result, Ok(7));
    }

    #[tokio::test]
    async fn test_permanent_errors_are_not_retried() {
        let calls = AtomicU32::new(0);
        let result: Result<(), String> = with_retry(
            &policy(5),
            "test",
            |e: &String| e.starts_with("transient"),
            |attempt| {
                calls.fetch_add(1, Ordering::SeqCst);
                async move {
                    if attempt == 1 {
                        Err("transient hiccup".to_string())
                    } else {
                        Err("not found".to_string())
                    }
                }
            },
        )
        .await;

        assert_eq!(result, Err("not found".to_string()));
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }
}
