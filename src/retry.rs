use std::future::Future;
use std::time::Duration;

use tokio::time::{sleep, timeout};
use tracing::debug;

use crate::error::{LlmError, Result};

const BACKOFF_CAP: Duration = Duration::from_millis(500);

/// Runs `op` up to `retries + 1` times with a per-attempt timeout and a
/// doubling backoff capped at 500 ms. Returns the last error when every
/// attempt fails.
///
/// Not wired into the dispatchers; they surface upstream failures as-is.
pub async fn retry_with_backoff<T, F, Fut>(
    retries: u32,
    per_attempt: Duration,
    backoff: Duration,
    mut op: F,
) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let mut last_err: Option<LlmError> = None;

    for attempt in 0..=retries {
        match timeout(per_attempt, op()).await {
            Ok(Ok(value)) => return Ok(value),
            Ok(Err(e)) => {
                debug!(attempt, %e, "attempt failed");
                last_err = Some(e);
            }
            Err(_) => {
                last_err = Some(LlmError::Deadline {
                    message: format!("attempt {attempt} timed out after {per_attempt:?}"),
                });
            }
        }

        if attempt < retries {
            let shift = attempt.min(16);
            let pause = backoff.saturating_mul(1u32 << shift).min(BACKOFF_CAP);
            sleep(pause).await;
        }
    }

    Err(last_err.unwrap_or_else(|| LlmError::Config {
        message: "retry: no attempts were made".to_string(),
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use tokio::time::Instant;

    // stand-in for a bundled LLM call that fails a fixed number of times
    fn flaky_op(
        failures: usize,
        calls: Arc<AtomicUsize>,
    ) -> impl FnMut() -> std::pin::Pin<Box<dyn Future<Output = Result<String>> + Send>> {
        move || {
            let n = calls.fetch_add(1, Ordering::SeqCst);
            Box::pin(async move {
                if n < failures {
                    Err(LlmError::Upstream {
                        location: "mock",
                        message: "api: error".to_string(),
                    })
                } else {
                    Ok("answer".to_string())
                }
            })
        }
    }

    #[tokio::test(start_paused = true)]
    async fn succeeds_after_transient_failures() {
        let calls = Arc::new(AtomicUsize::new(0));
        let out = retry_with_backoff(
            3,
            Duration::from_secs(1),
            Duration::from_millis(50),
            flaky_op(2, Arc::clone(&calls)),
        )
        .await
        .unwrap();
        assert_eq!(out, "answer");
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn exhausted_retries_return_the_last_error() {
        let calls = Arc::new(AtomicUsize::new(0));
        let err = retry_with_backoff(
            2,
            Duration::from_secs(1),
            Duration::from_millis(50),
            flaky_op(10, Arc::clone(&calls)),
        )
        .await
        .unwrap_err();
        assert!(matches!(err, LlmError::Upstream { .. }));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn slow_attempts_time_out() {
        let err = retry_with_backoff(0, Duration::from_millis(100), Duration::from_millis(10), || async {
            sleep(Duration::from_secs(60)).await;
            Ok("never".to_string())
        })
        .await
        .unwrap_err();
        assert!(matches!(err, LlmError::Deadline { .. }));
    }

    #[tokio::test(start_paused = true)]
    async fn backoff_doubles_and_caps() {
        let calls = Arc::new(AtomicUsize::new(0));
        let start = Instant::now();
        let _ = retry_with_backoff(
            3,
            Duration::from_secs(1),
            Duration::from_millis(200),
            flaky_op(10, Arc::clone(&calls)),
        )
        .await;
        // pauses: 200ms, min(400, 500)=400ms, min(800, 500)=500ms
        let elapsed = start.elapsed();
        assert!(elapsed >= Duration::from_millis(1100), "elapsed {elapsed:?}");
        assert!(elapsed < Duration::from_millis(1500), "elapsed {elapsed:?}");
    }
}
