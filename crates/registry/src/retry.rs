//! Retry and timeout wrapper for backend calls.
//!
//! [`with_retry_timeout`] retries an operation on transient storage errors (connection
//! failures, timeouts) and bounds the whole attempt sequence, backoff sleeps included, by an
//! overall deadline. Non-transient errors (conflict, serialization, internal) are returned
//! immediately.
//!
//! # Backoff Strategy
//!
//! - Base delay doubles with each attempt: `initial_backoff * 2^attempt`
//! - Delay is capped at `max_backoff`
//! - Random jitter of 0 to 50% of the computed delay is added

use std::{future::Future, time::Duration};

use fail::fail_point;
use rand::Rng;

use crate::{
    config::RetryConfig,
    error::{StorageError, StorageResult},
    metrics::RegistryMetrics,
};

/// Executes `operation` with retry on transient errors.
///
/// Returns the first success, or the last error once retries are exhausted.
#[tracing::instrument(skip(config, metrics, operation), fields(max_retries = config.max_retries()))]
pub(crate) async fn with_retry<F, Fut, T>(
    config: &RetryConfig,
    metrics: &RegistryMetrics,
    operation_name: &str,
    mut operation: F,
) -> StorageResult<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = StorageResult<T>>,
{
    let mut attempt = 0;
    loop {
        match operation().await {
            Ok(value) => {
                if attempt > 0 {
                    tracing::debug!(operation = operation_name, attempt = attempt + 1, "operation succeeded after retry");
                }
                return Ok(value);
            },
            Err(err) if err.is_transient() && attempt < config.max_retries() => {
                metrics.record_retry();
                let delay = compute_backoff(config, attempt);
                tracing::debug!(
                    operation = operation_name,
                    attempt = attempt + 1,
                    max_attempts = config.max_retries() + 1,
                    delay_ms = delay.as_millis() as u64,
                    error = %err,
                    "transient error, retrying after backoff",
                );
                fail_point!("retry-before-sleep", |_| Err(err));
                tokio::time::sleep(delay).await;
                attempt += 1;
            },
            Err(err) => {
                if attempt > 0 && err.is_transient() {
                    metrics.record_retry_exhausted();
                }
                return Err(err);
            },
        }
    }
}

/// Executes `operation` with retry and an overall timeout.
///
/// When `timeout` elapses the in-flight attempt is dropped and
/// [`StorageError::Timeout`] is returned.
pub(crate) async fn with_retry_timeout<F, Fut, T>(
    config: &RetryConfig,
    timeout: Duration,
    metrics: &RegistryMetrics,
    operation_name: &str,
    operation: F,
) -> StorageResult<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = StorageResult<T>>,
{
    match tokio::time::timeout(timeout, with_retry(config, metrics, operation_name, operation)).await {
        Ok(result) => result,
        Err(_elapsed) => {
            metrics.record_timeout();
            tracing::warn!(operation = operation_name, timeout_ms = timeout.as_millis() as u64, "backend call timed out");
            Err(StorageError::timeout())
        },
    }
}

/// Backoff before retry number `attempt + 1`:
/// `min(initial_backoff * 2^attempt, max_backoff) + random(0..50% of delay)`.
fn compute_backoff(config: &RetryConfig, attempt: u32) -> Duration {
    let base = config.initial_backoff().saturating_mul(1u32.checked_shl(attempt).unwrap_or(u32::MAX));
    let capped = base.min(config.max_backoff());

    let jitter_range = capped.as_millis() as u64 / 2;
    if jitter_range > 0 {
        capped + Duration::from_millis(rand::thread_rng().gen_range(0..=jitter_range))
    } else {
        capped
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::panic)]
mod tests {
    use std::sync::atomic::{AtomicU32, Ordering};

    use super::*;

    fn config(max_retries: u32) -> RetryConfig {
        RetryConfig::builder()
            .max_retries(max_retries)
            .initial_backoff(Duration::from_millis(10))
            .max_backoff(Duration::from_millis(40))
            .build()
            .unwrap()
    }

    #[test]
    fn backoff_grows_and_caps() {
        let config = config(5);
        let d0 = compute_backoff(&config, 0);
        assert!(d0 >= Duration::from_millis(10) && d0 <= Duration::from_millis(15));
        let d1 = compute_backoff(&config, 1);
        assert!(d1 >= Duration::from_millis(20) && d1 <= Duration::from_millis(30));
        let d9 = compute_backoff(&config, 9);
        assert!(d9 >= Duration::from_millis(40) && d9 <= Duration::from_millis(60));
        let huge = compute_backoff(&config, 40);
        assert!(huge <= Duration::from_millis(60), "shift overflow saturates");
    }

    #[tokio::test(start_paused = true)]
    async fn transient_errors_are_retried() {
        let metrics = RegistryMetrics::default();
        let calls = AtomicU32::new(0);

        let result = with_retry(&config(3), &metrics, "get", || {
            let n = calls.fetch_add(1, Ordering::Relaxed);
            async move { if n < 2 { Err(StorageError::connection("reset")) } else { Ok(n) } }
        })
        .await;

        assert_eq!(result.unwrap(), 2);
        assert_eq!(metrics.snapshot().retries, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn permanent_errors_are_not_retried() {
        let metrics = RegistryMetrics::default();
        let calls = AtomicU32::new(0);

        let result: StorageResult<()> = with_retry(&config(3), &metrics, "insert", || {
            calls.fetch_add(1, Ordering::Relaxed);
            async { Err(StorageError::conflict("TGT-1")) }
        })
        .await;

        assert!(result.unwrap_err().is_conflict());
        assert_eq!(calls.load(Ordering::Relaxed), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn exhausted_retries_return_last_error() {
        let metrics = RegistryMetrics::default();
        let calls = AtomicU32::new(0);

        let result: StorageResult<()> = with_retry(&config(2), &metrics, "get", || {
            calls.fetch_add(1, Ordering::Relaxed);
            async { Err(StorageError::timeout()) }
        })
        .await;

        assert!(matches!(result, Err(StorageError::Timeout)));
        assert_eq!(calls.load(Ordering::Relaxed), 3);
        assert_eq!(metrics.snapshot().retries_exhausted, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn overall_timeout_cuts_slow_calls() {
        let metrics = RegistryMetrics::default();
        let result: StorageResult<()> =
            with_retry_timeout(&config(0), Duration::from_millis(100), &metrics, "get", || async {
                tokio::time::sleep(Duration::from_secs(10)).await;
                Ok(())
            })
            .await;

        assert!(matches!(result, Err(StorageError::Timeout)));
        assert_eq!(metrics.snapshot().timeouts, 1);
    }
}
