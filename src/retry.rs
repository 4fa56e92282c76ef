//! Cancellation-aware retry and backoff helpers.
//!
//! Replaces ad-hoc timer loops: callers state an attempt budget and a base
//! delay, the helper owns the exponential growth and the cancellation check
//! between attempts.

use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::errors::ServiceError;

/// Delay never grows beyond this between attempts.
const MAX_DELAY: Duration = Duration::from_secs(30);

/// Sleep that returns early (with `false`) when the token fires.
pub async fn sleep_cancellable(duration: Duration, cancel: &CancellationToken) -> bool {
    tokio::select! {
        biased;
        _ = cancel.cancelled() => false,
        _ = tokio::time::sleep(duration) => true,
    }
}

/// Exponential delay for a 1-based attempt number.
pub fn backoff_delay(base: Duration, attempt: u32) -> Duration {
    let factor = 2u32.saturating_pow(attempt.saturating_sub(1));
    base.saturating_mul(factor).min(MAX_DELAY)
}

/// Run `op` up to `attempts` times, backing off between recoverable service
/// failures. Unrecoverable errors (cancellation, malformed payloads) return
/// immediately.
pub async fn retry_service<T, F, Fut>(
    label: &str,
    attempts: u32,
    base_delay: Duration,
    cancel: &CancellationToken,
    mut op: F,
) -> Result<T, ServiceError>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<T, ServiceError>>,
{
    let mut last_err = ServiceError::Cancelled;
    for attempt in 1..=attempts.max(1) {
        if cancel.is_cancelled() {
            return Err(ServiceError::Cancelled);
        }
        match op(attempt).await {
            Ok(value) => return Ok(value),
            Err(err) if err.is_recoverable() && attempt < attempts => {
                let delay = backoff_delay(base_delay, attempt);
                debug!(label, attempt, ?delay, error = %err, "retrying after failure");
                if !sleep_cancellable(delay, cancel).await {
                    return Err(ServiceError::Cancelled);
                }
                last_err = err;
            }
            Err(err) => return Err(err),
        }
    }
    Err(last_err)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[test]
    fn test_backoff_grows_and_caps() {
        let base = Duration::from_millis(500);
        assert_eq!(backoff_delay(base, 1), Duration::from_millis(500));
        assert_eq!(backoff_delay(base, 2), Duration::from_secs(1));
        assert_eq!(backoff_delay(base, 3), Duration::from_secs(2));
        assert_eq!(backoff_delay(base, 30), MAX_DELAY);
    }

    #[tokio::test]
    async fn test_retry_succeeds_after_transient_failures() {
        let calls = Arc::new(AtomicU32::new(0));
        let counter = calls.clone();
        let cancel = CancellationToken::new();

        let result = retry_service("test", 3, Duration::from_millis(1), &cancel, move |_| {
            let counter = counter.clone();
            async move {
                if counter.fetch_add(1, Ordering::SeqCst) < 2 {
                    Err(ServiceError::Stream("transient".into()))
                } else {
                    Ok(42)
                }
            }
        })
        .await;

        assert_eq!(result.unwrap(), 42);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_retry_gives_up_after_budget() {
        let cancel = CancellationToken::new();
        let result: Result<(), _> =
            retry_service("test", 2, Duration::from_millis(1), &cancel, |_| async {
                Err(ServiceError::Stream("always".into()))
            })
            .await;
        assert!(matches!(result, Err(ServiceError::Stream(_))));
    }

    #[tokio::test]
    async fn test_retry_stops_on_unrecoverable() {
        let calls = Arc::new(AtomicU32::new(0));
        let counter = calls.clone();
        let cancel = CancellationToken::new();

        let result: Result<(), _> =
            retry_service("test", 5, Duration::from_millis(1), &cancel, move |_| {
                let counter = counter.clone();
                async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                    Err(ServiceError::Cancelled)
                }
            })
            .await;

        assert!(matches!(result, Err(ServiceError::Cancelled)));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_cancelled_token_short_circuits() {
        let cancel = CancellationToken::new();
        cancel.cancel();
        let result: Result<(), _> =
            retry_service("test", 3, Duration::from_secs(1), &cancel, |_| async {
                panic!("must not run")
            })
            .await;
        assert!(matches!(result, Err(ServiceError::Cancelled)));
    }

    #[tokio::test]
    async fn test_sleep_cancellable_interrupted() {
        let cancel = CancellationToken::new();
        cancel.cancel();
        assert!(!sleep_cancellable(Duration::from_secs(60), &cancel).await);
    }
}
