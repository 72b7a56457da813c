// HLS Retry Utility: Shared retry logic for segment and key fetching.
//
// Retries wait a linearly growing delay (k * step before the k-th retry) and
// can be interrupted by cancellation at any point.

use crate::DownloadError;
use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::warn;

/// Configuration for retry behavior.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Total number of attempts, including the first one.
    pub max_attempts: u32,
    /// Delay unit. The k-th retry waits `k * retry_step`.
    pub retry_step: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            retry_step: Duration::from_secs(1),
        }
    }
}

impl RetryPolicy {
    /// Delay before the given retry (1-indexed).
    pub fn delay_before_retry(&self, retry: u32) -> Duration {
        self.retry_step.saturating_mul(retry)
    }
}

/// Result of a single attempt, used by the caller to signal retryability.
pub enum RetryAction<T> {
    /// Operation succeeded.
    Success(T),
    /// Operation failed with a transient error.
    Retry(DownloadError),
    /// Operation failed with a permanent error.
    Fail(DownloadError),
}

/// Live count of tasks currently waiting out a retry delay.
#[derive(Debug, Clone, Default)]
pub struct SleepGauge(Arc<AtomicUsize>);

impl SleepGauge {
    pub fn current(&self) -> usize {
        self.0.load(Ordering::Relaxed)
    }

    fn enter(&self) -> SleepGuard<'_> {
        self.0.fetch_add(1, Ordering::Relaxed);
        SleepGuard(&self.0)
    }
}

struct SleepGuard<'a>(&'a AtomicUsize);

impl Drop for SleepGuard<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::Relaxed);
    }
}

/// Execute an async operation with retries.
///
/// The `operation` closure receives the current attempt number (0-indexed).
/// `token` is checked before every attempt and interrupts retry sleeps;
/// it does not abort an attempt that is already running.
pub async fn retry_with_backoff<F, Fut, T>(
    policy: &RetryPolicy,
    token: &CancellationToken,
    gauge: Option<&SleepGauge>,
    operation: F,
) -> Result<T, DownloadError>
where
    F: Fn(u32) -> Fut,
    Fut: Future<Output = RetryAction<T>>,
{
    let max_attempts = policy.max_attempts.max(1);
    let mut attempt = 0;
    loop {
        if token.is_cancelled() {
            return Err(DownloadError::Cancelled);
        }

        let err = match operation(attempt).await {
            RetryAction::Success(value) => return Ok(value),
            RetryAction::Fail(err) => return Err(err),
            RetryAction::Retry(err) => err,
        };

        attempt += 1;
        if attempt >= max_attempts {
            return Err(err);
        }

        let delay = policy.delay_before_retry(attempt);
        warn!(
            attempt,
            max = max_attempts,
            delay_ms = delay.as_millis() as u64,
            error = %err,
            "Retrying after transient error"
        );

        let _sleeping = gauge.map(SleepGauge::enter);
        tokio::select! {
            _ = token.cancelled() => {
                return Err(DownloadError::Cancelled);
            }
            _ = tokio::time::sleep(delay) => {}
        }
    }
}
