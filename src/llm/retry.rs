//! Bounded exponential backoff around a fallible operation.

use std::future::Future;
use std::time::Duration;

use rand::Rng;

use crate::config::RetryConfig;
use crate::llm::classifier::{FailoverReason, FailureSignal, classify};

/// Emitted before each backoff sleep.
#[derive(Debug, Clone)]
pub struct RetryEvent {
    /// Zero-based index of the attempt that just failed.
    pub attempt: u32,
    pub reason: FailoverReason,
    pub delay: Duration,
    pub message: String,
}

/// Delay before the retry that follows the failed `attempt`.
///
/// `min(base * 2^attempt, max)`, optionally scaled by ±20% jitter.
pub fn backoff_delay(config: &RetryConfig, attempt: u32) -> Duration {
    let factor = 2u32.saturating_pow(attempt);
    let delay = config
        .base_delay
        .checked_mul(factor)
        .unwrap_or(config.max_delay)
        .min(config.max_delay);
    if config.jitter {
        delay.mul_f64(rand::thread_rng().gen_range(0.8..=1.2))
    } else {
        delay
    }
}

/// Run `op` until it succeeds, fails with a non-retryable error, or the retry
/// budget is spent.
///
/// `op` receives the zero-based attempt number and is called at most
/// `max_retries + 1` times. A remote `retry-after` hint raises the delay but
/// never lowers it. `on_retry` fires before every sleep.
pub async fn with_retry<T, E, F, Fut, O>(config: &RetryConfig, on_retry: O, mut op: F) -> Result<T, E>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: FailureSignal,
    O: Fn(&RetryEvent),
{
    let mut attempt = 0u32;
    loop {
        let err = match op(attempt).await {
            Ok(value) => return Ok(value),
            Err(err) => err,
        };

        let reason = classify(&err);
        if !reason.is_retryable() {
            tracing::debug!(attempt, %reason, "Non-retryable failure, giving up");
            return Err(err);
        }
        if attempt >= config.max_retries {
            tracing::debug!(attempt, %reason, "Retry budget exhausted");
            return Err(err);
        }

        let mut delay = backoff_delay(config, attempt);
        if let Some(hint) = err.retry_after() {
            delay = delay.max(hint);
        }

        let event = RetryEvent {
            attempt,
            reason,
            delay,
            message: err.failure_message(),
        };
        tracing::warn!(
            attempt,
            %reason,
            delay_ms = delay.as_millis() as u64,
            "Retryable failure, backing off"
        );
        on_retry(&event);

        tokio::time::sleep(delay).await;
        attempt += 1;
    }
}
