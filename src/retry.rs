//! Bounded retry with exponential backoff for backend calls
//!
//! Every network call in a session (ASR request, LLM connection, TTS request)
//! goes through [`retry_with_backoff`]. Each attempt carries its own timeout;
//! a timed-out attempt is treated exactly like a transient network failure.
//! Permanent failures (auth, malformed protocol) return immediately.

use std::fmt::Display;
use std::future::Future;
use std::time::{Duration, SystemTime};

use tokio_util::sync::CancellationToken;

/// Errors that can be classified for retry purposes
pub trait Retryable: Sized {
    /// Whether another attempt might succeed
    fn is_transient(&self) -> bool;

    /// Value representing an attempt that exceeded its timeout
    fn timed_out(after: Duration) -> Self;

    /// Value representing an attempt abandoned because the session was cancelled
    fn cancelled() -> Self;
}

/// Retry policy for backend calls
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total attempts including the first one
    pub max_attempts: u32,
    /// Delay before the first retry (doubles each attempt)
    pub base_delay: Duration,
    /// Maximum delay cap
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_millis(300),
            max_delay: Duration::from_secs(5),
        }
    }
}

/// Compute the delay before retry number `retry` (0-based).
///
/// `min(base_delay * 2^retry + jitter, max_delay)`, where jitter is 0-25% of
/// the doubled base derived from the system clock's subsecond nanos.
#[must_use]
pub fn delay_for_attempt(policy: &RetryPolicy, retry: u32) -> Duration {
    let base = policy
        .base_delay
        .saturating_mul(2u32.saturating_pow(retry))
        .min(policy.max_delay);

    let jitter_nanos = SystemTime::now()
        .duration_since(SystemTime::UNIX_EPOCH)
        .unwrap_or_default()
        .subsec_nanos();
    let jitter_fraction = f64::from(jitter_nanos % 250) / 1000.0;

    (base + base.mul_f64(jitter_fraction)).min(policy.max_delay)
}

/// Run `op` until it succeeds, fails permanently, or exhausts the policy.
///
/// `op` receives the 1-based attempt number. Each attempt is bounded by
/// `call_timeout`; cancellation is observed both during an attempt and
/// during the backoff sleep.
///
/// # Errors
///
/// Returns the last error once attempts are exhausted, the first permanent
/// error, or `E::cancelled()` if `cancel` fires.
pub async fn retry_with_backoff<T, E, F, Fut>(
    policy: &RetryPolicy,
    call_timeout: Duration,
    cancel: &CancellationToken,
    operation: &str,
    mut op: F,
) -> Result<T, E>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: Retryable + Display,
{
    let max_attempts = policy.max_attempts.max(1);
    let mut attempt = 0;

    loop {
        attempt += 1;

        let outcome = tokio::select! {
            biased;
            () = cancel.cancelled() => return Err(E::cancelled()),
            result = tokio::time::timeout(call_timeout, op(attempt)) => {
                result.unwrap_or_else(|_| Err(E::timed_out(call_timeout)))
            }
        };

        let error = match outcome {
            Ok(value) => {
                if attempt > 1 {
                    tracing::debug!(operation, attempt, "succeeded after retry");
                }
                return Ok(value);
            }
            Err(e) => e,
        };

        if !error.is_transient() {
            tracing::warn!(operation, attempt, error = %error, "permanent failure, not retrying");
            return Err(error);
        }

        if attempt >= max_attempts {
            tracing::warn!(operation, attempt, error = %error, "retries exhausted");
            return Err(error);
        }

        let delay = delay_for_attempt(policy, attempt - 1);
        tracing::warn!(
            operation,
            attempt,
            max_attempts,
            delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
            error = %error,
            "transient failure, retrying"
        );

        tokio::select! {
            biased;
            () = cancel.cancelled() => return Err(E::cancelled()),
            () = tokio::time::sleep(delay) => {}
        }
    }
}
