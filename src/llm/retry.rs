//! Bounded retry with exponential backoff and a per-attempt timeout.

use std::future::Future;
use std::time::Duration;

use rand::Rng;
use tracing::warn;

use crate::config::RetryConfig;
use crate::error::{LlmError, PipelineError};

/// Delay before attempt `attempt + 1` (attempts are 1-based).
pub(crate) fn backoff_delay(policy: &RetryConfig, attempt: u32) -> Duration {
    if policy.base_delay.is_zero() {
        return Duration::ZERO;
    }
    let exp = policy.base_delay.saturating_mul(1u32 << (attempt - 1).min(10));
    let jitter_ms = rand::thread_rng().gen_range(0..=policy.base_delay.as_millis() as u64 / 4);
    exp + Duration::from_millis(jitter_ms)
}

/// Run `call` until it succeeds, fails with a non-retryable error, or the
/// attempt budget is spent. Each attempt is bounded by `timeout`.
///
/// `call` receives the 1-based attempt number.
pub async fn with_retry<T, F, Fut>(
    policy: RetryConfig,
    timeout: Duration,
    operation: &str,
    mut call: F,
) -> Result<T, PipelineError>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<T, PipelineError>>,
{
    let mut attempt = 1;
    loop {
        let result = match tokio::time::timeout(timeout, call(attempt)).await {
            Ok(result) => result,
            Err(_) => Err(PipelineError::Llm(LlmError::Timeout {
                operation: operation.to_string(),
                timeout,
            })),
        };

        let err = match result {
            Ok(value) => return Ok(value),
            Err(err) => err,
        };

        if attempt >= policy.max_attempts || !err.is_retryable() {
            return Err(err);
        }

        let mut delay = backoff_delay(&policy, attempt);
        if let PipelineError::Llm(LlmError::RateLimited {
            retry_after: Some(after),
            ..
        }) = &err
        {
            delay = delay.max(*after);
        }

        warn!(
            operation,
            attempt,
            max_attempts = policy.max_attempts,
            delay_ms = delay.as_millis() as u64,
            error = %err,
            "Call failed, retrying"
        );
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        attempt += 1;
    }
}
