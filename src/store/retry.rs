//! Retry wrapper for store operations.
//!
//! Every store operation runs under `execute_with_retry`: exponential backoff
//! plus jitter, bounded by the configured attempt count. No transient vs.
//! permanent classification happens here: all failures retry, and the final
//! failure surfaces as `RetryExhausted` wrapping the last cause.

use std::future::Future;
use std::time::Duration;

use crate::types::error::StorageError;

/// Backoff policy for store operations.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub base_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_millis(100),
        }
    }
}

impl RetryPolicy {
    /// Delay before the given retry attempt (0-based), with jitter.
    fn delay_for_attempt(&self, attempt: u32) -> Duration {
        use rand::Rng;
        let backoff = self.base_delay.saturating_mul(1u32 << attempt.min(16));
        let jitter_cap = (self.base_delay.as_millis() as u64 / 2).max(1);
        let jitter = rand::thread_rng().gen_range(0..jitter_cap);
        backoff + Duration::from_millis(jitter)
    }
}

/// Run `op`, retrying on any failure per the policy.
pub async fn execute_with_retry<T, F, Fut>(
    operation: &str,
    policy: &RetryPolicy,
    mut op: F,
) -> Result<T, StorageError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, StorageError>>,
{
    let attempts = policy.max_retries.max(1);
    let mut last_error: Option<StorageError> = None;

    for attempt in 0..attempts {
        match op().await {
            Ok(value) => return Ok(value),
            Err(e) => {
                if attempt + 1 < attempts {
                    let delay = policy.delay_for_attempt(attempt);
                    tracing::debug!(
                        operation,
                        attempt = attempt + 1,
                        delay_ms = delay.as_millis() as u64,
                        "store operation failed, retrying: {e}"
                    );
                    tokio::time::sleep(delay).await;
                }
                last_error = Some(e);
            }
        }
    }

    let last = last_error.expect("at least one attempt ran");
    Err(StorageError::RetryExhausted {
        operation: operation.to_string(),
        attempts,
        last_error: last.to_string(),
    })
}
