//! Retry policies: exponential backoff for transient storage failures and
//! fixed backoff for acquisition attempts.

use std::future::Future;
use std::time::Duration;

use crate::error::StintError;

/// Backoff for transient storage failures at the persistence boundary.
///
/// delay = base_delay * multiplier^(attempt - 1)
#[derive(Debug, Clone)]
pub struct StorageRetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub multiplier: f64,
}

impl Default for StorageRetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 4,
            base_delay: Duration::from_millis(200),
            multiplier: 2.0,
        }
    }
}

impl StorageRetryPolicy {
    pub fn next_delay(&self, attempt: u32) -> Duration {
        let base = self.base_delay.as_secs_f64();
        Duration::from_secs_f64(base * self.multiplier.powi(attempt.saturating_sub(1) as i32))
    }
}

/// Run `op`, retrying transient failures per `policy`. Non-transient errors
/// propagate immediately; an exhausted transient failure surfaces as an
/// `Execution` error wrapping the last cause.
pub async fn retry_transient<T, F, Fut>(
    policy: &StorageRetryPolicy,
    mut op: F,
) -> Result<T, StintError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, StintError>>,
{
    let mut attempt = 0;
    loop {
        attempt += 1;
        match op().await {
            Ok(value) => return Ok(value),
            Err(e) if e.is_transient() && attempt < policy.max_attempts => {
                tracing::warn!(attempt, error = %e, "transient storage failure, retrying");
                tokio::time::sleep(policy.next_delay(attempt)).await;
            }
            Err(e) if e.is_transient() => return Err(e.retries_exhausted(attempt)),
            Err(e) => return Err(e),
        }
    }
}

/// Fixed backoff for token / critical-section acquisition. `Denied` is a
/// normal outcome, so the caller retries a bounded number of times instead
/// of blocking indefinitely.
#[derive(Debug, Clone)]
pub struct AcquisitionRetry {
    pub attempts: u32,
    pub delay: Duration,
}

impl Default for AcquisitionRetry {
    fn default() -> Self {
        Self {
            attempts: 3,
            delay: Duration::from_secs(20),
        }
    }
}

impl AcquisitionRetry {
    pub fn none() -> Self {
        Self {
            attempts: 1,
            delay: Duration::ZERO,
        }
    }
}
