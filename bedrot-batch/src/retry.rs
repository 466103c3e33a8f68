//! Bounded retry with exponential backoff and jitter.

use rand::random;
use std::future::Future;
use std::time::Duration;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;
use tracing::warn;

use crate::{Error, Result};

/// How often and how patiently to retry a failing operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total attempts including the first one; at least 1.
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl RetryPolicy {
    pub fn new(max_attempts: u32) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            ..Self::default()
        }
    }

    pub fn with_delays(mut self, base_delay: Duration, max_delay: Duration) -> Self {
        self.base_delay = base_delay;
        self.max_delay = max_delay.max(base_delay);
        self
    }

    /// A single attempt, no retries.
    pub fn none() -> Self {
        Self::new(1)
    }

    /// Delay before retry number `retry` (0-based), capped, plus up to 25% jitter.
    pub fn delay_for(&self, retry: u32) -> Duration {
        let base_ms = self.base_delay.as_millis() as u64;
        let max_ms = self.max_delay.as_millis() as u64;
        let exp_ms = base_ms.saturating_mul(1u64 << retry.min(20));
        let capped_ms = exp_ms.min(max_ms);
        let jitter_ms = random::<u64>() % (capped_ms / 4 + 1);
        Duration::from_millis((capped_ms + jitter_ms).min(max_ms))
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(10),
        }
    }
}

/// Run `op` until it succeeds, fails with an error `retry_if` rejects, or the
/// policy runs out of attempts.
///
/// `op` receives the 0-based attempt number. Cancellation is checked before
/// every attempt and while backing off.
pub async fn retry_with_backoff<T, F, Fut, P>(
    op_name: &str,
    policy: RetryPolicy,
    cancel: &CancellationToken,
    retry_if: P,
    mut op: F,
) -> Result<T>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<T>>,
    P: Fn(&Error) -> bool,
{
    let max_attempts = policy.max_attempts.max(1);
    let mut attempt = 0u32;
    loop {
        if cancel.is_cancelled() {
            return Err(Error::Cancelled);
        }

        match op(attempt).await {
            Ok(value) => return Ok(value),
            Err(err) => {
                if err.is_cancelled() || !retry_if(&err) || attempt + 1 >= max_attempts {
                    return Err(err);
                }

                let delay = policy.delay_for(attempt);
                warn!(
                    "{} failed, retrying in {:?} (attempt {}/{}): {}",
                    op_name,
                    delay,
                    attempt + 2,
                    max_attempts,
                    err
                );

                tokio::select! {
                    _ = cancel.cancelled() => return Err(Error::Cancelled),
                    _ = sleep(delay) => {}
                }
                attempt += 1;
            }
        }
    }
}
