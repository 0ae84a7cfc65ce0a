//! Bounded retries for store calls
//!
//! Every store call made by a cycle goes through [`RetryPolicy::run`]: it is
//! wrapped in the per-call timeout, and transient failures are retried with
//! exponential backoff plus jitter until either `max_retries` or the cycle
//! deadline runs out.

use std::future::Future;
use std::time::Duration;
use tokio::time::Instant;
use tracing::debug;

use crate::config::BalancerConfig;
use crate::error::{HostError, Result};

/// Maximum random jitter added to a backoff delay
const MAX_JITTER_MS: u64 = 50;

#[derive(Debug, Clone)]
pub(crate) struct RetryPolicy {
    call_timeout: Duration,
    max_retries: u32,
    base_delay: Duration,
    max_delay: Duration,
}

impl RetryPolicy {
    pub(crate) fn from_config(config: &BalancerConfig) -> Self {
        Self {
            call_timeout: config.store_call_timeout(),
            max_retries: config.max_retries,
            base_delay: config.retry_base_delay(),
            max_delay: config.max_retry_delay(),
        }
    }

    /// Delay before retry number `attempt` (zero based)
    pub(crate) fn backoff_delay(&self, attempt: u32) -> Duration {
        let base_ms = self.base_delay.as_millis() as u64;
        let exp_ms = base_ms.saturating_mul(1u64 << attempt.min(16));
        let capped_ms = exp_ms.min(self.max_delay.as_millis() as u64);
        let jitter_ms = rand::random::<u64>() % (MAX_JITTER_MS.min(capped_ms / 2) + 1);
        Duration::from_millis(capped_ms + jitter_ms)
    }

    /// Run one store call with timeout and retries
    ///
    /// Returns the first non-retriable result, or the last error once the
    /// retry budget or the deadline is exhausted. Each attempt reports to
    /// `on_retry` so the caller can count retries.
    pub(crate) async fn run<T, F, Fut>(
        &self,
        operation: &'static str,
        deadline: Instant,
        mut on_retry: impl FnMut(),
        mut call: F,
    ) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let mut attempt = 0;
        loop {
            let result = match tokio::time::timeout(self.call_timeout, call()).await {
                Ok(result) => result,
                Err(_) => Err(HostError::Timeout {
                    operation: operation.to_string(),
                    timeout_ms: self.call_timeout.as_millis() as u64,
                }),
            };

            let err = match result {
                Err(e) if e.is_retriable() && attempt < self.max_retries => e,
                other => return other,
            };

            let delay = self.backoff_delay(attempt);
            if Instant::now() + delay >= deadline {
                debug!(operation, error = %err, "Cycle deadline reached, not retrying");
                return Err(err);
            }

            debug!(
                operation,
                attempt = attempt + 1,
                delay_ms = delay.as_millis() as u64,
                error = %err,
                "Retrying store call"
            );
            on_retry();
            tokio::time::sleep(delay).await;
            attempt += 1;
        }
    }
}
