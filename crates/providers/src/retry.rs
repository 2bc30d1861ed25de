//! Retry supervision for upstream calls.
//!
//! Only transient capacity overload is retried. Everything else (bad key,
//! malformed request, exhausted quota) is returned on the first failure,
//! since waiting does not fix it.

use loopwire_core::error::ProviderError;
use std::future::Future;
use std::time::Duration;
use tracing::warn;

/// Bounded exponential backoff settings.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total attempts, including the first call.
    pub max_attempts: u32,
    /// Delay after the first failed attempt; doubled after each further one.
    pub base_delay: Duration,
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, base_delay: Duration) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            base_delay,
        }
    }

    /// Backoff to sleep after failed attempt number `attempt` (1-based).
    pub fn delay_for(&self, attempt: u32) -> Duration {
        self.base_delay
            .saturating_mul(2u32.saturating_pow(attempt.saturating_sub(1)))
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new(3, Duration::from_secs(2))
    }
}

impl From<&loopwire_config::AgentConfig> for RetryPolicy {
    fn from(config: &loopwire_config::AgentConfig) -> Self {
        Self::new(config.retry_max_attempts, config.retry_base_delay())
    }
}

/// Run `operation` until it succeeds, fails with a non-overload error, or
/// the attempt budget is spent.
///
/// The closure receives the 1-based attempt number.
pub async fn with_retry<T, F, Fut>(policy: &RetryPolicy, mut operation: F) -> Result<T, ProviderError>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<T, ProviderError>>,
{
    let mut attempt = 1;
    loop {
        match operation(attempt).await {
            Ok(value) => return Ok(value),
            Err(e) if e.is_overloaded() && attempt < policy.max_attempts => {
                let delay = policy.delay_for(attempt);
                warn!(
                    attempt,
                    max_attempts = policy.max_attempts,
                    delay_ms = delay.as_millis() as u64,
                    error = %e,
                    "Upstream overloaded, retrying after delay"
                );
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
            Err(e) => return Err(e),
        }
    }
}
