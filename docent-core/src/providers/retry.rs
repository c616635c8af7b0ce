//! Retry with backoff for transient provider errors.

use std::future::Future;
use std::time::Duration;

use crate::config::{OrchestratorConfig, RetrievalConfig};
use crate::error::ProviderError;

/// Delay schedule between attempts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Backoff {
    Fixed(Duration),
    /// `base * 2^n` after the n-th failure (0-based), capped at `max`.
    Exponential { base: Duration, max: Duration },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total attempts including the first. Always at least 1.
    pub max_attempts: u32,
    pub backoff: Backoff,
}

impl RetryPolicy {
    pub fn exponential(max_attempts: u32, base: Duration, max: Duration) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            backoff: Backoff::Exponential { base, max },
        }
    }

    pub fn fixed(max_attempts: u32, delay: Duration) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            backoff: Backoff::Fixed(delay),
        }
    }

    /// Model calls: exponential backoff from the orchestrator settings.
    pub fn for_models(config: &OrchestratorConfig) -> Self {
        Self::exponential(
            config.max_attempts,
            Duration::from_millis(config.backoff_base_ms),
            Duration::from_millis(config.backoff_max_ms),
        )
    }

    /// Retrieval collaborators: the first attempt plus `max_retries` at a fixed delay.
    pub fn for_retrieval(config: &RetrievalConfig) -> Self {
        Self::fixed(
            config.max_retries + 1,
            Duration::from_millis(config.retry_backoff_ms),
        )
    }

    /// Delay after the `failures`-th failure (1-based).
    pub fn delay_for(&self, failures: u32) -> Duration {
        match self.backoff {
            Backoff::Fixed(d) => d,
            Backoff::Exponential { base, max } => {
                let shift = failures.saturating_sub(1).min(16);
                base.saturating_mul(1 << shift).min(max)
            }
        }
    }
}

/// Run `operation` until it succeeds, fails with a non-retryable error, or
/// the policy's attempts are exhausted. The closure receives the 1-based
/// attempt number.
pub async fn with_backoff<F, Fut, T>(
    policy: &RetryPolicy,
    label: &str,
    mut operation: F,
) -> Result<T, ProviderError>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<T, ProviderError>>,
{
    let mut attempt = 1;
    loop {
        match operation(attempt).await {
            Ok(value) => return Ok(value),
            Err(e) if !e.is_retryable() || attempt >= policy.max_attempts => return Err(e),
            Err(e) => {
                let delay = policy.delay_for(attempt);
                tracing::warn!(
                    operation = label,
                    attempt,
                    max = policy.max_attempts,
                    backoff_ms = delay.as_millis() as u64,
                    error = %e,
                    "Retrying after transient error"
                );
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
        }
    }
}
