//! Circuit breaker guarding the primary completion provider.
//!
//! Uses the tokio clock so cooldowns follow `tokio::time::pause`/`advance`
//! in tests.

use std::time::Duration;

use tokio::time::Instant;
use tracing::{debug, warn};

use crate::config::OrchestratorConfig;

/// State of a circuit breaker.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum CircuitState {
    /// Normal operation: calls are permitted.
    Closed,
    /// Too many consecutive failures: calls are blocked until the cooldown ends.
    Open { since: Instant },
}

/// A circuit breaker that trips after consecutive failures and closes again
/// once the cooldown has elapsed.
#[derive(Debug)]
pub struct CircuitBreaker {
    name: String,
    state: CircuitState,
    failure_count: u32,
    failure_threshold: u32,
    cooldown: Duration,
}

impl CircuitBreaker {
    pub fn new(name: impl Into<String>, failure_threshold: u32, cooldown: Duration) -> Self {
        Self {
            name: name.into(),
            state: CircuitState::Closed,
            failure_count: 0,
            failure_threshold: failure_threshold.max(1),
            cooldown,
        }
    }

    pub fn from_config(name: impl Into<String>, config: &OrchestratorConfig) -> Self {
        Self::new(name, config.failure_threshold, config.cooldown())
    }

    /// Whether a call is currently permitted. An expired open breaker closes
    /// here with its failure count reset.
    pub fn is_call_permitted(&mut self) -> bool {
        match self.state {
            CircuitState::Closed => true,
            CircuitState::Open { since } => {
                if since.elapsed() >= self.cooldown {
                    debug!(provider = %self.name, "Circuit breaker cooldown elapsed, closing");
                    self.state = CircuitState::Closed;
                    self.failure_count = 0;
                    true
                } else {
                    false
                }
            }
        }
    }

    /// Record a successful call.
    pub fn record_success(&mut self) {
        self.failure_count = 0;
        self.state = CircuitState::Closed;
    }

    /// Record a failed call. Returns `true` if this failure opened the breaker.
    pub fn record_failure(&mut self) -> bool {
        self.failure_count += 1;
        let opening = self.failure_count >= self.failure_threshold
            && matches!(self.state, CircuitState::Closed);
        if opening {
            warn!(
                provider = %self.name,
                failures = self.failure_count,
                threshold = self.failure_threshold,
                cooldown_secs = self.cooldown.as_secs(),
                "Circuit breaker opening"
            );
            self.state = CircuitState::Open {
                since: Instant::now(),
            };
        }
        opening
    }

    /// Get the current state.
    pub fn state(&self) -> CircuitState {
        self.state
    }

    pub fn failure_count(&self) -> u32 {
        self.failure_count
    }

    pub fn is_open(&self) -> bool {
        matches!(self.state, CircuitState::Open { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_circuit_breaker_starts_closed() {
        let mut cb = CircuitBreaker::new("p", 3, Duration::from_secs(60));
        assert_eq!(cb.state(), CircuitState::Closed);
        assert!(cb.is_call_permitted());
    }

    #[test]
    fn test_circuit_breaker_opens_after_threshold() {
        let mut cb = CircuitBreaker::new("p", 3, Duration::from_secs(60));
        assert!(!cb.record_failure());
        assert!(!cb.record_failure());
        assert!(cb.is_call_permitted());
        assert!(cb.record_failure());
        assert!(cb.is_open());
        assert!(!cb.is_call_permitted());
    }

    #[test]
    fn test_success_resets_count() {
        let mut cb = CircuitBreaker::new("p", 3, Duration::from_secs(60));
        cb.record_failure();
        cb.record_failure();
        cb.record_success();
        assert_eq!(cb.failure_count(), 0);
        cb.record_failure();
        assert!(!cb.is_open());
    }

    #[tokio::test(start_paused = true)]
    async fn test_auto_close_after_cooldown() {
        let mut cb = CircuitBreaker::new("p", 2, Duration::from_secs(60));
        cb.record_failure();
        cb.record_failure();
        assert!(!cb.is_call_permitted());

        tokio::time::advance(Duration::from_secs(59)).await;
        assert!(!cb.is_call_permitted());

        tokio::time::advance(Duration::from_secs(1)).await;
        assert!(cb.is_call_permitted());
        assert_eq!(cb.state(), CircuitState::Closed);
        assert_eq!(cb.failure_count(), 0);

        // One failure after closing does not reopen it.
        assert!(!cb.record_failure());
        assert!(cb.is_call_permitted());
    }
}
