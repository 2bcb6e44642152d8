// Three-state circuit breaker guarding a single pool target (primary or a
// replica). Closed iff consecutive failures < threshold; once open, no call
// is dispatched until the cooldown elapses, at which point exactly one trial
// call is let through (half-open) to decide the next transition.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use tracing::{info, warn};

use crate::error::{Error, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

#[derive(Debug, Clone)]
pub struct CircuitBreakerConfig {
    pub failure_threshold: u32,
    pub cooldown: Duration,
}

#[derive(Debug, Clone, Default)]
pub struct CircuitStats {
    pub total_calls: u64,
    pub successes: u64,
    pub failures: u64,
    pub rejected: u64,
    pub consecutive_failures: u32,
}

struct Inner {
    state: CircuitState,
    stats: CircuitStats,
    opened_at: Option<DateTime<Utc>>,
}

/// Guards calls to one named target. Cloning shares the underlying state.
pub struct CircuitBreaker {
    name: String,
    config: CircuitBreakerConfig,
    inner: Arc<RwLock<Inner>>,
}

impl Clone for CircuitBreaker {
    fn clone(&self) -> Self {
        Self { name: self.name.clone(), config: self.config.clone(), inner: self.inner.clone() }
    }
}

impl CircuitBreaker {
    pub fn new(name: impl Into<String>, config: CircuitBreakerConfig) -> Self {
        Self {
            name: name.into(),
            config,
            inner: Arc::new(RwLock::new(Inner { state: CircuitState::Closed, stats: CircuitStats::default(), opened_at: None })),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn state(&self) -> CircuitState {
        self.inner.read().state
    }

    /// Whether a call should even be attempted. A `true` from the
    /// half-open branch permits exactly one concurrent trial by flipping
    /// the state eagerly; callers that lose the race see `Open`.
    fn admit(&self) -> bool {
        let mut inner = self.inner.write();
        match inner.state {
            CircuitState::Closed => true,
            CircuitState::HalfOpen => false,
            CircuitState::Open => {
                let elapsed = inner.opened_at.map(|t| Utc::now() - t).unwrap_or_default();
                if elapsed >= chrono::Duration::from_std(self.config.cooldown).unwrap_or_default() {
                    inner.state = CircuitState::HalfOpen;
                    info!(breaker = %self.name, "circuit entering half-open trial");
                    true
                } else {
                    false
                }
            }
        }
    }

    /// Guard and execute `f`, recording the outcome against the breaker.
    /// Rejects fast with `Error::unavailable` when the circuit is open.
    pub async fn call<F, T>(&self, f: F) -> Result<T>
    where
        F: std::future::Future<Output = Result<T>>,
    {
        self.inner.write().stats.total_calls += 1;
        if !self.admit() {
            self.inner.write().stats.rejected += 1;
            return Err(Error::unavailable(format!("circuit '{}' is open", self.name)));
        }
        match f.await {
            Ok(v) => {
                self.on_success();
                Ok(v)
            }
            Err(e) => {
                self.on_failure();
                Err(e)
            }
        }
    }

    fn on_success(&self) {
        let mut inner = self.inner.write();
        inner.stats.successes += 1;
        inner.stats.consecutive_failures = 0;
        if matches!(inner.state, CircuitState::HalfOpen | CircuitState::Open) {
            info!(breaker = %self.name, "circuit closing after successful trial");
            inner.state = CircuitState::Closed;
            inner.opened_at = None;
        }
    }

    fn on_failure(&self) {
        let mut inner = self.inner.write();
        inner.stats.failures += 1;
        inner.stats.consecutive_failures += 1;
        let should_open = matches!(inner.state, CircuitState::HalfOpen)
            || inner.stats.consecutive_failures >= self.config.failure_threshold;
        if should_open && !matches!(inner.state, CircuitState::Open) {
            warn!(breaker = %self.name, failures = inner.stats.consecutive_failures, "circuit opening");
            inner.state = CircuitState::Open;
            inner.opened_at = Some(Utc::now());
        }
    }

    pub fn statistics(&self) -> CircuitStats {
        self.inner.read().stats.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn breaker() -> CircuitBreaker {
        CircuitBreaker::new("primary", CircuitBreakerConfig { failure_threshold: 3, cooldown: Duration::from_millis(50) })
    }

    #[tokio::test]
    async fn stays_closed_under_threshold() {
        let b = breaker();
        for _ in 0..2 {
            let _ = b.call(async { Err::<(), _>(Error::transient("x")) }).await;
        }
        assert_eq!(b.state(), CircuitState::Closed);
    }

    #[tokio::test]
    async fn opens_at_threshold_and_rejects_fast() {
        let b = breaker();
        for _ in 0..3 {
            let _ = b.call(async { Err::<(), _>(Error::transient("x")) }).await;
        }
        assert_eq!(b.state(), CircuitState::Open);
        let result = b.call(async { Ok::<_, Error>(1) }).await;
        assert_eq!(result.unwrap_err().kind(), crate::error::ErrorKind::Unavailable);
    }

    #[tokio::test]
    async fn half_open_trial_succeeds_and_closes() {
        let b = breaker();
        for _ in 0..3 {
            let _ = b.call(async { Err::<(), _>(Error::transient("x")) }).await;
        }
        tokio::time::sleep(Duration::from_millis(60)).await;
        let result = b.call(async { Ok::<_, Error>(42) }).await;
        assert_eq!(result.unwrap(), 42);
        assert_eq!(b.state(), CircuitState::Closed);
    }
}
