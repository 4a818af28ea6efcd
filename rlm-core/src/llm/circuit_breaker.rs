//! Per-(provider, role) circuit breaker guarding the gateway's outbound calls.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::RwLock;

use super::types::{Provider, Role};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

#[derive(Debug, Clone, Copy)]
pub struct BreakerConfig {
    pub failure_threshold: u32,
    pub success_threshold: u32,
    pub timeout_secs: u64,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            success_threshold: 2,
            timeout_secs: 60,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct BreakerStats {
    pub total_calls: u64,
    pub rejected_calls: u64,
    pub total_failures: u64,
    pub total_successes: u64,
}

struct BreakerInner {
    state: CircuitState,
    config: BreakerConfig,
    consecutive_failures: u32,
    consecutive_successes: u32,
    opened_at: Option<Instant>,
    stats: BreakerStats,
}

impl BreakerInner {
    fn new(config: BreakerConfig) -> Self {
        Self {
            state: CircuitState::Closed,
            config,
            consecutive_failures: 0,
            consecutive_successes: 0,
            opened_at: None,
            stats: BreakerStats::default(),
        }
    }

    /// Transition OPEN -> HALF_OPEN once the timeout has elapsed. Called before
    /// every admission check.
    fn tick(&mut self) {
        if self.state == CircuitState::Open {
            if let Some(opened_at) = self.opened_at {
                if opened_at.elapsed() >= Duration::from_secs(self.config.timeout_secs) {
                    self.state = CircuitState::HalfOpen;
                    self.consecutive_successes = 0;
                }
            }
        }
    }

    fn allow(&mut self) -> bool {
        self.tick();
        match self.state {
            CircuitState::Closed | CircuitState::HalfOpen => {
                self.stats.total_calls += 1;
                true
            }
            CircuitState::Open => {
                self.stats.rejected_calls += 1;
                false
            }
        }
    }

    fn record_success(&mut self) {
        self.stats.total_successes += 1;
        match self.state {
            CircuitState::Closed => {
                self.consecutive_failures = 0;
            }
            CircuitState::HalfOpen => {
                self.consecutive_successes += 1;
                if self.consecutive_successes >= self.config.success_threshold {
                    self.state = CircuitState::Closed;
                    self.consecutive_failures = 0;
                    self.consecutive_successes = 0;
                    self.opened_at = None;
                }
            }
            CircuitState::Open => {}
        }
    }

    fn record_failure(&mut self) {
        self.stats.total_failures += 1;
        match self.state {
            CircuitState::Closed => {
                self.consecutive_failures += 1;
                if self.consecutive_failures >= self.config.failure_threshold {
                    self.state = CircuitState::Open;
                    self.opened_at = Some(Instant::now());
                }
            }
            CircuitState::HalfOpen => {
                self.state = CircuitState::Open;
                self.opened_at = Some(Instant::now());
                self.consecutive_successes = 0;
            }
            CircuitState::Open => {}
        }
    }
}

/// A single breaker for one (provider, role) pair.
pub struct CircuitBreaker {
    inner: RwLock<BreakerInner>,
}

impl CircuitBreaker {
    pub fn new(config: BreakerConfig) -> Self {
        Self {
            inner: RwLock::new(BreakerInner::new(config)),
        }
    }

    pub async fn state(&self) -> CircuitState {
        let mut inner = self.inner.write().await;
        inner.tick();
        inner.state
    }

    pub async fn allow(&self) -> bool {
        self.inner.write().await.allow()
    }

    pub async fn record_success(&self) {
        self.inner.write().await.record_success();
    }

    pub async fn record_failure(&self) {
        self.inner.write().await.record_failure();
    }

    pub async fn stats(&self) -> BreakerStats {
        self.inner.read().await.stats.clone()
    }
}

/// Registry of breakers keyed by (provider, role), created lazily on first use.
pub struct CircuitBreakerRegistry {
    config: BreakerConfig,
    breakers: RwLock<HashMap<(Provider, Role), Arc<CircuitBreaker>>>,
}

impl CircuitBreakerRegistry {
    pub fn new(config: BreakerConfig) -> Self {
        Self {
            config,
            breakers: RwLock::new(HashMap::new()),
        }
    }

    pub async fn get(&self, provider: Provider, role: Role) -> Arc<CircuitBreaker> {
        if let Some(existing) = self.breakers.read().await.get(&(provider, role)) {
            return Arc::clone(existing);
        }
        let mut breakers = self.breakers.write().await;
        breakers
            .entry((provider, role))
            .or_insert_with(|| Arc::new(CircuitBreaker::new(self.config)))
            .clone()
    }
}

impl Default for CircuitBreakerRegistry {
    fn default() -> Self {
        Self::new(BreakerConfig::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_config() -> BreakerConfig {
        BreakerConfig {
            failure_threshold: 3,
            success_threshold: 2,
            timeout_secs: 0,
        }
    }

    #[tokio::test]
    async fn opens_after_threshold_failures_and_rejects_without_counting() {
        let breaker = CircuitBreaker::new(test_config());

        for _ in 0..3 {
            assert!(breaker.allow().await);
            breaker.record_failure().await;
        }
        assert_eq!(breaker.state().await, CircuitState::Open);

        // Rejections do not touch total_calls.
        let calls_before = breaker.stats().await.total_calls;
        assert!(!breaker.allow().await);
        let stats = breaker.stats().await;
        assert_eq!(stats.total_calls, calls_before);
        assert_eq!(stats.rejected_calls, 1);
    }

    #[tokio::test]
    async fn half_open_closes_after_success_threshold() {
        let breaker = CircuitBreaker::new(test_config());
        for _ in 0..3 {
            breaker.allow().await;
            breaker.record_failure().await;
        }
        // timeout_secs = 0, so the very next admission check flips to half-open.
        assert!(breaker.allow().await);
        assert_eq!(breaker.state().await, CircuitState::HalfOpen);

        breaker.record_success().await;
        assert_eq!(breaker.state().await, CircuitState::HalfOpen);
        breaker.record_success().await;
        assert_eq!(breaker.state().await, CircuitState::Closed);
    }

    #[tokio::test]
    async fn half_open_failure_reopens_immediately() {
        let breaker = CircuitBreaker::new(test_config());
        for _ in 0..3 {
            breaker.allow().await;
            breaker.record_failure().await;
        }
        assert!(breaker.allow().await);
        assert_eq!(breaker.state().await, CircuitState::HalfOpen);

        breaker.record_failure().await;
        assert_eq!(breaker.state().await, CircuitState::Open);
    }

    #[tokio::test]
    async fn registry_reuses_breaker_per_key() {
        let registry = CircuitBreakerRegistry::new(test_config());
        let a = registry.get(Provider::Ollama, Role::Attacker).await;
        let b = registry.get(Provider::Ollama, Role::Attacker).await;
        assert!(Arc::ptr_eq(&a, &b));

        let c = registry.get(Provider::Ollama, Role::Target).await;
        assert!(!Arc::ptr_eq(&a, &c));
    }
}
