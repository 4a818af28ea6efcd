//! The single entry point every role uses to call an LLM: role routing,
//! bounded retry with exponential backoff, circuit-breaker gating, and
//! audit/event emission around each call.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use serde_json::json;
use tracing::{instrument, warn};

use crate::audit::{digest, AuditLog, AuditRecord};
use crate::error::{Error, Result};
use crate::events::{EventBus, EventKind, ExperimentEvent};

use super::circuit_breaker::{CircuitBreakerRegistry, CircuitState};
use super::client::LLMClient;
use super::types::{CompletionRequest, CompletionResult, Provider, Role};

#[derive(Debug, Clone, Copy)]
pub struct RetryConfig {
    pub max_retries: u32,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay_ms: 500,
            max_delay_ms: 30_000,
        }
    }
}

impl RetryConfig {
    fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let exp = self.base_delay_ms.saturating_mul(1u64 << attempt.min(20));
        Duration::from_millis(exp.min(self.max_delay_ms))
    }
}

/// Routes a role to the provider client that should serve it.
pub struct Gateway {
    clients: HashMap<Role, Arc<dyn LLMClient>>,
    breakers: CircuitBreakerRegistry,
    retry: RetryConfig,
    events: Option<Arc<EventBus>>,
    audit: Option<Arc<AuditLog>>,
}

impl Gateway {
    pub fn new(clients: HashMap<Role, Arc<dyn LLMClient>>) -> Self {
        Self {
            clients,
            breakers: CircuitBreakerRegistry::default(),
            retry: RetryConfig::default(),
            events: None,
            audit: None,
        }
    }

    pub fn with_retry_config(mut self, retry: RetryConfig) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_breaker_registry(mut self, breakers: CircuitBreakerRegistry) -> Self {
        self.breakers = breakers;
        self
    }

    pub fn with_events(mut self, events: Arc<EventBus>) -> Self {
        self.events = Some(events);
        self
    }

    pub fn with_audit(mut self, audit: Arc<AuditLog>) -> Self {
        self.audit = Some(audit);
        self
    }

    fn publish(&self, experiment_id: &str, kind: EventKind, payload: serde_json::Value) {
        if let Some(events) = &self.events {
            events.publish(ExperimentEvent::new(experiment_id, kind, payload));
        }
    }

    /// True when every role this gateway has a client configured for is
    /// currently breaker-OPEN. A caller uses this to tell "one provider is
    /// down, keep going" apart from "nothing can make progress, give up".
    pub async fn all_breakers_open(&self) -> bool {
        if self.clients.is_empty() {
            return false;
        }
        for (role, client) in &self.clients {
            let breaker = self.breakers.get(client.provider(), *role).await;
            if breaker.state().await != CircuitState::Open {
                return false;
            }
        }
        true
    }

    /// Issue a completion for `role`, retrying transient failures with
    /// exponential backoff and refusing to call at all while the breaker for
    /// (provider, role) is open.
    #[instrument(skip(self, request), fields(experiment_id, iteration, role = %role))]
    pub async fn complete(
        &self,
        experiment_id: &str,
        iteration: u32,
        role: Role,
        request: CompletionRequest,
    ) -> Result<CompletionResult> {
        let client = self
            .clients
            .get(&role)
            .ok_or_else(|| Error::config_invalid(format!("no client configured for role {role}")))?;
        let provider = client.provider();
        let breaker = self.breakers.get(provider, role).await;

        let prompt_digest = digest(&format!("{:?}", request));

        self.publish(
            experiment_id,
            EventKind::LlmRequest,
            json!({"role": role.to_string(), "provider": provider.to_string(), "iteration": iteration}),
        );

        if !breaker.allow().await {
            self.publish(
                experiment_id,
                EventKind::LlmError,
                json!({"role": role.to_string(), "provider": provider.to_string(), "reason": "circuit_open"}),
            );
            return Err(Error::circuit_open(provider, role));
        }

        let mut attempt = 0;
        loop {
            let started = std::time::Instant::now();
            match client.complete(request.clone()).await {
                Ok(result) => {
                    breaker.record_success().await;
                    self.publish(
                        experiment_id,
                        EventKind::LlmResponse,
                        json!({"role": role.to_string(), "provider": provider.to_string(), "latency_ms": result.latency_ms}),
                    );
                    if let Some(audit) = &self.audit {
                        let _ = audit
                            .record(AuditRecord {
                                experiment_id: experiment_id.to_string(),
                                iteration,
                                provider,
                                role,
                                prompt_digest: prompt_digest.clone(),
                                response_digest: digest(&result.content),
                                latency_ms: result.latency_ms,
                                success: true,
                                timestamp: chrono::Utc::now(),
                            })
                            .await;
                    }
                    return Ok(result);
                }
                Err(err) => {
                    breaker.record_failure().await;
                    if let Some(audit) = &self.audit {
                        let _ = audit
                            .record(AuditRecord {
                                experiment_id: experiment_id.to_string(),
                                iteration,
                                provider,
                                role,
                                prompt_digest: prompt_digest.clone(),
                                response_digest: String::new(),
                                latency_ms: started.elapsed().as_millis() as u64,
                                success: false,
                                timestamp: chrono::Utc::now(),
                            })
                            .await;
                    }

                    if !err.is_retryable() || attempt >= self.retry.max_retries {
                        self.publish(
                            experiment_id,
                            EventKind::LlmError,
                            json!({"role": role.to_string(), "provider": provider.to_string(), "attempts": attempt + 1}),
                        );
                        return Err(Error::provider_unavailable(
                            provider,
                            role,
                            attempt + 1,
                            err.to_string(),
                        ));
                    }

                    tokio::time::sleep(self.retry.delay_for_attempt(attempt)).await;
                    attempt += 1;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicU32, Ordering};

    struct FlakyClient {
        provider: Provider,
        fail_times: AtomicU32,
    }

    #[async_trait]
    impl LLMClient for FlakyClient {
        async fn complete(&self, _request: CompletionRequest) -> Result<CompletionResult> {
            if self.fail_times.load(Ordering::SeqCst) > 0 {
                self.fail_times.fetch_sub(1, Ordering::SeqCst);
                return Err(Error::provider_transient(self.provider, Role::Attacker, "flaky"));
            }
            Ok(CompletionResult {
                content: "ok".into(),
                model: "test-model".into(),
                provider: self.provider,
                tokens_used: Default::default(),
                latency_ms: 1,
                finish_reason: None,
            })
        }

        fn provider(&self) -> Provider {
            self.provider
        }
    }

    fn fast_retry_config() -> RetryConfig {
        RetryConfig {
            max_retries: 3,
            base_delay_ms: 1,
            max_delay_ms: 5,
        }
    }

    #[tokio::test]
    async fn retries_transient_failures_then_succeeds() {
        let mut clients: HashMap<Role, Arc<dyn LLMClient>> = HashMap::new();
        clients.insert(
            Role::Attacker,
            Arc::new(FlakyClient {
                provider: Provider::Ollama,
                fail_times: AtomicU32::new(2),
            }),
        );
        let gateway = Gateway::new(clients).with_retry_config(fast_retry_config());

        let result = gateway
            .complete("exp-1", 0, Role::Attacker, CompletionRequest::new())
            .await
            .unwrap();
        assert_eq!(result.content, "ok");
    }

    #[tokio::test]
    async fn exhausting_retries_surfaces_provider_unavailable() {
        let mut clients: HashMap<Role, Arc<dyn LLMClient>> = HashMap::new();
        clients.insert(
            Role::Attacker,
            Arc::new(FlakyClient {
                provider: Provider::Ollama,
                fail_times: AtomicU32::new(100),
            }),
        );
        let gateway = Gateway::new(clients).with_retry_config(fast_retry_config());

        let err = gateway
            .complete("exp-1", 0, Role::Attacker, CompletionRequest::new())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::ProviderUnavailable { .. }));
    }

    #[tokio::test]
    async fn missing_role_is_a_config_error() {
        let gateway = Gateway::new(HashMap::new());
        let err = gateway
            .complete("exp-1", 0, Role::Judge, CompletionRequest::new())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::ConfigInvalid(_)));
    }
}
