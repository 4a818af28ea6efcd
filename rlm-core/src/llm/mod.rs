//! LLM client abstraction used by every role in the attack loop.
//!
//! [`client`] holds one [`LLMClient`] implementation per provider. [`gateway`]
//! is the only thing callers should hold onto: it routes a role to its
//! configured client, retries transient failures with backoff, and refuses to
//! call a provider whose [`circuit_breaker`] is open.
//!
//! ```rust,ignore
//! use rlm_core::llm::{ClientConfig, OllamaClient, CompletionRequest, ChatMessage, Role};
//! use std::collections::HashMap;
//! use std::sync::Arc;
//!
//! let mut clients: HashMap<Role, Arc<dyn rlm_core::llm::LLMClient>> = HashMap::new();
//! clients.insert(Role::Attacker, Arc::new(OllamaClient::new(ClientConfig::new(""))));
//!
//! let gateway = rlm_core::llm::Gateway::new(clients);
//! let request = CompletionRequest::new().with_message(ChatMessage::user("hello"));
//! let result = gateway.complete("exp-1", 0, Role::Attacker, request).await?;
//! ```

mod circuit_breaker;
mod client;
mod gateway;
mod types;

pub use circuit_breaker::{BreakerConfig, BreakerStats, CircuitBreaker, CircuitBreakerRegistry, CircuitState};
pub use client::{
    build_client, AnthropicClient, AzureOpenAIClient, ClientConfig, LLMClient, OllamaClient,
    OpenAIClient, OpenRouterClient,
};
pub use gateway::{Gateway, RetryConfig};
pub use types::{
    ChatMessage, ChatRole, CompletionRequest, CompletionResult, Provider, Role, TokenUsage,
};
