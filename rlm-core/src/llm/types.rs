//! Provider-neutral chat and completion types shared by every LLM client.

use serde::{Deserialize, Serialize};
use std::fmt;

/// The LLM back-end a call is routed to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Provider {
    Ollama,
    Azure,
    OpenAI,
    Anthropic,
    OpenRouter,
}

impl fmt::Display for Provider {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Provider::Ollama => write!(f, "ollama"),
            Provider::Azure => write!(f, "azure"),
            Provider::OpenAI => write!(f, "openai"),
            Provider::Anthropic => write!(f, "anthropic"),
            Provider::OpenRouter => write!(f, "openrouter"),
        }
    }
}

/// The role an LLM call plays within one PAIR iteration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    Attacker,
    Target,
    Judge,
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Role::Attacker => write!(f, "attacker"),
            Role::Target => write!(f, "target"),
            Role::Judge => write!(f, "judge"),
        }
    }
}

/// The speaker of a single chat message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChatRole {
    System,
    User,
    Assistant,
}

/// A single message in a chat-style completion request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: ChatRole,
    pub content: String,
}

impl ChatMessage {
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: ChatRole::System,
            content: content.into(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: ChatRole::User,
            content: content.into(),
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: ChatRole::Assistant,
            content: content.into(),
        }
    }
}

/// A provider-neutral completion request, built with a chainable `with_*` API.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CompletionRequest {
    pub model: Option<String>,
    pub system: Option<String>,
    pub messages: Vec<ChatMessage>,
    pub max_tokens: Option<u32>,
    pub temperature: Option<f64>,
    pub stop: Option<Vec<String>>,
    /// Seed for deterministic sampling, when the provider supports it.
    pub deterministic_seed: Option<u64>,
}

impl CompletionRequest {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = Some(model.into());
        self
    }

    pub fn with_system(mut self, system: impl Into<String>) -> Self {
        self.system = Some(system.into());
        self
    }

    pub fn with_message(mut self, message: ChatMessage) -> Self {
        self.messages.push(message);
        self
    }

    pub fn with_messages(mut self, messages: Vec<ChatMessage>) -> Self {
        self.messages.extend(messages);
        self
    }

    pub fn with_max_tokens(mut self, tokens: u32) -> Self {
        self.max_tokens = Some(tokens);
        self
    }

    pub fn with_temperature(mut self, temperature: f64) -> Self {
        self.temperature = Some(temperature.clamp(0.0, 1.0));
        self
    }

    pub fn with_stop(mut self, stop: Vec<String>) -> Self {
        self.stop = Some(stop);
        self
    }

    pub fn with_deterministic_seed(mut self, seed: u64) -> Self {
        self.deterministic_seed = Some(seed);
        self
    }
}

/// Token accounting reported by the provider, when available.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct TokenUsage {
    pub input_tokens: Option<u64>,
    pub output_tokens: Option<u64>,
}

impl TokenUsage {
    pub fn total(&self) -> Option<u64> {
        match (self.input_tokens, self.output_tokens) {
            (Some(i), Some(o)) => Some(i + o),
            _ => None,
        }
    }
}

/// The normalized result of a completion call, regardless of provider.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompletionResult {
    pub content: String,
    pub model: String,
    pub provider: Provider,
    pub tokens_used: TokenUsage,
    pub latency_ms: u64,
    pub finish_reason: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn completion_request_builder() {
        let request = CompletionRequest::new()
            .with_model("gpt-4o")
            .with_system("You are a red-team judge.")
            .with_message(ChatMessage::user("hello"))
            .with_max_tokens(512)
            .with_temperature(1.5);

        assert_eq!(request.model.as_deref(), Some("gpt-4o"));
        assert_eq!(request.messages.len(), 1);
        assert_eq!(request.max_tokens, Some(512));
        // Temperature is clamped to [0, 1].
        assert_eq!(request.temperature, Some(1.0));
    }

    #[test]
    fn token_usage_total_requires_both_sides() {
        let usage = TokenUsage {
            input_tokens: Some(10),
            output_tokens: None,
        };
        assert_eq!(usage.total(), None);

        let usage = TokenUsage {
            input_tokens: Some(10),
            output_tokens: Some(5),
        };
        assert_eq!(usage.total(), Some(15));
    }

    #[test]
    fn provider_and_role_display() {
        assert_eq!(Provider::Ollama.to_string(), "ollama");
        assert_eq!(Role::Target.to_string(), "target");
    }
}
