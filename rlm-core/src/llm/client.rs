//! Per-provider completion clients behind a single `LLMClient` trait.

use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;
use std::time::Duration;

use crate::error::{Error, Result};

use super::types::{ChatRole, CompletionRequest, CompletionResult, Provider, Role, TokenUsage};

/// A single-provider completion client. Implementations do not know about roles,
/// retries, or circuit breakers; those concerns live in [`super::gateway::Gateway`].
#[async_trait]
pub trait LLMClient: Send + Sync {
    async fn complete(&self, request: CompletionRequest) -> Result<CompletionResult>;

    fn provider(&self) -> Provider;
}

/// Shared configuration for constructing a provider client.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    pub api_key: String,
    pub base_url: Option<String>,
    pub default_model: Option<String>,
    pub timeout_secs: u64,
}

impl ClientConfig {
    pub fn new(api_key: impl Into<String>) -> Self {
        Self {
            api_key: api_key.into(),
            base_url: None,
            default_model: None,
            timeout_secs: 120,
        }
    }

    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = Some(base_url.into());
        self
    }

    pub fn with_default_model(mut self, model: impl Into<String>) -> Self {
        self.default_model = Some(model.into());
        self
    }

    pub fn with_timeout(mut self, timeout_secs: u64) -> Self {
        self.timeout_secs = timeout_secs;
        self
    }
}

/// Build a reqwest client, falling back to a no-proxy client if the sandboxed
/// environment's proxy auto-detection panics (observed on locked-down macOS builds).
fn build_http_client(timeout_secs: u64) -> Client {
    let build = AssertUnwindSafe(|| {
        Client::builder()
            .timeout(Duration::from_secs(timeout_secs))
            .build()
    });

    match catch_unwind(build) {
        Ok(Ok(client)) => client,
        _ => Client::builder()
            .timeout(Duration::from_secs(timeout_secs))
            .no_proxy()
            .build()
            .expect("building a no-proxy reqwest client should never fail"),
    }
}

fn map_status_error(provider: Provider, role: Role, status: reqwest::StatusCode, body: String) -> Error {
    if status == reqwest::StatusCode::TOO_MANY_REQUESTS || status.is_server_error() {
        Error::provider_transient(provider, role, format!("{status}: {body}"))
    } else {
        Error::provider_unavailable(provider, role, 0, format!("{status}: {body}"))
    }
}

// ---------------------------------------------------------------------------
// Ollama
// ---------------------------------------------------------------------------

/// Local Ollama server. No authentication; base URL defaults to the standard
/// local daemon address.
pub struct OllamaClient {
    http: Client,
    base_url: String,
    default_model: Option<String>,
}

impl OllamaClient {
    pub fn new(config: ClientConfig) -> Self {
        Self {
            http: build_http_client(config.timeout_secs),
            base_url: config
                .base_url
                .unwrap_or_else(|| "http://localhost:11434".to_string()),
            default_model: config.default_model,
        }
    }
}

#[derive(Serialize)]
struct OllamaChatRequest {
    model: String,
    messages: Vec<OllamaMessage>,
    stream: bool,
    options: OllamaOptions,
}

#[derive(Serialize)]
struct OllamaOptions {
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    num_predict: Option<u32>,
}

#[derive(Serialize)]
struct OllamaMessage {
    role: String,
    content: String,
}

#[derive(Deserialize)]
struct OllamaChatResponse {
    message: OllamaResponseMessage,
    #[serde(default)]
    eval_count: Option<u64>,
    #[serde(default)]
    prompt_eval_count: Option<u64>,
    #[serde(default)]
    done_reason: Option<String>,
}

#[derive(Deserialize)]
struct OllamaResponseMessage {
    content: String,
}

#[async_trait]
impl LLMClient for OllamaClient {
    async fn complete(&self, request: CompletionRequest) -> Result<CompletionResult> {
        let model = request
            .model
            .clone()
            .or_else(|| self.default_model.clone())
            .ok_or_else(|| Error::config_invalid("no model configured for ollama client"))?;

        let mut messages = Vec::new();
        if let Some(system) = &request.system {
            messages.push(OllamaMessage {
                role: "system".to_string(),
                content: system.clone(),
            });
        }
        for message in &request.messages {
            messages.push(OllamaMessage {
                role: chat_role_str(message.role).to_string(),
                content: message.content.clone(),
            });
        }

        let body = OllamaChatRequest {
            model: model.clone(),
            messages,
            stream: false,
            options: OllamaOptions {
                temperature: request.temperature,
                num_predict: request.max_tokens,
            },
        };

        let start = std::time::Instant::now();
        let response = self
            .http
            .post(format!("{}/api/chat", self.base_url))
            .json(&body)
            .send()
            .await
            .map_err(|e| Error::provider_transient(Provider::Ollama, Role::Target, e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            return Err(map_status_error(Provider::Ollama, Role::Target, status, text));
        }

        let parsed: OllamaChatResponse = response
            .json()
            .await
            .map_err(|e| Error::provider_unavailable(Provider::Ollama, Role::Target, 0, e.to_string()))?;
        let latency_ms = start.elapsed().as_millis() as u64;

        Ok(CompletionResult {
            content: parsed.message.content,
            model,
            provider: Provider::Ollama,
            tokens_used: TokenUsage {
                input_tokens: parsed.prompt_eval_count,
                output_tokens: parsed.eval_count,
            },
            latency_ms,
            finish_reason: parsed.done_reason,
        })
    }

    fn provider(&self) -> Provider {
        Provider::Ollama
    }
}

// ---------------------------------------------------------------------------
// OpenAI (and Azure OpenAI, same wire format with a different base URL/auth header)
// ---------------------------------------------------------------------------

#[derive(Serialize)]
struct OpenAIChatRequest {
    model: String,
    messages: Vec<OllamaMessage>,
    #[serde(skip_serializing_if = "Option::is_none")]
    max_tokens: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    stop: Option<Vec<String>>,
}

#[derive(Deserialize)]
struct OpenAIChatResponse {
    model: String,
    choices: Vec<OpenAIChoice>,
    #[serde(default)]
    usage: Option<OpenAIUsage>,
}

#[derive(Deserialize)]
struct OpenAIChoice {
    message: OllamaResponseMessage,
    #[serde(default)]
    finish_reason: Option<String>,
}

#[derive(Deserialize)]
struct OpenAIUsage {
    prompt_tokens: u64,
    completion_tokens: u64,
}

fn chat_role_str(role: ChatRole) -> &'static str {
    match role {
        ChatRole::System => "system",
        ChatRole::User => "user",
        ChatRole::Assistant => "assistant",
    }
}

fn build_openai_style_body(request: &CompletionRequest, model: &str) -> OpenAIChatRequest {
    let mut messages = Vec::new();
    if let Some(system) = &request.system {
        messages.push(OllamaMessage {
            role: "system".to_string(),
            content: system.clone(),
        });
    }
    for message in &request.messages {
        messages.push(OllamaMessage {
            role: chat_role_str(message.role).to_string(),
            content: message.content.clone(),
        });
    }

    OpenAIChatRequest {
        model: model.to_string(),
        messages,
        max_tokens: request.max_tokens,
        temperature: request.temperature,
        stop: request.stop.clone(),
    }
}

/// OpenAI's `/v1/chat/completions` endpoint.
pub struct OpenAIClient {
    http: Client,
    base_url: String,
    api_key: String,
    default_model: Option<String>,
}

impl OpenAIClient {
    pub fn new(config: ClientConfig) -> Self {
        Self {
            http: build_http_client(config.timeout_secs),
            base_url: config
                .base_url
                .unwrap_or_else(|| "https://api.openai.com".to_string()),
            api_key: config.api_key,
            default_model: config.default_model,
        }
    }
}

#[async_trait]
impl LLMClient for OpenAIClient {
    async fn complete(&self, request: CompletionRequest) -> Result<CompletionResult> {
        let model = request
            .model
            .clone()
            .or_else(|| self.default_model.clone())
            .ok_or_else(|| Error::config_invalid("no model configured for openai client"))?;

        let body = build_openai_style_body(&request, &model);

        let start = std::time::Instant::now();
        let response = self
            .http
            .post(format!("{}/v1/chat/completions", self.base_url))
            .bearer_auth(&self.api_key)
            .json(&body)
            .send()
            .await
            .map_err(|e| Error::provider_transient(Provider::OpenAI, Role::Target, e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            return Err(map_status_error(Provider::OpenAI, Role::Target, status, text));
        }

        let parsed: OpenAIChatResponse = response
            .json()
            .await
            .map_err(|e| Error::provider_unavailable(Provider::OpenAI, Role::Target, 0, e.to_string()))?;
        let latency_ms = start.elapsed().as_millis() as u64;

        let choice = parsed
            .choices
            .into_iter()
            .next()
            .ok_or_else(|| Error::provider_unavailable(Provider::OpenAI, Role::Target, 0, "empty choices"))?;

        Ok(CompletionResult {
            content: choice.message.content,
            model: parsed.model,
            provider: Provider::OpenAI,
            tokens_used: TokenUsage {
                input_tokens: parsed.usage.as_ref().map(|u| u.prompt_tokens),
                output_tokens: parsed.usage.as_ref().map(|u| u.completion_tokens),
            },
            latency_ms,
            finish_reason: choice.finish_reason,
        })
    }

    fn provider(&self) -> Provider {
        Provider::OpenAI
    }
}

/// Azure OpenAI. Same request/response shape as OpenAI, addressed by deployment
/// name instead of model name and authenticated with `api-key` rather than Bearer.
pub struct AzureOpenAIClient {
    http: Client,
    base_url: String,
    api_key: String,
    deployment: String,
    api_version: String,
}

impl AzureOpenAIClient {
    pub fn new(config: ClientConfig, deployment: impl Into<String>) -> Result<Self> {
        let base_url = config
            .base_url
            .ok_or_else(|| Error::config_invalid("azure openai requires an api_base"))?;
        Ok(Self {
            http: build_http_client(config.timeout_secs),
            base_url,
            api_key: config.api_key,
            deployment: deployment.into(),
            api_version: "2024-06-01".to_string(),
        })
    }
}

#[async_trait]
impl LLMClient for AzureOpenAIClient {
    async fn complete(&self, request: CompletionRequest) -> Result<CompletionResult> {
        let model = request.model.clone().unwrap_or_else(|| self.deployment.clone());
        let body = build_openai_style_body(&request, &model);

        let url = format!(
            "{}/openai/deployments/{}/chat/completions?api-version={}",
            self.base_url, self.deployment, self.api_version
        );

        let start = std::time::Instant::now();
        let response = self
            .http
            .post(url)
            .header("api-key", &self.api_key)
            .json(&body)
            .send()
            .await
            .map_err(|e| Error::provider_transient(Provider::Azure, Role::Target, e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            return Err(map_status_error(Provider::Azure, Role::Target, status, text));
        }

        let parsed: OpenAIChatResponse = response
            .json()
            .await
            .map_err(|e| Error::provider_unavailable(Provider::Azure, Role::Target, 0, e.to_string()))?;
        let latency_ms = start.elapsed().as_millis() as u64;

        let choice = parsed
            .choices
            .into_iter()
            .next()
            .ok_or_else(|| Error::provider_unavailable(Provider::Azure, Role::Target, 0, "empty choices"))?;

        Ok(CompletionResult {
            content: choice.message.content,
            model: parsed.model,
            provider: Provider::Azure,
            tokens_used: TokenUsage {
                input_tokens: parsed.usage.as_ref().map(|u| u.prompt_tokens),
                output_tokens: parsed.usage.as_ref().map(|u| u.completion_tokens),
            },
            latency_ms,
            finish_reason: choice.finish_reason,
        })
    }

    fn provider(&self) -> Provider {
        Provider::Azure
    }
}

/// Anthropic's `/v1/messages` endpoint. Unlike the OpenAI-style clients, the
/// system prompt is a top-level field rather than a message, and token usage
/// is reported as `input_tokens`/`output_tokens` instead of `prompt_tokens`.
pub struct AnthropicClient {
    http: Client,
    base_url: String,
    api_key: String,
    default_model: Option<String>,
}

#[derive(Serialize)]
struct AnthropicMessage {
    role: String,
    content: String,
}

#[derive(Serialize)]
struct AnthropicRequest {
    model: String,
    messages: Vec<AnthropicMessage>,
    max_tokens: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    system: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    stop_sequences: Option<Vec<String>>,
}

#[derive(Deserialize)]
struct AnthropicContentBlock {
    #[serde(default)]
    text: String,
}

#[derive(Deserialize)]
struct AnthropicUsage {
    input_tokens: u64,
    output_tokens: u64,
}

#[derive(Deserialize)]
struct AnthropicResponse {
    model: String,
    content: Vec<AnthropicContentBlock>,
    #[serde(default)]
    stop_reason: Option<String>,
    usage: AnthropicUsage,
}

impl AnthropicClient {
    pub fn new(config: ClientConfig) -> Self {
        Self {
            http: build_http_client(config.timeout_secs),
            base_url: config
                .base_url
                .unwrap_or_else(|| "https://api.anthropic.com".to_string()),
            api_key: config.api_key,
            default_model: config.default_model,
        }
    }
}

#[async_trait]
impl LLMClient for AnthropicClient {
    async fn complete(&self, request: CompletionRequest) -> Result<CompletionResult> {
        let model = request
            .model
            .clone()
            .or_else(|| self.default_model.clone())
            .ok_or_else(|| Error::config_invalid("no model configured for anthropic client"))?;

        let messages = request
            .messages
            .iter()
            .map(|m| AnthropicMessage {
                role: chat_role_str(m.role).to_string(),
                content: m.content.clone(),
            })
            .collect();

        let body = AnthropicRequest {
            model: model.clone(),
            messages,
            max_tokens: request.max_tokens.unwrap_or(1024),
            system: request.system.clone(),
            temperature: request.temperature,
            stop_sequences: request.stop.clone(),
        };

        let start = std::time::Instant::now();
        let response = self
            .http
            .post(format!("{}/v1/messages", self.base_url))
            .header("x-api-key", &self.api_key)
            .header("anthropic-version", "2023-06-01")
            .json(&body)
            .send()
            .await
            .map_err(|e| Error::provider_transient(Provider::Anthropic, Role::Target, e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            return Err(map_status_error(Provider::Anthropic, Role::Target, status, text));
        }

        let parsed: AnthropicResponse = response
            .json()
            .await
            .map_err(|e| Error::provider_unavailable(Provider::Anthropic, Role::Target, 0, e.to_string()))?;
        let latency_ms = start.elapsed().as_millis() as u64;

        let content = parsed
            .content
            .into_iter()
            .map(|block| block.text)
            .collect::<Vec<_>>()
            .join("");

        Ok(CompletionResult {
            content,
            model: parsed.model,
            provider: Provider::Anthropic,
            tokens_used: TokenUsage {
                input_tokens: Some(parsed.usage.input_tokens),
                output_tokens: Some(parsed.usage.output_tokens),
            },
            latency_ms,
            finish_reason: parsed.stop_reason,
        })
    }

    fn provider(&self) -> Provider {
        Provider::Anthropic
    }
}

/// OpenRouter. Wire-compatible with OpenAI's `/chat/completions` endpoint;
/// differs only in base URL and an `HTTP-Referer` header OpenRouter uses for
/// attribution.
pub struct OpenRouterClient {
    http: Client,
    base_url: String,
    api_key: String,
    default_model: Option<String>,
}

impl OpenRouterClient {
    pub fn new(config: ClientConfig) -> Self {
        Self {
            http: build_http_client(config.timeout_secs),
            base_url: config
                .base_url
                .unwrap_or_else(|| "https://openrouter.ai/api".to_string()),
            api_key: config.api_key,
            default_model: config.default_model,
        }
    }
}

#[async_trait]
impl LLMClient for OpenRouterClient {
    async fn complete(&self, request: CompletionRequest) -> Result<CompletionResult> {
        let model = request
            .model
            .clone()
            .or_else(|| self.default_model.clone())
            .ok_or_else(|| Error::config_invalid("no model configured for openrouter client"))?;

        let body = build_openai_style_body(&request, &model);

        let start = std::time::Instant::now();
        let response = self
            .http
            .post(format!("{}/v1/chat/completions", self.base_url))
            .bearer_auth(&self.api_key)
            .header("HTTP-Referer", "https://github.com/rand/loop")
            .json(&body)
            .send()
            .await
            .map_err(|e| Error::provider_transient(Provider::OpenRouter, Role::Target, e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            return Err(map_status_error(Provider::OpenRouter, Role::Target, status, text));
        }

        let parsed: OpenAIChatResponse = response
            .json()
            .await
            .map_err(|e| Error::provider_unavailable(Provider::OpenRouter, Role::Target, 0, e.to_string()))?;
        let latency_ms = start.elapsed().as_millis() as u64;

        let choice = parsed
            .choices
            .into_iter()
            .next()
            .ok_or_else(|| Error::provider_unavailable(Provider::OpenRouter, Role::Target, 0, "empty choices"))?;

        Ok(CompletionResult {
            content: choice.message.content,
            model: parsed.model,
            provider: Provider::OpenRouter,
            tokens_used: TokenUsage {
                input_tokens: parsed.usage.as_ref().map(|u| u.prompt_tokens),
                output_tokens: parsed.usage.as_ref().map(|u| u.completion_tokens),
            },
            latency_ms,
            finish_reason: choice.finish_reason,
        })
    }

    fn provider(&self) -> Provider {
        Provider::OpenRouter
    }
}

/// Build the concrete client for a `(provider, role)` pair from shared
/// connection settings. Azure is the one provider that needs an extra
/// `deployment` name distinct from its model string.
pub fn build_client(provider: Provider, config: ClientConfig) -> Result<Arc<dyn LLMClient>> {
    match provider {
        Provider::Ollama => Ok(Arc::new(OllamaClient::new(config))),
        Provider::OpenAI => Ok(Arc::new(OpenAIClient::new(config))),
        Provider::Anthropic => Ok(Arc::new(AnthropicClient::new(config))),
        Provider::OpenRouter => Ok(Arc::new(OpenRouterClient::new(config))),
        Provider::Azure => {
            let deployment = config
                .default_model
                .clone()
                .ok_or_else(|| Error::config_invalid("azure openai requires a deployment name as its model"))?;
            Ok(Arc::new(AzureOpenAIClient::new(config, deployment)?))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn client_config_builder() {
        let config = ClientConfig::new("sk-test")
            .with_base_url("https://example.test")
            .with_default_model("gpt-4o-mini")
            .with_timeout(30);

        assert_eq!(config.api_key, "sk-test");
        assert_eq!(config.base_url.as_deref(), Some("https://example.test"));
        assert_eq!(config.default_model.as_deref(), Some("gpt-4o-mini"));
        assert_eq!(config.timeout_secs, 30);
    }

    #[test]
    fn azure_client_requires_base_url() {
        let config = ClientConfig::new("key");
        let result = AzureOpenAIClient::new(config, "gpt-4o-deployment");
        assert!(result.is_err());
    }

    #[test]
    fn ollama_client_defaults_base_url() {
        let client = OllamaClient::new(ClientConfig::new(""));
        assert_eq!(client.provider(), Provider::Ollama);
        assert_eq!(client.base_url, "http://localhost:11434");
    }

    #[test]
    fn anthropic_client_defaults_base_url() {
        let client = AnthropicClient::new(ClientConfig::new("sk-ant-test"));
        assert_eq!(client.provider(), Provider::Anthropic);
        assert_eq!(client.base_url, "https://api.anthropic.com");
    }

    #[test]
    fn openrouter_client_defaults_base_url() {
        let client = OpenRouterClient::new(ClientConfig::new("key"));
        assert_eq!(client.provider(), Provider::OpenRouter);
        assert_eq!(client.base_url, "https://openrouter.ai/api");
    }

    #[test]
    fn build_client_dispatches_by_provider() {
        let ollama = build_client(Provider::Ollama, ClientConfig::new("")).unwrap();
        assert_eq!(ollama.provider(), Provider::Ollama);

        let anthropic = build_client(Provider::Anthropic, ClientConfig::new("sk-ant")).unwrap();
        assert_eq!(anthropic.provider(), Provider::Anthropic);
    }

    #[test]
    fn build_client_for_azure_without_model_is_config_invalid() {
        let result = build_client(Provider::Azure, ClientConfig::new("key").with_base_url("https://x.test"));
        assert!(matches!(result, Err(Error::ConfigInvalid(_))));
    }
}
