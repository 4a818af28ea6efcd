//! Harness-wide settings, loaded from the environment and validated once at
//! construction. Nothing downstream re-reads the environment after this.

use std::collections::HashMap;
use std::env;
use std::sync::Arc;

use crate::error::{Error, Result};
use crate::llm::{build_client, ClientConfig, Gateway, LLMClient, Provider, Role};

/// Per-provider connection details resolved from the environment.
#[derive(Debug, Clone)]
pub struct ProviderSettings {
    pub provider: Provider,
    pub api_key: String,
    pub base_url: Option<String>,
    pub default_model: Option<String>,
}

impl ProviderSettings {
    pub fn to_client_config(&self) -> ClientConfig {
        let mut config = ClientConfig::new(self.api_key.clone());
        if let Some(base_url) = &self.base_url {
            config = config.with_base_url(base_url.clone());
        }
        if let Some(model) = &self.default_model {
            config = config.with_default_model(model.clone());
        }
        config
    }
}

/// Fully validated configuration for one harness run.
#[derive(Debug, Clone)]
pub struct Settings {
    pub role_providers: HashMap<Role, ProviderSettings>,
    pub max_concurrent_attacks: usize,
    pub max_iterations_per_seed: u32,
    pub experiment_timeout_secs: u64,
    pub api_key_enabled: bool,
    /// Shared secret boundary operations must present when `api_key_enabled`. The core
    /// only exposes this as a checkable field; enforcing it is a boundary concern.
    pub api_key: Option<String>,
    /// Boundary-only: origins the HTTP surface should allow. Parsed here so a single
    /// settings object is the source of truth, but the core never consults it itself.
    pub cors_origins: Vec<String>,
    pub rate_limit_enabled: bool,
    /// Boundary-only request throttle. Distinct from the gateway's own per-provider
    /// retry/backoff, which is in-scope and lives in `llm::RetryConfig`.
    pub requests_per_minute: Option<u32>,
    pub demo_mode: bool,
    pub audit_dir: String,
    pub audit_retention_days: u32,
    pub database_path: String,
    /// Default verbosity assigned to a subscriber that doesn't specify one at connect time.
    pub verbosity_default: u8,
}

impl Settings {
    /// Build settings from process environment variables, validating that
    /// every required role has a provider and that numeric bounds make sense.
    pub fn from_env() -> Result<Self> {
        let mut role_providers = HashMap::new();
        for (role, prefix) in [
            (Role::Attacker, "RLM_ATTACKER"),
            (Role::Target, "RLM_TARGET"),
            (Role::Judge, "RLM_JUDGE"),
        ] {
            let provider = env_provider(prefix)?;
            let api_key = env::var(format!("{prefix}_API_KEY")).unwrap_or_default();
            let base_url = env::var(format!("{prefix}_BASE_URL")).ok();
            let default_model = env::var(format!("{prefix}_MODEL")).ok();

            if provider != Provider::Ollama && api_key.is_empty() {
                return Err(Error::config_invalid(format!(
                    "{prefix}_API_KEY is required for provider {provider}"
                )));
            }

            role_providers.insert(
                role,
                ProviderSettings {
                    provider,
                    api_key,
                    base_url,
                    default_model,
                },
            );
        }

        let max_concurrent_attacks = env_parse_or("RLM_MAX_CONCURRENT_ATTACKS", 3usize)?;
        if max_concurrent_attacks == 0 {
            return Err(Error::config_invalid("RLM_MAX_CONCURRENT_ATTACKS must be >= 1"));
        }

        let max_iterations_per_seed = env_parse_or("RLM_MAX_ITERATIONS", 10u32)?;
        if max_iterations_per_seed == 0 {
            return Err(Error::config_invalid("RLM_MAX_ITERATIONS must be >= 1"));
        }

        let experiment_timeout_secs = env_parse_or("RLM_EXPERIMENT_TIMEOUT_SECS", 3600u64)?;

        let api_key_enabled = env_bool_or("RLM_API_KEY_ENABLED", false)?;
        let api_key = env::var("RLM_API_KEY").ok();
        if api_key_enabled && api_key.as_deref().unwrap_or("").is_empty() {
            return Err(Error::config_invalid(
                "RLM_API_KEY_ENABLED is set but RLM_API_KEY is empty",
            ));
        }

        let cors_origins = env::var("RLM_CORS_ORIGINS")
            .map(|raw| raw.split(',').map(|s| s.trim().to_string()).filter(|s| !s.is_empty()).collect())
            .unwrap_or_default();

        let verbosity_default = env_parse_or("RLM_VERBOSITY_DEFAULT", 1u8)?;
        if verbosity_default > 3 {
            return Err(Error::config_invalid("RLM_VERBOSITY_DEFAULT must be in 0..=3"));
        }

        Ok(Self {
            role_providers,
            max_concurrent_attacks,
            max_iterations_per_seed,
            experiment_timeout_secs,
            api_key_enabled,
            api_key,
            cors_origins,
            rate_limit_enabled: env_bool_or("RLM_RATE_LIMIT_ENABLED", true)?,
            requests_per_minute: match env::var("RLM_REQUESTS_PER_MINUTE") {
                Ok(raw) => Some(raw.parse().map_err(|_| {
                    Error::config_invalid(format!("RLM_REQUESTS_PER_MINUTE is not a valid number: {raw}"))
                })?),
                Err(_) => None,
            },
            demo_mode: env_bool_or("RLM_DEMO_MODE", false)?,
            audit_dir: env::var("RLM_AUDIT_DIR").unwrap_or_else(|_| "./audit".to_string()),
            audit_retention_days: env_parse_or("RLM_AUDIT_RETENTION_DAYS", 90u32)?,
            database_path: env::var("RLM_DATABASE_PATH").unwrap_or_else(|_| "./rlm.db".to_string()),
            verbosity_default,
        })
    }

    /// Build one provider client per role from this settings object. The
    /// resulting map is exactly the shape [`Gateway::new`] expects.
    pub fn build_clients(&self) -> Result<HashMap<Role, Arc<dyn LLMClient>>> {
        self.role_providers
            .iter()
            .map(|(role, settings)| {
                let client = build_client(settings.provider, settings.to_client_config())?;
                Ok((*role, client))
            })
            .collect()
    }

    /// Convenience: build a fully-wired [`Gateway`] directly from these settings.
    pub fn build_gateway(&self) -> Result<Gateway> {
        Ok(Gateway::new(self.build_clients()?))
    }
}

fn env_provider(prefix: &str) -> Result<Provider> {
    let key = format!("{prefix}_PROVIDER");
    let raw = env::var(&key).unwrap_or_else(|_| "ollama".to_string());
    match raw.to_lowercase().as_str() {
        "ollama" => Ok(Provider::Ollama),
        "azure" => Ok(Provider::Azure),
        "openai" => Ok(Provider::OpenAI),
        "anthropic" => Ok(Provider::Anthropic),
        "openrouter" => Ok(Provider::OpenRouter),
        other => Err(Error::config_invalid(format!("unknown provider '{other}' for {key}"))),
    }
}

fn env_parse_or<T: std::str::FromStr>(key: &str, default: T) -> Result<T> {
    match env::var(key) {
        Ok(raw) => raw
            .parse()
            .map_err(|_| Error::config_invalid(format!("{key} is not a valid number: {raw}"))),
        Err(_) => Ok(default),
    }
}

fn env_bool_or(key: &str, default: bool) -> Result<bool> {
    match env::var(key) {
        Ok(raw) => match raw.to_lowercase().as_str() {
            "1" | "true" | "yes" => Ok(true),
            "0" | "false" | "no" => Ok(false),
            other => Err(Error::config_invalid(format!("{key} is not a valid bool: {other}"))),
        },
        Err(_) => Ok(default),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    // Environment variables are process-global; serialize tests that touch them.
    static ENV_LOCK: Mutex<()> = Mutex::new(());

    fn clear_rlm_env() {
        for key in env::vars().map(|(k, _)| k).collect::<Vec<_>>() {
            if key.starts_with("RLM_") {
                env::remove_var(key);
            }
        }
    }

    #[test]
    fn defaults_to_ollama_with_no_env_set() {
        let _guard = ENV_LOCK.lock().unwrap();
        clear_rlm_env();
        let settings = Settings::from_env().expect("ollama requires no api key");
        assert_eq!(
            settings.role_providers[&Role::Attacker].provider,
            Provider::Ollama
        );
        assert_eq!(settings.max_concurrent_attacks, 3);
        clear_rlm_env();
    }

    #[test]
    fn non_ollama_provider_without_api_key_is_rejected() {
        let _guard = ENV_LOCK.lock().unwrap();
        clear_rlm_env();
        env::set_var("RLM_ATTACKER_PROVIDER", "openai");
        let result = Settings::from_env();
        assert!(result.is_err());
        clear_rlm_env();
    }

    #[test]
    fn zero_concurrency_is_rejected() {
        let _guard = ENV_LOCK.lock().unwrap();
        clear_rlm_env();
        env::set_var("RLM_MAX_CONCURRENT_ATTACKS", "0");
        let result = Settings::from_env();
        assert!(result.is_err());
        clear_rlm_env();
    }

    #[test]
    fn build_clients_yields_one_client_per_role() {
        let _guard = ENV_LOCK.lock().unwrap();
        clear_rlm_env();
        let settings = Settings::from_env().unwrap();
        let clients = settings.build_clients().unwrap();
        assert_eq!(clients.len(), 3);
        assert_eq!(clients[&Role::Attacker].provider(), Provider::Ollama);
        clear_rlm_env();
    }
}
