//! Error taxonomy for the harness.

use thiserror::Error;

use crate::llm::{Provider, Role};

/// Result type alias using the crate's Error type.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur while running an experiment.
#[derive(Error, Debug)]
pub enum Error {
    /// A recognized configuration option was missing or mutually inconsistent.
    #[error("invalid configuration: {0}")]
    ConfigInvalid(String),

    /// A transient provider failure (network, 5xx, provider timeout). Retried per the
    /// gateway's backoff policy before being promoted to `ProviderUnavailable`.
    #[error("transient provider error ({provider}/{role}): {message}")]
    ProviderTransient {
        provider: Provider,
        role: Role,
        message: String,
    },

    /// Retry budget exhausted for a provider call.
    #[error("provider unavailable ({provider}/{role}) after {attempts} attempts: {message}")]
    ProviderUnavailable {
        provider: Provider,
        role: Role,
        attempts: u32,
        message: String,
    },

    /// A request was not issued because the breaker for `(provider, role)` is open.
    #[error("circuit open for {provider}/{role}")]
    CircuitOpen { provider: Provider, role: Role },

    /// The judge's reply could not be parsed as a score object.
    #[error("judge parse failure: {0}")]
    JudgeParseError(String),

    /// A transactional persistence write failed.
    #[error("persistence error: {0}")]
    PersistenceError(String),

    /// The experiment was cancelled by an external signal.
    #[error("experiment cancelled")]
    Cancelled,

    /// The experiment's wall-clock timeout elapsed.
    #[error("experiment timed out after {timeout_secs}s")]
    TimeoutExceeded { timeout_secs: u64 },

    /// An experiment, iteration, or other entity with generic id lookup failed.
    #[error("not found: {0}")]
    NotFound(String),

    /// Authentication missing or invalid for a boundary operation.
    #[error("unauthorized")]
    Unauthorized,

    /// An experiment was already running when `start_experiment` was called again.
    #[error("conflict: {0}")]
    Conflict(String),

    /// Serialization/deserialization error.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Catch-all for invariants that should be unreachable in correct use.
    #[error("internal error: {0}")]
    Internal(String),
}

impl Error {
    pub fn config_invalid(message: impl Into<String>) -> Self {
        Self::ConfigInvalid(message.into())
    }

    pub fn provider_transient(
        provider: Provider,
        role: Role,
        message: impl Into<String>,
    ) -> Self {
        Self::ProviderTransient {
            provider,
            role,
            message: message.into(),
        }
    }

    pub fn provider_unavailable(
        provider: Provider,
        role: Role,
        attempts: u32,
        message: impl Into<String>,
    ) -> Self {
        Self::ProviderUnavailable {
            provider,
            role,
            attempts,
            message: message.into(),
        }
    }

    pub fn circuit_open(provider: Provider, role: Role) -> Self {
        Self::CircuitOpen { provider, role }
    }

    pub fn judge_parse_error(message: impl Into<String>) -> Self {
        Self::JudgeParseError(message.into())
    }

    pub fn persistence_error(message: impl Into<String>) -> Self {
        Self::PersistenceError(message.into())
    }

    pub fn timeout_exceeded(timeout_secs: u64) -> Self {
        Self::TimeoutExceeded { timeout_secs }
    }

    pub fn not_found(entity: impl Into<String>) -> Self {
        Self::NotFound(entity.into())
    }

    pub fn conflict(message: impl Into<String>) -> Self {
        Self::Conflict(message.into())
    }

    /// Whether this error kind should be retried by the gateway's backoff loop.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Error::ProviderTransient { .. })
    }
}

impl From<rusqlite::Error> for Error {
    fn from(err: rusqlite::Error) -> Self {
        Error::PersistenceError(err.to_string())
    }
}
