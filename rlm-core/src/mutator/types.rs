//! Shared types for the mutator catalogue.

use serde::{Deserialize, Serialize};

/// Which family a strategy belongs to, used for reporting and for picking a
/// fallback when a strategy errors out.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MutatorFamily {
    Deterministic,
    LlmAssisted,
}

/// Static metadata describing one registered strategy. `requires_feedback`
/// marks strategies that need a prior judge score to produce their next
/// mutation (e.g. crescendo-style escalation).
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct MutatorMeta {
    pub id: &'static str,
    pub family: MutatorFamily,
    pub requires_feedback: bool,
}

/// Feedback from the previous iteration, passed to strategies that opt in
/// via `requires_feedback`.
#[derive(Debug, Clone, Default)]
pub struct Feedback {
    pub previous_prompt: Option<String>,
    pub previous_response: Option<String>,
    pub previous_score: Option<f64>,
    pub previous_reasoning: Option<String>,
    pub iteration: u32,
}

/// Bookkeeping for a mutation produced by an attacker-model call, carried
/// through to persistence alongside the mutation itself.
#[derive(Debug, Clone)]
pub struct AttackerTrace {
    pub model: String,
    pub tokens: Option<u64>,
    pub latency_ms: u64,
}

/// The result of applying one strategy to a seed prompt. `trace` is `Some`
/// only for `LlmAssisted` strategies; deterministic transforms never call out.
#[derive(Debug, Clone)]
pub struct Mutation {
    pub strategy_id: &'static str,
    pub input: String,
    pub prompt: String,
    pub trace: Option<AttackerTrace>,
}

#[derive(Debug, thiserror::Error)]
pub enum MutatorError {
    #[error("unknown strategy id: {0}")]
    UnknownStrategy(String),

    #[error("strategy '{0}' requires feedback but none was supplied")]
    MissingFeedback(&'static str),

    #[error("strategy '{0}' failed: {1}")]
    StrategyFailed(&'static str, String),
}
