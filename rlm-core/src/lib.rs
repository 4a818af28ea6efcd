//! # rlm-core
//!
//! A PAIR-style adversarial red-teaming harness: an attacker model mutates a
//! seed prompt, a target model responds, and a judge model scores the
//! response against a weighted rubric. Iterates per seed prompt until the
//! judge converges on a high-confidence finding or the iteration budget runs
//! out.
//!
//! ## Core components
//!
//! - **`config`**: process-wide settings, loaded once from the environment
//! - **`llm`**: per-provider clients behind a role-routed [`llm::Gateway`],
//!   with retry/backoff and a [`llm::CircuitBreaker`] per `(provider, role)`
//! - **`mutator`**: the prompt mutation catalogue
//! - **`judge`**: scores a target response against the seven-axis rubric
//! - **`orchestrator`**: runs the outer seed-prompt loop and inner PAIR loop
//! - **`persistence`**: transactional SQLite storage for experiments and
//!   everything they produce
//! - **`events`**: verbosity-filtered live event bus and task queue
//! - **`audit`**: day-stamped JSONL log of every LLM call
//!
//! ```rust,ignore
//! use rlm_core::config::Settings;
//! use rlm_core::orchestrator::{Orchestrator, OrchestratorConfigBuilder, CancellationToken};
//!
//! let settings = Settings::from_env()?;
//! // ... construct gateway, judge, persistence, events, audit from settings ...
//! let config = OrchestratorConfigBuilder::new().seed_failure_budget(5).build();
//! ```

pub mod audit;
pub mod config;
pub mod error;
pub mod events;
pub mod judge;
pub mod llm;
pub mod mutator;
pub mod orchestrator;
pub mod persistence;

pub use config::Settings;
pub use error::{Error, Result};
pub use events::{EventBus, EventKind, ExperimentEvent, Task, TaskQueue, TaskStatus};
pub use judge::{AxisScores, AxisWeights, Judge, JudgeConfig, JudgeScore, Severity};
pub use llm::{
    build_client, AnthropicClient, AzureOpenAIClient, ChatMessage, ChatRole, ClientConfig,
    CompletionRequest, CompletionResult, Gateway, LLMClient, OllamaClient, OpenAIClient,
    OpenRouterClient, Provider, RetryConfig, Role,
};
pub use mutator::{AttackerTrace, Feedback, Mutation, MutatorError, MutatorFamily, MutatorMeta};
pub use orchestrator::{
    CancellationToken, ExperimentConfig, Orchestrator, OrchestratorConfig, OrchestratorConfigBuilder,
    SeedResult,
};
pub use persistence::{
    AppendIterationInput, AttackIteration, Experiment, ExperimentStatus, ExperimentTemplate,
    MutationRecord, SqlitePersistence, Vulnerability,
};
