//! Prompt mutation strategies used by the attack loop's mutate step.
//!
//! Strategies are plain data (id + family + a `requires_feedback` flag) plus
//! a function, looked up by id in [`registry`]. This is deliberately not a
//! trait-object hierarchy: strategies don't share enough behavior to justify
//! one, and a flat registry keeps the whole catalogue visible in one file.

mod llm_assisted;
mod registry;
mod transforms;
mod types;

pub use registry::{apply, catalogue, meta_for};
pub use types::{AttackerTrace, Feedback, Mutation, MutatorError, MutatorFamily, MutatorMeta};
