//! Transactional SQLite persistence for experiments, their iterations, and
//! anything templates need to re-seed a new run.

mod schema;
mod store;

pub use schema::SCHEMA_VERSION;
pub use store::{
    AppendIterationInput, AttackIteration, Experiment, ExperimentStatus, ExperimentTemplate,
    MutationRecord, SqlitePersistence, Vulnerability,
};
