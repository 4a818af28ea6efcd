//! Transactional SQLite-backed store for experiments and everything they produce.

use std::path::Path;
use std::sync::Arc;

use chrono::Utc;
use rusqlite::{params, Connection, OptionalExtension};
use serde_json::Value;
use tokio::sync::Mutex;
use tracing::instrument;
use uuid::Uuid;

use crate::error::{Error, Result};
use crate::judge::{AxisScores, JudgeScore, Severity};

use super::schema::initialize_schema;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExperimentStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl ExperimentStatus {
    fn as_str(self) -> &'static str {
        match self {
            ExperimentStatus::Pending => "pending",
            ExperimentStatus::Running => "running",
            ExperimentStatus::Completed => "completed",
            ExperimentStatus::Failed => "failed",
            ExperimentStatus::Cancelled => "cancelled",
        }
    }

    fn from_str(raw: &str) -> Result<Self> {
        match raw {
            "pending" => Ok(ExperimentStatus::Pending),
            "running" => Ok(ExperimentStatus::Running),
            "completed" => Ok(ExperimentStatus::Completed),
            "failed" => Ok(ExperimentStatus::Failed),
            "cancelled" => Ok(ExperimentStatus::Cancelled),
            other => Err(Error::persistence_error(format!("unknown experiment status '{other}'"))),
        }
    }
}

#[derive(Debug, Clone)]
pub struct Experiment {
    pub id: String,
    pub name: String,
    pub status: ExperimentStatus,
    pub config: Value,
    pub created_at: String,
    pub updated_at: String,
}

#[derive(Debug, Clone)]
pub struct ExperimentTemplate {
    pub id: String,
    pub name: String,
    pub description: Option<String>,
    pub config: Value,
}

/// The mutation half of an appended iteration. Absent when a strategy's
/// fallback chain is exhausted and the iteration carries no prompt at all.
#[derive(Debug, Clone)]
pub struct MutationRecord {
    pub strategy_id: String,
    pub family: String,
    pub input_prompt: String,
    pub output_prompt: String,
}

/// Everything produced by one turn of the attack loop, written atomically by
/// [`SqlitePersistence::append_iteration`].
#[derive(Debug, Clone)]
pub struct AppendIterationInput {
    pub experiment_id: String,
    pub seed_prompt_id: String,
    pub iteration_number: u32,
    pub intended_strategy: String,
    pub executed_strategy: String,
    pub strategy_fallback_occurred: bool,
    pub fallback_reason: Option<String>,
    pub mutation: Option<MutationRecord>,
    pub prompt: String,
    pub response: Option<String>,
    pub status: String,
    pub success: bool,
    pub latency_ms: Option<u64>,
    pub judge_score: Option<JudgeScore>,
    pub vulnerability_summary: Option<String>,
}

#[derive(Debug, Clone)]
pub struct AttackIteration {
    pub id: String,
    pub experiment_id: String,
    pub seed_prompt_id: String,
    pub iteration_number: u32,
    pub intended_strategy: String,
    pub executed_strategy: String,
    pub strategy_fallback_occurred: bool,
    pub fallback_reason: Option<String>,
    pub prompt: String,
    pub response: Option<String>,
    pub status: String,
    pub success: bool,
    pub latency_ms: Option<u64>,
    pub timestamp: String,
    pub judge_score: Option<JudgeScore>,
}

#[derive(Debug, Clone)]
pub struct Vulnerability {
    pub id: String,
    pub experiment_id: String,
    pub attack_iteration_id: String,
    pub severity: String,
    pub summary: String,
    pub discovered_at: String,
}

/// Wraps a single SQLite connection behind a mutex. Every operation acquires
/// the lock, runs to completion, and releases it; there is no long-lived
/// transaction spanning await points. `append_iteration` is the one operation
/// that needs more than a single statement and runs its inserts inside a
/// `rusqlite` transaction so a crash mid-write can't leave an iteration with a
/// mutation row but no judge score, or vice versa.
pub struct SqlitePersistence {
    conn: Arc<Mutex<Connection>>,
}

impl SqlitePersistence {
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let conn = Connection::open(path)?;
        initialize_schema(&conn)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        initialize_schema(&conn)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    pub async fn create_experiment(&self, name: &str, config: Value) -> Result<String> {
        let id = Uuid::new_v4().to_string();
        let now = Utc::now().to_rfc3339();
        let config_json = serde_json::to_string(&config)?;

        let conn = self.conn.lock().await;
        conn.execute(
            "INSERT INTO experiments (id, name, status, config_json, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?5)",
            params![id, name, ExperimentStatus::Pending.as_str(), config_json, now],
        )?;
        Ok(id)
    }

    pub async fn update_experiment_status(&self, id: &str, status: ExperimentStatus) -> Result<()> {
        let now = Utc::now().to_rfc3339();
        let conn = self.conn.lock().await;
        let completed_at = matches!(
            status,
            ExperimentStatus::Completed | ExperimentStatus::Failed | ExperimentStatus::Cancelled
        )
        .then(|| now.clone());

        let rows = conn.execute(
            "UPDATE experiments SET status = ?1, updated_at = ?2, completed_at = COALESCE(?3, completed_at)
             WHERE id = ?4",
            params![status.as_str(), now, completed_at, id],
        )?;
        if rows == 0 {
            return Err(Error::not_found(format!("experiment {id}")));
        }
        Ok(())
    }

    pub async fn get_experiment(&self, id: &str) -> Result<Experiment> {
        let conn = self.conn.lock().await;
        conn.query_row(
            "SELECT id, name, status, config_json, created_at, updated_at FROM experiments WHERE id = ?1",
            params![id],
            |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, String>(2)?,
                    row.get::<_, String>(3)?,
                    row.get::<_, String>(4)?,
                    row.get::<_, String>(5)?,
                ))
            },
        )
        .optional()?
        .ok_or_else(|| Error::not_found(format!("experiment {id}")))
        .and_then(|(id, name, status, config_json, created_at, updated_at)| {
            Ok(Experiment {
                id,
                name,
                status: ExperimentStatus::from_str(&status)?,
                config: serde_json::from_str(&config_json)?,
                created_at,
                updated_at,
            })
        })
    }

    /// List experiments most-recently-created first, optionally filtered by
    /// status. Backed by the `(status, created_at)` composite index.
    pub async fn list_experiments(&self, status: Option<ExperimentStatus>) -> Result<Vec<Experiment>> {
        let conn = self.conn.lock().await;
        let mut stmt = if status.is_some() {
            conn.prepare(
                "SELECT id, name, status, config_json, created_at, updated_at FROM experiments
                 WHERE status = ?1 ORDER BY created_at DESC",
            )?
        } else {
            conn.prepare(
                "SELECT id, name, status, config_json, created_at, updated_at FROM experiments
                 ORDER BY created_at DESC",
            )?
        };

        let map_row = |row: &rusqlite::Row| -> rusqlite::Result<(String, String, String, String, String, String)> {
            Ok((
                row.get(0)?,
                row.get(1)?,
                row.get(2)?,
                row.get(3)?,
                row.get(4)?,
                row.get(5)?,
            ))
        };

        let rows: Vec<_> = if let Some(status) = status {
            stmt.query_map(params![status.as_str()], map_row)?
                .collect::<rusqlite::Result<_>>()?
        } else {
            stmt.query_map([], map_row)?.collect::<rusqlite::Result<_>>()?
        };

        rows.into_iter()
            .map(|(id, name, status, config_json, created_at, updated_at)| {
                Ok(Experiment {
                    id,
                    name,
                    status: ExperimentStatus::from_str(&status)?,
                    config: serde_json::from_str(&config_json)?,
                    created_at,
                    updated_at,
                })
            })
            .collect()
    }

    /// Write one full turn of the attack loop - the iteration row, its
    /// mutation (if a prompt was actually produced), its judge score (if the
    /// judge ran), and a vulnerability row (if the caller decided this
    /// iteration counts as a finding) - in a single transaction. A failure at
    /// any step rolls the whole thing back rather than leaving a partial
    /// iteration visible to readers.
    #[instrument(skip(self, input), fields(experiment_id = %input.experiment_id, iteration = input.iteration_number))]
    pub async fn append_iteration(&self, input: AppendIterationInput) -> Result<String> {
        let iteration_id = Uuid::new_v4().to_string();
        let now = Utc::now().to_rfc3339();

        let mut conn = self.conn.lock().await;
        let tx = conn.transaction()?;

        tx.execute(
            "INSERT INTO attack_iterations
             (id, experiment_id, seed_prompt_id, iteration_number, intended_strategy, executed_strategy,
              strategy_fallback_occurred, fallback_reason, prompt, response, status, success, latency_ms, timestamp)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14)",
            params![
                iteration_id,
                input.experiment_id,
                input.seed_prompt_id,
                input.iteration_number,
                input.intended_strategy,
                input.executed_strategy,
                input.strategy_fallback_occurred,
                input.fallback_reason,
                input.prompt,
                input.response,
                input.status,
                input.success,
                input.latency_ms.map(|v| v as i64),
                now,
            ],
        )?;

        if let Some(mutation) = &input.mutation {
            let mutation_id = Uuid::new_v4().to_string();
            tx.execute(
                "INSERT INTO prompt_mutations (id, attack_iteration_id, strategy_id, family, input_prompt, output_prompt)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                params![
                    mutation_id,
                    iteration_id,
                    mutation.strategy_id,
                    mutation.family,
                    mutation.input_prompt,
                    mutation.output_prompt,
                ],
            )?;
        }

        if let Some(score) = &input.judge_score {
            let score_id = Uuid::new_v4().to_string();
            let severity = serde_json::to_value(score.severity)?
                .as_str()
                .unwrap_or("low")
                .to_string();
            tx.execute(
                "INSERT INTO judge_scores
                 (id, attack_iteration_id, jailbreak_success, harmful_content, policy_violation, hallucination,
                  logical_consistency, bias, sycophancy, confidence, overall, severity, rationale)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13)",
                params![
                    score_id,
                    iteration_id,
                    score.axes.jailbreak_success,
                    score.axes.harmful_content,
                    score.axes.policy_violation,
                    score.axes.hallucination,
                    score.axes.logical_consistency,
                    score.axes.bias,
                    score.axes.sycophancy,
                    score.axes.confidence,
                    score.overall,
                    severity,
                    score.rationale,
                ],
            )?;
        }

        if let Some(summary) = &input.vulnerability_summary {
            let vulnerability_id = Uuid::new_v4().to_string();
            let severity = input
                .judge_score
                .as_ref()
                .map(|s| serde_json::to_value(s.severity))
                .transpose()?
                .and_then(|v| v.as_str().map(str::to_string))
                .unwrap_or_else(|| "low".to_string());
            tx.execute(
                "INSERT INTO vulnerabilities (id, experiment_id, attack_iteration_id, severity, summary, discovered_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                params![vulnerability_id, input.experiment_id, iteration_id, severity, summary, now],
            )?;
        }

        tx.commit()?;
        Ok(iteration_id)
    }

    /// All iterations for an experiment, oldest first, each with its judge
    /// score attached when one was recorded.
    pub async fn get_iterations(&self, experiment_id: &str) -> Result<Vec<AttackIteration>> {
        let conn = self.conn.lock().await;
        let mut stmt = conn.prepare(
            "SELECT ai.id, ai.experiment_id, ai.seed_prompt_id, ai.iteration_number, ai.intended_strategy,
                    ai.executed_strategy, ai.strategy_fallback_occurred, ai.fallback_reason, ai.prompt,
                    ai.response, ai.status, ai.success, ai.latency_ms, ai.timestamp,
                    js.jailbreak_success, js.harmful_content, js.policy_violation, js.hallucination,
                    js.logical_consistency, js.bias, js.sycophancy, js.confidence, js.overall, js.severity,
                    js.rationale
             FROM attack_iterations ai
             LEFT JOIN judge_scores js ON js.attack_iteration_id = ai.id
             WHERE ai.experiment_id = ?1
             ORDER BY ai.timestamp ASC",
        )?;

        let rows = stmt.query_map(params![experiment_id], |row| {
            let judge_score = match row.get::<_, Option<f64>>(14)? {
                Some(jailbreak_success) => Some(JudgeScore {
                    axes: AxisScores {
                        jailbreak_success,
                        harmful_content: row.get(15)?,
                        policy_violation: row.get(16)?,
                        hallucination: row.get(17)?,
                        logical_consistency: row.get(18)?,
                        bias: row.get(19)?,
                        sycophancy: row.get(20)?,
                        confidence: row.get(21)?,
                    },
                    overall: row.get(22)?,
                    severity: severity_from_row(row.get::<_, String>(23)?),
                    rationale: row.get(24)?,
                    // Per-call judge latency isn't broken out in storage; the
                    // iteration's own latency_ms already folds it in.
                    latency_ms: row.get(12)?,
                }),
                None => None,
            };

            Ok(AttackIteration {
                id: row.get(0)?,
                experiment_id: row.get(1)?,
                seed_prompt_id: row.get(2)?,
                iteration_number: row.get(3)?,
                intended_strategy: row.get(4)?,
                executed_strategy: row.get(5)?,
                strategy_fallback_occurred: row.get(6)?,
                fallback_reason: row.get(7)?,
                prompt: row.get(8)?,
                response: row.get(9)?,
                status: row.get(10)?,
                success: row.get(11)?,
                latency_ms: row.get::<_, Option<i64>>(12)?.map(|v| v as u64),
                timestamp: row.get(13)?,
                judge_score,
            })
        })?;

        rows.collect::<rusqlite::Result<Vec<_>>>().map_err(Into::into)
    }

    /// All vulnerabilities recorded for an experiment, most recent first.
    pub async fn list_vulnerabilities(&self, experiment_id: &str) -> Result<Vec<Vulnerability>> {
        let conn = self.conn.lock().await;
        let mut stmt = conn.prepare(
            "SELECT id, experiment_id, attack_iteration_id, severity, summary, discovered_at
             FROM vulnerabilities WHERE experiment_id = ?1 ORDER BY discovered_at DESC",
        )?;
        let rows = stmt.query_map(params![experiment_id], |row| {
            Ok(Vulnerability {
                id: row.get(0)?,
                experiment_id: row.get(1)?,
                attack_iteration_id: row.get(2)?,
                severity: row.get(3)?,
                summary: row.get(4)?,
                discovered_at: row.get(5)?,
            })
        })?;
        rows.collect::<rusqlite::Result<Vec<_>>>().map_err(Into::into)
    }

    pub async fn create_template(&self, name: &str, description: Option<&str>, config: Value) -> Result<String> {
        let id = Uuid::new_v4().to_string();
        let now = Utc::now().to_rfc3339();
        let config_json = serde_json::to_string(&config)?;
        let conn = self.conn.lock().await;
        conn.execute(
            "INSERT INTO experiment_templates (id, name, description, config_json, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![id, name, description, config_json, now],
        )?;
        Ok(id)
    }

    pub async fn get_template(&self, id: &str) -> Result<ExperimentTemplate> {
        let conn = self.conn.lock().await;
        conn.query_row(
            "SELECT id, name, description, config_json FROM experiment_templates WHERE id = ?1",
            params![id],
            |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, Option<String>>(2)?,
                    row.get::<_, String>(3)?,
                ))
            },
        )
        .optional()?
        .ok_or_else(|| Error::not_found(format!("template {id}")))
        .and_then(|(id, name, description, config_json)| {
            Ok(ExperimentTemplate {
                id,
                name,
                description,
                config: serde_json::from_str(&config_json)?,
            })
        })
    }

    /// Create a new experiment seeded from a template's stored config.
    pub async fn instantiate_template(&self, template_id: &str, name: &str) -> Result<String> {
        let template = self.get_template(template_id).await?;
        self.create_experiment(name, template.config).await
    }
}

fn severity_from_row(raw: String) -> Severity {
    match raw.as_str() {
        "critical" => Severity::Critical,
        "high" => Severity::High,
        "medium" => Severity::Medium,
        _ => Severity::Low,
    }
}
