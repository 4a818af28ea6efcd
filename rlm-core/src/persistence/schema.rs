//! Versioned SQLite schema for the persistence gateway.

use rusqlite::Connection;

use crate::error::Result;

pub const SCHEMA_VERSION: i64 = 1;

pub fn initialize_schema(conn: &Connection) -> Result<()> {
    conn.pragma_update(None, "journal_mode", "WAL")?;
    conn.pragma_update(None, "foreign_keys", true)?;

    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS schema_version (
            version INTEGER NOT NULL,
            applied_at TEXT NOT NULL DEFAULT (datetime('now'))
         );",
    )?;

    let current = get_schema_version(conn)?;
    if current < 1 {
        apply_v1_schema(conn)?;
    }

    Ok(())
}

fn apply_v1_schema(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "BEGIN;

         CREATE TABLE IF NOT EXISTS experiments (
             id TEXT PRIMARY KEY,
             name TEXT NOT NULL,
             status TEXT NOT NULL,
             config_json TEXT NOT NULL,
             created_at TEXT NOT NULL,
             updated_at TEXT NOT NULL,
             completed_at TEXT
         );
         CREATE INDEX IF NOT EXISTS idx_experiments_status_created
             ON experiments(status, created_at);

         CREATE TABLE IF NOT EXISTS attack_iterations (
             id TEXT PRIMARY KEY,
             experiment_id TEXT NOT NULL REFERENCES experiments(id) ON DELETE CASCADE,
             seed_prompt_id TEXT NOT NULL,
             iteration_number INTEGER NOT NULL,
             intended_strategy TEXT NOT NULL,
             executed_strategy TEXT NOT NULL,
             strategy_fallback_occurred INTEGER NOT NULL DEFAULT 0,
             fallback_reason TEXT,
             prompt TEXT NOT NULL,
             response TEXT,
             status TEXT NOT NULL,
             success INTEGER NOT NULL DEFAULT 0,
             latency_ms INTEGER,
             timestamp TEXT NOT NULL
         );
         CREATE INDEX IF NOT EXISTS idx_attack_iterations_experiment_timestamp
             ON attack_iterations(experiment_id, timestamp);

         CREATE TABLE IF NOT EXISTS prompt_mutations (
             id TEXT PRIMARY KEY,
             attack_iteration_id TEXT NOT NULL REFERENCES attack_iterations(id) ON DELETE CASCADE,
             strategy_id TEXT NOT NULL,
             family TEXT NOT NULL,
             input_prompt TEXT NOT NULL,
             output_prompt TEXT NOT NULL
         );

         CREATE TABLE IF NOT EXISTS judge_scores (
             id TEXT PRIMARY KEY,
             attack_iteration_id TEXT NOT NULL REFERENCES attack_iterations(id) ON DELETE CASCADE,
             jailbreak_success REAL NOT NULL,
             harmful_content REAL NOT NULL,
             policy_violation REAL NOT NULL,
             hallucination REAL NOT NULL,
             logical_consistency REAL NOT NULL,
             bias REAL NOT NULL,
             sycophancy REAL NOT NULL,
             confidence REAL NOT NULL,
             overall REAL NOT NULL,
             severity TEXT NOT NULL,
             rationale TEXT NOT NULL
         );

         CREATE TABLE IF NOT EXISTS vulnerabilities (
             id TEXT PRIMARY KEY,
             experiment_id TEXT NOT NULL REFERENCES experiments(id) ON DELETE CASCADE,
             attack_iteration_id TEXT NOT NULL REFERENCES attack_iterations(id) ON DELETE CASCADE,
             severity TEXT NOT NULL,
             summary TEXT NOT NULL,
             discovered_at TEXT NOT NULL
         );

         CREATE TABLE IF NOT EXISTS experiment_templates (
             id TEXT PRIMARY KEY,
             name TEXT NOT NULL,
             description TEXT,
             config_json TEXT NOT NULL,
             created_at TEXT NOT NULL
         );

         COMMIT;",
    )?;

    conn.execute(
        "INSERT INTO schema_version (version) VALUES (?1)",
        [SCHEMA_VERSION],
    )?;

    Ok(())
}

pub fn get_schema_version(conn: &Connection) -> Result<i64> {
    let table_exists: bool = conn
        .query_row(
            "SELECT COUNT(*) FROM sqlite_master WHERE type='table' AND name='schema_version'",
            [],
            |row| row.get::<_, i64>(0),
        )
        .map(|count| count > 0)?;

    if !table_exists {
        return Ok(0);
    }

    conn.query_row(
        "SELECT COALESCE(MAX(version), 0) FROM schema_version",
        [],
        |row| row.get(0),
    )
    .map_err(Into::into)
}

pub fn is_initialized(conn: &Connection) -> Result<bool> {
    Ok(get_schema_version(conn)? >= SCHEMA_VERSION)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn initialize_creates_all_tables() {
        let conn = Connection::open_in_memory().unwrap();
        initialize_schema(&conn).unwrap();
        assert!(is_initialized(&conn).unwrap());

        let table_count: i64 = conn
            .query_row(
                "SELECT COUNT(*) FROM sqlite_master WHERE type='table' AND name='experiments'",
                [],
                |row| row.get(0),
            )
            .unwrap();
        assert_eq!(table_count, 1);
    }

    #[test]
    fn initialize_is_idempotent() {
        let conn = Connection::open_in_memory().unwrap();
        initialize_schema(&conn).unwrap();
        initialize_schema(&conn).unwrap();
        let version = get_schema_version(&conn).unwrap();
        assert_eq!(version, SCHEMA_VERSION);
    }

    #[test]
    fn wal_mode_is_enabled() {
        let dir = tempfile::tempdir().unwrap();
        let conn = Connection::open(dir.path().join("test.db")).unwrap();
        initialize_schema(&conn).unwrap();
        let mode: String = conn
            .query_row("PRAGMA journal_mode", [], |row| row.get(0))
            .unwrap();
        assert_eq!(mode.to_lowercase(), "wal");
    }
}
