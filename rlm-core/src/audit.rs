//! Day-stamped JSONL audit trail of every LLM call the gateway makes.

use std::path::{Path, PathBuf};

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tokio::fs::{File, OpenOptions};
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;

use crate::error::Result;
use crate::llm::{Provider, Role};

/// One audited call. Prompts are never stored in full, only their digest, so
/// the log can be retained without becoming a second copy of conversation data.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditRecord {
    pub experiment_id: String,
    pub iteration: u32,
    pub provider: Provider,
    pub role: Role,
    pub prompt_digest: String,
    pub response_digest: String,
    pub latency_ms: u64,
    pub success: bool,
    pub timestamp: DateTime<Utc>,
}

pub fn digest(content: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(content.as_bytes());
    format!("{:x}", hasher.finalize())
}

struct AuditLogInner {
    dir: PathBuf,
    current_date: Option<NaiveDate>,
    file: Option<File>,
}

/// Mutex-serialized writer over day-stamped `audit_<YYYY-MM-DD>.jsonl` files.
pub struct AuditLog {
    inner: Mutex<AuditLogInner>,
    retention_days: u32,
}

impl AuditLog {
    pub fn new(dir: impl Into<PathBuf>, retention_days: u32) -> Self {
        Self {
            inner: Mutex::new(AuditLogInner {
                dir: dir.into(),
                current_date: None,
                file: None,
            }),
            retention_days,
        }
    }

    fn path_for(dir: &Path, date: NaiveDate) -> PathBuf {
        dir.join(format!("audit_{}.jsonl", date.format("%Y-%m-%d")))
    }

    pub async fn record(&self, record: AuditRecord) -> Result<()> {
        let mut inner = self.inner.lock().await;
        let today = record.timestamp.date_naive();

        if inner.current_date != Some(today) || inner.file.is_none() {
            tokio::fs::create_dir_all(&inner.dir)
                .await
                .map_err(|e| crate::error::Error::persistence_error(e.to_string()))?;
            let path = Self::path_for(&inner.dir, today);
            let file = OpenOptions::new()
                .create(true)
                .append(true)
                .open(&path)
                .await
                .map_err(|e| crate::error::Error::persistence_error(e.to_string()))?;
            inner.file = Some(file);
            inner.current_date = Some(today);
        }

        let mut line = serde_json::to_string(&record)?;
        line.push('\n');

        if let Some(file) = inner.file.as_mut() {
            file.write_all(line.as_bytes())
                .await
                .map_err(|e| crate::error::Error::persistence_error(e.to_string()))?;
        }
        Ok(())
    }

    /// Delete audit files older than `retention_days`. Best-effort: a file
    /// whose name does not parse as a date is left alone.
    pub async fn enforce_retention(&self) -> Result<usize> {
        let inner = self.inner.lock().await;
        let cutoff = Utc::now().date_naive() - chrono::Duration::days(self.retention_days as i64);

        let mut removed = 0;
        let mut entries = match tokio::fs::read_dir(&inner.dir).await {
            Ok(entries) => entries,
            Err(_) => return Ok(0),
        };

        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(|e| crate::error::Error::persistence_error(e.to_string()))?
        {
            let name = entry.file_name();
            let name = name.to_string_lossy();
            if let Some(date_str) = name
                .strip_prefix("audit_")
                .and_then(|s| s.strip_suffix(".jsonl"))
            {
                if let Ok(date) = NaiveDate::parse_from_str(date_str, "%Y-%m-%d") {
                    if date < cutoff {
                        let _ = tokio::fs::remove_file(entry.path()).await;
                        removed += 1;
                    }
                }
            }
        }
        Ok(removed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn digest_is_deterministic_and_content_sensitive() {
        let a = digest("hello world");
        let b = digest("hello world");
        let c = digest("hello worlD");
        assert_eq!(a, b);
        assert_ne!(a, c);
    }

    #[tokio::test]
    async fn record_creates_day_stamped_file() {
        let dir = tempfile::tempdir().unwrap();
        let log = AuditLog::new(dir.path(), 90);

        let now = Utc::now();
        log.record(AuditRecord {
            experiment_id: "exp-1".into(),
            iteration: 1,
            provider: Provider::Ollama,
            role: Role::Attacker,
            prompt_digest: digest("prompt"),
            response_digest: digest("response"),
            latency_ms: 12,
            success: true,
            timestamp: now,
        })
        .await
        .unwrap();

        let expected = dir.path().join(format!("audit_{}.jsonl", now.format("%Y-%m-%d")));
        assert!(expected.exists());
        let contents = tokio::fs::read_to_string(expected).await.unwrap();
        assert!(contents.contains("exp-1"));
    }

    #[tokio::test]
    async fn enforce_retention_removes_old_files_only() {
        let dir = tempfile::tempdir().unwrap();
        let old_path = dir.path().join("audit_2000-01-01.jsonl");
        tokio::fs::write(&old_path, b"{}\n").await.unwrap();

        let log = AuditLog::new(dir.path(), 90);
        let removed = log.enforce_retention().await.unwrap();
        assert_eq!(removed, 1);
        assert!(!old_path.exists());
    }
}
