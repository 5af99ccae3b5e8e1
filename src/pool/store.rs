//! SQLite-backed persistence for the memory pool.
//!
//! Each `put` is a single INSERT, so concurrent writers (tasks in this
//! process or other processes sharing the file) never observe or produce a
//! partially written entry. WAL mode lets readers proceed while a writer
//! holds the lock; `busy_timeout` absorbs writer contention.

use chrono::{DateTime, Utc};
use sqlx::sqlite::{
    SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteRow, SqliteSynchronous,
};
use sqlx::{Row, SqlitePool};
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

use super::{select_entry, MemoryPoolEntry};
use crate::error::MemoryPoolError;

const SCHEMA_SQL: &str = r#"
CREATE TABLE IF NOT EXISTS memory_pool (
    id                INTEGER PRIMARY KEY AUTOINCREMENT,
    repo              TEXT NOT NULL,
    language          TEXT NOT NULL,
    version           TEXT NOT NULL DEFAULT '',
    environment_spec  TEXT NOT NULL,
    eval_script       TEXT NOT NULL,
    instance_id       TEXT NOT NULL,
    base_commit       TEXT NOT NULL DEFAULT '',
    success_timestamp TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_memory_pool_key ON memory_pool(repo, language);
"#;

/// Aggregate counts over the pool.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PoolStats {
    pub entries: u64,
    /// Distinct `(repo, language)` keys.
    pub keys: u64,
    pub repos: u64,
}

#[derive(Clone)]
pub struct MemoryPool {
    pool: SqlitePool,
}

impl MemoryPool {
    /// Open (creating if needed) the pool database at `path`.
    pub async fn open(path: &Path) -> Result<Self, MemoryPoolError> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }

        let opts = SqliteConnectOptions::from_str(&format!("sqlite://{}", path.display()))?
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .synchronous(SqliteSynchronous::Normal)
            .busy_timeout(Duration::from_secs(30));

        let pool = SqlitePoolOptions::new()
            .max_connections(4)
            .connect_with(opts)
            .await?;

        sqlx::query(SCHEMA_SQL).execute(&pool).await?;

        tracing::info!(path = %path.display(), "Memory pool opened");
        Ok(Self { pool })
    }

    /// Append an entry and return its row id.
    pub async fn put(&self, entry: &MemoryPoolEntry) -> Result<i64, MemoryPoolError> {
        if entry.repo.trim().is_empty() || entry.language.trim().is_empty() {
            return Err(MemoryPoolError::InvalidEntry(
                "repo and language must be non-empty".to_string(),
            ));
        }

        let result = sqlx::query(
            "INSERT INTO memory_pool (
                repo, language, version, environment_spec, eval_script,
                instance_id, base_commit, success_timestamp
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
        )
        .bind(&entry.repo)
        .bind(normalize_language(&entry.language))
        .bind(entry.version.trim())
        .bind(&entry.environment_spec)
        .bind(&entry.eval_script)
        .bind(&entry.instance_id)
        .bind(&entry.base_commit)
        .bind(entry.success_timestamp.to_rfc3339())
        .execute(&self.pool)
        .await?;

        let id = result.last_insert_rowid();
        tracing::debug!(
            id,
            repo = %entry.repo,
            language = %entry.language,
            version = %entry.version,
            "Memory pool entry written"
        );
        Ok(id)
    }

    /// All entries for a key, oldest first.
    pub async fn entries_for(
        &self,
        repo: &str,
        language: &str,
    ) -> Result<Vec<MemoryPoolEntry>, MemoryPoolError> {
        let rows = sqlx::query(
            "SELECT * FROM memory_pool WHERE repo = ?1 AND language = ?2 ORDER BY id ASC",
        )
        .bind(repo)
        .bind(normalize_language(language))
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(entry_from_row).collect()
    }

    /// Every entry in the pool, oldest first.
    pub async fn all_entries(&self) -> Result<Vec<MemoryPoolEntry>, MemoryPoolError> {
        let rows = sqlx::query("SELECT * FROM memory_pool ORDER BY id ASC")
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(entry_from_row).collect()
    }

    /// Best entry for `(repo, language)` given an optional requested version.
    pub async fn lookup(
        &self,
        repo: &str,
        language: &str,
        version: Option<&str>,
    ) -> Result<Option<MemoryPoolEntry>, MemoryPoolError> {
        let entries = self.entries_for(repo, language).await?;
        Ok(select_entry(version, &entries).cloned())
    }

    pub async fn stats(&self) -> Result<PoolStats, MemoryPoolError> {
        let row = sqlx::query(
            "SELECT
                COUNT(*) AS entries,
                COUNT(DISTINCT repo || char(31) || language) AS keys,
                COUNT(DISTINCT repo) AS repos
             FROM memory_pool",
        )
        .fetch_one(&self.pool)
        .await?;

        Ok(PoolStats {
            entries: row.try_get::<i64, _>("entries")? as u64,
            keys: row.try_get::<i64, _>("keys")? as u64,
            repos: row.try_get::<i64, _>("repos")? as u64,
        })
    }
}

fn normalize_language(language: &str) -> String {
    language.trim().to_lowercase()
}

fn entry_from_row(row: &SqliteRow) -> Result<MemoryPoolEntry, MemoryPoolError> {
    let raw_ts: String = row.try_get("success_timestamp")?;
    let success_timestamp = DateTime::parse_from_rfc3339(&raw_ts)
        .map(|d| d.with_timezone(&Utc))
        .map_err(|e| {
            MemoryPoolError::InvalidEntry(format!("bad success_timestamp '{}': {}", raw_ts, e))
        })?;

    Ok(MemoryPoolEntry {
        id: Some(row.try_get("id")?),
        repo: row.try_get("repo")?,
        language: row.try_get("language")?,
        version: row.try_get("version")?,
        environment_spec: row.try_get("environment_spec")?,
        eval_script: row.try_get("eval_script")?,
        instance_id: row.try_get("instance_id")?,
        base_commit: row.try_get("base_commit")?,
        success_timestamp,
    })
}
