//! Memory pool: validated environment/eval-script pairs keyed by
//! `(repo, language)` and ranked by version proximity.
//!
//! The persisted form is an insert-only SQLite table. Entries are never
//! updated; a newer entry for the same key supersedes older ones on lookup.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::cmp::Reverse;
use std::sync::Arc;

pub mod store;
pub mod version;

pub use store::{MemoryPool, PoolStats};
pub use version::{Segment, VersionDistance, VersionKey};

use crate::error::MemoryPoolError;

/// One validated artifact pair.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MemoryPoolEntry {
    /// Row id assigned by the store; `None` before insertion.
    #[serde(default)]
    pub id: Option<i64>,
    pub repo: String,
    pub language: String,
    pub version: String,
    pub environment_spec: String,
    pub eval_script: String,
    /// Instance whose validation produced this entry.
    pub instance_id: String,
    /// Commit the environment was validated at; lets a reused Dockerfile be
    /// pointed at another commit.
    #[serde(default)]
    pub base_commit: String,
    pub success_timestamp: DateTime<Utc>,
}

/// Pick the entry to reuse for `requested` among entries of one key.
///
/// Exact version matches win (newest first). Otherwise the entry with the
/// smallest [`VersionDistance`] wins, ties going to the newest
/// `success_timestamp` and then to the latest insertion. With no requested
/// version the newest entry is returned.
pub fn select_entry<'a>(
    requested: Option<&str>,
    entries: &'a [MemoryPoolEntry],
) -> Option<&'a MemoryPoolEntry> {
    let newest = |e: &&MemoryPoolEntry| (e.success_timestamp, e.id);

    let requested = match requested.map(VersionKey::parse) {
        Some(key) if !key.is_empty() => key,
        _ => return entries.iter().max_by_key(newest),
    };

    let exact = entries
        .iter()
        .filter(|e| VersionKey::parse(&e.version).same_version(&requested))
        .max_by_key(newest);
    if exact.is_some() {
        return exact;
    }

    entries.iter().min_by_key(|e| {
        (
            requested.distance_to(&VersionKey::parse(&e.version)),
            Reverse(e.success_timestamp),
            Reverse(e.id),
        )
    })
}

/// A memory pool that may be disabled.
///
/// When disabled, lookups always miss and writes are dropped; nothing else
/// about the builder changes.
#[derive(Clone)]
pub struct PoolHandle(pub Option<Arc<MemoryPool>>);

impl std::fmt::Debug for PoolHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.0 {
            Some(_) => write!(f, "PoolHandle(active)"),
            None => write!(f, "PoolHandle(disabled)"),
        }
    }
}

impl PoolHandle {
    pub fn disabled() -> Self {
        Self(None)
    }

    pub fn enabled(pool: MemoryPool) -> Self {
        Self(Some(Arc::new(pool)))
    }

    pub fn is_enabled(&self) -> bool {
        self.0.is_some()
    }

    pub async fn lookup(
        &self,
        repo: &str,
        language: &str,
        version: Option<&str>,
    ) -> Result<Option<MemoryPoolEntry>, MemoryPoolError> {
        match &self.0 {
            Some(pool) => pool.lookup(repo, language, version).await,
            None => Ok(None),
        }
    }

    pub async fn put(&self, entry: &MemoryPoolEntry) -> Result<(), MemoryPoolError> {
        match &self.0 {
            Some(pool) => pool.put(entry).await.map(|_| ()),
            None => Ok(()),
        }
    }

    pub async fn log_stats(&self) {
        if let Some(pool) = &self.0 {
            match pool.stats().await {
                Ok(s) => tracing::info!(
                    entries = s.entries,
                    keys = s.keys,
                    repos = s.repos,
                    "Memory pool stats"
                ),
                Err(e) => tracing::warn!(error = %e, "Failed to read memory pool stats"),
            }
        }
    }
}
