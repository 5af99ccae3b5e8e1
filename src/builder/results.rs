//! Results collection on disk.
//!
//! ```text
//! <output_dir>/
//!   summary.json
//!   <instance_id>/
//!     result.json
//!     Dockerfile
//!     eval.sh
//!     rounds/round_<n>.json
//! ```
//!
//! An instance directory is replaced wholesale when the instance is
//! written again.

use anyhow::Context;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use super::state::InstanceOutcome;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstanceStatus {
    pub instance_id: String,
    pub status: String,
    pub rounds_used: u32,
    pub cache_hit: bool,
}

/// Batch-level counts written to `summary.json`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatchSummary {
    pub total: usize,
    pub succeeded: usize,
    pub failed: usize,
    pub cache_hits: usize,
    pub total_rounds: u64,
    pub total_tokens: u64,
    /// Failed instances per failure kind.
    pub failures: BTreeMap<String, usize>,
    pub instances: Vec<InstanceStatus>,
    pub generated_at: DateTime<Utc>,
}

impl BatchSummary {
    pub fn from_outcomes(outcomes: &[InstanceOutcome]) -> Self {
        let mut failures = BTreeMap::new();
        for kind in outcomes.iter().filter_map(InstanceOutcome::failure_kind) {
            *failures.entry(kind.as_str().to_string()).or_insert(0) += 1;
        }
        let succeeded = outcomes.iter().filter(|o| o.success).count();
        Self {
            total: outcomes.len(),
            succeeded,
            failed: outcomes.len() - succeeded,
            cache_hits: outcomes.iter().filter(|o| o.cache_hit).count(),
            total_rounds: outcomes.iter().map(|o| o.rounds_used as u64).sum(),
            total_tokens: outcomes
                .iter()
                .map(|o| o.generation.usage.total_tokens as u64)
                .sum(),
            failures,
            instances: outcomes
                .iter()
                .map(|o| InstanceStatus {
                    instance_id: o.instance_id.clone(),
                    status: o.status_label(),
                    rounds_used: o.rounds_used,
                    cache_hit: o.cache_hit,
                })
                .collect(),
            generated_at: Utc::now(),
        }
    }
}

pub struct ResultsWriter {
    root: PathBuf,
}

impl ResultsWriter {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn instance_dir(&self, instance_id: &str) -> PathBuf {
        self.root.join(sanitize_dir_name(instance_id))
    }

    /// Write one instance's artifacts, replacing any earlier run.
    pub async fn write_instance(&self, outcome: &InstanceOutcome) -> anyhow::Result<PathBuf> {
        let dir = self.instance_dir(&outcome.instance_id);
        if tokio::fs::try_exists(&dir).await.unwrap_or(false) {
            tokio::fs::remove_dir_all(&dir)
                .await
                .with_context(|| format!("Failed to clear {}", dir.display()))?;
        }
        let rounds_dir = dir.join("rounds");
        tokio::fs::create_dir_all(&rounds_dir)
            .await
            .with_context(|| format!("Failed to create {}", rounds_dir.display()))?;

        if let Some(env) = &outcome.environment {
            write_file(&dir.join("Dockerfile"), &env.dockerfile).await?;
        }
        if let Some(script) = &outcome.eval_script {
            write_file(&dir.join("eval.sh"), &script.text).await?;
        }
        write_file(&dir.join("result.json"), &serde_json::to_string_pretty(outcome)?).await?;
        for round in &outcome.rounds {
            let path = rounds_dir.join(format!("round_{}.json", round.round));
            write_file(&path, &serde_json::to_string_pretty(round)?).await?;
        }

        tracing::debug!(
            instance_id = %outcome.instance_id,
            dir = %dir.display(),
            rounds = outcome.rounds.len(),
            "Wrote instance results"
        );
        Ok(dir)
    }

    pub async fn write_summary(&self, outcomes: &[InstanceOutcome]) -> anyhow::Result<BatchSummary> {
        tokio::fs::create_dir_all(&self.root)
            .await
            .with_context(|| format!("Failed to create {}", self.root.display()))?;
        let summary = BatchSummary::from_outcomes(outcomes);
        write_file(
            &self.root.join("summary.json"),
            &serde_json::to_string_pretty(&summary)?,
        )
        .await?;
        Ok(summary)
    }
}

async fn write_file(path: &Path, content: &str) -> anyhow::Result<()> {
    tokio::fs::write(path, content)
        .await
        .with_context(|| format!("Failed to write {}", path.display()))
}

/// Instance ids come from input records; keep them to one path component.
fn sanitize_dir_name(id: &str) -> String {
    let cleaned: String = id
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.') {
                c
            } else {
                '_'
            }
        })
        .collect();
    match cleaned.trim_matches('.') {
        "" => "_".to_string(),
        _ => cleaned,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::builder::state::FailureKind;
    use crate::types::{EnvironmentSpec, EvalScript, TaskInstance};

    fn outcome(id: &str, success: bool) -> InstanceOutcome {
        let instance = TaskInstance {
            instance_id: id.into(),
            repo: "o/r".into(),
            base_commit: "abc".into(),
            language: "python".into(),
            problem_statement: String::new(),
            gold_patch: String::new(),
            test_patch: String::new(),
            version: None,
            fail_to_pass: None,
            allowed_regressions: Vec::new(),
            hints_text: None,
            created_at: None,
        };
        let mut out =
            InstanceOutcome::failed_early(&instance, 5, FailureKind::RoundLimitExceeded, "budget");
        if success {
            out.success = true;
            out.failure = None;
            out.rounds_used = 2;
            out.environment = Some(EnvironmentSpec::from_dockerfile("FROM python:3.11\n").unwrap());
            out.eval_script = Some(EvalScript::new("#!/bin/bash\necho ok\n"));
        }
        out
    }

    #[test]
    fn test_sanitize_dir_name() {
        assert_eq!(sanitize_dir_name("o__r-abc123"), "o__r-abc123");
        assert_eq!(sanitize_dir_name("../etc/passwd"), ".._etc_passwd");
        assert_eq!(sanitize_dir_name(".."), "_");
    }

    #[test]
    fn test_summary_counts() {
        let outcomes = vec![outcome("a", true), outcome("b", false), outcome("c", false)];
        let summary = BatchSummary::from_outcomes(&outcomes);
        assert_eq!(summary.total, 3);
        assert_eq!(summary.succeeded, 1);
        assert_eq!(summary.failed, 2);
        assert_eq!(summary.failures.get("round_limit_exceeded"), Some(&2));
        assert_eq!(summary.total_rounds, 2);
        assert_eq!(summary.instances[1].status, "failed(round_limit_exceeded)");
    }

    #[tokio::test]
    async fn test_write_instance_overwrites() {
        let dir = tempfile::tempdir().unwrap();
        let writer = ResultsWriter::new(dir.path());

        let first = writer.write_instance(&outcome("a", true)).await.unwrap();
        assert!(first.join("Dockerfile").exists());
        assert!(first.join("eval.sh").exists());

        let second = writer.write_instance(&outcome("a", false)).await.unwrap();
        assert_eq!(first, second);
        assert!(!second.join("Dockerfile").exists());
        let result: serde_json::Value =
            serde_json::from_str(&std::fs::read_to_string(second.join("result.json")).unwrap())
                .unwrap();
        assert_eq!(result["success"], false);

        let summary = writer.write_summary(&[outcome("a", false)]).await.unwrap();
        assert_eq!(summary.total, 1);
        assert!(dir.path().join("summary.json").exists());
    }
}
