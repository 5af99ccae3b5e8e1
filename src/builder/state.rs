//! Refinement state machine states and terminal records.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;

use crate::agents::ConversationStats;
use crate::types::{EnvironmentSpec, EvalScript, Finding, TaskInstance};
use crate::validation::{Classification, ValidationResult};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum BuilderState {
    Start,
    Explore,
    DraftEnv,
    DraftEval,
    Validate,
    Refine,
    Success,
    Failed,
}

impl BuilderState {
    pub fn as_str(&self) -> &'static str {
        match self {
            BuilderState::Start => "START",
            BuilderState::Explore => "EXPLORE",
            BuilderState::DraftEnv => "DRAFT_ENV",
            BuilderState::DraftEval => "DRAFT_EVAL",
            BuilderState::Validate => "VALIDATE",
            BuilderState::Refine => "REFINE",
            BuilderState::Success => "SUCCESS",
            BuilderState::Failed => "FAILED",
        }
    }

    /// `SUCCESS` and `FAILED` are absorbing.
    pub fn is_terminal(&self) -> bool {
        matches!(self, BuilderState::Success | BuilderState::Failed)
    }

    /// Where the next round starts after a failed round.
    ///
    /// A missing finding (cache hit, or exploration that never finished)
    /// always sends the round back to exploration; a missing environment
    /// sends a harness failure back to drafting.
    pub fn refine_target(
        classification: Classification,
        has_finding: bool,
        has_environment: bool,
    ) -> BuilderState {
        if !has_finding {
            return BuilderState::Explore;
        }
        match classification {
            Classification::BuildFailure => BuilderState::DraftEnv,
            Classification::TestHarnessFailure if has_environment => BuilderState::DraftEval,
            Classification::TestHarnessFailure => BuilderState::DraftEnv,
            Classification::Flaky | Classification::Unsupported => BuilderState::Explore,
            // Success never reaches REFINE.
            Classification::Success => BuilderState::Explore,
        }
    }
}

impl fmt::Display for BuilderState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Why an instance ended in `FAILED`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    /// Round budget spent without a success.
    RoundLimitExceeded,
    /// A drafted artifact repeated one already tried.
    Stalled,
    /// Generation or container transport failed after retries.
    BackendFailure,
    /// The input record is unusable.
    InvalidInput,
    /// The instance task panicked or was aborted.
    Crashed,
}

impl FailureKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            FailureKind::RoundLimitExceeded => "round_limit_exceeded",
            FailureKind::Stalled => "stalled",
            FailureKind::BackendFailure => "backend_failure",
            FailureKind::InvalidInput => "invalid_input",
            FailureKind::Crashed => "crashed",
        }
    }
}

impl fmt::Display for FailureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Failure {
    pub kind: FailureKind,
    pub reason: String,
}

/// Validation evidence without raw logs, for the terminal record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ValidationSummary {
    pub build_ok: bool,
    pub classification: Classification,
    pub reason: String,
    pub fail_to_pass: BTreeSet<String>,
    pub pass_to_pass: BTreeSet<String>,
    pub regressions: BTreeSet<String>,
    pub focus: BTreeSet<String>,
    pub pre_patch_runs: usize,
    pub total_tests: usize,
}

impl From<&ValidationResult> for ValidationSummary {
    fn from(v: &ValidationResult) -> Self {
        Self {
            build_ok: v.build_ok,
            classification: v.classification,
            reason: v.reason.clone(),
            fail_to_pass: v.analysis.fail_to_pass.clone(),
            pass_to_pass: v.analysis.pass_to_pass.clone(),
            regressions: v.analysis.regressions.clone(),
            focus: v.analysis.focus.clone(),
            pre_patch_runs: v.pre_patch_outcomes.len(),
            total_tests: v.analysis.total_tests,
        }
    }
}

/// Record of one round, kept for diagnosis after the instance ends.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoundRecord {
    pub round: u32,
    /// State the round began in.
    pub entry_state: BuilderState,
    pub states: Vec<BuilderState>,
    pub classification: Classification,
    pub reason: String,
    pub cache_hit: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub environment_hash: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub eval_script_hash: Option<String>,
    pub generation: ConversationStats,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub duration_ms: u64,
    /// Full validation evidence including raw logs; absent when an agent
    /// exhausted its turns before validation.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub validation: Option<ValidationResult>,
}

/// Terminal record of one instance. Always carries `success` and
/// `rounds_used`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstanceOutcome {
    pub instance_id: String,
    pub repo: String,
    pub base_commit: String,
    pub language: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub failure: Option<Failure>,
    pub rounds_used: u32,
    pub round_limit: u32,
    pub cache_hit: bool,
    /// Classification of every attempted round, in order.
    pub classification_history: Vec<Classification>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub finding: Option<Finding>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub environment: Option<EnvironmentSpec>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub eval_script: Option<EvalScript>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub validation: Option<ValidationSummary>,
    pub generation: ConversationStats,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub duration_ms: u64,
    /// Per-round records; written to their own files.
    #[serde(skip)]
    pub rounds: Vec<RoundRecord>,
}

impl InstanceOutcome {
    /// A failed record for an instance that never entered the loop.
    pub fn failed_early(
        instance: &TaskInstance,
        round_limit: u32,
        kind: FailureKind,
        reason: impl Into<String>,
    ) -> Self {
        let now = Utc::now();
        Self {
            instance_id: instance.instance_id.clone(),
            repo: instance.repo.clone(),
            base_commit: instance.base_commit.clone(),
            language: instance.language.clone(),
            version: instance.version.clone(),
            success: false,
            failure: Some(Failure {
                kind,
                reason: reason.into(),
            }),
            rounds_used: 0,
            round_limit,
            cache_hit: false,
            classification_history: Vec::new(),
            finding: None,
            environment: None,
            eval_script: None,
            validation: None,
            generation: ConversationStats::default(),
            started_at: now,
            finished_at: now,
            duration_ms: 0,
            rounds: Vec::new(),
        }
    }

    /// A failed record for an input line that could not be parsed at all.
    pub fn invalid_line(line: usize, round_limit: u32, reason: impl Into<String>) -> Self {
        let placeholder = TaskInstance {
            instance_id: format!("line-{}", line),
            repo: String::new(),
            base_commit: String::new(),
            language: String::new(),
            problem_statement: String::new(),
            gold_patch: String::new(),
            test_patch: String::new(),
            version: None,
            fail_to_pass: None,
            allowed_regressions: Vec::new(),
            hints_text: None,
            created_at: None,
        };
        Self::failed_early(&placeholder, round_limit, FailureKind::InvalidInput, reason)
    }

    pub fn failure_kind(&self) -> Option<FailureKind> {
        self.failure.as_ref().map(|f| f.kind)
    }

    /// `success` or `failed(<kind>)`.
    pub fn status_label(&self) -> String {
        match &self.failure {
            None if self.success => "success".to_string(),
            Some(f) => format!("failed({})", f.kind),
            None => "failed".to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_refine_routing() {
        use BuilderState::*;
        use Classification::*;
        assert_eq!(BuilderState::refine_target(BuildFailure, true, true), DraftEnv);
        assert_eq!(BuilderState::refine_target(TestHarnessFailure, true, true), DraftEval);
        assert_eq!(BuilderState::refine_target(TestHarnessFailure, true, false), DraftEnv);
        assert_eq!(BuilderState::refine_target(Flaky, true, true), Explore);
        assert_eq!(BuilderState::refine_target(Unsupported, true, true), Explore);
        assert_eq!(BuilderState::refine_target(BuildFailure, false, true), Explore);
    }

    #[test]
    fn test_terminal_states() {
        assert!(BuilderState::Success.is_terminal());
        assert!(BuilderState::Failed.is_terminal());
        assert!(!BuilderState::Refine.is_terminal());
        assert_eq!(BuilderState::DraftEnv.to_string(), "DRAFT_ENV");
        assert_eq!(
            serde_json::to_string(&BuilderState::DraftEval).unwrap(),
            "\"DRAFT_EVAL\""
        );
    }

    #[test]
    fn test_invalid_line_record() {
        let out = InstanceOutcome::invalid_line(7, 5, "expected value");
        assert_eq!(out.instance_id, "line-7");
        assert!(!out.success);
        assert_eq!(out.rounds_used, 0);
        assert_eq!(out.failure_kind(), Some(FailureKind::InvalidInput));
        assert_eq!(out.status_label(), "failed(invalid_input)");

        let json = serde_json::to_value(&out).unwrap();
        assert_eq!(json["success"], false);
        assert_eq!(json["rounds_used"], 0);
        assert_eq!(json["failure"]["kind"], "invalid_input");
        assert!(json.get("rounds").is_none());
    }
}
