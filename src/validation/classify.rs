//! Fail2Pass / Pass2Pass analysis and round classification.

use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;

use super::report::{OutcomeMap, TestOutcome};

/// Result class of one validation round.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Classification {
    Success,
    BuildFailure,
    TestHarnessFailure,
    Flaky,
    Unsupported,
}

impl Classification {
    pub fn as_str(&self) -> &'static str {
        match self {
            Classification::Success => "success",
            Classification::BuildFailure => "build_failure",
            Classification::TestHarnessFailure => "test_harness_failure",
            Classification::Flaky => "flaky",
            Classification::Unsupported => "unsupported",
        }
    }
}

impl fmt::Display for Classification {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Classification plus a one-line human reason.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Verdict {
    pub classification: Classification,
    pub reason: String,
}

impl Verdict {
    pub fn new(classification: Classification, reason: impl Into<String>) -> Self {
        Self {
            classification,
            reason: reason.into(),
        }
    }
}

/// Derived test sets for one round.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SignalAnalysis {
    pub focus: BTreeSet<String>,
    pub fail_to_pass: BTreeSet<String>,
    pub pass_to_pass: BTreeSet<String>,
    /// Passing pre-patch, FAIL/ERROR post-patch, not allowed, not unstable.
    pub regressions: BTreeSet<String>,
    /// Outcome differed across repeated pre-patch runs.
    pub unstable: BTreeSet<String>,
    /// Focus tests that did not go from failing to PASS.
    pub focus_unmet: BTreeSet<String>,
    pub total_tests: usize,
}

/// Repository-relative paths touched by a unified diff.
pub fn patch_files(patch: &str) -> Vec<String> {
    let re = match Regex::new(r"(?m)^diff --git a/(\S+) b/(\S+)") {
        Ok(re) => re,
        Err(_) => return Vec::new(),
    };
    let mut files: Vec<String> = re
        .captures_iter(patch)
        .filter_map(|c| c.get(2).map(|m| m.as_str().to_string()))
        .collect();
    files.dedup();
    files
}

fn is_failing_or_missing(outcome: Option<&TestOutcome>) -> bool {
    outcome.map_or(true, |o| o.is_failing())
}

fn id_segments(test_id: &str) -> Vec<&str> {
    test_id
        .split(|c: char| matches!(c, '/' | '.' | ':' | '#' | '(' | ')' | '[' | ']' | ' '))
        .filter(|s| !s.is_empty())
        .collect()
}

/// Whether `test_id` names a test defined in `path`.
///
/// Matches the literal path, the dotted module path, or the file stem as a
/// whole id segment; `test_m` never matches `test_models`.
fn mentions_file(test_id: &str, path: &str) -> bool {
    if test_id.contains(path) {
        return true;
    }
    let without_ext = path.rsplit_once('.').map_or(path, |(stem, _)| stem);
    let module: Vec<&str> = without_ext.split('/').filter(|s| !s.is_empty()).collect();
    let segments = id_segments(test_id);
    if module.len() > 1 && segments.windows(module.len()).any(|w| w == module.as_slice()) {
        return true;
    }
    match module.last() {
        Some(stem) if stem.len() >= 4 => segments.contains(stem),
        _ => false,
    }
}

/// Tests whose transition is the Fail2Pass signal.
///
/// An explicit list wins. Otherwise the focus is every test that lives in a
/// file touched by `test_patch`, is failing (or absent) in the reference
/// pre-patch run and passes post-patch. Tests in those files that were
/// broken before and stay broken are not targeted by the patch; tests that
/// already pass are covered by the Pass2Pass guard.
pub fn focus_tests(
    explicit: Option<&[String]>,
    test_patch: &str,
    pre: &OutcomeMap,
    post: &OutcomeMap,
) -> BTreeSet<String> {
    if let Some(list) = explicit.filter(|l| !l.is_empty()) {
        return list.iter().map(|s| s.trim().to_string()).collect();
    }

    let files = patch_files(test_patch);
    post.iter()
        .filter(|(_, outcome)| **outcome == TestOutcome::Pass)
        .map(|(id, _)| id)
        .filter(|id| files.iter().any(|f| mentions_file(id, f)))
        .filter(|id| is_failing_or_missing(pre.get(id.as_str())))
        .cloned()
        .collect()
}

/// Tests whose outcome is not identical in every pre-patch run.
pub fn unstable_tests(pre_runs: &[OutcomeMap]) -> BTreeSet<String> {
    let Some((first, rest)) = pre_runs.split_first() else {
        return BTreeSet::new();
    };
    let all_ids: BTreeSet<&String> = pre_runs.iter().flat_map(|r| r.keys()).collect();
    all_ids
        .into_iter()
        .filter(|id| rest.iter().any(|run| run.get(*id) != first.get(*id)))
        .cloned()
        .collect()
}

/// Compute every derived set from the raw outcomes.
///
/// `pre_runs[0]` is the reference pre-patch run; further entries are repeats.
pub fn analyze(
    pre_runs: &[OutcomeMap],
    post: &OutcomeMap,
    focus: BTreeSet<String>,
    allowed_regressions: &BTreeSet<String>,
) -> SignalAnalysis {
    let empty = OutcomeMap::new();
    let pre = pre_runs.first().unwrap_or(&empty);
    let unstable = unstable_tests(pre_runs);

    let fail_to_pass: BTreeSet<String> = post
        .iter()
        .filter(|(id, o)| **o == TestOutcome::Pass && is_failing_or_missing(pre.get(*id)))
        .map(|(id, _)| id.clone())
        .collect();

    let pass_to_pass: BTreeSet<String> = pre
        .iter()
        .filter(|(id, o)| **o == TestOutcome::Pass && post.get(*id) == Some(&TestOutcome::Pass))
        .map(|(id, _)| id.clone())
        .collect();

    let regressions: BTreeSet<String> = pre
        .iter()
        .filter(|(id, o)| {
            **o == TestOutcome::Pass
                && post.get(*id).is_some_and(|p| p.is_failing())
                && !allowed_regressions.contains(*id)
                && !unstable.contains(*id)
        })
        .map(|(id, _)| id.clone())
        .collect();

    let focus_unmet = focus
        .iter()
        .filter(|id| !fail_to_pass.contains(*id))
        .cloned()
        .collect();

    let total_tests = pre
        .keys()
        .chain(post.keys())
        .collect::<BTreeSet<_>>()
        .len();

    SignalAnalysis {
        focus,
        fail_to_pass,
        pass_to_pass,
        regressions,
        unstable,
        focus_unmet,
        total_tests,
    }
}

fn preview(set: &BTreeSet<String>) -> String {
    let shown: Vec<&str> = set.iter().take(5).map(String::as_str).collect();
    if set.len() > shown.len() {
        format!("{} (+{} more)", shown.join(", "), set.len() - shown.len())
    } else {
        shown.join(", ")
    }
}

/// Decide the class of a round whose build and runs all completed.
pub fn classify(analysis: &SignalAnalysis, post: &OutcomeMap) -> Verdict {
    if analysis.total_tests == 0 {
        return Verdict::new(
            Classification::TestHarnessFailure,
            "eval report contained no tests",
        );
    }
    if analysis.focus.is_empty() {
        return Verdict::new(
            Classification::TestHarnessFailure,
            "no focus tests located: no test in the files touched by the test patch went from failing to passing",
        );
    }

    let unstable_focus: BTreeSet<String> = analysis
        .focus
        .intersection(&analysis.unstable)
        .cloned()
        .collect();
    if !unstable_focus.is_empty() {
        if unstable_focus.len() == analysis.focus.len() {
            return Verdict::new(
                Classification::Unsupported,
                format!(
                    "every focus test is nondeterministic across pre-patch runs: {}",
                    preview(&unstable_focus)
                ),
            );
        }
        return Verdict::new(
            Classification::Flaky,
            format!(
                "focus tests changed outcome across pre-patch runs: {}",
                preview(&unstable_focus)
            ),
        );
    }

    if analysis
        .focus
        .iter()
        .all(|id| post.get(id) == Some(&TestOutcome::Skip))
    {
        return Verdict::new(
            Classification::Unsupported,
            "every focus test is skipped post-patch",
        );
    }

    if analysis.focus_unmet.is_empty() && analysis.regressions.is_empty() {
        return Verdict::new(
            Classification::Success,
            format!(
                "{} fail-to-pass, {} pass-to-pass",
                analysis.fail_to_pass.len(),
                analysis.pass_to_pass.len()
            ),
        );
    }

    let mut reasons = Vec::new();
    if !analysis.focus_unmet.is_empty() {
        reasons.push(format!(
            "focus tests not failing-to-passing: {}",
            preview(&analysis.focus_unmet)
        ));
    }
    if !analysis.regressions.is_empty() {
        reasons.push(format!(
            "pass-to-pass regressions: {}",
            preview(&analysis.regressions)
        ));
    }
    Verdict::new(Classification::TestHarnessFailure, reasons.join("; "))
}
