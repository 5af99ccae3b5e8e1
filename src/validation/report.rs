//! Eval-script report format and parser.
//!
//! An eval script prints its per-test outcomes on stdout between two marker
//! lines. Each non-blank line in between is `<OUTCOME>\t<test_id>` where the
//! outcome is one of `PASS`, `FAIL`, `ERROR` or `SKIP`:
//!
//! ```text
//! >>>>> ENVFORGE_REPORT_START
//! PASS	tests/test_api.py::test_get
//! FAIL	tests/test_api.py::test_post
//! >>>>> ENVFORGE_REPORT_END
//! ```
//!
//! Any other line inside the block is a parse failure, never silently dropped.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

pub const REPORT_START: &str = ">>>>> ENVFORGE_REPORT_START";
pub const REPORT_END: &str = ">>>>> ENVFORGE_REPORT_END";

/// Outcome of one test.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum TestOutcome {
    Pass,
    Fail,
    Error,
    Skip,
}

impl TestOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            TestOutcome::Pass => "PASS",
            TestOutcome::Fail => "FAIL",
            TestOutcome::Error => "ERROR",
            TestOutcome::Skip => "SKIP",
        }
    }

    /// FAIL or ERROR.
    pub fn is_failing(&self) -> bool {
        matches!(self, TestOutcome::Fail | TestOutcome::Error)
    }
}

impl fmt::Display for TestOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TestOutcome {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "PASS" => Ok(TestOutcome::Pass),
            "FAIL" => Ok(TestOutcome::Fail),
            "ERROR" => Ok(TestOutcome::Error),
            "SKIP" => Ok(TestOutcome::Skip),
            _ => Err(()),
        }
    }
}

/// Parsed outcomes keyed by test id, in sorted order.
pub type OutcomeMap = BTreeMap<String, TestOutcome>;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ReportError {
    #[error("report start marker not found in output")]
    MissingStart,

    #[error("report end marker not found after start marker")]
    MissingEnd,

    #[error("malformed report line {line}: '{content}'")]
    MalformedLine { line: usize, content: String },
}

/// Parse the report block out of raw eval-script stdout.
///
/// Parsing is a pure function of the input: the same stdout always yields
/// the same map. When the block names a test twice, the later line wins.
/// Only the last report block is considered, so scripts that echo the
/// markers early (e.g. in `set -x` traces) still parse.
pub fn parse_report(stdout: &str) -> Result<OutcomeMap, ReportError> {
    let lines: Vec<&str> = stdout.lines().collect();
    let start = lines
        .iter()
        .rposition(|l| l.trim_end() == REPORT_START)
        .ok_or(ReportError::MissingStart)?;
    let end = lines[start + 1..]
        .iter()
        .position(|l| l.trim_end() == REPORT_END)
        .map(|offset| start + 1 + offset)
        .ok_or(ReportError::MissingEnd)?;

    let mut outcomes = OutcomeMap::new();
    for (idx, raw) in lines[start + 1..end].iter().enumerate() {
        let line = raw.trim_end_matches('\r');
        if line.trim().is_empty() {
            continue;
        }
        let malformed = || ReportError::MalformedLine {
            line: start + 2 + idx,
            content: line.to_string(),
        };
        let (outcome, test_id) = line.split_once('\t').ok_or_else(malformed)?;
        let outcome = TestOutcome::from_str(outcome.trim()).map_err(|_| malformed())?;
        let test_id = test_id.trim();
        if test_id.is_empty() {
            return Err(malformed());
        }
        outcomes.insert(test_id.to_string(), outcome);
    }
    Ok(outcomes)
}

/// Render outcomes in report form (used by tests and by fixtures).
pub fn render_report(outcomes: &OutcomeMap) -> String {
    let mut out = String::new();
    out.push_str(REPORT_START);
    out.push('\n');
    for (id, outcome) in outcomes {
        out.push_str(outcome.as_str());
        out.push('\t');
        out.push_str(id);
        out.push('\n');
    }
    out.push_str(REPORT_END);
    out.push('\n');
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_basic_report() {
        let stdout = "collecting...\n>>>>> ENVFORGE_REPORT_START\nPASS\ttests/a.py::t1\nFAIL\ttests/a.py::t2\n\nSKIP\tt3\nERROR\tt4\n>>>>> ENVFORGE_REPORT_END\ntrailing noise\n";
        let map = parse_report(stdout).unwrap();
        assert_eq!(map.len(), 4);
        assert_eq!(map["tests/a.py::t1"], TestOutcome::Pass);
        assert_eq!(map["tests/a.py::t2"], TestOutcome::Fail);
        assert_eq!(map["t3"], TestOutcome::Skip);
        assert_eq!(map["t4"], TestOutcome::Error);
    }

    #[test]
    fn test_parse_is_idempotent() {
        let stdout = ">>>>> ENVFORGE_REPORT_START\nPASS\tb\nFAIL\ta\nPASS\tc\n>>>>> ENVFORGE_REPORT_END\n";
        let first = parse_report(stdout).unwrap();
        let second = parse_report(stdout).unwrap();
        assert_eq!(first, second);
        assert_eq!(
            serde_json::to_string(&first).unwrap(),
            serde_json::to_string(&second).unwrap()
        );
        assert_eq!(render_report(&first), render_report(&second));
    }

    #[test]
    fn test_malformed_line_is_error() {
        let stdout = ">>>>> ENVFORGE_REPORT_START\nPASS\tok\npassed some_test\n>>>>> ENVFORGE_REPORT_END\n";
        assert_eq!(
            parse_report(stdout),
            Err(ReportError::MalformedLine {
                line: 3,
                content: "passed some_test".into()
            })
        );

        let lowercase = ">>>>> ENVFORGE_REPORT_START\npass\tx\n>>>>> ENVFORGE_REPORT_END\n";
        assert!(matches!(
            parse_report(lowercase),
            Err(ReportError::MalformedLine { .. })
        ));

        let no_id = ">>>>> ENVFORGE_REPORT_START\nPASS\t  \n>>>>> ENVFORGE_REPORT_END\n";
        assert!(matches!(
            parse_report(no_id),
            Err(ReportError::MalformedLine { .. })
        ));
    }

    #[test]
    fn test_missing_markers() {
        assert_eq!(parse_report("PASS\tx\n"), Err(ReportError::MissingStart));
        assert_eq!(
            parse_report(">>>>> ENVFORGE_REPORT_START\nPASS\tx\n"),
            Err(ReportError::MissingEnd)
        );
    }

    #[test]
    fn test_last_block_and_duplicate_ids() {
        let stdout = ">>>>> ENVFORGE_REPORT_START\n>>>>> ENVFORGE_REPORT_END\n>>>>> ENVFORGE_REPORT_START\nFAIL\tx\nPASS\tx\n>>>>> ENVFORGE_REPORT_END\n";
        let map = parse_report(stdout).unwrap();
        assert_eq!(map.len(), 1);
        assert_eq!(map["x"], TestOutcome::Pass);
    }

    #[test]
    fn test_crlf_and_empty_block() {
        let stdout = ">>>>> ENVFORGE_REPORT_START\r\nPASS\tx\r\n>>>>> ENVFORGE_REPORT_END\r\n";
        assert_eq!(parse_report(stdout).unwrap()["x"], TestOutcome::Pass);

        let empty = ">>>>> ENVFORGE_REPORT_START\n>>>>> ENVFORGE_REPORT_END\n";
        assert!(parse_report(empty).unwrap().is_empty());
    }

    #[test]
    fn test_render_roundtrip_shape() {
        let mut map = OutcomeMap::new();
        map.insert("b".into(), TestOutcome::Fail);
        map.insert("a".into(), TestOutcome::Pass);
        let rendered = render_report(&map);
        assert_eq!(
            rendered,
            format!("{}\nPASS\ta\nFAIL\tb\n{}\n", REPORT_START, REPORT_END)
        );
    }
}
