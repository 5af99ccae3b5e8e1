//! Execution-based validation of environment/eval-script pairs.
//!
//! The [`Validator`] builds the image, runs the eval script before and after
//! the patches, parses each run's report and classifies the round.

pub mod classify;
pub mod report;
pub mod validator;

pub use classify::{Classification, SignalAnalysis, Verdict};
pub use report::{parse_report, OutcomeMap, ReportError, TestOutcome, REPORT_END, REPORT_START};
pub use validator::{RawLogs, RunLog, ValidationResult, Validator, ValidatorConfig};
