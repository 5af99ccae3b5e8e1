//! Validator: build the image, run the eval script before and after the
//! patches, and classify the round from the execution evidence.

use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::{Duration, Instant};

use super::classify::{analyze, classify, focus_tests, Classification, SignalAnalysis, Verdict};
use super::report::{parse_report, OutcomeMap};
use crate::error::SandboxError;
use crate::sandbox::docker::{eval_script_path, patch_path};
use crate::sandbox::{
    image_tag, BuildOutcome, BuildRequest, MountedFile, RunOutcome, RunRequest, Sandbox,
};
use crate::types::{EnvironmentSpec, EvalScript, TaskInstance};

/// Captured output of one eval-script run.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunLog {
    pub exit_code: Option<i32>,
    pub timed_out: bool,
    pub duration_ms: u64,
    pub stdout: String,
    pub stderr: String,
}

/// Verbatim logs of every step of a validation.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RawLogs {
    pub build: String,
    pub pre_patch: Vec<RunLog>,
    pub post_patch: Option<RunLog>,
}

impl RawLogs {
    /// Compact excerpt for feeding back into an agent prompt.
    pub fn excerpt(&self, max_bytes: usize) -> String {
        let mut out = String::new();
        if !self.build.is_empty() {
            out.push_str("## build\n");
            out.push_str(&tail_bytes(&self.build, max_bytes / 2));
            out.push('\n');
        }
        let runs = self
            .pre_patch
            .iter()
            .enumerate()
            .map(|(i, r)| (format!("pre-patch run {}", i + 1), r))
            .chain(self.post_patch.iter().map(|r| ("post-patch run".to_string(), r)));
        for (label, run) in runs {
            out.push_str(&format!(
                "## {} (exit {:?}, timed out: {})\n",
                label, run.exit_code, run.timed_out
            ));
            out.push_str(&tail_bytes(&run.stdout, max_bytes / 4));
            if !run.stderr.trim().is_empty() {
                out.push_str("\n-- stderr --\n");
                out.push_str(&tail_bytes(&run.stderr, max_bytes / 8));
            }
            out.push('\n');
        }
        out
    }
}

fn tail_bytes(s: &str, max: usize) -> String {
    if s.len() <= max {
        return s.to_string();
    }
    let mut start = s.len() - max;
    while !s.is_char_boundary(start) && start < s.len() {
        start += 1;
    }
    format!("...{}", &s[start..])
}

/// Evidence and verdict of one validation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ValidationResult {
    pub build_ok: bool,
    /// Image tag when the build succeeded.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image: Option<String>,
    /// One map per pre-patch run; the first is the reference run.
    pub pre_patch_outcomes: Vec<OutcomeMap>,
    pub post_patch_outcomes: OutcomeMap,
    pub classification: Classification,
    pub reason: String,
    pub analysis: SignalAnalysis,
    pub raw_logs: RawLogs,
    pub duration_ms: u64,
}

impl ValidationResult {
    pub fn is_success(&self) -> bool {
        self.classification == Classification::Success
    }

    pub fn fail_to_pass(&self) -> &BTreeSet<String> {
        &self.analysis.fail_to_pass
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ValidatorConfig {
    pub build_timeout: Duration,
    pub run_timeout: Duration,
    /// Pre-patch runs used to detect nondeterministic tests (>= 1).
    pub repeat_count: u32,
    /// Apply `test_patch` in the pre-patch run so new tests exist and fail.
    pub pre_patch_applies_test_patch: bool,
}

impl Default for ValidatorConfig {
    fn default() -> Self {
        Self {
            build_timeout: Duration::from_secs(1800),
            run_timeout: Duration::from_secs(1800),
            repeat_count: 1,
            pre_patch_applies_test_patch: false,
        }
    }
}

/// Concatenate patches so each starts on its own line.
pub fn combine_patches(patches: &[&str]) -> String {
    let mut out = String::new();
    for patch in patches.iter().filter(|p| !p.trim().is_empty()) {
        out.push_str(patch);
        if !patch.ends_with('\n') {
            out.push('\n');
        }
    }
    out
}

enum RunEvidence {
    Parsed(OutcomeMap),
    Failed(String),
}

pub struct Validator {
    sandbox: Arc<dyn Sandbox>,
    config: ValidatorConfig,
}

impl Validator {
    pub fn new(sandbox: Arc<dyn Sandbox>, config: ValidatorConfig) -> Self {
        Self { sandbox, config }
    }

    pub fn config(&self) -> &ValidatorConfig {
        &self.config
    }

    /// Validate an artifact pair against an instance.
    ///
    /// Only engine transport failures are errors; every execution outcome,
    /// including timeouts, becomes a classified [`ValidationResult`].
    pub async fn validate(
        &self,
        env: &EnvironmentSpec,
        script: &EvalScript,
        instance: &TaskInstance,
    ) -> Result<ValidationResult, SandboxError> {
        let started = Instant::now();
        let mut logs = RawLogs::default();
        let tag = image_tag(&instance.instance_id, &env.dockerfile);

        let build = self
            .sandbox
            .build(&BuildRequest {
                tag: tag.clone(),
                dockerfile: env.dockerfile.clone(),
                timeout: self.config.build_timeout,
            })
            .await?;
        logs.build = build.log().to_string();

        let image = match build {
            BuildOutcome::Built { image, .. } => image,
            BuildOutcome::Failed { exit_code, .. } => {
                return Ok(self.early_result(
                    None,
                    Verdict::new(
                        Classification::BuildFailure,
                        format!("image build exited with code {}", exit_code),
                    ),
                    logs,
                    Vec::new(),
                    started,
                ));
            }
            BuildOutcome::TimedOut { .. } => {
                return Ok(self.early_result(
                    None,
                    Verdict::new(
                        Classification::BuildFailure,
                        format!(
                            "image build timed out after {}s",
                            self.config.build_timeout.as_secs()
                        ),
                    ),
                    logs,
                    Vec::new(),
                    started,
                ));
            }
        };

        let pre_patch = if self.config.pre_patch_applies_test_patch {
            combine_patches(&[&instance.test_patch])
        } else {
            String::new()
        };

        let mut pre_runs = Vec::new();
        for run_idx in 0..self.config.repeat_count.max(1) {
            let (evidence, log) = self.run_eval(&image, script, &pre_patch).await?;
            logs.pre_patch.push(log);
            match evidence {
                RunEvidence::Parsed(map) => pre_runs.push(map),
                RunEvidence::Failed(why) => {
                    tracing::info!(
                        instance_id = %instance.instance_id,
                        run = run_idx + 1,
                        reason = %why,
                        "Pre-patch run produced no usable report"
                    );
                    return Ok(self.early_result(
                        Some(image),
                        Verdict::new(
                            Classification::TestHarnessFailure,
                            format!("pre-patch run {}: {}", run_idx + 1, why),
                        ),
                        logs,
                        pre_runs,
                        started,
                    ));
                }
            }
        }

        let post_patch = combine_patches(&[&instance.test_patch, &instance.gold_patch]);
        let (evidence, log) = self.run_eval(&image, script, &post_patch).await?;
        logs.post_patch = Some(log);
        let post = match evidence {
            RunEvidence::Parsed(map) => map,
            RunEvidence::Failed(why) => {
                return Ok(self.early_result(
                    Some(image),
                    Verdict::new(
                        Classification::TestHarnessFailure,
                        format!("post-patch run: {}", why),
                    ),
                    logs,
                    pre_runs,
                    started,
                ));
            }
        };

        let empty = OutcomeMap::new();
        let reference = pre_runs.first().unwrap_or(&empty);
        let focus = focus_tests(
            instance.fail_to_pass.as_deref(),
            &instance.test_patch,
            reference,
            &post,
        );
        let allowed: BTreeSet<String> = instance.allowed_regressions.iter().cloned().collect();
        let analysis = analyze(&pre_runs, &post, focus, &allowed);
        let verdict = classify(&analysis, &post);

        tracing::info!(
            instance_id = %instance.instance_id,
            classification = %verdict.classification,
            fail_to_pass = analysis.fail_to_pass.len(),
            pass_to_pass = analysis.pass_to_pass.len(),
            regressions = analysis.regressions.len(),
            "Validation finished"
        );

        Ok(ValidationResult {
            build_ok: true,
            image: Some(image),
            pre_patch_outcomes: pre_runs,
            post_patch_outcomes: post,
            classification: verdict.classification,
            reason: verdict.reason,
            analysis,
            raw_logs: logs,
            duration_ms: started.elapsed().as_millis() as u64,
        })
    }

    fn early_result(
        &self,
        image: Option<String>,
        verdict: Verdict,
        raw_logs: RawLogs,
        pre_runs: Vec<OutcomeMap>,
        started: Instant,
    ) -> ValidationResult {
        ValidationResult {
            build_ok: image.is_some(),
            image,
            pre_patch_outcomes: pre_runs,
            post_patch_outcomes: OutcomeMap::new(),
            classification: verdict.classification,
            reason: verdict.reason,
            analysis: SignalAnalysis::default(),
            raw_logs,
            duration_ms: started.elapsed().as_millis() as u64,
        }
    }

    /// Run the eval script once in a fresh container with `patch` mounted.
    async fn run_eval(
        &self,
        image: &str,
        script: &EvalScript,
        patch: &str,
    ) -> Result<(RunEvidence, RunLog), SandboxError> {
        let started = Instant::now();
        let request = RunRequest {
            image: image.to_string(),
            command: vec!["bash".to_string(), eval_script_path(), patch_path()],
            files: vec![
                MountedFile::new(eval_script_path(), script.text.clone()),
                MountedFile::new(patch_path(), patch.to_string()),
            ],
            timeout: self.config.run_timeout,
        };

        let outcome = self.sandbox.run(&request).await?;
        let duration_ms = started.elapsed().as_millis() as u64;

        Ok(match outcome {
            RunOutcome::Completed(out) => {
                let evidence = match parse_report(&out.stdout) {
                    Ok(map) => RunEvidence::Parsed(map),
                    Err(e) => RunEvidence::Failed(format!(
                        "unparseable report (exit code {}): {}",
                        out.exit_code, e
                    )),
                };
                (
                    evidence,
                    RunLog {
                        exit_code: Some(out.exit_code),
                        timed_out: false,
                        duration_ms,
                        stdout: out.stdout,
                        stderr: out.stderr,
                    },
                )
            }
            RunOutcome::TimedOut { stdout, stderr } => (
                RunEvidence::Failed(format!(
                    "timed out after {}s",
                    self.config.run_timeout.as_secs()
                )),
                RunLog {
                    exit_code: None,
                    timed_out: true,
                    duration_ms,
                    stdout,
                    stderr,
                },
            ),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_combine_patches() {
        assert_eq!(combine_patches(&["a", "", "b\n"]), "a\nb\n");
        assert_eq!(combine_patches(&["", "  "]), "");
    }

    #[test]
    fn test_raw_logs_excerpt_labels_runs() {
        let logs = RawLogs {
            build: "step 1/3".into(),
            pre_patch: vec![RunLog {
                exit_code: Some(1),
                stdout: "pre out".into(),
                ..Default::default()
            }],
            post_patch: Some(RunLog {
                timed_out: true,
                stderr: "killed".into(),
                ..Default::default()
            }),
        };
        let text = logs.excerpt(4000);
        assert!(text.contains("## build"));
        assert!(text.contains("pre-patch run 1 (exit Some(1)"));
        assert!(text.contains("post-patch run (exit None, timed out: true)"));
        assert!(text.contains("killed"));
    }

    #[test]
    fn test_tail_bytes() {
        assert_eq!(tail_bytes("abcdef", 3), "...def");
        assert_eq!(tail_bytes("abc", 3), "abc");
    }

    use crate::sandbox::{ExecOutput, ProbeSession, SessionRequest};
    use crate::validation::report::{render_report, TestOutcome};
    use async_trait::async_trait;
    use std::collections::VecDeque;
    use std::sync::Mutex;

    /// Sandbox returning scripted build and run outcomes.
    struct FakeSandbox {
        build: BuildOutcome,
        runs: Mutex<VecDeque<RunOutcome>>,
        patches: Mutex<Vec<String>>,
    }

    impl FakeSandbox {
        fn new(build: BuildOutcome, runs: Vec<RunOutcome>) -> Arc<Self> {
            Arc::new(Self {
                build,
                runs: Mutex::new(runs.into()),
                patches: Mutex::new(Vec::new()),
            })
        }
    }

    #[async_trait]
    impl Sandbox for FakeSandbox {
        async fn build(&self, _request: &BuildRequest) -> Result<BuildOutcome, SandboxError> {
            Ok(self.build.clone())
        }

        async fn run(&self, request: &RunRequest) -> Result<RunOutcome, SandboxError> {
            let patch = request
                .files
                .iter()
                .find(|f| f.container_path == patch_path())
                .map(|f| f.content.clone())
                .unwrap_or_default();
            self.patches.lock().unwrap().push(patch);
            self.runs
                .lock()
                .unwrap()
                .pop_front()
                .ok_or_else(|| SandboxError::InvalidRequest("no scripted run left".into()))
        }

        async fn open_session(
            &self,
            _request: &SessionRequest,
        ) -> Result<Box<dyn ProbeSession>, SandboxError> {
            Err(SandboxError::EngineUnavailable("not scripted".into()))
        }

        async fn remove_image(&self, _image: &str) {}
    }

    fn built() -> BuildOutcome {
        BuildOutcome::Built {
            image: "envforge/x:abc".into(),
            log: "done".into(),
        }
    }

    fn report(pairs: &[(&str, TestOutcome)]) -> RunOutcome {
        let map: OutcomeMap = pairs.iter().map(|(k, v)| (k.to_string(), *v)).collect();
        RunOutcome::Completed(ExecOutput {
            exit_code: 0,
            stdout: render_report(&map),
            ..Default::default()
        })
    }

    fn instance() -> TaskInstance {
        TaskInstance {
            instance_id: "o__r-1".into(),
            repo: "o/r".into(),
            base_commit: "abc".into(),
            language: "python".into(),
            problem_statement: String::new(),
            gold_patch: "diff --git a/src/m.py b/src/m.py\n+fix".into(),
            test_patch: "diff --git a/tests/test_m.py b/tests/test_m.py\n+test".into(),
            version: None,
            fail_to_pass: None,
            allowed_regressions: Vec::new(),
            hints_text: None,
            created_at: None,
        }
    }

    fn env() -> EnvironmentSpec {
        EnvironmentSpec::from_dockerfile("FROM python:3.11\n").unwrap()
    }

    #[tokio::test]
    async fn test_success_round_applies_patches_only_post() {
        use TestOutcome::*;
        let sandbox = FakeSandbox::new(
            built(),
            vec![
                report(&[("tests/test_m.py::t1", Fail), ("tests/test_m.py::t2", Pass)]),
                report(&[("tests/test_m.py::t1", Pass), ("tests/test_m.py::t2", Pass)]),
            ],
        );
        let validator = Validator::new(sandbox.clone(), ValidatorConfig::default());
        let result = validator
            .validate(&env(), &EvalScript::new("#!/bin/bash"), &instance())
            .await
            .unwrap();

        assert!(result.is_success(), "{}", result.reason);
        assert!(result.build_ok);
        assert!(result.fail_to_pass().contains("tests/test_m.py::t1"));
        assert!(result.analysis.pass_to_pass.contains("tests/test_m.py::t2"));

        let patches = sandbox.patches.lock().unwrap().clone();
        assert_eq!(patches.len(), 2);
        assert!(patches[0].is_empty());
        assert!(patches[1].contains("tests/test_m.py") && patches[1].contains("src/m.py"));
    }

    #[tokio::test]
    async fn test_build_failure_skips_runs() {
        let sandbox = FakeSandbox::new(
            BuildOutcome::Failed {
                exit_code: 1,
                log: "E: Unable to locate package".into(),
            },
            Vec::new(),
        );
        let validator = Validator::new(sandbox.clone(), ValidatorConfig::default());
        let result = validator
            .validate(&env(), &EvalScript::new("x"), &instance())
            .await
            .unwrap();
        assert_eq!(result.classification, Classification::BuildFailure);
        assert!(!result.build_ok);
        assert!(result.raw_logs.build.contains("Unable to locate"));
        assert!(sandbox.patches.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_missing_report_and_timeout_are_harness_failures() {
        let sandbox = FakeSandbox::new(
            built(),
            vec![RunOutcome::Completed(ExecOutput {
                exit_code: 2,
                stdout: "pytest: command not found".into(),
                ..Default::default()
            })],
        );
        let validator = Validator::new(sandbox, ValidatorConfig::default());
        let result = validator
            .validate(&env(), &EvalScript::new("x"), &instance())
            .await
            .unwrap();
        assert_eq!(result.classification, Classification::TestHarnessFailure);
        assert!(result.reason.contains("pre-patch"));

        let sandbox = FakeSandbox::new(
            built(),
            vec![
                report(&[("tests/test_m.py::t1", TestOutcome::Fail)]),
                RunOutcome::TimedOut {
                    stdout: "partial".into(),
                    stderr: String::new(),
                },
            ],
        );
        let validator = Validator::new(sandbox, ValidatorConfig::default());
        let result = validator
            .validate(&env(), &EvalScript::new("x"), &instance())
            .await
            .unwrap();
        assert_eq!(result.classification, Classification::TestHarnessFailure);
        assert!(result.reason.contains("timed out"));
        assert_eq!(result.raw_logs.post_patch.as_ref().map(|l| l.timed_out), Some(true));
        assert_eq!(result.pre_patch_outcomes.len(), 1);
    }

    #[tokio::test]
    async fn test_repeated_pre_runs_detect_flaky_focus() {
        use TestOutcome::*;
        let sandbox = FakeSandbox::new(
            built(),
            vec![
                report(&[("tests/test_m.py::t1", Fail), ("tests/test_m.py::t3", Fail)]),
                report(&[("tests/test_m.py::t1", Pass), ("tests/test_m.py::t3", Fail)]),
                report(&[("tests/test_m.py::t1", Pass), ("tests/test_m.py::t3", Pass)]),
            ],
        );
        let config = ValidatorConfig {
            repeat_count: 2,
            ..Default::default()
        };
        let validator = Validator::new(sandbox, config);
        let result = validator
            .validate(&env(), &EvalScript::new("x"), &instance())
            .await
            .unwrap();
        assert_eq!(result.pre_patch_outcomes.len(), 2);
        assert_eq!(result.classification, Classification::Flaky);
    }

    #[tokio::test]
    async fn test_pre_patch_can_apply_test_patch() {
        use TestOutcome::*;
        let sandbox = FakeSandbox::new(
            built(),
            vec![
                report(&[("tests/test_m.py::t1", Fail)]),
                report(&[("tests/test_m.py::t1", Pass)]),
            ],
        );
        let config = ValidatorConfig {
            pre_patch_applies_test_patch: true,
            ..Default::default()
        };
        let validator = Validator::new(sandbox.clone(), config);
        let result = validator
            .validate(&env(), &EvalScript::new("x"), &instance())
            .await
            .unwrap();
        assert!(result.is_success());
        let patches = sandbox.patches.lock().unwrap().clone();
        assert!(patches[0].contains("tests/test_m.py"));
        assert!(!patches[0].contains("src/m.py"));
    }
}
