//! Refinement orchestrator: drives one instance through
//! `START → EXPLORE → DRAFT_ENV → DRAFT_EVAL → VALIDATE → (SUCCESS | REFINE)`
//! under a round budget.
//!
//! A round ends either at `VALIDATE` or when an agent exhausts its turn
//! budget; both count against `round_limit`. Transport failures after
//! retries end the instance as `backend_failure` without consuming a round.

use chrono::Utc;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Instant;

use super::config::BuilderConfig;
use super::progress::ProgressCounters;
use super::recorder::{RoundClose, RoundRecorder};
use super::state::{BuilderState, Failure, FailureKind, InstanceOutcome};
use crate::agents::drafter::DraftInput;
use crate::agents::scriptwriter::ScriptInput;
use crate::agents::{AgentError, Drafter, Explorer, RoundFeedback, Scriptwriter};
use crate::llm::GenerationClient;
use crate::pool::{MemoryPoolEntry, PoolHandle};
use crate::sandbox::Sandbox;
use crate::types::{EnvironmentSpec, EvalScript, Finding, TaskInstance};
use crate::utils::{validate_git_ref, validate_repo_name};
use crate::validation::{Classification, ValidationResult, Validator};

pub struct Orchestrator {
    explorer: Explorer,
    drafter: Drafter,
    scriptwriter: Scriptwriter,
    validator: Validator,
    sandbox: Arc<dyn Sandbox>,
    pool: PoolHandle,
    round_limit: u32,
    keep_images: bool,
    progress: ProgressCounters,
}

impl Orchestrator {
    pub fn new(
        config: &BuilderConfig,
        client: GenerationClient,
        sandbox: Arc<dyn Sandbox>,
        pool: PoolHandle,
    ) -> Self {
        Self {
            explorer: Explorer::new(
                client.clone(),
                sandbox.clone(),
                config.agents.explorer.clone(),
            ),
            drafter: Drafter::new(client.clone(), config.agents.drafter_max_turns),
            scriptwriter: Scriptwriter::new(client, config.agents.scriptwriter_max_turns),
            validator: Validator::new(sandbox.clone(), config.validator_config()),
            sandbox,
            pool,
            round_limit: config.round_limit.max(1),
            keep_images: config.keep_images,
            progress: ProgressCounters::new(),
        }
    }

    /// Share batch counters with a [`super::progress::ProgressMonitor`].
    pub fn with_progress(mut self, progress: ProgressCounters) -> Self {
        self.progress = progress;
        self
    }

    pub fn round_limit(&self) -> u32 {
        self.round_limit
    }

    pub fn progress(&self) -> &ProgressCounters {
        &self.progress
    }

    /// Run one instance to a terminal state. Never fails: every ending,
    /// including transport errors, is carried in the returned record.
    pub async fn process(&self, instance: TaskInstance) -> InstanceOutcome {
        let instance = instance.with_resolved_id();
        if let Err(reason) = check_instance(&instance) {
            tracing::warn!(
                instance_id = %instance.instance_id,
                reason = %reason,
                "Rejecting invalid instance"
            );
            return InstanceOutcome::failed_early(
                &instance,
                self.round_limit,
                FailureKind::InvalidInput,
                reason,
            );
        }

        tracing::info!(
            instance_id = %instance.instance_id,
            repo = %instance.repo,
            base_commit = %instance.base_commit,
            language = %instance.language,
            round_limit = self.round_limit,
            "Processing instance"
        );

        let started_at = Utc::now();
        let started = Instant::now();
        let mut run = InstanceRun::new(self, &instance);
        let failure = run.drive().await;
        let generation = run.recorder.total_generation();
        let classification_history = run.recorder.classification_history();

        let outcome = InstanceOutcome {
            instance_id: instance.instance_id.clone(),
            repo: instance.repo.clone(),
            base_commit: instance.base_commit.clone(),
            language: instance.language.clone(),
            version: instance.version.clone(),
            success: failure.is_none(),
            failure,
            rounds_used: run.rounds_used,
            round_limit: self.round_limit,
            cache_hit: run.cache_hit,
            classification_history,
            finding: run.finding,
            environment: run.environment,
            eval_script: run.script,
            validation: run.last_validation.as_ref().map(Into::into),
            generation,
            started_at,
            finished_at: Utc::now(),
            duration_ms: started.elapsed().as_millis() as u64,
            rounds: run.recorder.into_records(),
        };

        match &outcome.failure {
            None => tracing::info!(
                instance_id = %outcome.instance_id,
                rounds_used = outcome.rounds_used,
                cache_hit = outcome.cache_hit,
                total_tokens = outcome.generation.usage.total_tokens,
                "Instance succeeded"
            ),
            Some(f) => tracing::warn!(
                instance_id = %outcome.instance_id,
                rounds_used = outcome.rounds_used,
                kind = %f.kind,
                reason = %f.reason,
                "Instance failed"
            ),
        }
        outcome
    }
}

enum Step {
    Goto(BuilderState),
    Succeeded,
    Failed(Failure),
}

/// Mutable state of one instance's attempt history.
struct InstanceRun<'a> {
    orch: &'a Orchestrator,
    instance: &'a TaskInstance,
    recorder: RoundRecorder,
    rounds_used: u32,
    cache_hit: bool,
    finding: Option<Finding>,
    environment: Option<EnvironmentSpec>,
    script: Option<EvalScript>,
    seed: Option<EnvironmentSpec>,
    feedback: Option<RoundFeedback>,
    last_validation: Option<ValidationResult>,
    /// Every environment drafted or reused so far, with the round it
    /// first appeared in.
    env_hashes: HashMap<String, u32>,
    validated_pairs: HashSet<(String, String)>,
}

impl<'a> InstanceRun<'a> {
    fn new(orch: &'a Orchestrator, instance: &'a TaskInstance) -> Self {
        Self {
            orch,
            instance,
            recorder: RoundRecorder::new(),
            rounds_used: 0,
            cache_hit: false,
            finding: None,
            environment: None,
            script: None,
            seed: None,
            feedback: None,
            last_validation: None,
            env_hashes: HashMap::new(),
            validated_pairs: HashSet::new(),
        }
    }

    fn id(&self) -> &str {
        &self.instance.instance_id
    }

    /// Run the state machine; `None` means success.
    async fn drive(&mut self) -> Option<Failure> {
        let mut state = BuilderState::Start;
        loop {
            tracing::debug!(
                instance_id = %self.id(),
                state = %state,
                rounds_used = self.rounds_used,
                "State transition"
            );
            let step = match state {
                BuilderState::Start => self.start().await,
                BuilderState::Explore => self.explore().await,
                BuilderState::DraftEnv => self.draft_env().await,
                BuilderState::DraftEval => self.draft_eval().await,
                BuilderState::Validate => self.validate().await,
                BuilderState::Refine => self.refine(),
                BuilderState::Success => Step::Succeeded,
                BuilderState::Failed => Step::Failed(Failure {
                    kind: FailureKind::Crashed,
                    reason: "entered FAILED without a reason".to_string(),
                }),
            };
            match step {
                Step::Goto(next) => state = next,
                Step::Succeeded => return None,
                Step::Failed(failure) => {
                    self.recorder.abandon();
                    return Some(failure);
                }
            }
        }
    }

    fn open_round(&mut self, state: BuilderState) {
        self.recorder.begin(self.rounds_used + 1, state, false);
        self.recorder.visit(state);
    }

    async fn start(&mut self) -> Step {
        let instance = self.instance;
        let entry = match self
            .orch
            .pool
            .lookup(&instance.repo, &instance.language, instance.version())
            .await
        {
            Ok(entry) => entry,
            Err(e) => {
                tracing::warn!(
                    instance_id = %self.id(),
                    error = %e,
                    "Memory pool lookup failed; treating as a miss"
                );
                None
            }
        };
        let Some(entry) = entry else {
            return Step::Goto(BuilderState::Explore);
        };

        let dockerfile =
            retarget_dockerfile(&entry.environment_spec, &entry.base_commit, &instance.base_commit);
        let env = match EnvironmentSpec::from_dockerfile(&dockerfile) {
            Ok(env) => env,
            Err(e) => {
                tracing::warn!(
                    instance_id = %self.id(),
                    entry_instance = %entry.instance_id,
                    error = %e,
                    "Cached environment is unusable; exploring from scratch"
                );
                return Step::Goto(BuilderState::Explore);
            }
        };

        tracing::info!(
            instance_id = %self.id(),
            entry_instance = %entry.instance_id,
            entry_version = %entry.version,
            "Memory pool hit; validating cached artifacts"
        );
        self.cache_hit = true;
        self.orch.progress.cache_hits.fetch_add(1, Ordering::Relaxed);
        self.env_hashes.insert(env.content_hash(), 1);
        self.seed = Some(env.clone());
        self.environment = Some(env);
        self.script = Some(EvalScript::new(entry.eval_script));
        self.recorder.begin(1, BuilderState::Validate, true);
        Step::Goto(BuilderState::Validate)
    }

    async fn explore(&mut self) -> Step {
        self.open_round(BuilderState::Explore);
        let run = {
            let _live = self.orch.progress.sandbox_guard();
            self.orch
                .explorer
                .explore(self.instance, self.finding.as_ref(), self.feedback.as_ref())
                .await
        };
        self.recorder.add_generation(&run.stats);
        match run.output {
            Ok(finding) => {
                self.finding = Some(finding);
                // A harness failure leaves a built environment in place (a
                // cache hit explores only for the scriptwriter's benefit).
                let harness_failed = self
                    .feedback
                    .as_ref()
                    .is_some_and(|f| f.classification == Classification::TestHarnessFailure);
                if harness_failed && self.environment.is_some() {
                    Step::Goto(BuilderState::DraftEval)
                } else {
                    Step::Goto(BuilderState::DraftEnv)
                }
            }
            Err(e) => self.agent_failed(e, Classification::BuildFailure),
        }
    }

    async fn draft_env(&mut self) -> Step {
        let Some(finding) = self.finding.as_ref() else {
            return Step::Goto(BuilderState::Explore);
        };
        let input = DraftInput {
            instance: self.instance,
            finding,
            seed: self.seed.as_ref().filter(|_| self.environment.is_none()),
            previous: self.environment.as_ref(),
            feedback: self.feedback.as_ref(),
        };
        self.recorder.begin(self.rounds_used + 1, BuilderState::DraftEnv, false);
        self.recorder.visit(BuilderState::DraftEnv);
        let run = self.orch.drafter.draft(input).await;
        self.recorder.add_generation(&run.stats);

        let env = match run.output {
            Ok(env) => env,
            Err(e) => return self.agent_failed(e, Classification::BuildFailure),
        };
        let hash = env.content_hash();
        if let Some(round) = self.env_hashes.get(&hash) {
            return Step::Failed(Failure {
                kind: FailureKind::Stalled,
                reason: format!(
                    "drafter resubmitted the environment from round {} unchanged",
                    round
                ),
            });
        }
        self.env_hashes.insert(hash, self.rounds_used + 1);
        self.environment = Some(env);
        Step::Goto(BuilderState::DraftEval)
    }

    async fn draft_eval(&mut self) -> Step {
        let (Some(finding), Some(environment)) = (self.finding.as_ref(), self.environment.as_ref())
        else {
            return Step::Goto(BuilderState::Explore);
        };
        let input = ScriptInput {
            instance: self.instance,
            finding,
            environment,
            previous: self.script.as_ref(),
            feedback: self.feedback.as_ref(),
        };
        self.recorder.begin(self.rounds_used + 1, BuilderState::DraftEval, false);
        self.recorder.visit(BuilderState::DraftEval);
        let run = self.orch.scriptwriter.write(input).await;
        self.recorder.add_generation(&run.stats);

        match run.output {
            Ok(script) => {
                self.script = Some(script);
                Step::Goto(BuilderState::Validate)
            }
            Err(e) => self.agent_failed(e, Classification::TestHarnessFailure),
        }
    }

    async fn validate(&mut self) -> Step {
        let (Some(env), Some(script)) = (self.environment.as_ref(), self.script.as_ref()) else {
            return Step::Goto(BuilderState::Explore);
        };
        let pair = (env.content_hash(), script.content_hash());
        if self.validated_pairs.contains(&pair) {
            return Step::Failed(Failure {
                kind: FailureKind::Stalled,
                reason: "environment and eval script identical to an already validated pair"
                    .to_string(),
            });
        }

        let round = self.rounds_used + 1;
        self.recorder.begin(round, BuilderState::Validate, false);
        self.recorder.visit(BuilderState::Validate);
        tracing::info!(
            instance_id = %self.instance.instance_id,
            round = round,
            env_hash = %&pair.0[..12],
            script_hash = %&pair.1[..12],
            "Validating artifacts"
        );
        let result = {
            let _live = self.orch.progress.sandbox_guard();
            self.orch.validator.validate(env, script, self.instance).await
        };
        let result = match result {
            Ok(result) => result,
            Err(e) => {
                return Step::Failed(Failure {
                    kind: FailureKind::BackendFailure,
                    reason: format!("validation in round {}: {}", round, e),
                })
            }
        };

        self.rounds_used = round;
        self.orch.progress.rounds.fetch_add(1, Ordering::Relaxed);
        self.validated_pairs.insert(pair.clone());
        self.recorder.finish(RoundClose {
            classification: result.classification,
            reason: result.reason.clone(),
            environment_hash: Some(pair.0),
            eval_script_hash: Some(pair.1),
            validation: Some(result.clone()),
        });
        tracing::info!(
            instance_id = %self.id(),
            round = round,
            classification = %result.classification,
            reason = %result.reason,
            fail_to_pass = result.fail_to_pass().len(),
            "Round finished"
        );

        if result.is_success() {
            self.remember_success().await;
            self.last_validation = Some(result);
            return Step::Succeeded;
        }

        if let Some(image) = &result.image {
            if !self.orch.keep_images {
                self.orch.sandbox.remove_image(image).await;
            }
        }
        self.feedback = Some(RoundFeedback::from_validation(&result));
        self.last_validation = Some(result);
        Step::Goto(BuilderState::Refine)
    }

    fn refine(&mut self) -> Step {
        if self.rounds_used >= self.orch.round_limit {
            return Step::Failed(Failure {
                kind: FailureKind::RoundLimitExceeded,
                reason: format!(
                    "no success within {} rounds",
                    self.orch.round_limit
                ),
            });
        }
        let classification = self
            .feedback
            .as_ref()
            .map_or(Classification::BuildFailure, |f| f.classification);
        let next = BuilderState::refine_target(
            classification,
            self.finding.is_some(),
            self.environment.is_some(),
        );
        tracing::debug!(
            instance_id = %self.id(),
            classification = %classification,
            next = %next,
            "Refining"
        );
        Step::Goto(next)
    }

    /// Charge an agent failure to the open round.
    ///
    /// Exhaustion closes the round with `classification` and refines;
    /// anything else is a transport failure and ends the instance.
    fn agent_failed(&mut self, err: AgentError, classification: Classification) -> Step {
        let reason = match &err {
            AgentError::Exhausted {
                role,
                turns,
                reason,
            } => format!("{} ({} after {} turns)", reason, role, turns),
            _ => {
                return Step::Failed(Failure {
                    kind: FailureKind::BackendFailure,
                    reason: err.to_string(),
                })
            }
        };

        self.rounds_used += 1;
        self.orch.progress.rounds.fetch_add(1, Ordering::Relaxed);
        tracing::warn!(
            instance_id = %self.id(),
            round = self.rounds_used,
            classification = %classification,
            reason = %reason,
            "Agent exhausted its turns"
        );
        self.recorder.finish(RoundClose {
            classification,
            reason: reason.clone(),
            environment_hash: self.environment.as_ref().map(EnvironmentSpec::content_hash),
            eval_script_hash: self.script.as_ref().map(EvalScript::content_hash),
            validation: None,
        });
        self.feedback = Some(RoundFeedback::without_logs(classification, reason));
        Step::Goto(BuilderState::Refine)
    }

    async fn remember_success(&self) {
        let (Some(env), Some(script)) = (self.environment.as_ref(), self.script.as_ref()) else {
            return;
        };
        let entry = MemoryPoolEntry {
            id: None,
            repo: self.instance.repo.clone(),
            language: self.instance.language.to_lowercase(),
            version: self.instance.version().unwrap_or_default().to_string(),
            environment_spec: env.dockerfile.clone(),
            eval_script: script.text.clone(),
            instance_id: self.instance.instance_id.clone(),
            base_commit: self.instance.base_commit.clone(),
            success_timestamp: Utc::now(),
        };
        if let Err(e) = self.orch.pool.put(&entry).await {
            tracing::warn!(
                instance_id = %self.id(),
                error = %e,
                "Failed to store validated artifacts in the memory pool"
            );
        }
    }
}

/// Reject records whose identity cannot be used safely in container
/// commands, or that lack what Fail2Pass validation needs.
fn check_instance(instance: &TaskInstance) -> Result<(), String> {
    validate_repo_name(&instance.repo).map_err(|e| e.to_string())?;
    validate_git_ref(&instance.base_commit).map_err(|e| e.to_string())?;
    if instance.language.trim().is_empty() {
        return Err("language is empty".to_string());
    }
    if instance.gold_patch.trim().is_empty() {
        return Err("gold_patch is empty".to_string());
    }
    let has_focus = instance
        .fail_to_pass
        .as_ref()
        .is_some_and(|tests| !tests.is_empty());
    if instance.test_patch.trim().is_empty() && !has_focus {
        return Err("neither test_patch nor fail_to_pass is given".to_string());
    }
    Ok(())
}

/// Point a cached Dockerfile at another commit of the same repository.
pub fn retarget_dockerfile(dockerfile: &str, from_commit: &str, to_commit: &str) -> String {
    if from_commit.is_empty() || to_commit.is_empty() || from_commit == to_commit {
        return dockerfile.to_string();
    }
    dockerfile.replace(from_commit, to_commit)
}
