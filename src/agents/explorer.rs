//! Repository explorer: a tool-using conversation inside a probe container.
//!
//! Each model turn is one JSON action. `list`, `read` and `run` are executed
//! in the session and their output is returned as the next user message;
//! `finish` ends the conversation with a [`Finding`].

use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tera::Context;

use super::conversation::{AgentRole, Conversation};
use super::error::AgentResult;
use super::prompts::{render, EXPLORER_SYSTEM, EXPLORER_USER};
use super::{AgentRun, RoundFeedback};
use crate::llm::GenerationClient;
use crate::sandbox::{image_for_language, ExecOutput, ProbeSession, Sandbox, SessionRequest};
use crate::types::{Finding, TaskInstance};
use crate::utils::{
    try_extract_json_from_response, truncate_lines, validate_file_path, OBSERVATION_EDGE_LINES,
};
use crate::validation::classify::patch_files;

/// One explorer action.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum ExplorerAction {
    List {
        #[serde(default = "default_path")]
        path: String,
    },
    Read {
        path: String,
    },
    Run {
        command: String,
    },
    Finish {
        finding: Finding,
    },
}

fn default_path() -> String {
    ".".to_string()
}

impl ExplorerAction {
    /// Parse the action out of a model reply.
    pub fn from_reply(reply: &str) -> Result<Self, String> {
        let json = try_extract_json_from_response(reply)
            .into_option()
            .ok_or_else(|| "no JSON object found in reply".to_string())?;
        serde_json::from_str(&json).map_err(|e| format!("invalid action: {}", e))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ExplorerSettings {
    pub max_turns: usize,
    /// Per-probe timeout in seconds.
    pub probe_timeout_secs: u64,
    /// Timeout for cloning and checking out the repository.
    pub setup_timeout_secs: u64,
    /// Probe image; derived from the instance language when unset.
    pub image: Option<String>,
}

impl Default for ExplorerSettings {
    fn default() -> Self {
        Self {
            max_turns: 30,
            probe_timeout_secs: 60,
            setup_timeout_secs: 600,
            image: None,
        }
    }
}

/// Commands that write to the checkout or the filesystem are refused.
pub fn is_read_only(command: &str) -> bool {
    const DENY: &[&str] = &[
        "rm ", "rmdir", "mv ", "cp ", "mkdir", "touch ", "chmod", "chown", "truncate ", "dd ",
        "tee ", "sed -i", "git checkout", "git reset", "git clean", "git apply", "git stash",
        "git commit", "git pull", "git merge", "git rebase", "patch ", "install ",
    ];
    let normalized = command
        .replace("2>&1", "")
        .replace("2>/dev/null", "")
        .replace(">/dev/null", "")
        .replace("> /dev/null", "");
    if normalized.contains('>') {
        return false;
    }
    let padded = format!(" {} ", normalized);
    !DENY.iter().any(|d| {
        padded.contains(&format!(" {}", d))
            || padded.contains(&format!(";{}", d))
            || padded.contains(&format!("&{}", d))
            || padded.contains(&format!("|{}", d))
    })
}

fn shell_quote(s: &str) -> String {
    format!("'{}'", s.replace('\'', r"'\''"))
}

/// Render probe output the way the model sees it.
pub fn observation(output: &ExecOutput, timeout: Duration) -> String {
    let mut text = String::new();
    if output.timed_out {
        text.push_str(&format!(
            "Command timed out after {}s\n",
            timeout.as_secs()
        ));
    } else {
        text.push_str(&format!("Exit code: {}\n", output.exit_code));
    }
    let mut body = output.stdout.clone();
    if !output.stderr.trim().is_empty() {
        if !body.is_empty() && !body.ends_with('\n') {
            body.push('\n');
        }
        body.push_str(&output.stderr);
    }
    text.push_str(&truncate_lines(&body, OBSERVATION_EDGE_LINES));
    text
}

pub struct Explorer {
    client: GenerationClient,
    sandbox: Arc<dyn Sandbox>,
    settings: ExplorerSettings,
}

impl Explorer {
    pub fn new(
        client: GenerationClient,
        sandbox: Arc<dyn Sandbox>,
        settings: ExplorerSettings,
    ) -> Self {
        Self {
            client,
            sandbox,
            settings,
        }
    }

    /// Explore the repository and produce a finding.
    ///
    /// `previous` and `feedback` are set on refinement rounds.
    pub async fn explore(
        &self,
        instance: &TaskInstance,
        previous: Option<&Finding>,
        feedback: Option<&RoundFeedback>,
    ) -> AgentRun<Finding> {
        let mut conv = Conversation::new(
            AgentRole::Explorer,
            EXPLORER_SYSTEM,
            self.settings.max_turns,
        );
        let output = self.run(&mut conv, instance, previous, feedback).await;
        AgentRun {
            output,
            stats: conv.stats(),
        }
    }

    async fn run(
        &self,
        conv: &mut Conversation,
        instance: &TaskInstance,
        previous: Option<&Finding>,
        feedback: Option<&RoundFeedback>,
    ) -> AgentResult<Finding> {
        conv.push_user(user_prompt(instance, previous, feedback)?);

        let image = self
            .settings
            .image
            .clone()
            .unwrap_or_else(|| image_for_language(&instance.language).to_string());
        let session = self
            .sandbox
            .open_session(&SessionRequest {
                image,
                repo: instance.repo.clone(),
                base_commit: instance.base_commit.clone(),
                setup_timeout: Duration::from_secs(self.settings.setup_timeout_secs),
            })
            .await?;

        tracing::info!(
            instance_id = %instance.instance_id,
            container = %session.name(),
            "Exploration session started"
        );

        let result = self.converse(conv, session.as_ref(), instance).await;
        session.close().await;
        result
    }

    async fn converse(
        &self,
        conv: &mut Conversation,
        session: &dyn ProbeSession,
        instance: &TaskInstance,
    ) -> AgentResult<Finding> {
        let timeout = Duration::from_secs(self.settings.probe_timeout_secs);
        loop {
            let reply = match conv.turn(&self.client).await {
                Ok(reply) => reply,
                Err(e) if e.is_exhaustion() => {
                    return Err(conv.exhausted("exploration exhausted"));
                }
                Err(e) => return Err(e),
            };

            let action = match ExplorerAction::from_reply(&reply) {
                Ok(action) => action,
                Err(why) => {
                    conv.push_user(format!(
                        "Could not parse your reply: {}. Reply with exactly one JSON action.",
                        why
                    ));
                    continue;
                }
            };

            tracing::debug!(
                instance_id = %instance.instance_id,
                turn = conv.turns_used(),
                action = ?action,
                "Explorer action"
            );

            let command = match action {
                ExplorerAction::Finish { finding } => {
                    if finding.is_usable() {
                        tracing::info!(
                            instance_id = %instance.instance_id,
                            turns = conv.turns_used(),
                            package_manager = %finding.package_manager,
                            "Exploration finished"
                        );
                        return Ok(finding);
                    }
                    conv.push_user(
                        "The finding must name at least one command in test_cmds. Keep exploring or finish again.",
                    );
                    continue;
                }
                ExplorerAction::List { path } => match validate_file_path(&path) {
                    Ok(()) => format!("ls -la {}", shell_quote(&path)),
                    Err(e) => {
                        conv.push_user(format!("Refused: {}", e));
                        continue;
                    }
                },
                ExplorerAction::Read { path } => match validate_file_path(&path) {
                    Ok(()) => format!("cat {}", shell_quote(&path)),
                    Err(e) => {
                        conv.push_user(format!("Refused: {}", e));
                        continue;
                    }
                },
                ExplorerAction::Run { command } => {
                    if !is_read_only(&command) {
                        conv.push_user(
                            "Refused: probe commands must not modify the repository or filesystem.",
                        );
                        continue;
                    }
                    command
                }
            };

            let output = session.exec(&command, timeout).await?;
            conv.push_user(observation(&output, timeout));
        }
    }
}

fn user_prompt(
    instance: &TaskInstance,
    previous: Option<&Finding>,
    feedback: Option<&RoundFeedback>,
) -> AgentResult<String> {
    let mut ctx = Context::new();
    ctx.insert("repo", &instance.repo);
    ctx.insert("base_commit", &instance.base_commit);
    ctx.insert("language", &instance.language);
    ctx.insert("version", &instance.version());
    ctx.insert("problem_statement", &instance.problem_statement);
    ctx.insert("test_files", &patch_files(&instance.test_patch));
    ctx.insert(
        "previous_finding",
        &previous.and_then(|f| serde_json::to_string_pretty(f).ok()),
    );
    ctx.insert("failure", &feedback.map(|f| f.logs.as_str()));
    ctx.insert(
        "classification",
        &feedback.map(|f| f.classification.as_str()).unwrap_or_default(),
    );
    ctx.insert("reason", &feedback.map(|f| f.reason.as_str()).unwrap_or_default());
    Ok(render(EXPLORER_USER, &ctx)?)
}
