//! Eval scriptwriter: finding + environment to an eval script.
//!
//! The model writes only the body; the patch-applying preamble is fixed so
//! every script takes the patch as `$1` and runs from the repository root.

use tera::Context;

use super::conversation::{AgentRole, Conversation};
use super::error::AgentResult;
use super::prompts::{eval_preamble, render, scriptwriter_system, SCRIPTWRITER_USER};
use super::{AgentRun, RoundFeedback};
use crate::llm::GenerationClient;
use crate::types::{EnvironmentSpec, EvalScript, Finding, TaskInstance};
use crate::utils::extract_code_block;
use crate::validation::classify::patch_files;
use crate::validation::{REPORT_END, REPORT_START};

/// Inputs to one scriptwriting call.
#[derive(Debug, Clone, Copy)]
pub struct ScriptInput<'a> {
    pub instance: &'a TaskInstance,
    pub finding: &'a Finding,
    pub environment: &'a EnvironmentSpec,
    pub previous: Option<&'a EvalScript>,
    pub feedback: Option<&'a RoundFeedback>,
}

pub struct Scriptwriter {
    client: GenerationClient,
    max_turns: usize,
}

impl Scriptwriter {
    pub fn new(client: GenerationClient, max_turns: usize) -> Self {
        Self { client, max_turns }
    }

    pub async fn write(&self, input: ScriptInput<'_>) -> AgentRun<EvalScript> {
        let mut conv = Conversation::new(
            AgentRole::Scriptwriter,
            scriptwriter_system(),
            self.max_turns,
        );
        let output = self.run(&mut conv, input).await;
        AgentRun {
            output,
            stats: conv.stats(),
        }
    }

    async fn run(&self, conv: &mut Conversation, input: ScriptInput<'_>) -> AgentResult<EvalScript> {
        conv.push_user(user_prompt(&input)?);

        loop {
            let reply = conv.turn(&self.client).await?;
            match parse_script_body(&reply) {
                Ok(body) => {
                    tracing::info!(
                        instance_id = %input.instance.instance_id,
                        lines = body.lines().count(),
                        turns = conv.turns_used(),
                        "Eval script written"
                    );
                    return Ok(assemble_script(&body));
                }
                Err(why) => {
                    conv.push_user(format!("{}. Reply with the script body in a ```bash block.", why));
                }
            }
        }
    }
}

/// Extract the script body and check it prints the report block.
pub fn parse_script_body(reply: &str) -> Result<String, String> {
    let body = extract_code_block(reply, &["bash", "sh", "shell"])
        .ok_or_else(|| "No fenced bash script found".to_string())?;
    if !body.contains(REPORT_START) || !body.contains(REPORT_END) {
        return Err(format!(
            "The script must print the report between '{}' and '{}'",
            REPORT_START, REPORT_END
        ));
    }
    Ok(body)
}

/// Preamble plus body, dropping any shebang the model added.
pub fn assemble_script(body: &str) -> EvalScript {
    let body = match body.strip_prefix("#!") {
        Some(rest) => rest.split_once('\n').map_or("", |(_, tail)| tail),
        None => body,
    };
    let mut text = eval_preamble();
    text.push('\n');
    text.push_str(body.trim_start_matches('\n'));
    if !text.ends_with('\n') {
        text.push('\n');
    }
    EvalScript::new(text)
}

fn user_prompt(input: &ScriptInput<'_>) -> AgentResult<String> {
    let instance = input.instance;
    let previous_body = input.previous.map(|s| {
        let preamble = eval_preamble();
        s.text
            .strip_prefix(preamble.as_str())
            .unwrap_or(&s.text)
            .trim_start()
            .to_string()
    });

    let mut ctx = Context::new();
    ctx.insert("repo", &instance.repo);
    ctx.insert("language", &instance.language);
    ctx.insert(
        "finding",
        &serde_json::to_string_pretty(input.finding).unwrap_or_default(),
    );
    ctx.insert("dockerfile", &input.environment.dockerfile);
    ctx.insert("test_files", &patch_files(&instance.test_patch));
    ctx.insert("previous", &previous_body);
    ctx.insert("failure", &input.feedback.map(|f| f.logs.as_str()));
    ctx.insert(
        "classification",
        &input
            .feedback
            .map(|f| f.classification.as_str())
            .unwrap_or_default(),
    );
    ctx.insert(
        "reason",
        &input.feedback.map(|f| f.reason.as_str()).unwrap_or_default(),
    );
    Ok(render(SCRIPTWRITER_USER, &ctx)?)
}
