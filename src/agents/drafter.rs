//! Environment drafter: finding (+ seed or prior attempt) to Dockerfile.

use tera::Context;

use super::conversation::{AgentRole, Conversation};
use super::error::AgentResult;
use super::prompts::{render, DRAFTER_SYSTEM, DRAFTER_USER};
use super::{AgentRun, RoundFeedback};
use crate::llm::GenerationClient;
use crate::sandbox::image_for_language;
use crate::types::{EnvironmentSpec, Finding, TaskInstance};
use crate::utils::extract_code_block;

/// Inputs to one drafting call.
#[derive(Debug, Clone, Copy)]
pub struct DraftInput<'a> {
    pub instance: &'a TaskInstance,
    pub finding: &'a Finding,
    /// Cached spec from a nearby version, used as a starting point.
    pub seed: Option<&'a EnvironmentSpec>,
    /// The previous round's spec and why it failed.
    pub previous: Option<&'a EnvironmentSpec>,
    pub feedback: Option<&'a RoundFeedback>,
}

pub struct Drafter {
    client: GenerationClient,
    max_turns: usize,
}

impl Drafter {
    pub fn new(client: GenerationClient, max_turns: usize) -> Self {
        Self { client, max_turns }
    }

    pub async fn draft(&self, input: DraftInput<'_>) -> AgentRun<EnvironmentSpec> {
        let mut conv = Conversation::new(AgentRole::Drafter, DRAFTER_SYSTEM, self.max_turns);
        let output = self.run(&mut conv, input).await;
        AgentRun {
            output,
            stats: conv.stats(),
        }
    }

    async fn run(
        &self,
        conv: &mut Conversation,
        input: DraftInput<'_>,
    ) -> AgentResult<EnvironmentSpec> {
        conv.push_user(user_prompt(&input)?);

        loop {
            let reply = conv.turn(&self.client).await?;
            match parse_dockerfile(&reply) {
                Ok(spec) => {
                    tracing::info!(
                        instance_id = %input.instance.instance_id,
                        base_image = %spec.base_image,
                        setup_commands = spec.setup_commands.len(),
                        turns = conv.turns_used(),
                        "Environment drafted"
                    );
                    return Ok(spec);
                }
                Err(why) => {
                    tracing::debug!(
                        instance_id = %input.instance.instance_id,
                        reason = %why,
                        "Drafter reply rejected"
                    );
                    conv.push_user(format!(
                        "{}. Reply with the complete Dockerfile in a ```dockerfile block.",
                        why
                    ));
                }
            }
        }
    }
}

/// Extract and check the Dockerfile in a drafter reply.
pub fn parse_dockerfile(reply: &str) -> Result<EnvironmentSpec, String> {
    let body = extract_code_block(reply, &["dockerfile", "docker"])
        .ok_or_else(|| "No fenced Dockerfile found".to_string())?;
    let spec = EnvironmentSpec::from_dockerfile(&body)?;
    let copies_local = spec.dockerfile.lines().any(|line| {
        let upper = line.trim_start().to_ascii_uppercase();
        if upper.starts_with("COPY ") {
            return !upper.contains("--FROM=");
        }
        if upper.starts_with("ADD ") {
            return !upper.contains("HTTP://") && !upper.contains("HTTPS://");
        }
        false
    });
    if copies_local {
        return Err(
            "The image is built without a context; COPY/ADD of local files is impossible".into(),
        );
    }
    Ok(spec)
}

fn user_prompt(input: &DraftInput<'_>) -> AgentResult<String> {
    let instance = input.instance;
    let base_image = input
        .finding
        .base_image
        .clone()
        .filter(|b| !b.trim().is_empty())
        .unwrap_or_else(|| image_for_language(&instance.language).to_string());

    let mut ctx = Context::new();
    ctx.insert("repo", &instance.repo);
    ctx.insert("base_commit", &instance.base_commit);
    ctx.insert("language", &instance.language);
    ctx.insert("version", &instance.version());
    ctx.insert(
        "finding",
        &serde_json::to_string_pretty(input.finding).unwrap_or_default(),
    );
    ctx.insert("base_image", &base_image);
    ctx.insert("seed", &input.seed.map(|s| s.dockerfile.as_str()));
    ctx.insert("previous", &input.previous.map(|s| s.dockerfile.as_str()));
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
    Ok(render(DRAFTER_USER, &ctx)?)
}
