//! Bounded multi-turn conversation owned by one agent role.
//!
//! A conversation holds the role's system prompt and transcript, counts the
//! generation turns it has spent against a fixed budget and accumulates the
//! token usage of every completion.

use serde::{Deserialize, Serialize};
use std::fmt;

use super::error::{AgentError, AgentResult};
use crate::llm::{GenerationClient, Message, Usage};

/// The three generative roles of the builder.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentRole {
    Explorer,
    Drafter,
    Scriptwriter,
}

impl AgentRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            AgentRole::Explorer => "explorer",
            AgentRole::Drafter => "drafter",
            AgentRole::Scriptwriter => "scriptwriter",
        }
    }
}

impl fmt::Display for AgentRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Generation cost of one conversation.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConversationStats {
    pub turns: usize,
    pub usage: Usage,
}

impl ConversationStats {
    pub fn add(&mut self, other: &ConversationStats) {
        self.turns += other.turns;
        self.usage.add(&other.usage);
    }
}

pub struct Conversation {
    role: AgentRole,
    messages: Vec<Message>,
    max_turns: usize,
    stats: ConversationStats,
}

impl Conversation {
    pub fn new(role: AgentRole, system_prompt: impl Into<String>, max_turns: usize) -> Self {
        Self {
            role,
            messages: vec![Message::system(system_prompt)],
            max_turns: max_turns.max(1),
            stats: ConversationStats::default(),
        }
    }

    pub fn role(&self) -> AgentRole {
        self.role
    }

    pub fn messages(&self) -> &[Message] {
        &self.messages
    }

    pub fn stats(&self) -> ConversationStats {
        self.stats
    }

    pub fn turns_used(&self) -> usize {
        self.stats.turns
    }

    pub fn max_turns(&self) -> usize {
        self.max_turns
    }

    pub fn turns_left(&self) -> usize {
        self.max_turns.saturating_sub(self.stats.turns)
    }

    pub fn push_user(&mut self, content: impl Into<String>) {
        self.messages.push(Message::user(content));
    }

    /// Spend one turn: send the transcript and append the reply.
    ///
    /// Fails with [`AgentError::Exhausted`] once the budget is spent; backend
    /// errors surface only after the client's own transport retries.
    pub async fn turn(&mut self, client: &GenerationClient) -> AgentResult<String> {
        if self.turns_left() == 0 {
            return Err(self.exhausted("no final output before the turn limit"));
        }
        let completion = client.complete(&self.messages).await?;
        self.stats.turns += 1;
        self.stats.usage.add(&completion.usage);
        self.messages.push(Message::assistant(completion.text.clone()));

        tracing::debug!(
            role = %self.role,
            turn = self.stats.turns,
            max_turns = self.max_turns,
            tokens = completion.usage.total_tokens,
            "Agent turn completed"
        );
        Ok(completion.text)
    }

    /// Exhaustion error carrying this conversation's budget.
    pub fn exhausted(&self, reason: impl Into<String>) -> AgentError {
        AgentError::Exhausted {
            role: self.role.as_str(),
            turns: self.max_turns,
            reason: reason.into(),
        }
    }
}
