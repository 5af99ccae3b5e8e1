//! Generative agent roles of the builder.
//!
//! - [`Explorer`] probes the checked-out repository and emits a [`Finding`].
//! - [`Drafter`] turns a finding into an [`EnvironmentSpec`].
//! - [`Scriptwriter`] turns a finding and an environment into an [`EvalScript`].
//!
//! Each role owns a bounded [`Conversation`]; running out of turns is an
//! [`AgentError::Exhausted`] that the orchestrator charges to the round.
//!
//! [`Finding`]: crate::types::Finding
//! [`EnvironmentSpec`]: crate::types::EnvironmentSpec
//! [`EvalScript`]: crate::types::EvalScript

pub mod conversation;
pub mod drafter;
pub mod error;
pub mod explorer;
pub mod prompts;
pub mod scriptwriter;

pub use conversation::{AgentRole, Conversation, ConversationStats};
pub use drafter::Drafter;
pub use error::{AgentError, AgentResult};
pub use explorer::{ExplorerAction, ExplorerSettings, Explorer};
pub use scriptwriter::Scriptwriter;

use crate::validation::{Classification, ValidationResult};

/// Bytes of validation logs forwarded to an agent on refinement.
pub const FEEDBACK_LOG_BYTES: usize = 12_000;

/// Outcome of one agent invocation together with what it cost.
#[derive(Debug)]
pub struct AgentRun<T> {
    pub output: AgentResult<T>,
    pub stats: ConversationStats,
}

/// What the previous round's validation tells the next round's agents.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RoundFeedback {
    pub classification: Classification,
    pub reason: String,
    pub logs: String,
}

impl RoundFeedback {
    pub fn from_validation(result: &ValidationResult) -> Self {
        Self {
            classification: result.classification,
            reason: result.reason.clone(),
            logs: result.raw_logs.excerpt(FEEDBACK_LOG_BYTES),
        }
    }

    /// Feedback for a round that ended before validation (agent exhaustion).
    pub fn without_logs(classification: Classification, reason: impl Into<String>) -> Self {
        Self {
            classification,
            reason: reason.into(),
            logs: String::new(),
        }
    }
}
