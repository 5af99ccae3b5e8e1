//! Error types for the agent roles.

use thiserror::Error;

use crate::error::{LlmError, SandboxError};

/// Errors that end an agent's conversation without a usable output.
#[derive(Debug, Error)]
pub enum AgentError {
    /// The turn budget ran out before a valid final output was produced.
    #[error("{role} exhausted its {turns}-turn budget: {reason}")]
    Exhausted {
        role: &'static str,
        turns: usize,
        reason: String,
    },

    /// Generation backend failed after transport retries.
    #[error("Generation backend failed: {0}")]
    Backend(#[from] LlmError),

    /// Container engine failed while probing the repository.
    #[error("Sandbox failed: {0}")]
    Sandbox(#[from] SandboxError),

    /// Prompt template could not be rendered.
    #[error("Prompt template error: {0}")]
    Template(#[from] tera::Error),
}

impl AgentError {
    /// Exhaustion is recoverable by the refinement loop; anything else is a
    /// transport failure that ends the instance.
    pub fn is_exhaustion(&self) -> bool {
        matches!(self, AgentError::Exhausted { .. })
    }
}

/// Result type alias for agent operations.
pub type AgentResult<T> = Result<T, AgentError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exhaustion_is_recoverable() {
        let err = AgentError::Exhausted {
            role: "explorer",
            turns: 3,
            reason: "no finding".into(),
        };
        assert!(err.is_exhaustion());
        assert_eq!(
            err.to_string(),
            "explorer exhausted its 3-turn budget: no finding"
        );

        let err = AgentError::from(LlmError::RateLimited("slow down".into()));
        assert!(!err.is_exhaustion());
    }
}
