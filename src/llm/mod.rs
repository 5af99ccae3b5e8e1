//! Generation backend integration.
//!
//! The agent roles talk to a model through [`GenerationClient`], which binds a
//! provider to a model name and applies the transport retry policy:
//!
//! ```ignore
//! use env_forge::llm::{GenerationClient, LiteLlmClient, Message};
//! use std::sync::Arc;
//!
//! let provider = Arc::new(LiteLlmClient::from_env()?);
//! let client = GenerationClient::new(provider, "anthropic/claude-opus-4.5");
//! let completion = client
//!     .complete(&[Message::system("You are helpful"), Message::user("hi")])
//!     .await?;
//! println!("{} ({} tokens)", completion.text, completion.usage.total_tokens);
//! ```

pub mod client;
pub mod litellm;
pub mod providers;
pub mod retry;

pub use client::{Completion, GenerationClient};
pub use litellm::{
    Choice, GenerationRequest, GenerationResponse, LiteLlmClient, LlmProvider, Message, Usage,
    DEFAULT_MODEL,
};
pub use providers::OpenRouterProvider;
pub use retry::{is_transient_error, RetryPolicy};
