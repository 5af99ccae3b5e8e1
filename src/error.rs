//! Error types for env-forge operations.
//!
//! Defines error types for the subsystems the builder talks to:
//! - Container engine (image builds, container runs, probe sessions)
//! - Generation backend (LLM API interactions)
//! - Memory pool persistence
//! - Configuration loading
//! - Task instance input

use thiserror::Error;

/// Errors that can occur while talking to the container engine.
///
/// Timeouts and non-zero exits of builds and runs are *not* errors: they are
/// reported as outcomes so the validator can classify them. These variants
/// cover transport problems where the engine itself could not be driven.
#[derive(Debug, Error)]
pub enum SandboxError {
    #[error("Container engine unavailable: {0}")]
    EngineUnavailable(String),

    #[error("Failed to spawn '{command}': {reason}")]
    SpawnFailed { command: String, reason: String },

    #[error("Failed to start probe container '{container}': {reason}")]
    SessionStartFailed { container: String, reason: String },

    #[error("Failed to stage file '{path}' for container: {reason}")]
    StagingFailed { path: String, reason: String },

    #[error("Invalid sandbox request: {0}")]
    InvalidRequest(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Errors that can occur during LLM operations.
#[derive(Debug, Error)]
pub enum LlmError {
    #[error("Missing API key: OPENROUTER_API_KEY or LITELLM_API_KEY environment variable not set")]
    MissingApiKey,

    #[error("Missing API base URL: LITELLM_API_BASE environment variable not set")]
    MissingApiBase,

    #[error("HTTP request failed: {0}")]
    RequestFailed(String),

    #[error("Failed to parse LLM response: {0}")]
    ParseError(String),

    #[error("Rate limited: {0}")]
    RateLimited(String),

    #[error("Context length exceeded: {limit} tokens")]
    ContextLengthExceeded { limit: u32 },

    #[error("API error ({code}): {message}")]
    ApiError { code: u16, message: String },

    #[error("Generation call timed out after {seconds}s")]
    Timeout { seconds: u64 },

    #[error("Empty completion from model '{0}'")]
    EmptyCompletion(String),

    #[error("Gave up after {attempts} attempts: {last}")]
    RetriesExhausted { attempts: u32, last: String },
}

/// Errors raised by the memory pool store.
#[derive(Debug, Error)]
pub enum MemoryPoolError {
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Invalid memory pool entry: {0}")]
    InvalidEntry(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Errors that can occur while loading or validating configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Invalid configuration: {0}")]
    Invalid(String),

    #[error("Failed to parse environment variable {name}: {reason}")]
    BadEnvValue { name: String, reason: String },

    #[error("Failed to read config file '{path}': {reason}")]
    FileRead { path: String, reason: String },

    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),
}

/// Errors for a single task instance record.
#[derive(Debug, Error)]
pub enum InputError {
    #[error("Line {line}: malformed record: {reason}")]
    Malformed { line: usize, reason: String },

    #[error("Missing required field '{0}'")]
    MissingField(&'static str),

    #[error("Invalid field '{field}': {reason}")]
    InvalidField { field: &'static str, reason: String },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}
