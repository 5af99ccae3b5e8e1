//! env-forge: multi-agent synthesis of executable build environments and
//! evaluation scripts for repository task instances.
//!
//! Each instance goes through a bounded refinement loop: an explorer probes
//! the repository in a sandbox, a drafter writes a Dockerfile, a
//! scriptwriter writes an eval script, and the validator checks that the
//! gold patch turns the focus tests from failing to passing. Validated
//! pairs are kept in a memory pool for reuse on later instances.

pub mod agents;
pub mod builder;
pub mod cli;
pub mod error;
pub mod llm;
pub mod pool;
pub mod sandbox;
pub mod types;
pub mod utils;
pub mod validation;

// Re-export commonly used types
pub use builder::{BuilderConfig, FailureKind, InstanceOutcome, Orchestrator};
pub use error::{ConfigError, InputError, LlmError, MemoryPoolError, SandboxError};
pub use types::{EnvironmentSpec, EvalScript, Finding, TaskInstance};
pub use validation::{Classification, ValidationResult};
