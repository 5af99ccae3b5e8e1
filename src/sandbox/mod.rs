//! Execution sandbox: image builds, one-shot container runs and interactive
//! probe sessions, each bounded by a wall-clock timeout.
//!
//! Non-zero exits and timeouts are reported as outcomes, never as errors.
//! [`SandboxError`] is reserved for failures to drive the engine at all.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::time::Duration;

use crate::error::SandboxError;

pub mod docker;

pub use docker::{image_for_language, DockerSandbox};

/// Directory inside run containers where staged files are mounted.
pub const MOUNT_DIR: &str = "/envforge";

/// Request to build an image from a Dockerfile with no build context.
#[derive(Debug, Clone)]
pub struct BuildRequest {
    pub tag: String,
    pub dockerfile: String,
    pub timeout: Duration,
}

/// Result of an image build.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum BuildOutcome {
    Built { image: String, log: String },
    Failed { exit_code: i32, log: String },
    TimedOut { log: String },
}

impl BuildOutcome {
    pub fn is_built(&self) -> bool {
        matches!(self, BuildOutcome::Built { .. })
    }

    pub fn log(&self) -> &str {
        match self {
            BuildOutcome::Built { log, .. }
            | BuildOutcome::Failed { log, .. }
            | BuildOutcome::TimedOut { log } => log,
        }
    }
}

/// A file staged read-only into a run container.
#[derive(Debug, Clone)]
pub struct MountedFile {
    pub container_path: String,
    pub content: String,
}

impl MountedFile {
    pub fn new(container_path: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            container_path: container_path.into(),
            content: content.into(),
        }
    }
}

/// Request to run one command in a fresh container.
#[derive(Debug, Clone)]
pub struct RunRequest {
    pub image: String,
    pub command: Vec<String>,
    pub files: Vec<MountedFile>,
    pub timeout: Duration,
}

/// Captured output of a finished command.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecOutput {
    pub exit_code: i32,
    pub stdout: String,
    pub stderr: String,
    #[serde(default)]
    pub timed_out: bool,
}

/// Result of a one-shot container run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RunOutcome {
    Completed(ExecOutput),
    /// Output captured up to the moment the container was killed.
    TimedOut { stdout: String, stderr: String },
}

/// Request to open a long-lived container with the repository checked out.
#[derive(Debug, Clone)]
pub struct SessionRequest {
    pub image: String,
    pub repo: String,
    pub base_commit: String,
    pub setup_timeout: Duration,
}

/// Interactive container used by the repository explorer.
#[async_trait]
pub trait ProbeSession: Send + Sync {
    /// Container name (for logging).
    fn name(&self) -> &str;

    /// Run a shell command in the repository checkout.
    ///
    /// A timeout yields `timed_out = true` and exit code -1.
    async fn exec(&self, cmd: &str, timeout: Duration) -> Result<ExecOutput, SandboxError>;

    /// Remove the container.
    async fn close(&self);
}

/// Container engine capability.
#[async_trait]
pub trait Sandbox: Send + Sync {
    async fn build(&self, request: &BuildRequest) -> Result<BuildOutcome, SandboxError>;

    /// Run in a fresh container that is removed afterwards.
    async fn run(&self, request: &RunRequest) -> Result<RunOutcome, SandboxError>;

    async fn open_session(
        &self,
        request: &SessionRequest,
    ) -> Result<Box<dyn ProbeSession>, SandboxError>;

    async fn remove_image(&self, image: &str);
}

/// Deterministic image tag for a Dockerfile built on behalf of an instance.
///
/// The same instance and Dockerfile always map to the same tag, so a rebuilt
/// identical spec reuses the engine's layer cache.
pub fn image_tag(instance_id: &str, dockerfile: &str) -> String {
    let mapped: String = instance_id
        .to_lowercase()
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '.' || c == '-' || c == '_' {
                c
            } else {
                '_'
            }
        })
        .collect();
    let mut name = collapse_separators(&mapped)
        .trim_matches(is_separator)
        .to_string();
    if name.is_empty() {
        name = "instance".to_string();
    }
    name.truncate(100);
    let name = name.trim_end_matches(is_separator);

    let digest = Sha256::digest(dockerfile.as_bytes());
    let hash = hex::encode(digest);
    format!("envforge/{}:{}", name, &hash[..12])
}

fn is_separator(c: char) -> bool {
    matches!(c, '.' | '-' | '_')
}

/// Rewrite separator runs into forms the engine accepts in repository
/// names: `.`, `_`, `__` or a run of `-`. Any other run becomes `_`.
fn collapse_separators(name: &str) -> String {
    let mut out = String::with_capacity(name.len());
    let mut run = String::new();
    for c in name.chars().chain(std::iter::once('\0')) {
        if is_separator(c) {
            run.push(c);
            continue;
        }
        if !run.is_empty() {
            let valid = run.len() == 1 || run == "__" || run.chars().all(|r| r == '-');
            out.push_str(if valid { run.as_str() } else { "_" });
            run.clear();
        }
        if c != '\0' {
            out.push(c);
        }
    }
    out
}
