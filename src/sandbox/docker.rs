//! Docker CLI implementation of the execution sandbox.
//!
//! Every build and run is bounded by `tokio::time::timeout`. On timeout the
//! child process is killed and, for runs, the container is force-removed so
//! nothing leaks into the next run.

use async_trait::async_trait;
use std::path::Path;
use std::process::Stdio;
use std::time::{Duration, Instant};
use tokio::io::AsyncWriteExt;
use tokio::process::Command;

use super::{
    BuildOutcome, BuildRequest, ExecOutput, ProbeSession, RunOutcome, RunRequest, Sandbox,
    SessionRequest, MOUNT_DIR,
};
use crate::error::SandboxError;
use crate::utils::{truncate, validate_git_ref, validate_repo_name};

/// Bound on the captured build log kept in memory.
const MAX_BUILD_LOG_BYTES: usize = 200_000;

/// Pick a base image for probe sessions from the instance language.
pub fn image_for_language(language: &str) -> &'static str {
    match language.to_lowercase().as_str() {
        "python" | "py" => "python:3.11-slim",
        "javascript" | "js" | "typescript" | "ts" | "node" => "node:20-bookworm",
        "java" | "kotlin" | "scala" => "eclipse-temurin:17-jdk",
        "go" | "golang" => "golang:1.22",
        "rust" => "rust:1-bookworm",
        "ruby" => "ruby:3.3-bookworm",
        "php" => "php:8.3-cli-bookworm",
        _ => "ubuntu:22.04",
    }
}

/// Sandbox backed by the `docker` command-line client.
#[derive(Debug, Clone)]
pub struct DockerSandbox {
    binary: String,
    /// Extra flags for `docker run`, e.g. a memory limit.
    run_flags: Vec<String>,
}

impl Default for DockerSandbox {
    fn default() -> Self {
        Self::new()
    }
}

impl DockerSandbox {
    pub fn new() -> Self {
        Self {
            binary: "docker".to_string(),
            run_flags: Vec::new(),
        }
    }

    pub fn with_binary(mut self, binary: impl Into<String>) -> Self {
        self.binary = binary.into();
        self
    }

    pub fn with_run_flags(mut self, flags: Vec<String>) -> Self {
        self.run_flags = flags;
        self
    }

    /// Check that the daemon answers `docker version`.
    pub async fn ping(&self) -> Result<(), SandboxError> {
        let output = Command::new(&self.binary)
            .args(["version", "--format", "{{.Server.Version}}"])
            .output()
            .await
            .map_err(|e| self.spawn_error("version", e))?;
        if !output.status.success() {
            return Err(SandboxError::EngineUnavailable(
                String::from_utf8_lossy(&output.stderr).trim().to_string(),
            ));
        }
        Ok(())
    }

    fn spawn_error(&self, sub: &str, e: std::io::Error) -> SandboxError {
        SandboxError::SpawnFailed {
            command: format!("{} {}", self.binary, sub),
            reason: e.to_string(),
        }
    }

    async fn force_remove(&self, container: &str) {
        if let Err(e) = Command::new(&self.binary)
            .args(["rm", "-f", container])
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status()
            .await
        {
            tracing::debug!(container = container, error = %e, "Failed to remove container");
        }
    }

    /// Output a still-running container has produced so far.
    async fn partial_logs(&self, container: &str) -> (String, String) {
        match tokio::time::timeout(
            Duration::from_secs(30),
            Command::new(&self.binary)
                .args(["logs", container])
                .output(),
        )
        .await
        {
            Ok(Ok(output)) => (
                String::from_utf8_lossy(&output.stdout).to_string(),
                String::from_utf8_lossy(&output.stderr).to_string(),
            ),
            _ => (String::new(), String::new()),
        }
    }
}

/// Write mounted files into `dir` and return `-v` arguments for them.
fn stage_files(dir: &Path, request: &RunRequest) -> Result<Vec<String>, SandboxError> {
    let mut args = Vec::with_capacity(request.files.len() * 2);
    for (idx, file) in request.files.iter().enumerate() {
        if !file.container_path.starts_with('/') || file.container_path.contains("..") {
            return Err(SandboxError::InvalidRequest(format!(
                "mount target '{}' must be an absolute path without '..'",
                file.container_path
            )));
        }
        let host_path = dir.join(format!("file-{}", idx));
        std::fs::write(&host_path, file.content.as_bytes()).map_err(|e| {
            SandboxError::StagingFailed {
                path: file.container_path.clone(),
                reason: e.to_string(),
            }
        })?;
        args.push("-v".to_string());
        args.push(format!(
            "{}:{}:ro",
            host_path.to_string_lossy(),
            file.container_path
        ));
    }
    Ok(args)
}

fn short_id() -> String {
    uuid::Uuid::new_v4().simple().to_string()[..12].to_string()
}

#[async_trait]
impl Sandbox for DockerSandbox {
    async fn build(&self, request: &BuildRequest) -> Result<BuildOutcome, SandboxError> {
        let started = Instant::now();
        let mut child = Command::new(&self.binary)
            .args(["build", "--force-rm", "-t", &request.tag, "-"])
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| self.spawn_error("build", e))?;

        if let Some(mut stdin) = child.stdin.take() {
            stdin.write_all(request.dockerfile.as_bytes()).await?;
            stdin.shutdown().await?;
        }

        match tokio::time::timeout(request.timeout, child.wait_with_output()).await {
            Ok(Ok(output)) => {
                let mut log = String::from_utf8_lossy(&output.stdout).to_string();
                log.push_str(&String::from_utf8_lossy(&output.stderr));
                let log = tail(&log, MAX_BUILD_LOG_BYTES);
                if output.status.success() {
                    tracing::info!(
                        image = %request.tag,
                        elapsed_ms = started.elapsed().as_millis() as u64,
                        "Image built"
                    );
                    Ok(BuildOutcome::Built {
                        image: request.tag.clone(),
                        log,
                    })
                } else {
                    let exit_code = output.status.code().unwrap_or(-1);
                    tracing::info!(image = %request.tag, exit_code, "Image build failed");
                    Ok(BuildOutcome::Failed { exit_code, log })
                }
            }
            Ok(Err(e)) => Err(SandboxError::Io(e)),
            Err(_) => {
                tracing::warn!(
                    image = %request.tag,
                    timeout_secs = request.timeout.as_secs(),
                    "Image build timed out"
                );
                Ok(BuildOutcome::TimedOut {
                    log: format!(
                        "docker build timed out after {}s",
                        request.timeout.as_secs()
                    ),
                })
            }
        }
    }

    async fn run(&self, request: &RunRequest) -> Result<RunOutcome, SandboxError> {
        let staging = tempfile::Builder::new()
            .prefix("envforge-mount-")
            .tempdir()?;
        let mounts = stage_files(staging.path(), request)?;
        let container = format!("envforge-run-{}", short_id());

        let mut args: Vec<String> = vec![
            "run".into(),
            "--rm".into(),
            "--name".into(),
            container.clone(),
        ];
        args.extend(self.run_flags.iter().cloned());
        args.extend(mounts);
        args.push(request.image.clone());
        args.extend(request.command.iter().cloned());

        tracing::debug!(container = %container, image = %request.image, "Starting run container");

        let child = Command::new(&self.binary)
            .args(&args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| self.spawn_error("run", e))?;

        match tokio::time::timeout(request.timeout, child.wait_with_output()).await {
            Ok(Ok(output)) => Ok(RunOutcome::Completed(ExecOutput {
                exit_code: output.status.code().unwrap_or(-1),
                stdout: String::from_utf8_lossy(&output.stdout).to_string(),
                stderr: String::from_utf8_lossy(&output.stderr).to_string(),
                timed_out: false,
            })),
            Ok(Err(e)) => Err(SandboxError::Io(e)),
            Err(_) => {
                let (stdout, mut stderr) = self.partial_logs(&container).await;
                self.force_remove(&container).await;
                stderr.push_str(&format!(
                    "\n[envforge] run timed out after {}s",
                    request.timeout.as_secs()
                ));
                tracing::warn!(
                    container = %container,
                    timeout_secs = request.timeout.as_secs(),
                    "Run container timed out"
                );
                Ok(RunOutcome::TimedOut { stdout, stderr })
            }
        }
    }

    async fn open_session(
        &self,
        request: &SessionRequest,
    ) -> Result<Box<dyn ProbeSession>, SandboxError> {
        validate_repo_name(&request.repo)
            .map_err(|e| SandboxError::InvalidRequest(e.to_string()))?;
        validate_git_ref(&request.base_commit)
            .map_err(|e| SandboxError::InvalidRequest(e.to_string()))?;

        let container = format!(
            "envforge-probe-{}-{}",
            request.repo.replace('/', "-").to_lowercase(),
            short_id()
        );

        let run_output = Command::new(&self.binary)
            .args([
                "run",
                "-d",
                "--name",
                &container,
                "-w",
                "/",
                &request.image,
                "sleep",
                "7200",
            ])
            .output()
            .await
            .map_err(|e| self.spawn_error("run", e))?;

        if !run_output.status.success() {
            return Err(SandboxError::SessionStartFailed {
                container,
                reason: String::from_utf8_lossy(&run_output.stderr).trim().to_string(),
            });
        }

        let mut session = DockerProbeSession {
            binary: self.binary.clone(),
            container: container.clone(),
            workdir: "/".to_string(),
        };

        let setup = format!(
            "(command -v git >/dev/null 2>&1 || (apt-get update -qq && apt-get install -y -qq git >/dev/null 2>&1)) \
             && git clone --quiet https://github.com/{repo}.git /repo 2>&1 \
             && cd /repo && git checkout --quiet --force {commit} 2>&1",
            repo = request.repo,
            commit = request.base_commit
        );
        let out = session.exec(&setup, request.setup_timeout).await?;
        if out.exit_code != 0 {
            session.close().await;
            return Err(session_start_failed(container, &out));
        }

        tracing::info!(container = %container, image = %request.image, repo = %request.repo, "Probe session ready");

        session.workdir = "/repo".to_string();
        Ok(Box::new(session))
    }

    async fn remove_image(&self, image: &str) {
        match Command::new(&self.binary)
            .args(["rmi", "-f", image])
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status()
            .await
        {
            Ok(_) => tracing::debug!(image = image, "Image removed"),
            Err(e) => tracing::debug!(image = image, error = %e, "Failed to remove image"),
        }
    }
}

fn session_start_failed(container: String, out: &ExecOutput) -> SandboxError {
    let detail = if out.timed_out {
        "repository checkout timed out".to_string()
    } else {
        truncate(format!("{}{}", out.stdout, out.stderr).trim(), 500)
    };
    SandboxError::SessionStartFailed {
        container,
        reason: detail,
    }
}

/// A long-lived container used by the explorer.
pub struct DockerProbeSession {
    binary: String,
    container: String,
    workdir: String,
}

#[async_trait]
impl ProbeSession for DockerProbeSession {
    fn name(&self) -> &str {
        &self.container
    }

    async fn exec(&self, cmd: &str, timeout: Duration) -> Result<ExecOutput, SandboxError> {
        let child = Command::new(&self.binary)
            .args(["exec", "-w", &self.workdir, &self.container, "bash", "-c", cmd])
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| SandboxError::SpawnFailed {
                command: format!("{} exec", self.binary),
                reason: e.to_string(),
            })?;

        match tokio::time::timeout(timeout, child.wait_with_output()).await {
            Ok(Ok(output)) => Ok(ExecOutput {
                exit_code: output.status.code().unwrap_or(-1),
                stdout: String::from_utf8_lossy(&output.stdout).to_string(),
                stderr: String::from_utf8_lossy(&output.stderr).to_string(),
                timed_out: false,
            }),
            Ok(Err(e)) => Err(SandboxError::Io(e)),
            Err(_) => Ok(ExecOutput {
                exit_code: -1,
                stdout: String::new(),
                stderr: format!("Command timed out after {}s", timeout.as_secs().max(1)),
                timed_out: true,
            }),
        }
    }

    async fn close(&self) {
        if let Err(e) = Command::new(&self.binary)
            .args(["rm", "-f", &self.container])
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status()
            .await
        {
            tracing::debug!(container = %self.container, error = %e, "Failed to destroy probe container");
        }
        tracing::debug!(container = %self.container, "Probe session closed");
    }
}

/// Best-effort cleanup when a session is dropped without `close`.
impl Drop for DockerProbeSession {
    fn drop(&mut self) {
        let binary = self.binary.clone();
        let name = self.container.clone();
        std::thread::spawn(move || {
            let _ = std::process::Command::new(binary)
                .args(["rm", "-f", &name])
                .stdout(std::process::Stdio::null())
                .stderr(std::process::Stdio::null())
                .status();
        });
    }
}

/// Keep the last `max` bytes of a log on a char boundary.
fn tail(s: &str, max: usize) -> String {
    if s.len() <= max {
        return s.to_string();
    }
    let mut start = s.len() - max;
    while !s.is_char_boundary(start) && start < s.len() {
        start += 1;
    }
    format!("...{}", &s[start..])
}

/// Path inside run containers where the eval script is mounted.
pub fn eval_script_path() -> String {
    format!("{}/eval.sh", MOUNT_DIR)
}

/// Path inside run containers where the patch is mounted.
pub fn patch_path() -> String {
    format!("{}/patch.diff", MOUNT_DIR)
}
