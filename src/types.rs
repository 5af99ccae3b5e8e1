//! Core data model shared by the agents, the validator and the orchestrator.

use serde::{Deserialize, Deserializer, Serialize};

use crate::utils::{derive_instance_id, sha256_hex};

/// One repository/commit/issue unit to synthesize an environment for.
///
/// Identity is `(repo, base_commit)`; `instance_id` is the stable string
/// form used for result directories and logs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskInstance {
    #[serde(default)]
    pub instance_id: String,
    pub repo: String,
    pub base_commit: String,
    pub language: String,
    #[serde(default)]
    pub problem_statement: String,
    #[serde(default, alias = "patch")]
    pub gold_patch: String,
    #[serde(default)]
    pub test_patch: String,
    #[serde(default, deserialize_with = "de_opt_string_or_number")]
    pub version: Option<String>,
    /// Explicit focus tests; derived from `test_patch` when absent.
    #[serde(default, alias = "FAIL_TO_PASS", deserialize_with = "de_opt_string_list")]
    pub fail_to_pass: Option<Vec<String>>,
    /// Pass2Pass tests permitted to regress.
    #[serde(default)]
    pub allowed_regressions: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hints_text: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created_at: Option<String>,
}

impl TaskInstance {
    /// Fill in `instance_id` when the record did not carry one.
    pub fn with_resolved_id(mut self) -> Self {
        if self.instance_id.trim().is_empty() {
            self.instance_id = derive_instance_id(&self.repo, &self.base_commit);
        }
        self
    }

    pub fn identity(&self) -> (&str, &str) {
        (&self.repo, &self.base_commit)
    }

    pub fn version(&self) -> Option<&str> {
        self.version.as_deref().filter(|v| !v.trim().is_empty())
    }
}

fn de_opt_string_or_number<'de, D>(deserializer: D) -> Result<Option<String>, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Option::<serde_json::Value>::deserialize(deserializer)?;
    Ok(match value {
        None | Some(serde_json::Value::Null) => None,
        Some(serde_json::Value::String(s)) => Some(s),
        Some(serde_json::Value::Number(n)) => Some(n.to_string()),
        Some(other) => Some(other.to_string()),
    })
}

/// Accepts a JSON list or a string holding a JSON list (SWE-bench style).
fn de_opt_string_list<'de, D>(deserializer: D) -> Result<Option<Vec<String>>, D::Error>
where
    D: Deserializer<'de>,
{
    use serde::de::Error;

    let value = Option::<serde_json::Value>::deserialize(deserializer)?;
    match value {
        None | Some(serde_json::Value::Null) => Ok(None),
        Some(serde_json::Value::String(s)) if s.trim().is_empty() => Ok(None),
        Some(serde_json::Value::String(s)) => serde_json::from_str::<Vec<String>>(&s)
            .map(Some)
            .map_err(|e| D::Error::custom(format!("fail_to_pass: {}", e))),
        Some(v) => serde_json::from_value::<Vec<String>>(v)
            .map(Some)
            .map_err(|e| D::Error::custom(format!("fail_to_pass: {}", e))),
    }
}

/// Structured output of repository exploration.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Finding {
    pub runtime_version: String,
    pub package_manager: String,
    pub install_cmds: Vec<String>,
    pub test_cmds: Vec<String>,
    pub notes: String,
    /// Base image the explorer recommends, if any.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub base_image: Option<String>,
}

impl Finding {
    /// A finding is usable when it names at least one test command.
    pub fn is_usable(&self) -> bool {
        self.test_cmds.iter().any(|c| !c.trim().is_empty())
    }
}

/// Container image definition plus what it declares.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EnvironmentSpec {
    pub dockerfile: String,
    pub base_image: String,
    pub setup_commands: Vec<String>,
}

impl EnvironmentSpec {
    /// Parse the declared base image and `RUN` commands out of a Dockerfile.
    ///
    /// Backslash line continuations are joined. The first `FROM` is the
    /// base image; a Dockerfile without one is rejected.
    pub fn from_dockerfile(dockerfile: &str) -> Result<Self, String> {
        let mut logical_lines = Vec::new();
        let mut current = String::new();
        for raw in dockerfile.lines() {
            let line = raw.trim_end();
            if current.is_empty() && line.trim_start().starts_with('#') {
                continue;
            }
            let line = if current.is_empty() {
                line
            } else {
                line.trim_start()
            };
            if let Some(stripped) = line.strip_suffix('\\') {
                current.push_str(stripped.trim_end());
                current.push(' ');
                continue;
            }
            current.push_str(line);
            let finished = std::mem::take(&mut current);
            if !finished.trim().is_empty() {
                logical_lines.push(finished.trim().to_string());
            }
        }
        if !current.trim().is_empty() {
            logical_lines.push(current.trim().to_string());
        }

        let mut base_image = None;
        let mut setup_commands = Vec::new();
        for line in &logical_lines {
            let (instr, rest) = line
                .split_once(char::is_whitespace)
                .unwrap_or((line.as_str(), ""));
            match instr.to_ascii_uppercase().as_str() {
                "FROM" if base_image.is_none() => {
                    let image = rest
                        .split_whitespace()
                        .find(|tok| !tok.starts_with("--"))
                        .unwrap_or_default();
                    if !image.is_empty() {
                        base_image = Some(image.to_string());
                    }
                }
                "RUN" => setup_commands.push(rest.trim().to_string()),
                _ => {}
            }
        }

        let base_image =
            base_image.ok_or_else(|| "Dockerfile has no FROM instruction".to_string())?;
        Ok(Self {
            dockerfile: dockerfile.to_string(),
            base_image,
            setup_commands,
        })
    }

    pub fn content_hash(&self) -> String {
        sha256_hex(&self.dockerfile)
    }
}

/// Executable evaluation script; takes the patch path as `$1`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EvalScript {
    pub text: String,
}

impl EvalScript {
    pub fn new(text: impl Into<String>) -> Self {
        Self { text: text.into() }
    }

    pub fn content_hash(&self) -> String {
        sha256_hex(&self.text)
    }
}
