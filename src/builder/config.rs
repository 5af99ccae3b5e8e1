//! Builder configuration.
//!
//! Layered lowest to highest: built-in defaults, an optional YAML file,
//! `ENVFORGE_*` environment variables, then CLI flags (applied by the caller).
//! API keys are never read from the file; providers take them from
//! `OPENROUTER_API_KEY` / `LITELLM_API_KEY`.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use crate::agents::ExplorerSettings;
use crate::error::{ConfigError, LlmError, MemoryPoolError};
use crate::llm::{
    GenerationClient, LiteLlmClient, LlmProvider, OpenRouterProvider, RetryPolicy, DEFAULT_MODEL,
};
use crate::pool::{MemoryPool, PoolHandle};
use crate::validation::ValidatorConfig;

/// Which generation backend to talk to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Backend {
    OpenRouter,
    LiteLlm,
}

impl std::str::FromStr for Backend {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "openrouter" => Ok(Backend::OpenRouter),
            "litellm" => Ok(Backend::LiteLlm),
            other => Err(format!("unknown backend '{}' (openrouter|litellm)", other)),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LlmSettings {
    pub backend: Backend,
    pub model: String,
    /// Overrides the backend's base URL (LiteLLM proxy or OpenRouter-compatible).
    pub api_base: Option<String>,
    pub temperature: f64,
    pub max_tokens: u32,
    pub retry: RetryPolicy,
}

impl Default for LlmSettings {
    fn default() -> Self {
        Self {
            backend: Backend::OpenRouter,
            model: DEFAULT_MODEL.to_string(),
            api_base: None,
            temperature: 0.2,
            max_tokens: 4096,
            retry: RetryPolicy::default(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SandboxSettings {
    pub docker_binary: String,
    /// Extra `docker run` flags, e.g. `["--network", "host"]`.
    pub run_flags: Vec<String>,
    pub build_timeout_secs: u64,
    pub run_timeout_secs: u64,
    /// Pre-patch runs per round; more than one enables flakiness detection.
    pub repeat_count: u32,
    pub pre_patch_applies_test_patch: bool,
}

impl Default for SandboxSettings {
    fn default() -> Self {
        Self {
            docker_binary: "docker".to_string(),
            run_flags: Vec::new(),
            build_timeout_secs: 1800,
            run_timeout_secs: 1800,
            repeat_count: 1,
            pre_patch_applies_test_patch: false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PoolSettings {
    pub enabled: bool,
    pub path: PathBuf,
}

impl Default for PoolSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            path: PathBuf::from("./envforge-pool.db"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct AgentSettings {
    pub explorer: ExplorerSettings,
    pub drafter_max_turns: usize,
    pub scriptwriter_max_turns: usize,
}

impl Default for AgentSettings {
    fn default() -> Self {
        Self {
            explorer: ExplorerSettings::default(),
            drafter_max_turns: 3,
            scriptwriter_max_turns: 3,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BuilderConfig {
    /// Instances processed concurrently.
    pub workers: usize,
    /// Validation rounds per instance.
    pub round_limit: u32,
    pub output_dir: PathBuf,
    /// Keep images of failed rounds instead of removing them.
    pub keep_images: bool,
    pub llm: LlmSettings,
    pub sandbox: SandboxSettings,
    pub pool: PoolSettings,
    pub agents: AgentSettings,
}

impl Default for BuilderConfig {
    fn default() -> Self {
        Self {
            workers: 4,
            round_limit: 5,
            output_dir: PathBuf::from("./envforge-results"),
            keep_images: false,
            llm: LlmSettings::default(),
            sandbox: SandboxSettings::default(),
            pool: PoolSettings::default(),
            agents: AgentSettings::default(),
        }
    }
}

impl BuilderConfig {
    /// Defaults, then `path` (if any), then the process environment.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let mut config = match path {
            Some(p) => Self::from_yaml_file(p)?,
            None => Self::default(),
        };
        config.apply_env(|key| std::env::var(key).ok())?;
        Ok(config)
    }

    pub fn from_yaml_file(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path).map_err(|e| ConfigError::FileRead {
            path: path.display().to_string(),
            reason: e.to_string(),
        })?;
        Self::from_yaml_str(&text)
    }

    pub fn from_yaml_str(text: &str) -> Result<Self, ConfigError> {
        if text.trim().is_empty() {
            return Ok(Self::default());
        }
        Ok(serde_yaml::from_str(text)?)
    }

    /// Apply `ENVFORGE_*` overrides read through `lookup`.
    ///
    /// # Environment Variables
    ///
    /// - `ENVFORGE_WORKERS`, `ENVFORGE_ROUND_LIMIT`, `ENVFORGE_OUTPUT_DIR`
    /// - `ENVFORGE_KEEP_IMAGES`
    /// - `ENVFORGE_BACKEND` (`openrouter` | `litellm`), `ENVFORGE_MODEL`, `ENVFORGE_API_BASE`
    /// - `ENVFORGE_LLM_MAX_RETRIES`, `ENVFORGE_LLM_CALL_TIMEOUT_SECS`
    /// - `ENVFORGE_DOCKER_BINARY`, `ENVFORGE_BUILD_TIMEOUT_SECS`, `ENVFORGE_RUN_TIMEOUT_SECS`
    /// - `ENVFORGE_REPEAT_COUNT`
    /// - `ENVFORGE_MEMORY_POOL` (bool), `ENVFORGE_MEMORY_POOL_PATH`
    /// - `ENVFORGE_EXPLORER_MAX_TURNS`, `ENVFORGE_EXPLORER_IMAGE`
    pub fn apply_env<F>(&mut self, lookup: F) -> Result<(), ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(v) = lookup("ENVFORGE_WORKERS") {
            self.workers = parse_env_value(&v, "ENVFORGE_WORKERS")?;
        }
        if let Some(v) = lookup("ENVFORGE_ROUND_LIMIT") {
            self.round_limit = parse_env_value(&v, "ENVFORGE_ROUND_LIMIT")?;
        }
        if let Some(v) = lookup("ENVFORGE_OUTPUT_DIR") {
            self.output_dir = PathBuf::from(v);
        }
        if let Some(v) = lookup("ENVFORGE_KEEP_IMAGES") {
            self.keep_images = parse_env_bool(&v, "ENVFORGE_KEEP_IMAGES")?;
        }

        if let Some(v) = lookup("ENVFORGE_BACKEND") {
            self.llm.backend = v.parse().map_err(|reason| ConfigError::BadEnvValue {
                name: "ENVFORGE_BACKEND".to_string(),
                reason,
            })?;
        }
        if let Some(v) = lookup("ENVFORGE_MODEL") {
            self.llm.model = v;
        }
        if let Some(v) = lookup("ENVFORGE_API_BASE") {
            self.llm.api_base = Some(v);
        }
        if let Some(v) = lookup("ENVFORGE_LLM_MAX_RETRIES") {
            self.llm.retry.max_retries = parse_env_value(&v, "ENVFORGE_LLM_MAX_RETRIES")?;
        }
        if let Some(v) = lookup("ENVFORGE_LLM_CALL_TIMEOUT_SECS") {
            self.llm.retry.call_timeout_secs =
                parse_env_value(&v, "ENVFORGE_LLM_CALL_TIMEOUT_SECS")?;
        }

        if let Some(v) = lookup("ENVFORGE_DOCKER_BINARY") {
            self.sandbox.docker_binary = v;
        }
        if let Some(v) = lookup("ENVFORGE_BUILD_TIMEOUT_SECS") {
            self.sandbox.build_timeout_secs = parse_env_value(&v, "ENVFORGE_BUILD_TIMEOUT_SECS")?;
        }
        if let Some(v) = lookup("ENVFORGE_RUN_TIMEOUT_SECS") {
            self.sandbox.run_timeout_secs = parse_env_value(&v, "ENVFORGE_RUN_TIMEOUT_SECS")?;
        }
        if let Some(v) = lookup("ENVFORGE_REPEAT_COUNT") {
            self.sandbox.repeat_count = parse_env_value(&v, "ENVFORGE_REPEAT_COUNT")?;
        }

        if let Some(v) = lookup("ENVFORGE_MEMORY_POOL") {
            self.pool.enabled = parse_env_bool(&v, "ENVFORGE_MEMORY_POOL")?;
        }
        if let Some(v) = lookup("ENVFORGE_MEMORY_POOL_PATH") {
            self.pool.path = PathBuf::from(v);
        }

        if let Some(v) = lookup("ENVFORGE_EXPLORER_MAX_TURNS") {
            self.agents.explorer.max_turns = parse_env_value(&v, "ENVFORGE_EXPLORER_MAX_TURNS")?;
        }
        if let Some(v) = lookup("ENVFORGE_EXPLORER_IMAGE") {
            self.agents.explorer.image = Some(v).filter(|s| !s.trim().is_empty());
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let positive: [(&str, u64); 8] = [
            ("workers", self.workers as u64),
            ("round_limit", self.round_limit as u64),
            ("sandbox.build_timeout_secs", self.sandbox.build_timeout_secs),
            ("sandbox.run_timeout_secs", self.sandbox.run_timeout_secs),
            ("sandbox.repeat_count", self.sandbox.repeat_count as u64),
            ("agents.explorer.max_turns", self.agents.explorer.max_turns as u64),
            ("agents.drafter_max_turns", self.agents.drafter_max_turns as u64),
            (
                "agents.scriptwriter_max_turns",
                self.agents.scriptwriter_max_turns as u64,
            ),
        ];
        if let Some((name, _)) = positive.iter().find(|(_, v)| *v == 0) {
            return Err(ConfigError::Invalid(format!(
                "{} must be greater than 0",
                name
            )));
        }
        if self.agents.explorer.probe_timeout_secs == 0 || self.llm.retry.call_timeout_secs == 0 {
            return Err(ConfigError::Invalid(
                "probe and generation-call timeouts must be greater than 0".to_string(),
            ));
        }
        if self.llm.model.trim().is_empty() {
            return Err(ConfigError::Invalid("llm.model cannot be empty".to_string()));
        }
        if !(0.0..=2.0).contains(&self.llm.temperature) {
            return Err(ConfigError::Invalid(
                "llm.temperature must be between 0.0 and 2.0".to_string(),
            ));
        }
        if self.pool.enabled && self.pool.path.as_os_str().is_empty() {
            return Err(ConfigError::Invalid(
                "pool.path cannot be empty when the memory pool is enabled".to_string(),
            ));
        }
        Ok(())
    }

    pub fn validator_config(&self) -> ValidatorConfig {
        ValidatorConfig {
            build_timeout: Duration::from_secs(self.sandbox.build_timeout_secs),
            run_timeout: Duration::from_secs(self.sandbox.run_timeout_secs),
            repeat_count: self.sandbox.repeat_count,
            pre_patch_applies_test_patch: self.sandbox.pre_patch_applies_test_patch,
        }
    }

    /// Open the memory pool, or a no-op handle when the pool is disabled.
    /// A disabled pool never touches `pool.path`.
    pub async fn open_pool(&self) -> Result<PoolHandle, MemoryPoolError> {
        if !self.pool.enabled {
            tracing::info!("Memory pool disabled");
            return Ok(PoolHandle::disabled());
        }
        let pool = MemoryPool::open(&self.pool.path).await?;
        Ok(PoolHandle::enabled(pool))
    }

    /// Construct the configured provider; keys come from the environment.
    pub fn build_provider(&self) -> Result<Arc<dyn LlmProvider>, LlmError> {
        match self.llm.backend {
            Backend::OpenRouter => {
                let key = std::env::var("OPENROUTER_API_KEY").unwrap_or_default();
                let provider = match &self.llm.api_base {
                    Some(base) => {
                        OpenRouterProvider::with_custom_url(key, base.clone(), self.llm.model.clone())?
                    }
                    None => OpenRouterProvider::with_model(key, self.llm.model.clone())?,
                };
                tracing::info!(
                    backend = "openrouter",
                    base_url = %provider.base_url(),
                    model = %provider.default_model(),
                    api_key = %provider.api_key_masked(),
                    "Generation backend configured"
                );
                Ok(Arc::new(provider))
            }
            Backend::LiteLlm => {
                let base = self
                    .llm
                    .api_base
                    .clone()
                    .or_else(|| std::env::var("LITELLM_API_BASE").ok())
                    .ok_or(LlmError::MissingApiBase)?;
                let key = std::env::var("LITELLM_API_KEY").ok();
                let client = LiteLlmClient::new(base, key, self.llm.model.clone())?;
                tracing::info!(
                    backend = "litellm",
                    api_base = %client.api_base(),
                    model = %self.llm.model,
                    "Generation backend configured"
                );
                Ok(Arc::new(client))
            }
        }
    }

    /// Bind a provider to the configured model, sampling and retry policy.
    pub fn generation_client(&self, provider: Arc<dyn LlmProvider>) -> GenerationClient {
        GenerationClient::new(provider, self.llm.model.clone())
            .with_temperature(self.llm.temperature)
            .with_max_tokens(self.llm.max_tokens)
            .with_retry(self.llm.retry.clone())
    }
}

fn parse_env_value<T: std::str::FromStr>(value: &str, key: &str) -> Result<T, ConfigError> {
    value.trim().parse().map_err(|_| ConfigError::BadEnvValue {
        name: key.to_string(),
        reason: format!("could not parse '{}'", value),
    })
}

fn parse_env_bool(value: &str, key: &str) -> Result<bool, ConfigError> {
    match value.trim().to_lowercase().as_str() {
        "true" | "1" | "yes" | "on" => Ok(true),
        "false" | "0" | "no" | "off" => Ok(false),
        _ => Err(ConfigError::BadEnvValue {
            name: key.to_string(),
            reason: format!("expected boolean value, got '{}'", value),
        }),
    }
}
