//! OpenRouter provider.
//!
//! OpenRouter exposes many model vendors behind one OpenAI-compatible
//! endpoint, which makes it the default backend for the agent roles.

use async_trait::async_trait;
use reqwest::Client;

use crate::error::LlmError;
use crate::llm::litellm::{build_http_client, post_chat_completion, ApiRequest, DEFAULT_MODEL};
use crate::llm::{GenerationRequest, GenerationResponse, LlmProvider};

pub const OPENROUTER_BASE_URL: &str = "https://openrouter.ai/api/v1";

pub struct OpenRouterProvider {
    client: Client,
    api_key: String,
    base_url: String,
    default_model: String,
}

impl OpenRouterProvider {
    pub fn new(api_key: String) -> Result<Self, LlmError> {
        Self::with_model(api_key, DEFAULT_MODEL.to_string())
    }

    pub fn with_model(api_key: String, model: String) -> Result<Self, LlmError> {
        Self::with_custom_url(api_key, OPENROUTER_BASE_URL.to_string(), model)
    }

    /// Point at an OpenRouter-compatible gateway instead of the public API.
    pub fn with_custom_url(
        api_key: String,
        base_url: String,
        model: String,
    ) -> Result<Self, LlmError> {
        if api_key.trim().is_empty() {
            return Err(LlmError::MissingApiKey);
        }
        Ok(Self {
            client: build_http_client()?,
            api_key,
            base_url: base_url.trim_end_matches('/').to_string(),
            default_model: model,
        })
    }

    /// Key with all but the first and last four characters hidden, for logs.
    pub fn api_key_masked(&self) -> String {
        let chars: Vec<char> = self.api_key.chars().collect();
        if chars.len() <= 8 {
            return "*".repeat(chars.len());
        }
        let head: String = chars[..4].iter().collect();
        let tail: String = chars[chars.len() - 4..].iter().collect();
        format!("{}...{}", head, tail)
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    pub fn default_model(&self) -> &str {
        &self.default_model
    }
}

#[async_trait]
impl LlmProvider for OpenRouterProvider {
    async fn generate(&self, request: GenerationRequest) -> Result<GenerationResponse, LlmError> {
        let api_request = ApiRequest::from_request(request, &self.default_model);
        let url = format!("{}/chat/completions", self.base_url);
        post_chat_completion(&self.client, &url, Some(&self.api_key), &api_request).await
    }
}
