//! Generation client used by the agent roles.
//!
//! Wraps an [`LlmProvider`] with the configured model, sampling parameters and
//! the transport [`RetryPolicy`]. One call here is one conversational turn.

use std::sync::Arc;

use super::litellm::{GenerationRequest, LlmProvider, Message, Usage};
use super::retry::RetryPolicy;
use crate::error::LlmError;

/// Text of one completion plus the tokens it cost.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Completion {
    pub text: String,
    pub usage: Usage,
}

/// Retrying, model-bound handle to a generation backend.
#[derive(Clone)]
pub struct GenerationClient {
    provider: Arc<dyn LlmProvider>,
    model: String,
    temperature: Option<f64>,
    max_tokens: Option<u32>,
    retry: RetryPolicy,
}

impl GenerationClient {
    pub fn new(provider: Arc<dyn LlmProvider>, model: impl Into<String>) -> Self {
        Self {
            provider,
            model: model.into(),
            temperature: Some(0.2),
            max_tokens: Some(4096),
            retry: RetryPolicy::default(),
        }
    }

    pub fn with_temperature(mut self, temperature: f64) -> Self {
        self.temperature = Some(temperature);
        self
    }

    pub fn with_max_tokens(mut self, max_tokens: u32) -> Self {
        self.max_tokens = Some(max_tokens);
        self
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn model(&self) -> &str {
        &self.model
    }

    /// Send the transcript (system prompt first) and return the first choice.
    ///
    /// Transient transport failures are retried according to the policy;
    /// an empty completion is treated as transient as well.
    pub async fn complete(&self, messages: &[Message]) -> Result<Completion, LlmError> {
        self.retry
            .run(|| {
                let mut request = GenerationRequest::new(self.model.clone(), messages.to_vec());
                if let Some(t) = self.temperature {
                    request = request.with_temperature(t);
                }
                if let Some(m) = self.max_tokens {
                    request = request.with_max_tokens(m);
                }
                let provider = self.provider.clone();
                let model = self.model.clone();
                async move {
                    let response = provider.generate(request).await?;
                    let text = response.first_content().unwrap_or_default().to_string();
                    if text.trim().is_empty() {
                        return Err(LlmError::EmptyCompletion(model));
                    }
                    Ok(Completion {
                        text,
                        usage: response.usage,
                    })
                }
            })
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::{Choice, GenerationResponse};
    use async_trait::async_trait;
    use std::sync::Mutex;

    struct Scripted {
        replies: Mutex<Vec<Result<String, LlmError>>>,
        seen: Mutex<Vec<GenerationRequest>>,
    }

    #[async_trait]
    impl LlmProvider for Scripted {
        async fn generate(
            &self,
            request: GenerationRequest,
        ) -> Result<GenerationResponse, LlmError> {
            self.seen.lock().unwrap().push(request);
            let next = self.replies.lock().unwrap().remove(0)?;
            Ok(GenerationResponse {
                id: "r".into(),
                model: "m".into(),
                choices: vec![Choice {
                    index: 0,
                    message: Message::assistant(next),
                    finish_reason: "stop".into(),
                }],
                usage: Usage {
                    prompt_tokens: 3,
                    completion_tokens: 2,
                    total_tokens: 5,
                },
            })
        }
    }

    fn fast() -> RetryPolicy {
        RetryPolicy {
            max_retries: 2,
            base_delay_ms: 1,
            call_timeout_secs: 5,
        }
    }

    #[tokio::test]
    async fn test_complete_passes_model_and_params() {
        let provider = Arc::new(Scripted {
            replies: Mutex::new(vec![Ok("hello".into())]),
            seen: Mutex::new(vec![]),
        });
        let client = GenerationClient::new(provider.clone(), "test/model")
            .with_temperature(0.5)
            .with_max_tokens(100)
            .with_retry(fast());

        let out = client
            .complete(&[Message::system("sys"), Message::user("hi")])
            .await
            .unwrap();
        assert_eq!(out.text, "hello");
        assert_eq!(out.usage.total_tokens, 5);

        let seen = provider.seen.lock().unwrap();
        assert_eq!(seen[0].model, "test/model");
        assert_eq!(seen[0].temperature, Some(0.5));
        assert_eq!(seen[0].max_tokens, Some(100));
        assert_eq!(seen[0].messages.len(), 2);
    }

    #[tokio::test]
    async fn test_empty_completion_is_retried() {
        let provider = Arc::new(Scripted {
            replies: Mutex::new(vec![Ok("   ".into()), Ok("second".into())]),
            seen: Mutex::new(vec![]),
        });
        let client = GenerationClient::new(provider.clone(), "m").with_retry(fast());
        let out = client.complete(&[Message::user("x")]).await.unwrap();
        assert_eq!(out.text, "second");
        assert_eq!(provider.seen.lock().unwrap().len(), 2);
    }
}
