//! Bounded retry with exponential backoff for generation-backend calls.
//!
//! Transport retries are independent of the builder's round budget: a call
//! that succeeds on its third attempt still counts as a single turn.

use serde::{Deserialize, Serialize};
use std::future::Future;
use std::time::Duration;

use crate::error::LlmError;

/// Maximum number of retry attempts for transient failures.
pub const DEFAULT_MAX_RETRIES: u32 = 3;

/// Base delay for exponential backoff in milliseconds.
pub const DEFAULT_BASE_DELAY_MS: u64 = 1000;

/// Upper bound on a single backoff sleep.
const MAX_DELAY_MS: u64 = 30_000;

/// Per-call timeout in seconds.
pub const DEFAULT_CALL_TIMEOUT_SECS: u64 = 180;

/// Retry policy applied around each generation call.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct RetryPolicy {
    /// Retries after the first attempt (total attempts = max_retries + 1).
    pub max_retries: u32,
    /// Delay before the first retry; doubles on each subsequent retry.
    pub base_delay_ms: u64,
    /// Wall-clock limit for one attempt.
    pub call_timeout_secs: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: DEFAULT_MAX_RETRIES,
            base_delay_ms: DEFAULT_BASE_DELAY_MS,
            call_timeout_secs: DEFAULT_CALL_TIMEOUT_SECS,
        }
    }
}

impl RetryPolicy {
    /// Backoff before retry number `retry` (1-based): base, 2*base, 4*base, ...
    pub fn delay_for(&self, retry: u32) -> Duration {
        let shift = retry.saturating_sub(1).min(16);
        let delay = self.base_delay_ms.saturating_mul(1u64 << shift);
        Duration::from_millis(delay.min(MAX_DELAY_MS))
    }

    /// Run `op` until it succeeds, fails permanently, or the policy gives up.
    pub async fn run<T, F, Fut>(&self, mut op: F) -> Result<T, LlmError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, LlmError>>,
    {
        let attempts = self.max_retries + 1;
        let call_timeout = Duration::from_secs(self.call_timeout_secs);
        let mut last_error: Option<LlmError> = None;

        for attempt in 0..attempts {
            if attempt > 0 {
                let delay = self.delay_for(attempt);
                tracing::debug!(
                    attempt = attempt + 1,
                    delay_ms = delay.as_millis() as u64,
                    "Retrying generation call after transient failure"
                );
                tokio::time::sleep(delay).await;
            }

            let result = match tokio::time::timeout(call_timeout, op()).await {
                Ok(result) => result,
                Err(_) => Err(LlmError::Timeout {
                    seconds: self.call_timeout_secs,
                }),
            };

            match result {
                Ok(value) => return Ok(value),
                Err(err) if is_transient_error(&err) => {
                    tracing::warn!(
                        attempt = attempt + 1,
                        max_attempts = attempts,
                        error = %err,
                        "Transient generation error"
                    );
                    last_error = Some(err);
                }
                Err(err) => return Err(err),
            }
        }

        Err(LlmError::RetriesExhausted {
            attempts,
            last: last_error
                .map(|e| e.to_string())
                .unwrap_or_else(|| "no error captured".to_string()),
        })
    }
}

/// Check if an error is transient and should be retried.
pub fn is_transient_error(error: &LlmError) -> bool {
    match error {
        LlmError::RequestFailed(msg) => {
            let lower = msg.to_lowercase();
            lower.contains("timeout")
                || lower.contains("timed out")
                || lower.contains("connection")
                || lower.contains("temporarily")
        }
        LlmError::RateLimited(_) | LlmError::Timeout { .. } | LlmError::EmptyCompletion(_) => {
            true
        }
        LlmError::ApiError { code, .. } => *code >= 500 || *code == 429,
        _ => false,
    }
}
