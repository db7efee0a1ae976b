//! Text-completion service used for classification fallback and prose generation.
//!
//! The model is a black box behind [`ChatCompletion`]; nothing it returns is
//! trusted without validation by the caller.

pub mod error;
pub mod openrouter;
pub mod types;

use std::time::Duration;

use async_trait::async_trait;
use tokio::time::sleep;
use tracing::warn;

pub use error::{ErrorContext, LlmError};
pub use openrouter::OpenRouterClient;
pub use types::{Completion, CompletionRequest, FinishReason, Message, Role};

#[async_trait]
pub trait ChatCompletion: Send + Sync {
    async fn complete(&self, req: &CompletionRequest) -> Result<Completion, LlmError>;
}

#[derive(Debug, Clone)]
pub struct RetryConfig {
    pub max_retries: u32,
    pub retry_base_delay: Duration,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 2,
            retry_base_delay: Duration::from_millis(500),
        }
    }
}

/// Wraps a client with exponential-backoff retries on retryable errors.
pub struct RetryingClient<C> {
    inner: C,
    config: RetryConfig,
}

impl<C: ChatCompletion> RetryingClient<C> {
    pub fn new(inner: C, config: RetryConfig) -> Self {
        Self { inner, config }
    }
}

#[async_trait]
impl<C: ChatCompletion> ChatCompletion for RetryingClient<C> {
    async fn complete(&self, req: &CompletionRequest) -> Result<Completion, LlmError> {
        let mut attempt = 0;
        loop {
            match self.inner.complete(req).await {
                Ok(resp) => return Ok(resp),
                Err(err) => {
                    if !err.is_retryable() || attempt >= self.config.max_retries {
                        return Err(err);
                    }
                    let delay = backoff_delay(self.config.retry_base_delay, attempt);
                    warn!(code = err.code(), attempt, ?delay, "completion failed, retrying");
                    sleep(delay).await;
                    attempt += 1;
                }
            }
        }
    }
}

fn backoff_delay(base: Duration, attempt: u32) -> Duration {
    let multiplier = 2u32.pow(attempt.min(5));
    base * multiplier
}

/// Extract the first balanced JSON object from model output.
///
/// Models sometimes wrap JSON in prose or code fences.
pub fn extract_json(raw: &str) -> &str {
    let trimmed = raw.trim();
    if let Some(start) = trimmed.find('{') {
        let remainder = &trimmed[start..];
        let mut depth = 0usize;
        let mut in_string = false;
        let mut escaped = false;
        for (i, c) in remainder.char_indices() {
            if in_string {
                match c {
                    '\\' if !escaped => escaped = true,
                    '"' if !escaped => in_string = false,
                    _ => escaped = false,
                }
                continue;
            }
            match c {
                '"' => in_string = true,
                '{' => depth += 1,
                '}' => {
                    depth = depth.saturating_sub(1);
                    if depth == 0 {
                        return &remainder[..=i];
                    }
                }
                _ => {}
            }
        }
    }
    trimmed
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn extract_json_strips_fences_and_prose() {
        let raw = "Sure:\n```json\n{\"category\": \"risk_assessment\", \"note\": \"a } b\"}\n```";
        assert_eq!(
            extract_json(raw),
            "{\"category\": \"risk_assessment\", \"note\": \"a } b\"}"
        );
    }

    #[test]
    fn backoff_doubles() {
        let base = Duration::from_millis(100);
        assert_eq!(backoff_delay(base, 0), Duration::from_millis(100));
        assert_eq!(backoff_delay(base, 2), Duration::from_millis(400));
    }
}
