//! AI Content Gateway — validates a prompt, calls the provider with bounded
//! retries and exponential backoff, and hands back text or a normalized error.
//!
//! The gateway never panics and never surfaces a provider error type to callers;
//! every outcome is a `Result<String, GatewayError>`.

use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use super::{GenerativeProvider, ProviderError};

pub const MISSING_PROMPT_MESSAGE: &str = "Missing prompt";
pub const DEFAULT_MAX_RETRIES: u32 = 3;
pub const DEFAULT_BACKOFF_BASE: Duration = Duration::from_millis(1000);

const UNKNOWN_ERROR_MESSAGE: &str = "Unknown error occurred";

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum GatewayError {
    #[error("Missing prompt")]
    MissingPrompt,

    #[error("API key not configured")]
    ApiKeyNotConfigured,

    /// Every attempt failed; carries the last failure's message.
    #[error("{message}")]
    Exhausted { attempts: u32, message: String },

    #[error("Maximum retries exceeded")]
    MaxRetriesExceeded,

    #[error("Generation cancelled")]
    Cancelled,
}

/// `{ text, error? }` shape handed to non-HTTP collaborators.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct GenerationResult {
    pub text: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl From<Result<String, GatewayError>> for GenerationResult {
    fn from(result: Result<String, GatewayError>) -> Self {
        match result {
            Ok(text) => Self { text, error: None },
            Err(e) => Self {
                text: String::new(),
                error: Some(e.to_string()),
            },
        }
    }
}

pub struct AiGateway {
    provider: Arc<dyn GenerativeProvider>,
    retries: u32,
    backoff_base: Duration,
}

impl AiGateway {
    pub fn new(provider: Arc<dyn GenerativeProvider>, retries: u32, backoff_base: Duration) -> Self {
        Self {
            provider,
            retries,
            backoff_base,
        }
    }

    /// Entry point for in-process callers that want the flat `{ text, error? }`
    /// shape and no cancellation.
    #[allow(dead_code)]
    pub async fn generate_content(&self, prompt: &str) -> GenerationResult {
        self.generate(prompt, &CancellationToken::new()).await.into()
    }

    /// Generates text for `prompt`, retrying transient failures.
    ///
    /// Attempt `n` (zero-indexed) that fails and is not the last is followed by
    /// a `2^n * backoff_base` wait. Cancelling `cancel` aborts either an
    /// in-flight provider call or a pending backoff.
    pub async fn generate(
        &self,
        prompt: &str,
        cancel: &CancellationToken,
    ) -> Result<String, GatewayError> {
        if prompt.trim().is_empty() {
            return Err(GatewayError::MissingPrompt);
        }
        if !self.provider.is_configured() {
            return Err(GatewayError::ApiKeyNotConfigured);
        }

        for attempt in 0..self.retries {
            let outcome = tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(GatewayError::Cancelled),
                result = self.attempt(prompt) => result,
            };

            let err = match outcome {
                Ok(text) => {
                    debug!(attempt = attempt + 1, "AI generation succeeded");
                    return Ok(text);
                }
                Err(err) => err,
            };

            warn!(attempt = attempt + 1, error = %err, "AI generation attempt failed");

            if attempt + 1 >= self.retries {
                return Err(GatewayError::Exhausted {
                    attempts: self.retries,
                    message: failure_message(&err),
                });
            }

            let delay = self.backoff_delay(attempt);
            tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(GatewayError::Cancelled),
                _ = tokio::time::sleep(delay) => {}
            }
        }

        // Only reachable with a zero retry budget.
        Err(GatewayError::MaxRetriesExceeded)
    }

    async fn attempt(&self, prompt: &str) -> Result<String, ProviderError> {
        let text = self.provider.generate(prompt).await?;
        if text.trim().is_empty() {
            return Err(ProviderError::EmptyContent);
        }
        Ok(text)
    }

    fn backoff_delay(&self, attempt: u32) -> Duration {
        self.backoff_base
            .saturating_mul(2u32.saturating_pow(attempt))
    }
}

fn failure_message(err: &ProviderError) -> String {
    let message = err.to_string();
    if message.trim().is_empty() {
        UNKNOWN_ERROR_MESSAGE.to_string()
    } else {
        message
    }
}
