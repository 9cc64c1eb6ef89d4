//! LLM client abstraction
//!
//! The wire protocol lives with the embedding application; the workflow
//! engine only sees the `LlmClient` trait. Completion failures are
//! classified here because the split decides workflow routing: transient
//! failures are retried and ultimately suspend the story for resume,
//! refusals kill it.

mod types;

pub use types::{
    ContentBlock, LlmMessage, LlmRequest, LlmResponse, MessageRole, SystemContent, ToolDefinition,
    Usage,
};

use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

/// Why a completion failed
#[derive(Debug, Error)]
pub enum LlmError {
    /// The service could not be reached (connect failure, timeout)
    #[error("llm unreachable: {0}")]
    Unreachable(String),
    /// The service shed load; may carry a server-suggested delay
    #[error("llm throttled: {message}")]
    Throttled {
        message: String,
        retry_after: Option<Duration>,
    },
    /// The service failed internally
    #[error("llm backend failure: {0}")]
    Backend(String),
    /// The service refused the request (bad credentials, malformed
    /// input); retrying cannot help
    #[error("llm refused the request: {0}")]
    Refused(String),
}

impl LlmError {
    pub fn unreachable(message: impl Into<String>) -> Self {
        LlmError::Unreachable(message.into())
    }

    pub fn throttled(message: impl Into<String>, retry_after: Option<Duration>) -> Self {
        LlmError::Throttled {
            message: message.into(),
            retry_after,
        }
    }

    pub fn backend(message: impl Into<String>) -> Self {
        LlmError::Backend(message.into())
    }

    pub fn refused(message: impl Into<String>) -> Self {
        LlmError::Refused(message.into())
    }

    /// Transient failures are worth retrying, and suspend the workflow
    /// once retries run out; refusals are fatal for the story.
    pub fn is_transient(&self) -> bool {
        !matches!(self, LlmError::Refused(_))
    }

    fn suggested_delay(&self) -> Option<Duration> {
        match self {
            LlmError::Throttled { retry_after, .. } => *retry_after,
            _ => None,
        }
    }
}

/// Client for making LLM requests
#[async_trait]
pub trait LlmClient: Send + Sync {
    /// Complete an LLM request
    async fn complete(&self, request: &LlmRequest) -> Result<LlmResponse, LlmError>;

    /// Get the model ID
    fn model_id(&self) -> &str;
}

#[async_trait]
impl<T: LlmClient + ?Sized> LlmClient for Arc<T> {
    async fn complete(&self, request: &LlmRequest) -> Result<LlmResponse, LlmError> {
        (**self).complete(request).await
    }

    fn model_id(&self) -> &str {
        (**self).model_id()
    }
}

/// Retry attempts for transient completion failures
const MAX_RETRY_ATTEMPTS: u32 = 3;

fn retry_delay(attempt: u32) -> Duration {
    // Exponential backoff: 1s, 2s, 4s
    Duration::from_secs(1 << (attempt - 1))
}

/// Complete a request, retrying transient failures with backoff.
///
/// A throttled response's suggested delay wins over the backoff curve;
/// refusals are returned immediately.
pub async fn complete_with_retry(
    llm: &dyn LlmClient,
    request: &LlmRequest,
) -> Result<LlmResponse, LlmError> {
    let mut attempt = 1;
    loop {
        match llm.complete(request).await {
            Ok(response) => return Ok(response),
            Err(e) if e.is_transient() && attempt < MAX_RETRY_ATTEMPTS => {
                let delay = e.suggested_delay().unwrap_or_else(|| retry_delay(attempt));
                tracing::warn!(
                    attempt,
                    error = %e,
                    delay_ms = delay.as_millis() as u64,
                    "LLM request failed, retrying"
                );
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
            Err(e) => return Err(e),
        }
    }
}
