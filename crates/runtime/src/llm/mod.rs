//! LLM provider access through the LiteLLM proxy
//!
//! All embedding and chat traffic goes through one capability trait so the
//! rest of the runtime never knows which upstream provider answered. When no
//! proxy is configured the runtime falls back to a deterministic mock client
//! (development and tests only).

use async_trait::async_trait;
use std::sync::Arc;

use crate::config::LlmConfig;
use crate::types::LlmError;

pub mod litellm;
pub mod mock;
pub mod routing;

pub use litellm::LiteLlmClient;
pub use mock::MockLlmClient;
pub use routing::{ComplexityTier, ModelRouter};

/// Token usage and content of one chat completion.
#[derive(Debug, Clone)]
pub struct ChatOutput {
    pub content: String,
    pub input_tokens: u32,
    pub output_tokens: u32,
}

/// Unified LLM capability.
#[async_trait]
pub trait LlmClient: Send + Sync {
    /// Generate embeddings for a batch of texts in one upstream call.
    /// The result preserves input order.
    async fn embed_batch(
        &self,
        model: &str,
        texts: &[String],
    ) -> Result<Vec<Vec<f32>>, LlmError>;

    /// Chat completion with a system and a user message.
    async fn chat(&self, model: &str, system: &str, user: &str) -> Result<ChatOutput, LlmError>;

    /// Backend label for health reporting.
    fn backend(&self) -> &'static str;
}

impl crate::retry::Retryable for LlmError {
    fn is_retryable(&self) -> bool {
        match self {
            LlmError::RequestFailed(_) => true,
            LlmError::ApiError { status, .. } => crate::retry::status_is_retryable(*status),
            LlmError::MalformedResponse(_) | LlmError::NotConfigured => false,
        }
    }
}

/// Build the configured client, falling back to the mock when the proxy is
/// not set up.
pub fn create_llm_client(config: &LlmConfig) -> Arc<dyn LlmClient> {
    match &config.proxy_url {
        Some(url) => {
            tracing::info!(url = %url, "Using LiteLLM proxy client");
            Arc::new(LiteLlmClient::new(url.clone(), config.api_key.clone()))
        }
        None => {
            tracing::debug!("No LiteLLM proxy configured, using mock LLM client");
            Arc::new(MockLlmClient::new(384))
        }
    }
}

/// Estimate the token cost of a text (4 chars/token heuristic, rounded up).
pub fn estimate_tokens(text: &str) -> u64 {
    (text.len() as u64).div_ceil(4)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::retry::Retryable;

    #[test]
    fn token_estimate_rounds_up() {
        assert_eq!(estimate_tokens(""), 0);
        assert_eq!(estimate_tokens("abc"), 1);
        assert_eq!(estimate_tokens("abcd"), 1);
        assert_eq!(estimate_tokens("abcde"), 2);
    }

    #[test]
    fn llm_error_retry_classification() {
        assert!(LlmError::RequestFailed("timeout".into()).is_retryable());
        assert!(LlmError::ApiError {
            status: 429,
            body: String::new()
        }
        .is_retryable());
        assert!(!LlmError::ApiError {
            status: 400,
            body: String::new()
        }
        .is_retryable());
        assert!(!LlmError::NotConfigured.is_retryable());
    }

    #[test]
    fn unconfigured_falls_back_to_mock() {
        let client = create_llm_client(&crate::config::LlmConfig::default());
        assert_eq!(client.backend(), "mock");
    }
}
