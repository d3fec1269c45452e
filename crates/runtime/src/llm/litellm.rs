//! OpenAI-compatible client for the LiteLLM proxy

use async_trait::async_trait;
use std::time::Duration;

use super::{ChatOutput, LlmClient};
use crate::retry::{with_backoff, RetryPolicy};
use crate::types::LlmError;

/// Client for a LiteLLM proxy exposing the OpenAI wire format.
pub struct LiteLlmClient {
    client: reqwest::Client,
    base_url: String,
    api_key: Option<String>,
    retry: RetryPolicy,
}

impl LiteLlmClient {
    pub fn new(base_url: String, api_key: Option<String>) -> Self {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(120))
            .build()
            .expect("failed to build reqwest client");
        Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            api_key,
            retry: RetryPolicy::default(),
        }
    }

    async fn post_json(
        &self,
        path: &str,
        body: &serde_json::Value,
    ) -> Result<serde_json::Value, LlmError> {
        let url = format!("{}{}", self.base_url, path);
        let mut request = self.client.post(&url).json(body);
        if let Some(key) = &self.api_key {
            request = request.bearer_auth(key);
        }

        let response = request
            .send()
            .await
            .map_err(|e| LlmError::RequestFailed(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let body_text = response.text().await.unwrap_or_default();
            return Err(LlmError::ApiError {
                status: status.as_u16(),
                body: body_text,
            });
        }

        response
            .json()
            .await
            .map_err(|e| LlmError::MalformedResponse(e.to_string()))
    }
}

#[async_trait]
impl LlmClient for LiteLlmClient {
    async fn embed_batch(
        &self,
        model: &str,
        texts: &[String],
    ) -> Result<Vec<Vec<f32>>, LlmError> {
        let body = serde_json::json!({
            "model": model,
            "input": texts,
        });

        let json = with_backoff(self.retry, || self.post_json("/embeddings", &body)).await?;

        let data = json
            .get("data")
            .and_then(|v| v.as_array())
            .ok_or_else(|| LlmError::MalformedResponse("missing 'data' field".to_string()))?;

        // Sort by index to ensure correct ordering.
        let mut indexed: Vec<(usize, Vec<f32>)> = data
            .iter()
            .map(|item| {
                let index = item.get("index").and_then(|v| v.as_u64()).unwrap_or(0) as usize;
                let embedding = item
                    .get("embedding")
                    .and_then(|v| v.as_array())
                    .ok_or_else(|| {
                        LlmError::MalformedResponse("missing 'embedding' in item".to_string())
                    })?
                    .iter()
                    .map(|v| {
                        v.as_f64().map(|f| f as f32).ok_or_else(|| {
                            LlmError::MalformedResponse("invalid float in embedding".to_string())
                        })
                    })
                    .collect::<Result<Vec<f32>, _>>()?;
                Ok((index, embedding))
            })
            .collect::<Result<Vec<_>, LlmError>>()?;

        indexed.sort_by_key(|(i, _)| *i);

        if indexed.len() != texts.len() {
            return Err(LlmError::MalformedResponse(format!(
                "expected {} embeddings, got {}",
                texts.len(),
                indexed.len()
            )));
        }

        if let Some(usage) = json.get("usage") {
            tracing::debug!(
                model = %model,
                prompt_tokens = usage.get("prompt_tokens").and_then(|v| v.as_u64()),
                "embedding token usage"
            );
        }

        Ok(indexed.into_iter().map(|(_, emb)| emb).collect())
    }

    async fn chat(&self, model: &str, system: &str, user: &str) -> Result<ChatOutput, LlmError> {
        let body = serde_json::json!({
            "model": model,
            "messages": [
                { "role": "system", "content": system },
                { "role": "user", "content": user }
            ],
            "max_tokens": 4096,
            "temperature": 0.3
        });

        let json = with_backoff(self.retry, || self.post_json("/chat/completions", &body)).await?;

        let content = json
            .get("choices")
            .and_then(|c| c.get(0))
            .and_then(|c| c.get("message"))
            .and_then(|m| m.get("content"))
            .and_then(|c| c.as_str())
            .map(|s| s.to_string())
            .ok_or_else(|| {
                LlmError::MalformedResponse("no content in response choices".to_string())
            })?;

        let usage = json.get("usage");
        let input_tokens = usage
            .and_then(|u| u.get("prompt_tokens"))
            .and_then(|v| v.as_u64())
            .unwrap_or(0) as u32;
        let output_tokens = usage
            .and_then(|u| u.get("completion_tokens"))
            .and_then(|v| v.as_u64())
            .unwrap_or(0) as u32;

        Ok(ChatOutput {
            content,
            input_tokens,
            output_tokens,
        })
    }

    fn backend(&self) -> &'static str {
        "litellm"
    }
}
