//! Long-term memory capability (Mem0 / Zep)

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::retry::{with_backoff, RetryPolicy};
use crate::types::ProviderError;

/// A stored memory.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MemoryRecord {
    pub id: String,
    pub user_id: String,
    pub content: String,
    #[serde(default)]
    pub score: Option<f64>,
}

/// Memory capability: add / search / get-all / delete.
#[async_trait]
pub trait MemoryStore: Send + Sync {
    async fn add(&self, user_id: &str, content: &str) -> Result<MemoryRecord, ProviderError>;
    async fn search(
        &self,
        user_id: &str,
        query: &str,
        limit: usize,
    ) -> Result<Vec<MemoryRecord>, ProviderError>;
    async fn get_all(&self, user_id: &str) -> Result<Vec<MemoryRecord>, ProviderError>;
    async fn delete(&self, memory_id: &str) -> Result<bool, ProviderError>;
}

/// Which hosted backend the client talks to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MemoryBackend {
    Mem0,
    Zep,
}

/// HTTP client for a hosted memory service.
pub struct MemoryClient {
    client: reqwest::Client,
    api_key: String,
    base_url: String,
    backend: MemoryBackend,
    retry: RetryPolicy,
}

impl MemoryClient {
    pub fn mem0(api_key: String) -> Self {
        Self::with_backend(api_key, "https://api.mem0.ai".to_string(), MemoryBackend::Mem0)
    }

    pub fn zep(api_key: String) -> Self {
        Self::with_backend(api_key, "https://api.getzep.com".to_string(), MemoryBackend::Zep)
    }

    pub fn with_backend(api_key: String, base_url: String, backend: MemoryBackend) -> Self {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .expect("failed to build reqwest client");
        Self {
            client,
            api_key,
            base_url: base_url.trim_end_matches('/').to_string(),
            backend,
            retry: RetryPolicy::default(),
        }
    }

    fn provider_name(&self) -> &'static str {
        match self.backend {
            MemoryBackend::Mem0 => "mem0",
            MemoryBackend::Zep => "zep",
        }
    }

    async fn send_json(
        &self,
        request: reqwest::RequestBuilder,
    ) -> Result<serde_json::Value, ProviderError> {
        let response = request
            .header("Authorization", format!("Bearer {}", self.api_key))
            .send()
            .await
            .map_err(|e| ProviderError::RequestFailed {
                name: self.provider_name().to_string(),
                reason: e.to_string(),
            })?;

        if !response.status().is_success() {
            return Err(super::error_from_response(self.provider_name(), response).await);
        }

        response
            .json()
            .await
            .map_err(|e| ProviderError::RequestFailed {
                name: self.provider_name().to_string(),
                reason: format!("malformed response: {e}"),
            })
    }

    fn records_from(&self, json: &serde_json::Value, user_id: &str) -> Vec<MemoryRecord> {
        let items = json
            .get("results")
            .or_else(|| json.get("memories"))
            .and_then(|v| v.as_array())
            .cloned()
            .unwrap_or_default();
        items
            .iter()
            .filter_map(|item| {
                Some(MemoryRecord {
                    id: item.get("id")?.as_str()?.to_string(),
                    user_id: user_id.to_string(),
                    content: item
                        .get("memory")
                        .or_else(|| item.get("content"))?
                        .as_str()?
                        .to_string(),
                    score: item.get("score").and_then(|v| v.as_f64()),
                })
            })
            .collect()
    }
}

#[async_trait]
impl MemoryStore for MemoryClient {
    async fn add(&self, user_id: &str, content: &str) -> Result<MemoryRecord, ProviderError> {
        let body = serde_json::json!({
            "messages": [{ "role": "user", "content": content }],
            "user_id": user_id,
        });
        let json = with_backoff(self.retry, || {
            self.send_json(
                self.client
                    .post(format!("{}/v1/memories/", self.base_url))
                    .json(&body),
            )
        })
        .await?;

        let id = json
            .pointer("/results/0/id")
            .or_else(|| json.get("id"))
            .and_then(|v| v.as_str())
            .unwrap_or_default()
            .to_string();
        Ok(MemoryRecord {
            id,
            user_id: user_id.to_string(),
            content: content.to_string(),
            score: None,
        })
    }

    async fn search(
        &self,
        user_id: &str,
        query: &str,
        limit: usize,
    ) -> Result<Vec<MemoryRecord>, ProviderError> {
        let body = serde_json::json!({
            "query": query,
            "user_id": user_id,
            "limit": limit,
        });
        let json = with_backoff(self.retry, || {
            self.send_json(
                self.client
                    .post(format!("{}/v1/memories/search/", self.base_url))
                    .json(&body),
            )
        })
        .await?;
        Ok(self.records_from(&json, user_id))
    }

    async fn get_all(&self, user_id: &str) -> Result<Vec<MemoryRecord>, ProviderError> {
        let url = format!("{}/v1/memories/?user_id={}", self.base_url, user_id);
        let json = with_backoff(self.retry, || self.send_json(self.client.get(&url))).await?;
        Ok(self.records_from(&json, user_id))
    }

    async fn delete(&self, memory_id: &str) -> Result<bool, ProviderError> {
        let url = format!("{}/v1/memories/{}/", self.base_url, memory_id);
        match with_backoff(self.retry, || self.send_json(self.client.delete(&url))).await {
            Ok(_) => Ok(true),
            Err(ProviderError::ClientError { status: 404, .. }) => Ok(false),
            Err(e) => Err(e),
        }
    }
}
