//! Tool execution via Composio

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::retry::{with_backoff, RetryPolicy};
use crate::types::ProviderError;

/// A remotely executable action.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolAction {
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub app_name: Option<String>,
}

/// Tool execution capability: list and execute.
#[async_trait]
pub trait ToolExecutor: Send + Sync {
    async fn list_actions(&self) -> Result<Vec<ToolAction>, ProviderError>;
    async fn execute(
        &self,
        action: &str,
        params: serde_json::Value,
    ) -> Result<serde_json::Value, ProviderError>;
}

/// HTTP client for Composio's action API.
pub struct ComposioClient {
    client: reqwest::Client,
    api_key: String,
    base_url: String,
    retry: RetryPolicy,
}

impl ComposioClient {
    pub fn new(api_key: String) -> Self {
        Self::with_base_url(api_key, "https://backend.composio.dev".to_string())
    }

    pub fn with_base_url(api_key: String, base_url: String) -> Self {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(60))
            .build()
            .expect("failed to build reqwest client");
        Self {
            client,
            api_key,
            base_url: base_url.trim_end_matches('/').to_string(),
            retry: RetryPolicy::default(),
        }
    }

    async fn send(
        &self,
        request: reqwest::RequestBuilder,
    ) -> Result<serde_json::Value, ProviderError> {
        let response = request
            .header("x-api-key", &self.api_key)
            .send()
            .await
            .map_err(|e| ProviderError::RequestFailed {
                name: "composio".to_string(),
                reason: e.to_string(),
            })?;

        if !response.status().is_success() {
            return Err(super::error_from_response("composio", response).await);
        }

        response
            .json()
            .await
            .map_err(|e| ProviderError::RequestFailed {
                name: "composio".to_string(),
                reason: format!("malformed response: {e}"),
            })
    }
}

#[async_trait]
impl ToolExecutor for ComposioClient {
    async fn list_actions(&self) -> Result<Vec<ToolAction>, ProviderError> {
        let url = format!("{}/api/v2/actions", self.base_url);
        let json = with_backoff(self.retry, || self.send(self.client.get(&url))).await?;

        let items = json
            .get("items")
            .or_else(|| json.get("actions"))
            .and_then(|v| v.as_array())
            .cloned()
            .unwrap_or_default();

        Ok(items
            .iter()
            .filter_map(|item| {
                Some(ToolAction {
                    name: item.get("name")?.as_str()?.to_string(),
                    description: item
                        .get("description")
                        .and_then(|v| v.as_str())
                        .unwrap_or_default()
                        .to_string(),
                    app_name: item
                        .get("appName")
                        .and_then(|v| v.as_str())
                        .map(str::to_string),
                })
            })
            .collect())
    }

    async fn execute(
        &self,
        action: &str,
        params: serde_json::Value,
    ) -> Result<serde_json::Value, ProviderError> {
        let url = format!("{}/api/v2/actions/{}/execute", self.base_url, action);
        let body = serde_json::json!({ "input": params });
        with_backoff(self.retry, || {
            self.send(self.client.post(&url).json(&body))
        })
        .await
    }
}
