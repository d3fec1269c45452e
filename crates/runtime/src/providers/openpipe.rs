//! Fine-tune data logging and job control via OpenPipe

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::retry::{with_backoff, RetryPolicy};
use crate::types::ProviderError;

/// One logged request/response pair for fine-tune capture.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CapturedCall {
    pub messages: Vec<serde_json::Value>,
    pub completion: String,
    #[serde(default)]
    pub tags: std::collections::HashMap<String, String>,
}

/// Status of a fine-tune job.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FineTuneStatus {
    pub job_id: String,
    pub status: String,
    #[serde(default)]
    pub model: Option<String>,
}

/// Fine-tune capability: log training pairs, trigger jobs, poll status.
#[async_trait]
pub trait FineTuner: Send + Sync {
    async fn log(&self, calls: Vec<CapturedCall>) -> Result<usize, ProviderError>;
    async fn trigger(&self, base_model: &str) -> Result<FineTuneStatus, ProviderError>;
    async fn status(&self, job_id: &str) -> Result<FineTuneStatus, ProviderError>;
}

/// HTTP client for the OpenPipe API.
pub struct OpenPipeClient {
    client: reqwest::Client,
    api_key: String,
    base_url: String,
    retry: RetryPolicy,
}

impl OpenPipeClient {
    pub fn new(api_key: String) -> Self {
        Self::with_base_url(api_key, "https://api.openpipe.ai/api/v1".to_string())
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
            .header("Authorization", format!("Bearer {}", self.api_key))
            .send()
            .await
            .map_err(|e| ProviderError::RequestFailed {
                name: "openpipe".to_string(),
                reason: e.to_string(),
            })?;

        if !response.status().is_success() {
            return Err(super::error_from_response("openpipe", response).await);
        }

        response
            .json()
            .await
            .map_err(|e| ProviderError::RequestFailed {
                name: "openpipe".to_string(),
                reason: format!("malformed response: {e}"),
            })
    }
}

#[async_trait]
impl FineTuner for OpenPipeClient {
    async fn log(&self, calls: Vec<CapturedCall>) -> Result<usize, ProviderError> {
        let count = calls.len();
        let url = format!("{}/report", self.base_url);
        let body = serde_json::json!({ "calls": calls });
        with_backoff(self.retry, || self.send(self.client.post(&url).json(&body))).await?;
        Ok(count)
    }

    async fn trigger(&self, base_model: &str) -> Result<FineTuneStatus, ProviderError> {
        let url = format!("{}/finetunes", self.base_url);
        let body = serde_json::json!({ "base_model": base_model });
        let json =
            with_backoff(self.retry, || self.send(self.client.post(&url).json(&body))).await?;
        Ok(FineTuneStatus {
            job_id: json
                .get("id")
                .and_then(|v| v.as_str())
                .unwrap_or_default()
                .to_string(),
            status: json
                .get("status")
                .and_then(|v| v.as_str())
                .unwrap_or("pending")
                .to_string(),
            model: None,
        })
    }

    async fn status(&self, job_id: &str) -> Result<FineTuneStatus, ProviderError> {
        let url = format!("{}/finetunes/{}", self.base_url, job_id);
        let json = with_backoff(self.retry, || self.send(self.client.get(&url))).await?;
        Ok(FineTuneStatus {
            job_id: job_id.to_string(),
            status: json
                .get("status")
                .and_then(|v| v.as_str())
                .unwrap_or("unknown")
                .to_string(),
            model: json
                .get("fine_tuned_model")
                .and_then(|v| v.as_str())
                .map(str::to_string),
        })
    }
}
