//! Web scraping via a Crawl4AI service

use async_trait::async_trait;
use std::time::Duration;

use crate::retry::{with_backoff, RetryPolicy};
use crate::types::ProviderError;

/// Scrape capability: URL in, markdown out.
#[async_trait]
pub trait Scraper: Send + Sync {
    async fn scrape(&self, url: &str) -> Result<String, ProviderError>;
}

/// Client for a Crawl4AI-compatible scrape service.
pub struct Crawl4AiClient {
    client: reqwest::Client,
    base_url: String,
    retry: RetryPolicy,
}

impl Crawl4AiClient {
    pub fn new(base_url: String) -> Self {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(60))
            .build()
            .expect("failed to build reqwest client");
        Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            retry: RetryPolicy::default(),
        }
    }

    async fn request_once(&self, url: &str) -> Result<String, ProviderError> {
        let endpoint = format!("{}/crawl", self.base_url);
        let response = self
            .client
            .post(&endpoint)
            .json(&serde_json::json!({ "urls": [url], "output_format": "markdown" }))
            .send()
            .await
            .map_err(|e| ProviderError::RequestFailed {
                name: "crawl4ai".to_string(),
                reason: e.to_string(),
            })?;

        if !response.status().is_success() {
            return Err(super::error_from_response("crawl4ai", response).await);
        }

        let json: serde_json::Value =
            response
                .json()
                .await
                .map_err(|e| ProviderError::RequestFailed {
                    name: "crawl4ai".to_string(),
                    reason: format!("malformed response: {e}"),
                })?;

        json.pointer("/results/0/markdown")
            .or_else(|| json.get("markdown"))
            .and_then(|v| v.as_str())
            .map(str::to_string)
            .ok_or_else(|| ProviderError::RequestFailed {
                name: "crawl4ai".to_string(),
                reason: "no markdown in response".to_string(),
            })
    }
}

#[async_trait]
impl Scraper for Crawl4AiClient {
    async fn scrape(&self, url: &str) -> Result<String, ProviderError> {
        with_backoff(self.retry, || self.request_once(url)).await
    }
}
