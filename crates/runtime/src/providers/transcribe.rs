//! Audio transcription via Deepgram

use async_trait::async_trait;
use std::time::Duration;

use crate::retry::{with_backoff, RetryPolicy};
use crate::types::ProviderError;

/// Transcription capability.
#[async_trait]
pub trait Transcriber: Send + Sync {
    /// Transcribe raw audio bytes of the given MIME type.
    async fn transcribe(&self, audio: &[u8], mime_type: &str) -> Result<String, ProviderError>;
}

/// Deepgram pre-recorded transcription client.
pub struct DeepgramClient {
    client: reqwest::Client,
    api_key: String,
    base_url: String,
    retry: RetryPolicy,
}

impl DeepgramClient {
    pub fn new(api_key: String) -> Self {
        Self::with_base_url(api_key, "https://api.deepgram.com".to_string())
    }

    pub fn with_base_url(api_key: String, base_url: String) -> Self {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(120))
            .build()
            .expect("failed to build reqwest client");
        Self {
            client,
            api_key,
            base_url: base_url.trim_end_matches('/').to_string(),
            retry: RetryPolicy::default(),
        }
    }

    async fn request_once(&self, audio: &[u8], mime_type: &str) -> Result<String, ProviderError> {
        let url = format!("{}/v1/listen?smart_format=true", self.base_url);
        let response = self
            .client
            .post(&url)
            .header("Authorization", format!("Token {}", self.api_key))
            .header("Content-Type", mime_type)
            .body(audio.to_vec())
            .send()
            .await
            .map_err(|e| ProviderError::RequestFailed {
                name: "deepgram".to_string(),
                reason: e.to_string(),
            })?;

        if !response.status().is_success() {
            return Err(super::error_from_response("deepgram", response).await);
        }

        let json: serde_json::Value =
            response
                .json()
                .await
                .map_err(|e| ProviderError::RequestFailed {
                    name: "deepgram".to_string(),
                    reason: format!("malformed response: {e}"),
                })?;

        json.pointer("/results/channels/0/alternatives/0/transcript")
            .and_then(|v| v.as_str())
            .map(str::to_string)
            .ok_or_else(|| ProviderError::RequestFailed {
                name: "deepgram".to_string(),
                reason: "no transcript in response".to_string(),
            })
    }
}

#[async_trait]
impl Transcriber for DeepgramClient {
    async fn transcribe(&self, audio: &[u8], mime_type: &str) -> Result<String, ProviderError> {
        with_backoff(self.retry, || self.request_once(audio, mime_type)).await
    }
}
