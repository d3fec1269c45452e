//! Document parsing and OCR via an external parse service
//!
//! PDF/DOCX extraction and image OCR go through one HTTP service. OCR is
//! tiered: the semantic vision model is preferred, the local OCR engine is
//! the fallback when enabled.

use async_trait::async_trait;
use base64::Engine as _;
use std::time::Duration;

use crate::retry::{with_backoff, RetryPolicy};
use crate::types::ProviderError;

/// Parse capability for binary documents and images.
#[async_trait]
pub trait DocumentParser: Send + Sync {
    /// Extract text from a PDF or DOCX body.
    async fn parse_document(&self, body: &[u8], mime_type: &str) -> Result<String, ProviderError>;

    /// OCR an image, trying the vision model first and the local engine as
    /// fallback.
    async fn ocr_image(&self, image: &[u8], mime_type: &str) -> Result<String, ProviderError>;
}

/// HTTP client for the parse service.
pub struct HttpDocumentParser {
    client: reqwest::Client,
    base_url: String,
    vision_model: Option<String>,
    local_ocr_enabled: bool,
    retry: RetryPolicy,
}

impl HttpDocumentParser {
    pub fn new(base_url: String, vision_model: Option<String>, local_ocr_enabled: bool) -> Self {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(120))
            .build()
            .expect("failed to build reqwest client");
        Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            vision_model,
            local_ocr_enabled,
            retry: RetryPolicy::default(),
        }
    }

    async fn post_extract(
        &self,
        path: &str,
        body: serde_json::Value,
    ) -> Result<String, ProviderError> {
        let url = format!("{}{}", self.base_url, path);
        let response = self
            .client
            .post(&url)
            .json(&body)
            .send()
            .await
            .map_err(|e| ProviderError::RequestFailed {
                name: "docparse".to_string(),
                reason: e.to_string(),
            })?;

        if !response.status().is_success() {
            return Err(super::error_from_response("docparse", response).await);
        }

        let json: serde_json::Value =
            response
                .json()
                .await
                .map_err(|e| ProviderError::RequestFailed {
                    name: "docparse".to_string(),
                    reason: format!("malformed response: {e}"),
                })?;

        json.get("text")
            .and_then(|v| v.as_str())
            .map(str::to_string)
            .ok_or_else(|| ProviderError::RequestFailed {
                name: "docparse".to_string(),
                reason: "no text in response".to_string(),
            })
    }
}

#[async_trait]
impl DocumentParser for HttpDocumentParser {
    async fn parse_document(&self, body: &[u8], mime_type: &str) -> Result<String, ProviderError> {
        let encoded = base64::engine::general_purpose::STANDARD.encode(body);
        let payload = serde_json::json!({
            "content": encoded,
            "mime_type": mime_type,
        });
        with_backoff(self.retry, || self.post_extract("/parse", payload.clone())).await
    }

    async fn ocr_image(&self, image: &[u8], mime_type: &str) -> Result<String, ProviderError> {
        let encoded = base64::engine::general_purpose::STANDARD.encode(image);

        if let Some(model) = &self.vision_model {
            let payload = serde_json::json!({
                "content": encoded,
                "mime_type": mime_type,
                "model": model,
            });
            match with_backoff(self.retry, || self.post_extract("/ocr/vision", payload.clone()))
                .await
            {
                Ok(text) => return Ok(text),
                Err(e) if self.local_ocr_enabled => {
                    tracing::warn!(error = %e, "vision OCR failed, falling back to local engine");
                }
                Err(e) => return Err(e),
            }
        }

        if self.local_ocr_enabled {
            let payload = serde_json::json!({
                "content": encoded,
                "mime_type": mime_type,
            });
            return with_backoff(self.retry, || self.post_extract("/ocr/local", payload.clone()))
                .await;
        }

        Err(ProviderError::Unconfigured {
            name: "ocr".to_string(),
        })
    }
}
