//! Deterministic mock LLM client
//!
//! Embeddings are seeded from a SHA-256 of the input text and normalized, so
//! identical texts always map to identical vectors. Used when no proxy is
//! configured and throughout the test suite.

use async_trait::async_trait;
use sha2::{Digest, Sha256};

use super::{ChatOutput, LlmClient};
use crate::types::LlmError;

pub struct MockLlmClient {
    dimension: usize,
}

impl MockLlmClient {
    pub fn new(dimension: usize) -> Self {
        Self { dimension }
    }

    fn embed_one(&self, text: &str) -> Vec<f32> {
        let digest = Sha256::digest(text.as_bytes());
        let mut vector = Vec::with_capacity(self.dimension);
        for i in 0..self.dimension {
            let byte = digest[i % digest.len()];
            let mixed = byte.wrapping_mul((i as u8).wrapping_add(31));
            vector.push((f32::from(mixed) / 127.5) - 1.0);
        }
        let magnitude: f32 = vector.iter().map(|x| x * x).sum::<f32>().sqrt();
        if magnitude > 0.0 {
            for v in &mut vector {
                *v /= magnitude;
            }
        }
        vector
    }
}

#[async_trait]
impl LlmClient for MockLlmClient {
    async fn embed_batch(
        &self,
        _model: &str,
        texts: &[String],
    ) -> Result<Vec<Vec<f32>>, LlmError> {
        Ok(texts.iter().map(|t| self.embed_one(t)).collect())
    }

    async fn chat(&self, model: &str, _system: &str, user: &str) -> Result<ChatOutput, LlmError> {
        let content = serde_json::json!({
            "summary": format!("mock response for {} chars", user.len()),
            "model": model,
        })
        .to_string();
        Ok(ChatOutput {
            input_tokens: super::estimate_tokens(user) as u32,
            output_tokens: super::estimate_tokens(&content) as u32,
            content,
        })
    }

    fn backend(&self) -> &'static str {
        "mock"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn embeddings_are_deterministic_and_normalized() {
        let client = MockLlmClient::new(128);
        let a = client
            .embed_batch("any", &["hello world".to_string()])
            .await
            .unwrap();
        let b = client
            .embed_batch("any", &["hello world".to_string()])
            .await
            .unwrap();
        assert_eq!(a, b);
        assert_eq!(a[0].len(), 128);

        let magnitude: f32 = a[0].iter().map(|x| x * x).sum::<f32>().sqrt();
        assert!((magnitude - 1.0).abs() < 0.01);
    }

    #[tokio::test]
    async fn different_texts_differ() {
        let client = MockLlmClient::new(64);
        let out = client
            .embed_batch("any", &["alpha".to_string(), "beta".to_string()])
            .await
            .unwrap();
        assert_ne!(out[0], out[1]);
    }
}
