//! Text embedding providers.
//!
//! The engine consumes [`EmbeddingProvider`]; when none is configured,
//! semantic recall is disabled and records live in the cold store only.

use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::time::Duration;

use crate::error::{Error, Result};
use crate::warm::normalize;

/// Text -> fixed-dimension unit vector.
#[async_trait]
pub trait EmbeddingProvider: Send + Sync {
    /// Embed `text`. The result must have [`Self::dimension`] entries.
    async fn embed(&self, text: &str) -> Result<Vec<f32>>;

    /// Dimension of every vector this provider returns.
    fn dimension(&self) -> usize;
}

/// Deterministic offline embedder.
///
/// Expands the SHA-256 digest of the text into `dim` floats in [-1, 1]
/// (big-endian 4-byte words, cycling through the digest) and normalizes.
/// Identical text always yields an identical vector; unrelated text lands
/// near-orthogonal, so it supports exact recall but carries no semantics.
#[derive(Debug, Clone)]
pub struct HashEmbedder {
    dim: usize,
}

impl HashEmbedder {
    pub fn new(dim: usize) -> Self {
        Self { dim: dim.max(1) }
    }

    /// Compute the vector synchronously.
    pub fn embed_sync(&self, text: &str) -> Vec<f32> {
        let digest = Sha256::digest(text.as_bytes());
        let words = digest.len() / 4;

        let raw: Vec<f32> = (0..self.dim)
            .map(|i| {
                let offset = (i % words) * 4;
                let word = u32::from_be_bytes([
                    digest[offset],
                    digest[offset + 1],
                    digest[offset + 2],
                    digest[offset + 3],
                ]);
                ((word as f64 / u32::MAX as f64) * 2.0 - 1.0) as f32
            })
            .collect();

        let fallback = raw.len();
        normalize(raw).unwrap_or_else(|| {
            let v = 1.0 / (fallback as f32).sqrt();
            vec![v; fallback]
        })
    }
}

impl Default for HashEmbedder {
    fn default() -> Self {
        Self::new(crate::config::DEFAULT_EMBEDDING_DIM)
    }
}

#[async_trait]
impl EmbeddingProvider for HashEmbedder {
    async fn embed(&self, text: &str) -> Result<Vec<f32>> {
        Ok(self.embed_sync(text))
    }

    fn dimension(&self) -> usize {
        self.dim
    }
}

/// Configuration for [`OpenAIEmbedder`].
#[derive(Debug, Clone)]
pub struct OpenAIEmbedderConfig {
    /// API key
    pub api_key: String,
    /// Base URL override
    pub base_url: Option<String>,
    /// Embedding model
    pub model: String,
    /// Expected vector dimension
    pub dimension: usize,
    /// Request timeout in seconds
    pub timeout_secs: u64,
}

impl OpenAIEmbedderConfig {
    pub fn new(api_key: impl Into<String>) -> Self {
        Self {
            api_key: api_key.into(),
            base_url: None,
            model: "text-embedding-3-small".to_string(),
            dimension: 1536,
            timeout_secs: 30,
        }
    }

    pub fn with_base_url(mut self, url: impl Into<String>) -> Self {
        self.base_url = Some(url.into());
        self
    }

    pub fn with_model(mut self, model: impl Into<String>, dimension: usize) -> Self {
        self.model = model.into();
        self.dimension = dimension;
        self
    }

    pub fn with_timeout(mut self, secs: u64) -> Self {
        self.timeout_secs = secs;
        self
    }
}

#[derive(Debug, Serialize)]
struct OpenAIEmbeddingRequest<'a> {
    model: &'a str,
    input: Vec<&'a str>,
}

#[derive(Debug, Deserialize)]
struct OpenAIEmbeddingResponse {
    data: Vec<OpenAIEmbeddingData>,
}

#[derive(Debug, Deserialize)]
struct OpenAIEmbeddingData {
    embedding: Vec<f32>,
}

#[derive(Debug, Deserialize)]
struct OpenAIError {
    error: OpenAIErrorDetail,
}

#[derive(Debug, Deserialize)]
struct OpenAIErrorDetail {
    message: String,
}

/// Embeddings from an OpenAI-compatible `/v1/embeddings` endpoint.
pub struct OpenAIEmbedder {
    config: OpenAIEmbedderConfig,
    http: Client,
}

impl OpenAIEmbedder {
    const DEFAULT_BASE_URL: &'static str = "https://api.openai.com";

    pub fn new(config: OpenAIEmbedderConfig) -> Result<Self> {
        let http = Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()
            .map_err(|e| Error::config(format!("cannot build HTTP client: {}", e)))?;

        Ok(Self { config, http })
    }

    fn base_url(&self) -> &str {
        self.config
            .base_url
            .as_deref()
            .unwrap_or(Self::DEFAULT_BASE_URL)
    }
}

#[async_trait]
impl EmbeddingProvider for OpenAIEmbedder {
    async fn embed(&self, text: &str) -> Result<Vec<f32>> {
        let request = OpenAIEmbeddingRequest {
            model: &self.config.model,
            input: vec![text],
        };
        let url = format!("{}/v1/embeddings", self.base_url());

        let response = self
            .http
            .post(&url)
            .header("Authorization", format!("Bearer {}", self.config.api_key))
            .json(&request)
            .send()
            .await
            .map_err(|e| Error::embedding(format!("HTTP request failed: {}", e)))?;

        let status = response.status();
        let body = response
            .text()
            .await
            .map_err(|e| Error::embedding(format!("Failed to read response: {}", e)))?;

        if !status.is_success() {
            if let Ok(error) = serde_json::from_str::<OpenAIError>(&body) {
                return Err(Error::embedding(format!(
                    "embedding API error: {}",
                    error.error.message
                )));
            }
            return Err(Error::embedding(format!(
                "embedding API error ({}): {}",
                status, body
            )));
        }

        let parsed: OpenAIEmbeddingResponse = serde_json::from_str(&body)
            .map_err(|e| Error::embedding(format!("Failed to parse response: {}", e)))?;
        let vector = parsed
            .data
            .into_iter()
            .next()
            .map(|d| d.embedding)
            .ok_or_else(|| Error::embedding("response contained no embedding"))?;

        if vector.len() != self.config.dimension {
            return Err(Error::embedding(format!(
                "model returned dimension {}, expected {}",
                vector.len(),
                self.config.dimension
            )));
        }
        normalize(vector).ok_or_else(|| Error::embedding("model returned a zero vector"))
    }

    fn dimension(&self) -> usize {
        self.config.dimension
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::warm::cosine_similarity;

    #[tokio::test]
    async fn test_hash_embedder_is_deterministic_and_normalized() {
        let embedder = HashEmbedder::new(128);
        let a = embedder.embed("The sky is blue").await.unwrap();
        let b = embedder.embed("The sky is blue").await.unwrap();

        assert_eq!(a, b);
        assert_eq!(a.len(), 128);
        let norm: f32 = a.iter().map(|x| x * x).sum::<f32>().sqrt();
        assert!((norm - 1.0).abs() < 1e-4);
        assert!((cosine_similarity(&a, &b) - 1.0).abs() < 1e-5);
    }

    #[test]
    fn test_hash_embedder_separates_different_text() {
        let embedder = HashEmbedder::new(128);
        let a = embedder.embed_sync("The sky is blue");
        let b = embedder.embed_sync("Grass is green");
        assert!(cosine_similarity(&a, &b) < 0.99);
    }

    #[test]
    fn test_hash_embedder_small_dimensions() {
        let embedder = HashEmbedder::new(3);
        assert_eq!(embedder.embed_sync("x").len(), 3);
        assert_eq!(embedder.dimension(), 3);
    }

    #[tokio::test]
    async fn test_openai_embedder_unreachable_is_embedding_error() {
        let embedder = OpenAIEmbedder::new(
            OpenAIEmbedderConfig::new("test-key")
                .with_base_url("http://127.0.0.1:9")
                .with_timeout(2),
        )
        .unwrap();

        let err = embedder.embed("hello").await.unwrap_err();
        assert!(matches!(err, Error::EmbeddingUnavailable(_)));
        assert_eq!(embedder.dimension(), 1536);
    }
}
