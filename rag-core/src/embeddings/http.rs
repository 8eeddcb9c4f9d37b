//! HTTP embedding provider for a local Ollama-compatible endpoint.

use std::time::Duration;

use async_trait::async_trait;
use futures::stream::{self, StreamExt};
use serde::{Deserialize, Serialize};

use super::provider::EmbeddingProvider;
use crate::error::{Error, Result};

const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

/// Embedding provider backed by a local HTTP endpoint
/// (`POST <base>/api/embeddings`, Ollama wire format).
pub struct HttpEmbeddingProvider {
    client: reqwest::Client,
    base_url: String,
    model: String,
    dimension: usize,
    max_concurrency: usize,
}

#[derive(Debug, Serialize)]
struct EmbeddingRequest<'a> {
    model: &'a str,
    prompt: &'a str,
}

#[derive(Debug, Deserialize)]
struct EmbeddingResponse {
    embedding: Vec<f32>,
}

impl HttpEmbeddingProvider {
    /// Create a provider against `base_url` with a declared dimension.
    ///
    /// A `dimension` of 0 means "unknown until probed"; call
    /// [`HttpEmbeddingProvider::probe_dimension`] before handing the
    /// provider to the indexer.
    pub fn new(base_url: &str, model: &str, dimension: usize, max_concurrency: usize) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .map_err(|e| Error::Config(format!("failed to build HTTP client: {e}")))?;

        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            model: model.to_string(),
            dimension,
            max_concurrency: max_concurrency.max(1),
        })
    }

    /// Resolve an unknown dimension by embedding a short probe text.
    pub async fn probe_dimension(mut self) -> Result<Self> {
        if self.dimension == 0 {
            let probe = self.request_embedding("dimension probe").await?;
            self.dimension = probe.len();
            tracing::debug!(dimension = self.dimension, model = %self.model, "probed embedding dimension");
        }
        Ok(self)
    }

    async fn request_embedding(&self, text: &str) -> Result<Vec<f32>> {
        let url = format!("{}/api/embeddings", self.base_url);
        let request = EmbeddingRequest { model: &self.model, prompt: text };

        let response = self
            .client
            .post(&url)
            .json(&request)
            .send()
            .await
            .map_err(|e| classify_transport_error(&e))?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            let lowered = body.to_lowercase();
            if lowered.contains("context length") || lowered.contains("exceeds") {
                return Err(Error::ContextLengthExceeded { len: text.len(), limit: 0 });
            }
            return Err(Error::ProviderUnavailable(format!(
                "embedding endpoint returned {status}: {body}"
            )));
        }

        let parsed: EmbeddingResponse = response
            .json()
            .await
            .map_err(|e| Error::ProviderUnavailable(format!("invalid embedding response: {e}")))?;

        if parsed.embedding.is_empty() {
            return Err(Error::EmbeddingFailed("endpoint returned an empty vector".to_string()));
        }

        Ok(parsed.embedding)
    }
}

#[async_trait]
impl EmbeddingProvider for HttpEmbeddingProvider {
    async fn embed(&self, text: &str) -> Result<Vec<f32>> {
        let embedding = self.request_embedding(text).await?;
        if self.dimension != 0 && embedding.len() != self.dimension {
            return Err(Error::DimensionMismatch {
                expected: self.dimension,
                actual: embedding.len(),
            });
        }
        Ok(embedding)
    }

    /// Embeds concurrently up to the configured budget while preserving
    /// input order.
    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        if texts.is_empty() {
            return Ok(Vec::new());
        }

        let futures: Vec<_> = texts.iter().map(|text| self.embed(text)).collect();
        let results: Vec<Result<Vec<f32>>> = stream::iter(futures)
            .buffered(self.max_concurrency)
            .collect()
            .await;

        results.into_iter().collect()
    }

    fn dimension(&self) -> usize {
        self.dimension
    }

    fn model_name(&self) -> &str {
        &self.model
    }
}

fn classify_transport_error(error: &reqwest::Error) -> Error {
    if error.is_timeout() {
        Error::RequestTimeout(format!("embedding request timed out: {error}"))
    } else {
        Error::ProviderUnavailable(format!("embedding endpoint unreachable: {error}"))
    }
}
