//! Embedding provider trait and common functionality

use async_trait::async_trait;

use crate::error::Result;

/// Trait for embedding providers that convert text to vectors
///
/// Batching is an optimization, not a semantic change: `embed_batch(&[t])`
/// must produce the same vector as `embed(t)` up to provider-level
/// nondeterminism, and the result preserves input order and length.
#[async_trait]
pub trait EmbeddingProvider: Send + Sync {
    /// Generate an embedding for a single text
    ///
    /// # Errors
    ///
    /// `Error::ContextLengthExceeded` when the input exceeds the model
    /// limit, `Error::ProviderUnavailable` on transport failure.
    async fn embed(&self, text: &str) -> Result<Vec<f32>>;

    /// Generate embeddings for multiple texts in batch
    ///
    /// More efficient than calling `embed` repeatedly. The default
    /// implementation embeds sequentially.
    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        let mut embeddings = Vec::with_capacity(texts.len());
        for text in texts {
            embeddings.push(self.embed(text).await?);
        }
        Ok(embeddings)
    }

    /// The embedding dimension, stable for the life of the provider
    fn dimension(&self) -> usize;

    /// Model name/identifier
    fn model_name(&self) -> &str;

    /// Check if the provider is available/configured
    async fn is_available(&self) -> bool {
        self.embed("availability probe").await.is_ok()
    }
}
