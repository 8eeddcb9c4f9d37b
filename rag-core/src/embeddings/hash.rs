//! Deterministic hash-based embedding provider.
//!
//! Maps tokens into buckets with a seeded FNV-style hash and accumulates
//! token counts, then L2-normalizes. The output is stable across runs,
//! which makes it the provider of choice for tests, and serviceable as the
//! in-process fallback when the HTTP endpoint keeps rejecting a chunk.
//! Semantic quality is poor by construction; identical texts still map to
//! identical vectors and token overlap still correlates with similarity.

use async_trait::async_trait;

use super::provider::EmbeddingProvider;
use super::similarity::l2_normalize;
use crate::error::{Error, Result};

const DEFAULT_DIMENSION: usize = 384;

/// Deterministic token-hash embedding provider.
pub struct HashEmbeddingProvider {
    dimension: usize,
    /// Optional simulated context limit in characters (0 = unlimited)
    max_input_chars: usize,
    model_name: String,
}

impl HashEmbeddingProvider {
    /// Create a provider with the given dimension.
    #[must_use]
    pub fn new(dimension: usize) -> Self {
        Self {
            dimension: if dimension == 0 { DEFAULT_DIMENSION } else { dimension },
            max_input_chars: 0,
            model_name: "hash-embedding".to_string(),
        }
    }

    /// Impose an input length limit, after which `embed` fails with
    /// `ContextLengthExceeded`. Used to exercise the indexer's truncation
    /// ladder without a real endpoint.
    #[must_use]
    pub fn with_context_limit(mut self, max_input_chars: usize) -> Self {
        self.max_input_chars = max_input_chars;
        self
    }

    fn embed_sync(&self, text: &str) -> Result<Vec<f32>> {
        if self.max_input_chars > 0 && text.len() > self.max_input_chars {
            return Err(Error::ContextLengthExceeded {
                len: text.len(),
                limit: self.max_input_chars,
            });
        }

        let mut vector = vec![0.0f32; self.dimension];
        for token in tokenize(text) {
            let bucket = fnv1a(token) as usize % self.dimension;
            vector[bucket] += 1.0;
            // Second rotation decorrelates tokens that collide on one bucket.
            let alt = fnv1a_seeded(token, 0x9747_b28c) as usize % self.dimension;
            vector[alt] += 0.5;
        }
        l2_normalize(&mut vector);
        Ok(vector)
    }
}

impl Default for HashEmbeddingProvider {
    fn default() -> Self {
        Self::new(DEFAULT_DIMENSION)
    }
}

#[async_trait]
impl EmbeddingProvider for HashEmbeddingProvider {
    async fn embed(&self, text: &str) -> Result<Vec<f32>> {
        self.embed_sync(text)
    }

    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        texts.iter().map(|t| self.embed_sync(t)).collect()
    }

    fn dimension(&self) -> usize {
        self.dimension
    }

    fn model_name(&self) -> &str {
        &self.model_name
    }

    async fn is_available(&self) -> bool {
        true
    }
}

fn tokenize(text: &str) -> impl Iterator<Item = &str> {
    text.split(|c: char| !c.is_alphanumeric() && c != '_')
        .filter(|t| !t.is_empty())
}

fn fnv1a(token: &str) -> u64 {
    fnv1a_seeded(token, 0xcbf2_9ce4_8422_2325)
}

fn fnv1a_seeded(token: &str, seed: u64) -> u64 {
    let mut hash = seed;
    for byte in token.to_lowercase().bytes() {
        hash ^= u64::from(byte);
        hash = hash.wrapping_mul(0x0000_0100_0000_01b3);
    }
    hash
}
