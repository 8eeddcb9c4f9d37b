//! Retrieval quality metrics.
//!
//! Context relevance is the cosine similarity between the query embedding
//! and each retrieved document's embedding, summarized as avg/min/max.
//! Cheap enough to run on every query; surfaced as `evaluation_metrics`
//! on standard query responses.

use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::embeddings::similarity::cosine_similarity;
use crate::embeddings::EmbeddingProvider;
use crate::error::Result;

/// Retrieval quality summary for one query.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RetrievalEvaluation {
    /// Number of documents evaluated
    pub num_retrieved: usize,
    /// Mean query-document similarity
    pub context_relevance_avg: f32,
    /// Best query-document similarity
    pub context_relevance_max: f32,
    /// Worst query-document similarity
    pub context_relevance_min: f32,
}

/// Evaluates retrieval quality against the live embedding provider.
pub struct RetrievalEvaluator {
    embedder: Arc<dyn EmbeddingProvider>,
}

impl RetrievalEvaluator {
    /// Create an evaluator over `embedder`.
    #[must_use]
    pub fn new(embedder: Arc<dyn EmbeddingProvider>) -> Self {
        Self { embedder }
    }

    /// Score the retrieved documents against the query.
    pub async fn evaluate(&self, query: &str, documents: &[String]) -> Result<RetrievalEvaluation> {
        if documents.is_empty() {
            return Ok(RetrievalEvaluation::default());
        }

        let query_embedding = self.embedder.embed(query).await?;
        let doc_embeddings = self.embedder.embed_batch(documents).await?;

        let similarities: Vec<f32> = doc_embeddings
            .iter()
            .map(|doc| cosine_similarity(&query_embedding, doc))
            .collect();

        let sum: f32 = similarities.iter().sum();
        Ok(RetrievalEvaluation {
            num_retrieved: documents.len(),
            context_relevance_avg: sum / similarities.len() as f32,
            context_relevance_max: similarities.iter().copied().fold(f32::MIN, f32::max),
            context_relevance_min: similarities.iter().copied().fold(f32::MAX, f32::min),
        })
    }
}
