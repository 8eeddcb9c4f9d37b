//! The retrieval pipeline: sparse+dense hybrid search, reranking, result
//! caching, and retrieval quality evaluation.

mod bm25;
mod cache;
mod evaluate;
mod hybrid;
mod rerank;

pub use bm25::Bm25Index;
pub use cache::{CacheKey, CacheMetrics, QueryCache};
pub use evaluate::{RetrievalEvaluation, RetrievalEvaluator};
pub use hybrid::{HybridOutcome, HybridRetriever};
pub use rerank::{
    score_to_distance, HttpCrossEncoderReranker, LlmReranker, NoOpReranker, Reranker,
};
