//! Hybrid lexical+dense retrieval with Reciprocal Rank Fusion.
//!
//! The sparse side is a BM25 index built lazily from the store's documents;
//! it rebuilds on first use and whenever the store's count drifts from the
//! count observed at build time. A 30-second TTL on the count probe keeps
//! hot query paths from hammering the store. Fusion uses RRF with
//! `score(id) = Σ 1/(k + rank)` over the rankers an id appears in.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tracing::{debug, warn};

use super::bm25::Bm25Index;
use crate::embeddings::EmbeddingProvider;
use crate::error::Result;
use crate::store::{QueryOutcome, VectorStore};
use crate::types::Metadata;

/// Default RRF constant.
pub const DEFAULT_K_RRF: usize = 60;

/// TTL on the store-count probe.
const COUNT_TTL: Duration = Duration::from_secs(30);

/// Page size for sparse-index builds over large stores.
const SCAN_PAGE_SIZE: usize = 1000;

/// Store size above which the scan pages instead of one-shotting.
const PAGED_SCAN_THRESHOLD: usize = 10_000;

/// Hybrid search result: the fused ranking plus per-id fusion scores.
#[derive(Debug, Clone, Default)]
pub struct HybridOutcome {
    /// The fused result set (distances are dense cosine distances where
    /// known, `1.0` for BM25-only hits)
    pub outcome: QueryOutcome,
    /// RRF fusion score per result, aligned with `outcome.ids`
    pub hybrid_scores: Vec<f32>,
    /// Whether fusion actually ran (false = dense-only fallback)
    pub hybrid: bool,
}

struct SparseState {
    index: Option<Arc<Bm25Index>>,
    /// id -> text for results only the sparse side surfaced
    texts: Arc<HashMap<String, String>>,
    built_for_count: usize,
    cached_count: usize,
    last_count_probe: Option<Instant>,
}

/// Combines BM25 sparse retrieval with dense vector search using RRF.
pub struct HybridRetriever {
    store: Arc<dyn VectorStore>,
    embedder: Arc<dyn EmbeddingProvider>,
    k_rrf: usize,
    state: Mutex<SparseState>,
}

impl HybridRetriever {
    /// Create a retriever over `store` and `embedder`.
    #[must_use]
    pub fn new(store: Arc<dyn VectorStore>, embedder: Arc<dyn EmbeddingProvider>) -> Self {
        Self {
            store,
            embedder,
            k_rrf: DEFAULT_K_RRF,
            state: Mutex::new(SparseState {
                index: None,
                texts: Arc::new(HashMap::new()),
                built_for_count: 0,
                cached_count: 0,
                last_count_probe: None,
            }),
        }
    }

    /// Override the RRF constant.
    #[must_use]
    pub fn with_k_rrf(mut self, k_rrf: usize) -> Self {
        self.k_rrf = k_rrf.max(1);
        self
    }

    /// Drop the sparse index; the next search rebuilds it.
    pub fn invalidate(&self) {
        let mut state = self.state.lock();
        state.index = None;
        state.built_for_count = 0;
        state.last_count_probe = None;
    }

    /// Hybrid search: dense query, sparse query, RRF fusion. Falls back to
    /// dense-only when the sparse index cannot be built.
    pub async fn search(&self, query: &str, top_k: usize) -> Result<HybridOutcome> {
        let query_embedding = self.embedder.embed(query).await?;
        let candidate_k = (top_k * 2).min(50);
        let dense = self
            .store
            .query(&query_embedding, candidate_k, None)
            .await?;

        let Some((index, texts)) = self.ensure_index().await? else {
            let hybrid_scores = vec![0.0; dense.len().min(top_k)];
            let mut outcome = dense;
            truncate_outcome(&mut outcome, top_k);
            return Ok(HybridOutcome { outcome, hybrid_scores, hybrid: false });
        };

        let sparse = index.top_n(query, candidate_k);
        Ok(self.fuse(&dense, &sparse, texts.as_ref(), top_k))
    }

    /// RRF fusion of the dense and sparse rankings.
    fn fuse(
        &self,
        dense: &QueryOutcome,
        sparse: &[(String, f32)],
        sparse_texts: &HashMap<String, String>,
        top_k: usize,
    ) -> HybridOutcome {
        let k = self.k_rrf as f32;
        let mut fused: HashMap<&str, f32> = HashMap::new();

        for (rank, id) in dense.ids.iter().enumerate() {
            *fused.entry(id.as_str()).or_insert(0.0) += 1.0 / (k + rank as f32 + 1.0);
        }
        for (rank, (id, _)) in sparse.iter().enumerate() {
            *fused.entry(id.as_str()).or_insert(0.0) += 1.0 / (k + rank as f32 + 1.0);
        }

        let dense_lookup: HashMap<&str, usize> = dense
            .ids
            .iter()
            .enumerate()
            .map(|(i, id)| (id.as_str(), i))
            .collect();
        let sparse_lookup: HashMap<&str, &f32> =
            sparse.iter().map(|(id, score)| (id.as_str(), score)).collect();

        let mut ranking: Vec<(&str, f32)> = fused.into_iter().collect();
        // Fused score descending; ties break on lower dense distance, then
        // ascending id, so re-runs with identical inputs are stable.
        ranking.sort_by(|a, b| {
            b.1.partial_cmp(&a.1)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| {
                    let dist = |id: &str| {
                        dense_lookup
                            .get(id)
                            .map_or(f32::MAX, |&i| dense.distances[i])
                    };
                    dist(a.0)
                        .partial_cmp(&dist(b.0))
                        .unwrap_or(std::cmp::Ordering::Equal)
                })
                .then_with(|| a.0.cmp(b.0))
        });
        ranking.truncate(top_k);

        let mut outcome = QueryOutcome::default();
        let mut hybrid_scores = Vec::with_capacity(ranking.len());
        for (id, score) in ranking {
            hybrid_scores.push(score);
            outcome.ids.push(id.to_string());
            if let Some(&i) = dense_lookup.get(id) {
                outcome.documents.push(dense.documents[i].clone());
                outcome.metadatas.push(dense.metadatas[i].clone());
                outcome.distances.push(dense.distances[i]);
            } else {
                // BM25-only hit: text comes from the scan that built the
                // sparse index; surface it with a neutral distance.
                outcome
                    .documents
                    .push(sparse_texts.get(id).cloned().unwrap_or_default());
                let mut metadata = Metadata::new();
                metadata.insert("source".to_string(), "bm25".into());
                outcome.metadatas.push(metadata);
                outcome.distances.push(1.0);
                debug_assert!(sparse_lookup.contains_key(id));
            }
        }

        HybridOutcome { outcome, hybrid_scores, hybrid: true }
    }

    /// Build or refresh the sparse index. Returns `None` when the store is
    /// empty or unreadable (dense-only fallback).
    async fn ensure_index(&self) -> Result<Option<(Arc<Bm25Index>, Arc<HashMap<String, String>>)>> {
        let (cached, needs_probe, cached_count) = {
            let state = self.state.lock();
            let needs_probe = state
                .last_count_probe
                .is_none_or(|probed| probed.elapsed() >= COUNT_TTL);
            let cached = state.index.clone().map(|index| (index, state.texts.clone()));
            (cached, needs_probe, state.cached_count)
        };

        let count = if needs_probe {
            match self.store.count().await {
                Ok(count) => {
                    let mut state = self.state.lock();
                    state.cached_count = count;
                    state.last_count_probe = Some(Instant::now());
                    count
                }
                Err(e) => {
                    warn!(error = %e, "count probe failed, keeping stale sparse index");
                    cached_count
                }
            }
        } else {
            cached_count
        };

        {
            let state = self.state.lock();
            if state.index.is_some() && state.built_for_count == count {
                return Ok(cached);
            }
        }

        if count == 0 {
            let mut state = self.state.lock();
            state.index = None;
            state.texts = Arc::new(HashMap::new());
            state.built_for_count = 0;
            return Ok(None);
        }

        debug!(count, "rebuilding BM25 index from store");
        let mut documents: Vec<(String, String)> = Vec::with_capacity(count);
        if count > PAGED_SCAN_THRESHOLD {
            let mut offset = 0usize;
            loop {
                let page = self.store.scan(offset, SCAN_PAGE_SIZE).await?;
                if page.is_empty() {
                    break;
                }
                offset += page.len();
                documents.extend(page.into_iter().map(|d| (d.id, d.text)));
            }
        } else {
            documents = self
                .store
                .scan(0, count)
                .await?
                .into_iter()
                .map(|d| (d.id, d.text))
                .collect();
        }

        if documents.is_empty() {
            return Ok(None);
        }

        let texts: Arc<HashMap<String, String>> =
            Arc::new(documents.iter().cloned().collect());

        // Tokenization is CPU-bound; keep large builds off the runtime.
        let index = if documents.len() > SCAN_PAGE_SIZE {
            tokio::task::spawn_blocking(move || Bm25Index::build(&documents))
                .await
                .map_err(|e| crate::error::Error::Store(format!("BM25 build task failed: {e}")))?
        } else {
            Bm25Index::build(&documents)
        };

        let index = Arc::new(index);
        let mut state = self.state.lock();
        state.index = Some(index.clone());
        state.texts = texts.clone();
        state.built_for_count = count;
        Ok(Some((index, texts)))
    }
}

fn truncate_outcome(outcome: &mut QueryOutcome, top_k: usize) {
    outcome.ids.truncate(top_k);
    outcome.documents.truncate(top_k);
    outcome.metadatas.truncate(top_k);
    outcome.distances.truncate(top_k);
}
