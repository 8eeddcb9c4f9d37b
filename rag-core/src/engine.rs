//! The engine façade: single entry point for callers.
//!
//! The engine exclusively owns the vector store handle, provider handles,
//! file tracker, and caches for the lifetime of the process. Retrieval and
//! orchestration components hold shared read-mostly references; mutations
//! go through the indexer behind a per-store async mutex, so a second
//! concurrent `index` call fails fast with `AlreadyIndexing` instead of
//! corrupting the store.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::config::RagConfig;
use crate::embeddings::{EmbeddingProvider, HashEmbeddingProvider, HttpEmbeddingProvider};
use crate::error::{Error, Result};
use crate::indexing::{IndexOptions, IndexReport, Indexer, SemanticChunker};
use crate::intelligence::{
    IntelligentOrchestrator, IntelligentQueryOptions, IntelligentResponse, ResponseSynthesizer,
};
use crate::llm::{GenerationOptions, HttpLlmProvider, LlmProvider};
use crate::retrieval::{
    score_to_distance, CacheKey, CacheMetrics, HttpCrossEncoderReranker, HybridRetriever,
    LlmReranker, QueryCache, Reranker, RetrievalEvaluation, RetrievalEvaluator,
};
use crate::store::{AddBatch, QueryOutcome, StoreRegistry, StoreSettings, VectorStore};
use crate::types::{validate_metadata, Metadata};

/// One source behind a standard query answer.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QuerySource {
    /// 1-based rank in the answer context
    pub index: usize,
    /// Cosine distance (or reranker-derived distance)
    pub distance: f32,
    /// The chunk's metadata
    pub metadata: Metadata,
}

/// Return shape of [`RagEngine::query`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueryResponse {
    /// Generated (or template) answer
    pub answer: String,
    /// Sources behind the answer
    pub sources: Vec<QuerySource>,
    /// The concatenated context handed to generation
    pub context: String,
    /// Whether the answer came from the query cache
    pub cached: bool,
    /// Retrieval quality metrics
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub evaluation_metrics: Option<RetrievalEvaluation>,
}

/// Options for [`RagEngine::query`].
#[derive(Debug, Clone)]
pub struct QueryOptions {
    /// Result count (None = engine default)
    pub top_k: Option<usize>,
    /// Generation temperature
    pub temperature: f32,
    /// Include sources and context in the response
    pub include_sources: bool,
}

impl Default for QueryOptions {
    fn default() -> Self {
        Self {
            top_k: None,
            temperature: 0.7,
            include_sources: true,
        }
    }
}

/// Engine-level statistics snapshot.
#[derive(Debug, Clone, Serialize)]
pub struct EngineStats {
    /// Documents in the store
    pub document_count: usize,
    /// Recorded embedding dimension
    pub dimension: usize,
    /// Embedding model name
    pub embedding_model: String,
    /// Generation model name, when generation is available
    pub llm_model: Option<String>,
    /// Store backend name
    pub store_provider: String,
    /// Query cache metrics, when caching is enabled
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cache: Option<CacheMetrics>,
    /// Feature flags in effect
    pub features: HashMap<&'static str, bool>,
}

/// Unified RAG engine orchestrating indexing, retrieval, and generation.
pub struct RagEngine {
    config: RagConfig,
    embedder: Arc<dyn EmbeddingProvider>,
    llm: Option<Arc<dyn LlmProvider>>,
    store: Arc<dyn VectorStore>,
    hybrid: Option<Arc<HybridRetriever>>,
    reranker: Option<Arc<dyn Reranker>>,
    cache: Option<QueryCache<QueryResponse>>,
    orchestrator: Option<IntelligentOrchestrator>,
    evaluator: RetrievalEvaluator,
    indexing_lock: tokio::sync::Mutex<()>,
    cancel_root: CancellationToken,
}

impl RagEngine {
    /// Construct an engine against local HTTP providers.
    ///
    /// The embedding endpoint must be reachable when `embedding_dim` is 0
    /// (it is probed once). A dead generation endpoint degrades to
    /// template synthesis rather than failing construction.
    pub async fn new(config: RagConfig, registry: &StoreRegistry) -> Result<Self> {
        config.validate()?;

        let embedder = HttpEmbeddingProvider::new(
            &config.embedding_base_url,
            &config.embedding_model,
            config.embedding_dim,
            config.max_concurrent_embeddings,
        )?
        .probe_dimension()
        .await?;

        let llm_provider = HttpLlmProvider::new(
            &config.llm_base_url,
            &config.llm_model,
            Duration::from_secs(config.llm_timeout_secs),
        )?;
        let llm: Option<Arc<dyn LlmProvider>> = if llm_provider.is_available().await {
            Some(Arc::new(llm_provider))
        } else {
            warn!(
                url = %config.llm_base_url,
                "generation endpoint unreachable, degrading to template synthesis"
            );
            None
        };

        Self::with_providers(config, registry, Arc::new(embedder), llm).await
    }

    /// Construct an engine with injected providers. This is the seam tests
    /// and embedding callers use; `new` funnels through it.
    pub async fn with_providers(
        config: RagConfig,
        registry: &StoreRegistry,
        embedder: Arc<dyn EmbeddingProvider>,
        llm: Option<Arc<dyn LlmProvider>>,
    ) -> Result<Self> {
        config.validate()?;

        let store = registry
            .create(
                &config.vector_store_provider,
                StoreSettings {
                    path: PathBuf::from(&config.vector_store_path),
                    collection_name: config.collection_name.clone(),
                },
            )
            .await?;

        let hybrid = config
            .use_hybrid
            .then(|| Arc::new(HybridRetriever::new(store.clone(), embedder.clone())));

        let reranker: Option<Arc<dyn Reranker>> = if config.use_reranker {
            if config.cross_encoder_base_url.is_empty() {
                Some(Arc::new(LlmReranker::new(
                    &config.llm_base_url,
                    &config.llm_model,
                    config.reranker_top_k,
                )?))
            } else {
                Some(Arc::new(HttpCrossEncoderReranker::new(
                    &config.cross_encoder_base_url,
                    &config.cross_encoder_model,
                    config.reranker_top_k,
                )?))
            }
        } else {
            None
        };

        let cache = config
            .cache_enabled
            .then(|| QueryCache::with_capacity_and_ttl(config.cache_size, config.cache_ttl()));

        let cancel_root = CancellationToken::new();

        let orchestrator = if config.use_intelligent_rag {
            let synthesizer = ResponseSynthesizer::new(llm.clone());
            let mut orchestrator = IntelligentOrchestrator::new(
                store.clone(),
                embedder.clone(),
                synthesizer,
                config.top_k,
            )
            .with_cancellation(cancel_root.child_token());
            if let Some(hybrid) = &hybrid {
                orchestrator = orchestrator.with_hybrid(hybrid.clone());
            }
            if let Some(reranker) = &reranker {
                orchestrator = orchestrator.with_reranker(reranker.clone());
            }
            Some(orchestrator)
        } else {
            None
        };

        info!(
            store = %config.vector_store_provider,
            hybrid = config.use_hybrid,
            reranker = config.use_reranker,
            cache = config.cache_enabled,
            intelligent = config.use_intelligent_rag,
            "engine constructed"
        );

        Ok(Self {
            evaluator: RetrievalEvaluator::new(embedder.clone()),
            config,
            embedder,
            llm,
            store,
            hybrid,
            reranker,
            cache,
            orchestrator,
            indexing_lock: tokio::sync::Mutex::new(()),
            cancel_root,
        })
    }

    /// The engine's root cancellation token; cancelling it aborts every
    /// in-flight operation derived from it.
    #[must_use]
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel_root.clone()
    }

    /// Index a repository. Fails fast with `AlreadyIndexing` when another
    /// index run holds the store.
    pub async fn index(&self, repo_path: &Path, options: &IndexOptions) -> Result<IndexReport> {
        let Ok(_guard) = self.indexing_lock.try_lock() else {
            return Err(Error::AlreadyIndexing);
        };

        let chunker = SemanticChunker::new(
            self.config.min_chunk_size,
            self.config.chunk_size.min(self.config.max_chunk_size),
            self.config.chunk_overlap,
        );
        let fallback = Arc::new(HashEmbeddingProvider::new(self.embedder.dimension()));
        let indexer = Indexer::new(
            self.store.clone(),
            self.embedder.clone(),
            chunker,
            Path::new(&self.config.vector_store_path),
            self.config.embedding_batch_size,
        )
        .with_fallback(fallback)
        .with_cancellation(self.cancel_root.child_token());

        let report = indexer.index(repo_path, options).await?;

        // Store contents moved under the retriever and the cache.
        if let Some(hybrid) = &self.hybrid {
            hybrid.invalidate();
        }
        if let Some(cache) = &self.cache {
            cache.invalidate_all();
        }

        Ok(report)
    }

    /// Programmatic ingestion, bypassing the file walker. Returns how many
    /// documents were added.
    pub async fn add_documents(
        &self,
        texts: Vec<String>,
        ids: Option<Vec<String>>,
        metadatas: Option<Vec<Metadata>>,
    ) -> Result<usize> {
        if texts.is_empty() {
            return Ok(0);
        }
        if let Some(ids) = &ids {
            if ids.len() != texts.len() {
                return Err(Error::InvalidInput(format!(
                    "{} ids for {} texts",
                    ids.len(),
                    texts.len()
                )));
            }
        }
        if let Some(metadatas) = &metadatas {
            if metadatas.len() != texts.len() {
                return Err(Error::InvalidInput(format!(
                    "{} metadatas for {} texts",
                    metadatas.len(),
                    texts.len()
                )));
            }
            for metadata in metadatas {
                validate_metadata(metadata)?;
            }
        }

        let offset = self.store.count().await?;
        let count = texts.len();
        let ids = ids.unwrap_or_else(|| {
            (0..count).map(|i| format!("doc_{}#0", offset + i)).collect()
        });
        let metadatas = metadatas.unwrap_or_else(|| vec![Metadata::new(); count]);
        let embeddings = self.embedder.embed_batch(&texts).await?;

        self.store
            .add(AddBatch {
                ids,
                documents: texts,
                embeddings,
                metadatas,
            })
            .await?;

        if let Some(hybrid) = &self.hybrid {
            hybrid.invalidate();
        }
        if let Some(cache) = &self.cache {
            cache.invalidate_all();
        }
        Ok(count)
    }

    /// Standard retrieval-generation query: retrieve, optionally rerank,
    /// consult the cache, then generate (or fall back to a template when
    /// no generation endpoint is configured).
    pub async fn query(&self, query_text: &str, options: &QueryOptions) -> Result<QueryResponse> {
        let top_k = options.top_k.unwrap_or(self.config.top_k);

        if self.store.count().await? == 0 {
            return Ok(empty_response());
        }

        // Retrieve: hybrid when configured, bare dense otherwise.
        let mut outcome = match &self.hybrid {
            Some(hybrid) => hybrid.search(query_text, top_k).await?.outcome,
            None => {
                let embedding = self.embedder.embed(query_text).await?;
                self.store.query(&embedding, top_k, None).await?
            }
        };

        if outcome.is_empty() {
            return Ok(empty_response());
        }

        // Optional rerank onto the single distance axis.
        if let Some(reranker) = &self.reranker {
            match reranker.rerank(query_text, &outcome.documents, top_k).await {
                Ok(ranking) if !ranking.is_empty() => {
                    let mut next = QueryOutcome::default();
                    for (index, score) in ranking {
                        next.ids.push(outcome.ids[index].clone());
                        next.documents.push(outcome.documents[index].clone());
                        next.metadatas.push(outcome.metadatas[index].clone());
                        next.distances.push(score_to_distance(score));
                    }
                    outcome = next;
                }
                Ok(_) => {}
                Err(e) => warn!(error = %e, "reranking failed, keeping retrieval order"),
            }
        }

        // Cache lookup keyed by the fingerprint of what we just retrieved:
        // any relevant store change alters the source ids or the count, so
        // a hit can safely skip generation.
        let store_count = self.store.count().await?;
        let cache_key = CacheKey::new(query_text, top_k, outcome.ids.clone(), store_count);
        if let Some(cache) = &self.cache {
            if let Some(mut hit) = cache.get(&cache_key) {
                hit.cached = true;
                if !options.include_sources {
                    hit.context.clear();
                    hit.sources.clear();
                }
                return Ok(hit);
            }
        }

        // Build the generation context.
        let mut context_parts = Vec::with_capacity(outcome.len());
        let mut sources = Vec::with_capacity(outcome.len());
        for i in 0..outcome.len() {
            context_parts.push(format!("[{}] {}", i + 1, outcome.documents[i]));
            sources.push(QuerySource {
                index: i + 1,
                distance: outcome.distances[i],
                metadata: outcome.metadatas[i].clone(),
            });
        }
        let context = context_parts.join("\n\n");

        let evaluation = self
            .evaluator
            .evaluate(query_text, &outcome.documents)
            .await
            .ok();

        let answer = match &self.llm {
            Some(llm) => {
                let prompt = format!(
                    "Based on the following context from the project knowledge base, \
                     please answer the query.\n\nContext:\n{context}\n\nQuery: {query_text}\n\nAnswer:"
                );
                let generation = GenerationOptions {
                    temperature: options.temperature,
                    ..GenerationOptions::default()
                };
                match llm.generate(&prompt, &generation).await {
                    Ok(answer) => answer.trim().to_string(),
                    Err(e) => {
                        warn!(error = %e, "generation failed, returning extractive answer");
                        extractive_answer(&outcome)
                    }
                }
            }
            None => extractive_answer(&outcome),
        };

        let response = QueryResponse {
            answer,
            sources,
            context,
            cached: false,
            evaluation_metrics: evaluation,
        };

        if let Some(cache) = &self.cache {
            cache.put(&cache_key, response.clone());
        }

        let mut out = response;
        if !options.include_sources {
            out.context.clear();
            out.sources.clear();
        }
        Ok(out)
    }

    /// Orchestrator path: understanding, staged retrieval, evidence,
    /// reasoning, synthesis.
    pub async fn intelligent_query(
        &self,
        query_text: &str,
        options: &IntelligentQueryOptions,
    ) -> Result<IntelligentResponse> {
        let Some(orchestrator) = &self.orchestrator else {
            return Err(Error::Config(
                "intelligent RAG is disabled (use_intelligent_rag = false)".to_string(),
            ));
        };
        orchestrator.query(query_text, options).await
    }

    /// Synchronous [`RagEngine::index`], driven on a locally owned
    /// executor. Must not be called from within an async runtime.
    pub fn index_sync(&self, repo_path: &Path, options: &IndexOptions) -> Result<IndexReport> {
        block_on_local(self.index(repo_path, options))?
    }

    /// Synchronous [`RagEngine::query`], driven on a locally owned
    /// executor. Must not be called from within an async runtime.
    pub fn query_sync(&self, query_text: &str, options: &QueryOptions) -> Result<QueryResponse> {
        block_on_local(self.query(query_text, options))?
    }

    /// Synchronous [`RagEngine::intelligent_query`], driven on a locally
    /// owned executor. Must not be called from within an async runtime.
    pub fn intelligent_query_sync(
        &self,
        query_text: &str,
        options: &IntelligentQueryOptions,
    ) -> Result<IntelligentResponse> {
        block_on_local(self.intelligent_query(query_text, options))?
    }

    /// Counts, models, dimensions, and feature flags.
    pub async fn stats(&self) -> Result<EngineStats> {
        let mut features = HashMap::from([
            ("hybrid", self.hybrid.is_some()),
            ("reranker", self.reranker.is_some()),
            ("cache", self.cache.is_some()),
            ("intelligent", self.orchestrator.is_some()),
            ("llm", self.llm.is_some()),
        ]);
        if let Some(orchestrator) = &self.orchestrator {
            features.extend(orchestrator.features());
        }

        Ok(EngineStats {
            document_count: self.store.count().await?,
            dimension: self.store.dimension().await?,
            embedding_model: self.embedder.model_name().to_string(),
            llm_model: self.llm.as_ref().map(|l| l.model_name().to_string()),
            store_provider: self.store.provider_name().to_string(),
            cache: self.cache.as_ref().map(QueryCache::metrics),
            features,
        })
    }
}

/// Drive a future to completion on a private current-thread runtime.
fn block_on_local<F: std::future::Future>(future: F) -> Result<F::Output> {
    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .map_err(|e| Error::Config(format!("failed to build local executor: {e}")))?;
    Ok(runtime.block_on(future))
}

fn empty_response() -> QueryResponse {
    QueryResponse {
        answer: crate::intelligence::EMPTY_ANSWER.to_string(),
        sources: Vec::new(),
        context: String::new(),
        cached: false,
        evaluation_metrics: None,
    }
}

/// No-LLM answer: the top retrieved chunks with a short attribution.
fn extractive_answer(outcome: &QueryOutcome) -> String {
    let mut answer = outcome
        .documents
        .iter()
        .take(2)
        .cloned()
        .collect::<Vec<_>>()
        .join("\n\n");
    let files: std::collections::BTreeSet<&str> = outcome
        .metadatas
        .iter()
        .filter_map(|m| m.get("path").and_then(crate::types::MetadataValue::as_str))
        .collect();
    if !files.is_empty() {
        let names: Vec<&str> = files.into_iter().take(3).collect();
        answer.push_str(&format!(
            "\n\nSynthesized from {} source(s): {}",
            names.len(),
            names.join(", ")
        ));
    }
    answer
}
