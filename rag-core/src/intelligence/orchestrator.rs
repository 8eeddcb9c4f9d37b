//! The intelligence pipeline coordinator.
//!
//! Query understanding, multi-stage retrieval, evidence extraction,
//! chain-of-thought reasoning, and response synthesis run in sequence.
//! Every stage is optional: a disabled or failing stage degrades to its
//! documented fallback instead of aborting the query, with one exception:
//! retrieval that returns nothing short-circuits to a canned empty
//! response with confidence zero.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use super::evidence::{Evidence, EvidenceExtractor, EvidenceSet, EvidenceStrength, EvidenceType};
use super::reasoning::{ReasoningChain, ReasoningEngine};
use super::synthesis::{ResponseSynthesizer, SourceRef};
use super::understanding::{QueryUnderstanding, UnderstoodQuery};
use crate::embeddings::EmbeddingProvider;
use crate::error::{Error, Result};
use crate::retrieval::{score_to_distance, HybridRetriever, Reranker};
use crate::store::{QueryOutcome, VectorStore};
use crate::types::MetadataValue;

/// The literal answer returned when retrieval finds nothing.
pub const EMPTY_ANSWER: &str =
    "I couldn't find any relevant information in the knowledge base to answer this question.";

/// At most this many expanded queries are retrieved per request.
const MAX_EXPANSIONS: usize = 5;

/// Options for one intelligent query.
#[derive(Debug, Clone)]
pub struct IntelligentQueryOptions {
    /// Result count (None = engine default)
    pub top_k: Option<usize>,
    /// Synthesis temperature
    pub temperature: f32,
    /// Include the full reasoning chain in the response
    pub include_reasoning: bool,
    /// Include pipeline metrics in the response
    pub include_metrics: bool,
}

impl Default for IntelligentQueryOptions {
    fn default() -> Self {
        Self {
            top_k: None,
            temperature: 0.3,
            include_reasoning: false,
            include_metrics: false,
        }
    }
}

/// Per-stage timing and quality metrics for one pipeline run.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PipelineMetrics {
    /// Stage 1 latency
    pub understanding_ms: u64,
    /// Stage 2 latency
    pub retrieval_ms: u64,
    /// Stage 3 latency
    pub evidence_ms: u64,
    /// Stage 4 latency
    pub reasoning_ms: u64,
    /// Stage 5 latency
    pub synthesis_ms: u64,
    /// End-to-end latency
    pub total_ms: u64,
    /// Classified intent label
    pub intent: String,
    /// Intent confidence
    pub intent_confidence: f32,
    /// Entities extracted
    pub entities_found: usize,
    /// Chunks surfaced by retrieval
    pub chunks_retrieved: usize,
    /// Whether the reranker ran
    pub reranked: bool,
    /// Evidence pieces extracted
    pub evidence_extracted: usize,
    /// Strong evidence count
    pub strong_evidence: usize,
    /// Reasoning steps emitted
    pub reasoning_steps: usize,
    /// Final pipeline confidence
    pub final_confidence: f32,
    /// Whether contradictions were found
    pub has_contradictions: bool,
    /// Whether uncertainty steps were emitted
    pub has_knowledge_gaps: bool,
    /// Fraction of evidence referenced by the chain
    pub evidence_coverage: f32,
}

/// The orchestrator's answer shape.
#[derive(Debug, Clone)]
pub struct IntelligentResponse {
    /// The query as asked
    pub query: String,
    /// Final answer text
    pub answer: String,
    /// Overall confidence in [0, 1]
    pub confidence: f32,
    /// Deduplicated source attributions
    pub sources: Vec<SourceRef>,
    /// Citation strings
    pub citations: Vec<String>,
    /// Reasoning chain, included on request
    pub reasoning: Option<ReasoningChain>,
    /// Pipeline metrics, included on request
    pub metrics: Option<PipelineMetrics>,
}

/// Coordinates the five-stage intelligent RAG pipeline.
pub struct IntelligentOrchestrator {
    store: Arc<dyn VectorStore>,
    embedder: Arc<dyn EmbeddingProvider>,
    hybrid: Option<Arc<HybridRetriever>>,
    reranker: Option<Arc<dyn Reranker>>,
    synthesizer: ResponseSynthesizer,
    understanding: Option<QueryUnderstanding>,
    extractor: Option<EvidenceExtractor>,
    reasoning: Option<ReasoningEngine>,
    default_top_k: usize,
    cancel: CancellationToken,
}

impl IntelligentOrchestrator {
    /// Orchestrator with every stage enabled and no hybrid/reranker.
    #[must_use]
    pub fn new(
        store: Arc<dyn VectorStore>,
        embedder: Arc<dyn EmbeddingProvider>,
        synthesizer: ResponseSynthesizer,
        default_top_k: usize,
    ) -> Self {
        Self {
            store,
            embedder,
            hybrid: None,
            reranker: None,
            synthesizer,
            understanding: Some(QueryUnderstanding::new()),
            extractor: Some(EvidenceExtractor::new()),
            reasoning: Some(ReasoningEngine::new()),
            default_top_k: default_top_k.max(1),
            cancel: CancellationToken::new(),
        }
    }

    /// Route stage-2 retrieval through the hybrid retriever.
    #[must_use]
    pub fn with_hybrid(mut self, hybrid: Arc<HybridRetriever>) -> Self {
        self.hybrid = Some(hybrid);
        self
    }

    /// Apply a reranker after retrieval merging.
    #[must_use]
    pub fn with_reranker(mut self, reranker: Arc<dyn Reranker>) -> Self {
        self.reranker = Some(reranker);
        self
    }

    /// Disable the understanding stage (minimal query fallback).
    #[must_use]
    pub fn without_understanding(mut self) -> Self {
        self.understanding = None;
        self
    }

    /// Disable the evidence extraction stage (assertion fallback).
    #[must_use]
    pub fn without_evidence_extraction(mut self) -> Self {
        self.extractor = None;
        self
    }

    /// Disable the reasoning stage (single-conclusion fallback).
    #[must_use]
    pub fn without_reasoning(mut self) -> Self {
        self.reasoning = None;
        self
    }

    /// Derive cancellation from the given token.
    #[must_use]
    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancel = token;
        self
    }

    /// Feature flags for stats reporting.
    #[must_use]
    pub fn features(&self) -> HashMap<&'static str, bool> {
        HashMap::from([
            ("query_understanding", self.understanding.is_some()),
            ("evidence_extraction", self.extractor.is_some()),
            ("reasoning", self.reasoning.is_some()),
            ("llm_synthesis", self.synthesizer.has_llm()),
            ("hybrid_retrieval", self.hybrid.is_some()),
            ("reranking", self.reranker.is_some()),
        ])
    }

    /// Execute the complete pipeline for one query.
    pub async fn query(
        &self,
        query_text: &str,
        options: &IntelligentQueryOptions,
    ) -> Result<IntelligentResponse> {
        let started = Instant::now();
        let mut metrics = PipelineMetrics::default();
        let top_k = options.top_k.unwrap_or(self.default_top_k);

        info!(query = %clip(query_text, 60), "starting intelligent query");

        // Stage 1: understanding.
        let stage = Instant::now();
        let understood = match &self.understanding {
            Some(layer) => layer.understand(query_text),
            None => UnderstoodQuery::minimal(query_text),
        };
        metrics.understanding_ms = elapsed_ms(stage);
        metrics.intent = understood.intent.as_str().to_string();
        metrics.intent_confidence = understood.intent_confidence;
        metrics.entities_found = understood.entities.len();

        self.check_cancelled()?;

        // Stage 2: retrieval across expansions, merged by id.
        let stage = Instant::now();
        let (outcome, reranked) = self.retrieve(&understood, top_k).await?;
        metrics.retrieval_ms = elapsed_ms(stage);
        metrics.chunks_retrieved = outcome.len();
        metrics.reranked = reranked;

        if outcome.is_empty() {
            warn!("no documents retrieved, returning empty response");
            metrics.total_ms = elapsed_ms(started);
            return Ok(IntelligentResponse {
                query: query_text.to_string(),
                answer: EMPTY_ANSWER.to_string(),
                confidence: 0.0,
                sources: Vec::new(),
                citations: Vec::new(),
                reasoning: None,
                metrics: options.include_metrics.then_some(metrics),
            });
        }

        self.check_cancelled()?;

        // Stage 3: evidence extraction.
        let stage = Instant::now();
        let evidence_set = match &self.extractor {
            Some(extractor) => extractor.extract(query_text, &outcome),
            None => minimal_evidence(query_text, &outcome),
        };
        metrics.evidence_ms = elapsed_ms(stage);
        metrics.evidence_extracted = evidence_set.evidence.len();
        metrics.strong_evidence = evidence_set.strong_evidence().len();
        metrics.has_contradictions = evidence_set.has_contradictions();

        self.check_cancelled()?;

        // Stage 4: reasoning.
        let stage = Instant::now();
        let chain = match &self.reasoning {
            Some(engine) => engine.reason(&evidence_set),
            None => ReasoningChain::single_conclusion(&evidence_set),
        };
        metrics.reasoning_ms = elapsed_ms(stage);
        metrics.reasoning_steps = chain.steps.len();
        metrics.has_knowledge_gaps = chain.has_gaps();
        if !evidence_set.evidence.is_empty() {
            metrics.evidence_coverage =
                chain.evidence_used.len() as f32 / evidence_set.evidence.len() as f32;
        }

        self.check_cancelled()?;

        // Stage 5: synthesis (falls back to template mode internally).
        let stage = Instant::now();
        let synthesized = self
            .synthesizer
            .synthesize(chain, evidence_set, options.temperature)
            .await;
        metrics.synthesis_ms = elapsed_ms(stage);
        metrics.final_confidence = synthesized.confidence;
        metrics.total_ms = elapsed_ms(started);

        info!(
            total_ms = metrics.total_ms,
            confidence = synthesized.confidence,
            steps = metrics.reasoning_steps,
            "intelligent query complete"
        );

        Ok(IntelligentResponse {
            query: synthesized.query,
            answer: synthesized.answer,
            confidence: synthesized.confidence,
            sources: synthesized.sources,
            citations: synthesized.citations,
            reasoning: options.include_reasoning.then_some(synthesized.reasoning_chain),
            metrics: options.include_metrics.then_some(metrics),
        })
    }

    /// Stage 2: retrieve per expanded query, merge by id keeping the best
    /// score, then optionally rerank. Returns `(outcome, reranked)`.
    async fn retrieve(
        &self,
        understood: &UnderstoodQuery,
        top_k: usize,
    ) -> Result<(QueryOutcome, bool)> {
        struct Merged {
            score: f32,
            document: String,
            metadata: crate::types::Metadata,
            distance: f32,
        }
        let mut merged: HashMap<String, Merged> = HashMap::new();
        let mut any_succeeded = false;
        let mut last_error: Option<Error> = None;

        for expansion in understood.expanded_queries.iter().take(MAX_EXPANSIONS) {
            let result = match &self.hybrid {
                Some(hybrid) => hybrid.search(expansion, top_k).await.map(|r| {
                    let scores = r.hybrid_scores;
                    (r.outcome, scores)
                }),
                None => self.dense_search(expansion, top_k).await,
            };

            match result {
                Ok((outcome, scores)) => {
                    any_succeeded = true;
                    for i in 0..outcome.len() {
                        let id = outcome.ids[i].clone();
                        let score = scores.get(i).copied().unwrap_or(0.0);
                        let candidate = Merged {
                            score,
                            document: outcome.documents[i].clone(),
                            metadata: outcome.metadatas[i].clone(),
                            distance: outcome.distances[i],
                        };
                        match merged.get_mut(&id) {
                            Some(existing) if existing.score >= score => {}
                            Some(existing) => *existing = candidate,
                            None => {
                                merged.insert(id, candidate);
                            }
                        }
                    }
                }
                Err(e) => {
                    warn!(expansion = %clip(expansion, 40), error = %e, "retrieval failed for expansion");
                    last_error = Some(e);
                }
            }
        }

        if !any_succeeded {
            return Err(last_error.unwrap_or(Error::EmptyStore));
        }

        // Best-score ordering, stable on ties via id.
        let mut ranked: Vec<(String, Merged)> = merged.into_iter().collect();
        ranked.sort_by(|a, b| {
            b.1.score
                .partial_cmp(&a.1.score)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| a.0.cmp(&b.0))
        });
        // Keep extra candidates for the reranker to work with.
        let keep = if self.reranker.is_some() { top_k * 2 } else { top_k };
        ranked.truncate(keep);

        let mut outcome = QueryOutcome::default();
        for (id, item) in ranked {
            outcome.ids.push(id);
            outcome.documents.push(item.document);
            outcome.metadatas.push(item.metadata);
            outcome.distances.push(item.distance);
        }

        // Optional rerank; failure keeps the fused ordering.
        let mut reranked = false;
        if let Some(reranker) = &self.reranker {
            match reranker.rerank(&understood.original, &outcome.documents, top_k).await {
                Ok(ranking) if !ranking.is_empty() => {
                    let mut next = QueryOutcome::default();
                    for (index, score) in ranking {
                        next.ids.push(outcome.ids[index].clone());
                        next.documents.push(outcome.documents[index].clone());
                        next.metadatas.push(outcome.metadatas[index].clone());
                        next.distances.push(score_to_distance(score));
                    }
                    outcome = next;
                    reranked = true;
                }
                Ok(_) => {}
                Err(e) => {
                    warn!(error = %e, "reranking failed, keeping fused order");
                }
            }
        }

        truncate(&mut outcome, top_k);
        Ok((outcome, reranked))
    }

    /// Bare dense retrieval; score is similarity so merging favors the
    /// closest observation of each id.
    async fn dense_search(&self, query: &str, top_k: usize) -> Result<(QueryOutcome, Vec<f32>)> {
        let embedding = self.embedder.embed(query).await?;
        let outcome = self.store.query(&embedding, top_k, None).await?;
        let scores = outcome
            .distances
            .iter()
            .map(|d| 1.0 - (d / 2.0).clamp(0.0, 1.0))
            .collect();
        Ok((outcome, scores))
    }

    fn check_cancelled(&self) -> Result<()> {
        if self.cancel.is_cancelled() {
            Err(Error::Cancelled)
        } else {
            Ok(())
        }
    }
}

/// Stage-3 fallback: every retrieved chunk becomes a moderate assertion.
fn minimal_evidence(query: &str, outcome: &QueryOutcome) -> EvidenceSet {
    let evidence: Vec<Evidence> = outcome
        .documents
        .iter()
        .enumerate()
        .map(|(i, document)| Evidence {
            id: format!("ev_{:03}", i + 1),
            content: document.clone(),
            evidence_type: EvidenceType::Assertion,
            strength: EvidenceStrength::Moderate,
            confidence: 0.7,
            source_chunk_id: outcome.ids.get(i).cloned().unwrap_or_default(),
            source_file: outcome
                .metadatas
                .get(i)
                .and_then(|m| m.get("path"))
                .and_then(MetadataValue::as_str)
                .unwrap_or("unknown")
                .to_string(),
            source_line_start: None,
            source_line_end: None,
            is_code: false,
            code_language: None,
        })
        .collect();

    EvidenceSet {
        query: query.to_string(),
        evidence,
        total_chunks_processed: outcome.documents.len(),
    }
}

fn truncate(outcome: &mut QueryOutcome, top_k: usize) {
    outcome.ids.truncate(top_k);
    outcome.documents.truncate(top_k);
    outcome.metadatas.truncate(top_k);
    outcome.distances.truncate(top_k);
}

fn elapsed_ms(since: Instant) -> u64 {
    u64::try_from(since.elapsed().as_millis()).unwrap_or(u64::MAX)
}

fn clip(text: &str, limit: usize) -> String {
    if text.chars().count() <= limit {
        text.to_string()
    } else {
        text.chars().take(limit).collect()
    }
}
