//! Cross-encoder score refinement over retrieved candidates.
//!
//! Rerankers return `(candidate_index, normalized_score)` pairs sorted by
//! descending score, with `normalized_score ∈ [0, 1]`. Downstream code
//! converts back to the single distance axis with
//! [`score_to_distance`]: `distance = 1 − normalized_score`. No other
//! score-to-distance convention exists in the API.

use std::sync::LazyLock;
use std::time::Duration;

use async_trait::async_trait;
use futures::stream::{self, StreamExt};
use regex::Regex;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{Error, Result};

/// Default bound on how many candidates are scored.
pub const DEFAULT_MAX_CANDIDATES: usize = 20;

const RERANK_TIMEOUT: Duration = Duration::from_secs(10);
const MAX_KEEPALIVE_CONNECTIONS: usize = 5;
const MAX_CONNECTIONS: usize = 10;
/// Documents are clipped to this many characters before scoring.
const SCORING_CLIP: usize = 500;

static NUMBER_PATTERN: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\d+(?:\.\d+)?").unwrap());

/// Unified reranker-score-to-distance transform.
#[must_use]
pub fn score_to_distance(normalized_score: f32) -> f32 {
    1.0 - normalized_score.clamp(0.0, 1.0)
}

/// Trait for rerankers that refine an initial candidate ordering.
#[async_trait]
pub trait Reranker: Send + Sync {
    /// Score `documents` against `query`; return at most `top_k`
    /// `(index, normalized_score)` pairs sorted by descending score.
    async fn rerank(
        &self,
        query: &str,
        documents: &[String],
        top_k: usize,
    ) -> Result<Vec<(usize, f32)>>;

    /// Implementation name for stats and logs.
    fn name(&self) -> &str;
}

/// Reranker backed by a local cross-encoder scoring endpoint
/// (`POST <base>/rerank`). All pairs are scored in one batched call.
pub struct HttpCrossEncoderReranker {
    client: reqwest::Client,
    base_url: String,
    model: String,
    max_candidates: usize,
}

#[derive(Debug, Serialize)]
struct RerankRequest<'a> {
    model: &'a str,
    query: &'a str,
    documents: &'a [String],
}

#[derive(Debug, Deserialize)]
struct RerankResponse {
    scores: Vec<f32>,
}

impl HttpCrossEncoderReranker {
    /// Create a reranker against `base_url`.
    pub fn new(base_url: &str, model: &str, max_candidates: usize) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(RERANK_TIMEOUT)
            .pool_max_idle_per_host(MAX_KEEPALIVE_CONNECTIONS)
            .build()
            .map_err(|e| Error::Config(format!("failed to build HTTP client: {e}")))?;
        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            model: model.to_string(),
            max_candidates: max_candidates.max(1),
        })
    }
}

#[async_trait]
impl Reranker for HttpCrossEncoderReranker {
    async fn rerank(
        &self,
        query: &str,
        documents: &[String],
        top_k: usize,
    ) -> Result<Vec<(usize, f32)>> {
        if documents.is_empty() {
            return Ok(Vec::new());
        }
        let candidates: Vec<String> = documents
            .iter()
            .take(self.max_candidates)
            .map(|doc| clip(doc, SCORING_CLIP).to_string())
            .collect();

        let url = format!("{}/rerank", self.base_url);
        let request = RerankRequest {
            model: &self.model,
            query,
            documents: &candidates,
        };
        let response = self
            .client
            .post(&url)
            .json(&request)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    Error::RequestTimeout(format!("rerank request timed out: {e}"))
                } else {
                    Error::ProviderUnavailable(format!("rerank endpoint unreachable: {e}"))
                }
            })?;

        if !response.status().is_success() {
            let status = response.status();
            return Err(Error::ProviderUnavailable(format!(
                "rerank endpoint returned {status}"
            )));
        }

        let parsed: RerankResponse = response
            .json()
            .await
            .map_err(|e| Error::ProviderUnavailable(format!("invalid rerank response: {e}")))?;
        if parsed.scores.len() != candidates.len() {
            return Err(Error::ProviderUnavailable(format!(
                "rerank endpoint returned {} scores for {} documents",
                parsed.scores.len(),
                candidates.len()
            )));
        }

        let mut indexed: Vec<(usize, f32)> = parsed
            .scores
            .into_iter()
            .map(|score| score.clamp(0.0, 1.0))
            .enumerate()
            .collect();
        sort_and_truncate(&mut indexed, top_k);
        Ok(indexed)
    }

    fn name(&self) -> &str {
        "cross_encoder"
    }
}

/// LLM-based fallback reranker: asks the local generation endpoint to rate
/// each `(query, document)` pair 0-10 and scores documents concurrently
/// over a connection-pooled client.
pub struct LlmReranker {
    client: reqwest::Client,
    base_url: String,
    model: String,
    max_candidates: usize,
}

#[derive(Debug, Serialize)]
struct ScoreRequest<'a> {
    model: &'a str,
    prompt: String,
    stream: bool,
    options: ScoreOptions,
}

#[derive(Debug, Serialize)]
struct ScoreOptions {
    temperature: f32,
}

#[derive(Debug, Deserialize)]
struct ScoreResponse {
    #[serde(default)]
    response: String,
}

impl LlmReranker {
    /// Create a reranker against the generation endpoint at `base_url`.
    pub fn new(base_url: &str, model: &str, max_candidates: usize) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(RERANK_TIMEOUT)
            .pool_max_idle_per_host(MAX_KEEPALIVE_CONNECTIONS)
            .build()
            .map_err(|e| Error::Config(format!("failed to build HTTP client: {e}")))?;
        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            model: model.to_string(),
            max_candidates: max_candidates.max(1),
        })
    }

    /// Score one document; failures rate 0 so one flaky generation does
    /// not sink the whole rerank.
    async fn score_document(&self, query: &str, document: &str) -> f32 {
        let prompt = format!(
            "Rate 0-10 how relevant this document is to the query. \
             Output ONLY a number.\n\nQuery: {query}\n\nDocument: {}\n\nScore:",
            clip(document, SCORING_CLIP)
        );
        let request = ScoreRequest {
            model: &self.model,
            prompt,
            stream: false,
            options: ScoreOptions { temperature: 0.0 },
        };

        let url = format!("{}/api/generate", self.base_url);
        let response = match self.client.post(&url).json(&request).send().await {
            Ok(response) if response.status().is_success() => response,
            Ok(response) => {
                debug!(status = %response.status(), "rerank scoring returned an error status");
                return 0.0;
            }
            Err(e) => {
                debug!(error = %e, "rerank scoring request failed");
                return 0.0;
            }
        };

        let Ok(parsed) = response.json::<ScoreResponse>().await else {
            return 0.0;
        };
        NUMBER_PATTERN
            .find(&parsed.response)
            .and_then(|m| m.as_str().parse::<f32>().ok())
            .map_or(0.0, |raw| raw.clamp(0.0, 10.0))
    }
}

#[async_trait]
impl Reranker for LlmReranker {
    async fn rerank(
        &self,
        query: &str,
        documents: &[String],
        top_k: usize,
    ) -> Result<Vec<(usize, f32)>> {
        let candidates: Vec<&String> = documents.iter().take(self.max_candidates).collect();
        if candidates.is_empty() {
            return Ok(Vec::new());
        }

        // Concurrent scoring, bounded by the connection budget; `buffered`
        // preserves candidate order so indices stay aligned.
        let futures: Vec<_> = candidates
            .iter()
            .map(|doc| self.score_document(query, doc))
            .collect();
        let scores: Vec<f32> = stream::iter(futures)
            .buffered(MAX_CONNECTIONS)
            .collect()
            .await;

        // The 0-10 integer answer normalizes to [0, 1].
        let mut indexed: Vec<(usize, f32)> = scores
            .into_iter()
            .map(|score| score / 10.0)
            .enumerate()
            .collect();
        sort_and_truncate(&mut indexed, top_k);
        Ok(indexed)
    }

    fn name(&self) -> &str {
        "llm"
    }
}

/// Passthrough reranker preserving the incoming order with rank-decayed
/// scores.
pub struct NoOpReranker;

#[async_trait]
impl Reranker for NoOpReranker {
    async fn rerank(
        &self,
        _query: &str,
        documents: &[String],
        top_k: usize,
    ) -> Result<Vec<(usize, f32)>> {
        Ok((0..documents.len().min(top_k))
            .map(|i| (i, 1.0 / (i as f32 + 1.0)))
            .collect())
    }

    fn name(&self) -> &str {
        "noop"
    }
}

fn sort_and_truncate(indexed: &mut Vec<(usize, f32)>, top_k: usize) {
    indexed.sort_by(|a, b| {
        b.1.partial_cmp(&a.1)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then_with(|| a.0.cmp(&b.0))
    });
    indexed.truncate(top_k);
}

fn clip(text: &str, limit: usize) -> &str {
    match text.char_indices().nth(limit) {
        Some((offset, _)) => &text[..offset],
        None => text,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn score_to_distance_is_clamped_and_inverted() {
        assert!((score_to_distance(1.0) - 0.0).abs() < 1e-6);
        assert!((score_to_distance(0.0) - 1.0).abs() < 1e-6);
        assert!((score_to_distance(0.25) - 0.75).abs() < 1e-6);
        // Out-of-range inputs clamp rather than leak.
        assert!((score_to_distance(12.0) - 0.0).abs() < 1e-6);
        assert!((score_to_distance(-3.0) - 1.0).abs() < 1e-6);
    }

    #[tokio::test]
    async fn noop_preserves_order_and_bounds() {
        let documents = vec!["a".to_string(), "b".to_string(), "c".to_string()];
        let ranked = NoOpReranker.rerank("q", &documents, 2).await.unwrap();
        assert_eq!(ranked.len(), 2);
        assert_eq!(ranked[0].0, 0);
        assert_eq!(ranked[1].0, 1);
        assert!(ranked[0].1 > ranked[1].1);
    }

    #[tokio::test]
    async fn noop_empty_documents() {
        let ranked = NoOpReranker.rerank("q", &[], 5).await.unwrap();
        assert!(ranked.is_empty());
    }

    #[test]
    fn sort_and_truncate_is_stable_on_ties() {
        let mut indexed = vec![(0, 0.5), (1, 0.9), (2, 0.5), (3, 0.1)];
        sort_and_truncate(&mut indexed, 3);
        assert_eq!(indexed, vec![(1, 0.9), (0, 0.5), (2, 0.5)]);
    }

    #[test]
    fn clip_respects_char_boundaries() {
        assert_eq!(clip("héllø", 3), "hél");
        assert_eq!(clip("short", 100), "short");
    }
}
