//! BM25-Okapi sparse index over the store's documents.
//!
//! Tokenization is a word-boundary regex over lowercased text, matching the
//! dense side's view of the corpus closely enough for rank fusion. The
//! index is immutable once built; the hybrid retriever rebuilds it when the
//! store's document count drifts.

use std::collections::HashMap;
use std::sync::LazyLock;

use regex::Regex;

static TOKEN_PATTERN: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"\w+").unwrap());

const K1: f32 = 1.5;
const B: f32 = 0.75;

/// Split text into lowercased word tokens.
#[must_use]
pub fn tokenize(text: &str) -> Vec<String> {
    TOKEN_PATTERN
        .find_iter(&text.to_lowercase())
        .map(|m| m.as_str().to_string())
        .collect()
}

struct IndexedDoc {
    id: String,
    term_freq: HashMap<String, u32>,
    length: f32,
}

/// Immutable BM25-Okapi index.
pub struct Bm25Index {
    docs: Vec<IndexedDoc>,
    doc_freq: HashMap<String, u32>,
    avg_doc_len: f32,
}

impl Bm25Index {
    /// Build an index over `(id, text)` pairs.
    #[must_use]
    pub fn build(documents: &[(String, String)]) -> Self {
        let mut docs = Vec::with_capacity(documents.len());
        let mut doc_freq: HashMap<String, u32> = HashMap::new();
        let mut total_len = 0.0f32;

        for (id, text) in documents {
            let tokens = tokenize(text);
            let mut term_freq: HashMap<String, u32> = HashMap::new();
            for token in &tokens {
                *term_freq.entry(token.clone()).or_insert(0) += 1;
            }
            for term in term_freq.keys() {
                *doc_freq.entry(term.clone()).or_insert(0) += 1;
            }
            total_len += tokens.len() as f32;
            docs.push(IndexedDoc {
                id: id.clone(),
                term_freq,
                length: tokens.len() as f32,
            });
        }

        let avg_doc_len = if docs.is_empty() { 0.0 } else { total_len / docs.len() as f32 };
        Self { docs, doc_freq, avg_doc_len }
    }

    /// Number of indexed documents.
    #[must_use]
    pub fn len(&self) -> usize {
        self.docs.len()
    }

    /// True when nothing is indexed.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.docs.is_empty()
    }

    fn idf(&self, term: &str) -> f32 {
        let n = self.docs.len() as f32;
        let df = self.doc_freq.get(term).copied().unwrap_or(0) as f32;
        // Okapi idf with the +1 floor that keeps common terms non-negative.
        ((n - df + 0.5) / (df + 0.5) + 1.0).ln()
    }

    fn score_doc(&self, doc: &IndexedDoc, query_tokens: &[String]) -> f32 {
        if self.avg_doc_len == 0.0 {
            return 0.0;
        }
        let mut score = 0.0f32;
        for term in query_tokens {
            let tf = doc.term_freq.get(term).copied().unwrap_or(0) as f32;
            if tf == 0.0 {
                continue;
            }
            let norm = K1 * (1.0 - B + B * doc.length / self.avg_doc_len);
            score += self.idf(term) * tf * (K1 + 1.0) / (tf + norm);
        }
        score
    }

    /// Top-`limit` `(id, score)` pairs for `query`, best first. Documents
    /// scoring zero are omitted; ties break on ascending id.
    #[must_use]
    pub fn top_n(&self, query: &str, limit: usize) -> Vec<(String, f32)> {
        let query_tokens = tokenize(query);
        if query_tokens.is_empty() {
            return Vec::new();
        }

        let mut scored: Vec<(&str, f32)> = self
            .docs
            .iter()
            .map(|doc| (doc.id.as_str(), self.score_doc(doc, &query_tokens)))
            .filter(|(_, score)| *score > 0.0)
            .collect();

        scored.sort_by(|a, b| {
            b.1.partial_cmp(&a.1)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| a.0.cmp(b.0))
        });
        scored.truncate(limit);
        scored
            .into_iter()
            .map(|(id, score)| (id.to_string(), score))
            .collect()
    }
}
