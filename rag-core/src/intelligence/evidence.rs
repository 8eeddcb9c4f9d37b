//! Typed evidence extracted from retrieved chunks.
//!
//! Every piece of evidence keeps its provenance: the chunk id and source
//! file it came from, line bounds when known, and a confidence derived
//! from retrieval distance and content quality. Contradiction detection
//! matches opposing-polarity statements against evidence already accepted
//! for the same query.

use std::collections::BTreeMap;
use std::sync::LazyLock;

use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::store::QueryOutcome;
use crate::types::{Metadata, MetadataValue};

static DEFINITION_CUE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)\b(?:is a|is an|is the|are the|refers to|defined as|stands for|means)\b")
        .unwrap()
});
static EXAMPLE_CUE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)\bexample\b|\busage\b|\be\.g\.|```").unwrap());
/// `subject is [not] predicate` statements used for polarity matching.
static POLARITY_STATEMENT: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)\b([a-z_][a-z0-9_]*)\s+(?:is|are|does|should|can)\s+(not\s+)?([a-z][a-z0-9_]*)")
        .unwrap()
});

/// Category of an evidence piece.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EvidenceType {
    /// Explains what something is
    Definition,
    /// Shows how something is built (code)
    Implementation,
    /// Demonstrates usage
    Example,
    /// A plain statement of fact
    Assertion,
    /// Conflicts with other accepted evidence
    Contradiction,
}

impl EvidenceType {
    /// Stable label string.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            EvidenceType::Definition => "definition",
            EvidenceType::Implementation => "implementation",
            EvidenceType::Example => "example",
            EvidenceType::Assertion => "assertion",
            EvidenceType::Contradiction => "contradiction",
        }
    }
}

/// Strength bucket for an evidence piece.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EvidenceStrength {
    /// High-confidence, directly relevant
    Strong,
    /// Usable but not decisive
    Moderate,
    /// Tangential
    Weak,
    /// Conflicts with other evidence
    Contradictory,
}

/// A typed, provenanced fact extracted from one retrieved chunk.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Evidence {
    /// Stable id within the evidence set (`ev_<n>`)
    pub id: String,
    /// The chunk text backing this evidence
    pub content: String,
    /// Category
    pub evidence_type: EvidenceType,
    /// Strength bucket
    pub strength: EvidenceStrength,
    /// Confidence in [0, 1]
    pub confidence: f32,
    /// Originating chunk id
    pub source_chunk_id: String,
    /// Originating file path
    pub source_file: String,
    /// First line in the source file, when known
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_line_start: Option<usize>,
    /// Last line in the source file, when known
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_line_end: Option<usize>,
    /// Whether the content is code
    pub is_code: bool,
    /// Language hint for code evidence
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub code_language: Option<String>,
}

impl Evidence {
    /// Human-readable citation string.
    #[must_use]
    pub fn citation(&self) -> String {
        match (self.source_line_start, self.source_line_end) {
            (Some(start), Some(end)) if end > start => {
                format!("{}:{start}-{end}", self.source_file)
            }
            (Some(start), _) => format!("{}:{start}", self.source_file),
            _ => self.source_file.clone(),
        }
    }
}

/// The evidence extracted for one query, with derived views.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EvidenceSet {
    /// The query the evidence answers
    pub query: String,
    /// All accepted evidence
    pub evidence: Vec<Evidence>,
    /// How many retrieved chunks were considered
    pub total_chunks_processed: usize,
}

impl EvidenceSet {
    /// Group evidence by type.
    #[must_use]
    pub fn by_type(&self) -> BTreeMap<EvidenceType, Vec<&Evidence>> {
        let mut grouped: BTreeMap<EvidenceType, Vec<&Evidence>> = BTreeMap::new();
        for item in &self.evidence {
            grouped.entry(item.evidence_type).or_default().push(item);
        }
        grouped
    }

    /// Group evidence by source file.
    #[must_use]
    pub fn by_source(&self) -> BTreeMap<&str, Vec<&Evidence>> {
        let mut grouped: BTreeMap<&str, Vec<&Evidence>> = BTreeMap::new();
        for item in &self.evidence {
            grouped.entry(item.source_file.as_str()).or_default().push(item);
        }
        grouped
    }

    /// Evidence in the strong bucket.
    #[must_use]
    pub fn strong_evidence(&self) -> Vec<&Evidence> {
        self.evidence
            .iter()
            .filter(|e| e.strength == EvidenceStrength::Strong)
            .collect()
    }

    /// Whether any contradictory evidence was accepted.
    #[must_use]
    pub fn has_contradictions(&self) -> bool {
        self.evidence
            .iter()
            .any(|e| e.strength == EvidenceStrength::Contradictory)
    }

    /// Mean evidence confidence, 0 when empty.
    #[must_use]
    pub fn average_confidence(&self) -> f32 {
        if self.evidence.is_empty() {
            return 0.0;
        }
        self.evidence.iter().map(|e| e.confidence).sum::<f32>() / self.evidence.len() as f32
    }
}

/// Transforms retrieved chunks into typed evidence.
#[derive(Debug, Clone, Default)]
pub struct EvidenceExtractor;

impl EvidenceExtractor {
    /// Create an extractor.
    #[must_use]
    pub fn new() -> Self {
        Self
    }

    /// Extract evidence from a retrieval outcome.
    #[must_use]
    pub fn extract(&self, query: &str, outcome: &QueryOutcome) -> EvidenceSet {
        let mut evidence: Vec<Evidence> = Vec::new();

        for (i, (document, metadata)) in outcome
            .documents
            .iter()
            .zip(outcome.metadatas.iter())
            .enumerate()
        {
            if document.trim().is_empty() {
                continue;
            }
            let distance = outcome.distances.get(i).copied().unwrap_or(1.0);
            let chunk_id = outcome.ids.get(i).cloned().unwrap_or_default();

            let source_file = metadata
                .get("path")
                .and_then(MetadataValue::as_str)
                .unwrap_or("unknown")
                .to_string();
            let is_code = chunk_type(metadata).is_some_and(|t| t.starts_with("code"));
            let code_language = is_code.then(|| language_of(&source_file)).flatten();

            let mut evidence_type = classify(document, is_code);
            // Contradiction check against evidence accepted so far.
            if evidence_type == EvidenceType::Assertion && contradicts_any(document, &evidence) {
                evidence_type = EvidenceType::Contradiction;
            }

            let confidence = confidence_of(distance, document, evidence_type);
            let strength = if evidence_type == EvidenceType::Contradiction {
                EvidenceStrength::Contradictory
            } else if confidence >= 0.75 {
                EvidenceStrength::Strong
            } else if confidence >= 0.5 {
                EvidenceStrength::Moderate
            } else {
                EvidenceStrength::Weak
            };

            evidence.push(Evidence {
                id: format!("ev_{:03}", evidence.len() + 1),
                content: document.clone(),
                evidence_type,
                strength,
                confidence,
                source_chunk_id: chunk_id,
                source_file,
                source_line_start: line_of(metadata, "start_line"),
                source_line_end: line_of(metadata, "end_line"),
                is_code,
                code_language,
            });
        }

        EvidenceSet {
            query: query.to_string(),
            evidence,
            total_chunks_processed: outcome.documents.len(),
        }
    }
}

fn chunk_type(metadata: &Metadata) -> Option<&str> {
    metadata.get("type").and_then(MetadataValue::as_str)
}

fn line_of(metadata: &Metadata, key: &str) -> Option<usize> {
    metadata
        .get(key)
        .and_then(MetadataValue::as_int)
        .and_then(|v| usize::try_from(v).ok())
}

fn language_of(path: &str) -> Option<String> {
    let ext = path.rsplit_once('.')?.1;
    let language = match ext {
        "rs" => "rust",
        "py" => "python",
        "js" | "jsx" => "javascript",
        "ts" | "tsx" => "typescript",
        "go" => "go",
        "c" | "h" => "c",
        "cpp" | "hpp" => "cpp",
        "java" => "java",
        _ => return None,
    };
    Some(language.to_string())
}

fn classify(document: &str, is_code: bool) -> EvidenceType {
    if is_code {
        return EvidenceType::Implementation;
    }
    if DEFINITION_CUE.is_match(document) {
        return EvidenceType::Definition;
    }
    if EXAMPLE_CUE.is_match(document) {
        return EvidenceType::Example;
    }
    EvidenceType::Assertion
}

/// Opposing-polarity detection: the same `subject … predicate` statement
/// appearing both negated and plain across two texts.
fn contradicts_any(document: &str, accepted: &[Evidence]) -> bool {
    let statements = polarity_statements(document);
    if statements.is_empty() {
        return false;
    }
    accepted.iter().any(|prior| {
        polarity_statements(&prior.content).iter().any(|(subject, negated, predicate)| {
            statements
                .iter()
                .any(|(s, n, p)| s == subject && p == predicate && n != negated)
        })
    })
}

fn polarity_statements(text: &str) -> Vec<(String, bool, String)> {
    POLARITY_STATEMENT
        .captures_iter(text)
        .map(|capture| {
            (
                capture[1].to_lowercase(),
                capture.get(2).is_some(),
                capture[3].to_lowercase(),
            )
        })
        .collect()
}

/// Confidence from retrieval distance, content quality, and type.
fn confidence_of(distance: f32, document: &str, evidence_type: EvidenceType) -> f32 {
    // Cosine distance in [0, 2] maps to similarity in [0, 1].
    let mut confidence = 1.0 - (distance / 2.0).clamp(0.0, 1.0);

    // Mid-sized chunks carry the clearest signal.
    let len = document.len();
    if (100..=2000).contains(&len) {
        confidence += 0.05;
    } else if len < 40 {
        confidence -= 0.1;
    }

    if evidence_type == EvidenceType::Definition {
        confidence += 0.05;
    }

    confidence.clamp(0.0, 1.0)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn outcome(entries: &[(&str, &str, &str, f32)]) -> QueryOutcome {
        let mut outcome = QueryOutcome::default();
        for (id, text, chunk_type, distance) in entries {
            outcome.ids.push((*id).to_string());
            outcome.documents.push((*text).to_string());
            let mut metadata = Metadata::new();
            let path = id.rsplit_once('#').map_or(*id, |(p, _)| p);
            metadata.insert("path".to_string(), path.into());
            metadata.insert("type".to_string(), (*chunk_type).into());
            metadata.insert("start_line".to_string(), MetadataValue::Int(1));
            metadata.insert("end_line".to_string(), MetadataValue::Int(12));
            outcome.metadatas.push(metadata);
            outcome.distances.push(*distance);
        }
        outcome
    }

    #[test]
    fn code_chunks_become_implementation_evidence() {
        let set = EvidenceExtractor::new().extract(
            "how is chunking implemented",
            &outcome(&[(
                "chunker.rs#0",
                "fn chunk_file(content: &str) -> Vec<SemanticChunk> { .. }",
                "code_block",
                0.2,
            )]),
        );
        assert_eq!(set.evidence.len(), 1);
        assert_eq!(set.evidence[0].evidence_type, EvidenceType::Implementation);
        assert!(set.evidence[0].is_code);
        assert_eq!(set.evidence[0].code_language.as_deref(), Some("rust"));
    }

    #[test]
    fn definition_cues_are_detected() {
        let set = EvidenceExtractor::new().extract(
            "what is the tracker",
            &outcome(&[(
                "docs/tracker.md#0",
                "The tracker is a manifest of indexed files keyed by content hash.",
                "markdown_section",
                0.1,
            )]),
        );
        assert_eq!(set.evidence[0].evidence_type, EvidenceType::Definition);
    }

    #[test]
    fn example_cues_are_detected() {
        let set = EvidenceExtractor::new().extract(
            "usage",
            &outcome(&[(
                "docs/guide.md#0",
                "Example: run the indexer before the first query to warm the store.",
                "markdown_section",
                0.3,
            )]),
        );
        assert_eq!(set.evidence[0].evidence_type, EvidenceType::Example);
    }

    #[test]
    fn opposing_polarity_marks_contradiction() {
        let set = EvidenceExtractor::new().extract(
            "is the cache enabled",
            &outcome(&[
                (
                    "docs/a.md#0",
                    "After the migration the cache is enabled for every deployment profile we ship.",
                    "markdown_section",
                    0.1,
                ),
                (
                    "docs/b.md#0",
                    "Note that in practice the cache is not enabled unless the operator opts in.",
                    "markdown_section",
                    0.15,
                ),
            ]),
        );
        assert_eq!(set.evidence.len(), 2);
        assert_eq!(set.evidence[1].evidence_type, EvidenceType::Contradiction);
        assert_eq!(set.evidence[1].strength, EvidenceStrength::Contradictory);
        assert!(set.has_contradictions());
    }

    #[test]
    fn close_distance_yields_strong_evidence() {
        let set = EvidenceExtractor::new().extract(
            "query",
            &outcome(&[(
                "a.md#0",
                "A body of text that is long enough to be considered quality evidence and then some, \
                 spanning more than one hundred characters comfortably.",
                "markdown_section",
                0.1,
            )]),
        );
        assert_eq!(set.evidence[0].strength, EvidenceStrength::Strong);
        assert_eq!(set.strong_evidence().len(), 1);
    }

    #[test]
    fn far_distance_yields_weak_evidence() {
        let set = EvidenceExtractor::new().extract(
            "query",
            &outcome(&[("a.md#0", "Marginally related text body.", "markdown_section", 1.4)]),
        );
        assert_eq!(set.evidence[0].strength, EvidenceStrength::Weak);
    }

    #[test]
    fn derived_views_are_consistent() {
        let set = EvidenceExtractor::new().extract(
            "query",
            &outcome(&[
                ("a.rs#0", "fn a() {}", "code_block", 0.2),
                ("b.md#0", "The engine is the facade over every subsystem.", "markdown_section", 0.2),
                ("a.rs#1", "fn b() {}", "code_block", 0.4),
            ]),
        );
        assert_eq!(set.total_chunks_processed, 3);
        assert_eq!(set.by_source().len(), 2);
        assert_eq!(
            set.by_type().get(&EvidenceType::Implementation).map(Vec::len),
            Some(2)
        );
        let avg = set.average_confidence();
        assert!(avg > 0.0 && avg <= 1.0);
    }

    #[test]
    fn citation_includes_line_range() {
        let set = EvidenceExtractor::new().extract(
            "query",
            &outcome(&[("src/a.rs#0", "fn a() { body() }", "code_block", 0.2)]),
        );
        assert_eq!(set.evidence[0].citation(), "src/a.rs:1-12");
    }

    #[test]
    fn empty_documents_are_skipped() {
        let set = EvidenceExtractor::new().extract(
            "query",
            &outcome(&[("a.md#0", "   ", "markdown_section", 0.2)]),
        );
        assert!(set.evidence.is_empty());
        assert_eq!(set.total_chunks_processed, 1);
    }
}
