//! Query understanding: intent classification, entity extraction, and
//! query expansion.
//!
//! Intent classification is zero-shot over a fixed label set using lexical
//! cue scoring, so it stays deterministic and fully local. Entities are
//! code-identifier-like tokens, quoted spans, and path-like tokens.
//! Expansions are intent-specific templates that improve retrieval recall;
//! duplicates are folded case-insensitively.

use std::collections::HashSet;
use std::sync::LazyLock;

use regex::Regex;
use serde::{Deserialize, Serialize};

static CODE_IDENTIFIER: LazyLock<Regex> = LazyLock::new(|| {
    // snake_case, CamelCase, dotted or :: qualified names
    Regex::new(r"\b(?:[A-Za-z_][A-Za-z0-9_]*(?:::|\.)[A-Za-z_][A-Za-z0-9_:.]*|[a-z]+_[a-z0-9_]+|[A-Z][a-z0-9]+(?:[A-Z][a-z0-9]+)+)\b").unwrap()
});
static QUOTED_SPAN: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r#"`([^`]+)`|"([^"]+)"|'([^']+)'"#).unwrap());
static PATH_LIKE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\b[\w.-]+(?:/[\w.-]+)+\b").unwrap());

const STOPWORDS: &[&str] = &[
    "a", "an", "and", "are", "can", "do", "does", "for", "how", "i", "in", "is", "it", "of",
    "or", "the", "this", "to", "what", "when", "where", "which", "why", "you",
];

/// Query intent over a fixed label set.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Intent {
    /// "what is X"
    Definition,
    /// "how is X implemented"
    Implementation,
    /// "where is X"
    Location,
    /// "how do I use X"
    Usage,
    /// "why does X fail"
    Debug,
    /// Anything else
    Other,
}

impl Intent {
    /// Stable label string.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Intent::Definition => "definition",
            Intent::Implementation => "implementation",
            Intent::Location => "location",
            Intent::Usage => "usage",
            Intent::Debug => "debug",
            Intent::Other => "other",
        }
    }
}

/// A named entity extracted from the query.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Entity {
    /// Entity text as it appeared
    pub text: String,
    /// Entity label (`code_identifier`, `quoted`, `path`)
    pub label: String,
}

/// The structured result of query understanding.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UnderstoodQuery {
    /// The query as asked
    pub original: String,
    /// Classified intent
    pub intent: Intent,
    /// Classification confidence in [0, 1]
    pub intent_confidence: f32,
    /// Extracted entities
    pub entities: Vec<Entity>,
    /// Deduplicated salient terms for sparse search
    pub search_terms: Vec<String>,
    /// Query variants to retrieve with (always contains the original)
    pub expanded_queries: Vec<String>,
}

impl UnderstoodQuery {
    /// The degraded form used when understanding is disabled or fails:
    /// intent `other`, the original query as the only expansion.
    #[must_use]
    pub fn minimal(query: &str) -> Self {
        Self {
            original: query.to_string(),
            intent: Intent::Other,
            intent_confidence: 1.0,
            entities: Vec::new(),
            search_terms: Vec::new(),
            expanded_queries: vec![query.to_string()],
        }
    }
}

/// Intent cue table: `(intent, cue, weight)`.
const INTENT_CUES: &[(Intent, &str, f32)] = &[
    (Intent::Definition, "what is", 1.0),
    (Intent::Definition, "what are", 1.0),
    (Intent::Definition, "define", 0.9),
    (Intent::Definition, "definition", 0.9),
    (Intent::Definition, "meaning of", 0.8),
    (Intent::Implementation, "how is", 0.8),
    (Intent::Implementation, "how does", 0.8),
    (Intent::Implementation, "implemented", 1.0),
    (Intent::Implementation, "implementation", 1.0),
    (Intent::Implementation, "source code", 0.9),
    (Intent::Implementation, "internals", 0.7),
    (Intent::Location, "where is", 1.0),
    (Intent::Location, "where are", 1.0),
    (Intent::Location, "which file", 1.0),
    (Intent::Location, "located", 0.8),
    (Intent::Location, "find the", 0.5),
    (Intent::Usage, "how to use", 1.0),
    (Intent::Usage, "how do i", 0.8),
    (Intent::Usage, "example", 0.9),
    (Intent::Usage, "usage", 0.9),
    (Intent::Usage, "call", 0.4),
    (Intent::Debug, "fix", 0.9),
    (Intent::Debug, "error", 0.9),
    (Intent::Debug, "bug", 0.9),
    (Intent::Debug, "fails", 0.8),
    (Intent::Debug, "broken", 0.8),
    (Intent::Debug, "crash", 0.8),
    (Intent::Debug, "debug", 1.0),
];

/// Coordinates intent classification, entity extraction, and expansion.
#[derive(Debug, Clone, Default)]
pub struct QueryUnderstanding;

impl QueryUnderstanding {
    /// Create the understanding layer.
    #[must_use]
    pub fn new() -> Self {
        Self
    }

    /// Process a raw query into a structured [`UnderstoodQuery`].
    #[must_use]
    pub fn understand(&self, query: &str) -> UnderstoodQuery {
        let trimmed = query.trim();
        if trimmed.is_empty() {
            return UnderstoodQuery {
                original: query.to_string(),
                intent: Intent::Other,
                intent_confidence: 0.0,
                entities: Vec::new(),
                search_terms: Vec::new(),
                expanded_queries: Vec::new(),
            };
        }

        let (intent, intent_confidence) = classify_intent(trimmed);
        let entities = extract_entities(trimmed);
        let search_terms = search_terms(trimmed, &entities);
        let expanded_queries = expand(trimmed, intent, &entities);

        UnderstoodQuery {
            original: query.to_string(),
            intent,
            intent_confidence,
            entities,
            search_terms,
            expanded_queries,
        }
    }
}

fn classify_intent(query: &str) -> (Intent, f32) {
    let lowered = query.to_lowercase();
    let mut best = (Intent::Other, 0.0f32);
    let mut total = 0.0f32;

    for intent in [
        Intent::Definition,
        Intent::Implementation,
        Intent::Location,
        Intent::Usage,
        Intent::Debug,
    ] {
        let score: f32 = INTENT_CUES
            .iter()
            .filter(|(cue_intent, cue, _)| *cue_intent == intent && lowered.contains(cue))
            .map(|(_, _, weight)| weight)
            .sum();
        total += score;
        if score > best.1 {
            best = (intent, score);
        }
    }

    if best.1 == 0.0 {
        return (Intent::Other, 0.5);
    }
    // Confidence is the winner's share of all matched cue mass.
    (best.0, (best.1 / total).clamp(0.0, 1.0))
}

fn extract_entities(query: &str) -> Vec<Entity> {
    let mut entities = Vec::new();
    let mut seen: HashSet<String> = HashSet::new();

    for capture in QUOTED_SPAN.captures_iter(query) {
        let text = capture
            .get(1)
            .or_else(|| capture.get(2))
            .or_else(|| capture.get(3))
            .map(|m| m.as_str().trim().to_string())
            .unwrap_or_default();
        if !text.is_empty() && seen.insert(text.to_lowercase()) {
            entities.push(Entity { text, label: "quoted".to_string() });
        }
    }
    for found in PATH_LIKE.find_iter(query) {
        let text = found.as_str().to_string();
        if seen.insert(text.to_lowercase()) {
            entities.push(Entity { text, label: "path".to_string() });
        }
    }
    for found in CODE_IDENTIFIER.find_iter(query) {
        let text = found.as_str().to_string();
        if seen.insert(text.to_lowercase()) {
            entities.push(Entity { text, label: "code_identifier".to_string() });
        }
    }

    entities
}

fn search_terms(query: &str, entities: &[Entity]) -> Vec<String> {
    let mut terms: Vec<String> = entities.iter().map(|e| e.text.clone()).collect();
    let mut seen: HashSet<String> = terms.iter().map(|t| t.to_lowercase()).collect();

    for word in query.split(|c: char| !c.is_alphanumeric() && c != '_') {
        let word = word.trim();
        if word.len() < 3 {
            continue;
        }
        let lowered = word.to_lowercase();
        if STOPWORDS.contains(&lowered.as_str()) {
            continue;
        }
        if seen.insert(lowered) {
            terms.push(word.to_string());
        }
    }

    terms
}

fn expand(query: &str, intent: Intent, entities: &[Entity]) -> Vec<String> {
    let mut expansions = vec![query.to_string()];

    if !entities.is_empty() {
        expansions.push(
            entities
                .iter()
                .map(|e| e.text.as_str())
                .collect::<Vec<_>>()
                .join(" "),
        );
    }

    let subject = entities
        .first()
        .map_or(query, |entity| entity.text.as_str());
    match intent {
        Intent::Implementation => {
            expansions.push(format!("how is {subject} implemented"));
            expansions.push(format!("source code for {subject}"));
        }
        Intent::Definition => {
            expansions.push(format!("what is {subject}"));
            expansions.push(format!("definition of {subject}"));
        }
        Intent::Location => {
            expansions.push(format!("where is {subject} defined"));
            expansions.push(format!("file path for {subject}"));
        }
        Intent::Usage => {
            expansions.push(format!("example usage of {subject}"));
            expansions.push(format!("how to use {subject}"));
        }
        Intent::Debug | Intent::Other => {}
    }

    // Case-insensitive dedup, preserving first-seen order.
    let mut seen: HashSet<String> = HashSet::new();
    expansions
        .into_iter()
        .filter(|expansion| seen.insert(expansion.to_lowercase()))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn understanding() -> QueryUnderstanding {
        QueryUnderstanding::new()
    }

    #[test]
    fn definition_intent() {
        let result = understanding().understand("What is the RAG engine?");
        assert_eq!(result.intent, Intent::Definition);
        assert!(result.intent_confidence > 0.0);
        assert!(result.expanded_queries.iter().any(|q| q.contains("definition of")));
    }

    #[test]
    fn implementation_intent_with_identifier() {
        let result = understanding().understand("How is `HybridRetriever` implemented?");
        assert_eq!(result.intent, Intent::Implementation);
        assert!(result.entities.iter().any(|e| e.text == "HybridRetriever"));
        assert!(result
            .expanded_queries
            .iter()
            .any(|q| q.contains("source code for HybridRetriever")));
    }

    #[test]
    fn location_intent_with_path() {
        let result = understanding().understand("Where is src/engine.rs used?");
        assert_eq!(result.intent, Intent::Location);
        assert!(result
            .entities
            .iter()
            .any(|e| e.label == "path" && e.text == "src/engine.rs"));
    }

    #[test]
    fn debug_intent() {
        let result = understanding().understand("Fix the connection error in the indexer");
        assert_eq!(result.intent, Intent::Debug);
    }

    #[test]
    fn unmatched_query_is_other_with_original_expansion() {
        let result = understanding().understand("general overview please");
        assert_eq!(result.intent, Intent::Other);
        assert_eq!(result.expanded_queries[0], "general overview please");
    }

    #[test]
    fn expansions_are_deduplicated_case_insensitively() {
        let result = understanding().understand("what is WHAT IS");
        let mut lowered: Vec<String> = result
            .expanded_queries
            .iter()
            .map(|q| q.to_lowercase())
            .collect();
        lowered.sort();
        let before = lowered.len();
        lowered.dedup();
        assert_eq!(before, lowered.len());
    }

    #[test]
    fn snake_case_identifiers_are_entities() {
        let result = understanding().understand("explain chunk_overlap handling");
        assert!(result
            .entities
            .iter()
            .any(|e| e.label == "code_identifier" && e.text == "chunk_overlap"));
    }

    #[test]
    fn empty_query_yields_empty_understanding() {
        let result = understanding().understand("   ");
        assert_eq!(result.intent, Intent::Other);
        assert_eq!(result.intent_confidence, 0.0);
        assert!(result.expanded_queries.is_empty());
    }

    #[test]
    fn search_terms_skip_stopwords() {
        let result = understanding().understand("what is the semantic chunker");
        assert!(result.search_terms.iter().any(|t| t == "semantic"));
        assert!(result.search_terms.iter().any(|t| t == "chunker"));
        assert!(!result.search_terms.iter().any(|t| t == "the"));
    }

    #[test]
    fn minimal_understanding_shape() {
        let minimal = UnderstoodQuery::minimal("raw query");
        assert_eq!(minimal.intent, Intent::Other);
        assert_eq!(minimal.expanded_queries, vec!["raw query".to_string()]);
    }
}
