//! Response synthesis: the final stage of the intelligence pipeline.
//!
//! Two modes. LLM-polished synthesis builds a prompt embedding the
//! reasoning chain and a token-budgeted slice of the evidence and asks the
//! local model for a clear, cited answer. Template synthesis joins the
//! conclusion step's evidence contents with a short attribution line; it
//! is both the no-LLM mode and the fallback when generation fails.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use super::evidence::{Evidence, EvidenceSet};
use super::reasoning::{ReasoningChain, ReasoningStepType};
use crate::llm::{GenerationOptions, LlmProvider};

/// Rough chars-per-token estimate for the prompt budget.
const CHARS_PER_TOKEN: usize = 4;

/// One deduplicated source behind a response.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SourceRef {
    /// Source file path
    pub file: String,
    /// Evidence type label of the first evidence from this file
    pub r#type: String,
    /// Confidence of that evidence
    pub confidence: f32,
    /// `start-end` line range when known
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub lines: Option<String>,
}

/// Complete response with reasoning transparency.
#[derive(Debug, Clone)]
pub struct SynthesizedResponse {
    /// The query answered
    pub query: String,
    /// Final polished answer
    pub answer: String,
    /// The reasoning chain behind the answer
    pub reasoning_chain: ReasoningChain,
    /// The evidence the chain reasoned over
    pub evidence_set: EvidenceSet,
    /// Overall confidence in [0, 1]
    pub confidence: f32,
    /// Deduplicated source attributions
    pub sources: Vec<SourceRef>,
    /// Citation strings, deduplicated
    pub citations: Vec<String>,
    /// Which synthesis mode produced the answer (`llm` or `template`)
    pub method: &'static str,
}

/// Synthesizes final responses from reasoning chains and evidence.
pub struct ResponseSynthesizer {
    llm: Option<Arc<dyn LlmProvider>>,
    max_prompt_tokens: usize,
}

impl ResponseSynthesizer {
    /// Synthesizer with optional LLM polish.
    #[must_use]
    pub fn new(llm: Option<Arc<dyn LlmProvider>>) -> Self {
        Self {
            llm,
            max_prompt_tokens: 4000,
        }
    }

    /// Override the prompt token budget.
    #[must_use]
    pub fn with_max_prompt_tokens(mut self, max_prompt_tokens: usize) -> Self {
        self.max_prompt_tokens = max_prompt_tokens.max(256);
        self
    }

    /// Whether LLM polish is configured.
    #[must_use]
    pub fn has_llm(&self) -> bool {
        self.llm.is_some()
    }

    /// Produce the final response.
    pub async fn synthesize(
        &self,
        reasoning_chain: ReasoningChain,
        evidence_set: EvidenceSet,
        temperature: f32,
    ) -> SynthesizedResponse {
        let evidence_by_id: std::collections::BTreeMap<&str, &Evidence> = evidence_set
            .evidence
            .iter()
            .map(|e| (e.id.as_str(), e))
            .collect();
        let used: Vec<&Evidence> = reasoning_chain
            .evidence_used
            .iter()
            .filter_map(|id| evidence_by_id.get(id.as_str()).copied())
            .collect();

        let (citations, sources) = citations_and_sources(&used);

        let (mut answer, method) = match &self.llm {
            Some(llm) => match self.llm_synthesize(llm.as_ref(), &reasoning_chain, &used, temperature).await {
                Ok(answer) => (answer, "llm"),
                Err(e) => {
                    warn!(error = %e, "LLM synthesis failed, falling back to template");
                    (template_synthesize(&reasoning_chain, &used), "template")
                }
            },
            None => (template_synthesize(&reasoning_chain, &used), "template"),
        };

        // Chain warnings ride along verbatim.
        if let Some(warning) = reasoning_chain.warnings.first() {
            answer.push_str("\n\nNote: ");
            answer.push_str(warning);
        }

        debug!(
            chars = answer.len(),
            citations = citations.len(),
            method,
            "response synthesized"
        );

        SynthesizedResponse {
            query: reasoning_chain.query.clone(),
            answer,
            confidence: reasoning_chain.overall_confidence,
            reasoning_chain,
            evidence_set,
            sources,
            citations,
            method,
        }
    }

    async fn llm_synthesize(
        &self,
        llm: &dyn LlmProvider,
        chain: &ReasoningChain,
        evidence: &[&Evidence],
        temperature: f32,
    ) -> crate::error::Result<String> {
        let prompt = self.build_prompt(chain, evidence);
        let options = GenerationOptions {
            temperature,
            ..GenerationOptions::default()
        };
        let raw = llm.generate(&prompt, &options).await?;
        let mut answer = raw.trim().to_string();
        if let Some(stripped) = answer.strip_prefix("Answer:") {
            answer = stripped.trim().to_string();
        }
        Ok(answer)
    }

    fn build_prompt(&self, chain: &ReasoningChain, evidence: &[&Evidence]) -> String {
        let max_chars = self.max_prompt_tokens * CHARS_PER_TOKEN;
        let mut parts: Vec<String> = Vec::new();

        parts.push(
            "You are a precise assistant that answers questions based on provided evidence. \
             Your answer must be grounded in the evidence below. Do not speculate or add \
             information not present in the evidence. Be clear, concise, and accurate.\n"
                .to_string(),
        );
        parts.push(format!("Question: {}\n", chain.query));

        parts.push("Reasoning process:".to_string());
        for step in &chain.steps {
            if step.step_type != ReasoningStepType::Uncertainty {
                parts.push(format!("{}. {}", step.step_number, step.content));
            }
        }
        parts.push(String::new());

        parts.push("Evidence:".to_string());
        let mut used_chars: usize = parts.iter().map(String::len).sum();
        for (i, item) in evidence.iter().enumerate() {
            let block = format!("\n[{}] Source: {}\n{}\n", i + 1, item.source_file, item.content);
            if used_chars + block.len() > max_chars {
                parts.push(format!("\n... ({} more sources omitted)", evidence.len() - i));
                break;
            }
            used_chars += block.len();
            parts.push(block);
        }

        parts.push(
            "\nInstructions:\nBased on the reasoning and evidence above, provide a clear, \
             accurate answer. Cite sources using [Source: filename] notation. If the \
             evidence is incomplete, acknowledge this.\n\nAnswer:"
                .to_string(),
        );

        parts.join("\n")
    }
}

fn citations_and_sources(evidence: &[&Evidence]) -> (Vec<String>, Vec<SourceRef>) {
    let mut citations: Vec<String> = Vec::new();
    let mut sources: Vec<SourceRef> = Vec::new();
    let mut seen_files: std::collections::BTreeSet<&str> = std::collections::BTreeSet::new();

    for item in evidence {
        let citation = item.citation();
        if !citations.contains(&citation) {
            citations.push(citation);
        }
        if seen_files.insert(item.source_file.as_str()) {
            sources.push(SourceRef {
                file: item.source_file.clone(),
                r#type: item.evidence_type.as_str().to_string(),
                confidence: item.confidence,
                lines: match (item.source_line_start, item.source_line_end) {
                    (Some(start), Some(end)) => Some(format!("{start}-{end}")),
                    (Some(start), None) => Some(format!("{start}-{start}")),
                    _ => None,
                },
            });
        }
    }

    (citations, sources)
}

/// Template-based synthesis: the conclusion step's evidence contents joined
/// with a short attribution line.
fn template_synthesize(chain: &ReasoningChain, evidence: &[&Evidence]) -> String {
    let mut answer_parts: Vec<String> = Vec::new();

    let conclusion = chain
        .steps
        .iter()
        .rev()
        .find(|s| s.step_type == ReasoningStepType::Conclusion);
    if let Some(conclusion) = conclusion {
        let by_id: std::collections::BTreeMap<&str, &Evidence> =
            evidence.iter().map(|e| (e.id.as_str(), *e)).collect();
        for id in &conclusion.supporting_evidence {
            if let Some(item) = by_id.get(id.as_str()) {
                answer_parts.push(item.content.clone());
            }
        }
    }

    if answer_parts.is_empty() {
        let mut strongest: Vec<&&Evidence> = evidence.iter().collect();
        strongest.sort_by(|a, b| b.confidence.total_cmp(&a.confidence));
        answer_parts = strongest.iter().take(2).map(|e| e.content.clone()).collect();
    }

    if answer_parts.is_empty() {
        return chain.final_answer.clone();
    }

    let mut answer = answer_parts.join("\n\n");
    if evidence.len() > 1 {
        let files: std::collections::BTreeSet<&str> = evidence
            .iter()
            .map(|e| e.source_file.rsplit('/').next().unwrap_or(&e.source_file))
            .collect();
        let names: Vec<&str> = files.into_iter().take(3).collect();
        answer.push_str(&format!(
            "\n\nSynthesized from {} source(s): {}",
            names.len(),
            names.join(", ")
        ));
    }
    answer
}
