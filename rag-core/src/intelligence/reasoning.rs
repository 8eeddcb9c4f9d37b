//! Chain-of-thought reasoning over extracted evidence.
//!
//! The chain is linear: observation first, conclusion last, with
//! validation, typed inferences, synthesis, and uncertainty steps emitted
//! in a fixed order when their preconditions hold. Steps reference
//! evidence by id so every claim stays traceable.

use serde::{Deserialize, Serialize};

use super::evidence::{Evidence, EvidenceSet, EvidenceStrength, EvidenceType};

/// Default minimum strong-evidence count before the chain stops warning.
pub const DEFAULT_MIN_EVIDENCE_FOR_CONFIDENCE: usize = 2;

/// Kind of a reasoning step.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReasoningStepType {
    /// What the evidence shows
    Observation,
    /// A deduction from observations
    Inference,
    /// Combining multiple sources
    Synthesis,
    /// Consistency checking
    Validation,
    /// The final answer
    Conclusion,
    /// Acknowledged gaps
    Uncertainty,
}

impl ReasoningStepType {
    /// Stable label string.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            ReasoningStepType::Observation => "observation",
            ReasoningStepType::Inference => "inference",
            ReasoningStepType::Synthesis => "synthesis",
            ReasoningStepType::Validation => "validation",
            ReasoningStepType::Conclusion => "conclusion",
            ReasoningStepType::Uncertainty => "uncertainty",
        }
    }
}

/// A single step in the reasoning chain.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReasoningStep {
    /// 1-based position in the chain
    pub step_number: usize,
    /// Step kind
    pub step_type: ReasoningStepType,
    /// The reasoning text
    pub content: String,
    /// Evidence ids backing this step
    pub supporting_evidence: Vec<String>,
    /// Step confidence in [0, 1]
    pub confidence: f32,
}

/// Complete chain-of-thought reasoning result.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReasoningChain {
    /// The query reasoned about
    pub query: String,
    /// Ordered steps; the last is always a conclusion
    pub steps: Vec<ReasoningStep>,
    /// Draft answer assembled from the conclusion's evidence
    pub final_answer: String,
    /// Overall confidence in [0, 1]
    pub overall_confidence: f32,
    /// Evidence ids referenced by at least one step
    pub evidence_used: Vec<String>,
    /// Evidence ids no step referenced
    pub evidence_unused: Vec<String>,
    /// Uncertainty warnings accumulated along the way
    pub warnings: Vec<String>,
}

impl ReasoningChain {
    /// Whether the chain clears the confidence bar.
    #[must_use]
    pub fn is_confident(&self) -> bool {
        self.overall_confidence >= 0.7
    }

    /// Whether any uncertainty step was emitted.
    #[must_use]
    pub fn has_gaps(&self) -> bool {
        self.steps
            .iter()
            .any(|step| step.step_type == ReasoningStepType::Uncertainty)
    }

    /// Fallback chain: a single conclusion built from the top evidence.
    #[must_use]
    pub fn single_conclusion(evidence_set: &EvidenceSet) -> Self {
        let top: Vec<&Evidence> = evidence_set.evidence.iter().take(3).collect();
        let answer = top
            .iter()
            .take(2)
            .map(|e| e.content.as_str())
            .collect::<Vec<_>>()
            .join("\n\n");
        let used: Vec<String> = top.iter().map(|e| e.id.clone()).collect();
        let confidence = evidence_set.average_confidence();

        Self {
            query: evidence_set.query.clone(),
            steps: vec![ReasoningStep {
                step_number: 1,
                step_type: ReasoningStepType::Conclusion,
                content: "Based on the retrieved evidence, here is the answer.".to_string(),
                supporting_evidence: used.clone(),
                confidence,
            }],
            final_answer: answer,
            overall_confidence: confidence,
            evidence_used: used,
            evidence_unused: evidence_set
                .evidence
                .iter()
                .skip(3)
                .map(|e| e.id.clone())
                .collect(),
            warnings: Vec::new(),
        }
    }
}

/// Builds transparent reasoning chains from evidence sets.
pub struct ReasoningEngine {
    min_evidence_for_confidence: usize,
}

impl ReasoningEngine {
    /// Engine with the default confidence threshold.
    #[must_use]
    pub fn new() -> Self {
        Self {
            min_evidence_for_confidence: DEFAULT_MIN_EVIDENCE_FOR_CONFIDENCE,
        }
    }

    /// Override the strong-evidence threshold.
    #[must_use]
    pub fn with_min_evidence(mut self, min_evidence: usize) -> Self {
        self.min_evidence_for_confidence = min_evidence.max(1);
        self
    }

    /// Execute reasoning over an evidence set.
    #[must_use]
    pub fn reason(&self, evidence_set: &EvidenceSet) -> ReasoningChain {
        let mut steps: Vec<ReasoningStep> = Vec::new();
        let mut warnings: Vec<String> = Vec::new();
        let strong = evidence_set.strong_evidence();

        steps.push(observation_step(steps.len() + 1, evidence_set, &strong));

        if evidence_set.has_contradictions() {
            steps.push(validation_step(steps.len() + 1, evidence_set));
            warnings.push("Found contradictory evidence - answer may vary by source".to_string());
        }

        let by_type = evidence_set.by_type();
        if let Some(definitions) = by_type.get(&EvidenceType::Definition) {
            if let Some(step) = definition_inference(steps.len() + 1, definitions) {
                steps.push(step);
            }
        }
        if let Some(implementations) = by_type.get(&EvidenceType::Implementation) {
            if let Some(step) = implementation_inference(steps.len() + 1, implementations) {
                steps.push(step);
            }
        }
        if let Some(examples) = by_type.get(&EvidenceType::Example) {
            if let Some(step) = example_inference(steps.len() + 1, examples) {
                steps.push(step);
            }
        }

        if evidence_set.by_source().len() >= 2 {
            steps.push(synthesis_step(steps.len() + 1, evidence_set));
        }

        if strong.len() < self.min_evidence_for_confidence {
            steps.push(uncertainty_step(steps.len() + 1, evidence_set, &strong));
            warnings.push(format!(
                "Limited evidence: only {} strong sources found",
                strong.len()
            ));
        }

        let (conclusion, final_answer) = conclusion_step(steps.len() + 1, evidence_set, &strong);
        steps.push(conclusion);

        let overall_confidence = self.overall_confidence(evidence_set, &steps);

        let mut evidence_used: Vec<String> = Vec::new();
        for step in &steps {
            for id in &step.supporting_evidence {
                if !evidence_used.contains(id) {
                    evidence_used.push(id.clone());
                }
            }
        }
        let evidence_unused: Vec<String> = evidence_set
            .evidence
            .iter()
            .filter(|e| !evidence_used.contains(&e.id))
            .map(|e| e.id.clone())
            .collect();

        ReasoningChain {
            query: evidence_set.query.clone(),
            steps,
            final_answer,
            overall_confidence,
            evidence_used,
            evidence_unused,
            warnings,
        }
    }

    /// `avg_evidence_confidence × 0.7 × penalties + mean(step_conf) × 0.3`,
    /// clamped to [0, 1]. Penalties: 0.7× when strong evidence is below
    /// threshold, 0.8× on contradictions; 1.1× boost when three or more
    /// distinct sources agree.
    fn overall_confidence(&self, evidence_set: &EvidenceSet, steps: &[ReasoningStep]) -> f32 {
        let mut evidence_part = evidence_set.average_confidence();

        if evidence_set.strong_evidence().len() < self.min_evidence_for_confidence {
            evidence_part *= 0.7;
        }
        if evidence_set.has_contradictions() {
            evidence_part *= 0.8;
        }
        if evidence_set.by_source().len() >= 3 {
            evidence_part = (evidence_part * 1.1).min(1.0);
        }

        let step_part = if steps.is_empty() {
            0.0
        } else {
            steps.iter().map(|s| s.confidence).sum::<f32>() / steps.len() as f32
        };

        (evidence_part * 0.7 + step_part * 0.3).clamp(0.0, 1.0)
    }
}

impl Default for ReasoningEngine {
    fn default() -> Self {
        Self::new()
    }
}

fn observation_step(
    step_number: usize,
    evidence_set: &EvidenceSet,
    strong: &[&Evidence],
) -> ReasoningStep {
    if strong.is_empty() {
        ReasoningStep {
            step_number,
            step_type: ReasoningStepType::Observation,
            content: format!(
                "I found {} pieces of evidence, but none are strongly relevant.",
                evidence_set.evidence.len()
            ),
            supporting_evidence: evidence_set
                .evidence
                .iter()
                .take(3)
                .map(|e| e.id.clone())
                .collect(),
            confidence: 0.3,
        }
    } else {
        let sources: std::collections::BTreeSet<&str> =
            strong.iter().map(|e| e.source_file.as_str()).collect();
        ReasoningStep {
            step_number,
            step_type: ReasoningStepType::Observation,
            content: format!(
                "I found {} highly relevant evidence pieces from {} source file(s).",
                strong.len(),
                sources.len()
            ),
            supporting_evidence: strong.iter().take(5).map(|e| e.id.clone()).collect(),
            confidence: (strong.len() as f32 / 5.0).min(1.0),
        }
    }
}

fn validation_step(step_number: usize, evidence_set: &EvidenceSet) -> ReasoningStep {
    let contradictory: Vec<&Evidence> = evidence_set
        .evidence
        .iter()
        .filter(|e| e.strength == EvidenceStrength::Contradictory)
        .collect();
    let sources: std::collections::BTreeSet<&str> =
        contradictory.iter().map(|e| e.source_file.as_str()).collect();

    ReasoningStep {
        step_number,
        step_type: ReasoningStepType::Validation,
        content: format!(
            "Warning: found contradictory information across {} source(s). \
             Prioritizing the most consistent account.",
            sources.len()
        ),
        supporting_evidence: contradictory.iter().take(3).map(|e| e.id.clone()).collect(),
        confidence: 0.6,
    }
}

fn definition_inference(step_number: usize, definitions: &[&Evidence]) -> Option<ReasoningStep> {
    let best = definitions
        .iter()
        .max_by(|a, b| a.confidence.total_cmp(&b.confidence))?;
    Some(ReasoningStep {
        step_number,
        step_type: ReasoningStepType::Inference,
        content: format!(
            "Based on the definition in {}, I can establish the core concept: {}",
            best.source_file,
            snippet(&best.content, 150)
        ),
        supporting_evidence: vec![best.id.clone()],
        confidence: best.confidence,
    })
}

fn implementation_inference(
    step_number: usize,
    implementations: &[&Evidence],
) -> Option<ReasoningStep> {
    if implementations.is_empty() {
        return None;
    }
    let files: std::collections::BTreeSet<&str> = implementations
        .iter()
        .map(|e| e.source_file.as_str())
        .collect();
    let languages: std::collections::BTreeSet<&str> = implementations
        .iter()
        .filter_map(|e| e.code_language.as_deref())
        .collect();
    let language_note = if languages.is_empty() {
        "code".to_string()
    } else {
        languages.into_iter().collect::<Vec<_>>().join(", ")
    };

    Some(ReasoningStep {
        step_number,
        step_type: ReasoningStepType::Inference,
        content: format!(
            "The implementation is found in {} file(s) ({language_note}), showing the \
             concrete realization of the concept.",
            files.len()
        ),
        supporting_evidence: implementations.iter().take(3).map(|e| e.id.clone()).collect(),
        confidence: (implementations.len() as f32 / 3.0).min(1.0),
    })
}

fn example_inference(step_number: usize, examples: &[&Evidence]) -> Option<ReasoningStep> {
    if examples.is_empty() {
        return None;
    }
    Some(ReasoningStep {
        step_number,
        step_type: ReasoningStepType::Inference,
        content: format!(
            "Found {} usage example(s) demonstrating practical application.",
            examples.len()
        ),
        supporting_evidence: examples.iter().take(2).map(|e| e.id.clone()).collect(),
        confidence: 0.7,
    })
}

fn synthesis_step(step_number: usize, evidence_set: &EvidenceSet) -> ReasoningStep {
    let by_source = evidence_set.by_source();
    let names: Vec<&str> = by_source.keys().copied().take(3).collect();
    let suffix = if by_source.len() > 3 { ", ..." } else { "" };

    let supporting_evidence: Vec<String> = by_source
        .values()
        .take(3)
        .filter_map(|evidence| evidence.first().map(|e| e.id.clone()))
        .collect();

    ReasoningStep {
        step_number,
        step_type: ReasoningStepType::Synthesis,
        content: format!(
            "Synthesizing information from {} sources ({}{suffix}).",
            by_source.len(),
            names.join(", ")
        ),
        supporting_evidence,
        confidence: 0.85,
    }
}

fn uncertainty_step(
    step_number: usize,
    evidence_set: &EvidenceSet,
    strong: &[&Evidence],
) -> ReasoningStep {
    ReasoningStep {
        step_number,
        step_type: ReasoningStepType::Uncertainty,
        content: format!(
            "Uncertainty note: only {}/{} evidence pieces are strongly relevant. \
             The answer may be incomplete or based on tangential information.",
            strong.len(),
            evidence_set.evidence.len()
        ),
        supporting_evidence: Vec::new(),
        confidence: 0.4,
    }
}

fn conclusion_step(
    step_number: usize,
    evidence_set: &EvidenceSet,
    strong: &[&Evidence],
) -> (ReasoningStep, String) {
    // Answer from the strongest evidence; fall back to best-confidence.
    let mut pool: Vec<&Evidence> = if strong.is_empty() {
        let mut sorted: Vec<&Evidence> = evidence_set.evidence.iter().collect();
        sorted.sort_by(|a, b| b.confidence.total_cmp(&a.confidence));
        sorted.truncate(3);
        sorted
    } else {
        strong.to_vec()
    };

    let mut answer_parts: Vec<String> = Vec::new();
    let mut used_ids: Vec<String> = Vec::new();

    // Definitions lead, implementations follow, the rest fills in.
    pool.sort_by_key(|e| match e.evidence_type {
        EvidenceType::Definition => 0,
        EvidenceType::Implementation => 1,
        _ => 2,
    });
    for item in &pool {
        if answer_parts.len() >= 3 {
            break;
        }
        match item.evidence_type {
            EvidenceType::Definition => answer_parts.push(item.content.clone()),
            EvidenceType::Implementation => {
                answer_parts.push(format!("Implementation: {}", snippet(&item.content, 200)));
            }
            _ => answer_parts.push(snippet(&item.content, 150)),
        }
        used_ids.push(item.id.clone());
    }

    let final_answer = if answer_parts.is_empty() {
        format!(
            "Based on the available evidence, I cannot provide a confident answer to: '{}'. \
             The retrieved information is only tangentially related.",
            evidence_set.query
        )
    } else {
        let mut answer = answer_parts.join("\n\n");
        let sources: std::collections::BTreeSet<&str> = pool
            .iter()
            .filter(|e| used_ids.contains(&e.id))
            .map(|e| e.source_file.as_str())
            .collect();
        let names: Vec<&str> = sources
            .iter()
            .map(|s| s.rsplit('/').next().unwrap_or(s))
            .take(3)
            .collect();
        answer.push_str(&format!("\n\nSources: {}", names.join(", ")));
        answer
    };

    let step = ReasoningStep {
        step_number,
        step_type: ReasoningStepType::Conclusion,
        content: format!(
            "Conclusion: based on {} pieces of evidence, I can answer the query.",
            used_ids.len()
        ),
        supporting_evidence: used_ids,
        confidence: evidence_set.average_confidence(),
    };

    (step, final_answer)
}

fn snippet(text: &str, limit: usize) -> String {
    if text.chars().count() <= limit {
        return text.to_string();
    }
    let clipped: String = text.chars().take(limit).collect();
    format!("{clipped}...")
}
