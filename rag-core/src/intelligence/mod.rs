//! The intelligence pipeline: query understanding, staged retrieval,
//! evidence extraction, chain-of-thought reasoning, and response
//! synthesis. Every stage emits a typed, inspectable artifact with
//! provenance, and every stage degrades gracefully when disabled or
//! failing.

mod evidence;
mod orchestrator;
mod reasoning;
mod synthesis;
mod understanding;

pub use evidence::{Evidence, EvidenceExtractor, EvidenceSet, EvidenceStrength, EvidenceType};
pub use orchestrator::{
    IntelligentOrchestrator, IntelligentQueryOptions, IntelligentResponse, PipelineMetrics,
    EMPTY_ANSWER,
};
pub use reasoning::{ReasoningChain, ReasoningEngine, ReasoningStep, ReasoningStepType};
pub use synthesis::{ResponseSynthesizer, SourceRef, SynthesizedResponse};
pub use understanding::{Entity, Intent, QueryUnderstanding, UnderstoodQuery};
