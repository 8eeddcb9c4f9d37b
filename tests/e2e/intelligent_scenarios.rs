//! End-to-end intelligent query scenarios.

use std::path::Path;
use std::sync::Arc;

use rag_core::config::RagConfig;
use rag_core::embeddings::HashEmbeddingProvider;
use rag_core::engine::RagEngine;
use rag_core::indexing::IndexOptions;
use rag_core::intelligence::{IntelligentQueryOptions, ReasoningStepType, EMPTY_ANSWER};
use rag_core::store::StoreRegistry;
use rag_store_redb::RedbVectorStore;
use tempfile::TempDir;

fn write_file(root: &Path, rel: &str, content: &str) {
    let path = root.join(rel);
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).unwrap();
    }
    std::fs::write(path, content).unwrap();
}

fn seed_chunking_repo(repo: &Path) {
    write_file(
        repo,
        "src/chunker.rs",
        "fn chunk_file(content: &str, path: &str) -> Vec<SemanticChunk> {\n    let strategy = strategy_for_extension(path);\n    strategy.split_at_boundaries(content)\n}\n\nfn strategy_for_extension(path: &str) -> ChunkStrategy {\n    match extension_of(path) {\n        \"rs\" => ChunkStrategy::Code,\n        \"md\" => ChunkStrategy::Markdown,\n        _ => ChunkStrategy::Text,\n    }\n}\n",
    );
    write_file(
        repo,
        "docs/chunking.md",
        "# Chunking\n\nChunking is the process of splitting a file into bounded retrieval units at semantic boundaries such as function definitions and markdown headings.\n\n## Example\n\nExample: a Rust source file is chunked at each top-level `fn` so every chunk stays a coherent unit.\n",
    );
    write_file(
        repo,
        "docs/architecture.md",
        "# Architecture\n\nThe indexing pipeline feeds the chunker, and chunk embeddings land in the vector store with their metadata.\n",
    );
}

async fn engine_over(store_dir: &Path) -> RagEngine {
    let mut registry = StoreRegistry::new();
    RedbVectorStore::register(&mut registry);
    let config = RagConfig {
        vector_store_provider: "local_persistent".to_string(),
        vector_store_path: store_dir.to_string_lossy().into_owned(),
        use_reranker: false,
        min_chunk_size: 30,
        ..RagConfig::default()
    };
    RagEngine::with_providers(
        config,
        &registry,
        Arc::new(HashEmbeddingProvider::new(256)),
        None,
    )
    .await
    .unwrap()
}

#[tokio::test]
async fn intelligent_query_with_reasoning() {
    let repo = TempDir::new().unwrap();
    let store_dir = TempDir::new().unwrap();
    seed_chunking_repo(repo.path());

    let engine = engine_over(store_dir.path()).await;
    engine.index(repo.path(), &IndexOptions::default()).await.unwrap();

    let options = IntelligentQueryOptions {
        include_reasoning: true,
        include_metrics: true,
        ..IntelligentQueryOptions::default()
    };
    let response = engine
        .intelligent_query("how is chunking implemented?", &options)
        .await
        .unwrap();

    // Confidence in (0, 1].
    assert!(response.confidence > 0.0 && response.confidence <= 1.0);

    // The chain ends in a conclusion and contains at least one inference.
    let reasoning = response.reasoning.expect("reasoning requested");
    assert_eq!(
        reasoning.steps.last().unwrap().step_type,
        ReasoningStepType::Conclusion
    );
    assert!(reasoning
        .steps
        .iter()
        .any(|step| step.step_type == ReasoningStepType::Inference));

    // Citations are non-empty and each cites a file whose content
    // mentions chunking.
    assert!(!response.citations.is_empty());
    for citation in &response.citations {
        let file = citation.split(':').next().unwrap();
        let text = std::fs::read_to_string(repo.path().join(file)).unwrap();
        assert!(
            text.to_lowercase().contains("chunk"),
            "citation {citation} does not reference chunking content"
        );
    }

    // Metrics reflect the run.
    let metrics = response.metrics.expect("metrics requested");
    assert_eq!(metrics.intent, "implementation");
    assert!(metrics.chunks_retrieved > 0);
    assert!(metrics.evidence_extracted > 0);
    assert!(metrics.reasoning_steps >= 2);
    assert!((metrics.final_confidence - response.confidence).abs() < f32::EPSILON);
}

#[tokio::test]
async fn intelligent_query_on_empty_store_is_canned() {
    let store_dir = TempDir::new().unwrap();
    let engine = engine_over(store_dir.path()).await;

    let response = engine
        .intelligent_query("how is chunking implemented?", &IntelligentQueryOptions::default())
        .await
        .unwrap();
    assert_eq!(response.answer, EMPTY_ANSWER);
    assert_eq!(response.confidence, 0.0);
    assert!(response.citations.is_empty());
}

#[tokio::test]
async fn reasoning_is_omitted_unless_requested() {
    let repo = TempDir::new().unwrap();
    let store_dir = TempDir::new().unwrap();
    seed_chunking_repo(repo.path());

    let engine = engine_over(store_dir.path()).await;
    engine.index(repo.path(), &IndexOptions::default()).await.unwrap();

    let response = engine
        .intelligent_query("what is chunking?", &IntelligentQueryOptions::default())
        .await
        .unwrap();
    assert!(response.reasoning.is_none());
    assert!(response.metrics.is_none());
    assert!(!response.answer.is_empty());
}

#[tokio::test]
async fn definition_query_classifies_intent_and_answers() {
    let repo = TempDir::new().unwrap();
    let store_dir = TempDir::new().unwrap();
    seed_chunking_repo(repo.path());

    let engine = engine_over(store_dir.path()).await;
    engine.index(repo.path(), &IndexOptions::default()).await.unwrap();

    let options = IntelligentQueryOptions {
        include_metrics: true,
        ..IntelligentQueryOptions::default()
    };
    let response = engine
        .intelligent_query("what is chunking?", &options)
        .await
        .unwrap();
    assert_eq!(response.metrics.unwrap().intent, "definition");
    assert!(response.confidence > 0.0);
}
