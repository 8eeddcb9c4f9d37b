//! End-to-end engine scenarios over the persistent backend.
//!
//! Cold index, no-op incremental, single-file modification, hybrid query,
//! and dimension-mismatch recovery, driven through the engine façade with
//! the deterministic hash embedding provider (no network required).

use std::path::Path;
use std::sync::Arc;

use rag_core::config::RagConfig;
use rag_core::embeddings::HashEmbeddingProvider;
use rag_core::engine::{QueryOptions, RagEngine};
use rag_core::indexing::{FileTracker, IndexOptions};
use rag_core::store::StoreRegistry;
use rag_core::types::MetadataValue;
use rag_store_libsql::LibsqlVectorStore;
use rag_store_redb::RedbVectorStore;
use tempfile::TempDir;

fn full_registry() -> StoreRegistry {
    let mut registry = StoreRegistry::new();
    RedbVectorStore::register(&mut registry);
    LibsqlVectorStore::register(&mut registry);
    registry
}

fn config_for(store_dir: &Path) -> RagConfig {
    RagConfig {
        vector_store_provider: "local_persistent".to_string(),
        vector_store_path: store_dir.to_string_lossy().into_owned(),
        chunk_size: 1000,
        chunk_overlap: 100,
        min_chunk_size: 50,
        use_hybrid: true,
        use_reranker: true,
        // A dead loopback port: reranking degrades instead of ranking.
        cross_encoder_base_url: "http://127.0.0.1:9".to_string(),
        ..RagConfig::default()
    }
}

async fn engine_with_dim(store_dir: &Path, dim: usize) -> RagEngine {
    let registry = full_registry();
    RagEngine::with_providers(
        config_for(store_dir),
        &registry,
        Arc::new(HashEmbeddingProvider::new(dim)),
        None,
    )
    .await
    .unwrap()
}

/// A 20-file fixture: 3 small files (≤ 1 KiB) and 17 mid-sized files
/// (2–50 KiB), mixing markdown, prose, and code.
fn seed_twenty_file_repo(repo: &Path) {
    let small = [
        ("README.md", "# RAG Engine\n\nThe RAG engine ingests this repository and answers questions with cited sources drawn from the index.\n"),
        ("NOTES.txt", "Operational notes: run a full index before the first query so the store is warm and the tracker manifest exists.\n"),
        ("docs/intro.md", "# Introduction\n\nThis fixture exists to exercise indexing end to end with realistic file size diversity.\n"),
    ];
    for (rel, content) in small {
        write_file(repo, rel, content);
    }

    for i in 0..17 {
        let body = format!(
            "fn handler_{i}(input: Request) -> Response {{\n    let parsed = parse_request_body(input);\n    let validated = validate_against_schema(parsed);\n    respond_with_result(validated)\n}}\n\n"
        );
        // 2 KiB .. ~40 KiB of repeated top-level functions.
        let repeats = 12 + i * 12;
        let mut content = String::new();
        for r in 0..repeats {
            content.push_str(&body.replace("handler_", &format!("handler_{r}_")));
        }
        write_file(repo, &format!("src/module_{i:02}.rs"), &content);
    }
}

fn write_file(root: &Path, rel: &str, content: &str) {
    let path = root.join(rel);
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).unwrap();
    }
    std::fs::write(path, content).unwrap();
}

#[tokio::test]
async fn cold_index_twenty_files() {
    let repo = TempDir::new().unwrap();
    let store_dir = TempDir::new().unwrap();
    seed_twenty_file_repo(repo.path());

    let engine = engine_with_dim(store_dir.path(), 384).await;
    let report = engine.index(repo.path(), &IndexOptions::default()).await.unwrap();

    assert_eq!(report.files_processed, 20);
    assert!(report.chunks_created >= 20);
    assert_eq!(report.chunks_failed, 0);
    assert!(report.bytes_read > 0);

    let tracker = FileTracker::new(store_dir.path());
    assert_eq!(tracker.file_count(), 20);

    let stats = engine.stats().await.unwrap();
    assert_eq!(stats.document_count, report.chunks_created);
    assert_eq!(stats.dimension, 384);
}

#[tokio::test]
async fn noop_incremental_after_cold_index() {
    let repo = TempDir::new().unwrap();
    let store_dir = TempDir::new().unwrap();
    seed_twenty_file_repo(repo.path());

    let engine = engine_with_dim(store_dir.path(), 384).await;
    engine.index(repo.path(), &IndexOptions::default()).await.unwrap();
    let count = engine.stats().await.unwrap().document_count;
    let updated_before = FileTracker::new(store_dir.path()).last_updated().to_string();

    let report = engine.index(repo.path(), &IndexOptions::default()).await.unwrap();
    assert_eq!(report.files_processed, 0);
    assert_eq!(report.chunks_created, 0);
    assert_eq!(engine.stats().await.unwrap().document_count, count);

    let updated_after = FileTracker::new(store_dir.path()).last_updated().to_string();
    assert!(updated_after >= updated_before);
    assert!(!updated_after.is_empty());
}

#[tokio::test]
async fn single_file_modification_reindexes_only_that_file() {
    let repo = TempDir::new().unwrap();
    let store_dir = TempDir::new().unwrap();
    seed_twenty_file_repo(repo.path());

    let engine = engine_with_dim(store_dir.path(), 384).await;
    engine.index(repo.path(), &IndexOptions::default()).await.unwrap();

    // Append a new top-level function to one module.
    let target = repo.path().join("src/module_00.rs");
    let mut content = std::fs::read_to_string(&target).unwrap();
    content.push_str(
        "\nfn appended_afterwards(input: Request) -> Response {\n    respond_with_result(validate_against_schema(parse_request_body(input)))\n}\n",
    );
    std::fs::write(&target, &content).unwrap();

    let report = engine.index(repo.path(), &IndexOptions::default()).await.unwrap();
    assert_eq!(report.files_processed, 1);

    let tracker = FileTracker::new(store_dir.path());
    let state = tracker.get_file_state("src/module_00.rs").unwrap();
    let expected = rag_core::indexing::compute_file_hash(&target).unwrap();
    assert_eq!(state.file_hash, expected);
}

#[tokio::test]
async fn hybrid_query_returns_bounded_distances_and_relevant_top_source() {
    let repo = TempDir::new().unwrap();
    let store_dir = TempDir::new().unwrap();
    seed_twenty_file_repo(repo.path());

    let engine = engine_with_dim(store_dir.path(), 384).await;
    engine.index(repo.path(), &IndexOptions::default()).await.unwrap();

    let options = QueryOptions {
        top_k: Some(5),
        ..QueryOptions::default()
    };
    let response = engine.query("what is the RAG engine?", &options).await.unwrap();

    assert_eq!(response.sources.len(), 5);
    for source in &response.sources {
        assert!(
            (0.0..=1.0).contains(&source.distance),
            "distance {} out of [0, 1]",
            source.distance
        );
    }

    // The top source's file actually mentions RAG.
    let top_path = response.sources[0]
        .metadata
        .get("path")
        .and_then(MetadataValue::as_str)
        .expect("top source carries a path");
    let text = std::fs::read_to_string(repo.path().join(top_path)).unwrap();
    assert!(text.to_lowercase().contains("rag"), "top source {top_path} does not mention RAG");
}

#[tokio::test]
async fn dimension_mismatch_recovery() {
    let repo = TempDir::new().unwrap();
    let store_dir = TempDir::new().unwrap();
    seed_twenty_file_repo(repo.path());

    // Populate with 384-dim vectors.
    let engine_384 = engine_with_dim(store_dir.path(), 384).await;
    engine_384.index(repo.path(), &IndexOptions::default()).await.unwrap();
    assert_eq!(engine_384.stats().await.unwrap().dimension, 384);
    drop(engine_384);

    // Swap to a 768-dim provider; the store resets and rebuilds.
    let engine_768 = engine_with_dim(store_dir.path(), 768).await;
    let report = engine_768.index(repo.path(), &IndexOptions::default()).await.unwrap();
    assert_eq!(report.files_processed, 20);

    let stats = engine_768.stats().await.unwrap();
    assert_eq!(stats.dimension, 768);
    assert_eq!(stats.document_count, report.chunks_created);
}

#[tokio::test]
async fn remote_sql_backend_works_through_the_engine() {
    let repo = TempDir::new().unwrap();
    let store_dir = TempDir::new().unwrap();
    seed_twenty_file_repo(repo.path());

    let registry = full_registry();
    let config = RagConfig {
        vector_store_provider: "remote_sql".to_string(),
        use_reranker: false,
        ..config_for(store_dir.path())
    };
    let engine = RagEngine::with_providers(
        config,
        &registry,
        Arc::new(HashEmbeddingProvider::new(128)),
        None,
    )
    .await
    .unwrap();

    let report = engine.index(repo.path(), &IndexOptions::default()).await.unwrap();
    assert_eq!(report.files_processed, 20);

    let response = engine
        .query("what is the RAG engine?", &QueryOptions::default())
        .await
        .unwrap();
    assert!(!response.sources.is_empty());
}
