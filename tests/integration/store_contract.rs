//! Contract tests shared by every vector store backend.
//!
//! Each backend must honor the same semantics: per-id upsert, cosine
//! ranking, conjunctive metadata filters, dimension guarding, and reset.
//! One suite runs against `in_memory`, `local_persistent`, and
//! `remote_sql`.

use std::sync::Arc;

use rag_core::store::{AddBatch, DeleteSelector, StoreRegistry, StoreSettings, VectorStore};
use rag_core::types::Metadata;
use rag_store_libsql::LibsqlVectorStore;
use rag_store_redb::RedbVectorStore;
use tempfile::TempDir;

fn full_registry() -> StoreRegistry {
    let mut registry = StoreRegistry::new();
    RedbVectorStore::register(&mut registry);
    LibsqlVectorStore::register(&mut registry);
    registry
}

async fn open_store(registry: &StoreRegistry, provider: &str, dir: &TempDir) -> Arc<dyn VectorStore> {
    registry
        .create(
            provider,
            StoreSettings {
                path: dir.path().to_path_buf(),
                collection_name: "contract".to_string(),
            },
        )
        .await
        .unwrap()
}

fn sample_batch() -> AddBatch {
    let entries: Vec<(&str, &str, Vec<f32>)> = vec![
        ("src/a.rs#0", "alpha module source", vec![1.0, 0.0, 0.0]),
        ("src/a.rs#1", "alpha module continued", vec![0.9, 0.1, 0.0]),
        ("src/b.rs#0", "beta module source", vec![0.0, 1.0, 0.0]),
        ("docs/c.md#0", "gamma documentation", vec![0.0, 0.0, 1.0]),
    ];
    AddBatch {
        ids: entries.iter().map(|(id, _, _)| (*id).to_string()).collect(),
        documents: entries.iter().map(|(_, d, _)| (*d).to_string()).collect(),
        embeddings: entries.iter().map(|(_, _, e)| e.clone()).collect(),
        metadatas: entries
            .iter()
            .map(|(id, _, _)| {
                let mut metadata = Metadata::new();
                let path = id.rsplit_once('#').map_or(*id, |(p, _)| p);
                metadata.insert("path".to_string(), path.into());
                metadata
            })
            .collect(),
    }
}

async fn exercise_contract(store: Arc<dyn VectorStore>) {
    // Fresh store: empty, dimensionless.
    assert_eq!(store.count().await.unwrap(), 0);
    assert_eq!(store.dimension().await.unwrap(), 0);

    // Add and observe.
    store.add(sample_batch()).await.unwrap();
    assert_eq!(store.count().await.unwrap(), 4);
    assert_eq!(store.dimension().await.unwrap(), 3);

    // Cosine ranking: exact-direction match comes back first with ~0
    // distance, and distances are non-decreasing.
    let outcome = store.query(&[1.0, 0.0, 0.0], 4, None).await.unwrap();
    assert_eq!(outcome.ids[0], "src/a.rs#0");
    assert!(outcome.distances[0] < 1e-5);
    for pair in outcome.distances.windows(2) {
        assert!(pair[0] <= pair[1] + 1e-6);
    }

    // Conjunctive metadata filter.
    let mut filter = Metadata::new();
    filter.insert("path".to_string(), "src/b.rs".into());
    let filtered = store.query(&[1.0, 0.0, 0.0], 10, Some(&filter)).await.unwrap();
    assert_eq!(filtered.ids, vec!["src/b.rs#0"]);

    // Upsert idempotence: re-adding the same batch changes nothing.
    store.add(sample_batch()).await.unwrap();
    assert_eq!(store.count().await.unwrap(), 4);

    // Dimension guard.
    let mut bad = sample_batch();
    bad.ids = vec!["bad#0".to_string()];
    bad.documents = vec!["bad".to_string()];
    bad.embeddings = vec![vec![1.0, 0.0]];
    bad.metadatas = vec![Metadata::new()];
    assert!(store.add(bad).await.is_err());

    // Metadata-filtered delete removes exactly one file's chunks.
    let removed = store.delete(DeleteSelector::by_path("src/a.rs")).await.unwrap();
    assert_eq!(removed, 2);
    assert_eq!(store.count().await.unwrap(), 2);

    // Delete by ids.
    let removed = store
        .delete(DeleteSelector::by_ids(vec!["docs/c.md#0".to_string()]))
        .await
        .unwrap();
    assert_eq!(removed, 1);

    // Scan surfaces what remains.
    let scanned = store.scan(0, 10).await.unwrap();
    assert_eq!(scanned.len(), 1);
    assert_eq!(scanned[0].id, "src/b.rs#0");

    // Reset returns to the fresh state and frees the dimension.
    store.reset().await.unwrap();
    assert_eq!(store.count().await.unwrap(), 0);
    assert_eq!(store.dimension().await.unwrap(), 0);
    let mut other_dim = AddBatch::default();
    other_dim.ids.push("x#0".to_string());
    other_dim.documents.push("different dimension".to_string());
    other_dim.embeddings.push(vec![1.0, 0.0]);
    other_dim.metadatas.push(Metadata::new());
    store.add(other_dim).await.unwrap();
    assert_eq!(store.dimension().await.unwrap(), 2);
}

#[tokio::test]
async fn in_memory_honors_contract() {
    let registry = full_registry();
    let dir = TempDir::new().unwrap();
    exercise_contract(open_store(&registry, "in_memory", &dir).await).await;
}

#[tokio::test]
async fn local_persistent_honors_contract() {
    let registry = full_registry();
    let dir = TempDir::new().unwrap();
    exercise_contract(open_store(&registry, "local_persistent", &dir).await).await;
}

#[tokio::test]
async fn remote_sql_honors_contract() {
    let registry = full_registry();
    let dir = TempDir::new().unwrap();
    exercise_contract(open_store(&registry, "remote_sql", &dir).await).await;
}

#[tokio::test]
async fn registry_lists_all_backends() {
    let registry = full_registry();
    let backends = registry.list();
    assert!(backends.contains(&"in_memory".to_string()));
    assert!(backends.contains(&"local_persistent".to_string()));
    assert!(backends.contains(&"remote_sql".to_string()));
}

#[tokio::test]
async fn persistent_backends_survive_reopen() {
    for provider in ["local_persistent", "remote_sql"] {
        let registry = full_registry();
        let dir = TempDir::new().unwrap();

        let store = open_store(&registry, provider, &dir).await;
        store.add(sample_batch()).await.unwrap();
        drop(store);

        let reopened = open_store(&registry, provider, &dir).await;
        assert_eq!(reopened.count().await.unwrap(), 4, "{provider} lost rows on reopen");
        let outcome = reopened.query(&[0.0, 0.0, 1.0], 1, None).await.unwrap();
        assert_eq!(outcome.ids, vec!["docs/c.md#0"], "{provider} lost ranking on reopen");
    }
}
