//! # RAG Store - redb
//!
//! Embedded, durable vector store backend on redb, registered as the
//! `local_persistent` provider.
//!
//! Chunks live in a single key-value table keyed by chunk id. The record
//! payload is postcard-encoded (document text, raw f32 embedding, plus the
//! metadata map as a JSON string, since the metadata value enum is
//! untagged and needs a self-describing format). Every batched `add`
//! commits its write transaction, so the on-disk state is durable after
//! each batch. Nearest-neighbor queries brute-force cosine distance over
//! L2-normalized vectors under `spawn_blocking`.
//!
//! ## Example
//!
//! ```no_run
//! use rag_store_redb::RedbVectorStore;
//! use std::path::Path;
//!
//! # fn example() -> anyhow::Result<()> {
//! let store = RedbVectorStore::open(Path::new(".rag_db"), "knowledge_base")?;
//! # Ok(())
//! # }
//! ```

use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use redb::{Database, ReadableDatabase, ReadableTable, ReadableTableMetadata, TableDefinition};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use rag_core::embeddings::similarity::{dot, l2_normalize};
use rag_core::error::{Error, Result};
use rag_core::store::{
    matches_where, AddBatch, DeleteSelector, QueryOutcome, ScannedDocument, StoreRegistry,
    VectorStore,
};
use rag_core::types::Metadata;

const CHUNKS_TABLE: TableDefinition<&str, &[u8]> = TableDefinition::new("chunks");
const META_TABLE: TableDefinition<&str, u64> = TableDefinition::new("meta");

const DIMENSION_KEY: &str = "dimension";

/// On-disk record for one chunk.
#[derive(Debug, Serialize, Deserialize)]
struct ChunkRecord {
    document: String,
    embedding: Vec<f32>,
    /// Metadata as JSON (untagged enums need a self-describing format)
    metadata_json: String,
}

impl ChunkRecord {
    fn encode(document: &str, embedding: &[f32], metadata: &Metadata) -> Result<Vec<u8>> {
        let record = ChunkRecord {
            document: document.to_string(),
            embedding: embedding.to_vec(),
            metadata_json: serde_json::to_string(metadata)?,
        };
        postcard::to_allocvec(&record)
            .map_err(|e| Error::Store(format!("failed to encode chunk record: {e}")))
    }

    fn decode(bytes: &[u8]) -> Result<(String, Vec<f32>, Metadata)> {
        let record: ChunkRecord = postcard::from_bytes(bytes)
            .map_err(|e| Error::Store(format!("failed to decode chunk record: {e}")))?;
        let metadata: Metadata = serde_json::from_str(&record.metadata_json)?;
        Ok((record.document, record.embedding, metadata))
    }
}

/// redb-backed vector store (`local_persistent`).
pub struct RedbVectorStore {
    db: Arc<Database>,
}

impl RedbVectorStore {
    /// Open (or create) the store database at
    /// `<dir>/<collection_name>.redb`.
    pub fn open(dir: &Path, collection_name: &str) -> Result<Self> {
        std::fs::create_dir_all(dir)?;
        let db_path = dir.join(format!("{collection_name}.redb"));
        let db = Database::create(&db_path)
            .map_err(|e| Error::BackendUnavailable(format!("failed to open redb at {}: {e}", db_path.display())))?;

        // Make sure both tables exist so first reads do not fail.
        let write_txn = db
            .begin_write()
            .map_err(|e| Error::Store(format!("failed to begin write transaction: {e}")))?;
        {
            write_txn
                .open_table(CHUNKS_TABLE)
                .map_err(|e| Error::Store(format!("failed to open chunks table: {e}")))?;
            write_txn
                .open_table(META_TABLE)
                .map_err(|e| Error::Store(format!("failed to open meta table: {e}")))?;
        }
        write_txn
            .commit()
            .map_err(|e| Error::Store(format!("failed to commit transaction: {e}")))?;

        info!(path = %db_path.display(), "opened redb vector store");
        Ok(Self { db: Arc::new(db) })
    }

    /// Register this backend as `local_persistent`.
    pub fn register(registry: &mut StoreRegistry) {
        registry.register("local_persistent", |settings| {
            Box::pin(async move {
                let store = tokio::task::spawn_blocking(move || {
                    RedbVectorStore::open(&settings.path, &settings.collection_name)
                })
                .await
                .map_err(|e| Error::Store(format!("open task failed: {e}")))??;
                Ok(Arc::new(store) as Arc<dyn VectorStore>)
            })
        });
    }
}

#[async_trait]
impl VectorStore for RedbVectorStore {
    fn provider_name(&self) -> &str {
        "local_persistent"
    }

    async fn add(&self, batch: AddBatch) -> Result<()> {
        batch.validate()?;
        if batch.is_empty() {
            return Ok(());
        }
        let db = Arc::clone(&self.db);

        tokio::task::spawn_blocking(move || {
            let incoming_dim = batch.embeddings[0].len() as u64;
            let write_txn = db
                .begin_write()
                .map_err(|e| Error::Store(format!("failed to begin write transaction: {e}")))?;
            {
                let mut meta = write_txn
                    .open_table(META_TABLE)
                    .map_err(|e| Error::Store(format!("failed to open meta table: {e}")))?;
                let recorded = meta
                    .get(DIMENSION_KEY)
                    .map_err(|e| Error::Store(format!("failed to read dimension: {e}")))?
                    .map_or(0, |guard| guard.value());
                if recorded != 0 && recorded != incoming_dim {
                    return Err(Error::DimensionMismatch {
                        expected: recorded as usize,
                        actual: incoming_dim as usize,
                    });
                }
                if recorded == 0 {
                    meta.insert(DIMENSION_KEY, incoming_dim)
                        .map_err(|e| Error::Store(format!("failed to record dimension: {e}")))?;
                }

                let mut chunks = write_txn
                    .open_table(CHUNKS_TABLE)
                    .map_err(|e| Error::Store(format!("failed to open chunks table: {e}")))?;
                for i in 0..batch.ids.len() {
                    let payload = ChunkRecord::encode(
                        &batch.documents[i],
                        &batch.embeddings[i],
                        &batch.metadatas[i],
                    )?;
                    chunks
                        .insert(batch.ids[i].as_str(), payload.as_slice())
                        .map_err(|e| Error::Store(format!("failed to insert chunk: {e}")))?;
                }
            }
            // Commit is the durability point for this batch.
            write_txn
                .commit()
                .map_err(|e| Error::Store(format!("failed to commit transaction: {e}")))?;
            Ok::<(), Error>(())
        })
        .await
        .map_err(|e| Error::Store(format!("write task failed: {e}")))??;

        Ok(())
    }

    async fn query(
        &self,
        query_embedding: &[f32],
        n_results: usize,
        where_filter: Option<&Metadata>,
    ) -> Result<QueryOutcome> {
        if n_results == 0 {
            return Ok(QueryOutcome::default());
        }
        let db = Arc::clone(&self.db);
        let mut query = query_embedding.to_vec();
        l2_normalize(&mut query);
        let filter = where_filter.cloned();

        tokio::task::spawn_blocking(move || {
            let read_txn = db
                .begin_read()
                .map_err(|e| Error::Store(format!("failed to begin read transaction: {e}")))?;
            let chunks = read_txn
                .open_table(CHUNKS_TABLE)
                .map_err(|e| Error::Store(format!("failed to open chunks table: {e}")))?;

            let mut scored: Vec<(String, String, Metadata, f32)> = Vec::new();
            for entry in chunks
                .iter()
                .map_err(|e| Error::Store(format!("failed to iterate chunks: {e}")))?
            {
                let (key, value) =
                    entry.map_err(|e| Error::Store(format!("failed to read chunk: {e}")))?;
                let (document, mut embedding, metadata) = ChunkRecord::decode(value.value())?;
                if let Some(filter) = &filter {
                    if !matches_where(&metadata, filter) {
                        continue;
                    }
                }
                l2_normalize(&mut embedding);
                let distance = 1.0 - dot(&query, &embedding);
                scored.push((key.value().to_string(), document, metadata, distance));
            }

            scored.sort_by(|a, b| {
                a.3.partial_cmp(&b.3)
                    .unwrap_or(std::cmp::Ordering::Equal)
                    .then_with(|| a.0.cmp(&b.0))
            });
            scored.truncate(n_results);

            let mut outcome = QueryOutcome::default();
            for (id, document, metadata, distance) in scored {
                outcome.ids.push(id);
                outcome.documents.push(document);
                outcome.metadatas.push(metadata);
                outcome.distances.push(distance);
            }
            Ok::<QueryOutcome, Error>(outcome)
        })
        .await
        .map_err(|e| Error::Store(format!("query task failed: {e}")))?
    }

    async fn delete(&self, selector: DeleteSelector) -> Result<usize> {
        selector.validate()?;
        let db = Arc::clone(&self.db);

        tokio::task::spawn_blocking(move || {
            let write_txn = db
                .begin_write()
                .map_err(|e| Error::Store(format!("failed to begin write transaction: {e}")))?;
            let removed;
            {
                let mut chunks = write_txn
                    .open_table(CHUNKS_TABLE)
                    .map_err(|e| Error::Store(format!("failed to open chunks table: {e}")))?;

                let mut victims: Vec<String> = Vec::new();
                for entry in chunks
                    .iter()
                    .map_err(|e| Error::Store(format!("failed to iterate chunks: {e}")))?
                {
                    let (key, value) =
                        entry.map_err(|e| Error::Store(format!("failed to read chunk: {e}")))?;
                    let id = key.value().to_string();
                    let by_id = selector
                        .ids
                        .as_ref()
                        .is_some_and(|ids| ids.iter().any(|candidate| *candidate == id));
                    let by_where = match &selector.where_filter {
                        Some(filter) => {
                            let (_, _, metadata) = ChunkRecord::decode(value.value())?;
                            matches_where(&metadata, filter)
                        }
                        None => false,
                    };
                    if by_id || by_where {
                        victims.push(id);
                    }
                }

                removed = victims.len();
                for id in victims {
                    chunks
                        .remove(id.as_str())
                        .map_err(|e| Error::Store(format!("failed to remove chunk: {e}")))?;
                }
            }
            write_txn
                .commit()
                .map_err(|e| Error::Store(format!("failed to commit transaction: {e}")))?;
            debug!(removed, "deleted chunks");
            Ok::<usize, Error>(removed)
        })
        .await
        .map_err(|e| Error::Store(format!("delete task failed: {e}")))?
    }

    async fn count(&self) -> Result<usize> {
        let db = Arc::clone(&self.db);
        tokio::task::spawn_blocking(move || {
            let read_txn = db
                .begin_read()
                .map_err(|e| Error::Store(format!("failed to begin read transaction: {e}")))?;
            let chunks = read_txn
                .open_table(CHUNKS_TABLE)
                .map_err(|e| Error::Store(format!("failed to open chunks table: {e}")))?;
            let len = chunks
                .len()
                .map_err(|e| Error::Store(format!("failed to count chunks: {e}")))?;
            Ok::<usize, Error>(len as usize)
        })
        .await
        .map_err(|e| Error::Store(format!("count task failed: {e}")))?
    }

    async fn dimension(&self) -> Result<usize> {
        if self.count().await? == 0 {
            return Ok(0);
        }
        let db = Arc::clone(&self.db);
        tokio::task::spawn_blocking(move || {
            let read_txn = db
                .begin_read()
                .map_err(|e| Error::Store(format!("failed to begin read transaction: {e}")))?;
            let meta = read_txn
                .open_table(META_TABLE)
                .map_err(|e| Error::Store(format!("failed to open meta table: {e}")))?;
            let dimension = meta
                .get(DIMENSION_KEY)
                .map_err(|e| Error::Store(format!("failed to read dimension: {e}")))?
                .map_or(0, |guard| guard.value());
            Ok::<usize, Error>(dimension as usize)
        })
        .await
        .map_err(|e| Error::Store(format!("dimension task failed: {e}")))?
    }

    async fn reset(&self) -> Result<()> {
        let db = Arc::clone(&self.db);
        tokio::task::spawn_blocking(move || {
            let write_txn = db
                .begin_write()
                .map_err(|e| Error::Store(format!("failed to begin write transaction: {e}")))?;
            {
                write_txn
                    .delete_table(CHUNKS_TABLE)
                    .map_err(|e| Error::Store(format!("failed to drop chunks table: {e}")))?;
                write_txn
                    .delete_table(META_TABLE)
                    .map_err(|e| Error::Store(format!("failed to drop meta table: {e}")))?;
                // Recreate empty tables so subsequent reads succeed.
                write_txn
                    .open_table(CHUNKS_TABLE)
                    .map_err(|e| Error::Store(format!("failed to recreate chunks table: {e}")))?;
                write_txn
                    .open_table(META_TABLE)
                    .map_err(|e| Error::Store(format!("failed to recreate meta table: {e}")))?;
            }
            write_txn
                .commit()
                .map_err(|e| Error::Store(format!("failed to commit transaction: {e}")))?;
            Ok::<(), Error>(())
        })
        .await
        .map_err(|e| Error::Store(format!("reset task failed: {e}")))?
    }

    async fn scan(&self, offset: usize, limit: usize) -> Result<Vec<ScannedDocument>> {
        let db = Arc::clone(&self.db);
        tokio::task::spawn_blocking(move || {
            let read_txn = db
                .begin_read()
                .map_err(|e| Error::Store(format!("failed to begin read transaction: {e}")))?;
            let chunks = read_txn
                .open_table(CHUNKS_TABLE)
                .map_err(|e| Error::Store(format!("failed to open chunks table: {e}")))?;

            let mut out = Vec::new();
            for entry in chunks
                .iter()
                .map_err(|e| Error::Store(format!("failed to iterate chunks: {e}")))?
                .skip(offset)
                .take(limit)
            {
                let (key, value) =
                    entry.map_err(|e| Error::Store(format!("failed to read chunk: {e}")))?;
                let (document, _, _) = ChunkRecord::decode(value.value())?;
                out.push(ScannedDocument {
                    id: key.value().to_string(),
                    text: document,
                });
            }
            Ok::<Vec<ScannedDocument>, Error>(out)
        })
        .await
        .map_err(|e| Error::Store(format!("scan task failed: {e}")))?
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn batch(entries: &[(&str, &str, Vec<f32>)]) -> AddBatch {
        AddBatch {
            ids: entries.iter().map(|(id, _, _)| (*id).to_string()).collect(),
            documents: entries.iter().map(|(_, doc, _)| (*doc).to_string()).collect(),
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

    #[tokio::test]
    async fn add_query_round_trip() {
        let dir = TempDir::new().unwrap();
        let store = RedbVectorStore::open(dir.path(), "test").unwrap();

        store
            .add(batch(&[
                ("a.rs#0", "alpha content", vec![1.0, 0.0]),
                ("b.rs#0", "beta content", vec![0.0, 1.0]),
            ]))
            .await
            .unwrap();

        assert_eq!(store.count().await.unwrap(), 2);
        assert_eq!(store.dimension().await.unwrap(), 2);

        let outcome = store.query(&[1.0, 0.0], 1, None).await.unwrap();
        assert_eq!(outcome.ids, vec!["a.rs#0"]);
        assert_eq!(outcome.documents, vec!["alpha content"]);
        assert!(outcome.distances[0] < 1e-6);
    }

    #[tokio::test]
    async fn persistence_across_reopen() {
        let dir = TempDir::new().unwrap();
        {
            let store = RedbVectorStore::open(dir.path(), "persist").unwrap();
            store
                .add(batch(&[("a.rs#0", "survives reopen", vec![0.5, 0.5])]))
                .await
                .unwrap();
        }

        let reopened = RedbVectorStore::open(dir.path(), "persist").unwrap();
        assert_eq!(reopened.count().await.unwrap(), 1);
        let outcome = reopened.query(&[0.5, 0.5], 1, None).await.unwrap();
        assert_eq!(outcome.documents, vec!["survives reopen"]);
    }

    #[tokio::test]
    async fn upsert_overwrites_by_id() {
        let dir = TempDir::new().unwrap();
        let store = RedbVectorStore::open(dir.path(), "upsert").unwrap();

        store.add(batch(&[("a.rs#0", "old", vec![1.0, 0.0])])).await.unwrap();
        store.add(batch(&[("a.rs#0", "new", vec![0.0, 1.0])])).await.unwrap();

        assert_eq!(store.count().await.unwrap(), 1);
        let outcome = store.query(&[0.0, 1.0], 1, None).await.unwrap();
        assert_eq!(outcome.documents, vec!["new"]);
    }

    #[tokio::test]
    async fn dimension_guard_refuses_mismatch() {
        let dir = TempDir::new().unwrap();
        let store = RedbVectorStore::open(dir.path(), "guard").unwrap();

        store.add(batch(&[("a.rs#0", "two dims", vec![1.0, 0.0])])).await.unwrap();
        let err = store
            .add(batch(&[("b.rs#0", "three dims", vec![1.0, 0.0, 0.0])]))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::DimensionMismatch { expected: 2, actual: 3 }));
    }

    #[tokio::test]
    async fn delete_by_where_and_by_ids() {
        let dir = TempDir::new().unwrap();
        let store = RedbVectorStore::open(dir.path(), "delete").unwrap();

        store
            .add(batch(&[
                ("a.rs#0", "alpha", vec![1.0, 0.0]),
                ("a.rs#1", "alpha2", vec![0.9, 0.1]),
                ("b.rs#0", "beta", vec![0.0, 1.0]),
            ]))
            .await
            .unwrap();

        let removed = store.delete(DeleteSelector::by_path("a.rs")).await.unwrap();
        assert_eq!(removed, 2);
        assert_eq!(store.count().await.unwrap(), 1);

        let removed = store
            .delete(DeleteSelector::by_ids(vec!["b.rs#0".to_string()]))
            .await
            .unwrap();
        assert_eq!(removed, 1);
        assert_eq!(store.count().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn reset_clears_everything_including_dimension() {
        let dir = TempDir::new().unwrap();
        let store = RedbVectorStore::open(dir.path(), "reset").unwrap();

        store.add(batch(&[("a.rs#0", "alpha", vec![1.0, 0.0])])).await.unwrap();
        store.reset().await.unwrap();

        assert_eq!(store.count().await.unwrap(), 0);
        assert_eq!(store.dimension().await.unwrap(), 0);

        // A different dimension is accepted after reset.
        store
            .add(batch(&[("c.rs#0", "gamma", vec![1.0, 0.0, 0.0])]))
            .await
            .unwrap();
        assert_eq!(store.dimension().await.unwrap(), 3);
    }

    #[tokio::test]
    async fn scan_pages_in_key_order() {
        let dir = TempDir::new().unwrap();
        let store = RedbVectorStore::open(dir.path(), "scan").unwrap();

        store
            .add(batch(&[
                ("a.rs#0", "alpha", vec![1.0, 0.0]),
                ("b.rs#0", "beta", vec![0.0, 1.0]),
                ("c.rs#0", "gamma", vec![0.5, 0.5]),
            ]))
            .await
            .unwrap();

        let page = store.scan(1, 1).await.unwrap();
        assert_eq!(page.len(), 1);
        assert_eq!(page[0].id, "b.rs#0");
        assert!(store.scan(5, 10).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn registry_integration() {
        let dir = TempDir::new().unwrap();
        let mut registry = StoreRegistry::new();
        RedbVectorStore::register(&mut registry);
        assert!(registry.is_registered("local_persistent"));

        let store = registry
            .create(
                "local_persistent",
                rag_core::store::StoreSettings {
                    path: dir.path().to_path_buf(),
                    collection_name: "reg".to_string(),
                },
            )
            .await
            .unwrap();
        assert_eq!(store.provider_name(), "local_persistent");
        assert_eq!(store.count().await.unwrap(), 0);
    }
}
