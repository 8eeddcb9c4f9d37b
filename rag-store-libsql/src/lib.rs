//! # RAG Store - libsql
//!
//! SQL vector store backend on libsql, registered as the `remote_sql`
//! provider. The registry constructor opens a local SQLite file under the
//! store directory (the engine is local-first); [`LibsqlVectorStore::connect_remote`]
//! exists for sqld deployments reachable over loopback.
//!
//! Chunks live in one table: `id TEXT PRIMARY KEY, document TEXT,
//! embedding BLOB (little-endian f32s), metadata TEXT (JSON)`. Similarity
//! is cosine distance computed in Rust over a row scan; SQLite has no
//! native vector type, so the embedding column is opaque bytes.

use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use libsql::{params, Builder, Connection};
use tracing::{debug, info};

use rag_core::embeddings::similarity::{dot, l2_normalize};
use rag_core::error::{Error, Result};
use rag_core::store::{
    matches_where, AddBatch, DeleteSelector, QueryOutcome, ScannedDocument, StoreRegistry,
    VectorStore,
};
use rag_core::types::Metadata;

const CREATE_CHUNKS_TABLE: &str = r"
CREATE TABLE IF NOT EXISTS chunks (
    id TEXT PRIMARY KEY NOT NULL,
    document TEXT NOT NULL,
    embedding BLOB NOT NULL,
    metadata TEXT NOT NULL,
    created_at INTEGER NOT NULL DEFAULT (strftime('%s', 'now'))
)
";

const CREATE_PATH_INDEX: &str = r"
CREATE INDEX IF NOT EXISTS idx_chunks_path
ON chunks (json_extract(metadata, '$.path'))
";

const UPSERT_CHUNK: &str = r"
INSERT INTO chunks (id, document, embedding, metadata)
VALUES (?1, ?2, ?3, ?4)
ON CONFLICT(id) DO UPDATE SET
    document = excluded.document,
    embedding = excluded.embedding,
    metadata = excluded.metadata
";

fn store_error(context: &str, e: libsql::Error) -> Error {
    Error::Store(format!("{context}: {e}"))
}

fn encode_embedding(embedding: &[f32]) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(embedding.len() * 4);
    for value in embedding {
        bytes.extend_from_slice(&value.to_le_bytes());
    }
    bytes
}

fn decode_embedding(bytes: &[u8]) -> Vec<f32> {
    bytes
        .chunks_exact(4)
        .map(|chunk| f32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]))
        .collect()
}

/// libsql-backed vector store (`remote_sql`).
pub struct LibsqlVectorStore {
    conn: Connection,
}

impl LibsqlVectorStore {
    /// Open (or create) a local SQLite database at
    /// `<dir>/<collection_name>.sqlite`.
    pub async fn open(dir: &Path, collection_name: &str) -> Result<Self> {
        std::fs::create_dir_all(dir)?;
        let db_path = dir.join(format!("{collection_name}.sqlite"));
        let db = Builder::new_local(&db_path)
            .build()
            .await
            .map_err(|e| Error::BackendUnavailable(format!("failed to open libsql at {}: {e}", db_path.display())))?;
        let conn = db
            .connect()
            .map_err(|e| Error::BackendUnavailable(format!("failed to connect: {e}")))?;

        let store = Self { conn };
        store.initialize_schema().await?;
        info!(path = %db_path.display(), "opened libsql vector store");
        Ok(store)
    }

    /// Connect to a sqld server. The engine's `local_only` validation
    /// restricts this to loopback URLs.
    pub async fn connect_remote(url: &str, auth_token: &str) -> Result<Self> {
        let db = Builder::new_remote(url.to_string(), auth_token.to_string())
            .build()
            .await
            .map_err(|e| Error::BackendUnavailable(format!("failed to reach {url}: {e}")))?;
        let conn = db
            .connect()
            .map_err(|e| Error::BackendUnavailable(format!("failed to connect: {e}")))?;

        let store = Self { conn };
        store.initialize_schema().await?;
        info!(url, "connected to remote libsql vector store");
        Ok(store)
    }

    /// Register this backend as `remote_sql`.
    pub fn register(registry: &mut StoreRegistry) {
        registry.register("remote_sql", |settings| {
            Box::pin(async move {
                let store =
                    LibsqlVectorStore::open(&settings.path, &settings.collection_name).await?;
                Ok(Arc::new(store) as Arc<dyn VectorStore>)
            })
        });
    }

    async fn initialize_schema(&self) -> Result<()> {
        self.conn
            .execute(CREATE_CHUNKS_TABLE, ())
            .await
            .map_err(|e| store_error("failed to create chunks table", e))?;
        self.conn
            .execute(CREATE_PATH_INDEX, ())
            .await
            .map_err(|e| store_error("failed to create path index", e))?;
        Ok(())
    }

    async fn delete_by_ids(&self, ids: &[String]) -> Result<usize> {
        let mut removed = 0usize;
        for id in ids {
            removed += self
                .conn
                .execute("DELETE FROM chunks WHERE id = ?1", params![id.as_str()])
                .await
                .map_err(|e| store_error("failed to delete chunk", e))? as usize;
        }
        Ok(removed)
    }

    /// Collect ids whose metadata matches a conjunctive filter. The filter
    /// is applied in Rust after a metadata scan; a `path` equality filter
    /// still benefits from the expression index via the common case of
    /// small result sets.
    async fn ids_matching(&self, filter: &Metadata) -> Result<Vec<String>> {
        let mut rows = self
            .conn
            .query("SELECT id, metadata FROM chunks", ())
            .await
            .map_err(|e| store_error("failed to scan metadata", e))?;

        let mut ids = Vec::new();
        while let Some(row) = rows
            .next()
            .await
            .map_err(|e| store_error("failed to read row", e))?
        {
            let id: String = row.get(0).map_err(|e| store_error("bad id column", e))?;
            let metadata_json: String =
                row.get(1).map_err(|e| store_error("bad metadata column", e))?;
            let metadata: Metadata = serde_json::from_str(&metadata_json)?;
            if matches_where(&metadata, filter) {
                ids.push(id);
            }
        }
        Ok(ids)
    }
}

#[async_trait]
impl VectorStore for LibsqlVectorStore {
    fn provider_name(&self) -> &str {
        "remote_sql"
    }

    async fn add(&self, batch: AddBatch) -> Result<()> {
        batch.validate()?;
        if batch.is_empty() {
            return Ok(());
        }

        let recorded = self.dimension().await?;
        let incoming = batch.embeddings[0].len();
        if recorded != 0 && recorded != incoming {
            return Err(Error::DimensionMismatch {
                expected: recorded,
                actual: incoming,
            });
        }

        for i in 0..batch.ids.len() {
            let metadata_json = serde_json::to_string(&batch.metadatas[i])?;
            self.conn
                .execute(
                    UPSERT_CHUNK,
                    params![
                        batch.ids[i].as_str(),
                        batch.documents[i].as_str(),
                        encode_embedding(&batch.embeddings[i]),
                        metadata_json
                    ],
                )
                .await
                .map_err(|e| store_error("failed to upsert chunk", e))?;
        }
        debug!(rows = batch.ids.len(), "upserted chunk batch");
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

        let mut query = query_embedding.to_vec();
        l2_normalize(&mut query);

        let mut rows = self
            .conn
            .query("SELECT id, document, embedding, metadata FROM chunks", ())
            .await
            .map_err(|e| store_error("failed to scan chunks", e))?;

        let mut scored: Vec<(String, String, Metadata, f32)> = Vec::new();
        while let Some(row) = rows
            .next()
            .await
            .map_err(|e| store_error("failed to read row", e))?
        {
            let id: String = row.get(0).map_err(|e| store_error("bad id column", e))?;
            let document: String = row.get(1).map_err(|e| store_error("bad document column", e))?;
            let blob: Vec<u8> = row.get(2).map_err(|e| store_error("bad embedding column", e))?;
            let metadata_json: String =
                row.get(3).map_err(|e| store_error("bad metadata column", e))?;
            let metadata: Metadata = serde_json::from_str(&metadata_json)?;

            if let Some(filter) = where_filter {
                if !matches_where(&metadata, filter) {
                    continue;
                }
            }

            let mut embedding = decode_embedding(&blob);
            l2_normalize(&mut embedding);
            let distance = 1.0 - dot(&query, &embedding);
            scored.push((id, document, metadata, distance));
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
        Ok(outcome)
    }

    async fn delete(&self, selector: DeleteSelector) -> Result<usize> {
        selector.validate()?;

        let mut victims: Vec<String> = selector.ids.clone().unwrap_or_default();
        if let Some(filter) = &selector.where_filter {
            for id in self.ids_matching(filter).await? {
                if !victims.contains(&id) {
                    victims.push(id);
                }
            }
        }

        let removed = self.delete_by_ids(&victims).await?;
        debug!(removed, "deleted chunks");
        Ok(removed)
    }

    async fn count(&self) -> Result<usize> {
        let mut rows = self
            .conn
            .query("SELECT COUNT(*) FROM chunks", ())
            .await
            .map_err(|e| store_error("failed to count chunks", e))?;
        let row = rows
            .next()
            .await
            .map_err(|e| store_error("failed to read count", e))?
            .ok_or_else(|| Error::Store("count query returned no rows".to_string()))?;
        let count: i64 = row.get(0).map_err(|e| store_error("bad count column", e))?;
        Ok(usize::try_from(count).unwrap_or(0))
    }

    async fn dimension(&self) -> Result<usize> {
        let mut rows = self
            .conn
            .query("SELECT length(embedding) FROM chunks LIMIT 1", ())
            .await
            .map_err(|e| store_error("failed to probe dimension", e))?;
        match rows
            .next()
            .await
            .map_err(|e| store_error("failed to read dimension", e))?
        {
            Some(row) => {
                let bytes: i64 = row.get(0).map_err(|e| store_error("bad length column", e))?;
                Ok(usize::try_from(bytes).unwrap_or(0) / 4)
            }
            None => Ok(0),
        }
    }

    async fn reset(&self) -> Result<()> {
        self.conn
            .execute("DELETE FROM chunks", ())
            .await
            .map_err(|e| store_error("failed to reset chunks", e))?;
        Ok(())
    }

    async fn scan(&self, offset: usize, limit: usize) -> Result<Vec<ScannedDocument>> {
        let mut rows = self
            .conn
            .query(
                "SELECT id, document FROM chunks ORDER BY id LIMIT ?1 OFFSET ?2",
                params![limit as i64, offset as i64],
            )
            .await
            .map_err(|e| store_error("failed to scan chunks", e))?;

        let mut out = Vec::new();
        while let Some(row) = rows
            .next()
            .await
            .map_err(|e| store_error("failed to read row", e))?
        {
            let id: String = row.get(0).map_err(|e| store_error("bad id column", e))?;
            let text: String = row.get(1).map_err(|e| store_error("bad document column", e))?;
            out.push(ScannedDocument { id, text });
        }
        Ok(out)
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

    #[test]
    fn embedding_codec_round_trip() {
        let embedding = vec![0.25f32, -1.5, 3.75, 0.0];
        let decoded = decode_embedding(&encode_embedding(&embedding));
        assert_eq!(decoded, embedding);
    }

    #[tokio::test]
    async fn add_query_round_trip() {
        let dir = TempDir::new().unwrap();
        let store = LibsqlVectorStore::open(dir.path(), "test").await.unwrap();

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
        assert!(outcome.distances[0] < 1e-6);
    }

    #[tokio::test]
    async fn persistence_across_reopen() {
        let dir = TempDir::new().unwrap();
        {
            let store = LibsqlVectorStore::open(dir.path(), "persist").await.unwrap();
            store
                .add(batch(&[("a.rs#0", "survives reopen", vec![0.5, 0.5])]))
                .await
                .unwrap();
        }

        let reopened = LibsqlVectorStore::open(dir.path(), "persist").await.unwrap();
        assert_eq!(reopened.count().await.unwrap(), 1);
        let outcome = reopened.query(&[0.5, 0.5], 1, None).await.unwrap();
        assert_eq!(outcome.documents, vec!["survives reopen"]);
    }

    #[tokio::test]
    async fn upsert_overwrites_by_id() {
        let dir = TempDir::new().unwrap();
        let store = LibsqlVectorStore::open(dir.path(), "upsert").await.unwrap();

        store.add(batch(&[("a.rs#0", "old", vec![1.0, 0.0])])).await.unwrap();
        store.add(batch(&[("a.rs#0", "new", vec![0.0, 1.0])])).await.unwrap();

        assert_eq!(store.count().await.unwrap(), 1);
        let outcome = store.query(&[0.0, 1.0], 1, None).await.unwrap();
        assert_eq!(outcome.documents, vec!["new"]);
    }

    #[tokio::test]
    async fn dimension_guard_refuses_mismatch() {
        let dir = TempDir::new().unwrap();
        let store = LibsqlVectorStore::open(dir.path(), "guard").await.unwrap();

        store.add(batch(&[("a.rs#0", "two", vec![1.0, 0.0])])).await.unwrap();
        let err = store
            .add(batch(&[("b.rs#0", "three", vec![1.0, 0.0, 0.0])]))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::DimensionMismatch { expected: 2, actual: 3 }));
    }

    #[tokio::test]
    async fn delete_by_where_removes_one_file() {
        let dir = TempDir::new().unwrap();
        let store = LibsqlVectorStore::open(dir.path(), "delete").await.unwrap();

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
    }

    #[tokio::test]
    async fn query_with_where_filter() {
        let dir = TempDir::new().unwrap();
        let store = LibsqlVectorStore::open(dir.path(), "filter").await.unwrap();

        store
            .add(batch(&[
                ("a.rs#0", "alpha", vec![1.0, 0.0]),
                ("b.rs#0", "beta", vec![0.9, 0.1]),
            ]))
            .await
            .unwrap();

        let mut filter = Metadata::new();
        filter.insert("path".to_string(), "b.rs".into());
        let outcome = store.query(&[1.0, 0.0], 10, Some(&filter)).await.unwrap();
        assert_eq!(outcome.ids, vec!["b.rs#0"]);
    }

    #[tokio::test]
    async fn reset_then_new_dimension() {
        let dir = TempDir::new().unwrap();
        let store = LibsqlVectorStore::open(dir.path(), "reset").await.unwrap();

        store.add(batch(&[("a.rs#0", "alpha", vec![1.0, 0.0])])).await.unwrap();
        store.reset().await.unwrap();
        assert_eq!(store.count().await.unwrap(), 0);
        assert_eq!(store.dimension().await.unwrap(), 0);

        store
            .add(batch(&[("c.rs#0", "gamma", vec![1.0, 0.0, 0.0])]))
            .await
            .unwrap();
        assert_eq!(store.dimension().await.unwrap(), 3);
    }

    #[tokio::test]
    async fn scan_pages_in_id_order() {
        let dir = TempDir::new().unwrap();
        let store = LibsqlVectorStore::open(dir.path(), "scan").await.unwrap();

        store
            .add(batch(&[
                ("c.rs#0", "gamma", vec![0.5, 0.5]),
                ("a.rs#0", "alpha", vec![1.0, 0.0]),
                ("b.rs#0", "beta", vec![0.0, 1.0]),
            ]))
            .await
            .unwrap();

        let page = store.scan(1, 1).await.unwrap();
        assert_eq!(page.len(), 1);
        assert_eq!(page[0].id, "b.rs#0");
    }

    #[tokio::test]
    async fn registry_integration() {
        let dir = TempDir::new().unwrap();
        let mut registry = StoreRegistry::new();
        LibsqlVectorStore::register(&mut registry);
        assert!(registry.is_registered("remote_sql"));

        let store = registry
            .create(
                "remote_sql",
                rag_core::store::StoreSettings {
                    path: dir.path().to_path_buf(),
                    collection_name: "reg".to_string(),
                },
            )
            .await
            .unwrap();
        assert_eq!(store.provider_name(), "remote_sql");
        assert_eq!(store.count().await.unwrap(), 0);
    }
}
