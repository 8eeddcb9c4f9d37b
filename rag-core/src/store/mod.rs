//! Pluggable vector store abstraction.
//!
//! All backends honor one contract: per-id upsert, top-N nearest-neighbor
//! query by cosine distance, metadata-filtered delete, and a recorded
//! dimension that callers must match before inserting. Backends register
//! themselves by name in a [`StoreRegistry`]; the engine resolves the
//! configured provider at construction time.

mod memory;
mod registry;

pub use memory::InMemoryVectorStore;
pub use registry::{StoreConstructor, StoreRegistry, StoreSettings};

use async_trait::async_trait;

use crate::error::{Error, Result};
use crate::types::Metadata;

/// Result of a nearest-neighbor query. Parallel arrays, best match first;
/// distances are cosine distances in `[0, 2]`.
#[derive(Debug, Clone, Default)]
pub struct QueryOutcome {
    /// Chunk ids, best first
    pub ids: Vec<String>,
    /// Chunk texts, aligned with `ids`
    pub documents: Vec<String>,
    /// Chunk metadata, aligned with `ids`
    pub metadatas: Vec<Metadata>,
    /// Cosine distances, aligned with `ids`
    pub distances: Vec<f32>,
}

impl QueryOutcome {
    /// Number of results.
    #[must_use]
    pub fn len(&self) -> usize {
        self.ids.len()
    }

    /// True when the query matched nothing.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.ids.is_empty()
    }
}

/// One record surfaced by a paged scan (for sparse-index builds).
#[derive(Debug, Clone)]
pub struct ScannedDocument {
    /// Chunk id
    pub id: String,
    /// Chunk text
    pub text: String,
}

/// A batch of records to upsert. Parallel arrays of equal length.
#[derive(Debug, Clone, Default)]
pub struct AddBatch {
    /// Chunk ids (unique within the store after upsert)
    pub ids: Vec<String>,
    /// Chunk texts
    pub documents: Vec<String>,
    /// Dense embeddings, one per id
    pub embeddings: Vec<Vec<f32>>,
    /// Metadata maps, one per id
    pub metadatas: Vec<Metadata>,
}

impl AddBatch {
    /// Validate parallel-array lengths and uniform embedding dimension.
    pub fn validate(&self) -> Result<()> {
        let n = self.ids.len();
        if self.documents.len() != n || self.embeddings.len() != n || self.metadatas.len() != n {
            return Err(Error::InvalidInput(format!(
                "add batch length mismatch: ids={}, documents={}, embeddings={}, metadatas={}",
                n,
                self.documents.len(),
                self.embeddings.len(),
                self.metadatas.len()
            )));
        }
        if let Some(first) = self.embeddings.first() {
            let dim = first.len();
            if dim == 0 {
                return Err(Error::InvalidInput("empty embedding in add batch".to_string()));
            }
            for embedding in &self.embeddings {
                if embedding.len() != dim {
                    return Err(Error::DimensionMismatch {
                        expected: dim,
                        actual: embedding.len(),
                    });
                }
            }
        }
        Ok(())
    }

    /// Number of records in the batch.
    #[must_use]
    pub fn len(&self) -> usize {
        self.ids.len()
    }

    /// True when the batch carries no records.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.ids.is_empty()
    }
}

/// Selector for `delete`: explicit ids, a conjunctive equality filter over
/// metadata, or both. At least one must be supplied.
#[derive(Debug, Clone, Default)]
pub struct DeleteSelector {
    /// Delete these ids
    pub ids: Option<Vec<String>>,
    /// Delete records whose metadata matches every entry
    pub where_filter: Option<Metadata>,
}

impl DeleteSelector {
    /// Select records by id.
    #[must_use]
    pub fn by_ids(ids: Vec<String>) -> Self {
        Self { ids: Some(ids), where_filter: None }
    }

    /// Select records whose metadata matches every entry of `filter`.
    #[must_use]
    pub fn by_where(filter: Metadata) -> Self {
        Self { ids: None, where_filter: Some(filter) }
    }

    /// Convenience: select every chunk of one file.
    #[must_use]
    pub fn by_path(path: &str) -> Self {
        let mut filter = Metadata::new();
        filter.insert("path".to_string(), path.into());
        Self::by_where(filter)
    }

    /// Reject an empty selector.
    pub fn validate(&self) -> Result<()> {
        if self.ids.is_none() && self.where_filter.is_none() {
            return Err(Error::InvalidInput(
                "delete requires ids or a where filter".to_string(),
            ));
        }
        Ok(())
    }
}

/// Check a record's metadata against a conjunctive equality filter.
#[must_use]
pub fn matches_where(metadata: &Metadata, filter: &Metadata) -> bool {
    filter
        .iter()
        .all(|(key, expected)| metadata.get(key) == Some(expected))
}

/// Contract shared by every vector store backend.
#[async_trait]
pub trait VectorStore: Send + Sync {
    /// Backend name as registered (`in_memory`, `local_persistent`, ...)
    fn provider_name(&self) -> &str;

    /// Idempotent per-id upsert of a validated batch.
    ///
    /// Implementations must refuse a batch whose embedding dimension
    /// differs from the store's recorded dimension while non-empty.
    async fn add(&self, batch: AddBatch) -> Result<()>;

    /// Top-`n_results` records by cosine distance, optionally restricted to
    /// records matching `where_filter`.
    async fn query(
        &self,
        query_embedding: &[f32],
        n_results: usize,
        where_filter: Option<&Metadata>,
    ) -> Result<QueryOutcome>;

    /// Delete by ids and/or metadata filter. Returns the number removed.
    async fn delete(&self, selector: DeleteSelector) -> Result<usize>;

    /// Number of stored records.
    async fn count(&self) -> Result<usize>;

    /// Recorded embedding dimension, 0 while the store is empty.
    async fn dimension(&self) -> Result<usize>;

    /// Remove every record.
    async fn reset(&self) -> Result<()>;

    /// Paged scan of `(id, text)` pairs for sparse-index builds.
    async fn scan(&self, offset: usize, limit: usize) -> Result<Vec<ScannedDocument>>;
}

/// Guard helper shared by backends: refuse inserts whose dimension differs
/// from the recorded one.
pub(crate) fn check_dimension(recorded: usize, incoming: usize) -> Result<()> {
    if recorded != 0 && incoming != recorded {
        return Err(Error::DimensionMismatch {
            expected: recorded,
            actual: incoming,
        });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::MetadataValue;

    #[test]
    fn add_batch_rejects_ragged_lengths() {
        let batch = AddBatch {
            ids: vec!["a#0".into()],
            documents: vec![],
            embeddings: vec![vec![0.1, 0.2]],
            metadatas: vec![Metadata::new()],
        };
        assert!(batch.validate().is_err());
    }

    #[test]
    fn add_batch_rejects_mixed_dimensions() {
        let batch = AddBatch {
            ids: vec!["a#0".into(), "a#1".into()],
            documents: vec!["x".into(), "y".into()],
            embeddings: vec![vec![0.1, 0.2], vec![0.1, 0.2, 0.3]],
            metadatas: vec![Metadata::new(), Metadata::new()],
        };
        assert!(matches!(
            batch.validate(),
            Err(Error::DimensionMismatch { expected: 2, actual: 3 })
        ));
    }

    #[test]
    fn delete_selector_requires_something() {
        assert!(DeleteSelector::default().validate().is_err());
        assert!(DeleteSelector::by_path("src/lib.rs").validate().is_ok());
    }

    #[test]
    fn where_filter_is_conjunctive() {
        let mut metadata = Metadata::new();
        metadata.insert("path".into(), "src/lib.rs".into());
        metadata.insert("type".into(), "code_block".into());

        let mut filter = Metadata::new();
        filter.insert("path".into(), "src/lib.rs".into());
        assert!(matches_where(&metadata, &filter));

        filter.insert("type".into(), "markdown_section".into());
        assert!(!matches_where(&metadata, &filter));

        filter.insert("type".into(), MetadataValue::Str("code_block".into()));
        assert!(matches_where(&metadata, &filter));
    }
}
