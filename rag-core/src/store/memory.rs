//! In-memory vector store backend.
//!
//! Rows live in parallel vectors; a unit-normalized copy of the embedding
//! matrix is rebuilt lazily at the next query after any mutation, so bursts
//! of `add` calls pay for one rebuild. Queries observe every prior `add`.

use async_trait::async_trait;
use parking_lot::RwLock;

use super::{
    check_dimension, matches_where, AddBatch, DeleteSelector, QueryOutcome, ScannedDocument,
    VectorStore,
};
use crate::embeddings::similarity::{dot, l2_normalize};
use crate::error::Result;
use crate::types::Metadata;

#[derive(Default)]
struct Rows {
    ids: Vec<String>,
    documents: Vec<String>,
    embeddings: Vec<Vec<f32>>,
    metadatas: Vec<Metadata>,
    /// Unit-normalized embeddings, rebuilt when `dirty`
    normalized: Vec<Vec<f32>>,
    dirty: bool,
}

impl Rows {
    fn dimension(&self) -> usize {
        self.embeddings.first().map_or(0, Vec::len)
    }

    fn position(&self, id: &str) -> Option<usize> {
        self.ids.iter().position(|existing| existing == id)
    }

    fn remove_at(&mut self, index: usize) {
        self.ids.remove(index);
        self.documents.remove(index);
        self.embeddings.remove(index);
        self.metadatas.remove(index);
        self.dirty = true;
    }

    fn ensure_normalized(&mut self) {
        if !self.dirty && self.normalized.len() == self.embeddings.len() {
            return;
        }
        self.normalized = self
            .embeddings
            .iter()
            .map(|embedding| {
                let mut copy = embedding.clone();
                l2_normalize(&mut copy);
                copy
            })
            .collect();
        self.dirty = false;
    }
}

/// Volatile vector store for tests and programmatic ingestion.
pub struct InMemoryVectorStore {
    rows: RwLock<Rows>,
}

impl InMemoryVectorStore {
    /// Create an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self {
            rows: RwLock::new(Rows::default()),
        }
    }
}

impl Default for InMemoryVectorStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl VectorStore for InMemoryVectorStore {
    fn provider_name(&self) -> &str {
        "in_memory"
    }

    async fn add(&self, batch: AddBatch) -> Result<()> {
        batch.validate()?;
        if batch.is_empty() {
            return Ok(());
        }

        let mut rows = self.rows.write();
        if let Some(first) = batch.embeddings.first() {
            check_dimension(rows.dimension(), first.len())?;
        }

        let AddBatch { ids, documents, embeddings, metadatas } = batch;
        for (((id, document), embedding), metadata) in ids
            .into_iter()
            .zip(documents)
            .zip(embeddings)
            .zip(metadatas)
        {
            // Upsert: a colliding id replaces the previous record.
            if let Some(existing) = rows.position(&id) {
                rows.remove_at(existing);
            }
            rows.ids.push(id);
            rows.documents.push(document);
            rows.embeddings.push(embedding);
            rows.metadatas.push(metadata);
        }
        rows.dirty = true;
        Ok(())
    }

    async fn query(
        &self,
        query_embedding: &[f32],
        n_results: usize,
        where_filter: Option<&Metadata>,
    ) -> Result<QueryOutcome> {
        let mut rows = self.rows.write();
        if rows.ids.is_empty() || n_results == 0 {
            return Ok(QueryOutcome::default());
        }
        rows.ensure_normalized();

        let mut query = query_embedding.to_vec();
        l2_normalize(&mut query);

        let mut scored: Vec<(usize, f32)> = rows
            .normalized
            .iter()
            .enumerate()
            .filter(|(i, _)| {
                where_filter.is_none_or(|filter| matches_where(&rows.metadatas[*i], filter))
            })
            .map(|(i, normalized)| (i, 1.0 - dot(&query, normalized)))
            .collect();

        // Deterministic ordering: distance ascending, then id ascending.
        scored.sort_by(|a, b| {
            a.1.partial_cmp(&b.1)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| rows.ids[a.0].cmp(&rows.ids[b.0]))
        });
        scored.truncate(n_results);

        let mut outcome = QueryOutcome::default();
        for (index, distance) in scored {
            outcome.ids.push(rows.ids[index].clone());
            outcome.documents.push(rows.documents[index].clone());
            outcome.metadatas.push(rows.metadatas[index].clone());
            outcome.distances.push(distance);
        }
        Ok(outcome)
    }

    async fn delete(&self, selector: DeleteSelector) -> Result<usize> {
        selector.validate()?;
        let mut rows = self.rows.write();

        let victims: Vec<usize> = (0..rows.ids.len())
            .filter(|&i| {
                let by_id = selector
                    .ids
                    .as_ref()
                    .is_some_and(|ids| ids.iter().any(|id| *id == rows.ids[i]));
                let by_where = selector
                    .where_filter
                    .as_ref()
                    .is_some_and(|filter| matches_where(&rows.metadatas[i], filter));
                by_id || by_where
            })
            .collect();

        for index in victims.iter().rev() {
            rows.remove_at(*index);
        }
        Ok(victims.len())
    }

    async fn count(&self) -> Result<usize> {
        Ok(self.rows.read().ids.len())
    }

    async fn dimension(&self) -> Result<usize> {
        Ok(self.rows.read().dimension())
    }

    async fn reset(&self) -> Result<()> {
        let mut rows = self.rows.write();
        *rows = Rows::default();
        Ok(())
    }

    async fn scan(&self, offset: usize, limit: usize) -> Result<Vec<ScannedDocument>> {
        let rows = self.rows.read();
        Ok(rows
            .ids
            .iter()
            .zip(rows.documents.iter())
            .skip(offset)
            .take(limit)
            .map(|(id, text)| ScannedDocument {
                id: id.clone(),
                text: text.clone(),
            })
            .collect())
    }
}
