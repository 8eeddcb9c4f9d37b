//! Repository indexer: full builds and incremental updates.
//!
//! Both operations are idempotent. The store and the tracker stay mutually
//! consistent: a file's tracker entry is written only after its chunks have
//! been upserted, so an interrupted run leaves the file "changed" for the
//! next pass instead of silently half-indexed.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::chunker::{SemanticChunk, SemanticChunker};
use super::tracker::{compute_file_hash, posix_path, FileTracker};
use super::walker::{discover_files, WalkOptions, WalkOutcome};
use crate::embeddings::EmbeddingProvider;
use crate::error::{Error, Result};
use crate::store::{AddBatch, DeleteSelector, VectorStore};
use crate::types::{chunk_id, Metadata, MetadataValue};

/// Store upserts are issued in sub-batches of this many records.
const UPSERT_BATCH_SIZE: usize = 100;

/// Progressive truncation ladder for inputs the embedding model rejects.
const TRUNCATION_LADDER: &[usize] = &[2000, 1000, 600];

/// Retry budget for transient provider errors.
const MAX_RETRIES: u32 = 3;
const RETRY_BASE_DELAY: Duration = Duration::from_millis(100);

/// Options for one indexing run.
#[derive(Debug, Clone, Default)]
pub struct IndexOptions {
    /// Reset the store and tracker before building
    pub rebuild: bool,
    /// Extra directory names to exclude
    pub exclude_dirs: Vec<String>,
    /// File-name patterns to require (empty = all)
    pub include_patterns: Vec<String>,
    /// Explicit file manifest, bypassing the walk
    pub files: Option<Vec<PathBuf>>,
    /// Minimum quality score to index a file (0 = no filtering)
    pub quality_threshold: f32,
    /// Suppress per-file progress events
    pub quiet: bool,
}

/// Structured report of one indexing run.
#[derive(Debug, Clone, Default)]
pub struct IndexReport {
    /// Wall-clock duration
    pub duration: Duration,
    /// Files whose chunks were (re)indexed
    pub files_processed: usize,
    /// Files rejected with a reason
    pub files_skipped: usize,
    /// Chunks successfully embedded and upserted
    pub chunks_created: usize,
    /// Chunks dropped after the truncation ladder ran dry
    pub chunks_failed: usize,
    /// Bytes of file content read
    pub bytes_read: u64,
    /// Reason -> count breakdown for skipped files
    pub skip_reasons: BTreeMap<String, u64>,
}

impl IndexReport {
    /// Chunks per second over the run.
    #[must_use]
    pub fn throughput(&self) -> f64 {
        let secs = self.duration.as_secs_f64();
        if secs > 0.0 {
            self.chunks_created as f64 / secs
        } else {
            0.0
        }
    }

    fn add_skip(&mut self, reason: &str) {
        self.files_skipped += 1;
        *self.skip_reasons.entry(reason.to_string()).or_insert(0) += 1;
    }
}

/// One file's chunks, pending embedding and upsert.
struct PendingFile {
    rel_path: String,
    file_hash: String,
    file_size: u64,
    mtime_ms: Option<i64>,
    ids: Vec<String>,
    texts: Vec<String>,
    metadatas: Vec<Metadata>,
}

/// Walks a repository, detects changes, chunks, embeds, and upserts.
pub struct Indexer {
    store: Arc<dyn VectorStore>,
    embedder: Arc<dyn EmbeddingProvider>,
    /// Secondary in-process provider used when the primary keeps rejecting
    /// a chunk. Must share the primary's dimension.
    fallback_embedder: Option<Arc<dyn EmbeddingProvider>>,
    chunker: SemanticChunker,
    tracker_dir: PathBuf,
    embedding_batch_size: usize,
    cancel: CancellationToken,
}

impl Indexer {
    /// Create an indexer over `store` and `embedder`. `tracker_dir` is the
    /// store's persistence directory, where the file tracker lives.
    #[must_use]
    pub fn new(
        store: Arc<dyn VectorStore>,
        embedder: Arc<dyn EmbeddingProvider>,
        chunker: SemanticChunker,
        tracker_dir: &Path,
        embedding_batch_size: usize,
    ) -> Self {
        Self {
            store,
            embedder,
            fallback_embedder: None,
            chunker,
            tracker_dir: tracker_dir.to_path_buf(),
            embedding_batch_size: embedding_batch_size.max(1),
            cancel: CancellationToken::new(),
        }
    }

    /// Install a fallback embedding provider for unembeddable chunks.
    #[must_use]
    pub fn with_fallback(mut self, fallback: Arc<dyn EmbeddingProvider>) -> Self {
        self.fallback_embedder = Some(fallback);
        self
    }

    /// Derive cancellation from the given token.
    #[must_use]
    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancel = token;
        self
    }

    /// Index `repo_root`: dimension guard, then full build or incremental
    /// update depending on store state and `options.rebuild`.
    pub async fn index(&self, repo_root: &Path, options: &IndexOptions) -> Result<IndexReport> {
        if !repo_root.exists() {
            return Err(Error::InvalidInput(format!(
                "repository path does not exist: {}",
                repo_root.display()
            )));
        }

        let mut rebuild = options.rebuild;
        if self.dimension_mismatch().await? {
            warn!(
                store_dim = self.store.dimension().await?,
                provider_dim = self.embedder.dimension(),
                "embedding dimension mismatch, resetting store and rebuilding"
            );
            rebuild = true;
        }

        if rebuild {
            self.store.reset().await?;
            FileTracker::new(&self.tracker_dir).reset()?;
        }

        if self.store.count().await? == 0 {
            self.full_build(repo_root, options).await
        } else {
            self.incremental(repo_root, options).await
        }
    }

    /// True when the store is non-empty and disagrees with the provider.
    async fn dimension_mismatch(&self) -> Result<bool> {
        let store_dim = self.store.dimension().await?;
        let provider_dim = self.embedder.dimension();
        Ok(store_dim != 0 && provider_dim != 0 && store_dim != provider_dim)
    }

    /// Walk the whole repository and index every accepted file.
    pub async fn full_build(&self, repo_root: &Path, options: &IndexOptions) -> Result<IndexReport> {
        let started = Instant::now();
        let mut report = IndexReport::default();
        let mut tracker = FileTracker::new(&self.tracker_dir);

        let files = self.collect_files(repo_root, options, &mut report);
        info!(files = files.len(), repo = %repo_root.display(), "starting full index build");

        // Phase 1: read and chunk everything, grouped per file.
        let mut pending: Vec<PendingFile> = Vec::new();
        for file_path in &files {
            self.check_cancelled()?;
            if let Some(entry) = self.chunk_one_file(repo_root, file_path, options, &mut report) {
                pending.push(entry);
            }
        }

        let total_chunks: usize = pending.iter().map(|p| p.ids.len()).sum();
        debug!(chunks = total_chunks, "chunking complete, embedding");

        // Phase 2: embed in global batches, then upsert per file and record
        // the tracker entry only once that file's chunks have landed.
        let all_texts: Vec<String> = pending.iter().flat_map(|p| p.texts.clone()).collect();
        let embeddings = self.embed_all(&all_texts).await?;

        let mut cursor = 0usize;
        for file in &pending {
            self.check_cancelled()?;
            let file_embeddings = &embeddings[cursor..cursor + file.texts.len()];
            cursor += file.texts.len();

            let kept = self.upsert_file(file, file_embeddings).await?;
            report.chunks_created += kept;
            report.chunks_failed += file.texts.len() - kept;
            if kept > 0 {
                tracker.update_file(
                    &file.rel_path,
                    &file.file_hash,
                    file.file_size,
                    file.mtime_ms,
                    kept,
                );
                report.files_processed += 1;
                if !options.quiet {
                    debug!(path = %file.rel_path, chunks = kept, "indexed file");
                }
            } else {
                report.add_skip("no_chunks");
            }
        }

        tracker.save()?;
        report.duration = started.elapsed();
        info!(
            files = report.files_processed,
            chunks = report.chunks_created,
            failed = report.chunks_failed,
            throughput = report.throughput(),
            "full index build complete"
        );
        Ok(report)
    }

    /// Re-index only changed files and purge deleted ones.
    pub async fn incremental(&self, repo_root: &Path, options: &IndexOptions) -> Result<IndexReport> {
        let started = Instant::now();
        let mut report = IndexReport::default();
        let mut tracker = FileTracker::new(&self.tracker_dir);

        let files = self.collect_files(repo_root, options, &mut report);

        // Deletions happen before additions so a rename never leaves both
        // the old and the new chunks in the store.
        let deleted = tracker.get_deleted_files(repo_root, &files);
        for rel_path in &deleted {
            self.check_cancelled()?;
            debug!(path = %rel_path, "removing chunks for deleted file");
            self.store.delete(DeleteSelector::by_path(rel_path)).await?;
            tracker.remove_file(rel_path);
        }

        let changed = tracker.get_changed_files(repo_root, &files);
        if changed.is_empty() && deleted.is_empty() {
            tracker.save()?;
            report.duration = started.elapsed();
            info!("no changes detected, index is up to date");
            return Ok(report);
        }
        info!(changed = changed.len(), deleted = deleted.len(), "incremental update");

        for file_path in &changed {
            if self.cancel.is_cancelled() {
                // Completed files keep their tracker entries; this one
                // stays "changed" for the next run.
                tracker.save()?;
                return Err(Error::Cancelled);
            }

            let Some(file) = self.chunk_one_file(repo_root, file_path, options, &mut report) else {
                // Unreadable or empty now: drop its stale chunks and entry.
                if let Ok(rel) = file_path.strip_prefix(repo_root) {
                    let rel_path = posix_path(rel);
                    self.store.delete(DeleteSelector::by_path(&rel_path)).await?;
                    tracker.remove_file(&rel_path);
                }
                continue;
            };

            self.store.delete(DeleteSelector::by_path(&file.rel_path)).await?;

            let embeddings = self.embed_all(&file.texts).await?;
            let kept = self.upsert_file(&file, &embeddings).await?;
            report.chunks_created += kept;
            report.chunks_failed += file.texts.len() - kept;

            if kept > 0 {
                tracker.update_file(
                    &file.rel_path,
                    &file.file_hash,
                    file.file_size,
                    file.mtime_ms,
                    kept,
                );
                report.files_processed += 1;
                if !options.quiet {
                    debug!(path = %file.rel_path, chunks = kept, "re-indexed file");
                }
            } else {
                tracker.remove_file(&file.rel_path);
                report.add_skip("no_chunks");
            }
        }

        tracker.save()?;
        report.duration = started.elapsed();
        info!(
            files = report.files_processed,
            chunks = report.chunks_created,
            "incremental update complete"
        );
        Ok(report)
    }

    fn collect_files(
        &self,
        repo_root: &Path,
        options: &IndexOptions,
        report: &mut IndexReport,
    ) -> Vec<PathBuf> {
        if let Some(manifest) = &options.files {
            let mut seen = std::collections::BTreeSet::new();
            return manifest
                .iter()
                .map(|p| if p.is_absolute() { p.clone() } else { repo_root.join(p) })
                .filter(|p| p.exists())
                .filter(|p| seen.insert(p.clone()))
                .collect();
        }

        let walk_options = WalkOptions {
            exclude_dirs: options.exclude_dirs.clone(),
            include_patterns: options.include_patterns.clone(),
        };
        let WalkOutcome { files, skipped } = discover_files(repo_root, &walk_options);
        for (path, reason) in skipped {
            debug!(path = %path.display(), reason = reason.label(), "skipping file");
            report.add_skip(reason.label());
        }
        files
    }

    /// Read, quality-check, and chunk one file. Returns `None` (with the
    /// skip recorded) when the file contributes nothing.
    fn chunk_one_file(
        &self,
        repo_root: &Path,
        file_path: &Path,
        options: &IndexOptions,
        report: &mut IndexReport,
    ) -> Option<PendingFile> {
        let rel_path = file_path
            .strip_prefix(repo_root)
            .map(posix_path)
            .unwrap_or_else(|_| {
                file_path
                    .file_name()
                    .map(|n| n.to_string_lossy().into_owned())
                    .unwrap_or_default()
            });

        let bytes = match std::fs::read(file_path) {
            Ok(bytes) => bytes,
            Err(e) => {
                debug!(path = %rel_path, error = %e, "read failed");
                report.add_skip("read_failed");
                return None;
            }
        };
        let content = String::from_utf8_lossy(&bytes).into_owned();
        if content.trim().is_empty() {
            report.add_skip("empty_file");
            return None;
        }
        report.bytes_read += bytes.len() as u64;

        if options.quality_threshold > 0.0 {
            let quality = content_quality(&content);
            if quality < options.quality_threshold {
                debug!(path = %rel_path, quality, "below quality threshold");
                report.add_skip("low_quality");
                return None;
            }
        }

        let chunks = self.chunker.chunk_file(&content, &rel_path);
        if chunks.is_empty() {
            report.add_skip("no_chunks");
            return None;
        }

        let file_hash = compute_file_hash(file_path).unwrap_or_default();
        let metadata_fs = std::fs::metadata(file_path).ok();
        let file_size = metadata_fs.as_ref().map_or(bytes.len() as u64, std::fs::Metadata::len);
        let mtime_ms = metadata_fs.as_ref().and_then(|m| {
            let modified = m.modified().ok()?;
            let since = modified.duration_since(std::time::UNIX_EPOCH).ok()?;
            i64::try_from(since.as_millis()).ok()
        });

        let mut ids = Vec::with_capacity(chunks.len());
        let mut texts = Vec::with_capacity(chunks.len());
        let mut metadatas = Vec::with_capacity(chunks.len());
        for (index, chunk) in chunks.iter().enumerate() {
            ids.push(chunk_id(&rel_path, index));
            texts.push(chunk.content.clone());
            metadatas.push(build_chunk_metadata(&rel_path, index, content.len(), &file_hash, chunk));
        }

        Some(PendingFile {
            rel_path,
            file_hash,
            file_size,
            mtime_ms,
            ids,
            texts,
            metadatas,
        })
    }

    /// Embed every text, batch-first with per-chunk recovery. The result is
    /// aligned with the input; `None` marks a chunk that could not be
    /// embedded and must be dropped.
    async fn embed_all(&self, texts: &[String]) -> Result<Vec<Option<Vec<f32>>>> {
        let mut out: Vec<Option<Vec<f32>>> = Vec::with_capacity(texts.len());

        for batch in texts.chunks(self.embedding_batch_size) {
            self.check_cancelled()?;
            match self.embed_batch_with_retry(batch).await {
                Ok(vectors) => out.extend(vectors.into_iter().map(Some)),
                Err(e) if e.is_context_length() => {
                    // One oversized chunk poisons the whole batch; recover
                    // item by item.
                    for text in batch {
                        out.push(self.embed_one_with_ladder(text).await?);
                    }
                }
                Err(e) => return Err(e),
            }
        }

        Ok(out)
    }

    async fn embed_batch_with_retry(&self, batch: &[String]) -> Result<Vec<Vec<f32>>> {
        let mut attempt = 0u32;
        loop {
            match self.embedder.embed_batch(batch).await {
                Ok(vectors) => return Ok(vectors),
                Err(e) if e.is_recoverable() && attempt < MAX_RETRIES => {
                    let delay = RETRY_BASE_DELAY * 2u32.pow(attempt);
                    warn!(error = %e, attempt, "embedding batch failed, retrying");
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Single-chunk embedding with the progressive truncation ladder, then
    /// the fallback provider, then giving up. `None` marks a dropped chunk;
    /// the caller accounts for it as failed.
    async fn embed_one_with_ladder(&self, text: &str) -> Result<Option<Vec<f32>>> {
        match self.embedder.embed(text).await {
            Ok(vector) => return Ok(Some(vector)),
            Err(e) if e.is_context_length() => {}
            Err(e) => return Err(e),
        }

        for &limit in TRUNCATION_LADDER {
            let truncated = truncate_chars(text, limit);
            match self.embedder.embed(truncated).await {
                Ok(vector) => {
                    debug!(limit, "embedded after truncation");
                    return Ok(Some(vector));
                }
                Err(e) if e.is_context_length() => {}
                Err(e) => return Err(e),
            }
        }

        if let Some(fallback) = &self.fallback_embedder {
            match fallback.embed(text).await {
                Ok(vector) => {
                    debug!("embedded via fallback provider");
                    return Ok(Some(vector));
                }
                Err(e) => {
                    warn!(error = %e, "fallback embedding failed");
                }
            }
        }

        warn!(len = text.len(), "chunk unembeddable after truncation ladder, skipping");
        Ok(None)
    }

    /// Upsert one file's surviving chunks in sub-batches. Returns how many
    /// chunks landed.
    async fn upsert_file(&self, file: &PendingFile, embeddings: &[Option<Vec<f32>>]) -> Result<usize> {
        let mut batch = AddBatch::default();
        for (i, embedding) in embeddings.iter().enumerate() {
            let Some(embedding) = embedding else { continue };
            batch.ids.push(file.ids[i].clone());
            batch.documents.push(file.texts[i].clone());
            batch.embeddings.push(embedding.clone());
            batch.metadatas.push(file.metadatas[i].clone());
        }
        let kept = batch.len();

        let AddBatch { ids, documents, embeddings, metadatas } = batch;
        let mut offset = 0usize;
        while offset < ids.len() {
            let end = (offset + UPSERT_BATCH_SIZE).min(ids.len());
            self.store
                .add(AddBatch {
                    ids: ids[offset..end].to_vec(),
                    documents: documents[offset..end].to_vec(),
                    embeddings: embeddings[offset..end].to_vec(),
                    metadatas: metadatas[offset..end].to_vec(),
                })
                .await?;
            offset = end;
        }

        Ok(kept)
    }

    fn check_cancelled(&self) -> Result<()> {
        if self.cancel.is_cancelled() {
            Err(Error::Cancelled)
        } else {
            Ok(())
        }
    }
}

fn build_chunk_metadata(
    rel_path: &str,
    index: usize,
    file_size: usize,
    file_hash: &str,
    chunk: &SemanticChunk,
) -> Metadata {
    let mut metadata = chunk.metadata();
    metadata.insert("path".to_string(), rel_path.into());
    metadata.insert("chunk_index".to_string(), MetadataValue::Int(index as i64));
    metadata.insert("file_size".to_string(), MetadataValue::Int(file_size as i64));
    metadata.insert("file_hash".to_string(), file_hash.into());
    metadata.insert("indexed_at".to_string(), Utc::now().to_rfc3339().into());
    metadata
}

/// Crude content quality score in [0, 1]: printable ratio damped by
/// minified-looking line lengths.
fn content_quality(content: &str) -> f32 {
    let total = content.chars().count().max(1);
    let printable = content
        .chars()
        .filter(|c| !c.is_control() || *c == '\n' || *c == '\t')
        .count();
    let mut score = printable as f32 / total as f32;

    let max_line = content.lines().map(str::len).max().unwrap_or(0);
    if max_line > 2000 {
        score *= 0.5;
    }
    score
}

fn truncate_chars(text: &str, limit: usize) -> &str {
    match text.char_indices().nth(limit) {
        Some((offset, _)) => &text[..offset],
        None => text,
    }
}
