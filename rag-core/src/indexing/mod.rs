//! The indexing pipeline: discovery, change detection, chunking, batched
//! embedding, and atomic persistence into the vector store.

mod chunker;
mod indexer;
mod tracker;
mod walker;

pub use chunker::{ChunkKind, SemanticChunk, SemanticChunker};
pub use indexer::{IndexOptions, IndexReport, Indexer};
pub use tracker::{compute_file_hash, posix_path, FileState, FileTracker, TrackerState};
pub use walker::{
    agent_ignore_entries, discover_files, SkipReason, WalkOptions, WalkOutcome, MAX_FILE_SIZE,
};
