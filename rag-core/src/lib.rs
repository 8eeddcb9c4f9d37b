#![allow(clippy::cast_precision_loss)]
#![allow(clippy::missing_errors_doc)]
#![allow(clippy::missing_panics_doc)]
#![allow(clippy::missing_docs_in_private_items)]
#![allow(clippy::cast_possible_truncation)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::must_use_candidate)]
#![allow(clippy::float_cmp)]

//! # RAG Core
//!
//! Local-first retrieval-augmented generation: ingest a repository into a
//! persistent, incrementally updatable vector index and answer natural
//! language questions over it with hybrid retrieval and transparent,
//! evidence-backed reasoning.
//!
//! ## Subsystems
//!
//! - [`indexing`]: file discovery, SHA-256 change tracking, semantic
//!   chunking, batched embedding, atomic persistence
//! - [`retrieval`]: BM25 + dense hybrid search fused with RRF,
//!   cross-encoder reranking, bounded query caching
//! - [`intelligence`]: query understanding, evidence extraction,
//!   chain-of-thought reasoning, response synthesis
//! - [`engine`]: the façade tying everything together behind
//!   `index` / `query` / `intelligent_query`
//!
//! ## Providers and backends
//!
//! - [`embeddings`]: local HTTP embedding endpoint plus a deterministic
//!   hash provider for tests and fallback
//! - [`llm`]: local HTTP generation endpoint with streaming
//! - [`store`]: the pluggable vector store contract and registry; the
//!   `in_memory` backend ships here, `local_persistent` and `remote_sql`
//!   live in their own backend crates
//!
//! ## Example
//!
//! ```no_run
//! use rag_core::config::RagConfig;
//! use rag_core::engine::{QueryOptions, RagEngine};
//! use rag_core::indexing::IndexOptions;
//! use rag_core::store::StoreRegistry;
//!
//! # async fn example() -> rag_core::Result<()> {
//! let config = RagConfig::from_env()?;
//! let registry = StoreRegistry::new();
//! let engine = RagEngine::new(config, &registry).await?;
//!
//! engine.index(std::path::Path::new("."), &IndexOptions::default()).await?;
//! let response = engine.query("what does the indexer do?", &QueryOptions::default()).await?;
//! println!("{}", response.answer);
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod embeddings;
pub mod engine;
pub mod error;
pub mod indexing;
pub mod intelligence;
pub mod llm;
pub mod retrieval;
pub mod store;
pub mod types;

pub use config::RagConfig;
pub use engine::{EngineStats, QueryOptions, QueryResponse, RagEngine};
pub use error::{Error, Result};
pub use types::{Chunk, Metadata, MetadataValue};
