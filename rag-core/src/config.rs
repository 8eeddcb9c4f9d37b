//! Configuration for the RAG engine.
//!
//! Configuration is resolved in three layers: struct defaults, then an
//! optional TOML file, then `RAG_*` environment variables. The engine
//! validates the merged result at construction time and refuses any
//! endpoint outside local loopback while `local_only` is set.

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Configuration for the RAG engine.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RagConfig {
    /// Embedding model identifier passed to the local endpoint
    pub embedding_model: String,
    /// Declared embedding dimension (0 = ask the provider)
    pub embedding_dim: usize,
    /// Base URL of the Ollama-compatible embedding endpoint
    pub embedding_base_url: String,

    /// Generation model identifier
    pub llm_model: String,
    /// Base URL of the Ollama-compatible generation endpoint
    pub llm_base_url: String,
    /// Per-request generation timeout in seconds
    pub llm_timeout_secs: u64,

    /// Vector store backend name (`in_memory`, `local_persistent`, `remote_sql`)
    pub vector_store_provider: String,
    /// Persistence directory for the store and the file tracker
    pub vector_store_path: String,
    /// Logical collection name inside the backend
    pub collection_name: String,

    /// Target chunk size in characters
    pub chunk_size: usize,
    /// Character overlap between windowed splits
    pub chunk_overlap: usize,
    /// Minimum emitted chunk length
    pub min_chunk_size: usize,
    /// Hard maximum chunk length
    pub max_chunk_size: usize,

    /// Default number of results per query
    pub top_k: usize,
    /// Minimum similarity to keep a result (0 = keep all)
    pub similarity_threshold: f32,

    /// Enable BM25 + dense hybrid retrieval
    pub use_hybrid: bool,
    /// Enable cross-encoder reranking
    pub use_reranker: bool,
    /// Maximum candidates passed to the reranker
    pub reranker_top_k: usize,
    /// Cross-encoder model identifier
    pub cross_encoder_model: String,
    /// Base URL of the local cross-encoder scorer (empty = LLM fallback)
    pub cross_encoder_base_url: String,

    /// Enable the bounded query cache
    pub cache_enabled: bool,
    /// Query cache capacity (entries)
    pub cache_size: usize,
    /// Query cache TTL in seconds
    pub cache_ttl_secs: u64,

    /// Maximum concurrent embedding requests
    pub max_concurrent_embeddings: usize,
    /// Texts per embedding batch
    pub embedding_batch_size: usize,

    /// Enable the five-stage intelligence pipeline
    pub use_intelligent_rag: bool,
    /// Reserved: conversational memory toggle
    pub conversation_enabled: bool,
    /// Reserved: multi-hop retrieval toggle (treated as a single hop)
    pub multi_hop_enabled: bool,
    /// Reserved: maximum multi-hop depth
    pub multi_hop_max_depth: usize,

    /// Refuse any network endpoint outside local loopback
    pub local_only: bool,
}

impl Default for RagConfig {
    fn default() -> Self {
        Self {
            embedding_model: "nomic-embed-text:latest".to_string(),
            embedding_dim: 0,
            embedding_base_url: "http://localhost:11434".to_string(),
            llm_model: "ministral-3:3b".to_string(),
            llm_base_url: "http://localhost:11434".to_string(),
            llm_timeout_secs: 30,
            vector_store_provider: "local_persistent".to_string(),
            vector_store_path: ".rag_db".to_string(),
            collection_name: "knowledge_base".to_string(),
            chunk_size: 1000,
            chunk_overlap: 100,
            min_chunk_size: 50,
            max_chunk_size: 4000,
            top_k: 10,
            similarity_threshold: 0.0,
            use_hybrid: true,
            use_reranker: true,
            reranker_top_k: 20,
            cross_encoder_model: "cross-encoder/ms-marco-MiniLM-L6-v2".to_string(),
            cross_encoder_base_url: String::new(),
            cache_enabled: true,
            cache_size: 100,
            cache_ttl_secs: 3600,
            max_concurrent_embeddings: 4,
            embedding_batch_size: 20,
            use_intelligent_rag: true,
            conversation_enabled: true,
            multi_hop_enabled: false,
            multi_hop_max_depth: 2,
            local_only: true,
        }
    }
}

impl RagConfig {
    /// Load configuration from a TOML file, then apply environment overrides.
    pub fn from_file(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)?;
        let mut config: RagConfig = toml::from_str(&raw)
            .map_err(|e| Error::Config(format!("invalid config file {}: {e}", path.display())))?;
        config.apply_env();
        config.validate()?;
        Ok(config)
    }

    /// Build configuration from defaults plus `RAG_*` environment variables.
    pub fn from_env() -> Result<Self> {
        let mut config = Self::default();
        config.apply_env();
        config.validate()?;
        Ok(config)
    }

    fn apply_env(&mut self) {
        read_env_string("RAG_EMBEDDING_MODEL", &mut self.embedding_model);
        read_env_parse("RAG_EMBEDDING_DIM", &mut self.embedding_dim);
        read_env_string("RAG_EMBEDDING_BASE_URL", &mut self.embedding_base_url);
        read_env_string("RAG_LLM_MODEL", &mut self.llm_model);
        read_env_string("RAG_LLM_BASE_URL", &mut self.llm_base_url);
        read_env_parse("RAG_LLM_TIMEOUT_SECS", &mut self.llm_timeout_secs);
        read_env_string("RAG_VECTOR_STORE_PROVIDER", &mut self.vector_store_provider);
        read_env_string("RAG_VECTOR_STORE_PATH", &mut self.vector_store_path);
        read_env_string("RAG_COLLECTION_NAME", &mut self.collection_name);
        read_env_parse("RAG_CHUNK_SIZE", &mut self.chunk_size);
        read_env_parse("RAG_CHUNK_OVERLAP", &mut self.chunk_overlap);
        read_env_parse("RAG_MIN_CHUNK_SIZE", &mut self.min_chunk_size);
        read_env_parse("RAG_MAX_CHUNK_SIZE", &mut self.max_chunk_size);
        read_env_parse("RAG_TOP_K", &mut self.top_k);
        read_env_parse("RAG_SIMILARITY_THRESHOLD", &mut self.similarity_threshold);
        read_env_bool("RAG_USE_HYBRID", &mut self.use_hybrid);
        read_env_bool("RAG_USE_RERANKER", &mut self.use_reranker);
        read_env_parse("RAG_RERANKER_TOP_K", &mut self.reranker_top_k);
        read_env_string("RAG_CROSS_ENCODER_MODEL", &mut self.cross_encoder_model);
        read_env_string("RAG_CROSS_ENCODER_BASE_URL", &mut self.cross_encoder_base_url);
        read_env_bool("RAG_CACHE_ENABLED", &mut self.cache_enabled);
        read_env_parse("RAG_CACHE_SIZE", &mut self.cache_size);
        read_env_parse("RAG_CACHE_TTL_SECS", &mut self.cache_ttl_secs);
        read_env_parse("RAG_MAX_CONCURRENT_EMBEDDINGS", &mut self.max_concurrent_embeddings);
        read_env_parse("RAG_EMBEDDING_BATCH_SIZE", &mut self.embedding_batch_size);
        read_env_bool("RAG_USE_INTELLIGENT_RAG", &mut self.use_intelligent_rag);
        read_env_bool("RAG_CONVERSATION_ENABLED", &mut self.conversation_enabled);
        read_env_bool("RAG_MULTI_HOP_ENABLED", &mut self.multi_hop_enabled);
        read_env_parse("RAG_MULTI_HOP_MAX_DEPTH", &mut self.multi_hop_max_depth);
        read_env_bool("RAG_LOCAL_ONLY", &mut self.local_only);
    }

    /// Validate option consistency. Fatal at engine construction.
    pub fn validate(&self) -> Result<()> {
        if self.chunk_size == 0 || self.max_chunk_size == 0 {
            return Err(Error::Config("chunk sizes must be non-zero".to_string()));
        }
        if self.min_chunk_size > self.max_chunk_size {
            return Err(Error::Config(format!(
                "min_chunk_size {} exceeds max_chunk_size {}",
                self.min_chunk_size, self.max_chunk_size
            )));
        }
        if self.chunk_overlap >= self.max_chunk_size {
            return Err(Error::Config(format!(
                "chunk_overlap {} must be smaller than max_chunk_size {}",
                self.chunk_overlap, self.max_chunk_size
            )));
        }
        if self.top_k == 0 {
            return Err(Error::Config("top_k must be at least 1".to_string()));
        }
        if self.embedding_batch_size == 0 {
            return Err(Error::Config("embedding_batch_size must be at least 1".to_string()));
        }
        if self.local_only {
            self.ensure_local_only()?;
        }
        Ok(())
    }

    /// Refuse any configured endpoint that is not loopback.
    pub fn ensure_local_only(&self) -> Result<()> {
        for (name, url) in [
            ("embedding_base_url", self.embedding_base_url.as_str()),
            ("llm_base_url", self.llm_base_url.as_str()),
            ("cross_encoder_base_url", self.cross_encoder_base_url.as_str()),
        ] {
            if !url.is_empty() && !is_loopback_url(url) {
                return Err(Error::Config(format!(
                    "{name} '{url}' is not a loopback endpoint but local_only is set"
                )));
            }
        }
        Ok(())
    }

    /// Query cache TTL as a `Duration`.
    #[must_use]
    pub fn cache_ttl(&self) -> std::time::Duration {
        std::time::Duration::from_secs(self.cache_ttl_secs)
    }
}

fn read_env_string(key: &str, target: &mut String) {
    if let Ok(value) = std::env::var(key) {
        if !value.is_empty() {
            *target = value;
        }
    }
}

fn read_env_bool(key: &str, target: &mut bool) {
    if let Ok(value) = std::env::var(key) {
        *target = matches!(value.to_lowercase().as_str(), "1" | "true" | "yes");
    }
}

fn read_env_parse<T: std::str::FromStr>(key: &str, target: &mut T) {
    if let Ok(value) = std::env::var(key) {
        if let Ok(parsed) = value.parse::<T>() {
            *target = parsed;
        }
    }
}

/// A URL is local when its host is a loopback name or address.
fn is_loopback_url(url: &str) -> bool {
    let without_scheme = url
        .strip_prefix("http://")
        .or_else(|| url.strip_prefix("https://"))
        .unwrap_or(url);
    let host = without_scheme
        .split(['/', ':'])
        .next()
        .unwrap_or_default();
    matches!(host, "localhost" | "127.0.0.1" | "[::1]" | "::1" | "0.0.0.0")
}
