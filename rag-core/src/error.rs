use std::path::PathBuf;

/// Result type alias for RAG operations
pub type Result<T> = std::result::Result<T, Error>;

/// Error types for the RAG core
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Provider unavailable: {0}")]
    ProviderUnavailable(String),

    #[error("Request timed out: {0}")]
    RequestTimeout(String),

    #[error("Input of {len} chars exceeds model context limit of {limit}")]
    ContextLengthExceeded { len: usize, limit: usize },

    #[error("Embedding dimension mismatch: store has {expected}, provider produced {actual}")]
    DimensionMismatch { expected: usize, actual: usize },

    #[error("Vector store backend unavailable: {0}")]
    BackendUnavailable(String),

    #[error("Store error: {0}")]
    Store(String),

    #[error("An indexing operation is already running on this store")]
    AlreadyIndexing,

    #[error("Failed to read {}: {source}", .path.display())]
    ReadFailure {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Chunking failed: {0}")]
    ChunkingFailure(String),

    #[error("Vector store is empty")]
    EmptyStore,

    #[error("Embedding failed: {0}")]
    EmbeddingFailed(String),

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Operation cancelled")]
    Cancelled,
}

impl Error {
    /// Check if this error is recoverable (can retry with backoff)
    pub fn is_recoverable(&self) -> bool {
        match self {
            Error::ProviderUnavailable(_) => true,
            Error::RequestTimeout(_) => true,
            Error::Store(_) => true,
            Error::Io(_) => true,
            Error::Config(_) => false,
            Error::ContextLengthExceeded { .. } => false,
            Error::DimensionMismatch { .. } => false,
            Error::BackendUnavailable(_) => false,
            Error::AlreadyIndexing => false,
            Error::ReadFailure { .. } => false,
            Error::ChunkingFailure(_) => false,
            Error::EmptyStore => false,
            Error::EmbeddingFailed(_) => false,
            Error::InvalidInput(_) => false,
            Error::Serialization(_) => false,
            Error::Cancelled => false,
        }
    }

    /// Check if this error indicates the input was too long for the model
    pub fn is_context_length(&self) -> bool {
        matches!(self, Error::ContextLengthExceeded { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn recoverable_classification() {
        assert!(Error::ProviderUnavailable("conn refused".into()).is_recoverable());
        assert!(Error::RequestTimeout("10s elapsed".into()).is_recoverable());
        assert!(!Error::AlreadyIndexing.is_recoverable());
        assert!(!Error::DimensionMismatch { expected: 384, actual: 768 }.is_recoverable());
        assert!(!Error::Config("bad url".into()).is_recoverable());
    }

    #[test]
    fn context_length_discriminator() {
        assert!(Error::ContextLengthExceeded { len: 9000, limit: 4000 }.is_context_length());
        assert!(!Error::EmptyStore.is_context_length());
    }
}
