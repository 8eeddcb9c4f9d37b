//! Core data types shared across the RAG pipeline.
//!
//! The atomic retrievable unit is a [`Chunk`]: a bounded span of text drawn
//! from one file, carrying a stable id, a dense embedding, and typed
//! metadata. Chunk metadata is a map from string keys to [`MetadataValue`],
//! a small sum type standing in for the dynamically-typed metadata dicts of
//! ad-hoc vector payloads.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Metadata keys with reserved meaning, validated on insert.
pub const RESERVED_METADATA_KEYS: &[&str] = &[
    "path",
    "chunk_index",
    "type",
    "file_size",
    "file_hash",
    "start_line",
    "end_line",
    "indexed_at",
];

/// A single metadata value: string, integer, float, or boolean.
///
/// Serialized untagged so the on-disk and wire forms stay plain JSON
/// scalars (`"src/lib.rs"`, `3`, `0.5`, `true`).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum MetadataValue {
    /// Boolean flag
    Bool(bool),
    /// Signed integer
    Int(i64),
    /// Floating point number
    Float(f64),
    /// UTF-8 string
    Str(String),
}

impl MetadataValue {
    /// Borrow the string content, if this value is a string.
    #[must_use]
    pub fn as_str(&self) -> Option<&str> {
        match self {
            MetadataValue::Str(s) => Some(s.as_str()),
            _ => None,
        }
    }

    /// Integer content, if this value is an integer.
    #[must_use]
    pub fn as_int(&self) -> Option<i64> {
        match self {
            MetadataValue::Int(i) => Some(*i),
            _ => None,
        }
    }
}

impl From<&str> for MetadataValue {
    fn from(value: &str) -> Self {
        MetadataValue::Str(value.to_string())
    }
}

impl From<String> for MetadataValue {
    fn from(value: String) -> Self {
        MetadataValue::Str(value)
    }
}

impl From<i64> for MetadataValue {
    fn from(value: i64) -> Self {
        MetadataValue::Int(value)
    }
}

impl From<usize> for MetadataValue {
    fn from(value: usize) -> Self {
        MetadataValue::Int(value as i64)
    }
}

impl From<f64> for MetadataValue {
    fn from(value: f64) -> Self {
        MetadataValue::Float(value)
    }
}

impl From<bool> for MetadataValue {
    fn from(value: bool) -> Self {
        MetadataValue::Bool(value)
    }
}

/// Chunk metadata: ordered string-keyed map of scalar values.
pub type Metadata = BTreeMap<String, MetadataValue>;

/// Validate reserved metadata keys carry the expected value shape.
///
/// Non-reserved keys pass through untouched. Returns `Error::InvalidInput`
/// on a reserved key with the wrong type.
pub fn validate_metadata(metadata: &Metadata) -> Result<()> {
    for (key, value) in metadata {
        let ok = match key.as_str() {
            "path" | "file_hash" | "type" | "indexed_at" => {
                matches!(value, MetadataValue::Str(_))
            }
            "chunk_index" | "file_size" | "start_line" | "end_line" => {
                matches!(value, MetadataValue::Int(i) if *i >= 0)
            }
            _ => true,
        };
        if !ok {
            return Err(Error::InvalidInput(format!(
                "reserved metadata key '{key}' has invalid value {value:?}"
            )));
        }
    }
    Ok(())
}

/// Format a chunk id from its repo-relative POSIX path and chunk index.
#[must_use]
pub fn chunk_id(path: &str, index: usize) -> String {
    format!("{path}#{index}")
}

/// Split a chunk id back into `(path, index)`.
///
/// Returns `None` when the id does not end in `#<non-negative-int>`.
#[must_use]
pub fn parse_chunk_id(id: &str) -> Option<(&str, usize)> {
    let (path, index) = id.rsplit_once('#')?;
    if path.is_empty() {
        return None;
    }
    let index = index.parse::<usize>().ok()?;
    Some((path, index))
}

/// The atomic retrievable unit.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Chunk {
    /// Stable id: `"<repo-relative-posix-path>#<chunk-index>"`
    pub id: String,
    /// Owning document (repo-relative POSIX path)
    pub document_id: String,
    /// Zero-based position within the owning file
    pub chunk_index: usize,
    /// Trimmed UTF-8 text
    pub text: String,
    /// Dense vector; length equals the store's recorded dimension
    pub embedding: Vec<f32>,
    /// Typed metadata (reserved keys validated on insert)
    pub metadata: Metadata,
    /// Creation timestamp (UTC)
    pub created_at: DateTime<Utc>,
    /// Last update timestamp (UTC)
    pub updated_at: DateTime<Utc>,
}

impl Chunk {
    /// Create a chunk with its id derived from path and index.
    #[must_use]
    pub fn new(document_id: &str, chunk_index: usize, text: String, embedding: Vec<f32>) -> Self {
        let now = Utc::now();
        Self {
            id: chunk_id(document_id, chunk_index),
            document_id: document_id.to_string(),
            chunk_index,
            text,
            embedding,
            metadata: Metadata::new(),
            created_at: now,
            updated_at: now,
        }
    }

    /// Attach metadata, validating reserved keys.
    pub fn with_metadata(mut self, metadata: Metadata) -> Result<Self> {
        validate_metadata(&metadata)?;
        self.metadata = metadata;
        let document_id = self.document_id.clone();
        self.metadata
            .entry("path".to_string())
            .or_insert(MetadataValue::Str(document_id));
        self.metadata
            .entry("chunk_index".to_string())
            .or_insert(MetadataValue::Int(self.chunk_index as i64));
        Ok(self)
    }
}
