//! String-keyed registry mapping backend names to constructors.
//!
//! Replaces duck-typed import probing with explicit registration: backend
//! crates expose a `register` function that installs their constructor, and
//! the engine resolves `vector_store_provider` here at construction time.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use futures::future::BoxFuture;

use super::{InMemoryVectorStore, VectorStore};
use crate::error::{Error, Result};

/// Settings handed to a backend constructor.
#[derive(Debug, Clone)]
pub struct StoreSettings {
    /// Persistence directory (backends lay out their native files inside)
    pub path: PathBuf,
    /// Logical collection name
    pub collection_name: String,
}

/// Boxed async constructor for a vector store backend.
pub type StoreConstructor =
    Arc<dyn Fn(StoreSettings) -> BoxFuture<'static, Result<Arc<dyn VectorStore>>> + Send + Sync>;

/// Registry of vector store backends.
pub struct StoreRegistry {
    backends: HashMap<String, StoreConstructor>,
}

impl StoreRegistry {
    /// Empty registry with only the built-in `in_memory` backend.
    #[must_use]
    pub fn new() -> Self {
        let mut registry = Self { backends: HashMap::new() };
        registry.register("in_memory", |_settings| {
            Box::pin(async { Ok(Arc::new(InMemoryVectorStore::new()) as Arc<dyn VectorStore>) })
        });
        registry
    }

    /// Register a backend constructor under `name`.
    ///
    /// Re-registering a name replaces the previous constructor; the last
    /// registration wins, which lets applications shadow built-ins.
    pub fn register<F>(&mut self, name: &str, constructor: F)
    where
        F: Fn(StoreSettings) -> BoxFuture<'static, Result<Arc<dyn VectorStore>>>
            + Send
            + Sync
            + 'static,
    {
        tracing::debug!(backend = name, "registered vector store backend");
        self.backends
            .insert(name.to_lowercase(), Arc::new(constructor));
    }

    /// Construct the backend registered under `name`.
    pub async fn create(&self, name: &str, settings: StoreSettings) -> Result<Arc<dyn VectorStore>> {
        let constructor = self.backends.get(&name.to_lowercase()).ok_or_else(|| {
            Error::Config(format!(
                "unknown vector store provider '{name}'; available: {}",
                self.list().join(", ")
            ))
        })?;
        tracing::info!(backend = name, path = %settings.path.display(), "creating vector store");
        constructor(settings).await
    }

    /// Sorted list of registered backend names.
    #[must_use]
    pub fn list(&self) -> Vec<String> {
        let mut names: Vec<String> = self.backends.keys().cloned().collect();
        names.sort();
        names
    }

    /// Whether `name` has a registered constructor.
    #[must_use]
    pub fn is_registered(&self, name: &str) -> bool {
        self.backends.contains_key(&name.to_lowercase())
    }
}

impl Default for StoreRegistry {
    fn default() -> Self {
        Self::new()
    }
}
