//! LLM provider trait.

use async_trait::async_trait;
use futures::stream::BoxStream;

use crate::error::Result;

/// Streamed generation output: a sequence of text fragments.
pub type TokenStream = BoxStream<'static, Result<String>>;

/// Options for a single generation request.
#[derive(Debug, Clone)]
pub struct GenerationOptions {
    /// Optional system prompt
    pub system: Option<String>,
    /// Sampling temperature
    pub temperature: f32,
    /// Optional completion length cap
    pub max_tokens: Option<usize>,
}

impl Default for GenerationOptions {
    fn default() -> Self {
        Self {
            system: None,
            temperature: 0.7,
            max_tokens: None,
        }
    }
}

impl GenerationOptions {
    /// Options with only a temperature set.
    #[must_use]
    pub fn with_temperature(temperature: f32) -> Self {
        Self {
            temperature,
            ..Self::default()
        }
    }
}

/// Trait for text generation providers
#[async_trait]
pub trait LlmProvider: Send + Sync {
    /// Generate a completion for the prompt
    ///
    /// # Errors
    ///
    /// `Error::ProviderUnavailable` on transport failure,
    /// `Error::RequestTimeout` when the endpoint does not answer in time.
    async fn generate(&self, prompt: &str, options: &GenerationOptions) -> Result<String>;

    /// Stream a completion as it is produced
    async fn stream(&self, prompt: &str, options: &GenerationOptions) -> Result<TokenStream>;

    /// Model name/identifier
    fn model_name(&self) -> &str;

    /// Check whether the endpoint answers at all
    async fn is_available(&self) -> bool;
}
