//! Text generation against a local LLM endpoint.

mod http;
mod provider;

pub use http::HttpLlmProvider;
pub use provider::{GenerationOptions, LlmProvider, TokenStream};
