//! HTTP generation provider for a local Ollama-compatible endpoint.

use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use serde::{Deserialize, Serialize};

use super::provider::{GenerationOptions, LlmProvider, TokenStream};
use crate::error::{Error, Result};

/// Generation provider backed by a local HTTP endpoint
/// (`POST <base>/api/generate`, Ollama wire format; streaming responses are
/// newline-delimited JSON).
pub struct HttpLlmProvider {
    client: reqwest::Client,
    base_url: String,
    model: String,
}

#[derive(Debug, Serialize)]
struct GenerateRequest<'a> {
    model: &'a str,
    prompt: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    system: Option<&'a str>,
    stream: bool,
    options: GenerateOptions,
}

#[derive(Debug, Serialize)]
struct GenerateOptions {
    temperature: f32,
    #[serde(skip_serializing_if = "Option::is_none")]
    num_predict: Option<usize>,
}

#[derive(Debug, Deserialize)]
struct GenerateResponse {
    #[serde(default)]
    response: String,
    #[serde(default)]
    done: bool,
}

impl HttpLlmProvider {
    /// Create a provider against `base_url` with a per-request timeout.
    pub fn new(base_url: &str, model: &str, timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| Error::Config(format!("failed to build HTTP client: {e}")))?;

        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            model: model.to_string(),
        })
    }

    fn build_request<'a>(
        &'a self,
        prompt: &'a str,
        options: &'a GenerationOptions,
        stream: bool,
    ) -> GenerateRequest<'a> {
        GenerateRequest {
            model: &self.model,
            prompt,
            system: options.system.as_deref(),
            stream,
            options: GenerateOptions {
                temperature: options.temperature,
                num_predict: options.max_tokens,
            },
        }
    }

    async fn send(&self, request: &GenerateRequest<'_>) -> Result<reqwest::Response> {
        let url = format!("{}/api/generate", self.base_url);
        let response = self
            .client
            .post(&url)
            .json(request)
            .send()
            .await
            .map_err(|e| classify_transport_error(&e))?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(Error::ProviderUnavailable(format!(
                "generation endpoint returned {status}: {body}"
            )));
        }
        Ok(response)
    }
}

#[async_trait]
impl LlmProvider for HttpLlmProvider {
    async fn generate(&self, prompt: &str, options: &GenerationOptions) -> Result<String> {
        let request = self.build_request(prompt, options, false);
        let response = self.send(&request).await?;
        let parsed: GenerateResponse = response
            .json()
            .await
            .map_err(|e| Error::ProviderUnavailable(format!("invalid generation response: {e}")))?;
        Ok(parsed.response)
    }

    async fn stream(&self, prompt: &str, options: &GenerationOptions) -> Result<TokenStream> {
        let request = self.build_request(prompt, options, true);
        let response = self.send(&request).await?;

        // Each NDJSON line carries one fragment; a trailing partial line is
        // buffered until its newline arrives.
        let stream = response
            .bytes_stream()
            .map(|chunk| chunk.map_err(|e| Error::ProviderUnavailable(format!("stream error: {e}"))))
            .scan(String::new(), |buffer, chunk| {
                let out = match chunk {
                    Ok(bytes) => {
                        buffer.push_str(&String::from_utf8_lossy(&bytes));
                        let mut fragments = Vec::new();
                        while let Some(pos) = buffer.find('\n') {
                            let line: String = buffer.drain(..=pos).collect();
                            let line = line.trim();
                            if line.is_empty() {
                                continue;
                            }
                            match serde_json::from_str::<GenerateResponse>(line) {
                                Ok(parsed) if !parsed.done || !parsed.response.is_empty() => {
                                    fragments.push(Ok(parsed.response));
                                }
                                Ok(_) => {}
                                Err(e) => fragments.push(Err(Error::Serialization(e))),
                            }
                        }
                        fragments
                    }
                    Err(e) => vec![Err(e)],
                };
                futures::future::ready(Some(futures::stream::iter(out)))
            })
            .flatten();

        Ok(Box::pin(stream))
    }

    fn model_name(&self) -> &str {
        &self.model
    }

    async fn is_available(&self) -> bool {
        let url = format!("{}/api/tags", self.base_url);
        match self.client.get(&url).send().await {
            Ok(response) => response.status().is_success(),
            Err(_) => false,
        }
    }
}

fn classify_transport_error(error: &reqwest::Error) -> Error {
    if error.is_timeout() {
        Error::RequestTimeout(format!("generation request timed out: {error}"))
    } else {
        Error::ProviderUnavailable(format!("generation endpoint unreachable: {error}"))
    }
}
