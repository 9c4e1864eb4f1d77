//! Embedding providers.
//!
//! Concrete implementations of [`Embedder`]:
//! - **hash**: [`HashEmbedder`] from the core crate. Deterministic, offline,
//!   and the default.
//! - **openai**: [`OpenAiEmbedder`], `POST {url}/v1/embeddings`. Requires
//!   `OPENAI_API_KEY`.
//! - **ollama**: [`OllamaEmbedder`], `POST {url}/api/embed` on a local Ollama
//!   instance.
//!
//! Providers make exactly one request per call. Retries, backoff and
//! per-call timeouts are layered on top by [`RetryingEmbedder`], which the
//! engine always wraps around the configured provider.
//!
//! # Error classification
//!
//! - HTTP 429 (rate limited), 5xx, network errors → `EmbeddingUnavailable`
//!   (retryable)
//! - Other HTTP 4xx, unparseable responses → `MalformedInput` (not retried)

mod retrying;

pub use retrying::{EmbedderCounters, RetryingEmbedder};

use std::sync::Arc;
use std::time::Duration;

use anyhow::bail;
use async_trait::async_trait;
use live_context_core::embedding::{Embedder, HashEmbedder};
use live_context_core::{EngineError, Result};
use reqwest::StatusCode;

use crate::config::EmbeddingConfig;

const OPENAI_URL: &str = "https://api.openai.com";
const OLLAMA_URL: &str = "http://localhost:11434";

/// Instantiate the provider named by `config.provider`.
///
/// # Errors
///
/// Fails for an unknown provider name or, for `openai`, when
/// `OPENAI_API_KEY` is not set.
pub fn create_embedder(config: &EmbeddingConfig) -> anyhow::Result<Arc<dyn Embedder>> {
    match config.provider.as_str() {
        "hash" => Ok(Arc::new(
            HashEmbedder::new(config.dims).with_model_tag(config.model_name()),
        )),
        "openai" => Ok(Arc::new(OpenAiEmbedder::new(config)?)),
        "ollama" => Ok(Arc::new(OllamaEmbedder::new(config)?)),
        other => bail!(
            "Unknown embedding provider: '{}'. Must be hash, openai, or ollama.",
            other
        ),
    }
}

// ============ OpenAI ============

/// Embeddings through the OpenAI API.
pub struct OpenAiEmbedder {
    client: reqwest::Client,
    api_key: String,
    url: String,
    model: String,
    dims: usize,
}

impl OpenAiEmbedder {
    pub fn new(config: &EmbeddingConfig) -> anyhow::Result<Self> {
        let api_key = match std::env::var("OPENAI_API_KEY") {
            Ok(key) => key,
            Err(_) => bail!("OPENAI_API_KEY environment variable not set"),
        };
        Ok(Self {
            client: http_client(config.timeout())?,
            api_key,
            url: config
                .url
                .clone()
                .unwrap_or_else(|| OPENAI_URL.to_string()),
            model: config.model_name(),
            dims: config.dims,
        })
    }
}

#[async_trait]
impl Embedder for OpenAiEmbedder {
    fn model_tag(&self) -> &str {
        &self.model
    }

    fn dims(&self) -> usize {
        self.dims
    }

    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        let body = serde_json::json!({
            "model": self.model,
            "input": texts,
        });
        let request = self
            .client
            .post(format!("{}/v1/embeddings", self.url))
            .bearer_auth(&self.api_key)
            .json(&body);
        let json = send("OpenAI", request).await?;
        parse_openai_response(&json, texts.len())
    }
}

/// Extract `data[].embedding`, ordered by `data[].index` when present.
fn parse_openai_response(json: &serde_json::Value, expected: usize) -> Result<Vec<Vec<f32>>> {
    let data = json
        .get("data")
        .and_then(|d| d.as_array())
        .ok_or_else(|| malformed("Invalid OpenAI response: missing data array"))?;

    let mut indexed = Vec::with_capacity(data.len());
    for (pos, item) in data.iter().enumerate() {
        let index = item
            .get("index")
            .and_then(|i| i.as_u64())
            .map(|i| i as usize)
            .unwrap_or(pos);
        let embedding = item
            .get("embedding")
            .ok_or_else(|| malformed("Invalid OpenAI response: missing embedding"))?;
        indexed.push((index, to_vector(embedding)?));
    }
    indexed.sort_by_key(|(i, _)| *i);

    let vectors: Vec<Vec<f32>> = indexed.into_iter().map(|(_, v)| v).collect();
    check_count(vectors, expected)
}

// ============ Ollama ============

/// Embeddings through a local Ollama instance.
pub struct OllamaEmbedder {
    client: reqwest::Client,
    url: String,
    model: String,
    dims: usize,
}

impl OllamaEmbedder {
    pub fn new(config: &EmbeddingConfig) -> anyhow::Result<Self> {
        Ok(Self {
            client: http_client(config.timeout())?,
            url: config
                .url
                .clone()
                .unwrap_or_else(|| OLLAMA_URL.to_string()),
            model: config.model_name(),
            dims: config.dims,
        })
    }
}

#[async_trait]
impl Embedder for OllamaEmbedder {
    fn model_tag(&self) -> &str {
        &self.model
    }

    fn dims(&self) -> usize {
        self.dims
    }

    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        let body = serde_json::json!({
            "model": self.model,
            "input": texts,
        });
        let request = self
            .client
            .post(format!("{}/api/embed", self.url))
            .json(&body);
        let json = send("Ollama", request).await?;
        parse_ollama_response(&json, texts.len())
    }
}

fn parse_ollama_response(json: &serde_json::Value, expected: usize) -> Result<Vec<Vec<f32>>> {
    let embeddings = json
        .get("embeddings")
        .and_then(|e| e.as_array())
        .ok_or_else(|| malformed("Invalid Ollama response: missing embeddings array"))?;

    let vectors = embeddings
        .iter()
        .map(to_vector)
        .collect::<Result<Vec<_>>>()?;
    check_count(vectors, expected)
}

// ============ Shared HTTP plumbing ============

fn http_client(timeout: Duration) -> anyhow::Result<reqwest::Client> {
    Ok(reqwest::Client::builder().timeout(timeout).build()?)
}

/// Send one request and classify the outcome.
async fn send(provider: &str, request: reqwest::RequestBuilder) -> Result<serde_json::Value> {
    let response = request.send().await.map_err(|e| {
        EngineError::EmbeddingUnavailable(format!("{} connection error: {}", provider, e))
    })?;

    let status = response.status();
    if status.is_success() {
        return response.json().await.map_err(|e| {
            EngineError::MalformedInput(format!("{} returned invalid JSON: {}", provider, e))
        });
    }

    let body = response.text().await.unwrap_or_default();
    Err(classify_status(provider, status, &body))
}

fn classify_status(provider: &str, status: StatusCode, body: &str) -> EngineError {
    let message = format!("{} API error {}: {}", provider, status, body);
    if status == StatusCode::TOO_MANY_REQUESTS || status.is_server_error() {
        EngineError::EmbeddingUnavailable(message)
    } else {
        EngineError::MalformedInput(message)
    }
}

fn to_vector(value: &serde_json::Value) -> Result<Vec<f32>> {
    let array = value
        .as_array()
        .ok_or_else(|| malformed("Invalid embedding response: embedding is not an array"))?;
    Ok(array
        .iter()
        .map(|v| v.as_f64().unwrap_or(0.0) as f32)
        .collect())
}

fn check_count(vectors: Vec<Vec<f32>>, expected: usize) -> Result<Vec<Vec<f32>>> {
    if vectors.len() != expected {
        return Err(malformed(&format!(
            "expected {} embeddings, got {}",
            expected,
            vectors.len()
        )));
    }
    Ok(vectors)
}

fn malformed(message: &str) -> EngineError {
    EngineError::MalformedInput(message.to_string())
}
