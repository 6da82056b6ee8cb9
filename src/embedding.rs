//! Embedding provider construction and HTTP-backed providers.
//!
//! | Provider | Config `provider` | Notes |
//! |----------|-------------------|-------|
//! | [`HashingEmbedder`] | `hashing` | Local, deterministic, no network. Default. |
//! | [`HttpEmbedder`] (OpenAI) | `openai` | `POST https://api.openai.com/v1/embeddings`, needs `OPENAI_API_KEY` |
//! | [`HttpEmbedder`] (Ollama) | `ollama` | `POST {url}/api/embed`, default url `http://localhost:11434` |
//!
//! HTTP providers do not retry on their own; the orchestrator wraps every
//! call in its [`RetryPolicy`](crate::retry::RetryPolicy). Status codes are
//! mapped by [`crate::http`].
//!
//! ```rust,no_run
//! # use excuse_harness::config::EmbeddingConfig;
//! # use excuse_harness::embedding::create_provider;
//! let config = EmbeddingConfig::default(); // provider = "hashing"
//! let provider = create_provider(&config).unwrap();
//! assert_eq!(provider.model_name(), "hashing-bow");
//! ```

use anyhow::{bail, Result};
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;

use excuse_harness_core::embedding::{EmbeddingProvider, HashingEmbedder};
use excuse_harness_core::{PipelineError, PipelineResult};

use crate::config::EmbeddingConfig;
use crate::http;

const CAPABILITY: &str = "embedding";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EmbeddingApi {
    OpenAI,
    Ollama,
}

/// Embedding provider calling OpenAI or Ollama over HTTP.
pub struct HttpEmbedder {
    api: EmbeddingApi,
    model: String,
    dims: usize,
    endpoint: String,
    client: reqwest::Client,
}

impl HttpEmbedder {
    pub fn new(api: EmbeddingApi, config: &EmbeddingConfig) -> Result<Self> {
        let model = config
            .model
            .clone()
            .ok_or_else(|| anyhow::anyhow!("embedding.model required for {:?} provider", api))?;

        let endpoint = match api {
            EmbeddingApi::OpenAI => {
                // Verify API key is available
                if std::env::var("OPENAI_API_KEY").is_err() {
                    bail!("OPENAI_API_KEY environment variable not set");
                }
                "https://api.openai.com/v1/embeddings".to_string()
            }
            EmbeddingApi::Ollama => format!(
                "{}/api/embed",
                config
                    .url
                    .as_deref()
                    .unwrap_or("http://localhost:11434")
                    .trim_end_matches('/')
            ),
        };

        Ok(Self {
            api,
            model,
            dims: config.dims,
            endpoint,
            client: http::client(Duration::from_secs(config.timeout_secs))?,
        })
    }
}

#[async_trait]
impl EmbeddingProvider for HttpEmbedder {
    fn model_name(&self) -> &str {
        &self.model
    }

    fn dims(&self) -> usize {
        self.dims
    }

    async fn embed(&self, texts: &[String]) -> PipelineResult<Vec<Vec<f32>>> {
        if texts.is_empty() {
            return Ok(Vec::new());
        }
        let body = serde_json::json!({
            "model": self.model,
            "input": texts,
        });

        let mut req = self.client.post(&self.endpoint).json(&body);
        if self.api == EmbeddingApi::OpenAI {
            req = req.bearer_auth(http::api_key(CAPABILITY, "OPENAI_API_KEY")?);
        }

        let response = req
            .send()
            .await
            .map_err(|e| http::transport_error(CAPABILITY, e))?;
        let status = response.status();
        if !status.is_success() {
            let body_text = response.text().await.unwrap_or_default();
            return Err(http::status_error(CAPABILITY, status, &body_text));
        }
        let json: serde_json::Value = response
            .json()
            .await
            .map_err(|e| http::transport_error(CAPABILITY, e))?;

        let vectors = match self.api {
            EmbeddingApi::OpenAI => parse_openai_response(&json)?,
            EmbeddingApi::Ollama => parse_ollama_response(&json)?,
        };
        if vectors.len() != texts.len() {
            return Err(PipelineError::capability_unavailable(
                CAPABILITY,
                format!("expected {} embeddings, got {}", texts.len(), vectors.len()),
            ));
        }
        Ok(vectors)
    }
}

fn malformed(what: &str) -> PipelineError {
    PipelineError::capability_unavailable(CAPABILITY, format!("invalid response: {}", what))
}

fn to_vec(values: &[serde_json::Value]) -> Vec<f32> {
    values
        .iter()
        .map(|v| v.as_f64().unwrap_or(0.0) as f32)
        .collect()
}

/// Extract `data[].embedding`, ordered by `index` when present.
fn parse_openai_response(json: &serde_json::Value) -> PipelineResult<Vec<Vec<f32>>> {
    let data = json
        .get("data")
        .and_then(|d| d.as_array())
        .ok_or_else(|| malformed("missing data array"))?;

    let mut indexed = Vec::with_capacity(data.len());
    for (pos, item) in data.iter().enumerate() {
        let embedding = item
            .get("embedding")
            .and_then(|e| e.as_array())
            .ok_or_else(|| malformed("missing embedding"))?;
        let index = item
            .get("index")
            .and_then(|i| i.as_u64())
            .map(|i| i as usize)
            .unwrap_or(pos);
        indexed.push((index, to_vec(embedding)));
    }
    indexed.sort_by_key(|(i, _)| *i);
    Ok(indexed.into_iter().map(|(_, v)| v).collect())
}

fn parse_ollama_response(json: &serde_json::Value) -> PipelineResult<Vec<Vec<f32>>> {
    let embeddings = json
        .get("embeddings")
        .and_then(|e| e.as_array())
        .ok_or_else(|| malformed("missing embeddings array"))?;

    embeddings
        .iter()
        .map(|e| {
            e.as_array()
                .map(|a| to_vec(a))
                .ok_or_else(|| malformed("embedding is not an array"))
        })
        .collect()
}

/// Create the embedding provider named by `config.provider`.
pub fn create_provider(config: &EmbeddingConfig) -> Result<Arc<dyn EmbeddingProvider>> {
    match config.provider.as_str() {
        "hashing" => Ok(Arc::new(HashingEmbedder::new(config.dims))),
        "openai" => Ok(Arc::new(HttpEmbedder::new(EmbeddingApi::OpenAI, config)?)),
        "ollama" => Ok(Arc::new(HttpEmbedder::new(EmbeddingApi::Ollama, config)?)),
        other => bail!("Unknown embedding provider: {}", other),
    }
}
