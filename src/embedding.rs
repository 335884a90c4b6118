//! Document vectors for unstructured extraction.
//!
//! [`Embedder`] wraps the configured provider:
//! - **disabled**: no vector artifact is written.
//! - **hashing**: [`HashingEmbedder`] from the core crate, no network.
//! - **openai**: `POST /v1/embeddings` with batching, retry and backoff.
//!
//! A document is split with [`chunk_text`], each chunk is embedded, and
//! the chunk vectors are mean-pooled into one fixed-length vector.
//!
//! # Retry Strategy
//!
//! The OpenAI provider uses exponential backoff for transient errors:
//! - HTTP 429 (rate limited) and 5xx (server error) → retry
//! - HTTP 4xx (client error, not 429) → fail immediately
//! - Network errors → retry
//! - Backoff: 1s, 2s, 4s, 8s, 16s, 32s (capped at 2^5)

use anyhow::bail;
use std::time::Duration;

use etl_harness_core::chunk::chunk_text;
use etl_harness_core::embedding::{mean_pool, EmbeddingProvider, HashingEmbedder};
use etl_harness_core::error::{EtlError, Result};

use crate::config::EmbeddingConfig;

const OPENAI_EMBEDDINGS_URL: &str = "https://api.openai.com/v1/embeddings";

/// The configured embedding backend.
pub enum Embedder {
    Disabled,
    Hashing(HashingEmbedder),
    OpenAI(OpenAIProvider),
}

impl Embedder {
    pub fn from_config(config: &EmbeddingConfig) -> anyhow::Result<Self> {
        match config.provider.as_str() {
            "disabled" => Ok(Embedder::Disabled),
            "hashing" => Ok(Embedder::Hashing(HashingEmbedder::new(config.dims))),
            "openai" => Ok(Embedder::OpenAI(OpenAIProvider::new(config)?)),
            other => bail!("Unknown embedding provider: {}", other),
        }
    }

    pub fn is_enabled(&self) -> bool {
        !matches!(self, Embedder::Disabled)
    }

    pub fn model_name(&self) -> &str {
        match self {
            Embedder::Disabled => "disabled",
            Embedder::Hashing(h) => h.model_name(),
            Embedder::OpenAI(o) => o.model_name(),
        }
    }

    pub fn dims(&self) -> usize {
        match self {
            Embedder::Disabled => 0,
            Embedder::Hashing(h) => h.dims(),
            Embedder::OpenAI(o) => o.dims(),
        }
    }

    /// One vector for the whole document, or `None` when embedding is
    /// disabled. Text without content yields the zero vector.
    pub async fn embed_document(&self, text: &str, max_tokens: usize) -> Result<Option<Vec<f32>>> {
        if !self.is_enabled() {
            return Ok(None);
        }
        let chunks = chunk_text(text, max_tokens);
        if chunks.is_empty() {
            return Ok(Some(vec![0.0; self.dims()]));
        }
        let vectors = match self {
            Embedder::Disabled => return Ok(None),
            Embedder::Hashing(h) => chunks.iter().map(|c| h.embed_text(c)).collect(),
            Embedder::OpenAI(o) => o.embed_texts(&chunks).await?,
        };
        let pooled = mean_pool(&vectors)
            .ok_or_else(|| EtlError::internal("embedding provider returned vectors of mixed length"))?;
        if pooled.len() != self.dims() {
            return Err(EtlError::internal(format!(
                "embedding has {} dimensions, expected {}",
                pooled.len(),
                self.dims()
            )));
        }
        Ok(Some(pooled))
    }
}

// ============ OpenAI Provider ============

/// Embedding provider using the OpenAI API.
///
/// Requires the `OPENAI_API_KEY` environment variable to be set.
pub struct OpenAIProvider {
    model: String,
    dims: usize,
    batch_size: usize,
    max_retries: u32,
    client: reqwest::Client,
    api_key: String,
}

impl OpenAIProvider {
    pub fn new(config: &EmbeddingConfig) -> anyhow::Result<Self> {
        let model = config
            .model
            .clone()
            .ok_or_else(|| anyhow::anyhow!("embedding.model required for OpenAI provider"))?;
        let api_key = std::env::var("OPENAI_API_KEY")
            .map_err(|_| anyhow::anyhow!("OPENAI_API_KEY environment variable not set"))?;
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()?;

        Ok(Self {
            model,
            dims: config.dims,
            batch_size: config.batch_size.max(1),
            max_retries: config.max_retries,
            client,
            api_key,
        })
    }

    async fn embed_texts(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        let mut out = Vec::with_capacity(texts.len());
        for batch in texts.chunks(self.batch_size) {
            out.extend(self.embed_batch(batch).await?);
        }
        Ok(out)
    }

    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        let body = serde_json::json!({
            "model": self.model,
            "input": texts,
            "dimensions": self.dims,
        });

        let mut last_err = None;

        for attempt in 0..=self.max_retries {
            if attempt > 0 {
                let delay = Duration::from_secs(1 << (attempt - 1).min(5));
                tokio::time::sleep(delay).await;
            }

            let resp = self
                .client
                .post(OPENAI_EMBEDDINGS_URL)
                .bearer_auth(&self.api_key)
                .json(&body)
                .send()
                .await;

            match resp {
                Ok(response) => {
                    let status = response.status();

                    if status.is_success() {
                        let json: serde_json::Value = response
                            .json()
                            .await
                            .map_err(|e| EtlError::SourceUnavailable(format!("OpenAI: {}", e)))?;
                        return parse_openai_response(&json);
                    }

                    let body_text = response.text().await.unwrap_or_default();
                    let err = EtlError::SourceUnavailable(format!(
                        "OpenAI API error {}: {}",
                        status, body_text
                    ));
                    if status.as_u16() == 429 || status.is_server_error() {
                        tracing::warn!(attempt, %status, "embedding request failed, retrying");
                        last_err = Some(err);
                        continue;
                    }
                    return Err(err);
                }
                Err(e) => {
                    last_err = Some(EtlError::SourceUnavailable(format!("OpenAI: {}", e)));
                    continue;
                }
            }
        }

        Err(last_err.unwrap_or_else(|| EtlError::internal("embedding failed after retries")))
    }
}

impl EmbeddingProvider for OpenAIProvider {
    fn model_name(&self) -> &str {
        &self.model
    }
    fn dims(&self) -> usize {
        self.dims
    }
}

/// Extract `data[].embedding` in `data[].index` order.
fn parse_openai_response(json: &serde_json::Value) -> Result<Vec<Vec<f32>>> {
    let data = json
        .get("data")
        .and_then(|d| d.as_array())
        .ok_or_else(|| EtlError::internal("invalid OpenAI response: missing data array"))?;

    let mut indexed = Vec::with_capacity(data.len());
    for (pos, item) in data.iter().enumerate() {
        let embedding = item
            .get("embedding")
            .and_then(|e| e.as_array())
            .ok_or_else(|| EtlError::internal("invalid OpenAI response: missing embedding"))?;
        let index = item
            .get("index")
            .and_then(|i| i.as_u64())
            .unwrap_or(pos as u64);
        let vec: Vec<f32> = embedding
            .iter()
            .map(|v| v.as_f64().unwrap_or(0.0) as f32)
            .collect();
        indexed.push((index, vec));
    }
    indexed.sort_by_key(|(i, _)| *i);
    Ok(indexed.into_iter().map(|(_, v)| v).collect())
}
