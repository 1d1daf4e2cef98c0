//! Client for the embedding service.
//!
//! The service is a sibling process exposing `POST /embed {text}` →
//! `{vector: [f32]}`. The declared dimension is verified once on startup and
//! again on every returned vector — a wrong-size vector is a hard error, not
//! something to pad or truncate.

use async_trait::async_trait;
use rand::Rng;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::error::{MemoryError, Result};

/// Transport retries for embedding calls.
const EMBED_RETRIES: u32 = 2;
/// Base backoff between retries; jittered.
const RETRY_BASE_MS: u64 = 250;

/// Anything that turns text into a fixed-dimension vector.
#[async_trait]
pub trait Embedder: Send + Sync {
    async fn embed(&self, text: &str) -> Result<Vec<f32>>;

    /// Declared output dimension.
    fn dim(&self) -> usize;
}

/// HTTP embedder backed by the embedding service.
pub struct HttpEmbedder {
    client: reqwest::Client,
    base_url: String,
    model: String,
    dim: usize,
}

#[derive(Serialize)]
struct EmbedRequest<'a> {
    text: &'a str,
    model: &'a str,
}

#[derive(Deserialize)]
struct EmbedResponse {
    vector: Vec<f32>,
}

impl HttpEmbedder {
    pub fn new(base_url: String, model: String, dim: usize, timeout_secs: u64) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(timeout_secs))
            .build()
            .map_err(|e| MemoryError::Embedding(e.to_string()))?;
        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            model,
            dim,
        })
    }

    /// Probe the service once and verify the declared dimension.
    pub async fn verify(&self) -> Result<()> {
        let vector = self.embed("dimension probe").await?;
        debug!(dim = vector.len(), "embedding service verified");
        Ok(())
    }

    async fn embed_once(&self, text: &str) -> Result<Vec<f32>> {
        let url = format!("{}/embed", self.base_url);
        let resp = self
            .client
            .post(&url)
            .json(&EmbedRequest {
                text,
                model: &self.model,
            })
            .send()
            .await
            .map_err(|e| MemoryError::Embedding(e.to_string()))?;

        if !resp.status().is_success() {
            let status = resp.status().as_u16();
            let body = resp.text().await.unwrap_or_default();
            return Err(MemoryError::Embedding(format!(
                "embedding service returned {status}: {body}"
            )));
        }

        let parsed: EmbedResponse = resp
            .json()
            .await
            .map_err(|e| MemoryError::Embedding(e.to_string()))?;

        if parsed.vector.len() != self.dim {
            return Err(MemoryError::DimensionMismatch {
                expected: self.dim,
                got: parsed.vector.len(),
            });
        }
        Ok(parsed.vector)
    }
}

#[async_trait]
impl Embedder for HttpEmbedder {
    async fn embed(&self, text: &str) -> Result<Vec<f32>> {
        let mut last_err = None;
        for attempt in 0..=EMBED_RETRIES {
            match self.embed_once(text).await {
                Ok(v) => return Ok(v),
                // dimension mismatches are config errors — retrying won't help
                Err(e @ MemoryError::DimensionMismatch { .. }) => return Err(e),
                Err(e) => {
                    warn!(attempt, error = %e, "embedding call failed");
                    last_err = Some(e);
                    if attempt < EMBED_RETRIES {
                        let jitter = rand::thread_rng().gen_range(0..RETRY_BASE_MS);
                        let delay = RETRY_BASE_MS * (1 << attempt) + jitter;
                        tokio::time::sleep(std::time::Duration::from_millis(delay)).await;
                    }
                }
            }
        }
        Err(last_err.unwrap_or_else(|| MemoryError::Embedding("exhausted retries".into())))
    }

    fn dim(&self) -> usize {
        self.dim
    }
}
