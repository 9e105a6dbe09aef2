//! Embedding backends that turn chunk and query text into vectors.

mod hashing;
mod openai;
mod qdrant;

use std::sync::Arc;
use std::thread;
use std::time::Duration;

use anyhow::{Context, Result};
use reqwest::blocking::Response;
use reqwest::StatusCode;
use serde::de::DeserializeOwned;
use tracing::warn;

use crate::config::{EmbeddingBackend, EmbeddingConfig};

pub use hashing::HashingEmbedder;
pub use openai::OpenAiEmbedder;
pub use qdrant::QdrantEmbedder;

/// Text-to-vector capability shared by the index builder and the query path.
///
/// Implementations must be deterministic for a fixed model: the same input
/// always maps to the same vector.
pub trait Embedder: Send + Sync {
    /// Model identifier recorded in the index manifest.
    fn model(&self) -> &str;

    /// Largest batch accepted by [`Embedder::embed_batch`].
    fn batch_size(&self) -> usize;

    /// Embeds `inputs`, returning one vector per input in the same order.
    fn embed_batch(&self, inputs: &[&str]) -> Result<Vec<Vec<f32>>>;

    /// Embeds a single string.
    fn embed_one(&self, input: &str) -> Result<Vec<f32>> {
        let mut vectors = self.embed_batch(&[input])?;
        anyhow::ensure!(vectors.len() == 1, "embedder returned {} vectors for 1 input", vectors.len());
        Ok(vectors.remove(0))
    }
}

/// Builds the backend selected by `config`.
pub fn from_config(config: &EmbeddingConfig) -> Result<Arc<dyn Embedder>> {
    let embedder: Arc<dyn Embedder> = match config.backend {
        EmbeddingBackend::Openai => Arc::new(OpenAiEmbedder::new(config)?),
        EmbeddingBackend::Qdrant => Arc::new(QdrantEmbedder::new(config)?),
        EmbeddingBackend::Hashing => Arc::new(HashingEmbedder::new(
            config.dimensions.unwrap_or(hashing::DEFAULT_DIMENSIONS),
            config.batch_size,
        )),
    };
    Ok(embedder)
}

fn api_key(config: &EmbeddingConfig, backend: &str) -> Result<String> {
    let key = config
        .api_key
        .as_deref()
        .map(str::trim)
        .filter(|key| !key.is_empty())
        .with_context(|| format!("missing {backend} API key (set ASKCAMPUS_EMBEDDING_API_KEY)"))?;
    Ok(key.to_string())
}

fn check_batch(inputs: &[&str], batch_size: usize) -> Result<()> {
    anyhow::ensure!(
        inputs.len() <= batch_size,
        "batch of {} exceeds configured max {}",
        inputs.len(),
        batch_size
    );
    Ok(())
}

/// Posts through `send`, retrying throttling, server errors and transport
/// failures with exponential backoff.
fn post_with_retry<T: DeserializeOwned>(
    backend: &str,
    max_retries: usize,
    send: impl Fn() -> reqwest::Result<Response>,
) -> Result<T> {
    let max_retries = max_retries.max(1);
    let mut attempt = 0usize;
    loop {
        match send() {
            Ok(resp) => {
                let status = resp.status();
                if status.is_success() {
                    return resp
                        .json()
                        .with_context(|| format!("failed to parse {backend} embedding response"));
                }
                let body = resp
                    .text()
                    .unwrap_or_else(|_| "<body unavailable>".to_string());
                if should_retry(status) && attempt + 1 < max_retries {
                    attempt += 1;
                    warn!(backend, %status, attempt, "embedding request failed; retrying");
                    thread::sleep(retry_backoff(attempt));
                    continue;
                }
                anyhow::bail!("{backend} embeddings request failed ({status}): {body}");
            }
            Err(err) => {
                if is_retryable_error(&err) && attempt + 1 < max_retries {
                    attempt += 1;
                    warn!(backend, error = %err, attempt, "embedding transport error; retrying");
                    thread::sleep(retry_backoff(attempt));
                    continue;
                }
                return Err(err).with_context(|| format!("{backend} embeddings request failed"));
            }
        }
    }
}

fn should_retry(status: StatusCode) -> bool {
    status == StatusCode::TOO_MANY_REQUESTS || status.is_server_error()
}

fn is_retryable_error(err: &reqwest::Error) -> bool {
    err.is_timeout() || err.is_connect() || err.is_body() || err.is_request()
}

fn retry_backoff(attempt: usize) -> Duration {
    let capped = attempt.min(5) as u32;
    Duration::from_millis(500 * (1 << capped))
}
