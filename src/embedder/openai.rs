//! OpenAI-compatible `/embeddings` client.

use anyhow::{Context, Result};
use reqwest::blocking::Client;
use reqwest::header::{HeaderMap, HeaderValue, AUTHORIZATION, CONTENT_TYPE};
use serde::{Deserialize, Serialize};

use super::{api_key, check_batch, post_with_retry, Embedder};
use crate::config::EmbeddingConfig;

/// Blocking embeddings client for OpenAI and API-compatible servers.
#[derive(Clone)]
pub struct OpenAiEmbedder {
    client: Client,
    endpoint: String,
    model: String,
    dimensions: Option<usize>,
    max_retries: usize,
    batch_size: usize,
}

impl OpenAiEmbedder {
    /// Builds a client from the embedding settings; `endpoint` is the API base URL.
    pub fn new(config: &EmbeddingConfig) -> Result<Self> {
        let key = api_key(config, "OpenAI")?;
        anyhow::ensure!(!config.model.trim().is_empty(), "missing OpenAI model name");
        let mut headers = HeaderMap::new();
        headers.insert(
            AUTHORIZATION,
            HeaderValue::from_str(&format!("Bearer {key}")).context("invalid OpenAI API key")?,
        );
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        let client = Client::builder()
            .timeout(config.timeout)
            .default_headers(headers)
            .build()
            .context("failed to build OpenAI HTTP client")?;
        Ok(Self {
            client,
            endpoint: format!("{}/embeddings", config.endpoint.trim_end_matches('/')),
            model: config.model.trim().to_string(),
            dimensions: config.dimensions,
            max_retries: config.max_retries,
            batch_size: config.batch_size.max(1),
        })
    }
}

impl Embedder for OpenAiEmbedder {
    fn model(&self) -> &str {
        &self.model
    }

    fn batch_size(&self) -> usize {
        self.batch_size
    }

    fn embed_batch(&self, inputs: &[&str]) -> Result<Vec<Vec<f32>>> {
        if inputs.is_empty() {
            return Ok(Vec::new());
        }
        check_batch(inputs, self.batch_size)?;
        let request = EmbeddingRequest {
            model: &self.model,
            input: inputs,
            dimensions: self.dimensions,
        };
        let mut parsed: EmbeddingResponse = post_with_retry("OpenAI", self.max_retries, || {
            self.client.post(&self.endpoint).json(&request).send()
        })?;
        parsed.data.sort_by_key(|entry| entry.index);
        anyhow::ensure!(
            parsed.data.len() == inputs.len(),
            "OpenAI returned {} embeddings for {} inputs",
            parsed.data.len(),
            inputs.len()
        );
        Ok(parsed.data.into_iter().map(|entry| entry.embedding).collect())
    }
}

#[derive(Serialize)]
struct EmbeddingRequest<'a> {
    model: &'a str,
    #[serde(borrow)]
    input: &'a [&'a str],
    #[serde(skip_serializing_if = "Option::is_none")]
    dimensions: Option<usize>,
}

#[derive(Debug, Deserialize)]
struct EmbeddingResponse {
    data: Vec<EmbeddingData>,
}

#[derive(Debug, Deserialize)]
struct EmbeddingData {
    embedding: Vec<f32>,
    index: usize,
}
