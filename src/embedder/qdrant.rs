//! Qdrant Cloud Inference embedding client.

use anyhow::{anyhow, Context, Result};
use reqwest::blocking::Client;
use reqwest::header::{HeaderMap, HeaderValue, CONTENT_TYPE};
use serde::{Deserialize, Serialize};

use super::{api_key, check_batch, post_with_retry, Embedder};
use crate::config::EmbeddingConfig;

/// Blocking client for a Qdrant `/inference/text` endpoint.
#[derive(Clone)]
pub struct QdrantEmbedder {
    client: Client,
    endpoint: String,
    model: String,
    max_retries: usize,
    batch_size: usize,
}

impl QdrantEmbedder {
    /// Builds a client; `config.endpoint` must be the full inference URL, e.g.
    /// `https://cluster-id.cloud.qdrant.io/inference/text`.
    pub fn new(config: &EmbeddingConfig) -> Result<Self> {
        let key = api_key(config, "Qdrant")?;
        let endpoint = config.endpoint.trim();
        anyhow::ensure!(
            endpoint.starts_with("http://") || endpoint.starts_with("https://"),
            "Qdrant endpoint must be an http(s) URL"
        );
        anyhow::ensure!(!config.model.trim().is_empty(), "missing Qdrant model name");
        let mut headers = HeaderMap::new();
        headers.insert(
            "api-key",
            HeaderValue::from_str(&key).context("invalid Qdrant API key")?,
        );
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        let client = Client::builder()
            .timeout(config.timeout)
            .default_headers(headers)
            .build()
            .context("failed to build Qdrant HTTP client")?;
        Ok(Self {
            client,
            endpoint: endpoint.trim_end_matches('/').to_string(),
            model: config.model.trim().to_string(),
            max_retries: config.max_retries,
            batch_size: config.batch_size.max(1),
        })
    }
}

impl Embedder for QdrantEmbedder {
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
        let request = InferenceRequest {
            model: &self.model,
            inputs,
        };
        let payload: InferenceResponse = post_with_retry("Qdrant", self.max_retries, || {
            self.client.post(&self.endpoint).json(&request).send()
        })?;
        payload.into_embeddings(inputs.len())
    }
}

#[derive(Serialize)]
struct InferenceRequest<'a> {
    model: &'a str,
    #[serde(rename = "input")]
    inputs: &'a [&'a str],
}

/// Clusters answer either with `data: [{embedding, index}]` or a bare `embeddings` array.
#[derive(Debug, Deserialize)]
struct InferenceResponse {
    #[serde(default)]
    data: Vec<InferenceData>,
    #[serde(default)]
    embeddings: Vec<Vec<f32>>,
}

impl InferenceResponse {
    fn into_embeddings(self, expected_len: usize) -> Result<Vec<Vec<f32>>> {
        let vectors = if !self.data.is_empty() {
            let mut data = self.data;
            data.sort_by_key(|d| d.index.unwrap_or(0));
            data.into_iter().map(|d| d.embedding).collect::<Vec<_>>()
        } else if !self.embeddings.is_empty() {
            self.embeddings
        } else {
            return Err(anyhow!("Qdrant response missing embedding payloads"));
        };
        anyhow::ensure!(
            vectors.len() == expected_len,
            "Qdrant returned {} embeddings for {} inputs",
            vectors.len(),
            expected_len
        );
        Ok(vectors)
    }
}

#[derive(Debug, Deserialize)]
struct InferenceData {
    embedding: Vec<f32>,
    #[serde(default)]
    index: Option<usize>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn data_payload_is_reordered_by_index() {
        let payload: InferenceResponse = serde_json::from_str(
            r#"{"data":[{"embedding":[2.0],"index":1},{"embedding":[1.0],"index":0}]}"#,
        )
        .expect("parse");
        assert_eq!(payload.into_embeddings(2).expect("vectors"), vec![vec![1.0], vec![2.0]]);
    }

    #[test]
    fn bare_embeddings_payload_is_accepted() {
        let payload: InferenceResponse =
            serde_json::from_str(r#"{"embeddings":[[0.5,0.5]]}"#).expect("parse");
        assert_eq!(payload.into_embeddings(1).expect("vectors"), vec![vec![0.5, 0.5]]);
    }

    #[test]
    fn count_mismatch_and_empty_payload_fail() {
        let payload: InferenceResponse =
            serde_json::from_str(r#"{"embeddings":[[0.5]]}"#).expect("parse");
        assert!(payload.into_embeddings(2).is_err());
        let payload: InferenceResponse = serde_json::from_str("{}").expect("parse");
        assert!(payload.into_embeddings(1).is_err());
    }

    #[test]
    fn endpoint_must_be_http() {
        let config = EmbeddingConfig {
            backend: crate::config::EmbeddingBackend::Qdrant,
            api_key: Some("key".to_string()),
            endpoint: "cluster.cloud.qdrant.io".to_string(),
            model: "qdrant/all-MiniLM-L6-v2".to_string(),
            ..EmbeddingConfig::default()
        };
        assert!(QdrantEmbedder::new(&config).is_err());
    }
}
