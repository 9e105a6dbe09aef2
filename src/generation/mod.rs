//! Text generation providers used by the answer synthesizer.

mod anthropic;
mod gemini;
mod openai;

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use reqwest::blocking::{Client, Response};
use reqwest::StatusCode;
use thiserror::Error;

use crate::config::{GenerationConfig, LlmProvider};

pub use anthropic::AnthropicGenerator;
pub use gemini::GeminiGenerator;
pub use openai::OpenAiGenerator;

/// Request envelope shared by every provider.
#[derive(Debug, Clone, Copy)]
pub struct GenerationRequest<'a> {
    /// Fixed system policy.
    pub system: &'a str,
    /// User turn: question plus retrieved context.
    pub prompt: &'a str,
    /// Sampling temperature.
    pub temperature: f32,
    /// Output token budget.
    pub max_tokens: usize,
}

/// Failure kinds the synthesizer maps to answer text.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum GenerationError {
    /// Quota or rate limit hit; surfaced immediately, never retried.
    #[error("generation backend is rate limited")]
    RateLimited,
    /// The request exceeded its deadline.
    #[error("generation request timed out")]
    Timeout,
    /// Anything else.
    #[error("{0}")]
    Failed(String),
}

/// Capability that turns a prompt into text.
pub trait Generator: Send + Sync {
    /// Provider label for logs.
    fn name(&self) -> &str;

    /// Runs one generation call.
    fn generate(&self, request: &GenerationRequest<'_>) -> Result<String, GenerationError>;
}

/// Stand-in for pipelines that only build or search; every call fails.
#[derive(Debug, Clone, Copy, Default)]
pub struct Disabled;

impl Generator for Disabled {
    fn name(&self) -> &str {
        "disabled"
    }

    fn generate(&self, _request: &GenerationRequest<'_>) -> Result<String, GenerationError> {
        Err(GenerationError::Failed(
            "no generation provider is configured".to_string(),
        ))
    }
}

/// Builds the provider selected by `config`.
pub fn from_config(config: &GenerationConfig) -> anyhow::Result<Arc<dyn Generator>> {
    let api_key = config
        .api_key
        .as_deref()
        .map(str::trim)
        .filter(|key| !key.is_empty())
        .context("missing generation API key (set ASKCAMPUS_LLM_API_KEY)")?
        .to_string();
    anyhow::ensure!(!config.model.trim().is_empty(), "missing generation model name");
    let model = config.model.trim().to_string();
    let generator: Arc<dyn Generator> = match config.provider {
        LlmProvider::Openai => Arc::new(OpenAiGenerator::new(api_key, model, config.timeout)?),
        LlmProvider::Anthropic => {
            Arc::new(AnthropicGenerator::new(api_key, model, config.timeout)?)
        }
        LlmProvider::Gemini => Arc::new(GeminiGenerator::new(api_key, model, config.timeout)?),
    };
    Ok(generator)
}

fn http_client(timeout: Duration, provider: &str) -> anyhow::Result<Client> {
    Client::builder()
        .timeout(timeout)
        .build()
        .with_context(|| format!("failed to build {provider} HTTP client"))
}

fn transport_error(provider: &str, err: reqwest::Error) -> GenerationError {
    if err.is_timeout() {
        GenerationError::Timeout
    } else {
        GenerationError::Failed(format!("failed to call {provider}: {err}"))
    }
}

/// Passes successful responses through and classifies the rest.
fn check_status(provider: &str, resp: Response) -> Result<Response, GenerationError> {
    let status = resp.status();
    if status.is_success() {
        return Ok(resp);
    }
    let body = resp
        .text()
        .unwrap_or_else(|_| "<body unavailable>".to_string());
    Err(classify_failure(provider, status, &body))
}

fn classify_failure(provider: &str, status: StatusCode, body: &str) -> GenerationError {
    if status == StatusCode::TOO_MANY_REQUESTS || body.contains("RESOURCE_EXHAUSTED") {
        GenerationError::RateLimited
    } else if status == StatusCode::REQUEST_TIMEOUT || status == StatusCode::GATEWAY_TIMEOUT {
        GenerationError::Timeout
    } else {
        GenerationError::Failed(format!("{provider} returned {status}: {}", body.trim()))
    }
}

fn parse_error(provider: &str, err: reqwest::Error) -> GenerationError {
    if err.is_timeout() {
        GenerationError::Timeout
    } else {
        GenerationError::Failed(format!("failed to parse {provider} response: {err}"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rate_limits_are_classified() {
        assert_eq!(
            classify_failure("Gemini", StatusCode::TOO_MANY_REQUESTS, ""),
            GenerationError::RateLimited
        );
        assert_eq!(
            classify_failure(
                "Gemini",
                StatusCode::BAD_REQUEST,
                r#"{"error":{"status":"RESOURCE_EXHAUSTED"}}"#
            ),
            GenerationError::RateLimited
        );
    }

    #[test]
    fn other_statuses_keep_details() {
        assert_eq!(
            classify_failure("OpenAI", StatusCode::GATEWAY_TIMEOUT, ""),
            GenerationError::Timeout
        );
        let err = classify_failure("OpenAI", StatusCode::UNAUTHORIZED, " bad key ");
        assert_eq!(
            err,
            GenerationError::Failed("OpenAI returned 401 Unauthorized: bad key".to_string())
        );
    }

    #[test]
    fn provider_requires_api_key() {
        let config = GenerationConfig::default();
        assert!(from_config(&config).is_err());
        let config = GenerationConfig {
            api_key: Some("key".to_string()),
            ..GenerationConfig::default()
        };
        assert_eq!(from_config(&config).expect("gemini").name(), "gemini");
    }
}
