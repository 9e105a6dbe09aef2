use std::time::Duration;

use anyhow::Context;
use reqwest::blocking::Client;
use reqwest::header::{HeaderMap, HeaderValue, CONTENT_TYPE};
use serde::{Deserialize, Serialize};

use super::{
    check_status, http_client, parse_error, transport_error, GenerationError, GenerationRequest,
    Generator,
};

const ENDPOINT: &str = "https://api.anthropic.com/v1/messages";

/// Anthropic messages API.
pub struct AnthropicGenerator {
    model: String,
    headers: HeaderMap,
    client: Client,
}

impl AnthropicGenerator {
    /// Builds a client with a per-request timeout.
    pub fn new(api_key: String, model: String, timeout: Duration) -> anyhow::Result<Self> {
        let mut headers = HeaderMap::new();
        headers.insert(
            "x-api-key",
            HeaderValue::from_str(api_key.trim()).context("invalid Anthropic API key")?,
        );
        headers.insert("anthropic-version", HeaderValue::from_static("2023-06-01"));
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        Ok(Self {
            model,
            headers,
            client: http_client(timeout, "Anthropic")?,
        })
    }
}

impl Generator for AnthropicGenerator {
    fn name(&self) -> &str {
        "anthropic"
    }

    fn generate(&self, request: &GenerationRequest<'_>) -> Result<String, GenerationError> {
        let body = AnthropicRequest {
            model: &self.model,
            max_tokens: request.max_tokens,
            temperature: request.temperature,
            system: request.system,
            messages: vec![AnthropicMessage {
                role: "user",
                content: vec![AnthropicContentBlock {
                    kind: "text",
                    text: request.prompt,
                }],
            }],
        };
        let resp = self
            .client
            .post(ENDPOINT)
            .headers(self.headers.clone())
            .json(&body)
            .send()
            .map_err(|err| transport_error("Anthropic", err))?;
        let parsed: AnthropicResponse = check_status("Anthropic", resp)?
            .json()
            .map_err(|err| parse_error("Anthropic", err))?;
        Ok(parsed.text())
    }
}

#[derive(Serialize)]
struct AnthropicRequest<'a> {
    model: &'a str,
    max_tokens: usize,
    temperature: f32,
    system: &'a str,
    messages: Vec<AnthropicMessage<'a>>,
}

#[derive(Serialize)]
struct AnthropicMessage<'a> {
    role: &'a str,
    content: Vec<AnthropicContentBlock<'a>>,
}

#[derive(Serialize)]
struct AnthropicContentBlock<'a> {
    #[serde(rename = "type")]
    kind: &'a str,
    text: &'a str,
}

#[derive(Debug, Deserialize)]
struct AnthropicResponse {
    content: Vec<AnthropicResponseBlock>,
}

impl AnthropicResponse {
    fn text(self) -> String {
        self.content
            .into_iter()
            .filter_map(|block| match block {
                AnthropicResponseBlock::Text { text } => Some(text),
                AnthropicResponseBlock::Other => None,
            })
            .collect::<Vec<_>>()
            .join("\n")
    }
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum AnthropicResponseBlock {
    Text {
        text: String,
    },
    #[serde(other)]
    Other,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn joins_text_blocks_and_skips_others() {
        let parsed: AnthropicResponse = serde_json::from_str(
            r#"{"content":[{"type":"text","text":"One."},{"type":"tool_use","id":"x"},{"type":"text","text":"Two."}]}"#,
        )
        .expect("parse");
        assert_eq!(parsed.text(), "One.\nTwo.");
    }
}
