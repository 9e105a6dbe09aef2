use std::time::Duration;

use anyhow::Context;
use reqwest::blocking::Client;
use reqwest::header::{HeaderMap, HeaderValue, AUTHORIZATION, CONTENT_TYPE};
use serde::{Deserialize, Serialize};

use super::{
    check_status, http_client, parse_error, transport_error, GenerationError, GenerationRequest,
    Generator,
};

const ENDPOINT: &str = "https://api.openai.com/v1/chat/completions";

/// OpenAI chat completions.
pub struct OpenAiGenerator {
    model: String,
    headers: HeaderMap,
    client: Client,
}

impl OpenAiGenerator {
    /// Builds a client with a per-request timeout.
    pub fn new(api_key: String, model: String, timeout: Duration) -> anyhow::Result<Self> {
        let mut headers = HeaderMap::new();
        headers.insert(
            AUTHORIZATION,
            HeaderValue::from_str(&format!("Bearer {}", api_key.trim()))
                .context("invalid OpenAI API key")?,
        );
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        Ok(Self {
            model,
            headers,
            client: http_client(timeout, "OpenAI")?,
        })
    }
}

impl Generator for OpenAiGenerator {
    fn name(&self) -> &str {
        "openai"
    }

    fn generate(&self, request: &GenerationRequest<'_>) -> Result<String, GenerationError> {
        let body = ChatRequest {
            model: &self.model,
            temperature: request.temperature,
            max_tokens: request.max_tokens,
            messages: vec![
                ChatMessage {
                    role: "system",
                    content: request.system,
                },
                ChatMessage {
                    role: "user",
                    content: request.prompt,
                },
            ],
        };
        let resp = self
            .client
            .post(ENDPOINT)
            .headers(self.headers.clone())
            .json(&body)
            .send()
            .map_err(|err| transport_error("OpenAI", err))?;
        let parsed: ChatResponse = check_status("OpenAI", resp)?
            .json()
            .map_err(|err| parse_error("OpenAI", err))?;
        Ok(parsed
            .choices
            .into_iter()
            .find_map(|choice| choice.message.content)
            .unwrap_or_default())
    }
}

#[derive(Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    temperature: f32,
    max_tokens: usize,
    messages: Vec<ChatMessage<'a>>,
}

#[derive(Serialize)]
struct ChatMessage<'a> {
    role: &'a str,
    content: &'a str,
}

#[derive(Debug, Deserialize)]
struct ChatResponse {
    choices: Vec<ChatChoice>,
}

#[derive(Debug, Deserialize)]
struct ChatChoice {
    message: AssistantMessage,
}

#[derive(Debug, Deserialize)]
struct AssistantMessage {
    #[serde(default)]
    content: Option<String>,
}
