use std::time::Duration;

use anyhow::Context;
use reqwest::blocking::Client;
use reqwest::header::{HeaderMap, HeaderValue, CONTENT_TYPE};
use serde::{Deserialize, Serialize};

use super::{
    check_status, http_client, parse_error, transport_error, GenerationError, GenerationRequest,
    Generator,
};

const BASE_URL: &str = "https://generativelanguage.googleapis.com/v1beta/models";

/// Google Gemini `generateContent`.
pub struct GeminiGenerator {
    endpoint: String,
    headers: HeaderMap,
    client: Client,
}

impl GeminiGenerator {
    /// Builds a client with a per-request timeout.
    pub fn new(api_key: String, model: String, timeout: Duration) -> anyhow::Result<Self> {
        let mut headers = HeaderMap::new();
        headers.insert(
            "x-goog-api-key",
            HeaderValue::from_str(api_key.trim()).context("invalid Gemini API key")?,
        );
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        Ok(Self {
            endpoint: format!("{BASE_URL}/{}:generateContent", model.trim()),
            headers,
            client: http_client(timeout, "Gemini")?,
        })
    }
}

impl Generator for GeminiGenerator {
    fn name(&self) -> &str {
        "gemini"
    }

    fn generate(&self, request: &GenerationRequest<'_>) -> Result<String, GenerationError> {
        let body = GenerateRequest {
            system_instruction: Content {
                role: None,
                parts: vec![Part {
                    text: request.system,
                }],
            },
            contents: vec![Content {
                role: Some("user"),
                parts: vec![Part {
                    text: request.prompt,
                }],
            }],
            generation_config: GenerationSettings {
                temperature: request.temperature,
                max_output_tokens: request.max_tokens,
            },
        };
        let resp = self
            .client
            .post(&self.endpoint)
            .headers(self.headers.clone())
            .json(&body)
            .send()
            .map_err(|err| transport_error("Gemini", err))?;
        let parsed: GenerateResponse = check_status("Gemini", resp)?
            .json()
            .map_err(|err| parse_error("Gemini", err))?;
        Ok(parsed.text())
    }
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct GenerateRequest<'a> {
    system_instruction: Content<'a>,
    contents: Vec<Content<'a>>,
    generation_config: GenerationSettings,
}

#[derive(Serialize)]
struct Content<'a> {
    #[serde(skip_serializing_if = "Option::is_none")]
    role: Option<&'a str>,
    parts: Vec<Part<'a>>,
}

#[derive(Serialize)]
struct Part<'a> {
    text: &'a str,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct GenerationSettings {
    temperature: f32,
    max_output_tokens: usize,
}

#[derive(Debug, Deserialize)]
struct GenerateResponse {
    #[serde(default)]
    candidates: Vec<Candidate>,
}

impl GenerateResponse {
    /// Text of the first candidate; blocked or empty candidates yield "".
    fn text(self) -> String {
        self.candidates
            .into_iter()
            .next()
            .and_then(|candidate| candidate.content)
            .map(|content| {
                content
                    .parts
                    .into_iter()
                    .filter_map(|part| part.text)
                    .collect::<String>()
            })
            .unwrap_or_default()
    }
}

#[derive(Debug, Deserialize)]
struct Candidate {
    #[serde(default)]
    content: Option<CandidateContent>,
}

#[derive(Debug, Deserialize)]
struct CandidateContent {
    #[serde(default)]
    parts: Vec<CandidatePart>,
}

#[derive(Debug, Deserialize)]
struct CandidatePart {
    #[serde(default)]
    text: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_uses_camel_case_fields() {
        let body = GenerateRequest {
            system_instruction: Content {
                role: None,
                parts: vec![Part { text: "policy" }],
            },
            contents: vec![Content {
                role: Some("user"),
                parts: vec![Part { text: "question" }],
            }],
            generation_config: GenerationSettings {
                temperature: 0.0,
                max_output_tokens: 512,
            },
        };
        let value = serde_json::to_value(&body).expect("serialize");
        assert_eq!(value["systemInstruction"]["parts"][0]["text"], "policy");
        assert_eq!(value["contents"][0]["role"], "user");
        assert_eq!(value["generationConfig"]["maxOutputTokens"], 512);
    }

    #[test]
    fn extracts_first_candidate_text() {
        let parsed: GenerateResponse = serde_json::from_str(
            r#"{"candidates":[{"content":{"parts":[{"text":"Hostels "},{"text":"exist [1]."}]}}]}"#,
        )
        .expect("parse");
        assert_eq!(parsed.text(), "Hostels exist [1].");
        let blocked: GenerateResponse =
            serde_json::from_str(r#"{"candidates":[{"finishReason":"SAFETY"}]}"#).expect("parse");
        assert_eq!(blocked.text(), "");
    }
}
