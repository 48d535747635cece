//! LLM Client — the single point of entry for generative-text calls.
//!
//! ARCHITECTURAL RULE: handlers never call the provider directly. Every call goes
//! through `gateway::AiGateway`, which owns validation, retries and backoff.
//!
//! `GeminiClient` talks to the Google Generative Language API. Generation
//! parameters and safety settings are fixed and identical on every attempt.

use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;

pub mod gateway;

const API_KEY_HEADER: &str = "x-goog-api-key";
const HTTP_TIMEOUT_SECS: u64 = 30;

const TEMPERATURE: f32 = 0.7;
const TOP_P: f32 = 0.95;
const TOP_K: u32 = 40;
const MAX_OUTPUT_TOKENS: u32 = 1024;

const SAFETY_CATEGORIES: [&str; 2] = ["HARM_CATEGORY_HARASSMENT", "HARM_CATEGORY_HATE_SPEECH"];
const SAFETY_THRESHOLD: &str = "BLOCK_MEDIUM_AND_ABOVE";

#[derive(Debug, Error)]
pub enum ProviderError {
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("API error (status {status}): {message}")]
    Api { status: u16, message: String },

    #[error("JSON parse error: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("Empty response from AI")]
    EmptyContent,

    #[error("API key not configured")]
    NotConfigured,
}

/// A backend that turns a prompt into text.
///
/// Carried by the gateway as `Arc<dyn GenerativeProvider>` so tests can script
/// failures without a network.
#[async_trait]
pub trait GenerativeProvider: Send + Sync {
    /// `false` when no credentials are available; the gateway then fails fast.
    fn is_configured(&self) -> bool;

    async fn generate(&self, prompt: &str) -> Result<String, ProviderError>;
}

#[derive(Debug, Clone)]
pub struct GeminiConfig {
    pub api_key: Option<String>,
    pub model: String,
    pub base_url: String,
}

// ────────────────────────────────────────────────────────────────────────────
// Wire types
// ────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct GenerateContentRequest<'a> {
    contents: Vec<RequestContent<'a>>,
    generation_config: GenerationConfig,
    safety_settings: Vec<SafetySetting<'a>>,
}

#[derive(Debug, Serialize)]
struct RequestContent<'a> {
    parts: Vec<RequestPart<'a>>,
}

#[derive(Debug, Serialize)]
struct RequestPart<'a> {
    text: &'a str,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct GenerationConfig {
    temperature: f32,
    top_p: f32,
    top_k: u32,
    max_output_tokens: u32,
}

#[derive(Debug, Serialize)]
struct SafetySetting<'a> {
    category: &'a str,
    threshold: &'a str,
}

#[derive(Debug, Deserialize)]
struct GenerateContentResponse {
    #[serde(default)]
    candidates: Vec<Candidate>,
}

#[derive(Debug, Deserialize)]
struct Candidate {
    content: Option<CandidateContent>,
}

#[derive(Debug, Deserialize)]
struct CandidateContent {
    #[serde(default)]
    parts: Vec<CandidatePart>,
}

#[derive(Debug, Deserialize)]
struct CandidatePart {
    text: Option<String>,
}

impl GenerateContentResponse {
    /// Concatenated text parts of the first candidate.
    fn text(&self) -> Option<String> {
        let content = self.candidates.first()?.content.as_ref()?;
        let text: String = content
            .parts
            .iter()
            .filter_map(|p| p.text.as_deref())
            .collect();
        Some(text)
    }
}

#[derive(Debug, Deserialize)]
struct ApiErrorEnvelope {
    error: ApiErrorBody,
}

#[derive(Debug, Deserialize)]
struct ApiErrorBody {
    message: String,
}

fn build_request(prompt: &str) -> GenerateContentRequest<'_> {
    GenerateContentRequest {
        contents: vec![RequestContent {
            parts: vec![RequestPart { text: prompt }],
        }],
        generation_config: GenerationConfig {
            temperature: TEMPERATURE,
            top_p: TOP_P,
            top_k: TOP_K,
            max_output_tokens: MAX_OUTPUT_TOKENS,
        },
        safety_settings: SAFETY_CATEGORIES
            .iter()
            .map(|&category| SafetySetting {
                category,
                threshold: SAFETY_THRESHOLD,
            })
            .collect(),
    }
}

// ────────────────────────────────────────────────────────────────────────────
// Client
// ────────────────────────────────────────────────────────────────────────────

#[derive(Clone)]
pub struct GeminiClient {
    client: Client,
    config: GeminiConfig,
}

impl GeminiClient {
    pub fn new(config: GeminiConfig) -> anyhow::Result<Self> {
        let client = Client::builder()
            .timeout(std::time::Duration::from_secs(HTTP_TIMEOUT_SECS))
            .build()?;
        Ok(Self { client, config })
    }

    pub fn model(&self) -> &str {
        &self.config.model
    }

    fn endpoint(&self) -> String {
        format!(
            "{}/v1beta/models/{}:generateContent",
            self.config.base_url.trim_end_matches('/'),
            self.config.model
        )
    }
}

#[async_trait]
impl GenerativeProvider for GeminiClient {
    fn is_configured(&self) -> bool {
        self.config.api_key.is_some()
    }

    async fn generate(&self, prompt: &str) -> Result<String, ProviderError> {
        let api_key = self
            .config
            .api_key
            .as_deref()
            .ok_or(ProviderError::NotConfigured)?;

        let response = self
            .client
            .post(self.endpoint())
            .header(API_KEY_HEADER, api_key)
            .json(&build_request(prompt))
            .send()
            .await?;

        let status = response.status();
        let body = response.text().await?;

        if !status.is_success() {
            let message = serde_json::from_str::<ApiErrorEnvelope>(&body)
                .map(|e| e.error.message)
                .unwrap_or(body);
            return Err(ProviderError::Api {
                status: status.as_u16(),
                message,
            });
        }

        let parsed: GenerateContentResponse = serde_json::from_str(&body)?;
        let text = parsed.text().unwrap_or_default();
        debug!(model = %self.config.model, chars = text.len(), "Provider call succeeded");
        Ok(text)
    }
}


#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_request_body_carries_fixed_parameters() {
        let body = serde_json::to_value(build_request("Summarize my experience")).unwrap();

        assert_eq!(body["contents"][0]["parts"][0]["text"], "Summarize my experience");
        let cfg = &body["generationConfig"];
        assert_eq!(cfg["topK"], 40);
        assert_eq!(cfg["maxOutputTokens"], 1024);
        assert!((cfg["temperature"].as_f64().unwrap() - 0.7).abs() < 1e-6);
        assert!((cfg["topP"].as_f64().unwrap() - 0.95).abs() < 1e-6);

        let safety = body["safetySettings"].as_array().unwrap();
        assert_eq!(safety.len(), 2);
        assert_eq!(safety[0]["category"], "HARM_CATEGORY_HARASSMENT");
        assert_eq!(safety[1]["category"], "HARM_CATEGORY_HATE_SPEECH");
        assert!(safety.iter().all(|s| s["threshold"] == "BLOCK_MEDIUM_AND_ABOVE"));
    }

    #[test]
    fn test_response_text_joins_first_candidate_parts() {
        let json = r#"{
            "candidates": [
                {"content": {"parts": [{"text": "Led a team "}, {"text": "of five."}]}},
                {"content": {"parts": [{"text": "ignored"}]}}
            ]
        }"#;
        let parsed: GenerateContentResponse = serde_json::from_str(json).unwrap();
        assert_eq!(parsed.text().as_deref(), Some("Led a team of five."));
    }

    #[test]
    fn test_response_without_candidates_has_no_text() {
        let parsed: GenerateContentResponse =
            serde_json::from_str(r#"{"promptFeedback": {"blockReason": "SAFETY"}}"#).unwrap();
        assert_eq!(parsed.text(), None);
    }

    #[test]
    fn test_endpoint_trims_trailing_slash() {
        let client = GeminiClient::new(GeminiConfig {
            api_key: None,
            model: "gemini-1.5-flash".to_string(),
            base_url: "http://localhost:9000/".to_string(),
        })
        .unwrap();
        assert_eq!(
            client.endpoint(),
            "http://localhost:9000/v1beta/models/gemini-1.5-flash:generateContent"
        );
        assert!(!client.is_configured());
    }
}
