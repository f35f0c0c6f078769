//! Gemini REST client implementing [`LlmClient`].

use std::sync::atomic::AtomicU64;
use std::sync::atomic::Ordering;

use async_trait::async_trait;
use serde::Deserialize;
use serde::Serialize;

use crate::client::LlmClient;
use crate::config::API_KEY_ENV;
use crate::error::Result;
use crate::error::RlmError;
use crate::observability::TOKEN_USAGE;
use crate::types::Message;
use crate::types::Role;
use crate::types::UsageSummary;

const DEFAULT_BASE_URL: &str = "https://generativelanguage.googleapis.com/v1beta";
const DEFAULT_MODEL: &str = "gemini-2.5-flash";

pub struct GeminiClient {
    http: reqwest::Client,
    base_url: String,
    api_key: String,
    model: String,
    total_calls: AtomicU64,
    total_input_tokens: AtomicU64,
    total_output_tokens: AtomicU64,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct GenerateContentRequest {
    contents: Vec<Content>,
    #[serde(skip_serializing_if = "Option::is_none")]
    system_instruction: Option<Content>,
}

#[derive(Debug, Serialize)]
struct Content {
    #[serde(skip_serializing_if = "Option::is_none")]
    role: Option<String>,
    parts: Vec<Part>,
}

#[derive(Debug, Serialize)]
struct Part {
    text: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GenerateContentResponse {
    #[serde(default)]
    candidates: Vec<Candidate>,
    usage_metadata: Option<UsageMetadata>,
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
    #[serde(default)]
    text: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct UsageMetadata {
    #[serde(default)]
    prompt_token_count: u64,
    #[serde(default)]
    candidates_token_count: u64,
}

impl GeminiClient {
    /// Builds a client from an explicit key or, when empty, the process
    /// environment. An empty model name selects the default.
    pub fn new(api_key: impl Into<String>, model: impl Into<String>) -> Result<Self> {
        let mut api_key = api_key.into();
        if api_key.is_empty() {
            api_key = std::env::var(API_KEY_ENV).unwrap_or_default();
        }
        if api_key.is_empty() {
            return Err(RlmError::Config(format!("{API_KEY_ENV} is required")));
        }

        let mut model = model.into();
        if model.is_empty() {
            model = DEFAULT_MODEL.to_string();
        }

        Ok(Self {
            http: reqwest::Client::new(),
            base_url: DEFAULT_BASE_URL.to_string(),
            api_key,
            model,
            total_calls: AtomicU64::new(0),
            total_input_tokens: AtomicU64::new(0),
            total_output_tokens: AtomicU64::new(0),
        })
    }

    fn build_request(&self, messages: &[Message]) -> GenerateContentRequest {
        let mut contents = Vec::new();
        let mut system_instruction = None;

        for message in messages {
            let part = Part {
                text: message.content.clone(),
            };
            match message.role {
                Role::System => {
                    system_instruction = Some(Content {
                        role: None,
                        parts: vec![part],
                    });
                }
                Role::User => contents.push(Content {
                    role: Some("user".to_string()),
                    parts: vec![part],
                }),
                Role::Assistant => contents.push(Content {
                    role: Some("model".to_string()),
                    parts: vec![part],
                }),
            }
        }

        GenerateContentRequest {
            contents,
            system_instruction,
        }
    }

    fn record_usage(&self, usage: &UsageMetadata) {
        self.total_calls.fetch_add(1, Ordering::Relaxed);
        self.total_input_tokens
            .fetch_add(usage.prompt_token_count, Ordering::Relaxed);
        self.total_output_tokens
            .fetch_add(usage.candidates_token_count, Ordering::Relaxed);

        TOKEN_USAGE
            .with_label_values(&[self.model.as_str(), "input"])
            .inc_by(usage.prompt_token_count as f64);
        TOKEN_USAGE
            .with_label_values(&[self.model.as_str(), "output"])
            .inc_by(usage.candidates_token_count as f64);
    }
}

#[async_trait]
impl LlmClient for GeminiClient {
    async fn completion(&self, messages: &[Message]) -> Result<String> {
        let url = format!("{}/models/{}:generateContent", self.base_url, self.model);
        let request = self.build_request(messages);

        let response = self
            .http
            .post(&url)
            .header("x-goog-api-key", &self.api_key)
            .json(&request)
            .send()
            .await
            .map_err(|err| {
                tracing::error!(error = %err, model = %self.model, "gemini api call failed");
                RlmError::Client(err.to_string())
            })?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            tracing::error!(status = status.as_u16(), model = %self.model, "gemini api returned an error");
            return Err(RlmError::Client(format!("gemini api {status}: {body}")));
        }

        let reply: GenerateContentResponse = response
            .json()
            .await
            .map_err(|err| RlmError::Client(format!("invalid gemini response: {err}")))?;

        if let Some(usage) = &reply.usage_metadata {
            self.record_usage(usage);
        }

        let text = reply
            .candidates
            .first()
            .and_then(|candidate| candidate.content.as_ref())
            .and_then(|content| content.parts.first())
            .map(|part| part.text.clone());

        match text {
            Some(text) if !text.is_empty() => Ok(text),
            _ => {
                tracing::warn!(model = %self.model, "no response content from model");
                Err(RlmError::Client("no response from model".to_string()))
            }
        }
    }

    fn model_name(&self) -> &str {
        &self.model
    }

    fn usage_summary(&self) -> UsageSummary {
        UsageSummary {
            total_calls: self.total_calls.load(Ordering::Relaxed),
            total_input_tokens: self.total_input_tokens.load(Ordering::Relaxed),
            total_output_tokens: self.total_output_tokens.load(Ordering::Relaxed),
        }
    }
}
