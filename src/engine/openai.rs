// src/engine/openai.rs
//! OpenAI chat-completions client

use crate::engine::config::AgentConfig;
use crate::engine::model::{ModelClient, ModelError, Transcript};
use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::{debug, error};

const DEFAULT_BASE_URL: &str = "https://api.openai.com/v1";
const REQUEST_TIMEOUT: Duration = Duration::from_secs(120);

/// [`ModelClient`] backed by the OpenAI chat-completions API
#[derive(Clone)]
pub struct OpenAiChatClient {
    model_id: String,
    api_key: String,
    temperature: f32,
    base_url: String,
    client: Client,
}

impl OpenAiChatClient {
    pub fn new(config: &AgentConfig) -> Result<Self, ModelError> {
        let client = Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .map_err(|e| ModelError::Request(e.to_string()))?;

        Ok(Self {
            model_id: config.model.clone(),
            api_key: config.api_key.clone(),
            temperature: config.temperature,
            base_url: DEFAULT_BASE_URL.to_string(),
            client,
        })
    }

    /// Point the client at an OpenAI-compatible endpoint
    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into().trim_end_matches('/').to_string();
        self
    }

    fn request_body(&self, transcript: &Transcript) -> ChatRequest {
        ChatRequest {
            model: self.model_id.clone(),
            temperature: self.temperature,
            messages: transcript
                .entries()
                .iter()
                .map(|entry| ChatMessage {
                    role: entry.role().to_string(),
                    content: entry.render(),
                })
                .collect(),
        }
    }
}

#[async_trait]
impl ModelClient for OpenAiChatClient {
    async fn invoke(&self, transcript: &Transcript) -> Result<String, ModelError> {
        let url = format!("{}/chat/completions", self.base_url);
        debug!(
            model_id = %self.model_id,
            message_count = transcript.len(),
            "Requesting chat completion"
        );

        let response = self
            .client
            .post(&url)
            .bearer_auth(&self.api_key)
            .json(&self.request_body(transcript))
            .send()
            .await
            .map_err(|e| {
                error!(error = %e, "Failed to reach OpenAI API");
                ModelError::Request(e.to_string())
            })?;

        let status = response.status();
        if !status.is_success() {
            let body = response
                .text()
                .await
                .unwrap_or_else(|_| "unknown error".to_string());
            error!(status = %status, "OpenAI API returned error status");
            return Err(classify_status(status, body));
        }

        let body: ChatResponse = response
            .json()
            .await
            .map_err(|e| ModelError::Decode(e.to_string()))?;

        body.choices
            .into_iter()
            .next()
            .and_then(|choice| choice.message.content)
            .filter(|content| !content.trim().is_empty())
            .ok_or(ModelError::EmptyResponse)
    }

    fn model_id(&self) -> &str {
        &self.model_id
    }
}

fn classify_status(status: StatusCode, body: String) -> ModelError {
    match status {
        StatusCode::PAYMENT_REQUIRED | StatusCode::TOO_MANY_REQUESTS => ModelError::QuotaExceeded(body),
        _ => ModelError::Status {
            status: status.as_u16(),
            body,
        },
    }
}

#[derive(Debug, Serialize)]
struct ChatRequest {
    model: String,
    temperature: f32,
    messages: Vec<ChatMessage>,
}

#[derive(Debug, Serialize, Deserialize)]
struct ChatMessage {
    role: String,
    content: String,
}

#[derive(Debug, Deserialize)]
struct ChatResponse {
    #[serde(default)]
    choices: Vec<ChatChoice>,
}

#[derive(Debug, Deserialize)]
struct ChatChoice {
    message: ChoiceMessage,
}

#[derive(Debug, Deserialize)]
struct ChoiceMessage {
    #[serde(default)]
    content: Option<String>,
}
