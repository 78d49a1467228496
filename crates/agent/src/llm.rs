use std::time::Duration;

use async_trait::async_trait;
use prechat_core::config::LlmConfig;
use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, warn};

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: String,
    pub content: String,
}

impl ChatMessage {
    pub fn system(content: impl Into<String>) -> Self {
        Self { role: "system".to_string(), content: content.into() }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self { role: "user".to_string(), content: content.into() }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct ModelParams {
    pub temperature: f32,
    pub max_tokens: u32,
}

impl ModelParams {
    pub fn from_config(config: &LlmConfig) -> Self {
        Self { temperature: config.temperature, max_tokens: config.max_tokens }
    }
}

/// Result of one model call. Failures are values so callers can fall back to canned text.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ModelOutcome {
    Success { text: String, total_tokens: Option<u64> },
    Failure { http_status: Option<u16>, detail: String },
}

#[async_trait]
pub trait ModelInvoker: Send + Sync {
    async fn invoke(&self, messages: &[ChatMessage], params: &ModelParams) -> ModelOutcome;
}

#[derive(Debug, Error)]
pub enum LlmError {
    #[error("http client setup failed: {0}")]
    Client(String),
    #[error("request failed: {0}")]
    Transport(String),
    #[error("upstream returned status {status}: {body}")]
    Status { status: u16, body: String },
    #[error("invalid response: {0}")]
    InvalidResponse(String),
}

impl LlmError {
    fn http_status(&self) -> Option<u16> {
        match self {
            Self::Status { status, .. } => Some(*status),
            _ => None,
        }
    }
}

#[derive(Debug, Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: &'a [ChatMessage],
    temperature: f32,
    max_tokens: u32,
}

#[derive(Debug, Deserialize)]
struct ChatResponse {
    #[serde(default)]
    choices: Vec<Choice>,
    usage: Option<Usage>,
}

#[derive(Debug, Deserialize)]
struct Choice {
    message: ResponseMessage,
}

#[derive(Debug, Deserialize)]
struct ResponseMessage {
    content: Option<String>,
}

#[derive(Debug, Deserialize)]
struct Usage {
    total_tokens: u64,
}

struct Completion {
    text: String,
    total_tokens: Option<u64>,
}

/// Client for any provider exposing `POST {base_url}/chat/completions` (Groq, OpenAI, Ollama).
pub struct OpenAiCompatibleClient {
    client: reqwest::Client,
    base_url: String,
    model: String,
    api_key: Option<SecretString>,
}

impl OpenAiCompatibleClient {
    pub fn from_config(config: &LlmConfig) -> Result<Self, LlmError> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs.max(1)))
            .build()
            .map_err(|error| LlmError::Client(error.to_string()))?;

        Ok(Self {
            client,
            base_url: config.effective_base_url().to_string(),
            model: config.model.clone(),
            api_key: config.api_key.clone(),
        })
    }

    async fn complete(
        &self,
        messages: &[ChatMessage],
        params: &ModelParams,
    ) -> Result<Completion, LlmError> {
        let request = ChatRequest {
            model: &self.model,
            messages,
            temperature: params.temperature,
            max_tokens: params.max_tokens,
        };

        let mut builder =
            self.client.post(format!("{}/chat/completions", self.base_url)).json(&request);
        if let Some(api_key) = &self.api_key {
            builder = builder.bearer_auth(api_key.expose_secret());
        }

        debug!(event_name = "agent.llm.request", model = %self.model, "sending chat completion");
        let response =
            builder.send().await.map_err(|error| LlmError::Transport(error.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(LlmError::Status { status: status.as_u16(), body: truncate(&body, 200) });
        }

        let parsed: ChatResponse = response
            .json()
            .await
            .map_err(|error| LlmError::InvalidResponse(error.to_string()))?;

        let text = parsed
            .choices
            .into_iter()
            .next()
            .and_then(|choice| choice.message.content)
            .map(|content| content.trim().to_string())
            .filter(|content| !content.is_empty())
            .ok_or_else(|| LlmError::InvalidResponse("no message content in choices".to_string()))?;

        Ok(Completion { text, total_tokens: parsed.usage.map(|usage| usage.total_tokens) })
    }
}

#[async_trait]
impl ModelInvoker for OpenAiCompatibleClient {
    async fn invoke(&self, messages: &[ChatMessage], params: &ModelParams) -> ModelOutcome {
        match self.complete(messages, params).await {
            Ok(completion) => ModelOutcome::Success {
                text: completion.text,
                total_tokens: completion.total_tokens,
            },
            Err(error) => {
                warn!(
                    event_name = "agent.llm.failed",
                    model = %self.model,
                    http_status = error.http_status(),
                    error = %error,
                    "chat completion failed"
                );
                ModelOutcome::Failure { http_status: error.http_status(), detail: error.to_string() }
            }
        }
    }
}

fn truncate(text: &str, max_chars: usize) -> String {
    match text.char_indices().nth(max_chars) {
        Some((index, _)) => format!("{}...", &text[..index]),
        None => text.to_string(),
    }
}
