//! OpenAI-compatible chat-completions client
//!
//! A `reqwest` implementation of [`ChatClient`] for any endpoint speaking the
//! OpenAI chat-completions wire format. Provider error text is passed through
//! (truncated, never sanitized away) because the orchestrator classifies
//! rate-limit pushback by substring and reads wait hints out of the message.

use crate::client::{ChatClient, ChatRequest, ChatResponse, TokenUsage};
use crate::error::{Error, Result};
use crate::util::truncate_safe;
use reqwest::Client;
use serde::Deserialize;
use std::fmt;
use std::time::Duration;
use tracing::{debug, instrument};

/// Default API base URL
const DEFAULT_BASE_URL: &str = "https://api.openai.com";

/// Chat completions endpoint path
const CHAT_COMPLETIONS_PATH: &str = "/v1/chat/completions";

/// Longest provider error body kept verbatim
const MAX_ERROR_BODY_CHARS: usize = 300;

/// Render a credential as its prefix plus total length, enough to tell keys
/// apart in logs without exposing them. Anything too short to safely show a
/// prefix is fully redacted.
fn redact_key(key: &str) -> String {
    match key.get(..6) {
        Some(prefix) if key.len() >= 16 => format!("{prefix}…[{} chars]", key.len()),
        _ => "[redacted]".to_string(),
    }
}

/// Client configuration
#[derive(Clone)]
pub struct OpenAiCompatConfig {
    /// API key
    pub api_key: String,
    /// Base URL (override for gateways and self-hosted endpoints)
    pub base_url: String,
    /// Request timeout
    pub timeout: Duration,
}

// SECURITY: Custom Debug implementation so the key never reaches logs
impl fmt::Debug for OpenAiCompatConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OpenAiCompatConfig")
            .field("api_key", &redact_key(&self.api_key))
            .field("base_url", &self.base_url)
            .field("timeout", &self.timeout)
            .finish()
    }
}

impl OpenAiCompatConfig {
    /// Create a new configuration with an API key
    #[must_use]
    pub fn new(api_key: impl Into<String>) -> Self {
        Self {
            api_key: api_key.into(),
            base_url: DEFAULT_BASE_URL.to_string(),
            timeout: Duration::from_secs(120),
        }
    }

    /// Create configuration from environment variables
    pub fn from_env() -> Result<Self> {
        let api_key = std::env::var("OPENAI_API_KEY")
            .map_err(|_| Error::Config("OPENAI_API_KEY not set".to_string()))?;
        let base_url =
            std::env::var("OPENAI_BASE_URL").unwrap_or_else(|_| DEFAULT_BASE_URL.to_string());
        Ok(Self {
            api_key,
            base_url,
            timeout: Duration::from_secs(120),
        })
    }

    /// Set the base URL
    #[must_use]
    pub fn with_base_url(mut self, url: impl Into<String>) -> Self {
        self.base_url = url.into();
        self
    }

    /// Set the timeout
    #[must_use]
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }
}

/// OpenAI-compatible [`ChatClient`]
#[derive(Debug)]
pub struct OpenAiCompatClient {
    http: Client,
    config: OpenAiCompatConfig,
}

impl OpenAiCompatClient {
    /// Create a client from a configuration
    pub fn new(config: OpenAiCompatConfig) -> Result<Self> {
        let http = Client::builder()
            .timeout(config.timeout)
            .build()
            .map_err(|err| Error::Network(err.to_string()))?;
        Ok(Self { http, config })
    }

    /// Create from environment variables
    pub fn from_env() -> Result<Self> {
        Self::new(OpenAiCompatConfig::from_env()?)
    }

    fn endpoint(&self) -> String {
        format!(
            "{}{CHAT_COMPLETIONS_PATH}",
            self.config.base_url.trim_end_matches('/')
        )
    }
}

#[derive(Debug, Deserialize)]
struct ApiResponse {
    choices: Vec<ApiChoice>,
    usage: Option<TokenUsage>,
}

#[derive(Debug, Deserialize)]
struct ApiChoice {
    message: ApiMessage,
}

#[derive(Debug, Deserialize)]
struct ApiMessage {
    content: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ApiErrorBody {
    error: ApiErrorDetail,
}

#[derive(Debug, Deserialize)]
struct ApiErrorDetail {
    message: String,
}

#[async_trait::async_trait]
impl ChatClient for OpenAiCompatClient {
    #[instrument(skip_all, fields(model = %request.model))]
    async fn submit(&self, request: ChatRequest) -> Result<ChatResponse> {
        let response = self
            .http
            .post(self.endpoint())
            .bearer_auth(&self.config.api_key)
            .json(&request)
            .send()
            .await
            .map_err(|err| Error::Network(err.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let retry_after = response
                .headers()
                .get(reqwest::header::RETRY_AFTER)
                .and_then(|value| value.to_str().ok())
                .and_then(|value| value.parse::<f64>().ok());
            let body = response.text().await.unwrap_or_default();
            let message = extract_error_message(&body)
                .unwrap_or_else(|| truncate_safe(&body, MAX_ERROR_BODY_CHARS));
            return Err(Error::Api {
                message: format!("{status}: {message}"),
                retry_after,
            });
        }

        let api: ApiResponse = response
            .json()
            .await
            .map_err(|err| Error::InvalidResponse(err.to_string()))?;
        let usage = api.usage.unwrap_or_default();
        let content = api
            .choices
            .into_iter()
            .next()
            .and_then(|choice| choice.message.content)
            .ok_or_else(|| Error::InvalidResponse("response contained no choices".to_string()))?;

        debug!(
            action = "chat_completion",
            prompt_tokens = usage.prompt_tokens,
            completion_tokens = usage.completion_tokens,
            "completion received"
        );
        Ok(ChatResponse { content, usage })
    }
}

/// Pull the human-readable message out of an OpenAI-style error body
fn extract_error_message(body: &str) -> Option<String> {
    serde_json::from_str::<ApiErrorBody>(body)
        .ok()
        .map(|parsed| parsed.error.message)
}
