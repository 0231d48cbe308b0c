//! Remote inference client capability
//!
//! The orchestrator talks to the remote service exclusively through the
//! [`ChatClient`] trait, so tests can substitute a stub and production code
//! can plug in any OpenAI-compatible transport.

use crate::error::Result;
use crate::message::Message;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Token usage reported by the remote service
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TokenUsage {
    /// Prompt tokens
    pub prompt_tokens: u64,
    /// Completion tokens
    pub completion_tokens: u64,
    /// Total tokens
    pub total_tokens: u64,
    /// Prompt token breakdown, when the provider reports one
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub prompt_tokens_details: Option<PromptTokensDetails>,
}

impl TokenUsage {
    /// Cached prompt tokens, 0 when the provider omits the breakdown
    #[must_use]
    pub fn cached_tokens(&self) -> u64 {
        self.prompt_tokens_details
            .as_ref()
            .map_or(0, |details| details.cached_tokens)
    }
}

/// Nested prompt-token detail block
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PromptTokensDetails {
    /// Tokens served from the provider's prompt cache
    #[serde(default)]
    pub cached_tokens: u64,
}

/// Response format constraint for a completion request
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum ResponseFormat {
    /// Constrain output to the given JSON schema
    #[serde(rename = "json_schema")]
    JsonSchema {
        /// The schema object, passed through verbatim
        json_schema: Value,
    },
}

/// A single completion request
#[derive(Debug, Clone, Serialize)]
pub struct ChatRequest {
    /// Model to use
    pub model: String,
    /// Messages in the conversation
    pub messages: Vec<Message>,
    /// Sampling temperature
    pub temperature: f32,
    /// Maximum tokens to generate
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_tokens: Option<u32>,
    /// Optional structured-output constraint
    #[serde(skip_serializing_if = "Option::is_none")]
    pub response_format: Option<ResponseFormat>,
}

impl ChatRequest {
    /// Create a request with a model and message list
    #[must_use]
    pub fn new(model: impl Into<String>, messages: Vec<Message>) -> Self {
        Self {
            model: model.into(),
            messages,
            temperature: 0.0,
            max_tokens: None,
            response_format: None,
        }
    }

    /// Set the temperature
    #[must_use]
    pub fn with_temperature(mut self, temperature: f32) -> Self {
        self.temperature = temperature;
        self
    }

    /// Set max tokens
    #[must_use]
    pub fn with_max_tokens(mut self, max_tokens: u32) -> Self {
        self.max_tokens = Some(max_tokens);
        self
    }

    /// Constrain the response to a JSON schema
    #[must_use]
    pub fn with_json_schema(mut self, schema: Value) -> Self {
        self.response_format = Some(ResponseFormat::JsonSchema {
            json_schema: schema,
        });
        self
    }
}

/// A completed response from the remote service
#[derive(Debug, Clone)]
pub struct ChatResponse {
    /// Message content of the first choice
    pub content: String,
    /// Token usage for the request
    pub usage: TokenUsage,
}

/// Capability handle for the remote inference service
///
/// Errors should surface the provider's message text unmodified where
/// practical: the orchestrator classifies rate-limit pushback by substring
/// and reads wait hints out of it.
#[async_trait::async_trait]
pub trait ChatClient: Send + Sync {
    /// Submit one completion request
    async fn submit(&self, request: ChatRequest) -> Result<ChatResponse>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cached_tokens_defaults_to_zero() {
        let usage = TokenUsage {
            prompt_tokens: 100,
            completion_tokens: 50,
            total_tokens: 150,
            prompt_tokens_details: None,
        };
        assert_eq!(usage.cached_tokens(), 0);

        let usage = TokenUsage {
            prompt_tokens_details: Some(PromptTokensDetails { cached_tokens: 40 }),
            ..usage
        };
        assert_eq!(usage.cached_tokens(), 40);
    }

    #[test]
    fn test_request_serialization_skips_empty_fields() {
        let request = ChatRequest::new("m", vec![Message::user("hi")]);
        let json = serde_json::to_string(&request).unwrap();
        assert!(!json.contains("max_tokens"));
        assert!(!json.contains("response_format"));

        let request = request.with_json_schema(serde_json::json!({"type": "object"}));
        let json = serde_json::to_string(&request).unwrap();
        assert!(json.contains(r#""type":"json_schema""#));
    }

    #[test]
    fn test_usage_parses_nested_cached_tokens() {
        let usage: TokenUsage = serde_json::from_str(
            r#"{"prompt_tokens":10,"completion_tokens":5,"total_tokens":15,
                "prompt_tokens_details":{"cached_tokens":4}}"#,
        )
        .unwrap();
        assert_eq!(usage.cached_tokens(), 4);
    }
}
