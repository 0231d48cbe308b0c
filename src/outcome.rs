//! Canonical per-request result record

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Structured failure detail attached to failed outcomes
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorDetails {
    /// Error classification, used as the stats histogram key
    pub error_type: String,
    /// Full error message
    pub message: String,
    /// Captured backtrace, when available
    pub backtrace: String,
}

/// The result record produced for every request that terminates
///
/// Field declaration order is the serialization order: downstream consumers
/// writing outcomes row-wise rely on a stable column layout, so new fields
/// belong at the end of their section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RequestOutcome {
    /// Caller-chosen or synthesized request id
    pub id: String,
    /// ISO-8601 wall time (UTC-3) at which processing of this item began
    pub start_timestamp: String,
    /// Whether the request ultimately succeeded
    pub success: bool,
    /// Raw message content (successful requests)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,
    /// Parsed JSON content, when JSON mode was requested and parsing succeeded
    #[serde(skip_serializing_if = "Option::is_none")]
    pub parsed: Option<Value>,
    /// Prompt tokens
    #[serde(skip_serializing_if = "Option::is_none")]
    pub input_tokens: Option<u64>,
    /// Completion tokens
    #[serde(skip_serializing_if = "Option::is_none")]
    pub output_tokens: Option<u64>,
    /// Cached prompt tokens
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cached_tokens: Option<u64>,
    /// Total tokens
    #[serde(skip_serializing_if = "Option::is_none")]
    pub total_tokens: Option<u64>,
    /// Request cost in USD
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cost: Option<f64>,
    /// Short error message (failed requests)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Structured failure detail (failed requests)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_details: Option<ErrorDetails>,
    /// Seconds spent in the request loop, retries included
    pub api_response_time: f64,
    /// Final attempt count, 1-based
    pub attempts: u32,
}

impl RequestOutcome {
    /// Build a successful outcome
    #[allow(clippy::too_many_arguments)]
    #[must_use]
    pub fn success(
        id: String,
        start_timestamp: String,
        content: String,
        parsed: Option<Value>,
        input_tokens: u64,
        output_tokens: u64,
        cached_tokens: u64,
        total_tokens: u64,
        cost: f64,
        api_response_time: f64,
        attempts: u32,
    ) -> Self {
        Self {
            id,
            start_timestamp,
            success: true,
            content: Some(content),
            parsed,
            input_tokens: Some(input_tokens),
            output_tokens: Some(output_tokens),
            cached_tokens: Some(cached_tokens),
            total_tokens: Some(total_tokens),
            cost: Some(cost),
            error: None,
            error_details: None,
            api_response_time,
            attempts,
        }
    }

    /// Build a failed outcome
    #[must_use]
    pub fn failure(
        id: String,
        start_timestamp: String,
        error: String,
        details: ErrorDetails,
        api_response_time: f64,
        attempts: u32,
    ) -> Self {
        Self {
            id,
            start_timestamp,
            success: false,
            content: None,
            parsed: None,
            input_tokens: None,
            output_tokens: None,
            cached_tokens: None,
            total_tokens: None,
            cost: None,
            error: Some(error),
            error_details: Some(details),
            api_response_time,
            attempts,
        }
    }

    /// Histogram key for failed outcomes; `"UnknownError"` when unclassified
    #[must_use]
    pub fn error_type(&self) -> &str {
        self.error_details
            .as_ref()
            .map_or("UnknownError", |details| details.error_type.as_str())
    }
}
