//! Error types for kairos

use thiserror::Error;

/// Orchestration error type
#[derive(Debug, Error)]
pub enum Error {
    /// Configuration file missing or invalid
    #[error("configuration error: {0}")]
    Config(String),

    /// Model not present in the models catalog
    #[error("model not found in models configuration: {0}")]
    UnsupportedModel(String),

    /// Caller requested a JSON schema from a model that cannot honor it
    #[error("model {model} does not support json_schema response format")]
    SchemaUnsupported {
        /// The incompatible model
        model: String,
    },

    /// `custom_ids` does not match the batch item count
    #[error("custom_ids length {got} does not match texts length {expected}")]
    InvalidCustomIds {
        /// Number of batch items
        expected: usize,
        /// Number of supplied ids
        got: usize,
    },

    /// Remote API error; may carry a provider-mandated wait from `Retry-After`
    #[error("api error: {message}")]
    Api {
        /// Provider error text, passed through so rate-limit hints survive
        message: String,
        /// Seconds to wait, when the provider sent a `Retry-After` header
        retry_after: Option<f64>,
    },

    /// Response arrived but could not be interpreted
    #[error("invalid response: {0}")]
    InvalidResponse(String),

    /// Transport-level failure
    #[error("network error: {0}")]
    Network(String),
}

/// Result type alias
pub type Result<T> = std::result::Result<T, Error>;
