//! Models catalog: pricing and capability flags
//!
//! The catalog is loaded from a JSON file mapping model names to per-1k-token
//! prices and a `json_schema` capability flag. It is the single source of
//! truth for cost computation and structured-output compatibility checks.

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;

/// Pricing and capabilities for a single model (prices per 1k tokens, USD)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelConfig {
    /// Price per 1k non-cached input tokens
    pub input: f64,
    /// Price per 1k output tokens
    pub output: f64,
    /// Price per 1k cached input tokens
    #[serde(default)]
    pub cache: f64,
    /// Whether the model honors `json_schema` response formats
    #[serde(default)]
    pub json_schema: bool,
}

impl ModelConfig {
    /// Cost of a request, in USD
    ///
    /// Cached tokens are billed at the cache rate and subtracted from the
    /// input-rate portion, saturating at zero when providers report more
    /// cached than prompt tokens.
    #[must_use]
    pub fn cost(&self, input_tokens: u64, output_tokens: u64, cached_tokens: u64) -> f64 {
        let billed_input = input_tokens.saturating_sub(cached_tokens);
        (billed_input as f64 / 1000.0) * self.input
            + (cached_tokens as f64 / 1000.0) * self.cache
            + (output_tokens as f64 / 1000.0) * self.output
    }
}

/// Immutable mapping from model name to [`ModelConfig`]
#[derive(Debug, Clone, Default)]
pub struct ModelCatalog {
    models: HashMap<String, ModelConfig>,
}

impl ModelCatalog {
    /// Build a catalog from an in-memory mapping
    #[must_use]
    pub fn new(models: HashMap<String, ModelConfig>) -> Self {
        Self { models }
    }

    /// Load the catalog from a JSON file
    ///
    /// A missing, unreadable, or empty file is a fatal configuration error.
    pub fn from_path(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path).map_err(|err| {
            Error::Config(format!(
                "cannot read models file {}: {err}",
                path.display()
            ))
        })?;
        let models: HashMap<String, ModelConfig> = serde_json::from_str(&raw).map_err(|err| {
            Error::Config(format!(
                "malformed models file {}: {err}",
                path.display()
            ))
        })?;
        if models.is_empty() {
            return Err(Error::Config(format!(
                "models file {} defines no models",
                path.display()
            )));
        }
        Ok(Self { models })
    }

    /// Look up a model
    #[must_use]
    pub fn get(&self, model: &str) -> Option<&ModelConfig> {
        self.models.get(model)
    }

    /// Whether the catalog knows the model
    #[must_use]
    pub fn contains(&self, model: &str) -> bool {
        self.models.contains_key(model)
    }

    /// Cost of a request for `model`, in USD
    ///
    /// Unknown models price at zero rather than failing: stats recording must
    /// never reject an outcome.
    #[must_use]
    pub fn cost_for(
        &self,
        model: &str,
        input_tokens: u64,
        output_tokens: u64,
        cached_tokens: u64,
    ) -> f64 {
        self.models
            .get(model)
            .map_or(0.0, |config| config.cost(input_tokens, output_tokens, cached_tokens))
    }

    /// Registered model names
    #[must_use]
    pub fn model_names(&self) -> Vec<&str> {
        self.models.keys().map(String::as_str).collect()
    }
}
