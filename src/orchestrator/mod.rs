//! Batch orchestrator
//!
//! Fans prompt workloads out against a [`ChatClient`], gated by the adaptive
//! rate limiter, with retries and per-request telemetry. `process_single`
//! runs one item against the global statistics scope; `process_batch` opens a
//! dedicated batch scope, drives every item concurrently, and returns
//! outcomes in input order.

use crate::client::{ChatClient, ChatRequest};
use crate::config::ModelCatalog;
use crate::error::{Error, Result};
use crate::limiter::{AdaptiveRateLimiter, LimiterConfig};
use crate::message::Message;
use crate::outcome::{ErrorDetails, RequestOutcome};
use crate::retry::RetryPolicy;
use crate::stats::{StatsContainer, StatsManager};
use crate::util::iso_timestamp;
use chrono::Utc;
use serde_json::Value;
use std::backtrace::Backtrace;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::{debug, info, instrument, warn};

pub mod progress;


pub use progress::ProgressTracker;

/// Wait applied when a rate-limit error carries no usable hint
const DEFAULT_RATE_LIMIT_WAIT_SECS: f64 = 60.0;

/// Settings for an [`Orchestrator`]
#[derive(Debug, Clone)]
pub struct OrchestratorConfig {
    /// Model every request is submitted with
    pub model: String,
    /// Sampling temperature
    pub temperature: f32,
    /// Completion token cap, when set
    pub max_tokens: Option<u32>,
    /// System prompt prepended to every conversation
    pub system_prompt: Option<String>,
    /// Retry policy for remote failures
    pub retry: RetryPolicy,
    /// Rate limiter tuning
    pub limiter: LimiterConfig,
}

impl OrchestratorConfig {
    /// Create a config for a model under the given TPM budget
    #[must_use]
    pub fn new(model: impl Into<String>, max_tpm: u64) -> Self {
        Self {
            model: model.into(),
            temperature: 0.0,
            max_tokens: None,
            system_prompt: None,
            retry: RetryPolicy::default(),
            limiter: LimiterConfig::new(max_tpm),
        }
    }

    /// Set the temperature
    #[must_use]
    pub fn with_temperature(mut self, temperature: f32) -> Self {
        self.temperature = temperature;
        self
    }

    /// Set the completion token cap
    #[must_use]
    pub fn with_max_tokens(mut self, max_tokens: u32) -> Self {
        self.max_tokens = Some(max_tokens);
        self
    }

    /// Set a system prompt
    #[must_use]
    pub fn with_system_prompt(mut self, prompt: impl Into<String>) -> Self {
        self.system_prompt = Some(prompt.into());
        self
    }

    /// Replace the retry policy
    #[must_use]
    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// Replace the limiter tuning
    #[must_use]
    pub fn with_limiter(mut self, limiter: LimiterConfig) -> Self {
        self.limiter = limiter;
        self
    }
}

/// Everything `process_batch` returns
#[derive(Debug)]
pub struct BatchOutput {
    /// One outcome per input text, in input order
    pub results: Vec<RequestOutcome>,
    /// Snapshot of the closed batch container
    pub batch_stats: StatsContainer,
    /// The mangled batch id
    pub batch_id: String,
}

/// Concurrent prompt dispatcher with adaptive throttling
///
/// Cheap to clone; clones share the client, limiter, and statistics store.
#[derive(Clone)]
pub struct Orchestrator {
    client: Arc<dyn ChatClient>,
    catalog: Arc<ModelCatalog>,
    config: Arc<OrchestratorConfig>,
    stats: Arc<StatsManager>,
    limiter: Arc<AdaptiveRateLimiter>,
}

impl Orchestrator {
    /// Create an orchestrator
    ///
    /// Fails when the configured model is absent from the catalog or the
    /// limiter config is invalid. Spawns the telemetry worker that forwards
    /// limiter events into the statistics store.
    pub fn new(
        client: Arc<dyn ChatClient>,
        catalog: ModelCatalog,
        config: OrchestratorConfig,
    ) -> Result<Self> {
        if !catalog.contains(&config.model) {
            return Err(Error::UnsupportedModel(config.model.clone()));
        }
        let catalog = Arc::new(catalog);
        let stats = Arc::new(StatsManager::new(Arc::clone(&catalog)));

        let (events_tx, mut events_rx) = mpsc::channel(config.limiter.event_buffer);
        let limiter = Arc::new(AdaptiveRateLimiter::new(config.limiter.clone(), events_tx)?);
        let stats_sink = Arc::clone(&stats);
        tokio::spawn(async move {
            while let Some(event) = events_rx.recv().await {
                stats_sink.record_limiter_event(None, &event).await;
            }
        });

        Ok(Self {
            client,
            catalog,
            config: Arc::new(config),
            stats,
            limiter,
        })
    }

    /// The shared statistics store
    #[must_use]
    pub fn stats_manager(&self) -> Arc<StatsManager> {
        Arc::clone(&self.stats)
    }

    /// The shared rate limiter
    #[must_use]
    pub fn limiter(&self) -> Arc<AdaptiveRateLimiter> {
        Arc::clone(&self.limiter)
    }

    /// Process one text end to end
    ///
    /// Telemetry lands in the global scope only. Remote failures become
    /// `success = false` outcomes; only configuration and validation
    /// problems return `Err`.
    #[instrument(skip_all, fields(model = %self.config.model))]
    pub async fn process_single(
        &self,
        text: &str,
        prompt_template: &str,
        json_schema: Option<&Value>,
        custom_id: Option<&str>,
        vars: &HashMap<String, String>,
    ) -> Result<RequestOutcome> {
        self.ensure_schema_support(json_schema)?;
        let id = custom_id.map_or_else(
            || format!("single_{}", Utc::now().timestamp()),
            str::to_string,
        );
        Ok(self
            .run_request(&id, text, prompt_template, json_schema, vars, None)
            .await)
    }

    /// Process a batch of texts concurrently
    ///
    /// Every item runs to completion; per-item failures never abort the
    /// batch. Results come back in input order, alongside the closed batch
    /// statistics container.
    #[instrument(skip_all, fields(model = %self.config.model, items = texts.len()))]
    pub async fn process_batch(
        &self,
        texts: &[String],
        prompt_template: &str,
        json_schema: Option<&Value>,
        batch_id: Option<&str>,
        custom_ids: Option<&[Option<String>]>,
        vars: &HashMap<String, String>,
    ) -> Result<BatchOutput> {
        self.ensure_schema_support(json_schema)?;
        if let Some(ids) = custom_ids {
            if ids.len() != texts.len() {
                return Err(Error::InvalidCustomIds {
                    expected: texts.len(),
                    got: ids.len(),
                });
            }
        }

        let batch_id = format!("{}_{}", batch_id.unwrap_or("batch"), Utc::now().timestamp());
        info!(
            action = "batch_started",
            batch_id = %batch_id,
            total = texts.len(),
            "dispatching batch"
        );
        self.stats.start_batch(&batch_id).await;

        let progress = ProgressTracker::new(batch_id.clone(), texts.len());
        let ids: Vec<String> = (0..texts.len())
            .map(|index| {
                custom_ids
                    .and_then(|ids| ids[index].clone())
                    .unwrap_or_else(|| format!("{batch_id}_req_{index}"))
            })
            .collect();

        let item_futures: Vec<_> = texts
            .iter()
            .zip(ids.iter())
            .map(|(text, id)| {
                let batch_id = batch_id.as_str();
                let progress = &progress;
                async move {
                    let outcome = self
                        .run_request(id, text, prompt_template, json_schema, vars, Some(batch_id))
                        .await;
                    progress.increment_and_log().await;
                    outcome
                }
            })
            .collect();

        // join_all drives every item concurrently and yields outcomes in
        // input order, so no re-indexing is needed
        let results = futures::future::join_all(item_futures).await;

        let batch_stats = match self.stats.end_batch(&batch_id).await {
            Some(stats) => stats,
            None => {
                warn!(action = "unknown_batch", batch_id = %batch_id, "batch container vanished before close");
                StatsContainer::new(batch_id.clone())
            }
        };

        let succeeded = results.iter().filter(|outcome| outcome.success).count();
        info!(
            action = "batch_complete",
            batch_id = %batch_id,
            total = results.len(),
            succeeded,
            failed = results.len() - succeeded,
            cost = batch_stats.total_cost,
            elapsed_secs = batch_stats.processing_time(),
            "batch finished"
        );
        debug!(action = "batch_summary", batch_id = %batch_id, summary = %batch_stats.format_summary());

        Ok(BatchOutput {
            results,
            batch_stats,
            batch_id,
        })
    }

    /// Shared per-item execution: slot, retries, telemetry, deferred release
    async fn run_request(
        &self,
        id: &str,
        text: &str,
        template: &str,
        json_schema: Option<&Value>,
        vars: &HashMap<String, String>,
        batch_id: Option<&str>,
    ) -> RequestOutcome {
        let start_timestamp = iso_timestamp(Utc::now());
        let prompt = render_prompt(template, text, vars);
        let request = self.build_request(prompt, json_schema);

        let permit = self.limiter.acquire().await;
        self.stats.record_concurrent_start(batch_id).await;
        let mut concurrency_guard =
            ConcurrencyGuard::new(Arc::clone(&self.stats), batch_id.map(str::to_string));

        let call_started = Instant::now();
        let attempt_result = self
            .config
            .retry
            .run(
                || self.client.submit(request.clone()),
                |error| {
                    if let Some(wait) = rate_limit_wait(error) {
                        self.limiter.record_api_rate_limit(wait);
                    }
                },
            )
            .await;
        let api_response_time = call_started.elapsed().as_secs_f64();

        let outcome = match attempt_result {
            Ok((response, attempts)) => {
                let usage = &response.usage;
                let cached = usage.cached_tokens();
                let parsed = json_schema.and_then(|_| serde_json::from_str(&response.content).ok());
                if json_schema.is_some() && parsed.is_none() {
                    debug!(
                        action = "json_parse_failed",
                        id, "structured content not valid JSON, keeping raw string"
                    );
                }
                let cost = self.catalog.cost_for(
                    &self.config.model,
                    usage.prompt_tokens,
                    usage.completion_tokens,
                    cached,
                );
                RequestOutcome::success(
                    id.to_string(),
                    start_timestamp,
                    response.content,
                    parsed,
                    usage.prompt_tokens,
                    usage.completion_tokens,
                    cached,
                    usage.total_tokens,
                    cost,
                    api_response_time,
                    attempts,
                )
            }
            Err(exhausted) => {
                warn!(
                    action = "request_failed",
                    id,
                    attempts = exhausted.attempts,
                    error = %exhausted.last_error,
                    "request exhausted its retry budget"
                );
                let message = exhausted.to_string();
                RequestOutcome::failure(
                    id.to_string(),
                    start_timestamp,
                    exhausted.last_error.to_string(),
                    ErrorDetails {
                        error_type: "RetryError".to_string(),
                        message,
                        backtrace: Backtrace::capture().to_string(),
                    },
                    api_response_time,
                    exhausted.attempts,
                )
            }
        };

        let total_tokens = outcome.total_tokens.unwrap_or(0);
        self.limiter
            .record_completion(permit, total_tokens, outcome.success);
        self.stats
            .record_request(batch_id, &self.config.model, &outcome)
            .await;
        concurrency_guard.disarm();
        self.stats.record_concurrent_end(batch_id).await;
        outcome
    }

    /// Reject JSON-schema requests against incapable models before any
    /// remote call is issued
    fn ensure_schema_support(&self, json_schema: Option<&Value>) -> Result<()> {
        if json_schema.is_none() {
            return Ok(());
        }
        let model_config = self
            .catalog
            .get(&self.config.model)
            .ok_or_else(|| Error::UnsupportedModel(self.config.model.clone()))?;
        if !model_config.json_schema {
            return Err(Error::SchemaUnsupported {
                model: self.config.model.clone(),
            });
        }
        Ok(())
    }

    fn build_request(&self, prompt: String, json_schema: Option<&Value>) -> ChatRequest {
        let mut messages = Vec::with_capacity(2);
        if let Some(system) = &self.config.system_prompt {
            messages.push(Message::system(system.clone()));
        }
        messages.push(Message::user(prompt));
        let mut request = ChatRequest::new(self.config.model.clone(), messages)
            .with_temperature(self.config.temperature);
        if let Some(max_tokens) = self.config.max_tokens {
            request = request.with_max_tokens(max_tokens);
        }
        if let Some(schema) = json_schema {
            request = request.with_json_schema(schema.clone());
        }
        request
    }
}

/// Ensures `record_concurrent_end` fires even when the owning task is
/// cancelled mid-request. Disarmed on the normal path, where the end is
/// recorded in order after `record_request`.
struct ConcurrencyGuard {
    stats: Option<Arc<StatsManager>>,
    batch_id: Option<String>,
}

impl ConcurrencyGuard {
    fn new(stats: Arc<StatsManager>, batch_id: Option<String>) -> Self {
        Self {
            stats: Some(stats),
            batch_id,
        }
    }

    fn disarm(&mut self) {
        self.stats = None;
    }
}

impl Drop for ConcurrencyGuard {
    fn drop(&mut self) {
        if let Some(stats) = self.stats.take() {
            let batch_id = self.batch_id.take();
            tokio::spawn(async move {
                stats.record_concurrent_end(batch_id.as_deref()).await;
            });
        }
    }
}

/// Substitute `{text}` and any named `{key}` placeholders into the template
fn render_prompt(template: &str, text: &str, vars: &HashMap<String, String>) -> String {
    let mut prompt = template.replace("{text}", text);
    for (key, value) in vars {
        prompt = prompt.replace(&format!("{{{key}}}"), value);
    }
    prompt
}

/// Classify an error as rate-limit pushback and extract the wait to honor
///
/// Rate limits are recognized by substring ("rate limit", case-insensitive,
/// which also covers "token rate limit"). The wait comes from a
/// `Retry-After` header when the client surfaced one, else from a
/// "try again in …Ns" hint in the message, else a 60 s default.
fn rate_limit_wait(error: &Error) -> Option<f64> {
    let message = error.to_string().to_lowercase();
    if !message.contains("rate limit") {
        return None;
    }
    if let Error::Api {
        retry_after: Some(seconds),
        ..
    } = error
    {
        return Some(*seconds);
    }
    Some(parse_retry_hint(&message).unwrap_or(DEFAULT_RATE_LIMIT_WAIT_SECS))
}

/// Extract `N` from a "try again in Ns" fragment
fn parse_retry_hint(message: &str) -> Option<f64> {
    let marker = "try again in ";
    let rest = &message[message.find(marker)? + marker.len()..];
    let digits: String = rest
        .chars()
        .take_while(|c| c.is_ascii_digit() || *c == '.')
        .collect();
    if digits.is_empty() || !rest[digits.len()..].starts_with('s') {
        return None;
    }
    digits.parse().ok()
}
