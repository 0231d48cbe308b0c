//! Per-scope statistics aggregate

use crate::outcome::RequestOutcome;
use crate::util::format_report_timestamp;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::HashMap;

/// Value aggregate for one statistics scope (global or batch)
///
/// Readers of a live container may observe mid-update state; derived values
/// are best-effort snapshots. Once `end_time` is set the container is frozen
/// by its owner.
#[derive(Debug, Clone, Serialize)]
pub struct StatsContainer {
    /// Scope label, `"global"` or the batch id
    pub scope: String,
    /// When the scope opened
    pub start_time: DateTime<Utc>,
    /// When the scope closed; `None` while open
    pub end_time: Option<DateTime<Utc>>,
    /// Requests that terminated, success or failure
    pub total_requests: u64,
    /// Successful requests
    pub successful_requests: u64,
    /// Failed requests
    pub failed_requests: u64,
    /// Failure histogram keyed by error type
    pub error_type_counts: HashMap<String, u64>,
    /// Prompt tokens
    pub total_input_tokens: u64,
    /// Completion tokens
    pub total_output_tokens: u64,
    /// Cached prompt tokens
    pub total_cached_tokens: u64,
    /// All tokens
    pub total_tokens: u64,
    /// Accumulated cost in USD
    pub total_cost: f64,
    /// Per-request service times in arrival order, seconds
    pub api_response_times: Vec<f64>,
    /// Retries beyond each request's first attempt
    pub retry_count: u64,
    /// Requests currently in flight
    pub current_concurrent_requests: u64,
    /// Highest observed in-flight count
    pub concurrent_peak: u64,
    /// Highest observed tokens-per-minute
    pub peak_tpm: u64,
    /// Times the limiter paused dispatch on a saturated window
    pub proactive_pauses: u64,
    /// Seconds spent in proactive pauses
    pub total_pause_time: f64,
    /// Provider rate-limit rejections observed
    pub api_rate_limits_detected: u64,
    /// Concurrency retunes observed
    pub concurrency_adjustments: u64,
}

impl StatsContainer {
    /// Open a container for the given scope
    #[must_use]
    pub fn new(scope: impl Into<String>) -> Self {
        Self {
            scope: scope.into(),
            start_time: Utc::now(),
            end_time: None,
            total_requests: 0,
            successful_requests: 0,
            failed_requests: 0,
            error_type_counts: HashMap::new(),
            total_input_tokens: 0,
            total_output_tokens: 0,
            total_cached_tokens: 0,
            total_tokens: 0,
            total_cost: 0.0,
            api_response_times: Vec::new(),
            retry_count: 0,
            current_concurrent_requests: 0,
            concurrent_peak: 0,
            peak_tpm: 0,
            proactive_pauses: 0,
            total_pause_time: 0.0,
            api_rate_limits_detected: 0,
            concurrency_adjustments: 0,
        }
    }

    /// Wall-clock span of the scope, seconds; runs until now while open
    #[must_use]
    pub fn processing_time(&self) -> f64 {
        let end = self.end_time.unwrap_or_else(Utc::now);
        (end - self.start_time).num_milliseconds() as f64 / 1000.0
    }

    /// Sum of per-request service times, seconds
    #[must_use]
    pub fn total_api_time(&self) -> f64 {
        self.api_response_times.iter().sum()
    }

    /// Serial API time minus wall-clock span; negative for trivially small
    /// batches, reported as computed
    #[must_use]
    pub fn parallelization_gain_seconds(&self) -> f64 {
        self.total_api_time() - self.processing_time()
    }

    /// Gain as a percentage of total API time
    #[must_use]
    pub fn parallelization_gain_percent(&self) -> f64 {
        let total = self.total_api_time();
        if total > 0.0 {
            100.0 * self.parallelization_gain_seconds() / total
        } else {
            0.0
        }
    }

    /// Observed request throughput over the scope's span
    #[must_use]
    pub fn requests_per_second(&self) -> f64 {
        let span = self.processing_time();
        if span > 0.0 {
            self.total_requests as f64 / span
        } else {
            0.0
        }
    }

    /// `(min, mean, max)` of the service times, `None` while empty
    #[must_use]
    pub fn response_time_stats(&self) -> Option<(f64, f64, f64)> {
        if self.api_response_times.is_empty() {
            return None;
        }
        let mut min = f64::INFINITY;
        let mut max = f64::NEG_INFINITY;
        for &sample in &self.api_response_times {
            min = min.min(sample);
            max = max.max(sample);
        }
        let mean = self.total_api_time() / self.api_response_times.len() as f64;
        Some((min, mean, max))
    }

    pub(crate) fn record_outcome(&mut self, outcome: &RequestOutcome, cost: f64) {
        self.total_requests += 1;
        if outcome.success {
            self.successful_requests += 1;
        } else {
            self.failed_requests += 1;
            *self
                .error_type_counts
                .entry(outcome.error_type().to_string())
                .or_insert(0) += 1;
        }
        self.total_input_tokens += outcome.input_tokens.unwrap_or(0);
        self.total_output_tokens += outcome.output_tokens.unwrap_or(0);
        self.total_cached_tokens += outcome.cached_tokens.unwrap_or(0);
        self.total_tokens += outcome.total_tokens.unwrap_or(0);
        self.total_cost += cost;
        if outcome.api_response_time > 0.0 {
            self.api_response_times.push(outcome.api_response_time);
        }
        self.retry_count += u64::from(outcome.attempts.saturating_sub(1));
    }

    pub(crate) fn concurrent_start(&mut self) {
        self.current_concurrent_requests += 1;
        self.concurrent_peak = self.concurrent_peak.max(self.current_concurrent_requests);
    }

    pub(crate) fn concurrent_end(&mut self) {
        self.current_concurrent_requests = self.current_concurrent_requests.saturating_sub(1);
    }

    /// Multi-line human-readable report for this scope
    #[must_use]
    pub fn format_summary(&self) -> String {
        let mut out = String::new();
        out.push_str(&format!("📊 Request Statistics — {}\n", self.scope));
        let window_end = match self.end_time {
            Some(end) => format_report_timestamp(end),
            None => "open".to_string(),
        };
        out.push_str(&format!(
            "Window: {} → {} ({:.1}s)\n",
            format_report_timestamp(self.start_time),
            window_end,
            self.processing_time()
        ));
        out.push_str(&format!(
            "Requests: {} total | {} succeeded | {} failed | {:.2} req/s\n",
            self.total_requests,
            self.successful_requests,
            self.failed_requests,
            self.requests_per_second()
        ));
        out.push_str(&format!(
            "Retries: {} | Rate limit hits: {} | Proactive pauses: {} ({:.1}s paused)\n",
            self.retry_count,
            self.api_rate_limits_detected,
            self.proactive_pauses,
            self.total_pause_time
        ));
        out.push_str(&format!(
            "Tokens: {} input ({} cached) | {} output | {} total\n",
            self.total_input_tokens,
            self.total_cached_tokens,
            self.total_output_tokens,
            self.total_tokens
        ));
        out.push_str(&format!("Cost: ${:.4}\n", self.total_cost));
        if let Some((min, mean, max)) = self.response_time_stats() {
            out.push_str(&format!(
                "API time: {:.1}s total | min {:.2}s | mean {:.2}s | max {:.2}s\n",
                self.total_api_time(),
                min,
                mean,
                max
            ));
            out.push_str(&format!(
                "Parallelization gain: {:.1}s ({:.1}%)\n",
                self.parallelization_gain_seconds(),
                self.parallelization_gain_percent()
            ));
        }
        out.push_str(&format!(
            "Concurrency peak: {} | Peak TPM: {}\n",
            self.concurrent_peak, self.peak_tpm
        ));
        if !self.error_type_counts.is_empty() {
            let mut kinds: Vec<_> = self.error_type_counts.iter().collect();
            kinds.sort_by(|a, b| b.1.cmp(a.1).then_with(|| a.0.cmp(b.0)));
            let listing = kinds
                .iter()
                .map(|(kind, count)| format!("{kind} ×{count}"))
                .collect::<Vec<_>>()
                .join(", ");
            out.push_str(&format!("Errors: {listing}\n"));
        }
        out
    }
}
