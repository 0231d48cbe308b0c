//! Lock-protected statistics store

use super::container::StatsContainer;
use crate::config::ModelCatalog;
use crate::limiter::LimiterEvent;
use crate::outcome::RequestOutcome;
use chrono::Utc;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::warn;

const GLOBAL_SCOPE: &str = "global";

struct StatsInner {
    global: StatsContainer,
    batches: HashMap<String, StatsContainer>,
}

/// Owns the global container and all per-batch containers
///
/// Every mutation goes through one async mutex; the limiter reaches this
/// store only through its telemetry channel, so the stats lock and the
/// limiter lock are never held together.
pub struct StatsManager {
    catalog: Arc<ModelCatalog>,
    inner: Mutex<StatsInner>,
}

impl StatsManager {
    /// Create a manager; the global container opens immediately
    #[must_use]
    pub fn new(catalog: Arc<ModelCatalog>) -> Self {
        Self {
            catalog,
            inner: Mutex::new(StatsInner {
                global: StatsContainer::new(GLOBAL_SCOPE),
                batches: HashMap::new(),
            }),
        }
    }

    /// Open a batch container; an existing id is overwritten with a warning
    pub async fn start_batch(&self, batch_id: &str) {
        let mut inner = self.inner.lock().await;
        if inner.batches.contains_key(batch_id) {
            warn!(
                action = "batch_overwritten",
                batch_id, "batch id already registered, replacing its container"
            );
        }
        inner
            .batches
            .insert(batch_id.to_string(), StatsContainer::new(batch_id));
    }

    /// Close a batch container and return a snapshot of it
    ///
    /// Closing mirrors the batch's `end_time` into the global container, so
    /// the most recently closed batch marks the global window's tail.
    /// Unknown or already-closed batches return `None`.
    pub async fn end_batch(&self, batch_id: &str) -> Option<StatsContainer> {
        let mut inner = self.inner.lock().await;
        let closed_at = Utc::now();
        let container = match inner.batches.get_mut(batch_id) {
            Some(container) if container.end_time.is_none() => {
                container.end_time = Some(closed_at);
                container.clone()
            }
            Some(_) => return None,
            None => {
                warn!(action = "unknown_batch", batch_id, "end_batch for unregistered id");
                return None;
            }
        };
        inner.global.end_time = Some(closed_at);
        Some(container)
    }

    /// Record a terminated request into the global scope and, when the id is
    /// known, the batch scope. Cost comes from the pricing catalog; unknown
    /// models price at zero.
    pub async fn record_request(
        &self,
        batch_id: Option<&str>,
        model: &str,
        outcome: &RequestOutcome,
    ) {
        let cost = self.catalog.cost_for(
            model,
            outcome.input_tokens.unwrap_or(0),
            outcome.output_tokens.unwrap_or(0),
            outcome.cached_tokens.unwrap_or(0),
        );
        let mut inner = self.inner.lock().await;
        inner.global.record_outcome(outcome, cost);
        if let Some(id) = batch_id {
            if let Some(container) = inner.batches.get_mut(id) {
                container.record_outcome(outcome, cost);
            }
        }
    }

    /// Mark a request as entering flight
    pub async fn record_concurrent_start(&self, batch_id: Option<&str>) {
        let mut inner = self.inner.lock().await;
        inner.global.concurrent_start();
        if let Some(id) = batch_id {
            if let Some(container) = inner.batches.get_mut(id) {
                container.concurrent_start();
            }
        }
    }

    /// Mark a request as leaving flight
    pub async fn record_concurrent_end(&self, batch_id: Option<&str>) {
        let mut inner = self.inner.lock().await;
        inner.global.concurrent_end();
        if let Some(id) = batch_id {
            if let Some(container) = inner.batches.get_mut(id) {
                container.concurrent_end();
            }
        }
    }

    /// Fold a limiter telemetry event into the store
    ///
    /// With an explicit batch id the event lands on the global container and
    /// that batch; without one it lands on the global container and every
    /// open batch, since limiter state is shared across batches.
    pub async fn record_limiter_event(&self, batch_id: Option<&str>, event: &LimiterEvent) {
        let mut inner = self.inner.lock().await;
        let StatsInner { global, batches } = &mut *inner;
        apply_limiter_event(global, event);
        match batch_id {
            Some(id) => {
                if let Some(container) = batches.get_mut(id) {
                    apply_limiter_event(container, event);
                }
            }
            None => {
                for container in batches.values_mut() {
                    if container.end_time.is_none() {
                        apply_limiter_event(container, event);
                    }
                }
            }
        }
    }

    /// Snapshot of the global container
    pub async fn global_snapshot(&self) -> StatsContainer {
        self.inner.lock().await.global.clone()
    }

    /// Non-blocking snapshot of the global container, for sync render loops.
    /// Returns `None` if the lock is held by another task.
    #[must_use]
    pub fn try_global_snapshot(&self) -> Option<StatsContainer> {
        self.inner.try_lock().ok().map(|inner| inner.global.clone())
    }

    /// Snapshot of a batch container, open or closed
    pub async fn batch_snapshot(&self, batch_id: &str) -> Option<StatsContainer> {
        self.inner.lock().await.batches.get(batch_id).cloned()
    }

    /// Formatted multi-line report for the global scope or one batch
    ///
    /// An unknown batch id yields a visible error string rather than a panic.
    pub async fn get_summary(&self, batch_id: Option<&str>) -> String {
        let inner = self.inner.lock().await;
        match batch_id {
            None => inner.global.format_summary(),
            Some(id) => match inner.batches.get(id) {
                Some(container) => container.format_summary(),
                None => format!("no statistics recorded for batch '{id}'"),
            },
        }
    }
}

fn apply_limiter_event(container: &mut StatsContainer, event: &LimiterEvent) {
    match event {
        LimiterEvent::ProactivePause { wait_time } => {
            container.proactive_pauses += 1;
            container.total_pause_time += wait_time;
        }
        LimiterEvent::ApiRateLimitDetected { .. } => {
            container.api_rate_limits_detected += 1;
        }
        LimiterEvent::TokenUsageUpdate { current_tpm } => {
            container.peak_tpm = container.peak_tpm.max(*current_tpm);
        }
        LimiterEvent::ConcurrencyUpdate { .. } => {
            container.concurrency_adjustments += 1;
        }
    }
}
