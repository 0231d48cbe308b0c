//! Adaptive TPM rate limiter
//!
//! Admits callers at a rate that approaches but does not exceed a
//! tokens-per-minute budget, without requiring callers to predict their own
//! token cost. Three mechanisms cooperate:
//!
//! - a sliding 60 s window of `(timestamp, tokens)` samples tracking observed
//!   TPM,
//! - a variable-capacity semaphore gating concurrent dispatch, and
//! - a controller that retunes capacity from the mean observed request cost
//!   (heartbeat path) or halves it on provider pushback (emergency path).
//!
//! Capacity reductions never revoke a permit already granted: shrinking adds
//! to a reclaim debt that a dedicated task pays down by acquiring and
//! forgetting permits one at a time, re-checking the debt after every
//! acquisition so a growth that lands mid-reclaim cancels the remainder
//! instead of leaking permits.
//!
//! Telemetry leaves through a bounded channel; a full channel drops the event
//! rather than blocking the limiter.

use crate::error::{Error, Result};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, Mutex, Notify, OwnedSemaphorePermit, Semaphore};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn};


/// Tunables for [`AdaptiveRateLimiter`]
#[derive(Debug, Clone)]
pub struct LimiterConfig {
    /// Provider tokens-per-minute budget; must be positive
    pub max_tpm: u64,
    /// Concurrency at construction
    pub initial_concurrency: usize,
    /// Lower concurrency bound
    pub min_concurrency: usize,
    /// Upper concurrency bound
    pub max_concurrency: usize,
    /// Sliding-window span
    pub window: Duration,
    /// Number of recent request costs kept for the mean
    pub cost_samples: usize,
    /// Assumed request cost while no samples exist
    pub default_request_cost: u64,
    /// Successful completions between heartbeat retunes
    pub heartbeat_requests: u64,
    /// Minimum time between heartbeat retunes
    pub adjustment_cooldown: Duration,
    /// Fraction of `max_tpm` the controller steers toward
    pub target_utilization: f64,
    /// Telemetry channel capacity
    pub event_buffer: usize,
}

impl LimiterConfig {
    /// Create a config for the given TPM budget with default tuning
    #[must_use]
    pub fn new(max_tpm: u64) -> Self {
        Self {
            max_tpm,
            initial_concurrency: 10,
            min_concurrency: 2,
            max_concurrency: 100,
            window: Duration::from_secs(60),
            cost_samples: 50,
            default_request_cost: 1500,
            heartbeat_requests: 20,
            adjustment_cooldown: Duration::from_secs(5),
            target_utilization: 0.90,
            event_buffer: 256,
        }
    }

    /// Set the starting concurrency
    #[must_use]
    pub fn with_initial_concurrency(mut self, concurrency: usize) -> Self {
        self.initial_concurrency = concurrency;
        self
    }

    /// Set the concurrency bounds
    #[must_use]
    pub fn with_concurrency_bounds(mut self, min: usize, max: usize) -> Self {
        self.min_concurrency = min;
        self.max_concurrency = max;
        self
    }

    /// Set the heartbeat cadence (completions between retunes, cooldown)
    #[must_use]
    pub fn with_heartbeat(mut self, requests: u64, cooldown: Duration) -> Self {
        self.heartbeat_requests = requests;
        self.adjustment_cooldown = cooldown;
        self
    }
}

/// Telemetry emitted by the limiter
#[derive(Debug, Clone, PartialEq)]
pub enum LimiterEvent {
    /// The recorded window saturated the budget; dispatch paused
    ProactivePause {
        /// Seconds slept before re-checking the window
        wait_time: f64,
    },
    /// The provider rejected a request for rate-limit reasons
    ApiRateLimitDetected {
        /// Provider-mandated wait in seconds
        wait_time: f64,
    },
    /// The sliding window advanced
    TokenUsageUpdate {
        /// Tokens currently inside the window
        current_tpm: u64,
    },
    /// The controller changed (or re-confirmed) the concurrency target
    ConcurrencyUpdate {
        /// Capacity after the adjustment
        new_concurrency: usize,
    },
}

/// A held concurrency slot; dropping it releases the slot
///
/// Normally consumed by [`AdaptiveRateLimiter::record_completion`]. If the
/// owning task is cancelled the drop still returns the slot, so a caller in
/// flight can never strand capacity.
pub struct RatePermit {
    _permit: OwnedSemaphorePermit,
}

struct WindowState {
    window: VecDeque<(Instant, u64)>,
    tokens_in_window: u64,
    recent_costs: VecDeque<u64>,
    capacity: usize,
    reqs_since_adjustment: u64,
    last_adjustment: Instant,
}

struct ReclaimState {
    debt: AtomicU64,
    notify: Notify,
}

struct LimiterShared {
    config: LimiterConfig,
    semaphore: Arc<Semaphore>,
    state: Mutex<WindowState>,
    reclaim: ReclaimState,
    is_adjusting: AtomicBool,
    events: mpsc::Sender<LimiterEvent>,
}

/// Sliding-window TPM accountant with a self-tuning concurrency gate
pub struct AdaptiveRateLimiter {
    shared: Arc<LimiterShared>,
    reclaim_task: JoinHandle<()>,
}

impl AdaptiveRateLimiter {
    /// Create a limiter; fails on a non-positive TPM budget or inverted bounds
    pub fn new(config: LimiterConfig, events: mpsc::Sender<LimiterEvent>) -> Result<Self> {
        if config.max_tpm == 0 {
            return Err(Error::Config("max_tpm must be positive".to_string()));
        }
        if config.min_concurrency == 0 || config.min_concurrency > config.max_concurrency {
            return Err(Error::Config(format!(
                "invalid concurrency bounds [{}, {}]",
                config.min_concurrency, config.max_concurrency
            )));
        }
        let initial = config
            .initial_concurrency
            .clamp(config.min_concurrency, config.max_concurrency);

        let shared = Arc::new(LimiterShared {
            semaphore: Arc::new(Semaphore::new(initial)),
            state: Mutex::new(WindowState {
                window: VecDeque::new(),
                tokens_in_window: 0,
                recent_costs: VecDeque::with_capacity(config.cost_samples),
                capacity: initial,
                reqs_since_adjustment: 0,
                last_adjustment: Instant::now(),
            }),
            reclaim: ReclaimState {
                debt: AtomicU64::new(0),
                notify: Notify::new(),
            },
            is_adjusting: AtomicBool::new(false),
            events,
            config,
        });
        let reclaim_task = tokio::spawn(reclaim_loop(Arc::clone(&shared)));

        Ok(Self {
            shared,
            reclaim_task,
        })
    }

    /// Wait for a concurrency slot
    ///
    /// Prunes the sliding window once the slot is held. If the recorded
    /// window already meets the TPM budget, sleeps until the oldest sample
    /// ages out before returning; the upcoming request's own cost is never
    /// predicted.
    pub async fn acquire(&self) -> RatePermit {
        let shared = &self.shared;
        let permit = Arc::clone(&shared.semaphore)
            .acquire_owned()
            .await
            .expect("semaphore is never closed");
        loop {
            let pause = {
                let mut state = shared.state.lock().await;
                let now = Instant::now();
                prune_window(&mut state, now, shared.config.window);
                if state.tokens_in_window >= shared.config.max_tpm {
                    state.window.front().map(|(oldest, _)| {
                        (*oldest + shared.config.window).saturating_duration_since(now)
                    })
                } else {
                    None
                }
            };
            let Some(wait) = pause else {
                return RatePermit { _permit: permit };
            };
            if wait.is_zero() {
                continue;
            }
            shared.emit(LimiterEvent::ProactivePause {
                wait_time: wait.as_secs_f64(),
            });
            debug!(
                action = "proactive_pause",
                wait_secs = wait.as_secs_f64(),
                "token window saturated, pausing before dispatch"
            );
            tokio::time::sleep(wait).await;
        }
    }

    /// Report a finished request and release its slot
    ///
    /// The slot is released before any bookkeeping; window and cost updates
    /// (and a possible retune) run on a detached task so the caller never
    /// suspends here.
    pub fn record_completion(&self, permit: RatePermit, tokens_used: u64, success: bool) {
        drop(permit);
        let shared = Arc::clone(&self.shared);
        tokio::spawn(async move {
            shared.apply_completion(tokens_used, success).await;
        });
    }

    /// Report provider rate-limit pushback
    ///
    /// Halves capacity (subject to the floor) on a detached task, ignoring
    /// the heartbeat cooldown. A second call while a tuning decision is in
    /// flight is dropped.
    pub fn record_api_rate_limit(&self, wait_time: f64) {
        warn!(
            action = "api_rate_limit_detected",
            wait_time, "provider pushback, scheduling emergency retune"
        );
        self.shared
            .emit(LimiterEvent::ApiRateLimitDetected { wait_time });
        let shared = Arc::clone(&self.shared);
        tokio::spawn(async move {
            if shared.is_adjusting.swap(true, Ordering::Acquire) {
                return;
            }
            let mut state = shared.state.lock().await;
            let previous = state.capacity;
            let target = (previous / 2).max(shared.config.min_concurrency);
            shared.resize(&mut state, target);
            state.reqs_since_adjustment = 0;
            info!(
                action = "concurrency_update",
                previous,
                new_concurrency = target,
                "emergency halving after rate limit"
            );
            shared.emit(LimiterEvent::ConcurrencyUpdate {
                new_concurrency: target,
            });
            shared.is_adjusting.store(false, Ordering::Release);
        });
    }

    /// Current concurrency target
    pub async fn current_concurrency(&self) -> usize {
        self.shared.state.lock().await.capacity
    }

    /// Tokens inside the sliding window, pruned to the observation instant
    pub async fn tokens_in_window(&self) -> u64 {
        let mut state = self.shared.state.lock().await;
        prune_window(&mut state, Instant::now(), self.shared.config.window);
        state.tokens_in_window
    }

    /// Mean of the recent request costs, or the configured default
    pub async fn avg_request_cost(&self) -> f64 {
        let state = self.shared.state.lock().await;
        mean_cost(&state.recent_costs, self.shared.config.default_request_cost)
    }

    /// The immutable TPM budget
    #[must_use]
    pub fn max_tpm(&self) -> u64 {
        self.shared.config.max_tpm
    }
}

impl Drop for AdaptiveRateLimiter {
    fn drop(&mut self) {
        self.reclaim_task.abort();
    }
}

impl LimiterShared {
    async fn apply_completion(&self, tokens_used: u64, success: bool) {
        let mut state = self.state.lock().await;
        let now = Instant::now();
        prune_window(&mut state, now, self.config.window);
        if !success || tokens_used == 0 {
            return;
        }
        state.window.push_back((now, tokens_used));
        state.tokens_in_window += tokens_used;
        if state.recent_costs.len() >= self.config.cost_samples {
            state.recent_costs.pop_front();
        }
        state.recent_costs.push_back(tokens_used);
        self.emit(LimiterEvent::TokenUsageUpdate {
            current_tpm: state.tokens_in_window,
        });

        state.reqs_since_adjustment += 1;
        if state.reqs_since_adjustment >= self.config.heartbeat_requests
            && now.duration_since(state.last_adjustment) >= self.config.adjustment_cooldown
        {
            self.heartbeat_retune(&mut state);
        }
    }

    /// Heartbeat retune: applies the computed target unconditionally, even
    /// when the move is zero, so downstream consumers see the cadence.
    fn heartbeat_retune(&self, state: &mut WindowState) {
        if self.is_adjusting.swap(true, Ordering::Acquire) {
            return;
        }
        let avg_cost = mean_cost(&state.recent_costs, self.config.default_request_cost);
        let ideal =
            ((self.config.target_utilization * self.config.max_tpm as f64) / avg_cost).floor();
        let target =
            (ideal as usize).clamp(self.config.min_concurrency, self.config.max_concurrency);
        let previous = state.capacity;
        self.resize(state, target);
        state.reqs_since_adjustment = 0;
        info!(
            action = "concurrency_update",
            previous,
            new_concurrency = target,
            avg_request_cost = avg_cost,
            "heartbeat retune"
        );
        self.emit(LimiterEvent::ConcurrencyUpdate {
            new_concurrency: target,
        });
        self.is_adjusting.store(false, Ordering::Release);
    }

    /// Shift effective capacity. Growth first cancels outstanding reclaim
    /// debt, then adds permits; shrinkage adds debt for the reclaimer to pay
    /// down. Must be called with the state lock held.
    fn resize(&self, state: &mut WindowState, target: usize) {
        let target = target.clamp(self.config.min_concurrency, self.config.max_concurrency);
        let current = state.capacity;
        if target > current {
            let grow = (target - current) as u64;
            let cancelled = cancel_debt(&self.reclaim.debt, grow);
            let add = (grow - cancelled) as usize;
            if add > 0 {
                self.semaphore.add_permits(add);
            }
        } else if target < current {
            self.reclaim
                .debt
                .fetch_add((current - target) as u64, Ordering::AcqRel);
            self.reclaim.notify.notify_one();
        }
        state.capacity = target;
        state.last_adjustment = Instant::now();
    }

    fn emit(&self, event: LimiterEvent) {
        if let Err(err) = self.events.try_send(event) {
            debug!(
                action = "telemetry_dropped",
                error = %err,
                "stats channel full or closed"
            );
        }
    }
}

/// Pay down reclaim debt by acquiring and forgetting permits one at a time.
/// The debt is re-checked after every acquisition: a growth that cancelled
/// the remainder mid-acquire gets its permit back instead of losing it.
async fn reclaim_loop(shared: Arc<LimiterShared>) {
    loop {
        shared.reclaim.notify.notified().await;
        while shared.reclaim.debt.load(Ordering::Acquire) > 0 {
            let Ok(permit) = Arc::clone(&shared.semaphore).acquire_owned().await else {
                return;
            };
            if consume_one_debt(&shared.reclaim.debt) {
                permit.forget();
            }
        }
    }
}

fn consume_one_debt(debt: &AtomicU64) -> bool {
    let mut current = debt.load(Ordering::Acquire);
    while current > 0 {
        match debt.compare_exchange(current, current - 1, Ordering::AcqRel, Ordering::Acquire) {
            Ok(_) => return true,
            Err(actual) => current = actual,
        }
    }
    false
}

fn cancel_debt(debt: &AtomicU64, want: u64) -> u64 {
    let mut current = debt.load(Ordering::Acquire);
    loop {
        let cancel = current.min(want);
        if cancel == 0 {
            return 0;
        }
        match debt.compare_exchange(current, current - cancel, Ordering::AcqRel, Ordering::Acquire)
        {
            Ok(_) => return cancel,
            Err(actual) => current = actual,
        }
    }
}

/// Drop samples whose age reached the window span, keeping the token sum in
/// lockstep with the surviving entries.
fn prune_window(state: &mut WindowState, now: Instant, window: Duration) {
    while let Some(&(timestamp, tokens)) = state.window.front() {
        if now.duration_since(timestamp) >= window {
            state.tokens_in_window -= tokens;
            state.window.pop_front();
        } else {
            break;
        }
    }
}

fn mean_cost(samples: &VecDeque<u64>, default: u64) -> f64 {
    if samples.is_empty() {
        return default as f64;
    }
    samples.iter().sum::<u64>() as f64 / samples.len() as f64
}
