//! Batch progress logging at 10% milestones

use std::collections::HashSet;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::info;

/// Per-batch completion counter that logs once per 10% milestone with the
/// observed rate and an ETA from elapsed wall time
pub struct ProgressTracker {
    batch_id: String,
    total: usize,
    started: Instant,
    inner: Mutex<ProgressInner>,
}

struct ProgressInner {
    completed: usize,
    logged_milestones: HashSet<u32>,
}

impl ProgressTracker {
    /// Create a tracker for a batch of `total` items
    #[must_use]
    pub fn new(batch_id: String, total: usize) -> Self {
        Self {
            batch_id,
            total,
            started: Instant::now(),
            inner: Mutex::new(ProgressInner {
                completed: 0,
                logged_milestones: HashSet::new(),
            }),
        }
    }

    /// Count one completed item; logs when a new 10% milestone is crossed
    pub async fn increment_and_log(&self) -> usize {
        let mut inner = self.inner.lock().await;
        inner.completed += 1;
        let completed = inner.completed;
        if self.total == 0 {
            return completed;
        }

        let percent = (completed * 100 / self.total) as u32;
        let milestone = percent / 10 * 10;
        if milestone >= 10 && inner.logged_milestones.insert(milestone) {
            let elapsed = self.started.elapsed().as_secs_f64();
            let rate = if elapsed > 0.0 {
                completed as f64 / elapsed
            } else {
                0.0
            };
            let remaining = self.total - completed;
            let eta_seconds = if rate > 0.0 {
                remaining as f64 / rate
            } else {
                0.0
            };
            info!(
                action = "batch_progress",
                batch_id = %self.batch_id,
                completed,
                total = self.total,
                percent = milestone,
                rate_per_sec = rate,
                eta_seconds,
                "batch progress"
            );
        }
        completed
    }

    /// Items completed so far
    pub async fn completed(&self) -> usize {
        self.inner.lock().await.completed
    }
}
