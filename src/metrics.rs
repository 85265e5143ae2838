//! Run metrics collection for the scheduler.
//!
//! The collector is clone-shareable and thread-safe; `finish` produces a
//! serializable summary for dashboards or the event log.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};

/// Metrics for a single work item across all of its attempts.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ItemMetrics {
    /// The item id.
    pub item_id: String,
    /// Execution attempts made.
    pub attempts: u32,
    /// Total time spent executing, across attempts.
    pub execution_time: Duration,
    /// Whether the item ultimately completed.
    pub success: bool,
    /// Final error message if the item failed.
    pub error: Option<String>,
}

impl ItemMetrics {
    fn new(item_id: impl Into<String>) -> Self {
        Self {
            item_id: item_id.into(),
            attempts: 0,
            execution_time: Duration::ZERO,
            success: false,
            error: None,
        }
    }
}

/// Aggregated metrics for one planning run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunMetrics {
    /// Run identifier.
    pub run_id: String,
    /// Total run duration.
    pub run_duration: Duration,
    /// Batches emitted by the partitioner.
    pub batches_planned: u64,
    /// Items that reached `Complete`.
    pub items_completed: u32,
    /// Items that failed terminally.
    pub items_failed: u32,
    /// Items blocked (escalation or failure propagation).
    pub items_blocked: u32,
    /// Retry attempts recorded across all items.
    pub retries: u32,
    /// Conflict records produced across all rounds.
    pub conflicts_detected: u32,
    /// Per-item detail.
    pub items: Vec<ItemMetrics>,
}

#[derive(Debug)]
struct MetricsState {
    run_id: String,
    started: Instant,
    batches_planned: u64,
    items_blocked: u32,
    conflicts_detected: u32,
    items: HashMap<String, ItemMetrics>,
}

/// Thread-safe metrics collector for a run.
#[derive(Debug, Clone)]
pub struct RunMetricsCollector {
    inner: Arc<Mutex<MetricsState>>,
}

impl RunMetricsCollector {
    /// Create a collector for `run_id`.
    pub fn new(run_id: impl Into<String>) -> Self {
        Self {
            inner: Arc::new(Mutex::new(MetricsState {
                run_id: run_id.into(),
                started: Instant::now(),
                batches_planned: 0,
                items_blocked: 0,
                conflicts_detected: 0,
                items: HashMap::new(),
            })),
        }
    }

    fn with_state<R>(&self, apply: impl FnOnce(&mut MetricsState) -> R) -> R {
        let mut state = match self.inner.lock() {
            Ok(state) => state,
            Err(poisoned) => poisoned.into_inner(),
        };
        apply(&mut state)
    }

    /// Record a planned batch.
    pub fn record_batch_planned(&self) {
        self.with_state(|state| state.batches_planned += 1);
    }

    /// Record conflict records produced by one round.
    pub fn record_conflicts(&self, count: usize) {
        self.with_state(|state| state.conflicts_detected += count as u32);
    }

    /// Record one execution attempt for an item.
    pub fn record_attempt(&self, item_id: &str, duration: Duration) {
        self.with_state(|state| {
            let entry = state
                .items
                .entry(item_id.to_string())
                .or_insert_with(|| ItemMetrics::new(item_id));
            entry.attempts += 1;
            entry.execution_time += duration;
        });
    }

    /// Mark an item completed.
    pub fn record_item_complete(&self, item_id: &str) {
        self.with_state(|state| {
            let entry = state
                .items
                .entry(item_id.to_string())
                .or_insert_with(|| ItemMetrics::new(item_id));
            entry.success = true;
            entry.error = None;
        });
    }

    /// Mark an item terminally failed.
    pub fn record_item_failed(&self, item_id: &str, error: impl Into<String>) {
        self.with_state(|state| {
            let entry = state
                .items
                .entry(item_id.to_string())
                .or_insert_with(|| ItemMetrics::new(item_id));
            entry.success = false;
            entry.error = Some(error.into());
        });
    }

    /// Record an item entering `Blocked`.
    pub fn record_item_blocked(&self) {
        self.with_state(|state| state.items_blocked += 1);
    }

    /// Snapshot the collected metrics.
    pub fn finish(&self) -> RunMetrics {
        self.with_state(|state| {
            let mut items: Vec<ItemMetrics> = state.items.values().cloned().collect();
            items.sort_by(|left, right| left.item_id.cmp(&right.item_id));
            let items_completed = items.iter().filter(|item| item.success).count() as u32;
            let items_failed = items
                .iter()
                .filter(|item| !item.success && item.error.is_some())
                .count() as u32;
            let retries = items
                .iter()
                .map(|item| item.attempts.saturating_sub(1))
                .sum();
            RunMetrics {
                run_id: state.run_id.clone(),
                run_duration: state.started.elapsed(),
                batches_planned: state.batches_planned,
                items_completed,
                items_failed,
                items_blocked: state.items_blocked,
                retries,
                conflicts_detected: state.conflicts_detected,
                items,
            }
        })
    }
}
