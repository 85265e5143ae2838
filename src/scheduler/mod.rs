//! Scheduler and state tracker: drives planned batches against an external
//! executor, folds results into the store, and surfaces every terminal
//! condition through the checkpoint notifier.
//!
//! A single coordination task owns the store and graph for mutation; batch
//! execution fans out to the executor up to the parallelism cap and is
//! joined before the next round is planned, so batches are strictly
//! ordered.

pub mod retry;

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use futures::future::join_all;
use serde::{Deserialize, Serialize};
use serde_json::json;
use thiserror::Error;
use tokio::sync::{watch, Mutex, RwLock};
use tracing::{debug, info, warn};

use crate::batch::{Batch, BatchPlanner, BatchStatus, PlanOutcome};
use crate::config::SchedulerConfig;
use crate::conflict::ResourceClassifier;
use crate::error::PlanError;
use crate::events::{generate_run_id, EventLog};
use crate::graph::{detect_cycles, detect_cycles_from, DependencyGraph};
use crate::item::{ItemStatus, ProgressSummary, WorkItem, WorkItemSpec, WorkItemStore};
use crate::metrics::{RunMetrics, RunMetricsCollector};

pub use retry::RetryPolicy;

/// Result of one execution attempt, as reported by the executor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ItemOutcome {
    /// Whether the attempt succeeded.
    pub success: bool,
    /// Error detail on failure (executor timeouts included).
    pub detail: Option<String>,
}

impl ItemOutcome {
    /// A successful attempt.
    pub fn success() -> Self {
        Self {
            success: true,
            detail: None,
        }
    }

    /// A failed attempt with detail.
    pub fn failure(detail: impl Into<String>) -> Self {
        Self {
            success: false,
            detail: Some(detail.into()),
        }
    }
}

/// Downstream execution worker. Invoked once per attempt; implementations
/// must tolerate re-invocation on retry. Per-item timeouts are the
/// executor's responsibility and are reported as failed outcomes.
#[async_trait]
pub trait WorkExecutor: Send + Sync {
    /// Execute one work item.
    async fn execute(&self, item: &WorkItem) -> ItemOutcome;
}

/// Read-only view of the run for dashboards and checkpoint payloads.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StateSnapshot {
    /// Every item with its current status.
    pub items: Vec<WorkItem>,
    /// Every batch planned so far.
    pub batches: Vec<Batch>,
    /// Declared dependency edges as `(dependent, dependency)` pairs.
    pub edges: Vec<(String, String)>,
    /// Aggregate progress counters.
    pub progress: ProgressSummary,
}

/// Why the checkpoint notifier is being invoked.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "trigger")]
pub enum CheckpointTrigger {
    /// A batch finished executing.
    BatchComplete {
        /// The finished batch.
        batch_id: u64,
    },
    /// An `Escalate`-tier conflict blocked an item.
    ConflictEscalated {
        /// The blocked item.
        item_id: String,
        /// The contended resource.
        resource_key: String,
    },
    /// An item exhausted its retries.
    ItemFailed {
        /// The failed item.
        item_id: String,
        /// Final error detail.
        reason: String,
    },
    /// No progress is possible without external action.
    Stalled {
        /// Pending items with unsatisfiable prerequisites.
        pending: Vec<String>,
        /// Blocked items awaiting clearance.
        blocked: Vec<String>,
    },
}

/// Payload handed to the checkpoint reviewer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Checkpoint {
    /// What prompted this checkpoint.
    pub trigger: CheckpointTrigger,
    /// Current run state for inspection.
    pub snapshot: StateSnapshot,
}

/// The reviewer's verdict, read back before the next batch is planned.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CheckpointDecision {
    /// Continue as planned.
    Approve,
    /// End the run; nothing further is planned.
    Reject,
    /// Reset the named items to `Pending` (each re-validated for cycles)
    /// and continue.
    Modify {
        /// Items to reset.
        reset: Vec<String>,
    },
}

/// Human-review collaborator invoked at batch boundaries, on escalations,
/// terminal failures, and stalls.
#[async_trait]
pub trait CheckpointNotifier: Send + Sync {
    /// Review a checkpoint and decide how to proceed.
    async fn notify(&self, checkpoint: Checkpoint) -> CheckpointDecision;
}

/// Notifier that approves every checkpoint; the default when embedding
/// without a human loop.
#[derive(Debug, Clone, Copy, Default)]
pub struct AutoApprove;

#[async_trait]
impl CheckpointNotifier for AutoApprove {
    async fn notify(&self, _checkpoint: Checkpoint) -> CheckpointDecision {
        CheckpointDecision::Approve
    }
}

/// Per-batch execution summary.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BatchResult {
    /// The executed batch.
    pub batch_id: u64,
    /// Folded batch status.
    pub status: BatchStatus,
    /// Items that completed.
    pub completed: Vec<String>,
    /// Items sent back to pending for another attempt.
    pub retried: Vec<String>,
    /// Items that failed terminally.
    pub failed: Vec<String>,
}

/// Final summary of a planning run.
#[derive(Debug, Clone)]
pub struct RunResult {
    /// Run identifier.
    pub run_id: String,
    /// Whether every item reached `Complete`.
    pub all_complete: bool,
    /// Items that reached `Complete`.
    pub items_complete: usize,
    /// Items terminally `Failed`.
    pub items_failed: usize,
    /// Items left `Blocked`.
    pub items_blocked: usize,
    /// Batches emitted.
    pub batches_planned: u64,
    /// The run was cancelled between batches.
    pub cancelled: bool,
    /// A checkpoint reviewer rejected the run.
    pub rejected: bool,
    /// Stall diagnostic, when the run ended stalled.
    pub error: Option<PlanError>,
    /// Collected run metrics.
    pub metrics: RunMetrics,
}

/// Errors constructing a scheduler.
#[derive(Error, Debug)]
pub enum SchedulerBuildError {
    /// Structural input error (duplicates, unknown references, cycles).
    #[error(transparent)]
    Plan(#[from] PlanError),

    /// A configured classifier pattern failed to compile.
    #[error("invalid classifier pattern: {0}")]
    Pattern(#[from] regex::Error),
}

/// Cooperative cancellation handle for a running scheduler.
#[derive(Debug, Clone)]
pub struct CancelHandle {
    tx: watch::Sender<bool>,
}

impl CancelHandle {
    /// Request cancellation. In-flight executions finish; no new batch is
    /// planned.
    pub fn cancel(&self) {
        let _ = self.tx.send(true);
    }
}

#[derive(Debug)]
struct SchedulerState {
    store: WorkItemStore,
    graph: DependencyGraph,
    planner: BatchPlanner,
    batches: Vec<Batch>,
}

enum Flow {
    Continue,
    Stop,
}

/// Drives a planning run: plan, execute, fold, checkpoint, repeat.
pub struct Scheduler {
    config: SchedulerConfig,
    classifier: Arc<dyn ResourceClassifier>,
    state: Arc<RwLock<SchedulerState>>,
    cancel_tx: watch::Sender<bool>,
    cancel_rx: watch::Receiver<bool>,
    run_id: String,
    metrics: RunMetricsCollector,
    events: Option<EventLog>,
}

impl Scheduler {
    /// Build a scheduler over the given items, compiling the classifier
    /// from configuration.
    ///
    /// Validates the item set (references, duplicates) and runs cycle
    /// detection up front; a cyclic set never produces a scheduler.
    pub fn new(
        specs: Vec<WorkItemSpec>,
        config: SchedulerConfig,
    ) -> Result<Self, SchedulerBuildError> {
        let classifier: Arc<dyn ResourceClassifier> = Arc::new(config.classifier.build()?);
        Ok(Self::with_classifier(specs, config, classifier)?)
    }

    /// Build a scheduler with an injected classifier (table-driven tests,
    /// custom tier logic).
    pub fn with_classifier(
        specs: Vec<WorkItemSpec>,
        config: SchedulerConfig,
        classifier: Arc<dyn ResourceClassifier>,
    ) -> Result<Self, PlanError> {
        let store = WorkItemStore::load(specs)?;
        let graph = DependencyGraph::build(&store);
        let cycles = detect_cycles(&graph);
        if !cycles.is_empty() {
            return Err(PlanError::CircularDependency { cycles });
        }

        let run_id = generate_run_id();
        let events = config.event_log_dir.as_ref().and_then(|dir| {
            match EventLog::new(dir, run_id.clone()) {
                Ok(log) => Some(log),
                Err(err) => {
                    warn!(error = %err, "failed to initialize run event log");
                    None
                }
            }
        });
        let (cancel_tx, cancel_rx) = watch::channel(false);
        let planner = BatchPlanner::new(config.parallelism_cap);

        info!(run = %run_id, items = store.len(), "scheduler ready");
        Ok(Self {
            config,
            classifier,
            state: Arc::new(RwLock::new(SchedulerState {
                store,
                graph,
                planner,
                batches: Vec::new(),
            })),
            cancel_tx,
            cancel_rx,
            metrics: RunMetricsCollector::new(run_id.clone()),
            run_id,
            events,
        })
    }

    /// This run's identifier.
    pub fn run_id(&self) -> &str {
        &self.run_id
    }

    /// Handle for cancelling the run between batches.
    pub fn cancel_handle(&self) -> CancelHandle {
        CancelHandle {
            tx: self.cancel_tx.clone(),
        }
    }

    /// Read-only snapshot of items, batches, and edges, taken under a brief
    /// read lock.
    pub async fn state(&self) -> StateSnapshot {
        let state = self.state.read().await;
        StateSnapshot {
            items: state.store.snapshot_items(),
            batches: state.batches.clone(),
            edges: state.graph.declared_edges(),
            progress: state.store.progress_summary(),
        }
    }

    /// Manually clear a `Blocked` or `Failed` item back to `Pending`.
    ///
    /// The affected subgraph is re-checked for cycles before the reset is
    /// accepted.
    pub async fn clear_item(&self, id: &str) -> Result<(), PlanError> {
        let mut state = self.state.write().await;
        let cycles = detect_cycles_from(&state.graph, &[id.to_string()]);
        if !cycles.is_empty() {
            return Err(PlanError::CircularDependency { cycles });
        }
        state.store.reset_item(id)?;
        self.emit("item_reset", json!({ "item": id }));
        Ok(())
    }

    /// Drive the run to completion (or cancellation, rejection, stall).
    pub async fn run(
        &self,
        executor: Arc<dyn WorkExecutor>,
        notifier: &dyn CheckpointNotifier,
    ) -> RunResult {
        let mut cancelled = false;
        let mut rejected = false;
        let mut stall: Option<PlanError> = None;

        self.emit("run_start", json!({ "parallelism_cap": self.config.parallelism_cap }));

        loop {
            if *self.cancel_rx.borrow() {
                info!(run = %self.run_id, "run cancelled between batches");
                cancelled = true;
                break;
            }

            let round = {
                let mut state = self.state.write().await;
                let SchedulerState {
                    store,
                    graph,
                    planner,
                    ..
                } = &mut *state;
                planner.plan_next_batch(graph, store, self.classifier.as_ref())
            };
            let round = match round {
                Ok(round) => round,
                Err(err) => {
                    warn!(error = %err, "planning round failed");
                    stall = Some(err);
                    break;
                }
            };

            self.metrics
                .record_conflicts(round.deferrals.len() + round.escalations.len());
            for deferral in &round.deferrals {
                self.emit(
                    "conflict_deferred",
                    json!({
                        "item": deferral.item_id,
                        "behind": deferral.behind,
                        "resource": deferral.resource_key,
                    }),
                );
            }
            for escalation in &round.escalations {
                self.metrics.record_item_blocked();
                self.emit(
                    "conflict_escalated",
                    json!({
                        "item": escalation.item_id,
                        "resource": escalation.resource_key,
                        "reason": escalation.reason,
                    }),
                );
                let checkpoint = self
                    .checkpoint(CheckpointTrigger::ConflictEscalated {
                        item_id: escalation.item_id.clone(),
                        resource_key: escalation.resource_key.clone(),
                    })
                    .await;
                let decision = notifier.notify(checkpoint).await;
                if matches!(self.apply_decision(decision).await, Flow::Stop) {
                    rejected = true;
                }
            }
            if rejected {
                break;
            }

            match round.outcome {
                PlanOutcome::Finished => break,
                PlanOutcome::Wait(delay) => {
                    debug!(delay_ms = delay.as_millis() as u64, "waiting out retry backoff");
                    let mut cancel_rx = self.cancel_rx.clone();
                    tokio::select! {
                        _ = tokio::time::sleep(delay.max(Duration::from_millis(10))) => {}
                        _ = cancel_rx.changed() => {}
                    }
                }
                PlanOutcome::Stalled { pending, blocked } => {
                    warn!(
                        pending = pending.len(),
                        blocked = blocked.len(),
                        "planning stalled"
                    );
                    self.emit(
                        "stalled",
                        json!({ "pending": pending, "blocked": blocked }),
                    );
                    let checkpoint = self
                        .checkpoint(CheckpointTrigger::Stalled {
                            pending: pending.clone(),
                            blocked: blocked.clone(),
                        })
                        .await;
                    let decision = notifier.notify(checkpoint).await;
                    match decision {
                        CheckpointDecision::Modify { reset } if !reset.is_empty() => {
                            if self.apply_resets(&reset).await == 0 {
                                stall = Some(PlanError::Stalled { pending, blocked });
                                break;
                            }
                        }
                        _ => {
                            stall = Some(PlanError::Stalled { pending, blocked });
                            break;
                        }
                    }
                }
                PlanOutcome::Batch(batch) => {
                    self.metrics.record_batch_planned();
                    self.emit(
                        "batch_planned",
                        json!({ "batch": batch.id, "items": batch.item_ids }),
                    );
                    {
                        let mut state = self.state.write().await;
                        state.batches.push(batch.clone());
                    }

                    let result = self.execute_batch(batch, Arc::clone(&executor)).await;
                    self.emit(
                        "batch_complete",
                        json!({
                            "batch": result.batch_id,
                            "status": result.status,
                            "completed": result.completed,
                            "retried": result.retried,
                            "failed": result.failed,
                        }),
                    );

                    let failures = self.failure_reasons(&result).await;
                    for (item_id, reason) in failures {
                        let checkpoint = self
                            .checkpoint(CheckpointTrigger::ItemFailed {
                                item_id,
                                reason,
                            })
                            .await;
                        let decision = notifier.notify(checkpoint).await;
                        if matches!(self.apply_decision(decision).await, Flow::Stop) {
                            rejected = true;
                        }
                    }
                    if rejected {
                        break;
                    }

                    let checkpoint = self
                        .checkpoint(CheckpointTrigger::BatchComplete {
                            batch_id: result.batch_id,
                        })
                        .await;
                    let decision = notifier.notify(checkpoint).await;
                    if matches!(self.apply_decision(decision).await, Flow::Stop) {
                        rejected = true;
                        break;
                    }
                }
            }
        }

        let metrics = self.metrics.finish();
        let (items_complete, items_failed, items_blocked, all_complete) = {
            let state = self.state.read().await;
            let complete = state.store.ids_with_status(ItemStatus::Complete).len();
            let failed = state.store.ids_with_status(ItemStatus::Failed).len();
            let blocked = state.store.ids_with_status(ItemStatus::Blocked).len();
            (complete, failed, blocked, complete == state.store.len())
        };
        let status = if cancelled {
            "cancelled"
        } else if rejected {
            "rejected"
        } else if stall.is_some() {
            "stalled"
        } else if all_complete {
            "success"
        } else {
            "failed"
        };
        self.emit(
            "run_complete",
            json!({
                "status": status,
                "items_complete": items_complete,
                "items_failed": items_failed,
                "items_blocked": items_blocked,
            }),
        );
        info!(run = %self.run_id, status, "run complete");

        RunResult {
            run_id: self.run_id.clone(),
            all_complete,
            items_complete,
            items_failed,
            items_blocked,
            batches_planned: metrics.batches_planned,
            cancelled,
            rejected,
            error: stall,
            metrics,
        }
    }

    /// Execute one batch: dispatch every item (serializing `Retry`-tier
    /// resource holders), join all attempts, then fold results into the
    /// store. No item's failure aborts its siblings.
    async fn execute_batch(&self, batch: Batch, executor: Arc<dyn WorkExecutor>) -> BatchResult {
        let batch_id = batch.id;

        let mut runnable: Vec<WorkItem> = Vec::new();
        {
            let mut state = self.state.write().await;
            for id in &batch.item_ids {
                match state.store.mark_running(id) {
                    Ok(()) => {
                        if let Some(item) = state.store.get(id) {
                            runnable.push(item.clone());
                        }
                    }
                    Err(err) => warn!(item = id.as_str(), error = %err, "item not dispatchable"),
                }
            }
            if let Some(entry) = state.batches.iter_mut().find(|entry| entry.id == batch_id) {
                entry.status = BatchStatus::Executing;
            }
        }

        // One gate per serialized resource; holders acquire their gates in
        // key order so two items sharing several resources cannot deadlock.
        let gates: BTreeMap<String, Arc<Mutex<()>>> = batch
            .serial_resources
            .keys()
            .map(|key| (key.clone(), Arc::new(Mutex::new(()))))
            .collect();

        let mut handles = Vec::new();
        for item in runnable {
            let executor = Arc::clone(&executor);
            let item_gates: Vec<Arc<Mutex<()>>> = batch
                .serial_resources
                .iter()
                .filter(|(_, members)| members.contains(&item.id))
                .filter_map(|(key, _)| gates.get(key).cloned())
                .collect();
            handles.push(tokio::spawn(async move {
                let mut guards = Vec::with_capacity(item_gates.len());
                for gate in &item_gates {
                    guards.push(Arc::clone(gate).lock_owned().await);
                }
                let started = Instant::now();
                let outcome = executor.execute(&item).await;
                (item.id, outcome, started.elapsed())
            }));
        }

        let mut completed = Vec::new();
        let mut retried = Vec::new();
        let mut failed = Vec::new();
        let results = join_all(handles).await;

        let mut state = self.state.write().await;
        for joined in results {
            let (id, outcome, elapsed) = match joined {
                Ok(result) => result,
                Err(err) => {
                    warn!(error = %err, "execution task aborted");
                    continue;
                }
            };
            self.metrics.record_attempt(&id, elapsed);

            if outcome.success {
                if let Err(err) = state.store.mark_complete(&id) {
                    warn!(item = id.as_str(), error = %err, "completion not recorded");
                    continue;
                }
                state.graph.clear_barriers_through(&id);
                self.metrics.record_item_complete(&id);
                self.emit("item_complete", json!({ "item": id, "batch": batch_id }));
                completed.push(id);
                continue;
            }

            let detail = outcome
                .detail
                .unwrap_or_else(|| "execution failed".to_string());
            let retry_count = state.store.get(&id).map(|item| item.retry_count).unwrap_or(0);
            if self.config.retry.allows(retry_count) {
                let failures = retry_count + 1;
                let delay = self.config.retry.delay_for(failures);
                match state.store.record_retry(&id, delay) {
                    Ok(count) => {
                        debug!(
                            item = id.as_str(),
                            retry = count,
                            delay_ms = delay.as_millis() as u64,
                            "item will be retried"
                        );
                        self.emit(
                            "item_retry",
                            json!({ "item": id, "retry": count, "detail": detail }),
                        );
                        retried.push(id);
                    }
                    Err(err) => warn!(item = id.as_str(), error = %err, "retry not recorded"),
                }
                continue;
            }

            if let Err(err) = state.store.mark_failed(&id, detail.clone()) {
                warn!(item = id.as_str(), error = %err, "failure not recorded");
                continue;
            }
            state.graph.clear_barriers_through(&id);
            self.metrics.record_item_failed(&id, &detail);
            self.emit("item_failed", json!({ "item": id, "detail": detail }));

            for dependent in state.graph.transitive_dependents(&id) {
                if state.store.get(&dependent).map(|item| item.status)
                    != Some(ItemStatus::Pending)
                {
                    continue;
                }
                let reason = format!("blocked by failed item {}: {}", id, detail);
                match state.store.mark_blocked(&dependent, reason.clone()) {
                    Ok(()) => {
                        self.metrics.record_item_blocked();
                        self.emit(
                            "item_blocked",
                            json!({ "item": dependent, "reason": reason }),
                        );
                    }
                    Err(err) => {
                        warn!(item = dependent.as_str(), error = %err, "block not recorded")
                    }
                }
            }
            failed.push(id);
        }

        let status = if failed.is_empty() {
            BatchStatus::Complete
        } else {
            BatchStatus::PartiallyFailed
        };
        if let Some(entry) = state.batches.iter_mut().find(|entry| entry.id == batch_id) {
            entry.status = status;
        }
        drop(state);

        BatchResult {
            batch_id,
            status,
            completed,
            retried,
            failed,
        }
    }

    async fn checkpoint(&self, trigger: CheckpointTrigger) -> Checkpoint {
        Checkpoint {
            trigger,
            snapshot: self.state().await,
        }
    }

    async fn failure_reasons(&self, result: &BatchResult) -> Vec<(String, String)> {
        let state = self.state.read().await;
        result
            .failed
            .iter()
            .map(|id| {
                let reason = state
                    .store
                    .get(id)
                    .and_then(|item| item.status_reason.clone())
                    .unwrap_or_else(|| "execution failed".to_string());
                (id.clone(), reason)
            })
            .collect()
    }

    async fn apply_decision(&self, decision: CheckpointDecision) -> Flow {
        match decision {
            CheckpointDecision::Approve => Flow::Continue,
            CheckpointDecision::Reject => {
                info!(run = %self.run_id, "checkpoint rejected the run");
                Flow::Stop
            }
            CheckpointDecision::Modify { reset } => {
                self.apply_resets(&reset).await;
                Flow::Continue
            }
        }
    }

    /// Reset the named items to `Pending`, re-validating the affected
    /// subgraph for cycles first. Returns how many resets were accepted.
    async fn apply_resets(&self, reset: &[String]) -> usize {
        let mut state = self.state.write().await;
        let mut applied = 0;
        for id in reset {
            let cycles = detect_cycles_from(&state.graph, std::slice::from_ref(id));
            if !cycles.is_empty() {
                warn!(item = id.as_str(), "reset refused: would reintroduce a cycle");
                continue;
            }
            match state.store.reset_item(id) {
                Ok(()) => {
                    self.emit("item_reset", json!({ "item": id }));
                    applied += 1;
                }
                Err(err) => warn!(item = id.as_str(), error = %err, "reset refused"),
            }
        }
        applied
    }

    fn emit(&self, kind: &str, payload: serde_json::Value) {
        if let Some(log) = &self.events {
            log.emit(kind, payload);
        }
    }
}
