//! Integration tests driving full planning runs against stub executors.
//!
//! These cover the end-to-end flow: graph validation, batching order,
//! conflict resolution, retries, failure propagation, checkpoints,
//! cancellation, and the durable event log.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;

use convoy::config::{ClassifierConfig, SchedulerConfig};
use convoy::error::PlanError;
use convoy::item::{ItemStatus, WorkItem, WorkItemSpec};
use convoy::scheduler::{
    AutoApprove, Checkpoint, CheckpointDecision, CheckpointNotifier, CheckpointTrigger,
    ItemOutcome, RetryPolicy, Scheduler, SchedulerBuildError, StateSnapshot, WorkExecutor,
};

/// Executor that records execution order, tracks concurrency, and fails
/// scripted items a fixed number of times before succeeding.
struct ScriptedExecutor {
    order: Mutex<Vec<String>>,
    failures_left: Mutex<HashMap<String, u32>>,
    delay: Duration,
    active: AtomicUsize,
    max_active: AtomicUsize,
    watched: HashSet<String>,
    watched_active: AtomicUsize,
    watched_max: AtomicUsize,
}

impl ScriptedExecutor {
    fn new() -> Self {
        Self {
            order: Mutex::new(Vec::new()),
            failures_left: Mutex::new(HashMap::new()),
            delay: Duration::ZERO,
            active: AtomicUsize::new(0),
            max_active: AtomicUsize::new(0),
            watched: HashSet::new(),
            watched_active: AtomicUsize::new(0),
            watched_max: AtomicUsize::new(0),
        }
    }

    /// Fail each listed item the given number of times before succeeding.
    fn failing(failures: &[(&str, u32)]) -> Self {
        let executor = Self::new();
        {
            let mut left = executor.failures_left.lock().unwrap();
            for (id, count) in failures {
                left.insert((*id).to_string(), *count);
            }
        }
        executor
    }

    fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    /// Track peak concurrency among the listed items specifically.
    fn watching(mut self, ids: &[&str]) -> Self {
        self.watched = ids.iter().map(|id| (*id).to_string()).collect();
        self
    }

    fn order(&self) -> Vec<String> {
        self.order.lock().unwrap().clone()
    }

    fn max_concurrency(&self) -> usize {
        self.max_active.load(Ordering::SeqCst)
    }

    fn watched_max_concurrency(&self) -> usize {
        self.watched_max.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl WorkExecutor for ScriptedExecutor {
    async fn execute(&self, item: &WorkItem) -> ItemOutcome {
        self.order.lock().unwrap().push(item.id.clone());

        let current = self.active.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_active.fetch_max(current, Ordering::SeqCst);
        let watched = self.watched.contains(&item.id);
        if watched {
            let current = self.watched_active.fetch_add(1, Ordering::SeqCst) + 1;
            self.watched_max.fetch_max(current, Ordering::SeqCst);
        }

        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }

        if watched {
            self.watched_active.fetch_sub(1, Ordering::SeqCst);
        }
        self.active.fetch_sub(1, Ordering::SeqCst);

        let mut failures = self.failures_left.lock().unwrap();
        if let Some(left) = failures.get_mut(item.id.as_str()) {
            if *left > 0 {
                *left -= 1;
                return ItemOutcome::failure("scripted failure");
            }
        }
        ItemOutcome::success()
    }
}

type DecideFn = dyn Fn(&CheckpointTrigger) -> CheckpointDecision + Send + Sync;

/// Notifier that records every trigger and answers via a closure.
struct RecordingNotifier {
    triggers: Mutex<Vec<CheckpointTrigger>>,
    decide: Box<DecideFn>,
}

impl RecordingNotifier {
    fn approving() -> Self {
        Self::with(|_| CheckpointDecision::Approve)
    }

    fn with(
        decide: impl Fn(&CheckpointTrigger) -> CheckpointDecision + Send + Sync + 'static,
    ) -> Self {
        Self {
            triggers: Mutex::new(Vec::new()),
            decide: Box::new(decide),
        }
    }

    fn triggers(&self) -> Vec<CheckpointTrigger> {
        self.triggers.lock().unwrap().clone()
    }
}

#[async_trait]
impl CheckpointNotifier for RecordingNotifier {
    async fn notify(&self, checkpoint: Checkpoint) -> CheckpointDecision {
        self.triggers.lock().unwrap().push(checkpoint.trigger.clone());
        (self.decide)(&checkpoint.trigger)
    }
}

fn find_item<'a>(snapshot: &'a StateSnapshot, id: &str) -> &'a WorkItem {
    snapshot
        .items
        .iter()
        .find(|item| item.id == id)
        .unwrap_or_else(|| panic!("item {} missing from snapshot", id))
}

fn fast_config() -> SchedulerConfig {
    SchedulerConfig::new().with_retry(RetryPolicy::immediate(2))
}

// ============================================================================
// Ordering and Batching
// ============================================================================

#[tokio::test]
async fn test_linear_chain_runs_in_dependency_order() {
    let items = vec![
        WorkItemSpec::new("c").depends_on("b"),
        WorkItemSpec::new("a"),
        WorkItemSpec::new("b").depends_on("a"),
    ];
    let scheduler = Scheduler::new(items, fast_config()).expect("scheduler");
    let executor = Arc::new(ScriptedExecutor::new());

    let result = scheduler.run(executor.clone(), &AutoApprove).await;

    assert!(result.all_complete);
    assert_eq!(result.batches_planned, 3);
    assert_eq!(executor.order(), vec!["a", "b", "c"]);
}

#[tokio::test]
async fn test_independent_items_share_one_batch() {
    let items = vec![
        WorkItemSpec::new("a"),
        WorkItemSpec::new("b"),
        WorkItemSpec::new("c"),
    ];
    let scheduler = Scheduler::new(items, fast_config()).expect("scheduler");
    let executor = Arc::new(ScriptedExecutor::new().with_delay(Duration::from_millis(25)));

    let result = scheduler.run(executor.clone(), &AutoApprove).await;

    assert!(result.all_complete);
    assert_eq!(result.batches_planned, 1);
    // All three were in flight at once.
    assert_eq!(executor.max_concurrency(), 3);
}

#[tokio::test]
async fn test_parallelism_cap_splits_batches() {
    let items = vec![
        WorkItemSpec::new("a"),
        WorkItemSpec::new("b"),
        WorkItemSpec::new("c"),
        WorkItemSpec::new("d"),
    ];
    let config = fast_config().with_parallelism_cap(2);
    let scheduler = Scheduler::new(items, config).expect("scheduler");
    let executor = Arc::new(ScriptedExecutor::new().with_delay(Duration::from_millis(10)));

    let result = scheduler.run(executor.clone(), &AutoApprove).await;

    assert!(result.all_complete);
    assert_eq!(result.batches_planned, 2);
    assert!(executor.max_concurrency() <= 2);
}

#[tokio::test]
async fn test_priority_orders_equal_siblings() {
    let items = vec![
        WorkItemSpec::new("low").priority(1),
        WorkItemSpec::new("high").priority(9),
    ];
    let config = fast_config().with_parallelism_cap(1);
    let scheduler = Scheduler::new(items, config).expect("scheduler");
    let executor = Arc::new(ScriptedExecutor::new());

    let result = scheduler.run(executor.clone(), &AutoApprove).await;

    assert!(result.all_complete);
    assert_eq!(executor.order(), vec!["high", "low"]);
}

// ============================================================================
// Retry and Failure Propagation
// ============================================================================

#[tokio::test]
async fn test_item_retries_then_completes() {
    // Fails twice within a budget of 2 retries, succeeds on the third
    // attempt; the dependent only runs after that attempt resolves.
    let items = vec![
        WorkItemSpec::new("z"),
        WorkItemSpec::new("dep").depends_on("z"),
    ];
    let scheduler = Scheduler::new(items, fast_config()).expect("scheduler");
    let executor = Arc::new(ScriptedExecutor::failing(&[("z", 2)]));

    let result = scheduler.run(executor.clone(), &AutoApprove).await;

    assert!(result.all_complete);
    assert_eq!(executor.order(), vec!["z", "z", "z", "dep"]);

    let snapshot = scheduler.state().await;
    let z = find_item(&snapshot, "z");
    assert_eq!(z.status, ItemStatus::Complete);
    assert_eq!(z.retry_count, 2);
}

#[tokio::test]
async fn test_exhausted_retries_block_transitive_dependents() {
    // Fails three times against a budget of 2: terminal failure, and both
    // the direct and transitive dependents are blocked with a reason
    // naming the root.
    let items = vec![
        WorkItemSpec::new("w"),
        WorkItemSpec::new("child").depends_on("w"),
        WorkItemSpec::new("grandchild").depends_on("child"),
        WorkItemSpec::new("unrelated"),
    ];
    let scheduler = Scheduler::new(items, fast_config()).expect("scheduler");
    let executor = Arc::new(ScriptedExecutor::failing(&[("w", 3)]));
    let notifier = RecordingNotifier::approving();

    let result = scheduler.run(executor.clone(), &notifier).await;

    assert!(!result.all_complete);
    assert_eq!(result.items_failed, 1);
    assert_eq!(result.items_blocked, 2);
    assert_eq!(result.items_complete, 1);

    let snapshot = scheduler.state().await;
    assert_eq!(find_item(&snapshot, "w").status, ItemStatus::Failed);
    for id in ["child", "grandchild"] {
        let item = find_item(&snapshot, id);
        assert_eq!(item.status, ItemStatus::Blocked);
        let reason = item.status_reason.as_deref().expect("blocked reason");
        assert!(reason.contains("w"), "reason should name the root: {}", reason);
    }
    assert_eq!(find_item(&snapshot, "unrelated").status, ItemStatus::Complete);

    // The terminal failure was surfaced through the notifier.
    assert!(notifier
        .triggers()
        .iter()
        .any(|trigger| matches!(trigger, CheckpointTrigger::ItemFailed { item_id, .. } if item_id == "w")));
}

#[tokio::test]
async fn test_sibling_items_survive_a_failure() {
    let items = vec![
        WorkItemSpec::new("bad"),
        WorkItemSpec::new("good-1"),
        WorkItemSpec::new("good-2"),
    ];
    let config = SchedulerConfig::new().with_retry(RetryPolicy::none());
    let scheduler = Scheduler::new(items, config).expect("scheduler");
    let executor = Arc::new(ScriptedExecutor::failing(&[("bad", 1)]));

    let result = scheduler.run(executor.clone(), &AutoApprove).await;

    assert!(!result.all_complete);
    assert_eq!(result.items_complete, 2);
    assert_eq!(result.items_failed, 1);

    // The shared batch folded to partially failed.
    let snapshot = scheduler.state().await;
    assert_eq!(
        snapshot.batches[0].status,
        convoy::batch::BatchStatus::PartiallyFailed
    );
}

// ============================================================================
// Conflict Resolution
// ============================================================================

#[tokio::test]
async fn test_sequential_conflict_spreads_across_batches() {
    // A -> {B, C} where B and C both write file.json, classified
    // Sequential: batch 1 = [A], batch 2 = [B], batch 3 = [C].
    let classifier = ClassifierConfig {
        sequential_patterns: vec![r"^file\.json$".to_string()],
        escalate_patterns: Vec::new(),
    };
    let items = vec![
        WorkItemSpec::new("A"),
        WorkItemSpec::new("B").depends_on("A").resource("file.json"),
        WorkItemSpec::new("C").depends_on("A").resource("file.json"),
    ];
    let config = fast_config().with_classifier(classifier);
    let scheduler = Scheduler::new(items, config).expect("scheduler");
    let executor = Arc::new(ScriptedExecutor::new());

    let result = scheduler.run(executor.clone(), &AutoApprove).await;

    assert!(result.all_complete);
    assert_eq!(result.batches_planned, 3);
    assert_eq!(executor.order(), vec!["A", "B", "C"]);

    let snapshot = scheduler.state().await;
    assert_eq!(snapshot.batches[1].item_ids, vec!["B"]);
    assert_eq!(snapshot.batches[2].item_ids, vec!["C"]);
}

#[tokio::test]
async fn test_retry_tier_conflict_serializes_within_batch() {
    // Two writers of the same source file stay in one batch but never
    // overlap; the independent third item is free to run alongside.
    let items = vec![
        WorkItemSpec::new("s1").resource("src/shared.rs"),
        WorkItemSpec::new("s2").resource("src/shared.rs"),
        WorkItemSpec::new("free"),
    ];
    let scheduler = Scheduler::new(items, fast_config()).expect("scheduler");
    let executor = Arc::new(
        ScriptedExecutor::new()
            .with_delay(Duration::from_millis(30))
            .watching(&["s1", "s2"]),
    );

    let result = scheduler.run(executor.clone(), &AutoApprove).await;

    assert!(result.all_complete);
    assert_eq!(result.batches_planned, 1);
    assert_eq!(executor.watched_max_concurrency(), 1);
    assert!(executor.max_concurrency() >= 2);
}

#[tokio::test]
async fn test_escalated_conflict_blocks_and_stalls() {
    let classifier = ClassifierConfig {
        sequential_patterns: Vec::new(),
        escalate_patterns: vec![r"^db/schema\.sql$".to_string()],
    };
    let items = vec![
        WorkItemSpec::new("e1").resource("db/schema.sql"),
        WorkItemSpec::new("e2").resource("db/schema.sql"),
    ];
    let config = fast_config().with_classifier(classifier);
    let scheduler = Scheduler::new(items, config).expect("scheduler");
    let executor = Arc::new(ScriptedExecutor::new());
    let notifier = RecordingNotifier::approving();

    let result = scheduler.run(executor.clone(), &notifier).await;

    assert!(!result.all_complete);
    assert_eq!(result.items_blocked, 2);
    assert!(matches!(result.error, Some(PlanError::Stalled { .. })));
    // Nothing was executed.
    assert!(executor.order().is_empty());

    let triggers = notifier.triggers();
    let escalations = triggers
        .iter()
        .filter(|trigger| matches!(trigger, CheckpointTrigger::ConflictEscalated { .. }))
        .count();
    assert_eq!(escalations, 2);
    assert!(triggers
        .iter()
        .any(|trigger| matches!(trigger, CheckpointTrigger::Stalled { .. })));
}

#[tokio::test]
async fn test_stall_checkpoint_can_reset_an_item() {
    // The reviewer answers the first stall by resetting e1; it then runs
    // alone (no remaining conflict) while e2 stays blocked.
    let classifier = ClassifierConfig {
        sequential_patterns: Vec::new(),
        escalate_patterns: vec![r"^db/schema\.sql$".to_string()],
    };
    let items = vec![
        WorkItemSpec::new("e1").resource("db/schema.sql"),
        WorkItemSpec::new("e2").resource("db/schema.sql"),
    ];
    let config = fast_config().with_classifier(classifier);
    let scheduler = Scheduler::new(items, config).expect("scheduler");
    let executor = Arc::new(ScriptedExecutor::new());

    let stalls = AtomicUsize::new(0);
    let notifier = RecordingNotifier::with(move |trigger| match trigger {
        CheckpointTrigger::Stalled { .. } => {
            if stalls.fetch_add(1, Ordering::SeqCst) == 0 {
                CheckpointDecision::Modify {
                    reset: vec!["e1".to_string()],
                }
            } else {
                CheckpointDecision::Approve
            }
        }
        _ => CheckpointDecision::Approve,
    });

    let result = scheduler.run(executor.clone(), &notifier).await;

    assert_eq!(executor.order(), vec!["e1"]);
    assert_eq!(result.items_complete, 1);
    assert_eq!(result.items_blocked, 1);
    assert!(matches!(result.error, Some(PlanError::Stalled { ref blocked, .. }) if blocked == &vec!["e2".to_string()]));
}

// ============================================================================
// Checkpoints, Cancellation, Manual Clearance
// ============================================================================

#[tokio::test]
async fn test_rejected_checkpoint_stops_the_run() {
    let items = vec![WorkItemSpec::new("a"), WorkItemSpec::new("b")];
    let config = fast_config().with_parallelism_cap(1);
    let scheduler = Scheduler::new(items, config).expect("scheduler");
    let executor = Arc::new(ScriptedExecutor::new());
    let notifier = RecordingNotifier::with(|trigger| match trigger {
        CheckpointTrigger::BatchComplete { .. } => CheckpointDecision::Reject,
        _ => CheckpointDecision::Approve,
    });

    let result = scheduler.run(executor.clone(), &notifier).await;

    assert!(result.rejected);
    assert!(!result.all_complete);
    assert_eq!(executor.order(), vec!["a"]);

    let snapshot = scheduler.state().await;
    assert_eq!(find_item(&snapshot, "b").status, ItemStatus::Pending);
}

#[tokio::test]
async fn test_cancellation_between_batches() {
    let items = vec![WorkItemSpec::new("a"), WorkItemSpec::new("b")];
    let scheduler = Scheduler::new(items, fast_config()).expect("scheduler");
    let executor = Arc::new(ScriptedExecutor::new());

    scheduler.cancel_handle().cancel();
    let result = scheduler.run(executor.clone(), &AutoApprove).await;

    assert!(result.cancelled);
    assert!(executor.order().is_empty());
}

#[tokio::test]
async fn test_clear_item_allows_a_second_run() {
    let items = vec![WorkItemSpec::new("a")];
    let config = SchedulerConfig::new().with_retry(RetryPolicy::none());
    let scheduler = Scheduler::new(items, config).expect("scheduler");
    let executor = Arc::new(ScriptedExecutor::failing(&[("a", 1)]));

    let result = scheduler.run(executor.clone(), &AutoApprove).await;
    assert_eq!(result.items_failed, 1);

    scheduler.clear_item("a").await.expect("clear");
    let result = scheduler.run(executor.clone(), &AutoApprove).await;
    assert!(result.all_complete);

    // Batch ids stay monotonic across the resumed run.
    let snapshot = scheduler.state().await;
    let ids: Vec<u64> = snapshot.batches.iter().map(|batch| batch.id).collect();
    assert_eq!(ids, vec![1, 2]);
}

// ============================================================================
// Structural Validation
// ============================================================================

#[tokio::test]
async fn test_cycle_rejected_before_any_batch() {
    let items = vec![
        WorkItemSpec::new("x").depends_on("y"),
        WorkItemSpec::new("y").depends_on("x"),
    ];
    let err = Scheduler::new(items, SchedulerConfig::default()).err().expect("cycle error");
    match err {
        SchedulerBuildError::Plan(PlanError::CircularDependency { cycles }) => {
            assert_eq!(cycles, vec![vec!["x".to_string(), "y".to_string()]]);
        }
        other => panic!("expected circular dependency, got {:?}", other),
    }
}

#[tokio::test]
async fn test_unknown_dependency_rejected_on_load() {
    let items = vec![WorkItemSpec::new("a").depends_on("ghost")];
    let err = Scheduler::new(items, SchedulerConfig::default()).err().expect("load error");
    assert!(matches!(
        err,
        SchedulerBuildError::Plan(PlanError::UnknownDependency { .. })
    ));
}

// ============================================================================
// Snapshots and Event Log
// ============================================================================

#[tokio::test]
async fn test_snapshot_reflects_the_finished_run() {
    let items = vec![
        WorkItemSpec::new("a"),
        WorkItemSpec::new("b").depends_on("a"),
    ];
    let scheduler = Scheduler::new(items, fast_config()).expect("scheduler");
    let executor = Arc::new(ScriptedExecutor::new());

    scheduler.run(executor, &AutoApprove).await;

    let snapshot = scheduler.state().await;
    assert!(snapshot
        .items
        .iter()
        .all(|item| item.status == ItemStatus::Complete));
    assert!(snapshot
        .batches
        .iter()
        .all(|batch| batch.status == convoy::batch::BatchStatus::Complete));
    assert_eq!(snapshot.edges, vec![("b".to_string(), "a".to_string())]);
    assert_eq!(snapshot.progress.complete, 2);
    assert!((snapshot.progress.completion_percent - 100.0).abs() < f64::EPSILON);
}

#[tokio::test]
async fn test_event_log_records_the_run() {
    let dir = tempfile::TempDir::new().expect("temp dir");
    let items = vec![WorkItemSpec::new("a")];
    let config = fast_config().with_event_log_dir(dir.path());
    let scheduler = Scheduler::new(items, config).expect("scheduler");
    let executor = Arc::new(ScriptedExecutor::new());

    scheduler.run(executor, &AutoApprove).await;

    let events_path = dir
        .path()
        .join("runs")
        .join(scheduler.run_id())
        .join("events.jsonl");
    let contents = std::fs::read_to_string(&events_path).expect("events written");
    let kinds: Vec<String> = contents
        .lines()
        .map(|line| {
            serde_json::from_str::<serde_json::Value>(line).expect("valid json")["kind"]
                .as_str()
                .expect("kind")
                .to_string()
        })
        .collect();

    assert_eq!(kinds.first().map(String::as_str), Some("run_start"));
    assert!(kinds.iter().any(|kind| kind == "batch_planned"));
    assert!(kinds.iter().any(|kind| kind == "item_complete"));
    assert_eq!(kinds.last().map(String::as_str), Some("run_complete"));
}
