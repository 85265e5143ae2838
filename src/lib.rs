//! Convoy: a dependency-aware work-item scheduler with conflict detection.
//!
//! Upstream collaborators load a set of work items with declared
//! dependencies and declared resource footprints; convoy validates the set
//! (references, duplicates, cycles), partitions it into ordered batches
//! bounded by a parallelism cap, detects resource conflicts between items
//! that would otherwise run concurrently, and drives execution through an
//! external [`scheduler::WorkExecutor`], with bounded retries, failure
//! propagation, and human checkpoints via a
//! [`scheduler::CheckpointNotifier`].
//!
//! ```no_run
//! use std::sync::Arc;
//!
//! use convoy::config::SchedulerConfig;
//! use convoy::item::WorkItemSpec;
//! use convoy::scheduler::{AutoApprove, ItemOutcome, Scheduler, WorkExecutor};
//!
//! struct Touch;
//!
//! #[async_trait::async_trait]
//! impl WorkExecutor for Touch {
//!     async fn execute(&self, _item: &convoy::item::WorkItem) -> ItemOutcome {
//!         ItemOutcome::success()
//!     }
//! }
//!
//! # async fn demo() -> Result<(), Box<dyn std::error::Error>> {
//! let items = vec![
//!     WorkItemSpec::new("build"),
//!     WorkItemSpec::new("test").depends_on("build"),
//! ];
//! let scheduler = Scheduler::new(items, SchedulerConfig::default())?;
//! let result = scheduler.run(Arc::new(Touch), &AutoApprove).await;
//! assert!(result.all_complete);
//! # Ok(())
//! # }
//! ```

pub mod batch;
pub mod config;
pub mod conflict;
pub mod error;
pub mod events;
pub mod graph;
pub mod item;
pub mod metrics;
pub mod scheduler;

pub use batch::{Batch, BatchPlanner, BatchStatus, PlanOutcome, PlannedRound};
pub use config::{ClassifierConfig, SchedulerConfig};
pub use conflict::{ConflictRecord, ConflictTier, PatternClassifier, ResourceClassifier};
pub use error::{PlanError, StoreError};
pub use graph::DependencyGraph;
pub use item::{ItemStatus, ProgressSummary, WorkItem, WorkItemSpec, WorkItemStore};
pub use scheduler::{
    AutoApprove, BatchResult, CancelHandle, Checkpoint, CheckpointDecision, CheckpointNotifier,
    CheckpointTrigger, ItemOutcome, RetryPolicy, RunResult, Scheduler, SchedulerBuildError,
    StateSnapshot, WorkExecutor,
};
