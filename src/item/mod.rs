//! Work-item model: the unit of schedulable work and its lifecycle.

pub mod store;

use std::collections::BTreeSet;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

pub use store::{ProgressSummary, WorkItemStore};

/// Lifecycle states of a work item.
///
/// Items only move forward (`Pending -> Ready -> Scheduled -> Running ->
/// Complete | Failed | Blocked`). The two sanctioned backward edges are
/// `Running -> Pending` (bounded retry) and the manual resets
/// `Failed -> Pending` / `Blocked -> Pending`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ItemStatus {
    /// Loaded, waiting for dependencies.
    Pending,
    /// All dependencies satisfied; selected for the next batch.
    Ready,
    /// Assigned to a batch, not yet dispatched.
    Scheduled,
    /// Dispatched to the executor.
    Running,
    /// Parked pending manual clearance (escalated conflict or failed
    /// dependency).
    Blocked,
    /// Retries exhausted; terminal until manually reset.
    Failed,
    /// Terminal success.
    Complete,
}

impl ItemStatus {
    /// Whether this status requires no further scheduling work.
    pub fn is_terminal(&self) -> bool {
        matches!(self, ItemStatus::Complete | ItemStatus::Failed)
    }

    /// Whether the transition `self -> next` is legal.
    pub fn can_transition_to(&self, next: ItemStatus) -> bool {
        use ItemStatus::*;
        matches!(
            (self, next),
            (Pending, Ready)
                | (Pending, Blocked)
                | (Ready, Scheduled)
                | (Scheduled, Running)
                | (Running, Complete)
                | (Running, Failed)
                | (Running, Pending)
                | (Blocked, Pending)
                | (Failed, Pending)
        )
    }

    /// Short lowercase label for logs and event payloads.
    pub fn as_label(&self) -> &'static str {
        match self {
            ItemStatus::Pending => "pending",
            ItemStatus::Ready => "ready",
            ItemStatus::Scheduled => "scheduled",
            ItemStatus::Running => "running",
            ItemStatus::Blocked => "blocked",
            ItemStatus::Failed => "failed",
            ItemStatus::Complete => "complete",
        }
    }
}

/// Input tuple for loading a work item, as produced by the upstream
/// item-generation collaborator.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkItemSpec {
    /// Stable, opaque identifier.
    pub id: String,
    /// Ids that must reach `Complete` before this item is eligible.
    #[serde(default)]
    pub depends_on: BTreeSet<String>,
    /// Resource keys (e.g. file paths) this item will mutate. Used only for
    /// conflict detection, never for dependency ordering.
    #[serde(default)]
    pub resources: BTreeSet<String>,
    /// Ordinal hint; higher runs first when items become ready together.
    #[serde(default)]
    pub priority: i32,
}

impl WorkItemSpec {
    /// Convenience constructor for tests and embedders.
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            ..Self::default()
        }
    }

    /// Add a dependency id.
    pub fn depends_on(mut self, id: impl Into<String>) -> Self {
        self.depends_on.insert(id.into());
        self
    }

    /// Add a resource key.
    pub fn resource(mut self, key: impl Into<String>) -> Self {
        self.resources.insert(key.into());
        self
    }

    /// Set the priority hint.
    pub fn priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }
}

/// A work item with its tracked scheduling state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkItem {
    /// Stable, opaque identifier.
    pub id: String,
    /// Ids that must reach `Complete` before this item is eligible.
    pub depends_on: BTreeSet<String>,
    /// Declared resource footprint.
    pub resources: BTreeSet<String>,
    /// Tie-break hint; higher runs first.
    pub priority: i32,
    /// Current lifecycle state.
    pub status: ItemStatus,
    /// Why the item is `Blocked` or `Failed`, when it is.
    pub status_reason: Option<String>,
    /// Batch that last scheduled this item.
    pub batch_id: Option<u64>,
    /// Execution attempts so far.
    pub retry_count: u32,
    /// Earliest time a retried item may re-enter the frontier.
    pub retry_eligible_at: Option<DateTime<Utc>>,
    /// When the item was loaded.
    pub created_at: DateTime<Utc>,
    /// Last state change.
    pub updated_at: DateTime<Utc>,
}

impl WorkItem {
    pub(crate) fn from_spec(spec: WorkItemSpec) -> Self {
        let now = Utc::now();
        Self {
            id: spec.id,
            depends_on: spec.depends_on,
            resources: spec.resources,
            priority: spec.priority,
            status: ItemStatus::Pending,
            status_reason: None,
            batch_id: None,
            retry_count: 0,
            retry_eligible_at: None,
            created_at: now,
            updated_at: now,
        }
    }

    /// Whether the retry backoff window (if any) has elapsed at `now`.
    pub fn retry_eligible(&self, now: DateTime<Utc>) -> bool {
        match self.retry_eligible_at {
            Some(at) => now >= at,
            None => true,
        }
    }
}
