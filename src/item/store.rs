//! In-memory store owning all work items for a planning run.
//!
//! The store is the single mutation point for item state: the coordination
//! task calls the `mark_*` transitions, every other component reads
//! snapshots. All transitions are validated against the item state machine.

use std::collections::BTreeMap;
use std::time::Duration;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{PlanError, StoreError};
use crate::item::{ItemStatus, WorkItem, WorkItemSpec};

/// Read-model of overall progress, derived from item statuses.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProgressSummary {
    /// Total items loaded.
    pub total: usize,
    /// Items that reached `Complete`.
    pub complete: usize,
    /// Items currently `Scheduled` or `Running`.
    pub in_progress: usize,
    /// Items parked as `Blocked`.
    pub blocked: usize,
    /// Items terminally `Failed`.
    pub failed: usize,
    /// Items still `Pending` or `Ready`.
    pub pending: usize,
    /// Completion percentage (0.0 - 100.0).
    pub completion_percent: f64,
}

/// Owns every [`WorkItem`] for one planning run.
#[derive(Debug, Clone, Default)]
pub struct WorkItemStore {
    items: BTreeMap<String, WorkItem>,
}

impl WorkItemStore {
    /// Load and validate a set of item specs.
    ///
    /// Rejects duplicate ids, self-dependencies, and dependencies on ids
    /// that are not part of the set. Nothing is scheduled if validation
    /// fails.
    pub fn load(specs: Vec<WorkItemSpec>) -> Result<Self, PlanError> {
        let mut items = BTreeMap::new();

        for spec in specs {
            if spec.depends_on.contains(&spec.id) {
                return Err(PlanError::SelfDependency { id: spec.id });
            }
            let id = spec.id.clone();
            if items.insert(id.clone(), WorkItem::from_spec(spec)).is_some() {
                return Err(PlanError::DuplicateItem { id });
            }
        }

        // Dependency references can only be checked once every id is known.
        for item in items.values() {
            for dep in &item.depends_on {
                if !items.contains_key(dep) {
                    return Err(PlanError::UnknownDependency {
                        item: item.id.clone(),
                        dependency: dep.clone(),
                    });
                }
            }
        }

        debug!(items = items.len(), "work item store loaded");
        Ok(Self { items })
    }

    /// Number of items in the store.
    pub fn len(&self) -> usize {
        self.items.len()
    }

    /// Whether the store holds no items.
    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    /// Look up a single item.
    pub fn get(&self, id: &str) -> Option<&WorkItem> {
        self.items.get(id)
    }

    /// Iterate items in id order.
    pub fn items(&self) -> impl Iterator<Item = &WorkItem> {
        self.items.values()
    }

    /// Ids of items whose status matches `status`, in id order.
    pub fn ids_with_status(&self, status: ItemStatus) -> Vec<String> {
        self.items
            .values()
            .filter(|item| item.status == status)
            .map(|item| item.id.clone())
            .collect()
    }

    fn transition(
        &mut self,
        id: &str,
        next: ItemStatus,
        reason: Option<String>,
    ) -> Result<(), StoreError> {
        let item = self.items.get_mut(id).ok_or_else(|| StoreError::UnknownItem {
            id: id.to_string(),
        })?;
        if !item.status.can_transition_to(next) {
            return Err(StoreError::InvalidTransition {
                id: id.to_string(),
                from: item.status.as_label().to_string(),
                to: next.as_label().to_string(),
            });
        }
        debug!(
            item = id,
            from = item.status.as_label(),
            to = next.as_label(),
            "item transition"
        );
        item.status = next;
        item.status_reason = reason;
        item.updated_at = Utc::now();
        Ok(())
    }

    /// `Pending -> Ready`.
    pub fn mark_ready(&mut self, id: &str) -> Result<(), StoreError> {
        self.transition(id, ItemStatus::Ready, None)
    }

    /// `Ready -> Scheduled`, recording the assigning batch.
    pub fn mark_scheduled(&mut self, id: &str, batch_id: u64) -> Result<(), StoreError> {
        self.transition(id, ItemStatus::Scheduled, None)?;
        if let Some(item) = self.items.get_mut(id) {
            item.batch_id = Some(batch_id);
        }
        Ok(())
    }

    /// `Scheduled -> Running`.
    pub fn mark_running(&mut self, id: &str) -> Result<(), StoreError> {
        self.transition(id, ItemStatus::Running, None)
    }

    /// `Running -> Complete`. Clears any retry backoff.
    pub fn mark_complete(&mut self, id: &str) -> Result<(), StoreError> {
        self.transition(id, ItemStatus::Complete, None)?;
        if let Some(item) = self.items.get_mut(id) {
            item.retry_eligible_at = None;
        }
        Ok(())
    }

    /// `Running -> Failed` with a terminal reason.
    pub fn mark_failed(&mut self, id: &str, reason: impl Into<String>) -> Result<(), StoreError> {
        self.transition(id, ItemStatus::Failed, Some(reason.into()))
    }

    /// `Pending -> Blocked` with a reason (escalated conflict or failed
    /// dependency).
    pub fn mark_blocked(&mut self, id: &str, reason: impl Into<String>) -> Result<(), StoreError> {
        self.transition(id, ItemStatus::Blocked, Some(reason.into()))
    }

    /// `Running -> Pending` after a recoverable failure. Increments the
    /// attempt counter and opens a backoff window of `delay`.
    ///
    /// Returns the new retry count.
    pub fn record_retry(&mut self, id: &str, delay: Duration) -> Result<u32, StoreError> {
        self.transition(id, ItemStatus::Pending, None)?;
        let item = self.items.get_mut(id).ok_or_else(|| StoreError::UnknownItem {
            id: id.to_string(),
        })?;
        item.retry_count += 1;
        item.retry_eligible_at = if delay.is_zero() {
            None
        } else {
            let delay = chrono::Duration::from_std(delay).unwrap_or_else(|_| chrono::Duration::zero());
            Some(Utc::now() + delay)
        };
        Ok(item.retry_count)
    }

    /// Manual reset: `Failed | Blocked -> Pending`.
    ///
    /// Clears the status reason, retry bookkeeping, and batch assignment so
    /// the item re-enters planning as if fresh. Callers must re-validate the
    /// graph for cycles before planning resumes.
    pub fn reset_item(&mut self, id: &str) -> Result<(), StoreError> {
        self.transition(id, ItemStatus::Pending, None)?;
        if let Some(item) = self.items.get_mut(id) {
            item.retry_count = 0;
            item.retry_eligible_at = None;
            item.batch_id = None;
        }
        Ok(())
    }

    /// Progress counters for dashboards and checkpoint payloads.
    pub fn progress_summary(&self) -> ProgressSummary {
        let total = self.items.len();
        let mut complete = 0;
        let mut in_progress = 0;
        let mut blocked = 0;
        let mut failed = 0;
        let mut pending = 0;
        for item in self.items.values() {
            match item.status {
                ItemStatus::Complete => complete += 1,
                ItemStatus::Scheduled | ItemStatus::Running => in_progress += 1,
                ItemStatus::Blocked => blocked += 1,
                ItemStatus::Failed => failed += 1,
                ItemStatus::Pending | ItemStatus::Ready => pending += 1,
            }
        }
        let completion_percent = if total == 0 {
            0.0
        } else {
            (complete as f64 / total as f64) * 100.0
        };
        ProgressSummary {
            total,
            complete,
            in_progress,
            blocked,
            failed,
            pending,
            completion_percent,
        }
    }

    /// Clone of every item, in id order, for read-only snapshots.
    pub fn snapshot_items(&self) -> Vec<WorkItem> {
        self.items.values().cloned().collect()
    }
}
