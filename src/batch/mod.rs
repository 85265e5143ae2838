//! Batch model and the batch partitioner.
//!
//! Each planning round extracts the ready frontier, lets the conflict
//! detector annotate it, applies the tier resolutions, and emits one ordered
//! batch bounded by the parallelism cap: a level-order topological traversal
//! modified only by conflict deferrals and the cap.

use std::collections::{BTreeMap, HashSet};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::conflict::{detect_conflicts, scheduling_cmp, ConflictTier, ResourceClassifier};
use crate::error::PlanError;
use crate::graph::DependencyGraph;
use crate::item::{ItemStatus, WorkItem, WorkItemStore};

/// Lifecycle of a batch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BatchStatus {
    /// Emitted by the partitioner, not yet dispatched.
    Planned,
    /// Handed to the executor.
    Executing,
    /// Every item resolved without a terminal failure.
    Complete,
    /// At least one item failed terminally.
    PartiallyFailed,
}

/// An ordered group of items scheduled together in one round.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Batch {
    /// Monotonically increasing sequence number.
    pub id: u64,
    /// Items assigned to this batch, in scheduling order.
    pub item_ids: Vec<String>,
    /// Maximum concurrent executions for this batch.
    pub parallelism_cap: usize,
    /// Current batch state; mutated only by the scheduler.
    pub status: BatchStatus,
    /// `Retry`-tier resources whose holders must run one-at-a-time within
    /// the batch, mapped to those holders in scheduling order.
    pub serial_resources: BTreeMap<String, Vec<String>>,
}

/// A `Sequential`-tier deferral: `item_id` waits behind `behind` for
/// `resource_key`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Deferral {
    /// The deferred item.
    pub item_id: String,
    /// The item that won the round for the resource.
    pub behind: String,
    /// The contended resource.
    pub resource_key: String,
}

/// An `Escalate`-tier block requiring manual clearance.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Escalation {
    /// The blocked item.
    pub item_id: String,
    /// The contended resource.
    pub resource_key: String,
    /// Human-readable reason recorded on the item.
    pub reason: String,
}

/// What a planning round produced.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PlanOutcome {
    /// A batch ready for dispatch.
    Batch(Batch),
    /// Nothing is eligible yet, but retry backoff windows will open; wait
    /// this long and replan.
    Wait(Duration),
    /// Items remain but none can ever become ready without external action.
    Stalled {
        /// Pending items with unsatisfiable prerequisites.
        pending: Vec<String>,
        /// Blocked items awaiting manual clearance.
        blocked: Vec<String>,
    },
    /// No pending or blocked items remain.
    Finished,
}

/// Result of one partitioning round: the outcome plus the conflict
/// resolutions applied while computing it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlannedRound {
    /// Batch, wait, stall, or finish.
    pub outcome: PlanOutcome,
    /// Items deferred behind a `Sequential` winner this round.
    pub deferrals: Vec<Deferral>,
    /// Items newly blocked by an `Escalate` conflict this round.
    pub escalations: Vec<Escalation>,
}

/// Pure selection computed by a round, before any store mutation.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CandidateSelection {
    /// Items to schedule, ordered and truncated to the cap.
    pub selected: Vec<String>,
    /// `Retry`-tier serialization groups among the selected items.
    pub serial_resources: BTreeMap<String, Vec<String>>,
    /// Deferrals to record as barrier edges.
    pub deferrals: Vec<Deferral>,
    /// Escalations to apply as blocks.
    pub escalations: Vec<Escalation>,
    /// Shortest retry-backoff window among otherwise-ready items, when the
    /// frontier is empty for that reason alone.
    pub backoff_wait: Option<Duration>,
}

/// Emits ordered batches from the ready frontier.
#[derive(Debug, Clone)]
pub struct BatchPlanner {
    parallelism_cap: usize,
    next_batch_id: u64,
}

impl BatchPlanner {
    /// Create a planner with the given parallelism cap (minimum 1).
    pub fn new(parallelism_cap: usize) -> Self {
        Self {
            parallelism_cap: parallelism_cap.max(1),
            next_batch_id: 1,
        }
    }

    /// Compute the next round's selection without mutating anything.
    ///
    /// Calling this repeatedly on an unchanged store yields the same
    /// selection, which keeps planning reproducible.
    pub fn select_candidates(
        &self,
        graph: &DependencyGraph,
        store: &WorkItemStore,
        classifier: &dyn ResourceClassifier,
        now: DateTime<Utc>,
    ) -> CandidateSelection {
        let frontier = graph.ready_frontier(store, now);
        if frontier.is_empty() {
            return CandidateSelection {
                backoff_wait: backoff_wait(graph, store, now),
                ..CandidateSelection::default()
            };
        }

        let items: Vec<&WorkItem> = frontier
            .iter()
            .filter_map(|id| store.get(id))
            .collect();
        let records = detect_conflicts(&items, classifier);

        let mut escalated: HashSet<String> = HashSet::new();
        let mut escalations = Vec::new();
        for record in &records {
            if record.tier != ConflictTier::Escalate {
                continue;
            }
            for id in &record.item_ids {
                if escalated.insert(id.clone()) {
                    let others: Vec<&str> = record
                        .item_ids
                        .iter()
                        .filter(|other| *other != id)
                        .map(String::as_str)
                        .collect();
                    escalations.push(Escalation {
                        item_id: id.clone(),
                        resource_key: record.resource_key.clone(),
                        reason: format!(
                            "escalated conflict on {} (also declared by {})",
                            record.resource_key,
                            others.join(", ")
                        ),
                    });
                }
            }
        }

        let mut deferred: HashSet<String> = HashSet::new();
        let mut deferrals = Vec::new();
        for record in &records {
            if record.tier != ConflictTier::Sequential {
                continue;
            }
            // The winner is the first declarer that survived escalation.
            let Some(winner) = record
                .item_ids
                .iter()
                .find(|id| !escalated.contains(*id))
            else {
                continue;
            };
            for id in &record.item_ids {
                if id == winner || escalated.contains(id) {
                    continue;
                }
                if deferred.insert(id.clone()) {
                    deferrals.push(Deferral {
                        item_id: id.clone(),
                        behind: winner.clone(),
                        resource_key: record.resource_key.clone(),
                    });
                }
            }
        }

        let mut eligible: Vec<&WorkItem> = items
            .into_iter()
            .filter(|item| !escalated.contains(&item.id) && !deferred.contains(&item.id))
            .collect();
        eligible.sort_by(|left, right| scheduling_cmp(left, right));
        eligible.truncate(self.parallelism_cap);
        let selected: Vec<String> = eligible.iter().map(|item| item.id.clone()).collect();
        let selected_set: HashSet<&str> = selected.iter().map(String::as_str).collect();

        let mut serial_resources = BTreeMap::new();
        for record in &records {
            if record.tier != ConflictTier::Retry {
                continue;
            }
            let members: Vec<String> = record
                .item_ids
                .iter()
                .filter(|id| selected_set.contains(id.as_str()))
                .cloned()
                .collect();
            if members.len() >= 2 {
                serial_resources.insert(record.resource_key.clone(), members);
            }
        }

        CandidateSelection {
            selected,
            serial_resources,
            deferrals,
            escalations,
            backoff_wait: None,
        }
    }

    /// Run one partitioning round: select, apply conflict resolutions, and
    /// emit the batch (or the round's end state).
    pub fn plan_next_batch(
        &mut self,
        graph: &mut DependencyGraph,
        store: &mut WorkItemStore,
        classifier: &dyn ResourceClassifier,
    ) -> Result<PlannedRound, PlanError> {
        let now = Utc::now();
        let selection = self.select_candidates(graph, store, classifier, now);

        for escalation in &selection.escalations {
            store.mark_blocked(&escalation.item_id, escalation.reason.clone())?;
        }
        for deferral in &selection.deferrals {
            graph.add_barrier(&deferral.item_id, &deferral.behind);
        }

        // Escalations can empty the frontier mid-round, so the end state is
        // evaluated after they are applied.
        if selection.selected.is_empty() {
            let outcome = round_end_state(graph, store, now, selection.backoff_wait);
            return Ok(PlannedRound {
                outcome,
                deferrals: selection.deferrals,
                escalations: selection.escalations,
            });
        }
        let selected = selection.selected;

        let batch_id = self.next_batch_id;
        self.next_batch_id += 1;
        for id in &selected {
            store.mark_ready(id)?;
            store.mark_scheduled(id, batch_id)?;
        }

        let batch = Batch {
            id: batch_id,
            item_ids: selected,
            parallelism_cap: self.parallelism_cap,
            status: BatchStatus::Planned,
            serial_resources: selection.serial_resources,
        };
        info!(
            batch = batch.id,
            items = batch.item_ids.len(),
            deferred = selection.deferrals.len(),
            escalated = selection.escalations.len(),
            "batch planned"
        );
        debug!(batch = batch.id, items = ?batch.item_ids, "batch contents");

        Ok(PlannedRound {
            outcome: PlanOutcome::Batch(batch),
            deferrals: selection.deferrals,
            escalations: selection.escalations,
        })
    }
}

/// Shortest time until a backed-off item re-enters the frontier, if any
/// item is excluded for that reason alone.
fn backoff_wait(
    graph: &DependencyGraph,
    store: &WorkItemStore,
    now: DateTime<Utc>,
) -> Option<Duration> {
    store
        .items()
        .filter(|item| {
            item.status == ItemStatus::Pending
                && !item.retry_eligible(now)
                && graph.blocked_by(&item.id, store).is_empty()
                && !graph.has_barrier(&item.id)
        })
        .filter_map(|item| item.retry_eligible_at)
        .map(|at| (at - now).to_std().unwrap_or(Duration::ZERO))
        .min()
}

fn round_end_state(
    graph: &DependencyGraph,
    store: &WorkItemStore,
    now: DateTime<Utc>,
    backoff: Option<Duration>,
) -> PlanOutcome {
    if let Some(wait) = backoff.or_else(|| backoff_wait(graph, store, now)) {
        return PlanOutcome::Wait(wait);
    }
    let pending = store.ids_with_status(ItemStatus::Pending);
    let blocked = store.ids_with_status(ItemStatus::Blocked);
    if pending.is_empty() && blocked.is_empty() {
        PlanOutcome::Finished
    } else {
        PlanOutcome::Stalled { pending, blocked }
    }
}
