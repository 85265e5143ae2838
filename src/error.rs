//! Error taxonomy for planning and state tracking.

use thiserror::Error;

/// Structural and planning errors.
///
/// Structural variants (`DuplicateItem`, `UnknownDependency`, `SelfDependency`,
/// `CircularDependency`) abort a planning run before any item is scheduled.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PlanError {
    /// Two items were loaded with the same id.
    #[error("duplicate work item id: {id}")]
    DuplicateItem {
        /// The repeated id.
        id: String,
    },

    /// An item declares a dependency on an id that was never loaded.
    #[error("item {item} depends on unknown item {dependency}")]
    UnknownDependency {
        /// The item carrying the bad declaration.
        item: String,
        /// The id that does not exist.
        dependency: String,
    },

    /// An item declares a dependency on itself.
    #[error("item {id} depends on itself")]
    SelfDependency {
        /// The self-referencing id.
        id: String,
    },

    /// The declared dependencies contain at least one cycle.
    ///
    /// Every distinct cycle found is reported so the error is actionable.
    #[error("circular dependency: {}", format_cycles(cycles))]
    CircularDependency {
        /// All cycles found, each a closed path of item ids.
        cycles: Vec<Vec<String>>,
    },

    /// No item is both ready and unblocked by conflicts, yet items remain
    /// outstanding. Distinct from a cycle: this can arise purely from
    /// unresolved escalations.
    #[error("planning stalled: {} pending, {} blocked", pending.len(), blocked.len())]
    Stalled {
        /// Items still pending but unreachable.
        pending: Vec<String>,
        /// Items blocked awaiting manual clearance.
        blocked: Vec<String>,
    },

    /// A store mutation was rejected mid-plan.
    #[error(transparent)]
    Store(#[from] StoreError),
}

fn format_cycles(cycles: &[Vec<String>]) -> String {
    cycles
        .iter()
        .map(|cycle| {
            let mut path = cycle.join(" -> ");
            if let Some(first) = cycle.first() {
                path.push_str(" -> ");
                path.push_str(first);
            }
            path
        })
        .collect::<Vec<_>>()
        .join("; ")
}

/// Errors raised by the work-item store when a mutation is rejected.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StoreError {
    /// The referenced item does not exist in the store.
    #[error("unknown work item: {id}")]
    UnknownItem {
        /// The missing id.
        id: String,
    },

    /// The requested status change is not a legal transition.
    #[error("invalid transition for {id}: {from} -> {to}")]
    InvalidTransition {
        /// The item whose transition was rejected.
        id: String,
        /// Current status label.
        from: String,
        /// Requested status label.
        to: String,
    },
}
