//! Resource-conflict detection between items eligible to run concurrently.
//!
//! Conflicts are advisory scheduling guidance: the scheduler serializes or
//! defers the writers itself, it never locks the underlying resource.

use std::cmp::Ordering;
use std::collections::BTreeMap;

use regex::RegexSet;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::item::WorkItem;

/// Resolution strategy assigned to a detected resource overlap.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConflictTier {
    /// Aggregation point: only the first writer proceeds this round, the
    /// rest are deferred behind it.
    Sequential,
    /// Probabilistic overlap: all writers stay in the batch but run
    /// one-at-a-time relative to each other.
    Retry,
    /// Exclusive-owner violation: nobody runs; the items are blocked for
    /// manual review.
    Escalate,
}

impl ConflictTier {
    /// Short lowercase label for logs and event payloads.
    pub fn as_label(&self) -> &'static str {
        match self {
            ConflictTier::Sequential => "sequential",
            ConflictTier::Retry => "retry",
            ConflictTier::Escalate => "escalate",
        }
    }
}

/// One contended resource and the items that declared it in the same
/// candidacy round. Scoped to that round; recomputed each time.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConflictRecord {
    /// The contended resource key.
    pub resource_key: String,
    /// Declaring items, ordered by priority (descending) then id.
    pub item_ids: Vec<String>,
    /// Resolution strategy for this resource.
    pub tier: ConflictTier,
}

/// Maps a resource key to its conflict tier.
///
/// The classification itself is configuration; the detector only consumes
/// the closed three-way outcome.
pub trait ResourceClassifier: Send + Sync {
    /// Classify a single resource key.
    fn classify(&self, resource_key: &str) -> ConflictTier;
}

impl<F> ResourceClassifier for F
where
    F: Fn(&str) -> ConflictTier + Send + Sync,
{
    fn classify(&self, resource_key: &str) -> ConflictTier {
        self(resource_key)
    }
}

/// Built-in classifier driven by two regex sets.
///
/// Keys matching an escalate pattern are `Escalate` (checked first, the
/// stricter tier wins), keys matching a sequential pattern are
/// `Sequential`, everything else is `Retry`.
#[derive(Debug, Clone)]
pub struct PatternClassifier {
    sequential: RegexSet,
    escalate: RegexSet,
}

impl PatternClassifier {
    /// Compile a classifier from raw pattern lists.
    pub fn new(
        sequential_patterns: &[String],
        escalate_patterns: &[String],
    ) -> Result<Self, regex::Error> {
        Ok(Self {
            sequential: RegexSet::new(sequential_patterns)?,
            escalate: RegexSet::new(escalate_patterns)?,
        })
    }
}

impl Default for PatternClassifier {
    /// Default patterns treat shared manifest/index style files as
    /// aggregation points and escalate nothing.
    fn default() -> Self {
        let sequential = [r"(?i)(^|/)(manifest|index|registry|changelog)\.[^/]+$".to_string()];
        Self::new(&sequential, &[]).expect("built-in patterns compile")
    }
}

impl ResourceClassifier for PatternClassifier {
    fn classify(&self, resource_key: &str) -> ConflictTier {
        if self.escalate.is_match(resource_key) {
            ConflictTier::Escalate
        } else if self.sequential.is_match(resource_key) {
            ConflictTier::Sequential
        } else {
            ConflictTier::Retry
        }
    }
}

/// Deterministic scheduling order: priority descending, then id ascending.
pub(crate) fn scheduling_cmp(left: &WorkItem, right: &WorkItem) -> Ordering {
    right
        .priority
        .cmp(&left.priority)
        .then_with(|| left.id.cmp(&right.id))
}

/// Find every resource declared by two or more candidates.
///
/// Records come back sorted by resource key; item ids inside each record
/// follow the scheduling order, so the first entry is the round's winner
/// for `Sequential` resources.
pub fn detect_conflicts(
    candidates: &[&WorkItem],
    classifier: &dyn ResourceClassifier,
) -> Vec<ConflictRecord> {
    let mut by_resource: BTreeMap<&str, Vec<&WorkItem>> = BTreeMap::new();
    for item in candidates {
        for key in &item.resources {
            by_resource.entry(key.as_str()).or_default().push(item);
        }
    }

    by_resource
        .into_iter()
        .filter(|(_, items)| items.len() >= 2)
        .map(|(key, mut items)| {
            items.sort_by(|left, right| scheduling_cmp(left, right));
            let tier = classifier.classify(key);
            debug!(
                resource = key,
                items = items.len(),
                tier = tier.as_label(),
                "resource conflict detected"
            );
            ConflictRecord {
                resource_key: key.to_string(),
                item_ids: items.into_iter().map(|item| item.id.clone()).collect(),
                tier,
            }
        })
        .collect()
}
