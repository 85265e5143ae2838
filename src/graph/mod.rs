//! Dependency graph over the loaded work items.
//!
//! Edges point dependent -> dependency. Besides the declared edges the graph
//! carries *barrier* edges: artificial deferrals recorded when a
//! `Sequential`-tier conflict pushes an item behind the winner of the
//! current round. Barrier edges are dropped as soon as the winning item
//! reaches a terminal state.

pub mod cycles;

use std::collections::{BTreeMap, VecDeque};

use chrono::{DateTime, Utc};
use petgraph::graph::{DiGraph, NodeIndex};
use petgraph::Direction;
use tracing::debug;

use crate::item::{ItemStatus, WorkItemStore};

pub use cycles::{detect_cycles, detect_cycles_from};

/// Why an edge exists.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EdgeKind {
    /// Declared in the item's `depends_on` set.
    Declared,
    /// Conflict deferral: the source must wait for the target's terminal
    /// state before re-entering the frontier.
    Barrier,
}

/// Adjacency over work items, owned by the planning run.
#[derive(Debug, Clone, Default)]
pub struct DependencyGraph {
    graph: DiGraph<String, EdgeKind>,
    nodes: BTreeMap<String, NodeIndex>,
}

impl DependencyGraph {
    /// Build the graph from a validated store in O(n + e).
    ///
    /// The store has already rejected unknown ids, so every declared edge
    /// resolves; the store itself is not touched.
    pub fn build(store: &WorkItemStore) -> Self {
        let mut graph = DiGraph::new();
        let mut nodes = BTreeMap::new();

        for item in store.items() {
            let idx = graph.add_node(item.id.clone());
            nodes.insert(item.id.clone(), idx);
        }
        for item in store.items() {
            let from = nodes[&item.id];
            for dep in &item.depends_on {
                graph.add_edge(from, nodes[dep], EdgeKind::Declared);
            }
        }

        debug!(
            nodes = graph.node_count(),
            edges = graph.edge_count(),
            "dependency graph built"
        );
        Self { graph, nodes }
    }

    fn node(&self, id: &str) -> Option<NodeIndex> {
        self.nodes.get(id).copied()
    }

    fn outgoing(&self, idx: NodeIndex) -> impl Iterator<Item = (NodeIndex, EdgeKind)> + '_ {
        self.graph
            .edges_directed(idx, Direction::Outgoing)
            .map(|edge| {
                use petgraph::visit::EdgeRef;
                (edge.target(), *edge.weight())
            })
    }

    fn incoming(&self, idx: NodeIndex) -> impl Iterator<Item = (NodeIndex, EdgeKind)> + '_ {
        self.graph
            .edges_directed(idx, Direction::Incoming)
            .map(|edge| {
                use petgraph::visit::EdgeRef;
                (edge.source(), *edge.weight())
            })
    }

    /// Dependencies of `id` (declared or barrier) that are not yet
    /// `Complete`, sorted.
    pub fn blocked_by(&self, id: &str, store: &WorkItemStore) -> Vec<String> {
        let Some(idx) = self.node(id) else {
            return Vec::new();
        };
        let mut out: Vec<String> = self
            .outgoing(idx)
            .map(|(target, _)| self.graph[target].clone())
            .filter(|dep| {
                store
                    .get(dep)
                    .map(|item| item.status != ItemStatus::Complete)
                    .unwrap_or(false)
            })
            .collect();
        out.sort();
        out.dedup();
        out
    }

    /// Items that declare a dependency on `id`, sorted.
    pub fn blocks(&self, id: &str) -> Vec<String> {
        let Some(idx) = self.node(id) else {
            return Vec::new();
        };
        let mut out: Vec<String> = self
            .incoming(idx)
            .filter(|(_, kind)| *kind == EdgeKind::Declared)
            .map(|(source, _)| self.graph[source].clone())
            .collect();
        out.sort();
        out.dedup();
        out
    }

    /// Every item reachable over reverse declared edges from `id`, i.e. the
    /// set to block when `id` fails terminally. Sorted, excludes `id` itself.
    pub fn transitive_dependents(&self, id: &str) -> Vec<String> {
        let Some(start) = self.node(id) else {
            return Vec::new();
        };
        let mut seen = vec![false; self.graph.node_count()];
        let mut queue = VecDeque::from([start]);
        seen[start.index()] = true;
        let mut out = Vec::new();
        while let Some(idx) = queue.pop_front() {
            for (source, kind) in self.incoming(idx) {
                if kind == EdgeKind::Declared && !seen[source.index()] {
                    seen[source.index()] = true;
                    out.push(self.graph[source].clone());
                    queue.push_back(source);
                }
            }
        }
        out.sort();
        out
    }

    /// The ready frontier: `Pending` items whose declared dependencies are
    /// all `Complete`, that hold no live barrier edge, and whose retry
    /// backoff (if any) elapsed by `now`. Sorted by id; ordering for
    /// scheduling happens in the partitioner.
    pub fn ready_frontier(&self, store: &WorkItemStore, now: DateTime<Utc>) -> Vec<String> {
        let mut frontier = Vec::new();
        for (id, &idx) in &self.nodes {
            let Some(item) = store.get(id) else {
                continue;
            };
            if item.status != ItemStatus::Pending || !item.retry_eligible(now) {
                continue;
            }
            let eligible = self.outgoing(idx).all(|(target, kind)| match kind {
                EdgeKind::Declared => store
                    .get(&self.graph[target])
                    .map(|dep| dep.status == ItemStatus::Complete)
                    .unwrap_or(false),
                // Barrier edges are removed when the target goes terminal,
                // so any still present is live.
                EdgeKind::Barrier => false,
            });
            if eligible {
                frontier.push(id.clone());
            }
        }
        frontier
    }

    /// Record a conflict deferral edge `waiter -> barrier`.
    pub fn add_barrier(&mut self, waiter: &str, barrier: &str) {
        let (Some(from), Some(to)) = (self.node(waiter), self.node(barrier)) else {
            return;
        };
        let exists = self
            .outgoing(from)
            .any(|(target, kind)| target == to && kind == EdgeKind::Barrier);
        if !exists {
            self.graph.add_edge(from, to, EdgeKind::Barrier);
            debug!(waiter, barrier, "barrier edge recorded");
        }
    }

    /// Drop every barrier edge pointing at `id`. Called when `id` reaches a
    /// terminal state: the resource is no longer contended by it.
    pub fn clear_barriers_through(&mut self, id: &str) {
        let Some(target) = self.node(id) else {
            return;
        };
        loop {
            let found = self
                .graph
                .edges_directed(target, Direction::Incoming)
                .find_map(|edge| {
                    use petgraph::visit::EdgeRef;
                    (*edge.weight() == EdgeKind::Barrier).then(|| edge.id())
                });
            match found {
                Some(edge) => {
                    self.graph.remove_edge(edge);
                }
                None => break,
            }
        }
    }

    /// Whether `id` currently waits behind any barrier edge.
    pub fn has_barrier(&self, id: &str) -> bool {
        self.node(id)
            .map(|idx| self.outgoing(idx).any(|(_, kind)| kind == EdgeKind::Barrier))
            .unwrap_or(false)
    }

    /// Declared edges as `(dependent, dependency)` id pairs, sorted, for
    /// snapshots and checkpoint payloads.
    pub fn declared_edges(&self) -> Vec<(String, String)> {
        let mut out: Vec<(String, String)> = self
            .graph
            .edge_indices()
            .filter_map(|edge| {
                if self.graph[edge] != EdgeKind::Declared {
                    return None;
                }
                let (from, to) = self.graph.edge_endpoints(edge)?;
                Some((self.graph[from].clone(), self.graph[to].clone()))
            })
            .collect();
        out.sort();
        out
    }

    pub(crate) fn sorted_neighbors(&self, idx: NodeIndex) -> Vec<NodeIndex> {
        let mut out: Vec<NodeIndex> = self.outgoing(idx).map(|(target, _)| target).collect();
        out.sort_by(|left, right| self.graph[*left].cmp(&self.graph[*right]));
        out.dedup();
        out
    }

    pub(crate) fn node_indices_sorted(&self) -> Vec<NodeIndex> {
        self.nodes.values().copied().collect()
    }

    pub(crate) fn node_index(&self, id: &str) -> Option<NodeIndex> {
        self.node(id)
    }

    pub(crate) fn id_of(&self, idx: NodeIndex) -> &str {
        &self.graph[idx]
    }

    pub(crate) fn node_count(&self) -> usize {
        self.graph.node_count()
    }
}
