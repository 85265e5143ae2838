//! Cycle detection over the dependency graph.
//!
//! Three-color depth-first search: white nodes are unvisited, gray nodes are
//! on the current DFS path, black nodes are fully explored. An edge into a
//! gray node is a back edge; the cycle is reconstructed from the DFS path.
//! Every distinct cycle found is returned so the resulting error names all
//! offenders, not just the first.

use std::collections::HashSet;

use petgraph::graph::NodeIndex;
use tracing::warn;

use crate::graph::DependencyGraph;

#[derive(Clone, Copy, PartialEq, Eq)]
enum Color {
    White,
    Gray,
    Black,
}

/// Find all distinct dependency cycles in the graph.
///
/// Returns an empty vector for any valid DAG. Cycles are
/// rotation-normalized (smallest id first) so repeated runs report them
/// identically.
pub fn detect_cycles(graph: &DependencyGraph) -> Vec<Vec<String>> {
    search(graph, graph.node_indices_sorted())
}

/// Re-check only the subgraph reachable from `roots`.
///
/// Used after a manual `Failed | Blocked -> Pending` reset, where a full
/// sweep would be wasted work: only edges reachable from the reset item can
/// participate in a newly relevant cycle.
pub fn detect_cycles_from(graph: &DependencyGraph, roots: &[String]) -> Vec<Vec<String>> {
    let starts: Vec<NodeIndex> = roots
        .iter()
        .filter_map(|id| graph.node_index(id))
        .collect();
    search(graph, starts)
}

fn search(graph: &DependencyGraph, roots: Vec<NodeIndex>) -> Vec<Vec<String>> {
    let mut color = vec![Color::White; graph.node_count()];
    let mut cycles = Vec::new();
    let mut seen: HashSet<Vec<String>> = HashSet::new();

    for root in roots {
        if color[root.index()] != Color::White {
            continue;
        }
        // Explicit stack of (node, sorted neighbors, cursor); `path` mirrors
        // the gray chain for cycle reconstruction.
        let mut stack = vec![(root, graph.sorted_neighbors(root), 0usize)];
        let mut path = vec![root];
        color[root.index()] = Color::Gray;

        while let Some((_, neighbors, cursor)) = stack.last_mut() {
            if *cursor < neighbors.len() {
                let next = neighbors[*cursor];
                *cursor += 1;
                match color[next.index()] {
                    Color::White => {
                        color[next.index()] = Color::Gray;
                        path.push(next);
                        stack.push((next, graph.sorted_neighbors(next), 0));
                    }
                    Color::Gray => {
                        if let Some(pos) = path.iter().position(|&idx| idx == next) {
                            let cycle = normalize(
                                path[pos..]
                                    .iter()
                                    .map(|&idx| graph.id_of(idx).to_string())
                                    .collect(),
                            );
                            if seen.insert(cycle.clone()) {
                                warn!(cycle = %cycle.join(" -> "), "dependency cycle found");
                                cycles.push(cycle);
                            }
                        }
                    }
                    Color::Black => {}
                }
            } else {
                let (done, _, _) = stack.pop().unwrap_or((root, Vec::new(), 0));
                color[done.index()] = Color::Black;
                path.pop();
            }
        }
    }

    cycles
}

/// Rotate the cycle so its smallest id comes first.
fn normalize(cycle: Vec<String>) -> Vec<String> {
    let Some(min_pos) = cycle
        .iter()
        .enumerate()
        .min_by(|(_, left), (_, right)| left.cmp(right))
        .map(|(pos, _)| pos)
    else {
        return cycle;
    };
    let mut rotated = cycle[min_pos..].to_vec();
    rotated.extend_from_slice(&cycle[..min_pos]);
    rotated
}
