//! Topological planner.
//!
//! Kahn's algorithm over a min-heap of declaration indices: whenever more
//! than one node is ready, the one declared first goes next. The order is a
//! pure function of the declarations.

use crate::graph::{Edge, Graph, NodeHandle};
use crate::grapher::find_cycle;
use crate::validate::FrozenGraph;
use std::cmp::Reverse;
use std::collections::BinaryHeap;
use trellis_core::{SynthError, SynthResult};

/// Materialization order planner
#[derive(Debug, Clone, Copy, Default)]
pub struct Planner;

impl Planner {
    /// Create a planner
    #[must_use]
    pub fn new() -> Self {
        Self
    }

    /// Order a frozen graph
    ///
    /// # Errors
    ///
    /// Returns `CyclicDependency` if the edges contain a cycle
    pub fn plan(&self, frozen: &FrozenGraph) -> SynthResult<Vec<NodeHandle>> {
        self.order(frozen.graph(), frozen.edges())
    }

    /// Order any graph and edge set; cycles are detected here as well, so
    /// an unvalidated graph never yields a partial order
    ///
    /// # Errors
    ///
    /// Returns `CyclicDependency` with the full cycle path, or `Intake` if
    /// an edge names a handle past the node list
    pub fn order(&self, graph: &Graph, edges: &[Edge]) -> SynthResult<Vec<NodeHandle>> {
        let count = graph.len();
        let mut in_degree = vec![0usize; count];
        let mut successors: Vec<Vec<NodeHandle>> = vec![Vec::new(); count];
        for edge in edges {
            graph.check_edge(edge)?;
            in_degree[edge.to.index()] += 1;
            successors[edge.from.index()].push(edge.to);
        }

        let mut ready: BinaryHeap<Reverse<NodeHandle>> = graph
            .nodes()
            .filter(|(handle, _)| in_degree[handle.index()] == 0)
            .map(|(handle, _)| Reverse(handle))
            .collect();

        let mut order = Vec::with_capacity(count);
        while let Some(Reverse(handle)) = ready.pop() {
            order.push(handle);
            for &next in &successors[handle.index()] {
                let degree = &mut in_degree[next.index()];
                *degree -= 1;
                if *degree == 0 {
                    ready.push(Reverse(next));
                }
            }
        }

        if order.len() < count {
            let cycle = find_cycle(graph, edges).unwrap_or_default();
            return Err(SynthError::CyclicDependency { cycle });
        }

        tracing::debug!(nodes = order.len(), "planned materialization order");
        Ok(order)
    }
}
