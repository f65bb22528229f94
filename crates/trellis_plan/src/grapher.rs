//! Dependency derivation and cycle search.

use crate::graph::{Edge, Graph, NodeHandle};
use indexmap::IndexSet;
use trellis_core::{NodeId, SynthResult, Value};

/// Derive every edge of the graph: data dependencies first, in declaration
/// order of the dependent node, then the declared ordering hints.
///
/// A node's statements may name the node itself (a bucket policy scoped to
/// the bucket's own ARN); such self-references produce no edge. A
/// self-reference from properties does, and shows up as a one-node cycle.
///
/// # Errors
///
/// Returns `UnknownNode` if a reference names an undeclared node, or
/// `Intake` if a hint names a handle past the node list
pub fn derive_edges(graph: &Graph) -> SynthResult<Vec<Edge>> {
    let mut pairs: IndexSet<(NodeHandle, NodeHandle)> = IndexSet::new();
    let mut edges = Vec::new();

    for (to, node) in graph.nodes() {
        let from_properties = node.properties.values().flat_map(Value::referenced_nodes);
        let from_statements = node
            .statements
            .iter()
            .flat_map(|s| s.referenced_nodes())
            .filter(|target| *target != node.id.as_str());

        for target in from_properties.chain(from_statements) {
            let from = graph.require(Some(&node.id), target)?;
            if pairs.insert((from, to)) {
                edges.push(Edge::data(from, to));
            }
        }
    }

    for hint in graph.hints() {
        graph.check_edge(hint)?;
        if pairs.insert((hint.from, hint.to)) {
            edges.push(*hint);
        }
    }

    tracing::debug!(nodes = graph.len(), edges = edges.len(), "derived dependency edges");
    Ok(edges)
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum Mark {
    White,
    Gray,
    Black,
}

/// Find a cycle with a white/gray/black depth-first search.
///
/// Returns the full path with the first id repeated at the end, following
/// edge direction. Roots and successors are visited in declaration order so
/// the same graph always reports the same cycle. The search keeps its own
/// stack, so chain depth is bounded by memory rather than the call stack.
/// Edges naming handles past the node list are ignored.
#[must_use]
pub fn find_cycle(graph: &Graph, edges: &[Edge]) -> Option<Vec<NodeId>> {
    let count = graph.len();
    let mut successors: Vec<Vec<NodeHandle>> = vec![Vec::new(); count];
    for edge in edges {
        if edge.from.index() < count && edge.to.index() < count {
            successors[edge.from.index()].push(edge.to);
        }
    }

    let mut marks = vec![Mark::White; count];
    // (node, position of the next successor to try)
    let mut stack: Vec<(NodeHandle, usize)> = Vec::new();

    for (root, _) in graph.nodes() {
        if marks[root.index()] != Mark::White {
            continue;
        }
        marks[root.index()] = Mark::Gray;
        stack.push((root, 0));

        while let Some(top) = stack.last_mut() {
            let (handle, cursor) = *top;
            let Some(&next) = successors[handle.index()].get(cursor) else {
                marks[handle.index()] = Mark::Black;
                stack.pop();
                continue;
            };
            top.1 += 1;
            match marks[next.index()] {
                Mark::Gray => {
                    let start = stack.iter().position(|&(h, _)| h == next).unwrap_or(0);
                    return Some(
                        stack[start..]
                            .iter()
                            .map(|&(h, _)| h)
                            .chain(std::iter::once(next))
                            .filter_map(|h| graph.node(h).map(|n| n.id.clone()))
                            .collect(),
                    );
                }
                Mark::White => {
                    marks[next.index()] = Mark::Gray;
                    stack.push((next, 0));
                }
                Mark::Black => {}
            }
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::{EdgeKind, ResourceNode};
    use trellis_core::SynthError;
    use trellis_policy::PolicyStatement;

    fn node(id: &str) -> ResourceNode {
        ResourceNode::new(id, "Test::Node").with_output("Arn")
    }

    #[test]
    fn test_reference_creates_data_edge() {
        let mut graph = Graph::new();
        let role = graph
            .insert(node("Role").with_property("Target", Value::get_att("Bucket", "Arn")))
            .unwrap();
        let bucket = graph.insert(node("Bucket")).unwrap();
        let edges = derive_edges(&graph).unwrap();
        assert_eq!(edges, vec![Edge::data(bucket, role)]);
    }

    #[test]
    fn test_repeated_reference_single_edge() {
        let mut graph = Graph::new();
        let bucket = graph.insert(node("Bucket")).unwrap();
        let role = graph
            .insert(
                node("Role")
                    .with_property("A", Value::get_att("Bucket", "Arn"))
                    .with_property("B", Value::reference("Bucket")),
            )
            .unwrap();
        let edges = derive_edges(&graph).unwrap();
        assert_eq!(edges, vec![Edge::data(bucket, role)]);
    }

    #[test]
    fn test_statement_self_reference_has_no_edge() {
        let mut graph = Graph::new();
        graph
            .insert(
                node("Bucket").with_statement(
                    PolicyStatement::deny()
                        .with_action("s3:PutObject")
                        .with_resource(Value::get_att("Bucket", "Arn")),
                ),
            )
            .unwrap();
        assert!(derive_edges(&graph).unwrap().is_empty());
    }

    #[test]
    fn test_statement_reference_creates_edge() {
        let mut graph = Graph::new();
        let bucket = graph.insert(node("Bucket")).unwrap();
        let role = graph
            .insert(
                node("Role").with_statement(
                    PolicyStatement::allow()
                        .with_action("s3:GetObject")
                        .with_resource(Value::get_att("Bucket", "Arn")),
                ),
            )
            .unwrap();
        assert_eq!(derive_edges(&graph).unwrap(), vec![Edge::data(bucket, role)]);
    }

    #[test]
    fn test_hint_kept_after_data_edges() {
        let mut graph = Graph::new();
        graph.insert(node("Policy")).unwrap();
        graph
            .insert(node("Role").with_property("P", Value::reference("Policy")))
            .unwrap();
        graph.insert(node("Project")).unwrap();
        graph.declare_ordering_hint("Policy", "Project").unwrap();
        graph.declare_ordering_hint("Policy", "Role").unwrap();
        let edges = derive_edges(&graph).unwrap();
        assert_eq!(edges.len(), 2);
        assert_eq!(edges[0].kind, EdgeKind::DataDependency);
        assert_eq!(edges[1].kind, EdgeKind::OrderingHint);
    }

    #[test]
    fn test_unknown_target() {
        let mut graph = Graph::new();
        graph
            .insert(node("Role").with_property("P", Value::reference("Ghost")))
            .unwrap();
        assert_eq!(
            derive_edges(&graph).unwrap_err(),
            SynthError::UnknownNode {
                referrer: Some("Role".into()),
                target: "Ghost".into()
            }
        );
    }

    #[test]
    fn test_find_cycle_reports_full_path() {
        let mut graph = Graph::new();
        graph
            .insert(node("Role").with_property("P", Value::get_att("Pipeline", "Arn")))
            .unwrap();
        graph
            .insert(node("Pipeline").with_property("R", Value::get_att("Role", "Arn")))
            .unwrap();
        let edges = derive_edges(&graph).unwrap();
        let cycle = find_cycle(&graph, &edges).unwrap();
        assert_eq!(
            cycle,
            vec![NodeId::from("Role"), NodeId::from("Pipeline"), NodeId::from("Role")]
        );
    }

    #[test]
    fn test_find_cycle_self_loop() {
        let mut graph = Graph::new();
        graph
            .insert(node("Loop").with_property("Me", Value::reference("Loop")))
            .unwrap();
        let edges = derive_edges(&graph).unwrap();
        assert_eq!(
            find_cycle(&graph, &edges).unwrap(),
            vec![NodeId::from("Loop"), NodeId::from("Loop")]
        );
    }

    #[test]
    fn test_find_cycle_none_for_diamond() {
        let mut graph = Graph::new();
        graph.insert(node("A")).unwrap();
        graph
            .insert(node("B").with_property("a", Value::reference("A")))
            .unwrap();
        graph
            .insert(node("C").with_property("a", Value::reference("A")))
            .unwrap();
        graph
            .insert(node("D").with_property(
                "bc",
                Value::list([Value::reference("B"), Value::reference("C")]),
            ))
            .unwrap();
        let edges = derive_edges(&graph).unwrap();
        assert!(find_cycle(&graph, &edges).is_none());
    }

    fn chain(length: usize) -> Graph {
        let mut graph = Graph::new();
        graph.insert(node("N0")).unwrap();
        for i in 1..length {
            let previous = format!("N{}", i - 1);
            graph
                .insert(node(&format!("N{i}")).with_property("Up", Value::get_att(previous, "Arn")))
                .unwrap();
        }
        graph
    }

    #[test]
    fn test_find_cycle_long_chain() {
        let graph = chain(20_000);
        let edges = derive_edges(&graph).unwrap();
        assert_eq!(edges.len(), 19_999);
        assert!(find_cycle(&graph, &edges).is_none());
    }

    #[test]
    fn test_find_cycle_closing_long_chain() {
        let mut graph = chain(20_000);
        graph.declare_ordering_hint("N19999", "N0").unwrap();
        let edges = derive_edges(&graph).unwrap();
        let cycle = find_cycle(&graph, &edges).unwrap();
        assert_eq!(cycle.len(), 20_001);
        assert_eq!(cycle.first(), Some(&NodeId::from("N0")));
        assert_eq!(cycle.last(), Some(&NodeId::from("N0")));
    }

    #[test]
    fn test_hint_past_node_list_rejected() {
        let graph: Graph = serde_json::from_str(
            r#"{"nodes":{"A":{"id":"A","resource_type":"Test::Node","properties":{},"outputs":[],"statements":[]}},
                "hints":[{"from":0,"to":5,"kind":"OrderingHint"}]}"#,
        )
        .unwrap();
        assert!(matches!(derive_edges(&graph), Err(SynthError::Intake { .. })));
    }
}
