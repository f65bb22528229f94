//! Resource nodes and the graph that owns them.
//!
//! The graph is built once during declaration intake and then handed to the
//! validator, which freezes it. Nodes are addressed by opaque
//! [`NodeHandle`]s, so the graph can be serialized or moved without any
//! dangling pointer.

use indexmap::{IndexMap, IndexSet};
use serde::{Deserialize, Serialize};
use trellis_core::{NodeId, SynthError, SynthResult, Value};
use trellis_policy::PolicyStatement;

/// Opaque index of a node within its graph
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct NodeHandle(u32);

impl NodeHandle {
    /// Position of the node in declaration order
    #[must_use]
    pub fn index(self) -> usize {
        self.0 as usize
    }

    fn from_index(index: usize) -> Self {
        // Graphs never approach u32::MAX nodes
        Self(index as u32)
    }
}

/// A single declared unit of infrastructure
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceNode {
    /// Unique id within the graph
    pub id: NodeId,
    /// Resource type name
    pub resource_type: String,
    /// Property bag, in declaration order
    pub properties: IndexMap<String, Value>,
    /// Attributes this node exposes once materialized
    pub outputs: IndexSet<String>,
    /// Policy statements attached to this node
    pub statements: Vec<PolicyStatement>,
}

impl ResourceNode {
    /// Create a node with no properties
    #[must_use]
    pub fn new(id: impl Into<NodeId>, resource_type: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            resource_type: resource_type.into(),
            properties: IndexMap::new(),
            outputs: IndexSet::new(),
            statements: Vec::new(),
        }
    }

    /// Set a property
    #[must_use]
    pub fn with_property(mut self, name: impl Into<String>, value: Value) -> Self {
        self.properties.insert(name.into(), value);
        self
    }

    /// Declare an output attribute
    #[must_use]
    pub fn with_output(mut self, attribute: impl Into<String>) -> Self {
        self.outputs.insert(attribute.into());
        self
    }

    /// Attach a policy statement
    #[must_use]
    pub fn with_statement(mut self, statement: PolicyStatement) -> Self {
        self.statements.push(statement);
        self
    }

    /// Check if the node exposes `attribute`
    #[must_use]
    pub fn has_output(&self, attribute: &str) -> bool {
        self.outputs.contains(attribute)
    }
}

/// Why one node must be materialized before another
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EdgeKind {
    /// A property or statement of `to` references `from`
    DataDependency,
    /// Declared explicitly
    OrderingHint,
}

/// Directed edge: `from` is materialized before `to`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Edge {
    /// Dependency
    pub from: NodeHandle,
    /// Dependent
    pub to: NodeHandle,
    /// Edge kind
    pub kind: EdgeKind,
}

impl Edge {
    /// Create a data dependency edge
    #[must_use]
    pub fn data(from: NodeHandle, to: NodeHandle) -> Self {
        Self {
            from,
            to,
            kind: EdgeKind::DataDependency,
        }
    }

    /// Create an ordering hint edge
    #[must_use]
    pub fn hint(from: NodeHandle, to: NodeHandle) -> Self {
        Self {
            from,
            to,
            kind: EdgeKind::OrderingHint,
        }
    }
}

/// Sole owner of all declared nodes
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Graph {
    nodes: IndexMap<NodeId, ResourceNode>,
    hints: Vec<Edge>,
}

impl Graph {
    /// Create an empty graph
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a node with a type and property bag
    ///
    /// # Errors
    ///
    /// Returns `DuplicateId` if the id is already declared
    pub fn add_node(
        &mut self,
        id: impl Into<NodeId>,
        resource_type: impl Into<String>,
        properties: IndexMap<String, Value>,
    ) -> SynthResult<NodeHandle> {
        let mut node = ResourceNode::new(id, resource_type);
        node.properties = properties;
        self.insert(node)
    }

    /// Add a fully built node
    ///
    /// # Errors
    ///
    /// Returns `DuplicateId` if the id is already declared
    pub fn insert(&mut self, node: ResourceNode) -> SynthResult<NodeHandle> {
        if self.nodes.contains_key(&node.id) {
            return Err(SynthError::DuplicateId { id: node.id });
        }
        let handle = NodeHandle::from_index(self.nodes.len());
        self.nodes.insert(node.id.clone(), node);
        Ok(handle)
    }

    /// Require `from` to be materialized before `to`
    ///
    /// # Errors
    ///
    /// Returns `UnknownNode` if either id is absent
    pub fn declare_ordering_hint(&mut self, from: &str, to: &str) -> SynthResult<()> {
        let from_handle = self.require(None, from)?;
        let to_handle = self.require(None, to)?;
        let edge = Edge::hint(from_handle, to_handle);
        if !self.hints.contains(&edge) {
            self.hints.push(edge);
        }
        Ok(())
    }

    /// Handle of a node by id
    #[must_use]
    pub fn handle(&self, id: &str) -> Option<NodeHandle> {
        self.nodes.get_index_of(id).map(NodeHandle::from_index)
    }

    /// Handle of a node by id, failing if it is not declared
    ///
    /// # Errors
    ///
    /// Returns `UnknownNode` naming `referrer` when given
    pub fn require(&self, referrer: Option<&NodeId>, id: &str) -> SynthResult<NodeHandle> {
        self.handle(id).ok_or_else(|| SynthError::UnknownNode {
            referrer: referrer.cloned(),
            target: NodeId::from(id),
        })
    }

    /// Resolve a reference target, checking the attribute when one is named
    ///
    /// # Errors
    ///
    /// Returns `UnknownNode` or `UnknownAttribute`
    pub fn lookup(
        &self,
        referrer: &NodeId,
        target: &str,
        attribute: Option<&str>,
    ) -> SynthResult<NodeHandle> {
        let handle = self.require(Some(referrer), target)?;
        if let Some(attribute) = attribute {
            if !self.nodes[handle.index()].has_output(attribute) {
                return Err(SynthError::UnknownAttribute {
                    node: referrer.clone(),
                    target: NodeId::from(target),
                    attribute: attribute.to_string(),
                });
            }
        }
        Ok(handle)
    }

    /// Node behind a handle
    #[must_use]
    pub fn node(&self, handle: NodeHandle) -> Option<&ResourceNode> {
        self.nodes.get_index(handle.index()).map(|(_, node)| node)
    }

    /// Node by id
    #[must_use]
    pub fn get(&self, id: &str) -> Option<&ResourceNode> {
        self.nodes.get(id)
    }

    /// Check if a node is declared
    #[must_use]
    pub fn contains(&self, id: &str) -> bool {
        self.nodes.contains_key(id)
    }

    /// Nodes with their handles, in declaration order
    pub fn nodes(&self) -> impl Iterator<Item = (NodeHandle, &ResourceNode)> {
        self.nodes
            .values()
            .enumerate()
            .map(|(i, node)| (NodeHandle::from_index(i), node))
    }

    pub(crate) fn nodes_mut(&mut self) -> impl Iterator<Item = &mut ResourceNode> {
        self.nodes.values_mut()
    }

    /// Declared ordering hints
    #[must_use]
    pub fn hints(&self) -> &[Edge] {
        &self.hints
    }

    /// Check both ends of `edge` name nodes of this graph
    ///
    /// # Errors
    ///
    /// Returns `Intake` if a handle lies past the node list
    pub fn check_edge(&self, edge: &Edge) -> SynthResult<()> {
        for handle in [edge.from, edge.to] {
            if handle.index() >= self.len() {
                return Err(SynthError::intake(format!(
                    "edge names node handle {} but the graph has {} nodes",
                    handle.index(),
                    self.len()
                )));
            }
        }
        Ok(())
    }

    /// Number of nodes
    #[must_use]
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    /// Check if empty
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_deserialized_hint_past_node_list_rejected() {
        let graph: Graph = serde_json::from_str(
            r#"{"nodes":{"A":{"id":"A","resource_type":"Test::Node","properties":{},"outputs":[],"statements":[]}},
                "hints":[{"from":0,"to":5,"kind":"OrderingHint"}]}"#,
        )
        .unwrap();
        let err = graph.check_edge(&graph.hints()[0]).unwrap_err();
        assert!(matches!(err, SynthError::Intake { .. }));
        assert!(graph.check_edge(&Edge::hint(NodeHandle(0), NodeHandle(0))).is_ok());
    }

    #[test]
    fn test_add_node_assigns_handles_in_order() {
        let mut graph = Graph::new();
        let a = graph.add_node("Bucket", "AWS::S3::Bucket", IndexMap::new()).unwrap();
        let b = graph.add_node("Role", "AWS::IAM::Role", IndexMap::new()).unwrap();
        assert_eq!(a.index(), 0);
        assert_eq!(b.index(), 1);
        assert_eq!(graph.node(b).unwrap().id.as_str(), "Role");
        assert_eq!(graph.handle("Bucket"), Some(a));
    }

    #[test]
    fn test_duplicate_id() {
        let mut graph = Graph::new();
        graph.add_node("Bucket", "AWS::S3::Bucket", IndexMap::new()).unwrap();
        let err = graph
            .add_node("Bucket", "AWS::S3::Bucket", IndexMap::new())
            .unwrap_err();
        assert_eq!(err, SynthError::DuplicateId { id: "Bucket".into() });
        assert_eq!(graph.len(), 1);
    }

    #[test]
    fn test_ordering_hint_unknown_node() {
        let mut graph = Graph::new();
        graph.add_node("Policy", "AWS::IAM::Policy", IndexMap::new()).unwrap();
        let err = graph.declare_ordering_hint("Policy", "Role").unwrap_err();
        assert_eq!(
            err,
            SynthError::UnknownNode {
                referrer: None,
                target: "Role".into()
            }
        );
    }

    #[test]
    fn test_ordering_hint_deduplicated() {
        let mut graph = Graph::new();
        graph.add_node("Policy", "AWS::IAM::Policy", IndexMap::new()).unwrap();
        graph.add_node("Role", "AWS::IAM::Role", IndexMap::new()).unwrap();
        graph.declare_ordering_hint("Policy", "Role").unwrap();
        graph.declare_ordering_hint("Policy", "Role").unwrap();
        assert_eq!(graph.hints().len(), 1);
        assert_eq!(graph.hints()[0].kind, EdgeKind::OrderingHint);
    }

    #[test]
    fn test_lookup_checks_attribute() {
        let mut graph = Graph::new();
        graph
            .insert(ResourceNode::new("Bucket", "AWS::S3::Bucket").with_output("Arn"))
            .unwrap();
        let referrer = NodeId::from("Role");
        assert!(graph.lookup(&referrer, "Bucket", Some("Arn")).is_ok());
        assert!(graph.lookup(&referrer, "Bucket", None).is_ok());
        assert_eq!(
            graph.lookup(&referrer, "Bucket", Some("Name")).unwrap_err(),
            SynthError::UnknownAttribute {
                node: referrer.clone(),
                target: "Bucket".into(),
                attribute: "Name".into(),
            }
        );
        assert!(matches!(
            graph.lookup(&referrer, "Missing", None),
            Err(SynthError::UnknownNode { .. })
        ));
    }

    #[test]
    fn test_graph_serde_roundtrip() {
        let mut graph = Graph::new();
        graph
            .insert(
                ResourceNode::new("Role", "AWS::IAM::Role")
                    .with_property("RoleName", Value::string("build"))
                    .with_output("Arn"),
            )
            .unwrap();
        let json = serde_json::to_string(&graph).unwrap();
        let back: Graph = serde_json::from_str(&json).unwrap();
        assert_eq!(back, graph);
    }
}
