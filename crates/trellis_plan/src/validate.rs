//! Cycle and completeness validation.
//!
//! Validation consumes a [`Graph`] and, if it is sound, freezes it into a
//! [`FrozenGraph`]: nodes carry their schema outputs, security rules have
//! been applied, and the full edge set is known. Nothing mutates a frozen
//! graph.

use crate::graph::{Edge, Graph, NodeHandle, ResourceNode};
use crate::grapher::{derive_edges, find_cycle};
use crate::resolve::check_references;
use crate::schema::{TypeRegistry, TypeSchema};
use crate::security::{self, IngressMode};
use trellis_core::{NodeId, SynthError, SynthResult};
use trellis_policy::{PolicyStatement, ProtectedResource};

/// A validated, read-only graph
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FrozenGraph {
    graph: Graph,
    schemas: Vec<TypeSchema>,
    edges: Vec<Edge>,
}

impl FrozenGraph {
    /// The underlying graph
    #[must_use]
    pub fn graph(&self) -> &Graph {
        &self.graph
    }

    /// Schema of a node
    #[must_use]
    pub fn schema(&self, handle: NodeHandle) -> Option<&TypeSchema> {
        self.schemas.get(handle.index())
    }

    /// All edges: data dependencies, then ordering hints
    #[must_use]
    pub fn edges(&self) -> &[Edge] {
        &self.edges
    }

    /// Direct dependencies of a node, in declaration order
    #[must_use]
    pub fn predecessors(&self, handle: NodeHandle) -> Vec<NodeHandle> {
        let mut from: Vec<NodeHandle> = self
            .edges
            .iter()
            .filter(|e| e.to == handle)
            .map(|e| e.from)
            .collect();
        from.sort_unstable();
        from.dedup();
        from
    }

    /// Statements attached to each node, in declaration order
    pub fn attachments(&self) -> impl Iterator<Item = (&NodeId, &[PolicyStatement])> {
        self.graph
            .nodes()
            .map(|(_, node)| (&node.id, node.statements.as_slice()))
    }

    /// Every encryption-capable node
    #[must_use]
    pub fn protected(&self) -> Vec<ProtectedResource> {
        self.graph
            .nodes()
            .filter_map(|(handle, node)| {
                let protection = self.schema(handle)?.protection.clone()?;
                Some(ProtectedResource {
                    node: node.id.clone(),
                    protection,
                })
            })
            .collect()
    }
}

/// Validator for declared graphs
#[derive(Debug, Clone)]
pub struct Validator<'r> {
    registry: &'r TypeRegistry,
    ingress_mode: IngressMode,
}

impl<'r> Validator<'r> {
    /// Create a validator using `registry` for type schemas
    #[must_use]
    pub fn new(registry: &'r TypeRegistry) -> Self {
        Self {
            registry,
            ingress_mode: IngressMode::default(),
        }
    }

    /// Set duplicate ingress rule handling
    #[must_use]
    pub fn with_ingress_mode(mut self, mode: IngressMode) -> Self {
        self.ingress_mode = mode;
        self
    }

    /// Validate and freeze a graph
    ///
    /// # Errors
    ///
    /// Returns the first structural error found: `InvalidPropertyValue` for
    /// security rules or misplaced statements, `UnknownNode`,
    /// `UnknownAttribute`, `UnresolvedPlaceholder`, then `CyclicDependency`
    pub fn validate(&self, mut graph: Graph) -> SynthResult<FrozenGraph> {
        let mut schemas = Vec::with_capacity(graph.len());
        let mut dropped = 0;
        for node in graph.nodes_mut() {
            let schema = self.registry.schema_for(&node.resource_type);
            node.outputs.extend(schema.outputs.iter().cloned());
            check_statement_holder(node, &schema)?;
            dropped += security::enforce(node, &schema, self.ingress_mode)?;
            schemas.push(schema);
        }

        for (_, node) in graph.nodes() {
            let values = node
                .properties
                .values()
                .chain(node.statements.iter().flat_map(PolicyStatement::values));
            for value in values {
                check_references(&graph, &node.id, value)?;
            }
        }

        let edges = derive_edges(&graph)?;
        if let Some(cycle) = find_cycle(&graph, &edges) {
            return Err(SynthError::CyclicDependency { cycle });
        }

        tracing::info!(
            nodes = graph.len(),
            edges = edges.len(),
            dropped_rules = dropped,
            "graph validated"
        );
        Ok(FrozenGraph {
            graph,
            schemas,
            edges,
        })
    }
}

fn check_statement_holder(node: &ResourceNode, schema: &TypeSchema) -> SynthResult<()> {
    if node.statements.is_empty() || schema.policy.accepts_statements() {
        return Ok(());
    }
    Err(SynthError::invalid(
        &node.id,
        "statements",
        format!("type {} does not carry policy statements", node.resource_type),
    ))
}
