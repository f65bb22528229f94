//! Synthesis error taxonomy.
//!
//! Every error is structural and raised at synthesis time. None of them is
//! transient, so nothing here is ever retried.

use crate::id::NodeId;
use thiserror::Error;

/// Synthesis result type
pub type SynthResult<T> = Result<T, SynthError>;

/// Synthesis error type
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SynthError {
    /// A node id was declared twice
    #[error("Duplicate node id: {id}")]
    DuplicateId {
        /// The repeated id
        id: NodeId,
    },

    /// A reference or ordering hint names a node that was never declared
    #[error(
        "Unknown node {target}{}",
        .referrer.as_ref().map(|r| format!(" referenced from {r}")).unwrap_or_default()
    )]
    UnknownNode {
        /// Node holding the reference, if any
        referrer: Option<NodeId>,
        /// The missing node
        target: NodeId,
    },

    /// `GetAttribute` names an attribute the target does not expose
    #[error("Unknown attribute {target}.{attribute} referenced from {node}")]
    UnknownAttribute {
        /// Node holding the reference
        node: NodeId,
        /// Node the attribute was requested from
        target: NodeId,
        /// The missing attribute
        attribute: String,
    },

    /// A `Sub` template placeholder has no binding
    #[error("Unresolved placeholder ${{{placeholder}}} in {node}")]
    UnresolvedPlaceholder {
        /// Node holding the template
        node: NodeId,
        /// Placeholder name without the `${}` delimiters
        placeholder: String,
    },

    /// The dependency graph contains a cycle
    #[error("Cyclic dependency: {}", join_cycle(.cycle))]
    CyclicDependency {
        /// Full cycle path; the first id is repeated at the end
        cycle: Vec<NodeId>,
    },

    /// A write-class grant on a protected resource has no paired
    /// deny-unless-encrypted statement
    #[error("Insecure grant of {action} on {resource} by {principal}: no deny-unless-encrypted statement")]
    InsecureResourceGrant {
        /// Node carrying the Allow statement
        principal: NodeId,
        /// The protected resource node
        resource: NodeId,
        /// The guarded action that was granted
        action: String,
    },

    /// A property holds a value the engine refuses to carry into a plan
    #[error("Invalid value for {node}.{property}: {reason}")]
    InvalidPropertyValue {
        /// Offending node
        node: NodeId,
        /// Property path
        property: String,
        /// Human-readable reason
        reason: String,
    },

    /// The declaration document itself is malformed
    #[error("Invalid declaration document: {reason}")]
    Intake {
        /// Human-readable reason
        reason: String,
    },
}

impl SynthError {
    /// Node ids involved in the error, in report order
    #[must_use]
    pub fn nodes(&self) -> Vec<&NodeId> {
        match self {
            Self::DuplicateId { id } => vec![id],
            Self::UnknownNode { referrer, target } => {
                referrer.iter().chain(std::iter::once(target)).collect()
            }
            Self::UnknownAttribute { node, target, .. } => vec![node, target],
            Self::UnresolvedPlaceholder { node, .. } => vec![node],
            Self::CyclicDependency { cycle } => match cycle.split_last() {
                // Last entry closes the loop
                Some((_, rest)) if !rest.is_empty() => rest.iter().collect(),
                _ => cycle.iter().collect(),
            },
            Self::InsecureResourceGrant {
                principal, resource, ..
            } => vec![principal, resource],
            Self::InvalidPropertyValue { node, .. } => vec![node],
            Self::Intake { .. } => Vec::new(),
        }
    }

    /// Shorthand for an invalid property value
    #[must_use]
    pub fn invalid(node: &NodeId, property: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::InvalidPropertyValue {
            node: node.clone(),
            property: property.into(),
            reason: reason.into(),
        }
    }

    /// Shorthand for an intake failure
    #[must_use]
    pub fn intake(reason: impl Into<String>) -> Self {
        Self::Intake {
            reason: reason.into(),
        }
    }
}

fn join_cycle(cycle: &[NodeId]) -> String {
    cycle
        .iter()
        .map(NodeId::as_str)
        .collect::<Vec<_>>()
        .join(" -> ")
}

impl From<serde_json::Error> for SynthError {
    fn from(err: serde_json::Error) -> Self {
        Self::Intake {
            reason: err.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = SynthError::DuplicateId {
            id: NodeId::from("Bucket"),
        };
        assert_eq!(format!("{}", err), "Duplicate node id: Bucket");

        let err = SynthError::UnknownNode {
            referrer: Some(NodeId::from("Role")),
            target: NodeId::from("Bucket"),
        };
        assert_eq!(format!("{}", err), "Unknown node Bucket referenced from Role");

        let err = SynthError::UnknownNode {
            referrer: None,
            target: NodeId::from("Bucket"),
        };
        assert_eq!(format!("{}", err), "Unknown node Bucket");
    }

    #[test]
    fn test_placeholder_display() {
        let err = SynthError::UnresolvedPlaceholder {
            node: NodeId::from("Policy"),
            placeholder: "project".to_string(),
        };
        assert_eq!(err.to_string(), "Unresolved placeholder ${project} in Policy");
    }

    #[test]
    fn test_cycle_display_and_nodes() {
        let err = SynthError::CyclicDependency {
            cycle: vec!["Role".into(), "Pipeline".into(), "Role".into()],
        };
        assert_eq!(err.to_string(), "Cyclic dependency: Role -> Pipeline -> Role");
        let nodes: Vec<&str> = err.nodes().into_iter().map(NodeId::as_str).collect();
        assert_eq!(nodes, vec!["Role", "Pipeline"]);
    }

    #[test]
    fn test_self_cycle_nodes() {
        let err = SynthError::CyclicDependency {
            cycle: vec!["Loop".into(), "Loop".into()],
        };
        assert_eq!(err.nodes().len(), 1);
    }

    #[test]
    fn test_grant_nodes() {
        let err = SynthError::InsecureResourceGrant {
            principal: "Role".into(),
            resource: "Bucket".into(),
            action: "s3:PutObject".to_string(),
        };
        let s = err.to_string();
        assert!(s.contains("s3:PutObject"));
        assert_eq!(err.nodes().len(), 2);
    }

    #[test]
    fn test_from_json_error() {
        let err: SynthError = serde_json::from_str::<serde_json::Value>("{")
            .unwrap_err()
            .into();
        assert!(matches!(err, SynthError::Intake { .. }));
    }
}
