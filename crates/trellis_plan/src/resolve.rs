//! Reference resolution.
//!
//! Rewrites the references in a property tree into [`Resolved`] values.
//! Nodes are resolved in plan order, so a reference to an attribute whose
//! value was fixed by an earlier node's literal property becomes that
//! literal; everything else becomes a [`DeferredOutput`] marker.

use crate::graph::{Graph, NodeHandle};
use crate::validate::FrozenGraph;
use indexmap::IndexMap;
use std::collections::{BTreeMap, HashMap};
use trellis_core::value::{split_placeholder, substitute};
use trellis_core::{
    is_pseudo_parameter, placeholders, DeferredOutput, NodeId, Reference, Resolved, Scalar,
    SynthError, SynthResult, Value,
};

/// What a `Sub` placeholder binds to
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Placeholder<'a> {
    /// An explicit template variable
    Variable,
    /// Supplied by the deployment engine
    Pseudo,
    /// An implicit node reference
    Node {
        handle: NodeHandle,
        target: &'a str,
        attribute: Option<&'a str>,
    },
}

/// Classify a placeholder: explicit variables first, then pseudo
/// parameters, then node references
pub(crate) fn classify<'a>(
    graph: &Graph,
    referrer: &NodeId,
    name: &'a str,
    is_variable: bool,
) -> SynthResult<Placeholder<'a>> {
    if is_variable {
        return Ok(Placeholder::Variable);
    }
    if is_pseudo_parameter(name) {
        return Ok(Placeholder::Pseudo);
    }
    let (target, attribute) = split_placeholder(name);
    if !graph.contains(target) {
        return Err(SynthError::UnresolvedPlaceholder {
            node: referrer.clone(),
            placeholder: name.to_string(),
        });
    }
    let handle = graph.lookup(referrer, target, attribute)?;
    Ok(Placeholder::Node {
        handle,
        target,
        attribute,
    })
}

/// Check every reference in `value` names a declared node and attribute
/// and every `Sub` placeholder is bound
///
/// # Errors
///
/// Returns `UnknownNode`, `UnknownAttribute` or `UnresolvedPlaceholder`
pub fn check_references(graph: &Graph, referrer: &NodeId, value: &Value) -> SynthResult<()> {
    let mut result = Ok(());
    value.walk_references(&mut |reference| {
        if result.is_err() {
            return;
        }
        result = match reference {
            Reference::GetAttribute { node, attribute } => graph
                .lookup(referrer, node.as_str(), Some(attribute.as_str()))
                .map(|_| ()),
            Reference::Ref { node } => graph.lookup(referrer, node.as_str(), None).map(|_| ()),
            Reference::Join { .. } => Ok(()),
            Reference::Sub {
                template,
                variables,
            } => placeholders(template).into_iter().try_for_each(|name| {
                classify(graph, referrer, name, variables.contains_key(name)).map(|_| ())
            }),
        };
    });
    result
}

/// Resolves property trees of a frozen graph
#[derive(Debug)]
pub struct Resolver<'g> {
    frozen: &'g FrozenGraph,
    known: HashMap<NodeHandle, IndexMap<String, Resolved>>,
}

impl<'g> Resolver<'g> {
    /// Create a resolver over a frozen graph
    #[must_use]
    pub fn new(frozen: &'g FrozenGraph) -> Self {
        Self {
            frozen,
            known: HashMap::new(),
        }
    }

    /// Resolve a node's property bag and remember it for later references.
    ///
    /// Call in plan order so every dependency is already known.
    ///
    /// # Errors
    ///
    /// Returns the first resolution failure
    pub fn resolve_node(
        &mut self,
        handle: NodeHandle,
        properties: &IndexMap<String, Value>,
    ) -> SynthResult<IndexMap<String, Resolved>> {
        let frozen = self.frozen;
        let node = frozen
            .graph()
            .node(handle)
            .ok_or_else(|| SynthError::intake(format!("no node at index {}", handle.index())))?;
        let resolved = properties
            .iter()
            .map(|(name, value)| Ok((name.clone(), self.resolve(&node.id, name, value)?)))
            .collect::<SynthResult<IndexMap<_, _>>>()?;
        self.known.insert(handle, resolved.clone());
        Ok(resolved)
    }

    /// Resolve one value held by `referrer` under `property`
    ///
    /// # Errors
    ///
    /// Returns `UnknownNode`, `UnknownAttribute`, `UnresolvedPlaceholder`, or
    /// `InvalidPropertyValue` for a `Join`/`Sub` part that is not a scalar
    pub fn resolve(&self, referrer: &NodeId, property: &str, value: &Value) -> SynthResult<Resolved> {
        match value {
            Value::Literal(scalar) => Ok(Resolved::Literal(scalar.clone())),
            Value::List(items) => items
                .iter()
                .map(|item| self.resolve(referrer, property, item))
                .collect::<SynthResult<Vec<_>>>()
                .map(Resolved::List),
            Value::Map(entries) => entries
                .iter()
                .map(|(k, v)| Ok((k.clone(), self.resolve(referrer, property, v)?)))
                .collect::<SynthResult<BTreeMap<_, _>>>()
                .map(Resolved::Map),
            Value::Reference(reference) => self.resolve_reference(referrer, property, reference),
        }
    }

    fn resolve_reference(
        &self,
        referrer: &NodeId,
        property: &str,
        reference: &Reference,
    ) -> SynthResult<Resolved> {
        let graph = self.frozen.graph();
        match reference {
            Reference::GetAttribute { node, attribute } => {
                let handle = graph.lookup(referrer, node.as_str(), Some(attribute.as_str()))?;
                Ok(self.direct(handle, node, Some(attribute.as_str())))
            }
            Reference::Ref { node } => {
                let handle = graph.lookup(referrer, node.as_str(), None)?;
                Ok(self.direct(handle, node, None))
            }
            Reference::Join { delimiter, parts } => {
                self.resolve_join(referrer, property, delimiter, parts)
            }
            Reference::Sub {
                template,
                variables,
            } => self.resolve_sub(referrer, property, template, variables),
        }
    }

    fn direct(&self, handle: NodeHandle, node: &NodeId, attribute: Option<&str>) -> Resolved {
        match self.known_value(handle, attribute) {
            Some(scalar) => Resolved::Literal(scalar),
            None => Resolved::Deferred(DeferredOutput::new(
                node.clone(),
                attribute.map(str::to_string),
            )),
        }
    }

    /// Plan-time value of an attribute, or of the primary identity when
    /// `attribute` is `None`
    fn known_value(&self, handle: NodeHandle, attribute: Option<&str>) -> Option<Scalar> {
        let schema = self.frozen.schema(handle)?;
        let property = match attribute {
            Some(attribute) => schema.attribute_properties.get(attribute)?,
            None => schema.ref_property.as_ref()?,
        };
        match self.known.get(&handle)?.get(property.as_str())? {
            Resolved::Literal(Scalar::Null) => None,
            Resolved::Literal(scalar) => Some(scalar.clone()),
            _ => None,
        }
    }

    fn resolve_join(
        &self,
        referrer: &NodeId,
        property: &str,
        delimiter: &str,
        parts: &[Value],
    ) -> SynthResult<Resolved> {
        let mut folded: Vec<Resolved> = Vec::with_capacity(parts.len());
        for part in parts {
            match self.resolve(referrer, property, part)? {
                Resolved::Literal(scalar) => {
                    let text = scalar_text(referrer, property, &scalar)?;
                    match folded.last_mut() {
                        Some(Resolved::Literal(Scalar::Str(previous))) => {
                            previous.push_str(delimiter);
                            previous.push_str(&text);
                        }
                        _ => folded.push(Resolved::string(text)),
                    }
                }
                Resolved::List(_) | Resolved::Map(_) => {
                    return Err(SynthError::invalid(
                        referrer,
                        property,
                        "Join parts must be scalars or references",
                    ));
                }
                other => folded.push(other),
            }
        }

        if folded.is_empty() {
            return Ok(Resolved::string(""));
        }
        if folded.len() == 1 && matches!(folded[0], Resolved::Literal(_)) {
            return Ok(folded.remove(0));
        }
        Ok(Resolved::Join {
            delimiter: delimiter.to_string(),
            parts: folded,
        })
    }

    fn resolve_sub(
        &self,
        referrer: &NodeId,
        property: &str,
        template: &str,
        variables: &BTreeMap<String, Value>,
    ) -> SynthResult<Resolved> {
        let mut bindings: HashMap<String, String> = HashMap::new();
        let mut kept = BTreeMap::new();
        for (name, value) in variables {
            match self.resolve(referrer, property, value)? {
                Resolved::Literal(scalar) => {
                    bindings.insert(name.clone(), scalar_text(referrer, property, &scalar)?);
                }
                Resolved::List(_) | Resolved::Map(_) => {
                    return Err(SynthError::invalid(
                        referrer,
                        property,
                        format!("Sub variable '{name}' must be a scalar or reference"),
                    ));
                }
                other => {
                    kept.insert(name.clone(), other);
                }
            }
        }

        let mut implicit: Vec<DeferredOutput> = Vec::new();
        for name in placeholders(template) {
            let is_variable = variables.contains_key(name);
            let Placeholder::Node {
                handle,
                target,
                attribute,
            } = classify(self.frozen.graph(), referrer, name, is_variable)?
            else {
                continue;
            };
            match self.known_value(handle, attribute) {
                Some(scalar) => {
                    bindings.insert(name.to_string(), scalar_text(referrer, property, &scalar)?);
                }
                None => {
                    let deferred =
                        DeferredOutput::new(NodeId::from(target), attribute.map(str::to_string));
                    if !implicit.contains(&deferred) {
                        implicit.push(deferred);
                    }
                }
            }
        }

        let text = substitute(template, |name| bindings.get(name).cloned());
        if kept.is_empty() && implicit.is_empty() && placeholders(&text).is_empty() {
            return Ok(Resolved::string(text));
        }
        Ok(Resolved::Sub {
            template: text,
            variables: kept,
            implicit,
        })
    }
}

fn scalar_text(referrer: &NodeId, property: &str, scalar: &Scalar) -> SynthResult<String> {
    scalar
        .to_text()
        .ok_or_else(|| SynthError::invalid(referrer, property, "null cannot be spliced into text"))
}
