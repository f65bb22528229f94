//! Property values, symbolic references and their resolved forms.
//!
//! A declared property bag is a tree of [`Value`]s. References to other
//! nodes are embedded as [`Reference`] leaves and are rewritten into
//! [`Resolved`] values once the graph is frozen: either concrete literals or
//! [`DeferredOutput`] markers for attributes only known after materialization.

use crate::id::NodeId;
use once_cell::sync::Lazy;
use regex::{Captures, Regex};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

static PLACEHOLDER: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\$\{([^}]*)\}").expect("placeholder pattern is valid"));

/// Names of the `${...}` placeholders in a `Sub` template, in order.
///
/// `${!Name}` is a literal escape and is not reported.
#[must_use]
pub fn placeholders(template: &str) -> Vec<&str> {
    PLACEHOLDER
        .captures_iter(template)
        .filter_map(|caps| caps.get(1))
        .map(|m| m.as_str())
        .filter(|name| !name.starts_with('!'))
        .collect()
}

/// Replace placeholders for which `bind` returns a value; others are kept verbatim
pub fn substitute(template: &str, mut bind: impl FnMut(&str) -> Option<String>) -> String {
    PLACEHOLDER
        .replace_all(template, |caps: &Captures<'_>| {
            let name = caps.get(1).map_or("", |m| m.as_str());
            if name.starts_with('!') {
                return caps[0].to_string();
            }
            bind(name).unwrap_or_else(|| caps[0].to_string())
        })
        .into_owned()
}

/// Pseudo parameters are supplied by the deployment engine, never by a node
#[must_use]
pub fn is_pseudo_parameter(name: &str) -> bool {
    name.starts_with("AWS::")
}

/// Split an implicit placeholder `Node.Attr` into node and attribute
#[must_use]
pub fn split_placeholder(name: &str) -> (&str, Option<&str>) {
    match name.split_once('.') {
        Some((node, attribute)) => (node, Some(attribute)),
        None => (name, None),
    }
}

/// A scalar leaf
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Scalar {
    /// Null
    Null,
    /// Boolean
    Bool(bool),
    /// Integer
    Int(i64),
    /// String (non-integer numbers are carried in textual form)
    Str(String),
}

impl Scalar {
    /// Get as string slice if this is a string
    #[must_use]
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::Str(s) => Some(s),
            _ => None,
        }
    }

    /// Get as integer, accepting numeric strings
    #[must_use]
    pub fn as_int(&self) -> Option<i64> {
        match self {
            Self::Int(i) => Some(*i),
            Self::Str(s) => s.parse().ok(),
            _ => None,
        }
    }

    /// Text used when the scalar is spliced into a `Join` or `Sub`
    #[must_use]
    pub fn to_text(&self) -> Option<String> {
        match self {
            Self::Null => None,
            Self::Bool(b) => Some(b.to_string()),
            Self::Int(i) => Some(i.to_string()),
            Self::Str(s) => Some(s.clone()),
        }
    }
}

/// A property value as declared
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Value {
    /// Scalar literal
    Literal(Scalar),
    /// Ordered list
    List(Vec<Value>),
    /// String-keyed map
    Map(BTreeMap<String, Value>),
    /// Symbolic reference to another node
    Reference(Box<Reference>),
}

impl Value {
    /// String literal
    #[must_use]
    pub fn string(s: impl Into<String>) -> Self {
        Self::Literal(Scalar::Str(s.into()))
    }

    /// Integer literal
    #[must_use]
    pub fn int(i: i64) -> Self {
        Self::Literal(Scalar::Int(i))
    }

    /// Boolean literal
    #[must_use]
    pub fn bool(b: bool) -> Self {
        Self::Literal(Scalar::Bool(b))
    }

    /// List of values
    #[must_use]
    pub fn list(items: impl IntoIterator<Item = Value>) -> Self {
        Self::List(items.into_iter().collect())
    }

    /// Map of values
    #[must_use]
    pub fn map<K: Into<String>>(entries: impl IntoIterator<Item = (K, Value)>) -> Self {
        Self::Map(entries.into_iter().map(|(k, v)| (k.into(), v)).collect())
    }

    /// `GetAttribute(node, attribute)`
    #[must_use]
    pub fn get_att(node: impl Into<NodeId>, attribute: impl Into<String>) -> Self {
        Self::from(Reference::GetAttribute {
            node: node.into(),
            attribute: attribute.into(),
        })
    }

    /// `Ref(node)`
    #[must_use]
    pub fn reference(node: impl Into<NodeId>) -> Self {
        Self::from(Reference::Ref { node: node.into() })
    }

    /// `Join(delimiter, parts)`
    #[must_use]
    pub fn join(delimiter: impl Into<String>, parts: impl IntoIterator<Item = Value>) -> Self {
        Self::from(Reference::Join {
            delimiter: delimiter.into(),
            parts: parts.into_iter().collect(),
        })
    }

    /// `Sub(template)` with implicit placeholders only
    #[must_use]
    pub fn sub(template: impl Into<String>) -> Self {
        Self::sub_with(template, BTreeMap::new())
    }

    /// `Sub(template, variables)`
    #[must_use]
    pub fn sub_with(template: impl Into<String>, variables: BTreeMap<String, Value>) -> Self {
        Self::from(Reference::Sub {
            template: template.into(),
            variables,
        })
    }

    /// Get the scalar if this is a literal
    #[must_use]
    pub fn as_literal(&self) -> Option<&Scalar> {
        match self {
            Self::Literal(s) => Some(s),
            _ => None,
        }
    }

    /// Get as string slice if this is a string literal
    #[must_use]
    pub fn as_str(&self) -> Option<&str> {
        self.as_literal().and_then(Scalar::as_str)
    }

    /// Get the items if this is a list
    #[must_use]
    pub fn as_list(&self) -> Option<&[Value]> {
        match self {
            Self::List(items) => Some(items),
            _ => None,
        }
    }

    /// Get the entries if this is a map
    #[must_use]
    pub fn as_map(&self) -> Option<&BTreeMap<String, Value>> {
        match self {
            Self::Map(entries) => Some(entries),
            _ => None,
        }
    }

    /// Text this value folds to without any node's outputs: a literal, or a
    /// `Join`/`Sub` whose parts and bindings are all constant. `None` when
    /// the value depends on a node, a pseudo parameter or a null.
    #[must_use]
    pub fn constant_text(&self) -> Option<String> {
        match self {
            Self::Literal(scalar) => scalar.to_text(),
            Self::List(_) | Self::Map(_) => None,
            Self::Reference(reference) => match reference.as_ref() {
                Reference::GetAttribute { .. } | Reference::Ref { .. } => None,
                Reference::Join { delimiter, parts } => parts
                    .iter()
                    .map(Value::constant_text)
                    .collect::<Option<Vec<_>>>()
                    .map(|texts| texts.join(delimiter)),
                Reference::Sub {
                    template,
                    variables,
                } => {
                    let mut bindings = BTreeMap::new();
                    for name in placeholders(template) {
                        let text = variables.get(name)?.constant_text()?;
                        bindings.insert(name.to_string(), text);
                    }
                    Some(substitute(template, |name| bindings.get(name).cloned()))
                }
            },
        }
    }

    /// Visit every reference in the tree, outermost first
    pub fn walk_references<'a>(&'a self, visit: &mut impl FnMut(&'a Reference)) {
        match self {
            Self::Literal(_) => {}
            Self::List(items) => items.iter().for_each(|v| v.walk_references(visit)),
            Self::Map(entries) => entries.values().for_each(|v| v.walk_references(visit)),
            Self::Reference(reference) => {
                visit(reference);
                match reference.as_ref() {
                    Reference::GetAttribute { .. } | Reference::Ref { .. } => {}
                    Reference::Join { parts, .. } => {
                        parts.iter().for_each(|v| v.walk_references(visit));
                    }
                    Reference::Sub { variables, .. } => {
                        variables.values().for_each(|v| v.walk_references(visit));
                    }
                }
            }
        }
    }

    /// Node ids named anywhere in the tree, explicit and implicit, in order
    #[must_use]
    pub fn referenced_nodes(&self) -> Vec<&str> {
        let mut nodes = Vec::new();
        self.walk_references(&mut |reference| match reference {
            Reference::GetAttribute { node, .. } | Reference::Ref { node } => {
                nodes.push(node.as_str());
            }
            Reference::Join { .. } => {}
            Reference::Sub {
                template,
                variables,
            } => {
                nodes.extend(
                    placeholders(template)
                        .into_iter()
                        .filter(|p| !variables.contains_key(*p) && !is_pseudo_parameter(p))
                        .map(|p| split_placeholder(p).0),
                );
            }
        });
        nodes
    }
}

impl From<Reference> for Value {
    fn from(reference: Reference) -> Self {
        Self::Reference(Box::new(reference))
    }
}

impl From<Scalar> for Value {
    fn from(scalar: Scalar) -> Self {
        Self::Literal(scalar)
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Self::string(s)
    }
}

/// Symbolic reference embedded in a property value
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Reference {
    /// An output attribute of another node
    GetAttribute {
        /// Target node
        node: NodeId,
        /// Attribute name; must be one of the target's outputs
        attribute: String,
    },
    /// The primary identity of another node
    Ref {
        /// Target node
        node: NodeId,
    },
    /// Concatenation of parts with a delimiter
    Join {
        /// Delimiter inserted between parts
        delimiter: String,
        /// Parts to join
        parts: Vec<Value>,
    },
    /// Template substitution
    Sub {
        /// Template containing `${name}` placeholders
        template: String,
        /// Explicit placeholder bindings
        variables: BTreeMap<String, Value>,
    },
}

impl Reference {
    /// Target node and attribute for direct references
    #[must_use]
    pub fn target(&self) -> Option<(&NodeId, Option<&str>)> {
        match self {
            Self::GetAttribute { node, attribute } => Some((node, Some(attribute.as_str()))),
            Self::Ref { node } => Some((node, None)),
            Self::Join { .. } | Self::Sub { .. } => None,
        }
    }
}

/// Plan-time placeholder for a value only known after materialization
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct DeferredOutput {
    /// Node whose materialization produces the value
    pub node: NodeId,
    /// Attribute name; `None` stands for the node's primary identity
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub attribute: Option<String>,
}

impl DeferredOutput {
    /// Create a deferred output marker
    #[must_use]
    pub fn new(node: NodeId, attribute: Option<String>) -> Self {
        Self { node, attribute }
    }
}

/// A property value after reference resolution
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Resolved {
    /// Concrete scalar
    Literal(Scalar),
    /// Ordered list
    List(Vec<Resolved>),
    /// String-keyed map
    Map(BTreeMap<String, Resolved>),
    /// Value known only after materialization
    Deferred(DeferredOutput),
    /// Join that still contains deferred parts
    Join {
        /// Delimiter inserted between parts
        delimiter: String,
        /// Parts, adjacent literals already folded
        parts: Vec<Resolved>,
    },
    /// Template that still contains deferred or pseudo placeholders
    Sub {
        /// Template with literal bindings already substituted
        template: String,
        /// Remaining explicit bindings
        variables: BTreeMap<String, Resolved>,
        /// Deferred outputs named by implicit placeholders left in the template
        implicit: Vec<DeferredOutput>,
    },
}

impl Resolved {
    /// String literal
    #[must_use]
    pub fn string(s: impl Into<String>) -> Self {
        Self::Literal(Scalar::Str(s.into()))
    }

    /// Get the scalar if this is a literal
    #[must_use]
    pub fn as_literal(&self) -> Option<&Scalar> {
        match self {
            Self::Literal(s) => Some(s),
            _ => None,
        }
    }

    /// Get as string slice if this is a string literal
    #[must_use]
    pub fn as_str(&self) -> Option<&str> {
        self.as_literal().and_then(Scalar::as_str)
    }

    /// Every deferred output in the tree, in traversal order
    #[must_use]
    pub fn deferred_outputs(&self) -> Vec<&DeferredOutput> {
        let mut out = Vec::new();
        self.collect_deferred(&mut out);
        out
    }

    fn collect_deferred<'a>(&'a self, out: &mut Vec<&'a DeferredOutput>) {
        match self {
            Self::Literal(_) => {}
            Self::List(items) | Self::Join { parts: items, .. } => {
                items.iter().for_each(|v| v.collect_deferred(out));
            }
            Self::Map(entries) => entries.values().for_each(|v| v.collect_deferred(out)),
            Self::Deferred(deferred) => out.push(deferred),
            Self::Sub {
                variables,
                implicit,
                ..
            } => {
                out.extend(implicit.iter());
                variables.values().for_each(|v| v.collect_deferred(out));
            }
        }
    }
}

impl From<Scalar> for Resolved {
    fn from(scalar: Scalar) -> Self {
        Self::Literal(scalar)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_placeholders() {
        let names = placeholders("arn:aws:logs:${AWS::Region}:${AWS::AccountId}:/aws/codebuild/${project}");
        assert_eq!(names, vec!["AWS::Region", "AWS::AccountId", "project"]);
    }

    #[test]
    fn test_placeholder_escape() {
        assert!(placeholders("${!Literal}").is_empty());
        assert_eq!(substitute("${!Literal}-${x}", |_| Some("1".into())), "${!Literal}-1");
    }

    #[test]
    fn test_substitute_keeps_unbound() {
        let out = substitute("${AWS::Region}/${name}", |p| {
            (p == "name").then(|| "bucket".to_string())
        });
        assert_eq!(out, "${AWS::Region}/bucket");
    }

    #[test]
    fn test_split_placeholder() {
        assert_eq!(split_placeholder("Bucket.Arn"), ("Bucket", Some("Arn")));
        assert_eq!(split_placeholder("Bucket"), ("Bucket", None));
    }

    #[test]
    fn test_scalar_text() {
        assert_eq!(Scalar::Int(80).to_text(), Some("80".to_string()));
        assert_eq!(Scalar::Null.to_text(), None);
        assert_eq!(Scalar::Str("22".into()).as_int(), Some(22));
    }

    #[test]
    fn test_constant_text_folds_join_and_sub() {
        let join = Value::join("", [Value::string("0.0.0.0"), Value::string("/0")]);
        assert_eq!(join.constant_text().as_deref(), Some("0.0.0.0/0"));
        let sub = Value::sub_with(
            "${Ip}/${Prefix}",
            BTreeMap::from([
                ("Ip".to_string(), Value::string("10.0.0.1")),
                ("Prefix".to_string(), Value::int(32)),
            ]),
        );
        assert_eq!(sub.constant_text().as_deref(), Some("10.0.0.1/32"));
        assert_eq!(Value::sub("not-an-ip/99").constant_text().as_deref(), Some("not-an-ip/99"));
    }

    #[test]
    fn test_constant_text_stops_at_outputs() {
        assert_eq!(Value::get_att("VPC", "CidrBlock").constant_text(), None);
        assert_eq!(Value::sub("${AWS::Region}a").constant_text(), None);
        assert_eq!(Value::sub("${VPC.CidrBlock}").constant_text(), None);
        let join = Value::join("", [Value::reference("Bucket"), Value::string("/*")]);
        assert_eq!(join.constant_text(), None);
        assert_eq!(Value::list([Value::string("a")]).constant_text(), None);
    }

    #[test]
    fn test_referenced_nodes_nested() {
        let value = Value::list([
            Value::get_att("ArtifactBucket", "Arn"),
            Value::join("", [Value::get_att("ArtifactBucket", "Arn"), Value::string("/*")]),
            Value::sub("${AppBuildProject}:${AWS::Region}:${Repo.Name}"),
        ]);
        let nodes = value.referenced_nodes();
        assert_eq!(
            nodes,
            vec!["ArtifactBucket", "ArtifactBucket", "AppBuildProject", "Repo"]
        );
    }

    #[test]
    fn test_sub_explicit_variables_not_nodes() {
        let mut vars = BTreeMap::new();
        vars.insert("project".to_string(), Value::reference("AppBuildProject"));
        let value = Value::sub_with("/aws/codebuild/${project}", vars);
        assert_eq!(value.referenced_nodes(), vec!["AppBuildProject"]);
    }

    #[test]
    fn test_reference_target() {
        let r = Reference::GetAttribute {
            node: "Role".into(),
            attribute: "Arn".into(),
        };
        assert_eq!(r.target(), Some((&NodeId::from("Role"), Some("Arn"))));
        let j = Reference::Join {
            delimiter: String::new(),
            parts: vec![],
        };
        assert!(j.target().is_none());
    }

    #[test]
    fn test_resolved_deferred_outputs() {
        let deferred = DeferredOutput::new("Role".into(), Some("Arn".into()));
        let value = Resolved::Map(
            [
                ("Name".to_string(), Resolved::string("x")),
                ("RoleArn".to_string(), Resolved::Deferred(deferred.clone())),
            ]
            .into_iter()
            .collect(),
        );
        assert_eq!(value.deferred_outputs(), vec![&deferred]);
        assert!(Resolved::string("x").deferred_outputs().is_empty());
    }

    #[test]
    fn test_scalar_untagged_serde() {
        let s: Scalar = serde_json::from_str("80").unwrap();
        assert_eq!(s, Scalar::Int(80));
        let s: Scalar = serde_json::from_str("null").unwrap();
        assert_eq!(s, Scalar::Null);
        assert_eq!(serde_json::to_string(&Scalar::Str("a".into())).unwrap(), "\"a\"");
    }

    proptest! {
        #[test]
        fn prop_unbound_substitution_is_identity(
            parts in prop::collection::vec(("[a-z/:-]{0,6}", "[A-Za-z]{1,8}"), 0..6)
        ) {
            let template: String = parts
                .iter()
                .map(|(text, name)| format!("{text}${{{name}}}"))
                .collect();
            prop_assert_eq!(substitute(&template, |_| None), template.clone());
            let names: Vec<&str> = parts.iter().map(|(_, name)| name.as_str()).collect();
            prop_assert_eq!(placeholders(&template), names);
        }
    }
}
