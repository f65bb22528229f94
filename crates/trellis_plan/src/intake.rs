//! Declaration intake.
//!
//! Reads a JSON declaration document into a [`Graph`]. Intrinsic objects
//! (`Ref`, `Fn::GetAtt`, `Fn::Join`, `Fn::Sub`) become [`Reference`]s and
//! parameters are substituted as literals before any node is graphed.
//!
//! [`Reference`]: trellis_core::Reference

use crate::graph::{Graph, ResourceNode};
use indexmap::IndexMap;
use serde::de::{Deserializer, MapAccess, Visitor};
use serde::Deserialize;
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::marker::PhantomData;
use trellis_core::value::substitute;
use trellis_core::{NodeId, Scalar, SynthError, SynthResult, Value};
use trellis_policy::{Effect, PolicyStatement, Principal};

type Json = serde_json::Value;

/// A declared parameter
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct ParameterDecl {
    /// `String` or `Number`
    #[serde(rename = "type", default = "default_parameter_type")]
    pub parameter_type: String,
    /// Value used when the caller supplies none
    #[serde(default)]
    pub default: Option<Json>,
    /// Free-form description
    #[serde(default)]
    pub description: Option<String>,
}

fn default_parameter_type() -> String {
    "String".to_string()
}

/// A declared resource
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResourceDecl {
    /// Resource type name
    #[serde(rename = "type")]
    pub resource_type: String,
    /// Property bag in native template syntax
    #[serde(default)]
    pub properties: IndexMap<String, Json>,
    /// Extra output attributes beyond the type schema
    #[serde(default)]
    pub outputs: Vec<String>,
    /// Nodes that must be materialized first
    #[serde(default)]
    pub depends_on: Vec<String>,
    /// Attached policy statements
    #[serde(default)]
    pub statements: Vec<StatementDecl>,
}

/// A declared policy statement
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct StatementDecl {
    /// Optional statement id
    #[serde(default)]
    pub sid: Option<String>,
    /// Effect
    pub effect: Effect,
    /// Principals
    #[serde(default)]
    pub principals: Vec<Principal>,
    /// Action patterns
    pub actions: Vec<String>,
    /// Resources in native template syntax
    #[serde(default)]
    pub resources: Vec<Json>,
    /// Conditions: operator -> key -> value
    #[serde(default)]
    pub conditions: BTreeMap<String, BTreeMap<String, Json>>,
}

/// A parsed declaration document
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct Declarations {
    /// Parameters by name
    #[serde(default)]
    pub parameters: IndexMap<String, ParameterDecl>,
    /// Resources in document order; repeated ids are kept so they can be
    /// reported
    #[serde(default, deserialize_with = "ordered_entries")]
    pub resources: Vec<(String, ResourceDecl)>,
}

fn ordered_entries<'de, D, T>(deserializer: D) -> Result<Vec<(String, T)>, D::Error>
where
    D: Deserializer<'de>,
    T: Deserialize<'de>,
{
    struct EntriesVisitor<T>(PhantomData<T>);

    impl<'de, T: Deserialize<'de>> Visitor<'de> for EntriesVisitor<T> {
        type Value = Vec<(String, T)>;

        fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            f.write_str("a map of resource declarations")
        }

        fn visit_map<A: MapAccess<'de>>(self, mut map: A) -> Result<Self::Value, A::Error> {
            let mut entries = Vec::with_capacity(map.size_hint().unwrap_or(0));
            while let Some(entry) = map.next_entry()? {
                entries.push(entry);
            }
            Ok(entries)
        }
    }

    deserializer.deserialize_map(EntriesVisitor(PhantomData))
}

/// Parse a declaration document
///
/// # Errors
///
/// Returns `Intake` if the JSON is malformed
pub fn parse(json: &str) -> SynthResult<Declarations> {
    Ok(serde_json::from_str(json)?)
}

/// Parse a declaration document and build its graph
///
/// # Errors
///
/// Returns `Intake` for a malformed document, `DuplicateId` or `UnknownNode`
/// for inconsistent declarations
pub fn load_graph(json: &str, overrides: &BTreeMap<String, String>) -> SynthResult<Graph> {
    parse(json)?.into_graph(overrides)
}

impl Declarations {
    /// Bind every parameter to a literal, preferring caller overrides
    ///
    /// # Errors
    ///
    /// Returns `Intake` for an override of an undeclared parameter, a
    /// parameter without any value, or a non-scalar default
    pub fn bind_parameters(
        &self,
        overrides: &BTreeMap<String, String>,
    ) -> SynthResult<BTreeMap<String, Scalar>> {
        if let Some(name) = overrides.keys().find(|k| !self.parameters.contains_key(*k)) {
            return Err(SynthError::intake(format!("unknown parameter '{name}'")));
        }

        let mut bound = BTreeMap::new();
        for (name, decl) in &self.parameters {
            let value = match (overrides.get(name), &decl.default) {
                (Some(text), _) => scalar_from_text(&decl.parameter_type, text),
                (None, Some(default)) => scalar_from_json(default).ok_or_else(|| {
                    SynthError::intake(format!("default of parameter '{name}' must be a scalar"))
                })?,
                (None, None) => {
                    return Err(SynthError::intake(format!("parameter '{name}' has no value")));
                }
            };
            bound.insert(name.clone(), value);
        }
        Ok(bound)
    }

    /// Build the graph these declarations describe
    ///
    /// # Errors
    ///
    /// Returns `Intake`, `DuplicateId` or `UnknownNode`
    pub fn into_graph(self, overrides: &BTreeMap<String, String>) -> SynthResult<Graph> {
        let parameters = self.bind_parameters(overrides)?;
        if let Some((id, _)) = self
            .resources
            .iter()
            .find(|(id, _)| parameters.contains_key(id))
        {
            return Err(SynthError::intake(format!(
                "parameter '{id}' has the same name as a resource"
            )));
        }

        let converter = Converter {
            parameters: &parameters,
        };
        let mut graph = Graph::new();
        let mut hints = Vec::new();
        for (id, decl) in self.resources {
            if !NodeId::from(id.as_str()).is_logical_id() {
                return Err(SynthError::intake(format!(
                    "resource id '{id}' must be non-empty and ASCII alphanumeric"
                )));
            }
            let mut node = ResourceNode::new(id.as_str(), decl.resource_type);
            for (name, json) in &decl.properties {
                node.properties.insert(name.clone(), converter.value(json)?);
            }
            node.outputs.extend(decl.outputs);
            for statement in decl.statements {
                node.statements.push(converter.statement(statement)?);
            }
            graph.insert(node)?;
            hints.extend(decl.depends_on.into_iter().map(|dep| (dep, id.clone())));
        }
        for (from, to) in hints {
            graph.declare_ordering_hint(&from, &to)?;
        }

        tracing::debug!(
            nodes = graph.len(),
            parameters = parameters.len(),
            "declarations loaded"
        );
        Ok(graph)
    }
}

fn scalar_from_text(parameter_type: &str, text: &str) -> Scalar {
    if parameter_type == "Number" {
        if let Ok(i) = text.parse() {
            return Scalar::Int(i);
        }
    }
    Scalar::Str(text.to_string())
}

fn scalar_from_json(json: &Json) -> Option<Scalar> {
    match json {
        Json::Null => Some(Scalar::Null),
        Json::Bool(b) => Some(Scalar::Bool(*b)),
        Json::Number(n) => Some(n.as_i64().map_or_else(|| Scalar::Str(n.to_string()), Scalar::Int)),
        Json::String(s) => Some(Scalar::Str(s.clone())),
        Json::Array(_) | Json::Object(_) => None,
    }
}

struct Converter<'p> {
    parameters: &'p BTreeMap<String, Scalar>,
}

impl Converter<'_> {
    fn value(&self, json: &Json) -> SynthResult<Value> {
        if let Some(scalar) = scalar_from_json(json) {
            return Ok(Value::Literal(scalar));
        }
        match json {
            Json::Array(items) => items
                .iter()
                .map(|item| self.value(item))
                .collect::<SynthResult<Vec<_>>>()
                .map(Value::List),
            Json::Object(map) => {
                if map.len() == 1 {
                    if let Some((key, argument)) = map.iter().next() {
                        if let Some(value) = self.intrinsic(key, argument)? {
                            return Ok(value);
                        }
                    }
                }
                map.iter()
                    .map(|(k, v)| Ok((k.clone(), self.value(v)?)))
                    .collect::<SynthResult<BTreeMap<_, _>>>()
                    .map(Value::Map)
            }
            _ => Err(SynthError::intake("unexpected scalar")),
        }
    }

    fn intrinsic(&self, key: &str, argument: &Json) -> SynthResult<Option<Value>> {
        let value = match key {
            "Ref" => {
                let name = argument
                    .as_str()
                    .ok_or_else(|| SynthError::intake("Ref takes a string"))?;
                match self.parameters.get(name) {
                    Some(scalar) => Value::Literal(scalar.clone()),
                    None => Value::reference(name),
                }
            }
            "Fn::GetAtt" => {
                let (node, attribute) = match argument {
                    Json::String(path) => path.split_once('.').ok_or_else(|| {
                        SynthError::intake(format!("Fn::GetAtt '{path}' must be 'Node.Attribute'"))
                    })?,
                    Json::Array(pair) => match pair.as_slice() {
                        [Json::String(node), Json::String(attribute)] => {
                            (node.as_str(), attribute.as_str())
                        }
                        _ => return Err(SynthError::intake("Fn::GetAtt takes [node, attribute]")),
                    },
                    _ => return Err(SynthError::intake("Fn::GetAtt takes [node, attribute]")),
                };
                Value::get_att(node, attribute)
            }
            "Fn::Join" => match argument.as_array().map(Vec::as_slice) {
                Some([Json::String(delimiter), Json::Array(parts)]) => Value::join(
                    delimiter.as_str(),
                    parts
                        .iter()
                        .map(|part| self.value(part))
                        .collect::<SynthResult<Vec<_>>>()?,
                ),
                _ => return Err(SynthError::intake("Fn::Join takes [delimiter, [parts]]")),
            },
            "Fn::Sub" => match argument {
                Json::String(template) => Value::sub(self.bind_template(template, &BTreeSet::new())),
                Json::Array(pair) => match pair.as_slice() {
                    [Json::String(template), Json::Object(variables)] => {
                        let names = variables.keys().map(String::as_str).collect();
                        let variables = variables
                            .iter()
                            .map(|(k, v)| Ok((k.clone(), self.value(v)?)))
                            .collect::<SynthResult<BTreeMap<_, _>>>()?;
                        Value::sub_with(self.bind_template(template, &names), variables)
                    }
                    _ => return Err(SynthError::intake("Fn::Sub takes [template, {variables}]")),
                },
                _ => return Err(SynthError::intake("Fn::Sub takes a template string")),
            },
            other if other.starts_with("Fn::") => {
                return Err(SynthError::intake(format!("unsupported intrinsic {other}")));
            }
            _ => return Ok(None),
        };
        Ok(Some(value))
    }

    /// Splice parameter values into a template, leaving explicit variables
    fn bind_template(&self, template: &str, variables: &BTreeSet<&str>) -> String {
        substitute(template, |name| {
            if variables.contains(name) {
                return None;
            }
            self.parameters.get(name).and_then(Scalar::to_text)
        })
    }

    fn statement(&self, decl: StatementDecl) -> SynthResult<PolicyStatement> {
        if decl.actions.is_empty() {
            return Err(SynthError::intake("policy statement names no action"));
        }
        let mut statement = PolicyStatement::new(decl.effect).with_actions(decl.actions);
        statement.sid = decl.sid;
        statement.principals = decl.principals.into_iter().collect();
        for resource in &decl.resources {
            statement = statement.with_resource(self.value(resource)?);
        }
        for (operator, keys) in decl.conditions {
            for (key, value) in keys {
                statement = statement.with_condition(operator.clone(), key, self.value(&value)?);
            }
        }
        Ok(statement)
    }
}
