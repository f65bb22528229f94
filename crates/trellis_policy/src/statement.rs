//! Policy statements and statement sets.

use crate::matcher::action_matches;
use indexmap::IndexSet;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use trellis_core::{Scalar, Value};

/// Policy document version emitted with every statement set
pub const POLICY_VERSION: &str = "2012-10-17";

/// Statement effect
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Effect {
    /// Grant
    Allow,
    /// Refuse; wins over Allow
    Deny,
}

impl Effect {
    /// Name used in policy documents
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Allow => "Allow",
            Self::Deny => "Deny",
        }
    }
}

/// Who a statement applies to
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Principal {
    /// Everyone (`*`)
    #[serde(rename = "*")]
    Any,
    /// A service principal such as `codebuild.amazonaws.com`
    Service(String),
    /// An account or role ARN
    Aws(String),
}

/// A single allow/deny statement
///
/// An empty principal set means the statement is an identity policy: the
/// node carrying it is the principal.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PolicyStatement {
    /// Optional statement id
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sid: Option<String>,
    /// Effect
    pub effect: Effect,
    /// Principals
    #[serde(default)]
    pub principals: BTreeSet<Principal>,
    /// Action patterns
    pub actions: BTreeSet<String>,
    /// Resources; usually references to other nodes' ARNs
    pub resources: Vec<Value>,
    /// Conditions: operator -> key -> value
    #[serde(default)]
    pub conditions: BTreeMap<String, BTreeMap<String, Value>>,
}

impl PolicyStatement {
    /// Create an empty statement with the given effect
    #[must_use]
    pub fn new(effect: Effect) -> Self {
        Self {
            sid: None,
            effect,
            principals: BTreeSet::new(),
            actions: BTreeSet::new(),
            resources: Vec::new(),
            conditions: BTreeMap::new(),
        }
    }

    /// Create an Allow statement
    #[must_use]
    pub fn allow() -> Self {
        Self::new(Effect::Allow)
    }

    /// Create a Deny statement
    #[must_use]
    pub fn deny() -> Self {
        Self::new(Effect::Deny)
    }

    /// Set the statement id
    #[must_use]
    pub fn with_sid(mut self, sid: impl Into<String>) -> Self {
        self.sid = Some(sid.into());
        self
    }

    /// Add a principal
    #[must_use]
    pub fn with_principal(mut self, principal: Principal) -> Self {
        self.principals.insert(principal);
        self
    }

    /// Add an action pattern
    #[must_use]
    pub fn with_action(mut self, action: impl Into<String>) -> Self {
        self.actions.insert(action.into());
        self
    }

    /// Add several action patterns
    #[must_use]
    pub fn with_actions<S: Into<String>>(mut self, actions: impl IntoIterator<Item = S>) -> Self {
        self.actions.extend(actions.into_iter().map(Into::into));
        self
    }

    /// Add a resource; duplicates are ignored
    #[must_use]
    pub fn with_resource(mut self, resource: Value) -> Self {
        if !self.resources.contains(&resource) {
            self.resources.push(resource);
        }
        self
    }

    /// Add a condition
    #[must_use]
    pub fn with_condition(
        mut self,
        operator: impl Into<String>,
        key: impl Into<String>,
        value: Value,
    ) -> Self {
        self.conditions
            .entry(operator.into())
            .or_default()
            .insert(key.into(), value);
        self
    }

    /// Check if any condition is attached
    #[must_use]
    pub fn is_conditional(&self) -> bool {
        self.conditions.values().any(|keys| !keys.is_empty())
    }

    /// Check if the statement covers `action` through one of its patterns
    #[must_use]
    pub fn covers_action(&self, action: &str) -> bool {
        self.actions.iter().any(|pattern| action_matches(pattern, action))
    }

    /// Check if any resource names `node`, directly or nested
    #[must_use]
    pub fn references_node(&self, node: &str) -> bool {
        self.resources
            .iter()
            .any(|r| r.referenced_nodes().contains(&node))
    }

    /// Check if a condition constrains `key` under any operator
    #[must_use]
    pub fn constrains_key(&self, key: &str) -> bool {
        self.conditions.values().any(|keys| keys.contains_key(key))
    }

    /// Check if the statement names the `*` resource
    #[must_use]
    pub fn has_wildcard_resource(&self) -> bool {
        self.resources.iter().any(|r| r.as_str() == Some("*"))
    }

    /// Node ids referenced from resources and condition values
    #[must_use]
    pub fn referenced_nodes(&self) -> Vec<&str> {
        self.resources
            .iter()
            .chain(self.conditions.values().flat_map(BTreeMap::values))
            .flat_map(Value::referenced_nodes)
            .collect()
    }

    /// Every value held by the statement, for reference checks
    pub fn values(&self) -> impl Iterator<Item = &Value> {
        self.resources
            .iter()
            .chain(self.conditions.values().flat_map(BTreeMap::values))
    }

    /// Render as a policy-document statement value
    #[must_use]
    pub fn to_value(&self) -> Value {
        let mut entries: BTreeMap<String, Value> = BTreeMap::new();
        if let Some(sid) = &self.sid {
            entries.insert("Sid".to_string(), Value::string(sid.clone()));
        }
        entries.insert("Effect".to_string(), Value::string(self.effect.as_str()));
        if !self.principals.is_empty() {
            entries.insert("Principal".to_string(), principal_value(&self.principals));
        }
        entries.insert(
            "Action".to_string(),
            Value::list(self.actions.iter().map(|a| Value::string(a.clone()))),
        );
        entries.insert("Resource".to_string(), Value::list(self.resources.iter().cloned()));
        if self.is_conditional() {
            entries.insert(
                "Condition".to_string(),
                Value::map(
                    self.conditions
                        .iter()
                        .map(|(op, keys)| (op.clone(), Value::Map(keys.clone()))),
                ),
            );
        }
        Value::Map(entries)
    }
}

fn principal_value(principals: &BTreeSet<Principal>) -> Value {
    if principals.contains(&Principal::Any) {
        return Value::string("*");
    }
    let mut services = Vec::new();
    let mut accounts = Vec::new();
    for principal in principals {
        match principal {
            Principal::Any => {}
            Principal::Service(s) => services.push(Value::string(s.clone())),
            Principal::Aws(a) => accounts.push(Value::string(a.clone())),
        }
    }
    let mut entries = BTreeMap::new();
    if !accounts.is_empty() {
        entries.insert("AWS".to_string(), Value::List(accounts));
    }
    if !services.is_empty() {
        entries.insert("Service".to_string(), Value::List(services));
    }
    Value::Map(entries)
}

/// Order-insensitive set of statements attached to one node
///
/// Insertion order is kept so emission is deterministic. Merging is a set
/// union followed by deny precedence, so merging the same statements again
/// leaves the set unchanged.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StatementSet {
    statements: IndexSet<PolicyStatement>,
}

impl StatementSet {
    /// Create an empty set
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Merge statements into the set
    pub fn merge(&mut self, statements: impl IntoIterator<Item = PolicyStatement>) {
        self.statements.extend(statements);
        self.apply_deny_precedence();
    }

    /// Insert one statement
    pub fn insert(&mut self, statement: PolicyStatement) {
        self.merge(std::iter::once(statement));
    }

    /// Iterate in insertion order
    pub fn iter(&self) -> impl Iterator<Item = &PolicyStatement> {
        self.statements.iter()
    }

    /// Number of statements
    #[must_use]
    pub fn len(&self) -> usize {
        self.statements.len()
    }

    /// Check if the set is empty
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.statements.is_empty()
    }

    /// Render as a policy document value
    #[must_use]
    pub fn to_document(&self) -> Value {
        Value::map([
            ("Version", Value::string(POLICY_VERSION)),
            (
                "Statement",
                Value::list(self.statements.iter().map(PolicyStatement::to_value)),
            ),
        ])
    }

    /// Unconditional denies remove the actions they cover from allows with
    /// the same principals, for the resources both statements name
    fn apply_deny_precedence(&mut self) {
        let denies: Vec<PolicyStatement> = self
            .statements
            .iter()
            .filter(|s| s.effect == Effect::Deny && !s.is_conditional())
            .cloned()
            .collect();
        if denies.is_empty() {
            return;
        }

        let mut pruned = IndexSet::with_capacity(self.statements.len());
        for statement in self.statements.drain(..) {
            if statement.effect == Effect::Deny {
                pruned.insert(statement);
                continue;
            }
            let principals = statement.principals.clone();
            let mut pieces = vec![statement];
            for deny in denies.iter().filter(|d| d.principals == principals) {
                pieces = pieces
                    .into_iter()
                    .flat_map(|piece| prune_allow(piece, deny))
                    .collect();
                if pieces.is_empty() {
                    break;
                }
            }
            pruned.extend(pieces);
        }
        self.statements = pruned;
    }
}

/// Split `allow` against one unconditional deny. Resources the deny does not
/// name keep every action; shared resources lose the denied actions.
fn prune_allow(allow: PolicyStatement, deny: &PolicyStatement) -> Vec<PolicyStatement> {
    let denied: BTreeSet<String> = allow
        .actions
        .iter()
        .filter(|a| deny.actions.iter().any(|p| action_matches(p, a)))
        .cloned()
        .collect();
    if denied.is_empty() {
        return vec![allow];
    }

    let (shared, untouched): (Vec<Value>, Vec<Value>) = if deny.has_wildcard_resource() {
        (allow.resources.clone(), Vec::new())
    } else {
        allow
            .resources
            .iter()
            .cloned()
            .partition(|r| deny.resources.contains(r))
    };
    if shared.is_empty() {
        return vec![allow];
    }

    let mut pieces = Vec::new();
    if !untouched.is_empty() {
        pieces.push(PolicyStatement {
            resources: untouched,
            ..allow.clone()
        });
    }
    let remaining: BTreeSet<String> = allow.actions.difference(&denied).cloned().collect();
    if !remaining.is_empty() {
        pieces.push(PolicyStatement {
            actions: remaining,
            resources: shared,
            ..allow
        });
    }
    pieces
}

impl FromIterator<PolicyStatement> for StatementSet {
    fn from_iter<I: IntoIterator<Item = PolicyStatement>>(iter: I) -> Self {
        let mut set = Self::new();
        set.merge(iter);
        set
    }
}

impl<'a> IntoIterator for &'a StatementSet {
    type Item = &'a PolicyStatement;
    type IntoIter = indexmap::set::Iter<'a, PolicyStatement>;

    fn into_iter(self) -> Self::IntoIter {
        self.statements.iter()
    }
}

/// Encryption condition value, for building deny-unless-encrypted statements
#[must_use]
pub fn encryption_condition(required: &str) -> Value {
    Value::Literal(Scalar::Str(required.to_string()))
}
