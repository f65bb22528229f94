//! Policy composition and least-privilege pairing.
//!
//! The composer merges each node's statements into a [`StatementSet`] and
//! then checks every write-class grant on a protected resource against the
//! deny-unless-encrypted statements attached anywhere in the graph.
//!
//! A deny pairs with a grant only when it applies to every principal, covers
//! the resource's objects (`arn + object_suffix`, or `*`) and negates the
//! encryption condition key (`StringNotEquals`, `StringNotEqualsIfExists`,
//! or `Null: true`).

use crate::matcher::{any_matches, covered, resource_matches};
use crate::statement::{encryption_condition, Effect, PolicyStatement, Principal, StatementSet};
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use trellis_core::value::{placeholders, split_placeholder};
use trellis_core::{NodeId, Reference, Scalar, SynthError, SynthResult, Value};

const NEGATING_OPERATORS: [&str; 2] = ["StringNotEquals", "StringNotEqualsIfExists"];

/// What to do with an unpaired grant
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum PolicyMode {
    /// Fail with `InsecureResourceGrant`
    #[default]
    Strict,
    /// Inject the minimal deny-unless-encrypted statement
    AutoHeal,
}

/// Protection declared by an encryption-capable resource type
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Protection {
    /// Attribute holding the resource ARN
    pub arn_attribute: String,
    /// Suffix appended to the ARN to address objects (`/*` for buckets)
    #[serde(default)]
    pub object_suffix: String,
    /// Write-class actions that require a paired deny
    pub guarded_actions: Vec<String>,
}

/// A protected node and its protection
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProtectedResource {
    /// The protected node
    pub node: NodeId,
    /// How it is protected
    pub protection: Protection,
}

/// A deny statement injected by auto-heal
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InjectedPairing {
    /// Node the statement was attached to
    pub resource: NodeId,
    /// Node whose grant triggered the injection
    pub principal: NodeId,
    /// Guarded action
    pub action: String,
    /// The injected statement
    pub statement: PolicyStatement,
}

/// Result of composing all statements in a graph
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Composition {
    /// Merged statements per node, in declaration order
    pub statements: IndexMap<NodeId, StatementSet>,
    /// Statements added by auto-heal
    pub injected: Vec<InjectedPairing>,
}

impl Composition {
    /// Statements composed for `node`
    #[must_use]
    pub fn statements_for(&self, node: &str) -> Option<&StatementSet> {
        self.statements.get(node)
    }
}

/// Policy composer
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PolicyComposer {
    mode: PolicyMode,
    condition_key: String,
    required_encryption: String,
}

impl PolicyComposer {
    /// Create a composer for the given mode
    #[must_use]
    pub fn new(mode: PolicyMode) -> Self {
        Self {
            mode,
            condition_key: "s3:x-amz-server-side-encryption".to_string(),
            required_encryption: "aws:kms".to_string(),
        }
    }

    /// Set the condition key a paired deny must constrain
    #[must_use]
    pub fn with_condition_key(mut self, key: impl Into<String>) -> Self {
        self.condition_key = key.into();
        self
    }

    /// Set the encryption value injected denies require
    #[must_use]
    pub fn with_required_encryption(mut self, value: impl Into<String>) -> Self {
        self.required_encryption = value.into();
        self
    }

    /// Mode in use
    #[must_use]
    pub fn mode(&self) -> PolicyMode {
        self.mode
    }

    /// Compose statements attached to nodes and enforce pairing for every
    /// protected resource
    ///
    /// # Errors
    ///
    /// Returns `InsecureResourceGrant` in strict mode when a grant is unpaired
    pub fn compose<'a, I>(
        &self,
        attachments: I,
        protected: &[ProtectedResource],
    ) -> SynthResult<Composition>
    where
        I: IntoIterator<Item = (&'a NodeId, &'a [PolicyStatement])>,
    {
        let mut composition = Composition::default();
        for (node, statements) in attachments {
            if statements.is_empty() {
                continue;
            }
            composition
                .statements
                .entry(node.clone())
                .or_default()
                .merge(statements.iter().cloned());
        }

        for resource in protected {
            self.enforce_pairing(&mut composition, resource)?;
        }
        tracing::debug!(
            nodes = composition.statements.len(),
            injected = composition.injected.len(),
            "composed policy statements"
        );
        Ok(composition)
    }

    /// Re-check a composition as strict mode would, without healing
    ///
    /// # Errors
    ///
    /// Returns `InsecureResourceGrant` if any grant is unpaired
    pub fn verify(
        &self,
        composition: &Composition,
        protected: &[ProtectedResource],
    ) -> SynthResult<()> {
        for resource in protected {
            if let Some((principal, action)) = self.first_unpaired(composition, resource) {
                return Err(SynthError::InsecureResourceGrant {
                    principal,
                    resource: resource.node.clone(),
                    action,
                });
            }
        }
        Ok(())
    }

    fn enforce_pairing(
        &self,
        composition: &mut Composition,
        resource: &ProtectedResource,
    ) -> SynthResult<()> {
        while let Some((principal, action)) = self.first_unpaired(composition, resource) {
            match self.mode {
                PolicyMode::Strict => {
                    return Err(SynthError::InsecureResourceGrant {
                        principal,
                        resource: resource.node.clone(),
                        action,
                    });
                }
                PolicyMode::AutoHeal => {
                    let statement = self.pairing_statement(resource, &action);
                    tracing::warn!(
                        resource = %resource.node,
                        principal = %principal,
                        action = %action,
                        "injecting deny-unless-encrypted statement"
                    );
                    composition
                        .statements
                        .entry(resource.node.clone())
                        .or_default()
                        .insert(statement.clone());
                    composition.injected.push(InjectedPairing {
                        resource: resource.node.clone(),
                        principal,
                        action,
                        statement,
                    });
                }
            }
        }
        Ok(())
    }

    /// First Allow grant of a guarded action on `resource` without a pairing.
    /// A grant on `*` targets every protected resource.
    fn first_unpaired(
        &self,
        composition: &Composition,
        resource: &ProtectedResource,
    ) -> Option<(NodeId, String)> {
        let node = resource.node.as_str();
        for (holder, set) in &composition.statements {
            for grant in set.iter().filter(|s| {
                s.effect == Effect::Allow && (s.references_node(node) || s.has_wildcard_resource())
            }) {
                let patterns: Vec<&String> = grant.actions.iter().collect();
                for action in covered(&patterns, &resource.protection.guarded_actions) {
                    if !self.is_paired(composition, resource, action) {
                        return Some((holder.clone(), action.clone()));
                    }
                }
            }
        }
        None
    }

    fn is_paired(
        &self,
        composition: &Composition,
        resource: &ProtectedResource,
        action: &str,
    ) -> bool {
        composition.statements.values().flat_map(StatementSet::iter).any(|s| {
            s.effect == Effect::Deny
                && s.principals.contains(&Principal::Any)
                && any_matches(&s.actions, action)
                && s.resources.iter().any(|r| covers_objects(r, resource))
                && self.negates_encryption(s)
        })
    }

    fn negates_encryption(&self, statement: &PolicyStatement) -> bool {
        statement.conditions.iter().any(|(operator, keys)| {
            let Some(value) = keys.get(&self.condition_key) else {
                return false;
            };
            if operator == "Null" {
                return value.as_str().map_or(
                    matches!(value.as_literal(), Some(Scalar::Bool(true))),
                    |text| text.eq_ignore_ascii_case("true"),
                );
            }
            NEGATING_OPERATORS.contains(&operator.as_str())
        })
    }

    fn pairing_statement(&self, resource: &ProtectedResource, action: &str) -> PolicyStatement {
        let protection = &resource.protection;
        let arn = Value::get_att(resource.node.clone(), protection.arn_attribute.clone());
        let target = if protection.object_suffix.is_empty() {
            arn
        } else {
            Value::join("", [arn, Value::string(protection.object_suffix.clone())])
        };
        let verb = action.rsplit(':').next().unwrap_or(action);
        PolicyStatement::deny()
            .with_sid(format!("DenyUnEncrypted{verb}"))
            .with_principal(Principal::Any)
            .with_action(action)
            .with_resource(target)
            .with_condition(
                "StringNotEquals",
                self.condition_key.clone(),
                encryption_condition(&self.required_encryption),
            )
    }
}

impl Default for PolicyComposer {
    fn default() -> Self {
        Self::new(PolicyMode::Strict)
    }
}

/// Check a deny resource covers every object of `resource`
fn covers_objects(value: &Value, resource: &ProtectedResource) -> bool {
    if value.as_str() == Some("*") {
        return true;
    }
    let protection = &resource.protection;
    object_scope(value).is_some_and(|(node, attribute, suffix)| {
        node == resource.node.as_str()
            && attribute == protection.arn_attribute
            && resource_matches(&suffix, &protection.object_suffix)
    })
}

/// `(node, attribute, suffix)` of a resource written as an ARN attribute
/// followed by constant text
fn object_scope(value: &Value) -> Option<(&str, &str, String)> {
    let Value::Reference(reference) = value else {
        return None;
    };
    match reference.as_ref() {
        Reference::GetAttribute { node, attribute } => {
            Some((node.as_str(), attribute.as_str(), String::new()))
        }
        Reference::Join { delimiter, parts } => {
            let (head, rest) = parts.split_first()?;
            let (node, attribute, mut suffix) = object_scope(head)?;
            for part in rest {
                suffix.push_str(delimiter);
                suffix.push_str(&part.constant_text()?);
            }
            Some((node, attribute, suffix))
        }
        Reference::Sub {
            template,
            variables,
        } => {
            let (name, tail) = template.strip_prefix("${")?.split_once('}')?;
            if variables.contains_key(name) || !placeholders(tail).is_empty() {
                return None;
            }
            let (node, attribute) = split_placeholder(name);
            Some((node, attribute?, tail.to_string()))
        }
        Reference::Ref { .. } => None,
    }
}
