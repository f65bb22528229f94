//! Template emission.
//!
//! Serializes the ordered, resolved graph into plan records. Deferred
//! outputs are written in the template's native forward-reference syntax
//! (`Ref`, `Fn::GetAtt`, `Fn::Join`, `Fn::Sub`) so the provisioning backend
//! can fill them in. Composed policy statements are attached the way the
//! holder's schema asks for.

use crate::graph::NodeHandle;
use crate::resolve::Resolver;
use crate::schema::PolicyAttachment;
use crate::validate::FrozenGraph;
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::collections::{BTreeMap, HashSet};
use trellis_core::{DeferredOutput, NodeId, PlanDigest, Resolved, Scalar, SynthError, SynthResult, Value};
use trellis_policy::Composition;

type Json = serde_json::Value;

/// One materialization step
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PlanRecord {
    /// Node id
    pub id: NodeId,
    /// Resource type
    #[serde(rename = "type")]
    pub resource_type: String,
    /// Resolved properties in native template syntax
    pub properties: serde_json::Map<String, Json>,
    /// Outputs this record waits on, in first-use order
    pub unresolved_references: Vec<DeferredOutput>,
    /// Direct dependencies
    pub depends_on: Vec<NodeId>,
}

/// An ordered, self-consistent deployment plan
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Plan {
    /// Template format version
    pub format_version: String,
    /// Records in materialization order
    pub records: Vec<PlanRecord>,
    /// BLAKE3 digest of the format version and records, hex encoded
    pub digest: String,
}

/// Bytes the digest covers: `[format_version, records]` as JSON
fn digest_input(format_version: &str, records: &[PlanRecord]) -> serde_json::Result<Vec<u8>> {
    serde_json::to_vec(&(format_version, records))
}

impl Plan {
    fn new(format_version: String, records: Vec<PlanRecord>) -> SynthResult<Self> {
        let digest = PlanDigest::compute(&digest_input(&format_version, &records)?).to_hex();
        Ok(Self {
            format_version,
            records,
            digest,
        })
    }

    /// Ids in materialization order
    #[must_use]
    pub fn order(&self) -> Vec<&NodeId> {
        self.records.iter().map(|r| &r.id).collect()
    }

    /// Record by id
    #[must_use]
    pub fn record(&self, id: &str) -> Option<&PlanRecord> {
        self.records.iter().find(|r| r.id.as_str() == id)
    }

    /// Check the digest still matches the format version and records
    #[must_use]
    pub fn verify_digest(&self) -> bool {
        let Ok(digest) = PlanDigest::from_hex(&self.digest) else {
            return false;
        };
        digest_input(&self.format_version, &self.records).is_ok_and(|bytes| digest.verify(&bytes))
    }

    /// Render a CloudFormation-style template.
    ///
    /// `DependsOn` lists only dependencies the properties do not already
    /// imply through a native reference.
    #[must_use]
    pub fn to_template(&self) -> Json {
        let mut resources = serde_json::Map::new();
        for record in &self.records {
            let implied: HashSet<&NodeId> =
                record.unresolved_references.iter().map(|d| &d.node).collect();
            let explicit: Vec<&NodeId> = record
                .depends_on
                .iter()
                .filter(|id| !implied.contains(id))
                .collect();

            let mut entry = serde_json::Map::new();
            entry.insert("Type".to_string(), json!(record.resource_type));
            if !explicit.is_empty() {
                entry.insert("DependsOn".to_string(), json!(explicit));
            }
            if !record.properties.is_empty() {
                entry.insert("Properties".to_string(), Json::Object(record.properties.clone()));
            }
            resources.insert(record.id.to_string(), Json::Object(entry));
        }
        json!({
            "AWSTemplateFormatVersion": self.format_version,
            "Resources": resources,
        })
    }
}

/// Render a resolved value in native template syntax
#[must_use]
pub fn to_native(value: &Resolved) -> Json {
    match value {
        Resolved::Literal(scalar) => match scalar {
            Scalar::Null => Json::Null,
            Scalar::Bool(b) => Json::Bool(*b),
            Scalar::Int(i) => Json::from(*i),
            Scalar::Str(s) => Json::String(s.clone()),
        },
        Resolved::List(items) => Json::Array(items.iter().map(to_native).collect()),
        Resolved::Map(entries) => Json::Object(
            entries
                .iter()
                .map(|(k, v)| (k.clone(), to_native(v)))
                .collect(),
        ),
        Resolved::Deferred(deferred) => match &deferred.attribute {
            None => json!({ "Ref": deferred.node }),
            Some(attribute) => json!({ "Fn::GetAtt": [deferred.node, attribute] }),
        },
        Resolved::Join { delimiter, parts } => {
            json!({ "Fn::Join": [delimiter, parts.iter().map(to_native).collect::<Vec<_>>()] })
        }
        Resolved::Sub {
            template,
            variables,
            ..
        } => {
            if variables.is_empty() {
                json!({ "Fn::Sub": template })
            } else {
                let variables: serde_json::Map<String, Json> = variables
                    .iter()
                    .map(|(k, v)| (k.clone(), to_native(v)))
                    .collect();
                json!({ "Fn::Sub": [template, variables] })
            }
        }
    }
}

/// Emits plans from a frozen graph and its policy composition
#[derive(Debug)]
pub struct Emitter<'a> {
    frozen: &'a FrozenGraph,
    composition: &'a Composition,
    format_version: String,
}

impl<'a> Emitter<'a> {
    /// Create an emitter
    #[must_use]
    pub fn new(frozen: &'a FrozenGraph, composition: &'a Composition) -> Self {
        Self {
            frozen,
            composition,
            format_version: "2010-09-09".to_string(),
        }
    }

    /// Set the template format version
    #[must_use]
    pub fn with_format_version(mut self, version: impl Into<String>) -> Self {
        self.format_version = version.into();
        self
    }

    /// Resolve and emit nodes in `order`
    ///
    /// # Errors
    ///
    /// Returns any resolution failure, `InvalidPropertyValue` when composed
    /// statements cannot be attached, or `DuplicateId` when a companion
    /// record id is already declared
    pub fn emit(&self, order: &[NodeHandle]) -> SynthResult<Plan> {
        let graph = self.frozen.graph();
        let mut resolver = Resolver::new(self.frozen);
        let mut records = Vec::with_capacity(order.len());

        for &handle in order {
            let (node, schema) = graph
                .node(handle)
                .zip(self.frozen.schema(handle))
                .ok_or_else(|| SynthError::intake(format!("no node at index {}", handle.index())))?;
            let mut properties = resolver.resolve_node(handle, &node.properties)?;
            let depends_on: Vec<NodeId> = self
                .frozen
                .predecessors(handle)
                .into_iter()
                .filter_map(|h| graph.node(h).map(|n| n.id.clone()))
                .collect();

            let document = match self.composition.statements_for(node.id.as_str()) {
                Some(set) if !set.is_empty() => {
                    Some(resolver.resolve(&node.id, "PolicyDocument", &set.to_document())?)
                }
                _ => None,
            };

            let mut companion = None;
            if let Some(document) = document {
                match &schema.policy {
                    PolicyAttachment::None => {
                        return Err(SynthError::invalid(
                            &node.id,
                            "statements",
                            format!("type {} does not carry policy statements", node.resource_type),
                        ));
                    }
                    PolicyAttachment::InlineDocument { property } => {
                        if properties.contains_key(property) {
                            return Err(SynthError::invalid(
                                &node.id,
                                property.clone(),
                                "declared both as a property and through statements",
                            ));
                        }
                        properties.insert(property.clone(), document);
                    }
                    PolicyAttachment::InlinePolicies { property } => {
                        let entry = Resolved::Map(BTreeMap::from([
                            (
                                "PolicyName".to_string(),
                                Resolved::string(node.id.with_suffix("Policy").to_string()),
                            ),
                            ("PolicyDocument".to_string(), document),
                        ]));
                        match properties.get_mut(property) {
                            Some(Resolved::List(items)) => items.push(entry),
                            Some(_) => {
                                return Err(SynthError::invalid(
                                    &node.id,
                                    property.clone(),
                                    "must be a list to receive composed statements",
                                ));
                            }
                            None => {
                                properties.insert(property.clone(), Resolved::List(vec![entry]));
                            }
                        }
                    }
                    PolicyAttachment::Companion {
                        resource_type,
                        target_property,
                        document_property,
                    } => {
                        let id = node.id.with_suffix("Policy");
                        if graph.contains(id.as_str()) {
                            return Err(SynthError::DuplicateId { id });
                        }
                        let target = resolver.resolve(
                            &id,
                            target_property,
                            &Value::reference(node.id.clone()),
                        )?;
                        let mut companion_properties = IndexMap::new();
                        companion_properties.insert(target_property.clone(), target);
                        companion_properties.insert(document_property.clone(), document);
                        companion = Some(record(
                            id,
                            resource_type.clone(),
                            &companion_properties,
                            vec![node.id.clone()],
                        ));
                    }
                }
            }

            records.push(record(
                node.id.clone(),
                node.resource_type.clone(),
                &properties,
                depends_on,
            ));
            records.extend(companion);
        }

        let plan = Plan::new(self.format_version.clone(), records)?;
        tracing::info!(
            records = plan.records.len(),
            deferred = plan
                .records
                .iter()
                .map(|r| r.unresolved_references.len())
                .sum::<usize>(),
            digest = %plan.digest,
            "plan emitted"
        );
        Ok(plan)
    }
}

fn record(
    id: NodeId,
    resource_type: String,
    properties: &IndexMap<String, Resolved>,
    depends_on: Vec<NodeId>,
) -> PlanRecord {
    let mut unresolved: Vec<DeferredOutput> = Vec::new();
    for deferred in properties.values().flat_map(Resolved::deferred_outputs) {
        if !unresolved.contains(deferred) {
            unresolved.push(deferred.clone());
        }
    }
    PlanRecord {
        id,
        resource_type,
        properties: properties
            .iter()
            .map(|(k, v)| (k.clone(), to_native(v)))
            .collect(),
        unresolved_references: unresolved,
        depends_on,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::{Graph, ResourceNode};
    use crate::planner::Planner;
    use crate::schema::TypeRegistry;
    use crate::validate::Validator;
    use trellis_policy::{PolicyComposer, PolicyStatement, Principal};

    fn emit(nodes: Vec<ResourceNode>) -> SynthResult<Plan> {
        let mut graph = Graph::new();
        for node in nodes {
            graph.insert(node)?;
        }
        let registry = TypeRegistry::builtin();
        let frozen = Validator::new(&registry).validate(graph)?;
        let composition = PolicyComposer::default().compose(frozen.attachments(), &frozen.protected())?;
        let order = Planner::new().plan(&frozen)?;
        Emitter::new(&frozen, &composition).emit(&order)
    }

    #[test]
    fn test_native_syntax() {
        let deferred = Resolved::Deferred(DeferredOutput::new("Role".into(), Some("Arn".into())));
        assert_eq!(to_native(&deferred), json!({"Fn::GetAtt": ["Role", "Arn"]}));
        let reference = Resolved::Deferred(DeferredOutput::new("Bucket".into(), None));
        assert_eq!(to_native(&reference), json!({"Ref": "Bucket"}));
        let join = Resolved::Join {
            delimiter: String::new(),
            parts: vec![deferred.clone(), Resolved::string("/*")],
        };
        assert_eq!(
            to_native(&join),
            json!({"Fn::Join": ["", [{"Fn::GetAtt": ["Role", "Arn"]}, "/*"]]})
        );
        let sub = Resolved::Sub {
            template: "${AWS::Region}-${v}".into(),
            variables: BTreeMap::from([("v".to_string(), reference)]),
            implicit: vec![],
        };
        assert_eq!(
            to_native(&sub),
            json!({"Fn::Sub": ["${AWS::Region}-${v}", {"v": {"Ref": "Bucket"}}]})
        );
    }

    #[test]
    fn test_records_carry_deferred_outputs() {
        let plan = emit(vec![
            ResourceNode::new("Project", "AWS::CodeBuild::Project")
                .with_property("ServiceRole", Value::get_att("Role", "Arn")),
            ResourceNode::new("Role", "AWS::IAM::Role"),
        ])
        .unwrap();
        let ids: Vec<_> = plan.order().into_iter().map(NodeId::as_str).collect();
        assert_eq!(ids, vec!["Role", "Project"]);
        let project = plan.record("Project").unwrap();
        assert_eq!(
            project.unresolved_references,
            vec![DeferredOutput::new("Role".into(), Some("Arn".into()))]
        );
        assert_eq!(project.depends_on, vec![NodeId::from("Role")]);
        assert_eq!(project.properties["ServiceRole"], json!({"Fn::GetAtt": ["Role", "Arn"]}));
        assert!(plan.verify_digest());
    }

    #[test]
    fn test_inline_policies_attached_to_role() {
        let plan = emit(vec![
            ResourceNode::new("Repo", "AWS::CodeCommit::Repository"),
            ResourceNode::new("Role", "AWS::IAM::Role").with_statement(
                PolicyStatement::allow()
                    .with_action("codecommit:GitPull")
                    .with_resource(Value::get_att("Repo", "Arn")),
            ),
        ])
        .unwrap();
        let role = plan.record("Role").unwrap();
        let policies = role.properties["Policies"].as_array().unwrap();
        assert_eq!(policies.len(), 1);
        assert_eq!(policies[0]["PolicyName"], json!("RolePolicy"));
        assert_eq!(
            policies[0]["PolicyDocument"]["Statement"][0]["Resource"],
            json!([{"Fn::GetAtt": ["Repo", "Arn"]}])
        );
    }

    #[test]
    fn test_companion_record_follows_holder() {
        let plan = emit(vec![
            ResourceNode::new("Bucket", "AWS::S3::Bucket").with_statement(
                PolicyStatement::deny()
                    .with_principal(Principal::Any)
                    .with_action("s3:DeleteBucket")
                    .with_resource(Value::get_att("Bucket", "Arn")),
            ),
            ResourceNode::new("Other", "AWS::EC2::VPC"),
        ])
        .unwrap();
        let ids: Vec<_> = plan.order().into_iter().map(NodeId::as_str).collect();
        assert_eq!(ids, vec!["Bucket", "BucketPolicy", "Other"]);
        let companion = plan.record("BucketPolicy").unwrap();
        assert_eq!(companion.resource_type, "AWS::S3::BucketPolicy");
        assert_eq!(companion.properties["Bucket"], json!({"Ref": "Bucket"}));
        assert_eq!(companion.depends_on, vec![NodeId::from("Bucket")]);
    }

    #[test]
    fn test_companion_id_clash() {
        let err = emit(vec![
            ResourceNode::new("Bucket", "AWS::S3::Bucket").with_statement(
                PolicyStatement::deny()
                    .with_action("s3:DeleteBucket")
                    .with_resource(Value::get_att("Bucket", "Arn")),
            ),
            ResourceNode::new("BucketPolicy", "AWS::S3::BucketPolicy"),
        ])
        .unwrap_err();
        assert_eq!(err, SynthError::DuplicateId { id: "BucketPolicy".into() });
    }

    #[test]
    fn test_template_depends_on_only_when_not_implied() {
        let mut graph = Graph::new();
        graph.insert(ResourceNode::new("Policy", "AWS::IAM::Policy")).unwrap();
        graph.insert(ResourceNode::new("Role", "AWS::IAM::Role")).unwrap();
        graph
            .insert(
                ResourceNode::new("Project", "AWS::CodeBuild::Project")
                    .with_property("ServiceRole", Value::get_att("Role", "Arn")),
            )
            .unwrap();
        graph.declare_ordering_hint("Policy", "Project").unwrap();
        let registry = TypeRegistry::builtin();
        let frozen = Validator::new(&registry).validate(graph).unwrap();
        let composition = Composition::default();
        let order = Planner::new().plan(&frozen).unwrap();
        let plan = Emitter::new(&frozen, &composition).emit(&order).unwrap();
        let template = plan.to_template();
        assert_eq!(template["AWSTemplateFormatVersion"], json!("2010-09-09"));
        assert_eq!(template["Resources"]["Project"]["DependsOn"], json!(["Policy"]));
        assert!(template["Resources"]["Role"].get("DependsOn").is_none());
    }

    #[test]
    fn test_tampered_digest_detected() {
        let mut plan = emit(vec![ResourceNode::new("Role", "AWS::IAM::Role")]).unwrap();
        plan.records[0].resource_type = "AWS::IAM::User".into();
        assert!(!plan.verify_digest());
    }

    #[test]
    fn test_format_version_covered_by_digest() {
        let plan = emit(vec![ResourceNode::new("Role", "AWS::IAM::Role")]).unwrap();
        let other = Plan::new("2099-01-01".to_string(), plan.records.clone()).unwrap();
        assert_ne!(plan.digest, other.digest);
        assert!(other.verify_digest());

        let mut tampered = plan.clone();
        tampered.format_version = "2099-01-01".to_string();
        assert!(!tampered.verify_digest());
    }
}
