//! Resource type schemas.
//!
//! The engine knows nothing about a concrete cloud catalogue beyond what a
//! schema states: the output attributes a type exposes, which of them are
//! known at plan time, how policy statements attach, and which properties
//! carry security rules.

use indexmap::{IndexMap, IndexSet};
use serde::{Deserialize, Serialize};
use trellis_core::{SynthError, SynthResult};
use trellis_policy::Protection;

/// How composed policy statements are attached to an emitted record
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "mode", rename_all = "kebab-case")]
pub enum PolicyAttachment {
    /// The type does not carry statements
    #[default]
    None,
    /// The document becomes the value of `property`
    InlineDocument {
        /// Property receiving the document
        property: String,
    },
    /// The document is appended to the list in `property` as
    /// `{PolicyName, PolicyDocument}`
    InlinePolicies {
        /// List property receiving the entry
        property: String,
    },
    /// The document is emitted as a separate record right after the holder
    Companion {
        /// Type of the companion record
        resource_type: String,
        /// Companion property that refers back to the holder
        target_property: String,
        /// Companion property receiving the document
        document_property: String,
    },
}

impl PolicyAttachment {
    /// Check if statements may be attached
    #[must_use]
    pub fn accepts_statements(&self) -> bool {
        !matches!(self, Self::None)
    }
}

/// Schema of one resource type
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TypeSchema {
    /// Type name, e.g. `AWS::S3::Bucket`
    pub type_name: String,
    /// Output attributes
    #[serde(default)]
    pub outputs: IndexSet<String>,
    /// Property whose literal value `Ref` yields at plan time
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ref_property: Option<String>,
    /// Attributes known at plan time: attribute -> property
    #[serde(default)]
    pub attribute_properties: IndexMap<String, String>,
    /// Policy statement attachment
    #[serde(default)]
    pub policy: PolicyAttachment,
    /// Encryption protection, for encryption-capable types
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub protection: Option<Protection>,
    /// List property holding ingress rules
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ingress_property: Option<String>,
    /// Top-level properties that must hold CIDR blocks
    #[serde(default)]
    pub cidr_properties: Vec<String>,
}

impl TypeSchema {
    /// Schema for a type the registry does not know
    #[must_use]
    pub fn opaque(type_name: impl Into<String>) -> Self {
        Self {
            type_name: type_name.into(),
            outputs: IndexSet::new(),
            ref_property: None,
            attribute_properties: IndexMap::new(),
            policy: PolicyAttachment::None,
            protection: None,
            ingress_property: None,
            cidr_properties: Vec::new(),
        }
    }

    /// Add output attributes
    #[must_use]
    pub fn with_outputs<'a>(mut self, outputs: impl IntoIterator<Item = &'a str>) -> Self {
        self.outputs.extend(outputs.into_iter().map(str::to_string));
        self
    }

    /// Set the property `Ref` yields
    #[must_use]
    pub fn with_ref_property(mut self, property: &str) -> Self {
        self.ref_property = Some(property.to_string());
        self
    }

    /// Mark an attribute as known from a property
    #[must_use]
    pub fn with_attribute_property(mut self, attribute: &str, property: &str) -> Self {
        self.outputs.insert(attribute.to_string());
        self.attribute_properties
            .insert(attribute.to_string(), property.to_string());
        self
    }

    /// Set the policy attachment
    #[must_use]
    pub fn with_policy(mut self, policy: PolicyAttachment) -> Self {
        self.policy = policy;
        self
    }

    /// Mark the type encryption-capable
    #[must_use]
    pub fn with_protection(mut self, protection: Protection) -> Self {
        self.protection = Some(protection);
        self
    }

    /// Set the ingress rule property
    #[must_use]
    pub fn with_ingress(mut self, property: &str) -> Self {
        self.ingress_property = Some(property.to_string());
        self
    }

    /// Add a CIDR property
    #[must_use]
    pub fn with_cidr(mut self, property: &str) -> Self {
        self.cidr_properties.push(property.to_string());
        self
    }
}

/// Accepted layouts of a registry document
#[derive(Deserialize)]
#[serde(untagged)]
enum RegistryDocument {
    /// `[schema, ...]`, as printed by [`TypeRegistry::to_json`]
    List(Vec<TypeSchema>),
    /// `{type_name: schema, ...}`, the registry's own serde form
    Keyed(IndexMap<String, TypeSchema>),
}

/// Registry of type schemas
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TypeRegistry {
    schemas: IndexMap<String, TypeSchema>,
}

impl TypeRegistry {
    /// Create an empty registry
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a schema, replacing any previous one for the type
    pub fn register(&mut self, schema: TypeSchema) {
        self.schemas.insert(schema.type_name.clone(), schema);
    }

    /// Register a schema, builder style
    #[must_use]
    pub fn with(mut self, schema: TypeSchema) -> Self {
        self.register(schema);
        self
    }

    /// Look up a schema
    #[must_use]
    pub fn get(&self, type_name: &str) -> Option<&TypeSchema> {
        self.schemas.get(type_name)
    }

    /// Schema for a type, falling back to an opaque schema
    #[must_use]
    pub fn schema_for(&self, type_name: &str) -> TypeSchema {
        self.get(type_name)
            .cloned()
            .unwrap_or_else(|| TypeSchema::opaque(type_name))
    }

    /// Overlay another registry; its schemas win
    pub fn extend(&mut self, other: TypeRegistry) {
        for (_, schema) in other.schemas {
            self.register(schema);
        }
    }

    /// Iterate registered schemas
    pub fn iter(&self) -> impl Iterator<Item = &TypeSchema> {
        self.schemas.values()
    }

    /// Number of registered types
    #[must_use]
    pub fn len(&self) -> usize {
        self.schemas.len()
    }

    /// Check if empty
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.schemas.is_empty()
    }

    /// Parse a registry from JSON: a list of schemas, or a map keyed by
    /// type name
    ///
    /// # Errors
    ///
    /// Returns `Intake` if the document is malformed or a map key differs
    /// from its schema's `type_name`
    pub fn from_json(json: &str) -> SynthResult<Self> {
        let schemas = match serde_json::from_str::<RegistryDocument>(json)? {
            RegistryDocument::List(schemas) => schemas,
            RegistryDocument::Keyed(keyed) => {
                let mut schemas = Vec::with_capacity(keyed.len());
                for (key, schema) in keyed {
                    if key != schema.type_name {
                        return Err(SynthError::intake(format!(
                            "type schema keyed '{key}' is named '{}'",
                            schema.type_name
                        )));
                    }
                    schemas.push(schema);
                }
                schemas
            }
        };
        let mut registry = Self::new();
        for schema in schemas {
            registry.register(schema);
        }
        Ok(registry)
    }

    /// Render the registry as a pretty-printed list of schemas, the layout
    /// [`TypeRegistry::from_json`] reads
    ///
    /// # Errors
    ///
    /// Returns `Intake` if serialization fails
    pub fn to_json(&self) -> SynthResult<String> {
        let schemas: Vec<&TypeSchema> = self.iter().collect();
        Ok(serde_json::to_string_pretty(&schemas)?)
    }

    /// Schemas for the repository, build pipeline, artifact store and
    /// load-balanced compute types
    #[must_use]
    pub fn builtin() -> Self {
        let bucket_policy = PolicyAttachment::Companion {
            resource_type: "AWS::S3::BucketPolicy".to_string(),
            target_property: "Bucket".to_string(),
            document_property: "PolicyDocument".to_string(),
        };
        let bucket_protection = Protection {
            arn_attribute: "Arn".to_string(),
            object_suffix: "/*".to_string(),
            guarded_actions: vec!["s3:PutObject".to_string()],
        };

        Self::new()
            .with(
                TypeSchema::opaque("AWS::S3::Bucket")
                    .with_outputs(["Arn", "DomainName", "RegionalDomainName", "WebsiteURL"])
                    .with_ref_property("BucketName")
                    .with_policy(bucket_policy)
                    .with_protection(bucket_protection),
            )
            .with(
                TypeSchema::opaque("AWS::S3::BucketPolicy").with_policy(
                    PolicyAttachment::InlineDocument {
                        property: "PolicyDocument".to_string(),
                    },
                ),
            )
            .with(
                TypeSchema::opaque("AWS::IAM::Role")
                    .with_outputs(["Arn", "RoleId"])
                    .with_ref_property("RoleName")
                    .with_policy(PolicyAttachment::InlinePolicies {
                        property: "Policies".to_string(),
                    }),
            )
            .with(
                TypeSchema::opaque("AWS::IAM::Policy")
                    .with_ref_property("PolicyName")
                    .with_policy(PolicyAttachment::InlineDocument {
                        property: "PolicyDocument".to_string(),
                    }),
            )
            .with(
                TypeSchema::opaque("AWS::CodeCommit::Repository")
                    .with_outputs(["Arn", "CloneUrlHttp", "CloneUrlSsh"])
                    .with_attribute_property("Name", "RepositoryName"),
            )
            .with(
                TypeSchema::opaque("AWS::CodeBuild::Project")
                    .with_outputs(["Arn"])
                    .with_ref_property("Name"),
            )
            .with(
                TypeSchema::opaque("AWS::CodePipeline::Pipeline")
                    .with_outputs(["Version"])
                    .with_ref_property("Name"),
            )
            .with(
                TypeSchema::opaque("AWS::EC2::VPC")
                    .with_outputs(["DefaultSecurityGroup", "VpcId"])
                    .with_attribute_property("CidrBlock", "CidrBlock")
                    .with_cidr("CidrBlock"),
            )
            .with(
                TypeSchema::opaque("AWS::EC2::Subnet")
                    .with_outputs(["SubnetId"])
                    .with_attribute_property("AvailabilityZone", "AvailabilityZone")
                    .with_cidr("CidrBlock"),
            )
            .with(
                TypeSchema::opaque("AWS::EC2::SecurityGroup")
                    .with_outputs(["GroupId", "VpcId"])
                    .with_ingress("SecurityGroupIngress"),
            )
            .with(
                TypeSchema::opaque("AWS::ElasticLoadBalancingV2::LoadBalancer")
                    .with_outputs([
                        "CanonicalHostedZoneID",
                        "DNSName",
                        "LoadBalancerArn",
                        "LoadBalancerFullName",
                    ])
                    .with_attribute_property("LoadBalancerName", "Name"),
            )
            .with(
                TypeSchema::opaque("AWS::ElasticLoadBalancingV2::Listener")
                    .with_outputs(["ListenerArn"]),
            )
            .with(
                TypeSchema::opaque("AWS::ElasticLoadBalancingV2::TargetGroup")
                    .with_outputs(["LoadBalancerArns", "TargetGroupArn", "TargetGroupFullName"])
                    .with_attribute_property("TargetGroupName", "Name"),
            )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_opaque_schema() {
        let schema = TypeSchema::opaque("Custom::Thing");
        assert!(schema.outputs.is_empty());
        assert!(!schema.policy.accepts_statements());
        assert!(schema.protection.is_none());
    }

    #[test]
    fn test_attribute_property_adds_output() {
        let schema = TypeSchema::opaque("AWS::CodeCommit::Repository")
            .with_attribute_property("Name", "RepositoryName");
        assert!(schema.outputs.contains("Name"));
        assert_eq!(schema.attribute_properties["Name"], "RepositoryName");
    }

    #[test]
    fn test_builtin_bucket() {
        let registry = TypeRegistry::builtin();
        let bucket = registry.get("AWS::S3::Bucket").unwrap();
        assert!(bucket.outputs.contains("Arn"));
        assert_eq!(bucket.ref_property.as_deref(), Some("BucketName"));
        assert!(bucket.protection.is_some());
        assert!(matches!(bucket.policy, PolicyAttachment::Companion { .. }));
    }

    #[test]
    fn test_schema_for_falls_back() {
        let registry = TypeRegistry::builtin();
        let schema = registry.schema_for("Custom::Unknown");
        assert_eq!(schema, TypeSchema::opaque("Custom::Unknown"));
    }

    #[test]
    fn test_from_json_and_extend() {
        let json = r#"[{"type_name": "AWS::IAM::Role", "outputs": ["Arn"], "policy": {"mode": "none"}}]"#;
        let custom = TypeRegistry::from_json(json).unwrap();
        let mut registry = TypeRegistry::builtin();
        let before = registry.len();
        registry.extend(custom);
        assert_eq!(registry.len(), before);
        assert!(!registry.get("AWS::IAM::Role").unwrap().policy.accepts_statements());
    }

    #[test]
    fn test_from_json_rejects_garbage() {
        assert!(TypeRegistry::from_json("{").is_err());
    }

    #[test]
    fn test_registry_serde_roundtrip_keeps_order() {
        let registry = TypeRegistry::builtin();
        let json = serde_json::to_string(&registry).unwrap();
        let back: TypeRegistry = serde_json::from_str(&json).unwrap();
        assert_eq!(back, registry);
    }

    #[test]
    fn test_printed_registry_loads_back() {
        let registry = TypeRegistry::builtin();
        let printed = registry.to_json().unwrap();
        assert!(printed.trim_start().starts_with('['));
        assert_eq!(TypeRegistry::from_json(&printed).unwrap(), registry);

        let keyed = serde_json::to_string(&registry).unwrap();
        assert_eq!(TypeRegistry::from_json(&keyed).unwrap(), registry);
    }

    #[test]
    fn test_keyed_registry_name_mismatch() {
        let json = r#"{"Custom::Queue": {"type_name": "Custom::Topic"}}"#;
        assert!(matches!(
            TypeRegistry::from_json(json),
            Err(SynthError::Intake { .. })
        ));
    }
}
