//! The synthesis pipeline.
//!
//! declarations -> validate (graph edges, completeness, cycles) -> compose
//! policies -> plan order -> resolve -> emit. Each phase fails fast and the
//! whole run aborts on the first error, so a caller gets either a complete
//! plan or a single error.

use crate::config::SynthConfig;
use crate::emit::{Emitter, Plan};
use crate::graph::{Graph, NodeHandle};
use crate::intake;
use crate::planner::Planner;
use crate::schema::TypeRegistry;
use crate::validate::{FrozenGraph, Validator};
use std::collections::BTreeMap;
use trellis_core::{NodeId, SynthResult};
use trellis_policy::Composition;

/// A validated graph with its composed policies and materialization order
#[derive(Debug, Clone)]
pub struct Analysis {
    /// The frozen graph
    pub frozen: FrozenGraph,
    /// Composed policy statements
    pub composition: Composition,
    /// Materialization order
    pub order: Vec<NodeHandle>,
}

impl Analysis {
    /// Node ids in materialization order
    #[must_use]
    pub fn order_ids(&self) -> Vec<&NodeId> {
        self.order
            .iter()
            .filter_map(|&h| self.frozen.graph().node(h).map(|n| &n.id))
            .collect()
    }
}

/// Runs the synthesis pipeline
#[derive(Debug, Clone)]
pub struct Synthesizer {
    config: SynthConfig,
    registry: TypeRegistry,
}

impl Synthesizer {
    /// Create a synthesizer with the built-in type registry
    #[must_use]
    pub fn new(config: SynthConfig) -> Self {
        Self {
            config,
            registry: TypeRegistry::builtin(),
        }
    }

    /// Replace the type registry
    #[must_use]
    pub fn with_registry(mut self, registry: TypeRegistry) -> Self {
        self.registry = registry;
        self
    }

    /// Configuration in use
    #[must_use]
    pub fn config(&self) -> &SynthConfig {
        &self.config
    }

    /// Type registry in use
    #[must_use]
    pub fn registry(&self) -> &TypeRegistry {
        &self.registry
    }

    /// Validate, compose and order a graph without emitting
    ///
    /// # Errors
    ///
    /// Returns the first structural, policy or ordering error
    pub fn analyze(&self, graph: Graph) -> SynthResult<Analysis> {
        let frozen = Validator::new(&self.registry)
            .with_ingress_mode(self.config.ingress_mode)
            .validate(graph)?;

        let composer = self.config.composer();
        let protected = frozen.protected();
        let composition = composer.compose(frozen.attachments(), &protected)?;
        if !composition.injected.is_empty() {
            composer.verify(&composition, &protected)?;
            tracing::info!(
                injected = composition.injected.len(),
                "auto-heal pairings verified"
            );
        }

        let order = Planner::new().plan(&frozen)?;
        Ok(Analysis {
            frozen,
            composition,
            order,
        })
    }

    /// Synthesize a plan from a graph
    ///
    /// # Errors
    ///
    /// Returns the first error of any phase; no partial plan is produced
    pub fn synthesize(&self, graph: Graph) -> SynthResult<Plan> {
        let span = tracing::info_span!("synthesize", nodes = graph.len());
        let _guard = span.enter();

        let analysis = self.analyze(graph)?;
        Emitter::new(&analysis.frozen, &analysis.composition)
            .with_format_version(self.config.template_format_version.clone())
            .emit(&analysis.order)
    }

    /// Synthesize a plan from a JSON declaration document
    ///
    /// # Errors
    ///
    /// Returns `Intake` for a malformed document, otherwise as
    /// [`Synthesizer::synthesize`]
    pub fn synthesize_json(
        &self,
        json: &str,
        overrides: &BTreeMap<String, String>,
    ) -> SynthResult<Plan> {
        self.synthesize(intake::load_graph(json, overrides)?)
    }
}

impl Default for Synthesizer {
    fn default() -> Self {
        Self::new(SynthConfig::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::ResourceNode;
    use trellis_core::{SynthError, Value};
    use trellis_policy::{PolicyMode, PolicyStatement};

    fn grant_graph() -> Graph {
        let mut graph = Graph::new();
        graph
            .insert(ResourceNode::new("Bucket", "AWS::S3::Bucket"))
            .unwrap();
        graph
            .insert(
                ResourceNode::new("Role", "AWS::IAM::Role").with_statement(
                    PolicyStatement::allow()
                        .with_action("s3:PutObject")
                        .with_resource(Value::get_att("Bucket", "Arn")),
                ),
            )
            .unwrap();
        graph
    }

    #[test]
    fn test_strict_rejects_unpaired_grant() {
        let err = Synthesizer::default().synthesize(grant_graph()).unwrap_err();
        assert_eq!(
            err,
            SynthError::InsecureResourceGrant {
                principal: "Role".into(),
                resource: "Bucket".into(),
                action: "s3:PutObject".into(),
            }
        );
    }

    #[test]
    fn test_auto_heal_emits_companion_policy() {
        let config = SynthConfig::default().with_policy_mode(PolicyMode::AutoHeal);
        let plan = Synthesizer::new(config).synthesize(grant_graph()).unwrap();
        let ids: Vec<_> = plan.order().into_iter().map(NodeId::as_str).collect();
        assert_eq!(ids, vec!["Bucket", "BucketPolicy", "Role"]);
        let statement = &plan.record("BucketPolicy").unwrap().properties["PolicyDocument"]
            ["Statement"][0];
        assert_eq!(statement["Sid"], "DenyUnEncryptedPutObject");
        assert_eq!(statement["Effect"], "Deny");
    }

    #[test]
    fn test_analyze_reports_order() {
        let config = SynthConfig::default().with_policy_mode(PolicyMode::AutoHeal);
        let analysis = Synthesizer::new(config).analyze(grant_graph()).unwrap();
        let ids: Vec<_> = analysis.order_ids().into_iter().map(NodeId::as_str).collect();
        assert_eq!(ids, vec!["Bucket", "Role"]);
        assert_eq!(analysis.composition.injected.len(), 1);
    }

    #[test]
    fn test_synthesize_json() {
        let plan = Synthesizer::default()
            .synthesize_json(
                r#"{"resources": {"Repo": {"type": "AWS::CodeCommit::Repository",
                    "properties": {"RepositoryName": "java-project"}}}}"#,
                &BTreeMap::new(),
            )
            .unwrap();
        assert_eq!(plan.records.len(), 1);
        assert_eq!(plan.records[0].properties["RepositoryName"], "java-project");
    }
}
