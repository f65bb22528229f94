//! Synthesis configuration.

use crate::security::IngressMode;
use serde::{Deserialize, Serialize};
use std::path::Path;
use trellis_core::{SynthError, SynthResult};
use trellis_policy::{PolicyComposer, PolicyMode};

/// Synthesis configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SynthConfig {
    /// Unpaired grant handling
    pub policy_mode: PolicyMode,
    /// Duplicate ingress rule handling
    pub ingress_mode: IngressMode,
    /// Condition key a deny-unless-encrypted statement must constrain
    pub encryption_condition_key: String,
    /// Encryption value injected statements require
    pub required_encryption: String,
    /// `AWSTemplateFormatVersion` of rendered templates
    pub template_format_version: String,
}

impl Default for SynthConfig {
    fn default() -> Self {
        Self {
            policy_mode: PolicyMode::Strict,
            ingress_mode: IngressMode::Strict,
            encryption_condition_key: "s3:x-amz-server-side-encryption".to_string(),
            required_encryption: "aws:kms".to_string(),
            template_format_version: "2010-09-09".to_string(),
        }
    }
}

impl SynthConfig {
    /// Set the policy mode
    #[must_use]
    pub fn with_policy_mode(mut self, mode: PolicyMode) -> Self {
        self.policy_mode = mode;
        self
    }

    /// Set the ingress mode
    #[must_use]
    pub fn with_ingress_mode(mut self, mode: IngressMode) -> Self {
        self.ingress_mode = mode;
        self
    }

    /// Parse from JSON; missing fields take their defaults
    ///
    /// # Errors
    ///
    /// Returns `Intake` if the document is malformed
    pub fn from_json(json: &str) -> SynthResult<Self> {
        Ok(serde_json::from_str(json)?)
    }

    /// Load from a JSON file
    ///
    /// # Errors
    ///
    /// Returns `Intake` if the file cannot be read or parsed
    pub fn load(path: &Path) -> SynthResult<Self> {
        let json = std::fs::read_to_string(path)
            .map_err(|e| SynthError::intake(format!("cannot read {}: {e}", path.display())))?;
        Self::from_json(&json)
    }

    /// Policy composer for this configuration
    #[must_use]
    pub fn composer(&self) -> PolicyComposer {
        PolicyComposer::new(self.policy_mode)
            .with_condition_key(self.encryption_condition_key.clone())
            .with_required_encryption(self.required_encryption.clone())
    }
}
