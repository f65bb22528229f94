//! Plan digests for change detection.
//!
//! Uses BLAKE3 over the canonical plan bytes. Identical declarations
//! synthesize to identical bytes, so equal digests mean "no change".

use serde::{Deserialize, Serialize};
use std::fmt;

/// BLAKE3 digest of an emitted plan's records
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PlanDigest([u8; 32]);

impl PlanDigest {
    /// Digest the serialized plan records
    #[must_use]
    pub fn compute(records: &[u8]) -> Self {
        Self(*blake3::hash(records).as_bytes())
    }

    /// Lowercase hex, as carried in `Plan::digest`
    #[must_use]
    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    /// Parse from hex string
    ///
    /// # Errors
    ///
    /// Returns `InvalidHex` or `InvalidLength` for anything but 64 hex digits
    pub fn from_hex(text: &str) -> Result<Self, HashError> {
        let bytes = hex::decode(text).map_err(|_| HashError::InvalidHex)?;
        let len = bytes.len();
        bytes
            .try_into()
            .map(Self)
            .map_err(|_| HashError::InvalidLength(len))
    }

    /// Recompute over `records` and compare
    #[must_use]
    pub fn verify(&self, records: &[u8]) -> bool {
        Self::compute(records) == *self
    }
}

impl fmt::Display for PlanDigest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_hex())
    }
}

/// Digest parsing errors
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum HashError {
    /// Invalid hex encoding
    #[error("Invalid hex encoding")]
    InvalidHex,
    /// Invalid length (not 32 bytes)
    #[error("Invalid digest length: {0} (expected 32)")]
    InvalidLength(usize),
}
