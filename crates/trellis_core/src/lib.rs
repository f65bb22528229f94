//! TRELLIS Core Types
//!
//! This crate contains pure types and logic with no I/O.
//! Property values, references and resolved values are closed tagged
//! variants so every consumer matches on them exhaustively.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod error;
pub mod hash;
pub mod id;
pub mod value;

// Re-exports
pub use error::{SynthError, SynthResult};
pub use hash::{HashError, PlanDigest};
pub use id::NodeId;
pub use value::{
    is_pseudo_parameter, placeholders, DeferredOutput, Reference, Resolved, Scalar, Value,
};
