//! TRELLIS Policy System
//!
//! Policy statements attached to resource nodes, idempotent statement
//! merging with deny precedence, and the least-privilege pairing check
//! that guards write grants on encryption-capable resources.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod compose;
pub mod matcher;
pub mod statement;

pub use compose::{
    Composition, InjectedPairing, PolicyComposer, PolicyMode, ProtectedResource, Protection,
};
pub use matcher::action_matches;
pub use statement::{Effect, PolicyStatement, Principal, StatementSet, POLICY_VERSION};
