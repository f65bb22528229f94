//! TRELLIS Planner
//!
//! Declarative resource-graph synthesis: typed declarations with symbolic
//! references to each other's outputs go in, a validated, ordered and
//! resolved deployment plan comes out.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod config;
pub mod emit;
pub mod graph;
pub mod grapher;
pub mod intake;
pub mod planner;
pub mod resolve;
pub mod schema;
pub mod security;
pub mod synth;
pub mod validate;

pub use config::SynthConfig;
pub use emit::{to_native, Emitter, Plan, PlanRecord};
pub use graph::{Edge, EdgeKind, Graph, NodeHandle, ResourceNode};
pub use grapher::{derive_edges, find_cycle};
pub use intake::{load_graph, parse, Declarations};
pub use planner::Planner;
pub use resolve::{check_references, Resolver};
pub use schema::{PolicyAttachment, TypeRegistry, TypeSchema};
pub use security::{parse_cidr, IngressMode};
pub use synth::{Analysis, Synthesizer};
pub use validate::{FrozenGraph, Validator};
