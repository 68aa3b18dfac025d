//! Domain types for the bowser generation client.
//!
//! Everything in this crate is pure: templates, parameter sets, graph
//! construction, prompt syntax and runtime estimation. Network I/O lives in
//! `bowser-comfyui`.

pub mod error;
pub mod estimation;
pub mod graph;
pub mod hashing;
pub mod naming;
pub mod params;
pub mod prompt_syntax;
pub mod template;
pub mod types;

pub use error::BuildError;
pub use graph::{BuildOptions, BuiltGraph, ExecutionGraph, GraphBuilder, GraphNode};
pub use params::{MediaRef, ParamValue, ParameterSet, SeedValue};
pub use template::{ParamKind, ParameterSpec, WorkflowTemplate};
pub use types::{CorrelationId, EntryId, ServerId, Timestamp};
