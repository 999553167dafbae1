//! Resolution of document configuration into an ordered dependency graph.
//!
//! The resolver expands every config entry into [`DocumentSpec`]s (one per
//! matching file or virtual name), applies the conditional creation rules,
//! links declared inputs once every document exists, and sorts the result so
//! that each document comes after all of its inputs.

#![warn(missing_docs)]

pub mod document;
pub mod error;
pub mod graph;
pub mod pattern;
pub mod resolver;
pub mod toposort;

pub use document::{DocumentSpec, SourceSpec};
pub use error::GraphError;
pub use graph::ResolvedGraph;
pub use resolver::{resolve, ResolveOptions};
pub use toposort::topological_order;
