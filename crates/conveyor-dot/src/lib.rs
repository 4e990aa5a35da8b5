//! Parser for the strict Graphviz subset used by Conveyor pipelines.
//!
//! Parses a single `digraph Name { ... }` with nodes, chained edges, typed
//! attributes, and graph/node/edge defaults. Subgraphs, undirected edges,
//! HTML labels, and multiple digraphs per file are rejected.
//!
//! # Example
//! ```
//! let dot = r#"digraph Pipeline { start -> process -> done }"#;
//! let graph = conveyor_dot::parse(dot).unwrap();
//! assert_eq!(graph.name, "Pipeline");
//! assert_eq!(graph.edges.len(), 2);
//! ```

pub mod ast;
mod duration_serde;
mod parser;

pub use ast::*;
pub use parser::parse;
