//! Graph export
//!
//! Writes a [`CallGraph`](crate::analysis::CallGraph) snapshot as JSON, with
//! methods grouped under their types and outliers tagged `Slow` / `Busy`.

pub mod graph_export;

pub use graph_export::{ExportLink, ExportNode, GraphDocument, GraphExporter};
