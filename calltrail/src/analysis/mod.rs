//! Analysis of reconstructed calls
//!
//! - [`call_graph`]: aggregated caller/callee graph and its queries
//! - [`statistics`]: the 3σ rule behind hot-path selection

pub mod call_graph;
pub mod statistics;

pub use call_graph::{CallGraph, GraphLink, GraphNode, RevealState, Visit};
