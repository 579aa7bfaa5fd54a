//! JSON snapshot of a call graph
//!
//! ## Document
//!
//! ```text
//! {
//!   "nodes": [
//!     { "id": "App.Worker", "label": "App.Worker", "namespace": "App", "group": "Expanded" },
//!     { "id": "App.Worker.Step", "label": "Step", "namespace": "App", "type": "Worker",
//!       "calls": 12, "elapsed": 3400, "categories": ["Slow"] }
//!   ],
//!   "links": [
//!     { "source": "App.Worker", "target": "App.Worker.Step", "category": "Contains" },
//!     { "source": "App.Main.Run", "target": "App.Worker.Step" }
//!   ]
//! }
//! ```
//!
//! Method ids are names, not runtime ids, so two exports of the same
//! program can be compared. Overloads share a name and get a numeric
//! suffix (`Step`, `Step2`, ...).

// Counts and elapsed totals are converted to f64 for the 3σ rule
#![allow(clippy::cast_precision_loss)]

use log::info;
use serde::Serialize;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::Path;
use std::sync::Arc;

use crate::analysis::statistics::{exceeds, hot_threshold};
use crate::analysis::{CallGraph, GraphNode};
use crate::domain::{ExportError, MethodId, MethodIdentity, GLOBAL_NAMESPACE};

const GROUP_EXPANDED: &str = "Expanded";
const CATEGORY_SLOW: &str = "Slow";
const CATEGORY_BUSY: &str = "Busy";
const CATEGORY_CONTAINS: &str = "Contains";

#[derive(Debug, Serialize)]
pub struct GraphDocument {
    pub nodes: Vec<ExportNode>,
    pub links: Vec<ExportLink>,
}

#[derive(Debug, Serialize)]
pub struct ExportNode {
    pub id: String,
    pub label: String,
    pub namespace: String,
    #[serde(rename = "type", skip_serializing_if = "Option::is_none")]
    pub type_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub group: Option<&'static str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub calls: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub elapsed: Option<u64>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub categories: Vec<&'static str>,
}

#[derive(Debug, Serialize)]
pub struct ExportLink {
    pub source: String,
    pub target: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub category: Option<&'static str>,
}

/// Writes [`GraphDocument`]s
#[derive(Debug, Default, Clone, Copy)]
pub struct GraphExporter {
    revealed_only: bool,
}

impl GraphExporter {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Only export nodes (and links between nodes) a presentation layer has revealed.
    #[must_use]
    pub fn revealed_only(mut self, revealed_only: bool) -> Self {
        self.revealed_only = revealed_only;
        self
    }

    #[must_use]
    pub fn build(&self, graph: &CallGraph) -> GraphDocument {
        let mut nodes: Vec<Arc<GraphNode>> = graph
            .nodes()
            .into_iter()
            .filter(|n| !self.revealed_only || n.has_state())
            .collect();
        // Stable output regardless of map order
        nodes.sort_by(|a, b| {
            a.method().full_name().cmp(b.method().full_name()).then(a.id().cmp(&b.id()))
        });

        let elapsed: Vec<f64> = nodes.iter().map(|n| n.elapsed() as f64).collect();
        let calls: Vec<f64> = nodes.iter().map(|n| n.calls() as f64).collect();
        let slow = hot_threshold(&elapsed);
        let busy = hot_threshold(&calls);

        let mut names = NameTable::default();
        let mut containers: BTreeMap<String, ExportNode> = BTreeMap::new();
        let mut methods = Vec::with_capacity(nodes.len());
        let mut links = Vec::new();

        for node in &nodes {
            let method = node.method();
            let id = names.id_for(method);
            let namespace = method.namespace().unwrap_or(GLOBAL_NAMESPACE).to_string();

            if let Some(full_type) = method.qualified_type() {
                containers.entry(full_type.clone()).or_insert_with(|| ExportNode {
                    id: full_type.clone(),
                    label: full_type.clone(),
                    namespace: namespace.clone(),
                    type_name: None,
                    group: Some(GROUP_EXPANDED),
                    calls: None,
                    elapsed: None,
                    categories: Vec::new(),
                });
                links.push(ExportLink {
                    source: full_type,
                    target: id.clone(),
                    category: Some(CATEGORY_CONTAINS),
                });
            }

            let mut categories = Vec::new();
            if exceeds(node.elapsed() as f64, slow) {
                categories.push(CATEGORY_SLOW);
            }
            if exceeds(node.calls() as f64, busy) {
                categories.push(CATEGORY_BUSY);
            }

            methods.push(ExportNode {
                id,
                label: method.name().to_string(),
                namespace,
                type_name: method.type_name().map(str::to_string),
                group: None,
                calls: Some(node.calls()),
                elapsed: Some(node.elapsed()),
                categories,
            });
        }

        let exported: HashSet<MethodId> = nodes.iter().map(|n| n.id()).collect();
        let mut call_links: Vec<ExportLink> = graph
            .links()
            .into_iter()
            .filter(|l| exported.contains(&l.source().id()) && exported.contains(&l.target().id()))
            .map(|l| ExportLink {
                source: names.id_for(l.source().method()),
                target: names.id_for(l.target().method()),
                category: None,
            })
            .collect();
        call_links.sort_by(|a, b| (&a.source, &a.target).cmp(&(&b.source, &b.target)));
        links.extend(call_links);

        let mut all_nodes: Vec<ExportNode> = containers.into_values().collect();
        all_nodes.extend(methods);
        GraphDocument { nodes: all_nodes, links }
    }

    /// Serialize `graph` as pretty-printed JSON.
    ///
    /// # Errors
    /// Returns an error if serialization or the write fails.
    pub fn export<W: Write>(&self, graph: &CallGraph, writer: W) -> Result<(), ExportError> {
        let document = self.build(graph);
        serde_json::to_writer_pretty(writer, &document)?;
        Ok(())
    }

    /// # Errors
    /// `WriteFailed` if the file cannot be created, otherwise as [`Self::export`].
    pub fn export_to_file(&self, graph: &CallGraph, path: &Path) -> Result<(), ExportError> {
        let file = File::create(path)
            .map_err(|e| ExportError::WriteFailed(format!("{}: {e}", path.display())))?;
        let mut writer = BufWriter::new(file);
        self.export(graph, &mut writer)?;
        writer.flush()?;
        info!("Exported {} nodes to {}", graph.len(), path.display());
        Ok(())
    }
}

/// Assigns export ids, suffixing repeated names
#[derive(Debug, Default)]
struct NameTable {
    by_method: HashMap<MethodId, String>,
    taken: HashSet<String>,
}

impl NameTable {
    fn id_for(&mut self, method: &MethodIdentity) -> String {
        if let Some(id) = self.by_method.get(&method.id()) {
            return id.clone();
        }
        let base = match method.qualified_type() {
            Some(full_type) => format!("{full_type}.{}", method.name()),
            None => method.name().to_string(),
        };
        let mut candidate = base.clone();
        let mut suffix = 2;
        while self.taken.contains(&candidate) {
            candidate = format!("{base}{suffix}");
            suffix += 1;
        }
        self.taken.insert(candidate.clone());
        self.by_method.insert(method.id(), candidate.clone());
        candidate
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::Value;

    fn method(id: u64, name: &str) -> Arc<MethodIdentity> {
        Arc::new(MethodIdentity::new(MethodId(id), name))
    }

    fn export_json(graph: &CallGraph) -> Value {
        let mut out = Vec::new();
        GraphExporter::new().export(graph, &mut out).unwrap();
        serde_json::from_slice(&out).unwrap()
    }

    #[test]
    fn test_type_containers_and_contains_links() {
        let graph = CallGraph::new();
        let run = graph.get_or_create_node(&method(3, "App.Main.Run"));
        let step = graph.get_or_create_node(&method(4, "App.Worker.Step"));
        run.add_calls(1);
        step.add_calls(2);
        graph.get_or_create_link(&run, &step);

        let doc = export_json(&graph);
        let nodes = doc["nodes"].as_array().unwrap();
        assert_eq!(nodes.len(), 4);
        assert_eq!(nodes[0]["id"], "App.Main");
        assert_eq!(nodes[0]["group"], "Expanded");
        assert_eq!(nodes[3]["id"], "App.Worker.Step");
        assert_eq!(nodes[3]["label"], "Step");
        assert_eq!(nodes[3]["type"], "Worker");
        assert_eq!(nodes[3]["calls"], 2);

        let links = doc["links"].as_array().unwrap();
        let contains = links.iter().filter(|l| l["category"] == "Contains").count();
        assert_eq!(contains, 2);
        assert!(links.iter().any(|l| l["source"] == "App.Main.Run"
            && l["target"] == "App.Worker.Step"
            && l.get("category").is_none()));
    }

    #[test]
    fn test_global_types_use_global_namespace() {
        let graph = CallGraph::new();
        graph.get_or_create_node(&method(3, "Program.Main"));
        let doc = export_json(&graph);
        assert_eq!(doc["nodes"][0]["id"], "::.Program");
        assert_eq!(doc["nodes"][1]["id"], "::.Program.Main");
        assert_eq!(doc["nodes"][1]["namespace"], "::");
    }

    #[test]
    fn test_overloads_get_suffixes() {
        let graph = CallGraph::new();
        graph.get_or_create_node(&method(3, "App.Math.Add"));
        graph.get_or_create_node(&method(4, "App.Math.Add"));
        graph.get_or_create_node(&method(5, "App.Math.Add"));

        let doc = GraphExporter::new().build(&graph);
        let ids: Vec<&str> = doc.nodes.iter().skip(1).map(|n| n.id.as_str()).collect();
        assert_eq!(ids, vec!["App.Math.Add", "App.Math.Add2", "App.Math.Add3"]);
    }

    #[test]
    fn test_slow_and_busy_categories() {
        let graph = CallGraph::new();
        for id in 10..30 {
            let node = graph.get_or_create_node(&method(id, &format!("App.T.m{id}")));
            node.add_calls(1);
            node.add_elapsed(1);
        }
        let hot = graph.get_or_create_node(&method(99, "App.T.zhot"));
        hot.add_calls(100);
        hot.add_elapsed(100);

        let doc = GraphExporter::new().build(&graph);
        let hot = doc.nodes.iter().find(|n| n.id == "App.T.zhot").unwrap();
        assert_eq!(hot.categories, vec!["Slow", "Busy"]);
        let cold = doc.nodes.iter().find(|n| n.id == "App.T.m10").unwrap();
        assert!(cold.categories.is_empty());
    }

    #[test]
    fn test_revealed_only_filters_nodes_and_links() {
        let graph = CallGraph::new();
        let a = graph.get_or_create_node(&method(3, "N.T.a"));
        let b = graph.get_or_create_node(&method(4, "N.T.b"));
        graph.get_or_create_link(&a, &b);
        a.set_state(Arc::new(()));

        let doc = GraphExporter::new().revealed_only(true).build(&graph);
        let ids: Vec<&str> = doc.nodes.iter().map(|n| n.id.as_str()).collect();
        assert_eq!(ids, vec!["N.T", "N.T.a"]);
        assert!(doc.links.iter().all(|l| l.category == Some("Contains")));
    }

    #[test]
    fn test_export_to_missing_directory_fails() {
        let graph = CallGraph::new();
        let err = GraphExporter::new()
            .export_to_file(&graph, Path::new("/nonexistent/dir/graph.json"))
            .unwrap_err();
        assert!(matches!(err, ExportError::WriteFailed(_)));
    }
}
