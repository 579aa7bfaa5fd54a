//! # Call Graph
//!
//! Aggregated view of everything the stack reconstructor has completed.
//!
//! ## Structure
//!
//! - One [`GraphNode`] per method id: call count, total elapsed time
//! - One [`GraphLink`] per observed `caller → callee` pair, never a self-link
//!
//! Links own their endpoints (`Arc`), nodes only point back at their links
//! (`Weak`), so dropping the maps frees everything.
//!
//! ## Concurrency
//!
//! Written by a single aggregator, read by anyone. Counters are atomics and
//! the maps are `DashMap`s. [`CallGraph::clear`] swaps in fresh maps; nodes
//! and links handed out earlier stay valid but no longer belong to the graph.
//!
//! ## Reveal State
//!
//! Each node and link carries an opaque state slot a presentation layer
//! uses to remember what it has shown. [`CallGraph::hot_path`] only looks at
//! nodes whose slot is empty.

use dashmap::DashMap;
use parking_lot::RwLock;
use std::any::Any;
use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use super::statistics::{exceeds, hot_threshold};
use crate::domain::{MethodId, MethodIdentity};
use crate::profiling::{RecordChain, StackFrame, WatchEvent};

/// Opaque presentation state attached to a node or link
pub type RevealState = Arc<dyn Any + Send + Sync>;

// ============================================================================
// Nodes and Links
// ============================================================================

#[derive(Debug)]
pub struct GraphNode {
    method: Arc<MethodIdentity>,
    calls: AtomicU64,
    elapsed: AtomicU64,
    incoming: RwLock<Vec<Weak<GraphLink>>>,
    outgoing: RwLock<Vec<Weak<GraphLink>>>,
    state: RwLock<Option<RevealState>>,
}

impl GraphNode {
    fn new(method: Arc<MethodIdentity>) -> Self {
        Self {
            method,
            calls: AtomicU64::new(0),
            elapsed: AtomicU64::new(0),
            incoming: RwLock::new(Vec::new()),
            outgoing: RwLock::new(Vec::new()),
            state: RwLock::new(None),
        }
    }

    #[must_use]
    pub fn method(&self) -> &Arc<MethodIdentity> {
        &self.method
    }

    #[must_use]
    pub fn id(&self) -> MethodId {
        self.method.id()
    }

    #[must_use]
    pub fn calls(&self) -> u64 {
        self.calls.load(Ordering::Relaxed)
    }

    /// Total time spent in completed calls, in the target's clock units
    #[must_use]
    pub fn elapsed(&self) -> u64 {
        self.elapsed.load(Ordering::Relaxed)
    }

    pub fn add_calls(&self, calls: u64) {
        self.calls.fetch_add(calls, Ordering::Relaxed);
    }

    pub fn add_elapsed(&self, elapsed: u64) {
        self.elapsed.fetch_add(elapsed, Ordering::Relaxed);
    }

    /// Links into this node that still belong to a live graph
    #[must_use]
    pub fn incoming_links(&self) -> Vec<Arc<GraphLink>> {
        self.incoming.read().iter().filter_map(Weak::upgrade).collect()
    }

    /// Links out of this node that still belong to a live graph
    #[must_use]
    pub fn outgoing_links(&self) -> Vec<Arc<GraphLink>> {
        self.outgoing.read().iter().filter_map(Weak::upgrade).collect()
    }

    pub fn set_state(&self, state: RevealState) {
        *self.state.write() = Some(state);
    }

    pub fn clear_state(&self) {
        *self.state.write() = None;
    }

    #[must_use]
    pub fn state(&self) -> Option<RevealState> {
        self.state.read().clone()
    }

    #[must_use]
    pub fn has_state(&self) -> bool {
        self.state.read().is_some()
    }
}

#[derive(Debug)]
pub struct GraphLink {
    source: Arc<GraphNode>,
    target: Arc<GraphNode>,
    state: RwLock<Option<RevealState>>,
}

impl GraphLink {
    /// The caller
    #[must_use]
    pub fn source(&self) -> &Arc<GraphNode> {
        &self.source
    }

    /// The callee
    #[must_use]
    pub fn target(&self) -> &Arc<GraphNode> {
        &self.target
    }

    pub fn set_state(&self, state: RevealState) {
        *self.state.write() = Some(state);
    }

    pub fn clear_state(&self) {
        *self.state.write() = None;
    }

    #[must_use]
    pub fn state(&self) -> Option<RevealState> {
        self.state.read().clone()
    }

    #[must_use]
    pub fn has_state(&self) -> bool {
        self.state.read().is_some()
    }
}

/// Traversal callback position
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Visit {
    /// First time the node is reached
    Enter,
    /// All of the node's neighbours have been explored
    Leave,
}

// ============================================================================
// Graph
// ============================================================================

#[derive(Debug, Default)]
struct GraphMaps {
    nodes: DashMap<MethodId, Arc<GraphNode>>,
    links: DashMap<(MethodId, MethodId), Arc<GraphLink>>,
}

#[derive(Debug, Default)]
pub struct CallGraph {
    maps: RwLock<Arc<GraphMaps>>,
}

impl CallGraph {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn maps(&self) -> Arc<GraphMaps> {
        Arc::clone(&self.maps.read())
    }

    /// Drop every node and link.
    pub fn clear(&self) {
        *self.maps.write() = Arc::new(GraphMaps::default());
    }

    pub fn get_or_create_node(&self, method: &Arc<MethodIdentity>) -> Arc<GraphNode> {
        let maps = self.maps();
        let node = maps
            .nodes
            .entry(method.id())
            .or_insert_with(|| Arc::new(GraphNode::new(Arc::clone(method))));
        Arc::clone(node.value())
    }

    /// Link `source → target`. Returns `None` for a self-link, which is never created.
    pub fn get_or_create_link(
        &self,
        source: &Arc<GraphNode>,
        target: &Arc<GraphNode>,
    ) -> Option<Arc<GraphLink>> {
        if source.id() == target.id() {
            return None;
        }
        let maps = self.maps();
        let link = maps.links.entry((source.id(), target.id())).or_insert_with(|| {
            let link = Arc::new(GraphLink {
                source: Arc::clone(source),
                target: Arc::clone(target),
                state: RwLock::new(None),
            });
            source.outgoing.write().push(Arc::downgrade(&link));
            target.incoming.write().push(Arc::downgrade(&link));
            link
        });
        Some(Arc::clone(link.value()))
    }

    #[must_use]
    pub fn node(&self, id: MethodId) -> Option<Arc<GraphNode>> {
        self.maps().nodes.get(&id).map(|n| Arc::clone(n.value()))
    }

    #[must_use]
    pub fn link(&self, source: MethodId, target: MethodId) -> Option<Arc<GraphLink>> {
        self.maps().links.get(&(source, target)).map(|l| Arc::clone(l.value()))
    }

    /// Snapshot of all nodes, in no particular order
    #[must_use]
    pub fn nodes(&self) -> Vec<Arc<GraphNode>> {
        self.maps().nodes.iter().map(|n| Arc::clone(n.value())).collect()
    }

    /// Snapshot of all links, in no particular order
    #[must_use]
    pub fn links(&self) -> Vec<Arc<GraphLink>> {
        self.maps().links.iter().map(|l| Arc::clone(l.value())).collect()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.maps().nodes.len()
    }

    #[must_use]
    pub fn link_count(&self) -> usize {
        self.maps().links.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.maps().nodes.is_empty()
    }

    // ------------------------------------------------------------------------
    // Updates
    // ------------------------------------------------------------------------

    /// Fold completed calls in: one call and its elapsed time per record,
    /// plus the `caller → method` link.
    pub fn aggregate(&self, records: &RecordChain) {
        for record in records.iter() {
            let node = self.get_or_create_node(record.method());
            node.add_calls(1);
            node.add_elapsed(record.elapsed());

            if let Some(caller) = record.caller() {
                let caller = self.get_or_create_node(caller);
                self.get_or_create_link(&caller, &node);
            }
        }
    }

    /// Count one call for every frame of a watched stack (top first) and
    /// link each frame to the one above it.
    pub fn show_stack(&self, frames: &[StackFrame]) {
        let mut callee: Option<Arc<GraphNode>> = None;
        for frame in frames {
            let node = self.get_or_create_node(&frame.method);
            node.add_calls(1);
            if let Some(ref callee) = callee {
                self.get_or_create_link(&node, callee);
            }
            callee = Some(node);
        }
    }

    pub fn enter_method(&self, caller: Option<&StackFrame>, callee: &StackFrame) {
        let node = self.get_or_create_node(&callee.method);
        node.add_calls(1);
        if let Some(caller) = caller {
            let caller = self.get_or_create_node(&caller.method);
            self.get_or_create_link(&caller, &node);
        }
    }

    pub fn exit_method(&self, exiting: &StackFrame) {
        let node = self.get_or_create_node(&exiting.method);
        if exiting.elapsed != 0 {
            node.add_elapsed(exiting.elapsed);
        }
    }

    pub fn apply(&self, event: &WatchEvent) {
        match event {
            WatchEvent::ShowStack(frames) => self.show_stack(frames),
            WatchEvent::Enter { caller, callee } => self.enter_method(caller.as_ref(), callee),
            WatchEvent::Exit { exiting: Some(exiting), .. } => self.exit_method(exiting),
            WatchEvent::Exit { exiting: None, .. } => {}
        }
    }

    // ------------------------------------------------------------------------
    // Queries
    // ------------------------------------------------------------------------

    /// Unrevealed nodes whose elapsed time or call count exceeds 3σ of the
    /// unrevealed population.
    #[allow(clippy::cast_precision_loss)]
    #[must_use]
    pub fn hot_path(&self) -> Vec<Arc<GraphNode>> {
        let candidates: Vec<Arc<GraphNode>> =
            self.nodes().into_iter().filter(|n| !n.has_state()).collect();

        let elapsed: Vec<f64> = candidates.iter().map(|n| n.elapsed() as f64).collect();
        let calls: Vec<f64> = candidates.iter().map(|n| n.calls() as f64).collect();
        let slow = hot_threshold(&elapsed);
        let busy = hot_threshold(&calls);

        candidates
            .into_iter()
            .filter(|n| exceeds(n.elapsed() as f64, slow) || exceeds(n.calls() as f64, busy))
            .collect()
    }

    /// Nodes lying between `source` and any node in `targets` along
    /// outgoing links. Neither `source` nor a reached target is included
    /// unless it also sits on the way to another target.
    ///
    /// Each node is explored once, so only the first path found through a
    /// shared node is reported.
    #[must_use]
    pub fn find_connections(
        &self,
        source: &Arc<GraphNode>,
        targets: &HashSet<MethodId>,
    ) -> Vec<Arc<GraphNode>> {
        let mut path: Vec<Arc<GraphNode>> = Vec::new();
        let mut seen: HashSet<MethodId> = HashSet::new();
        let mut connecting: Vec<Arc<GraphNode>> = Vec::new();

        Self::traverse_outgoing(source, |visit, node| match visit {
            Visit::Enter => {
                if targets.contains(&node.id()) {
                    for on_path in &path {
                        if seen.insert(on_path.id()) {
                            connecting.push(Arc::clone(on_path));
                        }
                    }
                }
                path.push(Arc::clone(node));
            }
            Visit::Leave => {
                path.pop();
            }
        });

        connecting
    }

    /// Depth-first walk over callees of `start` (not including `start`).
    pub fn traverse_outgoing<F>(start: &Arc<GraphNode>, visitor: F)
    where
        F: FnMut(Visit, &Arc<GraphNode>),
    {
        Self::traverse(
            start,
            |node| node.outgoing_links().iter().map(|l| Arc::clone(l.target())).collect(),
            visitor,
        );
    }

    /// Depth-first walk over callers of `start` (not including `start`).
    pub fn traverse_incoming<F>(start: &Arc<GraphNode>, visitor: F)
    where
        F: FnMut(Visit, &Arc<GraphNode>),
    {
        Self::traverse(
            start,
            |node| node.incoming_links().iter().map(|l| Arc::clone(l.source())).collect(),
            visitor,
        );
    }

    // Iterative so deep call chains cannot overflow the thread stack.
    fn traverse<N, F>(start: &Arc<GraphNode>, neighbours: N, mut visitor: F)
    where
        N: Fn(&GraphNode) -> Vec<Arc<GraphNode>>,
        F: FnMut(Visit, &Arc<GraphNode>),
    {
        let mut visited: HashSet<MethodId> = HashSet::from([start.id()]);
        // (node being expanded, its neighbours, next neighbour index)
        let mut frames: Vec<(Option<Arc<GraphNode>>, Vec<Arc<GraphNode>>, usize)> =
            vec![(None, neighbours(&**start), 0)];

        while let Some((_, next, index)) = frames.last_mut() {
            if let Some(child) = next.get(*index).cloned() {
                *index += 1;
                if visited.insert(child.id()) {
                    visitor(Visit::Enter, &child);
                    let grandchildren = neighbours(&*child);
                    frames.push((Some(child), grandchildren, 0));
                }
            } else if let Some((Some(done), _, _)) = frames.pop() {
                visitor(Visit::Leave, &done);
            }
        }
    }
}
