//! Graph model shared by the authoring boundary and the render-side mirror.
//!
//! The mirror (`GraphSnapshot`) is a copy of the authoring document's graph,
//! mutated only by protocol messages. Its edge list is the single source of
//! truth; producer/consumer/input lookups derive from it on demand.

use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::sync::Arc;

use anyhow::{Result, bail};
use serde::{Deserialize, Serialize};

use crate::blueprint::Blueprint;
use crate::value::ParamValue;

pub type NodeId = u32;

/// Sampling filter used for a node's cached output texture.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FilterMode {
    Nearest,
    #[default]
    Linear,
}

fn default_texture_size() -> u32 {
    512
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Node {
    pub id: NodeId,
    pub blueprint: String,
    #[serde(default)]
    pub params: BTreeMap<String, ParamValue>,
    /// Square output resolution in texels.
    #[serde(default = "default_texture_size")]
    pub texture_size: u32,
    #[serde(default)]
    pub filter: FilterMode,
    /// Editor canvas position; affects the UI overlay only, never textures.
    #[serde(default)]
    pub position: [f32; 2],
}

/// `(nodeId, socketName)`, serialized as a two-element array on the wire.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SocketRef(pub NodeId, pub String);

impl SocketRef {
    pub fn new(node: NodeId, socket: impl Into<String>) -> Self {
        SocketRef(node, socket.into())
    }

    pub fn node(&self) -> NodeId {
        self.0
    }

    pub fn socket(&self) -> &str {
        &self.1
    }
}

/// Directed edge from an output socket to an input socket.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Edge {
    pub from: SocketRef,
    pub to: SocketRef,
}

/// Validate (and possibly repair) an edge at the authoring boundary.
///
/// Socket roles are inferred from the blueprints' socket tables. An edge
/// declared backwards (input→output) is repaired by swapping endpoints when
/// that resolves the mismatch; self-loops and unresolvable role mixes are
/// rejected and never reach the render mirror.
pub fn normalize_edge(
    from: SocketRef,
    to: SocketRef,
    from_blueprint: &Blueprint,
    to_blueprint: &Blueprint,
) -> Result<Edge> {
    if from.node() == to.node() {
        bail!("edge connects node {} to itself", from.node());
    }

    let is_output = |bp: &Blueprint, socket: &str| bp.outputs.iter().any(|s| s == socket);
    let is_input = |bp: &Blueprint, socket: &str| bp.inputs.iter().any(|s| s == socket);

    if is_output(from_blueprint, from.socket()) && is_input(to_blueprint, to.socket()) {
        return Ok(Edge { from, to });
    }
    if is_output(to_blueprint, to.socket()) && is_input(from_blueprint, from.socket()) {
        return Ok(Edge { from: to, to: from });
    }

    bail!(
        "malformed edge: {}.{} -> {}.{} (no output->input orientation)",
        from.node(),
        from.socket(),
        to.node(),
        to.socket()
    )
}

/// Insert an edge with last-write-wins semantics on the destination input:
/// a prior edge into the same input socket is silently replaced.
pub fn apply_edge(edges: &mut Vec<Edge>, edge: Edge) {
    edges.retain(|e| e.to != edge.to);
    edges.push(edge);
}

#[derive(Debug, Clone)]
pub struct NodeEntry {
    pub node: Node,
    pub blueprint: Arc<Blueprint>,
}

/// Render-side mirror of the authoring graph.
#[derive(Debug, Clone, Default)]
pub struct GraphSnapshot {
    nodes: HashMap<NodeId, NodeEntry>,
    edges: Vec<Edge>,
}

impl GraphSnapshot {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert_node(&mut self, node: Node, blueprint: Arc<Blueprint>) {
        self.nodes.insert(node.id, NodeEntry { node, blueprint });
    }

    pub fn node(&self, id: NodeId) -> Option<&NodeEntry> {
        self.nodes.get(&id)
    }

    pub fn node_mut(&mut self, id: NodeId) -> Option<&mut NodeEntry> {
        self.nodes.get_mut(&id)
    }

    pub fn contains(&self, id: NodeId) -> bool {
        self.nodes.contains_key(&id)
    }

    /// Remove a node and every edge touching it.
    pub fn remove_node(&mut self, id: NodeId) -> Option<NodeEntry> {
        self.edges
            .retain(|e| e.from.node() != id && e.to.node() != id);
        self.nodes.remove(&id)
    }

    pub fn replace_edges(&mut self, edges: Vec<Edge>) {
        self.edges = edges;
    }

    pub fn edges(&self) -> &[Edge] {
        &self.edges
    }

    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }

    /// Node ids in ascending order (deterministic full-graph traversals).
    pub fn node_ids(&self) -> Vec<NodeId> {
        let mut ids: Vec<NodeId> = self.nodes.keys().copied().collect();
        ids.sort_unstable();
        ids
    }

    /// Direct consumers of `id`'s outputs, in edge-list order, deduplicated.
    pub fn consumers(&self, id: NodeId) -> Vec<NodeId> {
        let mut seen = HashSet::new();
        self.edges
            .iter()
            .filter(|e| e.from.node() == id)
            .map(|e| e.to.node())
            .filter(|n| seen.insert(*n))
            .collect()
    }

    /// Direct producers feeding `id`'s inputs, in edge-list order, deduplicated.
    pub fn producers(&self, id: NodeId) -> Vec<NodeId> {
        let mut seen = HashSet::new();
        self.edges
            .iter()
            .filter(|e| e.to.node() == id)
            .map(|e| e.from.node())
            .filter(|n| seen.insert(*n))
            .collect()
    }

    /// The output socket feeding `id`'s input socket, if connected.
    /// An input has at most one incoming edge; the last one in the list wins.
    pub fn input_source(&self, id: NodeId, socket: &str) -> Option<&SocketRef> {
        self.edges
            .iter()
            .rev()
            .find(|e| e.to.node() == id && e.to.socket() == socket)
            .map(|e| &e.from)
    }

    /// Kahn's algorithm over the live edge list; edges referencing unknown
    /// nodes are skipped (they are a desync artifact, not a cycle).
    pub fn check_acyclic(&self) -> Result<()> {
        let mut indeg: HashMap<NodeId, usize> =
            self.nodes.keys().map(|id| (*id, 0usize)).collect();
        let mut outgoing: HashMap<NodeId, Vec<NodeId>> = HashMap::new();

        for e in &self.edges {
            let (from, to) = (e.from.node(), e.to.node());
            if !indeg.contains_key(&from) || !indeg.contains_key(&to) {
                continue;
            }
            *indeg.get_mut(&to).unwrap() += 1;
            outgoing.entry(from).or_default().push(to);
        }

        let mut q: VecDeque<NodeId> = indeg
            .iter()
            .filter_map(|(id, d)| (*d == 0).then_some(*id))
            .collect();
        let mut visited = 0usize;

        while let Some(n) = q.pop_front() {
            visited += 1;
            if let Some(nexts) = outgoing.get(&n) {
                for m in nexts {
                    let entry = indeg.get_mut(m).unwrap();
                    *entry -= 1;
                    if *entry == 0 {
                        q.push_back(*m);
                    }
                }
            }
        }

        if visited != self.nodes.len() {
            bail!("cycle detected in graph (cannot schedule)");
        }
        Ok(())
    }
}
