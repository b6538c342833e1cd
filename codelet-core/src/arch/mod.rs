//! Hardware Architecture Graph: a hierarchical graph of storage and compute
//! nodes with bandwidth-carrying edges, capability sets and per-node
//! occupancy tables. The graph is built through [`HagBuilder`] and sealed on
//! `build`; the sealed [`Hag`] offers O(1) name lookups over the all-nodes
//! closure.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::fmt;

use petgraph::graphmap::DiGraphMap;
use serde::{Deserialize, Serialize};

use crate::{Error, Result};

mod builder;
pub use builder::HagBuilder;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum NodeKind {
    Storage,
    Compute,
    Communication,
    Composite,
}

impl fmt::Display for NodeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            NodeKind::Storage => "storage",
            NodeKind::Compute => "compute",
            NodeKind::Communication => "communication",
            NodeKind::Composite => "composite",
        };
        f.write_str(s)
    }
}

/// One scheduled interval on a node. Intervals are half-open `[begin, end)`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Occupancy {
    pub op_id: usize,
    pub capability: String,
    pub begin: u64,
    pub end: u64,
}

#[derive(Debug, Clone)]
pub struct ArchNode {
    index: usize,
    name: String,
    kind: NodeKind,
    /// Storage capacity in bytes; zero for non-storage nodes.
    capacity: u64,
    /// Compute array dimensionality, e.g. `[16, 16]` for a systolic array.
    dimensions: Vec<u64>,
    capabilities: BTreeSet<String>,
    occupied: Vec<Occupancy>,
    parent: Option<usize>,
    depth: usize,
}

impl ArchNode {
    pub(crate) fn new(index: usize, name: String, kind: NodeKind, depth: usize) -> Self {
        Self {
            index,
            name,
            kind,
            capacity: 0,
            dimensions: Vec::new(),
            capabilities: BTreeSet::new(),
            occupied: Vec::new(),
            parent: None,
            depth,
        }
    }

    pub(crate) fn set_capacity(&mut self, bytes: u64) {
        self.capacity = bytes;
    }

    pub(crate) fn set_dimensions(&mut self, dims: &[u64]) {
        self.dimensions = dims.to_vec();
    }

    pub(crate) fn set_parent(&mut self, parent: usize) {
        self.parent = Some(parent);
    }

    pub(crate) fn add_capability(&mut self, name: String) {
        self.capabilities.insert(name);
    }

    pub fn index(&self) -> usize {
        self.index
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn kind(&self) -> NodeKind {
        self.kind
    }

    /// Storage capacity in bytes.
    pub fn capacity(&self) -> u64 {
        self.capacity
    }

    /// Storage capacity in bits, the unit tile constraints are written in.
    pub fn capacity_bits(&self) -> u64 {
        self.capacity * 8
    }

    pub fn dimensions(&self) -> &[u64] {
        &self.dimensions
    }

    pub fn parent(&self) -> Option<usize> {
        self.parent
    }

    /// Number of composite ancestors above this node.
    pub fn depth(&self) -> usize {
        self.depth
    }

    pub fn capabilities(&self) -> &BTreeSet<String> {
        &self.capabilities
    }

    pub fn is_compatible(&self, op_name: &str) -> bool {
        self.capabilities.contains(op_name)
    }

    pub fn occupied(&self) -> &[Occupancy] {
        &self.occupied
    }

    /// True when `[begin, end)` overlaps no scheduled interval. Two intervals
    /// overlap iff `b1 < e2 && b2 < e1`; adjacency at endpoints is allowed.
    pub fn is_available(&self, begin: u64, end: u64) -> bool {
        !self
            .occupied
            .iter()
            .any(|o| o.begin < end && begin < o.end)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Edge {
    pub src: usize,
    pub dst: usize,
    /// Bits per cycle.
    pub bandwidth: u64,
    pub attributes: BTreeMap<String, String>,
}

/// A sealed architecture graph. Topology and hierarchy are immutable; only
/// the occupancy tables mutate, through [`Hag::set_occupied`].
#[derive(Debug, Clone)]
pub struct Hag {
    name: String,
    nodes: Vec<ArchNode>,
    by_name: HashMap<String, usize>,
    topology: DiGraphMap<usize, usize>,
    edges: Vec<Edge>,
}

impl Hag {
    pub(crate) fn from_parts(
        name: String,
        nodes: Vec<ArchNode>,
        by_name: HashMap<String, usize>,
        edges: Vec<Edge>,
    ) -> Self {
        let mut topology = DiGraphMap::new();
        for node in &nodes {
            topology.add_node(node.index);
        }
        for (i, edge) in edges.iter().enumerate() {
            topology.add_edge(edge.src, edge.dst, i);
        }
        Self {
            name,
            nodes,
            by_name,
            topology,
            edges,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }

    pub fn edge_count(&self) -> usize {
        self.edges.len()
    }

    pub fn nodes(&self) -> impl Iterator<Item = &ArchNode> {
        self.nodes.iter()
    }

    /// Look up a node anywhere in the hierarchy by name.
    pub fn get_subgraph_node(&self, name: &str) -> Result<&ArchNode> {
        self.by_name
            .get(name)
            .map(|&i| &self.nodes[i])
            .ok_or_else(|| Error::UnknownNode(name.to_string()))
    }

    /// Look up the directed edge between two named nodes.
    pub fn get_subgraph_edge(&self, src: &str, dst: &str) -> Result<&Edge> {
        let s = self.get_subgraph_node(src)?.index;
        let d = self.get_subgraph_node(dst)?.index;
        self.topology
            .edge_weight(s, d)
            .map(|&i| &self.edges[i])
            .ok_or_else(|| Error::UnknownEdge {
                src: src.to_string(),
                dst: dst.to_string(),
            })
    }

    pub fn capabilities(&self, node: &str) -> Result<&BTreeSet<String>> {
        Ok(self.get_subgraph_node(node)?.capabilities())
    }

    pub fn is_compatible(&self, node: &str, op_name: &str) -> Result<bool> {
        Ok(self.get_subgraph_node(node)?.is_compatible(op_name))
    }

    /// Schedule `op_id` on `node` over `[begin, end)`, rejecting any overlap
    /// with an existing interval.
    pub fn set_occupied(
        &mut self,
        node: &str,
        op_id: usize,
        capability: &str,
        begin: u64,
        end: u64,
    ) -> Result<()> {
        let idx = *self
            .by_name
            .get(node)
            .ok_or_else(|| Error::UnknownNode(node.to_string()))?;
        let n = &mut self.nodes[idx];
        if !n.is_available(begin, end) {
            return Err(Error::Overlap {
                node: node.to_string(),
                op_id,
                begin,
                end,
            });
        }
        n.occupied.push(Occupancy {
            op_id,
            capability: capability.to_string(),
            begin,
            end,
        });
        Ok(())
    }

    pub fn is_available(&self, node: &str, begin: u64, end: u64) -> Result<bool> {
        Ok(self.get_subgraph_node(node)?.is_available(begin, end))
    }
}
