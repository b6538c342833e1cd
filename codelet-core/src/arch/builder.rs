use std::collections::{BTreeMap, HashMap};

use crate::{Error, Result};

use super::{ArchNode, Edge, Hag, NodeKind};

/// Scoped construction of a [`Hag`].
///
/// Nodes are added into the currently open composite scope; `composite` runs
/// a closure over a child scope and seals the composite when the closure
/// returns. A sealed composite rejects further nodes and edges. `build` seals
/// the root and produces the immutable graph; building a different topology
/// requires a fresh builder.
#[derive(Debug)]
pub struct HagBuilder {
    nodes: Vec<ArchNode>,
    by_name: HashMap<String, usize>,
    edges: Vec<Edge>,
    /// Stack of open composite indices; index 0 is the root.
    scope: Vec<usize>,
}

impl HagBuilder {
    pub fn new(name: &str) -> Self {
        let mut root = ArchNode::new(0, name.to_string(), NodeKind::Composite, 0);
        root.set_capacity(0);
        let mut by_name = HashMap::new();
        by_name.insert(name.to_string(), 0);
        Self {
            nodes: vec![root],
            by_name,
            edges: Vec::new(),
            scope: vec![0],
        }
    }

    fn add_node(&mut self, name: &str, kind: NodeKind) -> Result<usize> {
        if self.by_name.contains_key(name) {
            return Err(Error::DuplicateNode {
                name: name.to_string(),
            });
        }
        let parent = *self.scope.last().expect("scope stack is never empty");
        let index = self.nodes.len();
        let mut node = ArchNode::new(index, name.to_string(), kind, self.scope.len());
        node.set_parent(parent);
        self.nodes.push(node);
        self.by_name.insert(name.to_string(), index);
        Ok(index)
    }

    /// Add a storage node with `capacity` in bytes to the open scope.
    pub fn storage(&mut self, name: &str, capacity: u64) -> Result<&mut Self> {
        let idx = self.add_node(name, NodeKind::Storage)?;
        self.nodes[idx].set_capacity(capacity);
        Ok(self)
    }

    /// Add a compute node with the given array dimensionality.
    pub fn compute(&mut self, name: &str, dimensions: &[u64]) -> Result<&mut Self> {
        let idx = self.add_node(name, NodeKind::Compute)?;
        self.nodes[idx].set_dimensions(dimensions);
        Ok(self)
    }

    pub fn communication(&mut self, name: &str) -> Result<&mut Self> {
        self.add_node(name, NodeKind::Communication)?;
        Ok(self)
    }

    /// Open a composite child scope, populate it through the closure, then
    /// seal it. Once sealed, nodes and edges can no longer be added inside.
    pub fn composite<F>(&mut self, name: &str, f: F) -> Result<&mut Self>
    where
        F: FnOnce(&mut Self) -> Result<()>,
    {
        let idx = self.add_node(name, NodeKind::Composite)?;
        self.scope.push(idx);
        let result = f(self);
        self.scope.pop();
        result?;
        Ok(self)
    }

    /// Deepest common ancestor of two nodes; the composite an edge belongs to.
    fn common_ancestor(&self, a: usize, b: usize) -> usize {
        let mut ancestors = Vec::new();
        let mut cur = Some(a);
        while let Some(i) = cur {
            ancestors.push(i);
            cur = self.nodes[i].parent();
        }
        let mut cur = Some(b);
        while let Some(i) = cur {
            if ancestors.contains(&i) {
                return i;
            }
            cur = self.nodes[i].parent();
        }
        0
    }

    /// Add a directed edge. The edge belongs to the deepest composite that
    /// contains both endpoints; if that composite is already sealed the edge
    /// is rejected.
    pub fn edge(&mut self, src: &str, dst: &str, bandwidth: u64) -> Result<&mut Self> {
        self.edge_with_attrs(src, dst, bandwidth, &[])
    }

    pub fn edge_with_attrs(
        &mut self,
        src: &str,
        dst: &str,
        bandwidth: u64,
        attrs: &[(&str, &str)],
    ) -> Result<&mut Self> {
        let s = *self
            .by_name
            .get(src)
            .ok_or_else(|| Error::UnknownNode(src.to_string()))?;
        let d = *self
            .by_name
            .get(dst)
            .ok_or_else(|| Error::UnknownNode(dst.to_string()))?;
        let owner = self.common_ancestor(s, d);
        if !self.scope.contains(&owner) {
            return Err(Error::SealedGraph {
                node: self.nodes[owner].name().to_string(),
            });
        }
        let attributes: BTreeMap<String, String> = attrs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        self.edges.push(Edge {
            src: s,
            dst: d,
            bandwidth,
            attributes,
        });
        Ok(self)
    }

    /// Register a codelet template name that `node` can execute.
    /// Capabilities are metadata, not subgraph structure, so they may be
    /// added until `build`.
    pub fn capability(&mut self, node: &str, template: &str) -> Result<&mut Self> {
        let idx = *self
            .by_name
            .get(node)
            .ok_or_else(|| Error::UnknownNode(node.to_string()))?;
        self.nodes[idx].add_capability(template.to_string());
        Ok(self)
    }

    /// Seal the root and produce the immutable graph.
    pub fn build(self) -> Hag {
        let name = self.nodes[0].name().to_string();
        Hag::from_parts(name, self.nodes, self.by_name, self.edges)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sealed_composite_rejects_inner_edges() {
        let mut b = HagBuilder::new("hag");
        b.composite("block", |b| {
            b.storage("IBUF", 64)?;
            b.compute("pe", &[4, 4])?;
            Ok(())
        })
        .unwrap();
        let err = b.edge("IBUF", "pe", 32).unwrap_err();
        assert!(matches!(err, Error::SealedGraph { node } if node == "block"));
    }

    #[test]
    fn cross_scope_edges_belong_to_the_open_ancestor() {
        let mut b = HagBuilder::new("hag");
        b.storage("DRAM", 1024).unwrap();
        b.composite("block", |b| {
            b.storage("IBUF", 64)?;
            Ok(())
        })
        .unwrap();
        // DRAM <-> IBUF edges live at root scope, which is open until build.
        b.edge("DRAM", "IBUF", 32).unwrap();
        b.edge("IBUF", "DRAM", 32).unwrap();
        let hag = b.build();
        assert_eq!(hag.edge_count(), 2);
    }

    #[test]
    fn duplicate_names_rejected() {
        let mut b = HagBuilder::new("hag");
        b.storage("DRAM", 1024).unwrap();
        assert!(matches!(
            b.storage("DRAM", 2048),
            Err(Error::DuplicateNode { .. })
        ));
    }
}
