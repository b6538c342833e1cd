//! Tensor operands and their movements through the memory hierarchy.
//!
//! `Codelet` owns its operands in an arena; everything else refers to them
//! through [`OperandId`], which keeps the operand ↔ movement references
//! acyclic.

use std::collections::BTreeMap;
use std::ops::Deref;

use serde::{Deserialize, Serialize};

use crate::Datatype;

/// Stable index of an operand within its codelet's arena.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct OperandId(usize);

impl Deref for OperandId {
    type Target = usize;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl From<usize> for OperandId {
    fn from(value: usize) -> Self {
        Self(value)
    }
}

/// How one operand dimension is addressed by a data movement: the loop that
/// drives it (if any) and the stride frozen once tiling commits.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DimOffset {
    pub loop_name: Option<String>,
    pub stride: u64,
}

/// One hop of an operand through the hierarchy.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DataMovement {
    pub src_node: String,
    pub dst_node: String,
    pub operand: OperandId,
    /// Transfer op owning this hop, filled in as the split pass cuts paths.
    pub op_str: Option<String>,
    /// Dimension -> driving loop and frozen stride. Only dimensions present
    /// here participate in the tile arriving at `dst_node`.
    pub offset_map: BTreeMap<String, DimOffset>,
    /// Dimension -> tile extent at `dst_node`, frozen after the search.
    pub shape_map: BTreeMap<String, u64>,
}

impl DataMovement {
    pub fn new(src_node: &str, dst_node: &str, operand: OperandId) -> Self {
        Self {
            src_node: src_node.to_string(),
            dst_node: dst_node.to_string(),
            operand,
            op_str: None,
            offset_map: BTreeMap::new(),
            shape_map: BTreeMap::new(),
        }
    }

    /// Declare `dim` as driven by `loop_name`.
    pub fn drive(mut self, dim: &str, loop_name: &str) -> Self {
        self.offset_map.insert(
            dim.to_string(),
            DimOffset {
                loop_name: Some(loop_name.to_string()),
                stride: 0,
            },
        );
        self
    }

    /// Track `dim` without a driving loop; its tile keeps the static extent.
    pub fn track(mut self, dim: &str) -> Self {
        self.offset_map.insert(
            dim.to_string(),
            DimOffset {
                loop_name: None,
                stride: 0,
            },
        );
        self
    }

    /// Tile sizes at `dst_node` under the given accumulated per-loop split
    /// factors. Dimensions not driven by a loop in `perm_map` retain their
    /// static extent.
    pub fn get_size_from_splits(
        &self,
        operand: &Operand,
        perm_map: &BTreeMap<String, u64>,
    ) -> BTreeMap<String, u64> {
        let mut sizes = BTreeMap::new();
        for (dim, offset) in &self.offset_map {
            let full = operand.extent(dim).unwrap_or(0);
            let size = match &offset.loop_name {
                Some(l) => match perm_map.get(l) {
                    Some(split) if *split > 0 => full / split,
                    _ => full,
                },
                None => full,
            };
            sizes.insert(dim.clone(), size);
        }
        sizes
    }

    /// Freeze the tile shape at `dst_node` once the search commits:
    /// `accum_splits` maps each driving loop to the product of its selected
    /// splits down to the destination's level. Undriven dimensions keep
    /// their static extent in `full_extents`.
    pub fn set_size_from_splits(
        &mut self,
        full_extents: &BTreeMap<String, u64>,
        accum_splits: &BTreeMap<String, u64>,
    ) {
        let dims: Vec<String> = self.offset_map.keys().cloned().collect();
        for dim in dims {
            let full = full_extents.get(&dim).copied().unwrap_or(0);
            let size = match &self.offset_map[&dim].loop_name {
                Some(l) => match accum_splits.get(l) {
                    Some(split) if *split > 0 => full / split,
                    _ => full,
                },
                None => full,
            };
            self.shape_map.insert(dim, size);
        }
    }

    /// Freeze per-dimension strides: a driven dimension steps by its tile
    /// extent at the destination level.
    pub fn set_offset_map(&mut self) {
        for (dim, offset) in self.offset_map.iter_mut() {
            if offset.loop_name.is_some() {
                offset.stride = self.shape_map.get(dim).copied().unwrap_or(0);
            }
        }
    }
}

/// A tensor operand of a codelet.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Operand {
    pub name: String,
    pub dtype: Datatype,
    /// Ordered (symbol, extent) pairs. A zero extent is a placeholder filled
    /// during shape padding.
    dims: Vec<(String, u64)>,
    /// Storage/compute node names this operand traverses, outermost first.
    pub data_path: Vec<String>,
    pub data_moves: Vec<DataMovement>,
    /// Node name -> per-dimension tile sizes at that node.
    pub tiling: BTreeMap<String, Vec<(String, u64)>>,
    /// Loop op-strings this operand's accesses depend on.
    pub dependencies: Vec<String>,
}

impl Operand {
    pub fn new(name: &str, dtype: Datatype, dims: Vec<(String, u64)>, data_path: Vec<String>) -> Self {
        Self {
            name: name.to_string(),
            dtype,
            dims,
            data_path,
            data_moves: Vec::new(),
            tiling: BTreeMap::new(),
            dependencies: Vec::new(),
        }
    }

    pub fn dims(&self) -> &[(String, u64)] {
        &self.dims
    }

    pub fn dim_names(&self) -> Vec<String> {
        self.dims.iter().map(|(n, _)| n.clone()).collect()
    }

    pub fn rank(&self) -> usize {
        self.dims.len()
    }

    pub fn extent(&self, dim: &str) -> Option<u64> {
        self.dims.iter().find(|(n, _)| n == dim).map(|(_, e)| *e)
    }

    pub fn set_extent(&mut self, dim: &str, extent: u64) {
        if let Some(entry) = self.dims.iter_mut().find(|(n, _)| n.as_str() == dim) {
            entry.1 = extent;
        }
    }

    pub fn set_extent_at(&mut self, idx: usize, extent: u64) {
        if let Some(entry) = self.dims.get_mut(idx) {
            entry.1 = extent;
        }
    }

    /// Reorder dimensions by the given permutation of current positions.
    pub fn reorder_dims(&mut self, perm: &[usize]) {
        debug_assert_eq!(perm.len(), self.dims.len());
        self.dims = perm.iter().map(|&i| self.dims[i].clone()).collect();
    }

    pub fn total_elements(&self) -> u64 {
        self.dims.iter().map(|(_, e)| *e).product()
    }

    /// Bits occupied by the full operand.
    pub fn size_bits(&self) -> u64 {
        self.total_elements() * self.dtype.bits()
    }

    pub fn unique_data_locations(&self) -> Vec<String> {
        let mut seen = Vec::new();
        for n in &self.data_path {
            if !seen.contains(n) {
                seen.push(n.clone());
            }
        }
        seen
    }

    /// True iff every node on the data path has a tiling entry.
    pub fn is_tiled(&self) -> bool {
        self.unique_data_locations()
            .iter()
            .all(|n| self.tiling.contains_key(n))
    }

    pub fn set_tile(&mut self, node: &str, sizes: Vec<(String, u64)>) {
        self.tiling.insert(node.to_string(), sizes);
    }

    /// Record the tile consumed or produced at a compute target, from the
    /// shape frozen on the movement touching it.
    pub fn compute_tile(&mut self, target: &str) {
        let shape: Option<Vec<(String, u64)>> = self
            .data_moves
            .iter()
            .find(|m| m.dst_node == target || m.src_node == target)
            .map(|m| m.shape_map.iter().map(|(k, v)| (k.clone(), *v)).collect());
        if let Some(shape) = shape {
            self.tiling.insert(target.to_string(), shape);
        }
    }

    /// Re-key movement ownership after a transfer path cut: every hop covered
    /// by `path` now belongs to the transfer op `op_str`.
    pub fn update_transfer_access(&mut self, path: &[String], op_str: &str) {
        for hop in path.windows(2) {
            for m in self.data_moves.iter_mut() {
                if m.src_node == hop[0] && m.dst_node == hop[1] {
                    m.op_str = Some(op_str.to_string());
                }
            }
        }
    }

    /// Commit the tiling search results into this operand's movements:
    /// movements with an empty offset map inherit the previous hop's, tile
    /// shapes and strides freeze at each destination's level, and a tiling
    /// entry is recorded per destination node. `level_accums[l]` maps each
    /// loop to the product of its selected splits down to level `l`.
    pub fn finalize_moves(
        &mut self,
        node_levels: &BTreeMap<String, usize>,
        level_accums: &[BTreeMap<String, u64>],
    ) {
        let full_extents: BTreeMap<String, u64> =
            self.dims.iter().map(|(n, e)| (n.clone(), *e)).collect();
        let dim_order: Vec<String> = self.dims.iter().map(|(n, _)| n.clone()).collect();
        for idx in 0..self.data_moves.len() {
            if self.data_moves[idx].offset_map.is_empty() && idx > 0 {
                let prev = self.data_moves[idx - 1].offset_map.clone();
                self.data_moves[idx].offset_map = prev;
            }
            let level = node_levels
                .get(&self.data_moves[idx].dst_node)
                .copied()
                .unwrap_or(0);
            let accum_at = level_accums
                .get(level)
                .or_else(|| level_accums.last())
                .cloned()
                .unwrap_or_default();
            let mv = &mut self.data_moves[idx];
            if mv.shape_map.is_empty() {
                mv.set_size_from_splits(&full_extents, &accum_at);
            }
            mv.set_offset_map();
            let tile: Vec<(String, u64)> = dim_order
                .iter()
                .filter_map(|d| mv.shape_map.get(d).map(|s| (d.clone(), *s)))
                .collect();
            if !tile.is_empty() {
                self.tiling.insert(mv.dst_node.clone(), tile);
            }
        }
    }

    pub fn movement_to(&self, dst: &str) -> Option<&DataMovement> {
        self.data_moves.iter().find(|m| m.dst_node == dst)
    }

    pub fn movement_from(&self, src: &str) -> Option<&DataMovement> {
        self.data_moves.iter().find(|m| m.src_node == src)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn operand() -> Operand {
        Operand::new(
            "A",
            Datatype::fxp(8),
            vec![("M".to_string(), 64), ("K".to_string(), 64)],
            vec!["DRAM".to_string(), "IBUF".to_string(), "pe_array".to_string()],
        )
    }

    #[test]
    fn sizes_follow_splits() {
        let o = operand();
        let mv = DataMovement::new("DRAM", "IBUF", OperandId::from(0))
            .drive("M", "loop0")
            .drive("K", "loop1");
        let perm: BTreeMap<String, u64> =
            [("loop0".to_string(), 4), ("loop1".to_string(), 8)].into();
        let sizes = mv.get_size_from_splits(&o, &perm);
        assert_eq!(sizes["M"], 16);
        assert_eq!(sizes["K"], 8);
    }

    #[test]
    fn undriven_dims_keep_static_extent() {
        let o = operand();
        let mv = DataMovement::new("DRAM", "IBUF", OperandId::from(0))
            .drive("M", "loop0")
            .track("K");
        let perm: BTreeMap<String, u64> = [("loop0".to_string(), 2)].into();
        let sizes = mv.get_size_from_splits(&o, &perm);
        assert_eq!(sizes["M"], 32);
        assert_eq!(sizes["K"], 64);
    }

    #[test]
    fn tiled_needs_every_path_node() {
        let mut o = operand();
        assert!(!o.is_tiled());
        o.set_tile("DRAM", vec![("M".to_string(), 64), ("K".to_string(), 64)]);
        o.set_tile("IBUF", vec![("M".to_string(), 16), ("K".to_string(), 16)]);
        assert!(!o.is_tiled());
        o.set_tile("pe_array", vec![("M".to_string(), 1), ("K".to_string(), 1)]);
        assert!(o.is_tiled());
    }
}
