use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::json;

use crate::arch::Hag;
use crate::operand::{Operand, OperandId};
use crate::program::CompileCtx;
use crate::{Error, Result};

use super::{OpKind, Operation, StartOrFinish};

/// Free-form compilation parameter value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ParamValue {
    List(Vec<String>),
    Text(String),
    Int(i64),
}

impl ParamValue {
    pub fn as_list(&self) -> Option<&[String]> {
        match self {
            ParamValue::List(v) => Some(v),
            _ => None,
        }
    }

    pub fn as_text(&self) -> Option<&str> {
        match self {
            ParamValue::Text(v) => Some(v),
            _ => None,
        }
    }
}

/// An instantiated operator: an ordered operation list over an operand
/// arena, plus the per-level domain maps the tiling search fills in.
#[derive(Debug, Clone)]
pub struct Codelet {
    op_name: String,
    instance_id: usize,
    pub ops: Vec<Operation>,
    operands: Vec<Operand>,
    pub inputs: Vec<OperandId>,
    pub outputs: Vec<OperandId>,
    pub compilation_params: BTreeMap<String, ParamValue>,
    /// level -> loop op-string -> iteration extent at that level.
    pub domain_loop_map: BTreeMap<usize, BTreeMap<String, u64>>,
    /// level -> loop op-string -> split factor chosen between level-1 and level.
    pub domain_tiling: BTreeMap<usize, BTreeMap<String, u64>>,
    /// loop op-string -> dimension name.
    pub loop_dims: BTreeMap<String, String>,
    /// Dimension names in loop-creation order; the tiling search iterates
    /// its cartesian products in this order.
    dims: Vec<String>,
    /// node name -> tile level (0 = outermost memory).
    tile_levels: BTreeMap<String, usize>,
    op_id_counters: BTreeMap<String, usize>,
}

impl Codelet {
    pub fn new(op_name: &str, instance_id: usize) -> Self {
        Self {
            op_name: op_name.to_string(),
            instance_id,
            ops: Vec::new(),
            operands: Vec::new(),
            inputs: Vec::new(),
            outputs: Vec::new(),
            compilation_params: BTreeMap::new(),
            domain_loop_map: BTreeMap::new(),
            domain_tiling: BTreeMap::new(),
            loop_dims: BTreeMap::new(),
            dims: Vec::new(),
            tile_levels: BTreeMap::new(),
            op_id_counters: BTreeMap::new(),
        }
    }

    pub fn op_name(&self) -> &str {
        &self.op_name
    }

    pub fn instance_id(&self) -> usize {
        self.instance_id
    }

    /// Unique codelet id, e.g. `gemm0`.
    pub fn uid(&self) -> String {
        format!("{}{}", self.op_name, self.instance_id)
    }

    pub fn dims(&self) -> &[String] {
        &self.dims
    }

    pub fn operands(&self) -> &[Operand] {
        &self.operands
    }

    pub fn operands_mut(&mut self) -> &mut [Operand] {
        &mut self.operands
    }

    pub fn operand(&self, id: OperandId) -> &Operand {
        &self.operands[*id]
    }

    pub fn operand_mut(&mut self, id: OperandId) -> &mut Operand {
        &mut self.operands[*id]
    }

    pub fn add_operand(&mut self, operand: Operand) -> OperandId {
        let id = OperandId::from(self.operands.len());
        self.operands.push(operand);
        id
    }

    pub fn operand_by_name(&self, name: &str) -> Option<OperandId> {
        self.operands
            .iter()
            .position(|o| o.name == name)
            .map(OperandId::from)
    }

    /// Dimension name -> full extent, over every operand.
    pub fn operand_dim_mapping(&self) -> BTreeMap<String, u64> {
        let mut map = BTreeMap::new();
        for o in &self.operands {
            for (dim, extent) in o.dims() {
                map.entry(dim.clone()).or_insert(*extent);
            }
        }
        map
    }

    /// Fresh (per-type, global) id pair.
    pub fn next_op_ids(&mut self, op_type: &str, ctx: &mut CompileCtx) -> (usize, usize) {
        let counter = self.op_id_counters.entry(op_type.to_string()).or_insert(0);
        let op_id = *counter;
        *counter += 1;
        (op_id, ctx.next_global_op_id())
    }

    pub fn op_index(&self, op_str: &str) -> Option<usize> {
        self.ops.iter().position(|o| o.op_str() == op_str)
    }

    pub fn get_op(&self, op_str: &str) -> Option<&Operation> {
        self.ops.iter().find(|o| o.op_str() == op_str)
    }

    pub fn get_op_mut(&mut self, op_str: &str) -> Option<&mut Operation> {
        self.ops.iter_mut().find(|o| o.op_str() == op_str)
    }

    pub fn insert_op(&mut self, op: Operation, idx: usize) {
        let idx = idx.min(self.ops.len());
        self.ops.insert(idx, op);
    }

    /// Move an existing op to a new position, shifting the ops in between.
    pub fn move_op(&mut self, from: usize, to: usize) {
        let op = self.ops.remove(from);
        let to = to.min(self.ops.len());
        self.ops.insert(to, op);
    }

    pub fn add_loop(
        &mut self,
        ctx: &mut CompileCtx,
        dim: &str,
        iter_count: u64,
        loop_level: usize,
        dependencies: Vec<String>,
    ) -> String {
        let (op_id, global_op_id) = self.next_op_ids("loop", ctx);
        let op = Operation {
            op_id,
            global_op_id,
            loop_level,
            dependencies,
            kind: OpKind::Loop {
                iter_count,
                start: 0,
                end: iter_count,
                stride: 1,
            },
        };
        let op_str = op.op_str();
        self.domain_loop_map
            .entry(0)
            .or_default()
            .insert(op_str.clone(), iter_count);
        self.domain_tiling
            .entry(0)
            .or_default()
            .insert(op_str.clone(), 1);
        self.loop_dims.insert(op_str.clone(), dim.to_string());
        if !self.dims.iter().any(|d| d == dim) {
            self.dims.push(dim.to_string());
        }
        self.ops.push(op);
        op_str
    }

    pub fn add_transfer(
        &mut self,
        ctx: &mut CompileCtx,
        operand: OperandId,
        path: Vec<String>,
        loop_level: usize,
        dependencies: Vec<String>,
    ) -> String {
        let rank = self.operand(operand).rank();
        let sizes_per_edge: Vec<u64> = self
            .operand(operand)
            .dims()
            .iter()
            .map(|(_, e)| *e)
            .collect();
        let hops = path.len().saturating_sub(1);
        let (op_id, global_op_id) = self.next_op_ids("transfer", ctx);
        let op = Operation {
            op_id,
            global_op_id,
            loop_level,
            dependencies,
            kind: OpKind::Transfer {
                operand,
                path: path.clone(),
                offsets: vec![vec![0; rank]; hops],
                sizes: vec![sizes_per_edge; hops],
            },
        };
        let op_str = op.op_str();
        self.operand_mut(operand)
            .update_transfer_access(&path, &op_str);
        self.ops.push(op);
        op_str
    }

    pub fn add_compute(
        &mut self,
        ctx: &mut CompileCtx,
        name: &str,
        target: &str,
        sources: Vec<OperandId>,
        dests: Vec<OperandId>,
        loop_level: usize,
        dependencies: Vec<String>,
    ) -> String {
        let (op_id, global_op_id) = self.next_op_ids("compute", ctx);
        let op = Operation {
            op_id,
            global_op_id,
            loop_level,
            dependencies,
            kind: OpKind::Compute {
                name: name.to_string(),
                target: target.to_string(),
                sources,
                dests,
            },
        };
        let op_str = op.op_str();
        self.ops.push(op);
        op_str
    }

    pub fn add_config(
        &mut self,
        ctx: &mut CompileCtx,
        start_or_finish: StartOrFinish,
        target: &str,
        dependencies: Vec<String>,
    ) -> String {
        let (op_id, global_op_id) = self.next_op_ids("config", ctx);
        let op = Operation {
            op_id,
            global_op_id,
            loop_level: 0,
            dependencies,
            kind: OpKind::Configure {
                start_or_finish,
                target: target.to_string(),
            },
        };
        let op_str = op.op_str();
        self.ops.push(op);
        op_str
    }

    /// Maximal contiguous op runs sharing an outer loop: the unit over which
    /// the split pass introduces additional nesting levels.
    pub fn extract_bands(&self) -> Vec<(usize, usize)> {
        let outer = self
            .ops
            .iter()
            .filter(|o| o.is_loop())
            .map(|o| o.loop_level)
            .min();
        let Some(outer) = outer else {
            return Vec::new();
        };
        let mut bands = Vec::new();
        let mut start: Option<usize> = None;
        let mut end = 0usize;
        for (i, op) in self.ops.iter().enumerate() {
            if op.is_loop() && op.loop_level == outer {
                if let Some(s) = start.take() {
                    bands.push((s, end));
                }
                start = Some(i);
                end = i;
            } else if start.is_some() {
                if op.is_loop() || op.loop_level > outer {
                    end = i;
                } else if let Some(s) = start.take() {
                    bands.push((s, end));
                }
            }
        }
        if let Some(s) = start {
            bands.push((s, end));
        }
        bands
    }

    /// Assign a tile level to every node appearing on an operand data path:
    /// nodes are ranked by their depth in the architecture hierarchy, level 0
    /// being the outermost memory.
    pub fn set_tile_levels(&mut self, hag: &Hag) -> Result<()> {
        let mut depths: Vec<(String, usize)> = Vec::new();
        for o in &self.operands {
            for node in &o.data_path {
                if depths.iter().any(|(n, _)| n == node) {
                    continue;
                }
                let depth = hag.get_subgraph_node(node)?.depth();
                depths.push((node.clone(), depth));
            }
        }
        let mut unique: Vec<usize> = depths.iter().map(|(_, d)| *d).collect();
        unique.sort_unstable();
        unique.dedup();
        self.tile_levels = depths
            .into_iter()
            .map(|(n, d)| {
                let level = unique.iter().position(|&u| u == d).unwrap_or(0);
                (n, level)
            })
            .collect();
        Ok(())
    }

    pub fn get_tile_level(&self, node: &str) -> Result<usize> {
        self.tile_levels
            .get(node)
            .copied()
            .ok_or_else(|| Error::UnknownNode(node.to_string()))
    }

    pub fn tile_levels(&self) -> &BTreeMap<String, usize> {
        &self.tile_levels
    }

    /// Number of tile levels, including level 0.
    pub fn num_tile_levels(&self) -> usize {
        self.tile_levels.values().max().map_or(0, |m| m + 1)
    }

    pub fn emit_text(&self) -> String {
        self.ops
            .iter()
            .map(|o| o.emit_text(self))
            .collect::<Vec<_>>()
            .join("\n")
    }

    pub fn to_json(&self) -> Result<serde_json::Value> {
        Ok(json!({
            "codelet": self.op_name,
            "instance_id": self.instance_id,
            "operands": serde_json::to_value(&self.operands)?,
            "inputs": self.inputs.iter().map(|i| **i).collect::<Vec<usize>>(),
            "outputs": self.outputs.iter().map(|o| **o).collect::<Vec<usize>>(),
            "dims": self.dims,
            "loop_dims": self.loop_dims,
            "tile_levels": self.tile_levels,
            "domain_loop_map": serde_json::to_value(&self.domain_loop_map)?,
            "domain_tiling": serde_json::to_value(&self.domain_tiling)?,
            "compilation_params": serde_json::to_value(&self.compilation_params)?,
            "operations": self.ops.iter().map(|o| o.to_json(self)).collect::<Vec<_>>(),
        }))
    }

    /// Reconstruct a codelet from its artifact JSON.
    pub fn from_json(value: &serde_json::Value) -> Result<Self> {
        let field = |key: &str| {
            value
                .get(key)
                .ok_or_else(|| Error::Artifact(format!("missing field `{key}`")))
        };
        let op_name = field("codelet")?
            .as_str()
            .ok_or_else(|| Error::Artifact("`codelet` is not a string".into()))?
            .to_string();
        let instance_id = field("instance_id")?
            .as_u64()
            .ok_or_else(|| Error::Artifact("`instance_id` is not an integer".into()))?
            as usize;
        let operands: Vec<Operand> = serde_json::from_value(field("operands")?.clone())?;
        let inputs: Vec<usize> = serde_json::from_value(field("inputs")?.clone())?;
        let outputs: Vec<usize> = serde_json::from_value(field("outputs")?.clone())?;
        let mut cdlt = Codelet::new(&op_name, instance_id);
        cdlt.operands = operands;
        cdlt.inputs = inputs.into_iter().map(OperandId::from).collect();
        cdlt.outputs = outputs.into_iter().map(OperandId::from).collect();
        cdlt.dims = serde_json::from_value(field("dims")?.clone())?;
        cdlt.loop_dims = serde_json::from_value(field("loop_dims")?.clone())?;
        cdlt.tile_levels = serde_json::from_value(field("tile_levels")?.clone())?;
        cdlt.domain_loop_map = serde_json::from_value(field("domain_loop_map")?.clone())?;
        cdlt.domain_tiling = serde_json::from_value(field("domain_tiling")?.clone())?;
        cdlt.compilation_params = serde_json::from_value(field("compilation_params")?.clone())?;
        let ops = field("operations")?
            .as_array()
            .ok_or_else(|| Error::Artifact("`operations` is not an array".into()))?;
        for op in ops {
            cdlt.push_op_from_json(op)?;
        }
        Ok(cdlt)
    }

    fn push_op_from_json(&mut self, value: &serde_json::Value) -> Result<()> {
        let field = |key: &str| {
            value
                .get(key)
                .ok_or_else(|| Error::Artifact(format!("op missing field `{key}`")))
        };
        let op_type = field("op_type")?
            .as_str()
            .ok_or_else(|| Error::Artifact("`op_type` is not a string".into()))?;
        let op_str = field("op_str")?
            .as_str()
            .ok_or_else(|| Error::Artifact("`op_str` is not a string".into()))?;
        let op_id: usize = op_str
            .strip_prefix(op_type)
            .and_then(|s| s.parse().ok())
            .ok_or_else(|| Error::Artifact(format!("malformed op_str `{op_str}`")))?;
        let global_op_id = field("op_id")?
            .as_u64()
            .ok_or_else(|| Error::Artifact("`op_id` is not an integer".into()))?
            as usize;
        let loop_level = field("loop_level")?
            .as_u64()
            .ok_or_else(|| Error::Artifact("`loop_level` is not an integer".into()))?
            as usize;
        let dependencies: Vec<String> = serde_json::from_value(field("dependencies")?.clone())?;
        let operand_id = |v: &serde_json::Value| -> Result<OperandId> {
            let name = v
                .as_str()
                .ok_or_else(|| Error::Artifact("operand reference is not a string".into()))?;
            self.operand_by_name(name)
                .ok_or_else(|| Error::Artifact(format!("unknown operand `{name}`")))
        };
        let kind = match op_type {
            "loop" => OpKind::Loop {
                iter_count: serde_json::from_value(field("iter_count")?.clone())?,
                start: serde_json::from_value(field("start")?.clone())?,
                end: serde_json::from_value(field("end")?.clone())?,
                stride: serde_json::from_value(field("stride")?.clone())?,
            },
            "transfer" => OpKind::Transfer {
                operand: operand_id(field("operand")?)?,
                path: serde_json::from_value(field("path")?.clone())?,
                offsets: serde_json::from_value(field("offsets")?.clone())?,
                sizes: serde_json::from_value(field("sizes")?.clone())?,
            },
            "compute" => {
                let sources = field("sources")?
                    .as_array()
                    .ok_or_else(|| Error::Artifact("`sources` is not an array".into()))?
                    .iter()
                    .map(operand_id)
                    .collect::<Result<Vec<_>>>()?;
                let dests = field("destinations")?
                    .as_array()
                    .ok_or_else(|| Error::Artifact("`destinations` is not an array".into()))?
                    .iter()
                    .map(operand_id)
                    .collect::<Result<Vec<_>>>()?;
                OpKind::Compute {
                    name: field("operation_name")?
                        .as_str()
                        .ok_or_else(|| Error::Artifact("`operation_name` is not a string".into()))?
                        .to_string(),
                    target: field("target")?
                        .as_str()
                        .ok_or_else(|| Error::Artifact("`target` is not a string".into()))?
                        .to_string(),
                    sources,
                    dests,
                }
            }
            "config" => {
                let sof = match field("start_or_finish")?.as_str() {
                    Some("start") => StartOrFinish::Start,
                    Some("finish") => StartOrFinish::Finish,
                    other => {
                        return Err(Error::Artifact(format!(
                            "bad start_or_finish: {other:?}"
                        )))
                    }
                };
                OpKind::Configure {
                    start_or_finish: sof,
                    target: field("target")?
                        .as_str()
                        .ok_or_else(|| Error::Artifact("`target` is not a string".into()))?
                        .to_string(),
                }
            }
            other => return Err(Error::Artifact(format!("unknown op_type `{other}`"))),
        };
        // Keep the per-type counters ahead of reconstructed ids.
        let counter = self.op_id_counters.entry(op_type.to_string()).or_insert(0);
        *counter = (*counter).max(op_id + 1);
        self.ops.push(Operation {
            op_id,
            global_op_id,
            loop_level,
            dependencies,
            kind,
        });
        Ok(())
    }
}
