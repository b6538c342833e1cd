//! Codelet templates and their instantiation against operator-graph nodes.
//!
//! A template names its operands symbolically (shape symbols, data paths,
//! loop drivers); instantiation binds the symbols to a node's concrete
//! tensors and lays down the skeleton op list: configure start, the loop
//! nest, transfers in, the compute op, transfers out, configure finish.

use std::collections::BTreeMap;

use crate::ir::{Codelet, StartOrFinish};
use crate::opgraph::OpNode;
use crate::operand::{DataMovement, Operand, OperandId};
use crate::program::CompileCtx;
use crate::{Datatype, Error, Result};

#[derive(Debug, Clone)]
pub struct OperandTemplate {
    pub shape_symbols: Vec<String>,
    pub data_path: Vec<String>,
    pub dtype: Datatype,
    /// dim symbol -> loop dimension driving it. Defaults to the symbol
    /// itself; `None` leaves the dimension untiled.
    pub dim_loops: Vec<(String, Option<String>)>,
    /// Dimensions tracked by the movement arriving at the compute target;
    /// the subset physically mapped onto the array.
    pub array_dims: Vec<String>,
}

impl OperandTemplate {
    pub fn new(symbols: &[&str], path: &[&str], dtype: Datatype) -> Self {
        Self {
            shape_symbols: symbols.iter().map(|s| s.to_string()).collect(),
            data_path: path.iter().map(|s| s.to_string()).collect(),
            dtype,
            dim_loops: symbols
                .iter()
                .map(|s| (s.to_string(), Some(s.to_string())))
                .collect(),
            array_dims: symbols.iter().map(|s| s.to_string()).collect(),
        }
    }

    /// Override the driving loop for some dimensions, e.g. conv input rows
    /// stepped by the output-row loop.
    pub fn driven_by(mut self, pairs: &[(&str, &str)]) -> Self {
        for (dim, loop_dim) in pairs {
            if let Some(entry) = self.dim_loops.iter_mut().find(|(d, _)| d.as_str() == *dim) {
                entry.1 = Some(loop_dim.to_string());
            }
        }
        self
    }

    pub fn with_array_dims(mut self, dims: &[&str]) -> Self {
        self.array_dims = dims.iter().map(|s| s.to_string()).collect();
        self
    }
}

#[derive(Debug, Clone)]
pub struct CodeletTemplate {
    pub op_name: String,
    /// Compute node executing this codelet.
    pub target: String,
    pub inputs: Vec<OperandTemplate>,
    pub outputs: Vec<OperandTemplate>,
    /// Loop dimensions, outermost first.
    pub loop_order: Vec<String>,
}

impl CodeletTemplate {
    pub fn new(
        op_name: &str,
        target: &str,
        inputs: Vec<OperandTemplate>,
        outputs: Vec<OperandTemplate>,
        loop_order: &[&str],
    ) -> Self {
        Self {
            op_name: op_name.to_string(),
            target: target.to_string(),
            inputs,
            outputs,
            loop_order: loop_order.iter().map(|s| s.to_string()).collect(),
        }
    }

    /// Instantiate this template against a graph node's tensors.
    pub fn instantiate(&self, ctx: &mut CompileCtx, node: &OpNode) -> Result<Codelet> {
        if node.inputs.len() != self.inputs.len() || node.outputs.len() != self.outputs.len() {
            return Err(Error::ShapeMismatch {
                op: node.op_name.clone(),
                details: format!(
                    "template `{}` expects {} inputs / {} outputs, node has {} / {}",
                    self.op_name,
                    self.inputs.len(),
                    self.outputs.len(),
                    node.inputs.len(),
                    node.outputs.len()
                ),
            });
        }
        let instance_id = ctx.next_instance(&self.op_name);
        let mut cdlt = Codelet::new(&self.op_name, instance_id);

        // Bind operands positionally; absent dims stay 0 until pad_operands.
        let mut bind = |tmpl: &OperandTemplate,
                        tensor: &crate::opgraph::TensorSpec,
                        cdlt: &mut Codelet|
         -> Result<OperandId> {
            if tensor.rank() != tmpl.shape_symbols.len() {
                return Err(Error::ShapeMismatch {
                    op: node.op_name.clone(),
                    details: format!(
                        "tensor `{}` has rank {}, template expects {:?}",
                        tensor.name,
                        tensor.rank(),
                        tmpl.shape_symbols
                    ),
                });
            }
            let dims: Vec<(String, u64)> = tmpl
                .shape_symbols
                .iter()
                .zip(&tensor.shape)
                .map(|(s, e)| (s.clone(), e.unwrap_or(0)))
                .collect();
            let dtype = tensor.dtype.unwrap_or(tmpl.dtype);
            Ok(cdlt.add_operand(Operand::new(
                &tensor.name,
                dtype,
                dims,
                tmpl.data_path.clone(),
            )))
        };
        let mut input_ids = Vec::new();
        for (tmpl, tensor) in self.inputs.iter().zip(&node.inputs) {
            input_ids.push(bind(tmpl, tensor, &mut cdlt)?);
        }
        let mut output_ids = Vec::new();
        for (tmpl, tensor) in self.outputs.iter().zip(&node.outputs) {
            output_ids.push(bind(tmpl, tensor, &mut cdlt)?);
        }
        cdlt.inputs = input_ids.clone();
        cdlt.outputs = output_ids.clone();

        let config_start = cdlt.add_config(ctx, StartOrFinish::Start, &self.target, Vec::new());

        // One loop per dimension; the extent comes from the first operand
        // binding that dimension symbol.
        let extents = cdlt.operand_dim_mapping();
        let mut loop_strs: BTreeMap<String, String> = BTreeMap::new();
        for (level, dim) in self.loop_order.iter().enumerate() {
            let iter = extents.get(dim).copied().unwrap_or(0);
            let deps = if level == 0 {
                vec![config_start.clone()]
            } else {
                Vec::new()
            };
            let op_str = cdlt.add_loop(ctx, dim, iter, level, deps);
            loop_strs.insert(dim.clone(), op_str);
        }
        let body_level = self.loop_order.len();

        // Data movements per path hop, then one transfer op per input.
        let mut transfer_in = Vec::new();
        for (tmpl, &id) in self.inputs.iter().zip(&input_ids) {
            let deps = self.attach_moves(&mut cdlt, tmpl, id, &loop_strs, false);
            let path = tmpl.data_path.clone();
            let op_str = cdlt.add_transfer(ctx, id, path, body_level, deps);
            transfer_in.push(op_str);
        }
        for (tmpl, &id) in self.outputs.iter().zip(&output_ids) {
            self.attach_moves(&mut cdlt, tmpl, id, &loop_strs, true);
        }

        let mut compute_deps: Vec<String> = self
            .loop_order
            .iter()
            .filter_map(|d| loop_strs.get(d).cloned())
            .collect();
        compute_deps.extend(transfer_in.iter().cloned());
        let compute_str = cdlt.add_compute(
            ctx,
            &self.op_name,
            &self.target,
            input_ids.clone(),
            output_ids.clone(),
            body_level,
            compute_deps,
        );

        let mut transfer_out = Vec::new();
        for &id in &output_ids {
            let path = cdlt.operand(id).data_path.clone();
            let op_str =
                cdlt.add_transfer(ctx, id, path, body_level, vec![compute_str.clone()]);
            transfer_out.push(op_str);
        }
        cdlt.add_config(ctx, StartOrFinish::Finish, &self.target, transfer_out);

        Ok(cdlt)
    }

    /// Create the per-hop data movements for one operand and return the loop
    /// op-strings it depends on.
    fn attach_moves(
        &self,
        cdlt: &mut Codelet,
        tmpl: &OperandTemplate,
        id: OperandId,
        loop_strs: &BTreeMap<String, String>,
        is_output: bool,
    ) -> Vec<String> {
        let mut deps: Vec<String> = Vec::new();
        let path = tmpl.data_path.clone();
        let mut moves = Vec::new();
        for hop in path.windows(2) {
            let compute_facing = !is_output && hop[1] == self.target;
            let mut mv = DataMovement::new(&hop[0], &hop[1], id);
            for (dim, loop_dim) in &tmpl.dim_loops {
                if compute_facing && !tmpl.array_dims.contains(dim) {
                    continue;
                }
                match loop_dim.as_ref().and_then(|ld| loop_strs.get(ld)) {
                    Some(loop_str) => {
                        mv = mv.drive(dim, loop_str);
                        if !deps.contains(loop_str) {
                            deps.push(loop_str.clone());
                        }
                    }
                    None => {
                        mv = mv.track(dim);
                    }
                }
            }
            moves.push(mv);
        }
        let operand = cdlt.operand_mut(id);
        operand.data_moves.extend(moves);
        for d in &deps {
            if !operand.dependencies.contains(d) {
                operand.dependencies.push(d.clone());
            }
        }
        deps
    }
}

/// Built-in templates, grouped the way the target's codelet library groups
/// them: systolic-array kernels, unary SIMD, binary SIMD and the cast helper.
pub fn default_templates() -> BTreeMap<String, CodeletTemplate> {
    let mut templates = BTreeMap::new();
    for t in systolic_templates()
        .into_iter()
        .chain(unary_simd_templates())
        .chain(binary_simd_templates())
    {
        templates.insert(t.op_name.clone(), t);
    }
    templates
}

fn systolic_templates() -> Vec<CodeletTemplate> {
    let inp = Datatype::fxp(8);
    let acc = Datatype::fxp(32);
    let gemm_act = || OperandTemplate::new(&["M", "K"], &["DRAM", "IBUF", "pe_array"], inp);
    let gemm_wgt = || OperandTemplate::new(&["K", "N"], &["DRAM", "WBUF", "pe_array"], inp);
    let gemm_out = || OperandTemplate::new(&["M", "N"], &["pe_array", "OBUF", "DRAM"], acc);
    let gemm_bias = || OperandTemplate::new(&["N"], &["DRAM", "BBUF", "pe_array"], acc);

    let conv_act = || {
        OperandTemplate::new(&["N", "IC", "IH", "IW"], &["DRAM", "IBUF", "pe_array"], inp)
            .driven_by(&[("IH", "OH"), ("IW", "OW")])
            .with_array_dims(&["IC"])
    };
    let conv_wgt = || {
        OperandTemplate::new(&["OC", "IC", "KH", "KW"], &["DRAM", "WBUF", "pe_array"], inp)
            .with_array_dims(&["IC", "OC"])
    };
    let conv_out = || OperandTemplate::new(&["N", "OC", "OH", "OW"], &["pe_array", "OBUF", "DRAM"], acc);
    let conv_bias = || {
        OperandTemplate::new(&["OC"], &["DRAM", "BBUF", "pe_array"], acc)
            .with_array_dims(&["OC"])
    };

    vec![
        CodeletTemplate::new(
            "gemm_no_bias",
            "pe_array",
            vec![gemm_act(), gemm_wgt()],
            vec![gemm_out()],
            &["M", "N", "K"],
        ),
        CodeletTemplate::new(
            "gemm",
            "pe_array",
            vec![gemm_act(), gemm_wgt(), gemm_bias()],
            vec![gemm_out()],
            &["M", "N", "K"],
        ),
        CodeletTemplate::new(
            "conv",
            "pe_array",
            vec![conv_act(), conv_wgt()],
            vec![conv_out()],
            &["OC", "N", "IC", "KH", "KW", "OH", "OW"],
        ),
        CodeletTemplate::new(
            "conv_bias",
            "pe_array",
            vec![conv_act(), conv_wgt(), conv_bias()],
            vec![conv_out()],
            &["OC", "N", "IC", "KH", "KW", "OH", "OW"],
        ),
    ]
}

fn unary_simd_templates() -> Vec<CodeletTemplate> {
    let simd = Datatype::fxp(32);
    let unary_in = || {
        OperandTemplate::new(&["N", "C", "H", "W"], &["DRAM", "VMEM", "SIMD"], simd)
            .with_array_dims(&["C"])
    };
    let unary_out = || OperandTemplate::new(&["N", "C", "H", "W"], &["SIMD", "VMEM", "DRAM"], simd);
    let pool_in = || {
        OperandTemplate::new(&["N", "C", "IH", "IW"], &["DRAM", "VMEM", "SIMD"], simd)
            .driven_by(&[("IH", "OH"), ("IW", "OW")])
            .with_array_dims(&["C"])
    };
    let pool_out = || OperandTemplate::new(&["N", "C", "OH", "OW"], &["SIMD", "VMEM", "DRAM"], simd);

    let mut out = Vec::new();
    for name in ["relu", "elem_tanh", "cast"] {
        out.push(CodeletTemplate::new(
            name,
            "SIMD",
            vec![unary_in()],
            vec![unary_out()],
            &["N", "C", "H", "W"],
        ));
    }
    for name in ["max_pool", "avg_pool"] {
        out.push(CodeletTemplate::new(
            name,
            "SIMD",
            vec![pool_in()],
            vec![pool_out()],
            &["N", "C", "OH", "OW"],
        ));
    }
    out
}

fn binary_simd_templates() -> Vec<CodeletTemplate> {
    let simd = Datatype::fxp(32);
    let operand = || {
        OperandTemplate::new(&["N", "C", "H", "W"], &["DRAM", "VMEM", "SIMD"], simd)
            .with_array_dims(&["C"])
    };
    let result = || OperandTemplate::new(&["N", "C", "H", "W"], &["SIMD", "VMEM", "DRAM"], simd);

    ["elem_add", "elem_sub", "elem_mul"]
        .into_iter()
        .map(|name| {
            CodeletTemplate::new(
                name,
                "SIMD",
                vec![operand(), operand()],
                vec![result()],
                &["N", "C", "H", "W"],
            )
        })
        .collect()
}
