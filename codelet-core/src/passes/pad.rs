//! Shape padding: every operand dimension feeding a compute array is rounded
//! up to the array's constrained multiple, with the padded shapes recorded in
//! the shared `shaped_nodes` table so downstream consumers observe them.
//! Dimensions absent at load time resolve from that table here.

use crate::arch::Hag;
use crate::ir::{Codelet, ParamValue};
use crate::opgraph::{OpNode, TensorSpec};
use crate::operand::OperandId;
use crate::program::CompileCtx;
use crate::{Error, Result};

use super::{BINARY_SIMD, UNARY_SIMD};

const NOOPS: &[&str] = &["coarse_flatten"];

fn round_up(extent: u64, multiple: u64) -> u64 {
    if multiple == 0 {
        extent
    } else {
        extent.div_ceil(multiple) * multiple
    }
}

/// Fill placeholder extents from the shared shape table, positionally by the
/// producer's recorded shape.
fn resolve_placeholders(
    ctx: &CompileCtx,
    cdlt: &mut Codelet,
    id: OperandId,
    tensor: &TensorSpec,
) -> Result<()> {
    if cdlt.operand(id).dims().iter().all(|(_, e)| *e > 0) {
        return Ok(());
    }
    let recorded = ctx.shaped_nodes.get(&tensor.name).ok_or_else(|| {
        Error::ShapeMismatch {
            op: cdlt.uid(),
            details: format!("tensor `{}` has unresolved placeholder dims", tensor.name),
        }
    })?;
    if recorded.len() != cdlt.operand(id).rank() {
        return Err(Error::ShapeMismatch {
            op: cdlt.uid(),
            details: format!(
                "recorded shape {:?} for `{}` does not match rank {}",
                recorded,
                tensor.name,
                cdlt.operand(id).rank()
            ),
        });
    }
    for (i, extent) in recorded.clone().into_iter().enumerate() {
        if cdlt.operand(id).dims()[i].1 == 0 {
            cdlt.operand_mut(id).set_extent_at(i, extent);
        }
    }
    Ok(())
}

fn pad_dim(cdlt: &mut Codelet, id: OperandId, dim: &str, multiple: u64) {
    if let Some(extent) = cdlt.operand(id).extent(dim) {
        cdlt.operand_mut(id)
            .set_extent(dim, round_up(extent, multiple));
    }
}

fn pad_trailing(cdlt: &mut Codelet, id: OperandId, multiple: u64) {
    let rank = cdlt.operand(id).rank();
    if rank == 0 {
        return;
    }
    let (_, extent) = cdlt.operand(id).dims()[rank - 1].clone();
    cdlt.operand_mut(id)
        .set_extent_at(rank - 1, round_up(extent, multiple));
}

fn record_shapes(ctx: &mut CompileCtx, cdlt: &Codelet, node: &OpNode) {
    let tensors = node.inputs.iter().chain(&node.outputs);
    let ids = cdlt.inputs.iter().chain(&cdlt.outputs);
    for (tensor, &id) in tensors.zip(ids) {
        let shape: Vec<u64> = cdlt.operand(id).dims().iter().map(|(_, e)| *e).collect();
        ctx.shaped_nodes.insert(tensor.name.clone(), shape);
    }
}

fn mismatch(cdlt: &Codelet, details: String) -> Error {
    Error::ShapeMismatch {
        op: cdlt.uid(),
        details,
    }
}

pub fn run(ctx: &mut CompileCtx, hag: &Hag, node: &OpNode, cdlt: &mut Codelet) -> Result<()> {
    let op_name = cdlt.op_name().to_string();
    let tensors: Vec<TensorSpec> = node.inputs.iter().chain(&node.outputs).cloned().collect();
    let ids: Vec<OperandId> = cdlt.inputs.iter().chain(&cdlt.outputs).copied().collect();
    for (tensor, &id) in tensors.iter().zip(&ids) {
        resolve_placeholders(ctx, cdlt, id, tensor)?;
    }

    match op_name.as_str() {
        "conv" | "conv_bias" => {
            let sys_dims = hag.get_subgraph_node("pe_array")?.dimensions().to_vec();
            let act = cdlt.inputs[0];
            let weight = cdlt.inputs[1];
            let out = cdlt.outputs[0];
            // Post-layout orders: activation [N, IH, IW, IC], weight
            // [KH, KW, IC, OC], output [N, OH, OW, OC].
            pad_dim(cdlt, act, "IC", sys_dims[0]);
            pad_dim(cdlt, weight, "IC", sys_dims[0]);
            pad_dim(cdlt, weight, "OC", sys_dims[1]);
            pad_dim(cdlt, out, "OC", sys_dims[1]);
            let w_ic = cdlt.operand(weight).extent("IC");
            let a_ic = cdlt.operand(act).extent("IC");
            if w_ic != a_ic {
                return Err(mismatch(
                    cdlt,
                    format!(
                        "weight IC {:?} does not match activation channels {:?}",
                        w_ic, a_ic
                    ),
                ));
            }
            let w_oc = cdlt.operand(weight).extent("OC");
            let o_oc = cdlt.operand(out).extent("OC");
            if w_oc != o_oc {
                return Err(mismatch(
                    cdlt,
                    format!("weight OC {:?} does not match output OC {:?}", w_oc, o_oc),
                ));
            }
            if op_name == "conv_bias" {
                let bias = cdlt.inputs[2];
                pad_dim(cdlt, bias, "OC", sys_dims[1]);
                if cdlt.operand(bias).extent("OC") != o_oc {
                    return Err(mismatch(
                        cdlt,
                        format!(
                            "bias extent {:?} does not match output OC {:?}",
                            cdlt.operand(bias).extent("OC"),
                            o_oc
                        ),
                    ));
                }
            }
        }
        "gemm" | "gemm_no_bias" => {
            for flag in ["transA", "transB"] {
                if node.kwarg_flag(flag) == Some(true) {
                    return Err(Error::UnhandledOperator {
                        op: format!("{op_name}({flag})"),
                    });
                }
            }
            let sys_dims = hag.get_subgraph_node("pe_array")?.dimensions().to_vec();
            let act = cdlt.inputs[0];
            let weight = cdlt.inputs[1];
            let out = cdlt.outputs[0];
            pad_dim(cdlt, act, "M", sys_dims[0]);
            pad_dim(cdlt, act, "K", sys_dims[0]);
            pad_dim(cdlt, weight, "K", sys_dims[0]);
            pad_dim(cdlt, weight, "N", sys_dims[1]);
            pad_dim(cdlt, out, "M", sys_dims[0]);
            pad_dim(cdlt, out, "N", sys_dims[1]);
            if cdlt.operand(act).extent("K") != cdlt.operand(weight).extent("K") {
                return Err(mismatch(
                    cdlt,
                    format!(
                        "activation K {:?} does not match weight K {:?}",
                        cdlt.operand(act).extent("K"),
                        cdlt.operand(weight).extent("K")
                    ),
                ));
            }
            if cdlt.operand(out).extent("N") != cdlt.operand(weight).extent("N") {
                return Err(mismatch(
                    cdlt,
                    format!(
                        "output N {:?} does not match weight N {:?}",
                        cdlt.operand(out).extent("N"),
                        cdlt.operand(weight).extent("N")
                    ),
                ));
            }
            if op_name == "gemm" {
                let bias = cdlt.inputs[2];
                pad_dim(cdlt, bias, "N", sys_dims[1]);
                if cdlt.operand(bias).extent("N") != cdlt.operand(out).extent("N") {
                    return Err(mismatch(
                        cdlt,
                        "bias extent does not match output N".to_string(),
                    ));
                }
            }
        }
        name if UNARY_SIMD.contains(&name) => {
            let simd = hag.get_subgraph_node("SIMD")?.dimensions().to_vec();
            let data = cdlt.inputs[0];
            let out = cdlt.outputs[0];
            pad_trailing(cdlt, data, simd[0]);
            pad_trailing(cdlt, out, simd[0]);
            if matches!(name, "max_pool" | "avg_pool") {
                let pad = node.kwarg_int("pad").unwrap_or(0) as u64;
                if pad > 0 {
                    for dim in ["IH", "IW"] {
                        if let Some(extent) = cdlt.operand(data).extent(dim) {
                            cdlt.operand_mut(data).set_extent(dim, extent + 2 * pad);
                        }
                    }
                }
                if let Some(kernel) = node.kwarg_list("kernel_size") {
                    for (key, value) in ["KH", "KW"].iter().zip(kernel) {
                        cdlt.compilation_params
                            .insert(key.to_string(), ParamValue::Int(*value));
                    }
                }
                if let Some(stride) = node.kwarg_list("stride") {
                    for (key, value) in ["sy", "sx"].iter().zip(stride) {
                        cdlt.compilation_params
                            .insert(key.to_string(), ParamValue::Int(*value));
                    }
                }
            }
        }
        name if BINARY_SIMD.contains(&name) => {
            let simd = hag.get_subgraph_node("SIMD")?.dimensions().to_vec();
            let all: Vec<OperandId> = cdlt.inputs.iter().chain(&cdlt.outputs).copied().collect();
            for &id in &all {
                pad_trailing(cdlt, id, simd[0]);
            }
            let first: Vec<u64> = cdlt
                .operand(all[0])
                .dims()
                .iter()
                .map(|(_, e)| *e)
                .collect();
            for &id in &all[1..] {
                let shape: Vec<u64> = cdlt.operand(id).dims().iter().map(|(_, e)| *e).collect();
                if shape != first {
                    return Err(mismatch(
                        cdlt,
                        format!(
                            "operand `{}` shape {:?} does not match `{}` shape {:?}",
                            cdlt.operand(id).name,
                            shape,
                            cdlt.operand(all[0]).name,
                            first
                        ),
                    ));
                }
            }
        }
        name if NOOPS.contains(&name) => {}
        other => {
            return Err(Error::UnhandledOperator {
                op: other.to_string(),
            })
        }
    }

    record_shapes(ctx, cdlt, node);
    sync_loops(cdlt);
    Ok(())
}

/// Re-bound every loop to its dimension's padded extent.
fn sync_loops(cdlt: &mut Codelet) {
    let extents = cdlt.operand_dim_mapping();
    let loop_dims = cdlt.loop_dims.clone();
    for op in cdlt.ops.iter_mut() {
        let op_str = op.op_str();
        if let crate::ir::OpKind::Loop {
            iter_count, end, ..
        } = &mut op.kind
        {
            if let Some(extent) = loop_dims.get(&op_str).and_then(|dim| extents.get(dim)) {
                *iter_count = *extent;
                *end = *extent;
            }
        }
    }
    for (loop_str, dim) in &loop_dims {
        if let (Some(map), Some(extent)) =
            (cdlt.domain_loop_map.get_mut(&0), extents.get(dim))
        {
            if map.contains_key(loop_str) {
                map.insert(loop_str.clone(), *extent);
            }
        }
    }
}
