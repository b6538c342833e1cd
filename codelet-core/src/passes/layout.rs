//! Operand layout normalization: activations move to trailing-channel order
//! and conv weights to kernel-major order, with any positional offset/size
//! vectors on transfer operations permuted to match. Conv inputs also grow
//! by their boundary padding here, and average pools record their averaging
//! denominator.

use crate::arch::Hag;
use crate::ir::{Codelet, OpKind, ParamValue};
use crate::opgraph::OpNode;
use crate::program::CompileCtx;
use crate::Result;

/// Shape symbol lists rewritten to trailing-channel order.
const TRANSPOSED_SHAPES: &[&[&str]] = &[
    &["N", "C", "H", "W"],
    &["N", "IC", "IH", "IW"],
    &["N", "C", "IH", "IW"],
    &["N", "OC", "OH", "OW"],
    &["ON", "OC", "OH", "OW"],
    &["N", "C", "OH", "OW"],
];

/// Weight shape symbol lists rewritten to kernel-major order.
const FLIP_SHAPES: &[&[&str]] = &[&["OC", "IC", "KH", "KW"]];

const ACTIVATION_PERM: [usize; 4] = [0, 2, 3, 1];
const WEIGHT_PERM: [usize; 4] = [2, 3, 0, 1];

pub fn run(_ctx: &mut CompileCtx, _hag: &Hag, node: &OpNode, cdlt: &mut Codelet) -> Result<()> {
    if matches!(cdlt.op_name(), "conv" | "conv_bias") {
        let pad = node.kwarg_int("pad").unwrap_or(0) as u64;
        if pad > 0 {
            let act = cdlt.inputs[0];
            for dim in ["IH", "IW"] {
                if let Some(extent) = cdlt.operand(act).extent(dim) {
                    cdlt.operand_mut(act).set_extent(dim, extent + 2 * pad);
                }
            }
        }
    }
    if matches!(cdlt.op_name(), "avg_pool" | "global_avg_pool") {
        let act = cdlt.operand(cdlt.inputs[0]);
        let denom: u64 = act.dims().iter().skip(2).map(|(_, e)| *e).product();
        cdlt.compilation_params
            .insert("denom".to_string(), ParamValue::Int(denom as i64));
    }

    // Reorder matching operands and remember each permutation.
    let mut reordered: Vec<(usize, [usize; 4])> = Vec::new();
    for idx in 0..cdlt.operands().len() {
        let names = cdlt.operands()[idx].dim_names();
        let name_refs: Vec<&str> = names.iter().map(String::as_str).collect();
        let perm = if TRANSPOSED_SHAPES.contains(&name_refs.as_slice()) {
            Some(ACTIVATION_PERM)
        } else if FLIP_SHAPES.contains(&name_refs.as_slice()) {
            Some(WEIGHT_PERM)
        } else {
            None
        };
        if let Some(perm) = perm {
            cdlt.operands_mut()[idx].reorder_dims(&perm);
            reordered.push((idx, perm));
        }
    }

    // Rewrite positional offset/size vectors on transfers consistently.
    for op in cdlt.ops.iter_mut() {
        if let OpKind::Transfer {
            operand,
            offsets,
            sizes,
            ..
        } = &mut op.kind
        {
            if let Some((_, perm)) = reordered.iter().find(|(idx, _)| idx == &**operand) {
                for row in offsets.iter_mut().chain(sizes.iter_mut()) {
                    if row.len() == perm.len() {
                        *row = perm.iter().map(|&i| row[i]).collect();
                    }
                }
            }
        }
    }
    Ok(())
}
