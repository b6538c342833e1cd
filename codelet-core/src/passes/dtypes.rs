//! Dtype binding and propagation. Systolic codelets compute on narrow
//! inputs/weights with a wide accumulator; everything else runs at the SIMD
//! width. When a consumer expects a different dtype than its producer
//! recorded, a SIMD cast op is spliced in front of the consumer's compute.

use tracing::debug;

use crate::arch::Hag;
use crate::ir::{Codelet, OpKind, Operation};
use crate::opgraph::OpNode;
use crate::operand::{Operand, OperandId};
use crate::program::CompileCtx;
use crate::{Datatype, Result};

pub const SYSTOLIC_ARRAY_CDLTS: &[&str] = &["conv_bias", "conv", "gemm", "gemm_no_bias"];

pub const UNARY_SIMD: &[&str] = &[
    "relu",
    "elem_tanh",
    "max_pool",
    "avg_pool",
    "global_avg_pool",
    "cast",
];

pub const BINARY_SIMD: &[&str] = &["elem_add", "elem_sub", "elem_mul"];

pub fn update_operand_dtypes(
    ctx: &mut CompileCtx,
    _hag: &Hag,
    _node: &OpNode,
    cdlt: &mut Codelet,
) -> Result<()> {
    if SYSTOLIC_ARRAY_CDLTS.contains(&cdlt.op_name()) {
        let inputs = cdlt.inputs.clone();
        cdlt.operand_mut(inputs[0]).dtype = ctx.dtypes.systolic.inp_weight;
        cdlt.operand_mut(inputs[1]).dtype = ctx.dtypes.systolic.inp_weight;
        if inputs.len() == 3 {
            cdlt.operand_mut(inputs[2]).dtype = ctx.dtypes.systolic.bias_out;
        }
        let out = cdlt.outputs[0];
        cdlt.operand_mut(out).dtype = ctx.dtypes.systolic.bias_out;
    } else {
        let simd = ctx.dtypes.simd;
        for o in cdlt.operands_mut() {
            o.dtype = simd;
        }
    }
    Ok(())
}

pub fn add_simd_typecast(
    ctx: &mut CompileCtx,
    _hag: &Hag,
    node: &OpNode,
    cdlt: &mut Codelet,
) -> Result<()> {
    let input_ids = cdlt.inputs.clone();
    for (idx, &id) in input_ids.iter().enumerate() {
        let Some(tensor) = node.inputs.get(idx) else {
            continue;
        };
        let expected = cdlt.operand(id).dtype;
        match ctx.tensor_dtypes.get(&tensor.name).copied() {
            Some(recorded) if recorded != expected => {
                debug!(
                    codelet = %cdlt.uid(),
                    tensor = %tensor.name,
                    from = %recorded,
                    to = %expected,
                    "inserting typecast"
                );
                insert_cast(ctx, cdlt, id, recorded, expected);
            }
            Some(_) => {}
            // A graph input: record what this codelet expects.
            None => {
                ctx.tensor_dtypes.insert(tensor.name.clone(), expected);
            }
        }
    }
    let output_ids = cdlt.outputs.clone();
    for (idx, &id) in output_ids.iter().enumerate() {
        if let Some(tensor) = node.outputs.get(idx) {
            ctx.tensor_dtypes
                .insert(tensor.name.clone(), cdlt.operand(id).dtype);
            ctx.codelet_outputs.insert(
                tensor.name.clone(),
                (cdlt.op_name().to_string(), cdlt.instance_id()),
            );
        }
    }
    Ok(())
}

/// Splice `cast(from -> to)` on the SIMD unit ahead of the first compute op
/// consuming `src`, and rewire that compute to read the cast result.
fn insert_cast(
    ctx: &mut CompileCtx,
    cdlt: &mut Codelet,
    src: OperandId,
    from: Datatype,
    to: Datatype,
) {
    // The source operand actually arrives with the producer's dtype.
    cdlt.operand_mut(src).dtype = from;

    let cast_name = format!("{}_cast", cdlt.operand(src).name);
    let dims = cdlt.operand(src).dims().to_vec();
    let mut cast_operand = Operand::new(&cast_name, to, dims, vec!["SIMD".to_string()]);
    cast_operand.dependencies = cdlt.operand(src).dependencies.clone();
    let cast_id = cdlt.add_operand(cast_operand);

    let insert_at = cdlt
        .ops
        .iter()
        .position(Operation::is_compute)
        .unwrap_or(cdlt.ops.len());
    let loop_level = cdlt
        .ops
        .get(insert_at)
        .map(|op| op.loop_level)
        .unwrap_or(0);
    // The cast waits on whatever transfers bring the source in.
    let deps: Vec<String> = cdlt
        .ops
        .iter()
        .filter(|op| matches!(&op.kind, OpKind::Transfer { operand, .. } if *operand == src))
        .map(Operation::op_str)
        .collect();

    let (op_id, global_op_id) = cdlt.next_op_ids("compute", ctx);
    let cast_op = Operation {
        op_id,
        global_op_id,
        loop_level,
        dependencies: deps,
        kind: OpKind::Compute {
            name: "cast".to_string(),
            target: "SIMD".to_string(),
            sources: vec![src],
            dests: vec![cast_id],
        },
    };
    let cast_str = cast_op.op_str();
    cdlt.insert_op(cast_op, insert_at);

    for op in cdlt.ops.iter_mut() {
        if op.op_str() == cast_str {
            continue;
        }
        if let OpKind::Compute { sources, .. } = &mut op.kind {
            for s in sources.iter_mut() {
                if *s == src {
                    *s = cast_id;
                }
            }
            if sources.contains(&cast_id) && !op.dependencies.contains(&cast_str) {
                op.dependencies.push(cast_str.clone());
            }
        }
    }
}
