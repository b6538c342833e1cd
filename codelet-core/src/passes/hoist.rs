//! Hoisting: move each non-loop op to the earliest position where all its
//! dependencies still precede it, lowering its loop level to one above the
//! deepest surviving dependency. Idempotent.

use crate::arch::Hag;
use crate::ir::Codelet;
use crate::opgraph::OpNode;
use crate::program::CompileCtx;
use crate::{Error, Result};

pub fn run(_ctx: &mut CompileCtx, _hag: &Hag, _node: &OpNode, cdlt: &mut Codelet) -> Result<()> {
    let order: Vec<String> = cdlt.ops.iter().map(|o| o.op_str()).collect();
    for op_str in order {
        let i = cdlt
            .op_index(&op_str)
            .ok_or_else(|| Error::UnknownOp(op_str.clone()))?;
        if cdlt.ops[i].is_loop() || cdlt.ops[i].dependencies.is_empty() {
            continue;
        }
        let current_level = cdlt.ops[i].loop_level;
        let mut max_dep_idx: Option<usize> = None;
        let mut dep_level: Option<usize> = None;
        for dep in cdlt.ops[i].dependencies.clone() {
            let dep_idx = cdlt
                .op_index(&dep)
                .ok_or_else(|| Error::UnknownOp(dep.clone()))?;
            let level = if cdlt.ops[dep_idx].is_loop() {
                cdlt.ops[dep_idx].loop_level + 1
            } else {
                cdlt.ops[dep_idx].loop_level
            };
            if dep_level.map_or(true, |l| level > l) {
                dep_level = Some(level);
            }
            if max_dep_idx.map_or(true, |m| dep_idx > m) {
                max_dep_idx = Some(dep_idx);
            }
        }
        let Some(max_dep_idx) = max_dep_idx else {
            continue;
        };
        let min_idx = max_dep_idx + 1;
        // Move only when the hoist lowers the op's nesting; ops already as
        // shallow as their deps allow stay put, which keeps the pass
        // idempotent.
        let lowers_level = dep_level.map_or(false, |l| l > 0 && l < current_level);
        let mut idx = i;
        if min_idx < i && lowers_level {
            cdlt.move_op(i, min_idx);
            idx = min_idx;
        }
        if let Some(level) = dep_level {
            if level < current_level && level > 0 {
                cdlt.ops[idx].loop_level = level;
            }
        }
    }
    Ok(())
}
