//! The ordered codelet transformation pipeline: layout normalization, shape
//! padding, dtype propagation with implicit casts, tiling and hoisting. A
//! failing pass aborts the codelet's compilation with the pass name and
//! codelet id attached.

use tracing::debug;

use crate::arch::Hag;
use crate::ir::Codelet;
use crate::opgraph::OpNode;
use crate::program::CompileCtx;
use crate::{Error, Result};

mod dtypes;
mod hoist;
mod layout;
mod pad;
mod tile;

pub use dtypes::{BINARY_SIMD, SYSTOLIC_ARRAY_CDLTS, UNARY_SIMD};

pub type Pass = fn(&mut CompileCtx, &Hag, &OpNode, &mut Codelet) -> Result<()>;

pub const PIPELINE: &[(&str, Pass)] = &[
    ("template_layout", layout::run),
    ("pad_operands", pad::run),
    ("update_operand_dtypes", dtypes::update_operand_dtypes),
    ("add_simd_typecast", dtypes::add_simd_typecast),
    ("tile", tile::run),
    ("hoist", hoist::run),
];

pub fn run_pipeline(
    ctx: &mut CompileCtx,
    hag: &Hag,
    node: &OpNode,
    cdlt: &mut Codelet,
) -> Result<()> {
    for &(name, pass) in PIPELINE {
        debug!(codelet = %cdlt.uid(), pass = name, "running pass");
        pass(ctx, hag, node, cdlt).map_err(|e| Error::Pass {
            pass: name,
            codelet: cdlt.uid(),
            source: Box::new(e),
        })?;
    }
    Ok(())
}
