mod arch;
mod dtype;
mod error;
mod flex;
mod ir;
mod opgraph;
mod operand;
mod passes;
mod program;
mod templates;
mod tiling;

pub use arch::{ArchNode, Edge, Hag, HagBuilder, NodeKind, Occupancy};
pub use dtype::{Datatype, DtypeConfig, DtypeKind, SystolicDtypes};
pub use error::{Error, Result};
pub use flex::{FlexParam, Value};
pub use ir::{Codelet, OpKind, Operation, ParamValue, StartOrFinish};
pub use opgraph::{KwArg, OpNode, TensorSpec};
pub use operand::{DataMovement, DimOffset, Operand, OperandId};
pub use passes::{run_pipeline, PIPELINE};
pub use program::{CodeletProgram, CompileCtx, CompileMode, OutputFormat};
pub use templates::{default_templates, CodeletTemplate, OperandTemplate};
pub use tiling::{
    factors, set_codelet_tiling, CandidateSet, FactorStrategy, SearchConfig,
};
