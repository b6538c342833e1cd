use std::collections::BTreeMap;

use crate::arch::NodeKind;

#[derive(thiserror::Error, Debug)]
pub enum Error {
    /// Structural edit against a node that has already been attached to a
    /// parent composite.
    #[error("node `{node}` is sealed, its subgraph can no longer be edited")]
    SealedGraph { node: String },

    #[error("duplicate node name `{name}` in architecture graph")]
    DuplicateNode { name: String },

    #[error(
        "occupancy conflict on `{node}`: op {op_id} over [{begin}, {end}) overlaps an existing interval"
    )]
    Overlap {
        node: String,
        op_id: usize,
        begin: u64,
        end: u64,
    },

    #[error("no tiling constraint rule for `{src}` ({src_kind}) -> `{dst}` ({dst_kind})")]
    UnsupportedTopology {
        src: String,
        dst: String,
        src_kind: NodeKind,
        dst_kind: NodeKind,
    },

    #[error("no shape padding rule for operator `{op}`")]
    UnhandledOperator { op: String },

    #[error(
        "tile size disagreement at level {level} for ({src}, {dst}), dim {dim}: {expected} vs {got}"
    )]
    SizeConsistency {
        src: String,
        dst: String,
        level: usize,
        dim: String,
        expected: u64,
        got: u64,
    },

    #[error(
        "no valid tiling for codelet `{codelet}`\nattempts per level: {attempts:?}\nconstraints: {constraints:?}"
    )]
    NoValidTiling {
        codelet: String,
        constraints: Vec<String>,
        attempts: BTreeMap<usize, usize>,
    },

    #[error("shape mismatch in `{op}`: {details}")]
    ShapeMismatch { op: String, details: String },

    #[error("operand `{operand}` has no tiling entry for `{node}` on its data path")]
    MissingTile { operand: String, node: String },

    #[error("tiling search cancelled")]
    Cancelled,

    #[error("unknown node `{0}` in architecture graph")]
    UnknownNode(String),

    #[error("no edge from `{src}` to `{dst}` in architecture graph")]
    UnknownEdge { src: String, dst: String },

    #[error("no codelet template registered for `{0}`")]
    UnknownTemplate(String),

    #[error("unknown operation `{0}` in codelet")]
    UnknownOp(String),

    #[error("expression `{name}`: {msg}")]
    Expr { name: String, msg: String },

    #[error("pass `{pass}` failed for codelet `{codelet}`: {source}")]
    Pass {
        pass: &'static str,
        codelet: String,
        #[source]
        source: Box<Error>,
    },

    #[error("malformed codelet artifact: {0}")]
    Artifact(String),

    #[error(transparent)]
    Json(#[from] serde_json::Error),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error("{inner}\n{backtrace}")]
    WithBacktrace {
        inner: Box<Self>,
        backtrace: Box<std::backtrace::Backtrace>,
    },
}

pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    pub fn bt(self) -> Self {
        let backtrace = std::backtrace::Backtrace::capture();
        match backtrace.status() {
            std::backtrace::BacktraceStatus::Disabled
            | std::backtrace::BacktraceStatus::Unsupported => self,
            _ => Self::WithBacktrace {
                inner: Box::new(self),
                backtrace: Box::new(backtrace),
            },
        }
    }
}
