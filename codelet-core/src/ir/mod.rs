//! Operation-level IR. Every operation shares a common header (ids,
//! dependencies, loop level) over a tagged payload for the four variants:
//! loop, transfer, compute and configure.

use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::json;

use crate::operand::OperandId;

mod codelet;
pub use codelet::{Codelet, ParamValue};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum StartOrFinish {
    Start,
    Finish,
}

impl fmt::Display for StartOrFinish {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            StartOrFinish::Start => "start",
            StartOrFinish::Finish => "finish",
        })
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum OpKind {
    Loop {
        iter_count: u64,
        start: u64,
        end: u64,
        stride: u64,
    },
    Transfer {
        operand: OperandId,
        /// Ordered node names the transfer traverses.
        path: Vec<String>,
        /// Per-edge, per-dimension offsets.
        offsets: Vec<Vec<u64>>,
        /// Per-edge, per-dimension sizes.
        sizes: Vec<Vec<u64>>,
    },
    Compute {
        name: String,
        target: String,
        sources: Vec<OperandId>,
        dests: Vec<OperandId>,
    },
    Configure {
        start_or_finish: StartOrFinish,
        target: String,
    },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Operation {
    /// Per-codelet, per-op-type id; `op_str` is derived from it.
    pub op_id: usize,
    /// Program-wide id.
    pub global_op_id: usize,
    /// Nesting depth.
    pub loop_level: usize,
    /// Op-strings this operation depends on; after hoisting each referenced
    /// op appears strictly earlier in the list.
    pub dependencies: Vec<String>,
    pub kind: OpKind,
}

impl Operation {
    pub fn op_type(&self) -> &'static str {
        match self.kind {
            OpKind::Loop { .. } => "loop",
            OpKind::Transfer { .. } => "transfer",
            OpKind::Compute { .. } => "compute",
            OpKind::Configure { .. } => "config",
        }
    }

    pub fn op_str(&self) -> String {
        format!("{}{}", self.op_type(), self.op_id)
    }

    pub fn is_loop(&self) -> bool {
        matches!(self.kind, OpKind::Loop { .. })
    }

    pub fn is_compute(&self) -> bool {
        matches!(self.kind, OpKind::Compute { .. })
    }

    pub fn is_transfer(&self) -> bool {
        matches!(self.kind, OpKind::Transfer { .. })
    }

    /// One-line text form, e.g. `op17: compute: SIMD-elem_add([x, y])->[z]`.
    pub fn emit_text(&self, cdlt: &Codelet) -> String {
        let payload = match &self.kind {
            OpKind::Loop {
                iter_count,
                start,
                end,
                stride,
            } => format!("iter={iter_count}, start={start}, end={end}, stride={stride}"),
            OpKind::Transfer { operand, path, .. } => {
                format!("{}[{}]", cdlt.operand(*operand).name, path.join("->"))
            }
            OpKind::Compute {
                name,
                target,
                sources,
                dests,
            } => {
                let srcs: Vec<&str> = sources
                    .iter()
                    .map(|s| cdlt.operand(*s).name.as_str())
                    .collect();
                let dsts: Vec<&str> = dests
                    .iter()
                    .map(|d| cdlt.operand(*d).name.as_str())
                    .collect();
                format!(
                    "{target}-{name}([{}])->[{}]",
                    srcs.join(", "),
                    dsts.join(", ")
                )
            }
            OpKind::Configure {
                start_or_finish,
                target,
            } => format!("{start_or_finish}-{target}"),
        };
        format!("op{}: {}: {}", self.global_op_id, self.op_type(), payload)
    }

    /// Artifact JSON object for this operation.
    pub fn to_json(&self, cdlt: &Codelet) -> serde_json::Value {
        let mut obj = json!({
            "op_type": self.op_type(),
            "op_id": self.global_op_id,
            "op_str": self.op_str(),
            "dependencies": self.dependencies,
            "loop_level": self.loop_level,
        });
        let extra = match &self.kind {
            OpKind::Loop {
                iter_count,
                start,
                end,
                stride,
            } => json!({
                "iter_count": iter_count,
                "start": start,
                "end": end,
                "stride": stride,
            }),
            OpKind::Transfer {
                operand,
                path,
                offsets,
                sizes,
            } => json!({
                "operand": cdlt.operand(*operand).name,
                "path": path,
                "offsets": offsets,
                "sizes": sizes,
            }),
            OpKind::Compute {
                name,
                target,
                sources,
                dests,
            } => json!({
                "operation_name": name,
                "target": target,
                "sources": sources
                    .iter()
                    .map(|s| cdlt.operand(*s).name.clone())
                    .collect::<Vec<_>>(),
                "destinations": dests
                    .iter()
                    .map(|d| cdlt.operand(*d).name.clone())
                    .collect::<Vec<_>>(),
            }),
            OpKind::Configure {
                start_or_finish,
                target,
            } => json!({
                "start_or_finish": start_or_finish.to_string(),
                "target": target,
            }),
        };
        if let (Some(map), Some(extra)) = (obj.as_object_mut(), extra.as_object()) {
            for (k, v) in extra {
                map.insert(k.clone(), v.clone());
            }
        }
        obj
    }
}
