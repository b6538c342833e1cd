//! Operator-graph input surface: the upstream front end hands the core a DAG
//! of operator nodes carrying named tensors and free-form keyword arguments.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::Datatype;

/// A tensor reference on an operator node. Dimensions may be absent at load
/// time; placeholders are filled during shape padding.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TensorSpec {
    pub name: String,
    pub shape: Vec<Option<u64>>,
    /// Optional `hag_dtype` attribute from the front end.
    pub dtype: Option<Datatype>,
}

impl TensorSpec {
    pub fn new(name: &str, shape: &[u64]) -> Self {
        Self {
            name: name.to_string(),
            shape: shape.iter().copied().map(Some).collect(),
            dtype: None,
        }
    }

    pub fn placeholder(name: &str, rank: usize) -> Self {
        Self {
            name: name.to_string(),
            shape: vec![None; rank],
            dtype: None,
        }
    }

    pub fn with_dtype(mut self, dtype: Datatype) -> Self {
        self.dtype = Some(dtype);
        self
    }

    pub fn rank(&self) -> usize {
        self.shape.len()
    }

    pub fn dim(&self, i: usize) -> Option<u64> {
        self.shape.get(i).copied().flatten()
    }
}

/// Free-form keyword argument (`pad`, `stride`, `kernel_size`, `transA`, …).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum KwArg {
    Int(i64),
    IntList(Vec<i64>),
    Flag(bool),
    Str(String),
}

impl KwArg {
    pub fn as_int(&self) -> Option<i64> {
        match self {
            KwArg::Int(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_list(&self) -> Option<&[i64]> {
        match self {
            KwArg::IntList(v) => Some(v),
            _ => None,
        }
    }

    pub fn as_flag(&self) -> Option<bool> {
        match self {
            KwArg::Flag(v) => Some(*v),
            _ => None,
        }
    }
}

/// One operator node from the upstream graph.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OpNode {
    pub op_name: String,
    pub inputs: Vec<TensorSpec>,
    pub outputs: Vec<TensorSpec>,
    pub kwargs: BTreeMap<String, KwArg>,
}

impl OpNode {
    pub fn new(op_name: &str, inputs: Vec<TensorSpec>, outputs: Vec<TensorSpec>) -> Self {
        Self {
            op_name: op_name.to_string(),
            inputs,
            outputs,
            kwargs: BTreeMap::new(),
        }
    }

    pub fn with_kwarg(mut self, key: &str, value: KwArg) -> Self {
        self.kwargs.insert(key.to_string(), value);
        self
    }

    pub fn kwarg_int(&self, key: &str) -> Option<i64> {
        self.kwargs.get(key).and_then(KwArg::as_int)
    }

    pub fn kwarg_list(&self, key: &str) -> Option<&[i64]> {
        self.kwargs.get(key).and_then(KwArg::as_list)
    }

    pub fn kwarg_flag(&self, key: &str) -> Option<bool> {
        self.kwargs.get(key).and_then(KwArg::as_flag)
    }
}
