use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::{Error, Result};

/// Numeric class of a hardware datatype.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum DtypeKind {
    /// Fixed point.
    Fxp,
    /// Floating point.
    Fp,
}

/// A symbolic datatype with a known bit width. The core never holds numeric
/// payloads; only the width participates in capacity and bandwidth math.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Datatype {
    kind: DtypeKind,
    bits: u16,
}

impl Datatype {
    pub const fn new(kind: DtypeKind, bits: u16) -> Self {
        Self { kind, bits }
    }

    pub const fn fxp(bits: u16) -> Self {
        Self::new(DtypeKind::Fxp, bits)
    }

    pub const fn fp(bits: u16) -> Self {
        Self::new(DtypeKind::Fp, bits)
    }

    pub fn kind(&self) -> DtypeKind {
        self.kind
    }

    pub fn bits(&self) -> u64 {
        u64::from(self.bits)
    }

    pub fn bytes(&self) -> u64 {
        self.bits().div_ceil(8)
    }
}

impl fmt::Display for Datatype {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.kind {
            DtypeKind::Fxp => write!(f, "FXP{}", self.bits),
            DtypeKind::Fp => write!(f, "FP{}", self.bits),
        }
    }
}

impl FromStr for Datatype {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let (kind, width) = if let Some(w) = s.strip_prefix("FXP") {
            (DtypeKind::Fxp, w)
        } else if let Some(w) = s.strip_prefix("FP") {
            (DtypeKind::Fp, w)
        } else {
            return Err(Error::Artifact(format!("unknown dtype `{s}`")));
        };
        let bits: u16 = width
            .parse()
            .map_err(|_| Error::Artifact(format!("unknown dtype `{s}`")))?;
        Ok(Self::new(kind, bits))
    }
}

/// Datatypes the systolic array computes with: one width for inputs and
/// weights, a wider one for the bias/output accumulator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SystolicDtypes {
    pub inp_weight: Datatype,
    pub bias_out: Datatype,
}

/// Per-target dtype bindings applied by the dtype-update pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DtypeConfig {
    pub systolic: SystolicDtypes,
    pub simd: Datatype,
}

impl Default for DtypeConfig {
    fn default() -> Self {
        Self {
            systolic: SystolicDtypes {
                inp_weight: Datatype::fxp(8),
                bias_out: Datatype::fxp(32),
            },
            simd: Datatype::fxp(32),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_and_display() {
        let d: Datatype = "FXP8".parse().unwrap();
        assert_eq!(d, Datatype::fxp(8));
        assert_eq!(d.to_string(), "FXP8");
        assert_eq!(d.bits(), 8);
        let f: Datatype = "FP32".parse().unwrap();
        assert_eq!(f, Datatype::fp(32));
        assert!("INT8".parse::<Datatype>().is_err());
    }
}
