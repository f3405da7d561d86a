//! Enumerates the scalar element types understood by symbolic and host tensors.

use half::{bf16, f16};
use serde::{Deserialize, Serialize};

/// Logical dtype identifier shared between symbolic descriptors and host tensors.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DType {
    /// 32-bit floating point following IEEE-754 semantics.
    F32,
    /// 16-bit floating point with full mantissa (fp16).
    F16,
    /// 16-bit bfloat16 precision as used by many accelerators.
    BF16,
    /// 32-bit signed integer, primarily for index buffers.
    I32,
}

impl DType {
    /// Returns `true` for the floating-point dtypes that carry gradients.
    pub fn is_float(self) -> bool {
        matches!(self, DType::F32 | DType::F16 | DType::BF16)
    }

    /// Rounds an `f32` value to the precision representable by this dtype.
    ///
    /// Host tensors keep their payload as `f32`; rounding on construction keeps reduced
    /// precision dtypes numerically honest without a separate storage type per dtype.
    pub fn round(self, value: f32) -> f32 {
        match self {
            DType::F32 => value,
            DType::F16 => f16::from_f32(value).to_f32(),
            DType::BF16 => bf16::from_f32(value).to_f32(),
            DType::I32 => value.round(),
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            DType::F32 => "f32",
            DType::F16 => "f16",
            DType::BF16 => "bf16",
            DType::I32 => "i32",
        }
    }
}

impl std::fmt::Display for DType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}
