//! Tunables of the flash executor.

use anyhow::{Context, Result};
use opswap::{DType, DeviceKind};
use serde::{Deserialize, Serialize};

/// What the fused kernel supports, and how the reference kernel pads its gradients.
///
/// Every field has a default, so a partial JSON object is a valid configuration:
///
/// ```
/// let config = opswap_flash::FlashConfig::from_json(r#"{ "head_dims": [64] }"#).unwrap();
/// assert_eq!(config.head_dims, vec![64]);
/// assert_eq!(config.dtype, opswap::DType::F16);
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct FlashConfig {
    /// Head dimensions (last axis of query, key, and value) the kernel accepts.
    pub head_dims: Vec<usize>,
    /// The only dtype the kernel accepts.
    pub dtype: DType,
    /// Device kind the kernel runs on.
    pub device_kind: DeviceKind,
    /// The reference kernel rounds gradient head dims up to a multiple of this.
    pub head_dim_alignment: usize,
}

impl Default for FlashConfig {
    fn default() -> Self {
        Self {
            head_dims: vec![64, 128, 256],
            dtype: DType::F16,
            device_kind: DeviceKind::Cuda,
            head_dim_alignment: 8,
        }
    }
}

impl FlashConfig {
    pub fn from_json(raw: &str) -> Result<Self> {
        serde_json::from_str(raw).context("invalid flash executor config")
    }

    pub fn supports_head_dim(&self, dim: usize) -> bool {
        self.head_dims.contains(&dim)
    }
}
