//! Device placement tags carried by symbolic and host tensors.

use serde::{Deserialize, Serialize};

/// Kind of device a tensor lives on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeviceKind {
    Cpu,
    Cuda,
}

impl DeviceKind {
    pub fn as_str(self) -> &'static str {
        match self {
            DeviceKind::Cpu => "cpu",
            DeviceKind::Cuda => "cuda",
        }
    }
}

/// A device kind plus ordinal, e.g. `cuda:1`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Device {
    pub kind: DeviceKind,
    pub index: u32,
}

impl Device {
    pub const fn new(kind: DeviceKind, index: u32) -> Self {
        Self { kind, index }
    }

    pub const fn cpu() -> Self {
        Self::new(DeviceKind::Cpu, 0)
    }

    pub const fn cuda(index: u32) -> Self {
        Self::new(DeviceKind::Cuda, index)
    }
}

impl Default for Device {
    fn default() -> Self {
        Device::cpu()
    }
}

impl std::fmt::Display for Device {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.kind.as_str(), self.index)
    }
}
