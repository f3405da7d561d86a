//! Admission rules for routing attention to the fused kernel.

use opswap::{CapabilityChecker, OpArgs, SymbolicTensor};

use crate::capability::FlashCapability;
use crate::config::FlashConfig;

/// Admits an attention call only when the fused kernel can run it exactly.
///
/// Operands follow the attention signature `(query, key, value, attn_mask?)`. All of the
/// following must hold:
///
/// 1. the kernel is available on this host;
/// 2. query, key, and value are rank 4 with a supported head dim;
/// 3. all three have exactly the configured dtype;
/// 4. there is no mask and `dropout_p == 0`;
/// 5. all three share one device of the configured kind.
#[derive(Debug, Clone)]
pub struct FlashChecker {
    config: FlashConfig,
    capability: FlashCapability,
}

impl FlashChecker {
    pub fn new(config: FlashConfig, capability: FlashCapability) -> Self {
        Self { config, capability }
    }

    pub fn config(&self) -> &FlashConfig {
        &self.config
    }

    fn admits_operand(&self, tensor: &SymbolicTensor) -> bool {
        tensor.shape().rank() == 4
            && self.config.supports_head_dim(tensor.shape().last_dim())
            && tensor.dtype() == self.config.dtype
    }
}

impl CapabilityChecker for FlashChecker {
    fn admits(&self, args: &OpArgs<'_, SymbolicTensor>) -> bool {
        if !self.capability.available() {
            return false;
        }
        let (Some(query), Some(key), Some(value)) =
            (args.optional(0), args.optional(1), args.optional(2))
        else {
            return false;
        };
        if ![query, key, value]
            .into_iter()
            .all(|tensor| self.admits_operand(tensor))
        {
            return false;
        }
        if args.optional(3).is_some() {
            return false;
        }
        match args.attrs().float("dropout_p") {
            Ok(p) if p == 0.0 => {}
            _ => return false,
        }
        let device = query.device();
        device.kind == self.config.device_kind && key.device() == device && value.device() == device
    }
}
