//! Host capability probe for the fused kernel.

use std::sync::OnceLock;

use opswap::env;

use crate::kernel::FlashKernel;

/// Set to a truthy value to report the fused kernel as unavailable.
pub const DISABLE_ENV: &str = "OPSWAP_DISABLE_FLASH";

static DISABLED_BY_ENV: OnceLock<bool> = OnceLock::new();

fn disabled_by_env() -> bool {
    *DISABLED_BY_ENV.get_or_init(|| env::flag(DISABLE_ENV, false))
}

/// Whether the fused kernel can run on this host. Resolved once, then shared by the
/// executor's checker and kernels.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FlashCapability {
    available: bool,
}

impl FlashCapability {
    pub fn probe(kernel: &dyn FlashKernel) -> Self {
        let available = !disabled_by_env() && kernel.probe();
        tracing::debug!(kernel = kernel.name(), available, "probed fused attention kernel");
        Self { available }
    }

    /// Skips probing; for hosts where availability is known up front.
    pub fn forced(available: bool) -> Self {
        Self { available }
    }

    pub fn available(self) -> bool {
        self.available
    }
}
