//! Fused flash-attention executor.
//!
//! Registers an executor namespace with two operators, `flash_fwd` and `flash_bwd`, and a
//! substitution rule that replaces `core::scaled_dot_product_attention` with them whenever
//! [`FlashChecker`] admits the call. Everything else keeps the reference implementation.
//!
//! ```
//! use std::sync::Arc;
//!
//! use opswap::ExecutorRegistry;
//! use opswap_flash::{register_flash_executor, ReferenceFlashKernel};
//!
//! let mut registry = ExecutorRegistry::new();
//! let executor = register_flash_executor(&mut registry, Arc::new(ReferenceFlashKernel::default())).unwrap();
//! assert_eq!(executor.operators().forward.qualified_name(), "flash::flash_fwd");
//! let registry = registry.freeze();
//! assert!(registry.namespace("flash").is_some());
//! ```

pub mod capability;
pub mod checker;
pub mod config;
pub mod kernel;
pub mod ops;
pub mod transforms;

use std::sync::Arc;

use anyhow::Result;
use opswap::ops::scaled_dot_product_attention_op;
use opswap::{ExecutorRegistry, SubstitutionRule};

pub use capability::FlashCapability;
pub use checker::FlashChecker;
pub use config::FlashConfig;
pub use kernel::{FlashForward, FlashGradients, FlashKernel, ReferenceFlashKernel};
pub use ops::FlashOperators;
pub use transforms::FlashForwardSymbols;

pub const EXECUTOR_NAME: &str = "flash";
pub const EXECUTOR_VERSION: &str = "0.1";

/// What registration produced.
#[derive(Debug, Clone)]
pub struct FlashExecutor {
    operators: FlashOperators,
    capability: FlashCapability,
    checker: FlashChecker,
}

impl FlashExecutor {
    pub fn operators(&self) -> &FlashOperators {
        &self.operators
    }

    pub fn capability(&self) -> FlashCapability {
        self.capability
    }

    pub fn checker(&self) -> &FlashChecker {
        &self.checker
    }
}

/// Registers the executor with the default configuration, probing the kernel once.
pub fn register_flash_executor(
    registry: &mut ExecutorRegistry,
    kernel: Arc<dyn FlashKernel>,
) -> Result<FlashExecutor> {
    let capability = FlashCapability::probe(kernel.as_ref());
    register_flash_executor_with(registry, kernel, FlashConfig::default(), capability)
}

/// Registers the executor with an explicit configuration and capability.
pub fn register_flash_executor_with(
    registry: &mut ExecutorRegistry,
    kernel: Arc<dyn FlashKernel>,
    config: FlashConfig,
    capability: FlashCapability,
) -> Result<FlashExecutor> {
    if kernel.device_kind() != config.device_kind {
        tracing::warn!(
            kernel = kernel.name(),
            kernel_device = kernel.device_kind().as_str(),
            configured = config.device_kind.as_str(),
            "fused kernel device kind differs from the configured one"
        );
    }
    let namespace = registry.register_namespace(EXECUTOR_NAME, EXECUTOR_VERSION)?;
    let operators = ops::register_operators(namespace, kernel, capability)?;
    let checker = FlashChecker::new(config, capability);
    let rule = SubstitutionRule::new(
        scaled_dot_product_attention_op(),
        checker.clone(),
        transforms::execution_transform(operators.clone()),
    )
    .with_gradient(transforms::gradient_transform(operators.clone()));
    namespace.register_rule(rule);

    tracing::debug!(
        executor = EXECUTOR_NAME,
        version = EXECUTOR_VERSION,
        available = capability.available(),
        "registered flash executor"
    );
    Ok(FlashExecutor {
        operators,
        capability,
        checker,
    })
}
