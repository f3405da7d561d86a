//! Executors: namespaces of operators plus the substitution rules that route high-level nodes
//! to them.

pub mod namespace;
pub mod overrides;
pub mod registry;
pub mod rule;

pub use namespace::ExecutorNamespace;
pub use overrides::{SubstitutionOverrides, SubstitutionPolicy};
pub use registry::{ExecutorRegistry, ExecutorRegistryHandle, CORE_VERSION};
pub use rule::{checker_fn, AlwaysAdmit, CapabilityChecker, FnChecker, SubstitutionRule};
