//! Operator substitution for traced tensor programs.
//!
//! Programs are traced into [`graph::Trace`]s of high-level operators such as
//! [`ops::attention`]. Executors register specialised operators (each a meta function plus an
//! implementation) and substitution rules in an [`executor::ExecutorRegistry`]. A
//! [`graph::GraphRewriter`] then replaces every high-level node that some rule's checker
//! admits, optionally building the joint forward/backward graph, and
//! [`graph::execute`] runs the result.

pub mod env;
pub mod error;
pub mod executor;
pub mod graph;
pub mod ops;
pub mod tensor;

pub use error::{ContractViolation, RegistryError, SignatureError};
pub use executor::{
    checker_fn, CapabilityChecker, ExecutorNamespace, ExecutorRegistry, ExecutorRegistryHandle,
    SubstitutionOverrides, SubstitutionPolicy, SubstitutionRule,
};
pub use graph::{execute, GraphRewriter, RewriteOptions, Trace, Tracer};
pub use ops::{transform_fn, AttrKind, AttrValue, Attrs, HighLevelOp, OpArgs, OperatorHandle, Signature};
pub use tensor::{
    DType, Device, DeviceKind, Shape, SymbolId, SymbolicTensor, Tensor, TensorMeta, TraceId,
};
