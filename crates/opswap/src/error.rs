//! Typed failures surfaced by the substitution framework.
//!
//! Operator, transform, and execution code propagates `anyhow::Result`; the variants here
//! travel inside it and can be recovered with `downcast_ref` when a caller needs to react to a
//! specific failure.

use thiserror::Error;

use crate::ops::attrs::AttrKind;
use crate::tensor::TensorMeta;

/// Registration-time failures. Fatal: they surface immediately from the registering call.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum RegistryError {
    #[error("operator '{name}' is already registered in executor namespace '{namespace}'")]
    NameCollision { namespace: String, name: String },
    #[error("executor namespace '{name}' is already registered")]
    NamespaceCollision { name: String },
    #[error("unknown executor namespace '{name}'")]
    UnknownNamespace { name: String },
}

/// Static-argument and operand validation failures raised when an operator is invoked.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum SignatureError {
    #[error("{op}: unknown static argument '{attr}'")]
    UnknownAttr { op: String, attr: String },
    #[error("{op}: static argument '{attr}' expects {expected:?}, got {found:?}")]
    AttrKindMismatch {
        op: String,
        attr: String,
        expected: AttrKind,
        found: AttrKind,
    },
    #[error("{op}: missing required static argument '{attr}'")]
    MissingAttr { op: String, attr: String },
    #[error("{op}: expected {expected} tensor operands, got {found}")]
    TensorArity {
        op: String,
        expected: usize,
        found: usize,
    },
    #[error("{op}: required tensor operand '{name}' is absent")]
    MissingTensor { op: String, name: String },
}

/// Broken framework invariants. These indicate a defect upstream (a checker that admitted
/// something it should not have, or a meta function that disagrees with its implementation)
/// and are never silently recovered.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum ContractViolation {
    #[error(
        "{kernel} kernel is unavailable on this host; its checker must reject before dispatch"
    )]
    CapabilityUnavailable { kernel: String },
    #[error("operator '{op}' output {index} violates its meta contract: declared {expected}, produced {actual}")]
    ShapeContract {
        op: String,
        index: usize,
        expected: TensorMeta,
        actual: TensorMeta,
    },
    #[error("operator '{op}' declared {expected} outputs but produced {actual}")]
    OutputArity {
        op: String,
        expected: usize,
        actual: usize,
    },
    #[error("executor '{executor}' rewrote '{op}' into output {index} = {actual}, but the operator declares {expected}")]
    TransformMismatch {
        executor: String,
        op: String,
        index: usize,
        expected: String,
        actual: String,
    },
}
