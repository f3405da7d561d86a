//! Core tensor abstractions shared by tracing and execution.
//!
//! The module defines shapes, dtypes, and device tags, the symbolic descriptors the tracer
//! hands to operators and checkers, and the host tensor that concrete execution produces.

pub mod device;
pub mod dtype;
mod host_tensor;
pub mod shape;
pub mod symbolic;

pub use device::{Device, DeviceKind};
pub use dtype::DType;
pub use host_tensor::Tensor;
pub use shape::Shape;
pub use symbolic::{SymbolId, SymbolicTensor, TensorMeta, TraceId};
