//! Symbolic tensor descriptors used while tracing.
//!
//! A [`TensorMeta`] is an abstract value: it carries shape, dtype, and device but never data.
//! The tracer binds metas to trace-local [`SymbolId`]s, producing [`SymbolicTensor`]s that
//! operators, checkers, and transforms reason about at trace time.

use std::sync::atomic::{AtomicU64, Ordering};

use super::{DType, Device, Shape};

/// Shape, dtype, and placement of a tensor without its payload.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TensorMeta {
    pub shape: Shape,
    pub dtype: DType,
    pub device: Device,
}

impl TensorMeta {
    pub fn new(shape: Shape, dtype: DType, device: Device) -> Self {
        Self {
            shape,
            dtype,
            device,
        }
    }

    /// Same dtype and device as `self`, with a different shape.
    pub fn with_shape(&self, shape: Shape) -> Self {
        Self {
            shape,
            dtype: self.dtype,
            device: self.device,
        }
    }

    pub fn rank(&self) -> usize {
        self.shape.rank()
    }

    pub fn last_dim(&self) -> usize {
        self.shape.last_dim()
    }
}

impl std::fmt::Display for TensorMeta {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}{}@{}", self.dtype, self.shape, self.device)
    }
}

/// Trace-local identifier of a symbolic value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SymbolId(pub u32);

impl SymbolId {
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

impl std::fmt::Display for SymbolId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "%{}", self.0)
    }
}

static NEXT_TRACE_ID: AtomicU64 = AtomicU64::new(1);

/// Process-unique identity of the tracer that created a symbol.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TraceId(u64);

impl TraceId {
    pub(crate) fn next() -> Self {
        TraceId(NEXT_TRACE_ID.fetch_add(1, Ordering::Relaxed))
    }
}

/// A [`TensorMeta`] bound to a symbol in a trace. Immutable once created.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SymbolicTensor {
    trace: TraceId,
    id: SymbolId,
    meta: TensorMeta,
}

impl SymbolicTensor {
    pub(crate) fn new(trace: TraceId, id: SymbolId, meta: TensorMeta) -> Self {
        Self { trace, id, meta }
    }

    /// The tracer this symbol belongs to.
    pub fn trace(&self) -> TraceId {
        self.trace
    }

    pub fn id(&self) -> SymbolId {
        self.id
    }

    pub fn meta(&self) -> &TensorMeta {
        &self.meta
    }

    pub fn shape(&self) -> &Shape {
        &self.meta.shape
    }

    pub fn dtype(&self) -> DType {
        self.meta.dtype
    }

    pub fn device(&self) -> Device {
        self.meta.device
    }
}
