//! Operator declarations: signatures, the meta/impl registry, high-level operators, and the
//! built-in `core` operators.

pub mod attention;
pub mod attrs;
pub mod common;
pub mod high_level;
pub mod prims;
pub mod registry;
pub mod signature;

pub use attention::{attention, scaled_dot_product_attention_op, sdpa_backward_op, AttentionOptions};
pub use attrs::{AttrKind, AttrValue, Attrs};
pub use high_level::{transform_fn, HighLevelOp, TransformFn};
pub use prims::{add, add_op, zeros_like, zeros_like_op};
pub use registry::{ImplFn, MetaFn, OperatorHandle, OperatorId, OperatorSpec};
pub use signature::{AttrParam, OpArgs, Signature, TensorParam};

/// Namespace that owns the built-in operators.
pub const CORE_NAMESPACE: &str = "core";
