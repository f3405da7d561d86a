//! Built-in primitives of the `core` namespace.
//!
//! `add` doubles as the accumulation operator used when several consumers contribute a
//! gradient to the same symbol, and `zeros_like` materialises gradients for symbols nothing
//! depends on.

use std::sync::OnceLock;

use anyhow::{anyhow, Result};

use super::attrs::Attrs;
use super::common::{ensure_same_device, ensure_same_dtype, ensure_shape_matches};
use super::high_level::{transform_fn, HighLevelOp};
use super::registry::{OperatorHandle, OperatorSpec};
use super::signature::Signature;
use super::CORE_NAMESPACE;
use crate::graph::trace::Tracer;
use crate::tensor::{SymbolicTensor, Tensor};

static ADD: OnceLock<HighLevelOp> = OnceLock::new();
static ZEROS_LIKE: OnceLock<OperatorHandle> = OnceLock::new();

/// Elementwise sum of two tensors with identical metadata.
pub fn add_op() -> &'static HighLevelOp {
    ADD.get_or_init(|| {
        let operator = OperatorHandle::new(OperatorSpec::new(
            CORE_NAMESPACE,
            "add",
            Signature::new().tensor("lhs").tensor("rhs"),
            |args| {
                let lhs = args.tensor(0)?;
                let rhs = args.tensor(1)?;
                ensure_shape_matches("add lhs", lhs, "rhs", rhs)?;
                ensure_same_dtype("add lhs", lhs, "rhs", rhs)?;
                ensure_same_device("add lhs", lhs, "rhs", rhs)?;
                Ok(vec![lhs.clone()])
            },
            |args| Ok(vec![args.tensor(0)?.add(args.tensor(1)?)?]),
        ));
        let grad = transform_fn(|tracer, args| {
            let lhs = args.tensor(0)?;
            let rhs = args.tensor(1)?;
            let out = add(tracer, lhs, rhs)?;
            let incoming = tracer.incoming_gradient(&out)?;
            tracer.accumulate_gradient(lhs, &incoming)?;
            tracer.accumulate_gradient(rhs, &incoming)?;
            Ok(vec![out])
        });
        HighLevelOp::new(operator, Some(grad))
    })
}

/// A zero tensor with the same metadata as its operand.
pub fn zeros_like_op() -> &'static OperatorHandle {
    ZEROS_LIKE.get_or_init(|| {
        OperatorHandle::new(OperatorSpec::new(
            CORE_NAMESPACE,
            "zeros_like",
            Signature::new().tensor("input"),
            |args| Ok(vec![args.tensor(0)?.clone()]),
            |args| Ok(vec![Tensor::zeros(&args.tensor(0)?.meta())]),
        ))
    })
}

/// Traces `lhs + rhs` as a high-level node.
pub fn add(tracer: &mut Tracer, lhs: &SymbolicTensor, rhs: &SymbolicTensor) -> Result<SymbolicTensor> {
    single(add_op().call(tracer, &[Some(lhs), Some(rhs)], &Attrs::new())?)
}

/// Traces a `zeros_like` kernel call.
pub fn zeros_like(tracer: &mut Tracer, input: &SymbolicTensor) -> Result<SymbolicTensor> {
    single(zeros_like_op().call(tracer, &[Some(input)], &Attrs::new())?)
}

pub(crate) fn single(outputs: Vec<SymbolicTensor>) -> Result<SymbolicTensor> {
    let mut outputs = outputs.into_iter();
    match (outputs.next(), outputs.next()) {
        (Some(out), None) => Ok(out),
        _ => Err(anyhow!("expected a single output")),
    }
}
