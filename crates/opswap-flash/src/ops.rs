//! `flash_fwd` and `flash_bwd`: the executor's operators wrapping a [`FlashKernel`].

use std::sync::Arc;

use anyhow::{ensure, Result};
use opswap::ops::common::{
    ensure_dim_matches, ensure_rank, ensure_same_device, ensure_same_dtype,
};
use opswap::{
    AttrKind, AttrValue, Attrs, ContractViolation, DType, ExecutorNamespace, OpArgs,
    OperatorHandle, RegistryError, Shape, Signature, Tensor, TensorMeta,
};

use crate::capability::FlashCapability;
use crate::kernel::FlashKernel;

/// Handles to the registered flash operators.
#[derive(Debug, Clone)]
pub struct FlashOperators {
    /// `(q, k, v) -> (out, softmax_lse)`
    pub forward: OperatorHandle,
    /// `(d_out, q, k, v, out, softmax_lse) -> (dq, dk, dv)`
    pub backward: OperatorHandle,
}

fn with_attention_attrs(signature: Signature) -> Signature {
    signature
        .attr("is_causal", AttrKind::Bool, AttrValue::Bool(false))
        .attr("scale", AttrKind::OptionalFloat, AttrValue::None)
}

pub(crate) fn attrs(is_causal: bool, scale: f64) -> Attrs {
    Attrs::new().with("is_causal", is_causal).with("scale", scale)
}

fn softmax_scale<T>(args: &OpArgs<'_, T>, head_dim: usize) -> Result<f32> {
    Ok(args
        .attrs()
        .opt_float("scale")?
        .unwrap_or(1.0 / (head_dim as f64).sqrt()) as f32)
}

fn require(capability: FlashCapability, kernel: &dyn FlashKernel) {
    if !capability.available() {
        panic!(
            "{}",
            ContractViolation::CapabilityUnavailable {
                kernel: kernel.name().to_string(),
            }
        );
    }
}

fn infer_forward(args: &OpArgs<'_, TensorMeta>) -> Result<Vec<TensorMeta>> {
    let q = args.tensor(0)?;
    let k = args.tensor(1)?;
    let v = args.tensor(2)?;
    for (name, meta) in [("q", q), ("k", k), ("v", v)] {
        ensure_rank(name, meta, 4)?;
    }
    ensure_same_dtype("q", q, "k", k)?;
    ensure_same_dtype("q", q, "v", v)?;
    ensure_same_device("q", q, "k", k)?;
    ensure_same_device("q", q, "v", v)?;
    for axis in 0..2 {
        ensure_dim_matches("q", q, "k", k, axis)?;
        ensure_dim_matches("q", q, "v", v, axis)?;
    }
    ensure_dim_matches("q", q, "k", k, 3)?;
    ensure_dim_matches("k", k, "v", v, 2)?;

    let out = q.with_shape(q.shape.with_last_dim(v.last_dim()));
    let lse = TensorMeta::new(Shape::new(q.shape.dims()[..3].to_vec()), DType::F32, q.device);
    Ok(vec![out, lse])
}

fn infer_backward(args: &OpArgs<'_, TensorMeta>) -> Result<Vec<TensorMeta>> {
    let d_out = args.tensor(0)?;
    let forward_inputs = [
        Some(args.tensor(1)?.clone()),
        Some(args.tensor(2)?.clone()),
        Some(args.tensor(3)?.clone()),
    ];
    let forward = infer_forward(&OpArgs::new(args.op_name(), &forward_inputs, args.attrs()))?;
    let out = args.tensor(4)?;
    let lse = args.tensor(5)?;
    ensure!(
        *out == forward[0] && *d_out == forward[0],
        "d_out {} and out {} must match the forward output {}",
        d_out,
        out,
        forward[0]
    );
    ensure!(
        *lse == forward[1],
        "softmax_lse {} must match {}",
        lse,
        forward[1]
    );
    Ok(vec![
        args.tensor(1)?.clone(),
        args.tensor(2)?.clone(),
        args.tensor(3)?.clone(),
    ])
}

/// Registers `flash_fwd` and `flash_bwd` in `namespace`.
///
/// Both implementations panic with [`ContractViolation::CapabilityUnavailable`] when the
/// kernel is unavailable: the checker rejects every call in that case, so reaching the kernel
/// means dispatch is broken.
pub fn register_operators(
    namespace: &mut ExecutorNamespace,
    kernel: Arc<dyn FlashKernel>,
    capability: FlashCapability,
) -> Result<FlashOperators, RegistryError> {
    let fwd_kernel = Arc::clone(&kernel);
    let forward = namespace.register_operator(
        "flash_fwd",
        with_attention_attrs(Signature::new().tensor("q").tensor("k").tensor("v")),
        infer_forward,
        move |args| {
            require(capability, fwd_kernel.as_ref());
            let q = args.tensor(0)?;
            let scale = softmax_scale(args, q.shape().last_dim())?;
            let causal = args.attrs().bool("is_causal")?;
            let result = fwd_kernel.forward(q, args.tensor(1)?, args.tensor(2)?, scale, causal)?;
            Ok(vec![result.primary, result.auxiliary])
        },
    )?;

    let bwd_kernel = kernel;
    let backward = namespace.register_operator(
        "flash_bwd",
        with_attention_attrs(
            Signature::new()
                .tensor("d_out")
                .tensor("q")
                .tensor("k")
                .tensor("v")
                .tensor("out")
                .tensor("softmax_lse"),
        ),
        infer_backward,
        move |args| {
            require(capability, bwd_kernel.as_ref());
            let q = args.tensor(1)?;
            let k = args.tensor(2)?;
            let v = args.tensor(3)?;
            let scale = softmax_scale(args, q.shape().last_dim())?;
            let causal = args.attrs().bool("is_causal")?;
            let grads = bwd_kernel.backward(
                args.tensor(0)?,
                q,
                k,
                v,
                args.tensor(4)?,
                args.tensor(5)?,
                scale,
                causal,
            )?;
            Ok(vec![
                unpad(grads.dq, q)?,
                unpad(grads.dk, k)?,
                unpad(grads.dv, v)?,
            ])
        },
    )?;

    Ok(FlashOperators { forward, backward })
}

/// Narrows a possibly padded gradient back to its input's head dim, densely laid out.
fn unpad(grad: Tensor, input: &Tensor) -> Result<Tensor> {
    let axis = input.shape().rank() - 1;
    let head_dim = input.shape().last_dim();
    if grad.shape().last_dim() == head_dim {
        return Ok(grad);
    }
    Ok(grad.narrow(axis, 0, head_dim)?.contiguous())
}
