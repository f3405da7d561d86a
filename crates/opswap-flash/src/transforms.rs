//! Rewrites of `scaled_dot_product_attention` onto the flash operators.

use anyhow::{anyhow, Result};
use opswap::{transform_fn, ops::TransformFn, OpArgs, SymbolicTensor, Tracer};

use crate::ops::{attrs, FlashOperators};

/// Symbolic results of `flash_fwd`.
#[derive(Debug, Clone)]
pub struct FlashForwardSymbols {
    pub primary: SymbolicTensor,
    /// Softmax log-sum-exp, needed only by the backward pass.
    pub auxiliary: SymbolicTensor,
}

/// Static arguments of the attention call that the flash operators consume.
struct FlashCall<'a> {
    query: &'a SymbolicTensor,
    key: &'a SymbolicTensor,
    value: &'a SymbolicTensor,
    is_causal: bool,
    scale: f64,
}

impl<'a> FlashCall<'a> {
    fn from_args(args: &OpArgs<'a, SymbolicTensor>) -> Result<Self> {
        let query = args.tensor(0)?;
        let scale = args
            .attrs()
            .opt_float("scale")?
            .unwrap_or_else(|| 1.0 / (query.shape().last_dim() as f64).sqrt());
        Ok(Self {
            query,
            key: args.tensor(1)?,
            value: args.tensor(2)?,
            is_causal: args.attrs().bool("is_causal")?,
            scale,
        })
    }

    fn forward(&self, tracer: &mut Tracer, ops: &FlashOperators) -> Result<FlashForwardSymbols> {
        let mut outputs = ops
            .forward
            .call(
                tracer,
                &[Some(self.query), Some(self.key), Some(self.value)],
                &attrs(self.is_causal, self.scale),
            )?
            .into_iter();
        match (outputs.next(), outputs.next()) {
            (Some(primary), Some(auxiliary)) => Ok(FlashForwardSymbols { primary, auxiliary }),
            _ => Err(anyhow!("flash_fwd must produce (out, softmax_lse)")),
        }
    }
}

/// Attention → `flash_fwd`, returning only the attention output.
pub fn execution_transform(ops: FlashOperators) -> TransformFn {
    transform_fn(move |tracer, args| {
        let call = FlashCall::from_args(args)?;
        let forward = call.forward(tracer, &ops)?;
        Ok(vec![forward.primary])
    })
}

/// Attention → `flash_fwd` plus `flash_bwd`, accumulating gradients of query, key, and value.
pub fn gradient_transform(ops: FlashOperators) -> TransformFn {
    transform_fn(move |tracer, args| {
        let call = FlashCall::from_args(args)?;
        let forward = call.forward(tracer, &ops)?;
        let d_out = tracer.incoming_gradient(&forward.primary)?;
        let grads = ops.backward.call(
            tracer,
            &[
                Some(&d_out),
                Some(call.query),
                Some(call.key),
                Some(call.value),
                Some(&forward.primary),
                Some(&forward.auxiliary),
            ],
            &attrs(call.is_causal, call.scale),
        )?;
        let [dq, dk, dv]: [SymbolicTensor; 3] = grads
            .try_into()
            .map_err(|_| anyhow!("flash_bwd must produce (dq, dk, dv)"))?;
        tracer.accumulate_gradient(call.query, &dq)?;
        tracer.accumulate_gradient(call.key, &dk)?;
        tracer.accumulate_gradient(call.value, &dv)?;
        Ok(vec![forward.primary])
    })
}
