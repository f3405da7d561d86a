//! Scaled dot-product attention: the generic operator executors specialise.
//!
//! Layout is `[..., seq, head_dim]` for query, key, and value, with any number of leading batch
//! axes that must agree across the three. An additive mask broadcasts against
//! `[..., seq_q, seq_k]`. Causal masking is aligned to the top-left corner: query row `i` sees
//! key columns `0..=i`.
//!
//! The reference implementation computes in `f32` and rounds the result to the input dtype. It
//! is the fallback whenever no executor admits a call, and `sdpa_backward` is its gradient.

use std::sync::OnceLock;

use anyhow::{bail, ensure, Result};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use super::attrs::{AttrKind, AttrValue, Attrs};
use super::common::{ensure_dim_matches, ensure_same_device, ensure_same_dtype};
use super::high_level::{transform_fn, HighLevelOp};
use super::prims::single;
use super::registry::{OperatorHandle, OperatorSpec};
use super::signature::{OpArgs, Signature};
use super::CORE_NAMESPACE;
use crate::graph::trace::Tracer;
use crate::tensor::{Shape, SymbolicTensor, Tensor, TensorMeta};

static SDPA: OnceLock<HighLevelOp> = OnceLock::new();
static SDPA_BACKWARD: OnceLock<OperatorHandle> = OnceLock::new();

/// Static arguments of an attention call.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct AttentionOptions {
    pub dropout_p: f64,
    pub is_causal: bool,
    /// Softmax scale; `None` means `1 / sqrt(head_dim)`.
    pub scale: Option<f64>,
    /// Seed for the dropout mask.
    pub seed: i64,
}

impl AttentionOptions {
    pub fn causal() -> Self {
        Self {
            is_causal: true,
            ..Self::default()
        }
    }

    pub fn to_attrs(&self) -> Attrs {
        Attrs::new()
            .with("dropout_p", self.dropout_p)
            .with("is_causal", self.is_causal)
            .with("scale", self.scale)
            .with("seed", self.seed)
    }
}

fn attention_signature() -> Signature {
    Signature::new()
        .tensor("query")
        .tensor("key")
        .tensor("value")
        .optional_tensor("attn_mask")
        .attr("dropout_p", AttrKind::Float, AttrValue::Float(0.0))
        .attr("is_causal", AttrKind::Bool, AttrValue::Bool(false))
        .attr("scale", AttrKind::OptionalFloat, AttrValue::None)
        .attr("seed", AttrKind::Int, AttrValue::Int(0))
}

/// The high-level attention operator.
pub fn scaled_dot_product_attention_op() -> &'static HighLevelOp {
    SDPA.get_or_init(|| {
        let operator = OperatorHandle::new(OperatorSpec::new(
            CORE_NAMESPACE,
            "scaled_dot_product_attention",
            attention_signature(),
            |args| Ok(vec![infer_attention(args)?]),
            |args| {
                let problem = Problem::from_args(args)?;
                let probs = problem.probabilities(args)?;
                let weights = problem.apply_dropout(&probs);
                let value = args.tensor(2)?.data();
                let mut out = vec![0.0f32; problem.batch * problem.lq * problem.dv];
                for b in 0..problem.batch {
                    for i in 0..problem.lq {
                        let row = &weights[(b * problem.lq + i) * problem.lk..][..problem.lk];
                        let dst = &mut out[(b * problem.lq + i) * problem.dv..][..problem.dv];
                        for (j, &w) in row.iter().enumerate() {
                            if w == 0.0 {
                                continue;
                            }
                            let src = &value[(b * problem.lk + j) * problem.dv..][..problem.dv];
                            for (o, &x) in dst.iter_mut().zip(src) {
                                *o += w * x;
                            }
                        }
                    }
                }
                let query = args.tensor(0)?.meta();
                let out_meta = query.with_shape(query.shape.with_last_dim(problem.dv));
                Ok(vec![Tensor::from_meta(out_meta, out)?])
            },
        ));
        HighLevelOp::new(operator, Some(transform_fn(attention_grad)))
    })
}

/// Reference backward kernel: `(grad_out, query, key, value, attn_mask?) -> (dq, dk, dv)`.
///
/// The mask is treated as a constant and receives no gradient.
pub fn sdpa_backward_op() -> &'static OperatorHandle {
    SDPA_BACKWARD.get_or_init(|| {
        let signature = Signature::new()
            .tensor("grad_out")
            .tensor("query")
            .tensor("key")
            .tensor("value")
            .optional_tensor("attn_mask")
            .attr("dropout_p", AttrKind::Float, AttrValue::Float(0.0))
            .attr("is_causal", AttrKind::Bool, AttrValue::Bool(false))
            .attr("scale", AttrKind::OptionalFloat, AttrValue::None)
            .attr("seed", AttrKind::Int, AttrValue::Int(0));
        OperatorHandle::new(OperatorSpec::new(
            CORE_NAMESPACE,
            "sdpa_backward",
            signature,
            |args| {
                let grad_out = args.tensor(0)?;
                let forward = [
                    Some(args.tensor(1)?.clone()),
                    Some(args.tensor(2)?.clone()),
                    Some(args.tensor(3)?.clone()),
                    args.optional(4).cloned(),
                ];
                let out = infer_attention(&OpArgs::new(args.op_name(), &forward, args.attrs()))?;
                ensure!(
                    *grad_out == out,
                    "grad_out {} does not match attention output {}",
                    grad_out,
                    out
                );
                Ok(vec![
                    args.tensor(1)?.clone(),
                    args.tensor(2)?.clone(),
                    args.tensor(3)?.clone(),
                ])
            },
            attention_backward,
        ))
    })
}

/// Traces an attention call as a high-level node.
pub fn attention(
    tracer: &mut Tracer,
    query: &SymbolicTensor,
    key: &SymbolicTensor,
    value: &SymbolicTensor,
    attn_mask: Option<&SymbolicTensor>,
    options: AttentionOptions,
) -> Result<SymbolicTensor> {
    single(scaled_dot_product_attention_op().call(
        tracer,
        &[Some(query), Some(key), Some(value), attn_mask],
        &options.to_attrs(),
    )?)
}

fn attention_grad(tracer: &mut Tracer, args: &OpArgs<'_, SymbolicTensor>) -> Result<Vec<SymbolicTensor>> {
    let inputs: Vec<Option<&SymbolicTensor>> = args.tensors().iter().map(Option::as_ref).collect();
    let out = single(scaled_dot_product_attention_op().call(tracer, &inputs, args.attrs())?)?;
    let incoming = tracer.incoming_gradient(&out)?;

    let mut backward_inputs = vec![Some(&incoming)];
    backward_inputs.extend(inputs.iter().copied());
    let grads = sdpa_backward_op().call(tracer, &backward_inputs, args.attrs())?;
    for (primal, grad) in inputs.iter().zip(grads.iter()) {
        if let Some(primal) = primal {
            tracer.accumulate_gradient(primal, grad)?;
        }
    }
    Ok(vec![out])
}

fn infer_attention(args: &OpArgs<'_, TensorMeta>) -> Result<TensorMeta> {
    let query = args.tensor(0)?;
    let key = args.tensor(1)?;
    let value = args.tensor(2)?;
    let rank = query.rank();
    ensure!(rank >= 2, "attention query must have rank >= 2, got {}", query.shape);
    ensure!(
        key.rank() == rank && value.rank() == rank,
        "attention query, key, and value must share rank: {} / {} / {}",
        query.shape,
        key.shape,
        value.shape
    );
    ensure!(query.dtype.is_float(), "attention requires a float dtype, got {}", query.dtype);
    ensure_same_dtype("query", query, "key", key)?;
    ensure_same_dtype("query", query, "value", value)?;
    ensure_same_device("query", query, "key", key)?;
    ensure_same_device("query", query, "value", value)?;
    ensure!(
        query.shape.dims()[..rank - 2] == key.shape.dims()[..rank - 2]
            && query.shape.dims()[..rank - 2] == value.shape.dims()[..rank - 2],
        "attention batch dims disagree: {} / {} / {}",
        query.shape,
        key.shape,
        value.shape
    );
    ensure_dim_matches("query", query, "key", key, rank - 1)?;
    ensure_dim_matches("key", key, "value", value, rank - 2)?;

    if let Some(mask) = args.optional(3) {
        ensure_same_device("query", query, "attn_mask", mask)?;
        ensure!(mask.dtype.is_float(), "attn_mask must be additive (float), got {}", mask.dtype);
        let target = scores_dims(query, key);
        broadcast_strides(mask.shape.dims(), &target)?;
    }

    let dropout_p = args.attrs().float("dropout_p")?;
    ensure!(
        (0.0..1.0).contains(&dropout_p),
        "dropout_p must be in [0, 1), got {}",
        dropout_p
    );

    Ok(query.with_shape(query.shape.with_last_dim(value.last_dim())))
}

/// `[..., seq_q, seq_k]`
fn scores_dims(query: &TensorMeta, key: &TensorMeta) -> Vec<usize> {
    let rank = query.rank();
    let mut dims = query.shape.dims()[..rank - 1].to_vec();
    dims.push(key.shape.dims()[rank - 2]);
    dims
}

/// Right-aligned broadcast strides of `source` against `target`; unit axes get stride zero.
fn broadcast_strides(source: &[usize], target: &[usize]) -> Result<Vec<usize>> {
    ensure!(
        source.len() <= target.len(),
        "cannot broadcast {:?} to {:?}",
        source,
        target
    );
    let dense = Shape::new(source.to_vec()).contiguous_strides();
    let pad = target.len() - source.len();
    let mut strides = vec![0usize; target.len()];
    for (axis, (&dim, &stride)) in source.iter().zip(dense.iter()).enumerate() {
        let extent = target[pad + axis];
        if dim == extent {
            strides[pad + axis] = stride;
        } else if dim != 1 {
            bail!("cannot broadcast {:?} to {:?}", source, target);
        }
    }
    Ok(strides)
}

/// Flattened view of one attention problem.
struct Problem {
    batch: usize,
    lq: usize,
    lk: usize,
    d: usize,
    dv: usize,
    scale: f32,
    causal: bool,
    dropout_p: f32,
    seed: u64,
}

impl Problem {
    fn from_args(args: &OpArgs<'_, Tensor>) -> Result<Self> {
        let query = args.tensor(0)?;
        let key = args.tensor(1)?;
        let value = args.tensor(2)?;
        let rank = query.shape().rank();
        let d = query.shape().last_dim();
        let attrs = args.attrs();
        Ok(Self {
            batch: query.shape().dims()[..rank - 2].iter().product(),
            lq: query.shape().dims()[rank - 2],
            lk: key.shape().dims()[rank - 2],
            d,
            dv: value.shape().last_dim(),
            scale: attrs
                .opt_float("scale")?
                .unwrap_or(1.0 / (d as f64).sqrt()) as f32,
            causal: attrs.bool("is_causal")?,
            dropout_p: attrs.float("dropout_p")? as f32,
            seed: attrs.int("seed")? as u64,
        })
    }

    /// Softmax probabilities, laid out `[batch, lq, lk]`, before dropout.
    fn probabilities(&self, args: &OpArgs<'_, Tensor>) -> Result<Vec<f32>> {
        let query = args.tensor(0)?;
        let key = args.tensor(1)?;
        let q = query.data();
        let k = key.data();
        let mask = match args.optional(3) {
            Some(mask) => {
                let target = scores_dims(&query.meta(), &key.meta());
                let strides = broadcast_strides(mask.shape().dims(), &target)?;
                Some(broadcast(mask.data(), &target, &strides))
            }
            None => None,
        };

        let mut probs = vec![0.0f32; self.batch * self.lq * self.lk];
        for b in 0..self.batch {
            for i in 0..self.lq {
                let row_offset = (b * self.lq + i) * self.lk;
                let q_row = &q[(b * self.lq + i) * self.d..][..self.d];
                let row = &mut probs[row_offset..][..self.lk];
                for (j, score) in row.iter_mut().enumerate() {
                    if self.causal && j > i {
                        *score = f32::NEG_INFINITY;
                        continue;
                    }
                    let k_row = &k[(b * self.lk + j) * self.d..][..self.d];
                    let dot: f32 = q_row.iter().zip(k_row).map(|(a, b)| a * b).sum();
                    *score = dot * self.scale;
                    if let Some(mask) = &mask {
                        *score += mask[row_offset + j];
                    }
                }
                softmax_in_place(row);
            }
        }
        Ok(probs)
    }

    /// Per-element dropout multipliers (`0` or `1 / (1 - p)`), or `None` when disabled.
    fn dropout_factors(&self) -> Option<Vec<f32>> {
        if self.dropout_p == 0.0 {
            return None;
        }
        let mut rng = StdRng::seed_from_u64(self.seed);
        let keep = 1.0 / (1.0 - self.dropout_p);
        Some(
            (0..self.batch * self.lq * self.lk)
                .map(|_| {
                    if rng.gen::<f32>() < self.dropout_p {
                        0.0
                    } else {
                        keep
                    }
                })
                .collect(),
        )
    }

    fn apply_dropout(&self, probs: &[f32]) -> Vec<f32> {
        match self.dropout_factors() {
            Some(factors) => probs.iter().zip(factors).map(|(p, f)| p * f).collect(),
            None => probs.to_vec(),
        }
    }
}

fn softmax_in_place(row: &mut [f32]) {
    let max = row.iter().copied().fold(f32::NEG_INFINITY, f32::max);
    if max == f32::NEG_INFINITY {
        row.iter_mut().for_each(|v| *v = 0.0);
        return;
    }
    let mut sum = 0.0f32;
    for v in row.iter_mut() {
        *v = (*v - max).exp();
        sum += *v;
    }
    row.iter_mut().for_each(|v| *v /= sum);
}

fn broadcast(data: &[f32], target: &[usize], strides: &[usize]) -> Vec<f32> {
    let len: usize = target.iter().product();
    let mut out = Vec::with_capacity(len);
    let mut index = vec![0usize; target.len()];
    for _ in 0..len {
        let offset: usize = index.iter().zip(strides).map(|(i, s)| i * s).sum();
        out.push(data[offset]);
        for axis in (0..target.len()).rev() {
            index[axis] += 1;
            if index[axis] < target[axis] {
                break;
            }
            index[axis] = 0;
        }
    }
    out
}

fn attention_backward(args: &OpArgs<'_, Tensor>) -> Result<Vec<Tensor>> {
    let forward = [
        args.optional(1).cloned(),
        args.optional(2).cloned(),
        args.optional(3).cloned(),
        args.optional(4).cloned(),
    ];
    let forward_args = OpArgs::new(args.op_name(), &forward, args.attrs());
    let problem = Problem::from_args(&forward_args)?;
    let probs = problem.probabilities(&forward_args)?;
    let factors = problem.dropout_factors();

    let grad_out = args.tensor(0)?.data();
    let q = args.tensor(1)?.data();
    let k = args.tensor(2)?.data();
    let v = args.tensor(3)?.data();
    let Problem {
        batch,
        lq,
        lk,
        d,
        dv,
        scale,
        ..
    } = problem;

    let mut dq = vec![0.0f32; batch * lq * d];
    let mut dk = vec![0.0f32; batch * lk * d];
    let mut dvalue = vec![0.0f32; batch * lk * dv];
    let mut d_weights = vec![0.0f32; lk];
    for b in 0..batch {
        for i in 0..lq {
            let offset = (b * lq + i) * lk;
            let p_row = &probs[offset..][..lk];
            let go = &grad_out[(b * lq + i) * dv..][..dv];
            for j in 0..lk {
                let factor = factors.as_ref().map_or(1.0, |f| f[offset + j]);
                let weight = p_row[j] * factor;
                let v_row = &v[(b * lk + j) * dv..][..dv];
                let dv_row = &mut dvalue[(b * lk + j) * dv..][..dv];
                let mut dot = 0.0f32;
                for c in 0..dv {
                    dv_row[c] += weight * go[c];
                    dot += go[c] * v_row[c];
                }
                d_weights[j] = dot * factor;
            }
            let row_dot: f32 = p_row.iter().zip(&d_weights).map(|(p, g)| p * g).sum();
            let q_row = &q[(b * lq + i) * d..][..d];
            for j in 0..lk {
                let ds = p_row[j] * (d_weights[j] - row_dot) * scale;
                if ds == 0.0 {
                    continue;
                }
                let k_row = &k[(b * lk + j) * d..][..d];
                let dq_row = &mut dq[(b * lq + i) * d..][..d];
                for c in 0..d {
                    dq_row[c] += ds * k_row[c];
                }
                let dk_row = &mut dk[(b * lk + j) * d..][..d];
                for c in 0..d {
                    dk_row[c] += ds * q_row[c];
                }
            }
        }
    }

    Ok(vec![
        Tensor::from_meta(args.tensor(1)?.meta(), dq)?,
        Tensor::from_meta(args.tensor(2)?.meta(), dk)?,
        Tensor::from_meta(args.tensor(3)?.meta(), dvalue)?,
    ])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mask_broadcasts_over_leading_axes() {
        let strides = broadcast_strides(&[1, 3, 4], &[2, 2, 3, 4]).unwrap();
        assert_eq!(strides, vec![0, 0, 4, 1]);
        assert!(broadcast_strides(&[2, 3, 4], &[2, 2, 3, 5]).is_err());
    }

    #[test]
    fn fully_masked_row_softmax_is_zero() {
        let mut row = [f32::NEG_INFINITY; 3];
        softmax_in_place(&mut row);
        assert_eq!(row, [0.0; 3]);

        let mut row = [0.0f32, 0.0];
        softmax_in_place(&mut row);
        assert_eq!(row, [0.5, 0.5]);
    }
}
