//! The fused attention kernel interface and a host reference implementation.
//!
//! Tensors use the `[batch, heads, seq, head_dim]` layout. The forward pass returns the
//! attention output plus the per-row log-sum-exp of the scaled scores (`[batch, heads, seq_q]`,
//! `f32`), which the backward pass uses to recompute probabilities without storing them.
//! Backward gradients may come back with their head dimension padded; callers narrow them.

use anyhow::{ensure, Result};
use opswap::{DType, DeviceKind, Shape, Tensor, TensorMeta};

use crate::config::FlashConfig;

/// Output of a fused forward pass.
#[derive(Debug, Clone)]
pub struct FlashForward {
    pub primary: Tensor,
    /// Softmax log-sum-exp per query row.
    pub auxiliary: Tensor,
}

/// Gradients of a fused backward pass, possibly padded along the head dimension.
#[derive(Debug, Clone)]
pub struct FlashGradients {
    pub dq: Tensor,
    pub dk: Tensor,
    pub dv: Tensor,
}

/// A fused attention kernel. Inputs are contiguous rank-4 tensors.
pub trait FlashKernel: Send + Sync {
    fn name(&self) -> &str;

    /// Whether the kernel can run on this host.
    fn probe(&self) -> bool;

    fn device_kind(&self) -> DeviceKind;

    fn forward(&self, q: &Tensor, k: &Tensor, v: &Tensor, scale: f32, causal: bool) -> Result<FlashForward>;

    #[allow(clippy::too_many_arguments)]
    fn backward(
        &self,
        d_out: &Tensor,
        q: &Tensor,
        k: &Tensor,
        v: &Tensor,
        out: &Tensor,
        lse: &Tensor,
        scale: f32,
        causal: bool,
    ) -> Result<FlashGradients>;
}

const DEFAULT_BLOCK_SIZE: usize = 64;

/// Blockwise online-softmax attention on host tensors, tagged as running on `device_kind`.
#[derive(Debug, Clone)]
pub struct ReferenceFlashKernel {
    block_size: usize,
    head_dim_alignment: usize,
    device_kind: DeviceKind,
}

impl ReferenceFlashKernel {
    pub fn new(config: &FlashConfig) -> Self {
        Self {
            block_size: DEFAULT_BLOCK_SIZE,
            head_dim_alignment: config.head_dim_alignment.max(1),
            device_kind: config.device_kind,
        }
    }

    pub fn with_block_size(mut self, block_size: usize) -> Self {
        self.block_size = block_size.max(1);
        self
    }

    fn padded(&self, dim: usize) -> usize {
        dim.div_ceil(self.head_dim_alignment) * self.head_dim_alignment
    }
}

impl Default for ReferenceFlashKernel {
    fn default() -> Self {
        Self::new(&FlashConfig::default())
    }
}

/// `[batch * heads, seq, dim]` view of a rank-4 tensor.
struct Layout {
    bh: usize,
    lq: usize,
    lk: usize,
    d: usize,
    dv: usize,
}

impl Layout {
    fn new(q: &Tensor, k: &Tensor, v: &Tensor) -> Result<Self> {
        for (name, tensor) in [("q", q), ("k", k), ("v", v)] {
            ensure!(
                tensor.shape().rank() == 4,
                "fused attention expects rank-4 {}, got {}",
                name,
                tensor.shape()
            );
            ensure!(tensor.is_contiguous(), "fused attention expects contiguous {}", name);
        }
        let qd = q.shape().dims();
        let kd = k.shape().dims();
        let vd = v.shape().dims();
        ensure!(
            qd[..2] == kd[..2] && qd[..2] == vd[..2],
            "batch/head dims disagree: {} / {} / {}",
            q.shape(),
            k.shape(),
            v.shape()
        );
        ensure!(qd[3] == kd[3], "q and k head dims disagree: {} / {}", q.shape(), k.shape());
        ensure!(kd[2] == vd[2], "k and v lengths disagree: {} / {}", k.shape(), v.shape());
        Ok(Self {
            bh: qd[0] * qd[1],
            lq: qd[2],
            lk: kd[2],
            d: qd[3],
            dv: vd[3],
        })
    }

    /// Number of visible keys for query row `i`; causal masking is top-left aligned.
    fn visible(&self, i: usize, causal: bool) -> usize {
        if causal {
            (i + 1).min(self.lk)
        } else {
            self.lk
        }
    }
}

fn dot(a: &[f32], b: &[f32]) -> f32 {
    a.iter().zip(b).map(|(x, y)| x * y).sum()
}

impl FlashKernel for ReferenceFlashKernel {
    fn name(&self) -> &str {
        "reference-flash"
    }

    fn probe(&self) -> bool {
        true
    }

    fn device_kind(&self) -> DeviceKind {
        self.device_kind
    }

    fn forward(&self, q: &Tensor, k: &Tensor, v: &Tensor, scale: f32, causal: bool) -> Result<FlashForward> {
        let layout = Layout::new(q, k, v)?;
        let (qs, ks, vs) = (q.data(), k.data(), v.data());
        let Layout { bh, lq, lk, d, dv } = layout;

        let mut out = vec![0.0f32; bh * lq * dv];
        let mut lse = vec![f32::NEG_INFINITY; bh * lq];
        let mut scores = Vec::with_capacity(self.block_size);
        for b in 0..bh {
            for i in 0..lq {
                let q_row = &qs[(b * lq + i) * d..][..d];
                let acc = &mut out[(b * lq + i) * dv..][..dv];
                let limit = layout.visible(i, causal);
                let mut running_max = f32::NEG_INFINITY;
                let mut running_sum = 0.0f32;
                for start in (0..limit).step_by(self.block_size) {
                    let end = (start + self.block_size).min(limit);
                    scores.clear();
                    scores.extend(
                        (start..end).map(|j| scale * dot(q_row, &ks[(b * lk + j) * d..][..d])),
                    );
                    let block_max = scores.iter().copied().fold(f32::NEG_INFINITY, f32::max);
                    let new_max = running_max.max(block_max);
                    let correction = (running_max - new_max).exp();
                    running_sum *= correction;
                    acc.iter_mut().for_each(|a| *a *= correction);
                    for (offset, &s) in scores.iter().enumerate() {
                        let p = (s - new_max).exp();
                        running_sum += p;
                        let v_row = &vs[(b * lk + start + offset) * dv..][..dv];
                        for (a, &x) in acc.iter_mut().zip(v_row) {
                            *a += p * x;
                        }
                    }
                    running_max = new_max;
                }
                if running_sum > 0.0 {
                    acc.iter_mut().for_each(|a| *a /= running_sum);
                    lse[b * lq + i] = running_max + running_sum.ln();
                }
            }
        }

        let dims = q.shape().dims();
        let out_meta = q.meta().with_shape(q.shape().with_last_dim(dv));
        let lse_meta = TensorMeta::new(Shape::new(dims[..3].to_vec()), DType::F32, q.device());
        Ok(FlashForward {
            primary: Tensor::from_meta(out_meta, out)?,
            auxiliary: Tensor::from_meta(lse_meta, lse)?,
        })
    }

    fn backward(
        &self,
        d_out: &Tensor,
        q: &Tensor,
        k: &Tensor,
        v: &Tensor,
        out: &Tensor,
        lse: &Tensor,
        scale: f32,
        causal: bool,
    ) -> Result<FlashGradients> {
        let layout = Layout::new(q, k, v)?;
        let Layout { bh, lq, lk, d, dv } = layout;
        ensure!(
            d_out.shape() == out.shape() && out.shape().num_elements() == bh * lq * dv,
            "d_out {} and out {} must match the attention output",
            d_out.shape(),
            out.shape()
        );
        ensure!(
            lse.len() == bh * lq,
            "lse has {} elements, expected {}",
            lse.len(),
            bh * lq
        );
        ensure!(d_out.is_contiguous() && out.is_contiguous() && lse.is_contiguous());

        let (qs, ks, vs) = (q.data(), k.data(), v.data());
        let (dos, os, lses) = (d_out.data(), out.data(), lse.data());
        let (pd, pdv) = (self.padded(d), self.padded(dv));

        let mut dq = vec![0.0f32; bh * lq * pd];
        let mut dk = vec![0.0f32; bh * lk * pd];
        let mut dvs = vec![0.0f32; bh * lk * pdv];
        for b in 0..bh {
            for i in 0..lq {
                let row = b * lq + i;
                let q_row = &qs[row * d..][..d];
                let do_row = &dos[row * dv..][..dv];
                let delta = dot(do_row, &os[row * dv..][..dv]);
                let row_lse = lses[row];
                if row_lse == f32::NEG_INFINITY {
                    continue;
                }
                for j in 0..layout.visible(i, causal) {
                    let col = b * lk + j;
                    let k_row = &ks[col * d..][..d];
                    let v_row = &vs[col * dv..][..dv];
                    let p = (scale * dot(q_row, k_row) - row_lse).exp();

                    let dv_row = &mut dvs[col * pdv..][..dv];
                    for (g, &x) in dv_row.iter_mut().zip(do_row) {
                        *g += p * x;
                    }

                    let ds = p * (dot(do_row, v_row) - delta) * scale;
                    let dq_row = &mut dq[row * pd..][..d];
                    for (g, &x) in dq_row.iter_mut().zip(k_row) {
                        *g += ds * x;
                    }
                    let dk_row = &mut dk[col * pd..][..d];
                    for (g, &x) in dk_row.iter_mut().zip(q_row) {
                        *g += ds * x;
                    }
                }
            }
        }

        let padded = |tensor: &Tensor, dim: usize| tensor.meta().with_shape(tensor.shape().with_last_dim(dim));
        Ok(FlashGradients {
            dq: Tensor::from_meta(padded(q, pd), dq)?,
            dk: Tensor::from_meta(padded(k, pd), dk)?,
            dv: Tensor::from_meta(padded(v, pdv), dvs)?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use opswap::Device;

    fn meta(dims: [usize; 4]) -> TensorMeta {
        TensorMeta::new(Shape::new(dims.to_vec()), DType::F32, Device::cuda(0))
    }

    fn ramp(dims: [usize; 4], step: f32) -> Tensor {
        let meta = meta(dims);
        let values = (0..meta.shape.num_elements())
            .map(|i| ((i % 7) as f32 - 3.0) * step)
            .collect();
        Tensor::from_meta(meta, values).unwrap()
    }

    #[test]
    fn block_size_does_not_change_the_result() {
        let q = ramp([1, 2, 5, 8], 0.1);
        let k = ramp([1, 2, 5, 8], 0.2);
        let v = ramp([1, 2, 5, 8], 0.3);
        let whole = ReferenceFlashKernel::default().with_block_size(64);
        let tiled = ReferenceFlashKernel::default().with_block_size(2);
        for causal in [false, true] {
            let a = whole.forward(&q, &k, &v, 0.5, causal).unwrap();
            let b = tiled.forward(&q, &k, &v, 0.5, causal).unwrap();
            assert!(a.primary.max_abs_diff(&b.primary).unwrap() < 1e-5);
            assert!(a.auxiliary.max_abs_diff(&b.auxiliary).unwrap() < 1e-5);
        }
    }

    #[test]
    fn first_causal_row_copies_first_value() {
        let q = ramp([1, 1, 3, 4], 0.1);
        let k = ramp([1, 1, 3, 4], 0.2);
        let v = ramp([1, 1, 3, 4], 0.3);
        let out = ReferenceFlashKernel::default()
            .forward(&q, &k, &v, 1.0, true)
            .unwrap();
        assert_eq!(out.auxiliary.shape().dims(), &[1, 1, 3]);
        assert_eq!(&out.primary.to_vec()[..4], &v.to_vec()[..4]);
    }

    #[test]
    fn gradients_are_padded_to_the_alignment() {
        let config = FlashConfig {
            head_dim_alignment: 8,
            ..FlashConfig::default()
        };
        let kernel = ReferenceFlashKernel::new(&config);
        let q = ramp([1, 1, 3, 6], 0.1);
        let k = ramp([1, 1, 3, 6], 0.2);
        let v = ramp([1, 1, 3, 6], 0.3);
        let fwd = kernel.forward(&q, &k, &v, 0.4, false).unwrap();
        let grads = kernel
            .backward(&fwd.primary, &q, &k, &v, &fwd.primary, &fwd.auxiliary, 0.4, false)
            .unwrap();
        assert_eq!(grads.dq.shape().dims(), &[1, 1, 3, 8]);
        assert_eq!(grads.dk.shape().dims(), &[1, 1, 3, 8]);
        assert_eq!(grads.dv.shape().dims(), &[1, 1, 3, 8]);
        let dq = grads.dq.to_vec();
        assert!(dq.chunks(8).all(|row| row[6..] == [0.0, 0.0]));
    }
}
