//! Host-backed tensor used as the concrete value flowing through executed traces.

use std::sync::Arc;

use anyhow::{bail, ensure, Result};
use rand::Rng;

use super::{DType, Device, Shape, TensorMeta};

/// Dense or strided host tensor.
///
/// The payload is always stored as `f32`; values are rounded to the tensor's dtype on
/// construction. Views created by [`Tensor::narrow`] share storage and may be
/// non-contiguous until [`Tensor::contiguous`] materialises them.
#[derive(Debug, Clone)]
pub struct Tensor {
    shape: Shape,
    dtype: DType,
    device: Device,
    data: Arc<[f32]>,
    strides: Vec<usize>,
    offset: usize,
}

impl Tensor {
    /// Constructs an `F32` host tensor from raw values, validating the length against the shape.
    pub fn from_vec(shape: Shape, data: Vec<f32>) -> Result<Self> {
        Self::from_meta(TensorMeta::new(shape, DType::F32, Device::cpu()), data)
    }

    /// Constructs a tensor described by `meta`, rounding every value to `meta.dtype`.
    pub fn from_meta(meta: TensorMeta, mut data: Vec<f32>) -> Result<Self> {
        if data.len() != meta.shape.num_elements() {
            bail!(
                "tensor data length ({}) does not match shape {:?}",
                data.len(),
                meta.shape.dims()
            );
        }
        if meta.dtype != DType::F32 {
            for value in data.iter_mut() {
                *value = meta.dtype.round(*value);
            }
        }
        let strides = meta.shape.contiguous_strides();
        Ok(Tensor {
            shape: meta.shape,
            dtype: meta.dtype,
            device: meta.device,
            data: Arc::from(data),
            strides,
            offset: 0,
        })
    }

    /// Returns a zero-initialised tensor matching `meta`.
    pub fn zeros(meta: &TensorMeta) -> Self {
        Self::full(meta, 0.0)
    }

    /// Returns a tensor matching `meta` with every element set to `value`.
    pub fn full(meta: &TensorMeta, value: f32) -> Self {
        let len = meta.shape.num_elements();
        Tensor {
            shape: meta.shape.clone(),
            dtype: meta.dtype,
            device: meta.device,
            data: Arc::from(vec![meta.dtype.round(value); len]),
            strides: meta.shape.contiguous_strides(),
            offset: 0,
        }
    }

    /// Samples from a normal distribution (`N(0, std^2)`) using the Box-Muller transform.
    pub fn randn(meta: &TensorMeta, std: f32, rng: &mut impl Rng) -> Self {
        let len = meta.shape.num_elements();
        let mut values = Vec::with_capacity(len);
        while values.len() < len {
            let u1: f32 = rng.gen::<f32>().max(f32::MIN_POSITIVE);
            let u2: f32 = rng.gen::<f32>();
            let r = (-2.0 * u1.ln()).sqrt();
            let theta = 2.0 * std::f32::consts::PI * u2;
            values.push(meta.dtype.round(r * theta.cos() * std));
            if values.len() < len {
                values.push(meta.dtype.round(r * theta.sin() * std));
            }
        }
        Tensor {
            shape: meta.shape.clone(),
            dtype: meta.dtype,
            device: meta.device,
            data: Arc::from(values),
            strides: meta.shape.contiguous_strides(),
            offset: 0,
        }
    }

    /// Returns the total number of elements stored in the tensor.
    pub fn len(&self) -> usize {
        self.shape.num_elements()
    }

    /// Reports whether the tensor contains zero elements.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Provides access to the tensor shape.
    pub fn shape(&self) -> &Shape {
        &self.shape
    }

    /// Returns the scalar dtype of the tensor payload.
    pub fn dtype(&self) -> DType {
        self.dtype
    }

    pub fn device(&self) -> Device {
        self.device
    }

    /// Shape, dtype, and device of this tensor as a symbolic descriptor.
    pub fn meta(&self) -> TensorMeta {
        TensorMeta::new(self.shape.clone(), self.dtype, self.device)
    }

    pub fn strides(&self) -> &[usize] {
        &self.strides
    }

    /// Whether elements are laid out densely in row-major order. Unit axes are ignored.
    pub fn is_contiguous(&self) -> bool {
        let expected = self.shape.contiguous_strides();
        self.shape
            .dims()
            .iter()
            .zip(self.strides.iter().zip(expected.iter()))
            .all(|(&dim, (&actual, &dense))| dim == 1 || actual == dense)
    }

    /// Borrows the dense payload, panicking if the tensor is a non-contiguous view.
    pub fn data(&self) -> &[f32] {
        assert!(
            self.is_contiguous(),
            "tensor data is not contiguous; call contiguous() first"
        );
        &self.data[self.offset..self.offset + self.len()]
    }

    /// Copies the elements out in logical row-major order, honouring strides.
    pub fn to_vec(&self) -> Vec<f32> {
        if self.is_contiguous() {
            return self.data().to_vec();
        }
        let dims = self.shape.dims();
        let mut out = Vec::with_capacity(self.len());
        let mut index = vec![0usize; dims.len()];
        for _ in 0..self.len() {
            let position: usize = self.offset
                + index
                    .iter()
                    .zip(self.strides.iter())
                    .map(|(i, s)| i * s)
                    .sum::<usize>();
            out.push(self.data[position]);
            for axis in (0..dims.len()).rev() {
                index[axis] += 1;
                if index[axis] < dims[axis] {
                    break;
                }
                index[axis] = 0;
            }
        }
        out
    }

    /// Returns a densely laid out tensor, copying only when `self` is a strided view.
    pub fn contiguous(&self) -> Tensor {
        if self.is_contiguous() && self.offset == 0 && self.data.len() == self.len() {
            return self.clone();
        }
        Tensor {
            shape: self.shape.clone(),
            dtype: self.dtype,
            device: self.device,
            data: Arc::from(self.to_vec()),
            strides: self.shape.contiguous_strides(),
            offset: 0,
        }
    }

    /// Restricts `axis` to `start..start + len` without copying.
    pub fn narrow(&self, axis: usize, start: usize, len: usize) -> Result<Tensor> {
        ensure!(
            axis < self.shape.rank(),
            "narrow axis {} out of range for rank {}",
            axis,
            self.shape.rank()
        );
        let extent = self.shape.dims()[axis];
        ensure!(
            start + len <= extent,
            "narrow range {}..{} exceeds dimension {} of size {}",
            start,
            start + len,
            axis,
            extent
        );
        let mut dims = self.shape.dims().to_vec();
        dims[axis] = len;
        Ok(Tensor {
            shape: Shape::new(dims),
            dtype: self.dtype,
            device: self.device,
            data: Arc::clone(&self.data),
            strides: self.strides.clone(),
            offset: self.offset + start * self.strides[axis],
        })
    }

    /// Elementwise sum of two tensors with identical metadata.
    pub fn add(&self, rhs: &Tensor) -> Result<Tensor> {
        ensure!(
            self.meta() == rhs.meta(),
            "add operands must share metadata: {} vs {}",
            self.meta(),
            rhs.meta()
        );
        let lhs = self.to_vec();
        let rhs = rhs.to_vec();
        let summed = lhs.iter().zip(rhs.iter()).map(|(a, b)| a + b).collect();
        Tensor::from_meta(self.meta(), summed)
    }

    /// Largest absolute elementwise difference, used for numerical comparisons.
    pub fn max_abs_diff(&self, rhs: &Tensor) -> Result<f32> {
        ensure!(
            self.shape == rhs.shape,
            "cannot compare tensors of shape {} and {}",
            self.shape,
            rhs.shape
        );
        let lhs = self.to_vec();
        let rhs = rhs.to_vec();
        Ok(lhs
            .iter()
            .zip(rhs.iter())
            .map(|(a, b)| (a - b).abs())
            .fold(0.0f32, f32::max))
    }
}
