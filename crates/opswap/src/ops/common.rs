//! Validation helpers shared by meta functions.

use anyhow::{ensure, Result};

use crate::tensor::TensorMeta;

pub fn ensure_rank(name: &str, meta: &TensorMeta, expected: usize) -> Result<()> {
    ensure!(
        meta.rank() == expected,
        "{} must have rank {}, got shape {}",
        name,
        expected,
        meta.shape
    );
    Ok(())
}

pub fn ensure_same_dtype(lhs_name: &str, lhs: &TensorMeta, rhs_name: &str, rhs: &TensorMeta) -> Result<()> {
    ensure!(
        lhs.dtype == rhs.dtype,
        "{} dtype {} does not match {} dtype {}",
        lhs_name,
        lhs.dtype,
        rhs_name,
        rhs.dtype
    );
    Ok(())
}

pub fn ensure_same_device(lhs_name: &str, lhs: &TensorMeta, rhs_name: &str, rhs: &TensorMeta) -> Result<()> {
    ensure!(
        lhs.device == rhs.device,
        "{} lives on {} but {} lives on {}",
        lhs_name,
        lhs.device,
        rhs_name,
        rhs.device
    );
    Ok(())
}

pub fn ensure_shape_matches(lhs_name: &str, lhs: &TensorMeta, rhs_name: &str, rhs: &TensorMeta) -> Result<()> {
    ensure!(
        lhs.shape == rhs.shape,
        "{} shape {} does not match {} shape {}",
        lhs_name,
        lhs.shape,
        rhs_name,
        rhs.shape
    );
    Ok(())
}

/// Checks that `dims[axis]` agrees between two tensors of equal rank.
pub fn ensure_dim_matches(
    lhs_name: &str,
    lhs: &TensorMeta,
    rhs_name: &str,
    rhs: &TensorMeta,
    axis: usize,
) -> Result<()> {
    let l = lhs.shape.dims()[axis];
    let r = rhs.shape.dims()[axis];
    ensure!(
        l == r,
        "{} dim {} ({}) does not match {} dim {} ({})",
        lhs_name,
        axis,
        l,
        rhs_name,
        axis,
        r
    );
    Ok(())
}
