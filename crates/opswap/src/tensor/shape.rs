//! Lightweight wrapper for tensor shapes and dimension bookkeeping.

use serde::{Deserialize, Serialize};

/// Stores the logical dimensions of a tensor.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Shape {
    dims: Vec<usize>,
}

impl Shape {
    /// Constructs a new shape from the provided dimensions.
    ///
    /// Panics if `dims` is empty, ensuring every tensor has at least one axis.
    pub fn new<D: Into<Vec<usize>>>(dims: D) -> Self {
        let dims = dims.into();
        assert!(!dims.is_empty(), "shape must have at least one dimension");
        Shape { dims }
    }

    /// Borrow the raw dimension slice for downstream calculations.
    pub fn dims(&self) -> &[usize] {
        &self.dims
    }

    /// Returns the rank (number of axes) of the shape.
    pub fn rank(&self) -> usize {
        self.dims.len()
    }

    /// Size of the trailing axis.
    pub fn last_dim(&self) -> usize {
        self.dims[self.dims.len() - 1]
    }

    /// Returns a copy of the shape with the trailing axis replaced.
    pub fn with_last_dim(&self, size: usize) -> Shape {
        let mut dims = self.dims.clone();
        let last = dims.len() - 1;
        dims[last] = size;
        Shape { dims }
    }

    /// Computes the total number of elements implied by the shape.
    pub fn num_elements(&self) -> usize {
        self.dims.iter().product()
    }

    /// Row-major strides for a dense buffer of this shape.
    pub fn contiguous_strides(&self) -> Vec<usize> {
        let mut strides = vec![1usize; self.dims.len()];
        for axis in (0..self.dims.len().saturating_sub(1)).rev() {
            strides[axis] = strides[axis + 1] * self.dims[axis + 1];
        }
        strides
    }
}

impl std::fmt::Display for Shape {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:?}", self.dims)
    }
}
