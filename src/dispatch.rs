//! Seam to the external kernel provider.
//!
//! The engine treats numeric computation as opaque: for each plain operation
//! it asks the dispatcher for output shapes, allocates buffers through the
//! memory manager, and hands the dispatcher pre-allocated outputs to fill.

use anyhow::Result;

use crate::graph::Operation;
use crate::tensor::{DType, Tensor};

/// Shape and element type of one operation output.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShapeDesc {
    pub dtype: DType,
    pub shape: Vec<usize>,
}

impl ShapeDesc {
    pub fn new(dtype: DType, shape: Vec<usize>) -> Self {
        Self { dtype, shape }
    }

    pub fn of(tensor: &Tensor) -> Self {
        Self {
            dtype: tensor.dtype(),
            shape: tensor.shape().to_vec(),
        }
    }

    pub fn matches(&self, tensor: &Tensor) -> bool {
        self.dtype == tensor.dtype() && self.shape == tensor.shape()
    }
}

/// Kernel provider for plain operations.
pub trait OpDispatcher {
    /// Infer output shapes/dtypes for an op given its resolved inputs.
    /// Must return one descriptor per declared output.
    fn calculate_output_shape(&self, op: &Operation, inputs: &[&Tensor]) -> Result<Vec<ShapeDesc>>;

    /// Execute the op, writing results into the pre-allocated buffers.
    fn execute(&self, op: &Operation, inputs: &[&Tensor], outputs: &mut [Tensor]) -> Result<()>;
}
