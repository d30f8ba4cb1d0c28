//! Minimal dense tensor container used for value transport.
//!
//! The engine never computes on tensors itself (kernels are supplied through
//! [`crate::OpDispatcher`]); it only needs typed storage, shape metadata, the
//! scalar accessors the control-flow validators use, and the leading-axis
//! slice/stack/concat helpers backing the dynamic-list op family.

use anyhow::{anyhow, Result};
use serde::{Deserialize, Serialize};

use crate::error::ExecError;

/// Element type of a tensor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DType {
    Bool,
    I32,
    I64,
    F32,
    F64,
}

/// Flat, dtype-tagged storage.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum TensorData {
    Bool(Vec<bool>),
    I32(Vec<i32>),
    I64(Vec<i64>),
    F32(Vec<f32>),
    F64(Vec<f64>),
}

impl TensorData {
    pub fn dtype(&self) -> DType {
        match self {
            TensorData::Bool(_) => DType::Bool,
            TensorData::I32(_) => DType::I32,
            TensorData::I64(_) => DType::I64,
            TensorData::F32(_) => DType::F32,
            TensorData::F64(_) => DType::F64,
        }
    }

    pub fn len(&self) -> usize {
        match self {
            TensorData::Bool(v) => v.len(),
            TensorData::I32(v) => v.len(),
            TensorData::I64(v) => v.len(),
            TensorData::F32(v) => v.len(),
            TensorData::F64(v) => v.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn zeros(dtype: DType, len: usize) -> Self {
        match dtype {
            DType::Bool => TensorData::Bool(vec![false; len]),
            DType::I32 => TensorData::I32(vec![0; len]),
            DType::I64 => TensorData::I64(vec![0; len]),
            DType::F32 => TensorData::F32(vec![0.0; len]),
            DType::F64 => TensorData::F64(vec![0.0; len]),
        }
    }

    fn slice(&self, range: std::ops::Range<usize>) -> Self {
        match self {
            TensorData::Bool(v) => TensorData::Bool(v[range].to_vec()),
            TensorData::I32(v) => TensorData::I32(v[range].to_vec()),
            TensorData::I64(v) => TensorData::I64(v[range].to_vec()),
            TensorData::F32(v) => TensorData::F32(v[range].to_vec()),
            TensorData::F64(v) => TensorData::F64(v[range].to_vec()),
        }
    }

    fn extend_from(&mut self, other: &TensorData) -> Result<()> {
        match (self, other) {
            (TensorData::Bool(a), TensorData::Bool(b)) => a.extend_from_slice(b),
            (TensorData::I32(a), TensorData::I32(b)) => a.extend_from_slice(b),
            (TensorData::I64(a), TensorData::I64(b)) => a.extend_from_slice(b),
            (TensorData::F32(a), TensorData::F32(b)) => a.extend_from_slice(b),
            (TensorData::F64(a), TensorData::F64(b)) => a.extend_from_slice(b),
            (a, b) => {
                return Err(anyhow!(
                    "cannot combine tensor data of dtype {:?} and {:?}",
                    a.dtype(),
                    b.dtype()
                ))
            }
        }
        Ok(())
    }
}

/// Logical element count for a shape.
pub fn numel(shape: &[usize]) -> usize {
    shape.iter().product()
}

/// Dense tensor: dtype-tagged flat storage plus a shape.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Tensor {
    data: TensorData,
    shape: Vec<usize>,
}

impl Tensor {
    /// Build a tensor from flat data and a shape.
    pub fn new(data: TensorData, shape: Vec<usize>) -> Result<Self> {
        if data.len() != numel(&shape) {
            return Err(anyhow!(
                "data length {} does not match shape {:?}",
                data.len(),
                shape
            ));
        }
        Ok(Self { data, shape })
    }

    /// Zero-filled tensor of the given dtype and shape.
    pub fn zeros(dtype: DType, shape: Vec<usize>) -> Self {
        let data = TensorData::zeros(dtype, numel(&shape));
        Self { data, shape }
    }

    /// Rank-0 boolean scalar.
    pub fn scalar_bool(value: bool) -> Self {
        Self {
            data: TensorData::Bool(vec![value]),
            shape: Vec::new(),
        }
    }

    /// Rank-0 i64 scalar.
    pub fn scalar_i64(value: i64) -> Self {
        Self {
            data: TensorData::I64(vec![value]),
            shape: Vec::new(),
        }
    }

    /// Rank-0 f32 scalar.
    pub fn scalar_f32(value: f32) -> Self {
        Self {
            data: TensorData::F32(vec![value]),
            shape: Vec::new(),
        }
    }

    /// Rank-1 f32 tensor.
    pub fn from_f32(values: Vec<f32>) -> Self {
        let shape = vec![values.len()];
        Self {
            data: TensorData::F32(values),
            shape,
        }
    }

    /// Rank-1 i64 tensor.
    pub fn from_i64(values: Vec<i64>) -> Self {
        let shape = vec![values.len()];
        Self {
            data: TensorData::I64(values),
            shape,
        }
    }

    pub fn dtype(&self) -> DType {
        self.data.dtype()
    }

    pub fn shape(&self) -> &[usize] {
        &self.shape
    }

    pub fn rank(&self) -> usize {
        self.shape.len()
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// True for rank-0 tensors and single-element rank-1 tensors.
    pub fn is_scalar(&self) -> bool {
        self.len() == 1 && self.rank() <= 1
    }

    pub fn data(&self) -> &TensorData {
        &self.data
    }

    pub fn data_mut(&mut self) -> &mut TensorData {
        &mut self.data
    }

    /// Read a scalar boolean, failing with `TypeMismatch` otherwise.
    pub fn as_scalar_bool(&self) -> Result<bool> {
        match &self.data {
            TensorData::Bool(v) if self.is_scalar() => Ok(v[0]),
            _ => Err(ExecError::TypeMismatch(format!(
                "expected scalar bool, got {:?} with shape {:?}",
                self.dtype(),
                self.shape
            ))
            .into()),
        }
    }

    /// Read a scalar integer index, failing with `TypeMismatch` otherwise.
    pub fn as_scalar_index(&self) -> Result<i64> {
        if !self.is_scalar() {
            return Err(ExecError::TypeMismatch(format!(
                "expected scalar index, got shape {:?}",
                self.shape
            ))
            .into());
        }
        match &self.data {
            TensorData::I32(v) => Ok(v[0] as i64),
            TensorData::I64(v) => Ok(v[0]),
            _ => Err(ExecError::TypeMismatch(format!(
                "expected integer index, got {:?}",
                self.dtype()
            ))
            .into()),
        }
    }

    /// Read a rank<=1 integer vector, failing with `TypeMismatch` otherwise.
    pub fn as_index_vector(&self) -> Result<Vec<i64>> {
        if self.rank() > 1 {
            return Err(ExecError::TypeMismatch(format!(
                "expected index vector, got shape {:?}",
                self.shape
            ))
            .into());
        }
        match &self.data {
            TensorData::I32(v) => Ok(v.iter().map(|x| *x as i64).collect()),
            TensorData::I64(v) => Ok(v.clone()),
            _ => Err(ExecError::TypeMismatch(format!(
                "expected integer index vector, got {:?}",
                self.dtype()
            ))
            .into()),
        }
    }

    /// Slice `[start, end)` along the leading axis.
    pub fn slice_axis0(&self, start: usize, end: usize) -> Result<Tensor> {
        if self.rank() == 0 {
            return Err(anyhow!("cannot slice a rank-0 tensor"));
        }
        let dim0 = self.shape[0];
        if start > end || end > dim0 {
            return Err(anyhow!(
                "slice [{}, {}) out of bounds for leading axis of size {}",
                start,
                end,
                dim0
            ));
        }
        let inner: usize = self.shape[1..].iter().product();
        let data = self.data.slice(start * inner..end * inner);
        let mut shape = self.shape.clone();
        shape[0] = end - start;
        Ok(Tensor { data, shape })
    }

    /// The `i`-th leading-axis slice, with the leading axis dropped.
    pub fn index_axis0(&self, i: usize) -> Result<Tensor> {
        let sliced = self.slice_axis0(i, i + 1)?;
        let shape = sliced.shape[1..].to_vec();
        Ok(Tensor {
            data: sliced.data,
            shape,
        })
    }

    /// Stack tensors of identical shape/dtype along a new leading axis.
    pub fn stack(parts: &[&Tensor]) -> Result<Tensor> {
        let first = parts
            .first()
            .ok_or_else(|| anyhow!("cannot stack zero tensors"))?;
        let mut data = TensorData::zeros(first.dtype(), 0);
        for part in parts {
            if part.shape != first.shape || part.dtype() != first.dtype() {
                return Err(ExecError::TypeMismatch(format!(
                    "stack requires uniform shape/dtype: {:?} {:?} vs {:?} {:?}",
                    first.dtype(),
                    first.shape,
                    part.dtype(),
                    part.shape
                ))
                .into());
            }
            data.extend_from(&part.data)?;
        }
        let mut shape = vec![parts.len()];
        shape.extend_from_slice(&first.shape);
        Ok(Tensor { data, shape })
    }

    /// Concatenate tensors along the existing leading axis.
    pub fn concat_axis0(parts: &[&Tensor]) -> Result<Tensor> {
        let first = parts
            .first()
            .ok_or_else(|| anyhow!("cannot concatenate zero tensors"))?;
        if first.rank() == 0 {
            return Err(anyhow!("cannot concatenate rank-0 tensors"));
        }
        let mut data = TensorData::zeros(first.dtype(), 0);
        let mut dim0 = 0;
        for part in parts {
            if part.rank() != first.rank()
                || part.shape[1..] != first.shape[1..]
                || part.dtype() != first.dtype()
            {
                return Err(ExecError::TypeMismatch(format!(
                    "concat requires matching trailing shape/dtype: {:?} {:?} vs {:?} {:?}",
                    first.dtype(),
                    first.shape,
                    part.dtype(),
                    part.shape
                ))
                .into());
            }
            data.extend_from(&part.data)?;
            dim0 += part.shape[0];
        }
        let mut shape = first.shape.clone();
        shape[0] = dim0;
        Ok(Tensor { data, shape })
    }
}
