//! Dense host tensors used by the reference engine and carried in batches.

use crate::{Device, EngineError, EngineResult};
use rand::Rng;
use serde::{Deserialize, Serialize};

/// A dense row-major `f32` tensor tagged with the device it lives on.
///
/// The first dimension is treated as the row (sample) dimension by every
/// indexing helper.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "RawTensor")]
pub struct Tensor {
    shape: Vec<usize>,
    data: Vec<f32>,
    #[serde(default)]
    device: Device,
}

/// Wire form of [`Tensor`], checked on the way in.
#[derive(Deserialize)]
struct RawTensor {
    shape: Vec<usize>,
    data: Vec<f32>,
    #[serde(default)]
    device: Device,
}

impl TryFrom<RawTensor> for Tensor {
    type Error = EngineError;

    fn try_from(raw: RawTensor) -> EngineResult<Self> {
        Ok(Self::new(raw.shape, raw.data)?.to(raw.device))
    }
}

impl Tensor {
    /// Creates a tensor, checking that `data` fills `shape` exactly.
    pub fn new(shape: Vec<usize>, data: Vec<f32>) -> EngineResult<Self> {
        let expected: usize = shape.iter().product();
        if expected != data.len() {
            return Err(EngineError::ShapeMismatch { expected: shape, actual: vec![data.len()] });
        }
        Ok(Self { shape, data, device: Device::Cpu })
    }

    #[must_use]
    pub fn zeros(shape: Vec<usize>) -> Self {
        Self::full(shape, 0.0)
    }

    #[must_use]
    pub fn full(shape: Vec<usize>, value: f32) -> Self {
        let len = shape.iter().product();
        Self { shape, data: vec![value; len], device: Device::Cpu }
    }

    /// Samples every element uniformly from `[0, 1)`.
    pub fn uniform<R: Rng + ?Sized>(shape: Vec<usize>, rng: &mut R) -> Self {
        let len: usize = shape.iter().product();
        let data = (0..len).map(|_| rng.gen_range(0.0..1.0)).collect();
        Self { shape, data, device: Device::Cpu }
    }

    /// Stacks equally sized rows into a `[rows.len(), row_len]` tensor.
    pub fn from_rows(rows: &[Vec<f32>]) -> EngineResult<Self> {
        let row_len = rows.first().map_or(0, Vec::len);
        let mut data = Vec::with_capacity(rows.len() * row_len);
        for row in rows {
            if row.len() != row_len {
                return Err(EngineError::ShapeMismatch {
                    expected: vec![row_len],
                    actual: vec![row.len()],
                });
            }
            data.extend_from_slice(row);
        }
        Self::new(vec![rows.len(), row_len], data)
    }

    #[must_use]
    pub fn shape(&self) -> &[usize] {
        &self.shape
    }

    #[must_use]
    pub fn data(&self) -> &[f32] {
        &self.data
    }

    pub fn data_mut(&mut self) -> &mut [f32] {
        &mut self.data
    }

    #[must_use]
    pub fn numel(&self) -> usize {
        self.data.len()
    }

    #[must_use]
    pub fn device(&self) -> Device {
        self.device
    }

    /// Number of rows along the first dimension. Scalars count as one row.
    #[must_use]
    pub fn rows(&self) -> usize {
        self.shape.first().copied().unwrap_or(1)
    }

    fn row_len(&self) -> usize {
        match self.rows() {
            0 => self.shape.iter().skip(1).product(),
            rows => self.numel() / rows,
        }
    }

    fn with_rows(&self, rows: usize, data: Vec<f32>) -> Self {
        let mut shape = self.shape.clone();
        if shape.is_empty() {
            shape.push(rows);
        } else {
            shape[0] = rows;
        }
        Self { shape, data, device: self.device }
    }

    /// Gathers the given rows, in order, into a new tensor. Indices may repeat.
    pub fn select_rows(&self, indices: &[usize]) -> EngineResult<Self> {
        let rows = self.rows();
        let row_len = self.row_len();
        let mut data = Vec::with_capacity(indices.len() * row_len);
        for &index in indices {
            if index >= rows {
                return Err(EngineError::IndexOutOfBounds { index, len: rows });
            }
            data.extend_from_slice(&self.data[index * row_len..(index + 1) * row_len]);
        }
        Ok(self.with_rows(indices.len(), data))
    }

    /// Copies rows `start..end`.
    pub fn slice_rows(&self, start: usize, end: usize) -> EngineResult<Self> {
        let rows = self.rows();
        if start > end || end > rows {
            return Err(EngineError::IndexOutOfBounds { index: end, len: rows });
        }
        let row_len = self.row_len();
        Ok(self.with_rows(end - start, self.data[start * row_len..end * row_len].to_vec()))
    }

    /// Moves the tensor to `device`.
    #[must_use]
    pub fn to(mut self, device: Device) -> Self {
        self.device = device;
        self
    }

    /// Mean of all elements, `0.0` for an empty tensor.
    #[must_use]
    pub fn mean(&self) -> f32 {
        if self.data.is_empty() {
            return 0.0;
        }
        self.data.iter().sum::<f32>() / self.data.len() as f32
    }
}
