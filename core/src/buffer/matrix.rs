//! Typed 2-D buffers produced by the engine.

use super::{Cpu, Device, Element, Storage};
use crate::error::{KnnError, Result};

/// A row-major `rows x cols` buffer of `T` on device `D`.
///
/// Result buffers are allocated zero-initialized through [`Device::alloc_zeroed`], filled in
/// place, and returned to the caller, who owns them from then on.
#[derive(Debug, Clone)]
pub struct Matrix<T: Element, D: Device = Cpu> {
    shape: [usize; 2],
    data: D::Storage<T>,
    device: D,
}

impl<T: Element> Matrix<T, Cpu> {
    /// Wraps a host vector.
    ///
    /// # Errors
    ///
    /// Returns `KnnError::ShapeMismatch` if `data.len() != rows * cols`.
    pub fn from_vec(data: Vec<T>, rows: usize, cols: usize) -> Result<Self> {
        if data.len() != rows * cols {
            return Err(KnnError::ShapeMismatch {
                what: "matrix".into(),
                expected: vec![rows, cols],
                got: vec![data.len()],
            });
        }
        Ok(Self {
            shape: [rows, cols],
            data,
            device: Cpu,
        })
    }

    /// Consumes the matrix, returning its row-major elements.
    pub fn into_vec(self) -> Vec<T> {
        self.data
    }
}

impl<T: Element, D: Device> Matrix<T, D> {
    /// Allocates a zero-filled matrix on `device`.
    pub fn zeros_on(device: &D, rows: usize, cols: usize) -> Self {
        Self {
            shape: [rows, cols],
            data: device.alloc_zeroed(rows * cols),
            device: device.clone(),
        }
    }

    pub fn shape(&self) -> &[usize; 2] {
        &self.shape
    }

    pub fn rows(&self) -> usize {
        self.shape[0]
    }

    pub fn cols(&self) -> usize {
        self.shape[1]
    }

    pub fn device(&self) -> &D {
        &self.device
    }

    /// Row-major elements.
    pub fn data(&self) -> &[T] {
        self.data.as_slice()
    }

    pub fn data_mut(&mut self) -> &mut [T] {
        self.data.as_mut_slice()
    }

    /// Row `i`.
    ///
    /// # Panics
    ///
    /// Panics if `i >= rows`.
    pub fn row(&self, i: usize) -> &[T] {
        let cols = self.cols();
        &self.data()[i * cols..(i + 1) * cols]
    }

    pub fn row_mut(&mut self, i: usize) -> &mut [T] {
        let cols = self.cols();
        &mut self.data_mut()[i * cols..(i + 1) * cols]
    }
}
