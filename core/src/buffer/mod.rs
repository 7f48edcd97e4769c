//! Buffer adapter: typed device storage and the caller-facing array wrapper.
//!
//! Callers hand the engine [`DeviceArray`]s. A `DeviceArray` is type-erased: it records
//! its shape, memory [`Layout`] and element [`Dtype`], and gives typed slice access only when
//! the requested element type matches. Anything else goes through an explicit conversion,
//! which the shard registry performs only when the caller opts in.
//!
//! Outputs are typed [`Matrix`] values allocated through the [`Device`].

use crate::error::{KnnError, Result};
use num_traits::NumCast;
use serde::{Deserialize, Serialize};
use shardknn_kernels::KernelElem;
use std::fmt;

pub mod device;
pub mod matrix;
pub mod storage;

pub use device::{Cpu, Device};
pub use matrix::Matrix;
pub use storage::Storage;

/// Element type of a buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Dtype {
    F32,
    F64,
    I32,
    I64,
}

impl Dtype {
    /// Size of one element in bytes.
    pub fn size_of(self) -> usize {
        match self {
            Dtype::F32 | Dtype::I32 => 4,
            Dtype::F64 | Dtype::I64 => 8,
        }
    }
}

impl fmt::Display for Dtype {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Dtype::F32 => "f32",
            Dtype::F64 => "f64",
            Dtype::I32 => "i32",
            Dtype::I64 => "i64",
        };
        f.write_str(name)
    }
}

/// Memory order of a 2-D buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Layout {
    /// Consecutive elements of a row are adjacent (C order).
    #[default]
    RowMajor,
    /// Consecutive elements of a column are adjacent (Fortran order).
    ColMajor,
}

impl Layout {
    /// Maps a caller's `*_major` flag (`true` = row-major) to a layout.
    pub fn from_row_major_flag(row_major: bool) -> Self {
        if row_major {
            Layout::RowMajor
        } else {
            Layout::ColMajor
        }
    }
}

/// Trait bound for elements a buffer may hold.
///
/// # Requirements
/// - `KernelElem`: the element can be moved through the CPU kernels (transpose).
/// - `NumCast`: opt-in conversion between element types.
pub trait Element: KernelElem + NumCast + Default + 'static {
    const DTYPE: Dtype;

    /// Borrows the typed storage out of an erased buffer, if the dtype matches.
    fn view<D: Device>(data: &ArrayData<D>) -> Option<&[Self]>;

    /// Erases a typed storage.
    fn erase<D: Device>(storage: D::Storage<Self>) -> ArrayData<D>;
}

macro_rules! impl_element {
    ($ty:ty, $variant:ident) => {
        impl Element for $ty {
            const DTYPE: Dtype = Dtype::$variant;

            fn view<D: Device>(data: &ArrayData<D>) -> Option<&[Self]> {
                match data {
                    ArrayData::$variant(storage) => Some(storage.as_slice()),
                    _ => None,
                }
            }

            fn erase<D: Device>(storage: D::Storage<Self>) -> ArrayData<D> {
                ArrayData::$variant(storage)
            }
        }
    };
}

impl_element!(f32, F32);
impl_element!(f64, F64);
impl_element!(i32, I32);
impl_element!(i64, I64);

/// Type-erased device storage.
#[derive(Debug, Clone)]
pub enum ArrayData<D: Device = Cpu> {
    F32(D::Storage<f32>),
    F64(D::Storage<f64>),
    I32(D::Storage<i32>),
    I64(D::Storage<i64>),
}

impl<D: Device> ArrayData<D> {
    pub fn dtype(&self) -> Dtype {
        match self {
            ArrayData::F32(_) => Dtype::F32,
            ArrayData::F64(_) => Dtype::F64,
            ArrayData::I32(_) => Dtype::I32,
            ArrayData::I64(_) => Dtype::I64,
        }
    }

    fn len(&self) -> usize {
        match self {
            ArrayData::F32(s) => s.len(),
            ArrayData::F64(s) => s.len(),
            ArrayData::I32(s) => s.len(),
            ArrayData::I64(s) => s.len(),
        }
    }
}

/// A caller-supplied 2-D array resident on a device.
///
/// This is the only view the engine has of host-language arrays: base storage, row count,
/// column count, element dtype and memory layout.
#[derive(Debug, Clone)]
pub struct DeviceArray<D: Device = Cpu> {
    rows: usize,
    cols: usize,
    layout: Layout,
    data: ArrayData<D>,
}

impl DeviceArray<Cpu> {
    /// Wraps host data as a CPU-resident array.
    ///
    /// # Errors
    ///
    /// Returns `KnnError::ShapeMismatch` if `data.len() != rows * cols`.
    pub fn from_vec<T: Element>(
        data: Vec<T>,
        rows: usize,
        cols: usize,
        layout: Layout,
    ) -> Result<Self> {
        Self::new_on(&Cpu, data, rows, cols, layout)
    }

    /// Row-major shorthand for [`DeviceArray::from_vec`].
    pub fn row_major<T: Element>(data: Vec<T>, rows: usize, cols: usize) -> Result<Self> {
        Self::from_vec(data, rows, cols, Layout::RowMajor)
    }

    /// Column-major shorthand for [`DeviceArray::from_vec`].
    pub fn col_major<T: Element>(data: Vec<T>, rows: usize, cols: usize) -> Result<Self> {
        Self::from_vec(data, rows, cols, Layout::ColMajor)
    }
}

impl<D: Device> DeviceArray<D> {
    /// Uploads host data to `device` and wraps it.
    pub fn new_on<T: Element>(
        device: &D,
        data: Vec<T>,
        rows: usize,
        cols: usize,
        layout: Layout,
    ) -> Result<Self> {
        if data.len() != rows * cols {
            return Err(KnnError::ShapeMismatch {
                what: "device array".into(),
                expected: vec![rows, cols],
                got: vec![data.len()],
            });
        }
        Ok(Self {
            rows,
            cols,
            layout,
            data: T::erase(device.upload(data)),
        })
    }

    pub fn rows(&self) -> usize {
        self.rows
    }

    pub fn cols(&self) -> usize {
        self.cols
    }

    pub fn layout(&self) -> Layout {
        self.layout
    }

    pub fn dtype(&self) -> Dtype {
        self.data.dtype()
    }

    pub fn element_size(&self) -> usize {
        self.dtype().size_of()
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Typed view of the raw elements, in the array's own layout.
    ///
    /// Returns `None` if `T` is not the array's dtype.
    pub fn as_slice<T: Element>(&self) -> Option<&[T]> {
        T::view(&self.data)
    }

    /// Copies the elements into a new vector of `T`, converting each one.
    ///
    /// Float to integer conversion truncates toward zero.
    ///
    /// # Errors
    ///
    /// Returns `KnnError::DtypeMismatch` if an element is not representable in `T`
    /// (out of range, or NaN into an integer type).
    pub fn to_vec_as<T: Element>(&self, what: &str) -> Result<Vec<T>> {
        match &self.data {
            ArrayData::F32(s) => cast_all(s.as_slice(), what),
            ArrayData::F64(s) => cast_all(s.as_slice(), what),
            ArrayData::I32(s) => cast_all(s.as_slice(), what),
            ArrayData::I64(s) => cast_all(s.as_slice(), what),
        }
    }
}

fn cast_all<S: Element, T: Element>(src: &[S], what: &str) -> Result<Vec<T>> {
    src.iter()
        .map(|&value| {
            num_traits::cast::<S, T>(value).ok_or_else(|| KnnError::DtypeMismatch {
                what: format!("{what} (value {value:?} not representable)"),
                expected: T::DTYPE,
                got: S::DTYPE,
            })
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_device_array_metadata() {
        let arr = DeviceArray::row_major(vec![1.0f32, 2.0, 3.0, 4.0, 5.0, 6.0], 2, 3).unwrap();
        assert_eq!(arr.rows(), 2);
        assert_eq!(arr.cols(), 3);
        assert_eq!(arr.dtype(), Dtype::F32);
        assert_eq!(arr.element_size(), 4);
        assert_eq!(arr.layout(), Layout::RowMajor);
        assert_eq!(arr.as_slice::<f32>().unwrap().len(), 6);
        assert!(arr.as_slice::<f64>().is_none());
    }

    #[test]
    fn test_device_array_shape_mismatch() {
        let err = DeviceArray::row_major(vec![1i32, 2, 3], 2, 2);
        assert!(matches!(err, Err(KnnError::ShapeMismatch { .. })));
    }

    #[test]
    fn test_conversion() {
        let arr = DeviceArray::row_major(vec![1.0f64, -2.5, 3.0], 3, 1).unwrap();
        let as_f32: Vec<f32> = arr.to_vec_as("features").unwrap();
        assert_eq!(as_f32, vec![1.0, -2.5, 3.0]);
        let as_i32: Vec<i32> = arr.to_vec_as("labels").unwrap();
        assert_eq!(as_i32, vec![1, -2, 3]);
    }

    #[test]
    fn test_conversion_out_of_range() {
        let arr = DeviceArray::row_major(vec![i64::MAX], 1, 1).unwrap();
        let err = arr.to_vec_as::<i32>("labels");
        assert!(matches!(
            err,
            Err(KnnError::DtypeMismatch {
                expected: Dtype::I32,
                got: Dtype::I64,
                ..
            })
        ));
    }

    #[test]
    fn test_layout_flag() {
        assert_eq!(Layout::from_row_major_flag(true), Layout::RowMajor);
        assert_eq!(Layout::from_row_major_flag(false), Layout::ColMajor);
    }
}
