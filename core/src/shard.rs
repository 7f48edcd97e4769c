//! Local shard registry: engine-side views of the caller's partition buffers.
//!
//! Wrapping never copies when it does not have to. A buffer that already has the required
//! dtype and layout is borrowed; a buffer that needs a dtype conversion or a transpose is
//! copied into an engine-owned shard. Either way the shard is a scoped value: dropping the
//! registry releases exactly what the engine allocated and leaves caller buffers alone.

use crate::buffer::{Device, DeviceArray, Dtype, Element, Layout};
use crate::error::{KnnError, Result};
use crate::partition::PartitionDescriptor;
use crate::vocab::LabelSet;
use shardknn_kernels::cpu_transpose;
use std::borrow::Cow;

/// Conversion and validation switches for [`ShardRegistry::wrap`] and [`LabelTable::wrap`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ShardOptions {
    /// Convert buffers of another dtype instead of failing with `DtypeMismatch`.
    pub convert_dtype: bool,
    /// Fail with `LayoutMismatch` when a declared layout disagrees with the buffer. When
    /// unset, the declared layout is trusted.
    pub validate_layout: bool,
}

impl Default for ShardOptions {
    fn default() -> Self {
        Self {
            convert_dtype: false,
            validate_layout: true,
        }
    }
}

/// One local partition of a feature matrix, row-major `f32`.
#[derive(Debug, Clone)]
pub struct LocalShard<'a> {
    part: usize,
    rows: usize,
    cols: usize,
    data: Cow<'a, [f32]>,
}

impl<'a> LocalShard<'a> {
    /// Index of this shard's partition in its descriptor.
    pub fn part(&self) -> usize {
        self.part
    }

    pub fn rows(&self) -> usize {
        self.rows
    }

    pub fn cols(&self) -> usize {
        self.cols
    }

    pub fn element_size(&self) -> usize {
        std::mem::size_of::<f32>()
    }

    /// Row-major elements.
    pub fn data(&self) -> &[f32] {
        &self.data
    }

    /// Rows `range` as one contiguous row-major slice.
    pub fn rows_slice(&self, range: std::ops::Range<usize>) -> &[f32] {
        &self.data[range.start * self.cols..range.end * self.cols]
    }

    /// True if the shard aliases the caller's buffer rather than an engine-owned copy.
    pub fn is_borrowed(&self) -> bool {
        matches!(self.data, Cow::Borrowed(_))
    }
}

/// The local feature shards of one partitioned matrix, in descriptor order.
#[derive(Debug, Clone)]
pub struct ShardRegistry<'a> {
    shards: Vec<LocalShard<'a>>,
}

impl<'a> ShardRegistry<'a> {
    /// Wraps one buffer per local partition (in [`PartitionDescriptor::local_parts`] order).
    ///
    /// # Errors
    ///
    /// - `ShapeMismatch` if the buffer count or a buffer's shape disagrees with `descriptor`.
    /// - `LayoutMismatch` if `declared` disagrees with a buffer and layouts are validated.
    /// - `DtypeMismatch` if a buffer is not `f32` and conversion was not requested.
    pub fn wrap<D: Device>(
        buffers: &'a [DeviceArray<D>],
        descriptor: &PartitionDescriptor,
        declared: Layout,
        options: ShardOptions,
        what: &str,
    ) -> Result<Self> {
        let local: Vec<_> = descriptor.local_parts().collect();
        check_buffer_count(what, local.len(), buffers.len())?;

        let shards = buffers
            .iter()
            .zip(local)
            .map(|(buffer, (part, p))| {
                let name = format!("{what} partition {part}");
                check_shape(&name, buffer, p.rows, descriptor.total_cols())?;
                let layout = effective_layout(&name, buffer, declared, options)?;
                let data = typed_data::<f32, D>(&name, buffer, options)?;
                Ok(LocalShard {
                    part,
                    rows: p.rows,
                    cols: descriptor.total_cols(),
                    data: to_row_major(data, p.rows, descriptor.total_cols(), layout)?,
                })
            })
            .collect::<Result<Vec<_>>>()?;

        Ok(Self { shards })
    }

    pub fn iter(&self) -> impl Iterator<Item = &LocalShard<'a>> {
        self.shards.iter()
    }

    pub fn len(&self) -> usize {
        self.shards.len()
    }

    pub fn is_empty(&self) -> bool {
        self.shards.is_empty()
    }

    /// Shard of descriptor partition `part`, if it is local.
    pub fn get(&self, part: usize) -> Option<&LocalShard<'a>> {
        self.shards.iter().find(|s| s.part == part)
    }
}

/// One output column of one local index partition.
#[derive(Debug, Clone)]
pub struct LabelShard<'a> {
    data: Cow<'a, [i32]>,
}

impl<'a> LabelShard<'a> {
    pub fn data(&self) -> &[i32] {
        &self.data
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn is_borrowed(&self) -> bool {
        matches!(self.data, Cow::Borrowed(_))
    }
}

/// Labels of the local index partitions, indexed `[local partition][output column]`.
#[derive(Debug, Clone)]
pub struct LabelTable<'a> {
    parts: Vec<usize>,
    columns: Vec<Vec<LabelShard<'a>>>,
    n_outputs: usize,
}

impl<'a> LabelTable<'a> {
    /// Wraps one `rows x n_outputs` label buffer per local index partition.
    ///
    /// # Errors
    ///
    /// As [`ShardRegistry::wrap`], with `i32` as the required dtype.
    pub fn wrap<D: Device>(
        buffers: &'a [DeviceArray<D>],
        descriptor: &PartitionDescriptor,
        n_outputs: usize,
        declared: Layout,
        options: ShardOptions,
    ) -> Result<Self> {
        let local: Vec<_> = descriptor.local_parts().collect();
        check_buffer_count("labels", local.len(), buffers.len())?;

        let mut parts = Vec::with_capacity(local.len());
        let mut columns = Vec::with_capacity(local.len());
        for (buffer, (part, p)) in buffers.iter().zip(local) {
            let name = format!("labels partition {part}");
            check_shape(&name, buffer, p.rows, n_outputs)?;
            let layout = effective_layout(&name, buffer, declared, options)?;
            let data = typed_data::<i32, D>(&name, buffer, options)?;
            parts.push(part);
            columns.push(split_columns(data, p.rows, n_outputs, layout));
        }

        Ok(Self {
            parts,
            columns,
            n_outputs,
        })
    }

    pub fn n_outputs(&self) -> usize {
        self.n_outputs
    }

    /// Descriptor partitions covered by the table, in order.
    pub fn parts(&self) -> &[usize] {
        &self.parts
    }

    /// Label shard for descriptor partition `part`, output column `column`.
    pub fn get(&self, part: usize, column: usize) -> Option<&LabelShard<'a>> {
        let pos = self.parts.iter().position(|&p| p == part)?;
        self.columns[pos].get(column)
    }

    /// Label of row `offset` of partition `part` in output column `column`.
    pub fn label(&self, part: usize, column: usize, offset: usize) -> Option<i32> {
        self.get(part, column)?.data().get(offset).copied()
    }

    /// Checks that the table has one column per label set and that every label is in its
    /// column's vocabulary.
    pub fn validate_against(&self, vocabulary: &[LabelSet]) -> Result<()> {
        if vocabulary.len() != self.n_outputs {
            return Err(KnnError::ShapeMismatch {
                what: "label vocabulary".into(),
                expected: vec![self.n_outputs],
                got: vec![vocabulary.len()],
            });
        }
        for (part, shards) in self.parts.iter().zip(&self.columns) {
            for (column, (shard, set)) in shards.iter().zip(vocabulary).enumerate() {
                if let Some(label) = shard.data().iter().find(|&&l| !set.contains(l)) {
                    return Err(KnnError::InvalidVocabulary(format!(
                        "label {label} in partition {part}, column {column} is not in the \
                         vocabulary"
                    )));
                }
            }
        }
        Ok(())
    }
}

fn check_buffer_count(what: &str, expected: usize, got: usize) -> Result<()> {
    if expected != got {
        return Err(KnnError::ShapeMismatch {
            what: format!("{what} buffers"),
            expected: vec![expected],
            got: vec![got],
        });
    }
    Ok(())
}

fn check_shape<D: Device>(
    what: &str,
    buffer: &DeviceArray<D>,
    rows: usize,
    cols: usize,
) -> Result<()> {
    if buffer.rows() != rows || buffer.cols() != cols || buffer.len() != rows * cols {
        return Err(KnnError::ShapeMismatch {
            what: what.to_string(),
            expected: vec![rows, cols],
            got: vec![buffer.rows(), buffer.cols()],
        });
    }
    Ok(())
}

fn effective_layout<D: Device>(
    what: &str,
    buffer: &DeviceArray<D>,
    declared: Layout,
    options: ShardOptions,
) -> Result<Layout> {
    if options.validate_layout && buffer.layout() != declared {
        return Err(KnnError::LayoutMismatch {
            what: what.to_string(),
            declared,
            actual: buffer.layout(),
        });
    }
    Ok(declared)
}

fn typed_data<'a, T: Element, D: Device>(
    what: &str,
    buffer: &'a DeviceArray<D>,
    options: ShardOptions,
) -> Result<Cow<'a, [T]>> {
    match buffer.as_slice::<T>() {
        Some(slice) => Ok(Cow::Borrowed(slice)),
        None if options.convert_dtype => Ok(Cow::Owned(buffer.to_vec_as(what)?)),
        None => Err(KnnError::DtypeMismatch {
            what: what.to_string(),
            expected: T::DTYPE,
            got: buffer.dtype(),
        }),
    }
}

fn to_row_major<T: Element>(
    data: Cow<'_, [T]>,
    rows: usize,
    cols: usize,
    layout: Layout,
) -> Result<Cow<'_, [T]>> {
    // A single row or column reads the same in either order.
    if layout == Layout::RowMajor || rows <= 1 || cols <= 1 {
        return Ok(data);
    }
    // Column-major rows x cols is row-major cols x rows.
    Ok(Cow::Owned(cpu_transpose(&data, cols, rows)?))
}

fn split_columns<'a>(
    data: Cow<'a, [i32]>,
    rows: usize,
    n_outputs: usize,
    layout: Layout,
) -> Vec<LabelShard<'a>> {
    let contiguous = layout == Layout::ColMajor || n_outputs <= 1;
    (0..n_outputs)
        .map(|column| {
            let range = column * rows..(column + 1) * rows;
            let data = match (&data, contiguous) {
                (Cow::Borrowed(slice), true) => {
                    let slice: &'a [i32] = *slice;
                    Cow::Borrowed(&slice[range])
                }
                (_, true) => Cow::Owned(data[range].to_vec()),
                (_, false) => Cow::Owned((0..rows).map(|r| data[r * n_outputs + column]).collect()),
            };
            LabelShard { data }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::buffer::DeviceArray;

    fn two_rank_descriptor(local_rank: i64) -> PartitionDescriptor {
        PartitionDescriptor::build(6, 2, &[(0, 4), (1, 2)], local_rank).unwrap()
    }

    #[test]
    fn test_wrap_borrows_matching_buffers() {
        let desc = two_rank_descriptor(1);
        let buffers = vec![DeviceArray::row_major(vec![1.0f32, 2.0, 3.0, 4.0], 2, 2).unwrap()];
        let registry =
            ShardRegistry::wrap(&buffers, &desc, Layout::RowMajor, ShardOptions::default(), "index")
                .unwrap();
        let shard = registry.get(1).unwrap();
        assert!(shard.is_borrowed());
        assert_eq!(shard.rows(), 2);
        assert_eq!(shard.element_size(), 4);
        assert_eq!(shard.rows_slice(1..2), &[3.0, 4.0]);
        assert!(registry.get(0).is_none());
    }

    #[test]
    fn test_wrap_transposes_col_major() {
        let desc = PartitionDescriptor::build(3, 2, &[(0, 3)], 0).unwrap();
        // Rows (1, 4), (2, 5), (3, 6), stored column by column.
        let values = vec![1.0f32, 2.0, 3.0, 4.0, 5.0, 6.0];
        let buffers = vec![DeviceArray::col_major(values, 3, 2).unwrap()];
        let registry =
            ShardRegistry::wrap(&buffers, &desc, Layout::ColMajor, ShardOptions::default(), "query")
                .unwrap();
        let shard = registry.get(0).unwrap();
        assert!(!shard.is_borrowed());
        assert_eq!(shard.data(), &[1.0, 4.0, 2.0, 5.0, 3.0, 6.0]);
    }

    #[test]
    fn test_wrap_rejects_layout_flag_mismatch() {
        let desc = PartitionDescriptor::build(2, 2, &[(0, 2)], 0).unwrap();
        let buffers = vec![DeviceArray::col_major(vec![1.0f32, 2.0, 3.0, 4.0], 2, 2).unwrap()];
        let defaults = ShardOptions::default();
        let err = ShardRegistry::wrap(&buffers, &desc, Layout::RowMajor, defaults, "index");
        assert!(matches!(err, Err(KnnError::LayoutMismatch { .. })));

        // With validation off the flag wins and the buffer is read as row-major.
        let options = ShardOptions {
            validate_layout: false,
            ..ShardOptions::default()
        };
        let registry =
            ShardRegistry::wrap(&buffers, &desc, Layout::RowMajor, options, "index").unwrap();
        assert_eq!(registry.get(0).unwrap().data(), &[1.0, 2.0, 3.0, 4.0]);
    }

    #[test]
    fn test_wrap_dtype_rules() {
        let desc = PartitionDescriptor::build(1, 2, &[(0, 1)], 0).unwrap();
        let buffers = vec![DeviceArray::row_major(vec![1.0f64, 2.0], 1, 2).unwrap()];
        let defaults = ShardOptions::default();
        let err = ShardRegistry::wrap(&buffers, &desc, Layout::RowMajor, defaults, "index");
        assert!(matches!(
            err,
            Err(KnnError::DtypeMismatch {
                expected: Dtype::F32,
                got: Dtype::F64,
                ..
            })
        ));

        let options = ShardOptions {
            convert_dtype: true,
            ..ShardOptions::default()
        };
        let registry =
            ShardRegistry::wrap(&buffers, &desc, Layout::RowMajor, options, "index").unwrap();
        assert_eq!(registry.get(0).unwrap().data(), &[1.0, 2.0]);
    }

    #[test]
    fn test_wrap_shape_checks() {
        let desc = two_rank_descriptor(0);
        let defaults = ShardOptions::default();
        let wrong_rows = vec![DeviceArray::row_major(vec![0.0f32; 6], 3, 2).unwrap()];
        assert!(matches!(
            ShardRegistry::wrap(&wrong_rows, &desc, Layout::RowMajor, defaults, "index"),
            Err(KnnError::ShapeMismatch { .. })
        ));
        let none: Vec<DeviceArray> = Vec::new();
        assert!(matches!(
            ShardRegistry::wrap(&none, &desc, Layout::RowMajor, defaults, "index"),
            Err(KnnError::ShapeMismatch { .. })
        ));
    }

    #[test]
    fn test_label_table_columns() {
        let desc = PartitionDescriptor::build(3, 4, &[(0, 3)], 0).unwrap();
        // Two output columns, row-major: rows (0, 10), (1, 11), (2, 12).
        let row_major = vec![DeviceArray::row_major(vec![0, 10, 1, 11, 2, 12], 3, 2).unwrap()];
        let defaults = ShardOptions::default();
        let table = LabelTable::wrap(&row_major, &desc, 2, Layout::RowMajor, defaults).unwrap();
        assert_eq!(table.get(0, 1).unwrap().data(), &[10, 11, 12]);
        assert!(!table.get(0, 1).unwrap().is_borrowed());
        assert_eq!(table.label(0, 0, 2), Some(2));
        assert_eq!(table.label(0, 2, 0), None);

        let col_major = vec![DeviceArray::col_major(vec![0, 1, 2, 10, 11, 12], 3, 2).unwrap()];
        let table = LabelTable::wrap(&col_major, &desc, 2, Layout::ColMajor, defaults).unwrap();
        assert!(table.get(0, 1).unwrap().is_borrowed());
        assert_eq!(table.get(0, 1).unwrap().data(), &[10, 11, 12]);
    }

    #[test]
    fn test_label_table_vocabulary_check() {
        let desc = PartitionDescriptor::build(2, 1, &[(0, 2)], 0).unwrap();
        let labels = vec![DeviceArray::row_major(vec![0, 3], 2, 1).unwrap()];
        let defaults = ShardOptions::default();
        let table = LabelTable::wrap(&labels, &desc, 1, Layout::RowMajor, defaults).unwrap();

        let ok = vec![LabelSet::from_values(vec![0, 3]).unwrap()];
        assert!(table.validate_against(&ok).is_ok());

        let missing = vec![LabelSet::from_values(vec![0, 1]).unwrap()];
        assert!(matches!(
            table.validate_against(&missing),
            Err(KnnError::InvalidVocabulary(_))
        ));

        assert!(matches!(
            table.validate_against(&[]),
            Err(KnnError::ShapeMismatch { .. })
        ));
    }
}
