//! Label vocabulary: the set of classes each output column can vote for.

use crate::buffer::{Device, DeviceArray, Dtype, Layout};
use crate::error::{KnnError, Result};
use std::borrow::Cow;
use std::collections::HashMap;

/// The ordered unique label values of one output column.
///
/// A value's position in `values()` is its ordinal, which breaks voting ties: the value that
/// appears first wins.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LabelSet {
    values: Vec<i32>,
    ordinals: HashMap<i32, usize>,
}

impl LabelSet {
    /// # Errors
    ///
    /// Returns `KnnError::InvalidVocabulary` if `values` contains duplicates.
    pub fn from_values(values: Vec<i32>) -> Result<Self> {
        let mut ordinals = HashMap::with_capacity(values.len());
        for (i, &value) in values.iter().enumerate() {
            if ordinals.insert(value, i).is_some() {
                return Err(KnnError::InvalidVocabulary(format!(
                    "label {value} appears more than once"
                )));
            }
        }
        Ok(Self { values, ordinals })
    }

    pub fn values(&self) -> &[i32] {
        &self.values
    }

    pub fn count(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    /// Position of `label` in this set.
    pub fn ordinal(&self, label: i32) -> Option<usize> {
        self.ordinals.get(&label).copied()
    }

    pub fn contains(&self, label: i32) -> bool {
        self.ordinals.contains_key(&label)
    }
}

/// Builds one [`LabelSet`] per output column.
///
/// `raw_unique` has one row per output column, padded to the largest column cardinality;
/// `counts[j]` entries of row `j` are valid and the rest is padding that is never read.
/// The matrix must hold `i32` unless `convert_dtype` is set.
///
/// # Errors
///
/// - `KnnError::InvalidVocabulary` if `counts` does not have one entry per row, a count is
///   negative or wider than the matrix, or a column lists a value twice.
/// - `KnnError::DtypeMismatch` if the matrix is not `i32` and conversion was not requested.
pub fn build_vocabulary<D: Device>(
    raw_unique: &DeviceArray<D>,
    counts: &[i64],
    convert_dtype: bool,
) -> Result<Vec<LabelSet>> {
    let (n_columns, width) = (raw_unique.rows(), raw_unique.cols());
    if counts.len() != n_columns {
        return Err(KnnError::InvalidVocabulary(format!(
            "{} counts for {} output columns",
            counts.len(),
            n_columns
        )));
    }

    let data: Cow<'_, [i32]> = match raw_unique.as_slice::<i32>() {
        Some(slice) => Cow::Borrowed(slice),
        None if convert_dtype => Cow::Owned(raw_unique.to_vec_as("label vocabulary")?),
        None => {
            return Err(KnnError::DtypeMismatch {
                what: "label vocabulary".into(),
                expected: Dtype::I32,
                got: raw_unique.dtype(),
            });
        }
    };

    counts
        .iter()
        .enumerate()
        .map(|(column, &count)| {
            let count = usize::try_from(count)
                .ok()
                .filter(|&c| c <= width)
                .ok_or_else(|| {
                    KnnError::InvalidVocabulary(format!(
                        "column {column} declares {count} labels, row width is {width}"
                    ))
                })?;
            let values = (0..count)
                .map(|i| match raw_unique.layout() {
                    Layout::RowMajor => data[column * width + i],
                    Layout::ColMajor => data[i * n_columns + column],
                })
                .collect();
            LabelSet::from_values(values).map_err(|e| match e {
                KnnError::InvalidVocabulary(msg) => {
                    KnnError::InvalidVocabulary(format!("column {column}: {msg}"))
                }
                other => other,
            })
        })
        .collect()
}
