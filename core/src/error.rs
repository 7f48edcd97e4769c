//! Error types for distributed classification.

use crate::buffer::{Dtype, Layout};
use shardknn_kernels::KernelError;
use thiserror::Error;

/// Errors returned by `shardknn`.
///
/// Construction-time variants (`InvalidPartition`, `DtypeMismatch`, `InvalidVocabulary`,
/// `InvalidK`, `EmptyLabelSet`, ...) are detected locally before any collective round.
/// `CollectiveFailure` is raised on every rank once any rank has failed mid-call.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum KnnError {
    /// A partition list is empty, negative, or does not add up to the declared row count.
    #[error("Invalid partition: {0}")]
    InvalidPartition(String),

    /// A buffer has the wrong element type and conversion was not requested.
    #[error("Dtype mismatch for {what}: expected {expected}, got {got}")]
    DtypeMismatch {
        what: String,
        expected: Dtype,
        got: Dtype,
    },

    /// The label vocabulary is malformed, or a label is outside it.
    #[error("Invalid vocabulary: {0}")]
    InvalidVocabulary(String),

    /// `k` is outside `1..=total index rows`.
    #[error("Invalid k: {k} (index holds {total_rows} rows)")]
    InvalidK { k: usize, total_rows: usize },

    /// An output column has no valid labels to vote for.
    #[error("Output column {column} has an empty label set")]
    EmptyLabelSet { column: usize },

    /// A peer rank failed, disconnected, or timed out during a round.
    #[error("Collective failure: {0}")]
    CollectiveFailure(String),

    /// `batch_size` (or the index tile size) is zero.
    #[error("Invalid batch size: {0}")]
    InvalidBatchSize(usize),

    /// A caller-supplied layout flag disagrees with the buffer's actual layout.
    #[error("Layout mismatch for {what}: declared {declared:?}, buffer is {actual:?}")]
    LayoutMismatch {
        what: String,
        declared: Layout,
        actual: Layout,
    },

    /// A buffer's shape, or the number of buffers, disagrees with its descriptor.
    #[error("Shape mismatch for {what}: expected {expected:?}, got {got:?}")]
    ShapeMismatch {
        what: String,
        expected: Vec<usize>,
        got: Vec<usize>,
    },

    /// The classification configuration could not be loaded or is inconsistent.
    #[error("Configuration error: {0}")]
    Config(String),

    #[error(transparent)]
    Kernel(#[from] KernelError),
}

pub type Result<T> = std::result::Result<T, KnnError>;

impl From<toml::de::Error> for KnnError {
    fn from(e: toml::de::Error) -> Self {
        KnnError::Config(e.to_string())
    }
}
