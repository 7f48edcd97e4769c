//! CPU kernels backing `shardknn`.
//!
//! These functions know nothing about ranks, partitions or labels. They operate on flat
//! row-major slices and are parallelized with `rayon`, so they can be swapped for device
//! kernels without touching the orchestration code.

use num_traits::{FromPrimitive, Num, NumAssign, ToPrimitive};
use std::fmt::Debug;
use thiserror::Error;

pub mod cpu_distance;
pub mod cpu_topk;
pub mod cpu_transpose;

pub use cpu_distance::{Metric, cpu_pairwise_distances};
pub use cpu_topk::{Candidate, TopK, cpu_fold_tile};
pub use cpu_transpose::cpu_transpose;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum KernelError {
    #[error("Shape mismatch: expected {expected:?}, got {got:?}")]
    ShapeMismatch {
        expected: Vec<usize>,
        got: Vec<usize>,
    },
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),
}

pub type Result<T> = std::result::Result<T, KernelError>;

/// Trait bound for elements that can be moved around by kernels.
/// This mirrors `Element` in the main crate to avoid circular dependencies.
pub trait KernelElem:
    Num + NumAssign + Copy + Clone + Debug + Send + Sync + FromPrimitive + ToPrimitive + PartialOrd
{
}

impl<T> KernelElem for T where
    T: Num
        + NumAssign
        + Copy
        + Clone
        + Debug
        + Send
        + Sync
        + FromPrimitive
        + ToPrimitive
        + PartialOrd
{
}
