//! Batch scheduling.
//!
//! Bounds peak memory by splitting a partition's rows into fixed-size batches. The plan
//! depends only on the row count and the batch size, so every rank derives the same batch
//! sequence for a partition without communicating.

use crate::error::{KnnError, Result};
use std::ops::Range;

/// Ascending, non-overlapping row ranges covering `0..rows`.
///
/// Every range but the last holds exactly `batch_size` rows. A batch size larger than the
/// row count yields one batch; zero rows yield none.
///
/// ```rust
/// use shardknn::batch::BatchPlan;
///
/// let batches: Vec<_> = BatchPlan::new(5, 2).unwrap().collect();
/// assert_eq!(batches, vec![0..2, 2..4, 4..5]);
/// ```
#[derive(Debug, Clone)]
pub struct BatchPlan {
    rows: usize,
    batch_size: usize,
    next_start: usize,
}

impl BatchPlan {
    /// # Errors
    ///
    /// Returns `KnnError::InvalidBatchSize` if `batch_size == 0`.
    pub fn new(rows: usize, batch_size: usize) -> Result<Self> {
        if batch_size == 0 {
            return Err(KnnError::InvalidBatchSize(batch_size));
        }
        Ok(Self {
            rows,
            batch_size,
            next_start: 0,
        })
    }

    /// Number of batches the plan yields in total.
    pub fn num_batches(&self) -> usize {
        self.rows.div_ceil(self.batch_size)
    }
}

impl Iterator for BatchPlan {
    type Item = Range<usize>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.next_start >= self.rows {
            return None;
        }
        let start = self.next_start;
        let end = (start + self.batch_size).min(self.rows);
        self.next_start = end;
        Some(start..end)
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        let remaining = (self.rows - self.next_start.min(self.rows)).div_ceil(self.batch_size);
        (remaining, Some(remaining))
    }
}

impl ExactSizeIterator for BatchPlan {}
