//! Partition descriptors: how a logical matrix is split across ranks.
//!
//! A logical `total_rows x total_cols` matrix is stored as an ordered list of partitions, each
//! a contiguous block of rows owned by one rank. The order of that list, not the rank
//! numbers, defines the global row index space: partition 0 holds global rows
//! `[0, size0)`, partition 1 holds `[size0, size0 + size1)`, and so on.
//!
//! ```rust
//! use shardknn::partition::PartitionDescriptor;
//!
//! // Rank 0 owns rows [0, 4), rank 1 owns rows [4, 6).
//! let desc = PartitionDescriptor::build(6, 2, &[(0, 4), (1, 2)], 1).unwrap();
//! assert_eq!(desc.locate(5), Some((1, 1)));
//! assert_eq!(desc.global_index(1, 1), Some(5));
//! ```

use crate::error::{KnnError, Result};
use std::ops::Range;

/// One contiguous block of rows owned by a rank.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Part {
    pub rank: usize,
    pub rows: usize,
}

/// Describes the partitioning of a logical matrix and which rank is local.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PartitionDescriptor {
    total_rows: usize,
    total_cols: usize,
    parts: Vec<Part>,
    /// `offsets[i]` is the first global row of part `i`; `offsets[len]` is `total_rows`.
    offsets: Vec<usize>,
    local_rank: usize,
}

impl PartitionDescriptor {
    /// Builds a descriptor from raw `(rank, row_count)` pairs.
    ///
    /// # Errors
    ///
    /// Returns `KnnError::InvalidPartition` if `parts` is empty, a rank or row count is
    /// negative, the row counts do not sum to `total_rows`, or `local_rank` is negative.
    pub fn build(
        total_rows: usize,
        total_cols: usize,
        parts: &[(i64, i64)],
        local_rank: i64,
    ) -> Result<Self> {
        if parts.is_empty() {
            return Err(KnnError::InvalidPartition("partition list is empty".into()));
        }
        let local_rank = usize::try_from(local_rank).map_err(|_| {
            KnnError::InvalidPartition(format!("local rank {local_rank} is negative"))
        })?;

        let mut validated = Vec::with_capacity(parts.len());
        let mut offsets = Vec::with_capacity(parts.len() + 1);
        let mut sum = 0usize;
        for (i, &(rank, rows)) in parts.iter().enumerate() {
            let rank = usize::try_from(rank).map_err(|_| {
                KnnError::InvalidPartition(format!("partition {i} has negative rank {rank}"))
            })?;
            let rows = usize::try_from(rows).map_err(|_| {
                KnnError::InvalidPartition(format!("partition {i} has negative row count {rows}"))
            })?;
            offsets.push(sum);
            sum = sum.checked_add(rows).ok_or_else(|| {
                KnnError::InvalidPartition("row counts overflow".into())
            })?;
            validated.push(Part { rank, rows });
        }
        offsets.push(sum);

        if sum != total_rows {
            return Err(KnnError::InvalidPartition(format!(
                "row counts sum to {sum}, expected {total_rows}"
            )));
        }

        Ok(Self {
            total_rows,
            total_cols,
            parts: validated,
            offsets,
            local_rank,
        })
    }

    pub fn total_rows(&self) -> usize {
        self.total_rows
    }

    pub fn total_cols(&self) -> usize {
        self.total_cols
    }

    pub fn local_rank(&self) -> usize {
        self.local_rank
    }

    pub fn parts(&self) -> &[Part] {
        &self.parts
    }

    pub fn num_parts(&self) -> usize {
        self.parts.len()
    }

    /// First global row of every part, followed by `total_rows`.
    pub fn offsets(&self) -> &[usize] {
        &self.offsets
    }

    /// Global rows covered by part `part`.
    pub fn row_range(&self, part: usize) -> Option<Range<usize>> {
        (part < self.parts.len()).then(|| self.offsets[part]..self.offsets[part + 1])
    }

    /// Rank owning part `part`.
    pub fn owner_of(&self, part: usize) -> Option<usize> {
        self.parts.get(part).map(|p| p.rank)
    }

    /// Largest rank referenced by any part.
    pub fn max_rank(&self) -> usize {
        self.parts.iter().map(|p| p.rank).max().unwrap_or(0)
    }

    /// Parts owned by the local rank, as `(part index, part)`, in descriptor order.
    pub fn local_parts(&self) -> impl Iterator<Item = (usize, &Part)> + '_ {
        self.parts
            .iter()
            .enumerate()
            .filter(move |(_, p)| p.rank == self.local_rank)
    }

    /// Number of rows held by the local rank.
    pub fn local_rows(&self) -> usize {
        self.local_parts().map(|(_, p)| p.rows).sum()
    }

    /// Maps a global row index to `(part index, offset within the part)`.
    ///
    /// Empty parts never own a row. Returns `None` if `global >= total_rows`.
    pub fn locate(&self, global: usize) -> Option<(usize, usize)> {
        if global >= self.total_rows {
            return None;
        }
        // Last part whose first row is <= global; skips over empty parts sharing an offset.
        let part = self.offsets[..self.parts.len()].partition_point(|&start| start <= global) - 1;
        Some((part, global - self.offsets[part]))
    }

    /// Maps `(part index, offset)` back to a global row index.
    pub fn global_index(&self, part: usize, offset: usize) -> Option<usize> {
        let p = self.parts.get(part)?;
        (offset < p.rows).then(|| self.offsets[part] + offset)
    }

    /// True if both descriptors describe the same global layout, whatever their local rank.
    ///
    /// Ranks compare their descriptors this way in the handshake of every call.
    pub fn agrees_with(&self, other: &Self) -> bool {
        self.total_rows == other.total_rows
            && self.total_cols == other.total_cols
            && self.parts == other.parts
    }
}
