use crate::{KernelError, Result};
use rayon::prelude::*;
use std::cmp::Ordering;
use std::collections::BinaryHeap;

/// A neighbor candidate: a global row index and its distance to the query.
///
/// Candidates are totally ordered by distance, then by index, so that merging the same
/// candidates in any order yields the same result. Every NaN distance, whatever its sign or
/// payload, orders after `+inf`.
#[derive(Debug, Clone, Copy)]
pub struct Candidate {
    pub index: u64,
    pub distance: f32,
}

impl Candidate {
    pub fn new(index: u64, distance: f32) -> Self {
        Self { index, distance }
    }
}

impl PartialEq for Candidate {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for Candidate {}

impl PartialOrd for Candidate {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Candidate {
    fn cmp(&self, other: &Self) -> Ordering {
        order_key(self.distance)
            .total_cmp(&order_key(other.distance))
            .then(self.index.cmp(&other.index))
    }
}

/// Positive quiet NaN, which `total_cmp` places above `+inf`.
const CANONICAL_NAN: f32 = f32::from_bits(0x7fc0_0000);

fn order_key(distance: f32) -> f32 {
    if distance.is_nan() {
        CANONICAL_NAN
    } else {
        distance
    }
}

/// Running k-smallest selection for one query row.
///
/// Backed by a max-heap of at most `k` candidates, so the current worst survivor is always
/// at the top and can be evicted in `O(log k)`.
#[derive(Debug, Clone)]
pub struct TopK {
    k: usize,
    heap: BinaryHeap<Candidate>,
}

impl TopK {
    pub fn new(k: usize) -> Self {
        Self {
            k,
            heap: BinaryHeap::with_capacity(k + 1),
        }
    }

    pub fn k(&self) -> usize {
        self.k
    }

    pub fn len(&self) -> usize {
        self.heap.len()
    }

    pub fn is_empty(&self) -> bool {
        self.heap.is_empty()
    }

    /// Offers a candidate; it is kept only if it beats the current worst survivor.
    pub fn push(&mut self, candidate: Candidate) {
        if self.k == 0 {
            return;
        }
        if self.heap.len() < self.k {
            self.heap.push(candidate);
        } else if self.heap.peek().is_some_and(|worst| candidate < *worst) {
            self.heap.pop();
            self.heap.push(candidate);
        }
    }

    /// Consumes the selection, returning candidates nearest first.
    pub fn into_sorted_vec(self) -> Vec<Candidate> {
        self.heap.into_sorted_vec()
    }
}

/// Folds one distance tile into the running top-k of each query row.
///
/// `tile` is `lists.len() x cols` row-major; column `j` of the tile is global row
/// `first_index + j`. Rows are processed in parallel.
pub fn cpu_fold_tile(
    tile: &[f32],
    cols: usize,
    first_index: u64,
    lists: &mut [TopK],
) -> Result<()> {
    if tile.len() != lists.len() * cols {
        return Err(KernelError::ShapeMismatch {
            expected: vec![lists.len(), cols],
            got: vec![tile.len()],
        });
    }
    if cols == 0 {
        return Ok(());
    }

    lists
        .par_iter_mut()
        .zip(tile.par_chunks(cols))
        .for_each(|(list, row)| {
            for (j, &distance) in row.iter().enumerate() {
                list.push(Candidate::new(first_index + j as u64, distance));
            }
        });

    Ok(())
}
