//! Majority voting over a label vocabulary.
//!
//! Each of a query's k neighbors casts one vote per output column. The winner is the
//! label with the most votes; ties go to the label listed first in the column's
//! [`LabelSet`]. Votes are not weighted by distance.

use crate::distributed::Neighbor;
use crate::error::{KnnError, Result};
use crate::vocab::LabelSet;

/// Vote tally for one output column, reusable across query rows.
#[derive(Debug, Clone)]
pub struct Ballot<'v> {
    column: usize,
    set: &'v LabelSet,
    counts: Vec<u32>,
}

impl<'v> Ballot<'v> {
    /// # Errors
    ///
    /// Returns `KnnError::EmptyLabelSet` if `set` has no labels to vote for.
    pub fn new(column: usize, set: &'v LabelSet) -> Result<Self> {
        if set.is_empty() {
            return Err(KnnError::EmptyLabelSet { column });
        }
        Ok(Self {
            column,
            set,
            counts: vec![0; set.count()],
        })
    }

    /// Records one vote for `label`.
    ///
    /// # Errors
    ///
    /// Returns `KnnError::InvalidVocabulary` if `label` is not in the column's label set.
    pub fn cast(&mut self, label: i32) -> Result<()> {
        let ordinal = self.set.ordinal(label).ok_or_else(|| {
            KnnError::InvalidVocabulary(format!(
                "neighbor label {label} is not in the vocabulary of column {}",
                self.column
            ))
        })?;
        self.counts[ordinal] += 1;
        Ok(())
    }

    /// The label with most votes, ties broken by smallest ordinal.
    pub fn winner(&self) -> i32 {
        let mut best = 0;
        for (ordinal, &count) in self.counts.iter().enumerate() {
            // Strictly greater, so the earliest ordinal keeps a tie.
            if count > self.counts[best] {
                best = ordinal;
            }
        }
        self.set.values()[best]
    }

    /// Clears the tally for the next query row.
    pub fn reset(&mut self) {
        self.counts.fill(0);
    }
}

/// Ballots for every output column of a vocabulary.
pub fn ballots(vocabulary: &[LabelSet]) -> Result<Vec<Ballot<'_>>> {
    vocabulary
        .iter()
        .enumerate()
        .map(|(column, set)| Ballot::new(column, set))
        .collect()
}

/// Votes every output column for one query row and writes the winners to `out`.
///
/// `out.len()` must equal `ballots.len()`, and every neighbor must carry one label per column.
pub fn predict_row(
    neighbors: &[Neighbor],
    ballots: &mut [Ballot<'_>],
    out: &mut [i32],
) -> Result<()> {
    let n_outputs = ballots.len();
    for (column, (ballot, slot)) in ballots.iter_mut().zip(out.iter_mut()).enumerate() {
        ballot.reset();
        for neighbor in neighbors {
            let label = neighbor.labels.get(column).copied().ok_or_else(|| {
                KnnError::ShapeMismatch {
                    what: format!("labels of neighbor {}", neighbor.candidate.index),
                    expected: vec![n_outputs],
                    got: vec![neighbor.labels.len()],
                }
            })?;
            ballot.cast(label)?;
        }
        *slot = ballot.winner();
    }
    Ok(())
}
