//! Payloads exchanged in collective rounds.

use crate::error::{KnnError, Result};
use crate::partition::PartitionDescriptor;
use shardknn_kernels::{Candidate, Metric};

/// A candidate neighbor together with its label in every output column.
///
/// Labels travel with the candidate because only the rank owning an index row can resolve
/// the row's labels.
#[derive(Debug, Clone, PartialEq)]
pub struct Neighbor {
    pub candidate: Candidate,
    pub labels: Vec<i32>,
}

/// What a rank was asked to compute, exchanged in the handshake.
///
/// Every field decides the round schedule or the result, so every rank must hold the same
/// values, local ranks aside.
#[derive(Debug, Clone, PartialEq)]
pub struct CallShape {
    pub index: PartitionDescriptor,
    pub queries: PartitionDescriptor,
    pub k: usize,
    pub batch_size: usize,
    pub index_tile_rows: usize,
    pub metric: Metric,
    /// Label values of every output column, in tie-breaking order.
    pub vocabulary: Vec<Vec<i32>>,
}

impl CallShape {
    /// Checks that `peer` was asked for the same call as this rank.
    ///
    /// # Errors
    ///
    /// `InvalidPartition` for a different index or query layout, `InvalidVocabulary` for a
    /// different vocabulary, and `Config` for any other setting.
    pub fn check_agrees(&self, peer: usize, other: &Self) -> Result<()> {
        if !self.index.agrees_with(&other.index) {
            return Err(KnnError::InvalidPartition(format!(
                "rank {peer} was given a different index partitioning"
            )));
        }
        if !self.queries.agrees_with(&other.queries) {
            return Err(KnnError::InvalidPartition(format!(
                "rank {peer} was given a different query partitioning"
            )));
        }
        if self.vocabulary != other.vocabulary {
            return Err(KnnError::InvalidVocabulary(format!(
                "rank {peer} was given a different vocabulary"
            )));
        }
        let settings = [
            ("k", self.k, other.k),
            ("batch_size", self.batch_size, other.batch_size),
            ("index_tile_rows", self.index_tile_rows, other.index_tile_rows),
        ];
        for (name, mine, theirs) in settings {
            if mine != theirs {
                return Err(KnnError::Config(format!(
                    "rank {peer} uses {name} = {theirs}, this rank uses {mine}"
                )));
            }
        }
        if self.metric != other.metric {
            return Err(KnnError::Config(format!(
                "rank {peer} uses metric {:?}, this rank uses {:?}",
                other.metric, self.metric
            )));
        }
        Ok(())
    }
}

/// What a rank contributes to one round.
#[derive(Debug, Clone, PartialEq)]
pub enum Payload {
    /// Nothing to say this round.
    Empty,
    /// Handshake: the call this rank was asked to run.
    Ready(Box<CallShape>),
    /// A batch of query rows, row-major, `data.len() == rows * cols`.
    Queries {
        rows: usize,
        cols: usize,
        data: Vec<f32>,
    },
    /// For each query row of the batch, this rank's nearest local neighbors.
    Candidates(Vec<Vec<Neighbor>>),
    /// This rank has failed; every peer must abandon the call.
    Abort(String),
}

impl Payload {
    pub fn is_abort(&self) -> bool {
        matches!(self, Payload::Abort(_))
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Payload::Empty => "empty",
            Payload::Ready(_) => "ready",
            Payload::Queries { .. } => "queries",
            Payload::Candidates(_) => "candidates",
            Payload::Abort(_) => "abort",
        }
    }
}

/// Fails with `CollectiveFailure` if any rank contributed [`Payload::Abort`] to a round.
pub fn ensure_no_abort(payloads: &[Payload]) -> Result<()> {
    for (rank, payload) in payloads.iter().enumerate() {
        if let Payload::Abort(reason) = payload {
            return Err(KnnError::CollectiveFailure(format!(
                "rank {rank} aborted: {reason}"
            )));
        }
    }
    Ok(())
}

/// A payload in transit, tagged with its sender and round.
#[derive(Debug, Clone)]
pub struct Envelope {
    pub from: usize,
    pub round: u64,
    pub payload: Payload,
}
