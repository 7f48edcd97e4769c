//! Distributed search and vote.
//!
//! Every rank calls [`classify`] with descriptors that agree on the global layout. The call
//! runs as a fixed sequence of collective rounds that every rank derives on its own from the
//! query descriptor and the batch size:
//!
//! 1. A handshake, in which every rank either reports the call it was asked to run (layouts,
//!    vocabulary, k, batch and tile sizes, metric) or aborts with its local validation error.
//!    Ranks asked to run different calls would derive different round schedules, so any
//!    disagreement fails every rank here.
//! 2. For each query partition in descriptor order, and each batch of its rows:
//!    the owner broadcasts the batch, every rank searches its local index shards tile by
//!    tile, and the owner gathers every rank's candidates, merges them into the global
//!    k nearest and votes.
//! 3. A device synchronization and a barrier.
//!
//! A rank that fails at any point still contributes an abort to the round it is in, so
//! that its peers fail with `CollectiveFailure` instead of waiting on it. Every rank
//! therefore leaves a call, failed or not, after the same number of rounds, and the backend
//! stays usable for the next call.

use crate::batch::BatchPlan;
use crate::buffer::{Cpu, Device, Matrix};
use crate::distributed::{CallShape, CollectiveBackend, Neighbor, Payload, ensure_no_abort};
use crate::error::{KnnError, Result};
use crate::partition::PartitionDescriptor;
use crate::shard::{LabelTable, ShardRegistry};
use crate::vocab::LabelSet;
use crate::vote::{self, Ballot};
use shardknn_kernels::{Candidate, Metric, TopK, cpu_fold_tile, cpu_pairwise_distances};
use std::ops::Range;
use std::time::Duration;
use tracing::{debug, info, trace, warn};

/// The collaborators a call runs against, passed explicitly and never retained.
pub struct Context<'c, C: CollectiveBackend, D: Device> {
    comm: &'c C,
    device: &'c D,
}

impl<'c, C: CollectiveBackend, D: Device> Context<'c, C, D> {
    pub fn new(comm: &'c C, device: &'c D) -> Self {
        Self { comm, device }
    }

    pub fn comm(&self) -> &'c C {
        self.comm
    }

    pub fn device(&self) -> &'c D {
        self.device
    }
}

/// Everything one rank contributes to a classification call.
#[derive(Debug, Clone, Copy)]
pub struct ClassifyRequest<'r> {
    /// Local index shards, one per local partition of `index_descriptor`.
    pub index: &'r ShardRegistry<'r>,
    pub index_descriptor: &'r PartitionDescriptor,
    /// Local query shards, one per local partition of `query_descriptor`.
    pub queries: &'r ShardRegistry<'r>,
    pub query_descriptor: &'r PartitionDescriptor,
    /// Labels of the local index shards.
    pub labels: &'r LabelTable<'r>,
    /// One label set per output column, identical on every rank.
    pub vocabulary: &'r [LabelSet],
    pub k: usize,
    pub batch_size: usize,
    pub metric: Metric,
    pub index_tile_rows: usize,
    /// Wait limit per round, installed on the backend for the duration of the call.
    pub round_timeout: Option<Duration>,
}

/// Results for one local query partition.
///
/// Row `i` of `indices` and `distances` lists the k nearest index rows of query row `i`,
/// nearest first, ties broken by ascending global index.
#[derive(Debug, Clone)]
pub struct QueryBatchResult<D: Device = Cpu> {
    /// Position of the partition in the query descriptor.
    pub partition: usize,
    /// `rows x n_outputs` predicted labels.
    pub predictions: Matrix<i32, D>,
    /// `rows x k` global row indices into the index.
    pub indices: Matrix<i64, D>,
    /// `rows x k` distances matching `indices`.
    pub distances: Matrix<f32, D>,
}

/// One batch of one query partition, the unit of a search round.
#[derive(Debug, Clone, PartialEq, Eq)]
struct BatchRound {
    part: usize,
    owner: usize,
    rows: Range<usize>,
}

/// Runs a distributed classification on this rank.
///
/// Returns one [`QueryBatchResult`] per local query partition, in descriptor order. Either
/// every result is complete or an error is returned; a failure on any rank fails the call on
/// every rank.
///
/// # Errors
///
/// - Local validation errors (`InvalidK`, `InvalidBatchSize`, `InvalidPartition`,
///   `ShapeMismatch`, `InvalidVocabulary`, `EmptyLabelSet`) on the rank that detected them.
/// - `InvalidPartition` on every rank if the ranks were given different layouts.
/// - `CollectiveFailure` on every other rank once one rank has failed, and on ranks that lose
///   contact with a peer.
pub fn classify<C: CollectiveBackend, D: Device>(
    ctx: &Context<'_, C, D>,
    request: &ClassifyRequest<'_>,
) -> Result<Vec<QueryBatchResult<D>>> {
    let comm = ctx.comm();
    let rank = comm.rank();
    let _timeout = RoundTimeout::install(comm, request.round_timeout);
    info!(
        rank,
        world_size = comm.world_size(),
        device = ctx.device().name(),
        k = request.k,
        batch_size = request.batch_size,
        index_parts = request.index.len(),
        query_parts = request.queries.len(),
        "knn classify started"
    );

    let (rounds, mut ballots) = match validate(rank, comm.world_size(), request) {
        Ok(prepared) => prepared,
        Err(e) => return Err(abort(comm, e)),
    };
    let shape = call_shape(request);
    let handshake = exchange(comm, Ok(Payload::Ready(Box::new(shape.clone()))))?;
    check_handshake(&handshake, &shape)?;

    let mut results = allocate_results(ctx.device(), request);
    let mut failure: Option<KnnError> = None;

    for round in &rounds {
        debug!(rank, part = round.part, rows = ?round.rows, "search round");

        let contribution = match failure.take() {
            Some(e) => Err(e),
            None => broadcast_contribution(rank, request, round),
        };
        let mut broadcast = exchange(comm, contribution)?;
        let cols = request.query_descriptor.total_cols();
        let found = take_queries(&mut broadcast, round, cols)
            .and_then(|queries| search_local(request, &queries, round.rows.len()));
        let gathered = gather(comm, round.owner, found.map(Payload::Candidates))?;

        if let Some(gathered) = gathered {
            let written = results
                .iter_mut()
                .find(|r| r.partition == round.part)
                .ok_or_else(|| {
                    KnnError::InvalidPartition(format!(
                        "query partition {} is not local to rank {rank}",
                        round.part
                    ))
                })
                .and_then(|result| finish_batch(gathered, round, request.k, &mut ballots, result));
            failure = written.err();
        }
    }

    let finished = match failure {
        Some(e) => Err(e),
        None => ctx.device().synchronize(),
    };
    match finished {
        Ok(()) => comm.barrier()?,
        Err(e) => return Err(abort(comm, e)),
    }

    info!(rank, partitions = results.len(), rounds = rounds.len(), "knn classify finished");
    Ok(results)
}

/// Local checks that need no communication. On success, returns the round schedule and one
/// ballot per output column.
fn validate<'v>(
    rank: usize,
    world_size: usize,
    request: &ClassifyRequest<'v>,
) -> Result<(Vec<BatchRound>, Vec<Ballot<'v>>)> {
    let index = request.index_descriptor;
    let query = request.query_descriptor;

    if request.k == 0 || request.k > index.total_rows() {
        return Err(KnnError::InvalidK {
            k: request.k,
            total_rows: index.total_rows(),
        });
    }
    if request.batch_size == 0 {
        return Err(KnnError::InvalidBatchSize(request.batch_size));
    }
    if request.index_tile_rows == 0 {
        return Err(KnnError::InvalidBatchSize(request.index_tile_rows));
    }

    for (what, descriptor) in [("index", index), ("query", query)] {
        if descriptor.local_rank() != rank {
            return Err(KnnError::InvalidPartition(format!(
                "{what} descriptor is for rank {}, this is rank {rank}",
                descriptor.local_rank()
            )));
        }
        if descriptor.max_rank() >= world_size {
            return Err(KnnError::InvalidPartition(format!(
                "{what} descriptor references rank {} in a group of {world_size}",
                descriptor.max_rank()
            )));
        }
    }
    if index.total_cols() != query.total_cols() {
        return Err(KnnError::InvalidPartition(format!(
            "index has {} columns, queries have {}",
            index.total_cols(),
            query.total_cols()
        )));
    }
    if index.total_cols() == 0 {
        return Err(KnnError::InvalidPartition("feature matrices have no columns".into()));
    }

    check_registry("index", request.index, index)?;
    check_registry("query", request.queries, query)?;
    let local_index: Vec<usize> = index.local_parts().map(|(part, _)| part).collect();
    if request.labels.parts() != local_index.as_slice() {
        return Err(KnnError::ShapeMismatch {
            what: "label partitions".into(),
            expected: local_index,
            got: request.labels.parts().to_vec(),
        });
    }
    let ballots = vote::ballots(request.vocabulary)?;
    request.labels.validate_against(request.vocabulary)?;

    let mut rounds = Vec::new();
    for (part, p) in query.parts().iter().enumerate() {
        for rows in BatchPlan::new(p.rows, request.batch_size)? {
            rounds.push(BatchRound {
                part,
                owner: p.rank,
                rows,
            });
        }
    }
    Ok((rounds, ballots))
}

fn check_registry(
    what: &str,
    registry: &ShardRegistry<'_>,
    descriptor: &PartitionDescriptor,
) -> Result<()> {
    let expected = descriptor
        .local_parts()
        .map(|(part, p)| (part, p.rows, descriptor.total_cols()));
    let got = registry.iter().map(|s| (s.part(), s.rows(), s.cols()));
    if !expected.eq(got) {
        return Err(KnnError::ShapeMismatch {
            what: format!("{what} shards"),
            expected: descriptor.local_parts().map(|(_, p)| p.rows).collect(),
            got: registry.iter().map(|s| s.rows()).collect(),
        });
    }
    Ok(())
}

fn call_shape(request: &ClassifyRequest<'_>) -> CallShape {
    CallShape {
        index: request.index_descriptor.clone(),
        queries: request.query_descriptor.clone(),
        k: request.k,
        batch_size: request.batch_size,
        index_tile_rows: request.index_tile_rows,
        metric: request.metric,
        vocabulary: request
            .vocabulary
            .iter()
            .map(|set| set.values().to_vec())
            .collect(),
    }
}

/// Every rank sees every rank's shape, so a disagreement fails all of them in this round.
fn check_handshake(payloads: &[Payload], shape: &CallShape) -> Result<()> {
    for (peer, payload) in payloads.iter().enumerate() {
        match payload {
            Payload::Ready(theirs) => shape.check_agrees(peer, theirs)?,
            other => return Err(unexpected(peer, "ready", other)),
        }
    }
    Ok(())
}

/// Installs a round timeout on a backend and restores the previous one when dropped.
pub(crate) struct RoundTimeout<'c, C: CollectiveBackend> {
    comm: &'c C,
    previous: Option<Duration>,
}

impl<'c, C: CollectiveBackend> RoundTimeout<'c, C> {
    pub(crate) fn install(comm: &'c C, timeout: Option<Duration>) -> Self {
        let previous = comm.round_timeout();
        comm.set_round_timeout(timeout);
        Self { comm, previous }
    }
}

impl<C: CollectiveBackend> Drop for RoundTimeout<'_, C> {
    fn drop(&mut self) {
        self.comm.set_round_timeout(self.previous);
    }
}

/// Contributes the outcome of local work to a round.
///
/// A local failure is still contributed, as an abort, and then returned unchanged.
fn exchange<C: CollectiveBackend>(comm: &C, outcome: Result<Payload>) -> Result<Vec<Payload>> {
    let payload = outcome.map_err(|e| abort(comm, e))?;
    let all = comm.exchange_round(payload)?;
    ensure_no_abort(&all)?;
    Ok(all)
}

/// As [`exchange`], gathering at `root`.
fn gather<C: CollectiveBackend>(
    comm: &C,
    root: usize,
    outcome: Result<Payload>,
) -> Result<Option<Vec<Payload>>> {
    let payload = outcome.map_err(|e| abort(comm, e))?;
    comm.gather(root, payload)
}

/// Tells every peer that this rank has failed, and hands back the failure.
pub(crate) fn abort<C: CollectiveBackend>(comm: &C, error: KnnError) -> KnnError {
    warn!(rank = comm.rank(), %error, "aborting collective call");
    // The round only carries the abort; this rank's own error takes precedence.
    if let Err(e) = comm.exchange_round(Payload::Abort(error.to_string())) {
        debug!(rank = comm.rank(), error = %e, "abort round failed");
    }
    error
}

fn broadcast_contribution(
    rank: usize,
    request: &ClassifyRequest<'_>,
    round: &BatchRound,
) -> Result<Payload> {
    if round.owner != rank {
        return Ok(Payload::Empty);
    }
    let shard = request.queries.get(round.part).ok_or_else(|| {
        KnnError::InvalidPartition(format!(
            "query partition {} is not local to rank {rank}",
            round.part
        ))
    })?;
    Ok(Payload::Queries {
        rows: round.rows.len(),
        cols: shard.cols(),
        data: shard.rows_slice(round.rows.clone()).to_vec(),
    })
}

fn take_queries(payloads: &mut [Payload], round: &BatchRound, cols: usize) -> Result<Vec<f32>> {
    let payload = payloads
        .get_mut(round.owner)
        .map(|p| std::mem::replace(p, Payload::Empty))
        .ok_or_else(|| {
            KnnError::CollectiveFailure(format!("no contribution from rank {}", round.owner))
        })?;
    match payload {
        Payload::Queries {
            rows,
            cols: c,
            data,
        } if rows == round.rows.len() && c == cols && data.len() == rows * cols => Ok(data),
        Payload::Queries { rows, cols: c, data } => Err(KnnError::CollectiveFailure(format!(
            "rank {} broadcast a malformed batch ({rows} x {c} with {} values), \
             expected {} x {cols}",
            round.owner,
            data.len(),
            round.rows.len()
        ))),
        other => Err(unexpected(round.owner, "queries", &other)),
    }
}

/// Nearest local index rows of each query, nearest first, with their labels.
fn search_local(
    request: &ClassifyRequest<'_>,
    queries: &[f32],
    n_queries: usize,
) -> Result<Vec<Vec<Neighbor>>> {
    let descriptor = request.index_descriptor;
    let cols = descriptor.total_cols();
    let mut lists: Vec<TopK> = (0..n_queries).map(|_| TopK::new(request.k)).collect();

    for shard in request.index.iter() {
        let first_row = descriptor.offsets()[shard.part()];
        for tile in BatchPlan::new(shard.rows(), request.index_tile_rows)? {
            let rows = shard.rows_slice(tile.clone());
            let distances = cpu_pairwise_distances(queries, rows, cols, request.metric)?;
            cpu_fold_tile(&distances, tile.len(), (first_row + tile.start) as u64, &mut lists)?;
            trace!(part = shard.part(), tile = ?tile, "folded index tile");
        }
    }

    lists
        .into_iter()
        .map(|list| {
            list.into_sorted_vec()
                .into_iter()
                .map(|candidate| resolve_labels(request, candidate))
                .collect::<Result<Vec<_>>>()
        })
        .collect()
}

/// Attaches the label row of a local index row to its candidate.
fn resolve_labels(request: &ClassifyRequest<'_>, candidate: Candidate) -> Result<Neighbor> {
    let (part, offset) = usize::try_from(candidate.index)
        .ok()
        .and_then(|global| request.index_descriptor.locate(global))
        .ok_or_else(|| {
            KnnError::InvalidPartition(format!("index row {} is out of range", candidate.index))
        })?;
    let labels = (0..request.labels.n_outputs())
        .map(|column| {
            request.labels.label(part, column, offset).ok_or_else(|| {
                KnnError::InvalidPartition(format!(
                    "no label for row {offset} of index partition {part}, column {column}"
                ))
            })
        })
        .collect::<Result<Vec<_>>>()?;
    Ok(Neighbor { candidate, labels })
}

/// Merges every rank's candidates for one query row into its `k` nearest, nearest first.
///
/// The result does not depend on the order in which candidates arrive.
pub fn merge_neighbors<I>(candidates: I, k: usize) -> Vec<Neighbor>
where
    I: IntoIterator<Item = Neighbor>,
{
    let mut merged: Vec<Neighbor> = candidates.into_iter().collect();
    merged.sort_unstable_by(|a, b| a.candidate.cmp(&b.candidate));
    merged.truncate(k);
    merged
}

/// Owner side of a round: merges the gathered candidates, votes, and writes the batch.
fn finish_batch<D: Device>(
    gathered: Vec<Payload>,
    round: &BatchRound,
    k: usize,
    ballots: &mut [Ballot<'_>],
    result: &mut QueryBatchResult<D>,
) -> Result<()> {
    let n_queries = round.rows.len();
    let mut per_rank = Vec::with_capacity(gathered.len());
    for (peer, payload) in gathered.into_iter().enumerate() {
        match payload {
            Payload::Candidates(lists) if lists.len() == n_queries => {
                per_rank.push(lists.into_iter())
            }
            other => return Err(unexpected(peer, "candidates", &other)),
        }
    }

    for row in round.rows.clone() {
        let row_candidates = per_rank
            .iter_mut()
            .filter_map(|lists| lists.next())
            .flatten();
        let merged = merge_neighbors(row_candidates, k);
        if merged.len() != k {
            return Err(KnnError::CollectiveFailure(format!(
                "query row {row} of partition {} gathered {} of {k} neighbors",
                round.part,
                merged.len()
            )));
        }
        for (j, neighbor) in merged.iter().enumerate() {
            result.indices.row_mut(row)[j] = neighbor.candidate.index as i64;
            result.distances.row_mut(row)[j] = neighbor.candidate.distance;
        }
        vote::predict_row(&merged, ballots, result.predictions.row_mut(row))?;
    }
    Ok(())
}

fn allocate_results<D: Device>(
    device: &D,
    request: &ClassifyRequest<'_>,
) -> Vec<QueryBatchResult<D>> {
    let n_outputs = request.vocabulary.len();
    request
        .query_descriptor
        .local_parts()
        .map(|(partition, p)| QueryBatchResult {
            partition,
            predictions: Matrix::zeros_on(device, p.rows, n_outputs),
            indices: Matrix::zeros_on(device, p.rows, request.k),
            distances: Matrix::zeros_on(device, p.rows, request.k),
        })
        .collect()
}

fn unexpected(peer: usize, expected: &str, got: &Payload) -> KnnError {
    KnnError::CollectiveFailure(format!(
        "expected {expected} from rank {peer}, got {}",
        got.kind()
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::buffer::{DeviceArray, Layout};
    use crate::distributed::CpuBackend;
    use crate::shard::ShardOptions;

    fn neighbor(index: u64, distance: f32, label: i32) -> Neighbor {
        Neighbor {
            candidate: Candidate::new(index, distance),
            labels: vec![label],
        }
    }

    #[test]
    fn test_merge_is_order_independent() {
        let a = vec![neighbor(0, 0.3, 0), neighbor(4, 0.9, 1)];
        let b = vec![neighbor(7, 0.1, 1), neighbor(2, 0.3, 0)];
        let ab = merge_neighbors(a.iter().chain(&b).cloned(), 3);
        let ba = merge_neighbors(b.iter().chain(&a).cloned(), 3);
        assert_eq!(ab, ba);
        let got: Vec<u64> = ab.iter().map(|n| n.candidate.index).collect();
        assert_eq!(got, vec![7, 0, 2]);
    }

    /// A single-rank index of 1-D points at 0, 1, ..., n-1 labelled by parity.
    struct Fixture {
        index: Vec<DeviceArray>,
        labels: Vec<DeviceArray>,
        queries: Vec<DeviceArray>,
        index_desc: PartitionDescriptor,
        query_desc: PartitionDescriptor,
        vocabulary: Vec<LabelSet>,
    }

    impl Fixture {
        fn new(n: usize, query_points: Vec<f32>) -> Self {
            let n_queries = query_points.len();
            let points: Vec<f32> = (0..n).map(|i| i as f32).collect();
            let labels: Vec<i32> = (0..n).map(|i| (i % 2) as i32).collect();
            Self {
                index: vec![DeviceArray::row_major(points, n, 1).unwrap()],
                labels: vec![DeviceArray::row_major(labels, n, 1).unwrap()],
                queries: vec![DeviceArray::row_major(query_points, n_queries, 1).unwrap()],
                index_desc: PartitionDescriptor::build(n, 1, &[(0, n as i64)], 0).unwrap(),
                query_desc: PartitionDescriptor::build(n_queries, 1, &[(0, n_queries as i64)], 0)
                    .unwrap(),
                vocabulary: vec![LabelSet::from_values(vec![0, 1]).unwrap()],
            }
        }

        fn run(&self, k: usize, batch_size: usize, tile: usize) -> Result<Vec<QueryBatchResult>> {
            let options = ShardOptions::default();
            let row_major = Layout::RowMajor;
            let index =
                ShardRegistry::wrap(&self.index, &self.index_desc, row_major, options, "index")?;
            let queries =
                ShardRegistry::wrap(&self.queries, &self.query_desc, row_major, options, "query")?;
            let labels = LabelTable::wrap(&self.labels, &self.index_desc, 1, row_major, options)?;
            let request = ClassifyRequest {
                index: &index,
                index_descriptor: &self.index_desc,
                queries: &queries,
                query_descriptor: &self.query_desc,
                labels: &labels,
                vocabulary: &self.vocabulary,
                k,
                batch_size,
                metric: Metric::Euclidean,
                index_tile_rows: tile,
                round_timeout: None,
            };
            let comm = CpuBackend::mesh(1, None).pop().unwrap();
            classify(&Context::new(&comm, &Cpu), &request)
        }
    }

    #[test]
    fn test_single_rank_neighbors_and_vote() {
        let fixture = Fixture::new(6, vec![0.2, 4.6]);
        let results = fixture.run(3, 1, 2).unwrap();
        assert_eq!(results.len(), 1);
        let result = &results[0];
        assert_eq!(result.indices.row(0), &[0, 1, 2]);
        assert_eq!(result.indices.row(1), &[5, 4, 3]);
        // Rows 0, 1, 2 carry labels 0, 1, 0; rows 5, 4, 3 carry 1, 0, 1.
        assert_eq!(result.predictions.data(), &[0, 1]);
        let d = result.distances.row(0);
        assert!(d.windows(2).all(|w| w[0] <= w[1]));
    }

    #[test]
    fn test_tiling_does_not_change_results() {
        let fixture = Fixture::new(9, vec![3.5, 7.1, 0.0]);
        let whole = fixture.run(4, 8, 9).unwrap();
        for tile in 1..9 {
            let tiled = fixture.run(4, 8, tile).unwrap();
            assert_eq!(tiled[0].indices.data(), whole[0].indices.data());
            assert_eq!(tiled[0].predictions.data(), whole[0].predictions.data());
        }
    }

    #[test]
    fn test_equidistant_neighbors_break_on_index() {
        // Query 2.0 is equidistant from 1 and 3.
        let fixture = Fixture::new(5, vec![2.0]);
        let results = fixture.run(3, 4, 4).unwrap();
        assert_eq!(results[0].indices.row(0), &[2, 1, 3]);
    }

    #[test]
    fn test_local_validation_errors() {
        let fixture = Fixture::new(4, vec![1.0]);
        assert!(matches!(fixture.run(0, 1, 1), Err(KnnError::InvalidK { k: 0, .. })));
        assert!(matches!(fixture.run(5, 1, 1), Err(KnnError::InvalidK { total_rows: 4, .. })));
        assert!(matches!(fixture.run(2, 0, 1), Err(KnnError::InvalidBatchSize(0))));
        assert!(matches!(fixture.run(2, 1, 0), Err(KnnError::InvalidBatchSize(0))));
    }

    #[test]
    fn test_descriptor_must_match_rank() {
        let mut fixture = Fixture::new(2, vec![1.0]);
        fixture.index_desc = PartitionDescriptor::build(2, 1, &[(0, 1), (1, 1)], 0).unwrap();
        fixture.index = vec![DeviceArray::row_major(vec![0.0f32], 1, 1).unwrap()];
        fixture.labels = vec![DeviceArray::row_major(vec![0], 1, 1).unwrap()];
        // Rank 1 does not exist in a group of one.
        assert!(matches!(fixture.run(1, 1, 1), Err(KnnError::InvalidPartition(_))));
    }

    #[test]
    fn test_round_timeout_is_scoped_to_the_call() {
        let comm = CpuBackend::mesh(1, Some(Duration::from_secs(3))).pop().unwrap();
        {
            let _guard = RoundTimeout::install(&comm, Some(Duration::from_millis(5)));
            assert_eq!(comm.round_timeout(), Some(Duration::from_millis(5)));
        }
        assert_eq!(comm.round_timeout(), Some(Duration::from_secs(3)));
    }
}
