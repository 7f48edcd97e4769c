//! One-call entry point from raw caller buffers.

use crate::buffer::{Cpu, Device, DeviceArray, Layout};
use crate::config::ClassifyConfig;
use crate::distributed::CollectiveBackend;
use crate::engine::{self, ClassifyRequest, Context, QueryBatchResult, RoundTimeout};
use crate::error::Result;
use crate::partition::PartitionDescriptor;
use crate::shard::{LabelTable, ShardRegistry};
use crate::vocab::{self, LabelSet};
use tracing::debug;

/// The raw inputs of one rank, as a host application holds them.
///
/// Partition lists are `(owning rank, row count)` pairs in global row order and must be the
/// same on every rank. Buffers are listed for the local partitions only, in that order.
#[derive(Debug, Clone, Copy)]
pub struct KnnInputs<'a, D: Device = Cpu> {
    pub index: &'a [DeviceArray<D>],
    pub index_parts: &'a [(i64, i64)],
    pub n_index_rows: usize,
    pub queries: &'a [DeviceArray<D>],
    pub query_parts: &'a [(i64, i64)],
    pub n_query_rows: usize,
    /// Feature columns shared by index and queries.
    pub n_cols: usize,
    /// One `rows x n_outputs` label buffer per local index partition.
    pub labels: &'a [DeviceArray<D>],
    /// One row of candidate labels per output column, padded to the widest column.
    pub unique_labels: &'a DeviceArray<D>,
    /// Valid entries in each row of `unique_labels`.
    pub n_unique: &'a [i64],
    pub index_row_major: bool,
    pub query_row_major: bool,
    pub labels_row_major: bool,
}

/// Descriptors, shards and vocabulary built from [`KnnInputs`].
struct Prepared<'a> {
    index_descriptor: PartitionDescriptor,
    query_descriptor: PartitionDescriptor,
    index: ShardRegistry<'a>,
    queries: ShardRegistry<'a>,
    labels: LabelTable<'a>,
    vocabulary: Vec<LabelSet>,
}

fn prepare<'a, D: Device>(
    rank: usize,
    inputs: &KnnInputs<'a, D>,
    config: &ClassifyConfig,
) -> Result<Prepared<'a>> {
    config.validate()?;
    let local_rank = rank as i64;
    let options = config.shard_options();

    let index_descriptor = PartitionDescriptor::build(
        inputs.n_index_rows,
        inputs.n_cols,
        inputs.index_parts,
        local_rank,
    )?;
    let query_descriptor = PartitionDescriptor::build(
        inputs.n_query_rows,
        inputs.n_cols,
        inputs.query_parts,
        local_rank,
    )?;

    let vocabulary =
        vocab::build_vocabulary(inputs.unique_labels, inputs.n_unique, config.convert_dtype)?;
    let index = ShardRegistry::wrap(
        inputs.index,
        &index_descriptor,
        Layout::from_row_major_flag(inputs.index_row_major),
        options,
        "index",
    )?;
    let queries = ShardRegistry::wrap(
        inputs.queries,
        &query_descriptor,
        Layout::from_row_major_flag(inputs.query_row_major),
        options,
        "query",
    )?;
    let labels = LabelTable::wrap(
        inputs.labels,
        &index_descriptor,
        vocabulary.len(),
        Layout::from_row_major_flag(inputs.labels_row_major),
        options,
    )?;

    debug!(
        rank,
        borrowed_index = index.iter().filter(|s| s.is_borrowed()).count(),
        borrowed_queries = queries.iter().filter(|s| s.is_borrowed()).count(),
        outputs = vocabulary.len(),
        "inputs wrapped"
    );

    Ok(Prepared {
        index_descriptor,
        query_descriptor,
        index,
        queries,
        labels,
        vocabulary,
    })
}

/// Builds descriptors, shards and vocabulary from raw buffers, then classifies.
///
/// Must be called by every rank of the group. A rank whose inputs are rejected fails with
/// the construction error, and its peers fail with `CollectiveFailure`. Every round of the
/// call waits at most `config.round_timeout()` on a peer; the backend's own timeout is
/// restored afterwards.
///
/// ```rust
/// use shardknn::{ClassifyConfig, Context, Cpu, CpuBackend, DeviceArray, KnnInputs, knn_classify};
///
/// let comm = CpuBackend::mesh(1, None).pop().unwrap();
/// let index = vec![DeviceArray::row_major(vec![0.0f32, 1.0, 5.0], 3, 1).unwrap()];
/// let labels = vec![DeviceArray::row_major(vec![7, 7, 9], 3, 1).unwrap()];
/// let queries = vec![DeviceArray::row_major(vec![0.4f32], 1, 1).unwrap()];
/// let unique = DeviceArray::row_major(vec![7, 9], 1, 2).unwrap();
///
/// let inputs = KnnInputs {
///     index: &index,
///     index_parts: &[(0, 3)],
///     n_index_rows: 3,
///     queries: &queries,
///     query_parts: &[(0, 1)],
///     n_query_rows: 1,
///     n_cols: 1,
///     labels: &labels,
///     unique_labels: &unique,
///     n_unique: &[2],
///     index_row_major: true,
///     query_row_major: true,
///     labels_row_major: true,
/// };
/// let config = ClassifyConfig::default().with_k(3);
/// let results = knn_classify(&Context::new(&comm, &Cpu), &inputs, &config).unwrap();
/// assert_eq!(results[0].predictions.data(), &[7]);
/// assert_eq!(results[0].indices.data(), &[0, 1, 2]);
/// ```
pub fn knn_classify<C: CollectiveBackend, D: Device>(
    ctx: &Context<'_, C, D>,
    inputs: &KnnInputs<'_, D>,
    config: &ClassifyConfig,
) -> Result<Vec<QueryBatchResult<D>>> {
    let _timeout = RoundTimeout::install(ctx.comm(), config.round_timeout());
    let prepared = match prepare(ctx.comm().rank(), inputs, config) {
        Ok(prepared) => prepared,
        Err(e) => return Err(engine::abort(ctx.comm(), e)),
    };

    let request = ClassifyRequest {
        index: &prepared.index,
        index_descriptor: &prepared.index_descriptor,
        queries: &prepared.queries,
        query_descriptor: &prepared.query_descriptor,
        labels: &prepared.labels,
        vocabulary: &prepared.vocabulary,
        k: config.k,
        batch_size: config.batch_size,
        metric: config.metric,
        index_tile_rows: config.index_tile_rows,
        round_timeout: config.round_timeout(),
    };
    engine::classify(ctx, &request)
}
