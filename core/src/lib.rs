//! # shardknn
//!
//! `shardknn` is a distributed K-Nearest-Neighbors classifier for data that is horizontally
//! partitioned across ranks. Every rank holds some partitions of the index and of the
//! queries; the engine finds, for every query row, the k nearest index rows across *all*
//! ranks and predicts each output column by majority vote over a fixed label vocabulary.
//!
//! Ranks talk through a [`CollectiveBackend`]. The crate ships [`CpuBackend`], which runs
//! ranks as threads of one process, and a [`Cpu`] device whose kernels are parallelized with
//! `rayon`.
//!
//! ## Modules
//!
//! - [`partition`]: How a logical matrix is split into `(rank, rows)` partitions.
//! - [`shard`]: Views of the caller's local buffers, borrowed when possible.
//! - [`vocab`]: Per-column label vocabularies.
//! - [`engine`]: The distributed search and vote protocol.
//! - [`distributed`]: Collective rounds between ranks.
//! - [`config`]: `ClassifyConfig`, loadable from TOML.
//!
//! ## Example
//!
//! ```rust
//! use shardknn::{
//!     ClassifyConfig, CollectiveBackend, Context, Cpu, CpuBackend, DeviceArray, KnnInputs,
//!     knn_classify,
//! };
//! use std::thread;
//!
//! // Two ranks, each holding one index partition and one query partition.
//! let handles: Vec<_> = CpuBackend::mesh(2, None)
//!     .into_iter()
//!     .map(|comm| {
//!         thread::spawn(move || {
//!             let rank = comm.rank();
//!             let (points, labels, query) = if rank == 0 {
//!                 (vec![0.0f32, 1.0], vec![0, 0], 0.2f32)
//!             } else {
//!                 (vec![10.0f32, 11.0], vec![1, 1], 10.4f32)
//!             };
//!             let index = vec![DeviceArray::row_major(points, 2, 1).unwrap()];
//!             let labels = vec![DeviceArray::row_major(labels, 2, 1).unwrap()];
//!             let queries = vec![DeviceArray::row_major(vec![query], 1, 1).unwrap()];
//!             let unique = DeviceArray::row_major(vec![0, 1], 1, 2).unwrap();
//!             let inputs = KnnInputs {
//!                 index: &index,
//!                 index_parts: &[(0, 2), (1, 2)],
//!                 n_index_rows: 4,
//!                 queries: &queries,
//!                 query_parts: &[(0, 1), (1, 1)],
//!                 n_query_rows: 2,
//!                 n_cols: 1,
//!                 labels: &labels,
//!                 unique_labels: &unique,
//!                 n_unique: &[2],
//!                 index_row_major: true,
//!                 query_row_major: true,
//!                 labels_row_major: true,
//!             };
//!             let config = ClassifyConfig::default().with_k(2);
//!             let results = knn_classify(&Context::new(&comm, &Cpu), &inputs, &config).unwrap();
//!             (rank, results[0].predictions.data()[0])
//!         })
//!     })
//!     .collect();
//!
//! for handle in handles {
//!     let (rank, prediction) = handle.join().unwrap();
//!     assert_eq!(prediction, rank as i32);
//! }
//! ```

pub mod api;
pub mod batch;
pub mod buffer;
pub mod config;
pub mod distributed;
pub mod engine;
pub mod error;
pub mod logging;
pub mod partition;
pub mod shard;
pub mod vocab;
pub mod vote;

pub use api::{KnnInputs, knn_classify};
pub use buffer::{Cpu, Device, DeviceArray, Dtype, Layout, Matrix};
pub use config::ClassifyConfig;
pub use distributed::{CollectiveBackend, CpuBackend};
pub use engine::{ClassifyRequest, Context, QueryBatchResult, classify};
pub use error::{KnnError, Result};
pub use partition::PartitionDescriptor;
pub use shard::{LabelTable, ShardOptions, ShardRegistry};
pub use shardknn_kernels::Metric;
pub use vocab::{LabelSet, build_vocabulary};
