#![allow(dead_code)]

use shardknn::buffer::Element;
use shardknn::{
    ClassifyConfig, CollectiveBackend, Context, Cpu, CpuBackend, DeviceArray, KnnInputs, Metric,
    QueryBatchResult, Result, knn_classify,
};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

/// Runs `f` once per rank, each on its own thread, and returns the outcomes by rank.
pub fn run_ranks<R, F>(world_size: usize, f: F) -> Vec<R>
where
    R: Send + 'static,
    F: Fn(CpuBackend) -> R + Send + Sync + 'static,
{
    shardknn::logging::init_test_logging();
    let f = Arc::new(f);
    let handles: Vec<_> = CpuBackend::mesh(world_size, Some(Duration::from_secs(10)))
        .into_iter()
        .map(|comm| {
            let f = Arc::clone(&f);
            thread::spawn(move || f(comm))
        })
        .collect();
    handles.into_iter().map(|h| h.join().unwrap()).collect()
}

/// The row-major rows of `data` that `rank` owns under `parts`, one buffer per partition.
pub fn local_buffers<T: Element + Clone>(
    data: &[T],
    cols: usize,
    parts: &[(i64, i64)],
    rank: usize,
) -> Vec<DeviceArray> {
    let mut start = 0;
    let mut out = Vec::new();
    for &(owner, rows) in parts {
        let rows = rows as usize;
        if owner as usize == rank {
            let slice = data[start * cols..(start + rows) * cols].to_vec();
            out.push(DeviceArray::row_major(slice, rows, cols).unwrap());
        }
        start += rows;
    }
    out
}

/// A single-output classification problem, split across ranks by its partition lists.
#[derive(Debug, Clone)]
pub struct Dataset {
    pub n_cols: usize,
    /// Index rows, row-major.
    pub points: Vec<f32>,
    /// One label per index row.
    pub labels: Vec<i32>,
    /// Query rows, row-major.
    pub queries: Vec<f32>,
    pub index_parts: Vec<(i64, i64)>,
    pub query_parts: Vec<(i64, i64)>,
    /// The label vocabulary, in tie-breaking order.
    pub unique: Vec<i32>,
}

/// Results of one query row, gathered from whichever rank owned it.
#[derive(Debug, Clone, PartialEq)]
pub struct QueryRow {
    pub prediction: i32,
    pub indices: Vec<i64>,
    pub distances: Vec<f32>,
}

impl Dataset {
    pub fn n_index_rows(&self) -> usize {
        self.labels.len()
    }

    pub fn n_query_rows(&self) -> usize {
        self.queries.len() / self.n_cols
    }

    pub fn world_size(&self) -> usize {
        self.index_parts
            .iter()
            .chain(&self.query_parts)
            .map(|&(rank, _)| rank as usize + 1)
            .max()
            .unwrap_or(1)
    }

    /// Runs `knn_classify` on every rank.
    pub fn classify(&self, config: &ClassifyConfig) -> Vec<Result<Vec<QueryBatchResult>>> {
        let data = Arc::new(self.clone());
        let config = config.clone();
        run_ranks(self.world_size(), move |comm| {
            let rank = comm.rank();
            let index = local_buffers(&data.points, data.n_cols, &data.index_parts, rank);
            let labels = local_buffers(&data.labels, 1, &data.index_parts, rank);
            let queries = local_buffers(&data.queries, data.n_cols, &data.query_parts, rank);
            let unique = DeviceArray::row_major(data.unique.clone(), 1, data.unique.len()).unwrap();
            let inputs = KnnInputs {
                index: &index,
                index_parts: &data.index_parts,
                n_index_rows: data.n_index_rows(),
                queries: &queries,
                query_parts: &data.query_parts,
                n_query_rows: data.n_query_rows(),
                n_cols: data.n_cols,
                labels: &labels,
                unique_labels: &unique,
                n_unique: &[data.unique.len() as i64],
                index_row_major: true,
                query_row_major: true,
                labels_row_major: true,
            };
            knn_classify(&Context::new(&comm, &Cpu), &inputs, &config)
        })
    }

    /// Runs on every rank and reassembles the per-rank results in global query order.
    pub fn classify_rows(&self, config: &ClassifyConfig) -> Vec<QueryRow> {
        let mut offsets = Vec::with_capacity(self.query_parts.len());
        let mut start = 0;
        for &(_, rows) in &self.query_parts {
            offsets.push(start);
            start += rows as usize;
        }

        let mut rows: Vec<Option<QueryRow>> = vec![None; self.n_query_rows()];
        for results in self.classify(config) {
            for result in results.unwrap() {
                for i in 0..result.predictions.rows() {
                    rows[offsets[result.partition] + i] = Some(QueryRow {
                        prediction: result.predictions.row(i)[0],
                        indices: result.indices.row(i).to_vec(),
                        distances: result.distances.row(i).to_vec(),
                    });
                }
            }
        }
        rows.into_iter().map(|row| row.unwrap()).collect()
    }

    /// Single-process reference: sort every index row, keep k, vote.
    pub fn brute_force(&self, k: usize, metric: Metric) -> Vec<QueryRow> {
        self.queries
            .chunks(self.n_cols)
            .map(|query| {
                let mut all: Vec<(f32, usize)> = self
                    .points
                    .chunks(self.n_cols)
                    .enumerate()
                    .map(|(i, row)| (metric.distance(query, row), i))
                    .collect();
                all.sort_by(|a, b| a.0.total_cmp(&b.0).then(a.1.cmp(&b.1)));
                all.truncate(k);

                let mut votes = vec![0usize; self.unique.len()];
                for &(_, i) in &all {
                    let ordinal = self.unique.iter().position(|&u| u == self.labels[i]).unwrap();
                    votes[ordinal] += 1;
                }
                let best = votes.iter().max().unwrap();
                let winner = votes.iter().position(|v| v == best).unwrap();

                QueryRow {
                    prediction: self.unique[winner],
                    indices: all.iter().map(|&(_, i)| i as i64).collect(),
                    distances: all.iter().map(|&(d, _)| d).collect(),
                }
            })
            .collect()
    }
}
