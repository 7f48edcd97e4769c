use crate::{KernelError, Result};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};

/// Distance metric used to rank neighbors.
///
/// Every metric is oriented so that smaller means closer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Metric {
    /// Euclidean (L2) distance.
    #[default]
    Euclidean,
    /// Squared Euclidean distance. Same ranking as `Euclidean`, without the square root.
    SqEuclidean,
    /// Manhattan (L1) distance.
    Manhattan,
    /// Cosine distance $1 - \cos(a,b)$. Zero vectors are at distance 1 from everything.
    Cosine,
    /// Negated inner product, for maximum inner product search.
    InnerProduct,
}

impl Metric {
    /// Distance between two rows of equal length.
    #[inline]
    pub fn distance(self, a: &[f32], b: &[f32]) -> f32 {
        match self {
            Metric::Euclidean => sq_euclidean(a, b).sqrt(),
            Metric::SqEuclidean => sq_euclidean(a, b),
            Metric::Manhattan => a.iter().zip(b).map(|(x, y)| (x - y).abs()).sum(),
            Metric::Cosine => {
                let mut dot = 0.0f32;
                let mut norm_a = 0.0f32;
                let mut norm_b = 0.0f32;
                for (&x, &y) in a.iter().zip(b) {
                    dot += x * y;
                    norm_a += x * x;
                    norm_b += y * y;
                }
                if norm_a == 0.0 || norm_b == 0.0 {
                    return 1.0;
                }
                1.0 - (dot / (norm_a.sqrt() * norm_b.sqrt())).clamp(-1.0, 1.0)
            }
            Metric::InnerProduct => -a.iter().zip(b).map(|(x, y)| x * y).sum::<f32>(),
        }
    }
}

#[inline]
fn sq_euclidean(a: &[f32], b: &[f32]) -> f32 {
    a.iter()
        .zip(b)
        .map(|(x, y)| {
            let d = x - y;
            d * d
        })
        .sum()
}

/// CPU implementation of a pairwise distance tile.
///
/// `queries` is `n_queries x dim` and `index` is `n_index x dim`, both row-major. Returns
/// the `n_queries x n_index` row-major distance matrix.
///
/// Each output row is computed independently from its query row alone, so a query's
/// distances do not depend on which other queries share the tile.
pub fn cpu_pairwise_distances(
    queries: &[f32],
    index: &[f32],
    dim: usize,
    metric: Metric,
) -> Result<Vec<f32>> {
    if dim == 0 {
        return Err(KernelError::InvalidArgument(
            "distance dimension must be positive".into(),
        ));
    }
    if queries.len() % dim != 0 {
        return Err(KernelError::ShapeMismatch {
            expected: vec![queries.len() / dim * dim],
            got: vec![queries.len()],
        });
    }
    if index.len() % dim != 0 {
        return Err(KernelError::ShapeMismatch {
            expected: vec![index.len() / dim * dim],
            got: vec![index.len()],
        });
    }

    let n_index = index.len() / dim;
    let n_queries = queries.len() / dim;
    let mut out = vec![0.0f32; n_queries * n_index];
    if n_index == 0 {
        return Ok(out);
    }

    out.par_chunks_mut(n_index)
        .zip(queries.par_chunks(dim))
        .for_each(|(out_row, query)| {
            for (out_elem, row) in out_row.iter_mut().zip(index.chunks_exact(dim)) {
                *out_elem = metric.distance(query, row);
            }
        });

    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_euclidean_tile() {
        let queries = vec![0.0, 0.0, 1.0, 1.0]; // 2x2
        let index = vec![3.0, 4.0, 1.0, 1.0, 0.0, 0.0]; // 3x2
        let out = cpu_pairwise_distances(&queries, &index, 2, Metric::Euclidean).unwrap();
        let expected = [5.0, 2.0f32.sqrt(), 0.0, 13.0f32.sqrt(), 0.0, 2.0f32.sqrt()];
        for (got, want) in out.iter().zip(expected) {
            assert!((got - want).abs() < 1e-6, "got {got}, want {want}");
        }
    }

    #[test]
    fn test_sq_euclidean_and_manhattan() {
        let a = [1.0, 2.0, 3.0];
        let b = [4.0, 6.0, 3.0];
        assert_eq!(Metric::SqEuclidean.distance(&a, &b), 25.0);
        assert_eq!(Metric::Manhattan.distance(&a, &b), 7.0);
    }

    #[test]
    fn test_cosine_zero_vector() {
        assert_eq!(Metric::Cosine.distance(&[0.0, 0.0], &[1.0, 0.0]), 1.0);
        assert!(Metric::Cosine.distance(&[1.0, 0.0], &[2.0, 0.0]).abs() < 1e-6);
    }

    #[test]
    fn test_inner_product_orders_larger_dot_closer() {
        let q = [1.0, 1.0];
        let near = Metric::InnerProduct.distance(&q, &[5.0, 5.0]);
        let far = Metric::InnerProduct.distance(&q, &[1.0, 0.0]);
        assert!(near < far);
    }

    #[test]
    fn test_rows_independent_of_tile() {
        let queries = vec![0.5, 1.5, -2.0, 3.0, 4.0, 0.25];
        let index = vec![1.0, 1.0, 2.0, 2.0];
        let full = cpu_pairwise_distances(&queries, &index, 2, Metric::Euclidean).unwrap();
        let second = cpu_pairwise_distances(&queries[2..4], &index, 2, Metric::Euclidean).unwrap();
        assert_eq!(&full[2..4], second.as_slice());
    }

    #[test]
    fn test_dimension_mismatch() {
        let err = cpu_pairwise_distances(&[1.0, 2.0, 3.0], &[1.0, 2.0], 2, Metric::Euclidean);
        assert!(matches!(err, Err(KernelError::ShapeMismatch { .. })));
        let err = cpu_pairwise_distances(&[1.0], &[1.0], 0, Metric::Euclidean);
        assert!(matches!(err, Err(KernelError::InvalidArgument(_))));
    }
}
