use crate::{KernelElem, KernelError, Result};
use rayon::prelude::*;

/// CPU implementation of a 2-D transpose.
///
/// `data` holds a `rows x cols` matrix in row-major order; the result holds the
/// `cols x rows` matrix, also row-major. Reading a column-major buffer of logical shape
/// `rows x cols` is the same as reading a row-major `cols x rows` buffer, so callers convert
/// column-major input with `cpu_transpose(data, cols, rows)`.
///
/// Work is split over the rows of the output, one `rayon` task per output row.
pub fn cpu_transpose<T>(data: &[T], rows: usize, cols: usize) -> Result<Vec<T>>
where
    T: KernelElem,
{
    if data.len() != rows * cols {
        return Err(KernelError::ShapeMismatch {
            expected: vec![rows * cols],
            got: vec![data.len()],
        });
    }
    if rows == 0 || cols == 0 {
        return Ok(Vec::new());
    }

    let mut out = vec![T::zero(); rows * cols];
    out.par_chunks_mut(rows)
        .enumerate()
        .for_each(|(c, out_row)| {
            // Output row `c` is input column `c`.
            for (r, out_elem) in out_row.iter_mut().enumerate() {
                *out_elem = data[r * cols + c];
            }
        });

    Ok(out)
}
