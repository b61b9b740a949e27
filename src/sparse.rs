//! CPU sparse matrices for graph preprocessing.
//!
//! Interaction graphs arrive as COO triples and are assembled into
//! self-loop-augmented, symmetrically normalized composite adjacencies before
//! being densified for the tensor backend. All of this runs once at model
//! construction; the hot path only ever sees the resulting tensors.

use crate::error::{Error, Result};
use candle_core::{Device, Tensor};
use rayon::prelude::*;
use std::collections::HashMap;

/// Immutable sparse 0/1 (or positive-weight) matrix in COO form.
#[derive(Debug, Clone, PartialEq)]
pub struct SparseMatrix {
    rows: Vec<usize>,
    cols: Vec<usize>,
    vals: Vec<f32>,
    shape: (usize, usize),
}

impl SparseMatrix {
    /// Create from COO triples, validating every index against `shape`.
    pub fn new(
        rows: Vec<usize>,
        cols: Vec<usize>,
        vals: Vec<f32>,
        shape: (usize, usize),
    ) -> Result<Self> {
        if rows.len() != cols.len() || rows.len() != vals.len() {
            return Err(Error::InvalidConfig(format!(
                "COO vectors disagree in length: {} rows, {} cols, {} vals",
                rows.len(),
                cols.len(),
                vals.len()
            )));
        }
        for (&r, &c) in rows.iter().zip(cols.iter()) {
            if r >= shape.0 || c >= shape.1 {
                return Err(Error::IndexOutOfBounds {
                    row: r,
                    col: c,
                    shape,
                });
            }
        }
        Ok(Self {
            rows,
            cols,
            vals,
            shape,
        })
    }

    /// Unweighted matrix from index pairs (all values 1).
    pub fn from_indices(rows: Vec<usize>, cols: Vec<usize>, shape: (usize, usize)) -> Result<Self> {
        let vals = vec![1.0; rows.len()];
        Self::new(rows, cols, vals, shape)
    }

    /// Identity matrix of size n.
    pub fn identity(n: usize) -> Self {
        Self {
            rows: (0..n).collect(),
            cols: (0..n).collect(),
            vals: vec![1.0; n],
            shape: (n, n),
        }
    }

    pub fn shape(&self) -> (usize, usize) {
        self.shape
    }

    pub fn nnz(&self) -> usize {
        self.vals.len()
    }

    /// Iterate over (row, col, value) entries.
    pub fn iter(&self) -> impl Iterator<Item = (usize, usize, f32)> + '_ {
        self.rows
            .iter()
            .zip(self.cols.iter())
            .zip(self.vals.iter())
            .map(|((&r, &c), &v)| (r, c, v))
    }

    pub fn transpose(&self) -> Self {
        Self {
            rows: self.cols.clone(),
            cols: self.rows.clone(),
            vals: self.vals.clone(),
            shape: (self.shape.1, self.shape.0),
        }
    }

    /// Per-row sum of values.
    pub fn row_sums(&self) -> Vec<f32> {
        let mut sums = vec![0.0; self.shape.0];
        for (r, _, v) in self.iter() {
            sums[r] += v;
        }
        sums
    }

    /// Per-column sum of values.
    pub fn col_sums(&self) -> Vec<f32> {
        let mut sums = vec![0.0; self.shape.1];
        for (_, c, v) in self.iter() {
            sums[c] += v;
        }
        sums
    }

    /// Per-row L2 norm of values.
    pub fn row_l2_norms(&self) -> Vec<f32> {
        let mut sq = vec![0.0; self.shape.0];
        for (r, _, v) in self.iter() {
            sq[r] += v * v;
        }
        sq.into_iter().map(f32::sqrt).collect()
    }

    /// Scale row i by `factors[i]`.
    pub fn scale_rows(&self, factors: &[f32]) -> Self {
        debug_assert_eq!(factors.len(), self.shape.0);
        let vals = self
            .rows
            .iter()
            .zip(self.vals.iter())
            .map(|(&r, &v)| v * factors[r])
            .collect();
        Self {
            rows: self.rows.clone(),
            cols: self.cols.clone(),
            vals,
            shape: self.shape,
        }
    }

    /// Sparse-sparse product, accumulated row by row.
    pub fn matmul(&self, other: &Self) -> Result<Self> {
        if self.shape.1 != other.shape.0 {
            return Err(Error::ShapeMismatch {
                expected: (self.shape.1, self.shape.1),
                got: other.shape,
            });
        }
        let lhs_rows = self.bucket_rows();
        let rhs_rows = other.bucket_rows();

        let per_row: Vec<Vec<(usize, usize, f32)>> = lhs_rows
            .par_iter()
            .enumerate()
            .map(|(r, entries)| {
                let mut acc: HashMap<usize, f32> = HashMap::new();
                for &(k, v) in entries {
                    for &(c, w) in &rhs_rows[k] {
                        *acc.entry(c).or_insert(0.0) += v * w;
                    }
                }
                let mut out: Vec<(usize, usize, f32)> =
                    acc.into_iter().map(|(c, v)| (r, c, v)).collect();
                out.sort_unstable_by_key(|&(_, c, _)| c);
                out
            })
            .collect();

        let mut rows = Vec::new();
        let mut cols = Vec::new();
        let mut vals = Vec::new();
        for row in per_row {
            for (r, c, v) in row {
                rows.push(r);
                cols.push(c);
                vals.push(v);
            }
        }
        Ok(Self {
            rows,
            cols,
            vals,
            shape: (self.shape.0, other.shape.1),
        })
    }

    fn bucket_rows(&self) -> Vec<Vec<(usize, f32)>> {
        let mut buckets = vec![Vec::new(); self.shape.0];
        for (r, c, v) in self.iter() {
            buckets[r].push((c, v));
        }
        buckets
    }

    /// Assemble a 2x2 block matrix `[[a, b], [c, d]]`.
    ///
    /// Row/column dimensions of adjacent blocks must agree.
    pub fn block2x2(a: &Self, b: &Self, c: &Self, d: &Self) -> Result<Self> {
        if a.shape.0 != b.shape.0 || c.shape.0 != d.shape.0 {
            return Err(Error::ShapeMismatch {
                expected: (a.shape.0, c.shape.0),
                got: (b.shape.0, d.shape.0),
            });
        }
        if a.shape.1 != c.shape.1 || b.shape.1 != d.shape.1 {
            return Err(Error::ShapeMismatch {
                expected: (a.shape.1, b.shape.1),
                got: (c.shape.1, d.shape.1),
            });
        }
        let (ro, co) = (a.shape.0, a.shape.1);
        let shape = (a.shape.0 + c.shape.0, a.shape.1 + b.shape.1);
        let mut rows = Vec::with_capacity(a.nnz() + b.nnz() + c.nnz() + d.nnz());
        let mut cols = Vec::with_capacity(rows.capacity());
        let mut vals = Vec::with_capacity(rows.capacity());
        for (block, dr, dc) in [(a, 0, 0), (b, 0, co), (c, ro, 0), (d, ro, co)] {
            for (r, c, v) in block.iter() {
                rows.push(r + dr);
                cols.push(c + dc);
                vals.push(v);
            }
        }
        Ok(Self {
            rows,
            cols,
            vals,
            shape,
        })
    }

    /// Symmetric degree normalization: D_row^{-1/2} A D_col^{-1/2}.
    ///
    /// Zero-degree rows/columns are guarded with a 1e-8 epsilon so isolated
    /// nodes never divide by zero.
    pub fn laplace_normalize(&self) -> Self {
        let rs = self.row_sums();
        let cs = self.col_sums();
        let vals = self
            .iter()
            .map(|(r, c, v)| v / ((rs[r].sqrt() + 1e-8) * (cs[c].sqrt() + 1e-8)))
            .collect();
        Self {
            rows: self.rows.clone(),
            cols: self.cols.clone(),
            vals,
            shape: self.shape,
        }
    }

    /// Densify into a candle tensor for adjacency matmul.
    ///
    /// Duplicate entries accumulate, matching COO-to-dense conversion.
    pub fn to_tensor(&self, device: &Device) -> Result<Tensor> {
        let (r, c) = self.shape;
        let mut dense = vec![0.0f32; r * c];
        for (i, j, v) in self.iter() {
            dense[i * c + j] += v;
        }
        Ok(Tensor::from_vec(dense, (r, c), device)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::Device;

    fn toy() -> SparseMatrix {
        // 2x3: [[1, 0, 2], [0, 3, 0]]
        SparseMatrix::new(vec![0, 0, 1], vec![0, 2, 1], vec![1.0, 2.0, 3.0], (2, 3)).unwrap()
    }

    #[test]
    fn test_bounds_checked() {
        let bad = SparseMatrix::from_indices(vec![0, 2], vec![0, 0], (2, 3));
        assert!(matches!(bad, Err(Error::IndexOutOfBounds { row: 2, .. })));
    }

    #[test]
    fn test_length_mismatch_rejected() {
        let bad = SparseMatrix::new(vec![0], vec![0, 1], vec![1.0], (2, 2));
        assert!(bad.is_err());
    }

    #[test]
    fn test_sums_and_transpose() {
        let m = toy();
        assert_eq!(m.row_sums(), vec![3.0, 3.0]);
        assert_eq!(m.col_sums(), vec![1.0, 3.0, 2.0]);
        let t = m.transpose();
        assert_eq!(t.shape(), (3, 2));
        assert_eq!(t.row_sums(), vec![1.0, 3.0, 2.0]);
    }

    #[test]
    fn test_matmul_against_dense() {
        let m = toy();
        let t = m.transpose();
        // m @ m^T = [[5, 0], [0, 9]]
        let p = m.matmul(&t).unwrap();
        let dense = p.to_tensor(&Device::Cpu).unwrap().to_vec2::<f32>().unwrap();
        assert_eq!(dense, vec![vec![5.0, 0.0], vec![0.0, 9.0]]);
    }

    #[test]
    fn test_block2x2_shape() {
        let g = toy();
        let composite = SparseMatrix::block2x2(
            &SparseMatrix::identity(2),
            &g,
            &g.transpose(),
            &SparseMatrix::identity(3),
        )
        .unwrap();
        assert_eq!(composite.shape(), (5, 5));
        assert_eq!(composite.nnz(), 2 + 3 + 3 + 3);
    }

    #[test]
    fn test_laplace_normalize_is_pure() {
        let g = toy();
        let a = g.laplace_normalize();
        let b = g.laplace_normalize();
        assert_eq!(a, b);
    }

    #[test]
    fn test_laplace_normalize_isolated_row() {
        // Row 1 has no entries at all; nothing to divide, nothing to blow up.
        let g = SparseMatrix::new(vec![0], vec![0], vec![4.0], (2, 2)).unwrap();
        let n = g.laplace_normalize();
        let v: f32 = n.iter().map(|(_, _, v)| v).sum();
        assert!(v.is_finite());
    }
}
