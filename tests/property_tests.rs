//! Property-based tests for the sparse preprocessing layer.
//!
//! These verify invariants that should hold for any interaction graph:
//! - Normalization never produces NaN or infinity
//! - Composite adjacencies stay symmetric
//! - Structural operations preserve shape and entry counts

use candle_core::Device;
use proptest::prelude::*;
use routix::SparseMatrix;

/// Generate a small bipartite edge set over a (rows x cols) grid.
///
/// Edges are unique, matching a 0/1 interaction matrix.
fn arb_graph() -> impl Strategy<Value = (Vec<usize>, Vec<usize>, usize, usize)> {
    (1usize..8, 1usize..8).prop_flat_map(|(rows, cols)| {
        let max_edges = (rows * cols).min(19);
        proptest::collection::hash_set((0..rows, 0..cols), 0..=max_edges)
            .prop_map(move |edges| {
                let (r, c): (Vec<_>, Vec<_>) = edges.into_iter().unzip();
                (r, c, rows, cols)
            })
    })
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(200))]

    #[test]
    fn laplace_normalize_is_finite((r, c, rows, cols) in arb_graph()) {
        let m = SparseMatrix::from_indices(r, c, (rows, cols)).unwrap();
        let n = m.laplace_normalize();
        for (_, _, v) in n.iter() {
            prop_assert!(v.is_finite());
            prop_assert!(v >= 0.0);
        }
    }

    #[test]
    fn laplace_normalize_is_pure((r, c, rows, cols) in arb_graph()) {
        let m = SparseMatrix::from_indices(r, c, (rows, cols)).unwrap();
        prop_assert_eq!(m.laplace_normalize(), m.laplace_normalize());
    }

    #[test]
    fn transpose_is_an_involution((r, c, rows, cols) in arb_graph()) {
        let m = SparseMatrix::from_indices(r, c, (rows, cols)).unwrap();
        prop_assert_eq!(m.transpose().transpose(), m);
    }

    #[test]
    fn composite_adjacency_is_symmetric((r, c, rows, cols) in arb_graph()) {
        let m = SparseMatrix::from_indices(r, c, (rows, cols)).unwrap();
        let adj = routix::graph::normalized_atom_adjacency(&m, &Device::Cpu).unwrap();
        let d = adj.to_vec2::<f32>().unwrap();
        let n = rows + cols;
        for i in 0..n {
            for j in 0..n {
                prop_assert!((d[i][j] - d[j][i]).abs() < 1e-5);
            }
        }
    }

    #[test]
    fn matmul_matches_dense_reference((r, c, rows, cols) in arb_graph()) {
        let m = SparseMatrix::from_indices(r, c, (rows, cols)).unwrap();
        let p = m.matmul(&m.transpose()).unwrap();
        prop_assert_eq!(p.shape(), (rows, rows));

        // Dense reference product.
        let dm = m.to_tensor(&Device::Cpu).unwrap().to_vec2::<f32>().unwrap();
        let dp = p.to_tensor(&Device::Cpu).unwrap().to_vec2::<f32>().unwrap();
        for i in 0..rows {
            for j in 0..rows {
                let mut want = 0.0f32;
                for k in 0..cols {
                    want += dm[i][k] * dm[j][k];
                }
                prop_assert!((dp[i][j] - want).abs() < 1e-3);
            }
        }
    }

    #[test]
    fn bundle_cosine_entries_bounded((r, c, rows, cols) in arb_graph()) {
        let m = SparseMatrix::from_indices(r, c, (rows, cols)).unwrap();
        let bb = routix::graph::bundle_cosine(&m).unwrap();
        prop_assert_eq!(bb.shape(), (rows, rows));
        for (_, _, v) in bb.iter() {
            prop_assert!(v.is_finite());
            prop_assert!(v >= -1e-6);
            prop_assert!(v <= 1.0 + 1e-4);
        }
    }

    #[test]
    fn membership_normalized_rows_bounded((r, c, rows, cols) in arb_graph()) {
        let m = SparseMatrix::from_indices(r, c, (rows, cols)).unwrap();
        let n = routix::graph::membership_normalized(&m);
        for s in n.row_sums() {
            prop_assert!(s.is_finite());
            prop_assert!(s <= 1.0 + 1e-4);
        }
    }
}
