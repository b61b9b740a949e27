//! Graph preprocessing for bundle recommendation.
//!
//! Builds the structures the propagation layers consume:
//!
//! - edge lists over the raw bipartite graphs (for attentive routing),
//! - self-loop-augmented composite adjacencies `[[I, G], [G^T, I]]` with
//!   symmetric degree normalization (for plain propagation),
//! - the bundle-bundle cosine block and the "non-atom" user-bundle composite
//!   `[[I, UB], [UB^T, BB]]` that carries higher-order signal.

use crate::error::{Error, Result};
use crate::sparse::SparseMatrix;
use candle_core::{Device, Tensor};

/// Role tag for a bipartite interaction graph.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GraphRole {
    UserItem,
    UserBundle,
    BundleItem,
}

/// Immutable edge-list view of a bipartite interaction graph.
///
/// Head indices live in `[0, num_a)`, tail indices in `[0, num_b)`. Created
/// once at model construction and never mutated afterward.
#[derive(Debug, Clone)]
pub struct BipartiteGraph {
    role: GraphRole,
    heads: Vec<u32>,
    tails: Vec<u32>,
    shape: (usize, usize),
}

impl BipartiteGraph {
    /// Build from a raw sparse matrix, checking it against the declared shape.
    pub fn from_sparse(
        raw: &SparseMatrix,
        expected: (usize, usize),
        role: GraphRole,
    ) -> Result<Self> {
        if raw.shape() != expected {
            return Err(Error::ShapeMismatch {
                expected,
                got: raw.shape(),
            });
        }
        let mut heads = Vec::with_capacity(raw.nnz());
        let mut tails = Vec::with_capacity(raw.nnz());
        for (r, c, _) in raw.iter() {
            heads.push(r as u32);
            tails.push(c as u32);
        }
        Ok(Self {
            role,
            heads,
            tails,
            shape: expected,
        })
    }

    pub fn role(&self) -> GraphRole {
        self.role
    }

    pub fn num_edges(&self) -> usize {
        self.heads.len()
    }

    pub fn shape(&self) -> (usize, usize) {
        self.shape
    }

    pub fn heads(&self) -> &[u32] {
        &self.heads
    }

    pub fn tails(&self) -> &[u32] {
        &self.tails
    }

    /// Head indices as a u32 tensor for gather/scatter ops.
    pub fn heads_tensor(&self, device: &Device) -> Result<Tensor> {
        Ok(Tensor::from_vec(
            self.heads.clone(),
            (self.heads.len(),),
            device,
        )?)
    }

    /// Tail indices as a u32 tensor for gather/scatter ops.
    pub fn tails_tensor(&self, device: &Device) -> Result<Tensor> {
        Ok(Tensor::from_vec(
            self.tails.clone(),
            (self.tails.len(),),
            device,
        )?)
    }
}

/// Self-loop-augmented composite adjacency `[[I_r, G], [G^T, I_c]]`.
pub fn atom_composite(graph: &SparseMatrix) -> Result<SparseMatrix> {
    let (r, c) = graph.shape();
    SparseMatrix::block2x2(
        &SparseMatrix::identity(r),
        graph,
        &graph.transpose(),
        &SparseMatrix::identity(c),
    )
}

/// Laplace-normalized composite adjacency as a dense tensor.
pub fn normalized_atom_adjacency(graph: &SparseMatrix, device: &Device) -> Result<Tensor> {
    atom_composite(graph)?.laplace_normalize().to_tensor(device)
}

/// Bundle-bundle cosine similarity derived from bundle-item membership.
///
/// Each bundle's membership row is scaled by its L2 norm (epsilon-guarded),
/// then multiplied with its own transpose.
pub fn bundle_cosine(bundle_item: &SparseMatrix) -> Result<SparseMatrix> {
    let inv_norms: Vec<f32> = bundle_item
        .row_l2_norms()
        .into_iter()
        .map(|n| 1.0 / (n + 1e-8))
        .collect();
    let normalized = bundle_item.scale_rows(&inv_norms);
    normalized.matmul(&normalized.transpose())
}

/// Non-atom composite `[[I_u, UB], [UB^T, BB_cos]]`.
pub fn non_atom_composite(
    user_bundle: &SparseMatrix,
    bundle_bundle: &SparseMatrix,
) -> Result<SparseMatrix> {
    let (u, _) = user_bundle.shape();
    SparseMatrix::block2x2(
        &SparseMatrix::identity(u),
        user_bundle,
        &user_bundle.transpose(),
        bundle_bundle,
    )
}

/// Bundle-item matrix with each row divided by the bundle's member count.
pub fn membership_normalized(bundle_item: &SparseMatrix) -> SparseMatrix {
    let inv_size: Vec<f32> = bundle_item
        .row_sums()
        .into_iter()
        .map(|s| 1.0 / (s + 1e-8))
        .collect();
    bundle_item.scale_rows(&inv_size)
}

/// Per-bundle member-item adjacency lists, for member sampling.
pub fn bundle_member_lists(bundle_item: &SparseMatrix) -> Vec<Vec<u32>> {
    let mut lists = vec![Vec::new(); bundle_item.shape().0];
    for (b, i, _) in bundle_item.iter() {
        lists[b].push(i as u32);
    }
    lists
}
