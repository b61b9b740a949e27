//! Disentangled star-routing propagation.
//!
//! The router splits node embeddings into independent factor segments and
//! refines per-factor edge attention over a few routing iterations, in the
//! spirit of capsule-network dynamic routing:
//!
//! 1. Softmax the accumulated edge logits across factors (each edge's factor
//!    weights compete; they sum to 1 over factors, not over neighbors).
//! 2. Per factor, degree-normalize the weighted edges and propagate each
//!    side's segment through the other, adding the result residually.
//! 3. Score each edge with a tanh-attention dot product between the updated
//!    head segment and the original tail segment, and fold the score back
//!    into the accumulator.
//!
//! Factor segments are concatenated at each layer's exit; after all layers
//! the input and every layer output are mean-pooled into the final
//! representation.

use crate::error::{Error, Result};
use crate::graph::BipartiteGraph;
use candle_core::{DType, Tensor};
use candle_nn::ops::softmax;

const DEGREE_EPS: f64 = 1e-10;

/// Running per-(factor, edge) attention logits for one routing call.
///
/// Allocated at the start of `route`, mutated across routing iterations, and
/// discarded with the call; only its softmax is ever read.
struct EdgeWeightAccumulator {
    logits: Tensor,
}

impl EdgeWeightAccumulator {
    fn ones(n_factors: usize, num_edges: usize, device: &candle_core::Device) -> Result<Self> {
        Ok(Self {
            logits: Tensor::ones((n_factors, num_edges), DType::F32, device)?,
        })
    }

    /// Factor-competition softmax: each edge's weights sum to 1 across factors.
    fn scores(&self) -> Result<Tensor> {
        Ok(softmax(&self.logits, 0)?)
    }

    fn add(&mut self, iteration_logits: &Tensor) -> Result<()> {
        self.logits = (&self.logits + iteration_logits)?;
        Ok(())
    }

    fn into_logits(self) -> Tensor {
        self.logits
    }
}

/// Output of one routing call.
#[derive(Debug)]
pub struct RoutingOutput {
    /// Final A-side representation, mean-pooled over layers (numA x E).
    pub a: Tensor,
    /// Final B-side representation, mean-pooled over layers (numB x E).
    pub b: Tensor,
    /// Final edge attention logits (F x num_edges), for diagnostics.
    pub edge_logits: Tensor,
}

/// Factor-routing propagation engine over a bipartite edge list.
#[derive(Debug, Clone, Copy)]
pub struct FactorRouter {
    n_factors: usize,
    n_iterations: usize,
    n_layers: usize,
}

impl FactorRouter {
    /// Create a router; all counts must be positive.
    pub fn new(n_factors: usize, n_iterations: usize, n_layers: usize) -> Result<Self> {
        if n_factors == 0 || n_iterations == 0 || n_layers == 0 {
            return Err(Error::InvalidConfig(format!(
                "router counts must be positive (factors={n_factors}, iterations={n_iterations}, layers={n_layers})"
            )));
        }
        Ok(Self {
            n_factors,
            n_iterations,
            n_layers,
        })
    }

    pub fn n_factors(&self) -> usize {
        self.n_factors
    }

    /// Run star routing over `graph`.
    ///
    /// `feat_a` is (numA x E), `feat_b` is (numB x E); E must be divisible by
    /// the factor count. Returns mean-pooled representations of width E for
    /// both sides plus the final attention accumulator.
    pub fn route(
        &self,
        graph: &BipartiteGraph,
        feat_a: &Tensor,
        feat_b: &Tensor,
    ) -> Result<RoutingOutput> {
        let (num_a, width) = feat_a.dims2()?;
        let (num_b, width_b) = feat_b.dims2()?;
        if width != width_b {
            return Err(Error::ShapeMismatch {
                expected: (num_b, width),
                got: (num_b, width_b),
            });
        }
        if (num_a, num_b) != graph.shape() {
            return Err(Error::ShapeMismatch {
                expected: graph.shape(),
                got: (num_a, num_b),
            });
        }
        if width % self.n_factors != 0 {
            return Err(Error::InvalidConfig(format!(
                "embedding width {} not divisible by factor count {}",
                width, self.n_factors
            )));
        }

        let device = feat_a.device();
        let heads = graph.heads_tensor(device)?;
        let tails = graph.tails_tensor(device)?;
        let seg = width / self.n_factors;

        let mut feature_a = feat_a.clone();
        let mut feature_b = feat_b.clone();
        let mut all_a = vec![feat_a.clone()];
        let mut all_b = vec![feat_b.clone()];
        let mut acc = EdgeWeightAccumulator::ones(self.n_factors, graph.num_edges(), device)?;

        for _ in 0..self.n_layers {
            let mut ego_a = Vec::with_capacity(self.n_factors);
            let mut ego_b = Vec::with_capacity(self.n_factors);
            for i in 0..self.n_factors {
                // Segments feed index_select, which needs contiguous storage.
                ego_a.push(feature_a.narrow(1, i * seg, seg)?.contiguous()?);
                ego_b.push(feature_b.narrow(1, i * seg, seg)?.contiguous()?);
            }

            let mut layer_a = Vec::new();
            let mut layer_b = Vec::new();
            for t in 0..self.n_iterations {
                let scores = acc.scores()?;
                let mut iter_a = Vec::with_capacity(self.n_factors);
                let mut iter_b = Vec::with_capacity(self.n_factors);
                let mut logits = Vec::with_capacity(self.n_factors);

                for i in 0..self.n_factors {
                    let s = scores.narrow(0, i, 1)?.squeeze(0)?;

                    // Degrees of the factor-weighted graph, not the 0/1 structure.
                    let deg_a = Tensor::zeros((num_a,), DType::F32, device)?
                        .index_add(&heads, &s, 0)?;
                    let deg_b = Tensor::zeros((num_b,), DType::F32, device)?
                        .index_add(&tails, &s, 0)?;
                    let d_a = ((deg_a + DEGREE_EPS)?).sqrt()?.recip()?;
                    let d_b = ((deg_b + DEGREE_EPS)?).sqrt()?.recip()?;

                    // A <- D_a ( A_f (D_b B) ), residual on the ego segment.
                    let b_scaled = ego_b[i].broadcast_mul(&d_b.unsqueeze(1)?)?;
                    let msg = b_scaled
                        .index_select(&tails, 0)?
                        .broadcast_mul(&s.unsqueeze(1)?)?;
                    let agg = Tensor::zeros((num_a, seg), DType::F32, device)?
                        .index_add(&heads, &msg, 0)?;
                    let a_new = (&ego_a[i] + agg.broadcast_mul(&d_a.unsqueeze(1)?)?)?;

                    // B <- D_b ( A_f^T (D_a A) ), symmetric over the transpose.
                    let a_scaled = ego_a[i].broadcast_mul(&d_a.unsqueeze(1)?)?;
                    let msg = a_scaled
                        .index_select(&heads, 0)?
                        .broadcast_mul(&s.unsqueeze(1)?)?;
                    let agg = Tensor::zeros((num_b, seg), DType::F32, device)?
                        .index_add(&tails, &msg, 0)?;
                    let b_new = (&ego_b[i] + agg.broadcast_mul(&d_b.unsqueeze(1)?)?)?;

                    // Tanh attention between the updated head and the original
                    // (pre-residual) tail, both length-normalized.
                    let head_emb = l2_normalize(&a_new.index_select(&heads, 0)?, 1)?;
                    let tail_emb = l2_normalize(&ego_b[i].index_select(&tails, 0)?, 1)?;
                    logits.push(head_emb.mul(&tail_emb.tanh()?)?.sum(1)?);

                    iter_a.push(a_new);
                    iter_b.push(b_new);
                }

                acc.add(&Tensor::stack(&logits, 0)?)?;
                if t == self.n_iterations - 1 {
                    layer_a = iter_a;
                    layer_b = iter_b;
                }
            }

            feature_a = Tensor::cat(&layer_a, 1)?;
            feature_b = Tensor::cat(&layer_b, 1)?;
            all_a.push(feature_a.clone());
            all_b.push(feature_b.clone());
        }

        let a = Tensor::stack(&all_a, 1)?.mean(1)?;
        let b = Tensor::stack(&all_b, 1)?.mean(1)?;
        Ok(RoutingOutput {
            a,
            b,
            edge_logits: acc.into_logits(),
        })
    }

    /// Explanation-time factor scores with the dominant factor emphasized.
    ///
    /// Softmaxes `edge_logits` across factors, multiplies each edge's
    /// dominant factor by `pick_level`, and renormalizes, leaving nearly all
    /// mass on the dominant factor. Never applied inside the routing
    /// iterations.
    pub fn picked_factor_scores(&self, edge_logits: &Tensor, pick_level: f64) -> Result<Tensor> {
        let scores = softmax(edge_logits, 0)?;
        let max = scores.max_keepdim(0)?.broadcast_as(scores.shape())?;
        let dominant = scores
            .ge(&((max - 1e-7)?))?
            .to_dtype(DType::F32)?;
        let weights = dominant.affine(pick_level - 1.0, 1.0)?;
        let emphasized = scores.mul(&weights)?;
        let sums = emphasized.sum_keepdim(0)?;
        Ok(emphasized.broadcast_div(&sums)?)
    }
}

/// Row-wise L2 normalization with an epsilon guard.
pub(crate) fn l2_normalize(t: &Tensor, dim: usize) -> Result<Tensor> {
    let norm = t.sqr()?.sum_keepdim(dim)?.sqrt()?;
    Ok(t.broadcast_div(&(norm + 1e-12)?)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::GraphRole;
    use crate::sparse::SparseMatrix;
    use candle_core::Device;

    fn toy_graph() -> BipartiteGraph {
        let raw =
            SparseMatrix::from_indices(vec![0, 1, 2, 0], vec![0, 1, 2, 1], (3, 3)).unwrap();
        BipartiteGraph::from_sparse(&raw, (3, 3), GraphRole::UserItem).unwrap()
    }

    fn finite(t: &Tensor) -> bool {
        t.flatten_all()
            .unwrap()
            .to_vec1::<f32>()
            .unwrap()
            .iter()
            .all(|v| v.is_finite())
    }

    #[test]
    fn test_route_shapes_and_finiteness() {
        let device = Device::Cpu;
        let feat_a = Tensor::randn(0f32, 0.1f32, (3, 8), &device).unwrap();
        let feat_b = Tensor::randn(0f32, 0.1f32, (3, 8), &device).unwrap();
        let router = FactorRouter::new(2, 2, 1).unwrap();
        let out = router.route(&toy_graph(), &feat_a, &feat_b).unwrap();
        assert_eq!(out.a.dims(), &[3, 8]);
        assert_eq!(out.b.dims(), &[3, 8]);
        assert_eq!(out.edge_logits.dims(), &[2, 4]);
        assert!(finite(&out.a));
        assert!(finite(&out.b));
    }

    #[test]
    fn test_width_preserved_across_layer_counts() {
        let device = Device::Cpu;
        let feat_a = Tensor::randn(0f32, 0.1f32, (3, 12), &device).unwrap();
        let feat_b = Tensor::randn(0f32, 0.1f32, (3, 12), &device).unwrap();
        for layers in 1..=3 {
            let router = FactorRouter::new(3, 2, layers).unwrap();
            let out = router.route(&toy_graph(), &feat_a, &feat_b).unwrap();
            assert_eq!(out.a.dims(), &[3, 12]);
            assert_eq!(out.b.dims(), &[3, 12]);
        }
    }

    #[test]
    fn test_every_admissible_factor_count_routes() {
        let device = Device::Cpu;
        let feat_a = Tensor::randn(0f32, 0.1f32, (3, 8), &device).unwrap();
        let feat_b = Tensor::randn(0f32, 0.1f32, (3, 8), &device).unwrap();
        for factors in [1, 2, 4, 8] {
            let router = FactorRouter::new(factors, 2, 2).unwrap();
            let out = router.route(&toy_graph(), &feat_a, &feat_b).unwrap();
            assert_eq!(out.a.dims(), &[3, 8], "factors={factors}");
            assert!(finite(&out.a));
            assert!(finite(&out.b));
        }
    }

    #[test]
    fn test_factor_scores_sum_to_one_per_edge() {
        let device = Device::Cpu;
        let acc = EdgeWeightAccumulator::ones(4, 5, &device).unwrap();
        let scores = acc.scores().unwrap();
        let sums = scores.sum(0).unwrap().to_vec1::<f32>().unwrap();
        for s in sums {
            assert!((s - 1.0).abs() < 1e-5);
        }
    }

    #[test]
    fn test_accumulated_scores_still_normalized() {
        let device = Device::Cpu;
        let mut acc = EdgeWeightAccumulator::ones(3, 4, &device).unwrap();
        let update = Tensor::randn(0f32, 1f32, (3, 4), &device).unwrap();
        acc.add(&update).unwrap();
        let sums = acc.scores().unwrap().sum(0).unwrap().to_vec1::<f32>().unwrap();
        for s in sums {
            assert!((s - 1.0).abs() < 1e-5);
        }
    }

    #[test]
    fn test_single_factor_degenerates_to_plain_propagation() {
        // With F=1 the softmax over factors is constant 1; routing still runs.
        let device = Device::Cpu;
        let feat_a = Tensor::randn(0f32, 0.1f32, (3, 8), &device).unwrap();
        let feat_b = Tensor::randn(0f32, 0.1f32, (3, 8), &device).unwrap();
        let router = FactorRouter::new(1, 2, 2).unwrap();
        let out = router.route(&toy_graph(), &feat_a, &feat_b).unwrap();
        assert_eq!(out.edge_logits.dims(), &[1, 4]);
        assert!(finite(&out.a));
    }

    #[test]
    fn test_zero_counts_rejected() {
        assert!(FactorRouter::new(0, 2, 2).is_err());
        assert!(FactorRouter::new(2, 0, 2).is_err());
        assert!(FactorRouter::new(2, 2, 0).is_err());
    }

    #[test]
    fn test_indivisible_width_rejected() {
        let device = Device::Cpu;
        let feat = Tensor::randn(0f32, 0.1f32, (3, 10), &device).unwrap();
        let router = FactorRouter::new(4, 2, 1).unwrap();
        assert!(router.route(&toy_graph(), &feat, &feat).is_err());
    }

    #[test]
    fn test_picked_scores_concentrate_on_dominant_factor() {
        let device = Device::Cpu;
        let logits =
            Tensor::from_vec(vec![2.0f32, 0.5, 0.0, 0.1], (2, 2), &device).unwrap();
        let router = FactorRouter::new(2, 1, 1).unwrap();
        let picked = router.picked_factor_scores(&logits, 1e10).unwrap();
        let cols = picked.to_vec2::<f32>().unwrap();
        // Per edge, weights still sum to 1 and the dominant factor takes
        // essentially all the mass.
        for e in 0..2 {
            let total: f32 = (0..2).map(|f| cols[f][e]).sum();
            assert!((total - 1.0).abs() < 1e-5);
        }
        // Factor 0 has the larger logit on both edges.
        assert!(cols[0][0] > 0.999);
        assert!(cols[0][1] > 0.999);
    }
}
