//! Scoring and loss functions.
//!
//! Prediction combines the atom and non-atom views with plain inner products;
//! regularization is batch-scoped L2; the contrastive term aligns the two
//! views of the same node set with rank-mined positives and negatives.

use crate::error::Result;
use crate::router::l2_normalize;
use candle_core::{DType, Tensor};
use candle_nn::ops::sigmoid;

/// Affinity scores for a batch of (user, candidate bundles) pairs.
///
/// `users_*` are (batch x E), `bundles_*` are (batch x n x E); the result is
/// (batch x n). The score is bilinear in each view pair: scaling one side's
/// atom embedding scales that term's contribution linearly.
pub fn predict(
    users_atom: &Tensor,
    users_non_atom: &Tensor,
    bundles_atom: &Tensor,
    bundles_non_atom: &Tensor,
) -> Result<Tensor> {
    let atom = bundles_atom
        .broadcast_mul(&users_atom.unsqueeze(1)?)?
        .sum(2)?;
    let non_atom = bundles_non_atom
        .broadcast_mul(&users_non_atom.unsqueeze(1)?)?
        .sum(2)?;
    Ok((atom + non_atom)?)
}

/// L2 penalty over the embeddings gathered for the current batch.
pub fn l2_regularization(coefficient: f64, blocks: &[&Tensor]) -> Result<Tensor> {
    let device = blocks[0].device();
    let mut total = Tensor::zeros((), DType::F32, device)?;
    for b in blocks {
        total = (total + b.sqr()?.sum_all()?)?;
    }
    Ok((total * coefficient)?)
}

/// Contrastive alignment between two views of the same node set.
///
/// Both views are L2-normalized; the full pairwise cosine matrix is ranked
/// per row. The `topk_pos` most similar pairs and `topk_neg` least similar
/// pairs are kept; entries on the wrong side of `threshold` have their
/// similarity zeroed (they still occupy their top-K slot and contribute
/// `exp(0)` to the sum). Top-K sets may overlap on ties; that overlap is
/// deliberately not removed.
///
/// Loss: `-mean(log(sum(exp(pos)) / sum(exp(neg))))`.
pub fn contrastive_loss(
    eck: &Tensor,
    vck: &Tensor,
    topk_pos: usize,
    topk_neg: usize,
    threshold: f64,
) -> Result<Tensor> {
    let eck = l2_normalize(eck, 1)?;
    let vck = l2_normalize(vck, 1)?;
    let sim = eck.matmul(&vck.t()?)?;
    let n = sim.dim(1)?;
    let k_pos = topk_pos.min(n);
    let k_neg = topk_neg.min(n);

    let (desc, _) = sim.sort_last_dim(false)?;
    let pos = desc.narrow(1, 0, k_pos)?;
    let (asc, _) = sim.sort_last_dim(true)?;
    let neg = asc.narrow(1, 0, k_neg)?;

    let pos_mask = pos.gt(threshold)?.to_dtype(DType::F32)?;
    let neg_mask = neg.lt(threshold)?.to_dtype(DType::F32)?;

    let pos_score = pos.mul(&pos_mask)?.exp()?.sum(1)?;
    let neg_score = neg.mul(&neg_mask)?.exp()?.sum(1)?;

    let ratio = pos_score.div(&neg_score)?;
    Ok((ratio.log()?.mean_all()? * -1.0)?)
}

/// Bayesian personalized ranking loss over (anchor, positive, negative) rows.
///
/// All three tensors are (batch x E); the loss is
/// `-mean(log(sigmoid(<a, p> - <a, n>)))`.
pub fn bpr_loss(anchors: &Tensor, positives: &Tensor, negatives: &Tensor) -> Result<Tensor> {
    let pos_score = anchors.mul(positives)?.sum(1)?;
    let neg_score = anchors.mul(negatives)?.sum(1)?;
    let diff = (pos_score - neg_score)?;
    Ok((sigmoid(&diff)?.log()?.mean_all()? * -1.0)?)
}
