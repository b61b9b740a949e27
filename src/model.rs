//! The bundle recommendation model: parameters, propagation, forward contract.
//!
//! A forward pass routes the bundle-item graph (single factor), routes the
//! user-item graph (`n_factors` factors), then pushes the resulting "atom"
//! representations one hop over the composite user-bundle graph to obtain the
//! "non-atom" view. Scores, regularization, and the contrastive alignment
//! term are computed from the two views and handed back to the external
//! training loop.

use crate::config::ModelConfig;
use crate::error::{Error, Result};
use crate::graph::{
    bundle_cosine, bundle_member_lists, non_atom_composite, normalized_atom_adjacency,
    BipartiteGraph, GraphRole,
};
use crate::loss;
use crate::router::{l2_normalize, FactorRouter};
use crate::sparse::SparseMatrix;
use candle_core::{DType, Device, Tensor};
use candle_nn::ops::{dropout, leaky_relu};
use candle_nn::init::Init;
use candle_nn::{linear, Linear, Module, VarBuilder, VarMap};
use rand::Rng;

const LEAKY_SLOPE: f64 = 0.01;

/// Raw interaction matrices supplied by the dataset loader.
#[derive(Debug, Clone)]
pub struct RawGraphs {
    pub user_bundle: SparseMatrix,
    pub user_item: SparseMatrix,
    pub bundle_item: SparseMatrix,
}

impl RawGraphs {
    /// Cross-check the three shapes and return (users, bundles, items).
    fn counts(&self) -> Result<(usize, usize, usize)> {
        let (num_users, num_bundles) = self.user_bundle.shape();
        let (ui_users, num_items) = self.user_item.shape();
        if ui_users != num_users {
            return Err(Error::ShapeMismatch {
                expected: (num_users, num_items),
                got: self.user_item.shape(),
            });
        }
        if self.bundle_item.shape() != (num_bundles, num_items) {
            return Err(Error::ShapeMismatch {
                expected: (num_bundles, num_items),
                got: self.bundle_item.shape(),
            });
        }
        Ok((num_users, num_bundles, num_items))
    }
}

/// Optional pretrained embedding tables, row-major (rows x embedding_dim).
///
/// When provided they are L2-normalized and substituted for the random
/// initialization.
#[derive(Debug, Clone, Default)]
pub struct Pretrained {
    pub users: Option<Vec<f32>>,
    pub bundles: Option<Vec<f32>>,
    pub items: Option<Vec<f32>>,
}

/// Result of one full propagation pass.
///
/// Atom representations come from one direct bipartite hop; non-atom
/// representations from one further hop over the composite graph. The two
/// item tables are distinct: one is aggregated through bundles, the other
/// through users.
#[derive(Debug)]
pub struct Propagation {
    pub users_atom: Tensor,
    pub users_non_atom: Tensor,
    pub bundles_atom: Tensor,
    pub bundles_non_atom: Tensor,
    pub items_from_bundles: Tensor,
    pub items_from_users: Tensor,
}

/// Disentangled routing model over user/bundle/item graphs.
pub struct BundleModel {
    config: ModelConfig,
    num_users: usize,
    num_bundles: usize,
    num_items: usize,

    users_feature: Tensor,
    bundles_feature: Tensor,
    items_feature: Tensor,

    bi_edges: BipartiteGraph,
    ui_edges: BipartiteGraph,
    bi_router: FactorRouter,
    ui_router: FactorRouter,

    ui_atom_adj: Tensor,
    bi_atom_adj: Tensor,
    non_atom_adj: Tensor,

    dnns_atom: Vec<Linear>,
    dnns_non_atom: Vec<Linear>,

    bundle_members: Vec<Vec<u32>>,
    device: Device,
}

impl BundleModel {
    /// Build the model: validates hyperparameters and graph shapes, creates
    /// parameters in `varmap`, and precomputes every normalized adjacency.
    pub fn new(
        config: ModelConfig,
        graphs: &RawGraphs,
        pretrain: Option<&Pretrained>,
        varmap: &VarMap,
        device: &Device,
    ) -> Result<Self> {
        config.validate()?;
        let (num_users, num_bundles, num_items) = graphs.counts()?;
        let e = config.embedding_dim;
        let vb = VarBuilder::from_varmap(varmap, DType::F32, device);

        let users_feature = init_table(&vb, "users_feature", num_users, e)?;
        let bundles_feature = init_table(&vb, "bundles_feature", num_bundles, e)?;
        let items_feature = init_table(&vb, "items_feature", num_items, e)?;

        if let Some(pre) = pretrain {
            substitute(varmap, "users_feature", pre.users.as_deref(), num_users, e, device)?;
            substitute(varmap, "bundles_feature", pre.bundles.as_deref(), num_bundles, e, device)?;
            substitute(varmap, "items_feature", pre.items.as_deref(), num_items, e, device)?;
        }

        let bi_edges = BipartiteGraph::from_sparse(
            &graphs.bundle_item,
            (num_bundles, num_items),
            GraphRole::BundleItem,
        )?;
        let ui_edges = BipartiteGraph::from_sparse(
            &graphs.user_item,
            (num_users, num_items),
            GraphRole::UserItem,
        )?;

        // No disentanglement over bundle-item: one factor, same iteration and
        // layer budget as the user-item router.
        let bi_router = FactorRouter::new(1, config.n_iterations, config.n_layers)?;
        let ui_router = FactorRouter::new(config.n_factors, config.n_iterations, config.n_layers)?;

        let ui_atom_adj = normalized_atom_adjacency(&graphs.user_item, device)?;
        let bi_atom_adj = normalized_atom_adjacency(&graphs.bundle_item, device)?;
        let bb = bundle_cosine(&graphs.bundle_item)?;
        let non_atom_adj = non_atom_composite(&graphs.user_bundle, &bb)?
            .laplace_normalize()
            .to_tensor(device)?;

        let mut dnns_atom = Vec::with_capacity(config.num_dnn_layers);
        let mut dnns_non_atom = Vec::with_capacity(config.num_dnn_layers);
        for l in 0..config.num_dnn_layers {
            dnns_atom.push(linear(e, e, vb.pp(format!("dnns_atom.{l}")))?);
            dnns_non_atom.push(linear(e, e, vb.pp(format!("dnns_non_atom.{l}")))?);
        }

        let bundle_members = bundle_member_lists(&graphs.bundle_item);

        Ok(Self {
            config,
            num_users,
            num_bundles,
            num_items,
            users_feature,
            bundles_feature,
            items_feature,
            bi_edges,
            ui_edges,
            bi_router,
            ui_router,
            ui_atom_adj,
            bi_atom_adj,
            non_atom_adj,
            dnns_atom,
            dnns_non_atom,
            bundle_members,
            device: device.clone(),
        })
    }

    pub fn num_users(&self) -> usize {
        self.num_users
    }

    pub fn num_bundles(&self) -> usize {
        self.num_bundles
    }

    pub fn num_items(&self) -> usize {
        self.num_items
    }

    pub fn config(&self) -> &ModelConfig {
        &self.config
    }

    /// Full propagation: routed atom views plus the single-hop non-atom view.
    pub fn propagate(&self, train: bool) -> Result<Propagation> {
        let bi_out = self
            .bi_router
            .route(&self.bi_edges, &self.bundles_feature, &self.items_feature)?;
        let ui_out = self
            .ui_router
            .route(&self.ui_edges, &self.users_feature, &self.items_feature)?;

        let (users_non_atom, bundles_non_atom) =
            self.ub_propagate(&self.non_atom_adj, &ui_out.a, &bi_out.a, train)?;

        Ok(Propagation {
            users_atom: ui_out.a,
            users_non_atom,
            bundles_atom: bi_out.a,
            bundles_non_atom,
            items_from_bundles: bi_out.b,
            items_from_users: ui_out.b,
        })
    }

    /// Single-hop propagation over a composite adjacency: one sparse product,
    /// uniform edge weights, no routing.
    pub fn ub_propagate(
        &self,
        adj: &Tensor,
        feat_a: &Tensor,
        feat_b: &Tensor,
        train: bool,
    ) -> Result<(Tensor, Tensor)> {
        let adj = self.node_dropout(adj, train)?;
        let num_a = feat_a.dim(0)?;
        let num_b = feat_b.dim(0)?;
        let features = Tensor::cat(&[feat_a, feat_b], 0)?;
        let out = adj.matmul(&features)?;
        Ok((out.narrow(0, 0, num_a)?, out.narrow(0, num_a, num_b)?))
    }

    /// Generic multi-layer propagation for graphs without disentanglement:
    /// node dropout on the adjacency, `num_dnn_layers` linear + LeakyReLU +
    /// message-dropout steps, mean-pooling of the input and every layer's
    /// L2-normalized output.
    pub fn one_propagate(
        &self,
        adj: &Tensor,
        feat_a: &Tensor,
        feat_b: &Tensor,
        dnns: &[Linear],
        train: bool,
    ) -> Result<(Tensor, Tensor)> {
        let adj = self.node_dropout(adj, train)?;
        let num_a = feat_a.dim(0)?;
        let num_b = feat_b.dim(0)?;

        let mut features = Tensor::cat(&[feat_a, feat_b], 0)?;
        let mut all_features = vec![features.clone()];
        for layer in dnns {
            let h = leaky_relu(&layer.forward(&adj.matmul(&features)?)?, LEAKY_SLOPE)?;
            features = if train {
                dropout(&h, self.config.mess_dropout)?
            } else {
                h
            };
            all_features.push(l2_normalize(&features, 1)?);
        }

        let pooled = Tensor::stack(&all_features, 1)?.mean(1)?;
        Ok((pooled.narrow(0, 0, num_a)?, pooled.narrow(0, num_a, num_b)?))
    }

    /// Atom propagation through the generic primitive (linear-transform path
    /// over the normalized composite graphs).
    pub fn atom_propagate(&self, train: bool) -> Result<(Tensor, Tensor)> {
        self.one_propagate(
            &self.bi_atom_adj,
            &self.bundles_feature,
            &self.items_feature,
            &self.dnns_atom,
            train,
        )
    }

    /// User-item propagation through the generic primitive.
    pub fn user_item_propagate(&self, train: bool) -> Result<(Tensor, Tensor)> {
        self.one_propagate(
            &self.ui_atom_adj,
            &self.users_feature,
            &self.items_feature,
            &self.dnns_non_atom,
            train,
        )
    }

    /// Forward contract for one training batch.
    ///
    /// `users` is a (batch,) index tensor; `bundles` is (batch x n) holding
    /// the positive and sampled negative bundles per user. Returns prediction
    /// scores (batch x n), the batch L2 regularization loss, and the weighted
    /// contrastive alignment loss. Combining them into the final objective is
    /// the trainer's job.
    pub fn forward(
        &self,
        users: &Tensor,
        bundles: &Tensor,
        train: bool,
    ) -> Result<(Tensor, Tensor, Tensor)> {
        let prop = self.propagate(train)?;
        let e = self.config.embedding_dim;
        let (batch, n_cand) = bundles.dims2()?;

        let users_atom = prop.users_atom.index_select(users, 0)?;
        let users_non_atom = prop.users_non_atom.index_select(users, 0)?;
        let flat = bundles.flatten_all()?;
        let bundles_atom = prop
            .bundles_atom
            .index_select(&flat, 0)?
            .reshape((batch, n_cand, e))?;
        let bundles_non_atom = prop
            .bundles_non_atom
            .index_select(&flat, 0)?
            .reshape((batch, n_cand, e))?;

        let pred = loss::predict(&users_atom, &users_non_atom, &bundles_atom, &bundles_non_atom)?;

        // Regularize the batch-expanded embeddings, mirroring the prediction
        // layout: each user row is counted once per candidate bundle.
        let ua_exp = users_atom
            .unsqueeze(1)?
            .broadcast_as((batch, n_cand, e))?
            .contiguous()?;
        let un_exp = users_non_atom
            .unsqueeze(1)?
            .broadcast_as((batch, n_cand, e))?
            .contiguous()?;
        let reg = loss::l2_regularization(
            self.config.embed_l2_norm,
            &[&ua_exp, &un_exp, &bundles_atom, &bundles_non_atom],
        )?;

        let user_cl = loss::contrastive_loss(
            &prop.users_atom,
            &prop.users_non_atom,
            self.config.topk_pos,
            self.config.topk_neg,
            self.config.sim_threshold,
        )?;
        let bundle_cl = loss::contrastive_loss(
            &prop.bundles_atom,
            &prop.bundles_non_atom,
            self.config.topk_pos,
            self.config.topk_neg,
            self.config.sim_threshold,
        )?;
        let side = (((user_cl + bundle_cl)? * 0.5)? * self.config.contrastive_weight)?;

        Ok((pred, reg, side))
    }

    /// Score all bundles for the given users from a precomputed propagation.
    pub fn evaluate(&self, prop: &Propagation, users: &Tensor) -> Result<Tensor> {
        let users_atom = prop.users_atom.index_select(users, 0)?;
        let users_non_atom = prop.users_non_atom.index_select(users, 0)?;
        let atom = users_atom.matmul(&prop.bundles_atom.t()?)?;
        let non_atom = users_non_atom.matmul(&prop.bundles_non_atom.t()?)?;
        Ok((atom + non_atom)?)
    }

    /// Auxiliary item-item ranking loss.
    ///
    /// Anchors and positives are distinct members of a randomly drawn bundle
    /// (co-occurrence positives); negatives are uniform over the item set.
    /// All randomness comes from the injected `rng`.
    pub fn item_bpr_loss(
        &self,
        item_feat: &Tensor,
        batch_size: usize,
        rng: &mut impl Rng,
    ) -> Result<Tensor> {
        let eligible: Vec<&Vec<u32>> = self
            .bundle_members
            .iter()
            .filter(|m| m.len() >= 2)
            .collect();
        if eligible.is_empty() || batch_size == 0 {
            return Ok(Tensor::zeros((), DType::F32, &self.device)?);
        }

        let mut anchors = Vec::with_capacity(batch_size);
        let mut positives = Vec::with_capacity(batch_size);
        let mut negatives = Vec::with_capacity(batch_size);
        for _ in 0..batch_size {
            let members = eligible[rng.gen_range(0..eligible.len())];
            let a = rng.gen_range(0..members.len());
            let mut p = rng.gen_range(0..members.len());
            while p == a {
                p = rng.gen_range(0..members.len());
            }
            anchors.push(members[a]);
            positives.push(members[p]);
            negatives.push(rng.gen_range(0..self.num_items as u32));
        }

        let anchors = Tensor::from_vec(anchors, (batch_size,), &self.device)?;
        let positives = Tensor::from_vec(positives, (batch_size,), &self.device)?;
        let negatives = Tensor::from_vec(negatives, (batch_size,), &self.device)?;
        loss::bpr_loss(
            &item_feat.index_select(&anchors, 0)?,
            &item_feat.index_select(&positives, 0)?,
            &item_feat.index_select(&negatives, 0)?,
        )
    }

    fn node_dropout(&self, adj: &Tensor, train: bool) -> Result<Tensor> {
        if train && self.config.node_dropout > 0.0 {
            Ok(dropout(adj, self.config.node_dropout)?)
        } else {
            Ok(adj.clone())
        }
    }
}

fn init_table(vb: &VarBuilder, name: &str, rows: usize, dim: usize) -> Result<Tensor> {
    let stdev = (2.0 / (rows + dim) as f64).sqrt();
    Ok(vb.get_with_hints((rows, dim), name, Init::Randn { mean: 0.0, stdev })?)
}

/// Replace a parameter's values with an L2-normalized pretrained table.
fn substitute(
    varmap: &VarMap,
    name: &str,
    table: Option<&[f32]>,
    rows: usize,
    dim: usize,
    device: &Device,
) -> Result<()> {
    let Some(table) = table else {
        return Ok(());
    };
    if table.len() != rows * dim {
        return Err(Error::InvalidConfig(format!(
            "pretrained {name} has {} values, expected {}",
            table.len(),
            rows * dim
        )));
    }
    let t = Tensor::from_vec(table.to_vec(), (rows, dim), device)?;
    let normalized = l2_normalize(&t, 1)?;
    let data = varmap
        .data()
        .lock()
        .map_err(|_| Error::InvalidConfig(format!("parameter store poisoned while loading {name}")))?;
    if let Some(var) = data.get(name) {
        var.set(&normalized)?;
    }
    Ok(())
}
