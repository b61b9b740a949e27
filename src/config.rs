//! Model hyperparameters.

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};

/// Hyperparameters for the disentangled routing model.
///
/// Defaults follow the reference setup for medium-size bundle datasets.
/// All counts must be positive and `embedding_dim` must be divisible by
/// `n_factors`; `validate` is called at model construction.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelConfig {
    /// Embedding width E (default: 64).
    pub embedding_dim: usize,
    /// Disentanglement factor count F for the user-item graph (default: 4).
    ///
    /// The bundle-item graph is always routed with a single factor.
    pub n_factors: usize,
    /// Routing refinement iterations per layer (default: 2).
    pub n_iterations: usize,
    /// Star-routing propagation layers (default: 2).
    pub n_layers: usize,
    /// Layers in the generic linear-transform propagation (default: 2).
    pub num_dnn_layers: usize,
    /// Message dropout rate in [0, 1) (default: 0.3).
    pub mess_dropout: f32,
    /// Node dropout rate on adjacency values in [0, 1) (default: 0.1).
    pub node_dropout: f32,
    /// L2 regularization coefficient (default: 4e-5).
    pub embed_l2_norm: f64,
    /// Weight of the atom/non-atom contrastive term (default: 0.04).
    pub contrastive_weight: f64,
    /// Top-K positives in the contrastive loss (default: 20).
    pub topk_pos: usize,
    /// Top-K negatives in the contrastive loss (default: 20).
    pub topk_neg: usize,
    /// Similarity threshold separating positive/negative masks (default: 0.5).
    pub sim_threshold: f64,
    /// Emphasis multiplier for the dominant factor in pick mode (default: 1e10).
    pub pick_level: f64,
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            embedding_dim: 64,
            n_factors: 4,
            n_iterations: 2,
            n_layers: 2,
            num_dnn_layers: 2,
            mess_dropout: 0.3,
            node_dropout: 0.1,
            embed_l2_norm: 4e-5,
            contrastive_weight: 0.04,
            topk_pos: 20,
            topk_neg: 20,
            sim_threshold: 0.5,
            pick_level: 1e10,
        }
    }
}

impl ModelConfig {
    pub fn with_embedding_dim(mut self, dim: usize) -> Self {
        self.embedding_dim = dim;
        self
    }

    pub fn with_factors(mut self, n: usize) -> Self {
        self.n_factors = n;
        self
    }

    pub fn with_iterations(mut self, n: usize) -> Self {
        self.n_iterations = n;
        self
    }

    pub fn with_layers(mut self, n: usize) -> Self {
        self.n_layers = n;
        self
    }

    pub fn with_mess_dropout(mut self, p: f32) -> Self {
        self.mess_dropout = p;
        self
    }

    pub fn with_node_dropout(mut self, p: f32) -> Self {
        self.node_dropout = p;
        self
    }

    pub fn with_l2_norm(mut self, c: f64) -> Self {
        self.embed_l2_norm = c;
        self
    }

    pub fn with_contrastive_weight(mut self, w: f64) -> Self {
        self.contrastive_weight = w;
        self
    }

    pub fn with_topk(mut self, pos: usize, neg: usize) -> Self {
        self.topk_pos = pos;
        self.topk_neg = neg;
        self
    }

    /// Check hyperparameter preconditions.
    ///
    /// Violations are construction-time failures, never recovered at runtime.
    pub fn validate(&self) -> Result<()> {
        if self.embedding_dim == 0 {
            return Err(Error::InvalidConfig("embedding_dim must be positive".into()));
        }
        if self.n_factors == 0 {
            return Err(Error::InvalidConfig("n_factors must be positive".into()));
        }
        if self.embedding_dim % self.n_factors != 0 {
            return Err(Error::InvalidConfig(format!(
                "embedding_dim {} not divisible by n_factors {}",
                self.embedding_dim, self.n_factors
            )));
        }
        if self.n_iterations == 0 {
            return Err(Error::InvalidConfig("n_iterations must be positive".into()));
        }
        if self.n_layers == 0 {
            return Err(Error::InvalidConfig("n_layers must be positive".into()));
        }
        if self.num_dnn_layers == 0 {
            return Err(Error::InvalidConfig("num_dnn_layers must be positive".into()));
        }
        if !(0.0..1.0).contains(&self.mess_dropout) {
            return Err(Error::InvalidConfig(format!(
                "mess_dropout {} outside [0, 1)",
                self.mess_dropout
            )));
        }
        if !(0.0..1.0).contains(&self.node_dropout) {
            return Err(Error::InvalidConfig(format!(
                "node_dropout {} outside [0, 1)",
                self.node_dropout
            )));
        }
        if self.embed_l2_norm < 0.0 {
            return Err(Error::InvalidConfig("embed_l2_norm must be non-negative".into()));
        }
        if self.topk_pos == 0 || self.topk_neg == 0 {
            return Err(Error::InvalidConfig("topk_pos/topk_neg must be positive".into()));
        }
        if self.pick_level <= 1.0 {
            return Err(Error::InvalidConfig("pick_level must exceed 1".into()));
        }
        Ok(())
    }

    /// Width of one factor segment (E / F).
    pub fn factor_dim(&self) -> usize {
        self.embedding_dim / self.n_factors
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_is_valid() {
        assert!(ModelConfig::default().validate().is_ok());
    }

    #[test]
    fn test_builder() {
        let cfg = ModelConfig::default()
            .with_embedding_dim(32)
            .with_factors(2)
            .with_topk(10, 15);
        assert_eq!(cfg.embedding_dim, 32);
        assert_eq!(cfg.n_factors, 2);
        assert_eq!(cfg.topk_pos, 10);
        assert_eq!(cfg.topk_neg, 15);
        assert_eq!(cfg.factor_dim(), 16);
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn test_indivisible_width_rejected() {
        let cfg = ModelConfig::default().with_embedding_dim(30).with_factors(4);
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn test_zero_counts_rejected() {
        assert!(ModelConfig::default().with_factors(0).validate().is_err());
        assert!(ModelConfig::default().with_iterations(0).validate().is_err());
        assert!(ModelConfig::default().with_layers(0).validate().is_err());
    }

    #[test]
    fn test_dropout_range_rejected() {
        assert!(ModelConfig::default().with_mess_dropout(1.0).validate().is_err());
        assert!(ModelConfig::default().with_node_dropout(-0.1).validate().is_err());
    }
}
