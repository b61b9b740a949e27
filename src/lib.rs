//! `routix` is a disentangled graph network for bundle recommendation.
//!
//! Users, bundles, and items are embedded in a shared space whose width is
//! split into independent factor segments. Bipartite interaction graphs are
//! propagated with an iterative attention-routing scheme that lets factors
//! compete for each edge, producing an "atom" (item-level) view; a further
//! hop over the composite user-bundle graph yields the "non-atom" view. The
//! two views are combined for scoring and aligned with a contrastive term.
//!
//! The crate covers graph preprocessing ([`sparse`], [`graph`]), the routing
//! core ([`router`]), the model surface ([`model`]), and the loss functions
//! ([`loss`]). Optimization loops, dataset loading, and evaluation metrics
//! live outside the crate.

pub mod config;
pub mod error;
pub mod graph;
pub mod loss;
pub mod model;
pub mod router;
pub mod sparse;

pub use config::ModelConfig;
pub use error::{Error, Result};
pub use graph::{BipartiteGraph, GraphRole};
pub use model::{BundleModel, Pretrained, Propagation, RawGraphs};
pub use router::{FactorRouter, RoutingOutput};
pub use sparse::SparseMatrix;
