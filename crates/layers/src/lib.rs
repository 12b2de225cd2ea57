//! Building blocks for the soft-attention networks.
//!
//! Every layer stores its parameters as candle [`Var`](candle_core::Var)s so
//! that gradients reach them through `Tensor::backward`. Layers operate on
//! row-major batches shaped `(rows, features)`; the attention crate feeds one
//! row per lane or per encoded position.

pub mod activations;
pub mod checks;
pub mod linear;

pub use activations::ActivationKind;
pub use linear::{Linear, LinearConfig, LinearInit};
