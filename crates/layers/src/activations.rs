//! Activation catalogue for the scoring networks.
//!
//! Activations are elementwise and keep the input layout. The combiner uses
//! `tanh` between its summed input projections and the output projection.

use candle_core::{Result, Tensor};

/// Identifies which non-linearity is applied.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ActivationKind {
    /// Identity function, useful for debugging or wiring custom stacks.
    Identity,
    /// Hyperbolic tangent.
    #[default]
    Tanh,
    /// Rectified linear unit.
    Relu,
}

impl ActivationKind {
    /// Applies the activation to `input`.
    pub fn forward(&self, input: &Tensor) -> Result<Tensor> {
        match self {
            ActivationKind::Identity => Ok(input.clone()),
            ActivationKind::Tanh => input.tanh(),
            ActivationKind::Relu => input.relu(),
        }
    }
}
