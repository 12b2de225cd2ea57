//! Core traits and types shared across the attention engine.
//!
//! Tensors flowing through a decode step are row-major `(rows, features)`
//! with one row per present lane. Per-lane resources see a single `(1, q)`
//! query row at a time. Every collaborator is differentiable through candle's
//! autograd: parameters are [`Var`]s, and a backward pass over any output
//! reaches them.

pub mod batch;
pub mod config;
pub mod errors;
pub mod gradients;

use candle_core::{Tensor, Var};

pub use batch::SeqBatch;
pub use config::{Config, EncoderGradients};
pub use errors::{AttentionError, Result};
pub use gradients::Gradients;

/// A per-lane resource bound into the [`InterfacerBlock`](crate::InterfacerBlock).
///
/// `apply` maps one `(1, query_size)` query row to a `(1, context_size)`
/// context row and must stay differentiable with respect to the query.
pub trait Resource: Send + Sync {
    fn query_size(&self) -> usize;
    fn context_size(&self) -> usize;
    fn apply(&self, query: &Tensor) -> Result<Tensor>;
}

/// Output of one decoder transition.
#[derive(Debug, Clone)]
pub struct DecoderStep {
    /// Next states, `(rows, state_size)`.
    pub state: Tensor,
    /// Raw outputs, `(rows, output_size)`.
    pub output: Tensor,
}

/// Recurrent state machine driven by the interfacer block.
///
/// * `start_state` returns a `(state_size,)` vector independent of any batch.
/// * `step` maps `(rows, state_size)` states and `(rows, input_size)` inputs to
///   the next states and `(rows, output_size)` outputs, one row per lane.
/// * Backward is candle's: gradients reach whatever [`Var`]s the step or the
///   start state were computed from.
pub trait Decoder: Send + Sync {
    fn input_size(&self) -> usize;
    fn output_size(&self) -> usize;
    fn state_size(&self) -> usize;
    fn start_state(&self) -> Result<Tensor>;
    fn step(&self, state: &Tensor, input: &Tensor) -> Result<DecoderStep>;

    /// Trainable variables keyed by stable names, used for persistence.
    fn named_parameters(&self) -> Vec<(String, Var)> {
        Vec::new()
    }

    fn parameters(&self) -> Vec<Var> {
        self.named_parameters()
            .into_iter()
            .map(|(_, var)| var)
            .collect()
    }

    /// Registry key used when persisting the decoder.
    fn kind(&self) -> &str {
        "custom"
    }

    /// Constructor arguments needed to rebuild the decoder from its tensors.
    fn hyperparameters(&self) -> serde_json::Value {
        serde_json::Value::Null
    }
}

/// Maps an input batch to an encoded batch with the same lane structure.
pub trait Encoder: Send + Sync {
    fn encode(&self, inputs: &SeqBatch) -> Result<SeqBatch>;

    fn parameters(&self) -> Vec<Var> {
        Vec::new()
    }
}
