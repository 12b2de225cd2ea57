//! Soft-attention recurrence engine.
//!
//! Sequences travel as [`SeqBatch`]es: one `(len, dim)` tensor per lane, lanes
//! of different lengths side by side. The engine is built from four layers:
//!
//! * [`softmax`]: stable normalisation of whole sequences.
//! * [`Combiner`]: two-input feed-forward scorer.
//! * [`FocusFunction`]: per-lane attention over encoded vectors.
//! * [`InterfacerBlock`]: drives a caller-supplied [`Decoder`] through time,
//!   feeding it attention contexts and carrying queries between steps.
//!
//! Differentiation is candle's. Forward runs keep one record per timestep and
//! the backward pass walks them in reverse, summing parameter gradients into a
//! [`Gradients`] accumulator.

pub mod combiner;
pub mod core;
pub mod focus;
pub mod interfacer;
pub mod softmax;

pub use combiner::{Combiner, CombinerConfig};
pub use crate::core::{
    AttentionError, Config, Decoder, DecoderStep, Encoder, EncoderGradients, Gradients, Resource,
    Result, SeqBatch,
};
pub use focus::{Focus, FocusFunction};
pub use interfacer::{
    BlockGrads, BlockRun, BlockState, BlockStep, InputMixing, InterfacerBlock, RunningState,
    StartQuery, StepRecord,
};
pub use softmax::{normalize_sequence, seq_softmax};
