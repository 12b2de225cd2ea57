//! Error types emitted by the attention engine.

use thiserror::Error;

/// Result alias used throughout the attention crate.
pub type Result<T> = std::result::Result<T, AttentionError>;

/// Attention-specific error category.
#[derive(Debug, Error)]
pub enum AttentionError {
    /// A batch with no lanes was supplied.
    #[error("empty batch in {context}")]
    EmptyBatch { context: String },
    /// A lane with no timesteps was supplied where every lane must be present.
    #[error("lane {lane} is empty in {context}")]
    EmptyLane { lane: usize, context: String },
    /// The first step saw a different number of lanes than bound resources.
    #[error("first step has {actual} lanes but {expected} resources are bound")]
    LaneCountMismatch { expected: usize, actual: usize },
    /// A focus function was evaluated before an encoded sequence was bound.
    #[error("no encoded sequence bound to lane {lane}")]
    UnboundResource { lane: usize },
    /// The supplied tensor shapes do not align with the documented contract.
    #[error("invalid tensor shape: {context}")]
    InvalidShape { context: String },
    /// Configuration values are out of range.
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
    /// A backend failure propagated from candle.
    #[error("backend error: {0}")]
    Backend(#[from] candle_core::Error),
    /// Wraps a failure with the decode timestep where it happened.
    #[error("at step {step}: {source}")]
    Step {
        step: usize,
        #[source]
        source: Box<AttentionError>,
    },
}

impl AttentionError {
    /// Returns `true` for caller contract violations (as opposed to backend or
    /// configuration failures).
    pub fn is_contract_violation(&self) -> bool {
        match self {
            AttentionError::EmptyBatch { .. }
            | AttentionError::EmptyLane { .. }
            | AttentionError::LaneCountMismatch { .. }
            | AttentionError::UnboundResource { .. } => true,
            AttentionError::Step { source, .. } => source.is_contract_violation(),
            _ => false,
        }
    }

    /// Attaches the decode timestep to an error.
    pub fn at_step(self, step: usize) -> Self {
        match self {
            already @ AttentionError::Step { .. } => already,
            other => AttentionError::Step {
                step,
                source: Box::new(other),
            },
        }
    }

    pub(crate) fn shape<S: Into<String>>(context: S) -> Self {
        AttentionError::InvalidShape {
            context: context.into(),
        }
    }
}
