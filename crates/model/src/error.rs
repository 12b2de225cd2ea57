//! Error types for the orchestrator, persistence and generation.

use attention::AttentionError;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, ModelError>;

#[derive(Debug, Error)]
pub enum ModelError {
    #[error(transparent)]
    Attention(#[from] AttentionError),

    #[error("candle error: {0}")]
    Candle(#[from] candle_core::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serde_json error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("toml error: {0}")]
    Toml(#[from] toml::de::Error),

    #[error("invalid configuration: {}", .0.join("; "))]
    Validation(Vec<String>),

    #[error("unsupported configuration format: {0}")]
    ConfigFormat(String),

    #[error("no encoder attached to the model")]
    MissingEncoder,

    #[error("decoder kind '{kind}' is not registered")]
    UnknownDecoder { kind: String },

    #[error("checkpoint error: {0}")]
    Checkpoint(String),
}

impl ModelError {
    pub fn is_contract_violation(&self) -> bool {
        match self {
            ModelError::Attention(err) => err.is_contract_violation(),
            ModelError::MissingEncoder => true,
            _ => false,
        }
    }

    pub(crate) fn checkpoint<S: Into<String>>(msg: S) -> Self {
        ModelError::Checkpoint(msg.into())
    }
}
