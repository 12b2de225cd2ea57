//! Configuration options shared by the attention engine.
//!
//! The [`Config`] struct captures run-time knobs that callers can tune without
//! changing results: the chunk size used when scoring encoded positions and
//! whether gradients are routed back into the encoder.

use serde::{Deserialize, Serialize};

use super::errors::{AttentionError, Result};

/// Environment variable overriding [`Config::score_batch_size`].
pub const SCORE_BATCH_ENV: &str = "SOFTALIGN_SCORE_BATCH";
/// Environment variable overriding [`Config::encoder_gradients`]
/// (`propagate` or `frozen`).
pub const ENCODER_GRADIENTS_ENV: &str = "SOFTALIGN_ENCODER_GRADIENTS";

/// Whether gradients reaching the encoded sequence flow into the encoder.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EncoderGradients {
    /// Encoded vectors are differentiated through and the encoder receives
    /// their gradients.
    #[default]
    Propagate,
    /// Encoded vectors are treated as constants.
    Frozen,
}

impl EncoderGradients {
    fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "propagate" => Some(Self::Propagate),
            "frozen" => Some(Self::Frozen),
            _ => None,
        }
    }
}

/// Configuration driving attention behaviour.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Number of encoded positions scored per attentor call. Memory knob only;
    /// results do not depend on it.
    pub score_batch_size: usize,
    /// Gradient policy for the encoded sequence.
    pub encoder_gradients: EncoderGradients,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            score_batch_size: 1,
            encoder_gradients: EncoderGradients::default(),
        }
    }
}

impl Config {
    /// Defaults with environment overrides applied.
    pub fn from_env() -> Self {
        let mut config = Self::default();
        config.apply_env_overrides();
        config
    }

    /// Applies `SOFTALIGN_*` overrides. Unparseable values are ignored with a
    /// warning.
    pub fn apply_env_overrides(&mut self) {
        if let Ok(value) = std::env::var(SCORE_BATCH_ENV) {
            match value.trim().parse::<usize>() {
                Ok(parsed) => self.score_batch_size = parsed,
                Err(_) => log::warn!("ignoring {SCORE_BATCH_ENV}={value:?}: not an integer"),
            }
        }
        if let Ok(value) = std::env::var(ENCODER_GRADIENTS_ENV) {
            match EncoderGradients::parse(&value) {
                Some(policy) => self.encoder_gradients = policy,
                None => log::warn!(
                    "ignoring {ENCODER_GRADIENTS_ENV}={value:?}: expected propagate or frozen"
                ),
            }
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.score_batch_size == 0 {
            return Err(AttentionError::InvalidConfig(
                "score_batch_size must be greater than 0".into(),
            ));
        }
        Ok(())
    }
}
