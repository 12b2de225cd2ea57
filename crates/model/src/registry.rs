//! Explicit decoder registry used when loading persisted models.

use std::collections::HashMap;
use std::sync::Arc;

use attention::Decoder;
use candle_core::Tensor;

use crate::decoders::{ElmanConfig, ElmanDecoder};
use crate::error::{ModelError, Result};

/// Rebuilds a decoder from its hyperparameters and its tensors (names without
/// the `decoder.` prefix).
pub type DecoderFactory =
    fn(&serde_json::Value, &HashMap<String, Tensor>) -> Result<Arc<dyn Decoder>>;

#[derive(Clone, Default)]
pub struct DecoderRegistry {
    factories: HashMap<String, DecoderFactory>,
}

impl std::fmt::Debug for DecoderRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DecoderRegistry")
            .field("kinds", &self.kinds())
            .finish()
    }
}

impl DecoderRegistry {
    /// An empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry knowing the decoders shipped with this crate.
    pub fn with_builtin() -> Self {
        let mut registry = Self::new();
        registry.register(ElmanDecoder::KIND, build_elman);
        registry
    }

    /// Registers `factory` under `kind`, replacing any previous entry.
    pub fn register(&mut self, kind: impl Into<String>, factory: DecoderFactory) {
        self.factories.insert(kind.into(), factory);
    }

    pub fn contains(&self, kind: &str) -> bool {
        self.factories.contains_key(kind)
    }

    pub fn kinds(&self) -> Vec<&str> {
        let mut kinds = self.factories.keys().map(String::as_str).collect::<Vec<_>>();
        kinds.sort_unstable();
        kinds
    }

    pub fn build(
        &self,
        kind: &str,
        hyperparameters: &serde_json::Value,
        tensors: &HashMap<String, Tensor>,
    ) -> Result<Arc<dyn Decoder>> {
        let factory = self
            .factories
            .get(kind)
            .ok_or_else(|| ModelError::UnknownDecoder {
                kind: kind.to_string(),
            })?;
        factory(hyperparameters, tensors)
    }
}

fn build_elman(
    hyperparameters: &serde_json::Value,
    tensors: &HashMap<String, Tensor>,
) -> Result<Arc<dyn Decoder>> {
    let config: ElmanConfig = serde_json::from_value(hyperparameters.clone())?;
    Ok(Arc::new(ElmanDecoder::from_named_tensors(config, tensors)?))
}
