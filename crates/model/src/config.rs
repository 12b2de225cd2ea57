//! Orchestrator configuration loaded from TOML or JSON.

use std::{fs, path::Path};

use attention::Config;
use serde::{Deserialize, Serialize};

use crate::error::{ModelError, Result};

/// Where the first decode query comes from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QuerySeed {
    /// The learned `init_query` vector seeds every lane.
    #[default]
    Learned,
    /// A zero query seeds a priming step whose output is discarded; the
    /// decoder's first query prefix seeds the real first step.
    Primed,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AlignConfig {
    /// Width of the attention query carried between steps.
    pub query_size: usize,
    #[serde(default)]
    pub query_seed: QuerySeed,
    #[serde(default)]
    pub attention: Config,
}

impl AlignConfig {
    pub fn new(query_size: usize) -> Self {
        Self {
            query_size,
            query_seed: QuerySeed::default(),
            attention: Config::default(),
        }
    }

    pub fn with_query_seed(mut self, seed: QuerySeed) -> Self {
        self.query_seed = seed;
        self
    }

    pub fn with_attention(mut self, attention: Config) -> Self {
        self.attention = attention;
        self
    }

    /// Reads a `.toml` or `.json` file, applies the `SOFTALIGN_*`
    /// environment overrides to the attention section and validates it.
    pub fn from_path(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let contents = fs::read_to_string(path)?;
        let mut config: AlignConfig = match path.extension().and_then(|ext| ext.to_str()) {
            Some("json") => serde_json::from_str(&contents)?,
            Some("toml") | None => toml::from_str(&contents)?,
            Some(other) => {
                return Err(ModelError::ConfigFormat(format!(
                    "unsupported configuration extension '{other}'"
                )))
            }
        };
        config.attention.apply_env_overrides();
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        let mut errors = Vec::new();
        if self.query_size == 0 {
            errors.push("query_size must be greater than 0".to_string());
        }
        if let Err(err) = self.attention.validate() {
            errors.push(format!("attention: {err}"));
        }
        if errors.is_empty() {
            Ok(())
        } else {
            Err(ModelError::Validation(errors))
        }
    }
}
