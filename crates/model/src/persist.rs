//! Model persistence: safetensors weights plus a JSON manifest.
//!
//! The manifest lists the parameter sections in their fixed order
//! (`attentor`, `decoder`, `in_combiner`, `init_query`), the decoder kind and
//! hyperparameters, the configuration, and a SHA-256 record of the weights
//! file. Loading rebuilds the decoder through an explicit
//! [`DecoderRegistry`] and leaves the encoder for the caller to attach.

use std::{
    collections::HashMap,
    fs::{self, File},
    io::{Read, Write},
    path::Path,
    sync::Arc,
    time::{SystemTime, UNIX_EPOCH},
};

use attention::{Combiner, InputMixing};
use candle_core::{Device, Var};
use hex::encode as hex_encode;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::align::SoftAlign;
use crate::config::AlignConfig;
use crate::error::{ModelError, Result};
use crate::registry::DecoderRegistry;

pub const FORMAT_VERSION: u32 = 1;
const WEIGHTS_FILENAME: &str = "model.safetensors";
const MANIFEST_FILENAME: &str = "manifest.json";

const ATTENTOR: &str = "attentor";
const DECODER: &str = "decoder";
const IN_COMBINER: &str = "in_combiner";
const INIT_QUERY: &str = "init_query";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileRecord {
    pub filename: String,
    pub sha256: String,
    pub bytes: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TensorEntry {
    pub name: String,
    pub shape: Vec<usize>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SectionRecord {
    pub name: String,
    pub tensors: Vec<TensorEntry>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DecoderRecord {
    pub kind: String,
    pub hyperparameters: serde_json::Value,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelManifest {
    pub version: u32,
    pub created_unix_timestamp: u64,
    pub sections: Vec<SectionRecord>,
    pub decoder: DecoderRecord,
    /// `"concat"` or `"combine"`.
    pub mixing: String,
    pub config: AlignConfig,
    pub weights: FileRecord,
}

impl SoftAlign {
    /// Writes `model.safetensors` and `manifest.json` into `dir`.
    pub fn save(&self, dir: impl AsRef<Path>) -> Result<ModelManifest> {
        let dir = dir.as_ref();
        fs::create_dir_all(dir)?;

        let named = self.named_parameters();
        let mut sections: Vec<SectionRecord> = Vec::new();
        let mut tensors = HashMap::with_capacity(named.len());
        for (name, var) in named {
            let section = section_of(&name);
            let entry = TensorEntry {
                name: name.clone(),
                shape: var.dims().to_vec(),
            };
            match sections.last_mut() {
                Some(last) if last.name == section => last.tensors.push(entry),
                _ => sections.push(SectionRecord {
                    name: section.to_string(),
                    tensors: vec![entry],
                }),
            }
            tensors.insert(name, var.as_tensor().clone());
        }
        // a decoder without parameters still gets its (empty) section
        if !sections.iter().any(|section| section.name == DECODER) {
            sections.insert(
                1,
                SectionRecord {
                    name: DECODER.to_string(),
                    tensors: Vec::new(),
                },
            );
        }

        let weights_path = dir.join(WEIGHTS_FILENAME);
        candle_core::safetensors::save(&tensors, &weights_path)?;

        let manifest = ModelManifest {
            version: FORMAT_VERSION,
            created_unix_timestamp: unix_timestamp(),
            sections,
            decoder: DecoderRecord {
                kind: self.decoder().kind().to_string(),
                hyperparameters: self.decoder().hyperparameters(),
            },
            mixing: self.mixing().kind().to_string(),
            config: self.config().clone(),
            weights: file_record(&weights_path)?,
        };
        write_json(&dir.join(MANIFEST_FILENAME), &manifest)?;
        log::info!(
            "saved softalign model to {} ({} tensors, decoder={})",
            dir.display(),
            tensors.len(),
            manifest.decoder.kind
        );
        Ok(manifest)
    }

    /// Reads a model written by [`SoftAlign::save`]. The encoder is left
    /// unset; attach it with [`SoftAlign::with_encoder`].
    pub fn load(dir: impl AsRef<Path>, registry: &DecoderRegistry, device: &Device) -> Result<Self> {
        let dir = dir.as_ref();
        let manifest = load_manifest(dir)?;
        if manifest.version != FORMAT_VERSION {
            return Err(ModelError::checkpoint(format!(
                "unsupported model format version {} (expected {FORMAT_VERSION})",
                manifest.version
            )));
        }
        let weights_path = dir.join(&manifest.weights.filename);
        validate_file(&weights_path, &manifest.weights.sha256)?;
        let tensors = candle_core::safetensors::load(&weights_path, device)?;

        for entry in manifest.sections.iter().flat_map(|section| &section.tensors) {
            let tensor = tensors.get(&entry.name).ok_or_else(|| {
                ModelError::checkpoint(format!("weights missing tensor '{}'", entry.name))
            })?;
            if tensor.dims() != entry.shape.as_slice() {
                return Err(ModelError::checkpoint(format!(
                    "tensor '{}' has shape {:?}, manifest says {:?}",
                    entry.name,
                    tensor.dims(),
                    entry.shape
                )));
            }
        }

        let attentor = Arc::new(Combiner::from_named_tensors(ATTENTOR, &tensors)?);
        let decoder_prefix = format!("{DECODER}.");
        let decoder_tensors = tensors
            .iter()
            .filter_map(|(name, tensor)| {
                name.strip_prefix(&decoder_prefix)
                    .map(|short| (short.to_string(), tensor.clone()))
            })
            .collect::<HashMap<_, _>>();
        let decoder = registry.build(
            &manifest.decoder.kind,
            &manifest.decoder.hyperparameters,
            &decoder_tensors,
        )?;
        let mixing = match manifest.mixing.as_str() {
            "concat" => InputMixing::Concat,
            "combine" => InputMixing::Combine(Arc::new(Combiner::from_named_tensors(
                IN_COMBINER,
                &tensors,
            )?)),
            other => {
                return Err(ModelError::checkpoint(format!(
                    "unknown input mixing '{other}'"
                )))
            }
        };
        let init_query = tensors
            .get(INIT_QUERY)
            .ok_or_else(|| ModelError::checkpoint("weights missing 'init_query'"))?;
        let init_query = Var::from_tensor(&init_query.detach())?;

        log::info!(
            "loaded softalign model from {} (version {}, decoder={})",
            dir.display(),
            manifest.version,
            manifest.decoder.kind
        );
        SoftAlign::from_parts(manifest.config, attentor, decoder, mixing, init_query)
    }
}

fn section_of(name: &str) -> &str {
    name.split('.').next().unwrap_or(name)
}

/// Reads `manifest.json` from a saved model directory.
pub fn load_manifest(dir: &Path) -> Result<ModelManifest> {
    let path = dir.join(MANIFEST_FILENAME);
    if !path.is_file() {
        return Err(ModelError::checkpoint(format!(
            "model manifest not found at {}",
            path.display()
        )));
    }
    let file = File::open(&path)?;
    Ok(serde_json::from_reader(file)?)
}

fn unix_timestamp() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

fn file_record(path: &Path) -> Result<FileRecord> {
    let filename = path
        .file_name()
        .and_then(|name| name.to_str())
        .ok_or_else(|| {
            ModelError::checkpoint(format!("file name is not valid UTF-8: {}", path.display()))
        })?
        .to_string();
    Ok(FileRecord {
        filename,
        sha256: sha256_file(path)?,
        bytes: path.metadata()?.len(),
    })
}

fn validate_file(path: &Path, expected_sha: &str) -> Result<()> {
    if sha256_file(path)? != expected_sha {
        return Err(ModelError::checkpoint(format!(
            "{} failed checksum validation",
            path.display()
        )));
    }
    Ok(())
}

fn sha256_file(path: &Path) -> Result<String> {
    let mut file = File::open(path)?;
    let mut hasher = Sha256::new();
    let mut buffer = [0u8; 64 * 1024];
    loop {
        let read = file.read(&mut buffer)?;
        if read == 0 {
            break;
        }
        hasher.update(&buffer[..read]);
    }
    Ok(hex_encode(hasher.finalize()))
}

fn write_json<T: Serialize>(path: &Path, value: &T) -> Result<()> {
    let mut file = File::create(path)?;
    file.write_all(&serde_json::to_vec_pretty(value)?)?;
    file.write_all(b"\n")?;
    Ok(())
}

