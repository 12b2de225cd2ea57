//! SoftAlign: encoder, attention and decoder wired into one model.
//!
//! The [`SoftAlign`] orchestrator encodes an input batch, builds one focus
//! function per lane and drives a recurrent [`Decoder`](attention::Decoder)
//! through the attention interfacer. It supports batch application with a
//! reverse-time backward pass, persistence of its parameters, and streaming
//! generation from a single input sequence.

pub mod align;
pub mod config;
pub mod decoders;
pub mod error;
pub mod generate;
pub mod persist;
pub mod registry;

pub use align::{AlignGrads, AlignRun, SoftAlign};
pub use config::{AlignConfig, QuerySeed};
pub use decoders::{ElmanConfig, ElmanDecoder, RecurrentEncoder};
pub use error::{ModelError, Result};
pub use generate::{CancelToken, Generator};
pub use persist::{load_manifest, ModelManifest, FORMAT_VERSION};
pub use registry::{DecoderFactory, DecoderRegistry};
