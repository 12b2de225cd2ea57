//! Reference recurrent components.
//!
//! [`ElmanDecoder`] is a single-layer tanh recurrence with a learned start
//! state; it is registered as `"elman"` in the builtin
//! [`DecoderRegistry`](crate::DecoderRegistry). [`RecurrentEncoder`] runs any
//! [`Decoder`] over an input batch and returns its outputs as the encoded
//! sequence, keeping the whole computation attached to the autograd graph.

use std::collections::HashMap;
use std::sync::Arc;

use attention::{AttentionError, Decoder, DecoderStep, Encoder, SeqBatch};
use candle_core::{DType, Device, Tensor, Var};
use layers::{Linear, LinearConfig, LinearInit};
use serde::{Deserialize, Serialize};

use crate::error::{ModelError, Result};

/// Widths of an [`ElmanDecoder`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ElmanConfig {
    pub input_size: usize,
    pub state_size: usize,
    pub output_size: usize,
}

/// `h' = tanh(W_i x + W_s h + b)`, `y = W_o h' + b_o`.
#[derive(Debug, Clone)]
pub struct ElmanDecoder {
    config: ElmanConfig,
    input: Linear,
    recurrent: Linear,
    output: Linear,
    start: Var,
}

impl ElmanDecoder {
    pub const KIND: &'static str = "elman";

    pub fn new(config: ElmanConfig, init: &LinearInit, device: &Device, dtype: DType) -> Result<Self> {
        let input = Linear::with_init(
            LinearConfig::new(config.input_size, config.state_size),
            init,
            device,
            dtype,
        )?;
        let recurrent = Linear::with_init(
            LinearConfig {
                input_dim: config.state_size,
                output_dim: config.state_size,
                bias: false,
            },
            init,
            device,
            dtype,
        )?;
        let output = Linear::with_init(
            LinearConfig::new(config.state_size, config.output_size),
            init,
            device,
            dtype,
        )?;
        let start = Var::from_tensor(&Tensor::zeros(config.state_size, dtype, device)?)?;
        Ok(Self {
            config,
            input,
            recurrent,
            output,
            start,
        })
    }

    /// Rebuilds a decoder from tensors named like
    /// [`Decoder::named_parameters`].
    pub fn from_named_tensors(
        config: ElmanConfig,
        tensors: &HashMap<String, Tensor>,
    ) -> Result<Self> {
        let get = |name: &str| {
            tensors
                .get(name)
                .ok_or_else(|| ModelError::checkpoint(format!("elman decoder missing '{name}'")))
        };
        let input = Linear::from_tensors(get("input.weight")?, Some(get("input.bias")?))?;
        let recurrent = Linear::from_tensors(get("recurrent.weight")?, None)?;
        let output = Linear::from_tensors(get("output.weight")?, Some(get("output.bias")?))?;
        let start = Var::from_tensor(&get("start")?.detach())?;

        let rebuilt = ElmanConfig {
            input_size: input.config().input_dim,
            state_size: recurrent.config().output_dim,
            output_size: output.config().output_dim,
        };
        if rebuilt != config || start.dims() != [config.state_size] {
            return Err(ModelError::checkpoint(format!(
                "elman tensors describe {rebuilt:?}, manifest says {config:?}"
            )));
        }
        Ok(Self {
            config,
            input,
            recurrent,
            output,
            start,
        })
    }

    pub fn config(&self) -> &ElmanConfig {
        &self.config
    }
}

impl Decoder for ElmanDecoder {
    fn input_size(&self) -> usize {
        self.config.input_size
    }

    fn output_size(&self) -> usize {
        self.config.output_size
    }

    fn state_size(&self) -> usize {
        self.config.state_size
    }

    fn start_state(&self) -> attention::Result<Tensor> {
        Ok(self.start.as_tensor().clone())
    }

    fn step(&self, state: &Tensor, input: &Tensor) -> attention::Result<DecoderStep> {
        let hidden = self
            .input
            .forward(input)?
            .add(&self.recurrent.forward(state)?)?
            .tanh()?;
        let output = self.output.forward(&hidden)?;
        Ok(DecoderStep {
            state: hidden,
            output,
        })
    }

    fn named_parameters(&self) -> Vec<(String, Var)> {
        let mut named = self.input.named_parameters("input");
        named.extend(self.recurrent.named_parameters("recurrent"));
        named.extend(self.output.named_parameters("output"));
        named.push(("start".to_string(), self.start.clone()));
        named
    }

    fn kind(&self) -> &str {
        Self::KIND
    }

    fn hyperparameters(&self) -> serde_json::Value {
        serde_json::to_value(self.config).unwrap_or_default()
    }
}

/// Encodes a batch by running a recurrent decoder over every lane.
#[derive(Clone)]
pub struct RecurrentEncoder {
    decoder: Arc<dyn Decoder>,
}

impl RecurrentEncoder {
    pub fn new(decoder: Arc<dyn Decoder>) -> Self {
        Self { decoder }
    }

    pub fn decoder(&self) -> &Arc<dyn Decoder> {
        &self.decoder
    }
}

impl Encoder for RecurrentEncoder {
    fn encode(&self, inputs: &SeqBatch) -> attention::Result<SeqBatch> {
        inputs.ensure_non_empty("RecurrentEncoder::encode")?;
        if inputs.dim() != self.decoder.input_size() {
            return Err(AttentionError::InvalidShape {
                context: format!(
                    "encoder expects width {}, got {}",
                    self.decoder.input_size(),
                    inputs.dim()
                ),
            });
        }

        let lanes_total = inputs.num_lanes();
        let state_size = self.decoder.state_size();
        let mut state = self
            .decoder
            .start_state()?
            .unsqueeze(0)?
            .broadcast_as((lanes_total, state_size))?
            .contiguous()?;
        let mut lanes: Vec<usize> = (0..lanes_total).collect();
        let mut outputs: Vec<Vec<Tensor>> = vec![Vec::new(); lanes_total];

        for step in 0..inputs.max_len() {
            let (present, input) = inputs.timestep(step)?;
            if present.len() < lanes.len() {
                let keep = present
                    .iter()
                    .map(|lane| lanes.iter().position(|l| l == lane).map(|row| row as u32))
                    .collect::<Option<Vec<_>>>()
                    .ok_or_else(|| AttentionError::InvalidShape {
                        context: format!("lane reappeared at timestep {step}"),
                    })?;
                let index = Tensor::new(keep.as_slice(), state.device())?;
                state = state.contiguous()?.index_select(&index, 0)?;
                lanes = present;
            }
            let DecoderStep { state: next, output } = self
                .decoder
                .step(&state, &input)
                .map_err(|err| err.at_step(step))?;
            for (row, lane) in lanes.iter().enumerate() {
                outputs[*lane].push(output.narrow(0, row, 1)?);
            }
            state = next;
        }

        SeqBatch::from_lane_rows(
            self.decoder.output_size(),
            outputs,
            inputs.dtype(),
            inputs.device(),
        )
    }

    fn parameters(&self) -> Vec<Var> {
        self.decoder.parameters()
    }
}
