//! The SoftAlign orchestrator.
//!
//! [`SoftAlign`] owns the attentor, the decoder, the input mixing and the
//! learned initial query. `apply` encodes the input batch once, binds one
//! [`FocusFunction`] per lane to the encoded lanes, wraps the decoder in an
//! [`InterfacerBlock`] and runs it over the decoder inputs. With
//! [`QuerySeed::Primed`] the first output of every lane only primes the query
//! and is dropped; its gradient is zero on the way back.

use std::sync::Arc;

use attention::{
    AttentionError, Combiner, Decoder, Encoder, EncoderGradients, FocusFunction, Gradients,
    InputMixing, InterfacerBlock, SeqBatch, StartQuery,
};
use candle_core::{DType, Device, Tensor, Var};

use crate::config::{AlignConfig, QuerySeed};
use crate::error::{ModelError, Result};

pub struct SoftAlign {
    config: AlignConfig,
    attentor: Arc<Combiner>,
    decoder: Arc<dyn Decoder>,
    mixing: InputMixing,
    init_query: Var,
    encoder: Option<Arc<dyn Encoder>>,
}

impl SoftAlign {
    /// Assembles a model with a zero initial query.
    pub fn new(
        config: AlignConfig,
        attentor: Arc<Combiner>,
        decoder: Arc<dyn Decoder>,
        mixing: InputMixing,
        device: &Device,
        dtype: DType,
    ) -> Result<Self> {
        let init_query = Var::from_tensor(&Tensor::zeros(config.query_size, dtype, device)?)?;
        Self::from_parts(config, attentor, decoder, mixing, init_query)
    }

    /// Assembles a model from existing components.
    pub fn from_parts(
        config: AlignConfig,
        attentor: Arc<Combiner>,
        decoder: Arc<dyn Decoder>,
        mixing: InputMixing,
        init_query: Var,
    ) -> Result<Self> {
        config.validate()?;
        let mut problems = Vec::new();
        let scorer = attentor.config();
        if scorer.in1 != config.query_size {
            problems.push(format!(
                "attentor query width {} differs from query_size {}",
                scorer.in1, config.query_size
            ));
        }
        if scorer.out != 1 {
            problems.push(format!("attentor must emit one energy, emits {}", scorer.out));
        }
        if decoder.output_size() <= config.query_size {
            problems.push(format!(
                "decoder output width {} must exceed query_size {}",
                decoder.output_size(),
                config.query_size
            ));
        }
        if init_query.dims() != [config.query_size] {
            problems.push(format!(
                "init_query must be ({},), got {:?}",
                config.query_size,
                init_query.dims()
            ));
        }
        if !problems.is_empty() {
            return Err(ModelError::Validation(problems));
        }

        log::info!(
            "softalign init query_size={} seed={:?} mixing={} decoder={} score_batch={} encoder_gradients={:?}",
            config.query_size,
            config.query_seed,
            mixing.kind(),
            decoder.kind(),
            config.attention.score_batch_size,
            config.attention.encoder_gradients
        );
        Ok(Self {
            config,
            attentor,
            decoder,
            mixing,
            init_query,
            encoder: None,
        })
    }

    /// Attaches the encoder used by [`SoftAlign::apply`] and
    /// [`SoftAlign::generate`](crate::SoftAlign::generate).
    pub fn with_encoder(mut self, encoder: Arc<dyn Encoder>) -> Self {
        self.encoder = Some(encoder);
        self
    }

    pub fn config(&self) -> &AlignConfig {
        &self.config
    }

    pub fn attentor(&self) -> &Arc<Combiner> {
        &self.attentor
    }

    pub fn decoder(&self) -> &Arc<dyn Decoder> {
        &self.decoder
    }

    pub fn mixing(&self) -> &InputMixing {
        &self.mixing
    }

    pub fn init_query(&self) -> &Var {
        &self.init_query
    }

    pub fn encoder(&self) -> Option<&Arc<dyn Encoder>> {
        self.encoder.as_ref()
    }

    /// Every trainable variable except the encoder's.
    pub fn parameters(&self) -> Vec<Var> {
        self.named_parameters()
            .into_iter()
            .map(|(_, var)| var)
            .collect()
    }

    /// Variables in persisted order: attentor, decoder, input combiner,
    /// initial query.
    pub fn named_parameters(&self) -> Vec<(String, Var)> {
        let mut named = self.attentor.named_parameters("attentor");
        named.extend(
            self.decoder
                .named_parameters()
                .into_iter()
                .map(|(name, var)| (format!("decoder.{name}"), var)),
        );
        if let Some(combiner) = self.mixing.combiner() {
            named.extend(combiner.named_parameters("in_combiner"));
        }
        named.push(("init_query".to_string(), self.init_query.clone()));
        named
    }

    /// Builds the interfacer block for an already encoded batch. The block
    /// must be started with exactly `encoded.num_lanes()` lanes.
    pub fn block(&self, encoded: &SeqBatch) -> Result<InterfacerBlock<FocusFunction>> {
        encoded.ensure_non_empty("SoftAlign::block")?;
        let resources = encoded
            .lanes()
            .iter()
            .enumerate()
            .map(|(lane, tensor)| {
                FocusFunction::bound(
                    lane,
                    self.attentor.clone(),
                    tensor.clone(),
                    &self.config.attention,
                )
            })
            .collect::<attention::Result<Vec<_>>>()?;
        let start_query = match self.config.query_seed {
            QuerySeed::Learned => StartQuery::Learned(self.init_query.clone()),
            QuerySeed::Primed => StartQuery::Zeros,
        };
        Ok(InterfacerBlock::new(
            resources,
            self.decoder.clone(),
            self.mixing.clone(),
            start_query,
        )?)
    }

    /// Encodes `inputs` and decodes `decoder_inputs` lane by lane.
    ///
    /// Output lanes have the decoder-input lengths, or one step fewer with
    /// [`QuerySeed::Primed`].
    pub fn apply(&self, inputs: &SeqBatch, decoder_inputs: &SeqBatch) -> Result<AlignRun> {
        inputs.ensure_non_empty("SoftAlign::apply inputs")?;
        decoder_inputs.ensure_non_empty("SoftAlign::apply decoder inputs")?;
        if inputs.num_lanes() != decoder_inputs.num_lanes() {
            return Err(AttentionError::LaneCountMismatch {
                expected: inputs.num_lanes(),
                actual: decoder_inputs.num_lanes(),
            }
            .into());
        }
        let encoder = self.encoder.as_ref().ok_or(ModelError::MissingEncoder)?;
        let encoded = encoder.encode(inputs)?;

        let (bound, pooled) = match self.config.attention.encoder_gradients {
            EncoderGradients::Propagate => {
                let pooled = encoded
                    .lanes()
                    .iter()
                    .map(|lane| Var::from_tensor(&lane.detach()))
                    .collect::<candle_core::Result<Vec<_>>>()?;
                let lanes = pooled.iter().map(|var| var.as_tensor().clone()).collect();
                (SeqBatch::new(lanes)?, pooled)
            }
            EncoderGradients::Frozen => (encoded.detach(), Vec::new()),
        };

        let run = self.block(&bound)?.run(decoder_inputs)?;
        let outputs = match self.config.query_seed {
            QuerySeed::Learned => run.outputs().clone(),
            QuerySeed::Primed => drop_first_step(run.outputs())?,
        };
        log::debug!(
            "softalign apply lanes={} decode_steps={} encoded_lengths={:?}",
            decoder_inputs.num_lanes(),
            run.num_steps(),
            encoded.lengths()
        );

        Ok(AlignRun {
            run,
            encoded,
            pooled,
            outputs,
            seed: self.config.query_seed,
        })
    }
}

fn drop_first_step(outputs: &SeqBatch) -> Result<SeqBatch> {
    let rows = outputs
        .lanes()
        .iter()
        .map(|lane| {
            let len = lane.dim(0)?;
            (1..len)
                .map(|t| lane.narrow(0, t, 1))
                .collect::<candle_core::Result<Vec<_>>>()
        })
        .collect::<candle_core::Result<Vec<_>>>()?;
    Ok(SeqBatch::from_lane_rows(
        outputs.dim(),
        rows,
        outputs.dtype(),
        outputs.device(),
    )?)
}

fn prepend_zero_step(batch: &SeqBatch) -> Result<SeqBatch> {
    let lanes = batch
        .lanes()
        .iter()
        .map(|lane| {
            let zero = Tensor::zeros((1, batch.dim()), batch.dtype(), batch.device())?;
            if lane.dim(0)? == 0 {
                Ok(zero)
            } else {
                Tensor::cat(&[&zero, lane], 0)
            }
        })
        .collect::<candle_core::Result<Vec<_>>>()?;
    Ok(SeqBatch::new(lanes)?)
}

/// Gradients returned by [`AlignRun::backward`].
#[derive(Debug)]
pub struct AlignGrads {
    /// Gradients of the decoder inputs (zero on the priming step).
    pub decoder_inputs: SeqBatch,
    /// Gradients of the encoded sequence; `None` when encoder gradients are
    /// frozen.
    pub encoded: Option<SeqBatch>,
}

/// Forward results of [`SoftAlign::apply`].
#[derive(Debug)]
pub struct AlignRun {
    run: attention::BlockRun,
    encoded: SeqBatch,
    pooled: Vec<Var>,
    outputs: SeqBatch,
    seed: QuerySeed,
}

impl AlignRun {
    pub fn outputs(&self) -> &SeqBatch {
        &self.outputs
    }

    /// Leaf variables standing in for the encoded lanes during decoding;
    /// empty when encoder gradients are frozen.
    pub fn pooled(&self) -> &[Var] {
        &self.pooled
    }

    /// Encoder output, still attached to the encoder's parameters.
    pub fn encoded(&self) -> &SeqBatch {
        &self.encoded
    }

    /// Backpropagates `upstream` (shaped like [`AlignRun::outputs`]) through
    /// the decode steps and, unless frozen, through the encoder.
    ///
    /// Every variable watched by `grads` receives its summed gradient;
    /// the pooled encoded lanes are removed again before returning.
    pub fn backward(self, upstream: &SeqBatch, grads: &mut Gradients) -> Result<AlignGrads> {
        if upstream.lengths() != self.outputs.lengths() || upstream.dim() != self.outputs.dim() {
            return Err(AttentionError::InvalidShape {
                context: format!(
                    "upstream lanes {:?}x{} do not match outputs {:?}x{}",
                    upstream.lengths(),
                    upstream.dim(),
                    self.outputs.lengths(),
                    self.outputs.dim()
                ),
            }
            .into());
        }
        let full = match self.seed {
            QuerySeed::Learned => upstream.clone(),
            QuerySeed::Primed => prepend_zero_step(upstream)?,
        };

        for var in &self.pooled {
            grads.watch(var.as_tensor());
        }
        let block_grads = self.run.backward(&full, grads)?;

        let encoded = if self.pooled.is_empty() {
            None
        } else {
            let lane_grads = self
                .pooled
                .iter()
                .map(|var| match grads.unwatch(var.as_tensor()) {
                    Some(grad) => Ok(grad.detach()),
                    None => var.as_tensor().zeros_like(),
                })
                .collect::<candle_core::Result<Vec<_>>>()?;

            let mut surrogate: Option<Tensor> = None;
            for (lane, grad) in self.encoded.lanes().iter().zip(&lane_grads) {
                let term = lane.mul(grad)?.sum_all()?;
                surrogate = Some(match surrogate {
                    Some(total) => total.add(&term)?,
                    None => term,
                });
            }
            if let Some(surrogate) = surrogate {
                let mut store = surrogate.backward()?;
                grads.absorb(&mut store)?;
            }
            Some(SeqBatch::new(lane_grads)?)
        };

        Ok(AlignGrads {
            decoder_inputs: block_grads.inputs,
            encoded,
        })
    }
}
