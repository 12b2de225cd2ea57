#![allow(dead_code)]

use std::sync::Arc;

use anyhow::Result;
use attention::{Combiner, CombinerConfig, Config, EncoderGradients, InputMixing, SeqBatch};
use candle_core::{DType, Device, Tensor, Var};
use layers::LinearInit;
use model::{AlignConfig, ElmanConfig, ElmanDecoder, QuerySeed, RecurrentEncoder, SoftAlign};
use rand::{rngs::StdRng, Rng};

pub const RAW_INPUT: usize = 2;
pub const ENCODED: usize = 3;
pub const QUERY: usize = 2;
pub const STEP_INPUT: usize = 2;
pub const STATE: usize = 4;
pub const VISIBLE: usize = 2;

pub struct Options {
    pub seed: QuerySeed,
    pub combine: bool,
    pub gradients: EncoderGradients,
}

impl Default for Options {
    fn default() -> Self {
        Self {
            seed: QuerySeed::Learned,
            combine: false,
            gradients: EncoderGradients::Propagate,
        }
    }
}

pub fn encoder() -> Result<Arc<RecurrentEncoder>> {
    let decoder = ElmanDecoder::new(
        ElmanConfig {
            input_size: RAW_INPUT,
            state_size: 3,
            output_size: ENCODED,
        },
        &LinearInit::XavierNormal,
        &Device::Cpu,
        DType::F64,
    )?;
    Ok(Arc::new(RecurrentEncoder::new(Arc::new(decoder))))
}

/// A small model with randomly initialised parameters and a non-zero initial
/// query.
pub fn build_model(options: Options) -> Result<(SoftAlign, Arc<RecurrentEncoder>)> {
    let device = Device::Cpu;
    let init = LinearInit::XavierNormal;
    let attentor = Arc::new(Combiner::new(
        CombinerConfig::new(QUERY, ENCODED, 4, 1),
        &init,
        &device,
        DType::F64,
    )?);
    let (mixing, decoder_input) = if options.combine {
        let combiner = Combiner::new(
            CombinerConfig::new(ENCODED, STEP_INPUT, 3, 4),
            &init,
            &device,
            DType::F64,
        )?;
        (InputMixing::Combine(Arc::new(combiner)), 4)
    } else {
        (InputMixing::Concat, ENCODED + STEP_INPUT)
    };
    let decoder = ElmanDecoder::new(
        ElmanConfig {
            input_size: decoder_input,
            state_size: STATE,
            output_size: QUERY + VISIBLE,
        },
        &init,
        &device,
        DType::F64,
    )?;
    let config = AlignConfig::new(QUERY)
        .with_query_seed(options.seed)
        .with_attention(Config {
            score_batch_size: 2,
            encoder_gradients: options.gradients,
        });
    let encoder = encoder()?;
    let model = SoftAlign::new(config, attentor, Arc::new(decoder), mixing, &device, DType::F64)?
        .with_encoder(encoder.clone());
    model
        .init_query()
        .set(&Tensor::new(&[0.3f64, -0.4], &device)?)?;
    Ok((model, encoder))
}

pub fn random_rows(rng: &mut StdRng, dim: usize, lengths: &[usize]) -> Vec<Vec<Vec<f64>>> {
    lengths
        .iter()
        .map(|len| {
            (0..*len)
                .map(|_| (0..dim).map(|_| rng.gen_range(-1.0..1.0)).collect())
                .collect()
        })
        .collect()
}

pub fn batch(dim: usize, rows: &[Vec<Vec<f64>>]) -> Result<SeqBatch> {
    Ok(SeqBatch::from_rows(dim, rows, DType::F64, &Device::Cpu)?)
}

pub fn weighted_loss(outputs: &SeqBatch, weights: &[Vec<Vec<f64>>]) -> Result<f64> {
    let rows = outputs.to_rows()?;
    let mut total = 0.0;
    for (lane, lane_weights) in rows.iter().zip(weights) {
        for (row, row_weights) in lane.iter().zip(lane_weights) {
            for (value, weight) in row.iter().zip(row_weights) {
                total += value * weight;
            }
        }
    }
    Ok(total)
}

/// Central difference of `loss` with respect to entry `index` of `var`.
pub fn numeric_grad<F>(var: &Var, index: usize, eps: f64, mut loss: F) -> Result<f64>
where
    F: FnMut() -> Result<f64>,
{
    let original = var.as_tensor().flatten_all()?.to_vec1::<f64>()?;
    let shape = var.shape().clone();
    let device = var.device().clone();
    let mut eval = |delta: f64| -> Result<f64> {
        let mut values = original.clone();
        values[index] += delta;
        var.set(&Tensor::from_vec(values, shape.clone(), &device)?)?;
        loss()
    };
    let plus = eval(eps)?;
    let minus = eval(-eps)?;
    var.set(&Tensor::from_vec(original.clone(), shape.clone(), &device)?)?;
    Ok((plus - minus) / (2.0 * eps))
}

pub fn flat(tensor: &Tensor) -> Result<Vec<f64>> {
    Ok(tensor.flatten_all()?.to_vec1::<f64>()?)
}

pub fn assert_close(analytic: f64, numeric: f64, what: &str) {
    let scale = analytic.abs().max(numeric.abs()).max(1.0);
    assert!(
        (analytic - numeric).abs() <= 1e-5 * scale,
        "{what}: analytic {analytic} vs numeric {numeric}"
    );
}
