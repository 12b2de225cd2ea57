#![allow(dead_code)]

use std::sync::Arc;

use anyhow::Result;
use attention::{
    Combiner, CombinerConfig, Config, Decoder, DecoderStep, FocusFunction, SeqBatch,
};
use candle_core::{DType, Device, Tensor, Var};
use layers::{Linear, LinearConfig, LinearInit};
use rand::{rngs::StdRng, Rng};

/// Small tanh recurrence used to drive the interfacer in tests.
pub struct TanhCell {
    input: Linear,
    state: Linear,
    output: Linear,
    start: Var,
}

impl TanhCell {
    pub fn new(input_size: usize, state_size: usize, output_size: usize) -> Result<Self> {
        let device = Device::Cpu;
        let init = LinearInit::XavierNormal;
        let input = Linear::with_init(
            LinearConfig::new(input_size, state_size),
            &init,
            &device,
            DType::F64,
        )?;
        let state = Linear::with_init(
            LinearConfig {
                input_dim: state_size,
                output_dim: state_size,
                bias: false,
            },
            &init,
            &device,
            DType::F64,
        )?;
        let output = Linear::with_init(
            LinearConfig::new(state_size, output_size),
            &init,
            &device,
            DType::F64,
        )?;
        let start = Var::from_tensor(&Tensor::randn(0f64, 0.5, state_size, &device)?)?;
        Ok(Self {
            input,
            state,
            output,
            start,
        })
    }
}

impl Decoder for TanhCell {
    fn input_size(&self) -> usize {
        self.input.config().input_dim
    }

    fn output_size(&self) -> usize {
        self.output.config().output_dim
    }

    fn state_size(&self) -> usize {
        self.state.config().output_dim
    }

    fn start_state(&self) -> attention::Result<Tensor> {
        Ok(self.start.as_tensor().clone())
    }

    fn step(&self, state: &Tensor, input: &Tensor) -> attention::Result<DecoderStep> {
        let hidden = self
            .input
            .forward(input)?
            .add(&self.state.forward(state)?)?
            .tanh()?;
        let output = self.output.forward(&hidden)?;
        Ok(DecoderStep {
            state: hidden,
            output,
        })
    }

    fn named_parameters(&self) -> Vec<(String, Var)> {
        let mut named = self.input.named_parameters("input");
        named.extend(self.state.named_parameters("state"));
        named.extend(self.output.named_parameters("output"));
        named.push(("start".to_string(), self.start.clone()));
        named
    }
}

pub fn attentor(query_size: usize, encoded_size: usize, hidden: usize) -> Result<Arc<Combiner>> {
    Ok(Arc::new(Combiner::new(
        CombinerConfig::new(query_size, encoded_size, hidden, 1),
        &LinearInit::XavierNormal,
        &Device::Cpu,
        DType::F64,
    )?))
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

/// Focus functions bound to every lane of `encoded`, each lane pooled as its
/// own variable.
pub fn bound_resources(
    attentor: &Arc<Combiner>,
    encoded: &SeqBatch,
    config: &Config,
) -> Result<(Vec<FocusFunction>, Vec<Var>)> {
    let mut resources = Vec::new();
    let mut vars = Vec::new();
    for (lane, tensor) in encoded.lanes().iter().enumerate() {
        let var = Var::from_tensor(&tensor.detach())?;
        resources.push(FocusFunction::bound(
            lane,
            attentor.clone(),
            var.as_tensor().clone(),
            config,
        )?);
        vars.push(var);
    }
    Ok((resources, vars))
}

/// `sum_i <outputs_i, weights_i>` computed on plain floats.
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
