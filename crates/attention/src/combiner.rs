//! Two-input feed-forward scoring network.
//!
//! `combine(a, b) = out_trans(tanh(in_trans[0](a) + in_trans[1](b)))`. The
//! first layer is split into one projection per input so the two operands can
//! have different widths. The attentor scores `(query, encoded)` pairs this
//! way, and the optional input combiner fuses `(context, step input)`.

use std::collections::HashMap;

use candle_core::{DType, Device, Tensor, Var};
use layers::{ActivationKind, Linear, LinearConfig, LinearInit};
use serde::{Deserialize, Serialize};

use crate::core::{AttentionError, Result};

/// Layer widths of a [`Combiner`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CombinerConfig {
    /// Width of the first operand.
    pub in1: usize,
    /// Width of the second operand.
    pub in2: usize,
    pub hidden: usize,
    pub out: usize,
}

impl CombinerConfig {
    pub fn new(in1: usize, in2: usize, hidden: usize, out: usize) -> Self {
        Self {
            in1,
            in2,
            hidden,
            out,
        }
    }
}

#[derive(Debug, Clone)]
pub struct Combiner {
    config: CombinerConfig,
    in_trans: [Linear; 2],
    out_trans: Linear,
    activation: ActivationKind,
}

impl Combiner {
    /// Randomly initialised combiner. Biases start at zero.
    pub fn new(
        config: CombinerConfig,
        init: &LinearInit,
        device: &Device,
        dtype: DType,
    ) -> Result<Self> {
        if config.in1 == 0 || config.in2 == 0 || config.hidden == 0 || config.out == 0 {
            return Err(AttentionError::InvalidConfig(format!(
                "combiner widths must be non-zero, got {config:?}"
            )));
        }
        let first = Linear::with_init(LinearConfig::new(config.in1, config.hidden), init, device, dtype)?;
        let second = Linear::with_init(LinearConfig::new(config.in2, config.hidden), init, device, dtype)?;
        let out_trans =
            Linear::with_init(LinearConfig::new(config.hidden, config.out), init, device, dtype)?;
        Self::from_layers([first, second], out_trans)
    }

    /// Assembles a combiner from existing layers, checking their widths agree.
    pub fn from_layers(in_trans: [Linear; 2], out_trans: Linear) -> Result<Self> {
        let hidden = in_trans[0].config().output_dim;
        if in_trans[1].config().output_dim != hidden || out_trans.config().input_dim != hidden {
            return Err(AttentionError::shape(format!(
                "combiner hidden widths disagree: {} / {} / {}",
                hidden,
                in_trans[1].config().output_dim,
                out_trans.config().input_dim
            )));
        }
        let config = CombinerConfig {
            in1: in_trans[0].config().input_dim,
            in2: in_trans[1].config().input_dim,
            hidden,
            out: out_trans.config().output_dim,
        };
        Ok(Self {
            config,
            in_trans,
            out_trans,
            activation: ActivationKind::Tanh,
        })
    }

    /// Rebuilds a combiner from tensors named like [`Combiner::named_parameters`].
    pub fn from_named_tensors(prefix: &str, tensors: &HashMap<String, Tensor>) -> Result<Self> {
        let layer = |name: String| -> Result<Linear> {
            let weight = tensors.get(&format!("{name}.weight")).ok_or_else(|| {
                AttentionError::shape(format!("missing tensor '{name}.weight'"))
            })?;
            Ok(Linear::from_tensors(weight, tensors.get(&format!("{name}.bias")))?)
        };
        Self::from_layers(
            [
                layer(format!("{prefix}.in_trans.0"))?,
                layer(format!("{prefix}.in_trans.1"))?,
            ],
            layer(format!("{prefix}.out_trans"))?,
        )
    }

    pub fn config(&self) -> &CombinerConfig {
        &self.config
    }

    /// Applies the network to `(rows, in1)` and `(rows, in2)` operands.
    pub fn combine(&self, first: &Tensor, second: &Tensor) -> Result<Tensor> {
        let (rows, _) = first.dims2()?;
        if second.dims2()?.0 != rows {
            return Err(AttentionError::shape(format!(
                "combiner operands disagree on rows: {:?} vs {:?}",
                first.dims(),
                second.dims()
            )));
        }
        let hidden = self.in_trans[0]
            .forward(first)?
            .add(&self.in_trans[1].forward(second)?)?;
        let hidden = self.activation.forward(&hidden)?;
        Ok(self.out_trans.forward(&hidden)?)
    }

    pub fn named_parameters(&self, prefix: &str) -> Vec<(String, Var)> {
        let mut named = self.in_trans[0].named_parameters(&format!("{prefix}.in_trans.0"));
        named.extend(self.in_trans[1].named_parameters(&format!("{prefix}.in_trans.1")));
        named.extend(self.out_trans.named_parameters(&format!("{prefix}.out_trans")));
        named
    }

    pub fn parameters(&self) -> Vec<Var> {
        self.in_trans
            .iter()
            .chain(std::iter::once(&self.out_trans))
            .flat_map(Linear::parameters)
            .collect()
    }
}
