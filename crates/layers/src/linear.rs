//! Linear and affine projection helpers.
//!
//! Linear layers expect inputs shaped `(rows, in_dim)` and return
//! `(rows, out_dim)`; a sequence lane is just a matrix with one row per step.
//! Weights are stored `(out_dim, in_dim)` as trainable [`Var`]s and the bias,
//! when enabled, as a `(out_dim,)` vector. Initialisation policies mirror the
//! usual recipes (Glorot, Kaiming, scaled variants).

use candle_core::{DType, Device, Error, Result, Tensor, Var};

use crate::checks;

/// Configuration shared by dense projection layers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LinearConfig {
    /// Incoming feature dimension.
    pub input_dim: usize,
    /// Output feature dimension.
    pub output_dim: usize,
    /// Whether a learnable bias vector should be applied.
    pub bias: bool,
}

impl LinearConfig {
    /// Creates a configuration for a projection layer with bias.
    pub fn new(input_dim: usize, output_dim: usize) -> Self {
        Self {
            input_dim,
            output_dim,
            bias: true,
        }
    }
}

/// Supported weight initialisation policies.
#[derive(Debug, Clone)]
pub enum LinearInit {
    /// Xavier/Glorot uniform initialisation.
    XavierUniform,
    /// Xavier/Glorot normal initialisation.
    XavierNormal,
    /// Kaiming/He uniform initialisation.
    KaimingUniform { negative_slope: f64 },
    /// Kaiming/He normal initialisation.
    KaimingNormal { negative_slope: f64 },
    /// Scales another policy.
    Scaled { base: Box<LinearInit>, scale: f64 },
}

impl LinearInit {
    /// Convenience helper to scale an existing policy.
    pub fn scaled(base: LinearInit, scale: f64) -> Self {
        Self::Scaled {
            base: Box::new(base),
            scale,
        }
    }

    fn sample(&self, shape: (usize, usize), device: &Device) -> Result<Tensor> {
        let (out_dim, in_dim) = shape;
        let (fan_in, fan_out) = (in_dim as f64, out_dim as f64);
        match self {
            LinearInit::XavierUniform => {
                let bound = (6.0f64 / (fan_in + fan_out)).sqrt();
                Tensor::rand(-bound, bound, shape, device)
            }
            LinearInit::XavierNormal => {
                let std = (2.0f64 / (fan_in + fan_out)).sqrt();
                Tensor::randn(0f64, std, shape, device)
            }
            LinearInit::KaimingUniform { negative_slope } => {
                let gain = (2.0f64 / (1.0 + negative_slope.powi(2))).sqrt();
                let bound = 3.0f64.sqrt() * gain / fan_in.sqrt();
                Tensor::rand(-bound, bound, shape, device)
            }
            LinearInit::KaimingNormal { negative_slope } => {
                let gain = (2.0f64 / (1.0 + negative_slope.powi(2))).sqrt();
                Tensor::randn(0f64, gain / fan_in.sqrt(), shape, device)
            }
            LinearInit::Scaled { base, scale } => base.sample(shape, device)?.affine(*scale, 0.0),
        }
    }
}

/// Dense affine projection with optional bias.
#[derive(Debug, Clone)]
pub struct Linear {
    config: LinearConfig,
    weight: Var,
    bias: Option<Var>,
}

impl Linear {
    /// Constructs a linear layer from pre-existing parameters.
    ///
    /// The tensors are copied into fresh variables, so the layer never aliases
    /// the caller's storage.
    pub fn new(config: LinearConfig, weight: &Tensor, bias: Option<&Tensor>) -> Result<Self> {
        Self::validate_weight(&config, weight)?;
        Self::validate_bias(&config, bias)?;
        Ok(Self {
            config,
            weight: Var::from_tensor(&weight.detach())?,
            bias: bias.map(|b| Var::from_tensor(&b.detach())).transpose()?,
        })
    }

    /// Rebuilds a layer from stored tensors, inferring the configuration from
    /// the weight shape.
    pub fn from_tensors(weight: &Tensor, bias: Option<&Tensor>) -> Result<Self> {
        checks::expect_rank("linear.weight", weight, 2)?;
        let (output_dim, input_dim) = weight.dims2()?;
        let config = LinearConfig {
            input_dim,
            output_dim,
            bias: bias.is_some(),
        };
        Self::new(config, weight, bias)
    }

    /// Builds a linear layer with randomly initialised weights following `init`.
    pub fn with_init(
        config: LinearConfig,
        init: &LinearInit,
        device: &Device,
        dtype: DType,
    ) -> Result<Self> {
        checks::expect_supported_dtype(dtype)?;
        let weight = init
            .sample((config.output_dim, config.input_dim), device)?
            .to_dtype(dtype)?;
        let bias = if config.bias {
            Some(Tensor::zeros(config.output_dim, dtype, device)?)
        } else {
            None
        };
        Self::new(config, &weight, bias.as_ref())
    }

    /// Returns the static configuration.
    pub fn config(&self) -> &LinearConfig {
        &self.config
    }

    /// Returns the weight tensor (tracked, shares storage with the variable).
    pub fn weight(&self) -> &Tensor {
        self.weight.as_tensor()
    }

    /// Returns the bias tensor if present.
    pub fn bias(&self) -> Option<&Tensor> {
        self.bias.as_ref().map(Var::as_tensor)
    }

    /// Trainable variables in `weight`, `bias` order.
    pub fn parameters(&self) -> Vec<Var> {
        let mut params = vec![self.weight.clone()];
        params.extend(self.bias.iter().cloned());
        params
    }

    /// Variables keyed by `{prefix}.weight` / `{prefix}.bias`.
    pub fn named_parameters(&self, prefix: &str) -> Vec<(String, Var)> {
        let mut named = vec![(format!("{prefix}.weight"), self.weight.clone())];
        if let Some(bias) = &self.bias {
            named.push((format!("{prefix}.bias"), bias.clone()));
        }
        named
    }

    /// Applies `x W^T + b` to a `(rows, input_dim)` matrix.
    pub fn forward(&self, hidden: &Tensor) -> Result<Tensor> {
        checks::expect_rows_of("linear.input", hidden, self.config.input_dim)?;
        let projected = hidden.matmul(&self.weight.t()?)?;
        match &self.bias {
            Some(bias) => projected.broadcast_add(bias.as_tensor()),
            None => Ok(projected),
        }
    }

    fn validate_weight(config: &LinearConfig, weight: &Tensor) -> Result<()> {
        checks::expect_rank("linear.weight", weight, 2)?;
        checks::expect_shape(
            "linear.weight",
            weight,
            &[config.output_dim, config.input_dim],
        )?;
        checks::expect_dtype_in("linear.weight", weight, &[DType::F32, DType::F64])
    }

    fn validate_bias(config: &LinearConfig, bias: Option<&Tensor>) -> Result<()> {
        match (config.bias, bias) {
            (true, Some(tensor)) => {
                checks::expect_shape("linear.bias", tensor, &[config.output_dim])?;
                checks::expect_dtype_in("linear.bias", tensor, &[DType::F32, DType::F64])
            }
            (false, Some(_)) => Err(Error::Msg("bias provided but config disables bias".into())),
            (true, None) => Err(Error::Msg("config expects bias but none supplied".into())),
            (false, None) => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tensor_stats(tensor: &Tensor) -> Result<(f64, f64)> {
        let values = tensor.to_dtype(DType::F64)?.flatten_all()?.to_vec1::<f64>()?;
        let mean = values.iter().sum::<f64>() / values.len() as f64;
        let var = values.iter().map(|v| (v - mean) * (v - mean)).sum::<f64>() / values.len() as f64;
        Ok((mean, var.sqrt()))
    }

    #[test]
    fn forward_matches_reference() -> Result<()> {
        let device = Device::Cpu;
        let weight = Tensor::new(&[[1.0f64, 2.0], [-1.0, 0.5], [0.0, 3.0]], &device)?;
        let bias = Tensor::new(&[0.5f64, -0.5, 1.0], &device)?;
        let linear = Linear::from_tensors(&weight, Some(&bias))?;
        assert_eq!(linear.config(), &LinearConfig::new(2, 3));

        let input = Tensor::new(&[[1.0f64, 1.0], [2.0, -1.0]], &device)?;
        let output = linear.forward(&input)?.to_vec2::<f64>()?;
        assert_eq!(output, vec![vec![3.5, -1.0, 4.0], vec![0.5, -3.0, -2.0]]);
        Ok(())
    }

    #[test]
    fn rejects_inputs_outside_row_layout() -> Result<()> {
        let device = Device::Cpu;
        let linear = Linear::with_init(
            LinearConfig::new(4, 2),
            &LinearInit::XavierUniform,
            &device,
            DType::F32,
        )?;
        assert!(linear.forward(&Tensor::zeros((2, 3, 4), DType::F32, &device)?).is_err());
        assert!(linear.forward(&Tensor::zeros((2, 5), DType::F32, &device)?).is_err());
        Ok(())
    }

    #[test]
    fn gradients_reach_parameters() -> Result<()> {
        let device = Device::Cpu;
        let linear = Linear::with_init(
            LinearConfig::new(3, 2),
            &LinearInit::XavierNormal,
            &device,
            DType::F64,
        )?;
        let input = Tensor::new(&[[1.0f64, 2.0, 3.0]], &device)?;
        let grads = linear.forward(&input)?.sum_all()?.backward()?;
        let weight_grad = grads
            .get(linear.weight())
            .expect("weight gradient")
            .to_vec2::<f64>()?;
        assert_eq!(weight_grad, vec![vec![1.0, 2.0, 3.0], vec![1.0, 2.0, 3.0]]);
        let bias_grad = grads.get(linear.bias().expect("bias")).expect("bias gradient");
        assert_eq!(bias_grad.to_vec1::<f64>()?, vec![1.0, 1.0]);
        Ok(())
    }

    #[test]
    fn glorot_normal_stats_are_reasonable() -> Result<()> {
        let device = Device::Cpu;
        let linear = Linear::with_init(
            LinearConfig::new(128, 64),
            &LinearInit::XavierNormal,
            &device,
            DType::F32,
        )?;
        let (mean, std) = tensor_stats(linear.weight())?;
        let expected = (2.0f64 / (128.0 + 64.0)).sqrt();
        assert!(mean.abs() < 5e-3);
        assert!((std - expected).abs() < expected * 0.25);
        Ok(())
    }

    #[test]
    fn kaiming_uniform_respects_scale() -> Result<()> {
        let device = Device::Cpu;
        let init = LinearInit::scaled(
            LinearInit::KaimingUniform {
                negative_slope: 0.0,
            },
            0.5,
        );
        let linear = Linear::with_init(LinearConfig::new(256, 256), &init, &device, DType::F32)?;
        let (_, std) = tensor_stats(linear.weight())?;
        let expected = (2.0f64 / 256.0).sqrt() * 0.5;
        assert!((std - expected).abs() < expected * 0.25);
        Ok(())
    }

    #[test]
    fn mismatched_bias_is_rejected() -> Result<()> {
        let device = Device::Cpu;
        let weight = Tensor::zeros((2, 3), DType::F32, &device)?;
        let bias = Tensor::zeros(3, DType::F32, &device)?;
        assert!(Linear::new(LinearConfig::new(3, 2), &weight, Some(&bias)).is_err());
        let mut config = LinearConfig::new(3, 2);
        config.bias = false;
        assert!(Linear::new(config, &weight, Some(&bias)).is_err());
        Ok(())
    }
}
