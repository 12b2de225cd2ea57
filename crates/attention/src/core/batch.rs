//! Batches of variable-length vector sequences.
//!
//! A [`SeqBatch`] holds one `(len, dim)` tensor per lane. Lane `i` is present
//! at timestep `t` iff `t < len_i`, so presence only ever decreases over time.
//! Per-timestep views gather the present lanes in ascending lane order.

use candle_core::{DType, Device, Tensor};

use super::errors::{AttentionError, Result};

/// Ordered lanes of vector sequences sharing one feature width.
#[derive(Debug, Clone)]
pub struct SeqBatch {
    lanes: Vec<Tensor>,
    lengths: Vec<usize>,
    dim: usize,
    dtype: DType,
    device: Device,
}

impl SeqBatch {
    /// Builds a batch from `(len, dim)` lane tensors. At least one lane is
    /// required to infer the layout; use [`SeqBatch::empty`] otherwise.
    pub fn new(lanes: Vec<Tensor>) -> Result<Self> {
        let first = lanes.first().ok_or_else(|| AttentionError::EmptyBatch {
            context: "SeqBatch::new".into(),
        })?;
        let dim = match first.dims() {
            [_, dim] => *dim,
            dims => {
                return Err(AttentionError::shape(format!(
                    "lane 0 must be (len, dim), got {dims:?}"
                )))
            }
        };
        let dtype = first.dtype();
        let device = first.device().clone();

        let mut lengths = Vec::with_capacity(lanes.len());
        for (index, lane) in lanes.iter().enumerate() {
            match lane.dims() {
                [len, d] if *d == dim => lengths.push(*len),
                dims => {
                    return Err(AttentionError::shape(format!(
                        "lane {index} must be (len, {dim}), got {dims:?}"
                    )))
                }
            }
            if lane.dtype() != dtype {
                return Err(AttentionError::shape(format!(
                    "lane {index} has dtype {:?}, expected {dtype:?}",
                    lane.dtype()
                )));
            }
            if !lane.device().same_device(&device) {
                return Err(AttentionError::shape(format!(
                    "lane {index} lives on a different device"
                )));
            }
        }

        Ok(Self {
            lanes,
            lengths,
            dim,
            dtype,
            device,
        })
    }

    /// A batch without lanes.
    pub fn empty(dim: usize, dtype: DType, device: &Device) -> Self {
        Self {
            lanes: Vec::new(),
            lengths: Vec::new(),
            dim,
            dtype,
            device: device.clone(),
        }
    }

    /// Builds a batch from nested rows (`lanes[i][t]` is one vector of width
    /// `dim`). Lanes may be empty.
    pub fn from_rows(
        dim: usize,
        lanes: &[Vec<Vec<f64>>],
        dtype: DType,
        device: &Device,
    ) -> Result<Self> {
        if lanes.is_empty() {
            return Ok(Self::empty(dim, dtype, device));
        }
        let mut tensors = Vec::with_capacity(lanes.len());
        for (index, rows) in lanes.iter().enumerate() {
            let mut flat = Vec::with_capacity(rows.len() * dim);
            for row in rows {
                if row.len() != dim {
                    return Err(AttentionError::shape(format!(
                        "lane {index} has a row of width {}, expected {dim}",
                        row.len()
                    )));
                }
                flat.extend_from_slice(row);
            }
            let tensor = Tensor::from_vec(flat, (rows.len(), dim), device)?.to_dtype(dtype)?;
            tensors.push(tensor);
        }
        Self::new(tensors)
    }

    /// Assembles lanes from per-lane row tensors shaped `(1, dim)`.
    pub fn from_lane_rows(
        dim: usize,
        rows: Vec<Vec<Tensor>>,
        dtype: DType,
        device: &Device,
    ) -> Result<Self> {
        if rows.is_empty() {
            return Ok(Self::empty(dim, dtype, device));
        }
        let lanes = rows
            .into_iter()
            .map(|lane| {
                if lane.is_empty() {
                    Tensor::zeros((0, dim), dtype, device)
                } else {
                    Tensor::cat(&lane, 0)
                }
            })
            .collect::<candle_core::Result<Vec<_>>>()?;
        Self::new(lanes)
    }

    pub fn lanes(&self) -> &[Tensor] {
        &self.lanes
    }

    pub fn lane(&self, index: usize) -> Option<&Tensor> {
        self.lanes.get(index)
    }

    pub fn num_lanes(&self) -> usize {
        self.lanes.len()
    }

    pub fn lengths(&self) -> &[usize] {
        &self.lengths
    }

    /// Length of the longest lane (0 for an empty batch).
    pub fn max_len(&self) -> usize {
        self.lengths.iter().copied().max().unwrap_or(0)
    }

    /// Feature width shared by every lane.
    pub fn dim(&self) -> usize {
        self.dim
    }

    pub fn dtype(&self) -> DType {
        self.dtype
    }

    pub fn device(&self) -> &Device {
        &self.device
    }

    /// Lanes present at `step` (ascending) and their vectors stacked as
    /// `(present, dim)`.
    pub fn timestep(&self, step: usize) -> Result<(Vec<usize>, Tensor)> {
        let mut present = Vec::new();
        let mut rows = Vec::new();
        for (index, (lane, len)) in self.lanes.iter().zip(&self.lengths).enumerate() {
            if step < *len {
                present.push(index);
                rows.push(lane.narrow(0, step, 1)?);
            }
        }
        if rows.is_empty() {
            return Err(AttentionError::shape(format!(
                "no lane is present at timestep {step}"
            )));
        }
        Ok((present, Tensor::cat(&rows, 0)?))
    }

    /// Same lanes, cut from the autograd graph.
    pub fn detach(&self) -> Self {
        Self {
            lanes: self.lanes.iter().map(Tensor::detach).collect(),
            lengths: self.lengths.clone(),
            dim: self.dim,
            dtype: self.dtype,
            device: self.device.clone(),
        }
    }

    /// Replaces every lane through `f`, which must keep lane lengths.
    pub fn map_lanes<F>(&self, mut f: F) -> Result<Self>
    where
        F: FnMut(usize, &Tensor) -> Result<Tensor>,
    {
        if self.lanes.is_empty() {
            return Ok(self.clone());
        }
        let lanes = self
            .lanes
            .iter()
            .enumerate()
            .map(|(index, lane)| f(index, lane))
            .collect::<Result<Vec<_>>>()?;
        let mapped = Self::new(lanes)?;
        if mapped.lengths != self.lengths {
            return Err(AttentionError::shape(format!(
                "lane mapping changed lengths from {:?} to {:?}",
                self.lengths, mapped.lengths
            )));
        }
        Ok(mapped)
    }

    /// Fails on an empty batch or any zero-length lane.
    pub fn ensure_non_empty(&self, context: &str) -> Result<()> {
        if self.lanes.is_empty() {
            return Err(AttentionError::EmptyBatch {
                context: context.to_string(),
            });
        }
        if let Some(lane) = self.lengths.iter().position(|len| *len == 0) {
            return Err(AttentionError::EmptyLane {
                lane,
                context: context.to_string(),
            });
        }
        Ok(())
    }

    /// Copies every lane into nested `f64` rows.
    pub fn to_rows(&self) -> Result<Vec<Vec<Vec<f64>>>> {
        self.lanes
            .iter()
            .map(|lane| Ok(lane.to_dtype(DType::F64)?.to_vec2::<f64>()?))
            .collect()
    }
}
