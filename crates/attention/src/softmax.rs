//! Numerically stable softmax over whole sequences.
//!
//! Each lane of a [`SeqBatch`] is one distribution over its timesteps (per
//! feature column). The running maximum is floored at the most negative
//! finite value of the dtype rather than `-inf`, and the reciprocal of the
//! sum carries a tiny additive guard, so lanes of very negative (or infinite)
//! values still normalise to finite numbers.

use candle_core::{DType, Tensor};

use crate::core::{Result, SeqBatch};

/// Added to every sum before inverting it.
pub const SUM_EPSILON: f64 = 1e-30;

/// Floor for the running maximum: the most negative finite `dtype` value.
/// It never sits above real data, so the largest element of a lane always
/// maps to `exp(0)`.
pub fn max_floor(dtype: DType) -> f64 {
    match dtype {
        DType::F64 => f64::MIN,
        DType::F16 => -65_504.0,
        DType::BF16 => -3.38e38,
        _ => f64::from(f32::MIN),
    }
}

/// Normalises a `(len, width)` lane so each column sums to one over time.
///
/// The maximum is treated as a constant for differentiation.
pub fn normalize_sequence(lane: &Tensor) -> candle_core::Result<Tensor> {
    let (len, width) = lane.dims2()?;
    if len == 0 {
        return Ok(lane.clone());
    }
    let floor = Tensor::full(max_floor(lane.dtype()), (1, width), lane.device())?
        .to_dtype(lane.dtype())?;
    let max = lane.max_keepdim(0)?.maximum(&floor)?.detach();
    let exps = lane.broadcast_sub(&max)?.exp()?;
    let inv_sum = exps.sum_keepdim(0)?.affine(1.0, SUM_EPSILON)?.recip()?;
    exps.broadcast_mul(&inv_sum)
}

/// Applies [`normalize_sequence`] to every lane.
pub fn seq_softmax(batch: &SeqBatch) -> Result<SeqBatch> {
    batch.map_lanes(|_, lane| Ok(normalize_sequence(lane)?))
}
