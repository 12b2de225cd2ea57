//! Lightweight validation helpers shared across layer components.
//!
//! These routines provide concise shape and dtype assertions that can be wired
//! into constructors or forward paths. They return `candle_core::Result<()>`
//! so call sites can propagate errors without panicking.

use candle_core::{DType, Error, Result, Tensor};

/// Ensures a tensor matches the expected dimensions exactly.
pub fn expect_shape(name: &str, tensor: &Tensor, expected: &[usize]) -> Result<()> {
    let actual = tensor.dims();
    if actual == expected {
        Ok(())
    } else {
        Err(Error::Msg(format!(
            "{name}: expected shape {:?}, got {:?}",
            expected, actual
        )))
    }
}

/// Ensures a tensor has exactly `rank` dimensions.
pub fn expect_rank(name: &str, tensor: &Tensor, rank: usize) -> Result<()> {
    if tensor.rank() == rank {
        Ok(())
    } else {
        Err(Error::Msg(format!(
            "{name}: expected rank {rank}, got shape {:?}",
            tensor.dims()
        )))
    }
}

/// Validates the `(rows, features)` convention with a known feature count.
pub fn expect_rows_of(name: &str, tensor: &Tensor, features: usize) -> Result<usize> {
    match tensor.dims() {
        [rows, actual] if *actual == features => Ok(*rows),
        dims => Err(Error::Msg(format!(
            "{name}: expected (rows, {features}) layout, got {:?}",
            dims
        ))),
    }
}

/// Checks the tensor dtype is one of the allowed values.
pub fn expect_dtype_in(name: &str, tensor: &Tensor, allowed: &[DType]) -> Result<()> {
    let dtype = tensor.dtype();
    if allowed.iter().copied().any(|allowed| allowed == dtype) {
        Ok(())
    } else {
        Err(Error::Msg(format!(
            "{name}: expected dtype in {:?}, got {:?}",
            allowed, dtype
        )))
    }
}

/// Parameters and activations are kept in `f32` or `f64`.
pub fn expect_supported_dtype(dtype: DType) -> Result<()> {
    match dtype {
        DType::F32 | DType::F64 => Ok(()),
        other => Err(Error::Msg(format!(
            "unsupported parameter dtype {other:?}, expected F32 or F64"
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::Device;

    #[test]
    fn rows_of_reports_row_count() -> Result<()> {
        let t = Tensor::zeros((3, 4), DType::F32, &Device::Cpu)?;
        assert_eq!(expect_rows_of("t", &t, 4)?, 3);
        assert!(expect_rows_of("t", &t, 5).is_err());
        Ok(())
    }

    #[test]
    fn rank_and_dtype_checks() -> Result<()> {
        let t = Tensor::zeros(4, DType::F64, &Device::Cpu)?;
        expect_rank("t", &t, 1)?;
        expect_shape("t", &t, &[4])?;
        assert!(expect_rank("t", &t, 2).is_err());
        assert!(expect_dtype_in("t", &t, &[DType::F32]).is_err());
        Ok(())
    }
}
