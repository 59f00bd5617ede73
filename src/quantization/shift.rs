//! Single-shift quantization: snap each element to the nearest signed power of two.
//!
//! ```text
//! q = sign(x) * 2^clamp(round(log2|x|), -shift_bits, 0)
//! ```

use std::f64::consts::LN_2;

use candle_core::{DType, Tensor};

use crate::config::{validate_shift_bits, LightnnConfig, QuantMode, ZeroPolicy, MAX_SHIFT_BITS};
use crate::error::{LightnnError, Result};

/// Fail unless `mode` has an implementation.
pub(crate) fn ensure_supported(mode: QuantMode) -> Result<()> {
    match mode {
        QuantMode::Deterministic => Ok(()),
        QuantMode::Stochastic => Err(LightnnError::UnsupportedMode(mode)),
    }
}

/// Elementwise sign in {-1, 0, +1}.
fn signum(x: &Tensor) -> Result<Tensor> {
    let positive = x.gt(0.0)?.to_dtype(x.dtype())?;
    let negative = x.lt(0.0)?.to_dtype(x.dtype())?;
    Ok((positive - negative)?)
}

/// Largest `shift_bits` whose `2^-shift_bits` is a normal number in `dtype`.
fn max_shift_bits_for(dtype: DType) -> u32 {
    match dtype {
        DType::F16 => 14,
        _ => MAX_SHIFT_BITS,
    }
}

/// Quantize every element of `tensor` to `0` or `±2^k`, `k ∈ [-shift_bits, 0]`.
///
/// # Algorithm
///
/// 1. `s = sign(x)`, `a = |x|`
/// 2. zeros are masked to `1` before the logarithm so no `-inf` appears
/// 3. `k = clamp(round(log2 a), -shift_bits, 0)`
/// 4. `q = s * 2^k`
///
/// Magnitudes `>= 1` saturate to `1`. With [`ZeroPolicy::Saturate`] small
/// non-zero magnitudes saturate to `2^-shift_bits`; with
/// [`ZeroPolicy::FlushBelowRange`] those with `log2 a < -shift_bits - 1` become `0`.
///
/// The math runs in `f64` and the result is cast back to the input dtype.
/// Outputs are exact powers of two in every float dtype. `f16` inputs accept
/// at most 14 shift bits. The input is not modified.
///
/// # Errors
///
/// Returns error if `config.num_shifts != 1`, the mode is not
/// [`QuantMode::Deterministic`], `shift_bits` is out of range for the config
/// or the dtype, or a tensor op fails.
pub fn single_shift_quantize(tensor: &Tensor, config: &LightnnConfig) -> Result<Tensor> {
    if config.num_shifts != 1 {
        return Err(LightnnError::InvalidConfig(format!(
            "single-shift quantization requires num_shifts == 1, got {}",
            config.num_shifts
        )));
    }
    ensure_supported(config.quant_mode)?;
    validate_shift_bits(config.shift_bits)?;

    let dtype = tensor.dtype();
    let limit = max_shift_bits_for(dtype);
    if config.shift_bits > limit {
        return Err(LightnnError::InvalidConfig(format!(
            "shift_bits {} exceeds the normal exponent range of {dtype:?} (max {limit})",
            config.shift_bits
        )));
    }

    let min_exp = -f64::from(config.shift_bits);

    let x = tensor.to_dtype(DType::F64)?;
    let sign = signum(&x)?;
    let abs = x.abs()?;

    let is_zero = abs.eq(0.0)?;
    let safe_abs = is_zero.where_cond(&abs.ones_like()?, &abs)?;
    let log2 = safe_abs.log()?.affine(1.0 / LN_2, 0.0)?;

    let exponent = log2.round()?.clamp(min_exp, 0.0)?;
    // 2^k for k in [-126, 0] is an f32 normal; the f32 round trip makes it exact
    let magnitude = exponent
        .affine(LN_2, 0.0)?
        .exp()?
        .to_dtype(DType::F32)?
        .to_dtype(DType::F64)?;
    let mut output = (sign * magnitude)?;

    if config.zero_policy == ZeroPolicy::FlushBelowRange {
        let below = log2.lt(min_exp - 1.0)?;
        output = below.where_cond(&output.zeros_like()?, &output)?;
    }

    Ok(output.to_dtype(dtype)?)
}
