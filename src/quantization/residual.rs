//! Multi-shift residual quantization.
//!
//! Each term quantizes what the previous terms failed to capture:
//!
//! ```text
//! r_0 = x
//! t_i = single_shift(r_i)
//! a_i = a_{i-1} + t_i
//! r_{i+1} = x - a_i
//! ```

use candle_core::Tensor;

use super::shift::{ensure_supported, single_shift_quantize};
use crate::config::LightnnConfig;
use crate::error::{LightnnError, Result};

/// The individual power-of-two terms and their sum.
#[derive(Debug, Clone)]
pub struct ShiftExpansion {
    /// One single-shift tensor per refinement step, in order.
    pub terms: Vec<Tensor>,
    /// Sum of all terms.
    pub approximation: Tensor,
}

impl ShiftExpansion {
    /// Number of terms.
    #[must_use]
    pub fn num_terms(&self) -> usize {
        self.terms.len()
    }
}

/// Expand `tensor` into `config.num_shifts` power-of-two terms.
///
/// # Errors
///
/// Returns error if `num_shifts < 1`, the mode is unsupported, or a tensor op fails.
pub fn shift_expansion(tensor: &Tensor, config: &LightnnConfig) -> Result<ShiftExpansion> {
    if config.num_shifts == 0 {
        return Err(LightnnError::InvalidConfig(
            "num_shifts must be >= 1".to_string(),
        ));
    }
    ensure_supported(config.quant_mode)?;

    let single = config.clone().with_num_shifts(1);
    let mut terms = Vec::with_capacity(config.num_shifts);
    let mut residual = tensor.clone();
    let mut accumulated: Option<Tensor> = None;

    for i in 0..config.num_shifts {
        let term = single_shift_quantize(&residual, &single)?;
        let next = match accumulated {
            Some(acc) => (acc + &term)?,
            None => term.clone(),
        };
        residual = (tensor - &next)?;
        tracing::trace!(iteration = i, "residual term quantized");

        terms.push(term);
        accumulated = Some(next);
    }

    let approximation = accumulated.ok_or_else(|| {
        LightnnError::Quantization("residual expansion produced no terms".to_string())
    })?;

    Ok(ShiftExpansion {
        terms,
        approximation,
    })
}

/// Approximate `tensor` by a sum of `config.num_shifts` signed powers of two.
///
/// With `num_shifts == 1` this is [`single_shift_quantize`].
///
/// # Errors
///
/// Returns error if `num_shifts < 1`, the mode is unsupported, or a tensor op fails.
pub fn multi_shift_quantize(tensor: &Tensor, config: &LightnnConfig) -> Result<Tensor> {
    Ok(shift_expansion(tensor, config)?.approximation)
}
