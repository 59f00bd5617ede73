//! Straight-Through Estimator (STE) for forward-only quantized weights.
//!
//! The forward pass sees the quantized value while the backward pass treats
//! quantization as the identity, so gradients land on the canonical weights.

use candle_core::Tensor;

use crate::config::LightnnConfig;
use crate::error::Result;
use crate::quantization::quantize_normalized;

/// Link a quantized tensor to its canonical source.
///
/// Returns `canonical + detach(quantized - canonical)`: numerically the
/// quantized value (up to one rounding), with the gradient of `canonical`.
///
/// # Errors
///
/// Returns error if the shapes differ or a tensor op fails.
pub fn ste_forward(canonical: &Tensor, quantized: &Tensor) -> Result<Tensor> {
    let correction = (quantized - canonical)?.detach();
    Ok((canonical + correction)?)
}

/// Compute STE backward pass (identity gradient).
///
/// Candle's autograd already does this through [`ste_forward`]; provided for
/// callers that propagate gradients by hand.
#[must_use]
pub fn ste_backward(grad_output: &Tensor) -> Tensor {
    grad_output.clone()
}

/// Quantize `canonical` with the weight policy and link it with STE.
///
/// # Errors
///
/// Returns error if quantization fails.
pub fn shift_ste(canonical: &Tensor, config: &LightnnConfig) -> Result<Tensor> {
    let quantized = quantize_normalized(canonical, config)?;
    ste_forward(canonical, &quantized)
}
