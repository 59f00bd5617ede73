//! Power-of-two weight quantization.
//!
//! This module provides:
//! - **Single-shift**: nearest signed power of two in `[2^-shift_bits, 2^0]`
//! - **Multi-shift**: greedy residual expansion into several such terms
//! - **Weight policy**: max-normalize, quantize, rescale; packed exponent codes

mod residual;
mod shift;
mod weight;

pub use residual::{multi_shift_quantize, shift_expansion, ShiftExpansion};
pub use shift::single_shift_quantize;
pub use weight::{
    clip_weights, decode_shift_weight, encode_shift_weight, quantize_normalized, ShiftWeight,
};
