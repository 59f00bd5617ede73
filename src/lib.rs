//! LightNN power-of-two weight quantization for Rust.
//!
//! LightNN replaces every weight by a sum of a few signed powers of two, so
//! multiplications become bit shifts:
//! - **Single-shift**: each weight becomes `sign(w) * 2^k`, `k` in `[-shift_bits, 0]`
//! - **Multi-shift**: the residual left by one shift is quantized again,
//!   `num_shifts` times
//!
//! # Features
//!
//! - `QConv2d`, `QConvTranspose2d`, `QLinear`: layers that read quantized
//!   views of full-precision weights
//! - `QuantRegistry`: every quantizable weight of a network, re-quantized
//!   before each forward pass
//! - Straight-Through Estimator (STE) for training
//! - `Fcn8s`: FCN-8s segmentation over a VGG16 backbone
//! - Packed exponent codes via `ShiftWeight`
//!
//! # Quick Start
//!
//! ```ignore
//! use lightnn::{multi_shift_quantize, LightnnConfig};
//! use candle_core::{Device, Tensor};
//!
//! let device = Device::Cpu;
//! let config = LightnnConfig::default(); // 2 shifts, 7 bits
//!
//! let w = Tensor::new(&[1.0f32, -0.5, 0.0, 0.003], &device)?;
//! let q = multi_shift_quantize(&w, &config)?; // [1.0, -0.5, 0.0, 0.0]
//! ```
//!
//! # Quantization
//!
//! ## Single shift
//!
//! ```text
//! k = clamp(round(log2|w|), -shift_bits, 0)
//! q = sign(w) * 2^k
//! ```
//!
//! ## Multi shift
//!
//! ```text
//! q_1 = S(w), q_i = S(w - q_1 - ... - q_{i-1})
//! Q(w) = q_1 + ... + q_n
//! ```
//!
//! Network weights are clamped to `[-clip, clip]`, divided by their largest
//! magnitude, quantized and scaled back.
//!
//! # Feature Flags
//!
//! - `default`: CPU-only
//! - `cuda`: Enable CUDA through candle
//!
//! # References
//!
//! - "LightNN: Filling the Gap between Conventional Deep Neural Networks and
//!   Binarized Networks" <https://arxiv.org/abs/1802.02178>
//! - "Fully Convolutional Networks for Semantic Segmentation"
//!   <https://arxiv.org/abs/1411.4038>

#![warn(missing_docs)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::cast_possible_truncation)]
#![allow(clippy::cast_possible_wrap)]
#![allow(clippy::cast_sign_loss)]
#![allow(clippy::cast_precision_loss)]
#![allow(clippy::cast_lossless)]
#![allow(clippy::doc_markdown)]

mod config;
mod error;
pub mod layer;
pub mod model;
pub mod quantization;

pub use config::{Fcn8sConfig, LightnnConfig, QuantMode, VggWidths, ZeroPolicy, MAX_SHIFT_BITS};
pub use error::{LightnnError, Result};
pub use layer::{
    QConv2d, QConvTranspose2d, QLinear, QuantForward, QuantRegistry, QuantizedViews,
};
pub use model::Fcn8s;
pub use quantization::{
    decode_shift_weight, encode_shift_weight, multi_shift_quantize, quantize_normalized,
    single_shift_quantize, ShiftWeight,
};

/// Prelude module for convenient imports.
pub mod prelude {
    pub use crate::config::{Fcn8sConfig, LightnnConfig};
    pub use crate::error::{LightnnError, Result};
    pub use crate::layer::{QuantForward, QuantRegistry};
    pub use crate::model::Fcn8s;
    pub use crate::quantization::{multi_shift_quantize, single_shift_quantize};
}
