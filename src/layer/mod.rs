//! Neural network layers with LightNN-quantized weights.
//!
//! This module provides:
//! - `QuantRegistry`: canonical weights and per-forward quantized views
//! - `QConv2d`, `QConvTranspose2d`, `QLinear`: layers reading those views
//! - Straight-Through Estimator for training

mod conv;
mod linear;
mod registry;
mod ste;

use candle_core::Tensor;

use crate::error::Result;

pub use conv::{QConv2d, QConvTranspose2d};
pub use linear::QLinear;
pub use registry::{ParamId, ParamKind, QuantParam, QuantRegistry, QuantizedViews};
pub use ste::{shift_ste, ste_backward, ste_forward};

/// A layer whose weights come from a [`QuantizedViews`] snapshot.
pub trait QuantForward {
    /// Run the layer on `input` with the weights in `views`.
    ///
    /// # Errors
    ///
    /// Returns error if a weight is missing from `views` or a tensor op fails.
    fn forward(&self, input: &Tensor, views: &QuantizedViews) -> Result<Tensor>;
}
