//! Fully-connected layer with a LightNN-quantized weight.

use candle_core::{Tensor, Var};

use super::registry::{ParamId, ParamKind, QuantRegistry, QuantizedViews};
use super::QuantForward;
use crate::error::{LightnnError, Result};

/// Linear layer `y = x W^T + b` whose weight is quantized per forward pass.
///
/// Leading input dimensions are treated as batch dimensions.
#[derive(Debug, Clone)]
pub struct QLinear {
    weight: ParamId,
    bias: Option<Var>,
    in_features: usize,
    out_features: usize,
}

impl QLinear {
    /// Register `weight` `[out_features, in_features]` and optional `bias` under `name`.
    ///
    /// # Errors
    ///
    /// Returns error if the weight is not 2D or registration fails.
    pub fn new(
        registry: &mut QuantRegistry,
        name: &str,
        weight: &Tensor,
        bias: Option<&Tensor>,
    ) -> Result<Self> {
        let (out_features, in_features) = weight.dims2().map_err(|_| {
            LightnnError::InvalidConfig("weight must be 2D [out_features, in_features]".to_string())
        })?;

        let weight = registry.register_weight(format!("{name}.weight"), ParamKind::Linear, weight)?;
        let bias = bias
            .map(|b| registry.register_bias(format!("{name}.bias"), b))
            .transpose()?;

        Ok(Self {
            weight,
            bias,
            in_features,
            out_features,
        })
    }

    /// Get the input features dimension.
    #[must_use]
    pub const fn in_features(&self) -> usize {
        self.in_features
    }

    /// Get the output features dimension.
    #[must_use]
    pub const fn out_features(&self) -> usize {
        self.out_features
    }

    /// Registry handle of the weight.
    #[must_use]
    pub const fn weight_id(&self) -> ParamId {
        self.weight
    }
}

impl QuantForward for QLinear {
    fn forward(&self, input: &Tensor, views: &QuantizedViews) -> Result<Tensor> {
        let weight = views.get(self.weight)?;
        let output = input.broadcast_matmul(&weight.t()?)?;
        match &self.bias {
            Some(bias) => Ok(output.broadcast_add(bias.as_tensor())?),
            None => Ok(output),
        }
    }
}
