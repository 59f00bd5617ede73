//! Convolutions whose kernels are quantized before every forward pass.

use candle_core::{Tensor, Var};
use candle_nn::{init, Conv2dConfig, ConvTranspose2dConfig, Init, VarBuilder};

use super::registry::{ParamId, ParamKind, QuantRegistry, QuantizedViews};
use super::QuantForward;
use crate::error::Result;

fn add_channel_bias(output: Tensor, bias: Option<&Var>) -> Result<Tensor> {
    match bias {
        Some(bias) => Ok(output.broadcast_add(&bias.as_tensor().reshape((1, (), 1, 1))?)?),
        None => Ok(output),
    }
}

/// 2D convolution with a LightNN-quantized kernel.
#[derive(Debug, Clone)]
pub struct QConv2d {
    weight: ParamId,
    bias: Option<Var>,
    config: Conv2dConfig,
}

impl QConv2d {
    /// Register `weight` `[out, in/groups, k, k]` and optional `bias` `[out]` under `name`.
    ///
    /// # Errors
    ///
    /// Returns error if registration fails.
    pub fn new(
        registry: &mut QuantRegistry,
        name: &str,
        weight: &Tensor,
        bias: Option<&Tensor>,
        config: Conv2dConfig,
    ) -> Result<Self> {
        let weight = registry.register_weight(format!("{name}.weight"), ParamKind::Conv2d, weight)?;
        let bias = bias
            .map(|b| registry.register_bias(format!("{name}.bias"), b))
            .transpose()?;
        Ok(Self {
            weight,
            bias,
            config,
        })
    }

    /// Fetch `weight` and `bias` from `vb` and register them under `name`.
    ///
    /// Missing tensors are initialized (Kaiming-normal kernel, zero bias) when
    /// `vb` is backed by a `VarMap`.
    ///
    /// # Errors
    ///
    /// Returns error if a tensor is missing or has the wrong shape.
    pub fn load(
        registry: &mut QuantRegistry,
        name: &str,
        in_channels: usize,
        out_channels: usize,
        kernel_size: usize,
        config: Conv2dConfig,
        vb: VarBuilder,
    ) -> Result<Self> {
        let weight = vb.get_with_hints(
            (out_channels, in_channels / config.groups, kernel_size, kernel_size),
            "weight",
            init::DEFAULT_KAIMING_NORMAL,
        )?;
        let bias = vb.get_with_hints(out_channels, "bias", Init::Const(0.0))?;
        Self::new(registry, name, &weight, Some(&bias), config)
    }

    /// Registry handle of the kernel.
    #[must_use]
    pub const fn weight_id(&self) -> ParamId {
        self.weight
    }

    /// The bias, if any.
    #[must_use]
    pub const fn bias(&self) -> Option<&Var> {
        self.bias.as_ref()
    }
}

impl QuantForward for QConv2d {
    fn forward(&self, input: &Tensor, views: &QuantizedViews) -> Result<Tensor> {
        let kernel = views.get(self.weight)?;
        let output = input.conv2d(
            kernel,
            self.config.padding,
            self.config.stride,
            self.config.dilation,
            self.config.groups,
        )?;
        add_channel_bias(output, self.bias.as_ref())
    }
}

/// 2D transposed convolution with a LightNN-quantized kernel.
#[derive(Debug, Clone)]
pub struct QConvTranspose2d {
    weight: ParamId,
    bias: Option<Var>,
    config: ConvTranspose2dConfig,
}

impl QConvTranspose2d {
    /// Register `weight` `[in, out, k, k]` and optional `bias` `[out]` under `name`.
    ///
    /// # Errors
    ///
    /// Returns error if registration fails.
    pub fn new(
        registry: &mut QuantRegistry,
        name: &str,
        weight: &Tensor,
        bias: Option<&Tensor>,
        config: ConvTranspose2dConfig,
    ) -> Result<Self> {
        let weight = registry.register_weight(
            format!("{name}.weight"),
            ParamKind::ConvTranspose2d,
            weight,
        )?;
        let bias = bias
            .map(|b| registry.register_bias(format!("{name}.bias"), b))
            .transpose()?;
        Ok(Self {
            weight,
            bias,
            config,
        })
    }

    /// Registry handle of the kernel.
    #[must_use]
    pub const fn weight_id(&self) -> ParamId {
        self.weight
    }
}

impl QuantForward for QConvTranspose2d {
    fn forward(&self, input: &Tensor, views: &QuantizedViews) -> Result<Tensor> {
        let kernel = views.get(self.weight)?;
        let output = input.conv_transpose2d(
            kernel,
            self.config.padding,
            self.config.output_padding,
            self.config.stride,
            self.config.dilation,
        )?;
        add_channel_bias(output, self.bias.as_ref())
    }
}
