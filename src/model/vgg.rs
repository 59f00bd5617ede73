//! VGG16 feature extractor split into the three stages FCN-8s taps.
//!
//! Layer indices follow torchvision's `vgg16().features`, so pretrained
//! checkpoints load by name (`features.{i}.weight`).

use std::ops::Range;

use candle_core::Tensor;
use candle_nn::{Conv2dConfig, VarBuilder};

use crate::config::Fcn8sConfig;
use crate::error::Result;
use crate::layer::{QConv2d, QuantForward, QuantRegistry, QuantizedViews};

/// `features[0..17]` ends with pool3, `[17..24]` with pool4, `[24..31]` with pool5.
pub const STAGE_RANGES: [Range<usize>; 3] = [0..17, 17..24, 24..31];

/// Convolutions per block in VGG16.
const BLOCK_DEPTHS: [usize; 5] = [2, 2, 3, 3, 3];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum LayerSpec {
    Conv { in_channels: usize, out_channels: usize },
    Relu,
    MaxPool,
}

fn vgg16_layout(stages: [usize; 5]) -> Vec<LayerSpec> {
    let mut layout = Vec::with_capacity(31);
    let mut in_channels = 3;
    for (&depth, &width) in BLOCK_DEPTHS.iter().zip(&stages) {
        for _ in 0..depth {
            layout.push(LayerSpec::Conv {
                in_channels,
                out_channels: width,
            });
            layout.push(LayerSpec::Relu);
            in_channels = width;
        }
        layout.push(LayerSpec::MaxPool);
    }
    layout
}

/// 2×2 stride-2 max pooling with ceil mode.
///
/// Odd extents get one trailing row/column of zeros. Every pool in VGG
/// follows a ReLU, so inputs are non-negative and the padding never wins.
pub fn max_pool2d_ceil(input: &Tensor) -> Result<Tensor> {
    let (_, _, height, width) = input.dims4()?;
    let mut x = input.clone();
    if height % 2 == 1 {
        x = x.pad_with_zeros(2, 0, 1)?;
    }
    if width % 2 == 1 {
        x = x.pad_with_zeros(3, 0, 1)?;
    }
    Ok(x.max_pool2d_with_stride(2, 2)?)
}

/// One VGG layer.
#[derive(Debug, Clone)]
pub enum VggLayer {
    /// 3×3 convolution.
    Conv(QConv2d),
    /// ReLU activation.
    Relu,
    /// Ceil-mode 2×2 max pool.
    MaxPool,
}

/// Contiguous slice of the VGG16 feature stack.
#[derive(Debug, Clone)]
pub struct VggStage {
    layers: Vec<VggLayer>,
}

impl VggStage {
    /// Layers of the stage.
    #[must_use]
    pub fn layers(&self) -> &[VggLayer] {
        &self.layers
    }

    /// Number of convolutions in the stage.
    #[must_use]
    pub fn num_convs(&self) -> usize {
        self.layers
            .iter()
            .filter(|l| matches!(l, VggLayer::Conv(_)))
            .count()
    }
}

impl QuantForward for VggStage {
    fn forward(&self, input: &Tensor, views: &QuantizedViews) -> Result<Tensor> {
        let mut x = input.clone();
        for layer in &self.layers {
            x = match layer {
                VggLayer::Conv(conv) => conv.forward(&x, views)?,
                VggLayer::Relu => x.relu()?,
                VggLayer::MaxPool => max_pool2d_ceil(&x)?,
            };
        }
        Ok(x)
    }
}

/// Build the three backbone stages, registering every kernel.
///
/// `vb` should point at the `features` prefix of a torchvision checkpoint.
///
/// # Errors
///
/// Returns error if a tensor is missing, has the wrong shape, or registration fails.
pub fn vgg16_stages(
    registry: &mut QuantRegistry,
    config: &Fcn8sConfig,
    vb: VarBuilder,
) -> Result<[VggStage; 3]> {
    let mut layers = Vec::with_capacity(31);
    for (index, spec) in vgg16_layout(config.widths.stages).into_iter().enumerate() {
        let layer = match spec {
            LayerSpec::Conv {
                in_channels,
                out_channels,
            } => {
                let padding = if index == 0 { config.input_padding } else { 1 };
                let conv_config = Conv2dConfig {
                    padding,
                    ..Default::default()
                };
                VggLayer::Conv(QConv2d::load(
                    registry,
                    &format!("features.{index}"),
                    in_channels,
                    out_channels,
                    3,
                    conv_config,
                    vb.pp(index.to_string()),
                )?)
            }
            LayerSpec::Relu => VggLayer::Relu,
            LayerSpec::MaxPool => VggLayer::MaxPool,
        };
        layers.push(layer);
    }

    let mut layers = layers.into_iter();
    let [r3, r4, r5] = STAGE_RANGES;
    let pool3 = VggStage {
        layers: layers.by_ref().take(r3.len()).collect(),
    };
    let pool4 = VggStage {
        layers: layers.by_ref().take(r4.len()).collect(),
    };
    let pool5 = VggStage {
        layers: layers.take(r5.len()).collect(),
    };
    Ok([pool3, pool4, pool5])
}
