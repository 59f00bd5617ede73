//! FCN-8s semantic segmentation over a VGG16 backbone.
//!
//! Skip connections from pool3 and pool4 are fused with upsampled class
//! scores. All convolution and transposed-convolution kernels are
//! LightNN-quantized before every forward pass.

use std::path::Path;

use candle_core::{DType, Device, Tensor};
use candle_nn::{init, Conv2dConfig, ConvTranspose2dConfig, Init, VarBuilder, VarMap};

use super::upsampling::upsampling_weight;
use super::vgg::{vgg16_stages, VggStage};
use crate::config::Fcn8sConfig;
use crate::error::{LightnnError, Result};
use crate::layer::{QConv2d, QConvTranspose2d, QuantForward, QuantRegistry, QuantizedViews};
use crate::quantization::ShiftWeight;

/// Crop offsets that align the skip and output maps when the first
/// convolution is padded by 100.
const POOL4_OFFSET: usize = 5;
const POOL3_OFFSET: usize = 9;
const OUTPUT_OFFSET: usize = 31;

/// Skip-connection scaling of pool4 and pool3 features.
const POOL4_SCALE: f64 = 0.01;
const POOL3_SCALE: f64 = 0.0001;

/// Emit a warning when CPU fallback is used.
fn warn_cpu_fallback(device: &Device) {
    static WARN_ONCE: std::sync::Once = std::sync::Once::new();
    if matches!(device, Device::Cpu) {
        WARN_ONCE.call_once(|| {
            tracing::warn!(
                "CPU device in use; full-width FCN-8s is slow without the 'cuda' feature"
            );
        });
    }
}

/// Spatial crop `[.., .., offset..offset+height, offset..offset+width]`.
fn crop(x: &Tensor, offset: usize, height: usize, width: usize) -> Result<Tensor> {
    let (_, _, h, w) = x.dims4()?;
    if offset + height > h || offset + width > w {
        return Err(LightnnError::ShapeMismatch {
            expected: vec![offset + height, offset + width],
            actual: vec![h, w],
        });
    }
    Ok(x.narrow(2, offset, height)?.narrow(3, offset, width)?)
}

fn crop_like(x: &Tensor, offset: usize, reference: &Tensor) -> Result<Tensor> {
    let (_, _, height, width) = reference.dims4()?;
    crop(x, offset, height, width)
}

fn zero_conv(
    registry: &mut QuantRegistry,
    name: &str,
    in_channels: usize,
    out_channels: usize,
    dtype: DType,
    device: &Device,
) -> Result<QConv2d> {
    let weight = Tensor::zeros((out_channels, in_channels, 1, 1), dtype, device)?;
    let bias = Tensor::zeros(out_channels, dtype, device)?;
    QConv2d::new(
        registry,
        name,
        &weight,
        Some(&bias),
        Conv2dConfig::default(),
    )
}

fn bilinear_upscore(
    registry: &mut QuantRegistry,
    name: &str,
    num_classes: usize,
    kernel_size: usize,
    stride: usize,
    dtype: DType,
    device: &Device,
) -> Result<QConvTranspose2d> {
    let weight = upsampling_weight(num_classes, num_classes, kernel_size, device)?.to_dtype(dtype)?;
    let config = ConvTranspose2dConfig {
        stride,
        ..Default::default()
    };
    QConvTranspose2d::new(registry, name, &weight, None, config)
}

/// Fully-convolutional head converted from VGG16's `classifier.{index}` linear layer.
fn fc_conv(
    registry: &mut QuantRegistry,
    name: &str,
    in_channels: usize,
    out_channels: usize,
    kernel_size: usize,
    vb: VarBuilder,
) -> Result<QConv2d> {
    let flat = vb.get_with_hints(
        (out_channels, in_channels * kernel_size * kernel_size),
        "weight",
        init::DEFAULT_KAIMING_NORMAL,
    )?;
    let weight = flat.reshape((out_channels, in_channels, kernel_size, kernel_size))?;
    let bias = vb.get_with_hints(out_channels, "bias", Init::Const(0.0))?;
    QConv2d::new(
        registry,
        name,
        &weight,
        Some(&bias),
        Conv2dConfig::default(),
    )
}

/// FCN-8s with LightNN power-of-two weights.
///
/// # Example
///
/// ```ignore
/// use lightnn::{Fcn8s, Fcn8sConfig};
/// use candle_core::{DType, Device, Tensor};
///
/// let device = Device::Cpu;
/// let model = Fcn8s::from_safetensors("vgg16.safetensors", &Fcn8sConfig::new(21), &device)?;
///
/// let image = Tensor::randn(0.0f32, 1.0, (1, 3, 224, 224), &device)?;
/// let scores = model.forward(&image, false)?; // [1, 21, 224, 224]
/// ```
#[derive(Debug)]
pub struct Fcn8s {
    features3: VggStage,
    features4: VggStage,
    features5: VggStage,
    fc6: QConv2d,
    fc7: QConv2d,
    score_fr: QConv2d,
    score_pool3: QConv2d,
    score_pool4: QConv2d,
    upscore2: QConvTranspose2d,
    upscore_pool4: QConvTranspose2d,
    upscore8: QConvTranspose2d,
    registry: QuantRegistry,
    config: Fcn8sConfig,
}

impl Fcn8s {
    /// Build the network, reading backbone weights from `vb` by torchvision names.
    ///
    /// `features.*` feed the backbone; `classifier.0` and `classifier.3`
    /// are reshaped into the fc6 and fc7 convolutions. Score layers start at
    /// zero and upscore kernels at bilinear interpolation.
    ///
    /// # Errors
    ///
    /// Returns error if the configuration is invalid or a weight is missing or
    /// has the wrong shape.
    pub fn new(config: &Fcn8sConfig, vb: VarBuilder) -> Result<Self> {
        config.validate()?;

        let device = vb.device().clone();
        let dtype = vb.dtype();
        warn_cpu_fallback(&device);

        let mut registry = QuantRegistry::new();
        let [features3, features4, features5] =
            vgg16_stages(&mut registry, config, vb.pp("features"))?;

        let [_, _, c3, c4, c5] = config.widths.stages;
        let fc = config.widths.fc;
        let n = config.num_classes;

        let classifier = vb.pp("classifier");
        let fc6 = fc_conv(&mut registry, "fc6", c5, fc, 7, classifier.pp("0"))?;
        let fc7 = fc_conv(&mut registry, "fc7", fc, fc, 1, classifier.pp("3"))?;
        let score_fr = zero_conv(&mut registry, "score_fr", fc, n, dtype, &device)?;
        let score_pool3 = zero_conv(&mut registry, "score_pool3", c3, n, dtype, &device)?;
        let score_pool4 = zero_conv(&mut registry, "score_pool4", c4, n, dtype, &device)?;

        let upscore2 = bilinear_upscore(&mut registry, "upscore2", n, 4, 2, dtype, &device)?;
        let upscore_pool4 =
            bilinear_upscore(&mut registry, "upscore_pool4", n, 4, 2, dtype, &device)?;
        let upscore8 = bilinear_upscore(&mut registry, "upscore8", n, 16, 8, dtype, &device)?;

        tracing::info!(
            num_classes = n,
            quantized_params = registry.len(),
            quantized_elements = registry.num_quantized_elements(),
            num_shifts = config.quant.num_shifts,
            shift_bits = config.quant.shift_bits,
            "built FCN-8s"
        );

        Ok(Self {
            features3,
            features4,
            features5,
            fc6,
            fc7,
            score_fr,
            score_pool3,
            score_pool4,
            upscore2,
            upscore_pool4,
            upscore8,
            registry,
            config: config.clone(),
        })
    }

    /// Build with freshly initialized backbone weights.
    ///
    /// # Errors
    ///
    /// Returns error if the configuration is invalid or tensor creation fails.
    pub fn random(config: &Fcn8sConfig, device: &Device) -> Result<Self> {
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, device);
        Self::new(config, vb)
    }

    /// Build from a safetensors checkpoint of torchvision's VGG16.
    ///
    /// # Errors
    ///
    /// Returns error if the file cannot be loaded or a weight is missing.
    pub fn from_safetensors<P: AsRef<Path>>(
        path: P,
        config: &Fcn8sConfig,
        device: &Device,
    ) -> Result<Self> {
        let path = path.as_ref();
        let tensors = candle_core::safetensors::load(path, device)?;
        tracing::info!("Loaded {} backbone tensors from {:?}", tensors.len(), path);

        let vb = VarBuilder::from_tensors(tensors, DType::F32, device);
        Self::new(config, vb)
    }

    /// Network configuration.
    #[must_use]
    pub const fn config(&self) -> &Fcn8sConfig {
        &self.config
    }

    /// Quantizable weights of the network.
    #[must_use]
    pub const fn registry(&self) -> &QuantRegistry {
        &self.registry
    }

    /// All trainable variables, for an external optimizer.
    #[must_use]
    pub fn trainable_vars(&self) -> Vec<candle_core::Var> {
        self.registry.vars()
    }

    /// Packed exponent codes of every quantizable weight.
    ///
    /// # Errors
    ///
    /// Returns error if encoding fails.
    pub fn shift_weights(&self) -> Result<Vec<(String, ShiftWeight)>> {
        self.registry.encode_all(&self.config.quant)
    }

    fn dropout(&self, x: Tensor, train: bool) -> Result<Tensor> {
        if train && self.config.dropout > 0.0 {
            Ok(candle_nn::ops::dropout(&x, self.config.dropout)?)
        } else {
            Ok(x)
        }
    }

    fn score_head(&self, pool5: &Tensor, views: &QuantizedViews, train: bool) -> Result<Tensor> {
        let x = self.fc6.forward(pool5, views)?.relu()?;
        let x = self.dropout(x, train)?;
        let x = self.fc7.forward(&x, views)?.relu()?;
        let x = self.dropout(x, train)?;
        self.score_fr.forward(&x, views)
    }

    /// Per-pixel class scores `[batch, num_classes, height, width]`.
    ///
    /// Re-quantizes every registered weight, then runs the network on the
    /// quantized views. Dropout is active only when `train` is set.
    ///
    /// # Errors
    ///
    /// Returns error if `input` is not `[batch, 3, height, width]` or a tensor op fails.
    pub fn forward(&self, input: &Tensor, train: bool) -> Result<Tensor> {
        let (_, channels, height, width) = input.dims4()?;
        if channels != 3 {
            return Err(LightnnError::ShapeMismatch {
                expected: vec![3],
                actual: vec![channels],
            });
        }

        let views = self.registry.quantize_all(&self.config.quant)?;

        let pool3 = self.features3.forward(input, &views)?;
        let pool4 = self.features4.forward(&pool3, &views)?;
        let pool5 = self.features5.forward(&pool4, &views)?;

        let score_fr = self.score_head(&pool5, &views, train)?;
        let upscore2 = self.upscore2.forward(&score_fr, &views)?;

        let score_pool4 = self
            .score_pool4
            .forward(&pool4.affine(POOL4_SCALE, 0.0)?, &views)?;
        let fused4 = (crop_like(&score_pool4, POOL4_OFFSET, &upscore2)? + &upscore2)?;
        let upscore_pool4 = self.upscore_pool4.forward(&fused4, &views)?;

        let score_pool3 = self
            .score_pool3
            .forward(&pool3.affine(POOL3_SCALE, 0.0)?, &views)?;
        let fused3 = (crop_like(&score_pool3, POOL3_OFFSET, &upscore_pool4)? + &upscore_pool4)?;
        let upscore8 = self.upscore8.forward(&fused3, &views)?;

        Ok(crop(&upscore8, OUTPUT_OFFSET, height, width)?.contiguous()?)
    }
}
