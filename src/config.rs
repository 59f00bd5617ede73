//! Configuration for LightNN quantization and the FCN-8s network.

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::{LightnnError, Result};

/// Largest supported `shift_bits`.
///
/// Exponent codes are stored as `±(e + 1)` in an `i8`, so `e` must stay below 127.
pub const MAX_SHIFT_BITS: u32 = 126;

/// Rounding mode used when snapping a value to a power of two.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum QuantMode {
    /// Round `log2|x|` to the nearest integer.
    #[default]
    #[serde(rename = "det")]
    Deterministic,
    /// Stochastic rounding of the exponent. Not implemented; rejected at call time.
    #[serde(rename = "stochastic")]
    Stochastic,
}

/// What happens to non-zero magnitudes below the representable range.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ZeroPolicy {
    /// Saturate to the smallest magnitude `2^-shift_bits`.
    #[default]
    Saturate,
    /// Map values with `log2|x| < -shift_bits - 1` to zero.
    FlushBelowRange,
}

/// Configuration for LightNN power-of-two quantization.
///
/// A weight `w` is approximated by a sum of `num_shifts` terms, each of the
/// form `±2^k` with `k` an integer in `[-shift_bits, 0]` (or zero).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LightnnConfig {
    /// Number of residual refinement terms.
    pub num_shifts: usize,

    /// Bounds the exponent range to `[-shift_bits, 0]`.
    pub shift_bits: u32,

    /// Exponent rounding mode.
    pub quant_mode: QuantMode,

    /// Treatment of magnitudes below `2^-shift_bits`.
    pub zero_policy: ZeroPolicy,

    /// Canonical weights are clamped to `[-clip, clip]` before every forward pass.
    pub clip: f32,

    /// Link quantized views to the canonical weights with a straight-through estimator.
    pub enable_ste: bool,
}

impl Default for LightnnConfig {
    fn default() -> Self {
        Self {
            num_shifts: 2,
            shift_bits: 7,
            quant_mode: QuantMode::Deterministic,
            zero_policy: ZeroPolicy::Saturate,
            clip: 1.0,
            enable_ste: true,
        }
    }
}

impl LightnnConfig {
    /// Create a new configuration with default values.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Configuration for a single power-of-two term.
    #[must_use]
    pub fn single_shift() -> Self {
        Self {
            num_shifts: 1,
            ..Default::default()
        }
    }

    /// Configuration for inference: views are plain tensors without STE links.
    #[must_use]
    pub fn inference() -> Self {
        Self {
            enable_ste: false,
            ..Default::default()
        }
    }

    /// Set the number of residual terms.
    #[must_use]
    pub const fn with_num_shifts(mut self, num_shifts: usize) -> Self {
        self.num_shifts = num_shifts;
        self
    }

    /// Set the exponent range bound.
    #[must_use]
    pub const fn with_shift_bits(mut self, shift_bits: u32) -> Self {
        self.shift_bits = shift_bits;
        self
    }

    /// Set the rounding mode.
    #[must_use]
    pub const fn with_quant_mode(mut self, mode: QuantMode) -> Self {
        self.quant_mode = mode;
        self
    }

    /// Set the sub-range policy.
    #[must_use]
    pub const fn with_zero_policy(mut self, policy: ZeroPolicy) -> Self {
        self.zero_policy = policy;
        self
    }

    /// Set the clamp bound applied to canonical weights.
    #[must_use]
    pub const fn with_clip(mut self, clip: f32) -> Self {
        self.clip = clip;
        self
    }

    /// Enable or disable the straight-through estimator.
    #[must_use]
    pub const fn with_ste(mut self, enabled: bool) -> Self {
        self.enable_ste = enabled;
        self
    }

    /// Validate the configuration.
    ///
    /// # Errors
    ///
    /// Returns error if any parameter is out of range.
    pub fn validate(&self) -> Result<()> {
        if self.num_shifts == 0 {
            return Err(LightnnError::InvalidConfig(
                "num_shifts must be >= 1".to_string(),
            ));
        }

        validate_shift_bits(self.shift_bits)?;

        if !self.clip.is_finite() || self.clip <= 0.0 {
            return Err(LightnnError::InvalidConfig(format!(
                "clip must be finite and > 0, got {}",
                self.clip
            )));
        }

        Ok(())
    }

    /// Load configuration from a YAML file.
    ///
    /// # Errors
    ///
    /// Returns error if the file cannot be read or parsed.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Self = serde_yaml::from_str(&content)?;
        Ok(config)
    }

    /// Save configuration to a YAML file.
    ///
    /// # Errors
    ///
    /// Returns error if serialization or writing fails.
    pub fn to_file<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let content = serde_yaml::to_string(self)?;
        std::fs::write(path, content)?;
        Ok(())
    }
}

pub(crate) fn validate_shift_bits(shift_bits: u32) -> Result<()> {
    if shift_bits == 0 || shift_bits > MAX_SHIFT_BITS {
        return Err(LightnnError::InvalidConfig(format!(
            "shift_bits must be in 1..={MAX_SHIFT_BITS}, got {shift_bits}"
        )));
    }
    Ok(())
}

/// Channel widths of the VGG16 backbone and the fully-convolutional head.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct VggWidths {
    /// Output channels of the five convolution blocks.
    pub stages: [usize; 5],
    /// Width of fc6 and fc7.
    pub fc: usize,
}

impl VggWidths {
    /// Standard VGG16 widths.
    #[must_use]
    pub const fn vgg16() -> Self {
        Self {
            stages: [64, 128, 256, 512, 512],
            fc: 4096,
        }
    }

    /// Narrow widths for smoke tests and CPU experiments.
    #[must_use]
    pub const fn tiny() -> Self {
        Self {
            stages: [4, 8, 8, 16, 16],
            fc: 16,
        }
    }
}

impl Default for VggWidths {
    fn default() -> Self {
        Self::vgg16()
    }
}

/// Configuration for the FCN-8s segmentation network.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Fcn8sConfig {
    /// Number of output classes.
    pub num_classes: usize,

    /// Backbone and head widths.
    #[serde(default)]
    pub widths: VggWidths,

    /// Padding of the first convolution. The crop offsets of the skip
    /// connections assume 100.
    #[serde(default = "default_input_padding")]
    pub input_padding: usize,

    /// Dropout probability after fc6 and fc7 in training mode.
    #[serde(default = "default_dropout")]
    pub dropout: f32,

    /// Weight quantization settings.
    #[serde(default)]
    pub quant: LightnnConfig,
}

fn default_input_padding() -> usize {
    100
}

fn default_dropout() -> f32 {
    0.5
}

impl Fcn8sConfig {
    /// Standard FCN-8s over VGG16.
    #[must_use]
    pub fn new(num_classes: usize) -> Self {
        Self {
            num_classes,
            widths: VggWidths::vgg16(),
            input_padding: default_input_padding(),
            dropout: default_dropout(),
            quant: LightnnConfig::default(),
        }
    }

    /// FCN-8s with narrow widths.
    #[must_use]
    pub fn tiny(num_classes: usize) -> Self {
        Self {
            widths: VggWidths::tiny(),
            ..Self::new(num_classes)
        }
    }

    /// Set the quantization settings.
    #[must_use]
    pub fn with_quant(mut self, quant: LightnnConfig) -> Self {
        self.quant = quant;
        self
    }

    /// Validate the configuration.
    ///
    /// # Errors
    ///
    /// Returns error if any parameter is out of range.
    pub fn validate(&self) -> Result<()> {
        if self.num_classes == 0 {
            return Err(LightnnError::InvalidConfig(
                "num_classes must be > 0".to_string(),
            ));
        }
        if self.widths.stages.contains(&0) || self.widths.fc == 0 {
            return Err(LightnnError::InvalidConfig(
                "all widths must be > 0".to_string(),
            ));
        }
        if !(0.0..1.0).contains(&self.dropout) {
            return Err(LightnnError::InvalidConfig(format!(
                "dropout must be in [0, 1), got {}",
                self.dropout
            )));
        }
        self.quant.validate()
    }

    /// Load configuration from a YAML file.
    ///
    /// # Errors
    ///
    /// Returns error if the file cannot be read or parsed.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Self = serde_yaml::from_str(&content)?;
        Ok(config)
    }

    /// Save configuration to a YAML file.
    ///
    /// # Errors
    ///
    /// Returns error if serialization or writing fails.
    pub fn to_file<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let content = serde_yaml::to_string(self)?;
        std::fs::write(path, content)?;
        Ok(())
    }
}
