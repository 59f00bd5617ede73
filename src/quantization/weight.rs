//! Weight pre-processing and packed power-of-two storage.
//!
//! Weights are normalized by their max magnitude, quantized with residual
//! power-of-two terms and rescaled: `W_q = Q(W / max|W|) * max|W|`.

use candle_core::{DType, Device, Tensor};
use serde::{Deserialize, Serialize};

use super::residual::{multi_shift_quantize, shift_expansion};
use crate::config::LightnnConfig;
use crate::error::{LightnnError, Result};

/// Max absolute value of `tensor` as `f64`. Zero for empty tensors.
pub(crate) fn max_abs(tensor: &Tensor) -> Result<f64> {
    if tensor.elem_count() == 0 {
        return Ok(0.0);
    }
    let abs = tensor.abs()?.flatten_all()?.to_dtype(DType::F64)?;

    // max() skips NaN, the sum does not
    let total = abs.sum_all()?.to_scalar::<f64>()?;
    if !total.is_finite() {
        return Err(LightnnError::Quantization(
            "weight contains non-finite values".to_string(),
        ));
    }
    Ok(abs.max(0)?.to_scalar::<f64>()?)
}

/// A rank-0 tensor with the dtype and device of `like`.
fn scalar_like(value: f64, like: &Tensor) -> Result<Tensor> {
    Ok(Tensor::new(value, like.device())?.to_dtype(like.dtype())?)
}

/// Clamp weights to `[-clip, clip]`.
///
/// # Errors
///
/// Returns error if the tensor op fails.
pub fn clip_weights(weight: &Tensor, clip: f32) -> Result<Tensor> {
    Ok(weight.clamp(-clip, clip)?)
}

/// Quantize `weight` relative to its max magnitude, then rescale.
///
/// An all-zero tensor quantizes to zeros.
///
/// # Errors
///
/// Returns error if the configuration is invalid, the weight holds
/// non-finite values, or a tensor op fails.
pub fn quantize_normalized(weight: &Tensor, config: &LightnnConfig) -> Result<Tensor> {
    config.validate()?;

    let max_val = max_abs(weight)?;
    if max_val == 0.0 {
        return Ok(weight.zeros_like()?);
    }

    let scale = scalar_like(max_val, weight)?;
    let normalized = weight.broadcast_div(&scale)?;
    let quantized = multi_shift_quantize(&normalized, config)?;
    Ok(quantized.broadcast_mul(&scale)?)
}

/// Weight stored as signed exponent codes, one byte per term and element.
///
/// Code `0` is zero; code `±(e + 1)` is `±2^-e`. The dequantized value of an
/// element is `scale * Σ_terms value(code)`.
#[derive(Clone, Serialize, Deserialize)]
pub struct ShiftWeight {
    /// Exponent codes, one vector per residual term, each of length `numel`.
    pub codes: Vec<Vec<i8>>,

    /// Max magnitude the weight was normalized by.
    pub scale: f32,

    /// Original tensor shape.
    pub shape: Vec<usize>,

    /// Exponent range bound used for quantization.
    pub shift_bits: u32,
}

impl std::fmt::Debug for ShiftWeight {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ShiftWeight")
            .field("shape", &self.shape)
            .field("num_terms", &self.num_terms())
            .field("shift_bits", &self.shift_bits)
            .field("scale", &self.scale)
            .field("sparsity", &self.sparsity())
            .finish_non_exhaustive()
    }
}

fn encode_code(value: f32) -> i8 {
    if value == 0.0 {
        return 0;
    }
    let e = (-value.abs().log2()).round() as i8;
    if value > 0.0 {
        e + 1
    } else {
        -(e + 1)
    }
}

fn code_value(code: i8) -> f32 {
    if code == 0 {
        return 0.0;
    }
    let magnitude = 2f32.powi(1 - i32::from(code.unsigned_abs()));
    if code > 0 {
        magnitude
    } else {
        -magnitude
    }
}

impl ShiftWeight {
    /// Number of elements.
    #[must_use]
    pub fn numel(&self) -> usize {
        self.shape.iter().product()
    }

    /// Number of residual terms.
    #[must_use]
    pub fn num_terms(&self) -> usize {
        self.codes.len()
    }

    /// Fraction of elements whose every term is zero.
    ///
    /// Codes missing from a truncated term count as zero.
    #[must_use]
    #[allow(clippy::cast_precision_loss)]
    pub fn sparsity(&self) -> f32 {
        let numel = self.numel();
        if numel == 0 {
            return 0.0;
        }
        let zeros = (0..numel)
            .filter(|&i| {
                self.codes
                    .iter()
                    .all(|term| term.get(i).map_or(true, |&code| code == 0))
            })
            .count();
        zeros as f32 / numel as f32
    }

    /// Bits needed for one code: `2 * (shift_bits + 1) + 1` levels.
    #[must_use]
    pub fn bits_per_code(&self) -> usize {
        let levels = 2 * (self.shift_bits as usize + 1) + 1;
        (usize::BITS - (levels - 1).leading_zeros()) as usize
    }

    /// Packed size in bytes, including the scale.
    #[must_use]
    pub fn memory_bytes(&self) -> usize {
        let code_bits = self.num_terms() * self.numel() * self.bits_per_code();
        code_bits.div_ceil(8) + 4
    }

    /// Compression ratio vs FP32.
    #[must_use]
    #[allow(clippy::cast_precision_loss)]
    pub fn compression_ratio(&self) -> f32 {
        (self.numel() * 4) as f32 / self.memory_bytes() as f32
    }
}

/// Encode a weight as normalized power-of-two codes.
///
/// # Errors
///
/// Returns error if the configuration is invalid or a tensor op fails.
pub fn encode_shift_weight(weight: &Tensor, config: &LightnnConfig) -> Result<ShiftWeight> {
    config.validate()?;

    let shape = weight.dims().to_vec();
    let numel = weight.elem_count();
    let max_val = max_abs(weight)?;

    if max_val == 0.0 {
        return Ok(ShiftWeight {
            codes: vec![vec![0; numel]; config.num_shifts],
            scale: 0.0,
            shape,
            shift_bits: config.shift_bits,
        });
    }

    let weight = weight.to_dtype(DType::F32)?;
    let normalized = weight.broadcast_div(&scalar_like(max_val, &weight)?)?;
    let expansion = shift_expansion(&normalized, config)?;

    let mut codes = Vec::with_capacity(expansion.num_terms());
    for term in &expansion.terms {
        let values: Vec<f32> = term.flatten_all()?.to_vec1()?;
        codes.push(values.into_iter().map(encode_code).collect());
    }

    Ok(ShiftWeight {
        codes,
        scale: max_val as f32,
        shape,
        shift_bits: config.shift_bits,
    })
}

/// Decode exponent codes back to an `f32` tensor.
///
/// # Errors
///
/// Returns error if a code vector has the wrong length or tensor creation fails.
pub fn decode_shift_weight(weight: &ShiftWeight, device: &Device) -> Result<Tensor> {
    let numel = weight.numel();
    let mut output = vec![0.0f32; numel];

    for term in &weight.codes {
        if term.len() != numel {
            return Err(LightnnError::ShapeMismatch {
                expected: vec![numel],
                actual: vec![term.len()],
            });
        }
        for (out, &code) in output.iter_mut().zip(term) {
            *out += code_value(code);
        }
    }

    for v in &mut output {
        *v *= weight.scale;
    }

    Ok(Tensor::from_vec(output, weight.shape.as_slice(), device)?)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_code_mapping() {
        assert_eq!(encode_code(0.0), 0);
        assert_eq!(encode_code(1.0), 1);
        assert_eq!(encode_code(-1.0), -1);
        assert_eq!(encode_code(0.25), 3);
        assert_eq!(encode_code(-(2f32.powi(-7))), -8);

        for code in [-8i8, -3, -1, 0, 1, 2, 8] {
            assert_eq!(encode_code(code_value(code)), code);
        }
    }

    #[test]
    fn test_clip_weights() {
        let device = Device::Cpu;
        let w = Tensor::new(&[-3.0f32, -0.5, 0.2, 1.5], &device).unwrap();
        let clipped: Vec<f32> = clip_weights(&w, 1.0).unwrap().to_vec1().unwrap();
        assert_eq!(clipped, vec![-1.0, -0.5, 0.2, 1.0]);
    }

    #[test]
    fn test_quantize_normalized_keeps_max() {
        let device = Device::Cpu;
        let w = Tensor::new(&[0.6f32, -0.3, 0.01, 0.0], &device).unwrap();
        let q: Vec<f32> = quantize_normalized(&w, &LightnnConfig::default())
            .unwrap()
            .to_vec1()
            .unwrap();

        // The max element normalizes to exactly 1 and -0.3 / 0.6 to -0.5
        assert_eq!(q[0], 0.6);
        assert_eq!(q[1], -0.3);
        assert_eq!(q[3], 0.0);
    }

    #[test]
    fn test_quantize_normalized_zero_tensor() {
        let device = Device::Cpu;
        let w = Tensor::zeros((3, 3), DType::F32, &device).unwrap();
        let q: Vec<f32> = quantize_normalized(&w, &LightnnConfig::default())
            .unwrap()
            .flatten_all()
            .unwrap()
            .to_vec1()
            .unwrap();
        assert!(q.iter().all(|v| *v == 0.0));
    }

    #[test]
    fn test_quantize_normalized_rejects_nan() {
        let device = Device::Cpu;
        let w = Tensor::new(&[f32::NAN, 0.5], &device).unwrap();
        assert!(quantize_normalized(&w, &LightnnConfig::default()).is_err());
    }

    #[test]
    fn test_encode_decode_matches_quantized() {
        let device = Device::Cpu;
        let w = Tensor::randn(0.0f32, 0.1, (16, 8, 3, 3), &device).unwrap();
        let config = LightnnConfig::default();

        let encoded = encode_shift_weight(&w, &config).unwrap();
        assert_eq!(encoded.num_terms(), 2);
        assert_eq!(encoded.shape, vec![16, 8, 3, 3]);

        let decoded = decode_shift_weight(&encoded, &device).unwrap();
        let expected = quantize_normalized(&w, &config).unwrap();

        let diff = (decoded - expected)
            .unwrap()
            .abs()
            .unwrap()
            .flatten_all()
            .unwrap()
            .max(0)
            .unwrap()
            .to_scalar::<f32>()
            .unwrap();
        assert!(diff < 1e-5, "decode drifted by {diff}");
    }

    #[test]
    fn test_codes_stay_in_range() {
        let device = Device::Cpu;
        let w = Tensor::randn(0.0f32, 1.0, (64, 64), &device).unwrap();
        let config = LightnnConfig::default().with_shift_bits(4);

        let encoded = encode_shift_weight(&w, &config).unwrap();
        let bound = config.shift_bits as i8 + 1;
        assert!(encoded
            .codes
            .iter()
            .flatten()
            .all(|c| (-bound..=bound).contains(c)));
    }

    #[test]
    fn test_storage_accounting() {
        let device = Device::Cpu;
        let w = Tensor::randn(0.0f32, 1.0, (256, 256), &device).unwrap();
        let encoded = encode_shift_weight(&w, &LightnnConfig::default()).unwrap();

        // 17 levels for shift_bits = 7
        assert_eq!(encoded.bits_per_code(), 5);
        assert_eq!(encoded.memory_bytes(), 2 * 256 * 256 * 5 / 8 + 4);

        let ratio = encoded.compression_ratio();
        assert!(ratio > 3.0, "expected >3x compression, got {ratio:.2}x");
    }

    #[test]
    fn test_zero_weight_encoding() {
        let device = Device::Cpu;
        let w = Tensor::zeros((4, 4), DType::F32, &device).unwrap();
        let encoded = encode_shift_weight(&w, &LightnnConfig::default()).unwrap();

        assert!((encoded.sparsity() - 1.0).abs() < f32::EPSILON);
        let decoded: Vec<f32> = decode_shift_weight(&encoded, &device)
            .unwrap()
            .flatten_all()
            .unwrap()
            .to_vec1()
            .unwrap();
        assert!(decoded.iter().all(|v| *v == 0.0));
    }

    #[test]
    fn test_decode_rejects_truncated_codes() {
        let weight = ShiftWeight {
            codes: vec![vec![1, 2, 3]],
            scale: 1.0,
            shape: vec![2, 2],
            shift_bits: 7,
        };
        assert!(matches!(
            decode_shift_weight(&weight, &Device::Cpu),
            Err(LightnnError::ShapeMismatch { .. })
        ));

        // Inspection stays safe on the malformed value
        assert!((weight.sparsity() - 0.25).abs() < f32::EPSILON);
        assert!(format!("{weight:?}").contains("ShiftWeight"));

        let short = ShiftWeight {
            codes: vec![vec![1]],
            ..weight
        };
        assert!((short.sparsity() - 0.75).abs() < f32::EPSILON);
        assert!(!format!("{short:?}").is_empty());
    }

    #[test]
    fn test_quantize_normalized_f64_is_exact() {
        let values = [0.0625f64, -0.25, 0.125, 0.5];
        let weight = Tensor::new(&values, &Device::Cpu).unwrap();

        let q = quantize_normalized(&weight, &LightnnConfig::default()).unwrap();
        assert_eq!(q.dtype(), DType::F64);
        assert_eq!(q.to_vec1::<f64>().unwrap(), values.to_vec());
    }
}
