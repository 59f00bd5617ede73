//! Bilinear initialization for transposed-convolution upsampling.

use candle_core::{Device, Tensor};

use crate::error::{LightnnError, Result};

/// Kernel `[in, out, size, size]` that makes a transposed convolution perform
/// bilinear interpolation, channel by channel.
///
/// # Errors
///
/// Returns error if `in_channels != out_channels`, `size == 0`, or tensor
/// creation fails.
#[allow(clippy::cast_precision_loss)]
pub fn upsampling_weight(
    in_channels: usize,
    out_channels: usize,
    size: usize,
    device: &Device,
) -> Result<Tensor> {
    if in_channels != out_channels {
        return Err(LightnnError::ShapeMismatch {
            expected: vec![in_channels, in_channels],
            actual: vec![in_channels, out_channels],
        });
    }
    if size == 0 {
        return Err(LightnnError::InvalidConfig(
            "upsampling kernel size must be > 0".to_string(),
        ));
    }

    let factor = (size + 1) / 2;
    let center = if size % 2 == 1 {
        (factor - 1) as f32
    } else {
        factor as f32 - 0.5
    };
    let profile: Vec<f32> = (0..size)
        .map(|i| 1.0 - (i as f32 - center).abs() / factor as f32)
        .collect();

    let mut data = vec![0.0f32; in_channels * out_channels * size * size];
    for c in 0..in_channels {
        let base = (c * out_channels + c) * size * size;
        for (r, &pr) in profile.iter().enumerate() {
            for (col, &pc) in profile.iter().enumerate() {
                data[base + r * size + col] = pr * pc;
            }
        }
    }

    Ok(Tensor::from_vec(
        data,
        (in_channels, out_channels, size, size),
        device,
    )?)
}
