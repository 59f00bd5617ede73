//! Power-of-two quantization of a weight matrix.
//!
//! Run with: `cargo run --example quantize`

use candle_core::{Device, Tensor};
use lightnn::quantization::shift_expansion;
use lightnn::{
    decode_shift_weight, encode_shift_weight, multi_shift_quantize, LightnnConfig, ZeroPolicy,
};

fn mean_abs_error(a: &Tensor, b: &Tensor) -> candle_core::Result<f32> {
    (a - b)?.abs()?.mean_all()?.to_scalar::<f32>()
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    println!("=== lightnn Quantization Example ===\n");

    let device = Device::Cpu;

    println!("1. Single values");
    let values = Tensor::new(&[1.0f32, -0.5, 0.0, 0.3, -0.7, 0.003], &device)?;
    for num_shifts in 1..=3 {
        let config = LightnnConfig::default().with_num_shifts(num_shifts);
        let q: Vec<f32> = multi_shift_quantize(&values, &config)?.to_vec1()?;
        println!("   {num_shifts} shift(s): {q:?}");
    }

    println!("\n2. Residual terms of 0.3");
    let expansion = shift_expansion(
        &Tensor::new(&[0.3f32], &device)?,
        &LightnnConfig::default().with_num_shifts(3),
    )?;
    for (i, term) in expansion.terms.iter().enumerate() {
        println!("   term {}: {:?}", i + 1, term.to_vec1::<f32>()?);
    }

    println!("\n3. Error versus number of shifts");
    let weight = Tensor::rand(-1.0f32, 1.0, (128, 256), &device)?;
    for num_shifts in 1..=4 {
        for policy in [ZeroPolicy::Saturate, ZeroPolicy::FlushBelowRange] {
            let config = LightnnConfig::default()
                .with_num_shifts(num_shifts)
                .with_zero_policy(policy);
            let q = multi_shift_quantize(&weight, &config)?;
            println!(
                "   shifts={num_shifts} policy={policy:?}: mean |w - q| = {:.6}",
                mean_abs_error(&weight, &q)?
            );
        }
    }

    println!("\n4. Packed exponent codes");
    let config = LightnnConfig::default();
    let layer_weight = Tensor::randn(0.0f32, 0.05, (256, 512), &device)?;
    let packed = encode_shift_weight(&layer_weight, &config)?;
    println!("   Shape: {:?}", packed.shape);
    println!("   Scale: {:.4}", packed.scale);
    println!("   Bits per code: {}", packed.bits_per_code());
    println!("   Sparsity: {:.1}%", packed.sparsity() * 100.0);
    println!("   Memory: {} bytes", packed.memory_bytes());
    println!("   Compression ratio: {:.2}x", packed.compression_ratio());

    let restored = decode_shift_weight(&packed, &device)?;
    println!(
        "   Mean |w - decoded| = {:.6}",
        mean_abs_error(&layer_weight, &restored)?
    );

    println!("\nDone!");
    Ok(())
}
