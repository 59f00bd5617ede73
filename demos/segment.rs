//! FCN-8s with quantized weights: forward pass and one training step.
//!
//! Run with: `cargo run --example segment`
//! Pass a torchvision VGG16 safetensors checkpoint to load pretrained
//! backbone weights: `cargo run --example segment -- vgg16.safetensors`

use candle_core::{DType, Device, Tensor, D};
use candle_nn::{loss, Optimizer, SGD};
use lightnn::{Fcn8s, Fcn8sConfig, LightnnConfig};
use tracing_subscriber::EnvFilter;

fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::from_default_env()
                .add_directive("info".parse()?)
                .add_directive("lightnn=debug".parse()?),
        )
        .init();

    let device = Device::Cpu;
    let num_classes = 21;

    let (model, size) = match std::env::args().nth(1) {
        Some(path) => {
            let config = Fcn8sConfig::new(num_classes);
            (Fcn8s::from_safetensors(path, &config, &device)?, 224)
        }
        None => {
            let config = Fcn8sConfig::tiny(num_classes).with_quant(LightnnConfig::default());
            (Fcn8s::random(&config, &device)?, 64)
        }
    };

    println!("=== lightnn FCN-8s Example ===\n");
    println!("Quantized weights: {}", model.registry().len());
    println!(
        "Quantized elements: {}",
        model.registry().num_quantized_elements()
    );

    let image = Tensor::randn(0.0f32, 1.0, (2, 3, size, size), &device)?;
    let scores = model.forward(&image, false)?;
    println!("Scores: {:?}", scores.shape());

    // One SGD step on random labels
    let labels = Tensor::rand(0.0f32, num_classes as f32, (2, size, size), &device)?
        .floor()?
        .to_dtype(DType::U32)?;
    let mut sgd = SGD::new(model.trainable_vars(), 1e-3)?;

    let logits = model.forward(&image, true)?;
    let logits = logits
        .permute((0, 2, 3, 1))?
        .reshape(((), num_classes))?;
    let loss = loss::cross_entropy(&logits, &labels.flatten_all()?)?;
    sgd.backward_step(&loss)?;
    println!("Loss: {:.4}", loss.to_scalar::<f32>()?);

    let predicted = model.forward(&image, false)?.argmax(D::Minus(3))?;
    println!("Prediction: {:?}", predicted.shape());

    let packed = model.shift_weights()?;
    let bytes: usize = packed.iter().map(|(_, w)| w.memory_bytes()).sum();
    println!("Packed size: {bytes} bytes");

    Ok(())
}
