//! End-to-end checks of the quantized FCN-8s.

use std::collections::HashMap;

use candle_core::{DType, Device, Tensor};
use candle_nn::{Optimizer, SGD};
use lightnn::{Fcn8s, Fcn8sConfig, LightnnConfig};
use tempfile::TempDir;

/// Torchvision VGG16 tensors for the narrow widths, keyed by checkpoint name.
fn tiny_vgg16_checkpoint(config: &Fcn8sConfig, device: &Device) -> HashMap<String, Tensor> {
    let [c1, c2, c3, c4, c5] = config.widths.stages;
    let fc = config.widths.fc;
    let convs = [
        (0, 3, c1),
        (2, c1, c1),
        (5, c1, c2),
        (7, c2, c2),
        (10, c2, c3),
        (12, c3, c3),
        (14, c3, c3),
        (17, c3, c4),
        (19, c4, c4),
        (21, c4, c4),
        (24, c4, c5),
        (26, c5, c5),
        (28, c5, c5),
    ];

    let mut tensors = HashMap::new();
    for (index, in_channels, out_channels) in convs {
        tensors.insert(
            format!("features.{index}.weight"),
            Tensor::randn(0.0f32, 0.1, (out_channels, in_channels, 3, 3), device).unwrap(),
        );
        tensors.insert(
            format!("features.{index}.bias"),
            Tensor::zeros(out_channels, DType::F32, device).unwrap(),
        );
    }
    tensors.insert(
        "classifier.0.weight".to_string(),
        Tensor::randn(0.0f32, 0.1, (fc, c5 * 7 * 7), device).unwrap(),
    );
    tensors.insert(
        "classifier.0.bias".to_string(),
        Tensor::zeros(fc, DType::F32, device).unwrap(),
    );
    tensors.insert(
        "classifier.3.weight".to_string(),
        Tensor::randn(0.0f32, 0.1, (fc, fc), device).unwrap(),
    );
    tensors.insert(
        "classifier.3.bias".to_string(),
        Tensor::zeros(fc, DType::F32, device).unwrap(),
    );
    tensors
}

fn abs_sum(t: &Tensor) -> f32 {
    t.abs().unwrap().sum_all().unwrap().to_scalar::<f32>().unwrap()
}

#[test]
fn loads_torchvision_checkpoint() {
    let device = Device::Cpu;
    let config = Fcn8sConfig::tiny(4);
    let checkpoint = tiny_vgg16_checkpoint(&config, &device);

    let dir = TempDir::new().unwrap();
    let path = dir.path().join("vgg16.safetensors");
    candle_core::safetensors::save(&checkpoint, &path).unwrap();

    let model = Fcn8s::from_safetensors(&path, &config, &device).unwrap();
    let registry = model.registry();

    let id = registry.find("features.0.weight").unwrap();
    let loaded: Vec<f32> = registry
        .get(id)
        .unwrap()
        .canonical()
        .as_tensor()
        .flatten_all()
        .unwrap()
        .to_vec1()
        .unwrap();
    let saved: Vec<f32> = checkpoint["features.0.weight"]
        .flatten_all()
        .unwrap()
        .to_vec1()
        .unwrap();
    assert_eq!(loaded, saved);

    // classifier.0 becomes a 7x7 convolution over pool5
    let fc6 = registry.find("fc6.weight").unwrap();
    assert_eq!(
        registry.get(fc6).unwrap().canonical().as_tensor().dims(),
        &[16, 16, 7, 7]
    );

    let input = Tensor::randn(0.0f32, 1.0, (1, 3, 32, 32), &device).unwrap();
    let output = model.forward(&input, false).unwrap();
    assert_eq!(output.dims(), &[1, 4, 32, 32]);
}

#[test]
fn missing_checkpoint_tensor_is_an_error() {
    let device = Device::Cpu;
    let config = Fcn8sConfig::tiny(4);
    let mut checkpoint = tiny_vgg16_checkpoint(&config, &device);
    checkpoint.remove("classifier.3.weight");

    let dir = TempDir::new().unwrap();
    let path = dir.path().join("partial.safetensors");
    candle_core::safetensors::save(&checkpoint, &path).unwrap();

    assert!(Fcn8s::from_safetensors(&path, &config, &device).is_err());
}

#[test]
fn output_matches_input_resolution() {
    let device = Device::Cpu;
    let model = Fcn8s::random(&Fcn8sConfig::tiny(5), &device).unwrap();

    for (batch, height, width) in [(1, 32, 32), (2, 40, 48)] {
        let input = Tensor::randn(0.0f32, 1.0, (batch, 3, height, width), &device).unwrap();
        let output = model.forward(&input, false).unwrap();
        assert_eq!(output.dims(), &[batch, 5, height, width]);
    }
}

#[test]
fn forward_keeps_canonical_weights_full_precision() {
    let device = Device::Cpu;
    let config = Fcn8sConfig::tiny(3).with_quant(LightnnConfig::single_shift());
    let model = Fcn8s::random(&config, &device).unwrap();

    let input = Tensor::randn(0.0f32, 1.0, (1, 3, 32, 32), &device).unwrap();
    model.forward(&input, false).unwrap();

    let param = &model.registry().params()[0];
    let canonical = param.canonical().as_tensor();
    let quantized = param.quantized(&config.quant).unwrap();
    assert!(abs_sum(&(canonical - &quantized).unwrap()) > 0.0);

    // Clamped to the clip range, but never replaced by the quantized copy
    let peak = canonical
        .abs()
        .unwrap()
        .flatten_all()
        .unwrap()
        .max(0)
        .unwrap()
        .to_scalar::<f32>()
        .unwrap();
    assert!(peak <= config.quant.clip);
}

#[test]
fn training_step_updates_zero_initialized_scores() {
    let device = Device::Cpu;
    let model = Fcn8s::random(&Fcn8sConfig::tiny(3), &device).unwrap();

    let score_fr = model.registry().find("score_fr.weight").unwrap();
    let before = model
        .registry()
        .get(score_fr)
        .unwrap()
        .canonical()
        .as_tensor()
        .clone();
    assert_eq!(abs_sum(&before), 0.0);

    let mut sgd = SGD::new(model.trainable_vars(), 0.1).unwrap();
    let input = Tensor::randn(0.0f32, 1.0, (1, 3, 32, 32), &device).unwrap();
    let target = Tensor::randn(0.0f32, 1.0, (1, 3, 32, 32), &device).unwrap();

    let output = model.forward(&input, false).unwrap();
    let loss = (output * target).unwrap().sum_all().unwrap();
    sgd.backward_step(&loss).unwrap();

    let after = model
        .registry()
        .get(score_fr)
        .unwrap()
        .canonical()
        .as_tensor()
        .clone();
    assert!(abs_sum(&after) > 0.0);
}

#[test]
fn exports_packed_weights_for_every_layer() {
    let device = Device::Cpu;
    let model = Fcn8s::random(&Fcn8sConfig::tiny(2), &device).unwrap();

    let packed = model.shift_weights().unwrap();
    assert_eq!(packed.len(), model.registry().len());

    let (name, upscore8) = packed.last().unwrap();
    assert_eq!(name, "upscore8.weight");
    assert_eq!(upscore8.shape, vec![2, 2, 16, 16]);
    assert_eq!(upscore8.num_terms(), 2);
}
