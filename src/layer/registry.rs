//! Registry of quantizable parameters.
//!
//! A network enumerates its weights once at construction. Every forward pass
//! then asks the registry for fresh quantized views; the canonical values are
//! only ever clamped, never overwritten with quantized data.

use std::sync::atomic::{AtomicUsize, Ordering};

use candle_core::{Tensor, Var};

use super::ste::ste_forward;
use crate::config::LightnnConfig;
use crate::error::{LightnnError, Result};
use crate::quantization::{clip_weights, encode_shift_weight, quantize_normalized, ShiftWeight};

static NEXT_REGISTRY: AtomicUsize = AtomicUsize::new(0);

/// Handle to a registered weight, valid only for the registry that issued it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ParamId {
    registry: usize,
    index: usize,
}

impl ParamId {
    /// Position in registration order.
    #[must_use]
    pub const fn index(self) -> usize {
        self.index
    }
}

fn unknown(id: ParamId) -> LightnnError {
    LightnnError::UnknownParameter(format!("param #{} of registry {}", id.index, id.registry))
}

/// Layer type that owns a quantizable weight.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParamKind {
    /// `[out, in, k, k]` convolution kernel.
    Conv2d,
    /// `[in, out, k, k]` transposed-convolution kernel.
    ConvTranspose2d,
    /// `[out, in]` fully-connected weight.
    Linear,
}

/// A full-precision weight plus the metadata needed to quantize it.
#[derive(Debug, Clone)]
pub struct QuantParam {
    name: String,
    kind: ParamKind,
    canonical: Var,
}

impl QuantParam {
    /// Parameter name, e.g. `features.0.weight`.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Owning layer type.
    #[must_use]
    pub const fn kind(&self) -> ParamKind {
        self.kind
    }

    /// The trainable full-precision value.
    #[must_use]
    pub const fn canonical(&self) -> &Var {
        &self.canonical
    }

    /// Clamp the canonical value to `[-clip, clip]` in place.
    ///
    /// # Errors
    ///
    /// Returns error if the tensor op fails.
    pub fn clamp_in_place(&self, clip: f32) -> Result<()> {
        let clamped = clip_weights(self.canonical.as_tensor(), clip)?.detach();
        self.canonical.set(&clamped)?;
        Ok(())
    }

    /// Quantized copy of the canonical value, detached from autograd.
    ///
    /// # Errors
    ///
    /// Returns error if quantization fails.
    pub fn quantized(&self, config: &LightnnConfig) -> Result<Tensor> {
        Ok(quantize_normalized(self.canonical.as_tensor(), config)?.detach())
    }

    /// Value used by the forward pass: STE-linked when `config.enable_ste`.
    ///
    /// # Errors
    ///
    /// Returns error if quantization fails.
    pub fn forward_view(&self, config: &LightnnConfig) -> Result<Tensor> {
        let quantized = self.quantized(config)?;
        if config.enable_ste {
            ste_forward(self.canonical.as_tensor(), &quantized)
        } else {
            Ok(quantized)
        }
    }
}

/// Quantized weights for one forward pass, indexed by [`ParamId`].
#[derive(Debug, Clone)]
pub struct QuantizedViews {
    registry: usize,
    views: Vec<Tensor>,
}

impl QuantizedViews {
    /// View for `id`.
    ///
    /// # Errors
    ///
    /// Returns error if `id` was not issued by the registry that built these views.
    pub fn get(&self, id: ParamId) -> Result<&Tensor> {
        if id.registry != self.registry {
            return Err(unknown(id));
        }
        self.views.get(id.index).ok_or_else(|| unknown(id))
    }

    /// Number of views.
    #[must_use]
    pub fn len(&self) -> usize {
        self.views.len()
    }

    /// Whether there are no views.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.views.is_empty()
    }
}

/// Quantizable weights and non-quantized trainables of a network.
#[derive(Debug)]
pub struct QuantRegistry {
    id: usize,
    params: Vec<QuantParam>,
    biases: Vec<(String, Var)>,
}

impl Default for QuantRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl QuantRegistry {
    /// Create an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self {
            id: NEXT_REGISTRY.fetch_add(1, Ordering::Relaxed),
            params: Vec::new(),
            biases: Vec::new(),
        }
    }

    fn param_id(&self, index: usize) -> ParamId {
        ParamId {
            registry: self.id,
            index,
        }
    }

    fn ensure_unique(&self, name: &str) -> Result<()> {
        let taken = self.params.iter().any(|p| p.name == name)
            || self.biases.iter().any(|(n, _)| n == name);
        if taken {
            return Err(LightnnError::DuplicateParameter(name.to_string()));
        }
        Ok(())
    }

    /// Register a weight that is quantized before every forward pass.
    ///
    /// # Errors
    ///
    /// Returns error if the name is taken or the tensor cannot become a variable.
    pub fn register_weight(
        &mut self,
        name: impl Into<String>,
        kind: ParamKind,
        weight: &Tensor,
    ) -> Result<ParamId> {
        let name = name.into();
        self.ensure_unique(&name)?;

        let id = self.param_id(self.params.len());
        self.params.push(QuantParam {
            name,
            kind,
            canonical: Var::from_tensor(weight)?,
        });
        Ok(id)
    }

    /// Register a bias. Biases are trainable but never quantized.
    ///
    /// # Errors
    ///
    /// Returns error if the name is taken or the tensor cannot become a variable.
    pub fn register_bias(&mut self, name: impl Into<String>, bias: &Tensor) -> Result<Var> {
        let name = name.into();
        self.ensure_unique(&name)?;

        let var = Var::from_tensor(bias)?;
        self.biases.push((name, var.clone()));
        Ok(var)
    }

    /// Number of quantizable weights.
    #[must_use]
    pub fn len(&self) -> usize {
        self.params.len()
    }

    /// Whether no weight is registered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.params.is_empty()
    }

    /// Registered weights in registration order.
    #[must_use]
    pub fn params(&self) -> &[QuantParam] {
        &self.params
    }

    /// Weight for `id`.
    ///
    /// # Errors
    ///
    /// Returns error if `id` is out of range or was issued by another registry.
    pub fn get(&self, id: ParamId) -> Result<&QuantParam> {
        if id.registry != self.id {
            return Err(unknown(id));
        }
        self.params.get(id.index).ok_or_else(|| unknown(id))
    }

    /// Look up a weight by name.
    #[must_use]
    pub fn find(&self, name: &str) -> Option<ParamId> {
        self.params
            .iter()
            .position(|p| p.name == name)
            .map(|index| self.param_id(index))
    }

    /// All trainable variables: canonical weights followed by biases.
    #[must_use]
    pub fn vars(&self) -> Vec<Var> {
        self.params
            .iter()
            .map(|p| p.canonical.clone())
            .chain(self.biases.iter().map(|(_, v)| v.clone()))
            .collect()
    }

    /// Total element count of the quantizable weights.
    #[must_use]
    pub fn num_quantized_elements(&self) -> usize {
        self.params.iter().map(|p| p.canonical.elem_count()).sum()
    }

    /// Clamp every canonical weight and derive its quantized view.
    ///
    /// # Errors
    ///
    /// Returns error if the configuration is invalid or any quantization fails.
    pub fn quantize_all(&self, config: &LightnnConfig) -> Result<QuantizedViews> {
        config.validate()?;

        let mut views = Vec::with_capacity(self.params.len());
        for param in &self.params {
            param.clamp_in_place(config.clip)?;
            views.push(param.forward_view(config)?);
        }

        tracing::debug!(
            params = views.len(),
            num_shifts = config.num_shifts,
            shift_bits = config.shift_bits,
            "quantized registry"
        );
        Ok(QuantizedViews {
            registry: self.id,
            views,
        })
    }

    /// Export every weight as packed exponent codes.
    ///
    /// # Errors
    ///
    /// Returns error if the configuration is invalid or encoding fails.
    pub fn encode_all(&self, config: &LightnnConfig) -> Result<Vec<(String, ShiftWeight)>> {
        self.params
            .iter()
            .map(|p| {
                let clipped = clip_weights(p.canonical.as_tensor(), config.clip)?;
                Ok((p.name.clone(), encode_shift_weight(&clipped, config)?))
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::Device;

    fn registry_with_weight(values: &[f32]) -> (QuantRegistry, ParamId) {
        let device = Device::Cpu;
        let mut registry = QuantRegistry::new();
        let weight = Tensor::from_slice(values, (values.len(),), &device).unwrap();
        let id = registry
            .register_weight("fc.weight", ParamKind::Linear, &weight)
            .unwrap();
        (registry, id)
    }

    #[test]
    fn test_register_and_lookup() {
        let (mut registry, id) = registry_with_weight(&[0.5, -0.25]);
        let bias = Tensor::zeros((2,), candle_core::DType::F32, &Device::Cpu).unwrap();
        registry.register_bias("fc.bias", &bias).unwrap();

        assert_eq!(registry.len(), 1);
        assert_eq!(registry.find("fc.weight"), Some(id));
        assert_eq!(registry.find("fc.bias"), None);
        assert_eq!(registry.get(id).unwrap().kind(), ParamKind::Linear);
        assert_eq!(registry.vars().len(), 2);
        assert_eq!(registry.num_quantized_elements(), 2);
    }

    #[test]
    fn test_duplicate_names_rejected() {
        let (mut registry, _) = registry_with_weight(&[0.5]);
        let t = Tensor::ones((1,), candle_core::DType::F32, &Device::Cpu).unwrap();

        assert!(matches!(
            registry.register_weight("fc.weight", ParamKind::Linear, &t),
            Err(LightnnError::DuplicateParameter(_))
        ));
        registry.register_bias("fc.bias", &t).unwrap();
        assert!(registry
            .register_weight("fc.bias", ParamKind::Linear, &t)
            .is_err());
    }

    #[test]
    fn test_quantize_all_clamps_but_keeps_canonical_full_precision() {
        let (registry, id) = registry_with_weight(&[1.5, -0.3, 0.7, -2.0]);
        let config = LightnnConfig::inference();

        let views = registry.quantize_all(&config).unwrap();

        let canonical: Vec<f32> = registry
            .get(id)
            .unwrap()
            .canonical()
            .as_tensor()
            .to_vec1()
            .unwrap();
        assert_eq!(canonical, vec![1.0, -0.3, 0.7, -1.0]);

        let view: Vec<f32> = views.get(id).unwrap().to_vec1().unwrap();
        assert_eq!(view[0], 1.0);
        assert_eq!(view[3], -1.0);
        assert_ne!(view[1], -0.3);

        // A second pass quantizes the same canonical values again
        let again: Vec<f32> = registry
            .quantize_all(&config)
            .unwrap()
            .get(id)
            .unwrap()
            .to_vec1()
            .unwrap();
        assert_eq!(again, view);
    }

    #[test]
    fn test_ste_view_routes_gradient_to_canonical() {
        let (registry, id) = registry_with_weight(&[0.3, -0.6, 0.9]);
        let views = registry.quantize_all(&LightnnConfig::default()).unwrap();

        let loss = views.get(id).unwrap().sum_all().unwrap();
        let grads = loss.backward().unwrap();
        let grad: Vec<f32> = grads
            .get(registry.get(id).unwrap().canonical())
            .unwrap()
            .to_vec1()
            .unwrap();
        assert_eq!(grad, vec![1.0, 1.0, 1.0]);
    }

    #[test]
    fn test_unknown_id() {
        let (registry, _) = registry_with_weight(&[0.5]);
        let views = registry.quantize_all(&LightnnConfig::default()).unwrap();
        let out_of_range = registry.param_id(7);
        assert!(matches!(
            views.get(out_of_range),
            Err(LightnnError::UnknownParameter(_))
        ));
        assert!(registry.get(out_of_range).is_err());
    }

    #[test]
    fn test_ids_from_another_registry_are_rejected() {
        let (registry_a, id_a) = registry_with_weight(&[0.5, -0.25, 0.125]);
        let mut registry_b = QuantRegistry::new();
        let weight_b = Tensor::ones((5, 5), candle_core::DType::F32, &Device::Cpu).unwrap();
        let id_b = registry_b
            .register_weight("conv.weight", ParamKind::Conv2d, &weight_b)
            .unwrap();

        // Same slot in both registries
        assert_eq!(id_a.index(), id_b.index());
        assert_ne!(id_a, id_b);

        let views_a = registry_a.quantize_all(&LightnnConfig::default()).unwrap();
        assert!(matches!(
            views_a.get(id_b),
            Err(LightnnError::UnknownParameter(_))
        ));
        assert!(matches!(
            registry_a.get(id_b),
            Err(LightnnError::UnknownParameter(_))
        ));
        assert_eq!(views_a.get(id_a).unwrap().dims(), &[3]);
    }

    #[test]
    fn test_quantize_all_validates_config() {
        let (registry, _) = registry_with_weight(&[0.5]);
        let config = LightnnConfig::default().with_num_shifts(0);
        assert!(registry.quantize_all(&config).is_err());
    }

    #[test]
    fn test_encode_all() {
        let (registry, _) = registry_with_weight(&[0.5, -0.25, 0.0, 0.125]);
        let encoded = registry.encode_all(&LightnnConfig::default()).unwrap();

        assert_eq!(encoded.len(), 1);
        assert_eq!(encoded[0].0, "fc.weight");
        assert_eq!(encoded[0].1.codes[0], vec![1, -2, 0, 3]);
    }
}
