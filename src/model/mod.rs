//! FCN-8s segmentation network with LightNN-quantized weights.

mod fcn8s;
mod upsampling;
mod vgg;

pub use fcn8s::Fcn8s;
pub use upsampling::upsampling_weight;
pub use vgg::{max_pool2d_ceil, vgg16_stages, VggLayer, VggStage, STAGE_RANGES};
