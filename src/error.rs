//! Error types for lightnn.

use thiserror::Error;

use crate::config::QuantMode;

/// Result type alias for lightnn operations.
pub type Result<T> = std::result::Result<T, LightnnError>;

/// Errors that can occur during quantization and network construction.
#[derive(Debug, Error)]
pub enum LightnnError {
    /// Invalid configuration parameter.
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    /// Quantization mode that has no implementation.
    #[error("quantization mode not supported: {0:?}")]
    UnsupportedMode(QuantMode),

    /// Shape mismatch in tensor operations.
    #[error("shape mismatch: expected {expected:?}, got {actual:?}")]
    ShapeMismatch {
        /// Expected shape.
        expected: Vec<usize>,
        /// Actual shape.
        actual: Vec<usize>,
    },

    /// A parameter id or name that the registry does not know.
    #[error("unknown parameter: {0}")]
    UnknownParameter(String),

    /// A parameter name registered twice.
    #[error("duplicate parameter: {0}")]
    DuplicateParameter(String),

    /// Quantization error.
    #[error("quantization error: {0}")]
    Quantization(String),

    /// Candle tensor operation error.
    #[error("tensor error: {0}")]
    Tensor(#[from] candle_core::Error),

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// YAML (de)serialization error.
    #[error("yaml error: {0}")]
    Yaml(#[from] serde_yaml::Error),
}
