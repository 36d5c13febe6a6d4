//! Error types for the reference networks.

use attrib_core::VisError;

/// Result type for network construction and tensor conversion.
pub type Result<T> = std::result::Result<T, ModelError>;

/// Network errors.
#[derive(Debug, thiserror::Error)]
pub enum ModelError {
    /// The network configuration is unusable.
    #[error("Invalid network config: {0}")]
    Config(String),

    /// An array or tensor had an unexpected shape.
    #[error("Shape error: {0}")]
    Shape(String),

    /// Tensor data could not be read back from the backend.
    #[error("Backend data error: {0}")]
    Data(String),

    /// A layer id that the network does not contain.
    #[error("Unknown layer id {0}")]
    UnknownLayer(usize),
}

impl From<ModelError> for VisError {
    fn from(err: ModelError) -> Self {
        VisError::Model(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_converts_to_model_error() {
        let err: VisError = ModelError::UnknownLayer(7).into();
        assert!(matches!(err, VisError::Model(_)));
        assert!(err.to_string().contains("Unknown layer id 7"));
    }
}
