//! Error types for attrib_core.

use thiserror::Error;

/// Result type alias using [`VisError`].
pub type Result<T> = std::result::Result<T, VisError>;

/// Errors raised while computing attribution maps.
#[derive(Error, Debug)]
pub enum VisError {
    /// An argument was missing or malformed.
    ///
    /// Raised before any gradient computation is attempted.
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    /// A seed input does not match the model's declared input.
    #[error("Invalid seed input {index}: expected {expected}, got {got}")]
    InvalidSeedInput {
        /// Position of the offending seed input.
        index: usize,
        /// Expected shape description.
        expected: String,
        /// Actual shape description.
        got: String,
    },

    /// The model returned arrays of an unexpected shape.
    #[error("Shape mismatch: {0}")]
    ShapeMismatch(String),

    /// A gradient was requested for a tensor the objective does not depend on.
    #[error("Unconnected gradient: {0}")]
    UnconnectedGradient(String),

    /// The differentiable model failed.
    #[error("Model error: {0}")]
    Model(String),
}

impl VisError {
    /// Shorthand for [`VisError::InvalidArgument`].
    pub fn invalid(msg: impl Into<String>) -> Self {
        Self::InvalidArgument(msg.into())
    }

    /// Whether this error was raised by argument validation.
    #[must_use]
    pub fn is_invalid_argument(&self) -> bool {
        matches!(
            self,
            Self::InvalidArgument(_) | Self::InvalidSeedInput { .. }
        )
    }
}
