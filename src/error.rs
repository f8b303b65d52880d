//! Error types for compression sessions

use thiserror::Error;

/// Error type for compression operations
#[derive(Debug, Error)]
pub enum CompressError {
    /// Requested layer name is absent from the model
    #[error("layer not found: {name}")]
    LayerNotFound {
        /// Name that was looked up
        name: String,
    },

    /// A layer's weights do not match the tensor flowing into it
    #[error("shape mismatch in layer '{layer}': expected {expected}, got {actual}")]
    ShapeMismatch {
        /// Layer that rejected its input
        layer: String,
        /// Shape the layer's weights require
        expected: String,
        /// Shape that actually arrived
        actual: String,
    },

    /// The target layer cannot be compressed by the selected technique
    #[error("invalid target layer '{layer}': {reason}")]
    InvalidTarget {
        /// Layer that was targeted
        layer: String,
        /// Why the technique rejected it
        reason: String,
    },

    /// A dataset was required but none was supplied (or it has no batches)
    #[error("a non-empty dataset is required for this operation")]
    EmptyDataset,

    /// A layer was used before its weights were materialized
    #[error("layer '{layer}' has not been built")]
    NotBuilt {
        /// Layer that is missing weights
        layer: String,
    },
}

/// Result type for compression operations
pub type Result<T> = std::result::Result<T, CompressError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = CompressError::LayerNotFound {
            name: "conv_1".into(),
        };
        assert_eq!(err.to_string(), "layer not found: conv_1");

        let err = CompressError::ShapeMismatch {
            layer: "dense_2".into(),
            expected: "(8)".into(),
            actual: "(4)".into(),
        };
        assert!(err.to_string().contains("dense_2"));
        assert!(err.to_string().contains("(8)"));
    }
}
