//! Error types for codec parameter handling.

use thiserror::Error;

/// Errors raised while reading or packaging codec parameters.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FormatError {
    /// A required parameter set is absent, empty, or too large for its record.
    #[error("Malformed parameter set: {0}")]
    MalformedParameterSet(String),

    /// Input ended before a complete structure could be read.
    #[error("Truncated data: {0}")]
    Truncated(String),

    /// The codec cannot be used for this operation.
    #[error("Unsupported codec: {0}")]
    UnsupportedCodec(String),
}
