//! Error types for the protocol crate.

use thiserror::Error;

/// Protocol error type covering validation and encoding failures.
#[derive(Debug, Error, PartialEq)]
pub enum ProtocolError {
    /// Failed to serialize data.
    #[error("serialization failed: {0}")]
    Serialization(String),

    /// Failed to deserialize data.
    #[error("deserialization failed: {0}")]
    Deserialization(String),

    /// A grid layout had a zero dimension.
    #[error("invalid layout {rows}x{cols}: rows and cols must both be at least 1")]
    InvalidLayout {
        /// Requested row count.
        rows: u16,
        /// Requested column count.
        cols: u16,
    },

    /// Terminal dimensions were not positive.
    #[error("invalid terminal dimensions {cols}x{rows}")]
    InvalidDimensions {
        /// Requested column count.
        cols: u16,
        /// Requested row count.
        rows: u16,
    },

    /// A layout preset name was not recognised.
    #[error("unknown layout preset: {0}")]
    UnknownPreset(String),
}

/// Result type alias for protocol operations.
pub type Result<T> = std::result::Result<T, ProtocolError>;

impl From<serde_json::Error> for ProtocolError {
    fn from(err: serde_json::Error) -> Self {
        if err.is_data() || err.is_eof() || err.is_syntax() {
            ProtocolError::Deserialization(err.to_string())
        } else {
            ProtocolError::Serialization(err.to_string())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_invalid_layout_display() {
        let err = ProtocolError::InvalidLayout { rows: 0, cols: 2 };
        assert_eq!(
            err.to_string(),
            "invalid layout 0x2: rows and cols must both be at least 1"
        );
    }

    #[test]
    fn test_invalid_dimensions_display() {
        let err = ProtocolError::InvalidDimensions { cols: 0, rows: 24 };
        assert_eq!(err.to_string(), "invalid terminal dimensions 0x24");
    }

    #[test]
    fn test_from_serde_json_syntax_error() {
        let err: serde_json::Error = serde_json::from_str::<u32>("{").unwrap_err();
        let converted: ProtocolError = err.into();
        assert!(matches!(converted, ProtocolError::Deserialization(_)));
    }
}
