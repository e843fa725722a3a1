//! Error types for the protocol crate.

use thiserror::Error;

/// Protocol error type covering all possible failure modes.
#[derive(Debug, Error)]
pub enum ProtocolError {
    /// Failed to serialize data.
    #[error("serialization failed: {0}")]
    Serialization(String),

    /// Failed to deserialize data.
    #[error("deserialization failed: {0}")]
    Deserialization(String),

    /// A byte payload was not valid base64.
    #[error("invalid payload: {0}")]
    InvalidPayload(String),
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
    fn test_error_display() {
        let err = ProtocolError::InvalidPayload("bad padding".to_string());
        assert_eq!(err.to_string(), "invalid payload: bad padding");
    }

    #[test]
    fn test_from_serde_json_syntax_error() {
        let err = serde_json::from_str::<u32>("{").unwrap_err();
        assert!(matches!(
            ProtocolError::from(err),
            ProtocolError::Deserialization(_)
        ));
    }
}
