use thiserror::Error;

use crate::id::IdError;
use crate::post::CodecError;

/// Core error types for timeline values
#[derive(Debug, Error)]
pub enum CoreError {
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("Invalid identifier: {0}")]
    InvalidId(#[from] IdError),

    #[error("Invalid pagination token: {0}")]
    InvalidToken(#[from] CodecError),

    #[error("Event encoding error: {0}")]
    Encode(#[from] rmp_serde::encode::Error),

    #[error("Event decoding error: {0}")]
    Decode(#[from] rmp_serde::decode::Error),
}

impl CoreError {
    /// Create a new InvalidArgument error
    pub fn invalid_argument(message: impl Into<String>) -> Self {
        Self::InvalidArgument(message.into())
    }

    /// Check if this error was caused by caller input
    pub fn is_client_error(&self) -> bool {
        matches!(
            self,
            Self::InvalidArgument(_) | Self::InvalidId(_) | Self::InvalidToken(_)
        )
    }
}

/// Convenience result type for core operations
pub type Result<T> = std::result::Result<T, CoreError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_invalid_argument() {
        let err = CoreError::invalid_argument("negative size");
        assert_eq!(err.to_string(), "Invalid argument: negative size");
        assert!(err.is_client_error());
    }

    #[test]
    fn test_id_error_conversion() {
        let err: CoreError = IdError::InvalidLength(3).into();
        assert!(matches!(err, CoreError::InvalidId(_)));
        assert!(err.to_string().contains("expected 20 characters"));
    }

    #[test]
    fn test_codec_error_conversion() {
        let err: CoreError = CodecError::InvalidLength(7).into();
        assert!(matches!(err, CoreError::InvalidToken(_)));
        assert!(err.is_client_error());
    }

    #[test]
    fn test_decode_error_is_not_client_error() {
        let err: CoreError = rmp_serde::from_slice::<u32>(&[0xc1])
            .unwrap_err()
            .into();
        assert!(!err.is_client_error());
    }
}
