//! Core Error Types

use thiserror::Error;

/// Errors from the platform-independent core
#[derive(Error, Debug)]
pub enum CoreError {
    #[error("Invalid format: {0}")]
    InvalidFormat(String),

    #[error("Unsupported format: {0}")]
    UnsupportedFormat(String),

    #[error("Invalid configuration: {0}")]
    InvalidConfiguration(String),

    #[error("Conversion failed: {0}")]
    ConversionFailed(String),

    #[error("Invalid ring buffer spec: {0}")]
    InvalidSpec(String),
}

pub type CoreResult<T> = Result<T, CoreError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = CoreError::UnsupportedFormat("7 valid bits".into());
        assert!(err.to_string().contains("7 valid bits"));
    }
}
