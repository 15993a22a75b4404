//! WASAPI Layer Error Types

use thiserror::Error;
use wavebridge_core::CoreError;

/// Errors from the Windows audio layer
#[derive(Error, Debug)]
pub enum WasapiError {
    #[error("COM initialization failed: {0}")]
    ComInit(String),

    #[error("Endpoint activation failed: {0}")]
    Activation(String),

    #[error("Format negotiation failed: {0}")]
    FormatNegotiation(String),

    #[error("WASAPI call failed: {detail} (hr: 0x{hresult:08x})")]
    Api { hresult: u32, detail: String },

    #[error("I/O thread unavailable: {0}")]
    ThreadGone(String),

    #[error(transparent)]
    Core(#[from] CoreError),
}

impl WasapiError {
    /// Wrap an HRESULT with context, decoding the code for the message
    pub fn api(hresult: i32, detail: impl Into<String>) -> WasapiError {
        WasapiError::Api {
            hresult: hresult as u32,
            detail: detail.into(),
        }
    }

    pub fn hresult(&self) -> Option<i32> {
        match self {
            WasapiError::Api { hresult, .. } => Some(*hresult as i32),
            _ => None,
        }
    }
}

pub type WasapiResult<T> = Result<T, WasapiError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_api_error_keeps_code() {
        let err = WasapiError::api(0x88890004u32 as i32, "GetCurrentPadding");
        assert_eq!(err.hresult(), Some(0x88890004u32 as i32));
        assert!(err.to_string().contains("0x88890004"));
    }
}
