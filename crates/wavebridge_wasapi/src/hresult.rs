//! HRESULT Decoding
//!
//! Translates HRESULT codes to messages. The OS message table returns an
//! empty string for most AUDCLNT_* codes, so a fixed name table backs it up.
//! Codes are carried as plain `i32` so the table (and everything that
//! matches on it) builds and tests on any OS.

pub const S_OK: i32 = 0;
pub const S_FALSE: i32 = 1;
pub const E_FAIL: i32 = 0x8000_4005u32 as i32;
pub const E_POINTER: i32 = 0x8000_4003u32 as i32;
pub const E_INVALIDARG: i32 = 0x8007_0057u32 as i32;
pub const E_NOINTERFACE: i32 = 0x8000_4002u32 as i32;

const fn audclnt_err(code: u32) -> i32 {
    // SEVERITY_ERROR | FACILITY_AUDCLNT
    (0x8889_0000 | code) as i32
}

const fn audclnt_success(code: u32) -> i32 {
    (0x0889_0000 | code) as i32
}

pub const AUDCLNT_E_NOT_INITIALIZED: i32 = audclnt_err(0x001);
pub const AUDCLNT_E_ALREADY_INITIALIZED: i32 = audclnt_err(0x002);
pub const AUDCLNT_E_WRONG_ENDPOINT_TYPE: i32 = audclnt_err(0x003);
pub const AUDCLNT_E_DEVICE_INVALIDATED: i32 = audclnt_err(0x004);
pub const AUDCLNT_E_NOT_STOPPED: i32 = audclnt_err(0x005);
pub const AUDCLNT_E_BUFFER_TOO_LARGE: i32 = audclnt_err(0x006);
pub const AUDCLNT_E_OUT_OF_ORDER: i32 = audclnt_err(0x007);
pub const AUDCLNT_E_UNSUPPORTED_FORMAT: i32 = audclnt_err(0x008);
pub const AUDCLNT_E_INVALID_SIZE: i32 = audclnt_err(0x009);
pub const AUDCLNT_E_DEVICE_IN_USE: i32 = audclnt_err(0x00a);
pub const AUDCLNT_E_BUFFER_OPERATION_PENDING: i32 = audclnt_err(0x00b);
pub const AUDCLNT_E_THREAD_NOT_REGISTERED: i32 = audclnt_err(0x00c);
pub const AUDCLNT_E_EXCLUSIVE_MODE_NOT_ALLOWED: i32 = audclnt_err(0x00e);
pub const AUDCLNT_E_ENDPOINT_CREATE_FAILED: i32 = audclnt_err(0x00f);
pub const AUDCLNT_E_SERVICE_NOT_RUNNING: i32 = audclnt_err(0x010);
pub const AUDCLNT_E_EVENTHANDLE_NOT_EXPECTED: i32 = audclnt_err(0x011);
pub const AUDCLNT_E_EXCLUSIVE_MODE_ONLY: i32 = audclnt_err(0x012);
pub const AUDCLNT_E_BUFDURATION_PERIOD_NOT_EQUAL: i32 = audclnt_err(0x013);
pub const AUDCLNT_E_EVENTHANDLE_NOT_SET: i32 = audclnt_err(0x014);
pub const AUDCLNT_E_INCORRECT_BUFFER_SIZE: i32 = audclnt_err(0x015);
pub const AUDCLNT_E_BUFFER_SIZE_ERROR: i32 = audclnt_err(0x016);
pub const AUDCLNT_E_CPUUSAGE_EXCEEDED: i32 = audclnt_err(0x017);
pub const AUDCLNT_E_BUFFER_SIZE_NOT_ALIGNED: i32 = audclnt_err(0x019);
pub const AUDCLNT_E_INVALID_DEVICE_PERIOD: i32 = audclnt_err(0x020);

pub const AUDCLNT_S_BUFFER_EMPTY: i32 = audclnt_success(0x001);
pub const AUDCLNT_S_THREAD_ALREADY_REGISTERED: i32 = audclnt_success(0x002);
pub const AUDCLNT_S_POSITION_STALLED: i32 = audclnt_success(0x003);

#[inline]
pub fn succeeded(hr: i32) -> bool {
    hr >= 0
}

#[inline]
pub fn failed(hr: i32) -> bool {
    hr < 0
}

/// Fixed-name fallback for codes the OS message table leaves empty
pub fn fallback_name(hr: i32) -> &'static str {
    match hr {
        AUDCLNT_E_NOT_INITIALIZED => "AUDCLNT_E_NOT_INITIALIZED",
        AUDCLNT_E_ALREADY_INITIALIZED => "AUDCLNT_E_ALREADY_INITIALIZED",
        AUDCLNT_E_WRONG_ENDPOINT_TYPE => "AUDCLNT_E_WRONG_ENDPOINT_TYPE",
        AUDCLNT_E_DEVICE_INVALIDATED => "AUDCLNT_E_DEVICE_INVALIDATED",
        AUDCLNT_E_NOT_STOPPED => "AUDCLNT_E_NOT_STOPPED",
        AUDCLNT_E_BUFFER_TOO_LARGE => "AUDCLNT_E_BUFFER_TOO_LARGE",
        AUDCLNT_E_OUT_OF_ORDER => "AUDCLNT_E_OUT_OF_ORDER",
        AUDCLNT_E_UNSUPPORTED_FORMAT => "AUDCLNT_E_UNSUPPORTED_FORMAT",
        AUDCLNT_E_INVALID_DEVICE_PERIOD => "AUDCLNT_E_INVALID_DEVICE_PERIOD",
        AUDCLNT_E_INVALID_SIZE => "AUDCLNT_E_INVALID_SIZE",
        AUDCLNT_E_DEVICE_IN_USE => "AUDCLNT_E_DEVICE_IN_USE",
        AUDCLNT_E_BUFFER_OPERATION_PENDING => "AUDCLNT_E_BUFFER_OPERATION_PENDING",
        AUDCLNT_E_BUFFER_SIZE_ERROR => "AUDCLNT_E_BUFFER_SIZE_ERROR",
        AUDCLNT_E_BUFFER_SIZE_NOT_ALIGNED => "AUDCLNT_E_BUFFER_SIZE_NOT_ALIGNED",
        AUDCLNT_E_THREAD_NOT_REGISTERED => "AUDCLNT_E_THREAD_NOT_REGISTERED",
        AUDCLNT_E_EXCLUSIVE_MODE_NOT_ALLOWED => "AUDCLNT_E_EXCLUSIVE_MODE_NOT_ALLOWED",
        AUDCLNT_E_ENDPOINT_CREATE_FAILED => "AUDCLNT_E_ENDPOINT_CREATE_FAILED",
        AUDCLNT_E_SERVICE_NOT_RUNNING => "AUDCLNT_E_SERVICE_NOT_RUNNING",
        AUDCLNT_E_EVENTHANDLE_NOT_EXPECTED => "AUDCLNT_E_EVENTHANDLE_NOT_EXPECTED",
        AUDCLNT_E_EXCLUSIVE_MODE_ONLY => "AUDCLNT_E_EXCLUSIVE_MODE_ONLY",
        AUDCLNT_E_BUFDURATION_PERIOD_NOT_EQUAL => "AUDCLNT_E_BUFDURATION_PERIOD_NOT_EQUAL",
        AUDCLNT_E_EVENTHANDLE_NOT_SET => "AUDCLNT_E_EVENTHANDLE_NOT_SET",
        AUDCLNT_E_INCORRECT_BUFFER_SIZE => "AUDCLNT_E_INCORRECT_BUFFER_SIZE",
        AUDCLNT_E_CPUUSAGE_EXCEEDED => "AUDCLNT_E_CPUUSAGE_EXCEEDED",
        AUDCLNT_S_BUFFER_EMPTY => "AUDCLNT_S_BUFFER_EMPTY",
        AUDCLNT_S_THREAD_ALREADY_REGISTERED => "AUDCLNT_S_THREAD_ALREADY_REGISTERED",
        AUDCLNT_S_POSITION_STALLED => "AUDCLNT_S_POSITION_STALLED",
        E_POINTER => "E_POINTER",
        E_INVALIDARG => "E_INVALIDARG",
        E_NOINTERFACE => "E_NOINTERFACE",
        E_FAIL => "E_FAIL",
        _ => "unknown error",
    }
}

/// Human-readable message, preferring the OS message table
#[cfg(target_os = "windows")]
pub fn error_message(hr: i32) -> String {
    let message = windows::core::HRESULT(hr).message();
    if message.trim().is_empty() {
        fallback_name(hr).to_string()
    } else {
        message
    }
}

#[cfg(not(target_os = "windows"))]
pub fn error_message(hr: i32) -> String {
    fallback_name(hr).to_string()
}

/// Log-and-test helper for raw HRESULT returns
///
/// Returns `true` on success; failures are logged with the decoded message.
pub fn check(hr: i32, context: &str) -> bool {
    if failed(hr) {
        tracing::warn!(
            "{context} failed: 0x{:08x}, {}",
            hr as u32,
            error_message(hr)
        );
        return false;
    }
    true
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_code_values() {
        // Spot checks against the SDK values
        assert_eq!(AUDCLNT_E_DEVICE_INVALIDATED as u32, 0x8889_0004);
        assert_eq!(AUDCLNT_E_BUFFER_SIZE_NOT_ALIGNED as u32, 0x8889_0019);
        assert_eq!(AUDCLNT_S_BUFFER_EMPTY as u32, 0x0889_0001);
        assert!(failed(AUDCLNT_E_DEVICE_INVALIDATED));
        assert!(succeeded(AUDCLNT_S_BUFFER_EMPTY));
        assert!(succeeded(S_FALSE));
    }

    #[test]
    fn test_fallback_names() {
        assert_eq!(
            fallback_name(AUDCLNT_E_ENDPOINT_CREATE_FAILED),
            "AUDCLNT_E_ENDPOINT_CREATE_FAILED"
        );
        assert_eq!(fallback_name(0x1234_5678u32 as i32), "unknown error");
    }

    #[test]
    fn test_error_message_never_empty() {
        for hr in [
            AUDCLNT_E_DEVICE_INVALIDATED,
            AUDCLNT_E_UNSUPPORTED_FORMAT,
            E_FAIL,
            0x7777_7777u32 as i32,
        ] {
            assert!(!error_message(hr).is_empty());
        }
    }
}
