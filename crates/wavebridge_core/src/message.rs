//! Structured Stream Messages
//!
//! Failures inside the I/O core surface as structured messages delivered
//! over a channel the stream owner supplies, mirroring element messages in a
//! media pipeline: a resource category, a severity (which `continue-on-error`
//! downgrades from error to warning), and the raw OS code when one exists.

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Severity {
    Warning,
    Error,
}

/// Which resource operation failed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResourceKind {
    OpenReadWrite,
    Read,
    Write,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamMessage {
    pub severity: Severity,
    pub kind: ResourceKind,
    pub device_id: Option<String>,
    /// Raw HRESULT when the OS produced one
    pub hresult: Option<i32>,
    pub detail: String,
}

impl StreamMessage {
    /// Device open failure; degraded to a warning when the stream is
    /// configured to continue on error
    pub fn open_failure(device_id: &str, allow_continue: bool) -> StreamMessage {
        StreamMessage {
            severity: if allow_continue {
                Severity::Warning
            } else {
                Severity::Error
            },
            kind: ResourceKind::OpenReadWrite,
            device_id: Some(device_id.to_string()),
            hresult: None,
            detail: format!("Failed to open device {device_id}"),
        }
    }

    /// I/O failure in the running stream
    pub fn io_failure(
        hresult: i32,
        detail: impl Into<String>,
        is_write: bool,
        allow_continue: bool,
    ) -> StreamMessage {
        StreamMessage {
            severity: if allow_continue {
                Severity::Warning
            } else {
                Severity::Error
            },
            kind: if is_write {
                ResourceKind::Write
            } else {
                ResourceKind::Read
            },
            device_id: None,
            hresult: Some(hresult),
            detail: detail.into(),
        }
    }

    pub fn is_error(&self) -> bool {
        self.severity == Severity::Error
    }
}

impl std::fmt::Display for StreamMessage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let sev = match self.severity {
            Severity::Warning => "warning",
            Severity::Error => "error",
        };
        let kind = match self.kind {
            ResourceKind::OpenReadWrite => "open",
            ResourceKind::Read => "read",
            ResourceKind::Write => "write",
        };
        write!(f, "{sev}/{kind}: {}", self.detail)?;
        if let Some(hr) = self.hresult {
            write!(f, " (hr: 0x{:08x})", hr as u32)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_continue_on_error_downgrades() {
        let err = StreamMessage::open_failure("dev", false);
        assert!(err.is_error());

        let warn = StreamMessage::open_failure("dev", true);
        assert_eq!(warn.severity, Severity::Warning);
        assert_eq!(warn.kind, err.kind);
    }

    #[test]
    fn test_io_direction() {
        let write = StreamMessage::io_failure(0x1, "x", true, false);
        assert_eq!(write.kind, ResourceKind::Write);
        let read = StreamMessage::io_failure(0x1, "x", false, false);
        assert_eq!(read.kind, ResourceKind::Read);
    }

    #[test]
    fn test_display_includes_code() {
        let msg = StreamMessage::io_failure(0x88890004u32 as i32, "device gone", false, true);
        let text = msg.to_string();
        assert!(text.contains("0x88890004"));
        assert!(text.contains("device gone"));
    }
}
