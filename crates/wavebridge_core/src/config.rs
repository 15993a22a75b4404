//! Stream Configuration
//!
//! The recognised options of a bridge stream and the derivation of the
//! endpoint class a stream opens against. Loaded/saved as JSON by hosts
//! that persist settings.

use serde::{Deserialize, Serialize};

use crate::error::CoreError;

/// Endpoint data flow
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DataFlow {
    Capture,
    Render,
}

/// What a stream opens against
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EndpointClass {
    Capture,
    Render,
    /// Capture of a render endpoint's mix
    LoopbackCapture,
    /// Loopback restricted to a process tree
    IncludeProcessLoopbackCapture,
    /// Loopback excluding a process tree
    ExcludeProcessLoopbackCapture,
}

impl EndpointClass {
    /// Flow of the underlying endpoint
    pub fn data_flow(self) -> DataFlow {
        match self {
            EndpointClass::Capture => DataFlow::Capture,
            // Loopback opens the render endpoint
            _ => DataFlow::Render,
        }
    }

    /// Whether the stream consumes capture packets
    pub fn is_capture_stream(self) -> bool {
        !matches!(self, EndpointClass::Render)
    }

    pub fn is_loopback(self) -> bool {
        matches!(self, EndpointClass::LoopbackCapture)
    }

    pub fn is_process_loopback(self) -> bool {
        matches!(
            self,
            EndpointClass::IncludeProcessLoopbackCapture
                | EndpointClass::ExcludeProcessLoopbackCapture
        )
    }
}

impl std::fmt::Display for EndpointClass {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            EndpointClass::Capture => "capture",
            EndpointClass::Render => "render",
            EndpointClass::LoopbackCapture => "loopback-capture",
            EndpointClass::IncludeProcessLoopbackCapture => "include-process-loopback-capture",
            EndpointClass::ExcludeProcessLoopbackCapture => "exclude-process-loopback-capture",
        };
        f.write_str(s)
    }
}

/// `loopback-mode` option
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ProcessLoopbackMode {
    #[default]
    Default,
    IncludeProcessTree,
    ExcludeProcessTree,
}

fn default_volume() -> f64 {
    1.0
}

fn default_buffer_time() -> i64 {
    200_000
}

fn default_latency_time() -> i64 {
    10_000
}

/// Recognised configuration of one stream (§ properties)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StreamConfig {
    /// Endpoint identifier; `None`/empty selects the system default
    pub device_id: Option<String>,

    /// Prefer IAudioClient3 shared streams / minimum exclusive period
    pub low_latency: bool,

    /// Request exclusive mode (capture/render; downgraded for loopback)
    pub exclusive: bool,

    /// Open the render endpoint for loopback capture (sources only)
    pub loopback: bool,
    pub loopback_mode: ProcessLoopbackMode,
    /// Target PID for process loopback
    pub loopback_target_pid: u32,
    /// Emit silence while the endpoint is muted
    pub loopback_silence_on_device_mute: bool,

    /// Degrade open/I/O failures to warnings and run the fallback clock
    pub continue_on_error: bool,

    /// Gate output by multiplying by zero at the stream-volume layer
    pub mute: bool,
    /// Linear gain in [0, 1] applied to every channel
    #[serde(default = "default_volume")]
    pub volume: f64,

    /// Total device buffer target in microseconds
    #[serde(default = "default_buffer_time")]
    pub buffer_time_us: i64,
    /// Period target in microseconds
    #[serde(default = "default_latency_time")]
    pub latency_time_us: i64,
}

impl Default for StreamConfig {
    fn default() -> Self {
        StreamConfig {
            device_id: None,
            low_latency: false,
            exclusive: false,
            loopback: false,
            loopback_mode: ProcessLoopbackMode::Default,
            loopback_target_pid: 0,
            loopback_silence_on_device_mute: false,
            continue_on_error: false,
            mute: false,
            volume: default_volume(),
            buffer_time_us: default_buffer_time(),
            latency_time_us: default_latency_time(),
        }
    }
}

impl StreamConfig {
    /// Endpoint class this configuration opens for the given flow
    pub fn endpoint_class(&self, flow: DataFlow) -> EndpointClass {
        match flow {
            DataFlow::Render => EndpointClass::Render,
            DataFlow::Capture if !self.loopback => EndpointClass::Capture,
            DataFlow::Capture => match self.loopback_mode {
                ProcessLoopbackMode::Default => EndpointClass::LoopbackCapture,
                ProcessLoopbackMode::IncludeProcessTree => {
                    EndpointClass::IncludeProcessLoopbackCapture
                }
                ProcessLoopbackMode::ExcludeProcessTree => {
                    EndpointClass::ExcludeProcessLoopbackCapture
                }
            },
        }
    }

    /// Effective identifier; empty string means "default endpoint"
    pub fn device_id_or_default(&self) -> &str {
        self.device_id.as_deref().unwrap_or("")
    }

    pub fn validate(&self) -> Result<(), CoreError> {
        if !(0.0..=1.0).contains(&self.volume) {
            return Err(CoreError::InvalidConfiguration(format!(
                "volume {} out of [0, 1]",
                self.volume
            )));
        }
        if self.loopback_mode != ProcessLoopbackMode::Default && self.loopback_target_pid == 0 {
            return Err(CoreError::InvalidConfiguration(
                "process loopback requires a target pid".into(),
            ));
        }
        if self.buffer_time_us < 0 || self.latency_time_us < 0 {
            return Err(CoreError::InvalidConfiguration(
                "negative buffer/latency time".into(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_validates() {
        assert!(StreamConfig::default().validate().is_ok());
    }

    #[test]
    fn test_endpoint_class_derivation() {
        let mut config = StreamConfig::default();
        assert_eq!(
            config.endpoint_class(DataFlow::Capture),
            EndpointClass::Capture
        );
        assert_eq!(
            config.endpoint_class(DataFlow::Render),
            EndpointClass::Render
        );

        config.loopback = true;
        assert_eq!(
            config.endpoint_class(DataFlow::Capture),
            EndpointClass::LoopbackCapture
        );

        config.loopback_mode = ProcessLoopbackMode::IncludeProcessTree;
        config.loopback_target_pid = 1234;
        assert_eq!(
            config.endpoint_class(DataFlow::Capture),
            EndpointClass::IncludeProcessLoopbackCapture
        );
    }

    #[test]
    fn test_loopback_class_flow() {
        assert_eq!(EndpointClass::LoopbackCapture.data_flow(), DataFlow::Render);
        assert!(EndpointClass::LoopbackCapture.is_capture_stream());
        assert!(!EndpointClass::LoopbackCapture.is_process_loopback());
        assert!(EndpointClass::ExcludeProcessLoopbackCapture.is_process_loopback());
        assert!(!EndpointClass::Render.is_capture_stream());
    }

    #[test]
    fn test_volume_range() {
        let mut config = StreamConfig::default();
        config.volume = 1.5;
        assert!(config.validate().is_err());
        config.volume = -0.1;
        assert!(config.validate().is_err());
        config.volume = 0.0;
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_process_loopback_requires_pid() {
        let mut config = StreamConfig::default();
        config.loopback = true;
        config.loopback_mode = ProcessLoopbackMode::ExcludeProcessTree;
        assert!(config.validate().is_err());
        config.loopback_target_pid = 42;
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_serde_round_trip() {
        let mut config = StreamConfig::default();
        config.device_id = Some("{0.0.0.00000000}.{guid}".into());
        config.low_latency = true;
        config.loopback = true;

        let json = serde_json::to_string(&config).unwrap();
        let back: StreamConfig = serde_json::from_str(&json).unwrap();
        assert_eq!(config, back);
    }

    #[test]
    fn test_serde_defaults_for_missing_fields() {
        let config: StreamConfig = serde_json::from_str("{}").unwrap();
        assert_eq!(config, StreamConfig::default());
    }
}
