//! Host Audio Info
//!
//! The pipeline-facing description of an interleaved stream: sample layout,
//! rate, channel count and (optionally) channel positions. This is the
//! "host" side of the converter; the "device" side is a [`crate::WaveFormat`].

use serde::{Deserialize, Serialize};

use crate::channels::ChannelPosition;
use crate::format::SampleFormat;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AudioInfo {
    pub format: SampleFormat,
    pub rate: u32,
    pub channels: u16,
    #[serde(skip)]
    pub positions: Option<Vec<ChannelPosition>>,
}

impl AudioInfo {
    pub fn new(format: SampleFormat, rate: u32, channels: u16) -> AudioInfo {
        AudioInfo {
            format,
            rate,
            channels,
            positions: None,
        }
    }

    pub fn with_positions(mut self, positions: Vec<ChannelPosition>) -> AudioInfo {
        self.positions = Some(positions);
        self
    }

    /// Bytes per frame
    pub fn bpf(&self) -> usize {
        self.format.bytes() * self.channels as usize
    }

    /// Fill a byte region with silence for this layout
    pub fn fill_silence(&self, data: &mut [u8]) {
        data.fill(self.format.silence_byte());
    }

    /// Same audio properties, ignoring positions
    pub fn compatible_with(&self, other: &AudioInfo) -> bool {
        self.format == other.format && self.rate == other.rate && self.channels == other.channels
    }
}

impl std::fmt::Display for AudioInfo {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} {}Hz {}ch", self.format, self.rate, self.channels)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bpf() {
        assert_eq!(AudioInfo::new(SampleFormat::S16Le, 48000, 2).bpf(), 4);
        assert_eq!(AudioInfo::new(SampleFormat::F32Le, 48000, 2).bpf(), 8);
        assert_eq!(AudioInfo::new(SampleFormat::S24Le, 44100, 6).bpf(), 18);
    }

    #[test]
    fn test_silence() {
        let info = AudioInfo::new(SampleFormat::U8, 8000, 1);
        let mut buf = vec![0u8; 8];
        info.fill_silence(&mut buf);
        assert!(buf.iter().all(|b| *b == 0x80));

        let info = AudioInfo::new(SampleFormat::S16Le, 8000, 1);
        info.fill_silence(&mut buf);
        assert!(buf.iter().all(|b| *b == 0));
    }

    #[test]
    fn test_compatibility_ignores_positions() {
        let a = AudioInfo::new(SampleFormat::S16Le, 48000, 2);
        let b = a.clone().with_positions(vec![
            ChannelPosition::FrontLeft,
            ChannelPosition::FrontRight,
        ]);
        assert!(a.compatible_with(&b));
    }
}
