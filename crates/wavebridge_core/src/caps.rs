//! Capability Sets
//!
//! A capability set is the deduplicated projection of a probed wave-format
//! list into pipeline terms. The provider publishes these per endpoint and
//! the ring buffer matches a requested stream against them.

use serde::{Deserialize, Serialize};

use crate::channels;
use crate::format::{SampleFormat, WaveFormat};
use crate::info::AudioInfo;

/// One stream shape an endpoint accepts
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CapsEntry {
    pub format: SampleFormat,
    pub channels: u16,
    pub rate: u32,
    /// Position bitmask; 0 when unknown or non-positional
    pub channel_mask: u64,
}

impl CapsEntry {
    /// Project a wave format into pipeline terms
    ///
    /// Returns `None` for format tags the pipeline cannot express. WASAPI can
    /// only tell us one canonical mix format per probe; conversion of
    /// anything else happens on our side of the fence.
    pub fn from_wave_format(wf: &WaveFormat) -> Option<CapsEntry> {
        let format = wf.sample_format()?;
        let channel_mask = channels::mask_to_position_mask(wf.channels, wf.channel_mask);

        Some(CapsEntry {
            format,
            channels: wf.channels,
            rate: wf.rate,
            channel_mask,
        })
    }

    pub fn matches(&self, info: &AudioInfo) -> bool {
        self.format == info.format && self.channels == info.channels && self.rate == info.rate
    }
}

impl std::fmt::Display for CapsEntry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} {}Hz {}ch", self.format, self.rate, self.channels)?;
        if self.channel_mask != 0 {
            write!(f, " mask=0x{:x}", self.channel_mask)?;
        }
        Ok(())
    }
}

/// Ordered, deduplicated capability set
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Caps {
    entries: Vec<CapsEntry>,
}

impl Caps {
    pub fn new() -> Caps {
        Caps::default()
    }

    /// Build from an already-sorted format list, keeping first occurrences
    pub fn from_formats(formats: &[WaveFormat]) -> Caps {
        let mut caps = Caps::new();
        for wf in formats {
            if let Some(entry) = CapsEntry::from_wave_format(wf) {
                caps.push(entry);
            }
        }
        caps
    }

    pub fn push(&mut self, entry: CapsEntry) {
        if !self.entries.contains(&entry) {
            self.entries.push(entry);
        }
    }

    pub fn entries(&self) -> &[CapsEntry] {
        &self.entries
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Preferred entry for auto-selection
    pub fn first(&self) -> Option<&CapsEntry> {
        self.entries.first()
    }

    /// Whether a requested stream intersects this set
    pub fn intersects(&self, info: &AudioInfo) -> bool {
        self.entries.iter().any(|e| e.matches(info))
    }
}

impl std::fmt::Display for Caps {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut first = true;
        for entry in &self.entries {
            if !first {
                write!(f, "; ")?;
            }
            write!(f, "{entry}")?;
            first = false;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_dedup() {
        let formats = vec![
            WaveFormat::pcm(2, 48000, 16),
            WaveFormat::extensible(2, 48000, 16, 16, false),
            WaveFormat::extensible(2, 44100, 16, 16, false),
        ];
        // The plain and extensible 48k/16 formats project to the same entry
        // except for the channel mask; only exact duplicates collapse.
        let caps = Caps::from_formats(&formats);
        assert_eq!(caps.entries().len(), 3);

        let dup = vec![WaveFormat::pcm(2, 48000, 16), WaveFormat::pcm(2, 48000, 16)];
        assert_eq!(Caps::from_formats(&dup).entries().len(), 1);
    }

    #[test]
    fn test_intersects() {
        let caps = Caps::from_formats(&[
            WaveFormat::extensible(2, 48000, 32, 32, true),
            WaveFormat::pcm(2, 48000, 16),
        ]);

        assert!(caps.intersects(&AudioInfo::new(SampleFormat::S16Le, 48000, 2)));
        assert!(caps.intersects(&AudioInfo::new(SampleFormat::F32Le, 48000, 2)));
        assert!(!caps.intersects(&AudioInfo::new(SampleFormat::S16Le, 44100, 2)));
        assert!(!caps.intersects(&AudioInfo::new(SampleFormat::S32Le, 48000, 2)));
    }

    #[test]
    fn test_unrepresentable_formats_skipped() {
        // 20-bit-in-32 has no pipeline token
        let odd = WaveFormat::extensible(2, 48000, 32, 20, false);
        assert!(CapsEntry::from_wave_format(&odd).is_none());
        assert!(Caps::from_formats(&[odd]).is_empty());
    }

    #[test]
    fn test_first_is_preferred() {
        let caps = Caps::from_formats(&[
            WaveFormat::extensible(2, 48000, 32, 32, true),
            WaveFormat::pcm(2, 44100, 16),
        ]);
        let first = caps.first().unwrap();
        assert_eq!(first.format, SampleFormat::F32Le);
        assert_eq!(first.rate, 48000);
    }
}
