//! Wave Format Model
//!
//! Bit-exact description of an endpoint stream format, mirroring
//! WAVEFORMATEX / WAVEFORMATEXTENSIBLE without depending on the Windows API.
//! The Windows layer converts to and from the real structures; everything
//! else (comparator, capability sets, converter selection) works on this
//! model and is testable on any OS.

use serde::{Deserialize, Serialize};

use crate::channels;
use crate::error::{CoreError, CoreResult};
use crate::info::AudioInfo;

/// wFormatTag values the bridge understands
pub const FORMAT_TAG_PCM: u16 = 0x0001;
pub const FORMAT_TAG_IEEE_FLOAT: u16 = 0x0003;
pub const FORMAT_TAG_EXTENSIBLE: u16 = 0xFFFE;

/// Subformat GUID of a WAVEFORMATEXTENSIBLE, carried as the raw 128-bit value
///
/// Non-extensible formats get a synthetic subformat derived from the tag so
/// the comparator can treat all formats uniformly.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubFormat(pub u128);

impl SubFormat {
    /// KSDATAFORMAT_SUBTYPE_PCM {00000001-0000-0010-8000-00aa00389b71}
    pub const PCM: SubFormat = SubFormat(0x00000001_0000_0010_8000_00aa00389b71);
    /// KSDATAFORMAT_SUBTYPE_IEEE_FLOAT {00000003-0000-0010-8000-00aa00389b71}
    pub const IEEE_FLOAT: SubFormat = SubFormat(0x00000003_0000_0010_8000_00aa00389b71);
    /// No subformat known
    pub const NONE: SubFormat = SubFormat(0);

    pub fn is_pcm(self) -> bool {
        self == Self::PCM
    }

    pub fn is_float(self) -> bool {
        self == Self::IEEE_FLOAT
    }
}

/// Interleaved sample layout, named with the usual little-endian tokens
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SampleFormat {
    U8,
    S16Le,
    /// 24-bit packed in 3 bytes
    S24Le,
    /// 24 valid bits LSB-aligned in a 32-bit container ("S24_32LE")
    S24In32Le,
    S32Le,
    F32Le,
    F64Le,
}

impl SampleFormat {
    /// Container size in bytes
    pub fn bytes(self) -> usize {
        match self {
            SampleFormat::U8 => 1,
            SampleFormat::S16Le => 2,
            SampleFormat::S24Le => 3,
            SampleFormat::S24In32Le | SampleFormat::S32Le | SampleFormat::F32Le => 4,
            SampleFormat::F64Le => 8,
        }
    }

    /// Container size in bits
    pub fn bits(self) -> u16 {
        (self.bytes() * 8) as u16
    }

    /// Meaningful bits per sample
    pub fn valid_bits(self) -> u16 {
        match self {
            SampleFormat::S24In32Le => 24,
            other => other.bits(),
        }
    }

    pub fn is_float(self) -> bool {
        matches!(self, SampleFormat::F32Le | SampleFormat::F64Le)
    }

    /// Byte value representing silence for this layout
    pub fn silence_byte(self) -> u8 {
        match self {
            SampleFormat::U8 => 0x80,
            _ => 0,
        }
    }

    /// Little-endian integer format for a container/valid-bit pair
    pub fn build_integer(bits: u16, valid_bits: u16) -> Option<SampleFormat> {
        match (bits, valid_bits) {
            (8, 8) => Some(SampleFormat::U8),
            (16, 16) => Some(SampleFormat::S16Le),
            (24, 24) => Some(SampleFormat::S24Le),
            (32, 24) => Some(SampleFormat::S24In32Le),
            (32, 32) => Some(SampleFormat::S32Le),
            _ => None,
        }
    }

    pub fn token(self) -> &'static str {
        match self {
            SampleFormat::U8 => "U8",
            SampleFormat::S16Le => "S16LE",
            SampleFormat::S24Le => "S24LE",
            SampleFormat::S24In32Le => "S24_32LE",
            SampleFormat::S32Le => "S32LE",
            SampleFormat::F32Le => "F32LE",
            SampleFormat::F64Le => "F64LE",
        }
    }

    pub fn from_token(token: &str) -> Option<SampleFormat> {
        match token {
            "U8" => Some(SampleFormat::U8),
            "S16LE" => Some(SampleFormat::S16Le),
            "S24LE" => Some(SampleFormat::S24Le),
            "S24_32LE" => Some(SampleFormat::S24In32Le),
            "S32LE" => Some(SampleFormat::S32Le),
            "F32LE" => Some(SampleFormat::F32Le),
            "F64LE" => Some(SampleFormat::F64Le),
            _ => None,
        }
    }
}

impl std::fmt::Display for SampleFormat {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.token())
    }
}

/// Bit-exact wave format
///
/// Two formats are *equivalent* when every field matches, which is what the
/// derived `PartialEq` checks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct WaveFormat {
    pub tag: u16,
    pub channels: u16,
    pub rate: u32,
    /// Container bits per sample
    pub bits_per_sample: u16,
    /// Valid bits as reported; 0 for non-extensible formats means "container"
    pub valid_bits_per_sample: u16,
    /// WASAPI speaker mask; 0 when unknown
    pub channel_mask: u32,
    pub sub_format: SubFormat,
}

impl WaveFormat {
    /// Plain WAVE_FORMAT_PCM
    pub fn pcm(channels: u16, rate: u32, bits: u16) -> WaveFormat {
        WaveFormat {
            tag: FORMAT_TAG_PCM,
            channels,
            rate,
            bits_per_sample: bits,
            valid_bits_per_sample: bits,
            channel_mask: 0,
            sub_format: SubFormat::PCM,
        }
    }

    /// Plain WAVE_FORMAT_IEEE_FLOAT
    pub fn ieee_float(channels: u16, rate: u32, bits: u16) -> WaveFormat {
        WaveFormat {
            tag: FORMAT_TAG_IEEE_FLOAT,
            channels,
            rate,
            bits_per_sample: bits,
            valid_bits_per_sample: bits,
            channel_mask: 0,
            sub_format: SubFormat::IEEE_FLOAT,
        }
    }

    /// WAVE_FORMAT_EXTENSIBLE with a canonical channel mask for the count
    pub fn extensible(
        channels: u16,
        rate: u32,
        bits: u16,
        valid_bits: u16,
        is_float: bool,
    ) -> WaveFormat {
        WaveFormat {
            tag: FORMAT_TAG_EXTENSIBLE,
            channels,
            rate,
            bits_per_sample: bits,
            valid_bits_per_sample: valid_bits,
            channel_mask: channels::make_channel_mask(channels),
            sub_format: if is_float {
                SubFormat::IEEE_FLOAT
            } else {
                SubFormat::PCM
            },
        }
    }

    /// Default mix format used when an endpoint reports none
    ///
    /// Virtual loopback devices in particular may not provide a mix format.
    pub fn default_mix() -> WaveFormat {
        WaveFormat::pcm(2, 48000, 16)
    }

    pub fn is_extensible(&self) -> bool {
        self.tag == FORMAT_TAG_EXTENSIBLE
    }

    /// `blockAlign = channels * bitsPerSample / 8`
    pub fn block_align(&self) -> u32 {
        u32::from(self.channels) * u32::from(self.bits_per_sample) / 8
    }

    /// `avgBytesPerSec = rate * blockAlign`
    pub fn avg_bytes_per_sec(&self) -> u32 {
        self.rate * self.block_align()
    }

    /// Valid bits, falling back to the container size when unreported
    pub fn valid_bits_or_container(&self) -> u16 {
        if self.valid_bits_per_sample != 0 {
            self.valid_bits_per_sample
        } else {
            self.bits_per_sample
        }
    }

    /// Meaningful resolution: floats count their container size
    pub fn effective_bits(&self) -> u16 {
        if self.sub_format.is_float() {
            32
        } else {
            self.valid_bits_or_container()
        }
    }

    /// 32-bit PCM container holding 24 valid bits
    pub fn is_s24_in_32(&self) -> bool {
        self.sub_format.is_pcm()
            && self.bits_per_sample == 32
            && (self.valid_bits_per_sample == 24 || self.valid_bits_or_container() == 24)
    }

    /// Map to the interleaved sample layout, when representable
    pub fn sample_format(&self) -> Option<SampleFormat> {
        match self.tag {
            FORMAT_TAG_PCM => SampleFormat::build_integer(
                self.bits_per_sample,
                self.bits_per_sample,
            ),
            FORMAT_TAG_IEEE_FLOAT => match self.bits_per_sample {
                32 => Some(SampleFormat::F32Le),
                64 => Some(SampleFormat::F64Le),
                _ => None,
            },
            FORMAT_TAG_EXTENSIBLE => {
                if self.sub_format.is_pcm() {
                    SampleFormat::build_integer(
                        self.bits_per_sample,
                        self.valid_bits_or_container(),
                    )
                } else if self.sub_format.is_float() {
                    match (self.bits_per_sample, self.valid_bits_or_container()) {
                        (32, 32) => Some(SampleFormat::F32Le),
                        (64, 64) => Some(SampleFormat::F64Le),
                        _ => None,
                    }
                } else {
                    None
                }
            }
            _ => None,
        }
    }

    /// Build a format the audio engine would accept for the given host info
    pub fn from_audio_info(info: &AudioInfo) -> CoreResult<WaveFormat> {
        let fmt = info.format;
        let mut wf = WaveFormat::extensible(
            info.channels,
            info.rate,
            fmt.bits(),
            fmt.valid_bits(),
            fmt.is_float(),
        );

        // 1/2ch 8/16-bit integer formats fit the plain PCM tag
        if !fmt.is_float() && info.channels <= 2 && fmt.bits() <= 16 {
            wf = WaveFormat::pcm(info.channels, info.rate, fmt.bits());
        }

        if wf.sample_format().is_none() {
            return Err(CoreError::InvalidFormat(format!(
                "no wave format for {fmt}"
            )));
        }

        Ok(wf)
    }
}

impl std::fmt::Display for WaveFormat {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{}ch {}Hz {}/{}bit tag=0x{:04x} mask=0x{:x}",
            self.channels,
            self.rate,
            self.valid_bits_or_container(),
            self.bits_per_sample,
            self.tag,
            self.channel_mask
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_derived_fields() {
        let wf = WaveFormat::pcm(2, 48000, 16);
        assert_eq!(wf.block_align(), 4);
        assert_eq!(wf.avg_bytes_per_sec(), 192000);
    }

    #[test]
    fn test_default_mix_format() {
        let wf = WaveFormat::default_mix();
        assert_eq!(wf.tag, FORMAT_TAG_PCM);
        assert_eq!(wf.channels, 2);
        assert_eq!(wf.rate, 48000);
        assert_eq!(wf.bits_per_sample, 16);
        assert_eq!(wf.sample_format(), Some(SampleFormat::S16Le));
    }

    #[test]
    fn test_s24_in_32_detection() {
        let s2432 = WaveFormat::extensible(2, 48000, 32, 24, false);
        assert!(s2432.is_s24_in_32());
        assert_eq!(s2432.sample_format(), Some(SampleFormat::S24In32Le));

        let s32 = WaveFormat::extensible(2, 48000, 32, 32, false);
        assert!(!s32.is_s24_in_32());

        let f32 = WaveFormat::extensible(2, 48000, 32, 32, true);
        assert!(!f32.is_s24_in_32());
    }

    #[test]
    fn test_effective_bits() {
        assert_eq!(WaveFormat::extensible(2, 48000, 32, 32, true).effective_bits(), 32);
        assert_eq!(WaveFormat::extensible(2, 48000, 32, 24, false).effective_bits(), 24);
        assert_eq!(WaveFormat::pcm(2, 48000, 16).effective_bits(), 16);
    }

    #[test]
    fn test_equivalence_is_field_exact() {
        let a = WaveFormat::extensible(2, 48000, 32, 24, false);
        let mut b = a;
        assert_eq!(a, b);

        b.channel_mask = 0;
        assert_ne!(a, b);
    }

    #[test]
    fn test_audio_info_round_trip() {
        // W -> info -> W must stay equivalent for every probed layout
        for fmt in [
            SampleFormat::S16Le,
            SampleFormat::S24Le,
            SampleFormat::S24In32Le,
            SampleFormat::S32Le,
            SampleFormat::F32Le,
            SampleFormat::F64Le,
        ] {
            let info = AudioInfo::new(fmt, 48000, 2);
            let wf = WaveFormat::from_audio_info(&info).unwrap();
            assert_eq!(wf.sample_format(), Some(fmt), "{fmt}");
            assert_eq!(wf.rate, 48000);
            assert_eq!(wf.channels, 2);

            let back = WaveFormat::from_audio_info(&AudioInfo::new(
                wf.sample_format().unwrap(),
                wf.rate,
                wf.channels,
            ))
            .unwrap();
            assert_eq!(wf, back);
        }
    }

    #[test]
    fn test_token_round_trip() {
        for fmt in [
            SampleFormat::U8,
            SampleFormat::S16Le,
            SampleFormat::S24Le,
            SampleFormat::S24In32Le,
            SampleFormat::S32Le,
            SampleFormat::F32Le,
            SampleFormat::F64Le,
        ] {
            assert_eq!(SampleFormat::from_token(fmt.token()), Some(fmt));
        }
        assert_eq!(SampleFormat::from_token("S20LE"), None);
    }
}
