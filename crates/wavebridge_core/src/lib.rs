//! Wavebridge Core - Format Model and Ring Buffer
//!
//! Platform-independent half of the Wavebridge audio bridge. This crate holds
//! everything the Windows layer needs that does not itself touch the OS:
//!
//! - Bit-exact wave-format descriptions and the similarity comparator used to
//!   rank candidate device formats against a requested format
//! - Channel-mask <-> channel-position mapping
//! - Capability sets derived from probed format lists
//! - The host <-> device sample converter (format, channels, rate)
//! - The S24-in-32 MSB/LSB repack (SSE2 accelerated)
//! - The segment ring buffer shared between the pipeline and the I/O thread
//! - Stream configuration and the structured message model
//!
//! # Architecture
//!
//! ```text
//! Pipeline                          wavebridge_wasapi
//! ────────                          ─────────────────
//! StreamConfig ───────────────────► Rbuf (I/O thread)
//!                                     │
//! SegmentRing ◄── write/advance ────┤ prepare_read / advance / clear
//!                                     │
//! StreamMessage ◄── channel ─────────┘ AudioConverter, repack
//! ```
//!
//! Nothing in this crate blocks on the OS; the Windows layer drives it.

pub mod caps;
pub mod channels;
pub mod compare;
pub mod config;
pub mod convert;
pub mod error;
pub mod format;
pub mod info;
pub mod message;
pub mod repack;
pub mod ring;

pub use caps::{Caps, CapsEntry};
pub use channels::ChannelPosition;
pub use compare::sort_formats;
pub use config::{DataFlow, EndpointClass, ProcessLoopbackMode, StreamConfig};
pub use convert::{AudioConverter, ConverterConfig, ResampleMethod};
pub use error::CoreError;
pub use format::{SampleFormat, SubFormat, WaveFormat};
pub use info::AudioInfo;
pub use message::{ResourceKind, Severity, StreamMessage};
pub use ring::{RingSpec, SegmentRing};
