//! Wavebridge WASAPI Layer
//!
//! Bridges the platform-independent core to the Windows Audio Session API:
//!
//! - Device enumeration with hot-plug tracking and default-device identity
//! - Asynchronous endpoint activation, including per-process loopback
//! - Exclusive mode with period alignment, event-driven shared mode,
//!   loopback capture with a silence feed for idle endpoints
//! - A ring-buffer I/O core with dynamic device switching, a fallback clock
//!   for dead devices, and endpoint volume/mute monitoring
//!
//! # Architecture
//!
//! ```text
//! Caller threads                 I/O thread (MTA, "Pro Audio")
//! ──────────────                 ─────────────────────────────
//! Rbuf::open/acquire/... ──────► command queue ──► StreamCtx ──► WASAPI
//!                                     ▲
//! DeviceManager thread (MTA) ────────┘ UpdateDevice(new ctx)
//!
//! DeviceProvider ──► Enumerator thread (MTA) ──► IMMDeviceEnumerator
//!                         ▲
//!                    IMMNotificationClient (coalesced 100 ms)
//! ```
//!
//! Each COM interface lives and dies on the apartment thread that created
//! it; caller-facing objects communicate with those threads over channels.
//! Everything that does not touch the OS (HRESULT tables, version gates,
//! provider diffing) builds and tests on any platform.

pub mod error;
pub mod hresult;
pub mod provider;
pub mod version;

#[cfg(target_os = "windows")]
pub mod activator;
#[cfg(target_os = "windows")]
pub mod com;
#[cfg(target_os = "windows")]
pub mod ctx;
#[cfg(target_os = "windows")]
pub mod endpoint;
#[cfg(target_os = "windows")]
pub mod enumerator;
#[cfg(target_os = "windows")]
pub mod manager;
#[cfg(target_os = "windows")]
pub mod rbuf;
#[cfg(target_os = "windows")]
pub mod wfx;

#[cfg(all(test, target_os = "windows"))]
mod tests;

pub use error::{WasapiError, WasapiResult};
pub use provider::{
    default_endpoint_id, devices_from_entries, diff_devices, is_default_endpoint_id, Device,
    DeviceClass, DeviceEvent, DeviceProps, EndpointEntry, FormFactor,
};
pub use version::WindowsVersion;

#[cfg(target_os = "windows")]
pub use manager::{CtxDesc, DeviceManager};
#[cfg(target_os = "windows")]
pub use provider::DeviceProvider;
#[cfg(target_os = "windows")]
pub use rbuf::Rbuf;
