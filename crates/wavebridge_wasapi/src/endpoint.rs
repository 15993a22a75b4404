//! Endpoint Object
//!
//! Holds the lifetime of everything belonging to one activated endpoint: the
//! IMMDevice (when one exists; process loopback activates without one), the
//! audio client, the optional silence-feed client used for loopback, the
//! probed format set, and the endpoint-volume mute monitor.
//!
//! The mute callback runs on a WASAPI-owned thread and only publishes into
//! an atomic behind a weak reference; when the object is gone the callback
//! no-ops.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

use wavebridge_core::{Caps, EndpointClass, WaveFormat};

use crate::error::WasapiResult;
use crate::hresult;

use windows::core::implement;
use windows::Win32::Media::Audio::Endpoints::{
    IAudioEndpointVolume, IAudioEndpointVolumeCallback, IAudioEndpointVolumeCallback_Impl,
};
use windows::Win32::Media::Audio::{IAudioClient, IMMDevice, AUDIO_VOLUME_NOTIFICATION_DATA};
use windows::Win32::System::Com::CLSCTX_ALL;

#[implement(IAudioEndpointVolumeCallback)]
struct VolumeCallback {
    muted: Weak<AtomicBool>,
}

impl IAudioEndpointVolumeCallback_Impl for VolumeCallback_Impl {
    fn OnNotify(&self, notify: *mut AUDIO_VOLUME_NOTIFICATION_DATA) -> windows::core::Result<()> {
        let Some(muted) = self.muted.upgrade() else {
            return Ok(());
        };
        if notify.is_null() {
            return Ok(());
        }
        // SAFETY: WASAPI hands a valid notification record for the call
        let is_muted = unsafe { (*notify).bMuted.as_bool() };
        muted.store(is_muted, Ordering::Release);
        Ok(())
    }
}

/// Everything owned on behalf of one endpoint
pub struct EndpointObject {
    pub device_id: String,
    pub class: EndpointClass,
    pub is_default: bool,
    pub exclusive: bool,

    pub device: Option<IMMDevice>,
    pub client: IAudioClient,
    /// Second render client feeding silence so loopback produces frames on
    /// idle endpoints
    pub dummy_client: Option<IAudioClient>,

    /// Probed format set, sorted; head is the auto-selection choice
    pub formats: Vec<WaveFormat>,
    pub caps: Caps,

    endpoint_volume: Option<IAudioEndpointVolume>,
    volume_callback: Option<IAudioEndpointVolumeCallback>,
    muted: Arc<AtomicBool>,
}

// SAFETY: the object is built on the device-manager MTA thread and handed to
// the I/O MTA thread; WASAPI interfaces are agile within the MTA
unsafe impl Send for EndpointObject {}

impl EndpointObject {
    pub fn new(
        device_id: String,
        class: EndpointClass,
        is_default: bool,
        exclusive: bool,
        device: Option<IMMDevice>,
        client: IAudioClient,
        dummy_client: Option<IAudioClient>,
        formats: Vec<WaveFormat>,
    ) -> EndpointObject {
        let caps = Caps::from_formats(&formats);
        EndpointObject {
            device_id,
            class,
            is_default,
            exclusive,
            device,
            client,
            dummy_client,
            formats,
            caps,
            endpoint_volume: None,
            volume_callback: None,
            muted: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Register the endpoint-volume mute monitor
    ///
    /// Failure is tolerated; mute monitoring then reports "not muted".
    pub fn register_mute_monitor(&mut self) -> WasapiResult<()> {
        let Some(device) = &self.device else {
            return Ok(());
        };

        // SAFETY: activating a COM interface on a valid device
        let endpoint_volume: IAudioEndpointVolume =
            match unsafe { device.Activate(CLSCTX_ALL, None) } {
                Ok(v) => v,
                Err(e) => {
                    tracing::warn!("Couldn't activate endpoint volume: {e}");
                    return Ok(());
                }
            };

        let callback: IAudioEndpointVolumeCallback = VolumeCallback {
            muted: Arc::downgrade(&self.muted),
        }
        .into();

        // SAFETY: valid interface and callback
        if let Err(e) = unsafe { endpoint_volume.RegisterControlChangeNotify(&callback) } {
            tracing::warn!("Couldn't register volume callback: {e}");
            return Ok(());
        }

        // SAFETY: valid interface
        if let Ok(muted) = unsafe { endpoint_volume.GetMute() } {
            self.muted.store(muted.as_bool(), Ordering::Release);
        }

        self.endpoint_volume = Some(endpoint_volume);
        self.volume_callback = Some(callback);

        Ok(())
    }

    /// Latched endpoint mute state
    pub fn endpoint_muted(&self) -> bool {
        self.muted.load(Ordering::Acquire)
    }

    /// Re-activate a fresh IAudioClient on the same device
    ///
    /// Exclusive-mode alignment recovery closes the rejected client and
    /// opens the device again.
    pub fn reactivate_client(&mut self) -> WasapiResult<()> {
        let Some(device) = &self.device else {
            return Err(crate::error::WasapiError::Activation(
                "no device to reactivate".into(),
            ));
        };
        // SAFETY: valid device interface
        let client: IAudioClient = unsafe { device.Activate(CLSCTX_ALL, None) }
            .map_err(|e| crate::error::WasapiError::api(e.code().0, "IMMDevice::Activate"))?;
        self.client = client;
        Ok(())
    }
}

impl Drop for EndpointObject {
    fn drop(&mut self) {
        if let (Some(volume), Some(callback)) = (&self.endpoint_volume, &self.volume_callback) {
            // SAFETY: interfaces registered together in register_mute_monitor
            unsafe {
                if let Err(e) = volume.UnregisterControlChangeNotify(callback) {
                    tracing::debug!(
                        "UnregisterControlChangeNotify: {}",
                        hresult::error_message(e.code().0)
                    );
                }
            }
        }
    }
}
