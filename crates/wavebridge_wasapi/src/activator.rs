//! Asynchronous Endpoint Activation
//!
//! Single-shot wrapper around `ActivateAudioInterfaceAsync`. The completion
//! callback fires on a WASAPI-owned thread; it only latches the HRESULT and
//! the activated client and signals a manual-reset event, so a consumer can
//! block on `get_client` from any thread.
//!
//! Process-loopback activation passes an activation-parameters blob through
//! a PROPVARIANT. The parameter types are only declared in recent SDK
//! headers, so private copies are carried here and the blob is marshalled as
//! raw bytes.

use std::sync::atomic::{AtomicI32, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use widestring::U16CString;

use crate::com::Event;
use crate::error::{WasapiError, WasapiResult};
use crate::hresult;

use windows::core::{implement, Interface, Ref};
use windows::Win32::Media::Audio::{
    ActivateAudioInterfaceAsync, IActivateAudioInterfaceAsyncOperation,
    IActivateAudioInterfaceCompletionHandler, IActivateAudioInterfaceCompletionHandler_Impl,
    IAudioClient,
};

/// Virtual activation path for process-loopback capture
pub const VIRTUAL_AUDIO_DEVICE_PROCESS_LOOPBACK: &str = "VAD\\Process_Loopback";

const ACTIVATION_TYPE_PROCESS_LOOPBACK: i32 = 1;
const LOOPBACK_MODE_INCLUDE_TARGET_PROCESS_TREE: i32 = 0;
const LOOPBACK_MODE_EXCLUDE_TARGET_PROCESS_TREE: i32 = 1;

/// Private copy of AUDIOCLIENT_PROCESS_LOOPBACK_PARAMS
#[repr(C)]
struct RawProcessLoopbackParams {
    target_process_id: u32,
    process_loopback_mode: i32,
}

/// Private copy of AUDIOCLIENT_ACTIVATION_PARAMS
#[repr(C)]
struct RawActivationParams {
    activation_type: i32,
    process_loopback_params: RawProcessLoopbackParams,
}

/// Raw PROPVARIANT layout for VT_BLOB on x64
#[repr(C)]
struct PropVariantBlob {
    vt: u16,
    reserved1: u16,
    reserved2: u16,
    reserved3: u16,
    cb_size: u32,
    _pad: u32,
    p_blob_data: *const u8,
}

const VT_BLOB: u16 = 0x0041;

/// Process-loopback activation request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProcessLoopbackParams {
    pub target_pid: u32,
    pub include_tree: bool,
}

struct ActivationShared {
    event: Event,
    result: AtomicI32,
    client: Mutex<Option<IAudioClient>>,
}

#[implement(IActivateAudioInterfaceCompletionHandler)]
struct ActivationCallback {
    shared: Arc<ActivationShared>,
}

impl IActivateAudioInterfaceCompletionHandler_Impl for ActivationCallback_Impl {
    fn ActivateCompleted(
        &self,
        operation: Ref<'_, IActivateAudioInterfaceAsyncOperation>,
    ) -> windows::core::Result<()> {
        let shared = &self.shared;

        let mut hr = windows::core::HRESULT(hresult::E_FAIL);
        let mut activated: Option<windows::core::IUnknown> = None;

        if let Some(op) = operation.as_ref() {
            // SAFETY: out params are plain writes by the operation object
            if let Err(e) = unsafe { op.GetActivateResult(&mut hr, &mut activated) } {
                hr = e.code();
            }
        }

        if hr.is_ok() {
            match activated.and_then(|unk| unk.cast::<IAudioClient>().ok()) {
                Some(client) => *shared.client.lock() = Some(client),
                None => hr = windows::core::HRESULT(hresult::E_NOINTERFACE),
            }
        }

        tracing::debug!("Activation result 0x{:08x}", hr.0 as u32);
        shared.result.store(hr.0, Ordering::Release);
        shared.event.set();

        Ok(())
    }
}

/// One activation attempt; created per attempt and dropped after the client
/// has been retrieved (or the attempt failed)
pub struct Activator {
    shared: Arc<ActivationShared>,
    device_id: U16CString,
    /// Boxed so the blob pointer stays stable for the call
    params: Option<Box<RawActivationParams>>,
}

impl Activator {
    pub fn new(device_id: &str, params: Option<ProcessLoopbackParams>) -> WasapiResult<Activator> {
        let device_id = U16CString::from_str(device_id)
            .map_err(|_| WasapiError::Activation("device id contains NUL".into()))?;

        let params = params.map(|p| {
            Box::new(RawActivationParams {
                activation_type: ACTIVATION_TYPE_PROCESS_LOOPBACK,
                process_loopback_params: RawProcessLoopbackParams {
                    target_process_id: p.target_pid,
                    process_loopback_mode: if p.include_tree {
                        LOOPBACK_MODE_INCLUDE_TARGET_PROCESS_TREE
                    } else {
                        LOOPBACK_MODE_EXCLUDE_TARGET_PROCESS_TREE
                    },
                },
            })
        });

        Ok(Activator {
            shared: Arc::new(ActivationShared {
                event: Event::manual_reset()?,
                result: AtomicI32::new(hresult::E_FAIL),
                client: Mutex::new(None),
            }),
            device_id,
            params,
        })
    }

    /// Issue the asynchronous activation; a failed issue latches the
    /// HRESULT and signals immediately so `get_client` never hangs
    pub fn activate_async(&self) -> i32 {
        let handler: IActivateAudioInterfaceCompletionHandler = ActivationCallback {
            shared: Arc::clone(&self.shared),
        }
        .into();

        let blob = self.params.as_ref().map(|p| PropVariantBlob {
            vt: VT_BLOB,
            reserved1: 0,
            reserved2: 0,
            reserved3: 0,
            cb_size: std::mem::size_of::<RawActivationParams>() as u32,
            _pad: 0,
            p_blob_data: p.as_ref() as *const RawActivationParams as *const u8,
        });

        // SAFETY: device id and blob storage outlive the call; the returned
        // operation keeps the handler alive until completion
        let result = unsafe {
            ActivateAudioInterfaceAsync(
                windows::core::PCWSTR(self.device_id.as_ptr()),
                &IAudioClient::IID,
                blob.as_ref()
                    .map(|b| b as *const PropVariantBlob as *const windows::core::PROPVARIANT),
                &handler,
            )
        };

        match result {
            Ok(_op) => hresult::S_OK,
            Err(e) => {
                let hr = e.code().0;
                hresult::check(hr, "ActivateAudioInterfaceAsync");
                self.shared.result.store(hr, Ordering::Release);
                self.shared.event.set();
                hr
            }
        }
    }

    /// Block until the activation completes and take the client
    ///
    /// The latched HRESULT is sticky: repeated calls return the same
    /// failure. A timeout maps to the activation error.
    pub fn get_client(&self, timeout_ms: u32) -> WasapiResult<IAudioClient> {
        if !self.shared.event.wait(timeout_ms) {
            return Err(WasapiError::Activation("activation timed out".into()));
        }

        let hr = self.shared.result.load(Ordering::Acquire);
        if hresult::failed(hr) {
            return Err(WasapiError::api(hr, "endpoint activation"));
        }

        self.shared
            .client
            .lock()
            .clone()
            .ok_or_else(|| WasapiError::Activation("no client produced".into()))
    }

    /// Wait for completion without taking the client
    pub fn wait(&self, timeout_ms: u32) -> bool {
        self.shared.event.wait(timeout_ms)
    }
}
