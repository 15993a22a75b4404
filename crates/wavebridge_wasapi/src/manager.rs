//! Device Manager
//!
//! A process-wide COM thread that serialises context creation. Activating an
//! endpoint and negotiating formats can take long; during open/acquire the
//! caller waits synchronously, while a live device swap delegates creation
//! here and receives the finished context back through the target stream's
//! command queue as an update.

use std::sync::OnceLock;

use crossbeam_channel::{bounded, unbounded, Sender};

use wavebridge_core::{DataFlow, EndpointClass, WaveFormat};

use crate::activator::{Activator, ProcessLoopbackParams, VIRTUAL_AUDIO_DEVICE_PROCESS_LOOPBACK};
use crate::com::ComGuard;
use crate::ctx::StreamCtx;
use crate::endpoint::EndpointObject;
use crate::provider::{default_endpoint_id, is_default_endpoint_id};
use crate::rbuf::{Command, RbufHandle};
use crate::version;
use crate::wfx;

use widestring::U16CString;
use windows::Win32::Media::Audio::{
    eCapture, eConsole, eRender, IAudioClient, IMMDevice, IMMDeviceEnumerator, MMDeviceEnumerator,
};
use windows::Win32::System::Com::{CoCreateInstance, CLSCTX_ALL, STGM_READ};
use windows::Win32::System::Threading::INFINITE;

/// Everything needed to build one stream context
#[derive(Debug, Clone)]
pub struct CtxDesc {
    pub device_id: String,
    pub class: EndpointClass,
    pub pid: u32,
    pub buffer_time_us: i64,
    pub latency_time_us: i64,
    pub low_latency: bool,
    pub exclusive: bool,
    /// Pinned format; when set the context is fully initialised
    pub selected: Option<WaveFormat>,
}

enum ManagerCmd {
    Create {
        desc: CtxDesc,
        reply: Sender<Option<StreamCtx>>,
    },
    CreateAsync {
        desc: CtxDesc,
        target: RbufHandle,
    },
}

/// Handle to the manager thread
pub struct DeviceManager {
    tx: Sender<ManagerCmd>,
}

impl DeviceManager {
    /// The process-wide instance
    pub fn global() -> &'static DeviceManager {
        static INSTANCE: OnceLock<DeviceManager> = OnceLock::new();
        INSTANCE.get_or_init(|| {
            let (tx, rx) = unbounded();
            std::thread::Builder::new()
                .name("wavebridge-device-manager".into())
                .spawn(move || manager_thread(rx))
                .expect("spawn device manager thread");
            DeviceManager { tx }
        })
    }

    /// Build a context synchronously; `None` on failure
    pub fn create_ctx(&self, desc: CtxDesc) -> Option<StreamCtx> {
        let (reply_tx, reply_rx) = bounded(1);
        self.tx
            .send(ManagerCmd::Create {
                desc,
                reply: reply_tx,
            })
            .ok()?;
        reply_rx.recv().ok().flatten()
    }

    /// Build a context in the background; the result re-enters the target
    /// stream as a device update, successful or not
    pub fn create_ctx_async(&self, desc: CtxDesc, target: RbufHandle) {
        let _ = self.tx.send(ManagerCmd::CreateAsync { desc, target });
    }
}

fn manager_thread(rx: crossbeam_channel::Receiver<ManagerCmd>) {
    let _com = match ComGuard::new() {
        Ok(c) => c,
        Err(e) => {
            tracing::error!("Device manager COM init failed: {e}");
            return;
        }
    };

    // SAFETY: plain COM instantiation on this MTA thread
    let enumerator: Option<IMMDeviceEnumerator> =
        match unsafe { CoCreateInstance(&MMDeviceEnumerator, None, CLSCTX_ALL) } {
            Ok(e) => Some(e),
            Err(e) => {
                tracing::error!("Failed to create MMDeviceEnumerator: {e}");
                None
            }
        };

    tracing::info!("Device manager thread running");

    while let Ok(cmd) = rx.recv() {
        match cmd {
            ManagerCmd::Create { desc, reply } => {
                let ctx = enumerator.as_ref().and_then(|e| build_ctx(e, desc));
                let _ = reply.send(ctx);
            }
            ManagerCmd::CreateAsync { desc, target } => {
                tracing::debug!("Creating new context asynchronously");
                let device_id = desc.device_id.clone();
                let ctx = enumerator.as_ref().and_then(|e| build_ctx(e, desc));

                // Hand the result to the stream and wait for the swap, so
                // queued requests stay serialised
                let (done_tx, done_rx) = bounded(1);
                if target
                    .push(Command::UpdateDevice {
                        device_id,
                        ctx: ctx.map(Box::new),
                        done: done_tx,
                    })
                    .is_ok()
                {
                    let _ = done_rx.recv();
                }
            }
        }
    }

    tracing::info!("Device manager thread exiting");
}

/// Activation + probing for one context
fn build_ctx(enumerator: &IMMDeviceEnumerator, mut desc: CtxDesc) -> Option<StreamCtx> {
    if (desc.class.is_loopback() || desc.class.is_process_loopback()) && desc.exclusive {
        tracing::warn!("Loopback + exclusive is not a supported configuration");
        desc.exclusive = false;
    }

    let mut device: Option<IMMDevice> = None;
    let mut activator: Option<Activator> = None;
    let mut dummy_activator: Option<Activator> = None;
    let mut is_default = false;

    match desc.class {
        EndpointClass::Capture => {
            if is_default_endpoint_id(&desc.device_id, DataFlow::Capture) {
                if version::can_automatic_stream_routing() && !desc.exclusive {
                    tracing::debug!("Activating default capture endpoint");
                    activator =
                        Activator::new(default_endpoint_id(DataFlow::Capture), None).ok();
                }
                device = get_default_endpoint(enumerator, DataFlow::Capture);
            } else {
                device = get_endpoint(enumerator, &desc.device_id);
            }
        }
        EndpointClass::Render | EndpointClass::LoopbackCapture => {
            if is_default_endpoint_id(&desc.device_id, DataFlow::Render) {
                if version::can_automatic_stream_routing() && !desc.exclusive {
                    tracing::debug!("Activating default render endpoint");
                    activator = Activator::new(default_endpoint_id(DataFlow::Render), None).ok();

                    if desc.class.is_loopback() {
                        // Second stream feeds silence so loopback ticks on
                        // idle endpoints
                        dummy_activator =
                            Activator::new(default_endpoint_id(DataFlow::Render), None).ok();
                    }
                }
                device = get_default_endpoint(enumerator, DataFlow::Render);
            } else {
                device = get_endpoint(enumerator, &desc.device_id);
            }
        }
        EndpointClass::IncludeProcessLoopbackCapture
        | EndpointClass::ExcludeProcessLoopbackCapture => {
            if !version::can_process_loopback() {
                tracing::error!("Process loopback not supported on this OS build");
                return None;
            }
            tracing::debug!("Activating process loopback capture (pid {})", desc.pid);
            activator = Activator::new(
                VIRTUAL_AUDIO_DEVICE_PROCESS_LOOPBACK,
                Some(ProcessLoopbackParams {
                    target_pid: desc.pid,
                    include_tree: desc.class == EndpointClass::IncludeProcessLoopbackCapture,
                }),
            )
            .ok();
        }
    }

    let mut client: Option<IAudioClient> = None;
    let mut dummy_client: Option<IAudioClient> = None;

    if let Some(activator) = &activator {
        is_default = true;
        activator.activate_async();
        client = activator.get_client(INFINITE).ok();

        if let Some(dummy_activator) = &dummy_activator {
            dummy_activator.activate_async();
            dummy_client = dummy_activator.get_client(INFINITE).ok();

            if dummy_client.is_none() {
                tracing::warn!("Couldn't activate silence-feed client");
                client = None;
            }
        }
    }

    if client.is_none() {
        // Auto-routing activation failed (or was never eligible); open the
        // concrete endpoint, dropping default-identity routing
        is_default = false;
        dummy_client = None;

        let dev = device.as_ref()?;
        // SAFETY: valid device interface
        client = match unsafe { dev.Activate(CLSCTX_ALL, None) } {
            Ok(c) => Some(c),
            Err(e) => {
                tracing::warn!("Couldn't activate IAudioClient: {e}");
                return None;
            }
        };

        if desc.class.is_loopback() {
            // SAFETY: valid device interface
            dummy_client = match unsafe { dev.Activate(CLSCTX_ALL, None) } {
                Ok(c) => Some(c),
                Err(e) => {
                    tracing::warn!("Couldn't activate silence-feed client: {e}");
                    return None;
                }
            };
        }
    }

    let client = client?;

    let mut formats = Vec::new();
    if desc.exclusive {
        let Some(dev) = device.as_ref() else {
            tracing::warn!("Exclusive mode needs a concrete device");
            return None;
        };
        // SAFETY: valid device interface
        match unsafe { dev.OpenPropertyStore(STGM_READ) } {
            Ok(store) => {
                formats = wfx::exclusive_mode_formats(&client, &store);
            }
            Err(e) => {
                tracing::warn!("Couldn't open property store: {e}");
                return None;
            }
        }
        if formats.is_empty() {
            tracing::warn!("Couldn't get exclusive mode formats, using shared mode");
            desc.exclusive = false;
        }
    }

    if !desc.exclusive {
        formats = wfx::shared_mode_formats(&client);
        if formats.is_empty() {
            if desc.class.is_process_loopback() {
                // The virtual device may not report a mix format
                formats.push(WaveFormat::default_mix());
            } else {
                tracing::error!("Couldn't find supported formats");
                return None;
            }
        }
    }

    let object = EndpointObject::new(
        desc.device_id.clone(),
        desc.class,
        is_default,
        desc.exclusive,
        device,
        client,
        dummy_client,
        formats,
    );

    if object.caps.is_empty() {
        tracing::error!("No usable capability set for {}", desc.device_id);
        return None;
    }

    let mut ctx = StreamCtx::new(
        object,
        desc.low_latency,
        desc.buffer_time_us,
        desc.latency_time_us,
    )
    .ok()?;

    match desc.selected {
        Some(format) => match ctx.init(&format) {
            Ok(()) => Some(ctx),
            Err(e) => {
                tracing::warn!("Context init failed: {e}");
                None
            }
        },
        // Format not fixated yet; hand back the bare context
        None => Some(ctx),
    }
}

fn get_default_endpoint(enumerator: &IMMDeviceEnumerator, flow: DataFlow) -> Option<IMMDevice> {
    let os_flow = match flow {
        DataFlow::Capture => eCapture,
        DataFlow::Render => eRender,
    };
    // SAFETY: valid enumerator interface
    match unsafe { enumerator.GetDefaultAudioEndpoint(os_flow, eConsole) } {
        Ok(d) => Some(d),
        Err(e) => {
            tracing::warn!("No default endpoint for {flow:?}: {e}");
            None
        }
    }
}

fn get_endpoint(enumerator: &IMMDeviceEnumerator, device_id: &str) -> Option<IMMDevice> {
    let wide = U16CString::from_str(device_id).ok()?;
    // SAFETY: NUL-terminated wide string outlives the call
    match unsafe { enumerator.GetDevice(windows::core::PCWSTR(wide.as_ptr())) } {
        Ok(d) => Some(d),
        Err(e) => {
            tracing::warn!("Couldn't open endpoint {device_id}: {e}");
            None
        }
    }
}
