//! Device Enumeration and Hot-Plug Tracking
//!
//! A dedicated MTA thread owns the IMMDeviceEnumerator and the endpoint
//! notification registration. Public calls enqueue onto the thread and wait;
//! notification callbacks (which arrive on WASAPI-owned threads) only post a
//! message to the same queue.
//!
//! Raw endpoint notifications burst during device changes, so each one arms
//! a 100 ms deadline instead of firing directly; only the last event of a
//! burst publishes an update, carrying a fresh enumeration snapshot.

use std::time::{Duration, Instant};

use crossbeam_channel::{bounded, unbounded, RecvTimeoutError, Sender};
use wavebridge_core::{Caps, DataFlow};

use crate::activator::Activator;
use crate::com::ComGuard;
use crate::error::{WasapiError, WasapiResult};
use crate::hresult;
use crate::provider::{default_endpoint_id, EndpointEntry, FormFactor};
use crate::version;
use crate::wfx;

use windows::core::{implement, Interface, PCWSTR};
use windows::Win32::Media::Audio::{
    eAll, eCapture, eConsole, eRender, EDataFlow, ERole, IMMDevice, IMMDeviceCollection,
    IMMDeviceEnumerator, IMMEndpoint, IMMNotificationClient, IMMNotificationClient_Impl,
    MMDeviceEnumerator, DEVICE_STATE, DEVICE_STATE_ACTIVE,
};
use windows::Win32::Media::Audio::IAudioClient;
use windows::Win32::System::Com::{CoCreateInstance, CLSCTX_ALL, STGM_READ};
use windows::Win32::UI::Shell::PropertiesSystem::{IPropertyStore, PROPERTYKEY};

/// How long a notification burst may keep extending before the update fires
const COALESCE_WINDOW: Duration = Duration::from_millis(100);

/// Activation wait for the default-endpoint entries during a snapshot
const DEFAULT_ACTIVATION_TIMEOUT_MS: u32 = 10_000;

enum EnumCmd {
    Enumerate {
        reply: Sender<Vec<EndpointEntry>>,
    },
    SetNotify {
        active: bool,
        reply: Sender<bool>,
    },
    DeviceEvent,
    Shutdown,
}

#[implement(IMMNotificationClient)]
struct EndpointNotifier {
    tx: Sender<EnumCmd>,
}

impl EndpointNotifier_Impl {
    fn schedule(&self) {
        let _ = self.tx.send(EnumCmd::DeviceEvent);
    }

    fn log_id(&self, what: &str, device_id: &PCWSTR) {
        if tracing::enabled!(tracing::Level::TRACE) {
            // SAFETY: WASAPI hands a valid wide string for the call
            let id = unsafe { device_id.to_string() }.unwrap_or_default();
            tracing::trace!("{what}: {id}");
        }
    }
}

impl IMMNotificationClient_Impl for EndpointNotifier_Impl {
    fn OnDeviceStateChanged(
        &self,
        device_id: &PCWSTR,
        new_state: DEVICE_STATE,
    ) -> windows::core::Result<()> {
        self.log_id(&format!("state changed (0x{:x})", new_state.0), device_id);
        self.schedule();
        Ok(())
    }

    fn OnDeviceAdded(&self, device_id: &PCWSTR) -> windows::core::Result<()> {
        self.log_id("device added", device_id);
        self.schedule();
        Ok(())
    }

    fn OnDeviceRemoved(&self, device_id: &PCWSTR) -> windows::core::Result<()> {
        self.log_id("device removed", device_id);
        self.schedule();
        Ok(())
    }

    fn OnDefaultDeviceChanged(
        &self,
        _flow: EDataFlow,
        _role: ERole,
        device_id: &PCWSTR,
    ) -> windows::core::Result<()> {
        self.log_id("default changed", device_id);
        self.schedule();
        Ok(())
    }

    fn OnPropertyValueChanged(
        &self,
        _device_id: &PCWSTR,
        _key: &PROPERTYKEY,
    ) -> windows::core::Result<()> {
        Ok(())
    }
}

/// Handle to the enumerator thread
pub struct Enumerator {
    tx: Sender<EnumCmd>,
    thread: Option<std::thread::JoinHandle<()>>,
}

impl Enumerator {
    /// Spawn the enumerator thread
    ///
    /// `updated` fires (on the enumerator thread) with a fresh snapshot after
    /// each coalesced burst of endpoint notifications.
    pub fn new(
        updated: Box<dyn Fn(Vec<EndpointEntry>) + Send>,
    ) -> WasapiResult<Enumerator> {
        let (tx, rx) = unbounded::<EnumCmd>();
        let (ready_tx, ready_rx) = bounded::<bool>(1);
        let notify_tx = tx.clone();

        let thread = std::thread::Builder::new()
            .name("wavebridge-enumerator".into())
            .spawn(move || enumerator_thread(rx, notify_tx, ready_tx, updated))
            .map_err(|e| WasapiError::ThreadGone(e.to_string()))?;

        if ready_rx.recv() != Ok(true) {
            return Err(WasapiError::ComInit(
                "enumerator thread failed to start".into(),
            ));
        }

        Ok(Enumerator {
            tx,
            thread: Some(thread),
        })
    }

    /// Synchronous enumeration snapshot
    pub fn enumerate(&self) -> WasapiResult<Vec<EndpointEntry>> {
        let (reply_tx, reply_rx) = bounded(1);
        self.tx
            .send(EnumCmd::Enumerate { reply: reply_tx })
            .map_err(|_| WasapiError::ThreadGone("enumerator".into()))?;
        reply_rx
            .recv()
            .map_err(|_| WasapiError::ThreadGone("enumerator".into()))
    }

    /// Register or unregister the endpoint notification callback
    pub fn set_notifications(&self, active: bool) -> WasapiResult<bool> {
        let (reply_tx, reply_rx) = bounded(1);
        self.tx
            .send(EnumCmd::SetNotify {
                active,
                reply: reply_tx,
            })
            .map_err(|_| WasapiError::ThreadGone("enumerator".into()))?;
        reply_rx
            .recv()
            .map_err(|_| WasapiError::ThreadGone("enumerator".into()))
    }
}

impl Drop for Enumerator {
    fn drop(&mut self) {
        let _ = self.tx.send(EnumCmd::Shutdown);
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}

struct EnumeratorState {
    handle: IMMDeviceEnumerator,
    notifier: Option<IMMNotificationClient>,
    capture_activator: Option<Activator>,
    render_activator: Option<Activator>,
}

fn enumerator_thread(
    rx: crossbeam_channel::Receiver<EnumCmd>,
    notify_tx: Sender<EnumCmd>,
    ready_tx: Sender<bool>,
    updated: Box<dyn Fn(Vec<EndpointEntry>) + Send>,
) {
    let _com = match ComGuard::new() {
        Ok(c) => c,
        Err(e) => {
            tracing::error!("Enumerator thread COM init failed: {e}");
            let _ = ready_tx.send(false);
            return;
        }
    };

    // SAFETY: plain COM instantiation on this MTA thread
    let handle: IMMDeviceEnumerator =
        match unsafe { CoCreateInstance(&MMDeviceEnumerator, None, CLSCTX_ALL) } {
            Ok(h) => h,
            Err(e) => {
                tracing::error!("Failed to create MMDeviceEnumerator: {e}");
                let _ = ready_tx.send(false);
                return;
            }
        };

    let mut state = EnumeratorState {
        handle,
        notifier: None,
        capture_activator: None,
        render_activator: None,
    };

    // Default-endpoint entries ride on activated default clients; kick the
    // activations off once, the results are sticky
    if version::can_automatic_stream_routing() {
        if let Ok(activator) = Activator::new(default_endpoint_id(DataFlow::Capture), None) {
            activator.activate_async();
            state.capture_activator = Some(activator);
        }
        if let Ok(activator) = Activator::new(default_endpoint_id(DataFlow::Render), None) {
            activator.activate_async();
            state.render_activator = Some(activator);
        }
    }

    let _ = ready_tx.send(true);
    tracing::info!("Enumerator thread running");

    let mut deadline: Option<Instant> = None;
    loop {
        let cmd = match deadline {
            Some(d) => match rx.recv_deadline(d) {
                Ok(cmd) => Some(cmd),
                Err(RecvTimeoutError::Timeout) => {
                    deadline = None;
                    tracing::debug!("Notification burst settled, publishing update");
                    updated(snapshot(&state));
                    continue;
                }
                Err(RecvTimeoutError::Disconnected) => break,
            },
            None => match rx.recv() {
                Ok(cmd) => Some(cmd),
                Err(_) => break,
            },
        };

        match cmd {
            Some(EnumCmd::Enumerate { reply }) => {
                let _ = reply.send(snapshot(&state));
            }
            Some(EnumCmd::SetNotify { active, reply }) => {
                let _ = reply.send(set_notifications(&mut state, &notify_tx, active));
            }
            Some(EnumCmd::DeviceEvent) => {
                deadline = Some(Instant::now() + COALESCE_WINDOW);
            }
            Some(EnumCmd::Shutdown) | None => break,
        }
    }

    // Release interfaces on the apartment that created them
    if let Some(notifier) = state.notifier.take() {
        // SAFETY: registered on this thread
        unsafe {
            let _ = state.handle.UnregisterEndpointNotificationCallback(&notifier);
        }
    }

    tracing::info!("Enumerator thread exiting");
}

fn set_notifications(
    state: &mut EnumeratorState,
    notify_tx: &Sender<EnumCmd>,
    active: bool,
) -> bool {
    if active {
        if state.notifier.is_some() {
            return true;
        }
        let client: IMMNotificationClient = EndpointNotifier {
            tx: notify_tx.clone(),
        }
        .into();
        // SAFETY: valid enumerator and callback interfaces
        match unsafe { state.handle.RegisterEndpointNotificationCallback(&client) } {
            Ok(()) => {
                tracing::debug!("Registered endpoint notifications");
                state.notifier = Some(client);
                true
            }
            Err(e) => {
                tracing::error!("Couldn't register endpoint notifications: {e}");
                false
            }
        }
    } else {
        if let Some(notifier) = state.notifier.take() {
            // SAFETY: was registered above
            unsafe {
                let _ = state.handle.UnregisterEndpointNotificationCallback(&notifier);
            }
            tracing::debug!("Unregistered endpoint notifications");
        }
        true
    }
}

/// Enumerate with retry: a device yanked mid-snapshot invalidates the
/// collection, so try again a few times before settling
fn snapshot(state: &EnumeratorState) -> Vec<EndpointEntry> {
    const NUM_RETRY: usize = 5;

    let mut entries = Vec::new();
    for attempt in 0..NUM_RETRY {
        entries.clear();

        // SAFETY: valid enumerator interface
        let collection = match unsafe {
            state.handle.EnumAudioEndpoints(eAll, DEVICE_STATE_ACTIVE)
        } {
            Ok(c) => c,
            Err(e) => {
                tracing::warn!("EnumAudioEndpoints failed: {e}");
                return entries;
            }
        };

        let is_last = attempt + 1 == NUM_RETRY;
        if enumerate_into(state, &collection, is_last, &mut entries) {
            break;
        }

        tracing::debug!("Device list changed mid-enumeration, retrying");
        std::thread::sleep(Duration::from_millis(50));
    }

    entries
}

fn enumerate_into(
    state: &EnumeratorState,
    collection: &IMMDeviceCollection,
    ignore_error: bool,
    entries: &mut Vec<EndpointEntry>,
) -> bool {
    // SAFETY: valid collection
    let count = match unsafe { collection.GetCount() } {
        Ok(c) => c,
        Err(_) => return true,
    };

    push_default_entry(state, DataFlow::Capture, entries);
    push_default_entry(state, DataFlow::Render, entries);

    for i in 0..count {
        // SAFETY: index bounded by GetCount
        let Ok(device) = (unsafe { collection.Item(i) }) else {
            continue;
        };

        let Ok(endpoint) = device.cast::<IMMEndpoint>() else {
            continue;
        };
        // SAFETY: valid endpoint interface
        let Ok(flow) = (unsafe { endpoint.GetDataFlow() }) else {
            continue;
        };
        let flow = if flow == eRender {
            DataFlow::Render
        } else {
            DataFlow::Capture
        };

        // SAFETY: valid device interface
        let Ok(store) = (unsafe { device.OpenPropertyStore(STGM_READ) }) else {
            continue;
        };
        let Some(name) = wfx::property_string(&store, &wfx::PKEY_DEVICE_FRIENDLY_NAME) else {
            continue;
        };

        // SAFETY: GetId returns a CoTaskMem wide string
        let Some(device_id) = (unsafe {
            match device.GetId() {
                Ok(pwstr) => wfx::take_pwstr(pwstr),
                Err(_) => None,
            }
        }) else {
            continue;
        };

        // SAFETY: valid device interface
        let client: Option<IAudioClient> = match unsafe { device.Activate(CLSCTX_ALL, None) } {
            Ok(c) => Some(c),
            Err(e) => {
                // Active device failing to activate means the list changed
                // under us; a retry gets a consistent snapshot
                tracing::debug!("Couldn't activate {device_id} ({name}): {e}");
                if !ignore_error && e.code().0 == hresult::AUDCLNT_E_DEVICE_INVALIDATED {
                    return false;
                }
                None
            }
        };

        let Some(client) = client else {
            continue;
        };

        let caps = Caps::from_formats(&wfx::shared_mode_formats(&client));
        if caps.is_empty() {
            continue;
        }

        let (form_factor, enumerator_name) = probe_props(&store);

        entries.push(EndpointEntry {
            device_id,
            device_name: name,
            flow,
            is_default: false,
            caps,
            actual_device_id: None,
            actual_device_name: None,
            form_factor,
            enumerator_name,
        });
    }

    tracing::debug!("Enumerated {} endpoints", entries.len());
    true
}

fn probe_props(store: &IPropertyStore) -> (FormFactor, String) {
    let form_factor = wfx::property_u32(store, &wfx::PKEY_AUDIO_ENDPOINT_FORM_FACTOR)
        .map(FormFactor::from_u32)
        .unwrap_or(FormFactor::Unknown);
    let enumerator_name = wfx::property_string(store, &wfx::PKEY_DEVICE_ENUMERATOR_NAME)
        .unwrap_or_else(|| "UNKNOWN".into());
    (form_factor, enumerator_name)
}

/// Default capture / default render virtual entries
fn push_default_entry(state: &EnumeratorState, flow: DataFlow, entries: &mut Vec<EndpointEntry>) {
    let activator = match flow {
        DataFlow::Capture => state.capture_activator.as_ref(),
        DataFlow::Render => state.render_activator.as_ref(),
    };
    let Some(activator) = activator else {
        return;
    };
    let Ok(client) = activator.get_client(DEFAULT_ACTIVATION_TIMEOUT_MS) else {
        return;
    };

    let caps = Caps::from_formats(&wfx::shared_mode_formats(&client));
    if caps.is_empty() {
        return;
    }

    let mut entry = EndpointEntry {
        device_id: default_endpoint_id(flow).to_string(),
        device_name: match flow {
            DataFlow::Capture => "Default Audio Capture Device".to_string(),
            DataFlow::Render => "Default Audio Render Device".to_string(),
        },
        flow,
        is_default: true,
        caps,
        actual_device_id: None,
        actual_device_name: None,
        form_factor: FormFactor::Unknown,
        enumerator_name: "UNKNOWN".into(),
    };

    // Decorate with the endpoint currently behind the virtual default id
    let os_flow = match flow {
        DataFlow::Capture => eCapture,
        DataFlow::Render => eRender,
    };
    // SAFETY: valid enumerator interface
    if let Ok(device) = unsafe { state.handle.GetDefaultAudioEndpoint(os_flow, eConsole) } {
        probe_actual_device(&device, &mut entry);
    }

    entries.push(entry);
}

fn probe_actual_device(device: &IMMDevice, entry: &mut EndpointEntry) {
    // SAFETY: GetId returns a CoTaskMem wide string
    entry.actual_device_id = unsafe {
        match device.GetId() {
            Ok(pwstr) => wfx::take_pwstr(pwstr),
            Err(_) => None,
        }
    };

    // SAFETY: valid device interface
    if let Ok(store) = unsafe { device.OpenPropertyStore(STGM_READ) } {
        entry.actual_device_name = wfx::property_string(&store, &wfx::PKEY_DEVICE_FRIENDLY_NAME);
        let (form_factor, enumerator_name) = probe_props(&store);
        entry.form_factor = form_factor;
        entry.enumerator_name = enumerator_name;
    }
}
