//! Device Provider
//!
//! Materialises enumerated endpoints as pipeline devices: one source per
//! capture endpoint, one sink plus one loopback source per render endpoint.
//! Keeps a cached list and, on enumerator updates, diffs by property
//! equality into added/removed/changed events.
//!
//! A default-flagged entry that maps to a default-flagged entry of the same
//! class becomes a single `Changed` event instead of a remove/add pair, so
//! "the default device" keeps its identity while the hardware behind it
//! moves.
//!
//! The types and the diff are pure; only the provider struct at the bottom
//! touches the OS.

use serde::Serialize;

use wavebridge_core::{Caps, DataFlow, EndpointClass};

/// Virtual endpoint ids WASAPI accepts for "whatever is default right now"
/// (DEVINTERFACE_AUDIO_CAPTURE / DEVINTERFACE_AUDIO_RENDER)
const DEFAULT_CAPTURE_ID: &str = "{2EEF81BE-33FA-4800-9670-1CD474972C3F}";
const DEFAULT_RENDER_ID: &str = "{E6327CAD-DCEC-4949-AE8A-991E976A79D2}";

/// Identifier denoting the system default endpoint for a flow
pub fn default_endpoint_id(flow: DataFlow) -> &'static str {
    match flow {
        DataFlow::Capture => DEFAULT_CAPTURE_ID,
        DataFlow::Render => DEFAULT_RENDER_ID,
    }
}

/// Whether an identifier selects the default endpoint (empty or the virtual
/// id, compared case-insensitively)
pub fn is_default_endpoint_id(id: &str, flow: DataFlow) -> bool {
    id.is_empty() || id.eq_ignore_ascii_case(default_endpoint_id(flow))
}

/// Endpoint form factor from the property store
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum FormFactor {
    RemoteNetworkDevice,
    Speakers,
    LineLevel,
    Headphones,
    Microphone,
    Headset,
    Handset,
    UnknownDigitalPassthrough,
    Spdif,
    DigitalAudioDisplayDevice,
    Unknown,
}

impl FormFactor {
    pub fn from_u32(value: u32) -> FormFactor {
        match value {
            0 => FormFactor::RemoteNetworkDevice,
            1 => FormFactor::Speakers,
            2 => FormFactor::LineLevel,
            3 => FormFactor::Headphones,
            4 => FormFactor::Microphone,
            5 => FormFactor::Headset,
            6 => FormFactor::Handset,
            7 => FormFactor::UnknownDigitalPassthrough,
            8 => FormFactor::Spdif,
            9 => FormFactor::DigitalAudioDisplayDevice,
            _ => FormFactor::Unknown,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            FormFactor::RemoteNetworkDevice => "RemoteNetworkDevice",
            FormFactor::Speakers => "Speakers",
            FormFactor::LineLevel => "LineLevel",
            FormFactor::Headphones => "Headphones",
            FormFactor::Microphone => "Microphone",
            FormFactor::Headset => "Headset",
            FormFactor::Handset => "Handset",
            FormFactor::UnknownDigitalPassthrough => "UnknownDigitalPassthrough",
            FormFactor::Spdif => "SPDIF",
            FormFactor::DigitalAudioDisplayDevice => "DigitalAudioDisplayDevice",
            FormFactor::Unknown => "UnknownFormFactor",
        }
    }
}

/// One enumerated endpoint
#[derive(Debug, Clone, PartialEq)]
pub struct EndpointEntry {
    pub device_id: String,
    pub device_name: String,
    pub flow: DataFlow,
    pub is_default: bool,
    pub caps: Caps,
    /// Endpoint currently behind a default entry
    pub actual_device_id: Option<String>,
    pub actual_device_name: Option<String>,
    pub form_factor: FormFactor,
    pub enumerator_name: String,
}

/// Pipeline-facing device class
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum DeviceClass {
    Source,
    Sink,
    LoopbackSource,
}

impl DeviceClass {
    pub fn as_str(self) -> &'static str {
        match self {
            // Loopback exposes the render endpoint as a source
            DeviceClass::Source | DeviceClass::LoopbackSource => "Audio/Source",
            DeviceClass::Sink => "Audio/Sink",
        }
    }
}

/// Property structure carried by each published device
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DeviceProps {
    pub api: &'static str,
    pub id: String,
    pub is_default: bool,
    pub description: String,
    pub form_factor: FormFactor,
    pub form_factor_name: &'static str,
    pub enumerator_name: String,
    pub loopback: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub actual_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub actual_name: Option<String>,
}

/// A published pipeline device
#[derive(Debug, Clone, PartialEq)]
pub struct Device {
    pub display_name: String,
    pub class: DeviceClass,
    pub endpoint_class: EndpointClass,
    pub is_default: bool,
    pub caps: Caps,
    pub props: DeviceProps,
}

impl Device {
    fn from_entry(entry: &EndpointEntry, class: DeviceClass) -> Device {
        let endpoint_class = match class {
            DeviceClass::Source => EndpointClass::Capture,
            DeviceClass::Sink => EndpointClass::Render,
            DeviceClass::LoopbackSource => EndpointClass::LoopbackCapture,
        };

        Device {
            display_name: entry.device_name.clone(),
            class,
            endpoint_class,
            is_default: entry.is_default,
            caps: entry.caps.clone(),
            props: DeviceProps {
                api: "wavebridge",
                id: entry.device_id.clone(),
                is_default: entry.is_default,
                description: entry.device_name.clone(),
                form_factor: entry.form_factor,
                form_factor_name: entry.form_factor.as_str(),
                enumerator_name: entry.enumerator_name.clone(),
                loopback: class == DeviceClass::LoopbackSource,
                actual_id: entry.actual_device_id.clone(),
                actual_name: entry.actual_device_name.clone(),
            },
        }
    }
}

/// Change events emitted on enumerator updates
#[derive(Debug, Clone, PartialEq)]
pub enum DeviceEvent {
    Added(Device),
    Removed(Device),
    /// A default-flagged device re-bound to different hardware
    Changed { new: Device, old: Device },
}

/// Materialise pipeline devices from an enumeration snapshot
pub fn devices_from_entries(entries: &[EndpointEntry]) -> Vec<Device> {
    let mut devices = Vec::new();
    for entry in entries {
        match entry.flow {
            DataFlow::Capture => {
                devices.push(Device::from_entry(entry, DeviceClass::Source));
            }
            DataFlow::Render => {
                devices.push(Device::from_entry(entry, DeviceClass::Sink));
                devices.push(Device::from_entry(entry, DeviceClass::LoopbackSource));
            }
        }
    }
    devices
}

/// Diff two device lists by property equality
///
/// Default-flagged removals pair up with default-flagged additions of the
/// same class into `Changed` events; everything else becomes add/remove.
pub fn diff_devices(prev: &[Device], new: &[Device]) -> Vec<DeviceEvent> {
    let mut to_add: Vec<&Device> = new
        .iter()
        .filter(|d| !prev.iter().any(|p| p.props == d.props))
        .collect();
    let to_remove: Vec<&Device> = prev
        .iter()
        .filter(|d| !new.iter().any(|n| n.props == d.props))
        .collect();

    let mut events = Vec::new();
    let mut removed_for_change: Vec<usize> = Vec::new();

    for (idx, old) in to_remove.iter().enumerate() {
        if !old.is_default {
            continue;
        }

        if let Some(pos) = to_add
            .iter()
            .position(|n| n.is_default && n.class == old.class)
        {
            let new_dev = to_add.remove(pos);
            events.push(DeviceEvent::Changed {
                new: new_dev.clone(),
                old: (*old).clone(),
            });
            removed_for_change.push(idx);
        }
    }

    for (idx, old) in to_remove.iter().enumerate() {
        if !removed_for_change.contains(&idx) {
            events.push(DeviceEvent::Removed((*old).clone()));
        }
    }

    for added in to_add {
        events.push(DeviceEvent::Added(added.clone()));
    }

    events
}

// ============================================================================
// OS-backed provider
// ============================================================================

#[cfg(target_os = "windows")]
pub use os::DeviceProvider;

#[cfg(target_os = "windows")]
mod os {
    use super::*;
    use crate::enumerator::Enumerator;
    use crate::error::WasapiResult;
    use crossbeam_channel::Sender;
    use parking_lot::Mutex;
    use std::sync::Arc;

    /// Publishes enumerated endpoints and change events
    pub struct DeviceProvider {
        enumerator: Enumerator,
        cached: Arc<Mutex<Vec<Device>>>,
    }

    impl DeviceProvider {
        /// Create the provider; `events` receives the diff of every
        /// coalesced enumerator update once `start()` has been called
        pub fn new(events: Sender<DeviceEvent>) -> WasapiResult<DeviceProvider> {
            let cached = Arc::new(Mutex::new(Vec::new()));
            let cache_for_updates = Arc::clone(&cached);

            let enumerator = Enumerator::new(Box::new(move |entries| {
                let new_devices = devices_from_entries(&entries);
                let mut cache = cache_for_updates.lock();
                for event in diff_devices(&cache, &new_devices) {
                    let _ = events.send(event);
                }
                *cache = new_devices;
            }))?;

            Ok(DeviceProvider { enumerator, cached })
        }

        /// Synchronous probe; refreshes the cached list
        pub fn probe(&self) -> WasapiResult<Vec<Device>> {
            let devices = devices_from_entries(&self.enumerator.enumerate()?);
            *self.cached.lock() = devices.clone();
            Ok(devices)
        }

        /// Begin watching for endpoint changes
        pub fn start(&self) -> WasapiResult<()> {
            // Seed the cache so the first update diffs against reality
            let _ = self.probe()?;
            self.enumerator.set_notifications(true)?;
            Ok(())
        }

        pub fn stop(&self) -> WasapiResult<()> {
            self.enumerator.set_notifications(false)?;
            Ok(())
        }

        pub fn devices(&self) -> Vec<Device> {
            self.cached.lock().clone()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wavebridge_core::{CapsEntry, SampleFormat};

    fn caps() -> Caps {
        let mut caps = Caps::new();
        caps.push(CapsEntry {
            format: SampleFormat::F32Le,
            channels: 2,
            rate: 48000,
            channel_mask: 0,
        });
        caps
    }

    fn entry(id: &str, name: &str, flow: DataFlow, is_default: bool) -> EndpointEntry {
        EndpointEntry {
            device_id: id.into(),
            device_name: name.into(),
            flow,
            is_default,
            caps: caps(),
            actual_device_id: None,
            actual_device_name: None,
            form_factor: FormFactor::Speakers,
            enumerator_name: "USB".into(),
        }
    }

    #[test]
    fn test_default_id_matching() {
        assert!(is_default_endpoint_id("", DataFlow::Render));
        assert!(is_default_endpoint_id(DEFAULT_RENDER_ID, DataFlow::Render));
        assert!(is_default_endpoint_id(
            &DEFAULT_RENDER_ID.to_lowercase(),
            DataFlow::Render
        ));
        assert!(!is_default_endpoint_id(DEFAULT_RENDER_ID, DataFlow::Capture));
        assert!(!is_default_endpoint_id("{0.0.0}.{abc}", DataFlow::Render));
    }

    #[test]
    fn test_render_endpoint_fans_out() {
        let devices = devices_from_entries(&[
            entry("cap1", "Mic", DataFlow::Capture, false),
            entry("ren1", "Speakers", DataFlow::Render, false),
        ]);

        assert_eq!(devices.len(), 3);
        assert_eq!(devices[0].class, DeviceClass::Source);
        assert_eq!(devices[1].class, DeviceClass::Sink);
        assert_eq!(devices[2].class, DeviceClass::LoopbackSource);
        assert!(devices[2].props.loopback);
        assert!(!devices[1].props.loopback);
        assert_eq!(
            devices[2].endpoint_class,
            EndpointClass::LoopbackCapture
        );
    }

    #[test]
    fn test_diff_add_remove() {
        let prev = devices_from_entries(&[entry("a", "A", DataFlow::Capture, false)]);
        let new = devices_from_entries(&[entry("b", "B", DataFlow::Capture, false)]);

        let events = diff_devices(&prev, &new);
        assert_eq!(events.len(), 2);
        assert!(events
            .iter()
            .any(|e| matches!(e, DeviceEvent::Removed(d) if d.props.id == "a")));
        assert!(events
            .iter()
            .any(|e| matches!(e, DeviceEvent::Added(d) if d.props.id == "b")));
    }

    #[test]
    fn test_diff_no_change() {
        let prev = devices_from_entries(&[entry("a", "A", DataFlow::Render, false)]);
        let new = devices_from_entries(&[entry("a", "A", DataFlow::Render, false)]);
        assert!(diff_devices(&prev, &new).is_empty());
    }

    #[test]
    fn test_default_identity_survives_hardware_change() {
        // The default render entry rebinds to different actual hardware
        let mut before = entry(
            default_endpoint_id(DataFlow::Render),
            "Default Audio Render Device",
            DataFlow::Render,
            true,
        );
        before.actual_device_id = Some("hw-a".into());
        let mut after = before.clone();
        after.actual_device_id = Some("hw-b".into());

        let prev = devices_from_entries(&[before]);
        let new = devices_from_entries(&[after]);

        let events = diff_devices(&prev, &new);
        // One Changed per class (Sink and LoopbackSource), nothing removed
        assert_eq!(events.len(), 2);
        for event in &events {
            match event {
                DeviceEvent::Changed { new, old } => {
                    assert!(new.is_default && old.is_default);
                    assert_eq!(new.class, old.class);
                }
                other => panic!("unexpected event {other:?}"),
            }
        }
    }

    #[test]
    fn test_default_change_does_not_pair_across_classes() {
        // Default capture disappearing must not pair with a new default sink
        let cap = entry(
            default_endpoint_id(DataFlow::Capture),
            "Default Audio Capture Device",
            DataFlow::Capture,
            true,
        );
        let ren = entry(
            default_endpoint_id(DataFlow::Render),
            "Default Audio Render Device",
            DataFlow::Render,
            true,
        );

        let prev = devices_from_entries(&[cap]);
        let new = devices_from_entries(&[ren]);

        let events = diff_devices(&prev, &new);
        assert!(events
            .iter()
            .any(|e| matches!(e, DeviceEvent::Removed(d) if d.class == DeviceClass::Source)));
        assert!(!events
            .iter()
            .any(|e| matches!(e, DeviceEvent::Changed { .. })));
    }

    #[test]
    fn test_props_serialize() {
        let devices = devices_from_entries(&[entry("x", "X", DataFlow::Render, false)]);
        let json = serde_json::to_string(&devices[0].props).unwrap();
        assert!(json.contains("\"api\":\"wavebridge\""));
        assert!(json.contains("\"loopback\":false"));
        // Absent actual-id keys are omitted entirely
        assert!(!json.contains("actual_id"));
    }
}
