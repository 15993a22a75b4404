//! Per-Stream WASAPI Context
//!
//! Everything one live stream owns: the endpoint object, the render or
//! capture service client, the stream volume, the I/O events, the selected
//! device format with the resulting host/device infos, the converter when
//! the two differ, and the staging/FIFO buffers the I/O loop drains through.
//!
//! A context is created by the device manager (activation and format
//! probing) and finished here once the stream format is known. The I/O
//! thread is the sole caller after that; a replacement context swaps in
//! atomically on device change and the old one is dropped only after its
//! clients are stopped and reset.

use wavebridge_core::{
    AudioConverter, AudioInfo, Caps, CapsEntry, ConverterConfig, EndpointClass, SampleFormat,
    WaveFormat,
};

use crate::com::Event;
use crate::endpoint::EndpointObject;
use crate::error::{WasapiError, WasapiResult};
use crate::hresult;
use crate::wfx::{self, RawFormat};

use windows::core::Interface;
use windows::Win32::Media::Audio::{
    IAudioCaptureClient, IAudioClient, IAudioClient2, IAudioClient3, IAudioRenderClient,
    IAudioStreamVolume, AUDCLNT_SHAREMODE_EXCLUSIVE, AUDCLNT_SHAREMODE_SHARED,
    AUDCLNT_STREAMFLAGS_AUTOCONVERTPCM, AUDCLNT_STREAMFLAGS_EVENTCALLBACK,
    AUDCLNT_STREAMFLAGS_LOOPBACK, AUDCLNT_STREAMFLAGS_NOPERSIST,
    AUDCLNT_STREAMFLAGS_SRC_DEFAULT_QUALITY,
};

/// AUDCLNT_BUFFERFLAGS_SILENT
pub const BUFFERFLAGS_SILENT: u32 = 0x2;

/// Hardcoded period for the process-loopback virtual device, which reports
/// no device period (100 ns units, 20 ms)
const PROCESS_LOOPBACK_PERIOD_100NS: i64 = 20 * 10_000;

pub struct StreamCtx {
    pub object: EndpointObject,

    pub render_client: Option<IAudioRenderClient>,
    pub capture_client: Option<IAudioCaptureClient>,
    stream_volume: Option<IAudioStreamVolume>,

    pub capture_event: Event,
    pub render_event: Event,

    /// Device format in use once initialised
    pub selected: Option<WaveFormat>,
    pub device_info: Option<AudioInfo>,
    pub host_info: Option<AudioInfo>,
    pub conv: Option<AudioConverter>,

    /// Device period in frames
    pub period: u32,
    pub client_buf_size: u32,
    pub dummy_buf_size: u32,

    /// Exclusive render assembles one full period here before a single
    /// GetBuffer/ReleaseBuffer pair
    pub staging: Vec<u8>,
    pub staging_filled: usize,
    pub period_bytes: usize,

    /// Byte queues used while converting between host and device layouts
    pub device_fifo: Vec<u8>,
    pub host_fifo: Vec<u8>,

    pub is_s24in32: bool,
    pub running: bool,
    pub init_done: bool,
    pub error_posted: bool,

    pub low_latency: bool,
    pub buffer_time_us: i64,
    pub latency_time_us: i64,

    volumes: Vec<f32>,
}

// SAFETY: built on the device-manager MTA thread, then owned by the I/O MTA
// thread; interfaces stay agile within the multi-threaded apartment
unsafe impl Send for StreamCtx {}

impl StreamCtx {
    pub fn new(
        object: EndpointObject,
        low_latency: bool,
        buffer_time_us: i64,
        latency_time_us: i64,
    ) -> WasapiResult<StreamCtx> {
        Ok(StreamCtx {
            object,
            render_client: None,
            capture_client: None,
            stream_volume: None,
            capture_event: Event::auto_reset()?,
            render_event: Event::auto_reset()?,
            selected: None,
            device_info: None,
            host_info: None,
            conv: None,
            period: 0,
            client_buf_size: 0,
            dummy_buf_size: 0,
            staging: Vec::new(),
            staging_filled: 0,
            period_bytes: 0,
            device_fifo: Vec::new(),
            host_fifo: Vec::new(),
            is_s24in32: false,
            running: false,
            init_done: false,
            error_posted: false,
            low_latency,
            buffer_time_us,
            latency_time_us,
            volumes: Vec::new(),
        })
    }

    pub fn device_id(&self) -> &str {
        &self.object.device_id
    }

    pub fn class(&self) -> EndpointClass {
        self.object.class
    }

    pub fn caps(&self) -> &Caps {
        &self.object.caps
    }

    /// Fixated capability set once a format is selected
    pub fn selected_caps(&self) -> Option<Caps> {
        let entry = CapsEntry::from_wave_format(self.selected.as_ref()?)?;
        let mut caps = Caps::new();
        caps.push(entry);
        Some(caps)
    }

    // ========================================================================
    // Initialisation
    // ========================================================================

    /// Finish initialisation for a requested format
    pub fn init(&mut self, requested: &WaveFormat) -> WasapiResult<()> {
        if self.init_done {
            tracing::debug!("Already initialized");
            return Ok(());
        }

        if self.object.exclusive {
            match self.init_exclusive(requested) {
                Ok(()) => {}
                Err(e) => {
                    // Exclusive rejected: downgrade to shared on a fresh client
                    tracing::warn!("Exclusive init failed ({e}), downgrading to shared");
                    self.object.exclusive = false;
                    self.selected = None;
                    self.conv = None;
                    self.device_info = None;
                    self.host_info = None;
                    self.object.reactivate_client()?;
                }
            }
        }

        if !self.object.exclusive {
            self.init_shared(requested)?;
        }

        self.bind_events_and_services()?;

        // SAFETY: initialised client
        self.client_buf_size = unsafe { self.object.client.GetBufferSize() }
            .map_err(|e| WasapiError::api(e.code().0, "GetBufferSize"))?;

        if self.object.dummy_client.is_some() {
            self.init_dummy_client()?;
            self.object.register_mute_monitor()?;
        }

        self.prefill_silence();
        self.warm_up_capture();

        let selected = self.selected.as_ref().ok_or_else(|| {
            WasapiError::FormatNegotiation("no format selected after init".into())
        })?;
        let device_format = selected.sample_format().ok_or_else(|| {
            WasapiError::FormatNegotiation(format!("unrepresentable device format {selected}"))
        })?;
        self.is_s24in32 = device_format == SampleFormat::S24In32Le;

        if self.object.exclusive && self.render_client.is_some() {
            let bpf = self
                .device_info
                .as_ref()
                .map(|i| i.bpf())
                .unwrap_or(selected.block_align() as usize);
            self.period_bytes = self.period as usize * bpf;
            self.staging = vec![0u8; self.period_bytes];
            self.staging_filled = 0;
        }

        self.init_done = true;
        tracing::info!(
            "Context initialised: {} {} period {} frames, buffer {} frames",
            self.object.device_id,
            selected,
            self.period,
            self.client_buf_size
        );

        Ok(())
    }

    fn init_exclusive(&mut self, requested: &WaveFormat) -> WasapiResult<()> {
        let raw_requested = RawFormat::from_wave(requested);
        // SAFETY: probing with caller-owned format storage
        let hr = unsafe {
            self.object.client.IsFormatSupported(
                AUDCLNT_SHAREMODE_EXCLUSIVE,
                raw_requested.as_ptr(),
                None,
            )
        };

        let mut need_conv = false;
        let selected = if hr.0 == hresult::S_OK {
            *requested
        } else {
            // Pick the closest probed format for the requested basis
            wavebridge_core::sort_formats(&mut self.object.formats, requested);
            let closest = *self.object.formats.first().ok_or_else(|| {
                WasapiError::FormatNegotiation("no exclusive formats probed".into())
            })?;

            let new_entry = CapsEntry::from_wave_format(&closest);
            let old_entry = CapsEntry::from_wave_format(requested);
            if new_entry.is_none() || old_entry.is_none() {
                return Err(WasapiError::FormatNegotiation(
                    "closest format not representable".into(),
                ));
            }
            if new_entry != old_entry {
                tracing::info!("Closest format differs: {requested} -> {closest}");
                need_conv = true;
            }
            closest
        };

        let device_entry = CapsEntry::from_wave_format(&selected).ok_or_else(|| {
            WasapiError::FormatNegotiation(format!("unrepresentable format {selected}"))
        })?;
        let device_info = AudioInfo::new(device_entry.format, device_entry.rate, device_entry.channels);
        let host_info = if need_conv {
            let host_entry = CapsEntry::from_wave_format(requested).expect("checked above");
            AudioInfo::new(host_entry.format, host_entry.rate, host_entry.channels)
        } else {
            device_info.clone()
        };

        self.period = initialize_exclusive(
            &mut self.object,
            &selected,
            self.low_latency,
            self.latency_time_us,
        )?;

        if need_conv {
            let (in_info, out_info) = if self.object.class.is_capture_stream() {
                (&device_info, &host_info)
            } else {
                (&host_info, &device_info)
            };
            self.conv = Some(AudioConverter::new(
                in_info,
                out_info,
                ConverterConfig::default(),
            )?);
            tracing::info!("Converter configured");
        }

        self.device_info = Some(device_info);
        self.host_info = Some(host_info);
        self.selected = Some(selected);

        Ok(())
    }

    fn init_shared(&mut self, requested: &WaveFormat) -> WasapiResult<()> {
        let raw_requested = RawFormat::from_wave(requested);
        let mut closest: *mut windows::Win32::Media::Audio::WAVEFORMATEX = std::ptr::null_mut();

        // SAFETY: format storage outlives the call; closest taken below
        let hr = unsafe {
            self.object.client.IsFormatSupported(
                AUDCLNT_SHAREMODE_SHARED,
                raw_requested.as_ptr(),
                Some(&mut closest),
            )
        };

        let mut stream_flags: u32 = 0;
        let selected = if hr.0 == hresult::S_OK {
            // SAFETY: free whatever the call allocated
            unsafe { wfx::take_waveformatex(closest) };
            *requested
        } else if hr.0 == hresult::S_FALSE {
            // SAFETY: S_FALSE hands back a closest-match allocation
            let suggested = unsafe { wfx::take_waveformatex(closest) }.ok_or_else(|| {
                WasapiError::FormatNegotiation("no closest shared format".into())
            })?;

            if CapsEntry::from_wave_format(&suggested) == CapsEntry::from_wave_format(requested) {
                suggested
            } else {
                // Let the engine convert on its side
                tracing::info!("Engine mix format differs, enabling auto conversion");
                stream_flags =
                    AUDCLNT_STREAMFLAGS_AUTOCONVERTPCM | AUDCLNT_STREAMFLAGS_SRC_DEFAULT_QUALITY;
                *requested
            }
        } else {
            stream_flags =
                AUDCLNT_STREAMFLAGS_AUTOCONVERTPCM | AUDCLNT_STREAMFLAGS_SRC_DEFAULT_QUALITY;
            *requested
        };

        let class = self.object.class;
        let mut initialized = false;

        if self.low_latency && !class.is_loopback() && !class.is_process_loopback() {
            match initialize_shared_low_latency(&self.object.client, &selected, stream_flags) {
                Ok(period) => {
                    self.period = period;
                    initialized = true;
                }
                Err(e) => tracing::info!("IAudioClient3 path unavailable: {e}"),
            }
        }

        if !initialized {
            let extra = if class.is_loopback() {
                AUDCLNT_STREAMFLAGS_LOOPBACK
            } else {
                stream_flags
            };
            self.period = initialize_shared(
                &self.object.client,
                &selected,
                extra,
                class,
                self.low_latency,
                self.latency_time_us,
                self.buffer_time_us,
            )?;
        }

        let entry = CapsEntry::from_wave_format(&selected).ok_or_else(|| {
            WasapiError::FormatNegotiation(format!("unrepresentable format {selected}"))
        })?;
        let info = AudioInfo::new(entry.format, entry.rate, entry.channels);
        self.device_info = Some(info.clone());
        self.host_info = Some(info);
        self.selected = Some(selected);

        Ok(())
    }

    fn bind_events_and_services(&mut self) -> WasapiResult<()> {
        let client = &self.object.client;

        if self.object.class == EndpointClass::Render {
            // SAFETY: initialised client, owned event handle
            unsafe {
                client
                    .SetEventHandle(self.render_event.raw())
                    .map_err(|e| WasapiError::api(e.code().0, "SetEventHandle"))?;
            }
            // SAFETY: initialised client
            self.render_client = Some(unsafe {
                client
                    .GetService()
                    .map_err(|e| WasapiError::api(e.code().0, "GetService(render)"))?
            });
        } else {
            // SAFETY: as above, capture side
            unsafe {
                client
                    .SetEventHandle(self.capture_event.raw())
                    .map_err(|e| WasapiError::api(e.code().0, "SetEventHandle"))?;
            }
            // SAFETY: initialised client
            self.capture_client = Some(unsafe {
                client
                    .GetService()
                    .map_err(|e| WasapiError::api(e.code().0, "GetService(capture)"))?
            });
        }

        if !self.object.exclusive {
            // SAFETY: initialised shared client
            match unsafe { client.GetService::<IAudioStreamVolume>() } {
                Ok(volume) => self.stream_volume = Some(volume),
                Err(e) => tracing::warn!("Couldn't get stream volume interface: {e}"),
            }
        }

        Ok(())
    }

    /// Initialise the silence-feed client driving loopback on idle devices
    fn init_dummy_client(&mut self) -> WasapiResult<()> {
        let dummy = self
            .object
            .dummy_client
            .clone()
            .expect("caller checked dummy_client");

        let mix = wfx::mix_format(&dummy).ok_or_else(|| {
            WasapiError::FormatNegotiation("dummy client reports no mix format".into())
        })?;

        initialize_shared(&dummy, &mix, 0, EndpointClass::Render, false, 0, 0)?;

        // The dummy render stream shares the loopback wake event so one wait
        // slot serves both
        // SAFETY: initialised dummy client, owned event handle
        unsafe {
            dummy
                .SetEventHandle(self.render_event.raw())
                .map_err(|e| WasapiError::api(e.code().0, "SetEventHandle(dummy)"))?;
        }

        // SAFETY: initialised dummy client
        self.dummy_buf_size = unsafe { dummy.GetBufferSize() }
            .map_err(|e| WasapiError::api(e.code().0, "GetBufferSize(dummy)"))?;

        // SAFETY: initialised dummy client
        self.render_client = Some(unsafe {
            dummy
                .GetService()
                .map_err(|e| WasapiError::api(e.code().0, "GetService(dummy render)"))?
        });

        Ok(())
    }

    /// Preroll the render endpoint with silence
    fn prefill_silence(&mut self) {
        let Some(render_client) = &self.render_client else {
            return;
        };
        if self.object.dummy_client.is_some() {
            return;
        }

        if self.object.exclusive {
            // SAFETY: buffer of client_buf_size frames released immediately
            unsafe {
                if let Ok(_data) = render_client.GetBuffer(self.client_buf_size) {
                    tracing::debug!("Prefill {} frames", self.client_buf_size);
                    let _ = render_client.ReleaseBuffer(self.client_buf_size, BUFFERFLAGS_SILENT);
                }
            }
        } else {
            // SAFETY: padding-bounded buffer released immediately
            unsafe {
                let Ok(padding) = self.object.client.GetCurrentPadding() else {
                    return;
                };
                if padding >= self.client_buf_size {
                    return;
                }
                let can_write = (self.client_buf_size - padding).min(self.period);
                if let Ok(_data) = render_client.GetBuffer(can_write) {
                    tracing::debug!("Prefill {can_write} frames");
                    let _ = render_client.ReleaseBuffer(can_write, BUFFERFLAGS_SILENT);
                }
            }
        }
    }

    /// First Start() on an idle capture device can stall; cycle it once
    fn warm_up_capture(&mut self) {
        if self.capture_client.is_none() || self.object.dummy_client.is_some() {
            return;
        }
        // SAFETY: initialised client; errors ignored, this is best-effort
        unsafe {
            let client = &self.object.client;
            let _ = client.Start();
            let _ = client.Stop();
            let _ = client.Reset();
        }
    }

    // ========================================================================
    // Runtime control
    // ========================================================================

    pub fn start(&mut self) -> WasapiResult<()> {
        if self.running {
            return Ok(());
        }

        // SAFETY: initialised client
        unsafe {
            self.object
                .client
                .Start()
                .map_err(|e| WasapiError::api(e.code().0, "IAudioClient::Start"))?;
        }

        if let Some(dummy) = &self.object.dummy_client {
            // SAFETY: initialised dummy client; roll back the main client on
            // failure so both stay consistent
            unsafe {
                if let Err(e) = dummy.Start() {
                    let _ = self.object.client.Stop();
                    let _ = self.object.client.Reset();
                    return Err(WasapiError::api(e.code().0, "dummy Start"));
                }
            }
        }

        self.running = true;
        Ok(())
    }

    pub fn stop(&mut self) -> WasapiResult<()> {
        let mut result = Ok(());

        // SAFETY: valid client; Reset only after a successful Stop
        unsafe {
            match self.object.client.Stop() {
                Ok(()) => {
                    let _ = self.object.client.Reset();
                }
                Err(e) => result = Err(WasapiError::api(e.code().0, "IAudioClient::Stop")),
            }

            if let Some(dummy) = &self.object.dummy_client {
                if dummy.Stop().is_ok() {
                    let _ = dummy.Reset();
                }
            }
        }

        self.running = false;
        result
    }

    /// Broadcast one gain value to every channel
    pub fn set_volume(&mut self, volume: f32) -> WasapiResult<()> {
        let Some(stream_volume) = &self.stream_volume else {
            return Ok(());
        };

        // SAFETY: valid stream-volume interface
        unsafe {
            let count = stream_volume
                .GetChannelCount()
                .map_err(|e| WasapiError::api(e.code().0, "GetChannelCount"))?;
            if count == 0 {
                return Ok(());
            }

            self.volumes.clear();
            self.volumes.resize(count as usize, volume);

            stream_volume
                .SetAllVolumes(&self.volumes)
                .map_err(|e| WasapiError::api(e.code().0, "SetAllVolumes"))
        }
    }

    pub fn endpoint_muted(&self) -> bool {
        self.object.endpoint_muted()
    }

    /// Reset per-stream conversion state across a restart
    pub fn reset_io_state(&mut self) {
        self.staging_filled = 0;
        self.device_fifo.clear();
        self.host_fifo.clear();
        if let Some(conv) = &mut self.conv {
            conv.reset();
        }
    }
}

impl Drop for StreamCtx {
    fn drop(&mut self) {
        let _ = self.stop();
    }
}

// ============================================================================
// Client initialisation paths
// ============================================================================

/// Exclusive mode: strict period alignment against the device limits
fn initialize_exclusive(
    object: &mut EndpointObject,
    format: &WaveFormat,
    low_latency: bool,
    latency_time_us: i64,
) -> WasapiResult<u32> {
    let raw = RawFormat::from_wave(format);

    // SAFETY: format storage outlives every call below
    unsafe {
        let hr = object
            .client
            .IsFormatSupported(AUDCLNT_SHAREMODE_EXCLUSIVE, raw.as_ptr(), None);
        if hr.0 != hresult::S_OK {
            return Err(WasapiError::api(hr.0, "IsFormatSupported(exclusive)"));
        }

        // Buffer-size limits are advisory; missing support keeps the period
        // bounds from GetDevicePeriod alone
        let mut min_hns: i64 = 0;
        let mut max_hns: i64 = 0;
        if let Ok(client2) = object.client.cast::<IAudioClient2>() {
            if client2
                .GetBufferSizeLimits(raw.as_ptr(), true, &mut min_hns, &mut max_hns)
                .is_err()
            {
                min_hns = 0;
                max_hns = 0;
            }
        }

        let mut default_period: i64 = 0;
        let mut min_period: i64 = 0;
        object
            .client
            .GetDevicePeriod(Some(&mut default_period), Some(&mut min_period))
            .map_err(|e| WasapiError::api(e.code().0, "GetDevicePeriod"))?;

        tracing::debug!(
            "Device period default {default_period} min {min_period}, size limits [{min_hns}, {max_hns}]"
        );

        min_hns = min_hns.max(min_period);
        if max_hns == 0 {
            max_hns = default_period;
        }

        let mut target = min_hns;
        if !low_latency && latency_time_us > 0 {
            target = latency_time_us * 10;
        }
        target = target.clamp(min_hns, max_hns.max(min_hns));

        let flags = AUDCLNT_STREAMFLAGS_EVENTCALLBACK | AUDCLNT_STREAMFLAGS_NOPERSIST;

        let mut result = object
            .client
            .Initialize(AUDCLNT_SHAREMODE_EXCLUSIVE, flags, target, target, raw.as_ptr(), None);

        let misaligned = matches!(&result, Err(e)
            if e.code().0 == hresult::AUDCLNT_E_BUFFER_SIZE_NOT_ALIGNED);
        if misaligned {
            tracing::debug!("Buffer size not aligned, opening device again");

            let buffer_size = object
                .client
                .GetBufferSize()
                .map_err(|e| WasapiError::api(e.code().0, "GetBufferSize"))?;
            if buffer_size == 0 {
                return Err(WasapiError::api(hresult::E_FAIL, "aligned buffer size"));
            }

            // The rejected client is dead; reopen and retry once with the
            // aligned size converted back to a duration
            object.reactivate_client()?;
            let aligned = 10_000_000i64 * i64::from(buffer_size) / i64::from(format.rate);
            result = object.client.Initialize(
                AUDCLNT_SHAREMODE_EXCLUSIVE,
                flags,
                aligned,
                aligned,
                raw.as_ptr(),
                None,
            );
        }

        result.map_err(|e| WasapiError::api(e.code().0, "Initialize(exclusive)"))?;

        let buffer_size = object
            .client
            .GetBufferSize()
            .map_err(|e| WasapiError::api(e.code().0, "GetBufferSize"))?;
        if buffer_size == 0 {
            return Err(WasapiError::api(hresult::E_FAIL, "zero exclusive buffer"));
        }

        tracing::debug!("Configured exclusive mode period: {buffer_size} frames");
        Ok(buffer_size)
    }
}

/// Shared low-latency path via IAudioClient3 minimum engine period
fn initialize_shared_low_latency(
    client: &IAudioClient,
    format: &WaveFormat,
    extra_flags: u32,
) -> WasapiResult<u32> {
    let client3: IAudioClient3 = client
        .cast()
        .map_err(|e| WasapiError::api(e.code().0, "IAudioClient3 unavailable"))?;

    let raw = RawFormat::from_wave(format);
    let mut default_period = 0u32;
    let mut fundamental = 0u32;
    let mut min_period = 0u32;
    let mut max_period = 0u32;

    // SAFETY: format storage outlives both calls
    unsafe {
        client3
            .GetSharedModeEnginePeriod(
                raw.as_ptr(),
                &mut default_period,
                &mut fundamental,
                &mut min_period,
                &mut max_period,
            )
            .map_err(|e| WasapiError::api(e.code().0, "GetSharedModeEnginePeriod"))?;

        tracing::info!(
            "Engine periods: default {default_period}, fundamental {fundamental}, min {min_period}, max {max_period} frames"
        );

        // NOPERSIST is not allowed for InitializeSharedAudioStream
        let flags = AUDCLNT_STREAMFLAGS_EVENTCALLBACK | extra_flags;
        client3
            .InitializeSharedAudioStream(flags, min_period, raw.as_ptr(), None)
            .map_err(|e| WasapiError::api(e.code().0, "InitializeSharedAudioStream"))?;
    }

    Ok(min_period)
}

/// Shared-mode initialisation; returns the period in frames
fn initialize_shared(
    client: &IAudioClient,
    format: &WaveFormat,
    extra_flags: u32,
    class: EndpointClass,
    low_latency: bool,
    latency_time_us: i64,
    buffer_time_us: i64,
) -> WasapiResult<u32> {
    let raw = RawFormat::from_wave(format);

    // SAFETY: format storage outlives the calls
    unsafe {
        let default_period_100ns;

        if !class.is_process_loopback() {
            let mut default_period: i64 = 0;
            let mut min_period: i64 = 0;
            client
                .GetDevicePeriod(Some(&mut default_period), Some(&mut min_period))
                .map_err(|e| WasapiError::api(e.code().0, "GetDevicePeriod"))?;

            tracing::debug!("Device period default {default_period}, min {min_period}");

            // Zero buffer duration lets the engine pick, but that glitches
            // on some devices; size it from the configured times instead,
            // keeping the period an integral multiple of the device default
            let mut buf_dur: i64 = 0;
            if low_latency && latency_time_us > 0 && buffer_time_us > 0 {
                let factor = ((latency_time_us * 10) / default_period).max(1);
                let period = default_period * factor;
                buf_dur = (buffer_time_us * 10).max(2 * period);
            }

            let flags =
                AUDCLNT_STREAMFLAGS_EVENTCALLBACK | AUDCLNT_STREAMFLAGS_NOPERSIST | extra_flags;
            client
                .Initialize(AUDCLNT_SHAREMODE_SHARED, flags, buf_dur, 0, raw.as_ptr(), None)
                .map_err(|e| WasapiError::api(e.code().0, "Initialize(shared)"))?;

            default_period_100ns = default_period;
        } else {
            // The virtual process-loopback device reports no period
            default_period_100ns = PROCESS_LOOPBACK_PERIOD_100NS;
            let flags = AUDCLNT_STREAMFLAGS_LOOPBACK
                | AUDCLNT_STREAMFLAGS_EVENTCALLBACK
                | AUDCLNT_STREAMFLAGS_AUTOCONVERTPCM;
            client
                .Initialize(
                    AUDCLNT_SHAREMODE_SHARED,
                    flags,
                    default_period_100ns,
                    0,
                    raw.as_ptr(),
                    None,
                )
                .map_err(|e| WasapiError::api(e.code().0, "Initialize(process loopback)"))?;
        }

        // Convert the period duration to frames at the stream rate
        let frames = (default_period_100ns as i128 * format.rate as i128 + 5_000_000)
            / 10_000_000;
        Ok(frames as u32)
    }
}
