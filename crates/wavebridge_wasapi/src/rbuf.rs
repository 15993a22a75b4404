//! Ring-Buffer I/O Core
//!
//! The bridge between the pipeline's segment ring and a WASAPI endpoint.
//! One dedicated I/O thread (tagged "Pro Audio") multiplexes over the render
//! event, the capture event, a fallback timer, a monitor timer and the
//! command wake event. Every public operation posts a command and blocks on
//! its completion; the I/O thread is the single mutator of stream state, so
//! commands complete in submission order and never observe interleaved
//! WASAPI state.
//!
//! Device swaps arrive as finished contexts from the device manager via the
//! same command queue, so a swap cannot race an acquire or start: they queue
//! behind each other. When a device dies (or never opened) and the stream is
//! configured to continue on error, a high-resolution fallback timer keeps
//! the ring advancing at wall-clock rate; a 15 ms monitor timer catches
//! unplugged endpoints whose I/O events would never fire again.

use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU32, Ordering};
use std::sync::Arc;

use crossbeam_channel::{bounded, unbounded, Receiver, Sender, TryRecvError};

use wavebridge_core::{
    channels, repack, AudioInfo, Caps, CapsEntry, EndpointClass, RingSpec, SegmentRing,
    StreamMessage, WaveFormat,
};

use crate::com::{qpc_frequency, qpc_now, ComGuard, Event, WaitableTimer};
use crate::ctx::{StreamCtx, BUFFERFLAGS_SILENT};
use crate::error::{WasapiError, WasapiResult};
use crate::hresult;
use crate::manager::{CtxDesc, DeviceManager};

use windows::Win32::Foundation::{HANDLE, WAIT_OBJECT_0};
use windows::Win32::System::Threading::{
    AvRevertMmThreadCharacteristics, AvSetMmThreadCharacteristicsW, WaitForMultipleObjects,
    INFINITE,
};

/// Period fallback used before a device period is known
const DEFAULT_PERIOD_FRAMES: u32 = 480;

/// Monitor timer period; unplug detection for endpoints with silent events
const MONITOR_PERIOD_MS: i32 = 15;

type InvalidatedCallback = Box<dyn Fn() + Send>;

pub(crate) enum Command {
    Shutdown {
        done: Sender<()>,
    },
    SetDevice {
        device_id: String,
        class: EndpointClass,
        pid: u32,
        low_latency: bool,
        exclusive: bool,
        done: Sender<()>,
    },
    UpdateDevice {
        device_id: String,
        ctx: Option<Box<StreamCtx>>,
        done: Sender<()>,
    },
    Open {
        done: Sender<i32>,
    },
    Close {
        done: Sender<()>,
    },
    Acquire {
        info: AudioInfo,
        reply: Sender<Result<Arc<SegmentRing>, i32>>,
    },
    Release {
        done: Sender<()>,
    },
    Start {
        done: Sender<i32>,
    },
    Stop {
        done: Sender<i32>,
    },
    GetCaps {
        reply: Sender<Option<Caps>>,
    },
    UpdateVolume,
}

impl Command {
    fn name(&self) -> &'static str {
        match self {
            Command::Shutdown { .. } => "Shutdown",
            Command::SetDevice { .. } => "SetDevice",
            Command::UpdateDevice { .. } => "UpdateDevice",
            Command::Open { .. } => "Open",
            Command::Close { .. } => "Close",
            Command::Acquire { .. } => "Acquire",
            Command::Release { .. } => "Release",
            Command::Start { .. } => "Start",
            Command::Stop { .. } => "Stop",
            Command::GetCaps { .. } => "GetCaps",
            Command::UpdateVolume => "UpdateVolume",
        }
    }
}

/// Cloneable address of the I/O thread's command queue
#[derive(Clone)]
pub struct RbufHandle {
    tx: Sender<Command>,
    wake: Arc<Event>,
}

impl RbufHandle {
    pub(crate) fn push(&self, cmd: Command) -> WasapiResult<()> {
        self.tx
            .send(cmd)
            .map_err(|_| WasapiError::ThreadGone("rbuf".into()))?;
        self.wake.set();
        Ok(())
    }
}

/// State readable without going through the command queue
struct RbufShared {
    volume: AtomicU32,
    mute: AtomicBool,
    allow_dummy: AtomicBool,
    monitor_device_mute: AtomicBool,
    buffer_time_us: AtomicI64,
    latency_time_us: AtomicI64,
}

impl RbufShared {
    fn volume(&self) -> f32 {
        f32::from_bits(self.volume.load(Ordering::Relaxed))
    }

    fn effective_volume(&self) -> f32 {
        if self.mute.load(Ordering::Relaxed) {
            0.0
        } else {
            self.volume()
        }
    }
}

/// The WASAPI-backed ring buffer
pub struct Rbuf {
    handle: RbufHandle,
    shared: Arc<RbufShared>,
    thread: Option<std::thread::JoinHandle<()>>,
}

impl Rbuf {
    /// Spawn the I/O thread
    ///
    /// `messages` receives structured warnings/errors; `invalidated` fires
    /// before each of them so the owner can mark itself unusable.
    pub fn new(
        messages: Sender<StreamMessage>,
        invalidated: InvalidatedCallback,
    ) -> WasapiResult<Rbuf> {
        let (tx, rx) = unbounded();
        let wake = Arc::new(Event::auto_reset()?);
        let handle = RbufHandle {
            tx,
            wake: Arc::clone(&wake),
        };

        let shared = Arc::new(RbufShared {
            volume: AtomicU32::new(1.0f32.to_bits()),
            mute: AtomicBool::new(false),
            allow_dummy: AtomicBool::new(false),
            monitor_device_mute: AtomicBool::new(false),
            buffer_time_us: AtomicI64::new(200_000),
            latency_time_us: AtomicI64::new(10_000),
        });

        let loop_shared = Arc::clone(&shared);
        let loop_handle = handle.clone();
        let thread = std::thread::Builder::new()
            .name("wavebridge-rbuf".into())
            .spawn(move || {
                io_thread(rx, wake, loop_handle, loop_shared, messages, invalidated)
            })
            .map_err(|e| WasapiError::ThreadGone(e.to_string()))?;

        Ok(Rbuf {
            handle,
            shared,
            thread: Some(thread),
        })
    }

    fn roundtrip_unit(&self, make: impl FnOnce(Sender<()>) -> Command) -> WasapiResult<()> {
        let (done_tx, done_rx) = bounded(1);
        self.handle.push(make(done_tx))?;
        done_rx
            .recv()
            .map_err(|_| WasapiError::ThreadGone("rbuf".into()))
    }

    fn roundtrip_hr(&self, make: impl FnOnce(Sender<i32>) -> Command) -> WasapiResult<()> {
        let (done_tx, done_rx) = bounded(1);
        self.handle.push(make(done_tx))?;
        let hr = done_rx
            .recv()
            .map_err(|_| WasapiError::ThreadGone("rbuf".into()))?;
        if hresult::failed(hr) {
            return Err(WasapiError::api(hr, "ring buffer command"));
        }
        Ok(())
    }

    // ========================================================================
    // Ring-buffer contract
    // ========================================================================

    /// Select (or switch) the endpoint this stream runs against
    ///
    /// While open, the new device is built in the background and swapped in
    /// without interrupting the stream.
    pub fn set_device(
        &self,
        device_id: Option<&str>,
        class: EndpointClass,
        pid: u32,
        low_latency: bool,
        exclusive: bool,
    ) -> WasapiResult<()> {
        self.roundtrip_unit(|done| Command::SetDevice {
            device_id: device_id.unwrap_or_default().to_string(),
            class,
            pid,
            low_latency,
            exclusive,
            done,
        })
    }

    pub fn open_device(&self) -> WasapiResult<()> {
        self.roundtrip_hr(|done| Command::Open { done })
    }

    pub fn close_device(&self) -> WasapiResult<()> {
        self.roundtrip_unit(|done| Command::Close { done })
    }

    /// Negotiate a format and allocate the ring
    ///
    /// Segment size and count are outputs, readable from the returned ring's
    /// spec.
    pub fn acquire(&self, info: AudioInfo) -> WasapiResult<Arc<SegmentRing>> {
        let (reply_tx, reply_rx) = bounded(1);
        self.handle.push(Command::Acquire {
            info,
            reply: reply_tx,
        })?;
        reply_rx
            .recv()
            .map_err(|_| WasapiError::ThreadGone("rbuf".into()))?
            .map_err(|hr| WasapiError::api(hr, "acquire"))
    }

    pub fn release(&self) -> WasapiResult<()> {
        self.roundtrip_unit(|done| Command::Release { done })
    }

    pub fn start(&self) -> WasapiResult<()> {
        self.roundtrip_hr(|done| Command::Start { done })
    }

    pub fn resume(&self) -> WasapiResult<()> {
        self.roundtrip_hr(|done| Command::Start { done })
    }

    pub fn pause(&self) -> WasapiResult<()> {
        self.roundtrip_hr(|done| Command::Stop { done })
    }

    pub fn stop(&self) -> WasapiResult<()> {
        self.roundtrip_hr(|done| Command::Stop { done })
    }

    /// Currently-known capability set
    pub fn caps(&self) -> Option<Caps> {
        let (reply_tx, reply_rx) = bounded(1);
        self.handle
            .push(Command::GetCaps { reply: reply_tx })
            .ok()?;
        reply_rx.recv().ok().flatten()
    }

    /// Queued frames in the device
    ///
    /// Always zero: with event-driven buffering the padding either mirrors
    /// what the wake already consumed (capture) or reports the whole device
    /// buffer (render), neither of which describes pipeline delay.
    pub fn delay(&self) -> u32 {
        0
    }

    // ========================================================================
    // Cached state; never blocks
    // ========================================================================

    pub fn set_mute(&self, mute: bool) {
        self.shared.mute.store(mute, Ordering::Relaxed);
        let _ = self.handle.push(Command::UpdateVolume);
    }

    pub fn mute(&self) -> bool {
        self.shared.mute.load(Ordering::Relaxed)
    }

    pub fn set_volume(&self, volume: f64) {
        self.shared
            .volume
            .store((volume as f32).to_bits(), Ordering::Relaxed);
        let _ = self.handle.push(Command::UpdateVolume);
    }

    pub fn volume(&self) -> f64 {
        f64::from(self.shared.volume())
    }

    /// Emit silence while the endpoint is muted (loopback capture)
    pub fn set_device_mute_monitoring(&self, value: bool) {
        self.shared
            .monitor_device_mute
            .store(value, Ordering::Release);
    }

    /// Degrade open/I/O failures to warnings and keep the clock running
    pub fn set_continue_on_error(&self, value: bool) {
        self.shared.allow_dummy.store(value, Ordering::Relaxed);
    }

    /// Device buffer/period targets in microseconds
    pub fn set_timing(&self, buffer_time_us: i64, latency_time_us: i64) {
        self.shared
            .buffer_time_us
            .store(buffer_time_us, Ordering::Relaxed);
        self.shared
            .latency_time_us
            .store(latency_time_us, Ordering::Relaxed);
    }
}

impl Drop for Rbuf {
    fn drop(&mut self) {
        let (done_tx, done_rx) = bounded(1);
        if self.handle.push(Command::Shutdown { done: done_tx }).is_ok() {
            let _ = done_rx.recv();
        }
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}

// ============================================================================
// I/O thread
// ============================================================================

struct IoState {
    handle: RbufHandle,
    shared: Arc<RbufShared>,
    messages: Sender<StreamMessage>,
    invalidated: InvalidatedCallback,

    device_id: String,
    class: EndpointClass,
    pid: u32,
    low_latency: bool,
    exclusive: bool,

    ctx: Option<StreamCtx>,
    ring: Option<Arc<SegmentRing>>,
    caps: Option<Caps>,
    mix_format: Option<WaveFormat>,

    opened: bool,
    running: bool,
    configured_allow_dummy: bool,

    is_first: bool,
    segoffset: usize,
    write_frame_offset: u64,
    expected_position: u64,

    fallback_timer: WaitableTimer,
    fallback_armed: bool,
    fallback_frames_processed: u64,
    fallback_qpc_base: i64,
    qpc_freq: i64,

    monitor_timer: WaitableTimer,
    monitor_armed: bool,

    temp: Vec<u8>,
}

impl IoState {
    fn desc(&self) -> CtxDesc {
        CtxDesc {
            device_id: self.device_id.clone(),
            class: self.class,
            pid: self.pid,
            buffer_time_us: self.shared.buffer_time_us.load(Ordering::Relaxed),
            latency_time_us: self.shared.latency_time_us.load(Ordering::Relaxed),
            low_latency: self.low_latency,
            exclusive: self.exclusive,
            selected: self.mix_format,
        }
    }

    fn post_open_error(&self) {
        (self.invalidated)();
        let msg = StreamMessage::open_failure(&self.device_id, self.configured_allow_dummy);
        tracing::warn!("{msg}");
        let _ = self.messages.send(msg);
    }

    fn post_io_error(&self, hr: i32, is_write: bool) {
        (self.invalidated)();
        let msg = StreamMessage::io_failure(
            hr,
            hresult::error_message(hr),
            is_write,
            self.configured_allow_dummy,
        );
        tracing::error!("{msg}");
        let _ = self.messages.send(msg);
    }

    fn apply_volume(&mut self) {
        let volume = self.shared.effective_volume();
        if let Some(ctx) = self.ctx.as_mut() {
            if let Err(e) = ctx.set_volume(volume) {
                tracing::warn!("Couldn't apply volume: {e}");
            }
        }
    }

    // ------------------------------------------------------------------
    // Timers
    // ------------------------------------------------------------------

    fn start_fallback_timer(&mut self) {
        if self.fallback_armed || !self.configured_allow_dummy {
            return;
        }
        let Some(ring) = self.ring.as_ref() else {
            return;
        };

        tracing::debug!("Start fallback timer");

        let spec = ring.spec();
        let period_frames = spec.period_frames() as u64;
        let period_100ns = 10_000_000u64 * period_frames / u64::from(spec.info.rate);
        let period_ms = (period_100ns / 10_000).max(1) as i32;

        if let Err(e) = self
            .fallback_timer
            .set_periodic(period_100ns as i64, period_ms)
        {
            tracing::error!("Couldn't arm fallback timer: {e}");
            return;
        }

        self.fallback_qpc_base = qpc_now();
        self.fallback_frames_processed = 0;
        self.fallback_armed = true;
    }

    fn stop_fallback_timer(&mut self) {
        if !self.fallback_armed {
            return;
        }
        tracing::debug!("Stop fallback timer");
        self.fallback_timer.cancel();
        self.fallback_armed = false;
    }

    fn start_monitor_timer(&mut self) -> bool {
        if self.monitor_armed {
            return true;
        }
        tracing::debug!("Start monitor timer");
        if let Err(e) = self
            .monitor_timer
            .set_periodic(i64::from(MONITOR_PERIOD_MS) * 10_000, MONITOR_PERIOD_MS)
        {
            tracing::error!("Couldn't arm monitor timer: {e}");
            return false;
        }
        self.monitor_armed = true;
        true
    }

    fn stop_monitor_timer(&mut self) {
        if !self.monitor_armed {
            return;
        }
        tracing::debug!("Stop monitor timer");
        self.monitor_timer.cancel();
        self.monitor_armed = false;
    }

    // ------------------------------------------------------------------
    // Start / stop
    // ------------------------------------------------------------------

    fn process_start(&mut self, reset_offset: bool) -> i32 {
        if self.ctx.is_none() && !self.configured_allow_dummy {
            tracing::warn!("No context to start");
            return hresult::E_FAIL;
        }
        if self.running {
            return hresult::S_OK;
        }

        self.is_first = true;
        if reset_offset {
            self.segoffset = 0;
        }
        self.write_frame_offset = 0;
        self.expected_position = 0;

        if let Some(ring) = self.ring.as_ref() {
            ring.set_active(true);
        }

        let mut start_failed = false;
        if let Some(ctx) = self.ctx.as_mut() {
            ctx.reset_io_state();
            if let Err(e) = ctx.start() {
                tracing::warn!("Couldn't start device: {e}");
                let hr = e.hresult().unwrap_or(hresult::E_FAIL);
                start_failed = true;
                if !self.configured_allow_dummy {
                    self.post_open_error();
                    return hr;
                }
            }
        }

        if start_failed {
            self.post_open_error();
            self.start_fallback_timer();
        } else if self.ctx.is_none() {
            self.start_fallback_timer();
        }

        // Monitor timer is mandatory while running
        if !self.start_monitor_timer() {
            return hresult::E_FAIL;
        }
        self.running = true;

        hresult::S_OK
    }

    fn process_stop(&mut self) -> i32 {
        let mut hr = hresult::S_OK;
        if let Some(ctx) = self.ctx.as_mut() {
            if let Err(e) = ctx.stop() {
                hr = e.hresult().unwrap_or(hresult::E_FAIL);
            }
        }

        if let Some(ring) = self.ring.as_ref() {
            ring.set_active(false);
        }

        self.running = false;
        self.is_first = true;
        self.segoffset = 0;
        self.write_frame_offset = 0;
        self.expected_position = 0;

        self.stop_fallback_timer();
        self.stop_monitor_timer();

        hr
    }

    // ------------------------------------------------------------------
    // Acquire
    // ------------------------------------------------------------------

    fn process_acquire(&mut self, info: &AudioInfo) -> Result<Arc<SegmentRing>, i32> {
        tracing::debug!("Acquire with {info}");
        self.mix_format = None;

        let mut period_frames = DEFAULT_PERIOD_FRAMES;

        if let Some(ctx) = self.ctx.as_mut() {
            if !ctx.init_done {
                // Pick the probed format matching the request, else build
                // one from the request itself
                let matching = ctx
                    .object
                    .formats
                    .iter()
                    .find(|wf| {
                        CapsEntry::from_wave_format(wf).is_some_and(|e| e.matches(info))
                    })
                    .copied()
                    .map(Ok)
                    .unwrap_or_else(|| WaveFormat::from_audio_info(info))
                    .map_err(|e| {
                        tracing::error!("Couldn't build wave format for {info}: {e}");
                        hresult::E_FAIL
                    })?;

                if let Err(e) = ctx.init(&matching) {
                    tracing::warn!("Couldn't initialize context: {e}");
                    self.post_open_error();
                    if !self.configured_allow_dummy {
                        return Err(hresult::E_FAIL);
                    }
                    self.ctx = None;
                }
            }
        }

        if let Some(ctx) = self.ctx.as_ref() {
            period_frames = ctx.period.max(1);
            self.mix_format = ctx.selected;
        }
        if self.mix_format.is_none() {
            self.mix_format = Some(
                WaveFormat::from_audio_info(info).map_err(|_| hresult::E_FAIL)?,
            );
        }

        // Channel positions ride on the selected device mask
        let mut host_info = info.clone();
        if let Some(mix) = &self.mix_format {
            if mix.channels == info.channels {
                let (_, positions) = channels::mask_to_positions(mix.channels, mix.channel_mask);
                host_info = host_info.with_positions(positions);
            }
        }

        let spec = RingSpec::for_period(host_info, period_frames as usize)
            .map_err(|_| hresult::E_FAIL)?;
        tracing::info!(
            "Acquired: period {} frames, segsize {} bytes, segtotal {}",
            period_frames,
            spec.segsize,
            spec.segtotal
        );

        let ring = SegmentRing::allocate(spec).map_err(|_| hresult::E_FAIL)?;
        self.ring = Some(Arc::clone(&ring));
        self.segoffset = 0;

        // Format is fixated now
        self.caps = self
            .ctx
            .as_ref()
            .and_then(|c| c.selected_caps())
            .or_else(|| {
                self.mix_format
                    .as_ref()
                    .map(|wf| Caps::from_formats(std::slice::from_ref(wf)))
            });

        self.apply_volume();
        self.opened = true;

        Ok(ring)
    }

    // ------------------------------------------------------------------
    // Fallback clock
    // ------------------------------------------------------------------

    /// Advance the ring by however many frames wall-clock says the dead
    /// device would have consumed or produced
    fn process_fallback_tick(&mut self) {
        let Some(ring) = self.ring.as_ref() else {
            return;
        };

        let rate = u64::from(ring.spec().info.rate);
        let elapsed = qpc_now() - self.fallback_qpc_base;
        let elapsed_100ns = elapsed as u128 * 10_000_000 / self.qpc_freq.max(1) as u128;
        let expected_frames = (elapsed_100ns * rate as u128 / 10_000_000) as u64;
        let delta = expected_frames.saturating_sub(self.fallback_frames_processed);

        if delta == 0 {
            return;
        }
        tracing::trace!("Processing fallback {delta} frames");

        if self.class == EndpointClass::Render {
            self.discard_frames(delta as usize);
        } else {
            self.insert_silence_frames(delta as usize);
        }

        self.fallback_frames_processed += delta;
    }

    fn discard_frames(&mut self, frames: usize) {
        let Some(ring) = self.ring.as_ref() else {
            return;
        };
        let spec = ring.spec().clone();
        let mut len = frames * spec.info.bpf();

        while len > 0 {
            let Some(seg) = ring.prepare_read() else {
                return;
            };
            let segment = seg.segment;
            let avail = seg.data.len() - self.segoffset;
            drop(seg);

            let to_consume = len.min(avail);
            self.segoffset += to_consume;
            len -= to_consume;

            if self.segoffset == spec.segsize {
                ring.clear_segment(segment);
                ring.advance(1);
                self.segoffset = 0;
            }

            if to_consume == 0 {
                break;
            }
        }
    }

    fn insert_silence_frames(&mut self, frames: usize) {
        let Some(ring) = self.ring.as_ref() else {
            return;
        };
        let spec = ring.spec().clone();
        let mut len = frames * spec.info.bpf();

        while len > 0 {
            let Some(seg) = ring.prepare_read() else {
                return;
            };
            let avail = seg.data.len() - self.segoffset;
            let to_write = len.min(avail);
            spec.info
                .fill_silence(&mut seg.data[self.segoffset..self.segoffset + to_write]);
            drop(seg);

            self.segoffset += to_write;
            len -= to_write;

            if self.segoffset == spec.segsize {
                ring.advance(1);
                self.segoffset = 0;
            }

            if to_write == 0 {
                break;
            }
        }
    }

    // ------------------------------------------------------------------
    // Render path
    // ------------------------------------------------------------------

    /// Shared-mode render: fill whatever the padding allows
    fn process_write(&mut self) -> Result<(), i32> {
        let Some(ctx) = self.ctx.as_mut() else {
            return Err(hresult::E_FAIL);
        };
        let Some(ring) = self.ring.as_ref() else {
            return Err(hresult::E_FAIL);
        };
        let Some(render_client) = ctx.render_client.as_ref() else {
            tracing::error!("Render client is not available");
            return Err(hresult::E_FAIL);
        };

        let spec = ring.spec().clone();
        let bpf = spec.info.bpf();

        // SAFETY: initialised client
        let padding = unsafe { ctx.object.client.GetCurrentPadding() }
            .map_err(|e| e.code().0)?;
        if padding >= ctx.client_buf_size {
            tracing::trace!("Padding {padding} >= buffer size {}", ctx.client_buf_size);
            return Ok(());
        }

        let can_write_total = ctx.client_buf_size - padding;
        let mut can_write_bytes = can_write_total as usize * bpf;

        tracing::trace!(
            "Writing {can_write_total} frames offset at {}",
            self.write_frame_offset
        );
        self.write_frame_offset += u64::from(can_write_total);

        while can_write_bytes > 0 {
            let Some(seg) = ring.prepare_read() else {
                // Mid state change; feed silence so the event does not
                // immediately re-fire
                // SAFETY: buffer released right away
                unsafe {
                    let _ = render_client.GetBuffer(can_write_total).map_err(|e| e.code().0)?;
                    return render_client
                        .ReleaseBuffer(can_write_total, BUFFERFLAGS_SILENT)
                        .map_err(|e| e.code().0);
                }
            };

            let segment = seg.segment;
            let mut len = seg.data.len() - self.segoffset;
            if len > can_write_bytes {
                len = can_write_bytes;
            }
            let can_write = (len / bpf) as u32;
            if can_write == 0 {
                break;
            }
            let len = can_write as usize * bpf;

            // SAFETY: device hands a buffer of can_write frames; we copy
            // exactly len bytes into it before release
            let release_result = unsafe {
                let data = render_client.GetBuffer(can_write).map_err(|e| e.code().0)?;
                let dst = std::slice::from_raw_parts_mut(data, len);
                let src = &seg.data[self.segoffset..self.segoffset + len];
                if ctx.is_s24in32 {
                    repack::s24_lsb_to_msb(dst, src);
                } else {
                    dst.copy_from_slice(src);
                }
                render_client.ReleaseBuffer(can_write, 0)
            };
            drop(seg);

            self.segoffset += len;
            can_write_bytes -= len;

            if self.segoffset == spec.segsize {
                ring.clear_segment(segment);
                ring.advance(1);
                self.segoffset = 0;
            }

            if release_result.is_err() {
                tracing::warn!("Failed to release buffer");
                break;
            }
        }

        Ok(())
    }

    /// Exclusive-mode render: assemble exactly one period in the staging
    /// buffer, then hand it over in a single release
    fn process_write_exclusive(&mut self) -> Result<(), i32> {
        let Some(ctx) = self.ctx.as_mut() else {
            return Err(hresult::E_FAIL);
        };
        let Some(ring) = self.ring.as_ref() else {
            return Err(hresult::E_FAIL);
        };
        if ctx.render_client.is_none() {
            tracing::error!("Render client is not available");
            return Err(hresult::E_FAIL);
        }

        let spec = ring.spec().clone();
        let period_bytes = ctx.period_bytes;

        if ctx.conv.is_some() {
            let host_bpf = ctx.host_info.as_ref().map(|i| i.bpf()).unwrap_or(spec.info.bpf());
            let device_bpf = ctx.device_info.as_ref().map(|i| i.bpf()).unwrap_or(host_bpf);

            while ctx.staging_filled < period_bytes {
                let mut processed_any = false;

                // Pull host bytes from the ring
                if let Some(seg) = ring.prepare_read() {
                    let segment = seg.segment;
                    let len = seg.data.len() - self.segoffset;
                    if len > 0 {
                        ctx.host_fifo
                            .extend_from_slice(&seg.data[self.segoffset..]);
                        drop(seg);
                        processed_any = true;
                        self.segoffset += len;
                        if self.segoffset == spec.segsize {
                            ring.clear_segment(segment);
                            ring.advance(1);
                            self.segoffset = 0;
                        }
                    }
                }

                // Convert host fifo into device-layout bytes
                let host_frames = ctx.host_fifo.len() / host_bpf;
                if host_frames > 0 {
                    let conv = ctx.conv.as_mut().expect("checked above");
                    let out_frames = conv.out_frames(host_frames);
                    if out_frames > 0 {
                        let in_bytes = host_frames * host_bpf;
                        let out_bytes = out_frames * device_bpf;
                        self.temp.resize(out_bytes, 0);
                        if conv
                            .convert(&ctx.host_fifo[..in_bytes], &mut self.temp)
                            .is_err()
                        {
                            tracing::error!("Sample conversion failed");
                            return Err(hresult::E_FAIL);
                        }
                        ctx.host_fifo.drain(..in_bytes);

                        let old = ctx.device_fifo.len();
                        ctx.device_fifo.resize(old + out_bytes, 0);
                        if ctx.is_s24in32 {
                            repack::s24_lsb_to_msb(
                                &mut ctx.device_fifo[old..],
                                &self.temp[..out_bytes],
                            );
                        } else {
                            ctx.device_fifo[old..].copy_from_slice(&self.temp[..out_bytes]);
                        }
                        processed_any = true;
                    }
                }

                // Move device bytes into the staging buffer
                if !ctx.device_fifo.is_empty() && ctx.staging_filled < period_bytes {
                    let need = period_bytes - ctx.staging_filled;
                    let to_copy = need.min(ctx.device_fifo.len());
                    ctx.staging[ctx.staging_filled..ctx.staging_filled + to_copy]
                        .copy_from_slice(&ctx.device_fifo[..to_copy]);
                    ctx.staging_filled += to_copy;
                    ctx.device_fifo.drain(..to_copy);
                    if to_copy > 0 {
                        processed_any = true;
                    }
                }

                if !processed_any || ctx.staging_filled >= period_bytes {
                    break;
                }
            }
        } else {
            while ctx.staging_filled < period_bytes {
                let Some(seg) = ring.prepare_read() else {
                    break;
                };
                let segment = seg.segment;
                let len = seg.data.len() - self.segoffset;
                if len == 0 {
                    break;
                }

                let remain = period_bytes - ctx.staging_filled;
                let to_copy = len.min(remain);
                let dst = &mut ctx.staging[ctx.staging_filled..ctx.staging_filled + to_copy];
                let src = &seg.data[self.segoffset..self.segoffset + to_copy];
                if ctx.is_s24in32 {
                    repack::s24_lsb_to_msb(dst, src);
                } else {
                    dst.copy_from_slice(src);
                }
                drop(seg);

                self.segoffset += to_copy;
                ctx.staging_filled += to_copy;

                if self.segoffset == spec.segsize {
                    ring.clear_segment(segment);
                    ring.advance(1);
                    self.segoffset = 0;
                }

                if ctx.staging_filled >= period_bytes {
                    break;
                }
            }
        }

        let render_client = ctx.render_client.as_ref().expect("checked above");

        tracing::trace!(
            "Writing {} frames offset at {}",
            ctx.period,
            self.write_frame_offset
        );
        self.write_frame_offset += u64::from(ctx.period);

        // SAFETY: one period handed out and released exactly once
        unsafe {
            let data = render_client.GetBuffer(ctx.period).map_err(|e| e.code().0)?;

            if ctx.staging_filled < period_bytes {
                tracing::trace!(
                    "Staging buffer not filled {} < {period_bytes}",
                    ctx.staging_filled
                );
                render_client
                    .ReleaseBuffer(ctx.period, BUFFERFLAGS_SILENT)
                    .map_err(|e| e.code().0)?;
            } else {
                std::ptr::copy_nonoverlapping(ctx.staging.as_ptr(), data, period_bytes);
                render_client
                    .ReleaseBuffer(ctx.period, 0)
                    .map_err(|e| e.code().0)?;
                ctx.staging_filled = 0;
            }
        }

        Ok(())
    }

    /// Keep the loopback endpoint ticking by feeding the silence stream
    fn fill_loopback_silence(&mut self) -> Result<(), i32> {
        let Some(ctx) = self.ctx.as_mut() else {
            return Err(hresult::E_FAIL);
        };
        let (Some(dummy), Some(render_client)) =
            (ctx.object.dummy_client.as_ref(), ctx.render_client.as_ref())
        else {
            tracing::error!("Silence-feed clients are not available");
            return Err(hresult::E_FAIL);
        };

        // SAFETY: initialised dummy client and render service
        unsafe {
            let padding = dummy.GetCurrentPadding().map_err(|e| e.code().0)?;
            if padding >= ctx.dummy_buf_size {
                return Ok(());
            }
            let can_write = ctx.dummy_buf_size - padding;
            tracing::trace!("Writing {can_write} silent frames");

            let _ = render_client.GetBuffer(can_write).map_err(|e| e.code().0)?;
            render_client
                .ReleaseBuffer(can_write, BUFFERFLAGS_SILENT)
                .map_err(|e| e.code().0)
        }
    }

    // ------------------------------------------------------------------
    // Capture path
    // ------------------------------------------------------------------

    fn process_read(&mut self) -> Result<(), i32> {
        let Some(ctx) = self.ctx.as_mut() else {
            return Err(hresult::E_FAIL);
        };
        let Some(ring) = self.ring.as_ref() else {
            return Err(hresult::E_FAIL);
        };
        let Some(capture_client) = ctx.capture_client.as_ref() else {
            tracing::error!("Capture client is not available");
            return Err(hresult::E_FAIL);
        };

        let spec = ring.spec().clone();
        let host_bpf = spec.info.bpf();

        let mut data: *mut u8 = std::ptr::null_mut();
        let mut to_read_frames: u32 = 0;
        let mut flags: u32 = 0;
        let mut position: u64 = 0;
        let mut qpc_pos: u64 = 0;

        // SAFETY: out params written by the call; buffer released below
        unsafe {
            capture_client
                .GetBuffer(
                    &mut data,
                    &mut to_read_frames,
                    &mut flags,
                    Some(&mut position),
                    Some(&mut qpc_pos),
                )
                .map_err(|e| e.code().0)?;
        }

        tracing::trace!(
            "Reading {to_read_frames} frames at position {position}, expected {}, flags 0x{flags:x}",
            self.expected_position
        );

        if to_read_frames == 0 {
            tracing::trace!("Empty buffer");
            return Ok(());
        }

        // Device position gaps become silence so the host timeline stays
        // contiguous; process loopback positions are not reliable
        let mut gap_dev_frames = 0usize;
        if !ctx.object.class.is_process_loopback() {
            if self.is_first {
                self.expected_position = position + u64::from(to_read_frames);
                self.is_first = false;
            } else {
                if position > self.expected_position {
                    gap_dev_frames = (position - self.expected_position) as usize;
                    tracing::warn!("Found {gap_dev_frames} frames gap");
                }
                self.expected_position = position + u64::from(to_read_frames);
            }
        } else if self.shared.mute.load(Ordering::Relaxed) {
            // No stream volume on the virtual device; force silence instead
            flags |= BUFFERFLAGS_SILENT;
        }

        let device_muted = self.shared.monitor_device_mute.load(Ordering::Acquire)
            && ctx.endpoint_muted();
        let force_silence = (flags & BUFFERFLAGS_SILENT) != 0 || device_muted;

        let device_bpf = if ctx.conv.is_some() {
            ctx.device_info.as_ref().map(|i| i.bpf()).unwrap_or(host_bpf)
        } else {
            host_bpf
        };

        let device_silence = ctx
            .device_info
            .as_ref()
            .map(|i| i.format.silence_byte())
            .unwrap_or(0);

        // Gap first
        if gap_dev_frames > 0 {
            if ctx.conv.is_some() {
                let gap_bytes = gap_dev_frames * device_bpf;
                let old = ctx.device_fifo.len();
                ctx.device_fifo.resize(old + gap_bytes, device_silence);
            } else {
                let mut gap_bytes = gap_dev_frames * host_bpf;
                while gap_bytes > 0 {
                    let Some(seg) = ring.prepare_read() else {
                        break;
                    };
                    let avail = seg.data.len() - self.segoffset;
                    if avail == 0 {
                        break;
                    }
                    let to_write = gap_bytes.min(avail);
                    spec.info.fill_silence(
                        &mut seg.data[self.segoffset..self.segoffset + to_write],
                    );
                    drop(seg);

                    self.segoffset += to_write;
                    gap_bytes -= to_write;

                    if self.segoffset == spec.segsize {
                        ring.advance(1);
                        self.segoffset = 0;
                    }
                }
            }
        }

        let release_frames = to_read_frames;
        let in_bytes = to_read_frames as usize * device_bpf;

        if ctx.conv.is_some() {
            // Device bytes into the device fifo, silence-aware
            let old = ctx.device_fifo.len();
            ctx.device_fifo.resize(old + in_bytes, device_silence);
            if !force_silence {
                // SAFETY: device buffer holds to_read_frames * device_bpf bytes
                let src = unsafe { std::slice::from_raw_parts(data, in_bytes) };
                if ctx.is_s24in32 {
                    repack::s24_msb_to_lsb(&mut ctx.device_fifo[old..], src);
                } else {
                    ctx.device_fifo[old..].copy_from_slice(src);
                }
            }

            // Convert everything frame-aligned in the device fifo
            let avail_frames = ctx.device_fifo.len() / device_bpf;
            if avail_frames > 0 {
                let conv = ctx.conv.as_mut().expect("checked above");
                let out_frames = conv.out_frames(avail_frames);
                if out_frames > 0 {
                    let consumed = avail_frames * device_bpf;
                    let out_bytes = out_frames * host_bpf;
                    self.temp.resize(out_bytes, 0);
                    if conv
                        .convert(&ctx.device_fifo[..consumed], &mut self.temp)
                        .is_err()
                    {
                        tracing::error!("Sample conversion failed");
                        // SAFETY: pairing the GetBuffer above
                        unsafe {
                            let _ = capture_client.ReleaseBuffer(release_frames);
                        }
                        return Err(hresult::E_FAIL);
                    }
                    ctx.device_fifo.drain(..consumed);
                    ctx.host_fifo.extend_from_slice(&self.temp[..out_bytes]);
                }
            }

            // Drain the host fifo into ring segments
            while !ctx.host_fifo.is_empty() {
                let Some(seg) = ring.prepare_read() else {
                    break;
                };
                let avail = seg.data.len() - self.segoffset;
                if avail == 0 {
                    break;
                }
                let to_copy = ctx.host_fifo.len().min(avail);
                seg.data[self.segoffset..self.segoffset + to_copy]
                    .copy_from_slice(&ctx.host_fifo[..to_copy]);
                drop(seg);

                ctx.host_fifo.drain(..to_copy);
                self.segoffset += to_copy;

                if self.segoffset == spec.segsize {
                    ring.advance(1);
                    self.segoffset = 0;
                }

                if to_copy == 0 {
                    break;
                }
            }
        } else {
            let mut remain = in_bytes;
            let mut offset = 0usize;

            while remain > 0 {
                let Some(seg) = ring.prepare_read() else {
                    tracing::debug!("No segment available");
                    break;
                };
                let avail = seg.data.len() - self.segoffset;
                if avail == 0 {
                    break;
                }
                let to_write = remain.min(avail);
                let dst = &mut seg.data[self.segoffset..self.segoffset + to_write];
                if force_silence {
                    spec.info.fill_silence(dst);
                } else {
                    // SAFETY: bounded by the frames GetBuffer reported
                    let src = unsafe { std::slice::from_raw_parts(data.add(offset), to_write) };
                    if ctx.is_s24in32 {
                        repack::s24_msb_to_lsb(dst, src);
                    } else {
                        dst.copy_from_slice(src);
                    }
                }
                drop(seg);

                self.segoffset += to_write;
                offset += to_write;
                remain -= to_write;

                if self.segoffset == spec.segsize {
                    ring.advance(1);
                    self.segoffset = 0;
                }
            }
        }

        // SAFETY: pairing the GetBuffer above
        let hr = unsafe { capture_client.ReleaseBuffer(release_frames) };
        if let Err(e) = hr {
            tracing::warn!("ReleaseBuffer failed: {e}");
        }

        Ok(())
    }
}

fn io_thread(
    rx: Receiver<Command>,
    wake: Arc<Event>,
    handle: RbufHandle,
    shared: Arc<RbufShared>,
    messages: Sender<StreamMessage>,
    invalidated: InvalidatedCallback,
) {
    // Tag the thread for the multimedia scheduler
    let mut task_idx = 0u32;
    // SAFETY: plain scheduling hint, reverted before exit
    let task_handle =
        unsafe { AvSetMmThreadCharacteristicsW(windows::core::w!("Pro Audio"), &mut task_idx) }
            .ok();

    let _com = match ComGuard::new() {
        Ok(c) => c,
        Err(e) => {
            tracing::error!("I/O thread COM init failed: {e}");
            return;
        }
    };

    // Idle placeholders so commands always outrank stale I/O wakes
    let (Ok(dummy_render), Ok(dummy_capture)) = (Event::auto_reset(), Event::auto_reset()) else {
        tracing::error!("Couldn't create idle events");
        return;
    };

    let (Ok(fallback_timer), Ok(monitor_timer)) = (
        WaitableTimer::high_resolution(),
        WaitableTimer::default_resolution(),
    ) else {
        tracing::error!("Couldn't create timers");
        return;
    };

    let mut state = IoState {
        handle,
        shared,
        messages,
        invalidated,
        device_id: String::new(),
        class: EndpointClass::Render,
        pid: 0,
        low_latency: false,
        exclusive: false,
        ctx: None,
        ring: None,
        caps: None,
        mix_format: None,
        opened: false,
        running: false,
        configured_allow_dummy: false,
        is_first: true,
        segoffset: 0,
        write_frame_offset: 0,
        expected_position: 0,
        fallback_timer,
        fallback_armed: false,
        fallback_frames_processed: 0,
        fallback_qpc_base: 0,
        qpc_freq: qpc_frequency(),
        monitor_timer,
        monitor_armed: false,
        temp: Vec::new(),
    };

    let default_caps = Caps::from_formats(&[WaveFormat::default_mix()]);

    let mut waitables: [HANDLE; 5] = [
        dummy_render.raw(),
        dummy_capture.raw(),
        state.fallback_timer.raw(),
        state.monitor_timer.raw(),
        wake.raw(),
    ];

    tracing::debug!("Entering I/O loop");

    let mut loop_running = true;
    while loop_running {
        // SAFETY: all five handles stay alive for the loop's lifetime
        let wait_ret = unsafe { WaitForMultipleObjects(&waitables, false, INFINITE) };
        let index = wait_ret.0.wrapping_sub(WAIT_OBJECT_0.0);

        match index {
            // Render event (also the loopback silence-feed tick)
            0 => {
                if state.running && state.ctx.is_some() {
                    let result = if state.ctx.as_ref().is_some_and(|c| c.class().is_loopback()) {
                        state
                            .fill_loopback_silence()
                            .and_then(|()| state.process_read())
                    } else if state.ctx.as_ref().is_some_and(|c| c.object.exclusive) {
                        state.process_write_exclusive()
                    } else {
                        state.process_write()
                    };

                    if let Err(hr) = result {
                        state.post_io_error(hr, true);
                        state.start_fallback_timer();
                    }
                }
            }
            // Capture event
            1 => {
                if state.running && state.ctx.is_some() {
                    let mut result = state.process_read();

                    if let Err(hr) = result {
                        let is_default = state.ctx.as_ref().is_some_and(|c| c.object.is_default);
                        let is_loopback =
                            state.ctx.as_ref().is_some_and(|c| c.class().is_loopback());
                        if (hr == hresult::AUDCLNT_E_ENDPOINT_CREATE_FAILED
                            || hr == hresult::AUDCLNT_E_DEVICE_INVALIDATED)
                            && is_default
                            && !is_loopback
                        {
                            // The OS reroutes default-endpoint streams on
                            // its own; swallow and carry on
                            tracing::warn!(
                                "Device was unplugged but automatic routing will recover"
                            );
                            result = Ok(());
                        }

                        if let Err(hr) = result {
                            state.post_io_error(hr, false);
                            state.start_fallback_timer();
                        }
                    }
                }
            }
            // Fallback timer
            2 => {
                if state.running && state.fallback_armed {
                    state.process_fallback_tick();
                }
            }
            // Monitor timer
            3 => {
                if state.running && state.monitor_armed {
                    if let Some(ctx) = state.ctx.as_mut() {
                        // SAFETY: valid client
                        let hr = unsafe { ctx.object.client.GetCurrentPadding() };
                        if let Err(e) = hr {
                            if e.code().0 == hresult::AUDCLNT_E_DEVICE_INVALIDATED
                                && !ctx.error_posted
                            {
                                ctx.error_posted = true;
                                let is_write = state.class == EndpointClass::Render;
                                state.post_io_error(
                                    hresult::AUDCLNT_E_DEVICE_INVALIDATED,
                                    is_write,
                                );
                                state.start_fallback_timer();
                            }
                        }
                    }
                }
            }
            // Command wake
            4 => {}
            _ => {
                tracing::warn!("Unexpected wait return 0x{:x}", wait_ret.0);
                loop_running = false;
            }
        }

        // Drain the command queue after every wake
        loop {
            let cmd = match rx.try_recv() {
                Ok(cmd) => cmd,
                Err(TryRecvError::Empty) => break,
                Err(TryRecvError::Disconnected) => {
                    loop_running = false;
                    break;
                }
            };

            let cmd_name = cmd.name();
            tracing::debug!("Got command {cmd_name}");

            match cmd {
                Command::Shutdown { done } => {
                    loop_running = false;
                    let _ = done.send(());
                }
                Command::SetDevice {
                    device_id,
                    class,
                    pid,
                    low_latency,
                    exclusive,
                    done,
                } => {
                    state.device_id = device_id;
                    state.class = class;
                    state.pid = pid;
                    state.low_latency = low_latency;
                    state.exclusive = exclusive;

                    if state.opened {
                        tracing::debug!("Device is open, creating context asynchronously");
                        DeviceManager::global()
                            .create_ctx_async(state.desc(), state.handle.clone());
                    }
                    let _ = done.send(());
                }
                Command::UpdateDevice {
                    device_id,
                    ctx,
                    done,
                } => {
                    if state.opened {
                        tracing::debug!("Updating device");
                        state.stop_fallback_timer();

                        state.ctx = ctx.map(|b| *b);

                        if let Some(new_ctx) = state.ctx.as_mut() {
                            if !new_ctx.init_done {
                                if let Some(format) = state.mix_format {
                                    if let Err(e) = new_ctx.init(&format) {
                                        tracing::warn!("Couldn't initialize context: {e}");
                                        state.ctx = None;
                                    }
                                }
                            }
                        }

                        if let Some(new_ctx) = state.ctx.as_ref() {
                            waitables[0] = new_ctx.render_event.raw();
                            waitables[1] = new_ctx.capture_event.raw();
                        } else {
                            waitables[0] = dummy_render.raw();
                            waitables[1] = dummy_capture.raw();
                            let failed_id = device_id;
                            tracing::warn!("Device update failed for {failed_id}");
                            state.post_open_error();
                            if !state.configured_allow_dummy {
                                let _ = done.send(());
                                continue;
                            }
                        }

                        state.apply_volume();

                        if state.running {
                            state.running = false;
                            state.process_start(false);
                        }
                    }
                    let _ = done.send(());
                }
                Command::Open { done } => {
                    state.configured_allow_dummy =
                        state.shared.allow_dummy.load(Ordering::Relaxed);
                    state.mix_format = None;
                    state.ctx = DeviceManager::global().create_ctx(state.desc());

                    let hr = if let Some(ctx) = state.ctx.as_ref() {
                        waitables[0] = ctx.render_event.raw();
                        waitables[1] = ctx.capture_event.raw();
                        state.caps = Some(ctx.caps().clone());
                        state.opened = true;
                        hresult::S_OK
                    } else {
                        state.caps = None;
                        waitables[0] = dummy_render.raw();
                        waitables[1] = dummy_capture.raw();
                        state.post_open_error();

                        if state.configured_allow_dummy {
                            state.caps = Some(default_caps.clone());
                            state.opened = true;
                            hresult::S_OK
                        } else {
                            hresult::E_FAIL
                        }
                    };
                    let _ = done.send(hr);
                }
                Command::Close { done } => {
                    waitables[0] = dummy_render.raw();
                    waitables[1] = dummy_capture.raw();
                    state.ctx = None;
                    state.caps = None;
                    state.opened = false;
                    state.mix_format = None;
                    state.stop_fallback_timer();
                    let _ = done.send(());
                }
                Command::Acquire { info, reply } => {
                    if state.ctx.is_none() {
                        state.ctx = DeviceManager::global().create_ctx(state.desc());
                        if state.ctx.is_none() {
                            tracing::warn!("No context configured");
                            state.post_open_error();
                            if !state.configured_allow_dummy {
                                let _ = reply.send(Err(hresult::E_FAIL));
                                continue;
                            }
                        }
                    }

                    let result = state.process_acquire(&info);

                    if result.is_ok() {
                        if let Some(ctx) = state.ctx.as_ref() {
                            waitables[0] = ctx.render_event.raw();
                            waitables[1] = ctx.capture_event.raw();
                        } else {
                            waitables[0] = dummy_render.raw();
                            waitables[1] = dummy_capture.raw();
                        }
                    }

                    let _ = reply.send(result);
                }
                Command::Release { done } => {
                    if let Some(ring) = state.ring.take() {
                        ring.set_active(false);
                    }
                    state.stop_fallback_timer();
                    let _ = done.send(());
                }
                Command::Start { done } => {
                    let _ = done.send(state.process_start(true));
                }
                Command::Stop { done } => {
                    let _ = done.send(state.process_stop());
                }
                Command::GetCaps { reply } => {
                    let _ = reply.send(state.caps.clone());
                }
                Command::UpdateVolume => {
                    state.apply_volume();
                }
            }

            tracing::debug!("Command {cmd_name} processed");
        }
    }

    // Tear down on this thread so COM objects release in their apartment
    state.ctx = None;
    state.ring = None;
    state.stop_fallback_timer();
    state.stop_monitor_timer();

    if let Some(task_handle) = task_handle {
        // SAFETY: handle returned by AvSetMmThreadCharacteristicsW
        unsafe {
            let _ = AvRevertMmThreadCharacteristics(task_handle);
        }
    }

    tracing::debug!("Exit I/O loop");
}
