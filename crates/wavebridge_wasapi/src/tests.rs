//! Hardware-backed integration tests
//!
//! These exercise the real WASAPI surface and only run on Windows; machines
//! without audio endpoints skip the assertions that need one.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use crossbeam_channel::unbounded;

use wavebridge_core::{AudioInfo, EndpointClass, SampleFormat, StreamMessage};

use crate::provider::DeviceProvider;
use crate::rbuf::Rbuf;

fn init_logging() {
    use std::sync::Once;
    static ONCE: Once = Once::new();
    ONCE.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .try_init();
    });
}

fn test_rbuf() -> (Rbuf, crossbeam_channel::Receiver<StreamMessage>, Arc<AtomicU32>) {
    init_logging();
    let (msg_tx, msg_rx) = unbounded();
    let invalidations = Arc::new(AtomicU32::new(0));
    let counter = Arc::clone(&invalidations);
    let rbuf = Rbuf::new(
        msg_tx,
        Box::new(move || {
            counter.fetch_add(1, Ordering::SeqCst);
        }),
    )
    .expect("spawn rbuf");
    (rbuf, msg_rx, invalidations)
}

#[test]
fn test_provider_probe() {
    let (event_tx, _event_rx) = unbounded();
    let provider = DeviceProvider::new(event_tx).expect("create provider");

    let devices = provider.probe().expect("probe");
    println!("Found {} devices", devices.len());
    for dev in &devices {
        println!(
            "  {} [{:?}] default={} loopback={}",
            dev.display_name, dev.class, dev.is_default, dev.props.loopback
        );
    }

    // Every render endpoint must appear as both sink and loopback source
    let sinks = devices
        .iter()
        .filter(|d| d.class == crate::provider::DeviceClass::Sink)
        .count();
    let loopbacks = devices
        .iter()
        .filter(|d| d.class == crate::provider::DeviceClass::LoopbackSource)
        .count();
    assert_eq!(sinks, loopbacks);
}

#[test]
fn test_default_render_open_acquire_start() {
    let (rbuf, msg_rx, _invalidations) = test_rbuf();

    rbuf.set_device(None, EndpointClass::Render, 0, false, false)
        .expect("set device");

    if rbuf.open_device().is_err() {
        eprintln!("no render endpoint available, skipping");
        return;
    }

    let caps = rbuf.caps().expect("caps after open");
    assert!(!caps.is_empty());

    let info = AudioInfo::new(SampleFormat::S16Le, 48000, 2);
    let ring = rbuf.acquire(info).expect("acquire");

    let spec = ring.spec().clone();
    assert_eq!(spec.segsize, spec.period_frames() * 4);
    assert!(spec.segtotal >= 2);
    assert_eq!(spec.seglatency, 2);

    // Queue a 1 kHz tone ahead of the device cursor, then start
    let period = spec.period_frames();
    let mut phase = 0f32;
    let step = 2.0 * std::f32::consts::PI * 1000.0 / 48000.0;
    for segment in 0..8u64 {
        let mut bytes = Vec::with_capacity(spec.segsize);
        for _ in 0..period {
            let value = (phase.sin() * 0.5 * f32::from(i16::MAX)) as i16;
            bytes.extend_from_slice(&value.to_le_bytes());
            bytes.extend_from_slice(&value.to_le_bytes());
            phase += step;
        }
        ring.write(segment, 0, &bytes).unwrap();
    }

    rbuf.start().expect("start");
    std::thread::sleep(Duration::from_millis(200));
    assert!(ring.segdone() > 0, "device consumed no segments");

    // Start twice must be a no-op
    rbuf.start().expect("second start");

    rbuf.stop().expect("stop");
    rbuf.stop().expect("second stop");
    rbuf.release().expect("release");
    rbuf.close_device().expect("close");

    // A healthy run posts no messages
    assert!(msg_rx.try_recv().is_err());
}

#[test]
fn test_loopback_capture_idle_endpoint() {
    let (rbuf, _msg_rx, _invalidations) = test_rbuf();

    rbuf.set_device(None, EndpointClass::LoopbackCapture, 0, false, false)
        .expect("set device");

    if rbuf.open_device().is_err() {
        eprintln!("no render endpoint available, skipping");
        return;
    }

    let info = AudioInfo::new(SampleFormat::F32Le, 48000, 2);
    let ring = match rbuf.acquire(info) {
        Ok(r) => r,
        Err(e) => {
            eprintln!("loopback acquire failed ({e}), skipping");
            return;
        }
    };

    rbuf.start().expect("start");

    // The silence feed must keep segments advancing with nothing rendering
    std::thread::sleep(Duration::from_millis(300));
    let advanced = ring.segdone();
    assert!(advanced > 0, "loopback produced no segments");

    rbuf.stop().expect("stop");
    rbuf.release().expect("release");
    rbuf.close_device().expect("close");
}

#[test]
fn test_open_failure_continue_on_error() {
    let (rbuf, msg_rx, invalidations) = test_rbuf();

    rbuf.set_continue_on_error(true);
    rbuf.set_device(
        Some("{0.0.0.00000000}.{00000000-0000-0000-0000-000000000000}"),
        EndpointClass::Capture,
        0,
        false,
        false,
    )
    .expect("set device");

    // Open succeeds in fallback mode and reports default caps
    rbuf.open_device().expect("open with continue-on-error");
    let caps = rbuf.caps().expect("fallback caps");
    assert!(!caps.is_empty());

    // Warnings, not errors, and the invalidation callback fired
    let msg = msg_rx
        .recv_timeout(Duration::from_secs(1))
        .expect("warning posted");
    assert!(!msg.is_error());
    assert!(invalidations.load(Ordering::SeqCst) >= 1);

    // The fallback clock keeps capture silence flowing; acquire retries the
    // device once more and may post another warning doing so
    let info = AudioInfo::new(SampleFormat::S16Le, 16000, 1);
    let ring = rbuf.acquire(info).expect("acquire in fallback mode");
    while msg_rx.try_recv().is_ok() {}
    rbuf.start().expect("start in fallback mode");

    std::thread::sleep(Duration::from_millis(300));
    assert!(ring.segdone() > 0, "fallback clock did not advance");

    rbuf.stop().expect("stop");
    rbuf.release().expect("release");
    rbuf.close_device().expect("close");
}

#[test]
fn test_open_failure_without_continue_errors() {
    let (rbuf, msg_rx, _invalidations) = test_rbuf();

    rbuf.set_device(
        Some("{0.0.0.00000000}.{00000000-0000-0000-0000-000000000000}"),
        EndpointClass::Capture,
        0,
        false,
        false,
    )
    .expect("set device");

    assert!(rbuf.open_device().is_err());
    let msg = msg_rx
        .recv_timeout(Duration::from_secs(1))
        .expect("error posted");
    assert!(msg.is_error());
}

#[test]
fn test_volume_mute_roundtrip() {
    let (rbuf, _msg_rx, _invalidations) = test_rbuf();

    // Cached values never block, device or not
    rbuf.set_volume(0.25);
    assert!((rbuf.volume() - 0.25).abs() < 1e-6);

    rbuf.set_mute(true);
    assert!(rbuf.mute());
    rbuf.set_mute(false);
    assert!(!rbuf.mute());
}

#[test]
fn test_delay_reports_zero() {
    let (rbuf, _msg_rx, _invalidations) = test_rbuf();
    assert_eq!(rbuf.delay(), 0);
}
