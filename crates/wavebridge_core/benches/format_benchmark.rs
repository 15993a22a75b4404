//! Hot-path benchmarks: comparator sort over a full probe grid and the
//! S24-in-32 repack in both directions.

use criterion::{black_box, criterion_group, criterion_main, Criterion};

use wavebridge_core::compare::sort_formats;
use wavebridge_core::format::WaveFormat;
use wavebridge_core::repack::{s24_lsb_to_msb, s24_msb_to_lsb};

fn probe_grid() -> Vec<WaveFormat> {
    let mut list = Vec::new();
    for rate in [192000u32, 176400, 96000, 88200, 48000, 44100] {
        for ch in [8u16, 6, 2, 1] {
            list.push(WaveFormat::extensible(ch, rate, 32, 32, true));
            list.push(WaveFormat::extensible(ch, rate, 32, 32, false));
            list.push(WaveFormat::extensible(ch, rate, 24, 24, false));
            list.push(WaveFormat::extensible(ch, rate, 16, 16, false));
            list.push(WaveFormat::extensible(ch, rate, 32, 24, false));
        }
    }
    list
}

fn bench_sort(c: &mut Criterion) {
    let basis = WaveFormat::extensible(2, 48000, 32, 24, false);
    c.bench_function("sort_probe_grid", |b| {
        b.iter_batched(
            probe_grid,
            |mut list| sort_formats(black_box(&mut list), &basis),
            criterion::BatchSize::SmallInput,
        )
    });
}

fn bench_repack(c: &mut Criterion) {
    // One 10ms period of 8ch 48kHz S24-in-32
    let frames = 480 * 8;
    let src: Vec<u8> = (0..frames * 4).map(|i| i as u8).collect();
    let mut dst = vec![0u8; src.len()];

    c.bench_function("s24_capture_repack", |b| {
        b.iter(|| s24_msb_to_lsb(black_box(&mut dst), black_box(&src)))
    });
    c.bench_function("s24_render_repack", |b| {
        b.iter(|| s24_lsb_to_msb(black_box(&mut dst), black_box(&src)))
    });
}

criterion_group!(benches, bench_sort, bench_repack);
criterion_main!(benches);
