//! Segment Ring Buffer
//!
//! The buffer shared between the pipeline and the device I/O thread. Memory
//! is one contiguous region split into `segtotal` segments of `segsize`
//! bytes. The device side consumes (render) or fills (capture) the segment
//! at the `segdone` cursor via `prepare_read` / `advance` / `clear`; the
//! pipeline side reads or writes whole segments relative to that cursor.
//!
//! # Synchronization
//!
//! Coordination is at segment granularity: the device side only touches the
//! segment at `segdone`, the pipeline side only touches segments at other
//! indices, and `segdone` is the single atomic both observe. That is the
//! entire contract; there are no locks on the data path.

use std::cell::UnsafeCell;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use crate::error::{CoreError, CoreResult};
use crate::info::AudioInfo;

/// Ring geometry negotiated during acquire
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RingSpec {
    pub info: AudioInfo,
    /// Segment size in bytes; one device period
    pub segsize: usize,
    pub segtotal: usize,
    /// Target fill level in segments reported to the pipeline
    pub seglatency: usize,
}

impl RingSpec {
    /// Geometry for a device period: segment = one period, total sized for
    /// roughly half a second so device swaps have headroom, latency pinned
    /// at two segments
    pub fn for_period(info: AudioInfo, period_frames: usize) -> CoreResult<RingSpec> {
        if period_frames == 0 {
            return Err(CoreError::InvalidSpec("zero period".into()));
        }

        let bpf = info.bpf();
        let target_frames = info.rate as usize / 2;
        let segtotal = (target_frames + period_frames - 1) / period_frames;

        Ok(RingSpec {
            segsize: period_frames * bpf,
            segtotal: segtotal.max(2),
            seglatency: 2,
            info,
        })
    }

    pub fn period_frames(&self) -> usize {
        self.segsize / self.info.bpf()
    }

    pub fn total_bytes(&self) -> usize {
        self.segsize * self.segtotal
    }
}

/// Borrowed view of the segment under the device cursor
pub struct RingSegment<'a> {
    pub segment: u64,
    pub data: &'a mut [u8],
}

/// The shared ring
pub struct SegmentRing {
    spec: RingSpec,
    memory: UnsafeCell<Box<[u8]>>,
    /// Segments fully processed by the device side
    segdone: AtomicU64,
    active: AtomicBool,
}

// SAFETY: all access to `memory` goes through the segment APIs below, which
// partition the region by segment index. The device side owns the segment at
// `segdone`, the pipeline side the rest; `segdone` is atomic. Two callers
// violating the contract would race, which is exactly the guarantee the
// pipeline ring-buffer contract already demands of its users.
unsafe impl Send for SegmentRing {}
unsafe impl Sync for SegmentRing {}

impl SegmentRing {
    /// Allocate silenced memory for the spec
    pub fn allocate(spec: RingSpec) -> CoreResult<Arc<SegmentRing>> {
        if spec.segsize == 0 || spec.segtotal < 2 {
            return Err(CoreError::InvalidSpec(format!(
                "segsize {} segtotal {}",
                spec.segsize, spec.segtotal
            )));
        }

        let mut memory = vec![0u8; spec.total_bytes()].into_boxed_slice();
        spec.info.fill_silence(&mut memory);

        tracing::debug!(
            "Ring allocated: segsize {} bytes, segtotal {}, {} total",
            spec.segsize,
            spec.segtotal,
            spec.total_bytes()
        );

        Ok(Arc::new(SegmentRing {
            spec,
            memory: UnsafeCell::new(memory),
            segdone: AtomicU64::new(0),
            active: AtomicBool::new(false),
        }))
    }

    pub fn spec(&self) -> &RingSpec {
        &self.spec
    }

    pub fn set_active(&self, active: bool) {
        self.active.store(active, Ordering::Release);
    }

    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::Acquire)
    }

    /// Segments processed so far
    pub fn segdone(&self) -> u64 {
        self.segdone.load(Ordering::Acquire)
    }

    fn segment_range(&self, segment: u64) -> std::ops::Range<usize> {
        let idx = (segment % self.spec.segtotal as u64) as usize;
        idx * self.spec.segsize..(idx + 1) * self.spec.segsize
    }

    /// Current segment for the device side, `None` while inactive
    ///
    /// Device side only; see the module-level synchronization contract.
    pub fn prepare_read(&self) -> Option<RingSegment<'_>> {
        if !self.is_active() {
            return None;
        }

        let segment = self.segdone.load(Ordering::Acquire);
        let range = self.segment_range(segment);
        // SAFETY: the device side holds exclusive access to the segment at
        // `segdone` until it calls advance()
        let data = unsafe { &mut (&mut *self.memory.get())[range] };
        Some(RingSegment { segment, data })
    }

    /// Retire `n` segments
    pub fn advance(&self, n: u64) {
        self.segdone.fetch_add(n, Ordering::AcqRel);
    }

    /// Fill one segment with silence
    pub fn clear_segment(&self, segment: u64) {
        let range = self.segment_range(segment);
        // SAFETY: caller owns the segment per the module contract
        let data = unsafe { &mut (&mut *self.memory.get())[range] };
        self.spec.info.fill_silence(data);
    }

    /// Silence everything; only while the device side is quiescent
    pub fn clear_all(&self) {
        // SAFETY: quiescence is part of the call contract
        let memory = unsafe { &mut *self.memory.get() };
        self.spec.info.fill_silence(memory);
    }

    /// Pipeline-side write into a segment at a byte offset
    pub fn write(&self, segment: u64, offset: usize, data: &[u8]) -> CoreResult<()> {
        let range = self.segment_range(segment);
        if offset + data.len() > self.spec.segsize {
            return Err(CoreError::InvalidSpec(format!(
                "write of {} bytes at {offset} exceeds segment size {}",
                data.len(),
                self.spec.segsize
            )));
        }
        // SAFETY: pipeline side stays off the `segdone` segment per contract
        let dst = unsafe { &mut (&mut *self.memory.get())[range] };
        dst[offset..offset + data.len()].copy_from_slice(data);
        Ok(())
    }

    /// Pipeline-side copy out of a segment
    pub fn read(&self, segment: u64, out: &mut [u8]) -> CoreResult<()> {
        if out.len() > self.spec.segsize {
            return Err(CoreError::InvalidSpec(format!(
                "read of {} bytes exceeds segment size {}",
                out.len(),
                self.spec.segsize
            )));
        }
        let range = self.segment_range(segment);
        // SAFETY: see write()
        let src = unsafe { &(&*self.memory.get())[range] };
        out.copy_from_slice(&src[..out.len()]);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::format::SampleFormat;

    fn spec() -> RingSpec {
        RingSpec::for_period(AudioInfo::new(SampleFormat::S16Le, 48000, 2), 480).unwrap()
    }

    #[test]
    fn test_spec_geometry() {
        let spec = spec();
        // period * bpf; S16LE stereo => 4 bytes per frame
        assert_eq!(spec.segsize, 480 * 4);
        // half a second at 48kHz in 480-frame periods
        assert_eq!(spec.segtotal, 50);
        assert_eq!(spec.seglatency, 2);
        assert_eq!(spec.period_frames(), 480);
    }

    #[test]
    fn test_segtotal_floor() {
        // Tiny rate still gets two segments
        let spec =
            RingSpec::for_period(AudioInfo::new(SampleFormat::S16Le, 8000, 1), 8000).unwrap();
        assert_eq!(spec.segtotal, 2);
    }

    #[test]
    fn test_prepare_read_requires_active() {
        let ring = SegmentRing::allocate(spec()).unwrap();
        assert!(ring.prepare_read().is_none());

        ring.set_active(true);
        let seg = ring.prepare_read().unwrap();
        assert_eq!(seg.segment, 0);
        assert_eq!(seg.data.len(), ring.spec().segsize);
    }

    #[test]
    fn test_advance_wraps_memory() {
        let ring = SegmentRing::allocate(spec()).unwrap();
        ring.set_active(true);

        let total = ring.spec().segtotal as u64;
        ring.advance(total);
        let seg = ring.prepare_read().unwrap();
        assert_eq!(seg.segment, total);
        // Same memory as segment 0
        ring.write(total, 0, &[1, 2, 3, 4]).unwrap();
        let mut out = [0u8; 4];
        ring.read(0, &mut out).unwrap();
        assert_eq!(out, [1, 2, 3, 4]);
    }

    #[test]
    fn test_clear_segment() {
        let ring = SegmentRing::allocate(spec()).unwrap();
        ring.write(1, 0, &[0xAA; 16]).unwrap();
        ring.clear_segment(1);
        let mut out = [0xFFu8; 16];
        ring.read(1, &mut out).unwrap();
        assert_eq!(out, [0u8; 16]);
    }

    #[test]
    fn test_write_bounds() {
        let ring = SegmentRing::allocate(spec()).unwrap();
        let oversize = vec![0u8; ring.spec().segsize + 1];
        assert!(ring.write(0, 0, &oversize).is_err());
        assert!(ring.write(0, ring.spec().segsize, &[0]).is_err());
    }

    #[test]
    fn test_allocate_is_silent() {
        let info = AudioInfo::new(SampleFormat::U8, 8000, 1);
        let spec = RingSpec::for_period(info, 100).unwrap();
        let ring = SegmentRing::allocate(spec).unwrap();
        let mut out = vec![0u8; 100];
        ring.read(0, &mut out).unwrap();
        assert!(out.iter().all(|b| *b == 0x80));
    }
}
