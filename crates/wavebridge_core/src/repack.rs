//! S24-in-32 Repack
//!
//! Devices exchange 24-valid-bit samples MSB-aligned in a 32-bit container;
//! the pipeline keeps them LSB-aligned. Capture is an arithmetic right shift
//! by 8, render a logical left shift by 8. Four lanes at a time via SSE2
//! where available; both paths require 4-byte-multiple lengths and fall back
//! to a raw copy otherwise.

#[inline]
fn rshift8_32(x: i32) -> i32 {
    let s = (x as u32) >> 8;
    let signmask = if x < 0 { 0xff00_0000u32 } else { 0 };
    (s | signmask) as i32
}

#[cfg(target_arch = "x86_64")]
fn shift32_right8_copy(src: &[i32], dst: &mut [i32]) {
    use std::arch::x86_64::{_mm_loadu_si128, _mm_srai_epi32, _mm_storeu_si128};

    let n = src.len();
    let mut i = 0;
    // SAFETY: SSE2 is baseline on x86_64; unaligned load/store intrinsics,
    // bounds guarded by the loop condition
    unsafe {
        while i + 4 <= n {
            let v = _mm_loadu_si128(src.as_ptr().add(i) as *const _);
            let y = _mm_srai_epi32::<8>(v);
            _mm_storeu_si128(dst.as_mut_ptr().add(i) as *mut _, y);
            i += 4;
        }
    }
    for k in i..n {
        dst[k] = rshift8_32(src[k]);
    }
}

#[cfg(not(target_arch = "x86_64"))]
fn shift32_right8_copy(src: &[i32], dst: &mut [i32]) {
    for (d, s) in dst.iter_mut().zip(src) {
        *d = rshift8_32(*s);
    }
}

#[cfg(target_arch = "x86_64")]
fn shift32_left8_copy(src: &[i32], dst: &mut [i32]) {
    use std::arch::x86_64::{_mm_loadu_si128, _mm_slli_epi32, _mm_storeu_si128};

    let n = src.len();
    let mut i = 0;
    // SAFETY: see shift32_right8_copy
    unsafe {
        while i + 4 <= n {
            let v = _mm_loadu_si128(src.as_ptr().add(i) as *const _);
            let y = _mm_slli_epi32::<8>(v);
            _mm_storeu_si128(dst.as_mut_ptr().add(i) as *mut _, y);
            i += 4;
        }
    }
    for k in i..n {
        dst[k] = ((src[k] as u32) << 8) as i32;
    }
}

#[cfg(not(target_arch = "x86_64"))]
fn shift32_left8_copy(src: &[i32], dst: &mut [i32]) {
    for (d, s) in dst.iter_mut().zip(src) {
        *d = ((*s as u32) << 8) as i32;
    }
}

fn as_i32_pair<'a>(dst: &'a mut [u8], src: &'a [u8]) -> Option<(&'a mut [i32], &'a [i32])> {
    if src.len() != dst.len() || src.len() % 4 != 0 {
        return None;
    }
    let (dp, dm, ds) = unsafe { dst.align_to_mut::<i32>() };
    let (sp, sm, ss) = unsafe { src.align_to::<i32>() };
    if !dp.is_empty() || !ds.is_empty() || !sp.is_empty() || !ss.is_empty() {
        return None;
    }
    Some((dm, sm))
}

/// Capture direction: device MSB-aligned -> host LSB-aligned
pub fn s24_msb_to_lsb(dst: &mut [u8], src: &[u8]) {
    match as_i32_pair(dst, src) {
        Some((d, s)) => shift32_right8_copy(s, d),
        None => dst.copy_from_slice(src),
    }
}

/// Render direction: host LSB-aligned -> device MSB-aligned
pub fn s24_lsb_to_msb(dst: &mut [u8], src: &[u8]) {
    match as_i32_pair(dst, src) {
        Some((d, s)) => shift32_left8_copy(s, d),
        None => dst.copy_from_slice(src),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pack(vals: &[i32]) -> Vec<u8> {
        vals.iter().flat_map(|v| v.to_le_bytes()).collect()
    }

    fn unpack(bytes: &[u8]) -> Vec<i32> {
        bytes
            .chunks_exact(4)
            .map(|c| i32::from_le_bytes([c[0], c[1], c[2], c[3]]))
            .collect()
    }

    #[test]
    fn test_capture_shift_preserves_sign() {
        let src = pack(&[0x1234_5600, -0x1234_5600, i32::MIN, 0x7fff_ff00]);
        let mut dst = vec![0u8; src.len()];
        s24_msb_to_lsb(&mut dst, &src);
        assert_eq!(
            unpack(&dst),
            vec![0x0012_3456, -0x0012_3456, i32::MIN >> 8, 0x007f_ffff]
        );
    }

    #[test]
    fn test_render_shift() {
        let src = pack(&[0x0012_3456, -0x0012_3456]);
        let mut dst = vec![0u8; src.len()];
        s24_lsb_to_msb(&mut dst, &src);
        assert_eq!(unpack(&dst), vec![0x1234_5600, -0x1234_5600]);
    }

    #[test]
    fn test_round_trip() {
        // Any 24-bit value survives render -> capture
        let vals: Vec<i32> = (-40..40).map(|v| v * 0x0003_0201).collect();
        let src = pack(&vals);
        let mut device = vec![0u8; src.len()];
        let mut host = vec![0u8; src.len()];
        s24_lsb_to_msb(&mut device, &src);
        s24_msb_to_lsb(&mut host, &device);
        assert_eq!(host, src);
    }

    #[test]
    fn test_simd_scalar_agreement() {
        // Lengths around the 4-lane boundary exercise both code paths
        for n in [1usize, 3, 4, 5, 7, 8, 64, 65] {
            let vals: Vec<i32> = (0..n as i32).map(|v| (v * 0x0101_0100) ^ 0x55).collect();
            let src = pack(&vals);
            let mut dst = vec![0u8; src.len()];
            s24_msb_to_lsb(&mut dst, &src);
            let expect: Vec<i32> = vals.iter().map(|v| rshift8_32(*v)).collect();
            assert_eq!(unpack(&dst), expect, "n={n}");
        }
    }

    #[test]
    fn test_misaligned_length_copies_raw() {
        let src = vec![1u8, 2, 3, 4, 5, 6];
        let mut dst = vec![0u8; 6];
        s24_msb_to_lsb(&mut dst, &src);
        assert_eq!(dst, src);
        s24_lsb_to_msb(&mut dst, &src);
        assert_eq!(dst, src);
    }
}
