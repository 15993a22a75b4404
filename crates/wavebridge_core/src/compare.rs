//! Format Similarity Comparator
//!
//! Ranks a probed format list against a basis format so the head of the list
//! is the best candidate for auto-selection. The ordering is strict and
//! first-difference-wins; S24-in-32 PCM always sinks to the tail because its
//! MSB-aligned device layout needs an extra repack on every buffer.

use std::cmp::Ordering;

use crate::format::WaveFormat;

fn distance_u16(a: u16, b: u16) -> u32 {
    (i32::from(a) - i32::from(b)).unsigned_abs()
}

fn distance_u32(a: u32, b: u32) -> u64 {
    (i64::from(a) - i64::from(b)).unsigned_abs()
}

/// Tie-break stage comparing format plumbing against the basis
fn compare_format_similarity(a: &WaveFormat, b: &WaveFormat, basis: &WaveFormat) -> Ordering {
    // Subformat (e.g. PCM vs FLOAT)
    let a_sub_eq = a.sub_format == basis.sub_format;
    let b_sub_eq = b.sub_format == basis.sub_format;
    if a_sub_eq != b_sub_eq {
        return if a_sub_eq { Ordering::Less } else { Ordering::Greater };
    }

    // Container bits distance
    let da_bits = distance_u16(a.bits_per_sample, basis.bits_per_sample);
    let db_bits = distance_u16(b.bits_per_sample, basis.bits_per_sample);
    if da_bits != db_bits {
        return da_bits.cmp(&db_bits);
    }

    // Valid bits distance
    let basis_valid = basis.valid_bits_or_container();
    let da_valid = distance_u16(a.valid_bits_or_container(), basis_valid);
    let db_valid = distance_u16(b.valid_bits_or_container(), basis_valid);
    if da_valid != db_valid {
        return da_valid.cmp(&db_valid);
    }

    // Channel mask, only meaningful when both sides report one
    let a_mask_eq =
        a.channel_mask != 0 && basis.channel_mask != 0 && a.channel_mask == basis.channel_mask;
    let b_mask_eq =
        b.channel_mask != 0 && basis.channel_mask != 0 && b.channel_mask == basis.channel_mask;
    if a_mask_eq != b_mask_eq {
        return if a_mask_eq { Ordering::Less } else { Ordering::Greater };
    }

    // Format tag distance; EXTENSIBLE ends up the last resort
    let da_tag = distance_u16(a.tag, basis.tag);
    let db_tag = distance_u16(b.tag, basis.tag);
    da_tag.cmp(&db_tag)
}

/// Full similarity ordering against a basis
pub fn compare_formats(a: &WaveFormat, b: &WaveFormat, basis: &WaveFormat) -> Ordering {
    // S24-in-32 is the lowest
    let a_s2432 = a.is_s24_in_32();
    let b_s2432 = b.is_s24_in_32();
    if a_s2432 != b_s2432 {
        return if a_s2432 { Ordering::Greater } else { Ordering::Less };
    }

    // Prefer same channel count
    let da_ch = distance_u16(a.channels, basis.channels);
    let db_ch = distance_u16(b.channels, basis.channels);
    if da_ch != db_ch {
        return da_ch.cmp(&db_ch);
    }

    // Then sample rate
    let da_rate = distance_u32(a.rate, basis.rate);
    let db_rate = distance_u32(b.rate, basis.rate);
    if da_rate != db_rate {
        return da_rate.cmp(&db_rate);
    }

    // Prefer higher sample rate
    if a.rate != b.rate {
        return b.rate.cmp(&a.rate);
    }

    // High bit depth first
    let a_bits = a.effective_bits();
    let b_bits = b.effective_bits();
    if a_bits != b_bits {
        return b_bits.cmp(&a_bits);
    }

    compare_format_similarity(a, b, basis)
}

/// Sort a format list by similarity to the basis, then demote every
/// S24-in-32 entry to the tail while preserving relative order
pub fn sort_formats(list: &mut Vec<WaveFormat>, basis: &WaveFormat) {
    if list.is_empty() {
        return;
    }

    list.sort_by(|a, b| compare_formats(a, b, basis));

    // Stable partition; the comparator already ranks S24-in-32 last, this
    // keeps the invariant even for lists assembled from multiple probes
    let (mut head, tail): (Vec<_>, Vec<_>) = list.drain(..).partition(|wf| !wf.is_s24_in_32());
    head.extend(tail);
    *list = head;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::format::SubFormat;

    fn grid() -> Vec<WaveFormat> {
        let mut list = Vec::new();
        for rate in [192000u32, 96000, 48000, 44100] {
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

    #[test]
    fn test_s24_in_32_always_tail() {
        let basis = WaveFormat::extensible(2, 48000, 32, 24, false);
        let mut list = grid();
        sort_formats(&mut list, &basis);

        let first_s24 = list.iter().position(|wf| wf.is_s24_in_32()).unwrap();
        assert!(
            list[first_s24..].iter().all(|wf| wf.is_s24_in_32()),
            "S24-in-32 must not appear before a non-S24-in-32 entry"
        );
    }

    #[test]
    fn test_channel_distance_first() {
        let basis = WaveFormat::extensible(2, 48000, 16, 16, false);
        let mut list = vec![
            WaveFormat::extensible(8, 48000, 16, 16, false),
            WaveFormat::extensible(1, 48000, 16, 16, false),
            WaveFormat::extensible(2, 44100, 16, 16, false),
        ];
        sort_formats(&mut list, &basis);

        // 2ch at the wrong rate still beats the right rate at 1ch
        assert_eq!(list[0].channels, 2);
        assert_eq!(list[1].channels, 1);
        assert_eq!(list[2].channels, 8);
    }

    #[test]
    fn test_rate_distance_then_higher_rate() {
        let basis = WaveFormat::extensible(2, 48000, 16, 16, false);
        let mut list = vec![
            WaveFormat::extensible(2, 44100, 16, 16, false),
            WaveFormat::extensible(2, 96000, 16, 16, false),
            WaveFormat::extensible(2, 48000, 16, 16, false),
        ];
        sort_formats(&mut list, &basis);
        assert_eq!(list[0].rate, 48000);
        assert_eq!(list[1].rate, 44100);
        assert_eq!(list[2].rate, 96000);

        // Equidistant rates prefer the higher one
        let basis = WaveFormat::extensible(2, 70000, 16, 16, false);
        let mut list = vec![
            WaveFormat::extensible(2, 60000, 16, 16, false),
            WaveFormat::extensible(2, 80000, 16, 16, false),
        ];
        sort_formats(&mut list, &basis);
        assert_eq!(list[0].rate, 80000);
    }

    #[test]
    fn test_higher_effective_depth_wins() {
        let basis = WaveFormat::extensible(2, 48000, 16, 16, false);
        let mut list = vec![
            WaveFormat::extensible(2, 48000, 16, 16, false),
            WaveFormat::extensible(2, 48000, 32, 32, true),
            WaveFormat::extensible(2, 48000, 24, 24, false),
        ];
        sort_formats(&mut list, &basis);
        assert_eq!(list[0].effective_bits(), 32);
        assert_eq!(list[1].effective_bits(), 24);
        assert_eq!(list[2].effective_bits(), 16);
    }

    #[test]
    fn test_subformat_tiebreak() {
        let basis = WaveFormat::extensible(2, 48000, 32, 32, false);
        let float = WaveFormat::extensible(2, 48000, 32, 32, true);
        let int = WaveFormat::extensible(2, 48000, 32, 32, false);
        let mut list = vec![float, int];
        sort_formats(&mut list, &basis);
        assert_eq!(list[0].sub_format, SubFormat::PCM);
    }

    #[test]
    fn test_strict_weak_ordering() {
        // Never a < b and b < a; transitivity over the whole grid
        let basis = WaveFormat::extensible(2, 48000, 32, 24, false);
        let list = grid();

        for a in &list {
            assert_eq!(compare_formats(a, a, &basis), Ordering::Equal);
            for b in &list {
                let ab = compare_formats(a, b, &basis);
                let ba = compare_formats(b, a, &basis);
                assert_eq!(ab, ba.reverse());

                for c in &list {
                    let bc = compare_formats(b, c, &basis);
                    if ab == Ordering::Less && bc == Ordering::Less {
                        assert_eq!(compare_formats(a, c, &basis), Ordering::Less);
                    }
                }
            }
        }
    }

    #[test]
    fn test_determinism() {
        let basis = WaveFormat::extensible(2, 48000, 16, 16, false);
        let mut a = grid();
        let mut b = grid();
        b.reverse();
        sort_formats(&mut a, &basis);
        sort_formats(&mut b, &basis);
        // Entries with equal rank may land in probe order; compare projected
        // rank keys instead of raw order
        for (x, y) in a.iter().zip(b.iter()) {
            assert_eq!(compare_formats(x, y, &basis), Ordering::Equal);
        }
    }
}
