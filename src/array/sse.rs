//! 128-bit SIMD compare kernels for widths 8/16/32/64.
//!
//! The caller hands in a 16-byte-aligned sub-slice of the leaf payload; the
//! unaligned edges are scanned scalar by the dispatcher. There is no 64-bit
//! less-than compare in SSE, so that combination reports unusable and the
//! dispatcher stays scalar.

#![allow(unsafe_code)]

use super::find::{CondKind, Condition, QueryState};

/// True when a vector kernel exists for this condition/width pair on the
/// running CPU.
#[cfg(target_arch = "x86_64")]
pub fn usable<C: Condition>(width: u8) -> bool {
    let kind_ok = match C::KIND {
        CondKind::Equal | CondKind::NotEqual => true,
        CondKind::Less | CondKind::Greater => !(width == 64 && C::KIND == CondKind::Less),
        _ => false,
    };
    if !kind_ok {
        return false;
    }
    if std::arch::is_x86_feature_detected!("sse4.2") {
        return true;
    }
    // Plain SSE2 still covers equality below 64 bits.
    std::arch::is_x86_feature_detected!("sse2")
        && width < 64
        && matches!(C::KIND, CondKind::Equal | CondKind::NotEqual)
}

/// No vector unit on other architectures; the dispatcher stays scalar.
#[cfg(not(target_arch = "x86_64"))]
pub fn usable<C: Condition>(_width: u8) -> bool {
    false
}

/// Scans `data` (16-byte aligned, a whole number of vectors) for elements
/// matching `C(element, value)`. Indices are relative to `data` plus
/// `baseindex`. Returns false when the state stopped the scan.
#[cfg(target_arch = "x86_64")]
pub fn find_aligned<C: Condition, S: QueryState>(
    data: &[u8],
    width: u8,
    value: i64,
    baseindex: usize,
    state: &mut S,
) -> bool {
    debug_assert_eq!(data.as_ptr() as usize % 16, 0);
    debug_assert_eq!(data.len() % 16, 0);
    // Safety: alignment and length are asserted above; feature presence was
    // checked by `usable`.
    unsafe {
        match width {
            8 => scan::<C, S, 1>(data, value, baseindex, state),
            16 => scan::<C, S, 2>(data, value, baseindex, state),
            32 => scan::<C, S, 4>(data, value, baseindex, state),
            _ => scan::<C, S, 8>(data, value, baseindex, state),
        }
    }
}

/// Fallback body for non-x86_64 targets; never called because `usable`
/// reports false.
#[cfg(not(target_arch = "x86_64"))]
pub fn find_aligned<C: Condition, S: QueryState>(
    _data: &[u8],
    _width: u8,
    _value: i64,
    _baseindex: usize,
    _state: &mut S,
) -> bool {
    true
}

#[cfg(target_arch = "x86_64")]
#[target_feature(enable = "sse2")]
unsafe fn scan<C: Condition, S: QueryState, const STEP: usize>(
    data: &[u8],
    value: i64,
    baseindex: usize,
    state: &mut S,
) -> bool {
    use core::arch::x86_64::*;

    let vecs = data.len() / 16;
    let elems_per_vec = 16 / STEP;
    let ptr = data.as_ptr() as *const __m128i;

    let needle = match STEP {
        1 => _mm_set1_epi8(value as i8),
        2 => _mm_set1_epi16(value as i16),
        4 => _mm_set1_epi32(value as i32),
        _ => _mm_set1_epi64x(value),
    };

    for v in 0..vecs {
        let chunk = _mm_load_si128(ptr.add(v));
        let cmp = match (C::KIND, STEP) {
            (CondKind::Equal | CondKind::NotEqual, 1) => _mm_cmpeq_epi8(chunk, needle),
            (CondKind::Equal | CondKind::NotEqual, 2) => _mm_cmpeq_epi16(chunk, needle),
            (CondKind::Equal | CondKind::NotEqual, 4) => _mm_cmpeq_epi32(chunk, needle),
            (CondKind::Equal | CondKind::NotEqual, _) => _mm_cmpeq_epi64(chunk, needle),
            (CondKind::Greater, 1) => _mm_cmpgt_epi8(chunk, needle),
            (CondKind::Greater, 2) => _mm_cmpgt_epi16(chunk, needle),
            (CondKind::Greater, 4) => _mm_cmpgt_epi32(chunk, needle),
            (CondKind::Greater, _) => _mm_cmpgt_epi64(chunk, needle),
            (CondKind::Less, 1) => _mm_cmpgt_epi8(needle, chunk),
            (CondKind::Less, 2) => _mm_cmpgt_epi16(needle, chunk),
            (CondKind::Less, 4) => _mm_cmpgt_epi32(needle, chunk),
            // 64-bit Less has no SSE form; `usable` keeps it scalar.
            _ => unreachable!("no vector kernel for this condition"),
        };
        let mask = _mm_movemask_epi8(cmp) as u32;
        let invert = C::KIND == CondKind::NotEqual;
        if mask == 0 && !invert {
            continue;
        }
        if mask == 0xffff && invert {
            continue;
        }
        for e in 0..elems_per_vec {
            let hit = (mask >> (e * STEP)) & 1 != 0;
            if hit != invert {
                let idx = v * elems_per_vec + e;
                let elem = decode::<STEP>(data, idx);
                if !state.match_at(baseindex + idx, elem) {
                    return false;
                }
            }
        }
    }
    true
}

#[cfg(target_arch = "x86_64")]
#[inline]
fn decode<const STEP: usize>(data: &[u8], idx: usize) -> i64 {
    let off = idx * STEP;
    match STEP {
        1 => data[off] as i8 as i64,
        2 => i16::from_le_bytes(data[off..off + 2].try_into().unwrap()) as i64,
        4 => i32::from_le_bytes(data[off..off + 4].try_into().unwrap()) as i64,
        _ => i64::from_le_bytes(data[off..off + 8].try_into().unwrap()),
    }
}

#[cfg(all(test, target_arch = "x86_64"))]
mod tests {
    use super::*;
    use crate::array::find::{Equal, FindAll, Greater, Less, NotEqual};

    /// 16-byte aligned byte buffer for kernel tests.
    #[repr(align(16))]
    struct Aligned([u8; 256]);

    fn packed_i16(values: &[i64]) -> Aligned {
        let mut buf = Aligned([0u8; 256]);
        for (i, &v) in values.iter().enumerate() {
            buf.0[i * 2..i * 2 + 2].copy_from_slice(&(v as i16).to_le_bytes());
        }
        buf
    }

    #[test]
    fn sse_and_scalar_agree_on_width_16() {
        if !usable::<Equal>(16) {
            return;
        }
        let values: Vec<i64> = (0..64).map(|i| (i * 37 % 100) - 50).collect();
        let buf = packed_i16(&values);
        let data = &buf.0[..values.len() * 2];

        let mut sse_state = FindAll::unlimited();
        find_aligned::<Equal, _>(data, 16, -13, 0, &mut sse_state);
        let expect: Vec<usize> = values
            .iter()
            .enumerate()
            .filter(|(_, &v)| v == -13)
            .map(|(i, _)| i)
            .collect();
        assert_eq!(sse_state.matches, expect);

        let mut gt_state = FindAll::unlimited();
        find_aligned::<Greater, _>(data, 16, 20, 0, &mut gt_state);
        let expect: Vec<usize> = values
            .iter()
            .enumerate()
            .filter(|(_, &v)| v > 20)
            .map(|(i, _)| i)
            .collect();
        assert_eq!(gt_state.matches, expect);

        let mut lt_state = FindAll::unlimited();
        find_aligned::<Less, _>(data, 16, 0, 0, &mut lt_state);
        let expect: Vec<usize> = values
            .iter()
            .enumerate()
            .filter(|(_, &v)| v < 0)
            .map(|(i, _)| i)
            .collect();
        assert_eq!(lt_state.matches, expect);

        let mut ne_state = FindAll::unlimited();
        find_aligned::<NotEqual, _>(data, 16, 0, 0, &mut ne_state);
        let expect: Vec<usize> = values
            .iter()
            .enumerate()
            .filter(|(_, &v)| v != 0)
            .map(|(i, _)| i)
            .collect();
        assert_eq!(ne_state.matches, expect);
    }

    #[test]
    fn less_at_64_bits_is_not_usable() {
        assert!(!usable::<Less>(64));
    }
}
