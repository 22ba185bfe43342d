//! Packed integer array nodes.
//!
//! An array node is an 8-byte header followed by a payload of `size`
//! elements packed at `width` bits each, width ∈ {0,1,2,4,8,16,32,64}.
//! Width 0 encodes "all zeros" with no payload bits. Widths below 8 store
//! unsigned values; 8 and up store two's-complement signed values.
//!
//! Arrays are value types over the allocator: every mutating operation may
//! relocate the node (copy-on-write out of the committed region, width
//! promotion, capacity growth), so mutators update the accessor's ref in
//! place and parents must re-read it.

pub mod blob;
pub mod find;
pub mod sse;

use crate::alloc::{Ref, SlabAlloc, NULL_REF};
use crate::error::{CoreError, Result};

/// Size of the node header.
pub const HEADER_SIZE: usize = 8;

const HDR_FLAGS: usize = 0;
const HDR_WIDTH: usize = 1;
const HDR_SIZE_OFF: usize = 2;
const HDR_CAP_OFF: usize = 5;

/// Header flag bits.
pub mod flags {
    /// Node is a B+tree inner node.
    pub const INNER: u8 = 0x01;
    /// Payload elements are refs to child nodes or blobs.
    pub const HAS_REFS: u8 = 0x02;
    /// Payload is a raw byte blob, not packed integers.
    pub const BLOB: u8 = 0x04;
}

/// Smallest payload capacity in bytes for a fresh node.
const INITIAL_CAPACITY: usize = 16;

/// Legal element widths in ascending order.
pub const WIDTHS: [u8; 8] = [0, 1, 2, 4, 8, 16, 32, 64];

/// Lowest value representable at `width` bits.
pub const fn lbound_for_width(width: u8) -> i64 {
    match width {
        0 | 1 | 2 | 4 => 0,
        8 => -0x80,
        16 => -0x8000,
        32 => -0x8000_0000,
        _ => i64::MIN,
    }
}

/// Highest value representable at `width` bits.
pub const fn ubound_for_width(width: u8) -> i64 {
    match width {
        0 => 0,
        1 => 1,
        2 => 3,
        4 => 15,
        8 => 0x7f,
        16 => 0x7fff,
        32 => 0x7fff_ffff,
        _ => i64::MAX,
    }
}

/// Minimal legal width that can represent `v`.
pub fn bits_for(v: i64) -> u8 {
    for &w in &WIDTHS {
        if v >= lbound_for_width(w) && v <= ubound_for_width(w) {
            return w;
        }
    }
    64
}

/// Bytes of payload needed for `count` elements at `width` bits.
pub fn payload_bytes(width: u8, count: usize) -> usize {
    (count * width as usize + 7) / 8
}

#[inline]
fn read_u24(data: &[u8], off: usize) -> usize {
    data[off] as usize | (data[off + 1] as usize) << 8 | (data[off + 2] as usize) << 16
}

#[inline]
fn write_u24(data: &mut [u8], off: usize, v: usize) {
    debug_assert!(v < 1 << 24);
    data[off] = v as u8;
    data[off + 1] = (v >> 8) as u8;
    data[off + 2] = (v >> 16) as u8;
}

/// Decoded node header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NodeHeader {
    /// Flag bits, see [`flags`].
    pub flags: u8,
    /// Element width in bits.
    pub width: u8,
    /// Number of elements.
    pub size: usize,
    /// Payload capacity in bytes.
    pub capacity: usize,
}

impl NodeHeader {
    /// Reads the header of the node at `r`.
    pub fn read(alloc: &SlabAlloc, r: Ref) -> Result<Self> {
        let data = alloc.translate(r, HEADER_SIZE)?;
        let width = data[HDR_WIDTH];
        if !WIDTHS.contains(&width) && data[HDR_FLAGS] & flags::BLOB == 0 {
            return Err(CoreError::Corruption(format!(
                "illegal element width {width} at ref {r}"
            )));
        }
        Ok(Self {
            flags: data[HDR_FLAGS],
            width,
            size: read_u24(data, HDR_SIZE_OFF),
            capacity: read_u24(data, HDR_CAP_OFF),
        })
    }

    /// Writes the header of the node at `r`.
    pub fn write(&self, alloc: &mut SlabAlloc, r: Ref) -> Result<()> {
        let data = alloc.translate_mut(r, HEADER_SIZE)?;
        data[HDR_FLAGS] = self.flags;
        data[HDR_WIDTH] = self.width;
        write_u24(data, HDR_SIZE_OFF, self.size);
        write_u24(data, HDR_CAP_OFF, self.capacity);
        Ok(())
    }

    /// Total bytes the node occupies in the file.
    pub fn node_bytes(&self) -> usize {
        HEADER_SIZE + self.capacity
    }
}

/// Accessor for one packed array node.
#[derive(Debug, Clone, Copy)]
pub struct Array {
    r: Ref,
}

impl Array {
    /// Allocates a fresh node.
    pub fn create(alloc: &mut SlabAlloc, flags: u8, width: u8, capacity_elems: usize) -> Result<Self> {
        let cap = payload_bytes(width, capacity_elems).max(INITIAL_CAPACITY);
        let cap = cap.next_power_of_two();
        let r = alloc.alloc((HEADER_SIZE + cap) as u64)?;
        let hdr = NodeHeader {
            flags,
            width,
            size: 0,
            capacity: cap,
        };
        hdr.write(alloc, r)?;
        alloc.translate_mut(r + HEADER_SIZE as u64, cap)?.fill(0);
        Ok(Self { r })
    }

    /// Binds an accessor to an existing node.
    pub fn from_ref(r: Ref) -> Self {
        Self { r }
    }

    /// The node's ref.
    pub fn ref_(&self) -> Ref {
        self.r
    }

    /// Reads the node header.
    pub fn header(&self, alloc: &SlabAlloc) -> Result<NodeHeader> {
        NodeHeader::read(alloc, self.r)
    }

    /// Number of elements.
    pub fn size(&self, alloc: &SlabAlloc) -> Result<usize> {
        Ok(self.header(alloc)?.size)
    }

    /// True for B+tree inner nodes.
    pub fn is_inner(&self, alloc: &SlabAlloc) -> Result<bool> {
        Ok(self.header(alloc)?.flags & flags::INNER != 0)
    }

    /// Borrows the packed payload.
    pub fn payload<'a>(&self, alloc: &'a SlabAlloc, hdr: &NodeHeader) -> Result<&'a [u8]> {
        alloc.translate(self.r + HEADER_SIZE as u64, hdr.capacity)
    }

    /// Reads element `i`, sign-extending for widths >= 8.
    pub fn get(&self, alloc: &SlabAlloc, i: usize) -> Result<i64> {
        let hdr = self.header(alloc)?;
        if i >= hdr.size {
            return Err(CoreError::InvalidArgument(format!(
                "index {i} out of bounds {}",
                hdr.size
            )));
        }
        let payload = self.payload(alloc, &hdr)?;
        Ok(get_direct(payload, hdr.width, i))
    }

    /// Decodes eight consecutive elements starting at `i` into `out`,
    /// zero-filling past the end. Used by the query kernels for widths <= 32.
    pub fn get_chunk(&self, alloc: &SlabAlloc, i: usize, out: &mut [i64; 8]) -> Result<()> {
        let hdr = self.header(alloc)?;
        let payload = self.payload(alloc, &hdr)?;
        for (k, slot) in out.iter_mut().enumerate() {
            let idx = i + k;
            *slot = if idx < hdr.size {
                get_direct(payload, hdr.width, idx)
            } else {
                0
            };
        }
        Ok(())
    }

    /// Writes element `i`. Fails with `WidthOverflow` when `v` does not fit
    /// the current width; the caller promotes explicitly.
    pub fn set(&mut self, alloc: &mut SlabAlloc, i: usize, v: i64) -> Result<()> {
        let hdr = self.header(alloc)?;
        if i >= hdr.size {
            return Err(CoreError::InvalidArgument(format!(
                "index {i} out of bounds {}",
                hdr.size
            )));
        }
        if v < lbound_for_width(hdr.width) || v > ubound_for_width(hdr.width) {
            return Err(CoreError::WidthOverflow {
                value: v,
                width: hdr.width,
            });
        }
        self.copy_on_write(alloc)?;
        let payload = alloc.translate_mut(self.r + HEADER_SIZE as u64, hdr.capacity)?;
        set_direct(payload, hdr.width, i, v);
        Ok(())
    }

    /// Promotes width and/or capacity so `extra` more elements of width at
    /// least `bits_for(v)` fit, then returns. Width never regresses.
    pub fn ensure_fits(&mut self, alloc: &mut SlabAlloc, v: i64, extra: usize) -> Result<()> {
        let hdr = self.header(alloc)?;
        let needed_width = bits_for(v).max(hdr.width);
        let needed_bytes = payload_bytes(needed_width, hdr.size + extra);
        if needed_width != hdr.width || needed_bytes > hdr.capacity {
            self.rewrite(alloc, needed_width, hdr.size + extra)?;
        } else {
            self.copy_on_write(alloc)?;
        }
        Ok(())
    }

    /// Rewrites the node at `new_width`, reserving room for `min_elems`.
    /// Monotonically non-decreasing in width.
    pub fn promote_width(&mut self, alloc: &mut SlabAlloc, new_width: u8) -> Result<()> {
        let hdr = self.header(alloc)?;
        if new_width < hdr.width {
            return Err(CoreError::InvalidArgument(
                "width promotion cannot shrink".into(),
            ));
        }
        if new_width == hdr.width {
            return Ok(());
        }
        self.rewrite(alloc, new_width, hdr.size)
    }

    fn rewrite(&mut self, alloc: &mut SlabAlloc, new_width: u8, min_elems: usize) -> Result<()> {
        let hdr = self.header(alloc)?;
        let mut values = Vec::with_capacity(hdr.size);
        {
            let payload = self.payload(alloc, &hdr)?;
            for i in 0..hdr.size {
                values.push(get_direct(payload, hdr.width, i));
            }
        }
        let new_cap = payload_bytes(new_width, min_elems.max(hdr.size))
            .max(INITIAL_CAPACITY)
            .next_power_of_two();
        let new_ref = alloc.alloc((HEADER_SIZE + new_cap) as u64)?;
        let new_hdr = NodeHeader {
            flags: hdr.flags,
            width: new_width,
            size: hdr.size,
            capacity: new_cap,
        };
        new_hdr.write(alloc, new_ref)?;
        {
            let payload = alloc.translate_mut(new_ref + HEADER_SIZE as u64, new_cap)?;
            payload.fill(0);
            for (i, &v) in values.iter().enumerate() {
                set_direct(payload, new_width, i, v);
            }
        }
        alloc.free(self.r, hdr.node_bytes() as u64);
        self.r = new_ref;
        Ok(())
    }

    /// Clones the node out of the committed region when needed so it can be
    /// mutated. Returns true when the node moved.
    pub fn copy_on_write(&mut self, alloc: &mut SlabAlloc) -> Result<bool> {
        if !alloc.is_read_only(self.r) {
            return Ok(false);
        }
        let hdr = self.header(alloc)?;
        let total = hdr.node_bytes();
        let new_ref = alloc.alloc(total as u64)?;
        let src = alloc.translate(self.r, total)?.to_vec();
        alloc.translate_mut(new_ref, total)?.copy_from_slice(&src);
        alloc.free(self.r, total as u64);
        self.r = new_ref;
        Ok(true)
    }

    /// Inserts `v` before position `i`, shifting the tail.
    pub fn insert(&mut self, alloc: &mut SlabAlloc, i: usize, v: i64) -> Result<()> {
        let hdr = self.header(alloc)?;
        if i > hdr.size {
            return Err(CoreError::InvalidArgument(format!(
                "insert index {i} out of bounds {}",
                hdr.size
            )));
        }
        self.ensure_fits(alloc, v, 1)?;
        let hdr = self.header(alloc)?;
        let payload = alloc.translate_mut(self.r + HEADER_SIZE as u64, hdr.capacity)?;
        if hdr.width >= 8 {
            let step = hdr.width as usize / 8;
            payload.copy_within(i * step..hdr.size * step, (i + 1) * step);
        } else {
            let mut k = hdr.size;
            while k > i {
                let prev = get_direct(payload, hdr.width, k - 1);
                set_direct(payload, hdr.width, k, prev);
                k -= 1;
            }
        }
        set_direct(payload, hdr.width, i, v);
        let mut new_hdr = hdr;
        new_hdr.size += 1;
        new_hdr.write(alloc, self.r)
    }

    /// Appends `v`.
    pub fn push(&mut self, alloc: &mut SlabAlloc, v: i64) -> Result<()> {
        let size = self.size(alloc)?;
        self.insert(alloc, size, v)
    }

    /// Removes element `i`, shifting the tail down.
    pub fn erase(&mut self, alloc: &mut SlabAlloc, i: usize) -> Result<()> {
        let hdr = self.header(alloc)?;
        if i >= hdr.size {
            return Err(CoreError::InvalidArgument(format!(
                "erase index {i} out of bounds {}",
                hdr.size
            )));
        }
        self.copy_on_write(alloc)?;
        let payload = alloc.translate_mut(self.r + HEADER_SIZE as u64, hdr.capacity)?;
        if hdr.width >= 8 {
            let step = hdr.width as usize / 8;
            payload.copy_within((i + 1) * step..hdr.size * step, i * step);
        } else {
            for k in i..hdr.size - 1 {
                let next = get_direct(payload, hdr.width, k + 1);
                set_direct(payload, hdr.width, k, next);
            }
            set_direct(payload, hdr.width, hdr.size - 1, 0);
        }
        let mut new_hdr = hdr;
        new_hdr.size -= 1;
        new_hdr.write(alloc, self.r)
    }

    /// Drops all elements past `new_size`.
    pub fn truncate(&mut self, alloc: &mut SlabAlloc, new_size: usize) -> Result<()> {
        let hdr = self.header(alloc)?;
        if new_size > hdr.size {
            return Err(CoreError::InvalidArgument("truncate grows array".into()));
        }
        self.copy_on_write(alloc)?;
        let payload = alloc.translate_mut(self.r + HEADER_SIZE as u64, hdr.capacity)?;
        for k in new_size..hdr.size {
            set_direct(payload, hdr.width, k, 0);
        }
        let mut new_hdr = hdr;
        new_hdr.size = new_size;
        new_hdr.write(alloc, self.r)
    }

    /// Releases the node's storage. Does not touch children; ref-bearing
    /// callers recurse first.
    pub fn destroy(self, alloc: &mut SlabAlloc) -> Result<()> {
        let hdr = self.header(alloc)?;
        alloc.free(self.r, hdr.node_bytes() as u64);
        Ok(())
    }

    /// Recursively releases this node and, when `HAS_REFS` is set, every
    /// non-null child. Odd element values are tagged scalars, not refs.
    pub fn destroy_deep(self, alloc: &mut SlabAlloc) -> Result<()> {
        let hdr = self.header(alloc)?;
        if hdr.flags & flags::HAS_REFS != 0 {
            for i in 0..hdr.size {
                let payload = self.payload(alloc, &hdr)?;
                let child = get_direct(payload, hdr.width, i) as u64;
                if child != NULL_REF && child & 1 == 0 {
                    if NodeHeader::read(alloc, child)?.flags & flags::BLOB != 0 {
                        blob::destroy(alloc, child)?;
                    } else {
                        Array::from_ref(child).destroy_deep(alloc)?;
                    }
                }
            }
        }
        self.destroy(alloc)
    }
}

/// Tags a scalar for storage inside a ref-bearing array. Refs are 8-byte
/// aligned, so the low bit distinguishes the two.
pub fn tag_int(v: u64) -> i64 {
    ((v << 1) | 1) as i64
}

/// Inverse of [`tag_int`].
pub fn untag_int(v: i64) -> u64 {
    (v as u64) >> 1
}

/// Raw element read from a packed payload, no bounds check.
pub fn get_direct(payload: &[u8], width: u8, i: usize) -> i64 {
    match width {
        0 => 0,
        1 | 2 | 4 => {
            let w = width as usize;
            let bit = i * w;
            let byte = payload[bit / 8];
            ((byte >> (bit % 8)) & ((1u8 << w) - 1)) as i64
        }
        8 => payload[i] as i8 as i64,
        16 => i16::from_le_bytes(payload[i * 2..i * 2 + 2].try_into().unwrap()) as i64,
        32 => i32::from_le_bytes(payload[i * 4..i * 4 + 4].try_into().unwrap()) as i64,
        _ => i64::from_le_bytes(payload[i * 8..i * 8 + 8].try_into().unwrap()),
    }
}

/// Raw element write into a packed payload, no bounds check. The value must
/// fit the width.
pub fn set_direct(payload: &mut [u8], width: u8, i: usize, v: i64) {
    match width {
        0 => debug_assert_eq!(v, 0),
        1 | 2 | 4 => {
            let w = width as usize;
            let bit = i * w;
            let mask = ((1u8 << w) - 1) << (bit % 8);
            let byte = &mut payload[bit / 8];
            *byte = (*byte & !mask) | (((v as u8) << (bit % 8)) & mask);
        }
        8 => payload[i] = v as i8 as u8,
        16 => payload[i * 2..i * 2 + 2].copy_from_slice(&(v as i16).to_le_bytes()),
        32 => payload[i * 4..i * 4 + 4].copy_from_slice(&(v as i32).to_le_bytes()),
        _ => payload[i * 8..i * 8 + 8].copy_from_slice(&v.to_le_bytes()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::alloc::Backing;

    pub(crate) fn test_alloc() -> (tempfile::TempDir, SlabAlloc) {
        let dir = tempfile::tempdir().unwrap();
        let mut backing = Backing::attach(dir.path().join("array.tsra"), None).unwrap();
        backing.grow(crate::alloc::HEADER_SIZE as u64).unwrap();
        let mut alloc = SlabAlloc::new(backing);
        alloc.bind(crate::alloc::HEADER_SIZE as u64).unwrap();
        (dir, alloc)
    }

    #[test]
    fn width_bounds() {
        assert_eq!(bits_for(0), 0);
        assert_eq!(bits_for(1), 1);
        assert_eq!(bits_for(3), 2);
        assert_eq!(bits_for(15), 4);
        assert_eq!(bits_for(16), 8);
        assert_eq!(bits_for(-1), 8);
        assert_eq!(bits_for(200), 16);
        assert_eq!(bits_for(-70_000), 32);
        assert_eq!(bits_for(1 << 40), 64);
    }

    #[test]
    fn set_rejects_overflow_and_promote_fixes_it() {
        let (_dir, mut alloc) = test_alloc();
        let mut a = Array::create(&mut alloc, 0, 2, 8).unwrap();
        for v in [0, 1, 2, 3] {
            a.push(&mut alloc, v).unwrap();
        }
        assert!(matches!(
            a.set(&mut alloc, 0, 200),
            Err(CoreError::WidthOverflow { .. })
        ));
        a.promote_width(&mut alloc, 16).unwrap();
        a.set(&mut alloc, 0, 200).unwrap();
        assert_eq!(a.get(&alloc, 0).unwrap(), 200);
        assert_eq!(a.get(&alloc, 3).unwrap(), 3);
    }

    #[test]
    fn promotion_preserves_values_across_all_widths() {
        let (_dir, mut alloc) = test_alloc();
        let values = [0i64, 1, 3, 15, 127, 32_000, 2_000_000_000, i64::MAX];
        let mut a = Array::create(&mut alloc, 0, 0, 8).unwrap();
        let mut stored: Vec<i64> = Vec::new();
        for &v in &values {
            a.ensure_fits(&mut alloc, v, 1).unwrap();
            a.push(&mut alloc, v).unwrap();
            stored.push(v);
            for (i, &expect) in stored.iter().enumerate() {
                assert_eq!(a.get(&alloc, i).unwrap(), expect);
            }
        }
    }

    #[test]
    fn insert_erase_shift_small_widths() {
        let (_dir, mut alloc) = test_alloc();
        let mut a = Array::create(&mut alloc, 0, 4, 4).unwrap();
        for v in [1, 2, 3] {
            a.push(&mut alloc, v).unwrap();
        }
        a.insert(&mut alloc, 1, 9).unwrap();
        let got: Vec<i64> = (0..4).map(|i| a.get(&alloc, i).unwrap()).collect();
        assert_eq!(got, vec![1, 9, 2, 3]);
        a.erase(&mut alloc, 2).unwrap();
        let got: Vec<i64> = (0..3).map(|i| a.get(&alloc, i).unwrap()).collect();
        assert_eq!(got, vec![1, 9, 3]);
    }

    #[test]
    fn get_chunk_zero_fills_tail() {
        let (_dir, mut alloc) = test_alloc();
        let mut a = Array::create(&mut alloc, 0, 2, 8).unwrap();
        for v in [3, 1, 2] {
            a.push(&mut alloc, v).unwrap();
        }
        let mut out = [0i64; 8];
        a.get_chunk(&alloc, 0, &mut out).unwrap();
        assert_eq!(out, [3, 1, 2, 0, 0, 0, 0, 0]);
    }

    #[test]
    fn copy_on_write_relocates_committed_nodes() {
        let (_dir, mut alloc) = test_alloc();
        let mut a = Array::create(&mut alloc, 0, 8, 4).unwrap();
        a.push(&mut alloc, 42).unwrap();
        let new_len = alloc.flush_slab(true).unwrap();
        alloc.adopt_commit(new_len);
        let old_ref = a.ref_();
        assert!(alloc.is_read_only(old_ref));
        a.set(&mut alloc, 0, 7).unwrap();
        assert_ne!(a.ref_(), old_ref);
        assert_eq!(a.get(&alloc, 0).unwrap(), 7);
    }
}
