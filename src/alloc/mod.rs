//! Slab allocator over the memory-mapped database file.
//!
//! The allocator hands out [`Ref`]s, 8-byte-aligned offsets into one logical
//! byte range. Committed data lives below the `baseline` (the logical file
//! size the transaction bound to) and is immutable; new allocations land in
//! an in-memory slab that logically continues the file past the baseline, or
//! in recycled free regions below it that no live snapshot can observe.
//!
//! Commit writes the slab (and any recycled regions already mutated in
//! place through the mapping) to the file, syncs, and only then swaps the
//! header's top-ref slot, so a crash at any point leaves the previous
//! snapshot intact.

pub mod file_header;
pub mod file_map;

use tracing::trace;

use crate::error::{CoreError, Result};

pub use file_header::{FileHeader, CURRENT_FILE_FORMAT, HEADER_SIZE};
pub use file_map::{Backing, FileIo, StdFileIo};

/// Opaque file offset identifying the start of an array node or blob.
pub type Ref = u64;

/// Null ref: no node.
pub const NULL_REF: Ref = 0;

/// Granularity the in-memory slab grows by.
const SLAB_CHUNK: usize = 128 * 1024;

/// A free region of the committed file, tagged with the version whose commit
/// freed it. Reusable once no reader can observe any version <= `version`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FreeRegion {
    /// Start of the region.
    pub pos: Ref,
    /// Length in bytes.
    pub len: u64,
    /// Version in whose commit the region was released.
    pub version: u64,
}

/// File-backed arena with slab allocation and deferred free-space reuse.
pub struct SlabAlloc {
    backing: Backing,
    /// Logical committed size this transaction bound to. Everything below is
    /// read-only unless recycled.
    baseline: u64,
    /// In-memory continuation of the file past `baseline`.
    slab: Vec<u8>,
    /// Bytes of `slab` handed out so far.
    slab_used: usize,
    /// Free regions eligible for reuse in this transaction.
    free_ready: Vec<FreeRegion>,
    /// Regions freed by this transaction; not reusable before next commit.
    free_current: Vec<FreeRegion>,
    /// Ranges below the baseline handed out again by this transaction.
    recycled: Vec<(Ref, u64)>,
}

impl SlabAlloc {
    /// Wraps a backing; the caller binds before first use.
    pub fn new(backing: Backing) -> Self {
        let len = backing.len();
        Self {
            backing,
            baseline: len,
            slab: Vec::new(),
            slab_used: 0,
            free_ready: Vec::new(),
            free_current: Vec::new(),
            recycled: Vec::new(),
        }
    }

    /// Rebinds the allocator to a snapshot whose logical size is
    /// `logical_len`. Discards all slab state.
    pub fn bind(&mut self, logical_len: u64) -> Result<()> {
        self.backing.refresh()?;
        if logical_len > self.backing.len() {
            // The file grew under another process; refresh the view.
            self.backing.grow(logical_len)?;
        }
        self.baseline = logical_len;
        self.slab.clear();
        self.slab_used = 0;
        self.free_ready.clear();
        self.free_current.clear();
        self.recycled.clear();
        Ok(())
    }

    /// Logical end of allocated space (committed plus slab).
    pub fn logical_top(&self) -> u64 {
        self.baseline + self.slab_used as u64
    }

    /// The read-only/writable boundary this transaction bound to.
    pub fn baseline(&self) -> u64 {
        self.baseline
    }

    /// True when `r` lies in the committed region and was not recycled, so
    /// mutating it requires copy-on-write.
    pub fn is_read_only(&self, r: Ref) -> bool {
        r < self.baseline && !self.in_recycled(r)
    }

    fn in_recycled(&self, r: Ref) -> bool {
        self.recycled
            .iter()
            .any(|&(pos, len)| r >= pos && r < pos + len)
    }

    /// Installs the reusable free list (loaded from the previous snapshot's
    /// persisted lists, already filtered by the reap boundary).
    pub fn set_free_ready(&mut self, regions: Vec<FreeRegion>) {
        self.free_ready = regions;
    }

    /// Returns an 8-byte-aligned ref with `size` bytes reserved.
    pub fn alloc(&mut self, size: u64) -> Result<Ref> {
        if size == 0 {
            return Err(CoreError::InvalidArgument("zero-size allocation".into()));
        }
        let size = (size + 7) & !7;

        // First fit from the recycled-eligible free list.
        if let Some(i) = self.free_ready.iter().position(|region| region.len >= size) {
            let region = self.free_ready[i];
            if region.len == size {
                self.free_ready.swap_remove(i);
            } else {
                self.free_ready[i].pos += size;
                self.free_ready[i].len -= size;
            }
            self.recycled.push((region.pos, size));
            trace!(pos = region.pos, size, "alloc reuses freed region");
            return Ok(region.pos);
        }

        // Otherwise carve from the slab.
        let needed = self.slab_used + size as usize;
        if needed > self.slab.len() {
            let grown = needed
                .checked_next_multiple_of(SLAB_CHUNK)
                .ok_or(CoreError::OutOfMemory("slab size overflow"))?;
            self.slab.resize(grown, 0);
        }
        let r = self.baseline + self.slab_used as u64;
        self.slab_used = needed;
        Ok(r)
    }

    /// Marks `[r, r+size)` free. The space becomes reusable in the first
    /// write transaction that starts after every snapshot which could still
    /// observe it has been released.
    pub fn free(&mut self, r: Ref, size: u64) {
        let size = (size + 7) & !7;
        // Version is stamped by the committing writer.
        self.free_current.push(FreeRegion {
            pos: r,
            len: size,
            version: 0,
        });
    }

    /// Regions freed by the current transaction, for persistence at commit.
    pub fn take_free_current(&mut self) -> Vec<FreeRegion> {
        std::mem::take(&mut self.free_current)
    }

    /// Remaining reusable regions, for persistence at commit.
    pub fn remaining_free_ready(&self) -> &[FreeRegion] {
        &self.free_ready
    }

    /// Forgets tentative allocations and frees; called on rollback.
    pub fn reset_free_space_tracking(&mut self) {
        self.slab.clear();
        self.slab_used = 0;
        self.free_current.clear();
        self.recycled.clear();
    }

    /// Resolves `r` to `len` bytes of memory.
    pub fn translate(&self, r: Ref, len: usize) -> Result<&[u8]> {
        if r >= self.baseline {
            let start = (r - self.baseline) as usize;
            let end = start + len;
            if end > self.slab_used {
                return Err(CoreError::Corruption(format!(
                    "slab ref {r}+{len} beyond slab top"
                )));
            }
            Ok(&self.slab[start..end])
        } else {
            self.backing.read(r, len)
        }
    }

    /// Resolves `r` to writable memory. Only slab refs and regions recycled
    /// by this transaction are writable.
    pub fn translate_mut(&mut self, r: Ref, len: usize) -> Result<&mut [u8]> {
        if r >= self.baseline {
            let start = (r - self.baseline) as usize;
            let end = start + len;
            if end > self.slab_used {
                return Err(CoreError::Corruption(format!(
                    "slab ref {r}+{len} beyond slab top"
                )));
            }
            Ok(&mut self.slab[start..end])
        } else {
            if !self.in_recycled(r) {
                return Err(CoreError::Corruption(format!(
                    "write to read-only ref {r}"
                )));
            }
            self.backing.read_mut(r, len)
        }
    }

    /// Writes the slab into the file, making the logical range durable up to
    /// [`Self::logical_top`]. Part of the commit sequence; the caller swaps
    /// the header slot afterwards. `sync` is skipped only under reduced
    /// durability.
    pub fn flush_slab(&mut self, sync: bool) -> Result<u64> {
        let new_len = self.logical_top();
        if self.slab_used > 0 {
            self.backing.grow(new_len)?;
            let slab = std::mem::take(&mut self.slab);
            self.backing.write(self.baseline, &slab[..self.slab_used])?;
            self.slab = slab;
        }
        self.backing.flush(sync)?;
        Ok(new_len)
    }

    /// After a successful commit, adopt the new logical size as baseline.
    pub fn adopt_commit(&mut self, new_len: u64) {
        self.baseline = new_len;
        self.slab.clear();
        self.slab_used = 0;
        self.recycled.clear();
    }

    /// Direct access to the backing, for the header writer.
    pub fn backing_mut(&mut self) -> &mut Backing {
        &mut self.backing
    }

    /// Direct read access to the backing.
    pub fn backing(&self) -> &Backing {
        &self.backing
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn plain_alloc() -> (tempfile::TempDir, SlabAlloc) {
        let dir = tempfile::tempdir().unwrap();
        let mut backing = Backing::attach(dir.path().join("alloc.tsra"), None).unwrap();
        backing.grow(HEADER_SIZE as u64).unwrap();
        let mut alloc = SlabAlloc::new(backing);
        alloc.bind(HEADER_SIZE as u64).unwrap();
        (dir, alloc)
    }

    #[test]
    fn alloc_is_aligned_and_disjoint() {
        let (_dir, mut alloc) = plain_alloc();
        let a = alloc.alloc(5).unwrap();
        let b = alloc.alloc(24).unwrap();
        assert_eq!(a % 8, 0);
        assert_eq!(b % 8, 0);
        assert!(b >= a + 8);
    }

    #[test]
    fn slab_refs_are_writable_committed_refs_are_not() {
        let (_dir, mut alloc) = plain_alloc();
        let r = alloc.alloc(16).unwrap();
        alloc.translate_mut(r, 16).unwrap().fill(0xab);
        assert_eq!(alloc.translate(r, 16).unwrap()[0], 0xab);
        assert!(alloc.translate_mut(8, 8).is_err());
    }

    #[test]
    fn free_regions_reused_first_fit() {
        let (_dir, mut alloc) = plain_alloc();
        alloc.set_free_ready(vec![FreeRegion {
            pos: 24,
            len: 32,
            version: 1,
        }]);
        let r = alloc.alloc(16).unwrap();
        assert_eq!(r, 24);
        assert!(!alloc.is_read_only(r));
        // Remainder of the split region is still available.
        assert_eq!(alloc.remaining_free_ready(), &[FreeRegion {
            pos: 40,
            len: 16,
            version: 1,
        }]);
        let s = alloc.alloc(16).unwrap();
        assert_eq!(s, 40);
    }

    #[test]
    fn flush_makes_slab_durable() {
        let (_dir, mut alloc) = plain_alloc();
        let r = alloc.alloc(64).unwrap();
        alloc.translate_mut(r, 64).unwrap().fill(0x5a);
        let new_len = alloc.flush_slab(true).unwrap();
        alloc.adopt_commit(new_len);
        assert!(alloc.is_read_only(r));
        assert!(alloc.translate(r, 64).unwrap().iter().all(|&b| b == 0x5a));
    }

    #[test]
    fn rollback_forgets_tentative_state() {
        let (_dir, mut alloc) = plain_alloc();
        let r = alloc.alloc(16).unwrap();
        alloc.free(r, 16);
        alloc.reset_free_space_tracking();
        assert!(alloc.take_free_current().is_empty());
        assert_eq!(alloc.logical_top(), alloc.baseline());
    }
}
