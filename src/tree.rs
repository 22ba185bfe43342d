//! B+trees of packed integer leaves.
//!
//! A tree is an ordered sequence of i64 indexed 0..N-1. Leaves are packed
//! arrays; inner nodes hold an offsets array (cumulative element counts per
//! child) followed by child refs. All mutation is by path copy: a changed
//! node may relocate, and the parent re-points at it, up to the root, so
//! older snapshots keep observing their own nodes.

use crate::alloc::{Ref, SlabAlloc};
use crate::array::{flags, Array};
use crate::error::{CoreError, Result};

/// Maximum elements per leaf node.
pub const MAX_LEAF_SIZE: usize = 1000;

/// Maximum children per inner node.
pub const MAX_FANOUT: usize = 16;

/// A view of one leaf during a scan.
pub struct LeafChunk<'a> {
    /// Packed payload bytes.
    pub payload: &'a [u8],
    /// Element width in bits.
    pub width: u8,
    /// Elements in this leaf.
    pub size: usize,
    /// Tree index of the leaf's first element.
    pub base: usize,
    /// Ref of the leaf node.
    pub leaf_ref: Ref,
}

/// Accessor for one B+tree. Holds the root ref; mutators update it in
/// place and callers persist it into the parent structure.
#[derive(Debug, Clone, Copy)]
pub struct Tree {
    root: Ref,
    /// `flags::HAS_REFS` when elements are child refs/blobs, else 0.
    leaf_flags: u8,
}

fn child_count(offsets: &Array, alloc: &SlabAlloc, i: usize) -> Result<usize> {
    let hi = offsets.get(alloc, i)? as usize;
    let lo = if i == 0 {
        0
    } else {
        offsets.get(alloc, i - 1)? as usize
    };
    Ok(hi - lo)
}

impl Tree {
    /// Creates an empty tree (a single empty leaf).
    pub fn create(alloc: &mut SlabAlloc, holds_refs: bool) -> Result<Self> {
        let leaf_flags = if holds_refs { flags::HAS_REFS } else { 0 };
        let leaf = Array::create(alloc, leaf_flags, 0, 8)?;
        Ok(Self {
            root: leaf.ref_(),
            leaf_flags,
        })
    }

    /// Binds to an existing tree root.
    pub fn from_ref(root: Ref, holds_refs: bool) -> Self {
        Self {
            root,
            leaf_flags: if holds_refs { flags::HAS_REFS } else { 0 },
        }
    }

    /// The current root ref.
    pub fn root_ref(&self) -> Ref {
        self.root
    }

    /// Total number of elements.
    pub fn size(&self, alloc: &SlabAlloc) -> Result<usize> {
        let node = Array::from_ref(self.root);
        if !node.is_inner(alloc)? {
            return node.size(alloc);
        }
        let hdr = node.header(alloc)?;
        let offsets = Array::from_ref(node.get(alloc, 0)? as u64);
        if hdr.size <= 1 {
            return Ok(0);
        }
        offsets.get(alloc, hdr.size - 2).map(|n| n as usize)
    }

    /// Reads the element at `index`.
    pub fn get(&self, alloc: &SlabAlloc, index: usize) -> Result<i64> {
        let mut node_ref = self.root;
        let mut index = index;
        loop {
            let node = Array::from_ref(node_ref);
            if !node.is_inner(alloc)? {
                return node.get(alloc, index);
            }
            let (child, sub) = self.descend(alloc, node_ref, index)?;
            node_ref = child;
            index = sub;
        }
    }

    /// Locates the child holding tree index `index` in inner node `r`.
    /// Returns (child ref, index within child).
    fn descend(&self, alloc: &SlabAlloc, r: Ref, index: usize) -> Result<(Ref, usize)> {
        let node = Array::from_ref(r);
        let hdr = node.header(alloc)?;
        let offsets = Array::from_ref(node.get(alloc, 0)? as u64);
        let children = hdr.size - 1;
        let mut lo = 0usize;
        let mut hi = children;
        // First child whose cumulative count exceeds `index`.
        while lo < hi {
            let mid = (lo + hi) / 2;
            if (offsets.get(alloc, mid)? as usize) <= index {
                lo = mid + 1;
            } else {
                hi = mid;
            }
        }
        if lo >= children {
            return Err(CoreError::InvalidArgument(format!(
                "tree index {index} out of bounds"
            )));
        }
        let prior = if lo == 0 {
            0
        } else {
            offsets.get(alloc, lo - 1)? as usize
        };
        let child = node.get(alloc, 1 + lo)? as u64;
        Ok((child, index - prior))
    }

    /// Decodes eight consecutive elements starting at `index` into `out`,
    /// zero-filling past the end. Uses the leaf's packed chunk decoder when
    /// the window lies inside one leaf.
    pub fn get_chunk(&self, alloc: &SlabAlloc, index: usize, out: &mut [i64; 8]) -> Result<()> {
        let n = self.size(alloc)?;
        if index >= n {
            out.fill(0);
            return Ok(());
        }
        // Locate the leaf holding `index`.
        let mut node_ref = self.root;
        let mut sub = index;
        loop {
            let node = Array::from_ref(node_ref);
            if !node.is_inner(alloc)? {
                if sub + 8 <= node.size(alloc)? {
                    return node.get_chunk(alloc, sub, out);
                }
                break;
            }
            let (child, s) = self.descend(alloc, node_ref, sub)?;
            node_ref = child;
            sub = s;
        }
        // Window straddles a leaf boundary; assemble element-wise.
        for (k, slot) in out.iter_mut().enumerate() {
            *slot = if index + k < n {
                self.get(alloc, index + k)?
            } else {
                0
            };
        }
        Ok(())
    }

    /// Writes the element at `index`, promoting leaf width as needed.
    pub fn set(&mut self, alloc: &mut SlabAlloc, index: usize, value: i64) -> Result<()> {
        self.root = self.set_recurse(alloc, self.root, index, value)?;
        Ok(())
    }

    fn set_recurse(&self, alloc: &mut SlabAlloc, r: Ref, index: usize, value: i64) -> Result<Ref> {
        let node = Array::from_ref(r);
        if !node.is_inner(alloc)? {
            let mut leaf = node;
            leaf.ensure_fits(alloc, value, 0)?;
            leaf.set(alloc, index, value)?;
            return Ok(leaf.ref_());
        }
        let (child_pos, sub_index) = self.child_position(alloc, r, index)?;
        let child = node.get(alloc, 1 + child_pos)? as u64;
        let new_child = self.set_recurse(alloc, child, sub_index, value)?;
        let mut node = node;
        if new_child != child {
            node.copy_on_write(alloc)?;
            node.set(alloc, 1 + child_pos, new_child as i64)?;
        }
        Ok(node.ref_())
    }

    /// Like [`Self::descend`] but returns the child slot index.
    fn child_position(&self, alloc: &SlabAlloc, r: Ref, index: usize) -> Result<(usize, usize)> {
        let node = Array::from_ref(r);
        let hdr = node.header(alloc)?;
        let offsets = Array::from_ref(node.get(alloc, 0)? as u64);
        let children = hdr.size - 1;
        let mut lo = 0usize;
        let mut hi = children;
        while lo < hi {
            let mid = (lo + hi) / 2;
            if (offsets.get(alloc, mid)? as usize) <= index {
                lo = mid + 1;
            } else {
                hi = mid;
            }
        }
        if lo >= children {
            return Err(CoreError::InvalidArgument(format!(
                "tree index {index} out of bounds"
            )));
        }
        let prior = if lo == 0 {
            0
        } else {
            offsets.get(alloc, lo - 1)? as usize
        };
        Ok((lo, index - prior))
    }

    /// Inserts `value` before `index`.
    pub fn insert(&mut self, alloc: &mut SlabAlloc, index: usize, value: i64) -> Result<()> {
        match self.insert_recurse(alloc, self.root, index, value)? {
            InsertOutcome::Done(r) => {
                self.root = r;
            }
            InsertOutcome::Split(left, right, left_count, right_count) => {
                // Grow the tree by one level.
                self.root = make_inner(alloc, &[(left, left_count), (right, right_count)])?;
            }
        }
        Ok(())
    }

    /// Appends `value`.
    pub fn push(&mut self, alloc: &mut SlabAlloc, value: i64) -> Result<()> {
        let n = self.size(alloc)?;
        self.insert(alloc, n, value)
    }

    fn insert_recurse(
        &self,
        alloc: &mut SlabAlloc,
        r: Ref,
        index: usize,
        value: i64,
    ) -> Result<InsertOutcome> {
        let node = Array::from_ref(r);
        if !node.is_inner(alloc)? {
            let size = node.size(alloc)?;
            if size < MAX_LEAF_SIZE {
                let mut leaf = node;
                leaf.insert(alloc, index, value)?;
                return Ok(InsertOutcome::Done(leaf.ref_()));
            }
            // Split the full leaf, then insert into the proper half.
            let half = size / 2;
            let mut values = Vec::with_capacity(size - half);
            for i in half..size {
                values.push(node.get(alloc, i)?);
            }
            let mut right = Array::create(alloc, self.leaf_flags, 0, values.len() + 1)?;
            for &v in &values {
                right.push(alloc, v)?;
            }
            let mut left = node;
            left.truncate(alloc, half)?;
            let mut left_count = half;
            let mut right_count = values.len();
            if index <= half {
                left.insert(alloc, index, value)?;
                left_count += 1;
            } else {
                right.insert(alloc, index - half, value)?;
                right_count += 1;
            }
            return Ok(InsertOutcome::Split(
                left.ref_(),
                right.ref_(),
                left_count,
                right_count,
            ));
        }

        // Inner node: pick the child; allow insertion at the very end.
        let total = self.node_total(alloc, r)?;
        let (child_pos, sub_index) = if index == total {
            let hdr = node.header(alloc)?;
            let children = hdr.size - 1;
            let offsets = Array::from_ref(node.get(alloc, 0)? as u64);
            let last_count = child_count(&offsets, alloc, children - 1)?;
            (children - 1, last_count)
        } else {
            self.child_position(alloc, r, index)?
        };
        let child = node.get(alloc, 1 + child_pos)? as u64;
        let outcome = self.insert_recurse(alloc, child, sub_index, value)?;
        let mut entries = self.collect_children(alloc, r)?;
        match outcome {
            InsertOutcome::Done(new_child) => {
                entries[child_pos].0 = new_child;
                entries[child_pos].1 += 1;
            }
            InsertOutcome::Split(l, rt, lc, rc) => {
                entries[child_pos] = (l, lc);
                entries.insert(child_pos + 1, (rt, rc));
            }
        }
        self.free_inner_shell(alloc, r)?;
        if entries.len() > MAX_FANOUT {
            let mid = entries.len() / 2;
            let right_entries: Vec<(Ref, usize)> = entries.drain(mid..).collect();
            let left_count = entries.iter().map(|e| e.1).sum();
            let right_count = right_entries.iter().map(|e| e.1).sum();
            let left = make_inner(alloc, &entries)?;
            let right = make_inner(alloc, &right_entries)?;
            Ok(InsertOutcome::Split(left, right, left_count, right_count))
        } else {
            Ok(InsertOutcome::Done(make_inner(alloc, &entries)?))
        }
    }

    /// Total elements below inner node `r`.
    fn node_total(&self, alloc: &SlabAlloc, r: Ref) -> Result<usize> {
        let node = Array::from_ref(r);
        let hdr = node.header(alloc)?;
        let offsets = Array::from_ref(node.get(alloc, 0)? as u64);
        offsets.get(alloc, hdr.size - 2).map(|n| n as usize)
    }

    /// (child ref, element count) pairs of inner node `r`.
    fn collect_children(&self, alloc: &SlabAlloc, r: Ref) -> Result<Vec<(Ref, usize)>> {
        let node = Array::from_ref(r);
        let hdr = node.header(alloc)?;
        let offsets = Array::from_ref(node.get(alloc, 0)? as u64);
        let children = hdr.size - 1;
        let mut out = Vec::with_capacity(children);
        for i in 0..children {
            let child = node.get(alloc, 1 + i)? as u64;
            out.push((child, child_count(&offsets, alloc, i)?));
        }
        Ok(out)
    }

    /// Frees an inner node and its offsets array, leaving children alone.
    fn free_inner_shell(&self, alloc: &mut SlabAlloc, r: Ref) -> Result<()> {
        let node = Array::from_ref(r);
        let offsets_ref = node.get(alloc, 0)? as u64;
        Array::from_ref(offsets_ref).destroy(alloc)?;
        node.destroy(alloc)
    }

    /// Removes the element at `index`.
    pub fn erase(&mut self, alloc: &mut SlabAlloc, index: usize) -> Result<()> {
        match self.erase_recurse(alloc, self.root, index)? {
            Some(r) => self.root = r,
            None => {
                // Tree emptied out; restart with a fresh leaf.
                let leaf = Array::create(alloc, self.leaf_flags, 0, 8)?;
                self.root = leaf.ref_();
            }
        }
        // Collapse a root with a single child.
        let root = Array::from_ref(self.root);
        if root.is_inner(alloc)? && root.size(alloc)? == 2 {
            let child = root.get(alloc, 1)? as u64;
            self.free_inner_shell(alloc, self.root)?;
            self.root = child;
        }
        Ok(())
    }

    fn erase_recurse(&self, alloc: &mut SlabAlloc, r: Ref, index: usize) -> Result<Option<Ref>> {
        let node = Array::from_ref(r);
        if !node.is_inner(alloc)? {
            let mut leaf = node;
            leaf.erase(alloc, index)?;
            if leaf.size(alloc)? == 0 {
                leaf.destroy(alloc)?;
                return Ok(None);
            }
            return Ok(Some(leaf.ref_()));
        }
        let (child_pos, sub_index) = self.child_position(alloc, r, index)?;
        let child = node.get(alloc, 1 + child_pos)? as u64;
        let outcome = self.erase_recurse(alloc, child, sub_index)?;
        let mut entries = self.collect_children(alloc, r)?;
        match outcome {
            Some(new_child) => {
                entries[child_pos].0 = new_child;
                entries[child_pos].1 -= 1;
            }
            None => {
                entries.remove(child_pos);
            }
        }
        self.free_inner_shell(alloc, r)?;
        if entries.is_empty() {
            return Ok(None);
        }
        Ok(Some(make_inner(alloc, &entries)?))
    }

    /// Removes every element and child node, leaving an empty leaf.
    pub fn clear(&mut self, alloc: &mut SlabAlloc) -> Result<()> {
        Array::from_ref(self.root).destroy_deep(alloc)?;
        let leaf = Array::create(alloc, self.leaf_flags, 0, 8)?;
        self.root = leaf.ref_();
        Ok(())
    }

    /// Destroys the whole tree including ref'd children.
    pub fn destroy(self, alloc: &mut SlabAlloc) -> Result<()> {
        Array::from_ref(self.root).destroy_deep(alloc)
    }

    /// Walks the leaves intersecting `[start, end)` in order, handing each
    /// to `f`. `f` returns false to stop the walk early.
    pub fn for_each_leaf<F>(&self, alloc: &SlabAlloc, start: usize, end: usize, f: &mut F) -> Result<bool>
    where
        F: FnMut(LeafChunk<'_>) -> Result<bool>,
    {
        self.walk_leaves(alloc, self.root, 0, start, end, f)
    }

    fn walk_leaves<F>(
        &self,
        alloc: &SlabAlloc,
        r: Ref,
        base: usize,
        start: usize,
        end: usize,
        f: &mut F,
    ) -> Result<bool>
    where
        F: FnMut(LeafChunk<'_>) -> Result<bool>,
    {
        let node = Array::from_ref(r);
        let hdr = node.header(alloc)?;
        if hdr.flags & flags::INNER == 0 {
            if base + hdr.size <= start || base >= end {
                return Ok(true);
            }
            let payload = node.payload(alloc, &hdr)?;
            return f(LeafChunk {
                payload,
                width: hdr.width,
                size: hdr.size,
                base,
                leaf_ref: r,
            });
        }
        let offsets = Array::from_ref(node.get(alloc, 0)? as u64);
        let children = hdr.size - 1;
        let mut child_base = base;
        for i in 0..children {
            let count = child_count(&offsets, alloc, i)?;
            if child_base < end && child_base + count > start {
                let child = node.get(alloc, 1 + i)? as u64;
                if !self.walk_leaves(alloc, child, child_base, start, end, f)? {
                    return Ok(false);
                }
            }
            child_base += count;
        }
        Ok(true)
    }

    /// Collects the whole tree into a vector. Test and debug helper.
    pub fn to_vec(&self, alloc: &SlabAlloc) -> Result<Vec<i64>> {
        let mut out = Vec::new();
        let n = self.size(alloc)?;
        self.for_each_leaf(alloc, 0, n, &mut |chunk| {
            for i in 0..chunk.size {
                out.push(crate::array::get_direct(chunk.payload, chunk.width, i));
            }
            Ok(true)
        })?;
        Ok(out)
    }
}

enum InsertOutcome {
    /// Node absorbed the insert; its (possibly new) ref.
    Done(Ref),
    /// Node split into (left, right, left_count, right_count).
    Split(Ref, Ref, usize, usize),
}

/// Builds an inner node over `entries` of (child ref, element count).
fn make_inner(alloc: &mut SlabAlloc, entries: &[(Ref, usize)]) -> Result<Ref> {
    debug_assert!(!entries.is_empty());
    let mut offsets = Array::create(alloc, 0, 0, entries.len())?;
    let mut cum = 0i64;
    for &(_, count) in entries {
        cum += count as i64;
        offsets.push(alloc, cum)?;
    }
    let mut node = Array::create(
        alloc,
        flags::INNER | flags::HAS_REFS,
        64,
        entries.len() + 1,
    )?;
    node.push(alloc, offsets.ref_() as i64)?;
    for &(child, _) in entries {
        node.push(alloc, child as i64)?;
    }
    Ok(node.ref_())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::alloc::Backing;

    fn test_alloc() -> (tempfile::TempDir, SlabAlloc) {
        let dir = tempfile::tempdir().unwrap();
        let mut backing = Backing::attach(dir.path().join("tree.tsra"), None).unwrap();
        backing.grow(crate::alloc::HEADER_SIZE as u64).unwrap();
        let mut alloc = SlabAlloc::new(backing);
        alloc.bind(crate::alloc::HEADER_SIZE as u64).unwrap();
        (dir, alloc)
    }

    #[test]
    fn push_and_get_across_splits() {
        let (_dir, mut alloc) = test_alloc();
        let mut tree = Tree::create(&mut alloc, false).unwrap();
        let n = 5000;
        for i in 0..n {
            tree.push(&mut alloc, i as i64 * 3).unwrap();
        }
        assert_eq!(tree.size(&alloc).unwrap(), n);
        for i in (0..n).step_by(97) {
            assert_eq!(tree.get(&alloc, i).unwrap(), i as i64 * 3);
        }
        assert_eq!(tree.get(&alloc, n - 1).unwrap(), (n as i64 - 1) * 3);
    }

    #[test]
    fn insert_in_middle_keeps_order() {
        let (_dir, mut alloc) = test_alloc();
        let mut tree = Tree::create(&mut alloc, false).unwrap();
        for i in 0..2500 {
            tree.push(&mut alloc, i).unwrap();
        }
        tree.insert(&mut alloc, 1200, -7).unwrap();
        assert_eq!(tree.get(&alloc, 1199).unwrap(), 1199);
        assert_eq!(tree.get(&alloc, 1200).unwrap(), -7);
        assert_eq!(tree.get(&alloc, 1201).unwrap(), 1200);
        assert_eq!(tree.size(&alloc).unwrap(), 2501);
    }

    #[test]
    fn erase_shrinks_and_collapses() {
        let (_dir, mut alloc) = test_alloc();
        let mut tree = Tree::create(&mut alloc, false).unwrap();
        for i in 0..3000 {
            tree.push(&mut alloc, i).unwrap();
        }
        for _ in 0..2999 {
            tree.erase(&mut alloc, 0).unwrap();
        }
        assert_eq!(tree.size(&alloc).unwrap(), 1);
        assert_eq!(tree.get(&alloc, 0).unwrap(), 2999);
        tree.erase(&mut alloc, 0).unwrap();
        assert_eq!(tree.size(&alloc).unwrap(), 0);
    }

    #[test]
    fn set_promotes_leaf_width() {
        let (_dir, mut alloc) = test_alloc();
        let mut tree = Tree::create(&mut alloc, false).unwrap();
        for i in 0..10 {
            tree.push(&mut alloc, i % 2).unwrap();
        }
        tree.set(&mut alloc, 3, 1_000_000).unwrap();
        assert_eq!(tree.get(&alloc, 3).unwrap(), 1_000_000);
        assert_eq!(tree.get(&alloc, 4).unwrap(), 0);
    }

    #[test]
    fn leaf_walk_covers_range() {
        let (_dir, mut alloc) = test_alloc();
        let mut tree = Tree::create(&mut alloc, false).unwrap();
        for i in 0..4000 {
            tree.push(&mut alloc, i).unwrap();
        }
        let mut seen = Vec::new();
        tree.for_each_leaf(&alloc, 1500, 2500, &mut |chunk| {
            let lo = chunk.base.max(1500) - chunk.base;
            let hi = (chunk.base + chunk.size).min(2500) - chunk.base;
            for i in lo..hi {
                seen.push(crate::array::get_direct(chunk.payload, chunk.width, i));
            }
            Ok(true)
        })
        .unwrap();
        let expect: Vec<i64> = (1500..2500).collect();
        assert_eq!(seen, expect);
    }

    #[test]
    fn get_chunk_inside_and_across_leaves() {
        let (_dir, mut alloc) = test_alloc();
        let mut tree = Tree::create(&mut alloc, false).unwrap();
        for i in 0..2100 {
            tree.push(&mut alloc, i).unwrap();
        }
        let mut out = [0i64; 8];
        tree.get_chunk(&alloc, 100, &mut out).unwrap();
        assert_eq!(out, [100, 101, 102, 103, 104, 105, 106, 107]);
        // Straddles the first leaf split boundary.
        tree.get_chunk(&alloc, 997, &mut out).unwrap();
        assert_eq!(out, [997, 998, 999, 1000, 1001, 1002, 1003, 1004]);
        // Tail window zero-fills.
        tree.get_chunk(&alloc, 2096, &mut out).unwrap();
        assert_eq!(out, [2096, 2097, 2098, 2099, 0, 0, 0, 0]);
    }

    #[test]
    fn to_vec_roundtrip() {
        let (_dir, mut alloc) = test_alloc();
        let mut tree = Tree::create(&mut alloc, false).unwrap();
        let values: Vec<i64> = (0..1234).map(|i| (i * i) % 100_000).collect();
        for &v in &values {
            tree.push(&mut alloc, v).unwrap();
        }
        assert_eq!(tree.to_vec(&alloc).unwrap(), values);
    }
}
