//! The group: all tables of one snapshot.
//!
//! A group is rebuilt from the top array every time a transaction binds a
//! snapshot. The top array carries, in fixed slots, the table-name tree,
//! the table-top tree, the logical file size, the three persisted free-list
//! arrays, the commit version, and the history type/ref. Committing writes
//! a fresh top array and swaps the header slot, so the data top and the
//! history ref always move together.

use tracing::debug;

use crate::alloc::{FreeRegion, Ref, SlabAlloc, NULL_REF};
use crate::array::{blob, flags, tag_int, untag_int, Array};
use crate::error::{CoreError, Result};
use crate::keys::TableKey;
use crate::table::TableState;

const TOP_NAMES: usize = 0;
const TOP_TABLES: usize = 1;
const TOP_LOGICAL_SIZE: usize = 2;
const TOP_FREE_POS: usize = 3;
const TOP_FREE_LEN: usize = 4;
const TOP_FREE_VER: usize = 5;
const TOP_VERSION: usize = 6;
const TOP_HISTORY_TYPE: usize = 7;
const TOP_HISTORY_REF: usize = 8;
const TOP_SLOTS: usize = 9;

/// History type tag for "no history attached".
pub const HIST_NONE: u64 = 0;

/// The set of tables bound to one snapshot version.
pub struct Group {
    /// Per-slot table state; `None` marks removed table keys.
    pub(crate) tables: Vec<Option<TableState>>,
    /// Commit version this group was read from.
    pub(crate) version: u64,
    /// History type tag stored in the file.
    pub(crate) history_type: u64,
    /// Ref of the history structure, or 0.
    pub(crate) history_ref: Ref,
    /// Bumped on every mutation; collection accessors revalidate on it.
    pub(crate) content_version: u64,
}

impl Group {
    /// An empty group for a freshly created file.
    pub fn new_empty() -> Self {
        Self {
            tables: Vec::new(),
            version: 0,
            history_type: HIST_NONE,
            history_ref: NULL_REF,
            content_version: 0,
        }
    }

    /// Rebuilds the group from a top array ref.
    pub fn attach(alloc: &SlabAlloc, top_ref: Ref) -> Result<Self> {
        if top_ref == NULL_REF {
            return Ok(Self::new_empty());
        }
        let top = Array::from_ref(top_ref);
        if top.size(alloc)? < TOP_SLOTS {
            return Err(CoreError::InvalidDatabase(
                "top array has too few slots".into(),
            ));
        }
        let names = Array::from_ref(top.get(alloc, TOP_NAMES)? as u64);
        let tops = Array::from_ref(top.get(alloc, TOP_TABLES)? as u64);
        let n = tops.size(alloc)?;
        let mut tables = Vec::with_capacity(n);
        for i in 0..n {
            let table_top = tops.get(alloc, i)? as u64;
            if table_top == NULL_REF {
                tables.push(None);
                continue;
            }
            let name_ref = names.get(alloc, i)? as u64;
            let name = String::from_utf8(blob::data(alloc, name_ref)?.to_vec())
                .map_err(|_| CoreError::Corruption("table name is not UTF-8".into()))?;
            tables.push(Some(TableState::load(
                alloc,
                TableKey(i as u32),
                name,
                table_top,
            )?));
        }
        Ok(Self {
            tables,
            version: untag_int(top.get(alloc, TOP_VERSION)?),
            history_type: untag_int(top.get(alloc, TOP_HISTORY_TYPE)?),
            history_ref: decode_ref_slot(top.get(alloc, TOP_HISTORY_REF)?),
            content_version: 0,
        })
    }

    /// Commit version the group was attached at.
    pub fn version(&self) -> u64 {
        self.version
    }

    /// Content version stamp for accessor revalidation.
    pub fn content_version(&self) -> u64 {
        self.content_version
    }

    pub(crate) fn bump_content_version(&mut self) {
        self.content_version += 1;
    }

    /// Keys of the live tables.
    pub fn table_keys(&self) -> Vec<TableKey> {
        self.tables
            .iter()
            .enumerate()
            .filter(|(_, t)| t.is_some())
            .map(|(i, _)| TableKey(i as u32))
            .collect()
    }

    /// Looks a table up by name.
    pub fn table_key_by_name(&self, name: &str) -> Option<TableKey> {
        self.tables.iter().enumerate().find_map(|(i, t)| {
            t.as_ref()
                .filter(|t| t.name == name)
                .map(|_| TableKey(i as u32))
        })
    }

    /// True when `tk` names a live table.
    pub fn has_table(&self, tk: TableKey) -> bool {
        self.tables
            .get(tk.0 as usize)
            .map(|t| t.is_some())
            .unwrap_or(false)
    }

    /// Name of a table.
    pub fn table_name(&self, tk: TableKey) -> Result<&str> {
        self.state(tk).map(|t| t.name.as_str())
    }

    pub(crate) fn state(&self, tk: TableKey) -> Result<&TableState> {
        self.tables
            .get(tk.0 as usize)
            .and_then(|t| t.as_ref())
            .ok_or(CoreError::InvalidArgument(format!(
                "no table with key {}",
                tk.0
            )))
    }

    pub(crate) fn state_mut(&mut self, tk: TableKey) -> Result<&mut TableState> {
        self.tables
            .get_mut(tk.0 as usize)
            .and_then(|t| t.as_mut())
            .ok_or(CoreError::InvalidArgument(format!(
                "no table with key {}",
                tk.0
            )))
    }

    /// Creates a table. Legal only inside a write transaction; the
    /// transaction layer enforces the stage.
    pub fn add_table(&mut self, alloc: &mut SlabAlloc, name: &str) -> Result<TableKey> {
        if self.table_key_by_name(name).is_some() {
            return Err(CoreError::InvalidArgument(format!(
                "table '{name}' already exists"
            )));
        }
        let tk = TableKey(self.tables.len() as u32);
        let state = TableState::create(alloc, tk, name.to_string())?;
        self.tables.push(Some(state));
        self.bump_content_version();
        debug!(table = name, key = tk.0, "added table");
        Ok(tk)
    }

    /// Removes a table and destroys its storage. The slot is retired, never
    /// reused, so stale `TableKey`s keep failing cleanly.
    pub fn remove_table(&mut self, alloc: &mut SlabAlloc, tk: TableKey) -> Result<()> {
        let state = self
            .tables
            .get_mut(tk.0 as usize)
            .and_then(|t| t.take())
            .ok_or(CoreError::InvalidArgument(format!(
                "no table with key {}",
                tk.0
            )))?;
        debug!(table = %state.name, key = state.key.0, "removing table");
        state.destroy(alloc)?;
        self.bump_content_version();
        Ok(())
    }

    /// Writes the group as a fresh top array and returns its ref, together
    /// with the final logical file size recorded inside it.
    ///
    /// `free_regions` must already contain every region this commit
    /// releases; the only allocations after this call are forbidden, since
    /// the logical size is sealed here.
    pub fn flush(
        &mut self,
        alloc: &mut SlabAlloc,
        new_version: u64,
        free_regions: &[FreeRegion],
    ) -> Result<(Ref, u64)> {
        // Table name + table top arrays. Everything in this function is
        // created at width 64 with exact capacity: a commit flush must not
        // free or relocate anything, or the free list written below would
        // go stale while being written.
        let count = self.tables.len().max(1);
        let mut names = Array::create(alloc, flags::HAS_REFS, 64, count)?;
        let mut tops = Array::create(alloc, flags::HAS_REFS, 64, count)?;
        for slot in &self.tables {
            match slot {
                Some(t) => {
                    let name_ref = blob::create(alloc, t.name.as_bytes())?;
                    names.push(alloc, name_ref as i64)?;
                    tops.push(alloc, t.top as i64)?;
                }
                None => {
                    names.push(alloc, NULL_REF as i64)?;
                    tops.push(alloc, NULL_REF as i64)?;
                }
            }
        }

        // Free lists: three parallel width-64 arrays.
        let fcount = free_regions.len().max(1);
        let mut free_pos = Array::create(alloc, 0, 64, fcount)?;
        let mut free_len = Array::create(alloc, 0, 64, fcount)?;
        let mut free_ver = Array::create(alloc, 0, 64, fcount)?;
        for region in free_regions {
            free_pos.push(alloc, region.pos as i64)?;
            free_len.push(alloc, region.len as i64)?;
            free_ver.push(alloc, region.version as i64)?;
        }

        let mut top = Array::create(alloc, flags::HAS_REFS, 64, TOP_SLOTS)?;
        for _ in 0..TOP_SLOTS {
            top.push(alloc, tag_int(0))?;
        }
        top.set(alloc, TOP_NAMES, names.ref_() as i64)?;
        top.set(alloc, TOP_TABLES, tops.ref_() as i64)?;
        top.set(alloc, TOP_FREE_POS, free_pos.ref_() as i64)?;
        top.set(alloc, TOP_FREE_LEN, free_len.ref_() as i64)?;
        top.set(alloc, TOP_FREE_VER, free_ver.ref_() as i64)?;
        top.set(alloc, TOP_VERSION, tag_int(new_version))?;
        top.set(alloc, TOP_HISTORY_TYPE, tag_int(self.history_type))?;
        top.set(
            alloc,
            TOP_HISTORY_REF,
            if self.history_ref == NULL_REF {
                tag_int(0)
            } else {
                self.history_ref as i64
            },
        )?;

        // Everything is allocated now; seal the logical size.
        let logical_size = alloc.logical_top();
        top.set(alloc, TOP_LOGICAL_SIZE, tag_int(logical_size))?;
        self.version = new_version;
        Ok((top.ref_(), logical_size))
    }

    /// Reads the persisted free list from a top array.
    pub fn load_free_list(alloc: &SlabAlloc, top_ref: Ref) -> Result<Vec<FreeRegion>> {
        if top_ref == NULL_REF {
            return Ok(Vec::new());
        }
        let top = Array::from_ref(top_ref);
        let pos = Array::from_ref(top.get(alloc, TOP_FREE_POS)? as u64);
        let len = Array::from_ref(top.get(alloc, TOP_FREE_LEN)? as u64);
        let ver = Array::from_ref(top.get(alloc, TOP_FREE_VER)? as u64);
        let n = pos.size(alloc)?;
        let mut out = Vec::with_capacity(n);
        for i in 0..n {
            out.push(FreeRegion {
                pos: pos.get(alloc, i)? as u64,
                len: len.get(alloc, i)? as u64,
                version: ver.get(alloc, i)? as u64,
            });
        }
        Ok(out)
    }

    /// Reads the logical file size recorded in a top array.
    pub fn load_logical_size(alloc: &SlabAlloc, top_ref: Ref) -> Result<u64> {
        if top_ref == NULL_REF {
            return Ok(crate::alloc::HEADER_SIZE as u64);
        }
        let top = Array::from_ref(top_ref);
        Ok(untag_int(top.get(alloc, TOP_LOGICAL_SIZE)?))
    }

    /// Reads the (version, history type, history ref) triple from a top
    /// array without attaching a full group.
    pub fn load_version_info(alloc: &SlabAlloc, top_ref: Ref) -> Result<(u64, u64, Ref)> {
        if top_ref == NULL_REF {
            return Ok((0, HIST_NONE, NULL_REF));
        }
        let top = Array::from_ref(top_ref);
        Ok((
            untag_int(top.get(alloc, TOP_VERSION)?),
            untag_int(top.get(alloc, TOP_HISTORY_TYPE)?),
            decode_ref_slot(top.get(alloc, TOP_HISTORY_REF)?),
        ))
    }
}

/// A top-array slot that holds either a ref or a tagged null.
fn decode_ref_slot(v: i64) -> Ref {
    if v & 1 == 1 {
        NULL_REF
    } else {
        v as u64
    }
}

/// Frees the top-level shells of a superseded snapshot: the top array, the
/// name blobs, and the free-list arrays. Table tops are shared between
/// snapshots through copy-on-write and are freed by the COW path instead.
pub fn free_top_shells(alloc: &mut SlabAlloc, top_ref: Ref) -> Result<()> {
    if top_ref == NULL_REF {
        return Ok(());
    }
    let top = Array::from_ref(top_ref);
    let names = Array::from_ref(top.get(alloc, TOP_NAMES)? as u64);
    names.destroy_deep(alloc)?;
    Array::from_ref(top.get(alloc, TOP_TABLES)? as u64).destroy(alloc)?;
    Array::from_ref(top.get(alloc, TOP_FREE_POS)? as u64).destroy(alloc)?;
    Array::from_ref(top.get(alloc, TOP_FREE_LEN)? as u64).destroy(alloc)?;
    Array::from_ref(top.get(alloc, TOP_FREE_VER)? as u64).destroy(alloc)?;
    top.destroy(alloc)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::alloc::Backing;

    fn test_alloc() -> (tempfile::TempDir, SlabAlloc) {
        let dir = tempfile::tempdir().unwrap();
        let mut backing = Backing::attach(dir.path().join("group.tsra"), None).unwrap();
        backing.grow(crate::alloc::HEADER_SIZE as u64).unwrap();
        let mut alloc = SlabAlloc::new(backing);
        alloc.bind(crate::alloc::HEADER_SIZE as u64).unwrap();
        (dir, alloc)
    }

    #[test]
    fn flush_and_attach_roundtrip() {
        let (_dir, mut alloc) = test_alloc();
        let mut group = Group::new_empty();
        let tk = group.add_table(&mut alloc, "people").unwrap();
        let (top, size) = group.flush(&mut alloc, 1, &[]).unwrap();
        assert!(size > 0);

        let back = Group::attach(&alloc, top).unwrap();
        assert_eq!(back.version(), 1);
        assert_eq!(back.table_key_by_name("people"), Some(tk));
        assert_eq!(back.table_keys(), vec![tk]);
    }

    #[test]
    fn removed_table_slot_is_retired() {
        let (_dir, mut alloc) = test_alloc();
        let mut group = Group::new_empty();
        let a = group.add_table(&mut alloc, "a").unwrap();
        let b = group.add_table(&mut alloc, "b").unwrap();
        group.remove_table(&mut alloc, a).unwrap();
        let (top, _) = group.flush(&mut alloc, 1, &[]).unwrap();
        let back = Group::attach(&alloc, top).unwrap();
        assert!(!back.has_table(a));
        assert!(back.has_table(b));
        assert_eq!(back.table_keys(), vec![b]);
    }

    #[test]
    fn free_list_roundtrip() {
        let (_dir, mut alloc) = test_alloc();
        let mut group = Group::new_empty();
        let regions = vec![
            FreeRegion {
                pos: 1024,
                len: 64,
                version: 3,
            },
            FreeRegion {
                pos: 4096,
                len: 128,
                version: 4,
            },
        ];
        let (top, _) = group.flush(&mut alloc, 5, &regions).unwrap();
        assert_eq!(Group::load_free_list(&alloc, top).unwrap(), regions);
        let (version, htype, href) = Group::load_version_info(&alloc, top).unwrap();
        assert_eq!(version, 5);
        assert_eq!(htype, HIST_NONE);
        assert_eq!(href, NULL_REF);
    }
}
