//! Typed columns atop B+trees.
//!
//! Every column is persisted as a two-slot "column top" array:
//! slot 0 the main tree, slot 1 an auxiliary structure: the null bit
//! vector for nullable integer columns, the enumeration dictionary for
//! string columns, zero otherwise. The choice of null representation is
//! recorded in the column's attribute flags at creation and never changes.

use crate::alloc::{Ref, SlabAlloc, NULL_REF};
use crate::array::{blob, flags, Array};
use crate::error::{CoreError, Result};
use crate::tree::Tree;

/// Logical column types. The tag is persisted inside [`crate::keys::ColKey`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ColumnType {
    /// 64-bit signed integer.
    Int = 0,
    /// Boolean, stored at width 1.
    Bool = 1,
    /// Enumerated string: small-width ids into a dictionary.
    String = 2,
    /// Single link to an object of a target table.
    Link = 3,
    /// Ordered list collection cell.
    List = 4,
    /// Unordered unique-value collection cell.
    Set = 5,
    /// String-keyed dictionary collection cell.
    Dictionary = 6,
    /// Hidden backlink column maintained for link columns.
    Backlink = 7,
}

impl ColumnType {
    /// Decodes a persisted tag; unknown tags fall back to Int, which the
    /// schema validator rejects before use.
    pub fn from_tag(tag: u8) -> Self {
        match tag {
            1 => ColumnType::Bool,
            2 => ColumnType::String,
            3 => ColumnType::Link,
            4 => ColumnType::List,
            5 => ColumnType::Set,
            6 => ColumnType::Dictionary,
            7 => ColumnType::Backlink,
            _ => ColumnType::Int,
        }
    }

    /// True for the collection cell types.
    pub fn is_collection(self) -> bool {
        matches!(
            self,
            ColumnType::List | ColumnType::Set | ColumnType::Dictionary
        )
    }

    /// True when the column's cells hold refs into nested structures.
    pub fn holds_refs(self) -> bool {
        self.is_collection() || self == ColumnType::Backlink
    }
}

/// Accessor for one column top.
#[derive(Debug, Clone, Copy)]
pub struct ColumnTop {
    top: Ref,
}

impl ColumnTop {
    /// Creates the persisted structure for a fresh column of `ty`.
    pub fn create(alloc: &mut SlabAlloc, ty: ColumnType, nullable: bool) -> Result<Self> {
        let main = Tree::create(alloc, ty.holds_refs())?;
        let aux: Ref = match ty {
            ColumnType::Int if nullable => Tree::create(alloc, false)?.root_ref(),
            ColumnType::String => Tree::create(alloc, true)?.root_ref(),
            _ => NULL_REF,
        };
        let mut top = Array::create(alloc, flags::HAS_REFS, 64, 2)?;
        top.push(alloc, main.root_ref() as i64)?;
        top.push(alloc, aux as i64)?;
        Ok(Self { top: top.ref_() })
    }

    /// Binds to an existing column top.
    pub fn from_ref(top: Ref) -> Self {
        Self { top }
    }

    /// Ref of the column top array.
    pub fn ref_(&self) -> Ref {
        self.top
    }

    /// The main value tree.
    pub fn main_tree(&self, alloc: &SlabAlloc, ty: ColumnType) -> Result<Tree> {
        let top = Array::from_ref(self.top);
        Ok(Tree::from_ref(top.get(alloc, 0)? as u64, ty.holds_refs()))
    }

    /// The auxiliary tree (null bits or dictionary), when present.
    pub fn aux_tree(&self, alloc: &SlabAlloc, holds_refs: bool) -> Result<Option<Tree>> {
        let top = Array::from_ref(self.top);
        let r = top.get(alloc, 1)? as u64;
        Ok((r != NULL_REF).then(|| Tree::from_ref(r, holds_refs)))
    }

    /// Persists an updated main tree root.
    pub fn set_main_root(&mut self, alloc: &mut SlabAlloc, root: Ref) -> Result<()> {
        let mut top = Array::from_ref(self.top);
        top.copy_on_write(alloc)?;
        top.set(alloc, 0, root as i64)?;
        self.top = top.ref_();
        Ok(())
    }

    /// Persists an updated auxiliary tree root.
    pub fn set_aux_root(&mut self, alloc: &mut SlabAlloc, root: Ref) -> Result<()> {
        let mut top = Array::from_ref(self.top);
        top.copy_on_write(alloc)?;
        top.set(alloc, 1, root as i64)?;
        self.top = top.ref_();
        Ok(())
    }

    /// Destroys the column and everything it owns.
    pub fn destroy(self, alloc: &mut SlabAlloc) -> Result<()> {
        Array::from_ref(self.top).destroy_deep(alloc)
    }
}

/// Enumerated-string dictionary: a tree of blob refs where the string id is
/// the tree index. Lookups compare against the enumeration once; the column
/// itself stays a small-width integer tree of ids.
pub struct StringDict;

impl StringDict {
    /// Id of `s`, when already interned.
    pub fn find(alloc: &SlabAlloc, dict: &Tree, s: &str) -> Result<Option<i64>> {
        let n = dict.size(alloc)?;
        for id in 0..n {
            let r = dict.get(alloc, id)? as u64;
            if blob::data(alloc, r)? == s.as_bytes() {
                return Ok(Some(id as i64));
            }
        }
        Ok(None)
    }

    /// Id of `s`, interning it when new. The dictionary root may move;
    /// callers persist it.
    pub fn intern(alloc: &mut SlabAlloc, dict: &mut Tree, s: &str) -> Result<i64> {
        if let Some(id) = Self::find(alloc, dict, s)? {
            return Ok(id);
        }
        let r = blob::create(alloc, s.as_bytes())?;
        let id = dict.size(alloc)? as i64;
        dict.push(alloc, r as i64)?;
        Ok(id)
    }

    /// The string with id `id`.
    pub fn get(alloc: &SlabAlloc, dict: &Tree, id: i64) -> Result<String> {
        if id < 0 {
            return Err(CoreError::Corruption("negative string id".into()));
        }
        let r = dict.get(alloc, id as usize)? as u64;
        let bytes = blob::data(alloc, r)?;
        String::from_utf8(bytes.to_vec())
            .map_err(|_| CoreError::Corruption("dictionary entry is not UTF-8".into()))
    }
}

/// Encoding of single-link cells: 0 is null, otherwise ObjKey value + 1,
/// with bit 62 marking an unresolved (tombstone) target.
pub mod link {
    /// Tombstone marker bit.
    pub const TOMBSTONE_BIT: i64 = 1 << 62;

    /// Encodes a live target key.
    pub fn encode(key: u64) -> i64 {
        key as i64 + 1
    }

    /// Null cell value.
    pub const NULL: i64 = 0;

    /// Decodes a cell value into (key, is_tombstone).
    pub fn decode(v: i64) -> Option<(u64, bool)> {
        if v == NULL {
            return None;
        }
        let ts = v & TOMBSTONE_BIT != 0;
        Some(((v & !TOMBSTONE_BIT) as u64 - 1, ts))
    }

    /// Marks a cell value as tombstoned, keeping the key recoverable.
    pub fn tombstone(v: i64) -> i64 {
        if v == NULL {
            NULL
        } else {
            v | TOMBSTONE_BIT
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::alloc::Backing;

    fn test_alloc() -> (tempfile::TempDir, SlabAlloc) {
        let dir = tempfile::tempdir().unwrap();
        let mut backing = Backing::attach(dir.path().join("col.tsra"), None).unwrap();
        backing.grow(crate::alloc::HEADER_SIZE as u64).unwrap();
        let mut alloc = SlabAlloc::new(backing);
        alloc.bind(crate::alloc::HEADER_SIZE as u64).unwrap();
        (dir, alloc)
    }

    #[test]
    fn string_dict_interns_once() {
        let (_dir, mut alloc) = test_alloc();
        let mut dict = Tree::create(&mut alloc, true).unwrap();
        let a = StringDict::intern(&mut alloc, &mut dict, "red").unwrap();
        let b = StringDict::intern(&mut alloc, &mut dict, "green").unwrap();
        let a2 = StringDict::intern(&mut alloc, &mut dict, "red").unwrap();
        assert_eq!(a, a2);
        assert_ne!(a, b);
        assert_eq!(StringDict::get(&alloc, &dict, b).unwrap(), "green");
    }

    #[test]
    fn link_encoding() {
        assert_eq!(link::decode(link::NULL), None);
        let v = link::encode(41);
        assert_eq!(link::decode(v), Some((41, false)));
        let t = link::tombstone(v);
        assert_eq!(link::decode(t), Some((41, true)));
    }

    #[test]
    fn nullable_int_column_has_null_tree() {
        let (_dir, mut alloc) = test_alloc();
        let top = ColumnTop::create(&mut alloc, ColumnType::Int, true).unwrap();
        assert!(top.aux_tree(&alloc, false).unwrap().is_some());
        let plain = ColumnTop::create(&mut alloc, ColumnType::Int, false).unwrap();
        assert!(plain.aux_tree(&alloc, false).unwrap().is_none());
    }
}
