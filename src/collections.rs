//! Collection accessors: List, Set, Dictionary.
//!
//! A collection cell stores the ref of a nested tree whose lifetime is
//! scoped to the owning object cell. Accessors are bound to
//! `(TableKey, ObjKey, ColKey)` and revalidate lazily: before every
//! operation the owning table's content version is compared to the cached
//! one, and on mismatch the cell ref is re-read through the group. If the
//! owning object is gone the accessor surfaces `StaleAccessor`.
//!
//! Collections of objects keep tombstoned entries (the target was
//! invalidated) in the tree; the condensed index view hides them, the real
//! index view exposes them for replication.

use crate::alloc::{Ref, SlabAlloc, NULL_REF};
use crate::array::{blob, flags, Array};
use crate::column::{link, ColumnType};
use crate::error::{CoreError, Result};
use crate::group::Group;
use crate::keys::{ColKey, ObjKey, TableKey};
use crate::table::{backlink_add, backlink_remove, ColumnTarget};
use crate::tree::Tree;

/// Shared binding and revalidation logic for all collection kinds.
struct CollectionBase {
    tk: TableKey,
    obj: ObjKey,
    ck: ColKey,
    cell: Ref,
    seen_version: u64,
}

impl CollectionBase {
    fn attach(
        group: &Group,
        alloc: &SlabAlloc,
        tk: TableKey,
        obj: ObjKey,
        ck: ColKey,
        expect: ColumnType,
    ) -> Result<Self> {
        if ck.column_type() != expect {
            return Err(CoreError::IllegalOperation(
                "collection accessor on wrong column type",
            ));
        }
        let mut base = Self {
            tk,
            obj,
            ck,
            cell: NULL_REF,
            seen_version: u64::MAX,
        };
        base.revalidate(group, alloc)?;
        Ok(base)
    }

    /// Re-reads the cell ref when the owning table changed underneath us.
    fn revalidate(&mut self, group: &Group, alloc: &SlabAlloc) -> Result<()> {
        let state = group.state(self.tk)?;
        if state.content_version == self.seen_version {
            return Ok(());
        }
        let pos = state.col_pos(self.ck)?;
        let row = state
            .row_of(alloc, self.obj)?
            .ok_or(CoreError::StaleAccessor("collection owner was removed"))?;
        self.cell = state.value_tree(alloc, pos)?.get(alloc, row)? as u64;
        self.seen_version = state.content_version;
        Ok(())
    }

    /// Target table for object collections.
    fn target(&self, group: &Group) -> Result<Option<TableKey>> {
        let state = group.state(self.tk)?;
        let pos = state.col_pos(self.ck)?;
        Ok(match state.columns()[pos].target {
            ColumnTarget::Table(t) => Some(t),
            _ => None,
        })
    }

    /// Writes the (possibly new) cell root back into the owning column.
    fn store_cell(&mut self, group: &mut Group, alloc: &mut SlabAlloc, cell: Ref) -> Result<()> {
        let state = group.state(self.tk)?;
        let pos = state.col_pos(self.ck)?;
        let row = state
            .row_of(alloc, self.obj)?
            .ok_or(CoreError::StaleAccessor("collection owner was removed"))?;
        group
            .state_mut(self.tk)?
            .with_value_tree(alloc, pos, |alloc, tree| tree.set(alloc, row, cell as i64))?;
        self.cell = cell;
        self.seen_version = group.state(self.tk)?.content_version;
        Ok(())
    }
}

/// Ordered list of values (or of links, when the column declares a target
/// table).
pub struct List {
    base: CollectionBase,
}

impl List {
    /// Binds a list accessor.
    pub fn attach(
        group: &Group,
        alloc: &SlabAlloc,
        tk: TableKey,
        obj: ObjKey,
        ck: ColKey,
    ) -> Result<Self> {
        Ok(Self {
            base: CollectionBase::attach(group, alloc, tk, obj, ck, ColumnType::List)?,
        })
    }

    /// Number of entries, tombstones included.
    pub fn size(&mut self, group: &Group, alloc: &SlabAlloc) -> Result<usize> {
        self.base.revalidate(group, alloc)?;
        if self.base.cell == NULL_REF {
            return Ok(0);
        }
        Tree::from_ref(self.base.cell, false).size(alloc)
    }

    /// Raw value at `index` (tombstone bit preserved for links).
    pub fn get_raw(&mut self, group: &Group, alloc: &SlabAlloc, index: usize) -> Result<i64> {
        self.base.revalidate(group, alloc)?;
        if self.base.cell == NULL_REF {
            return Err(CoreError::InvalidArgument("list index out of bounds".into()));
        }
        Tree::from_ref(self.base.cell, false).get(alloc, index)
    }

    /// Integer value at `index`.
    pub fn get(&mut self, group: &Group, alloc: &SlabAlloc, index: usize) -> Result<i64> {
        self.get_raw(group, alloc, index)
    }

    /// Appends an integer value.
    pub fn push(&mut self, group: &mut Group, alloc: &mut SlabAlloc, v: i64) -> Result<()> {
        self.insert(group, alloc, usize::MAX, v)
    }

    /// Inserts an integer value before `index` (saturated to the end).
    pub fn insert(
        &mut self,
        group: &mut Group,
        alloc: &mut SlabAlloc,
        index: usize,
        v: i64,
    ) -> Result<()> {
        self.base.revalidate(group, alloc)?;
        if self.base.target(group)?.is_some() {
            return Err(CoreError::IllegalOperation(
                "object list takes keys, not values",
            ));
        }
        let mut tree = if self.base.cell == NULL_REF {
            Tree::create(alloc, false)?
        } else {
            Tree::from_ref(self.base.cell, false)
        };
        let n = tree.size(alloc)?;
        tree.insert(alloc, index.min(n), v)?;
        self.base.store_cell(group, alloc, tree.root_ref())
    }

    /// Appends a link to `target` on an object list.
    pub fn push_object(
        &mut self,
        group: &mut Group,
        alloc: &mut SlabAlloc,
        target: ObjKey,
    ) -> Result<()> {
        self.base.revalidate(group, alloc)?;
        let target_tk = self
            .base
            .target(group)?
            .ok_or(CoreError::IllegalOperation("list does not hold objects"))?;
        if group.state(target_tk)?.row_of(alloc, target)?.is_none() {
            return Err(CoreError::InvalidArgument("link target does not exist".into()));
        }
        let mut tree = if self.base.cell == NULL_REF {
            Tree::create(alloc, false)?
        } else {
            Tree::from_ref(self.base.cell, false)
        };
        tree.push(alloc, link::encode(target.0))?;
        let root = tree.root_ref();
        backlink_add(
            group,
            alloc,
            target_tk,
            self.base.tk,
            self.base.ck.index(),
            target,
            self.base.obj,
        )?;
        // Backlink bookkeeping bumped versions; rebind before storing.
        self.base.seen_version = u64::MAX;
        self.base.revalidate(group, alloc)?;
        self.base.store_cell(group, alloc, root)
    }

    /// Object key at `index`; `None` for tombstoned entries.
    pub fn get_object(
        &mut self,
        group: &Group,
        alloc: &SlabAlloc,
        index: usize,
    ) -> Result<Option<ObjKey>> {
        let raw = self.get_raw(group, alloc, index)?;
        Ok(link::decode(raw).and_then(|(k, ts)| (!ts).then_some(ObjKey(k))))
    }

    /// Removes the entry at `index`, detaching its backlink when it is a
    /// live object link.
    pub fn erase(&mut self, group: &mut Group, alloc: &mut SlabAlloc, index: usize) -> Result<()> {
        self.base.revalidate(group, alloc)?;
        if self.base.cell == NULL_REF {
            return Err(CoreError::InvalidArgument("list index out of bounds".into()));
        }
        let mut tree = Tree::from_ref(self.base.cell, false);
        let raw = tree.get(alloc, index)?;
        tree.erase(alloc, index)?;
        let root = tree.root_ref();
        if let Some(target_tk) = self.base.target(group)? {
            if let Some((k, false)) = link::decode(raw) {
                backlink_remove(
                    group,
                    alloc,
                    target_tk,
                    self.base.tk,
                    self.base.ck.index(),
                    ObjKey(k),
                    self.base.obj,
                )?;
                self.base.seen_version = u64::MAX;
                self.base.revalidate(group, alloc)?;
            }
        }
        self.base.store_cell(group, alloc, root)
    }

    /// Indices of live entries: the condensed view, tombstones hidden.
    pub fn indices_condensed(&mut self, group: &Group, alloc: &SlabAlloc) -> Result<Vec<usize>> {
        let n = self.size(group, alloc)?;
        let mut out = Vec::with_capacity(n);
        if n == 0 {
            return Ok(out);
        }
        let tree = Tree::from_ref(self.base.cell, false);
        let object_list = self.base.target(group)?.is_some();
        for i in 0..n {
            let raw = tree.get(alloc, i)?;
            let hidden = object_list && matches!(link::decode(raw), Some((_, true)));
            if !hidden {
                out.push(i);
            }
        }
        Ok(out)
    }

    /// Indices of all entries including tombstones: the real view, used by
    /// replication.
    pub fn indices_real(&mut self, group: &Group, alloc: &SlabAlloc) -> Result<Vec<usize>> {
        Ok((0..self.size(group, alloc)?).collect())
    }

    /// Condensed indices ordered by value; ties keep insertion order.
    pub fn sorted_indices(
        &mut self,
        group: &Group,
        alloc: &SlabAlloc,
        ascending: bool,
    ) -> Result<Vec<usize>> {
        let mut idx = self.indices_condensed(group, alloc)?;
        let tree = Tree::from_ref(self.base.cell, false);
        let mut keyed: Vec<(i64, usize)> = idx
            .drain(..)
            .map(|i| Ok((tree.get(alloc, i)?, i)))
            .collect::<Result<_>>()?;
        keyed.sort_by(|a, b| {
            let ord = a.0.cmp(&b.0).then(a.1.cmp(&b.1));
            if ascending {
                ord
            } else {
                b.0.cmp(&a.0).then(a.1.cmp(&b.1))
            }
        });
        Ok(keyed.into_iter().map(|(_, i)| i).collect())
    }

    /// Condensed indices of the first occurrence of each distinct value, in
    /// insertion order.
    pub fn distinct_indices(&mut self, group: &Group, alloc: &SlabAlloc) -> Result<Vec<usize>> {
        let idx = self.indices_condensed(group, alloc)?;
        if idx.is_empty() {
            return Ok(idx);
        }
        let tree = Tree::from_ref(self.base.cell, false);
        let mut seen = std::collections::HashSet::new();
        let mut out = Vec::new();
        for i in idx {
            if seen.insert(tree.get(alloc, i)?) {
                out.push(i);
            }
        }
        Ok(out)
    }
}

/// Unordered collection of unique values (or unique links).
pub struct Set {
    base: CollectionBase,
}

impl Set {
    /// Binds a set accessor.
    pub fn attach(
        group: &Group,
        alloc: &SlabAlloc,
        tk: TableKey,
        obj: ObjKey,
        ck: ColKey,
    ) -> Result<Self> {
        Ok(Self {
            base: CollectionBase::attach(group, alloc, tk, obj, ck, ColumnType::Set)?,
        })
    }

    /// Number of entries, tombstones included.
    pub fn size(&mut self, group: &Group, alloc: &SlabAlloc) -> Result<usize> {
        self.base.revalidate(group, alloc)?;
        if self.base.cell == NULL_REF {
            return Ok(0);
        }
        Tree::from_ref(self.base.cell, false).size(alloc)
    }

    /// True when the set holds `v`.
    pub fn contains(&mut self, group: &Group, alloc: &SlabAlloc, v: i64) -> Result<bool> {
        self.base.revalidate(group, alloc)?;
        if self.base.cell == NULL_REF {
            return Ok(false);
        }
        let tree = Tree::from_ref(self.base.cell, false);
        let n = tree.size(alloc)?;
        for i in 0..n {
            if tree.get(alloc, i)? == v {
                return Ok(true);
            }
        }
        Ok(false)
    }

    /// Inserts `v`; returns false when it was already present.
    pub fn insert(&mut self, group: &mut Group, alloc: &mut SlabAlloc, v: i64) -> Result<bool> {
        if self.base.target(group)?.is_some() {
            return Err(CoreError::IllegalOperation(
                "object set takes keys, not values",
            ));
        }
        if self.contains(group, alloc, v)? {
            return Ok(false);
        }
        let mut tree = if self.base.cell == NULL_REF {
            Tree::create(alloc, false)?
        } else {
            Tree::from_ref(self.base.cell, false)
        };
        tree.push(alloc, v)?;
        self.base.store_cell(group, alloc, tree.root_ref())?;
        Ok(true)
    }

    /// Removes `v`; returns false when absent.
    pub fn erase(&mut self, group: &mut Group, alloc: &mut SlabAlloc, v: i64) -> Result<bool> {
        self.base.revalidate(group, alloc)?;
        if self.base.cell == NULL_REF {
            return Ok(false);
        }
        let mut tree = Tree::from_ref(self.base.cell, false);
        let n = tree.size(alloc)?;
        for i in 0..n {
            if tree.get(alloc, i)? == v {
                tree.erase(alloc, i)?;
                self.base.store_cell(group, alloc, tree.root_ref())?;
                return Ok(true);
            }
        }
        Ok(false)
    }
}

const DICT_KEYS: usize = 0;
const DICT_VALUES: usize = 1;

/// String-keyed dictionary of integer values.
pub struct Dictionary {
    base: CollectionBase,
}

impl Dictionary {
    /// Binds a dictionary accessor.
    pub fn attach(
        group: &Group,
        alloc: &SlabAlloc,
        tk: TableKey,
        obj: ObjKey,
        ck: ColKey,
    ) -> Result<Self> {
        Ok(Self {
            base: CollectionBase::attach(group, alloc, tk, obj, ck, ColumnType::Dictionary)?,
        })
    }

    fn trees(&self, alloc: &SlabAlloc) -> Result<Option<(Tree, Tree)>> {
        if self.base.cell == NULL_REF {
            return Ok(None);
        }
        let cell = Array::from_ref(self.base.cell);
        let keys = Tree::from_ref(cell.get(alloc, DICT_KEYS)? as u64, true);
        let values = Tree::from_ref(cell.get(alloc, DICT_VALUES)? as u64, false);
        Ok(Some((keys, values)))
    }

    /// Number of entries.
    pub fn size(&mut self, group: &Group, alloc: &SlabAlloc) -> Result<usize> {
        self.base.revalidate(group, alloc)?;
        match self.trees(alloc)? {
            Some((keys, _)) => keys.size(alloc),
            None => Ok(0),
        }
    }

    fn position_of(&self, alloc: &SlabAlloc, keys: &Tree, key: &str) -> Result<Option<usize>> {
        let n = keys.size(alloc)?;
        for i in 0..n {
            let r = keys.get(alloc, i)? as u64;
            if blob::data(alloc, r)? == key.as_bytes() {
                return Ok(Some(i));
            }
        }
        Ok(None)
    }

    /// Value stored under `key`.
    pub fn get(&mut self, group: &Group, alloc: &SlabAlloc, key: &str) -> Result<Option<i64>> {
        self.base.revalidate(group, alloc)?;
        let Some((keys, values)) = self.trees(alloc)? else {
            return Ok(None);
        };
        match self.position_of(alloc, &keys, key)? {
            Some(i) => Ok(Some(values.get(alloc, i)?)),
            None => Ok(None),
        }
    }

    /// Inserts or overwrites `key`.
    pub fn insert(
        &mut self,
        group: &mut Group,
        alloc: &mut SlabAlloc,
        key: &str,
        value: i64,
    ) -> Result<()> {
        self.base.revalidate(group, alloc)?;
        let (mut keys, mut values, had_cell) = match self.trees(alloc)? {
            Some((k, v)) => (k, v, true),
            None => (Tree::create(alloc, true)?, Tree::create(alloc, false)?, false),
        };
        match self.position_of(alloc, &keys, key)? {
            Some(i) => values.set(alloc, i, value)?,
            None => {
                let kref = blob::create(alloc, key.as_bytes())?;
                keys.push(alloc, kref as i64)?;
                values.push(alloc, value)?;
            }
        }
        let cell = if had_cell {
            let mut cell = Array::from_ref(self.base.cell);
            cell.copy_on_write(alloc)?;
            cell.set(alloc, DICT_KEYS, keys.root_ref() as i64)?;
            cell.set(alloc, DICT_VALUES, values.root_ref() as i64)?;
            cell.ref_()
        } else {
            let mut cell = Array::create(alloc, flags::HAS_REFS, 64, 2)?;
            cell.push(alloc, keys.root_ref() as i64)?;
            cell.push(alloc, values.root_ref() as i64)?;
            cell.ref_()
        };
        self.base.store_cell(group, alloc, cell)
    }

    /// Removes `key`; returns false when absent.
    pub fn erase(&mut self, group: &mut Group, alloc: &mut SlabAlloc, key: &str) -> Result<bool> {
        self.base.revalidate(group, alloc)?;
        let Some((mut keys, mut values)) = self.trees(alloc)? else {
            return Ok(false);
        };
        let Some(i) = self.position_of(alloc, &keys, key)? else {
            return Ok(false);
        };
        let kref = keys.get(alloc, i)? as u64;
        blob::destroy(alloc, kref)?;
        keys.erase(alloc, i)?;
        values.erase(alloc, i)?;
        let mut cell = Array::from_ref(self.base.cell);
        cell.copy_on_write(alloc)?;
        cell.set(alloc, DICT_KEYS, keys.root_ref() as i64)?;
        cell.set(alloc, DICT_VALUES, values.root_ref() as i64)?;
        let cell_ref = cell.ref_();
        self.base.store_cell(group, alloc, cell_ref)?;
        Ok(true)
    }

    /// All keys, in insertion order.
    pub fn keys(&mut self, group: &Group, alloc: &SlabAlloc) -> Result<Vec<String>> {
        self.base.revalidate(group, alloc)?;
        let Some((keys, _)) = self.trees(alloc)? else {
            return Ok(Vec::new());
        };
        let n = keys.size(alloc)?;
        let mut out = Vec::with_capacity(n);
        for i in 0..n {
            let r = keys.get(alloc, i)? as u64;
            out.push(
                String::from_utf8(blob::data(alloc, r)?.to_vec())
                    .map_err(|_| CoreError::Corruption("dictionary key is not UTF-8".into()))?,
            );
        }
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::alloc::Backing;
    use crate::table::{add_object_collection_column, invalidate_object, remove_object, ColumnTarget};

    fn test_env() -> (tempfile::TempDir, SlabAlloc, Group) {
        let dir = tempfile::tempdir().unwrap();
        let mut backing = Backing::attach(dir.path().join("coll.tsra"), None).unwrap();
        backing.grow(crate::alloc::HEADER_SIZE as u64).unwrap();
        let mut alloc = SlabAlloc::new(backing);
        alloc.bind(crate::alloc::HEADER_SIZE as u64).unwrap();
        (dir, alloc, Group::new_empty())
    }

    #[test]
    fn int_list_basics() {
        let (_dir, mut alloc, mut group) = test_env();
        let tk = group.add_table(&mut alloc, "t").unwrap();
        let ck = group
            .state_mut(tk)
            .unwrap()
            .add_column(&mut alloc, "xs", ColumnType::List, 0, ColumnTarget::None)
            .unwrap();
        let obj = group.state_mut(tk).unwrap().create_object(&mut alloc).unwrap();

        let mut list = List::attach(&group, &alloc, tk, obj, ck).unwrap();
        for v in [5, 3, 5, 1] {
            list.push(&mut group, &mut alloc, v).unwrap();
        }
        assert_eq!(list.size(&group, &alloc).unwrap(), 4);
        assert_eq!(list.get(&group, &alloc, 1).unwrap(), 3);
        assert_eq!(
            list.sorted_indices(&group, &alloc, true).unwrap(),
            vec![3, 1, 0, 2]
        );
        assert_eq!(list.distinct_indices(&group, &alloc).unwrap(), vec![0, 1, 3]);
        list.erase(&mut group, &mut alloc, 0).unwrap();
        assert_eq!(list.get(&group, &alloc, 0).unwrap(), 3);
    }

    #[test]
    fn accessor_revalidates_and_goes_stale() {
        let (_dir, mut alloc, mut group) = test_env();
        let tk = group.add_table(&mut alloc, "t").unwrap();
        let ck = group
            .state_mut(tk)
            .unwrap()
            .add_column(&mut alloc, "xs", ColumnType::List, 0, ColumnTarget::None)
            .unwrap();
        let obj = group.state_mut(tk).unwrap().create_object(&mut alloc).unwrap();
        let mut list = List::attach(&group, &alloc, tk, obj, ck).unwrap();
        list.push(&mut group, &mut alloc, 1).unwrap();

        // Out-of-band mutation through a second accessor.
        let mut other = List::attach(&group, &alloc, tk, obj, ck).unwrap();
        other.push(&mut group, &mut alloc, 2).unwrap();
        assert_eq!(list.size(&group, &alloc).unwrap(), 2);

        remove_object(&mut group, &mut alloc, tk, obj).unwrap();
        assert!(matches!(
            list.size(&group, &alloc),
            Err(CoreError::StaleAccessor(_))
        ));
    }

    #[test]
    fn set_deduplicates() {
        let (_dir, mut alloc, mut group) = test_env();
        let tk = group.add_table(&mut alloc, "t").unwrap();
        let ck = group
            .state_mut(tk)
            .unwrap()
            .add_column(&mut alloc, "tags", ColumnType::Set, 0, ColumnTarget::None)
            .unwrap();
        let obj = group.state_mut(tk).unwrap().create_object(&mut alloc).unwrap();
        let mut set = Set::attach(&group, &alloc, tk, obj, ck).unwrap();
        assert!(set.insert(&mut group, &mut alloc, 9).unwrap());
        assert!(!set.insert(&mut group, &mut alloc, 9).unwrap());
        assert!(set.contains(&group, &alloc, 9).unwrap());
        assert!(set.erase(&mut group, &mut alloc, 9).unwrap());
        assert_eq!(set.size(&group, &alloc).unwrap(), 0);
    }

    #[test]
    fn dictionary_insert_get_erase() {
        let (_dir, mut alloc, mut group) = test_env();
        let tk = group.add_table(&mut alloc, "t").unwrap();
        let ck = group
            .state_mut(tk)
            .unwrap()
            .add_column(
                &mut alloc,
                "attrs",
                ColumnType::Dictionary,
                0,
                ColumnTarget::None,
            )
            .unwrap();
        let obj = group.state_mut(tk).unwrap().create_object(&mut alloc).unwrap();
        let mut dict = Dictionary::attach(&group, &alloc, tk, obj, ck).unwrap();
        dict.insert(&mut group, &mut alloc, "height", 180).unwrap();
        dict.insert(&mut group, &mut alloc, "width", 90).unwrap();
        dict.insert(&mut group, &mut alloc, "height", 181).unwrap();
        assert_eq!(dict.get(&group, &alloc, "height").unwrap(), Some(181));
        assert_eq!(dict.size(&group, &alloc).unwrap(), 2);
        assert_eq!(dict.keys(&group, &alloc).unwrap(), vec!["height", "width"]);
        assert!(dict.erase(&mut group, &mut alloc, "width").unwrap());
        assert_eq!(dict.get(&group, &alloc, "width").unwrap(), None);
    }

    #[test]
    fn object_list_tombstones_hidden_by_condensed_view() {
        let (_dir, mut alloc, mut group) = test_env();
        let people = group.add_table(&mut alloc, "people").unwrap();
        let teams = group.add_table(&mut alloc, "teams").unwrap();
        let members = add_object_collection_column(
            &mut group,
            &mut alloc,
            teams,
            "members",
            ColumnType::List,
            people,
        )
        .unwrap();

        let alice = group.state_mut(people).unwrap().create_object(&mut alloc).unwrap();
        let bob = group.state_mut(people).unwrap().create_object(&mut alloc).unwrap();
        let team = group.state_mut(teams).unwrap().create_object(&mut alloc).unwrap();

        let mut list = List::attach(&group, &alloc, teams, team, members).unwrap();
        list.push_object(&mut group, &mut alloc, alice).unwrap();
        list.push_object(&mut group, &mut alloc, bob).unwrap();

        invalidate_object(&mut group, &mut alloc, people, alice).unwrap();

        assert_eq!(list.size(&group, &alloc).unwrap(), 2);
        assert_eq!(list.indices_condensed(&group, &alloc).unwrap(), vec![1]);
        assert_eq!(list.indices_real(&group, &alloc).unwrap(), vec![0, 1]);
        assert_eq!(list.get_object(&group, &alloc, 0).unwrap(), None);
        assert_eq!(list.get_object(&group, &alloc, 1).unwrap(), Some(bob));
    }

    #[test]
    fn structural_op_on_wrong_type_is_illegal() {
        let (_dir, mut alloc, mut group) = test_env();
        let tk = group.add_table(&mut alloc, "t").unwrap();
        let ck = group
            .state_mut(tk)
            .unwrap()
            .add_column(&mut alloc, "xs", ColumnType::List, 0, ColumnTarget::None)
            .unwrap();
        let obj = group.state_mut(tk).unwrap().create_object(&mut alloc).unwrap();
        assert!(matches!(
            Set::attach(&group, &alloc, tk, obj, ck),
            Err(CoreError::IllegalOperation(_))
        ));
    }
}
