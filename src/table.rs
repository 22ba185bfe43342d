//! Tables: ordered mappings from `ObjKey` to rows of typed column values.
//!
//! Object keys are allocated monotonically and never reused, so the key
//! tree is sorted by construction and key lookup is a binary search. All
//! column trees are parallel to the key tree by row index.
//!
//! Link columns keep a hidden backlink column on the target table in
//! lockstep: every link mutation updates both sides within the write
//! transaction. Object removal walks the backlink cells and applies the
//! originating column's policy: strong links cascade the delete, weak
//! links null the source cell, and `invalidate_object` leaves tombstoned
//! values that retain the key for replication.

use tracing::debug;

use crate::alloc::{Ref, SlabAlloc, NULL_REF};
use crate::array::{blob, flags, tag_int, untag_int, Array};
use crate::column::{link, ColumnTop, ColumnType, StringDict};
use crate::error::{CoreError, Result};
use crate::group::Group;
use crate::keys::{attrs, ColKey, ObjKey, TableKey};
use crate::tree::Tree;

const TAB_COL_NAMES: usize = 0;
const TAB_COL_KEYS: usize = 1;
const TAB_COL_TARGETS: usize = 2;
const TAB_COL_TOPS: usize = 3;
const TAB_OBJ_KEYS: usize = 4;
const TAB_NEXT_OBJ: usize = 5;
const TAB_PK_COL: usize = 6;
const TAB_SLOTS: usize = 7;

/// Sentinel string id for a null string cell.
pub const NULL_STRING_ID: i64 = -1;

/// What a column points at, when anything.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ColumnTarget {
    /// Plain value column.
    None,
    /// Link or object-collection column targeting a table.
    Table(TableKey),
    /// Backlink column recording its originating (table, column index).
    Origin {
        /// Table holding the originating link column.
        table: TableKey,
        /// Schema position of the originating column there.
        col_index: u32,
    },
}

impl ColumnTarget {
    fn encode(self) -> i64 {
        match self {
            ColumnTarget::None => 0,
            ColumnTarget::Table(tk) => tk.0 as i64 + 1,
            ColumnTarget::Origin { table, col_index } => {
                -(((table.0 as i64) << 20 | col_index as i64) + 1)
            }
        }
    }

    fn decode(v: i64) -> Self {
        if v == 0 {
            ColumnTarget::None
        } else if v > 0 {
            ColumnTarget::Table(TableKey(v as u32 - 1))
        } else {
            let packed = -v - 1;
            ColumnTarget::Origin {
                table: TableKey((packed >> 20) as u32),
                col_index: (packed & 0xfffff) as u32,
            }
        }
    }
}

/// One schema entry.
#[derive(Debug, Clone)]
pub struct ColumnSpec {
    /// The stable column key.
    pub ck: ColKey,
    /// Column name; backlink columns use a reserved `!backlink:` prefix.
    pub name: String,
    /// Link/backlink wiring.
    pub target: ColumnTarget,
}

/// In-memory state of one table, mirroring the persisted table top.
pub struct TableState {
    pub(crate) key: TableKey,
    pub(crate) name: String,
    pub(crate) top: Ref,
    pub(crate) spec: Vec<ColumnSpec>,
    pub(crate) next_obj: u64,
    pub(crate) pk_col: Option<ColKey>,
    /// Bumped on every mutation of this table's data.
    pub(crate) content_version: u64,
}

impl TableState {
    /// Creates the persisted structure for an empty table.
    pub fn create(alloc: &mut SlabAlloc, key: TableKey, name: String) -> Result<Self> {
        let names = Tree::create(alloc, true)?;
        let colkeys = Tree::create(alloc, false)?;
        let targets = Tree::create(alloc, false)?;
        let coltops = Tree::create(alloc, true)?;
        let objkeys = Tree::create(alloc, false)?;
        let mut top = Array::create(alloc, flags::HAS_REFS, 64, TAB_SLOTS)?;
        top.push(alloc, names.root_ref() as i64)?;
        top.push(alloc, colkeys.root_ref() as i64)?;
        top.push(alloc, targets.root_ref() as i64)?;
        top.push(alloc, coltops.root_ref() as i64)?;
        top.push(alloc, objkeys.root_ref() as i64)?;
        top.push(alloc, tag_int(1))?; // next object key
        top.push(alloc, tag_int(0))?; // no primary key
        Ok(Self {
            key,
            name,
            top: top.ref_(),
            spec: Vec::new(),
            next_obj: 1,
            pk_col: None,
            content_version: 0,
        })
    }

    /// Rebuilds table state from its persisted top.
    pub fn load(alloc: &SlabAlloc, key: TableKey, name: String, top_ref: Ref) -> Result<Self> {
        let top = Array::from_ref(top_ref);
        if top.size(alloc)? < TAB_SLOTS {
            return Err(CoreError::Corruption("table top has too few slots".into()));
        }
        let names = Tree::from_ref(top.get(alloc, TAB_COL_NAMES)? as u64, true);
        let colkeys = Tree::from_ref(top.get(alloc, TAB_COL_KEYS)? as u64, false);
        let targets = Tree::from_ref(top.get(alloc, TAB_COL_TARGETS)? as u64, false);
        let n = colkeys.size(alloc)?;
        let mut spec = Vec::with_capacity(n);
        for i in 0..n {
            let ck = ColKey(colkeys.get(alloc, i)? as u64);
            let name_ref = names.get(alloc, i)? as u64;
            let col_name = String::from_utf8(blob::data(alloc, name_ref)?.to_vec())
                .map_err(|_| CoreError::Corruption("column name is not UTF-8".into()))?;
            let target = ColumnTarget::decode(targets.get(alloc, i)?);
            spec.push(ColumnSpec {
                ck,
                name: col_name,
                target,
            });
        }
        let pk_raw = untag_int(top.get(alloc, TAB_PK_COL)?);
        Ok(Self {
            key,
            name,
            top: top_ref,
            spec,
            next_obj: untag_int(top.get(alloc, TAB_NEXT_OBJ)?),
            pk_col: if pk_raw == 0 {
                None
            } else {
                Some(ColKey(pk_raw - 1))
            },
            content_version: 0,
        })
    }

    /// Destroys the table's entire storage.
    pub fn destroy(self, alloc: &mut SlabAlloc) -> Result<()> {
        Array::from_ref(self.top).destroy_deep(alloc)
    }

    fn set_top_slot(&mut self, alloc: &mut SlabAlloc, slot: usize, value: i64) -> Result<()> {
        let mut top = Array::from_ref(self.top);
        top.copy_on_write(alloc)?;
        top.set(alloc, slot, value)?;
        self.top = top.ref_();
        Ok(())
    }

    /// Schema position of `ck`.
    pub fn col_pos(&self, ck: ColKey) -> Result<usize> {
        let pos = ck.index() as usize;
        match self.spec.get(pos) {
            Some(s) if s.ck == ck => Ok(pos),
            _ => Err(CoreError::InvalidColumnKey),
        }
    }

    /// Looks a column up by name.
    pub fn col_by_name(&self, name: &str) -> Option<ColKey> {
        self.spec.iter().find(|s| s.name == name).map(|s| s.ck)
    }

    /// The schema, in column order.
    pub fn columns(&self) -> &[ColumnSpec] {
        &self.spec
    }

    fn key_tree(&self, alloc: &SlabAlloc) -> Result<Tree> {
        let top = Array::from_ref(self.top);
        Ok(Tree::from_ref(top.get(alloc, TAB_OBJ_KEYS)? as u64, false))
    }

    fn save_key_tree(&mut self, alloc: &mut SlabAlloc, tree: Tree) -> Result<()> {
        self.set_top_slot(alloc, TAB_OBJ_KEYS, tree.root_ref() as i64)
    }

    fn coltops_tree(&self, alloc: &SlabAlloc) -> Result<Tree> {
        let top = Array::from_ref(self.top);
        Ok(Tree::from_ref(top.get(alloc, TAB_COL_TOPS)? as u64, true))
    }

    /// The column top at schema position `pos`.
    pub fn column_top(&self, alloc: &SlabAlloc, pos: usize) -> Result<ColumnTop> {
        let coltops = self.coltops_tree(alloc)?;
        Ok(ColumnTop::from_ref(coltops.get(alloc, pos)? as u64))
    }

    fn save_column_top(&mut self, alloc: &mut SlabAlloc, pos: usize, ct: ColumnTop) -> Result<()> {
        let mut coltops = self.coltops_tree(alloc)?;
        if coltops.get(alloc, pos)? as u64 != ct.ref_() {
            coltops.set(alloc, pos, ct.ref_() as i64)?;
            self.set_top_slot(alloc, TAB_COL_TOPS, coltops.root_ref() as i64)?;
        }
        Ok(())
    }

    /// The value tree of the column at `pos`.
    pub fn value_tree(&self, alloc: &SlabAlloc, pos: usize) -> Result<Tree> {
        let ty = self.spec[pos].ck.column_type();
        self.column_top(alloc, pos)?.main_tree(alloc, ty)
    }

    /// The auxiliary tree of the column at `pos` (null bits / dictionary).
    pub fn aux_tree(&self, alloc: &SlabAlloc, pos: usize) -> Result<Option<Tree>> {
        let ty = self.spec[pos].ck.column_type();
        self.column_top(alloc, pos)?
            .aux_tree(alloc, ty == ColumnType::String)
    }

    /// Runs `f` over the column's value tree and persists the new root.
    pub(crate) fn with_value_tree<R>(
        &mut self,
        alloc: &mut SlabAlloc,
        pos: usize,
        f: impl FnOnce(&mut SlabAlloc, &mut Tree) -> Result<R>,
    ) -> Result<R> {
        let mut ct = self.column_top(alloc, pos)?;
        let ty = self.spec[pos].ck.column_type();
        let mut tree = ct.main_tree(alloc, ty)?;
        let old_root = tree.root_ref();
        let out = f(alloc, &mut tree)?;
        if tree.root_ref() != old_root {
            ct.set_main_root(alloc, tree.root_ref())?;
            self.save_column_top(alloc, pos, ct)?;
        }
        self.content_version += 1;
        Ok(out)
    }

    /// Runs `f` over the column's auxiliary tree and persists the new root.
    pub(crate) fn with_aux_tree<R>(
        &mut self,
        alloc: &mut SlabAlloc,
        pos: usize,
        f: impl FnOnce(&mut SlabAlloc, &mut Tree) -> Result<R>,
    ) -> Result<R> {
        let mut ct = self.column_top(alloc, pos)?;
        let ty = self.spec[pos].ck.column_type();
        let mut tree = ct
            .aux_tree(alloc, ty == ColumnType::String)?
            .ok_or(CoreError::IllegalOperation("column has no auxiliary tree"))?;
        let old_root = tree.root_ref();
        let out = f(alloc, &mut tree)?;
        if tree.root_ref() != old_root {
            ct.set_aux_root(alloc, tree.root_ref())?;
            self.save_column_top(alloc, pos, ct)?;
        }
        self.content_version += 1;
        Ok(out)
    }

    /// Number of rows.
    pub fn row_count(&self, alloc: &SlabAlloc) -> Result<usize> {
        self.key_tree(alloc)?.size(alloc)
    }

    /// Row index of `key`, by binary search of the sorted key tree.
    pub fn row_of(&self, alloc: &SlabAlloc, key: ObjKey) -> Result<Option<usize>> {
        let keys = self.key_tree(alloc)?;
        let n = keys.size(alloc)?;
        let mut lo = 0usize;
        let mut hi = n;
        while lo < hi {
            let mid = (lo + hi) / 2;
            let k = keys.get(alloc, mid)? as u64;
            if k < key.0 {
                lo = mid + 1;
            } else {
                hi = mid;
            }
        }
        if lo < n && keys.get(alloc, lo)? as u64 == key.0 {
            Ok(Some(lo))
        } else {
            Ok(None)
        }
    }

    /// Object key stored at `row`.
    pub fn objkey_at(&self, alloc: &SlabAlloc, row: usize) -> Result<ObjKey> {
        Ok(ObjKey(self.key_tree(alloc)?.get(alloc, row)? as u64))
    }

    /// All live object keys, in row order.
    pub fn object_keys(&self, alloc: &SlabAlloc) -> Result<Vec<ObjKey>> {
        Ok(self
            .key_tree(alloc)?
            .to_vec(alloc)?
            .into_iter()
            .map(|v| ObjKey(v as u64))
            .collect())
    }

    /// Adds a column; rows already present get default cells.
    pub fn add_column(
        &mut self,
        alloc: &mut SlabAlloc,
        name: &str,
        ty: ColumnType,
        attr_bits: u8,
        target: ColumnTarget,
    ) -> Result<ColKey> {
        if self.col_by_name(name).is_some() {
            return Err(CoreError::InvalidArgument(format!(
                "column '{name}' already exists"
            )));
        }
        let index = self.spec.len() as u32;
        let ck = ColKey::new(index, ty, attr_bits);

        let top = Array::from_ref(self.top);
        let mut names = Tree::from_ref(top.get(alloc, TAB_COL_NAMES)? as u64, true);
        let name_ref = blob::create(alloc, name.as_bytes())?;
        names.push(alloc, name_ref as i64)?;
        self.set_top_slot(alloc, TAB_COL_NAMES, names.root_ref() as i64)?;

        let top = Array::from_ref(self.top);
        let mut colkeys = Tree::from_ref(top.get(alloc, TAB_COL_KEYS)? as u64, false);
        colkeys.push(alloc, ck.0 as i64)?;
        self.set_top_slot(alloc, TAB_COL_KEYS, colkeys.root_ref() as i64)?;

        let top = Array::from_ref(self.top);
        let mut targets = Tree::from_ref(top.get(alloc, TAB_COL_TARGETS)? as u64, false);
        targets.push(alloc, target.encode())?;
        self.set_top_slot(alloc, TAB_COL_TARGETS, targets.root_ref() as i64)?;

        let ct = ColumnTop::create(alloc, ty, ck.is_nullable())?;
        let mut coltops = self.coltops_tree(alloc)?;
        coltops.push(alloc, ct.ref_() as i64)?;
        self.set_top_slot(alloc, TAB_COL_TOPS, coltops.root_ref() as i64)?;

        self.spec.push(ColumnSpec {
            ck,
            name: name.to_string(),
            target,
        });

        // Existing rows get defaults.
        let rows = self.row_count(alloc)?;
        let pos = index as usize;
        if rows > 0 {
            let default = default_cell(ck);
            self.with_value_tree(alloc, pos, |alloc, tree| {
                for _ in 0..rows {
                    tree.push(alloc, default)?;
                }
                Ok(())
            })?;
            if ck.column_type() == ColumnType::Int && ck.is_nullable() {
                self.with_aux_tree(alloc, pos, |alloc, tree| {
                    for _ in 0..rows {
                        tree.push(alloc, 1)?;
                    }
                    Ok(())
                })?;
            }
        }

        if attr_bits & attrs::PRIMARY != 0 {
            self.pk_col = Some(ck);
            self.set_top_slot(alloc, TAB_PK_COL, tag_int(ck.0 + 1))?;
        }
        self.content_version += 1;
        debug!(table = %self.name, column = name, "added column");
        Ok(ck)
    }

    /// Creates an object with the next key; appends default cells to every
    /// column.
    pub fn create_object(&mut self, alloc: &mut SlabAlloc) -> Result<ObjKey> {
        let key = ObjKey(self.next_obj);
        if key.0 > ObjKey::MAX {
            return Err(CoreError::OutOfMemory("object key space exhausted"));
        }
        self.next_obj += 1;
        self.set_top_slot(alloc, TAB_NEXT_OBJ, tag_int(self.next_obj))?;

        let mut keys = self.key_tree(alloc)?;
        keys.push(alloc, key.0 as i64)?;
        self.save_key_tree(alloc, keys)?;

        for pos in 0..self.spec.len() {
            let ck = self.spec[pos].ck;
            let default = default_cell(ck);
            self.with_value_tree(alloc, pos, |alloc, tree| tree.push(alloc, default))?;
            if ck.column_type() == ColumnType::Int && ck.is_nullable() {
                self.with_aux_tree(alloc, pos, |alloc, tree| tree.push(alloc, 1))?;
            }
        }
        self.content_version += 1;
        Ok(key)
    }

    /// Reads an int cell; `None` when null.
    pub fn get_int(&self, alloc: &SlabAlloc, key: ObjKey, ck: ColKey) -> Result<Option<i64>> {
        let pos = self.col_pos(ck)?;
        expect_type(ck, ColumnType::Int)?;
        let row = self.require_row(alloc, key)?;
        if ck.is_nullable() {
            let nulls = self
                .aux_tree(alloc, pos)?
                .ok_or(CoreError::Corruption("nullable column lost null tree".into()))?;
            if nulls.get(alloc, row)? != 0 {
                return Ok(None);
            }
        }
        Ok(Some(self.value_tree(alloc, pos)?.get(alloc, row)?))
    }

    /// Writes an int cell.
    pub fn set_int(&mut self, alloc: &mut SlabAlloc, key: ObjKey, ck: ColKey, v: i64) -> Result<()> {
        let pos = self.col_pos(ck)?;
        expect_type(ck, ColumnType::Int)?;
        let row = self.require_row(alloc, key)?;
        self.with_value_tree(alloc, pos, |alloc, tree| tree.set(alloc, row, v))?;
        if ck.is_nullable() {
            self.with_aux_tree(alloc, pos, |alloc, tree| tree.set(alloc, row, 0))?;
        }
        Ok(())
    }

    /// Nulls a nullable int or string cell.
    pub fn set_null(&mut self, alloc: &mut SlabAlloc, key: ObjKey, ck: ColKey) -> Result<()> {
        let pos = self.col_pos(ck)?;
        let row = self.require_row(alloc, key)?;
        match ck.column_type() {
            ColumnType::Int => {
                if !ck.is_nullable() {
                    return Err(CoreError::IllegalOperation("column is not nullable"));
                }
                self.with_value_tree(alloc, pos, |alloc, tree| tree.set(alloc, row, 0))?;
                self.with_aux_tree(alloc, pos, |alloc, tree| tree.set(alloc, row, 1))
            }
            ColumnType::String => {
                self.with_value_tree(alloc, pos, |alloc, tree| tree.set(alloc, row, NULL_STRING_ID))
            }
            _ => Err(CoreError::IllegalOperation("cannot null this column type")),
        }
    }

    /// True when the cell is null.
    pub fn is_null(&self, alloc: &SlabAlloc, key: ObjKey, ck: ColKey) -> Result<bool> {
        let pos = self.col_pos(ck)?;
        let row = self.require_row(alloc, key)?;
        match ck.column_type() {
            ColumnType::Int if ck.is_nullable() => {
                let nulls = self
                    .aux_tree(alloc, pos)?
                    .ok_or(CoreError::Corruption("nullable column lost null tree".into()))?;
                Ok(nulls.get(alloc, row)? != 0)
            }
            ColumnType::String => Ok(self.value_tree(alloc, pos)?.get(alloc, row)? == NULL_STRING_ID),
            ColumnType::Link => Ok(self.value_tree(alloc, pos)?.get(alloc, row)? == link::NULL),
            _ => Ok(false),
        }
    }

    /// Reads a bool cell.
    pub fn get_bool(&self, alloc: &SlabAlloc, key: ObjKey, ck: ColKey) -> Result<bool> {
        let pos = self.col_pos(ck)?;
        expect_type(ck, ColumnType::Bool)?;
        let row = self.require_row(alloc, key)?;
        Ok(self.value_tree(alloc, pos)?.get(alloc, row)? != 0)
    }

    /// Writes a bool cell.
    pub fn set_bool(&mut self, alloc: &mut SlabAlloc, key: ObjKey, ck: ColKey, v: bool) -> Result<()> {
        let pos = self.col_pos(ck)?;
        expect_type(ck, ColumnType::Bool)?;
        let row = self.require_row(alloc, key)?;
        self.with_value_tree(alloc, pos, |alloc, tree| tree.set(alloc, row, i64::from(v)))
    }

    /// Reads a string cell; `None` when null.
    pub fn get_string(&self, alloc: &SlabAlloc, key: ObjKey, ck: ColKey) -> Result<Option<String>> {
        let pos = self.col_pos(ck)?;
        expect_type(ck, ColumnType::String)?;
        let row = self.require_row(alloc, key)?;
        let id = self.value_tree(alloc, pos)?.get(alloc, row)?;
        if id == NULL_STRING_ID {
            return Ok(None);
        }
        let dict = self
            .aux_tree(alloc, pos)?
            .ok_or(CoreError::Corruption("string column lost dictionary".into()))?;
        Ok(Some(StringDict::get(alloc, &dict, id)?))
    }

    /// Writes a string cell, interning the value in the enumeration
    /// dictionary.
    pub fn set_string(
        &mut self,
        alloc: &mut SlabAlloc,
        key: ObjKey,
        ck: ColKey,
        v: &str,
    ) -> Result<()> {
        let pos = self.col_pos(ck)?;
        expect_type(ck, ColumnType::String)?;
        let row = self.require_row(alloc, key)?;
        let id = self.with_aux_tree(alloc, pos, |alloc, dict| {
            StringDict::intern(alloc, dict, v)
        })?;
        self.with_value_tree(alloc, pos, |alloc, tree| tree.set(alloc, row, id))
    }

    /// Id of `v` in the column's enumeration dictionary, when interned.
    pub fn string_id(&self, alloc: &SlabAlloc, ck: ColKey, v: &str) -> Result<Option<i64>> {
        let pos = self.col_pos(ck)?;
        expect_type(ck, ColumnType::String)?;
        let dict = self
            .aux_tree(alloc, pos)?
            .ok_or(CoreError::Corruption("string column lost dictionary".into()))?;
        StringDict::find(alloc, &dict, v)
    }

    /// Reads a link cell: the target key and whether it is a tombstone.
    pub fn get_link(
        &self,
        alloc: &SlabAlloc,
        key: ObjKey,
        ck: ColKey,
    ) -> Result<Option<(ObjKey, bool)>> {
        let pos = self.col_pos(ck)?;
        expect_type(ck, ColumnType::Link)?;
        let row = self.require_row(alloc, key)?;
        let raw = self.value_tree(alloc, pos)?.get(alloc, row)?;
        Ok(link::decode(raw).map(|(k, ts)| (ObjKey(k), ts)))
    }

    fn require_row(&self, alloc: &SlabAlloc, key: ObjKey) -> Result<usize> {
        self.row_of(alloc, key)?
            .ok_or(CoreError::StaleAccessor("object no longer exists"))
    }

    /// First row whose int cell equals `value`, scanning with the packed
    /// kernels.
    pub fn find_first_int(
        &self,
        alloc: &SlabAlloc,
        ck: ColKey,
        value: i64,
    ) -> Result<Option<ObjKey>> {
        let pos = self.col_pos(ck)?;
        expect_type(ck, ColumnType::Int)?;
        let tree = self.value_tree(alloc, pos)?;
        let n = tree.size(alloc)?;
        let mut state = crate::array::find::FindFirst::default();
        tree.for_each_leaf(alloc, 0, n, &mut |chunk| {
            Ok(crate::array::find::find_leaf::<crate::array::find::Equal, _>(
                chunk.payload,
                chunk.width,
                chunk.size,
                value,
                0,
                chunk.size,
                chunk.base,
                &mut state,
            ))
        })?;
        match state.result {
            Some(row) => {
                if ck.is_nullable() {
                    let nulls = self.aux_tree(alloc, pos)?.ok_or(CoreError::Corruption(
                        "nullable column lost null tree".into(),
                    ))?;
                    if nulls.get(alloc, row)? != 0 {
                        // The packed value under a null cell is zero; rescan
                        // rows one by one past it. Nulls are rare enough that
                        // the slow path does not matter here.
                        let total = self.row_count(alloc)?;
                        for r in row..total {
                            if nulls.get(alloc, r)? == 0 && tree.get(alloc, r)? == value {
                                return Ok(Some(self.objkey_at(alloc, r)?));
                            }
                        }
                        return Ok(None);
                    }
                }
                Ok(Some(self.objkey_at(alloc, row)?))
            }
            None => Ok(None),
        }
    }

    /// Creates an object with a unique integer primary key.
    pub fn create_object_with_pk(&mut self, alloc: &mut SlabAlloc, pk: i64) -> Result<ObjKey> {
        let pk_col = self
            .pk_col
            .ok_or(CoreError::IllegalOperation("table has no primary key"))?;
        if self.find_first_int(alloc, pk_col, pk)?.is_some() {
            return Err(CoreError::InvalidArgument(format!(
                "duplicate primary key {pk}"
            )));
        }
        let key = self.create_object(alloc)?;
        self.set_int(alloc, key, pk_col, pk)?;
        Ok(key)
    }

    /// Positions of backlink columns originating from (`table`, `col_index`).
    fn backlink_pos_for(&self, table: TableKey, col_index: u32) -> Option<usize> {
        self.spec.iter().position(|s| {
            matches!(s.target, ColumnTarget::Origin { table: t, col_index: c }
                if t == table && c == col_index)
        })
    }
}

fn expect_type(ck: ColKey, ty: ColumnType) -> Result<()> {
    if ck.column_type() != ty {
        return Err(CoreError::IllegalOperation("column type mismatch"));
    }
    Ok(())
}

fn default_cell(ck: ColKey) -> i64 {
    match ck.column_type() {
        ColumnType::String => NULL_STRING_ID,
        _ => 0,
    }
}

/// Hidden name for the backlink column of (`table`, `column`).
pub fn backlink_name(table: &str, column: &str) -> String {
    format!("!backlink:{table}:{column}")
}

// ---------------------------------------------------------------------------
// Cross-table operations. These need two tables at once, so they live on the
// group rather than on a single table's state.
// ---------------------------------------------------------------------------

/// Adds a link column to `tk` targeting `target_tk`, wiring the hidden
/// backlink column on the target table.
pub fn add_link_column(
    group: &mut Group,
    alloc: &mut SlabAlloc,
    tk: TableKey,
    name: &str,
    target_tk: TableKey,
    strong: bool,
) -> Result<ColKey> {
    if !group.has_table(target_tk) {
        return Err(CoreError::InvalidArgument("link target table missing".into()));
    }
    let attr_bits = if strong { attrs::STRONG } else { 0 };
    let src_name = group.state(tk)?.name.clone();
    let ck = group.state_mut(tk)?.add_column(
        alloc,
        name,
        ColumnType::Link,
        attr_bits,
        ColumnTarget::Table(target_tk),
    )?;
    let bl_name = backlink_name(&src_name, name);
    group.state_mut(target_tk)?.add_column(
        alloc,
        &bl_name,
        ColumnType::Backlink,
        attrs::BACKLINK,
        ColumnTarget::Origin {
            table: tk,
            col_index: ck.index(),
        },
    )?;
    group.bump_content_version();
    Ok(ck)
}

/// Adds an object-collection column (List or Set of links), with its hidden
/// backlink column on the target table.
pub fn add_object_collection_column(
    group: &mut Group,
    alloc: &mut SlabAlloc,
    tk: TableKey,
    name: &str,
    ty: ColumnType,
    target_tk: TableKey,
) -> Result<ColKey> {
    if !matches!(ty, ColumnType::List | ColumnType::Set) {
        return Err(CoreError::IllegalOperation(
            "object collections are lists or sets",
        ));
    }
    if !group.has_table(target_tk) {
        return Err(CoreError::InvalidArgument("link target table missing".into()));
    }
    let src_name = group.state(tk)?.name.clone();
    let ck = group
        .state_mut(tk)?
        .add_column(alloc, name, ty, 0, ColumnTarget::Table(target_tk))?;
    let bl_name = backlink_name(&src_name, name);
    group.state_mut(target_tk)?.add_column(
        alloc,
        &bl_name,
        ColumnType::Backlink,
        attrs::BACKLINK,
        ColumnTarget::Origin {
            table: tk,
            col_index: ck.index(),
        },
    )?;
    group.bump_content_version();
    Ok(ck)
}

/// Writes a link cell and keeps the target backlink cell in lockstep.
pub fn set_link(
    group: &mut Group,
    alloc: &mut SlabAlloc,
    tk: TableKey,
    key: ObjKey,
    ck: ColKey,
    target: Option<ObjKey>,
) -> Result<()> {
    let pos = group.state(tk)?.col_pos(ck)?;
    expect_type(ck, ColumnType::Link)?;
    let target_tk = match group.state(tk)?.spec[pos].target {
        ColumnTarget::Table(t) => t,
        _ => return Err(CoreError::Corruption("link column lost target".into())),
    };
    let row = group.state(tk)?.require_row(alloc, key)?;
    let old_raw = group.state(tk)?.value_tree(alloc, pos)?.get(alloc, row)?;

    if let Some((old_key, tombstone)) = link::decode(old_raw) {
        if !tombstone {
            backlink_remove(group, alloc, target_tk, tk, ck.index(), ObjKey(old_key), key)?;
        }
    }
    let new_raw = match target {
        None => link::NULL,
        Some(t) => {
            if group.state(target_tk)?.row_of(alloc, t)?.is_none() {
                return Err(CoreError::InvalidArgument("link target does not exist".into()));
            }
            backlink_add(group, alloc, target_tk, tk, ck.index(), t, key)?;
            link::encode(t.0)
        }
    };
    group
        .state_mut(tk)?
        .with_value_tree(alloc, pos, |alloc, tree| tree.set(alloc, row, new_raw))?;
    group.bump_content_version();
    Ok(())
}

/// Source keys referencing `target_key` through the backlink column for
/// (`origin_tk`, `origin_col`). Empty when none.
pub fn backlinks_of(
    group: &Group,
    alloc: &SlabAlloc,
    target_tk: TableKey,
    origin_tk: TableKey,
    origin_col: u32,
    target_key: ObjKey,
) -> Result<Vec<ObjKey>> {
    let target = group.state(target_tk)?;
    let Some(bl_pos) = target.backlink_pos_for(origin_tk, origin_col) else {
        return Ok(Vec::new());
    };
    let Some(row) = target.row_of(alloc, target_key)? else {
        return Ok(Vec::new());
    };
    let cell = target.value_tree(alloc, bl_pos)?.get(alloc, row)? as u64;
    if cell == NULL_REF {
        return Ok(Vec::new());
    }
    let tree = Tree::from_ref(cell, false);
    Ok(tree
        .to_vec(alloc)?
        .into_iter()
        .map(|v| ObjKey(v as u64))
        .collect())
}

pub(crate) fn backlink_add(
    group: &mut Group,
    alloc: &mut SlabAlloc,
    target_tk: TableKey,
    origin_tk: TableKey,
    origin_col: u32,
    target_key: ObjKey,
    source_key: ObjKey,
) -> Result<()> {
    let target = group.state(target_tk)?;
    let Some(bl_pos) = target.backlink_pos_for(origin_tk, origin_col) else {
        return Ok(());
    };
    let row = target.require_row(alloc, target_key)?;
    let cell = target.value_tree(alloc, bl_pos)?.get(alloc, row)? as u64;
    let mut tree = if cell == NULL_REF {
        Tree::create(alloc, false)?
    } else {
        Tree::from_ref(cell, false)
    };
    tree.push(alloc, source_key.0 as i64)?;
    group
        .state_mut(target_tk)?
        .with_value_tree(alloc, bl_pos, |alloc, vt| {
            vt.set(alloc, row, tree.root_ref() as i64)
        })
}

pub(crate) fn backlink_remove(
    group: &mut Group,
    alloc: &mut SlabAlloc,
    target_tk: TableKey,
    origin_tk: TableKey,
    origin_col: u32,
    target_key: ObjKey,
    source_key: ObjKey,
) -> Result<()> {
    let target = group.state(target_tk)?;
    let Some(bl_pos) = target.backlink_pos_for(origin_tk, origin_col) else {
        return Ok(());
    };
    let Some(row) = target.row_of(alloc, target_key)? else {
        return Ok(());
    };
    let cell = target.value_tree(alloc, bl_pos)?.get(alloc, row)? as u64;
    if cell == NULL_REF {
        return Ok(());
    }
    let mut tree = Tree::from_ref(cell, false);
    let n = tree.size(alloc)?;
    for i in 0..n {
        if tree.get(alloc, i)? as u64 == source_key.0 {
            tree.erase(alloc, i)?;
            break;
        }
    }
    group
        .state_mut(target_tk)?
        .with_value_tree(alloc, bl_pos, |alloc, vt| {
            vt.set(alloc, row, tree.root_ref() as i64)
        })
}

/// How references to a removed object are treated.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RemovalMode {
    /// Apply link policies: strong cascades, weak nulls.
    Cascade,
    /// Leave tombstoned values that retain the key (sync-style).
    Unresolved,
}

/// Removes an object, cascading per the link columns' policies.
pub fn remove_object(
    group: &mut Group,
    alloc: &mut SlabAlloc,
    tk: TableKey,
    key: ObjKey,
) -> Result<()> {
    remove_object_inner(group, alloc, tk, key, RemovalMode::Cascade)
}

/// Replaces an object with a tombstone: incoming references keep the key but
/// are hidden from condensed views.
pub fn invalidate_object(
    group: &mut Group,
    alloc: &mut SlabAlloc,
    tk: TableKey,
    key: ObjKey,
) -> Result<()> {
    remove_object_inner(group, alloc, tk, key, RemovalMode::Unresolved)
}

fn remove_object_inner(
    group: &mut Group,
    alloc: &mut SlabAlloc,
    tk: TableKey,
    key: ObjKey,
    mode: RemovalMode,
) -> Result<()> {
    let row = group.state(tk)?.require_row(alloc, key)?;

    // Outgoing links: detach our entries from target backlink cells.
    let specs: Vec<(usize, ColKey, ColumnTarget)> = group
        .state(tk)?
        .spec
        .iter()
        .enumerate()
        .map(|(i, s)| (i, s.ck, s.target))
        .collect();
    for (pos, ck, target) in &specs {
        match (ck.column_type(), target) {
            (ColumnType::Link, ColumnTarget::Table(target_tk)) => {
                let raw = group.state(tk)?.value_tree(alloc, *pos)?.get(alloc, row)?;
                if let Some((old_key, false)) = link::decode(raw) {
                    backlink_remove(group, alloc, *target_tk, tk, ck.index(), ObjKey(old_key), key)?;
                }
            }
            (ColumnType::List | ColumnType::Set, ColumnTarget::Table(target_tk)) => {
                let cell = group.state(tk)?.value_tree(alloc, *pos)?.get(alloc, row)? as u64;
                if cell != NULL_REF {
                    let tree = Tree::from_ref(cell, false);
                    for raw in tree.to_vec(alloc)? {
                        if let Some((entry_key, false)) = link::decode(raw) {
                            backlink_remove(
                                group,
                                alloc,
                                *target_tk,
                                tk,
                                ck.index(),
                                ObjKey(entry_key),
                                key,
                            )?;
                        }
                    }
                }
            }
            _ => {}
        }
    }

    // Incoming links: walk our backlink columns and apply the origin
    // column's policy.
    for (pos, _ck, target) in &specs {
        let ColumnTarget::Origin { table, col_index } = target else {
            continue;
        };
        let cell = group.state(tk)?.value_tree(alloc, *pos)?.get(alloc, row)? as u64;
        if cell == NULL_REF {
            continue;
        }
        let sources: Vec<ObjKey> = Tree::from_ref(cell, false)
            .to_vec(alloc)?
            .into_iter()
            .map(|v| ObjKey(v as u64))
            .collect();
        for src in sources {
            apply_removal_policy(group, alloc, *table, *col_index, src, key, mode)?;
        }
    }

    // Cascades may have shifted rows in this table, or already removed the
    // object itself through a link cycle; re-resolve before dropping.
    let Some(row) = group.state(tk)?.row_of(alloc, key)? else {
        return Ok(());
    };

    // Finally drop the row itself: erase from every column (destroying
    // owned cells) and from the key tree.
    let col_count = group.state(tk)?.spec.len();
    for pos in 0..col_count {
        let ck = group.state(tk)?.spec[pos].ck;
        if ck.column_type().holds_refs() {
            let cell = group.state(tk)?.value_tree(alloc, pos)?.get(alloc, row)? as u64;
            if cell != NULL_REF {
                if ck.column_type() == ColumnType::Dictionary {
                    Array::from_ref(cell).destroy_deep(alloc)?;
                } else {
                    Tree::from_ref(cell, false).destroy(alloc)?;
                }
            }
        }
        group
            .state_mut(tk)?
            .with_value_tree(alloc, pos, |alloc, tree| tree.erase(alloc, row))?;
        if ck.column_type() == ColumnType::Int && ck.is_nullable() {
            group
                .state_mut(tk)?
                .with_aux_tree(alloc, pos, |alloc, tree| tree.erase(alloc, row))?;
        }
    }
    let state = group.state_mut(tk)?;
    let mut keys = state.key_tree(alloc)?;
    keys.erase(alloc, row)?;
    state.save_key_tree(alloc, keys)?;
    state.content_version += 1;
    group.bump_content_version();
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::alloc::Backing;

    fn test_env() -> (tempfile::TempDir, SlabAlloc, Group) {
        let dir = tempfile::tempdir().unwrap();
        let mut backing = Backing::attach(dir.path().join("table.tsra"), None).unwrap();
        backing.grow(crate::alloc::HEADER_SIZE as u64).unwrap();
        let mut alloc = SlabAlloc::new(backing);
        alloc.bind(crate::alloc::HEADER_SIZE as u64).unwrap();
        let group = Group::new_empty();
        (dir, alloc, group)
    }

    #[test]
    fn typed_cells_roundtrip() {
        let (_dir, mut alloc, mut group) = test_env();
        let tk = group.add_table(&mut alloc, "t").unwrap();
        let t = group.state_mut(tk).unwrap();
        let n = t
            .add_column(&mut alloc, "n", ColumnType::Int, 0, ColumnTarget::None)
            .unwrap();
        let flag = t
            .add_column(&mut alloc, "flag", ColumnType::Bool, 0, ColumnTarget::None)
            .unwrap();
        let name = t
            .add_column(&mut alloc, "name", ColumnType::String, 0, ColumnTarget::None)
            .unwrap();
        let obj = t.create_object(&mut alloc).unwrap();
        t.set_int(&mut alloc, obj, n, -42).unwrap();
        t.set_bool(&mut alloc, obj, flag, true).unwrap();
        t.set_string(&mut alloc, obj, name, "zora").unwrap();

        assert_eq!(t.get_int(&alloc, obj, n).unwrap(), Some(-42));
        assert!(t.get_bool(&alloc, obj, flag).unwrap());
        assert_eq!(t.get_string(&alloc, obj, name).unwrap().as_deref(), Some("zora"));
    }

    #[test]
    fn nullable_int_uses_null_tree() {
        let (_dir, mut alloc, mut group) = test_env();
        let tk = group.add_table(&mut alloc, "t").unwrap();
        let t = group.state_mut(tk).unwrap();
        let n = t
            .add_column(
                &mut alloc,
                "n",
                ColumnType::Int,
                attrs::NULLABLE,
                ColumnTarget::None,
            )
            .unwrap();
        let a = t.create_object(&mut alloc).unwrap();
        assert_eq!(t.get_int(&alloc, a, n).unwrap(), None);
        t.set_int(&mut alloc, a, n, 0).unwrap();
        assert_eq!(t.get_int(&alloc, a, n).unwrap(), Some(0));
        t.set_null(&mut alloc, a, n).unwrap();
        assert!(t.is_null(&alloc, a, n).unwrap());
    }

    #[test]
    fn key_lookup_is_stable_across_removals() {
        let (_dir, mut alloc, mut group) = test_env();
        let tk = group.add_table(&mut alloc, "t").unwrap();
        let t = group.state_mut(tk).unwrap();
        let n = t
            .add_column(&mut alloc, "n", ColumnType::Int, 0, ColumnTarget::None)
            .unwrap();
        let keys: Vec<ObjKey> = (0..10).map(|_| t.create_object(&mut alloc).unwrap()).collect();
        for (i, &k) in keys.iter().enumerate() {
            t.set_int(&mut alloc, k, n, i as i64 * 10).unwrap();
        }
        remove_object(&mut group, &mut alloc, tk, keys[4]).unwrap();
        let t = group.state(tk).unwrap();
        assert_eq!(t.row_count(&alloc).unwrap(), 9);
        assert_eq!(t.get_int(&alloc, keys[7], n).unwrap(), Some(70));
        assert!(t.row_of(&alloc, keys[4]).unwrap().is_none());
    }

    #[test]
    fn weak_link_nulls_on_target_removal() {
        let (_dir, mut alloc, mut group) = test_env();
        let people = group.add_table(&mut alloc, "people").unwrap();
        let dogs = group.add_table(&mut alloc, "dogs").unwrap();
        let owner = add_link_column(&mut group, &mut alloc, dogs, "owner", people, false).unwrap();

        let alice = group.state_mut(people).unwrap().create_object(&mut alloc).unwrap();
        let rex = group.state_mut(dogs).unwrap().create_object(&mut alloc).unwrap();
        set_link(&mut group, &mut alloc, dogs, rex, owner, Some(alice)).unwrap();
        assert_eq!(
            backlinks_of(&group, &alloc, people, dogs, owner.index(), alice).unwrap(),
            vec![rex]
        );

        remove_object(&mut group, &mut alloc, people, alice).unwrap();
        let d = group.state(dogs).unwrap();
        assert_eq!(d.get_link(&alloc, rex, owner).unwrap(), None);
    }

    #[test]
    fn strong_link_cascades_source_removal() {
        let (_dir, mut alloc, mut group) = test_env();
        let orders = group.add_table(&mut alloc, "orders").unwrap();
        let invoices = group.add_table(&mut alloc, "invoices").unwrap();
        let of = add_link_column(&mut group, &mut alloc, invoices, "of", orders, true).unwrap();

        let order = group.state_mut(orders).unwrap().create_object(&mut alloc).unwrap();
        let invoice = group.state_mut(invoices).unwrap().create_object(&mut alloc).unwrap();
        set_link(&mut group, &mut alloc, invoices, invoice, of, Some(order)).unwrap();

        remove_object(&mut group, &mut alloc, orders, order).unwrap();
        assert!(group
            .state(invoices)
            .unwrap()
            .row_of(&alloc, invoice)
            .unwrap()
            .is_none());
    }

    #[test]
    fn invalidate_leaves_tombstoned_link() {
        let (_dir, mut alloc, mut group) = test_env();
        let a = group.add_table(&mut alloc, "a").unwrap();
        let b = group.add_table(&mut alloc, "b").unwrap();
        let l = add_link_column(&mut group, &mut alloc, b, "l", a, false).unwrap();

        let target = group.state_mut(a).unwrap().create_object(&mut alloc).unwrap();
        let src = group.state_mut(b).unwrap().create_object(&mut alloc).unwrap();
        set_link(&mut group, &mut alloc, b, src, l, Some(target)).unwrap();

        invalidate_object(&mut group, &mut alloc, a, target).unwrap();
        let got = group.state(b).unwrap().get_link(&alloc, src, l).unwrap();
        assert_eq!(got, Some((target, true)));
    }

    #[test]
    fn duplicate_primary_key_rejected() {
        let (_dir, mut alloc, mut group) = test_env();
        let tk = group.add_table(&mut alloc, "t").unwrap();
        let t = group.state_mut(tk).unwrap();
        t.add_column(
            &mut alloc,
            "id",
            ColumnType::Int,
            attrs::PRIMARY,
            ColumnTarget::None,
        )
        .unwrap();
        t.create_object_with_pk(&mut alloc, 7).unwrap();
        assert!(t.create_object_with_pk(&mut alloc, 7).is_err());
        t.create_object_with_pk(&mut alloc, 8).unwrap();
    }
}

/// Applies the removal policy of one originating column to one source
/// object whose reference targets the removed `target_key`.
fn apply_removal_policy(
    group: &mut Group,
    alloc: &mut SlabAlloc,
    src_tk: TableKey,
    src_col: u32,
    src_key: ObjKey,
    target_key: ObjKey,
    mode: RemovalMode,
) -> Result<()> {
    let src_state = group.state(src_tk)?;
    let pos = src_col as usize;
    let ck = src_state.spec[pos].ck;
    let Some(src_row) = src_state.row_of(alloc, src_key)? else {
        return Ok(());
    };

    match ck.column_type() {
        ColumnType::Link => {
            if mode == RemovalMode::Cascade && ck.attrs() & attrs::STRONG != 0 {
                // Strong link: removing the target removes the source.
                return remove_object_inner(group, alloc, src_tk, src_key, mode);
            }
            let raw = src_state.value_tree(alloc, pos)?.get(alloc, src_row)?;
            let new_raw = match mode {
                RemovalMode::Cascade => link::NULL,
                RemovalMode::Unresolved => link::tombstone(raw),
            };
            group
                .state_mut(src_tk)?
                .with_value_tree(alloc, pos, |alloc, tree| tree.set(alloc, src_row, new_raw))?;
        }
        ColumnType::List | ColumnType::Set => {
            let cell = src_state.value_tree(alloc, pos)?.get(alloc, src_row)? as u64;
            if cell == NULL_REF {
                return Ok(());
            }
            let mut tree = Tree::from_ref(cell, false);
            let encoded = link::encode(target_key.0);
            let mut i = 0;
            while i < tree.size(alloc)? {
                if tree.get(alloc, i)? == encoded {
                    match mode {
                        RemovalMode::Cascade => {
                            tree.erase(alloc, i)?;
                            continue;
                        }
                        RemovalMode::Unresolved => {
                            tree.set(alloc, i, link::tombstone(encoded))?;
                        }
                    }
                }
                i += 1;
            }
            group
                .state_mut(src_tk)?
                .with_value_tree(alloc, pos, |alloc, vt| {
                    vt.set(alloc, src_row, tree.root_ref() as i64)
                })?;
        }
        _ => {}
    }
    group.bump_content_version();
    Ok(())
}
