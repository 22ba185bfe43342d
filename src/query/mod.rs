//! Compiled query trees over one table.
//!
//! A query is an implicit AND of predicate nodes, with OR groups nesting
//! further AND lists. Execution picks a driver: when the first node is an
//! integer compare on a non-nullable column, the engine walks that column's
//! leaves directly and the per-width kernels (cascade-zero, gtlt magic,
//! SSE) do the heavy lifting, with the width-derived bounds short-circuit
//! deciding whole leaves without reading them. Remaining nodes verify each
//! candidate row by point lookup. All other shapes fall back to the
//! chunk-at-a-time row driver that evaluates arithmetic subexpressions on
//! eight-wide buffers.
//!
//! Every result path (find_first, find_all, count, the aggregates, and
//! limits) funnels through the same `match()`-driven state machine: a
//! state receiving row indices and returning whether to keep scanning.

use smallvec::SmallVec;

use crate::alloc::SlabAlloc;
use crate::array::find::{
    find_leaf, CondKind, Equal, FindAll, FindFirst, Greater, GreaterEqual, Less, LessEqual,
    NotEqual, QueryState,
};
use crate::column::{link, ColumnType};
use crate::error::{CoreError, Result};
use crate::group::Group;
use crate::keys::{ColKey, ObjKey, TableKey};
use crate::table::TableState;
use crate::tree::Tree;
use crate::txn::{Transaction, VersionId};

/// Arithmetic operators usable inside a subexpression.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArithOp {
    /// lhs + rhs
    Add,
    /// lhs - rhs
    Sub,
    /// lhs * rhs
    Mul,
}

/// One side of a comparison: a column, a constant, or an operator tree.
///
/// Constants are broadcast into eight-wide buffers during evaluation, so an
/// operator combines register-shaped operands regardless of which side is
/// which.
#[derive(Debug, Clone)]
pub enum Subexpr {
    /// Values of an integer column.
    Column(ColKey),
    /// A constant, broadcast eight-wide.
    Value(i64),
    /// An arithmetic combination of two subexpressions.
    Op {
        /// The operator.
        op: ArithOp,
        /// Left operand.
        lhs: Box<Subexpr>,
        /// Right operand.
        rhs: Box<Subexpr>,
    },
}

impl Subexpr {
    /// Evaluates eight consecutive rows starting at `row` into `out`.
    fn eval_chunk(
        &self,
        state: &TableState,
        alloc: &SlabAlloc,
        row: usize,
        out: &mut [i64; 8],
    ) -> Result<()> {
        match self {
            Subexpr::Value(v) => out.fill(*v),
            Subexpr::Column(ck) => {
                let pos = state.col_pos(*ck)?;
                let tree = state.value_tree(alloc, pos)?;
                tree.get_chunk(alloc, row, out)?;
            }
            Subexpr::Op { op, lhs, rhs } => {
                let mut a = [0i64; 8];
                let mut b = [0i64; 8];
                lhs.eval_chunk(state, alloc, row, &mut a)?;
                rhs.eval_chunk(state, alloc, row, &mut b)?;
                for k in 0..8 {
                    out[k] = match op {
                        ArithOp::Add => a[k].wrapping_add(b[k]),
                        ArithOp::Sub => a[k].wrapping_sub(b[k]),
                        ArithOp::Mul => a[k].wrapping_mul(b[k]),
                    };
                }
            }
        }
        Ok(())
    }
}

/// String comparison kinds; strings do not go through the packed kernels.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StrCond {
    /// Exact match.
    Equal,
    /// Anything but an exact match (nulls excluded).
    NotEqual,
}

/// A node of the predicate tree.
#[derive(Debug, Clone)]
pub enum QueryNode {
    /// `Cond(column, value)` on an integer column; the direct engine path.
    IntCmp {
        /// Condition kind.
        cond: CondKind,
        /// Column to scan.
        ck: ColKey,
        /// Search value.
        value: i64,
    },
    /// Equality on a bool column.
    BoolEq {
        /// Column to scan.
        ck: ColKey,
        /// Expected value.
        value: bool,
    },
    /// String compare through the enumeration dictionary.
    StrCmp {
        /// Condition kind.
        cond: StrCond,
        /// Column to scan.
        ck: ColKey,
        /// Search string.
        value: String,
    },
    /// Link cell equals a specific object (or null).
    LinkEq {
        /// Column to scan.
        ck: ColKey,
        /// Target key; `None` matches null cells.
        target: Option<ObjKey>,
    },
    /// Element-by-element compare of two same-type columns.
    TwoColumns {
        /// Condition kind.
        cond: CondKind,
        /// Left column.
        lhs: ColKey,
        /// Right column.
        rhs: ColKey,
    },
    /// Generic comparison of two subexpressions.
    Expr {
        /// Condition kind.
        cond: CondKind,
        /// Left expression.
        lhs: Subexpr,
        /// Right expression.
        rhs: Subexpr,
    },
    /// Disjunction of AND groups.
    Or(Vec<Vec<QueryNode>>),
}

/// Builder and executor for queries on one table.
#[derive(Debug, Clone)]
pub struct Query {
    tk: TableKey,
    nodes: Vec<QueryNode>,
}

impl Query {
    /// Empty query on `tk`: matches every row.
    pub fn new(tk: TableKey) -> Self {
        Self {
            tk,
            nodes: Vec::new(),
        }
    }

    /// The table this query runs against.
    pub fn table(&self) -> TableKey {
        self.tk
    }

    fn push_int(mut self, cond: CondKind, ck: ColKey, value: i64) -> Self {
        self.nodes.push(QueryNode::IntCmp { cond, ck, value });
        self
    }

    /// column == value
    pub fn equal(self, ck: ColKey, value: i64) -> Self {
        self.push_int(CondKind::Equal, ck, value)
    }

    /// column != value
    pub fn not_equal(self, ck: ColKey, value: i64) -> Self {
        self.push_int(CondKind::NotEqual, ck, value)
    }

    /// column < value
    pub fn less(self, ck: ColKey, value: i64) -> Self {
        self.push_int(CondKind::Less, ck, value)
    }

    /// column > value
    pub fn greater(self, ck: ColKey, value: i64) -> Self {
        self.push_int(CondKind::Greater, ck, value)
    }

    /// column <= value
    pub fn less_equal(self, ck: ColKey, value: i64) -> Self {
        self.push_int(CondKind::LessEqual, ck, value)
    }

    /// column >= value
    pub fn greater_equal(self, ck: ColKey, value: i64) -> Self {
        self.push_int(CondKind::GreaterEqual, ck, value)
    }

    /// bool column == value
    pub fn equal_bool(mut self, ck: ColKey, value: bool) -> Self {
        self.nodes.push(QueryNode::BoolEq { ck, value });
        self
    }

    /// string column == value
    pub fn equal_string(mut self, ck: ColKey, value: &str) -> Self {
        self.nodes.push(QueryNode::StrCmp {
            cond: StrCond::Equal,
            ck,
            value: value.to_string(),
        });
        self
    }

    /// string column != value
    pub fn not_equal_string(mut self, ck: ColKey, value: &str) -> Self {
        self.nodes.push(QueryNode::StrCmp {
            cond: StrCond::NotEqual,
            ck,
            value: value.to_string(),
        });
        self
    }

    /// link column points at `target` (`None`: is null)
    pub fn links_to(mut self, ck: ColKey, target: Option<ObjKey>) -> Self {
        self.nodes.push(QueryNode::LinkEq { ck, target });
        self
    }

    /// Compare two columns element by element.
    pub fn compare_columns(mut self, cond: CondKind, lhs: ColKey, rhs: ColKey) -> Self {
        self.nodes.push(QueryNode::TwoColumns { cond, lhs, rhs });
        self
    }

    /// Generic expression comparison.
    pub fn expression(mut self, cond: CondKind, lhs: Subexpr, rhs: Subexpr) -> Self {
        // The builder-level engine selection: `Constant <op> Column`
        // collapses to the specialized integer path instead of the generic
        // tree. Observable only through performance.
        match (&lhs, &rhs) {
            (Subexpr::Column(ck), Subexpr::Value(v)) => {
                return self.push_int(cond, *ck, *v);
            }
            (Subexpr::Value(v), Subexpr::Column(ck)) => {
                return self.push_int(flip(cond), *ck, *v);
            }
            _ => {}
        }
        self.nodes.push(QueryNode::Expr { cond, lhs, rhs });
        self
    }

    /// OR of fully-built sub-queries (each an AND group).
    pub fn any_of(mut self, branches: Vec<Query>) -> Self {
        self.nodes
            .push(QueryNode::Or(branches.into_iter().map(|q| q.nodes).collect()));
        self
    }

    // -- execution -------------------------------------------------------

    /// First matching object.
    pub fn find_first(&self, tx: &Transaction) -> Result<Option<ObjKey>> {
        let (group, alloc) = tx.parts();
        let state = group.state(self.tk)?;
        let mut find = FindFirst::default();
        self.run(group, alloc, 0, usize::MAX, &mut find)?;
        find.result
            .map(|row| state.objkey_at(alloc, row))
            .transpose()
    }

    /// All matching objects, in row order.
    pub fn find_all(&self, tx: &Transaction) -> Result<Results> {
        self.find_all_limited(tx, usize::MAX)
    }

    /// Up to `limit` matching objects, in row order.
    pub fn find_all_limited(&self, tx: &Transaction, limit: usize) -> Result<Results> {
        let (group, alloc) = tx.parts();
        let state = group.state(self.tk)?;
        let mut find = FindAll::with_limit(limit);
        if limit > 0 {
            self.run(group, alloc, 0, usize::MAX, &mut find)?;
        }
        let keys = find
            .matches
            .into_iter()
            .map(|row| state.objkey_at(alloc, row))
            .collect::<Result<Vec<_>>>()?;
        Ok(Results {
            tk: self.tk,
            version: tx.version(),
            query: self.clone(),
            keys,
        })
    }

    /// Number of matching rows.
    pub fn count(&self, tx: &Transaction) -> Result<usize> {
        let (group, alloc) = tx.parts();
        let mut counter = crate::array::find::CountMatches::default();
        self.run(group, alloc, 0, usize::MAX, &mut counter)?;
        Ok(counter.count)
    }

    /// Sum of `agg_ck` over matching rows within `[start, end)`, capped at
    /// `limit` matches. Bounds are clamped to the table size.
    pub fn sum(
        &self,
        tx: &Transaction,
        agg_ck: ColKey,
        start: usize,
        end: usize,
        limit: usize,
    ) -> Result<i64> {
        let mut state = Aggregate::new(tx, self.tk, agg_ck, limit)?;
        let (group, alloc) = tx.parts();
        self.run(group, alloc, start, end, &mut state)?;
        Ok(state.sum)
    }

    /// Minimum of `agg_ck` over matching rows; `None` when nothing matched.
    pub fn min(&self, tx: &Transaction, agg_ck: ColKey) -> Result<Option<i64>> {
        let mut state = Aggregate::new(tx, self.tk, agg_ck, usize::MAX)?;
        let (group, alloc) = tx.parts();
        self.run(group, alloc, 0, usize::MAX, &mut state)?;
        Ok(state.min)
    }

    /// Maximum of `agg_ck` over matching rows.
    pub fn max(&self, tx: &Transaction, agg_ck: ColKey) -> Result<Option<i64>> {
        let mut state = Aggregate::new(tx, self.tk, agg_ck, usize::MAX)?;
        let (group, alloc) = tx.parts();
        self.run(group, alloc, 0, usize::MAX, &mut state)?;
        Ok(state.max)
    }

    /// Average of `agg_ck` over matching rows.
    pub fn avg(&self, tx: &Transaction, agg_ck: ColKey) -> Result<Option<f64>> {
        let mut state = Aggregate::new(tx, self.tk, agg_ck, usize::MAX)?;
        let (group, alloc) = tx.parts();
        self.run(group, alloc, 0, usize::MAX, &mut state)?;
        if state.non_null == 0 {
            Ok(None)
        } else {
            Ok(Some(state.sum as f64 / state.non_null as f64))
        }
    }

    /// Drives the scan, feeding matching row indices into `state`.
    fn run<S: QueryState>(
        &self,
        group: &Group,
        alloc: &SlabAlloc,
        start: usize,
        end: usize,
        state: &mut S,
    ) -> Result<()> {
        let table = group.state(self.tk)?;
        let rows = table.row_count(alloc)?;
        let start = start.min(rows);
        let end = end.min(rows);
        if start >= end || state.limit() == 0 {
            return Ok(());
        }

        // The direct engine path: first node drives the leaf kernels when
        // it is an int compare on a non-nullable column.
        if let Some(QueryNode::IntCmp { cond, ck, value }) = self.nodes.first() {
            if ck.column_type() == ColumnType::Int
                && !ck.is_nullable()
                && table.col_pos(*ck).is_ok()
            {
                let pos = table.col_pos(*ck)?;
                let tree = table.value_tree(alloc, pos)?;
                let rest = &self.nodes[1..];
                let mut verify = Verify {
                    group,
                    alloc,
                    table,
                    nodes: rest,
                    inner: state,
                    error: None,
                };
                let cond = *cond;
                let value = *value;
                tree.for_each_leaf(alloc, start, end, &mut |chunk| {
                    let lo = chunk.base.max(start) - chunk.base;
                    let hi = (chunk.base + chunk.size).min(end) - chunk.base;
                    Ok(dispatch_find(
                        cond,
                        chunk.payload,
                        chunk.width,
                        chunk.size,
                        value,
                        lo,
                        hi,
                        chunk.base,
                        &mut verify,
                    ))
                })?;
                if let Some(e) = verify.error {
                    return Err(e);
                }
                return Ok(());
            }
        }

        // Chunked row driver for every other shape.
        let mut row = start;
        let mut scratch_a = [0i64; 8];
        let mut scratch_b = [0i64; 8];
        'outer: while row < end {
            let block = (end - row).min(8);
            // A leading Expr node is pre-evaluated eight rows at a time on
            // the register-shaped buffers; other node kinds point-check.
            let expr_mask: Option<SmallVec<[bool; 8]>> =
                if let Some(QueryNode::Expr { cond, lhs, rhs }) = self.nodes.first() {
                    lhs.eval_chunk(table, alloc, row, &mut scratch_a)?;
                    rhs.eval_chunk(table, alloc, row, &mut scratch_b)?;
                    Some(
                        (0..8)
                            .map(|k| test_cond(*cond, scratch_a[k], scratch_b[k]))
                            .collect(),
                    )
                } else {
                    None
                };
            for k in 0..block {
                let r = row + k;
                let nodes: &[QueryNode] = match &expr_mask {
                    Some(mask) => {
                        if !mask[k] {
                            continue;
                        }
                        &self.nodes[1..]
                    }
                    None => &self.nodes[..],
                };
                if check_row(group, alloc, table, nodes, r)? && !state.match_at(r, 0) {
                    break 'outer;
                }
            }
            row += block;
        }
        Ok(())
    }
}

fn flip(cond: CondKind) -> CondKind {
    match cond {
        CondKind::Less => CondKind::Greater,
        CondKind::Greater => CondKind::Less,
        CondKind::LessEqual => CondKind::GreaterEqual,
        CondKind::GreaterEqual => CondKind::LessEqual,
        other => other,
    }
}

fn test_cond(cond: CondKind, a: i64, b: i64) -> bool {
    match cond {
        CondKind::Equal => a == b,
        CondKind::NotEqual => a != b,
        CondKind::Less => a < b,
        CondKind::Greater => a > b,
        CondKind::LessEqual => a <= b,
        CondKind::GreaterEqual => a >= b,
    }
}

/// Fans the runtime condition out into the monomorphized kernel entry.
#[allow(clippy::too_many_arguments)]
fn dispatch_find<S: QueryState>(
    cond: CondKind,
    payload: &[u8],
    width: u8,
    size: usize,
    value: i64,
    start: usize,
    end: usize,
    baseindex: usize,
    state: &mut S,
) -> bool {
    match cond {
        CondKind::Equal => {
            find_leaf::<Equal, S>(payload, width, size, value, start, end, baseindex, state)
        }
        CondKind::NotEqual => {
            find_leaf::<NotEqual, S>(payload, width, size, value, start, end, baseindex, state)
        }
        CondKind::Less => {
            find_leaf::<Less, S>(payload, width, size, value, start, end, baseindex, state)
        }
        CondKind::Greater => {
            find_leaf::<Greater, S>(payload, width, size, value, start, end, baseindex, state)
        }
        CondKind::LessEqual => {
            find_leaf::<LessEqual, S>(payload, width, size, value, start, end, baseindex, state)
        }
        CondKind::GreaterEqual => {
            find_leaf::<GreaterEqual, S>(payload, width, size, value, start, end, baseindex, state)
        }
    }
}

/// Wraps the output state with point verification of the remaining nodes.
struct Verify<'a, S: QueryState> {
    group: &'a Group,
    alloc: &'a SlabAlloc,
    table: &'a TableState,
    nodes: &'a [QueryNode],
    inner: &'a mut S,
    error: Option<CoreError>,
}

impl<S: QueryState> QueryState for Verify<'_, S> {
    fn match_at(&mut self, index: usize, value: i64) -> bool {
        match check_row(self.group, self.alloc, self.table, self.nodes, index) {
            Ok(true) => self.inner.match_at(index, value),
            Ok(false) => true,
            Err(e) => {
                self.error = Some(e);
                false
            }
        }
    }

    fn match_count(&self) -> usize {
        self.inner.match_count()
    }

    fn limit(&self) -> usize {
        // With verification pending, candidate count does not bound the
        // accepted count, so bulk emission must not stop early.
        if self.nodes.is_empty() {
            self.inner.limit()
        } else {
            usize::MAX
        }
    }
}

/// Point-evaluates an AND list at one row.
fn check_row(
    group: &Group,
    alloc: &SlabAlloc,
    table: &TableState,
    nodes: &[QueryNode],
    row: usize,
) -> Result<bool> {
    for node in nodes {
        if !check_node(group, alloc, table, node, row)? {
            return Ok(false);
        }
    }
    Ok(true)
}

fn check_node(
    group: &Group,
    alloc: &SlabAlloc,
    table: &TableState,
    node: &QueryNode,
    row: usize,
) -> Result<bool> {
    match node {
        QueryNode::IntCmp { cond, ck, value } => {
            let pos = table.col_pos(*ck)?;
            if ck.is_nullable() {
                let nulls = table
                    .aux_tree(alloc, pos)?
                    .ok_or(CoreError::Corruption("nullable column lost null tree".into()))?;
                if nulls.get(alloc, row)? != 0 {
                    return Ok(false);
                }
            }
            let v = table.value_tree(alloc, pos)?.get(alloc, row)?;
            Ok(test_cond(*cond, v, *value))
        }
        QueryNode::BoolEq { ck, value } => {
            let pos = table.col_pos(*ck)?;
            let v = table.value_tree(alloc, pos)?.get(alloc, row)?;
            Ok((v != 0) == *value)
        }
        QueryNode::StrCmp { cond, ck, value } => {
            let pos = table.col_pos(*ck)?;
            // Enumerated strings: resolve the search value against the
            // dictionary once, then integer-compare the id column.
            let id = table.string_id(alloc, *ck, value)?;
            let v = table.value_tree(alloc, pos)?.get(alloc, row)?;
            Ok(match (cond, id) {
                (StrCond::Equal, Some(id)) => v == id,
                (StrCond::Equal, None) => false,
                (StrCond::NotEqual, Some(id)) => v != id && v != crate::table::NULL_STRING_ID,
                (StrCond::NotEqual, None) => v != crate::table::NULL_STRING_ID,
            })
        }
        QueryNode::LinkEq { ck, target } => {
            let pos = table.col_pos(*ck)?;
            let raw = table.value_tree(alloc, pos)?.get(alloc, row)?;
            Ok(match target {
                None => raw == link::NULL,
                Some(t) => link::decode(raw) == Some((t.0, false)),
            })
        }
        QueryNode::TwoColumns { cond, lhs, rhs } => {
            let lp = table.col_pos(*lhs)?;
            let rp = table.col_pos(*rhs)?;
            let a = table.value_tree(alloc, lp)?.get(alloc, row)?;
            let b = table.value_tree(alloc, rp)?.get(alloc, row)?;
            Ok(test_cond(*cond, a, b))
        }
        QueryNode::Expr { cond, lhs, rhs } => {
            let mut a = [0i64; 8];
            let mut b = [0i64; 8];
            lhs.eval_chunk(table, alloc, row, &mut a)?;
            rhs.eval_chunk(table, alloc, row, &mut b)?;
            Ok(test_cond(*cond, a[0], b[0]))
        }
        QueryNode::Or(branches) => {
            for branch in branches {
                if check_row(group, alloc, table, branch, row)? {
                    return Ok(true);
                }
            }
            Ok(false)
        }
    }
}

/// Aggregating state: sum/min/max plus a non-null counter for avg, reading
/// the aggregated column on every accepted row.
struct Aggregate<'a> {
    alloc: &'a SlabAlloc,
    values: Tree,
    nulls: Option<Tree>,
    limit: usize,
    accepted: usize,
    sum: i64,
    min: Option<i64>,
    max: Option<i64>,
    non_null: usize,
}

impl<'a> Aggregate<'a> {
    fn new(tx: &'a Transaction, tk: TableKey, ck: ColKey, limit: usize) -> Result<Self> {
        let (group, alloc) = tx.parts();
        let table = group.state(tk)?;
        let pos = table.col_pos(ck)?;
        if ck.column_type() != ColumnType::Int {
            return Err(CoreError::IllegalOperation("aggregate over non-int column"));
        }
        Ok(Self {
            alloc,
            values: table.value_tree(alloc, pos)?,
            nulls: if ck.is_nullable() {
                table.aux_tree(alloc, pos)?
            } else {
                None
            },
            limit,
            accepted: 0,
            sum: 0,
            min: None,
            max: None,
            non_null: 0,
        })
    }
}

impl QueryState for Aggregate<'_> {
    fn match_at(&mut self, index: usize, _value: i64) -> bool {
        let is_null = match &self.nulls {
            Some(nulls) => nulls.get(self.alloc, index).map(|v| v != 0).unwrap_or(true),
            None => false,
        };
        if !is_null {
            if let Ok(v) = self.values.get(self.alloc, index) {
                self.sum = self.sum.wrapping_add(v);
                self.min = Some(self.min.map_or(v, |m| m.min(v)));
                self.max = Some(self.max.map_or(v, |m| m.max(v)));
                self.non_null += 1;
            }
        }
        self.accepted += 1;
        self.accepted < self.limit
    }

    fn match_count(&self) -> usize {
        self.accepted
    }

    fn limit(&self) -> usize {
        self.limit
    }
}

/// A materialized query result bound to one transaction's snapshot.
#[derive(Debug, Clone)]
pub struct Results {
    tk: TableKey,
    version: VersionId,
    query: Query,
    keys: Vec<ObjKey>,
}

impl Results {
    /// Number of matches.
    pub fn len(&self) -> usize {
        self.keys.len()
    }

    /// True when nothing matched.
    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }

    /// Object key at `index`.
    pub fn get(&self, index: usize) -> Option<ObjKey> {
        self.keys.get(index).copied()
    }

    /// The matched keys, in row order.
    pub fn keys(&self) -> &[ObjKey] {
        &self.keys
    }

    /// Snapshot the results were computed against.
    pub fn version(&self) -> VersionId {
        self.version
    }

    /// Exports for handover to another transaction on the same file.
    /// `with_payload` ships the computed keys; without it the import
    /// recomputes on first use.
    pub fn export(&self, with_payload: bool) -> Handover {
        Handover {
            version: self.version,
            query: self.query.clone(),
            keys: with_payload.then(|| self.keys.clone()),
        }
    }
}

/// An exported result set in transit between transactions.
#[derive(Debug, Clone)]
pub struct Handover {
    version: VersionId,
    query: Query,
    keys: Option<Vec<ObjKey>>,
}

impl Handover {
    /// Imports into `tx`. The payload is only valid on the exact version it
    /// was exported from; otherwise the query reruns against the importing
    /// snapshot.
    pub fn import(self, tx: &Transaction) -> Result<Results> {
        if let Some(keys) = self.keys {
            if tx.version() == self.version {
                return Ok(Results {
                    tk: self.query.tk,
                    version: self.version,
                    query: self.query,
                    keys,
                });
            }
        }
        self.query.find_all(tx)
    }
}
