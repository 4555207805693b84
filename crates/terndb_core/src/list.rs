//! Collections: lists, link lists, sets, and dictionaries.
//!
//! A collection is rooted at a ref stored in the object's cell for its
//! column. Value collections hold their elements directly; link
//! collections additionally maintain backlinks on the target table and
//! hide unresolved (tombstone) keys from the user-facing view.

use crate::bptree::{BPlusTree, IntLeaf, StrLeaf};
use crate::cluster::{decode_link, encode_link, Cell};
use crate::error::{CoreError, CoreResult};
use crate::keys::{ColKey, ObjKey, Ref, TableKey};
use crate::schema::{ColumnSpec, ColumnType};
use crate::transaction::{
    cell_to_value, validate_value, value_to_cell, CascadeState, Transaction, WriteTransaction,
};
use crate::value::Value;
use crate::array::Array;
use std::cell::RefCell;
use terndb_changeset::Instruction;

/// Loads the collection root from the object's cell.
fn collection_root(
    txn: &mut Transaction,
    table: TableKey,
    key: ObjKey,
    col: ColKey,
) -> CoreResult<Ref> {
    let cell = txn.raw_cell(table, key, col.index() as usize)?;
    Ok(Ref::new(cell.as_int() as u64))
}

/// Writes the collection root back to the object's cell. Raw write; no
/// instruction, no backlinks.
fn set_collection_root(
    txn: &mut Transaction,
    table: TableKey,
    key: ObjKey,
    col: ColKey,
    root: Ref,
) -> CoreResult<()> {
    let col_ndx = col.index() as usize;
    txn.with_state(table, |alloc, state| {
        let mut ct = state.ct;
        ct.set_cell(
            alloc,
            &state.spec,
            key,
            col_ndx,
            &Cell::Int(root.offset() as i64),
        )?;
        state.ct = ct;
        state.dirty = true;
        Ok(())
    })
}

/// Element trees come in two shapes, matching the cluster leaf kinds.
enum ElemTree {
    Int(BPlusTree<IntLeaf>),
    Str(BPlusTree<StrLeaf>),
}

fn is_str_elem(col_spec: &ColumnSpec) -> bool {
    matches!(col_spec.col_type, ColumnType::String | ColumnType::Binary)
}

impl ElemTree {
    fn attach(col_spec: &ColumnSpec, root: Ref) -> Self {
        if is_str_elem(col_spec) {
            Self::Str(BPlusTree::attach(root))
        } else {
            Self::Int(BPlusTree::attach(root))
        }
    }

    fn root_ref(&self) -> Ref {
        match self {
            Self::Int(tree) => tree.root_ref(),
            Self::Str(tree) => tree.root_ref(),
        }
    }
}

/// Materializes the element tree, creating an empty one when the cell
/// is still null, then runs `f` and stores the new root back.
fn with_tree<R>(
    txn: &mut Transaction,
    table: TableKey,
    key: ObjKey,
    col: ColKey,
    f: impl FnOnce(&mut crate::alloc::SlabAlloc, &mut ElemTree) -> CoreResult<R>,
) -> CoreResult<R> {
    let spec = txn.spec(table)?;
    let col_spec = spec.column(col)?.clone();
    let col_ndx = col.index() as usize;
    txn.with_state(table, |alloc, state| {
        let cell = state.ct.get_cell(alloc, &state.spec, key, col_ndx)?;
        let root = Ref::new(cell.as_int() as u64);
        let mut tree = if root.is_null() {
            if is_str_elem(&col_spec) {
                ElemTree::Str(BPlusTree::create(alloc)?)
            } else {
                ElemTree::Int(BPlusTree::create(alloc)?)
            }
        } else {
            ElemTree::attach(&col_spec, root)
        };
        let result = f(alloc, &mut tree)?;
        let new_root = tree.root_ref();
        if new_root != root {
            let mut ct = state.ct;
            ct.set_cell(
                alloc,
                &state.spec,
                key,
                col_ndx,
                &Cell::Int(new_root.offset() as i64),
            )?;
            state.ct = ct;
            state.dirty = true;
        }
        Ok(result)
    })
}

fn value_to_elem_int(col_spec: &ColumnSpec, value: &Value) -> i64 {
    value_to_cell(col_spec, value).as_int()
}

fn elem_to_value(col_spec: &ColumnSpec, word: i64) -> Value {
    cell_to_value(col_spec, &Cell::Int(word))
}

fn str_elem_to_value(col_spec: &ColumnSpec, elem: Option<Vec<u8>>) -> Value {
    cell_to_value(col_spec, &Cell::Str(elem))
}

fn value_to_str_elem(col_spec: &ColumnSpec, value: &Value) -> Option<Vec<u8>> {
    match value_to_cell(col_spec, value) {
        Cell::Str(elem) => elem,
        Cell::Int(_) => None,
    }
}

/// An ordered list of values bound to an object and column.
#[derive(Debug, Clone, Copy)]
pub struct List {
    table: TableKey,
    key: ObjKey,
    col: ColKey,
}

impl List {
    pub(crate) fn new(table: TableKey, key: ObjKey, col: ColKey) -> Self {
        Self { table, key, col }
    }

    fn col_spec(&self, txn: &mut Transaction) -> CoreResult<ColumnSpec> {
        Ok(txn.spec(self.table)?.column(self.col)?.clone())
    }

    /// Number of elements.
    ///
    /// # Errors
    ///
    /// Fails on load errors.
    pub fn size(&self, txn: &mut Transaction) -> CoreResult<usize> {
        let root = collection_root(txn, self.table, self.key, self.col)?;
        if root.is_null() {
            return Ok(0);
        }
        let col_spec = self.col_spec(txn)?;
        let alloc = txn.db.alloc.lock();
        match ElemTree::attach(&col_spec, root) {
            ElemTree::Int(tree) => tree.size(&alloc),
            ElemTree::Str(tree) => tree.size(&alloc),
        }
    }

    /// The element at `index`.
    ///
    /// # Errors
    ///
    /// Fails if `index` is out of bounds.
    pub fn get(&self, txn: &mut Transaction, index: usize) -> CoreResult<Value> {
        let root = collection_root(txn, self.table, self.key, self.col)?;
        if root.is_null() {
            return Err(CoreError::ListIndexOutOfBounds { index, size: 0 });
        }
        let col_spec = self.col_spec(txn)?;
        let alloc = txn.db.alloc.lock();
        match ElemTree::attach(&col_spec, root) {
            ElemTree::Int(tree) => Ok(elem_to_value(&col_spec, tree.get(&alloc, index)?)),
            ElemTree::Str(tree) => Ok(str_elem_to_value(&col_spec, tree.get(&alloc, index)?)),
        }
    }

    /// Every element, in order.
    ///
    /// # Errors
    ///
    /// Fails on load errors.
    pub fn values(&self, txn: &mut Transaction) -> CoreResult<Vec<Value>> {
        let root = collection_root(txn, self.table, self.key, self.col)?;
        if root.is_null() {
            return Ok(Vec::new());
        }
        let col_spec = self.col_spec(txn)?;
        let alloc = txn.db.alloc.lock();
        match ElemTree::attach(&col_spec, root) {
            ElemTree::Int(tree) => Ok(tree
                .to_vec(&alloc)?
                .into_iter()
                .map(|word| elem_to_value(&col_spec, word))
                .collect()),
            ElemTree::Str(tree) => Ok(tree
                .to_vec(&alloc)?
                .into_iter()
                .map(|elem| str_elem_to_value(&col_spec, elem))
                .collect()),
        }
    }

    /// Inserts `value` at `index`.
    ///
    /// # Errors
    ///
    /// Fails on validation errors or a bad index.
    pub fn insert(
        &self,
        txn: &mut WriteTransaction<'_>,
        index: usize,
        value: impl Into<Value>,
    ) -> CoreResult<()> {
        let value = value.into();
        let col_spec = self.col_spec(txn)?;
        validate_value(&col_spec, &value)?;
        with_tree(txn, self.table, self.key, self.col, |alloc, tree| {
            match tree {
                ElemTree::Int(tree) => {
                    tree.insert(alloc, index, value_to_elem_int(&col_spec, &value))
                }
                ElemTree::Str(tree) => {
                    tree.insert(alloc, index, value_to_str_elem(&col_spec, &value))
                }
            }
        })?;
        let table_name = txn.table_name(self.table)?;
        let wire = txn.value_to_wire(&col_spec, &value)?;
        txn.record(Instruction::ListInsert {
            table: table_name,
            key: self.key.value(),
            column: col_spec.name.clone(),
            index: index as u32,
            value: wire,
        });
        txn.bump_content_version();
        Ok(())
    }

    /// Appends `value`.
    ///
    /// # Errors
    ///
    /// Fails on validation errors.
    pub fn push(&self, txn: &mut WriteTransaction<'_>, value: impl Into<Value>) -> CoreResult<()> {
        let size = self.size(txn)?;
        self.insert(txn, size, value)
    }

    /// Overwrites the element at `index`.
    ///
    /// # Errors
    ///
    /// Fails on validation errors or a bad index.
    pub fn set(
        &self,
        txn: &mut WriteTransaction<'_>,
        index: usize,
        value: impl Into<Value>,
    ) -> CoreResult<()> {
        let value = value.into();
        let col_spec = self.col_spec(txn)?;
        validate_value(&col_spec, &value)?;
        with_tree(txn, self.table, self.key, self.col, |alloc, tree| {
            match tree {
                ElemTree::Int(tree) => {
                    tree.set(alloc, index, value_to_elem_int(&col_spec, &value))
                }
                ElemTree::Str(tree) => {
                    tree.set(alloc, index, value_to_str_elem(&col_spec, &value))
                }
            }
        })?;
        let table_name = txn.table_name(self.table)?;
        let wire = txn.value_to_wire(&col_spec, &value)?;
        txn.record(Instruction::ListSet {
            table: table_name,
            key: self.key.value(),
            column: col_spec.name.clone(),
            index: index as u32,
            value: wire,
        });
        txn.bump_content_version();
        Ok(())
    }

    /// Removes the element at `index`.
    ///
    /// # Errors
    ///
    /// Fails on a bad index.
    pub fn remove(&self, txn: &mut WriteTransaction<'_>, index: usize) -> CoreResult<()> {
        let col_spec = self.col_spec(txn)?;
        with_tree(txn, self.table, self.key, self.col, |alloc, tree| {
            match tree {
                ElemTree::Int(tree) => tree.erase(alloc, index),
                ElemTree::Str(tree) => tree.erase(alloc, index),
            }
        })?;
        let table_name = txn.table_name(self.table)?;
        txn.record(Instruction::ListErase {
            table: table_name,
            key: self.key.value(),
            column: col_spec.name.clone(),
            index: index as u32,
        });
        txn.bump_content_version();
        Ok(())
    }

    /// Removes every element, erasing backwards.
    ///
    /// # Errors
    ///
    /// Fails on load or store errors.
    pub fn clear(&self, txn: &mut WriteTransaction<'_>) -> CoreResult<()> {
        let col_spec = self.col_spec(txn)?;
        with_tree(txn, self.table, self.key, self.col, |alloc, tree| {
            match tree {
                ElemTree::Int(tree) => {
                    let size = tree.size(alloc)?;
                    for index in (0..size).rev() {
                        tree.erase(alloc, index)?;
                    }
                }
                ElemTree::Str(tree) => {
                    let size = tree.size(alloc)?;
                    for index in (0..size).rev() {
                        tree.erase(alloc, index)?;
                    }
                }
            }
            Ok(())
        })?;
        let table_name = txn.table_name(self.table)?;
        txn.record(Instruction::Clear {
            table: table_name,
            key: self.key.value(),
            column: col_spec.name.clone(),
        });
        txn.bump_content_version();
        Ok(())
    }

    /// Minimum element of a numeric list, ignoring nulls.
    ///
    /// # Errors
    ///
    /// Fails if the element type is not numeric.
    pub fn min(&self, txn: &mut Transaction) -> CoreResult<Option<i64>> {
        Ok(self.numeric_values(txn)?.into_iter().min())
    }

    /// Maximum element of a numeric list, ignoring nulls.
    ///
    /// # Errors
    ///
    /// Fails if the element type is not numeric.
    pub fn max(&self, txn: &mut Transaction) -> CoreResult<Option<i64>> {
        Ok(self.numeric_values(txn)?.into_iter().max())
    }

    /// Sum of a numeric list, ignoring nulls.
    ///
    /// # Errors
    ///
    /// Fails if the element type is not numeric.
    pub fn sum(&self, txn: &mut Transaction) -> CoreResult<i64> {
        Ok(self.numeric_values(txn)?.into_iter().sum())
    }

    /// Average of a numeric list, ignoring nulls.
    ///
    /// # Errors
    ///
    /// Fails if the element type is not numeric.
    pub fn avg(&self, txn: &mut Transaction) -> CoreResult<Option<f64>> {
        let values = self.numeric_values(txn)?;
        if values.is_empty() {
            return Ok(None);
        }
        let sum: i64 = values.iter().sum();
        Ok(Some(sum as f64 / values.len() as f64))
    }

    fn numeric_values(&self, txn: &mut Transaction) -> CoreResult<Vec<i64>> {
        let col_spec = self.col_spec(txn)?;
        if col_spec.col_type != ColumnType::Int {
            return Err(CoreError::TypeMismatch {
                column: col_spec.name,
                message: "aggregate requires a numeric element type".into(),
            });
        }
        Ok(self
            .values(txn)?
            .into_iter()
            .filter_map(|value| value.as_int())
            .collect())
    }

    /// Indices that would sort the list.
    ///
    /// Ties are broken by ascending index, so equal elements keep their
    /// minimum index first and the result is deterministic for any sort
    /// algorithm.
    ///
    /// # Errors
    ///
    /// Fails on load errors.
    pub fn sorted_indices(
        &self,
        txn: &mut Transaction,
        ascending: bool,
    ) -> CoreResult<Vec<usize>> {
        let values = self.values(txn)?;
        let mut indices: Vec<usize> = (0..values.len()).collect();
        indices.sort_by(|&a, &b| {
            let ord = values[a].cmp(&values[b]);
            let ord = if ascending { ord } else { ord.reverse() };
            ord.then(a.cmp(&b))
        });
        Ok(indices)
    }

    /// Indices of the first occurrence of each distinct element.
    ///
    /// With `order` given (a permutation as from
    /// [`List::sorted_indices`]), the result follows that order.
    /// Without it, the result is restored to ascending-index order.
    ///
    /// # Errors
    ///
    /// Fails on load errors.
    pub fn distinct_indices(
        &self,
        txn: &mut Transaction,
        order: Option<&[usize]>,
    ) -> CoreResult<Vec<usize>> {
        let values = self.values(txn)?;
        // First occurrence is the minimum index of each equivalence
        // class, so `distinct` is deterministic regardless of how the
        // ordering permutation was produced.
        let mut min_index: std::collections::BTreeMap<&Value, usize> =
            std::collections::BTreeMap::new();
        for (index, value) in values.iter().enumerate() {
            min_index.entry(value).or_insert(index);
        }
        match order {
            Some(order) => {
                let mut emitted = std::collections::BTreeSet::new();
                let mut result = Vec::new();
                for &index in order {
                    let representative = min_index[&values[index]];
                    if emitted.insert(representative) {
                        result.push(representative);
                    }
                }
                Ok(result)
            }
            None => {
                let mut result: Vec<usize> = min_index.values().copied().collect();
                result.sort_unstable();
                Ok(result)
            }
        }
    }
}

/// An ordered list of links with tombstone hiding.
///
/// Unresolved (tombstone) keys stay stored but are invisible: the
/// user-facing size and indices skip them. The sorted vector of
/// tombstone positions is cached per content version, giving O(log k)
/// index translation.
#[derive(Debug)]
pub struct LinkList {
    table: TableKey,
    key: ObjKey,
    col: ColKey,
    tombstones: RefCell<(u64, Vec<usize>)>,
}

impl LinkList {
    pub(crate) fn new(table: TableKey, key: ObjKey, col: ColKey) -> Self {
        Self {
            table,
            key,
            col,
            tombstones: RefCell::new((u64::MAX, Vec::new())),
        }
    }

    fn col_spec(&self, txn: &mut Transaction) -> CoreResult<ColumnSpec> {
        Ok(txn.spec(self.table)?.column(self.col)?.clone())
    }

    fn target_table(&self, txn: &mut Transaction) -> CoreResult<TableKey> {
        Ok(self
            .col_spec(txn)?
            .target_table
            .expect("link column has target"))
    }

    fn words(&self, txn: &mut Transaction) -> CoreResult<Vec<i64>> {
        let root = collection_root(txn, self.table, self.key, self.col)?;
        if root.is_null() {
            return Ok(Vec::new());
        }
        let alloc = txn.db.alloc.lock();
        let tree: BPlusTree<IntLeaf> = BPlusTree::attach(root);
        tree.to_vec(&alloc)
    }

    /// Refreshes the cached tombstone position vector when the
    /// transaction has mutated.
    fn refresh_tombstones(&self, txn: &mut Transaction) -> CoreResult<()> {
        let current = txn.content_version();
        if self.tombstones.borrow().0 == current {
            return Ok(());
        }
        let positions: Vec<usize> = self
            .words(txn)?
            .iter()
            .enumerate()
            .filter(|(_, &word)| {
                decode_link(word).is_some_and(|key| key.is_unresolved())
            })
            .map(|(i, _)| i)
            .collect();
        *self.tombstones.borrow_mut() = (current, positions);
        Ok(())
    }

    fn virtual_to_real(&self, virtual_index: usize) -> usize {
        let tombstones = self.tombstones.borrow();
        let positions = &tombstones.1;
        let mut real = virtual_index;
        loop {
            let skipped = positions.partition_point(|&p| p <= real);
            let next = virtual_index + skipped;
            if next == real {
                return real;
            }
            real = next;
        }
    }

    fn real_to_virtual(&self, real_index: usize) -> usize {
        let tombstones = self.tombstones.borrow();
        real_index - tombstones.1.partition_point(|&p| p < real_index)
    }

    /// User-visible size: stored entries minus hidden tombstones.
    ///
    /// # Errors
    ///
    /// Fails on load errors.
    pub fn size(&self, txn: &mut Transaction) -> CoreResult<usize> {
        self.refresh_tombstones(txn)?;
        let total = self.words(txn)?.len();
        Ok(total - self.tombstones.borrow().1.len())
    }

    /// The target key at user-visible `index`.
    ///
    /// # Errors
    ///
    /// Fails if `index` is out of bounds.
    pub fn get(&self, txn: &mut Transaction, index: usize) -> CoreResult<ObjKey> {
        self.refresh_tombstones(txn)?;
        let size = self.size(txn)?;
        if index >= size {
            return Err(CoreError::ListIndexOutOfBounds { index, size });
        }
        let real = self.virtual_to_real(index);
        let words = self.words(txn)?;
        decode_link(words[real]).ok_or(CoreError::ListIndexOutOfBounds { index, size })
    }

    /// All user-visible target keys, in order.
    ///
    /// # Errors
    ///
    /// Fails on load errors.
    pub fn keys(&self, txn: &mut Transaction) -> CoreResult<Vec<ObjKey>> {
        Ok(self
            .words(txn)?
            .into_iter()
            .filter_map(decode_link)
            .filter(|key| !key.is_unresolved())
            .collect())
    }

    /// True if the list currently hides any unresolved keys.
    ///
    /// # Errors
    ///
    /// Fails on load errors.
    pub fn has_unresolved(&self, txn: &mut Transaction) -> CoreResult<bool> {
        let root = collection_root(txn, self.table, self.key, self.col)?;
        if root.is_null() {
            return Ok(false);
        }
        let alloc = txn.db.alloc.lock();
        let tree: BPlusTree<IntLeaf> = BPlusTree::attach(root);
        tree.context_flag(&alloc)
    }

    /// Inserts a link to `target` at user-visible `index`.
    ///
    /// # Errors
    ///
    /// Fails if the target does not exist or the index is bad.
    pub fn insert(
        &self,
        txn: &mut WriteTransaction<'_>,
        index: usize,
        target: ObjKey,
    ) -> CoreResult<()> {
        self.refresh_tombstones(txn)?;
        let size = self.size(txn)?;
        if index > size {
            return Err(CoreError::ListIndexOutOfBounds { index, size });
        }
        let target_table = self.target_table(txn)?;
        if !txn.object_exists(target_table, target)? {
            return Err(CoreError::KeyNotFound(target));
        }
        let real = self.virtual_to_real(index);

        // Backlink before the forward write.
        let backlink_ndx = txn.find_backlink_col(target_table, self.table, self.col)?;
        txn.backlink_add(target_table, target, backlink_ndx, self.key)?;

        with_tree(txn, self.table, self.key, self.col, |alloc, tree| {
            match tree {
                ElemTree::Int(tree) => tree.insert(alloc, real, encode_link(Some(target))),
                ElemTree::Str(_) => unreachable!("link lists use packed leaves"),
            }
        })?;

        let table_name = txn.table_name(self.table)?;
        let target_name = txn.table_name(target_table)?;
        let col_spec = self.col_spec(txn)?;
        txn.record(Instruction::ListInsert {
            table: table_name,
            key: self.key.value(),
            column: col_spec.name,
            index: index as u32,
            value: terndb_changeset::WireValue::Link {
                table: target_name,
                key: target.value(),
            },
        });
        txn.bump_content_version();
        Ok(())
    }

    /// Appends a link to `target`.
    ///
    /// # Errors
    ///
    /// Fails if the target does not exist.
    pub fn push(&self, txn: &mut WriteTransaction<'_>, target: ObjKey) -> CoreResult<()> {
        let size = self.size(txn)?;
        self.insert(txn, size, target)
    }

    /// Removes the link at user-visible `index`, cascading if this was
    /// the last strong backlink of the target.
    ///
    /// # Errors
    ///
    /// Fails on a bad index.
    pub fn remove(&self, txn: &mut WriteTransaction<'_>, index: usize) -> CoreResult<()> {
        self.refresh_tombstones(txn)?;
        let size = self.size(txn)?;
        if index >= size {
            return Err(CoreError::ListIndexOutOfBounds { index, size });
        }
        let real = self.virtual_to_real(index);
        let words = self.words(txn)?;
        let target = decode_link(words[real]).expect("visible entries are links");
        let target_table = self.target_table(txn)?;

        let mut cascade = CascadeState::default();
        txn.on_link_removed(
            self.table,
            self.key,
            self.col,
            target_table,
            target,
            &mut cascade,
        )?;
        with_tree(txn, self.table, self.key, self.col, |alloc, tree| {
            match tree {
                ElemTree::Int(tree) => tree.erase(alloc, real),
                ElemTree::Str(_) => unreachable!("link lists use packed leaves"),
            }
        })?;

        let table_name = txn.table_name(self.table)?;
        let col_spec = self.col_spec(txn)?;
        txn.record(Instruction::ListErase {
            table: table_name,
            key: self.key.value(),
            column: col_spec.name,
            index: index as u32,
        });
        txn.bump_content_version();
        txn.drain_cascade(cascade)?;
        Ok(())
    }

    /// Removes every link. Entries are nullified back-to-front before
    /// erasure so the backlink bookkeeping observes each removal, then
    /// strong columns cascade.
    ///
    /// # Errors
    ///
    /// Fails on load or store errors.
    pub fn clear(&self, txn: &mut WriteTransaction<'_>) -> CoreResult<()> {
        self.refresh_tombstones(txn)?;
        let words = self.words(txn)?;
        let target_table = self.target_table(txn)?;

        let mut cascade = CascadeState::default();
        for real in (0..words.len()).rev() {
            if let Some(target) = decode_link(words[real]) {
                txn.on_link_removed(
                    self.table,
                    self.key,
                    self.col,
                    target_table,
                    target,
                    &mut cascade,
                )?;
            }
            with_tree(txn, self.table, self.key, self.col, |alloc, tree| {
                match tree {
                    ElemTree::Int(tree) => {
                        tree.set(alloc, real, encode_link(None))?;
                        tree.erase(alloc, real)
                    }
                    ElemTree::Str(_) => unreachable!("link lists use packed leaves"),
                }
            })?;
        }
        // No tombstones remain in an empty list.
        with_tree(txn, self.table, self.key, self.col, |alloc, tree| {
            match tree {
                ElemTree::Int(tree) => tree.set_context_flag(alloc, false),
                ElemTree::Str(_) => unreachable!("link lists use packed leaves"),
            }
        })?;

        let table_name = txn.table_name(self.table)?;
        let col_spec = self.col_spec(txn)?;
        txn.record(Instruction::Clear {
            table: table_name,
            key: self.key.value(),
            column: col_spec.name,
        });
        txn.bump_content_version();
        txn.drain_cascade(cascade)?;
        Ok(())
    }
}

/// An unordered collection of unique values.
///
/// Elements are kept in sorted encoded order so membership tests and
/// the on-disk form are deterministic.
#[derive(Debug, Clone, Copy)]
pub struct Set {
    table: TableKey,
    key: ObjKey,
    col: ColKey,
}

impl Set {
    pub(crate) fn new(table: TableKey, key: ObjKey, col: ColKey) -> Self {
        Self { table, key, col }
    }

    fn col_spec(&self, txn: &mut Transaction) -> CoreResult<ColumnSpec> {
        Ok(txn.spec(self.table)?.column(self.col)?.clone())
    }

    /// Number of elements.
    ///
    /// # Errors
    ///
    /// Fails on load errors.
    pub fn size(&self, txn: &mut Transaction) -> CoreResult<usize> {
        Ok(self.values(txn)?.len())
    }

    /// Every element, in sorted order.
    ///
    /// # Errors
    ///
    /// Fails on load errors.
    pub fn values(&self, txn: &mut Transaction) -> CoreResult<Vec<Value>> {
        List::new(self.table, self.key, self.col).values(txn)
    }

    /// True if the set holds `value`.
    ///
    /// # Errors
    ///
    /// Fails on load errors.
    pub fn contains(&self, txn: &mut Transaction, value: &Value) -> CoreResult<bool> {
        Ok(self.values(txn)?.binary_search(value).is_ok())
    }

    /// Inserts `value`. Returns false if it was already present.
    ///
    /// # Errors
    ///
    /// Fails on validation errors.
    pub fn insert(
        &self,
        txn: &mut WriteTransaction<'_>,
        value: impl Into<Value>,
    ) -> CoreResult<bool> {
        let value = value.into();
        let col_spec = self.col_spec(txn)?;
        validate_value(&col_spec, &value)?;
        let values = self.values(txn)?;
        let position = match values.binary_search(&value) {
            Ok(_) => return Ok(false),
            Err(position) => position,
        };

        if col_spec.col_type == ColumnType::Link {
            let target = value.as_link().ok_or_else(|| CoreError::TypeMismatch {
                column: col_spec.name.clone(),
                message: "link sets hold links".into(),
            })?;
            let target_table = col_spec.target_table.expect("link column has target");
            if !txn.object_exists(target_table, target)? {
                return Err(CoreError::KeyNotFound(target));
            }
            let backlink_ndx = txn.find_backlink_col(target_table, self.table, self.col)?;
            txn.backlink_add(target_table, target, backlink_ndx, self.key)?;
        }

        with_tree(txn, self.table, self.key, self.col, |alloc, tree| {
            match tree {
                ElemTree::Int(tree) => {
                    tree.insert(alloc, position, value_to_elem_int(&col_spec, &value))
                }
                ElemTree::Str(tree) => {
                    tree.insert(alloc, position, value_to_str_elem(&col_spec, &value))
                }
            }
        })?;

        let table_name = txn.table_name(self.table)?;
        let wire = txn.value_to_wire(&col_spec, &value)?;
        txn.record(Instruction::SetInsert {
            table: table_name,
            key: self.key.value(),
            column: col_spec.name.clone(),
            value: wire,
        });
        txn.bump_content_version();
        Ok(true)
    }

    /// Erases `value`. Returns false if it was absent.
    ///
    /// # Errors
    ///
    /// Fails on load or store errors.
    pub fn erase(
        &self,
        txn: &mut WriteTransaction<'_>,
        value: impl Into<Value>,
    ) -> CoreResult<bool> {
        let value = value.into();
        let col_spec = self.col_spec(txn)?;
        let values = self.values(txn)?;
        let position = match values.binary_search(&value) {
            Ok(position) => position,
            Err(_) => return Ok(false),
        };

        let mut cascade = CascadeState::default();
        if col_spec.col_type == ColumnType::Link {
            let target = value.as_link().expect("stored link value");
            let target_table = col_spec.target_table.expect("link column has target");
            txn.on_link_removed(
                self.table,
                self.key,
                self.col,
                target_table,
                target,
                &mut cascade,
            )?;
        }

        with_tree(txn, self.table, self.key, self.col, |alloc, tree| {
            match tree {
                ElemTree::Int(tree) => tree.erase(alloc, position),
                ElemTree::Str(tree) => tree.erase(alloc, position),
            }
        })?;

        let table_name = txn.table_name(self.table)?;
        let wire = txn.value_to_wire(&col_spec, &value)?;
        txn.record(Instruction::SetErase {
            table: table_name,
            key: self.key.value(),
            column: col_spec.name.clone(),
            value: wire,
        });
        txn.bump_content_version();
        txn.drain_cascade(cascade)?;
        Ok(true)
    }
}

/// A string-keyed dictionary.
///
/// The cell holds a two-child parent: a sorted key tree and an aligned
/// value tree.
#[derive(Debug, Clone, Copy)]
pub struct Dictionary {
    table: TableKey,
    key: ObjKey,
    col: ColKey,
}

impl Dictionary {
    pub(crate) fn new(table: TableKey, key: ObjKey, col: ColKey) -> Self {
        Self { table, key, col }
    }

    fn col_spec(&self, txn: &mut Transaction) -> CoreResult<ColumnSpec> {
        Ok(txn.spec(self.table)?.column(self.col)?.clone())
    }

    /// Loads the key and value roots, creating empty trees on demand in
    /// a write context.
    fn roots(&self, txn: &mut Transaction, create: bool) -> CoreResult<Option<(Ref, Ref, Ref)>> {
        let root = collection_root(txn, self.table, self.key, self.col)?;
        if root.is_null() {
            if !create {
                return Ok(None);
            }
            let (parent_ref, keys_ref, values_ref) = {
                let mut alloc = txn.db.alloc.lock();
                let keys: BPlusTree<StrLeaf> = BPlusTree::create(&mut alloc)?;
                let values: BPlusTree<IntLeaf> = BPlusTree::create(&mut alloc)?;
                let mut parent = Array::new(true);
                parent.push(keys.root_ref().offset() as i64);
                parent.push(values.root_ref().offset() as i64);
                let parent_ref = parent.store(&mut alloc)?;
                (parent_ref, keys.root_ref(), values.root_ref())
            };
            set_collection_root(txn, self.table, self.key, self.col, parent_ref)?;
            return Ok(Some((parent_ref, keys_ref, values_ref)));
        }
        let alloc = txn.db.alloc.lock();
        let parent = Array::load(&alloc, root)?;
        Ok(Some((root, parent.get_ref(0), parent.get_ref(1))))
    }

    fn store_roots(
        &self,
        txn: &mut Transaction,
        parent_ref: Ref,
        keys_root: Ref,
        values_root: Ref,
    ) -> CoreResult<()> {
        let new_parent = {
            let mut alloc = txn.db.alloc.lock();
            let mut parent = Array::load(&alloc, parent_ref)?;
            parent.set(0, keys_root.offset() as i64);
            parent.set(1, values_root.offset() as i64);
            parent.store(&mut alloc)?
        };
        set_collection_root(txn, self.table, self.key, self.col, new_parent)
    }

    /// All dictionary keys, sorted.
    ///
    /// # Errors
    ///
    /// Fails on load errors.
    pub fn keys(&self, txn: &mut Transaction) -> CoreResult<Vec<String>> {
        let Some((_, keys_root, _)) = self.roots(txn, false)? else {
            return Ok(Vec::new());
        };
        let alloc = txn.db.alloc.lock();
        let keys: BPlusTree<StrLeaf> = BPlusTree::attach(keys_root);
        Ok(keys
            .to_vec(&alloc)?
            .into_iter()
            .map(|entry| String::from_utf8_lossy(&entry.unwrap_or_default()).into_owned())
            .collect())
    }

    /// Number of entries.
    ///
    /// # Errors
    ///
    /// Fails on load errors.
    pub fn len(&self, txn: &mut Transaction) -> CoreResult<usize> {
        let Some((_, keys_root, _)) = self.roots(txn, false)? else {
            return Ok(0);
        };
        let alloc = txn.db.alloc.lock();
        let keys: BPlusTree<StrLeaf> = BPlusTree::attach(keys_root);
        keys.size(&alloc)
    }

    /// True if the dictionary has no entries.
    ///
    /// # Errors
    ///
    /// Fails on load errors.
    pub fn is_empty(&self, txn: &mut Transaction) -> CoreResult<bool> {
        Ok(self.len(txn)? == 0)
    }

    /// The value stored under `dict_key`, if any.
    ///
    /// # Errors
    ///
    /// Fails on load errors.
    pub fn get(&self, txn: &mut Transaction, dict_key: &str) -> CoreResult<Option<Value>> {
        let Some((_, keys_root, values_root)) = self.roots(txn, false)? else {
            return Ok(None);
        };
        let col_spec = self.col_spec(txn)?;
        let alloc = txn.db.alloc.lock();
        let keys: BPlusTree<StrLeaf> = BPlusTree::attach(keys_root);
        let entries = keys.to_vec(&alloc)?;
        let position = entries
            .binary_search_by(|entry| entry.as_deref().unwrap_or_default().cmp(dict_key.as_bytes()));
        let Ok(position) = position else {
            return Ok(None);
        };
        let values: BPlusTree<IntLeaf> = BPlusTree::attach(values_root);
        Ok(Some(elem_to_value(&col_spec, values.get(&alloc, position)?)))
    }

    /// Inserts or overwrites the entry under `dict_key`.
    ///
    /// # Errors
    ///
    /// Fails on validation errors.
    pub fn insert(
        &self,
        txn: &mut WriteTransaction<'_>,
        dict_key: &str,
        value: impl Into<Value>,
    ) -> CoreResult<()> {
        let value = value.into();
        let col_spec = self.col_spec(txn)?;
        validate_value(&col_spec, &value)?;
        if is_str_elem(&col_spec) {
            return Err(CoreError::invalid_operation(
                "string-valued dictionaries are not supported",
            ));
        }

        let previous = self.get(txn, dict_key)?;

        // Backlink bookkeeping precedes the forward write.
        let mut cascade = CascadeState::default();
        if col_spec.col_type == ColumnType::Link {
            let target_table = col_spec.target_table.expect("link column has target");
            if let Some(target) = value.as_link() {
                if !txn.object_exists(target_table, target)? {
                    return Err(CoreError::KeyNotFound(target));
                }
            }
            if let Some(Value::Link(old_target)) = previous {
                if Some(old_target) != value.as_link() {
                    txn.on_link_removed(
                        self.table,
                        self.key,
                        self.col,
                        target_table,
                        old_target,
                        &mut cascade,
                    )?;
                }
            }
            if let Some(target) = value.as_link() {
                let backlink_ndx = txn.find_backlink_col(target_table, self.table, self.col)?;
                txn.backlink_add(target_table, target, backlink_ndx, self.key)?;
            }
        }

        let (parent_ref, keys_root, values_root) =
            self.roots(txn, true)?.expect("created on demand");
        let word = value_to_elem_int(&col_spec, &value);

        let (new_keys_root, new_values_root) = {
            let mut alloc = txn.db.alloc.lock();
            let mut keys: BPlusTree<StrLeaf> = BPlusTree::attach(keys_root);
            let mut values: BPlusTree<IntLeaf> = BPlusTree::attach(values_root);
            let entries = keys.to_vec(&alloc)?;
            match entries.binary_search_by(|entry| {
                entry.as_deref().unwrap_or_default().cmp(dict_key.as_bytes())
            }) {
                Ok(position) => {
                    values.set(&mut alloc, position, word)?;
                }
                Err(position) => {
                    keys.insert(&mut alloc, position, Some(dict_key.as_bytes().to_vec()))?;
                    values.insert(&mut alloc, position, word)?;
                }
            }
            (keys.root_ref(), values.root_ref())
        };
        self.store_roots(txn, parent_ref, new_keys_root, new_values_root)?;

        let table_name = txn.table_name(self.table)?;
        let wire = txn.value_to_wire(&col_spec, &value)?;
        txn.record(Instruction::DictInsert {
            table: table_name,
            key: self.key.value(),
            column: col_spec.name.clone(),
            dict_key: dict_key.to_owned(),
            value: wire,
        });
        txn.bump_content_version();
        txn.drain_cascade(cascade)?;
        Ok(())
    }

    /// Erases the entry under `dict_key`. Returns false if absent.
    ///
    /// # Errors
    ///
    /// Fails on load or store errors.
    pub fn erase(&self, txn: &mut WriteTransaction<'_>, dict_key: &str) -> CoreResult<bool> {
        let Some((parent_ref, keys_root, values_root)) = self.roots(txn, false)? else {
            return Ok(false);
        };
        let col_spec = self.col_spec(txn)?;
        let previous = self.get(txn, dict_key)?;
        if previous.is_none() {
            return Ok(false);
        }

        let mut cascade = CascadeState::default();
        if let Some(Value::Link(old_target)) = previous {
            let target_table = col_spec.target_table.expect("link column has target");
            txn.on_link_removed(
                self.table,
                self.key,
                self.col,
                target_table,
                old_target,
                &mut cascade,
            )?;
        }

        let (new_keys_root, new_values_root) = {
            let mut alloc = txn.db.alloc.lock();
            let mut keys: BPlusTree<StrLeaf> = BPlusTree::attach(keys_root);
            let mut values: BPlusTree<IntLeaf> = BPlusTree::attach(values_root);
            let entries = keys.to_vec(&alloc)?;
            if let Ok(position) = entries.binary_search_by(|entry| {
                entry.as_deref().unwrap_or_default().cmp(dict_key.as_bytes())
            }) {
                keys.erase(&mut alloc, position)?;
                values.erase(&mut alloc, position)?;
            }
            (keys.root_ref(), values.root_ref())
        };
        self.store_roots(txn, parent_ref, new_keys_root, new_values_root)?;

        let table_name = txn.table_name(self.table)?;
        txn.record(Instruction::DictErase {
            table: table_name,
            key: self.key.value(),
            column: col_spec.name.clone(),
            dict_key: dict_key.to_owned(),
        });
        txn.bump_content_version();
        txn.drain_cascade(cascade)?;
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::Db;
    use crate::schema::{ColumnSpec, TableType};

    fn list_fixture(db: &Db) -> (crate::Table, ColKey) {
        let mut txn = db.begin_write().unwrap();
        let table = txn.add_table("t", TableType::TopLevel).unwrap();
        let col = txn
            .add_column(table.key(), ColumnSpec::int("xs").list())
            .unwrap();
        txn.commit().unwrap();
        (table, col)
    }

    #[test]
    fn list_insert_get_roundtrip() {
        let db = Db::open_in_memory().unwrap();
        let (table, col) = list_fixture(&db);
        let mut txn = db.begin_write().unwrap();
        let obj = table.create_object(&mut txn).unwrap();
        let list = obj.list(&mut txn, col).unwrap();

        list.push(&mut txn, 1i64).unwrap();
        list.push(&mut txn, 2i64).unwrap();
        list.insert(&mut txn, 1, 99i64).unwrap();

        assert_eq!(list.size(&mut txn).unwrap(), 3);
        assert_eq!(list.get(&mut txn, 0).unwrap(), Value::Int(1));
        assert_eq!(list.get(&mut txn, 1).unwrap(), Value::Int(99));
        assert_eq!(list.get(&mut txn, 2).unwrap(), Value::Int(2));
    }

    #[test]
    fn list_insert_then_erase_restores() {
        let db = Db::open_in_memory().unwrap();
        let (table, col) = list_fixture(&db);
        let mut txn = db.begin_write().unwrap();
        let obj = table.create_object(&mut txn).unwrap();
        let list = obj.list(&mut txn, col).unwrap();
        for v in [10i64, 20, 30] {
            list.push(&mut txn, v).unwrap();
        }
        let before = list.values(&mut txn).unwrap();
        list.insert(&mut txn, 1, 15i64).unwrap();
        list.remove(&mut txn, 1).unwrap();
        assert_eq!(list.values(&mut txn).unwrap(), before);
    }

    #[test]
    fn list_aggregates() {
        let db = Db::open_in_memory().unwrap();
        let (table, col) = list_fixture(&db);
        let mut txn = db.begin_write().unwrap();
        let obj = table.create_object(&mut txn).unwrap();
        let list = obj.list(&mut txn, col).unwrap();
        for v in [5i64, -3, 12, 0] {
            list.push(&mut txn, v).unwrap();
        }
        assert_eq!(list.min(&mut txn).unwrap(), Some(-3));
        assert_eq!(list.max(&mut txn).unwrap(), Some(12));
        assert_eq!(list.sum(&mut txn).unwrap(), 14);
        assert_eq!(list.avg(&mut txn).unwrap(), Some(3.5));
    }

    #[test]
    fn sort_distinct_determinism() {
        let db = Db::open_in_memory().unwrap();
        let (table, col) = list_fixture(&db);
        let mut txn = db.begin_write().unwrap();
        let obj = table.create_object(&mut txn).unwrap();
        let list = obj.list(&mut txn, col).unwrap();
        for v in [3i64, 1, 3, 2, 1, 3] {
            list.push(&mut txn, v).unwrap();
        }

        let sorted = list.sorted_indices(&mut txn, true).unwrap();
        // Values in sorted order: 1,1,2,3,3,3 with ties broken by index.
        assert_eq!(sorted, vec![1, 4, 3, 0, 2, 5]);

        // Distinct keeps the minimum index of each equivalence class.
        let distinct = list.distinct_indices(&mut txn, Some(&sorted)).unwrap();
        assert_eq!(distinct, vec![1, 3, 0]);

        // Without an order the result reverts to ascending index order.
        let unordered = list.distinct_indices(&mut txn, None).unwrap();
        assert_eq!(unordered, vec![0, 1, 3]);
    }

    #[test]
    fn string_list() {
        let db = Db::open_in_memory().unwrap();
        let mut txn = db.begin_write().unwrap();
        let table = txn.add_table("t", TableType::TopLevel).unwrap();
        let col = txn
            .add_column(table.key(), ColumnSpec::string("tags").list().nullable())
            .unwrap();
        let obj = table.create_object(&mut txn).unwrap();
        let list = obj.list(&mut txn, col).unwrap();

        list.push(&mut txn, "alpha").unwrap();
        list.push(&mut txn, Value::Null).unwrap();
        list.push(&mut txn, "gamma").unwrap();

        assert_eq!(list.get(&mut txn, 0).unwrap(), Value::from("alpha"));
        assert_eq!(list.get(&mut txn, 1).unwrap(), Value::Null);
        assert_eq!(list.size(&mut txn).unwrap(), 3);
    }

    fn link_list_fixture(db: &Db) -> (crate::Table, crate::Table, ColKey) {
        let mut txn = db.begin_write().unwrap();
        let targets = txn.add_table("B", TableType::TopLevel).unwrap();
        let origins = txn.add_table("A", TableType::TopLevel).unwrap();
        let col = txn
            .add_column(
                origins.key(),
                ColumnSpec::link("links", targets.key()).list(),
            )
            .unwrap();
        txn.commit().unwrap();
        (origins, targets, col)
    }

    #[test]
    fn link_list_backlinks() {
        let db = Db::open_in_memory().unwrap();
        let (origins, targets, col) = link_list_fixture(&db);
        let mut txn = db.begin_write().unwrap();
        let a0 = origins.create_object(&mut txn).unwrap();
        let b0 = targets.create_object(&mut txn).unwrap();
        let b1 = targets.create_object(&mut txn).unwrap();

        let links = a0.link_list(&mut txn, col).unwrap();
        links.push(&mut txn, b0.key()).unwrap();
        links.push(&mut txn, b1.key()).unwrap();
        links.push(&mut txn, b0.key()).unwrap();

        assert_eq!(b0.backlink_count(&mut txn).unwrap(), 2);
        assert_eq!(b1.backlink_count(&mut txn).unwrap(), 1);

        links.remove(&mut txn, 0).unwrap();
        assert_eq!(b0.backlink_count(&mut txn).unwrap(), 1);
    }

    #[test]
    fn link_list_tombstones_hidden() {
        let db = Db::open_in_memory().unwrap();
        let (origins, targets, col) = link_list_fixture(&db);
        let mut txn = db.begin_write().unwrap();
        let a0 = origins.create_object(&mut txn).unwrap();
        let b: Vec<_> = (0..3)
            .map(|_| targets.create_object(&mut txn).unwrap())
            .collect();
        let links = a0.link_list(&mut txn, col).unwrap();
        for obj in &b {
            links.push(&mut txn, obj.key()).unwrap();
        }

        // The middle target becomes unresolved.
        let k2 = b[1].key();
        targets.invalidate_object(&mut txn, k2).unwrap();

        assert_eq!(links.size(&mut txn).unwrap(), 2);
        assert_eq!(links.get(&mut txn, 0).unwrap(), b[0].key());
        assert_eq!(links.get(&mut txn, 1).unwrap(), b[2].key());
        assert!(links.has_unresolved(&mut txn).unwrap());

        // Resolving brings it back at its old position.
        targets.create_object_with_key(&mut txn, k2).unwrap();
        assert_eq!(links.size(&mut txn).unwrap(), 3);
        assert_eq!(links.get(&mut txn, 1).unwrap(), k2);
        assert!(!links.has_unresolved(&mut txn).unwrap());
    }

    #[test]
    fn link_list_clear_cascades_strong() {
        let db = Db::open_in_memory().unwrap();
        let mut txn = db.begin_write().unwrap();
        let targets = txn.add_table("B", TableType::TopLevel).unwrap();
        let origins = txn.add_table("A", TableType::TopLevel).unwrap();
        let col = txn
            .add_column(
                origins.key(),
                ColumnSpec::link("links", targets.key()).list().strong(),
            )
            .unwrap();

        let a0 = origins.create_object(&mut txn).unwrap();
        let b0 = targets.create_object(&mut txn).unwrap();
        let b1 = targets.create_object(&mut txn).unwrap();
        let links = a0.link_list(&mut txn, col).unwrap();
        links.push(&mut txn, b0.key()).unwrap();
        links.push(&mut txn, b1.key()).unwrap();

        links.clear(&mut txn).unwrap();
        assert_eq!(links.size(&mut txn).unwrap(), 0);
        assert_eq!(targets.object_count(&mut txn).unwrap(), 0);
    }

    #[test]
    fn set_uniqueness() {
        let db = Db::open_in_memory().unwrap();
        let mut txn = db.begin_write().unwrap();
        let table = txn.add_table("t", TableType::TopLevel).unwrap();
        let col = txn
            .add_column(table.key(), ColumnSpec::int("tags").set())
            .unwrap();
        let obj = table.create_object(&mut txn).unwrap();
        let set = obj.set_collection(&mut txn, col).unwrap();

        assert!(set.insert(&mut txn, 5i64).unwrap());
        assert!(set.insert(&mut txn, 3i64).unwrap());
        assert!(!set.insert(&mut txn, 5i64).unwrap());
        assert_eq!(set.size(&mut txn).unwrap(), 2);
        assert!(set.contains(&mut txn, &Value::Int(3)).unwrap());

        assert!(set.erase(&mut txn, 3i64).unwrap());
        assert!(!set.erase(&mut txn, 3i64).unwrap());
        assert_eq!(set.size(&mut txn).unwrap(), 1);
    }

    #[test]
    fn dictionary_roundtrip() {
        let db = Db::open_in_memory().unwrap();
        let mut txn = db.begin_write().unwrap();
        let table = txn.add_table("t", TableType::TopLevel).unwrap();
        let col = txn
            .add_column(table.key(), ColumnSpec::int("meta").dictionary().nullable())
            .unwrap();
        let obj = table.create_object(&mut txn).unwrap();
        let dict = obj.dictionary(&mut txn, col).unwrap();

        dict.insert(&mut txn, "limit", 100i64).unwrap();
        dict.insert(&mut txn, "offset", 5i64).unwrap();
        dict.insert(&mut txn, "limit", 200i64).unwrap();

        assert_eq!(dict.len(&mut txn).unwrap(), 2);
        assert_eq!(dict.get(&mut txn, "limit").unwrap(), Some(Value::Int(200)));
        assert_eq!(dict.get(&mut txn, "offset").unwrap(), Some(Value::Int(5)));
        assert_eq!(dict.get(&mut txn, "missing").unwrap(), None);
        assert_eq!(dict.keys(&mut txn).unwrap(), vec!["limit", "offset"]);

        assert!(dict.erase(&mut txn, "limit").unwrap());
        assert!(!dict.erase(&mut txn, "limit").unwrap());
        assert_eq!(dict.len(&mut txn).unwrap(), 1);
    }
}
