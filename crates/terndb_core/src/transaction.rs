//! Versioned transactions over the group of tables.
//!
//! A transaction is a snapshot of the group at one version. Read
//! transactions never block the writer; the single write transaction
//! mutates copy-on-write state and publishes a new version at commit.
//!
//! The group directory and per-table state are cached in the
//! transaction. Every mutation records a changeset instruction, so the
//! history can replay the commit elsewhere.

use crate::alloc::SlabAlloc;
use crate::array::{is_tagged, tag_int, untag_int, Array};
use crate::bptree::{BPlusTree, IntLeaf, StrLeaf};
use crate::cluster::{
    decode_link, default_cell, encode_link, Cell, ClusterTree, BOOL_NULL, INT_NULL,
};
use crate::db::DbInner;
use crate::error::{CoreError, CoreResult, MAX_BINARY_SIZE, MAX_STRING_SIZE};
use crate::group::{load_group, load_table_state, store_group, GroupCache, TableState};
use crate::history::HistoryEntry;
use crate::keys::{ColKey, ObjKey, Ref, TableKey, Version};
use crate::obj::Obj;
use crate::schema::{ColumnAttr, ColumnSpec, ColumnType, TableSpec, TableType};
use crate::table::Table;
use crate::value::Value;
use parking_lot::MutexGuard;
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};
use terndb_changeset::{
    encode_instructions, CollectionKind, Instruction, WireColumnType, WireValue,
};
use tracing::debug;

/// Work list of pending cascade erases.
///
/// Cascades are never processed while another erase is in flight; work
/// is queued here and drained iteratively once the triggering operation
/// has finished.
#[derive(Default)]
pub(crate) struct CascadeState {
    pub(crate) queue: VecDeque<(TableKey, ObjKey)>,
}

/// The common transaction state shared by readers and the writer.
pub struct Transaction {
    pub(crate) db: Arc<DbInner>,
    version: Version,
    pub(crate) group: GroupCache,
    writable: bool,
    /// Bumped on every mutation; object accessors revalidate against it.
    content_version: u64,
    released: bool,
}

impl Transaction {
    pub(crate) fn new(
        db: Arc<DbInner>,
        version: Version,
        top: Ref,
        writable: bool,
    ) -> CoreResult<Self> {
        let group = {
            let alloc = db.alloc.lock();
            load_group(&alloc, top)?
        };
        Ok(Self {
            db,
            version,
            group,
            writable,
            content_version: 0,
            released: false,
        })
    }

    /// The snapshot version of this transaction.
    #[must_use]
    pub fn version(&self) -> Version {
        self.version
    }

    /// The mutation counter used by accessor revalidation.
    #[must_use]
    pub fn content_version(&self) -> u64 {
        self.content_version
    }

    pub(crate) fn bump_content_version(&mut self) {
        self.content_version += 1;
    }

    /// Names of all tables.
    #[must_use]
    pub fn table_names(&self) -> Vec<String> {
        self.group.names.clone()
    }

    /// True if a table with `name` exists.
    #[must_use]
    pub fn has_table(&self, name: &str) -> bool {
        self.group.names.iter().any(|n| n == name)
    }

    /// Looks up a table by name.
    ///
    /// # Errors
    ///
    /// Fails with [`CoreError::NoSuchTable`] if absent.
    pub fn table(&self, name: &str) -> CoreResult<Table> {
        self.group
            .names
            .iter()
            .position(|n| n == name)
            .map(|index| Table::new(TableKey::new(index as u32)))
            .ok_or_else(|| CoreError::NoSuchTable {
                name: name.to_owned(),
            })
    }

    /// The name of a table.
    ///
    /// # Errors
    ///
    /// Fails if the key is stale.
    pub fn table_name(&self, table: TableKey) -> CoreResult<String> {
        self.group
            .names
            .get(table.index() as usize)
            .cloned()
            .ok_or_else(|| CoreError::NoSuchTable {
                name: format!("{table}"),
            })
    }

    pub(crate) fn table_state_with(
        &mut self,
        alloc: &mut SlabAlloc,
        table: TableKey,
    ) -> CoreResult<&mut TableState> {
        let index = table.index();
        if index as usize >= self.group.names.len() {
            return Err(CoreError::NoSuchTable {
                name: format!("{table}"),
            });
        }
        if !self.group.tables.contains_key(&index) {
            let state = load_table_state(alloc, self.group.table_refs[index as usize])?;
            self.group.tables.insert(index, state);
        }
        Ok(self.group.tables.get_mut(&index).expect("just inserted"))
    }

    pub(crate) fn with_state<R>(
        &mut self,
        table: TableKey,
        f: impl FnOnce(&mut SlabAlloc, &mut TableState) -> CoreResult<R>,
    ) -> CoreResult<R> {
        let alloc = Arc::clone(&self.db);
        let mut alloc = alloc.alloc.lock();
        let state = self.table_state_with(&mut alloc, table)?;
        f(&mut alloc, state)
    }

    /// True for the write transaction.
    #[must_use]
    pub fn is_writable(&self) -> bool {
        self.writable
    }

    /// A clone of the table's spec.
    ///
    /// # Errors
    ///
    /// Fails if the table key is stale.
    pub fn spec(&mut self, table: TableKey) -> CoreResult<TableSpec> {
        self.with_state(table, |_, state| Ok(state.spec.clone()))
    }

    /// The table flavor.
    pub(crate) fn table_type(&mut self, table: TableKey) -> CoreResult<TableType> {
        self.with_state(table, |_, state| Ok(state.table_type))
    }

    /// True if `key` names a live row of `table`.
    ///
    /// # Errors
    ///
    /// Fails on load errors.
    pub fn object_exists(&mut self, table: TableKey, key: ObjKey) -> CoreResult<bool> {
        self.with_state(table, |alloc, state| {
            state.ct.contains(alloc, &state.spec, key)
        })
    }

    /// Number of objects in `table`, excluding tombstones.
    ///
    /// # Errors
    ///
    /// Fails on load errors.
    pub fn object_count(&mut self, table: TableKey) -> CoreResult<usize> {
        self.with_state(table, |alloc, state| {
            let mut count = 0usize;
            state.ct.for_each_key(alloc, &state.spec, &mut |key| {
                if !key.is_unresolved() {
                    count += 1;
                }
                true
            })?;
            Ok(count)
        })
    }

    /// All live object keys of `table` in ascending order, excluding
    /// tombstones.
    ///
    /// # Errors
    ///
    /// Fails on load errors.
    pub fn object_keys(&mut self, table: TableKey) -> CoreResult<Vec<ObjKey>> {
        self.with_state(table, |alloc, state| {
            let mut keys = Vec::new();
            state.ct.for_each_key(alloc, &state.spec, &mut |key| {
                if !key.is_unresolved() {
                    keys.push(key);
                }
                true
            })?;
            Ok(keys)
        })
    }

    pub(crate) fn locate(
        &mut self,
        table: TableKey,
        key: ObjKey,
    ) -> CoreResult<Option<(Ref, usize)>> {
        self.with_state(table, |alloc, state| {
            state.ct.locate(alloc, &state.spec, key)
        })
    }

    pub(crate) fn raw_cell(
        &mut self,
        table: TableKey,
        key: ObjKey,
        col_ndx: usize,
    ) -> CoreResult<Cell> {
        self.with_state(table, |alloc, state| {
            if col_ndx >= state.spec.column_count() {
                return Err(CoreError::ColumnIndexOutOfRange {
                    index: col_ndx as u32,
                });
            }
            state.ct.get_cell(alloc, &state.spec, key, col_ndx)
        })
    }

    /// Reads a single-cell column as a [`Value`].
    ///
    /// # Errors
    ///
    /// Fails on an absent key, a bad column, or a collection column.
    pub fn get_value(&mut self, table: TableKey, key: ObjKey, col: ColKey) -> CoreResult<Value> {
        let spec = self.spec(table)?;
        let col_spec = spec.column(col)?.clone();
        if col_spec.is_collection() || col_spec.is_backlink() {
            return Err(CoreError::CollectionTypeMismatch {
                column: col_spec.name,
            });
        }
        let cell = self.raw_cell(table, key, col.index() as usize)?;
        Ok(cell_to_value(&col_spec, &cell))
    }

    /// Number of backlinks to an object across all backlink columns.
    ///
    /// # Errors
    ///
    /// Fails on an absent key.
    pub fn backlink_count(&mut self, table: TableKey, key: ObjKey) -> CoreResult<usize> {
        let spec = self.spec(table)?;
        let mut count = 0usize;
        for (col, _) in spec.backlink_columns() {
            let cell = self.raw_cell(table, key, col.index() as usize)?;
            count += backlink_entries(&cell, &self.db)?.len();
        }
        Ok(count)
    }

    /// Number of backlinks coming through strong link columns.
    ///
    /// # Errors
    ///
    /// Fails on an absent key.
    pub fn strong_backlink_count(&mut self, table: TableKey, key: ObjKey) -> CoreResult<usize> {
        let spec = self.spec(table)?;
        let mut count = 0usize;
        for (col, col_spec) in spec.backlink_columns() {
            let origin_table = col_spec.target_table.expect("backlink has origin table");
            let origin_col = col_spec.backlink_origin.expect("backlink has origin col");
            let origin_spec = self.spec(origin_table)?;
            if !origin_spec.column(origin_col)?.attrs.contains(ColumnAttr::STRONG) {
                continue;
            }
            let cell = self.raw_cell(table, key, col.index() as usize)?;
            count += backlink_entries(&cell, &self.db)?.len();
        }
        Ok(count)
    }

    /// The origin keys recorded in one backlink column of an object.
    ///
    /// # Errors
    ///
    /// Fails on an absent key or a non-backlink column.
    pub fn backlinks(
        &mut self,
        table: TableKey,
        key: ObjKey,
        backlink_col: ColKey,
    ) -> CoreResult<Vec<ObjKey>> {
        let spec = self.spec(table)?;
        if !spec.column(backlink_col)?.is_backlink() {
            return Err(CoreError::invalid_operation("column is not a backlink"));
        }
        let cell = self.raw_cell(table, key, backlink_col.index() as usize)?;
        Ok(backlink_entries(&cell, &self.db)?
            .into_iter()
            .map(ObjKey::new)
            .collect())
    }

    fn release(&mut self) {
        if !self.released {
            self.released = true;
            self.db.release_reader(self.version);
        }
    }
}

impl Drop for Transaction {
    fn drop(&mut self) {
        self.release();
    }
}

/// A snapshot-isolated read transaction.
pub struct ReadTransaction {
    inner: Transaction,
}

impl ReadTransaction {
    pub(crate) fn new(inner: Transaction) -> Self {
        Self { inner }
    }
}

impl std::ops::Deref for ReadTransaction {
    type Target = Transaction;

    fn deref(&self) -> &Transaction {
        &self.inner
    }
}

impl std::ops::DerefMut for ReadTransaction {
    fn deref_mut(&mut self) -> &mut Transaction {
        &mut self.inner
    }
}

/// The exclusive write transaction.
///
/// Holds the in-process writer mutex for its lifetime; the cross-process
/// file lock is taken by [`Db::begin_write`](crate::Db::begin_write)
/// and released when the transaction finishes. Dropping without commit
/// rolls back.
pub struct WriteTransaction<'db> {
    inner: Transaction,
    _guard: MutexGuard<'db, ()>,
    instructions: Vec<Instruction>,
    finished: bool,
}

impl<'db> std::ops::Deref for WriteTransaction<'db> {
    type Target = Transaction;

    fn deref(&self) -> &Transaction {
        &self.inner
    }
}

impl<'db> std::ops::DerefMut for WriteTransaction<'db> {
    fn deref_mut(&mut self) -> &mut Transaction {
        &mut self.inner
    }
}

impl<'db> WriteTransaction<'db> {
    pub(crate) fn new(inner: Transaction, guard: MutexGuard<'db, ()>) -> Self {
        Self {
            inner,
            _guard: guard,
            instructions: Vec::new(),
            finished: false,
        }
    }

    pub(crate) fn record(&mut self, instruction: Instruction) {
        self.instructions.push(instruction);
    }

    /// Adds a table.
    ///
    /// # Errors
    ///
    /// Fails if the name is taken.
    pub fn add_table(&mut self, name: &str, table_type: TableType) -> CoreResult<Table> {
        let table = self.add_table_silent(name, table_type)?;
        self.record(Instruction::AddTable {
            table: name.to_owned(),
            embedded: table_type == TableType::Embedded,
        });
        Ok(table)
    }

    pub(crate) fn add_table_silent(
        &mut self,
        name: &str,
        table_type: TableType,
    ) -> CoreResult<Table> {
        if self.inner.has_table(name) {
            return Err(CoreError::TableExists {
                name: name.to_owned(),
            });
        }
        let mut alloc = self.inner.db.alloc.lock();
        let ct = ClusterTree::create(&mut alloc, &TableSpec::default())?;
        drop(alloc);

        let index = self.inner.group.names.len() as u32;
        self.inner.group.names.push(name.to_owned());
        self.inner.group.table_refs.push(Ref::NULL);
        self.inner.group.tables.insert(
            index,
            TableState {
                spec: TableSpec::default(),
                ct,
                next_key: 0,
                table_type,
                dirty: true,
                indexes: HashMap::new(),
            },
        );
        self.inner.group.dirty = true;
        self.inner.bump_content_version();
        Ok(Table::new(TableKey::new(index)))
    }

    /// Looks up a table, creating it if absent.
    ///
    /// # Errors
    ///
    /// Fails on I/O errors.
    pub fn get_or_add_table(&mut self, name: &str, table_type: TableType) -> CoreResult<Table> {
        match self.inner.table(name) {
            Ok(table) => Ok(table),
            Err(CoreError::NoSuchTable { .. }) => self.add_table(name, table_type),
            Err(err) => Err(err),
        }
    }

    /// Adds a column, creating the paired backlink column on the target
    /// table for link columns.
    ///
    /// # Errors
    ///
    /// Fails on duplicate names or a link column without a target.
    pub fn add_column(&mut self, table: TableKey, col: ColumnSpec) -> CoreResult<ColKey> {
        let key = self.add_column_silent(table, col.clone())?;
        let table_name = self.inner.table_name(table)?;
        self.record(Instruction::AddColumn {
            table: table_name,
            name: col.name.clone(),
            col_type: wire_column_type(col.col_type),
            collection: wire_collection(&col.attrs),
            nullable: col.attrs.contains(ColumnAttr::NULLABLE),
            strong: col.attrs.contains(ColumnAttr::STRONG),
            target_table: match col.target_table {
                Some(target) => self.inner.table_name(target)?,
                None => String::new(),
            },
        });
        Ok(key)
    }

    pub(crate) fn add_column_silent(
        &mut self,
        table: TableKey,
        col: ColumnSpec,
    ) -> CoreResult<ColKey> {
        if col.col_type == ColumnType::Link && col.target_table.is_none() {
            return Err(CoreError::invalid_operation(
                "link column requires a target table",
            ));
        }
        let col_key = self.inner.with_state(table, |alloc, state| {
            if state.spec.column_by_name(&col.name).is_some() {
                return Err(CoreError::invalid_operation(format!(
                    "column exists: {}",
                    col.name
                )));
            }
            let mut ct = state.ct;
            ct.add_column(alloc, &state.spec, &col)?;
            state.ct = ct;
            state.spec.columns.push(col.clone());
            state.dirty = true;
            Ok(ColKey::new(state.spec.column_count() as u32 - 1))
        })?;

        // Every link column gets a backlink column on the target table.
        if col.col_type == ColumnType::Link && !col.attrs.contains(ColumnAttr::BACKLINK) {
            let target = col.target_table.expect("checked above");
            let backlink = ColumnSpec {
                name: format!("!backlink_{}_{}", table.index(), col_key.index()),
                col_type: ColumnType::Link,
                attrs: ColumnAttr::BACKLINK,
                target_table: Some(table),
                backlink_origin: Some(col_key),
            };
            self.inner.with_state(target, |alloc, state| {
                let mut ct = state.ct;
                ct.add_column(alloc, &state.spec, &backlink)?;
                state.ct = ct;
                state.spec.columns.push(backlink.clone());
                state.dirty = true;
                Ok(())
            })?;
        }
        self.inner.bump_content_version();
        Ok(col_key)
    }

    /// Removes a column and its data.
    ///
    /// Removing a link column also removes the paired backlink column
    /// on the target table. Schema removal is a local operation: it is
    /// not recorded in the changeset, matching the additive-only schema
    /// rule for synchronized files.
    ///
    /// # Errors
    ///
    /// Fails if the column does not exist or is a backlink column.
    pub fn remove_column(&mut self, table: TableKey, col: ColKey) -> CoreResult<()> {
        let spec = self.inner.spec(table)?;
        let col_spec = spec.column(col)?.clone();
        if col_spec.is_backlink() {
            return Err(CoreError::invalid_operation(
                "backlink columns are engine-managed",
            ));
        }
        if col_spec.col_type == ColumnType::Link {
            let target = col_spec.target_table.expect("link has target");
            let backlink_ndx = self.find_backlink_col(target, table, col)?;
            self.remove_column_raw(target, backlink_ndx)?;
            // Backlink origins referencing later columns of this table
            // shift down by one.
            self.shift_backlink_origins(table, col.index())?;
        }
        self.remove_column_raw(table, col.index() as usize)?;
        self.inner.bump_content_version();
        Ok(())
    }

    fn remove_column_raw(&mut self, table: TableKey, col_ndx: usize) -> CoreResult<()> {
        self.inner.with_state(table, |alloc, state| {
            let mut ct = state.ct;
            ct.remove_column(alloc, &state.spec, col_ndx)?;
            state.ct = ct;
            state.spec.columns.remove(col_ndx);
            state.indexes.remove(&(col_ndx as u32));
            state.dirty = true;
            Ok(())
        })
    }

    fn shift_backlink_origins(&mut self, origin_table: TableKey, removed_col: u32) -> CoreResult<()> {
        let table_count = self.inner.group.names.len() as u32;
        for index in 0..table_count {
            let key = TableKey::new(index);
            self.inner.with_state(key, |_, state| {
                for col in &mut state.spec.columns {
                    if col.is_backlink()
                        && col.target_table == Some(origin_table)
                    {
                        if let Some(origin) = col.backlink_origin {
                            if origin.index() > removed_col {
                                col.backlink_origin = Some(ColKey::new(origin.index() - 1));
                                state.dirty = true;
                            }
                        }
                    }
                }
                Ok(())
            })?;
        }
        Ok(())
    }

    /// Creates an object with a fresh key.
    ///
    /// # Errors
    ///
    /// Fails on embedded tables; their objects are created through
    /// [`WriteTransaction::create_linked_object`].
    pub fn create_object(&mut self, table: TableKey) -> CoreResult<Obj> {
        if self.inner.table_type(table)? == TableType::Embedded {
            return Err(CoreError::embedded_violation(
                "embedded objects are created through their parent link",
            ));
        }
        let key = self.inner.with_state(table, |_, state| {
            let key = ObjKey::new(state.next_key);
            state.next_key += 1;
            Ok(key)
        })?;
        self.create_object_raw(table, key)?;
        let table_name = self.inner.table_name(table)?;
        self.record(Instruction::CreateObject {
            table: table_name,
            key: key.value(),
        });
        Ok(Obj::new(table, key))
    }

    /// Creates an object with a caller-chosen key, resolving a matching
    /// tombstone if one exists.
    ///
    /// # Errors
    ///
    /// Fails if the key is taken.
    pub fn create_object_with_key(&mut self, table: TableKey, key: ObjKey) -> CoreResult<Obj> {
        if key.is_unresolved() {
            return Err(CoreError::invalid_operation(
                "cannot create an object with an unresolved key",
            ));
        }
        let tombstone = key.as_unresolved();
        if self.inner.object_exists(table, tombstone)? {
            self.resolve_tombstone(table, tombstone)?;
        } else {
            self.create_object_raw(table, key)?;
        }
        self.inner.with_state(table, |_, state| {
            state.next_key = state.next_key.max(key.value() + 1);
            Ok(())
        })?;
        let table_name = self.inner.table_name(table)?;
        self.record(Instruction::CreateObject {
            table: table_name,
            key: key.value(),
        });
        Ok(Obj::new(table, key))
    }

    fn create_object_raw(&mut self, table: TableKey, key: ObjKey) -> CoreResult<()> {
        self.inner.with_state(table, |alloc, state| {
            let mut ct = state.ct;
            ct.insert(alloc, &state.spec, key)?;
            state.ct = ct;
            state.dirty = true;
            // Indexed columns gain the default value.
            let defaults: Vec<(u32, Value)> = state
                .spec
                .columns
                .iter()
                .enumerate()
                .filter(|(_, c)| c.attrs.contains(ColumnAttr::INDEXED))
                .map(|(i, c)| (i as u32, cell_to_value(c, &default_cell(c))))
                .collect();
            for (col_ndx, value) in defaults {
                if let Some(index) = state.indexes.get_mut(&col_ndx) {
                    index.entry(value).or_default().push(key.value());
                }
            }
            Ok(())
        })?;
        self.inner.bump_content_version();
        Ok(())
    }

    /// Creates an object in the embedded table targeted by a link
    /// column, linking it from `parent`.
    ///
    /// # Errors
    ///
    /// Fails if the column is not a link column.
    pub fn create_linked_object(
        &mut self,
        parent_table: TableKey,
        parent_key: ObjKey,
        col: ColKey,
    ) -> CoreResult<Obj> {
        let spec = self.inner.spec(parent_table)?;
        let col_spec = spec.column(col)?.clone();
        if col_spec.col_type != ColumnType::Link || col_spec.is_collection() {
            return Err(CoreError::invalid_operation(
                "create_linked_object requires a single link column",
            ));
        }
        let target = col_spec.target_table.expect("link has target");
        let key = self.inner.with_state(target, |_, state| {
            let key = ObjKey::new(state.next_key);
            state.next_key += 1;
            Ok(key)
        })?;
        self.create_object_raw(target, key)?;
        let target_name = self.inner.table_name(target)?;
        self.record(Instruction::CreateObject {
            table: target_name,
            key: key.value(),
        });
        self.set_value(parent_table, parent_key, col, Value::Link(key))?;
        Ok(Obj::new(target, key))
    }

    /// Writes a single-cell column.
    ///
    /// For link columns the backlink bookkeeping happens before the
    /// forward cell write, and removing the last strong backlink of the
    /// old target cascades.
    ///
    /// # Errors
    ///
    /// Fails on validation errors or an absent key.
    pub fn set_value(
        &mut self,
        table: TableKey,
        key: ObjKey,
        col: ColKey,
        value: Value,
    ) -> CoreResult<()> {
        let spec = self.inner.spec(table)?;
        let col_spec = spec.column(col)?.clone();
        if col_spec.is_collection() || col_spec.is_backlink() {
            return Err(CoreError::CollectionTypeMismatch {
                column: col_spec.name,
            });
        }
        validate_value(&col_spec, &value)?;
        if !self.inner.object_exists(table, key)? {
            return Err(CoreError::KeyNotFound(key));
        }

        let col_ndx = col.index() as usize;
        let mut cascade = CascadeState::default();

        if col_spec.col_type == ColumnType::Link {
            let target = col_spec.target_table.expect("link has target");
            let new_target = value.as_link();
            if let Some(new_key) = new_target {
                if !self.inner.object_exists(target, new_key)? {
                    return Err(CoreError::KeyNotFound(new_key));
                }
            }
            let old_cell = self.inner.raw_cell(table, key, col_ndx)?;
            let old_target = decode_link(old_cell.as_int());
            if old_target == new_target {
                // Fall through to record the write anyway.
            } else {
                // Backlink updates precede the forward write.
                if let Some(old_key) = old_target {
                    self.on_link_removed(table, key, col, target, old_key, &mut cascade)?;
                }
                if let Some(new_key) = new_target {
                    let backlink_ndx = self.find_backlink_col(target, table, col)?;
                    self.backlink_add(target, new_key, backlink_ndx, key)?;
                }
            }
        }

        let cell = value_to_cell(&col_spec, &value);
        let old_value = if col_spec.attrs.contains(ColumnAttr::INDEXED) {
            Some(cell_to_value(
                &col_spec,
                &self.inner.raw_cell(table, key, col_ndx)?,
            ))
        } else {
            None
        };
        self.inner.with_state(table, |alloc, state| {
            let mut ct = state.ct;
            ct.set_cell(alloc, &state.spec, key, col_ndx, &cell)?;
            state.ct = ct;
            state.dirty = true;
            Ok(())
        })?;

        if let Some(old_value) = old_value {
            self.index_replace(table, col, key, &old_value, &cell_to_value(&col_spec, &cell))?;
        }

        let table_name = self.inner.table_name(table)?;
        let wire = self.value_to_wire(&col_spec, &value)?;
        self.record(Instruction::Set {
            table: table_name,
            key: key.value(),
            column: col_spec.name.clone(),
            value: wire,
        });
        self.inner.bump_content_version();
        self.drain_cascade(cascade)?;
        Ok(())
    }

    /// Erases an object, cascading over strong links and embedded
    /// children.
    ///
    /// # Errors
    ///
    /// Fails if the key is absent.
    pub fn erase_object(&mut self, table: TableKey, key: ObjKey) -> CoreResult<()> {
        let mut cascade = CascadeState::default();
        self.erase_one(table, key, &mut cascade)?;
        self.drain_cascade(cascade)?;
        Ok(())
    }

    pub(crate) fn drain_cascade(&mut self, mut cascade: CascadeState) -> CoreResult<()> {
        while let Some((table, key)) = cascade.queue.pop_front() {
            if self.inner.object_exists(table, key)? {
                self.erase_one(table, key, &mut cascade)?;
            }
        }
        Ok(())
    }

    fn erase_one(
        &mut self,
        table: TableKey,
        key: ObjKey,
        cascade: &mut CascadeState,
    ) -> CoreResult<()> {
        let spec = self.inner.spec(table)?;
        if !self.inner.object_exists(table, key)? {
            return Err(CoreError::KeyNotFound(key));
        }

        // Outgoing links: retire backlinks on every target, collecting
        // cascade work.
        for (col, col_spec) in spec.public_columns() {
            if col_spec.col_type != ColumnType::Link {
                continue;
            }
            let target = col_spec.target_table.expect("link has target");
            for target_key in self.link_targets(table, key, col, col_spec)? {
                self.on_link_removed(table, key, col, target, target_key, cascade)?;
            }
        }

        // Incoming links: clear every forward reference to this object.
        for (col, col_spec) in spec.backlink_columns() {
            let origin_table = col_spec.target_table.expect("backlink has origin table");
            let origin_col = col_spec.backlink_origin.expect("backlink has origin col");
            let cell = self.inner.raw_cell(table, key, col.index() as usize)?;
            for origin_key in backlink_entries(&cell, &self.inner.db)? {
                self.remove_forward_reference(
                    origin_table,
                    ObjKey::new(origin_key),
                    origin_col,
                    key,
                )?;
            }
        }

        // Drop the row and tear down whatever its cells own.
        let cells = self.inner.with_state(table, |alloc, state| {
            let mut ct = state.ct;
            let cells = ct.erase(alloc, &state.spec, key)?;
            state.ct = ct;
            state.dirty = true;
            Ok(cells)
        })?;
        for (ndx, col_spec) in spec.columns.iter().enumerate() {
            self.destroy_cell_owned(col_spec, &cells[ndx])?;
            if col_spec.attrs.contains(ColumnAttr::INDEXED) {
                let value = cell_to_value(col_spec, &cells[ndx]);
                self.index_remove(table, ColKey::new(ndx as u32), key, &value)?;
            }
        }

        if !key.is_unresolved() {
            let table_name = self.inner.table_name(table)?;
            self.record(Instruction::EraseObject {
                table: table_name,
                key: key.value(),
            });
        }
        self.inner.bump_content_version();
        debug!(table = table.index(), key = key.value(), "object erased");
        Ok(())
    }

    /// Converts an object into an unresolved tombstone.
    ///
    /// Links to it remain but are hidden from link lists until the
    /// object is resolved by [`WriteTransaction::create_object_with_key`].
    ///
    /// # Errors
    ///
    /// Fails if the key is absent or already a tombstone.
    pub fn invalidate_object(&mut self, table: TableKey, key: ObjKey) -> CoreResult<ObjKey> {
        if key.is_unresolved() {
            return Err(CoreError::invalid_operation("object is already unresolved"));
        }
        let tombstone = key.as_unresolved();
        self.change_object_key(table, key, tombstone)?;
        Ok(tombstone)
    }

    /// Returns the key a link to `key` should use: the live key, an
    /// existing tombstone, or a freshly created tombstone row for an
    /// object that has not been received yet.
    pub(crate) fn get_or_create_tombstone(
        &mut self,
        table: TableKey,
        key: ObjKey,
    ) -> CoreResult<ObjKey> {
        if self.inner.object_exists(table, key)? {
            return Ok(key);
        }
        let tombstone = key.as_unresolved();
        if !self.inner.object_exists(table, tombstone)? {
            self.inner.with_state(table, |alloc, state| {
                let mut ct = state.ct;
                ct.insert(alloc, &state.spec, tombstone)?;
                state.ct = ct;
                state.dirty = true;
                Ok(())
            })?;
            self.inner.bump_content_version();
        }
        Ok(tombstone)
    }

    fn resolve_tombstone(&mut self, table: TableKey, tombstone: ObjKey) -> CoreResult<()> {
        let key = tombstone.as_resolved();
        self.change_object_key(table, tombstone, key)
    }

    /// Moves a row between a live key and its tombstone form, rewriting
    /// every incoming link.
    fn change_object_key(
        &mut self,
        table: TableKey,
        old_key: ObjKey,
        new_key: ObjKey,
    ) -> CoreResult<()> {
        let spec = self.inner.spec(table)?;
        self.inner.with_state(table, |alloc, state| {
            let mut ct = state.ct;
            ct.change_key(alloc, &state.spec, old_key, new_key)?;
            state.ct = ct;
            state.dirty = true;
            Ok(())
        })?;

        // Rewrite incoming forward links to the new key.
        for (col, col_spec) in spec.backlink_columns() {
            let origin_table = col_spec.target_table.expect("backlink has origin table");
            let origin_col = col_spec.backlink_origin.expect("backlink has origin col");
            let cell = self.inner.raw_cell(table, new_key, col.index() as usize)?;
            for origin_key in backlink_entries(&cell, &self.inner.db)? {
                self.rewrite_forward_reference(
                    origin_table,
                    ObjKey::new(origin_key),
                    origin_col,
                    old_key,
                    new_key,
                )?;
            }
        }
        self.inner.bump_content_version();
        Ok(())
    }

    /// Target keys held by a link column (single cell or collection).
    fn link_targets(
        &mut self,
        table: TableKey,
        key: ObjKey,
        col: ColKey,
        col_spec: &ColumnSpec,
    ) -> CoreResult<Vec<ObjKey>> {
        let cell = self.inner.raw_cell(table, key, col.index() as usize)?;
        if !col_spec.is_collection() {
            return Ok(decode_link(cell.as_int()).into_iter().collect());
        }
        let root = Ref::new(cell.as_int() as u64);
        if root.is_null() {
            return Ok(Vec::new());
        }
        let alloc = self.inner.db.alloc.lock();
        let mut targets = Vec::new();
        if col_spec.attrs.contains(ColumnAttr::DICTIONARY) {
            let parent = Array::load(&alloc, root)?;
            let values: BPlusTree<IntLeaf> = BPlusTree::attach(parent.get_ref(1));
            for word in values.to_vec(&alloc)? {
                if let Some(target) = decode_link(word) {
                    targets.push(target);
                }
            }
        } else {
            let tree: BPlusTree<IntLeaf> = BPlusTree::attach(root);
            for word in tree.to_vec(&alloc)? {
                if let Some(target) = decode_link(word) {
                    targets.push(target);
                }
            }
        }
        Ok(targets)
    }

    /// Frees collection storage owned by an erased row's cell.
    fn destroy_cell_owned(&mut self, col_spec: &ColumnSpec, cell: &Cell) -> CoreResult<()> {
        let is_refs = col_spec.is_collection() || col_spec.is_backlink();
        if !is_refs {
            return Ok(());
        }
        let word = cell.as_int();
        if word == 0 || is_tagged(word) {
            return Ok(());
        }
        let root = Ref::new(word as u64);
        let mut alloc = self.inner.db.alloc.lock();
        if col_spec.is_backlink() {
            Array::load(&alloc, root)?.destroy(&mut alloc);
        } else if col_spec.attrs.contains(ColumnAttr::DICTIONARY) {
            let parent = Array::load(&alloc, root)?;
            let keys: BPlusTree<StrLeaf> = BPlusTree::attach(parent.get_ref(0));
            keys.destroy(&mut alloc)?;
            let values_root = parent.get_ref(1);
            destroy_value_tree(&mut alloc, col_spec, values_root)?;
            parent.destroy(&mut alloc);
        } else {
            destroy_value_tree(&mut alloc, col_spec, root)?;
        }
        Ok(())
    }

    /// Handles the origin side of a removed link: retire the backlink
    /// and enqueue cascade work.
    pub(crate) fn on_link_removed(
        &mut self,
        origin_table: TableKey,
        origin_key: ObjKey,
        origin_col: ColKey,
        target_table: TableKey,
        target_key: ObjKey,
        cascade: &mut CascadeState,
    ) -> CoreResult<()> {
        let backlink_ndx = self.find_backlink_col(target_table, origin_table, origin_col)?;
        self.backlink_remove(target_table, target_key, backlink_ndx, origin_key)?;

        if target_key.is_unresolved() {
            // A tombstone with no remaining links is garbage.
            if self.inner.backlink_count(target_table, target_key)? == 0 {
                cascade.queue.push_back((target_table, target_key));
            }
            return Ok(());
        }

        let target_embedded = self.inner.table_type(target_table)? == TableType::Embedded;
        if target_embedded {
            if self.inner.backlink_count(target_table, target_key)? == 0 {
                cascade.queue.push_back((target_table, target_key));
            }
            return Ok(());
        }
        let origin_spec = self.inner.spec(origin_table)?;
        let strong = origin_spec
            .column(origin_col)?
            .attrs
            .contains(ColumnAttr::STRONG);
        if strong && self.inner.strong_backlink_count(target_table, target_key)? == 0 {
            cascade.queue.push_back((target_table, target_key));
        }
        Ok(())
    }

    /// Clears a forward reference to a dying object. Raw fixup: no
    /// backlink processing, no instruction.
    fn remove_forward_reference(
        &mut self,
        origin_table: TableKey,
        origin_key: ObjKey,
        origin_col: ColKey,
        dead_key: ObjKey,
    ) -> CoreResult<()> {
        let spec = self.inner.spec(origin_table)?;
        let col_spec = spec.column(origin_col)?.clone();
        let col_ndx = origin_col.index() as usize;
        if !col_spec.is_collection() {
            self.inner.with_state(origin_table, |alloc, state| {
                let mut ct = state.ct;
                ct.set_cell(
                    alloc,
                    &state.spec,
                    origin_key,
                    col_ndx,
                    &Cell::Int(encode_link(None)),
                )?;
                state.ct = ct;
                state.dirty = true;
                Ok(())
            })?;
            return Ok(());
        }

        let word = encode_link(Some(dead_key));
        self.inner.with_state(origin_table, |alloc, state| {
            let cell = state.ct.get_cell(alloc, &state.spec, origin_key, col_ndx)?;
            let root = Ref::new(cell.as_int() as u64);
            if root.is_null() {
                return Ok(());
            }
            if col_spec.attrs.contains(ColumnAttr::DICTIONARY) {
                let mut parent = Array::load(alloc, root)?;
                let mut values: BPlusTree<IntLeaf> = BPlusTree::attach(parent.get_ref(1));
                let entries = values.to_vec(alloc)?;
                for (i, entry) in entries.iter().enumerate() {
                    if *entry == word {
                        values.set(alloc, i, encode_link(None))?;
                    }
                }
                parent.set(1, values.root_ref().offset() as i64);
                let new_root = parent.store(alloc)?;
                let mut ct = state.ct;
                ct.set_cell(
                    alloc,
                    &state.spec,
                    origin_key,
                    col_ndx,
                    &Cell::Int(new_root.offset() as i64),
                )?;
                state.ct = ct;
            } else {
                let mut tree: BPlusTree<IntLeaf> = BPlusTree::attach(root);
                // Erase from the back so positions stay valid.
                let entries = tree.to_vec(alloc)?;
                for i in (0..entries.len()).rev() {
                    if entries[i] == word {
                        tree.erase(alloc, i)?;
                    }
                }
                // Unresolved bookkeeping: clear the flag when the last
                // tombstone reference is gone.
                if dead_key.is_unresolved() {
                    let remaining = tree
                        .to_vec(alloc)?
                        .iter()
                        .filter_map(|&w| decode_link(w))
                        .any(|k| k.is_unresolved());
                    if !remaining {
                        tree.set_context_flag(alloc, false)?;
                    }
                }
                let mut ct = state.ct;
                ct.set_cell(
                    alloc,
                    &state.spec,
                    origin_key,
                    col_ndx,
                    &Cell::Int(tree.root_ref().offset() as i64),
                )?;
                state.ct = ct;
            }
            state.dirty = true;
            Ok(())
        })?;
        self.inner.bump_content_version();
        Ok(())
    }

    /// Rewrites forward references from `old_key` to `new_key` during
    /// tombstone transitions. Raw fixup: no instruction.
    fn rewrite_forward_reference(
        &mut self,
        origin_table: TableKey,
        origin_key: ObjKey,
        origin_col: ColKey,
        old_key: ObjKey,
        new_key: ObjKey,
    ) -> CoreResult<()> {
        let spec = self.inner.spec(origin_table)?;
        let col_spec = spec.column(origin_col)?.clone();
        let col_ndx = origin_col.index() as usize;
        let old_word = encode_link(Some(old_key));
        let new_word = encode_link(Some(new_key));

        self.inner.with_state(origin_table, |alloc, state| {
            if !col_spec.is_collection() {
                let cell = state.ct.get_cell(alloc, &state.spec, origin_key, col_ndx)?;
                if cell.as_int() == old_word {
                    let mut ct = state.ct;
                    ct.set_cell(alloc, &state.spec, origin_key, col_ndx, &Cell::Int(new_word))?;
                    state.ct = ct;
                    state.dirty = true;
                }
                return Ok(());
            }
            let cell = state.ct.get_cell(alloc, &state.spec, origin_key, col_ndx)?;
            let root = Ref::new(cell.as_int() as u64);
            if root.is_null() {
                return Ok(());
            }
            if col_spec.attrs.contains(ColumnAttr::DICTIONARY) {
                let mut parent = Array::load(alloc, root)?;
                let mut values: BPlusTree<IntLeaf> = BPlusTree::attach(parent.get_ref(1));
                let entries = values.to_vec(alloc)?;
                for (i, entry) in entries.iter().enumerate() {
                    if *entry == old_word {
                        values.set(alloc, i, new_word)?;
                    }
                }
                parent.set(1, values.root_ref().offset() as i64);
                let new_root = parent.store(alloc)?;
                let mut ct = state.ct;
                ct.set_cell(
                    alloc,
                    &state.spec,
                    origin_key,
                    col_ndx,
                    &Cell::Int(new_root.offset() as i64),
                )?;
                state.ct = ct;
            } else {
                let mut tree: BPlusTree<IntLeaf> = BPlusTree::attach(root);
                let entries = tree.to_vec(alloc)?;
                for (i, entry) in entries.iter().enumerate() {
                    if *entry == old_word {
                        tree.set(alloc, i, new_word)?;
                    }
                }
                // The unresolved flag tracks whether any tombstone
                // reference remains.
                let any_unresolved = tree
                    .to_vec(alloc)?
                    .iter()
                    .filter_map(|&w| decode_link(w))
                    .any(|k| k.is_unresolved());
                tree.set_context_flag(alloc, any_unresolved)?;
                let mut ct = state.ct;
                ct.set_cell(
                    alloc,
                    &state.spec,
                    origin_key,
                    col_ndx,
                    &Cell::Int(tree.root_ref().offset() as i64),
                )?;
                state.ct = ct;
            }
            state.dirty = true;
            Ok(())
        })?;
        self.inner.bump_content_version();
        Ok(())
    }

    /// The spec index of the backlink column on `target_table` paired
    /// with `(origin_table, origin_col)`.
    pub(crate) fn find_backlink_col(
        &mut self,
        target_table: TableKey,
        origin_table: TableKey,
        origin_col: ColKey,
    ) -> CoreResult<usize> {
        let spec = self.inner.spec(target_table)?;
        spec.columns
            .iter()
            .position(|col| {
                col.is_backlink()
                    && col.target_table == Some(origin_table)
                    && col.backlink_origin == Some(origin_col)
            })
            .ok_or_else(|| {
                CoreError::file_corrupt("missing backlink column for link column")
            })
    }

    /// Adds one backlink entry.
    pub(crate) fn backlink_add(
        &mut self,
        table: TableKey,
        key: ObjKey,
        backlink_ndx: usize,
        origin_key: ObjKey,
    ) -> CoreResult<()> {
        self.inner.with_state(table, |alloc, state| {
            let cell = state.ct.get_cell(alloc, &state.spec, key, backlink_ndx)?;
            let word = cell.as_int();
            let new_word = if word == 0 {
                tag_int(origin_key.value())
            } else if is_tagged(word) {
                let mut array = Array::from_values(
                    false,
                    vec![untag_int(word), origin_key.value()],
                );
                array.store(alloc)?.offset() as i64
            } else {
                let mut array = Array::load(alloc, Ref::new(word as u64))?;
                array.push(origin_key.value());
                array.store(alloc)?.offset() as i64
            };
            let mut ct = state.ct;
            ct.set_cell(alloc, &state.spec, key, backlink_ndx, &Cell::Int(new_word))?;
            state.ct = ct;
            state.dirty = true;
            Ok(())
        })
    }

    /// Removes one backlink entry.
    pub(crate) fn backlink_remove(
        &mut self,
        table: TableKey,
        key: ObjKey,
        backlink_ndx: usize,
        origin_key: ObjKey,
    ) -> CoreResult<()> {
        self.inner.with_state(table, |alloc, state| {
            let cell = state.ct.get_cell(alloc, &state.spec, key, backlink_ndx)?;
            let word = cell.as_int();
            let new_word = if word == 0 {
                0
            } else if is_tagged(word) {
                if untag_int(word) == origin_key.value() {
                    0
                } else {
                    word
                }
            } else {
                let mut array = Array::load(alloc, Ref::new(word as u64))?;
                if let Some(pos) = array.find_first(origin_key.value()) {
                    array.erase(pos);
                }
                match array.len() {
                    0 => {
                        array.destroy(alloc);
                        0
                    }
                    1 => {
                        let only = array.get(0);
                        array.destroy(alloc);
                        tag_int(only)
                    }
                    _ => array.store(alloc)?.offset() as i64,
                }
            };
            let mut ct = state.ct;
            ct.set_cell(alloc, &state.spec, key, backlink_ndx, &Cell::Int(new_word))?;
            state.ct = ct;
            state.dirty = true;
            Ok(())
        })
    }

    /// Converts a value to its wire form, resolving link target names.
    pub(crate) fn value_to_wire(
        &mut self,
        col_spec: &ColumnSpec,
        value: &Value,
    ) -> CoreResult<WireValue> {
        Ok(match value {
            Value::Null => WireValue::Null,
            Value::Int(v) => WireValue::Int(*v),
            Value::Bool(v) => WireValue::Bool(*v),
            Value::String(v) => WireValue::String(v.clone()),
            Value::Binary(v) => WireValue::Binary(v.clone()),
            Value::Link(key) => {
                let target = col_spec.target_table.expect("link has target");
                WireValue::Link {
                    table: self.inner.table_name(target)?,
                    key: key.value(),
                }
            }
        })
    }

    /// Adds a search index to an existing column.
    ///
    /// The index cache is built lazily on first lookup; this only
    /// flips the column attribute.
    ///
    /// # Errors
    ///
    /// Fails for collection, link, and backlink columns.
    pub fn add_search_index(&mut self, table: TableKey, col: ColKey) -> CoreResult<()> {
        self.inner.with_state(table, |_, state| {
            let col_spec = state
                .spec
                .columns
                .get_mut(col.index() as usize)
                .ok_or(CoreError::ColumnIndexOutOfRange { index: col.index() })?;
            if col_spec.is_backlink()
                || col_spec.is_collection()
                || col_spec.col_type == ColumnType::Link
            {
                return Err(CoreError::invalid_operation(
                    "search indexes apply to scalar columns",
                ));
            }
            col_spec.attrs = col_spec.attrs.with(ColumnAttr::INDEXED);
            state.dirty = true;
            Ok(())
        })
    }

    /// Removes a column's search index.
    ///
    /// # Errors
    ///
    /// Fails if the column key is stale.
    pub fn remove_search_index(&mut self, table: TableKey, col: ColKey) -> CoreResult<()> {
        self.inner.with_state(table, |_, state| {
            let col_spec = state
                .spec
                .columns
                .get_mut(col.index() as usize)
                .ok_or(CoreError::ColumnIndexOutOfRange { index: col.index() })?;
            col_spec.attrs = ColumnAttr(col_spec.attrs.0 & !ColumnAttr::INDEXED.0);
            state.indexes.remove(&col.index());
            state.dirty = true;
            Ok(())
        })
    }

    fn ensure_index(&mut self, table: TableKey, col: ColKey) -> CoreResult<()> {
        let built = self.inner.with_state(table, |_, state| {
            Ok(state.indexes.contains_key(&col.index()))
        })?;
        if built {
            return Ok(());
        }
        let spec = self.inner.spec(table)?;
        let col_spec = spec.column(col)?.clone();
        self.inner.with_state(table, |alloc, state| {
            let mut index: BTreeMap<Value, Vec<i64>> = BTreeMap::new();
            let mut keys = Vec::new();
            state.ct.for_each_key(alloc, &state.spec, &mut |key| {
                keys.push(key);
                true
            })?;
            for key in keys {
                let cell = state
                    .ct
                    .get_cell(alloc, &state.spec, key, col.index() as usize)?;
                index
                    .entry(cell_to_value(&col_spec, &cell))
                    .or_default()
                    .push(key.value());
            }
            state.indexes.insert(col.index(), index);
            Ok(())
        })
    }

    fn index_replace(
        &mut self,
        table: TableKey,
        col: ColKey,
        key: ObjKey,
        old_value: &Value,
        new_value: &Value,
    ) -> CoreResult<()> {
        self.inner.with_state(table, |_, state| {
            if let Some(index) = state.indexes.get_mut(&col.index()) {
                if let Some(bucket) = index.get_mut(old_value) {
                    bucket.retain(|&k| k != key.value());
                    if bucket.is_empty() {
                        index.remove(old_value);
                    }
                }
                index
                    .entry(new_value.clone())
                    .or_default()
                    .push(key.value());
            }
            Ok(())
        })
    }

    fn index_remove(
        &mut self,
        table: TableKey,
        col: ColKey,
        key: ObjKey,
        value: &Value,
    ) -> CoreResult<()> {
        self.inner.with_state(table, |_, state| {
            if let Some(index) = state.indexes.get_mut(&col.index()) {
                if let Some(bucket) = index.get_mut(value) {
                    bucket.retain(|&k| k != key.value());
                    if bucket.is_empty() {
                        index.remove(value);
                    }
                }
            }
            Ok(())
        })
    }

    /// Finds the first object whose indexed column equals `value`.
    ///
    /// Falls back to a scan for non-indexed columns.
    ///
    /// # Errors
    ///
    /// Fails on load errors.
    pub fn find_first(
        &mut self,
        table: TableKey,
        col: ColKey,
        value: &Value,
    ) -> CoreResult<Option<ObjKey>> {
        let spec = self.inner.spec(table)?;
        let col_spec = spec.column(col)?.clone();
        if col_spec.attrs.contains(ColumnAttr::INDEXED) {
            self.ensure_index(table, col)?;
            return self.inner.with_state(table, |_, state| {
                Ok(state
                    .indexes
                    .get(&col.index())
                    .and_then(|index| index.get(value))
                    .and_then(|bucket| bucket.iter().min().copied())
                    .map(ObjKey::new))
            });
        }
        // Linear scan.
        let keys = self.inner.object_keys(table)?;
        for key in keys {
            let cell = self.inner.raw_cell(table, key, col.index() as usize)?;
            if &cell_to_value(&col_spec, &cell) == value {
                return Ok(Some(key));
            }
        }
        Ok(None)
    }

    /// Commits, producing the next version.
    ///
    /// # Errors
    ///
    /// On failure the transaction is rolled back and the error
    /// returned; partial state is never published.
    pub fn commit(mut self) -> CoreResult<Version> {
        let result = self.commit_internal(0, 0, None);
        self.finished = true;
        if result.is_err() {
            self.inner.db.alloc.lock().rollback();
            self.inner.db.metrics.rollbacks.bump();
        }
        self.unlock_file();
        result
    }

    /// Commits an integration of remote changesets: the history entry
    /// carries the remote origin, and `progress` is persisted with the
    /// same commit.
    ///
    /// # Errors
    ///
    /// As for [`WriteTransaction::commit`].
    pub fn commit_integration(
        mut self,
        origin_file_ident: u64,
        last_integrated_remote_version: u64,
        progress: crate::history::SyncProgress,
    ) -> CoreResult<Version> {
        let result = self.commit_internal(
            origin_file_ident,
            last_integrated_remote_version,
            Some(progress),
        );
        self.finished = true;
        if result.is_err() {
            self.inner.db.alloc.lock().rollback();
            self.inner.db.metrics.rollbacks.bump();
        }
        self.unlock_file();
        result
    }

    fn commit_internal(
        &mut self,
        origin_file_ident: u64,
        last_integrated_remote_version: u64,
        progress: Option<crate::history::SyncProgress>,
    ) -> CoreResult<Version> {
        let new_version = self.inner.version.next();
        let top_ref = {
            let mut alloc = self.inner.db.alloc.lock();
            store_group(&mut alloc, &mut self.inner.group)?
        };

        let changeset = encode_instructions(&self.instructions);
        let timestamp = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis() as i64)
            .unwrap_or(0);
        {
            let mut history = self.inner.db.history.lock();
            history.append_entry(HistoryEntry {
                version: new_version,
                last_integrated_remote_version,
                origin_timestamp: timestamp,
                origin_file_ident,
                changeset,
            })?;
            if let Some(progress) = progress {
                history.set_progress(progress)?;
            }
        }

        {
            let mut alloc = self.inner.db.alloc.lock();
            alloc.commit(top_ref, new_version)?;
        }
        self.inner.db.metrics.commits.bump();
        debug!(version = new_version.number(), "commit");
        self.inner.db.notify_commit(new_version);
        Ok(new_version)
    }

    /// Discards every change made by this transaction.
    pub fn rollback(mut self) {
        self.inner.db.alloc.lock().rollback();
        self.inner.db.metrics.rollbacks.bump();
        self.finished = true;
        self.unlock_file();
    }

    fn unlock_file(&self) {
        if let Some(lock_file) = &self.inner.db.lock_file {
            let _ = fs2::FileExt::unlock(lock_file);
        }
    }

    /// The instructions recorded so far. Exposed for tests and the
    /// replay layer.
    #[must_use]
    pub fn pending_instructions(&self) -> &[Instruction] {
        &self.instructions
    }
}

impl Drop for WriteTransaction<'_> {
    fn drop(&mut self) {
        if !self.finished {
            self.inner.db.alloc.lock().rollback();
            self.inner.db.metrics.rollbacks.bump();
            self.unlock_file();
        }
    }
}

fn destroy_value_tree(
    alloc: &mut SlabAlloc,
    col_spec: &ColumnSpec,
    root: Ref,
) -> CoreResult<()> {
    if root.is_null() {
        return Ok(());
    }
    match col_spec.col_type {
        ColumnType::String | ColumnType::Binary => {
            let tree: BPlusTree<StrLeaf> = BPlusTree::attach(root);
            tree.destroy(alloc)
        }
        _ => {
            let tree: BPlusTree<IntLeaf> = BPlusTree::attach(root);
            tree.destroy(alloc)
        }
    }
}

/// Decodes the origin keys held by a backlink cell.
fn backlink_entries(cell: &Cell, db: &Arc<DbInner>) -> CoreResult<Vec<i64>> {
    let word = cell.as_int();
    if word == 0 {
        return Ok(Vec::new());
    }
    if is_tagged(word) {
        return Ok(vec![untag_int(word)]);
    }
    let alloc = db.alloc.lock();
    let array = Array::load(&alloc, Ref::new(word as u64))?;
    Ok(array.iter().collect())
}

/// Validates a value against a column's type, nullability, and size
/// limits.
pub(crate) fn validate_value(col_spec: &ColumnSpec, value: &Value) -> CoreResult<()> {
    if value.is_null() {
        if !col_spec.attrs.contains(ColumnAttr::NULLABLE)
            && col_spec.col_type != ColumnType::Link
        {
            return Err(CoreError::ColumnNotNullable {
                column: col_spec.name.clone(),
            });
        }
        return Ok(());
    }
    if !value.fits(col_spec.col_type) {
        return Err(CoreError::TypeMismatch {
            column: col_spec.name.clone(),
            message: format!("{value} does not fit {:?}", col_spec.col_type),
        });
    }
    match value {
        Value::String(s) if s.len() > MAX_STRING_SIZE => Err(CoreError::StringTooBig {
            size: s.len(),
            max: MAX_STRING_SIZE,
        }),
        Value::Binary(b) if b.len() > MAX_BINARY_SIZE => Err(CoreError::BinaryTooBig {
            size: b.len(),
            max: MAX_BINARY_SIZE,
        }),
        Value::Int(v)
            if *v == INT_NULL && col_spec.attrs.contains(ColumnAttr::NULLABLE) =>
        {
            Err(CoreError::invalid_operation(
                "i64::MIN is reserved in nullable integer columns",
            ))
        }
        _ => Ok(()),
    }
}

/// Converts a validated value to its storage cell.
pub(crate) fn value_to_cell(col_spec: &ColumnSpec, value: &Value) -> Cell {
    match col_spec.col_type {
        ColumnType::Int => match value {
            Value::Int(v) => Cell::Int(*v),
            _ => Cell::Int(INT_NULL),
        },
        ColumnType::Bool => match value {
            Value::Bool(v) => Cell::Int(i64::from(*v)),
            _ => Cell::Int(BOOL_NULL),
        },
        ColumnType::Link => Cell::Int(encode_link(value.as_link())),
        ColumnType::String => match value {
            Value::String(v) => Cell::Str(Some(v.clone().into_bytes())),
            _ => Cell::Str(None),
        },
        ColumnType::Binary => match value {
            Value::Binary(v) => Cell::Str(Some(v.clone())),
            _ => Cell::Str(None),
        },
    }
}

/// Converts a storage cell back to a value.
pub(crate) fn cell_to_value(col_spec: &ColumnSpec, cell: &Cell) -> Value {
    match col_spec.col_type {
        ColumnType::Int => {
            let word = cell.as_int();
            if word == INT_NULL && col_spec.attrs.contains(ColumnAttr::NULLABLE) {
                Value::Null
            } else {
                Value::Int(word)
            }
        }
        ColumnType::Bool => match cell.as_int() {
            BOOL_NULL => Value::Null,
            word => Value::Bool(word != 0),
        },
        ColumnType::Link => match decode_link(cell.as_int()) {
            Some(key) => Value::Link(key),
            None => Value::Null,
        },
        ColumnType::String => match cell {
            Cell::Str(Some(bytes)) => {
                Value::String(String::from_utf8_lossy(bytes).into_owned())
            }
            _ => Value::Null,
        },
        ColumnType::Binary => match cell {
            Cell::Str(Some(bytes)) => Value::Binary(bytes.clone()),
            _ => Value::Null,
        },
    }
}

pub(crate) fn wire_column_type(col_type: ColumnType) -> WireColumnType {
    match col_type {
        ColumnType::Int => WireColumnType::Int,
        ColumnType::Bool => WireColumnType::Bool,
        ColumnType::String => WireColumnType::String,
        ColumnType::Binary => WireColumnType::Binary,
        ColumnType::Link => WireColumnType::Link,
    }
}

pub(crate) fn wire_collection(attrs: &ColumnAttr) -> CollectionKind {
    if attrs.contains(ColumnAttr::LIST) {
        CollectionKind::List
    } else if attrs.contains(ColumnAttr::SET) {
        CollectionKind::Set
    } else if attrs.contains(ColumnAttr::DICTIONARY) {
        CollectionKind::Dictionary
    } else {
        CollectionKind::None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::Db;

    #[test]
    fn commit_and_reopen_snapshot() {
        let db = Db::open_in_memory().unwrap();
        {
            let mut txn = db.begin_write().unwrap();
            let table = txn.add_table("t", TableType::TopLevel).unwrap();
            let col = txn.add_column(table.key(), ColumnSpec::int("v")).unwrap();
            let obj1 = txn.create_object(table.key()).unwrap();
            let obj2 = txn.create_object(table.key()).unwrap();
            txn.set_value(table.key(), obj1.key(), col, Value::Int(1))
                .unwrap();
            txn.set_value(table.key(), obj2.key(), col, Value::Int(2))
                .unwrap();
            txn.commit().unwrap();
        }

        let mut read = db.begin_read().unwrap();
        let table = read.table("t").unwrap();
        let col = read.spec(table.key()).unwrap().column_by_name("v").unwrap();
        assert_eq!(read.object_count(table.key()).unwrap(), 2);
        let keys = read.object_keys(table.key()).unwrap();
        assert_eq!(
            read.get_value(table.key(), keys[0], col).unwrap(),
            Value::Int(1)
        );
        assert_eq!(
            read.get_value(table.key(), keys[1], col).unwrap(),
            Value::Int(2)
        );
    }

    #[test]
    fn snapshot_isolation_across_commits() {
        let db = Db::open_in_memory().unwrap();
        let (table_key, col) = {
            let mut txn = db.begin_write().unwrap();
            let table = txn.add_table("t", TableType::TopLevel).unwrap();
            let col = txn.add_column(table.key(), ColumnSpec::int("v")).unwrap();
            let obj = txn.create_object(table.key()).unwrap();
            txn.set_value(table.key(), obj.key(), col, Value::Int(10))
                .unwrap();
            txn.commit().unwrap();
            (table.key(), col)
        };

        let mut reader = db.begin_read().unwrap();
        let key = reader.object_keys(table_key).unwrap()[0];

        {
            let mut txn = db.begin_write().unwrap();
            txn.set_value(table_key, key, col, Value::Int(20)).unwrap();
            txn.commit().unwrap();
        }

        // The old reader still sees its snapshot.
        assert_eq!(
            reader.get_value(table_key, key, col).unwrap(),
            Value::Int(10)
        );
        // A fresh reader sees the new value.
        let mut fresh = db.begin_read().unwrap();
        assert_eq!(
            fresh.get_value(table_key, key, col).unwrap(),
            Value::Int(20)
        );
    }

    #[test]
    fn rollback_discards_changes() {
        let db = Db::open_in_memory().unwrap();
        {
            let mut txn = db.begin_write().unwrap();
            txn.add_table("gone", TableType::TopLevel).unwrap();
            txn.rollback();
        }
        let read = db.begin_read().unwrap();
        assert!(!read.has_table("gone"));
    }

    #[test]
    fn drop_without_commit_rolls_back() {
        let db = Db::open_in_memory().unwrap();
        {
            let mut txn = db.begin_write().unwrap();
            txn.add_table("gone", TableType::TopLevel).unwrap();
        }
        let read = db.begin_read().unwrap();
        assert!(!read.has_table("gone"));
        // The writer slot is free again.
        let txn = db.begin_write().unwrap();
        drop(txn);
    }

    #[test]
    fn nullability_enforced() {
        let db = Db::open_in_memory().unwrap();
        let mut txn = db.begin_write().unwrap();
        let table = txn.add_table("t", TableType::TopLevel).unwrap();
        let strict = txn.add_column(table.key(), ColumnSpec::int("strict")).unwrap();
        let lax = txn
            .add_column(table.key(), ColumnSpec::int("lax").nullable())
            .unwrap();
        let obj = txn.create_object(table.key()).unwrap();

        let result = txn.set_value(table.key(), obj.key(), strict, Value::Null);
        assert!(matches!(result, Err(CoreError::ColumnNotNullable { .. })));

        txn.set_value(table.key(), obj.key(), lax, Value::Null)
            .unwrap();
        assert_eq!(
            txn.get_value(table.key(), obj.key(), lax).unwrap(),
            Value::Null
        );
    }

    #[test]
    fn type_mismatch_rejected() {
        let db = Db::open_in_memory().unwrap();
        let mut txn = db.begin_write().unwrap();
        let table = txn.add_table("t", TableType::TopLevel).unwrap();
        let col = txn.add_column(table.key(), ColumnSpec::int("v")).unwrap();
        let obj = txn.create_object(table.key()).unwrap();
        let result = txn.set_value(table.key(), obj.key(), col, Value::from("nope"));
        assert!(matches!(result, Err(CoreError::TypeMismatch { .. })));
    }

    #[test]
    fn strong_link_cascade() {
        let db = Db::open_in_memory().unwrap();
        let mut txn = db.begin_write().unwrap();
        let child_table = txn.add_table("C", TableType::TopLevel).unwrap();
        let x = txn.add_column(child_table.key(), ColumnSpec::int("x")).unwrap();
        let parent_table = txn.add_table("P", TableType::TopLevel).unwrap();
        let child_col = txn
            .add_column(
                parent_table.key(),
                ColumnSpec::link("child", child_table.key()).strong(),
            )
            .unwrap();

        let c0 = txn.create_object(child_table.key()).unwrap();
        txn.set_value(child_table.key(), c0.key(), x, Value::Int(7))
            .unwrap();
        let p0 = txn.create_object(parent_table.key()).unwrap();
        txn.set_value(
            parent_table.key(),
            p0.key(),
            child_col,
            Value::Link(c0.key()),
        )
        .unwrap();

        assert_eq!(txn.object_count(child_table.key()).unwrap(), 1);
        txn.erase_object(parent_table.key(), p0.key()).unwrap();
        assert_eq!(txn.object_count(child_table.key()).unwrap(), 0);
    }

    #[test]
    fn weak_link_does_not_cascade() {
        let db = Db::open_in_memory().unwrap();
        let mut txn = db.begin_write().unwrap();
        let child_table = txn.add_table("C", TableType::TopLevel).unwrap();
        let parent_table = txn.add_table("P", TableType::TopLevel).unwrap();
        let child_col = txn
            .add_column(
                parent_table.key(),
                ColumnSpec::link("child", child_table.key()),
            )
            .unwrap();

        let c0 = txn.create_object(child_table.key()).unwrap();
        let p0 = txn.create_object(parent_table.key()).unwrap();
        txn.set_value(
            parent_table.key(),
            p0.key(),
            child_col,
            Value::Link(c0.key()),
        )
        .unwrap();
        txn.erase_object(parent_table.key(), p0.key()).unwrap();
        assert_eq!(txn.object_count(child_table.key()).unwrap(), 1);
    }

    #[test]
    fn erasing_target_clears_forward_link() {
        let db = Db::open_in_memory().unwrap();
        let mut txn = db.begin_write().unwrap();
        let child_table = txn.add_table("C", TableType::TopLevel).unwrap();
        let parent_table = txn.add_table("P", TableType::TopLevel).unwrap();
        let child_col = txn
            .add_column(
                parent_table.key(),
                ColumnSpec::link("child", child_table.key()),
            )
            .unwrap();

        let c0 = txn.create_object(child_table.key()).unwrap();
        let p0 = txn.create_object(parent_table.key()).unwrap();
        txn.set_value(
            parent_table.key(),
            p0.key(),
            child_col,
            Value::Link(c0.key()),
        )
        .unwrap();

        txn.erase_object(child_table.key(), c0.key()).unwrap();
        assert_eq!(
            txn.get_value(parent_table.key(), p0.key(), child_col)
                .unwrap(),
            Value::Null
        );
    }

    #[test]
    fn relink_moves_backlink() {
        let db = Db::open_in_memory().unwrap();
        let mut txn = db.begin_write().unwrap();
        let child_table = txn.add_table("C", TableType::TopLevel).unwrap();
        let parent_table = txn.add_table("P", TableType::TopLevel).unwrap();
        let child_col = txn
            .add_column(
                parent_table.key(),
                ColumnSpec::link("child", child_table.key()),
            )
            .unwrap();

        let c0 = txn.create_object(child_table.key()).unwrap();
        let c1 = txn.create_object(child_table.key()).unwrap();
        let p0 = txn.create_object(parent_table.key()).unwrap();
        txn.set_value(
            parent_table.key(),
            p0.key(),
            child_col,
            Value::Link(c0.key()),
        )
        .unwrap();
        txn.set_value(
            parent_table.key(),
            p0.key(),
            child_col,
            Value::Link(c1.key()),
        )
        .unwrap();

        assert_eq!(
            txn.backlink_count(child_table.key(), c0.key()).unwrap(),
            0
        );
        assert_eq!(
            txn.backlink_count(child_table.key(), c1.key()).unwrap(),
            1
        );
    }

    #[test]
    fn embedded_object_lifecycle() {
        let db = Db::open_in_memory().unwrap();
        let mut txn = db.begin_write().unwrap();
        let embedded = txn.add_table("E", TableType::Embedded).unwrap();
        let parent_table = txn.add_table("P", TableType::TopLevel).unwrap();
        let child_col = txn
            .add_column(
                parent_table.key(),
                ColumnSpec::link("inner", embedded.key()).strong(),
            )
            .unwrap();

        // Direct creation on an embedded table is rejected.
        assert!(matches!(
            txn.create_object(embedded.key()),
            Err(CoreError::EmbeddedViolation { .. })
        ));

        let p0 = txn.create_object(parent_table.key()).unwrap();
        let e0 = txn
            .create_linked_object(parent_table.key(), p0.key(), child_col)
            .unwrap();
        assert_eq!(txn.backlink_count(embedded.key(), e0.key()).unwrap(), 1);

        // Unlinking erases the embedded object.
        txn.set_value(parent_table.key(), p0.key(), child_col, Value::Null)
            .unwrap();
        assert_eq!(txn.object_count(embedded.key()).unwrap(), 0);
    }

    #[test]
    fn indexed_lookup() {
        let db = Db::open_in_memory().unwrap();
        let mut txn = db.begin_write().unwrap();
        let table = txn.add_table("t", TableType::TopLevel).unwrap();
        let col = txn
            .add_column(table.key(), ColumnSpec::string("name").indexed())
            .unwrap();
        for name in ["ada", "brian", "grace"] {
            let obj = txn.create_object(table.key()).unwrap();
            txn.set_value(table.key(), obj.key(), col, Value::from(name))
                .unwrap();
        }
        let found = txn
            .find_first(table.key(), col, &Value::from("brian"))
            .unwrap();
        assert!(found.is_some());
        let missing = txn
            .find_first(table.key(), col, &Value::from("turing"))
            .unwrap();
        assert!(missing.is_none());
    }

    #[test]
    fn changeset_records_mutations() {
        let db = Db::open_in_memory().unwrap();
        let mut txn = db.begin_write().unwrap();
        let table = txn.add_table("t", TableType::TopLevel).unwrap();
        let col = txn.add_column(table.key(), ColumnSpec::int("v")).unwrap();
        let obj = txn.create_object(table.key()).unwrap();
        txn.set_value(table.key(), obj.key(), col, Value::Int(5))
            .unwrap();

        let kinds: Vec<_> = txn
            .pending_instructions()
            .iter()
            .map(std::mem::discriminant)
            .collect();
        assert_eq!(kinds.len(), 4);
        txn.commit().unwrap();

        let entries = db.history_entries(Version::new(0), Version::new(1));
        assert_eq!(entries.len(), 1);
        assert!(entries[0].is_local());
        assert!(!entries[0].changeset.is_empty());
    }

    #[test]
    fn versions_are_sequential() {
        let db = Db::open_in_memory().unwrap();
        for expected in 1..=3u64 {
            let txn = db.begin_write().unwrap();
            let version = txn.commit().unwrap();
            assert_eq!(version, Version::new(expected));
        }
    }
}
