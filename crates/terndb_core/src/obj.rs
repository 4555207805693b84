//! Versioned object accessors.
//!
//! An [`Obj`] is a handle to one row: table key, object key, and a
//! cached `(cluster ref, row index, content version)` triple. The cache
//! is revalidated against the transaction's content version before
//! every access, so a handle obtained before other mutations keeps
//! working afterwards.
//!
//! Accessors are not thread-safe; use them on the thread that owns the
//! transaction.

use crate::error::{CoreError, CoreResult};
use crate::keys::{ColKey, ObjKey, Ref, TableKey};
use crate::list::{Dictionary, LinkList, List, Set};
use crate::schema::ColumnAttr;
use crate::transaction::{Transaction, WriteTransaction};
use crate::value::Value;
use std::cell::Cell as StdCell;

#[derive(Debug, Clone, Copy, Default)]
struct ObjCache {
    cluster: Ref,
    row: usize,
    content_version: u64,
    valid: bool,
}

/// A handle to one object.
#[derive(Debug)]
pub struct Obj {
    table: TableKey,
    key: ObjKey,
    cache: StdCell<ObjCache>,
}

impl Clone for Obj {
    fn clone(&self) -> Self {
        Self {
            table: self.table,
            key: self.key,
            cache: StdCell::new(self.cache.get()),
        }
    }
}

impl Obj {
    pub(crate) fn new(table: TableKey, key: ObjKey) -> Self {
        Self {
            table,
            key,
            cache: StdCell::new(ObjCache::default()),
        }
    }

    /// The object's key.
    #[must_use]
    pub fn key(&self) -> ObjKey {
        self.key
    }

    /// The object's table.
    #[must_use]
    pub fn table_key(&self) -> TableKey {
        self.table
    }

    /// Revalidates the cached cluster position if the transaction has
    /// mutated since it was cached. Returns true if the cache was
    /// refreshed.
    ///
    /// # Errors
    ///
    /// Fails with [`CoreError::KeyNotFound`] if the object no longer
    /// exists.
    pub fn update_if_needed(&self, txn: &mut Transaction) -> CoreResult<bool> {
        let cache = self.cache.get();
        if cache.valid && cache.content_version == txn.content_version() {
            return Ok(false);
        }
        let located = txn
            .locate(self.table, self.key)?
            .ok_or(CoreError::KeyNotFound(self.key))?;
        self.cache.set(ObjCache {
            cluster: located.0,
            row: located.1,
            content_version: txn.content_version(),
            valid: true,
        });
        txn.db.metrics.accessor_refreshes.bump();
        Ok(true)
    }

    /// True if the object still exists in this transaction.
    pub fn is_valid(&self, txn: &mut Transaction) -> bool {
        self.update_if_needed(txn).is_ok()
    }

    /// Reads a single-cell column.
    ///
    /// # Errors
    ///
    /// Fails if the object is gone or the column is a collection.
    pub fn get(&self, txn: &mut Transaction, col: ColKey) -> CoreResult<Value> {
        self.update_if_needed(txn)?;
        txn.get_value(self.table, self.key, col)
    }

    /// Writes a single-cell column.
    ///
    /// # Errors
    ///
    /// Fails on validation errors or if the object is gone.
    pub fn set(
        &self,
        txn: &mut WriteTransaction<'_>,
        col: ColKey,
        value: impl Into<Value>,
    ) -> CoreResult<()> {
        self.update_if_needed(txn)?;
        txn.set_value(self.table, self.key, col, value.into())
    }

    /// Erases this object, cascading as required.
    ///
    /// # Errors
    ///
    /// Fails if the object is already gone.
    pub fn erase(self, txn: &mut WriteTransaction<'_>) -> CoreResult<()> {
        txn.erase_object(self.table, self.key)
    }

    /// Number of incoming links.
    ///
    /// # Errors
    ///
    /// Fails if the object is gone.
    pub fn backlink_count(&self, txn: &mut Transaction) -> CoreResult<usize> {
        self.update_if_needed(txn)?;
        txn.backlink_count(self.table, self.key)
    }

    /// A list handle over a list column.
    ///
    /// # Errors
    ///
    /// Fails if the column is not a list.
    pub fn list(&self, txn: &mut Transaction, col: ColKey) -> CoreResult<List> {
        let spec = txn.spec(self.table)?;
        let col_spec = spec.column(col)?;
        if !col_spec.attrs.contains(ColumnAttr::LIST)
            || col_spec.col_type == crate::schema::ColumnType::Link
        {
            return Err(CoreError::CollectionTypeMismatch {
                column: col_spec.name.clone(),
            });
        }
        Ok(List::new(self.table, self.key, col))
    }

    /// A link-list handle over a link list column.
    ///
    /// # Errors
    ///
    /// Fails if the column is not a link list.
    pub fn link_list(&self, txn: &mut Transaction, col: ColKey) -> CoreResult<LinkList> {
        let spec = txn.spec(self.table)?;
        let col_spec = spec.column(col)?;
        if !col_spec.attrs.contains(ColumnAttr::LIST)
            || col_spec.col_type != crate::schema::ColumnType::Link
        {
            return Err(CoreError::CollectionTypeMismatch {
                column: col_spec.name.clone(),
            });
        }
        Ok(LinkList::new(self.table, self.key, col))
    }

    /// A set handle over a set column.
    ///
    /// # Errors
    ///
    /// Fails if the column is not a set.
    pub fn set_collection(&self, txn: &mut Transaction, col: ColKey) -> CoreResult<Set> {
        let spec = txn.spec(self.table)?;
        let col_spec = spec.column(col)?;
        if !col_spec.attrs.contains(ColumnAttr::SET) {
            return Err(CoreError::CollectionTypeMismatch {
                column: col_spec.name.clone(),
            });
        }
        Ok(Set::new(self.table, self.key, col))
    }

    /// A dictionary handle over a dictionary column.
    ///
    /// # Errors
    ///
    /// Fails if the column is not a dictionary.
    pub fn dictionary(&self, txn: &mut Transaction, col: ColKey) -> CoreResult<Dictionary> {
        let spec = txn.spec(self.table)?;
        let col_spec = spec.column(col)?;
        if !col_spec.attrs.contains(ColumnAttr::DICTIONARY) {
            return Err(CoreError::CollectionTypeMismatch {
                column: col_spec.name.clone(),
            });
        }
        Ok(Dictionary::new(self.table, self.key, col))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::Db;
    use crate::schema::{ColumnSpec, TableType};

    #[test]
    fn accessor_survives_other_mutations() {
        let db = Db::open_in_memory().unwrap();
        let mut txn = db.begin_write().unwrap();
        let table = txn.add_table("t", TableType::TopLevel).unwrap();
        let col = txn.add_column(table.key(), ColumnSpec::int("v")).unwrap();

        let obj = txn.create_object(table.key()).unwrap();
        obj.set(&mut txn, col, 1i64).unwrap();

        // Create enough objects to force cluster splits; the cached
        // cluster position of `obj` goes stale.
        for _ in 0..600 {
            txn.create_object(table.key()).unwrap();
        }

        assert_eq!(obj.get(&mut txn, col).unwrap(), Value::Int(1));
        obj.set(&mut txn, col, 2i64).unwrap();
        assert_eq!(obj.get(&mut txn, col).unwrap(), Value::Int(2));
    }

    #[test]
    fn update_if_needed_reports_refresh() {
        let db = Db::open_in_memory().unwrap();
        let mut txn = db.begin_write().unwrap();
        let table = txn.add_table("t", TableType::TopLevel).unwrap();
        let obj = txn.create_object(table.key()).unwrap();

        assert!(obj.update_if_needed(&mut txn).unwrap());
        assert!(!obj.update_if_needed(&mut txn).unwrap());

        txn.create_object(table.key()).unwrap();
        assert!(obj.update_if_needed(&mut txn).unwrap());
    }

    #[test]
    fn stale_accessor_reports_invalid() {
        let db = Db::open_in_memory().unwrap();
        let mut txn = db.begin_write().unwrap();
        let table = txn.add_table("t", TableType::TopLevel).unwrap();
        let obj = txn.create_object(table.key()).unwrap();
        let copy = obj.clone();
        obj.erase(&mut txn).unwrap();
        assert!(!copy.is_valid(&mut txn));
    }
}
