//! Table handles.

use crate::error::CoreResult;
use crate::keys::{ColKey, ObjKey, TableKey};
use crate::obj::Obj;
use crate::schema::ColumnSpec;
use crate::transaction::{Transaction, WriteTransaction};
use crate::value::Value;

/// A handle to one table.
///
/// The handle is a key; all state lives in the transaction it is used
/// with.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Table {
    key: TableKey,
}

impl Table {
    pub(crate) fn new(key: TableKey) -> Self {
        Self { key }
    }

    /// The table's key.
    #[must_use]
    pub fn key(&self) -> TableKey {
        self.key
    }

    /// The table's name.
    ///
    /// # Errors
    ///
    /// Fails if the key is stale.
    pub fn name(&self, txn: &Transaction) -> CoreResult<String> {
        txn.table_name(self.key)
    }

    /// Looks up a column by name.
    ///
    /// # Errors
    ///
    /// Fails with [`CoreError::NoSuchColumn`](crate::CoreError) if
    /// absent.
    pub fn column(&self, txn: &mut Transaction, name: &str) -> CoreResult<ColKey> {
        let spec = txn.spec(self.key)?;
        spec.column_by_name(name)
            .ok_or_else(|| crate::CoreError::NoSuchColumn {
                name: name.to_owned(),
            })
    }

    /// Adds a column.
    ///
    /// # Errors
    ///
    /// Fails on duplicate names.
    pub fn add_column(
        &self,
        txn: &mut WriteTransaction<'_>,
        col: ColumnSpec,
    ) -> CoreResult<ColKey> {
        txn.add_column(self.key, col)
    }

    /// Removes a column.
    ///
    /// # Errors
    ///
    /// Fails if the column does not exist or is engine-managed.
    pub fn remove_column(&self, txn: &mut WriteTransaction<'_>, col: ColKey) -> CoreResult<()> {
        txn.remove_column(self.key, col)
    }

    /// Adds a search index to a column.
    ///
    /// # Errors
    ///
    /// Fails for collection, link, and backlink columns.
    pub fn add_search_index(
        &self,
        txn: &mut WriteTransaction<'_>,
        col: ColKey,
    ) -> CoreResult<()> {
        txn.add_search_index(self.key, col)
    }

    /// Removes a column's search index.
    ///
    /// # Errors
    ///
    /// Fails if the column key is stale.
    pub fn remove_search_index(
        &self,
        txn: &mut WriteTransaction<'_>,
        col: ColKey,
    ) -> CoreResult<()> {
        txn.remove_search_index(self.key, col)
    }

    /// Creates an object with a fresh key.
    ///
    /// # Errors
    ///
    /// Fails on embedded tables.
    pub fn create_object(&self, txn: &mut WriteTransaction<'_>) -> CoreResult<Obj> {
        txn.create_object(self.key)
    }

    /// Creates an object with a caller-chosen key, resolving a
    /// tombstone if one exists.
    ///
    /// # Errors
    ///
    /// Fails if the key is taken.
    pub fn create_object_with_key(
        &self,
        txn: &mut WriteTransaction<'_>,
        key: ObjKey,
    ) -> CoreResult<Obj> {
        txn.create_object_with_key(self.key, key)
    }

    /// Erases the object with `key`.
    ///
    /// # Errors
    ///
    /// Fails if the key is absent.
    pub fn erase_object(&self, txn: &mut WriteTransaction<'_>, key: ObjKey) -> CoreResult<()> {
        txn.erase_object(self.key, key)
    }

    /// Converts an object into an unresolved tombstone.
    ///
    /// # Errors
    ///
    /// Fails if the key is absent.
    pub fn invalidate_object(
        &self,
        txn: &mut WriteTransaction<'_>,
        key: ObjKey,
    ) -> CoreResult<ObjKey> {
        txn.invalidate_object(self.key, key)
    }

    /// A handle to the object with `key`.
    ///
    /// # Errors
    ///
    /// Fails if the key is absent.
    pub fn object(&self, txn: &mut Transaction, key: ObjKey) -> CoreResult<Obj> {
        if !txn.object_exists(self.key, key)? {
            return Err(crate::CoreError::KeyNotFound(key));
        }
        Ok(Obj::new(self.key, key))
    }

    /// True if an object with `key` exists.
    ///
    /// # Errors
    ///
    /// Fails on load errors.
    pub fn contains(&self, txn: &mut Transaction, key: ObjKey) -> CoreResult<bool> {
        txn.object_exists(self.key, key)
    }

    /// Number of live objects.
    ///
    /// # Errors
    ///
    /// Fails on load errors.
    pub fn object_count(&self, txn: &mut Transaction) -> CoreResult<usize> {
        txn.object_count(self.key)
    }

    /// All live object keys, ascending.
    ///
    /// # Errors
    ///
    /// Fails on load errors.
    pub fn object_keys(&self, txn: &mut Transaction) -> CoreResult<Vec<ObjKey>> {
        txn.object_keys(self.key)
    }

    /// Finds the first object whose column equals `value`, using the
    /// search index when the column has one.
    ///
    /// # Errors
    ///
    /// Fails on load errors.
    pub fn find_first(
        &self,
        txn: &mut WriteTransaction<'_>,
        col: ColKey,
        value: &Value,
    ) -> CoreResult<Option<ObjKey>> {
        txn.find_first(self.key, col, value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::Db;
    use crate::schema::{ColumnSpec, TableType};

    #[test]
    fn object_round_trip_through_handle() {
        let db = Db::open_in_memory().unwrap();
        let mut txn = db.begin_write().unwrap();
        let table = txn.add_table("people", TableType::TopLevel).unwrap();
        table
            .add_column(&mut txn, ColumnSpec::string("name"))
            .unwrap();
        let col = table.column(&mut txn, "name").unwrap();

        let obj = table.create_object(&mut txn).unwrap();
        obj.set(&mut txn, col, "fern").unwrap();

        let fetched = table.object(&mut txn, obj.key()).unwrap();
        assert_eq!(fetched.get(&mut txn, col).unwrap(), Value::from("fern"));
    }

    #[test]
    fn missing_column_name_errors() {
        let db = Db::open_in_memory().unwrap();
        let mut txn = db.begin_write().unwrap();
        let table = txn.add_table("t", TableType::TopLevel).unwrap();
        let result = table.column(&mut txn, "ghost");
        assert!(matches!(
            result,
            Err(crate::CoreError::NoSuchColumn { .. })
        ));
    }

    #[test]
    fn search_index_toggles() {
        let db = Db::open_in_memory().unwrap();
        let mut txn = db.begin_write().unwrap();
        let table = txn.add_table("t", TableType::TopLevel).unwrap();
        let col = table
            .add_column(&mut txn, ColumnSpec::string("name"))
            .unwrap();

        let obj = table.create_object(&mut txn).unwrap();
        obj.set(&mut txn, col, "fern").unwrap();

        table.add_search_index(&mut txn, col).unwrap();
        let found = table
            .find_first(&mut txn, col, &Value::from("fern"))
            .unwrap();
        assert_eq!(found, Some(obj.key()));

        table.remove_search_index(&mut txn, col).unwrap();
        // Lookup still works through the scan fallback.
        let found = table
            .find_first(&mut txn, col, &Value::from("fern"))
            .unwrap();
        assert_eq!(found, Some(obj.key()));
    }

    #[test]
    fn create_with_explicit_key() {
        let db = Db::open_in_memory().unwrap();
        let mut txn = db.begin_write().unwrap();
        let table = txn.add_table("t", TableType::TopLevel).unwrap();
        let obj = table
            .create_object_with_key(&mut txn, ObjKey::new(500))
            .unwrap();
        assert_eq!(obj.key(), ObjKey::new(500));
        // The next generated key does not collide.
        let next = table.create_object(&mut txn).unwrap();
        assert!(next.key().value() > 500);
    }
}
