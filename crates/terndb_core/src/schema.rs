//! Table schema: column types, attributes, and the persisted spec.

use crate::alloc::SlabAlloc;
use crate::array::{Array, StringLeaf};
use crate::error::{CoreError, CoreResult};
use crate::keys::{ColKey, Ref, TableKey};

/// Element type of a column.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ColumnType {
    /// 64-bit signed integer.
    Int = 0,
    /// Boolean.
    Bool = 1,
    /// UTF-8 string.
    String = 2,
    /// Byte blob.
    Binary = 3,
    /// Link to an object in another table.
    Link = 4,
}

impl ColumnType {
    /// Decodes a persisted type byte.
    pub(crate) fn from_byte(byte: u8) -> CoreResult<Self> {
        match byte {
            0 => Ok(Self::Int),
            1 => Ok(Self::Bool),
            2 => Ok(Self::String),
            3 => Ok(Self::Binary),
            4 => Ok(Self::Link),
            _ => Err(CoreError::file_corrupt(format!(
                "unknown column type byte {byte}"
            ))),
        }
    }
}

/// Column attribute bits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ColumnAttr(pub u8);

impl ColumnAttr {
    /// Cells may be null.
    pub const NULLABLE: Self = Self(1);
    /// The column is an ordered list.
    pub const LIST: Self = Self(2);
    /// The column is an unordered set.
    pub const SET: Self = Self(4);
    /// The column is a string-keyed dictionary.
    pub const DICTIONARY: Self = Self(8);
    /// Link removals may cascade-erase the target.
    pub const STRONG: Self = Self(16);
    /// The column has a search index.
    pub const INDEXED: Self = Self(32);
    /// Hidden reverse-edge column maintained by the engine.
    pub const BACKLINK: Self = Self(64);

    /// True if `flag` is set.
    #[must_use]
    pub const fn contains(self, flag: Self) -> bool {
        self.0 & flag.0 != 0
    }

    /// Returns the union of both attribute sets.
    #[must_use]
    pub const fn with(self, flag: Self) -> Self {
        Self(self.0 | flag.0)
    }

    /// True if any collection bit is set.
    #[must_use]
    pub const fn is_collection(self) -> bool {
        self.0 & (Self::LIST.0 | Self::SET.0 | Self::DICTIONARY.0) != 0
    }
}

/// Flavor of a table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum TableType {
    /// Ordinary table; objects are created and erased directly.
    TopLevel = 0,
    /// Embedded table; object lifetime is bound to exactly one
    /// incoming strong link.
    Embedded = 1,
}

impl TableType {
    pub(crate) fn from_byte(byte: u8) -> CoreResult<Self> {
        match byte {
            0 => Ok(Self::TopLevel),
            1 => Ok(Self::Embedded),
            _ => Err(CoreError::file_corrupt(format!(
                "unknown table type byte {byte}"
            ))),
        }
    }
}

/// One column of a table's spec.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ColumnSpec {
    /// Column name.
    pub name: String,
    /// Element type.
    pub col_type: ColumnType,
    /// Attribute bits.
    pub attrs: ColumnAttr,
    /// Target table, for link and backlink columns.
    pub target_table: Option<TableKey>,
    /// Origin column on the target table, for backlink columns.
    pub backlink_origin: Option<ColKey>,
}

impl ColumnSpec {
    /// An integer column.
    #[must_use]
    pub fn int(name: impl Into<String>) -> Self {
        Self::plain(name, ColumnType::Int)
    }

    /// A boolean column.
    #[must_use]
    pub fn bool(name: impl Into<String>) -> Self {
        Self::plain(name, ColumnType::Bool)
    }

    /// A string column.
    #[must_use]
    pub fn string(name: impl Into<String>) -> Self {
        Self::plain(name, ColumnType::String)
    }

    /// A binary column.
    #[must_use]
    pub fn binary(name: impl Into<String>) -> Self {
        Self::plain(name, ColumnType::Binary)
    }

    /// A link column targeting `target`.
    #[must_use]
    pub fn link(name: impl Into<String>, target: TableKey) -> Self {
        Self {
            name: name.into(),
            col_type: ColumnType::Link,
            attrs: ColumnAttr::default(),
            target_table: Some(target),
            backlink_origin: None,
        }
    }

    fn plain(name: impl Into<String>, col_type: ColumnType) -> Self {
        Self {
            name: name.into(),
            col_type,
            attrs: ColumnAttr::default(),
            target_table: None,
            backlink_origin: None,
        }
    }

    /// Makes the column nullable.
    #[must_use]
    pub fn nullable(mut self) -> Self {
        self.attrs = self.attrs.with(ColumnAttr::NULLABLE);
        self
    }

    /// Makes the column an ordered list.
    #[must_use]
    pub fn list(mut self) -> Self {
        self.attrs = self.attrs.with(ColumnAttr::LIST);
        self
    }

    /// Makes the column an unordered set.
    #[must_use]
    pub fn set(mut self) -> Self {
        self.attrs = self.attrs.with(ColumnAttr::SET);
        self
    }

    /// Makes the column a string-keyed dictionary.
    #[must_use]
    pub fn dictionary(mut self) -> Self {
        self.attrs = self.attrs.with(ColumnAttr::DICTIONARY);
        self
    }

    /// Makes the link column strong.
    #[must_use]
    pub fn strong(mut self) -> Self {
        self.attrs = self.attrs.with(ColumnAttr::STRONG);
        self
    }

    /// Adds a search index to the column.
    #[must_use]
    pub fn indexed(mut self) -> Self {
        self.attrs = self.attrs.with(ColumnAttr::INDEXED);
        self
    }

    /// True for hidden backlink columns.
    #[must_use]
    pub fn is_backlink(&self) -> bool {
        self.attrs.contains(ColumnAttr::BACKLINK)
    }

    /// True if cells hold a standalone collection ref.
    #[must_use]
    pub fn is_collection(&self) -> bool {
        self.attrs.is_collection()
    }
}

/// The decoded spec of a table: an ordered list of columns.
///
/// Backlink columns occupy indexes past the user-defined columns. For
/// every link column there is a matching backlink column on the target
/// table; the pairing is established by
/// [`Table::add_column`](crate::Table) and must never be broken.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TableSpec {
    /// All columns, including hidden backlink columns.
    pub columns: Vec<ColumnSpec>,
}

impl TableSpec {
    /// The column at `key`.
    ///
    /// # Errors
    ///
    /// Fails if the key is out of range.
    pub fn column(&self, key: ColKey) -> CoreResult<&ColumnSpec> {
        self.columns
            .get(key.index() as usize)
            .ok_or(CoreError::ColumnIndexOutOfRange { index: key.index() })
    }

    /// Finds a column by name, ignoring backlink columns.
    #[must_use]
    pub fn column_by_name(&self, name: &str) -> Option<ColKey> {
        self.columns
            .iter()
            .position(|col| !col.is_backlink() && col.name == name)
            .map(|index| ColKey::new(index as u32))
    }

    /// Number of columns, including backlinks.
    #[must_use]
    pub fn column_count(&self) -> usize {
        self.columns.len()
    }

    /// Iterates over the public (non-backlink) columns.
    pub fn public_columns(&self) -> impl Iterator<Item = (ColKey, &ColumnSpec)> {
        self.columns
            .iter()
            .enumerate()
            .filter(|(_, col)| !col.is_backlink())
            .map(|(index, col)| (ColKey::new(index as u32), col))
    }

    /// Iterates over the backlink columns.
    pub fn backlink_columns(&self) -> impl Iterator<Item = (ColKey, &ColumnSpec)> {
        self.columns
            .iter()
            .enumerate()
            .filter(|(_, col)| col.is_backlink())
            .map(|(index, col)| (ColKey::new(index as u32), col))
    }

    /// Stores the spec, returning its root ref.
    ///
    /// Layout: a parent array of three children - names (string leaf),
    /// packed type words, link fields.
    ///
    /// # Errors
    ///
    /// Fails on allocator I/O errors.
    pub fn store(&self, alloc: &mut SlabAlloc) -> CoreResult<Ref> {
        let mut names = StringLeaf::new();
        let mut types = Array::new(false);
        let mut links = Array::new(false);
        for col in &self.columns {
            names.push(Some(col.name.as_bytes()));
            types.push(i64::from(col.col_type as u8) | (i64::from(col.attrs.0) << 8));
            let link_word = match (col.target_table, col.backlink_origin) {
                (Some(table), Some(origin)) => {
                    i64::from(table.index()) | (i64::from(origin.index()) << 32)
                }
                (Some(table), None) => i64::from(table.index()),
                _ => -1,
            };
            links.push(link_word);
        }
        let names_ref = names.store(alloc)?;
        let types_ref = types.store(alloc)?;
        let links_ref = links.store(alloc)?;

        let mut parent = Array::new(true);
        parent.push(names_ref.offset() as i64);
        parent.push(types_ref.offset() as i64);
        parent.push(links_ref.offset() as i64);
        parent.store(alloc)
    }

    /// Loads a spec from its root ref.
    ///
    /// # Errors
    ///
    /// Fails on corrupt spec blocks.
    pub fn load(alloc: &SlabAlloc, r: Ref) -> CoreResult<Self> {
        let parent = Array::load(alloc, r)?;
        if parent.len() != 3 {
            return Err(CoreError::file_corrupt("spec must have 3 children"));
        }
        let names = StringLeaf::load(alloc, parent.get_ref(0))?;
        let types = Array::load(alloc, parent.get_ref(1))?;
        let links = Array::load(alloc, parent.get_ref(2))?;
        if names.len() != types.len() || types.len() != links.len() {
            return Err(CoreError::file_corrupt("spec children out of step"));
        }

        let mut columns = Vec::with_capacity(types.len());
        for i in 0..types.len() {
            let name_bytes = names
                .get(i)
                .ok_or_else(|| CoreError::file_corrupt("null column name"))?;
            let name = String::from_utf8(name_bytes.to_vec())
                .map_err(|_| CoreError::file_corrupt("column name not UTF-8"))?;
            let word = types.get(i);
            let col_type = ColumnType::from_byte((word & 0xff) as u8)?;
            let attrs = ColumnAttr(((word >> 8) & 0xff) as u8);
            let link_word = links.get(i);
            let (target_table, backlink_origin) = if link_word < 0 {
                (None, None)
            } else if attrs.contains(ColumnAttr::BACKLINK) {
                (
                    Some(TableKey::new((link_word & 0xffff_ffff) as u32)),
                    Some(ColKey::new((link_word >> 32) as u32)),
                )
            } else {
                (Some(TableKey::new((link_word & 0xffff_ffff) as u32)), None)
            };
            columns.push(ColumnSpec {
                name,
                col_type,
                attrs,
                target_table,
                backlink_origin,
            });
        }
        Ok(Self { columns })
    }

    /// Frees the spec's blocks.
    ///
    /// # Errors
    ///
    /// Fails on load errors.
    pub fn destroy_at(alloc: &mut SlabAlloc, r: Ref) -> CoreResult<()> {
        let parent = Array::load(alloc, r)?;
        StringLeaf::load(alloc, parent.get_ref(0))?.destroy(alloc);
        Array::load(alloc, parent.get_ref(1))?.destroy(alloc);
        Array::load(alloc, parent.get_ref(2))?.destroy(alloc);
        parent.destroy(alloc);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use terndb_storage::InMemoryBackend;

    fn new_alloc() -> SlabAlloc {
        SlabAlloc::open(Box::new(InMemoryBackend::new()), false).unwrap()
    }

    fn sample_spec() -> TableSpec {
        TableSpec {
            columns: vec![
                ColumnSpec::int("age").nullable().indexed(),
                ColumnSpec::string("name"),
                ColumnSpec::link("child", TableKey::new(3)).strong(),
                ColumnSpec::int("scores").list(),
                ColumnSpec {
                    name: "!backlink_2_1".into(),
                    col_type: ColumnType::Link,
                    attrs: ColumnAttr::BACKLINK,
                    target_table: Some(TableKey::new(2)),
                    backlink_origin: Some(ColKey::new(1)),
                },
            ],
        }
    }

    #[test]
    fn store_load_roundtrip() {
        let mut alloc = new_alloc();
        let spec = sample_spec();
        let r = spec.store(&mut alloc).unwrap();
        let loaded = TableSpec::load(&alloc, r).unwrap();
        assert_eq!(loaded, spec);
    }

    #[test]
    fn column_by_name_skips_backlinks() {
        let spec = sample_spec();
        assert_eq!(spec.column_by_name("age"), Some(ColKey::new(0)));
        assert_eq!(spec.column_by_name("!backlink_2_1"), None);
    }

    #[test]
    fn public_and_backlink_split() {
        let spec = sample_spec();
        assert_eq!(spec.public_columns().count(), 4);
        assert_eq!(spec.backlink_columns().count(), 1);
    }

    #[test]
    fn attrs_contain() {
        let col = ColumnSpec::int("x").nullable().indexed();
        assert!(col.attrs.contains(ColumnAttr::NULLABLE));
        assert!(col.attrs.contains(ColumnAttr::INDEXED));
        assert!(!col.attrs.contains(ColumnAttr::LIST));
    }

    #[test]
    fn link_needs_target() {
        let col = ColumnSpec::link("child", TableKey::new(7));
        assert_eq!(col.target_table, Some(TableKey::new(7)));
        assert_eq!(col.col_type, ColumnType::Link);
    }
}
