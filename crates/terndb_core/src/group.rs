//! The group: the directory of tables under a single top ref.
//!
//! Persisted layout: the top ref points at a two-child parent array
//! holding the table-name string leaf and the array of table root
//! refs. Each table root is a four-child array: spec ref, cluster tree
//! root, tagged next-key counter, tagged table flavor.
//!
//! A transaction loads the directory once and caches per-table state
//! lazily; at commit, dirty tables are re-stored and a fresh directory
//! becomes the new top ref.

use crate::alloc::SlabAlloc;
use crate::array::{tag_int, untag_int, Array, StringLeaf};
use crate::cluster::ClusterTree;
use crate::error::{CoreError, CoreResult};
use crate::keys::Ref;
use crate::schema::{TableSpec, TableType};
use crate::value::Value;
use std::collections::{BTreeMap, HashMap};

/// Cached state of one table.
pub(crate) struct TableState {
    pub(crate) spec: TableSpec,
    pub(crate) ct: ClusterTree,
    pub(crate) next_key: i64,
    pub(crate) table_type: TableType,
    pub(crate) dirty: bool,
    /// Search index caches, keyed by column index.
    pub(crate) indexes: HashMap<u32, BTreeMap<Value, Vec<i64>>>,
}

/// The loaded group directory.
#[derive(Default)]
pub(crate) struct GroupCache {
    pub(crate) names: Vec<String>,
    pub(crate) table_refs: Vec<Ref>,
    pub(crate) tables: HashMap<u32, TableState>,
    pub(crate) dirty: bool,
}

/// Loads the group directory from the top ref. A null top ref is an
/// empty group (fresh file).
pub(crate) fn load_group(alloc: &SlabAlloc, top: Ref) -> CoreResult<GroupCache> {
    if top.is_null() {
        return Ok(GroupCache::default());
    }
    let group = Array::load(alloc, top)?;
    if group.len() != 2 {
        return Err(CoreError::file_corrupt("group must have 2 children"));
    }
    let names_leaf = StringLeaf::load(alloc, group.get_ref(0))?;
    let refs = Array::load(alloc, group.get_ref(1))?;
    if names_leaf.len() != refs.len() {
        return Err(CoreError::file_corrupt("group directory out of step"));
    }
    let mut names = Vec::with_capacity(names_leaf.len());
    for i in 0..names_leaf.len() {
        let bytes = names_leaf
            .get(i)
            .ok_or_else(|| CoreError::file_corrupt("null table name"))?;
        names.push(
            String::from_utf8(bytes.to_vec())
                .map_err(|_| CoreError::file_corrupt("table name not UTF-8"))?,
        );
    }
    let table_refs = (0..refs.len()).map(|i| refs.get_ref(i)).collect();
    Ok(GroupCache {
        names,
        table_refs,
        tables: HashMap::new(),
        dirty: false,
    })
}

/// Loads one table's state from its root ref.
pub(crate) fn load_table_state(alloc: &SlabAlloc, r: Ref) -> CoreResult<TableState> {
    let root = Array::load(alloc, r)?;
    if root.len() != 4 {
        return Err(CoreError::file_corrupt("table root must have 4 children"));
    }
    let spec = TableSpec::load(alloc, root.get_ref(0))?;
    let ct = ClusterTree::attach(root.get_ref(1));
    let next_key = untag_int(root.get(2));
    let table_type = TableType::from_byte(untag_int(root.get(3)) as u8)?;
    Ok(TableState {
        spec,
        ct,
        next_key,
        table_type,
        dirty: false,
        indexes: HashMap::new(),
    })
}

/// Re-stores every dirty table and writes a fresh directory, returning
/// the new top ref for the commit.
pub(crate) fn store_group(alloc: &mut SlabAlloc, group: &mut GroupCache) -> CoreResult<Ref> {
    for (&index, state) in group.tables.iter_mut() {
        if !state.dirty {
            continue;
        }
        let spec_ref = state.spec.store(alloc)?;
        let mut root = Array::new(true);
        root.push(spec_ref.offset() as i64);
        root.push(state.ct.root_ref().offset() as i64);
        root.push(tag_int(state.next_key));
        root.push(tag_int(i64::from(state.table_type as u8)));
        let table_ref = root.store(alloc)?;
        group.table_refs[index as usize] = table_ref;
        state.dirty = false;
    }

    let mut names = StringLeaf::new();
    for name in &group.names {
        names.push(Some(name.as_bytes()));
    }
    let names_ref = names.store(alloc)?;

    let mut refs = Array::new(true);
    for r in &group.table_refs {
        refs.push(r.offset() as i64);
    }
    let refs_ref = refs.store(alloc)?;

    let mut root = Array::new(true);
    root.push(names_ref.offset() as i64);
    root.push(refs_ref.offset() as i64);
    root.store(alloc)
}

#[cfg(test)]
mod tests {
    use super::*;
    use terndb_storage::InMemoryBackend;

    fn new_alloc() -> SlabAlloc {
        SlabAlloc::open(Box::new(InMemoryBackend::new()), false).unwrap()
    }

    #[test]
    fn null_top_is_empty_group() {
        let alloc = new_alloc();
        let group = load_group(&alloc, Ref::NULL).unwrap();
        assert!(group.names.is_empty());
        assert!(group.table_refs.is_empty());
    }

    #[test]
    fn directory_roundtrip() {
        let mut alloc = new_alloc();
        let mut group = GroupCache::default();
        for (i, name) in ["alpha", "beta"].iter().enumerate() {
            let ct = ClusterTree::create(&mut alloc, &TableSpec::default()).unwrap();
            group.names.push((*name).to_owned());
            group.table_refs.push(Ref::NULL);
            group.tables.insert(
                i as u32,
                TableState {
                    spec: TableSpec::default(),
                    ct,
                    next_key: 7 + i as i64,
                    table_type: TableType::TopLevel,
                    dirty: true,
                    indexes: HashMap::new(),
                },
            );
        }

        let top = store_group(&mut alloc, &mut group).unwrap();
        let loaded = load_group(&alloc, top).unwrap();
        assert_eq!(loaded.names, vec!["alpha", "beta"]);
        assert_eq!(loaded.table_refs.len(), 2);

        let state = load_table_state(&alloc, loaded.table_refs[1]).unwrap();
        assert_eq!(state.next_key, 8);
        assert_eq!(state.table_type, TableType::TopLevel);
        assert!(!state.dirty);
    }

    #[test]
    fn clean_tables_keep_their_refs() {
        let mut alloc = new_alloc();
        let mut group = GroupCache::default();
        let ct = ClusterTree::create(&mut alloc, &TableSpec::default()).unwrap();
        group.names.push("t".into());
        group.table_refs.push(Ref::NULL);
        group.tables.insert(
            0,
            TableState {
                spec: TableSpec::default(),
                ct,
                next_key: 0,
                table_type: TableType::Embedded,
                dirty: true,
                indexes: HashMap::new(),
            },
        );
        store_group(&mut alloc, &mut group).unwrap();
        let stored_ref = group.table_refs[0];

        // A second commit with nothing dirty reuses the table root.
        store_group(&mut alloc, &mut group).unwrap();
        assert_eq!(group.table_refs[0], stored_ref);

        let state = load_table_state(&alloc, stored_ref).unwrap();
        assert_eq!(state.table_type, TableType::Embedded);
    }

    #[test]
    fn corrupt_directory_rejected() {
        let mut alloc = new_alloc();
        // A one-child array is not a valid group parent.
        let mut bogus = Array::new(true);
        let mut leaf = StringLeaf::new();
        let leaf_ref = leaf.store(&mut alloc).unwrap();
        bogus.push(leaf_ref.offset() as i64);
        let top = bogus.store(&mut alloc).unwrap();

        assert!(matches!(
            load_group(&alloc, top),
            Err(CoreError::FileCorrupt { .. })
        ));
    }
}
