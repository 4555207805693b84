//! Clusters (row groups) and the cluster tree.
//!
//! A cluster is one array acting as parent: child 0 is the sorted key
//! vector, children 1..N are per-column leaf arrays, all index-aligned.
//! The cluster tree is a B+-tree of clusters keyed by object key; inner
//! nodes hold `(tagged first key, child ref)` pairs.
//!
//! Mutations are copy-on-write: every operation that touches a cluster
//! rewrites the path from the root and returns the new root ref.

use crate::alloc::SlabAlloc;
use crate::array::{tag_int, untag_int, Array, ArrayHeader, StringLeaf};
use crate::error::{CoreError, CoreResult};
use crate::keys::{ObjKey, Ref};
use crate::schema::{ColumnSpec, ColumnType, TableSpec};

/// Maximum number of rows in a cluster before it splits.
pub const CLUSTER_MAX: usize = 256;

/// Null sentinel stored in nullable integer cells.
pub(crate) const INT_NULL: i64 = i64::MIN;

/// Null sentinel stored in nullable boolean cells.
pub(crate) const BOOL_NULL: i64 = -1;

/// Encodes an object key for storage in a link cell. Zero means null.
pub(crate) fn encode_link(key: Option<ObjKey>) -> i64 {
    match key {
        Some(key) => key.value() + 1,
        None => 0,
    }
}

/// Decodes a link cell.
pub(crate) fn decode_link(word: i64) -> Option<ObjKey> {
    if word == 0 {
        None
    } else {
        Some(ObjKey::new(word - 1))
    }
}

/// Physical layout of a column's leaf inside a cluster.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum LeafKind {
    /// Width-packed integers: int, bool, and single-link cells.
    Packed,
    /// Refs and tagged values: collection roots and backlink cells.
    Refs,
    /// Variable-width entries: string and binary cells.
    Strings,
}

pub(crate) fn leaf_kind(col: &ColumnSpec) -> LeafKind {
    if col.is_collection() || col.is_backlink() {
        LeafKind::Refs
    } else {
        match col.col_type {
            ColumnType::Int | ColumnType::Bool | ColumnType::Link => LeafKind::Packed,
            ColumnType::String | ColumnType::Binary => LeafKind::Strings,
        }
    }
}

/// A raw cell as stored in a cluster leaf.
#[derive(Debug, Clone, PartialEq)]
pub(crate) enum Cell {
    /// Storage word of a packed or ref leaf.
    Int(i64),
    /// Entry of a string leaf.
    Str(Option<Vec<u8>>),
}

impl Cell {
    pub(crate) fn as_int(&self) -> i64 {
        match self {
            Self::Int(value) => *value,
            Self::Str(_) => 0,
        }
    }
}

/// The default cell for a freshly created row.
pub(crate) fn default_cell(col: &ColumnSpec) -> Cell {
    match leaf_kind(col) {
        LeafKind::Refs => Cell::Int(0),
        LeafKind::Packed => match col.col_type {
            ColumnType::Link => Cell::Int(encode_link(None)),
            ColumnType::Bool if col.attrs.contains(crate::schema::ColumnAttr::NULLABLE) => {
                Cell::Int(BOOL_NULL)
            }
            ColumnType::Int if col.attrs.contains(crate::schema::ColumnAttr::NULLABLE) => {
                Cell::Int(INT_NULL)
            }
            _ => Cell::Int(0),
        },
        LeafKind::Strings => {
            if col.attrs.contains(crate::schema::ColumnAttr::NULLABLE) {
                Cell::Str(None)
            } else {
                Cell::Str(Some(Vec::new()))
            }
        }
    }
}

/// One column leaf, loaded.
enum Leaf {
    Packed(Array),
    Refs(Array),
    Strings(StringLeaf),
}

impl Leaf {
    fn new(kind: LeafKind) -> Self {
        match kind {
            LeafKind::Packed => Self::Packed(Array::new(false)),
            LeafKind::Refs => Self::Refs(Array::new(true)),
            LeafKind::Strings => Self::Strings(StringLeaf::new()),
        }
    }

    fn load(alloc: &SlabAlloc, kind: LeafKind, r: Ref) -> CoreResult<Self> {
        Ok(match kind {
            LeafKind::Packed => Self::Packed(Array::load(alloc, r)?),
            LeafKind::Refs => Self::Refs(Array::load(alloc, r)?),
            LeafKind::Strings => Self::Strings(StringLeaf::load(alloc, r)?),
        })
    }

    fn store(&mut self, alloc: &mut SlabAlloc) -> CoreResult<Ref> {
        match self {
            Self::Packed(array) | Self::Refs(array) => array.store(alloc),
            Self::Strings(leaf) => leaf.store(alloc),
        }
    }

    fn destroy(self, alloc: &mut SlabAlloc) {
        match self {
            Self::Packed(array) | Self::Refs(array) => array.destroy(alloc),
            Self::Strings(leaf) => leaf.destroy(alloc),
        }
    }

    fn len(&self) -> usize {
        match self {
            Self::Packed(array) | Self::Refs(array) => array.len(),
            Self::Strings(leaf) => leaf.len(),
        }
    }

    fn get(&self, index: usize) -> Cell {
        match self {
            Self::Packed(array) | Self::Refs(array) => Cell::Int(array.get(index)),
            Self::Strings(leaf) => Cell::Str(leaf.get(index).map(<[u8]>::to_vec)),
        }
    }

    fn set(&mut self, index: usize, cell: &Cell) {
        match (self, cell) {
            (Self::Packed(array) | Self::Refs(array), Cell::Int(value)) => {
                array.set(index, *value);
            }
            (Self::Strings(leaf), Cell::Str(value)) => leaf.set(index, value.as_deref()),
            _ => unreachable!("cell kind mismatch"),
        }
    }

    fn insert(&mut self, index: usize, cell: &Cell) {
        match (self, cell) {
            (Self::Packed(array) | Self::Refs(array), Cell::Int(value)) => {
                array.insert(index, *value);
            }
            (Self::Strings(leaf), Cell::Str(value)) => leaf.insert(index, value.as_deref()),
            _ => unreachable!("cell kind mismatch"),
        }
    }

    fn erase(&mut self, index: usize) -> Cell {
        let cell = self.get(index);
        match self {
            Self::Packed(array) | Self::Refs(array) => {
                array.erase(index);
            }
            Self::Strings(leaf) => leaf.erase(index),
        }
        cell
    }

    fn split_off(&mut self, at: usize) -> Self {
        match self {
            Self::Packed(array) => {
                let tail: Vec<i64> = (at..array.len()).map(|i| array.get(i)).collect();
                array.truncate(at);
                Self::Packed(Array::from_values(false, tail))
            }
            Self::Refs(array) => {
                let tail: Vec<i64> = (at..array.len()).map(|i| array.get(i)).collect();
                array.truncate(at);
                Self::Refs(Array::from_values(true, tail))
            }
            Self::Strings(leaf) => {
                let mut tail = StringLeaf::new();
                for i in at..leaf.len() {
                    let owned = leaf.get(i).map(<[u8]>::to_vec);
                    tail.push(owned.as_deref());
                }
                while leaf.len() > at {
                    leaf.erase(at);
                }
                Self::Strings(tail)
            }
        }
    }
}

/// A loaded cluster: the sorted key vector plus one leaf per column.
///
/// All leaves are index-aligned with the key vector at all times; a
/// size mismatch after any operation is file corruption.
pub struct Cluster {
    parent: Array,
    keys: Array,
    leaves: Vec<Leaf>,
}

impl Cluster {
    fn new(spec: &TableSpec) -> Self {
        Self {
            parent: Array::new(true),
            keys: Array::new(false),
            leaves: spec
                .columns
                .iter()
                .map(|col| Leaf::new(leaf_kind(col)))
                .collect(),
        }
    }

    fn load(alloc: &SlabAlloc, spec: &TableSpec, r: Ref) -> CoreResult<Self> {
        let parent = Array::load(alloc, r)?;
        if parent.len() != spec.column_count() + 1 {
            return Err(CoreError::file_corrupt(
                "cluster child count does not match spec",
            ));
        }
        let keys = Array::load(alloc, parent.get_ref(0))?;
        let mut leaves = Vec::with_capacity(spec.column_count());
        for (i, col) in spec.columns.iter().enumerate() {
            let leaf = Leaf::load(alloc, leaf_kind(col), parent.get_ref(i + 1))?;
            if leaf.len() != keys.len() {
                return Err(CoreError::file_corrupt(
                    "cluster column leaf out of step with key vector",
                ));
            }
            leaves.push(leaf);
        }
        Ok(Self {
            parent,
            keys,
            leaves,
        })
    }

    fn store(&mut self, alloc: &mut SlabAlloc) -> CoreResult<Ref> {
        let keys_ref = self.keys.store(alloc)?;
        let mut child_refs = Vec::with_capacity(1 + self.leaves.len());
        child_refs.push(keys_ref);
        for leaf in &mut self.leaves {
            child_refs.push(leaf.store(alloc)?);
        }
        self.parent.clear();
        for r in child_refs {
            self.parent.push(r.offset() as i64);
        }
        self.parent.store(alloc)
    }

    fn destroy_shallow(self, alloc: &mut SlabAlloc) {
        self.keys.destroy(alloc);
        for leaf in self.leaves {
            leaf.destroy(alloc);
        }
        self.parent.destroy(alloc);
    }

    fn row_count(&self) -> usize {
        self.keys.len()
    }

    fn first_key(&self) -> Option<i64> {
        if self.keys.is_empty() {
            None
        } else {
            Some(self.keys.get(0))
        }
    }

    fn position_of(&self, key: ObjKey) -> Option<usize> {
        let pos = self.keys.lower_bound(key.value());
        if pos < self.keys.len() && self.keys.get(pos) == key.value() {
            Some(pos)
        } else {
            None
        }
    }

    fn insert_row(&mut self, spec: &TableSpec, key: ObjKey) -> CoreResult<usize> {
        let pos = self.keys.lower_bound(key.value());
        if pos < self.keys.len() && self.keys.get(pos) == key.value() {
            return Err(CoreError::KeyAlreadyUsed(key));
        }
        self.keys.insert(pos, key.value());
        for (leaf, col) in self.leaves.iter_mut().zip(&spec.columns) {
            leaf.insert(pos, &default_cell(col));
        }
        Ok(pos)
    }

    fn erase_row(&mut self, pos: usize) -> Vec<Cell> {
        self.keys.erase(pos);
        self.leaves.iter_mut().map(|leaf| leaf.erase(pos)).collect()
    }

    fn split(&mut self, spec: &TableSpec) -> Cluster {
        let at = self.row_count() / 2;
        let tail_keys: Vec<i64> = (at..self.keys.len()).map(|i| self.keys.get(i)).collect();
        self.keys.truncate(at);
        let mut right = Cluster::new(spec);
        right.keys = Array::from_values(false, tail_keys);
        right.leaves = self
            .leaves
            .iter_mut()
            .map(|leaf| leaf.split_off(at))
            .collect();
        right
    }
}

fn node_is_inner(alloc: &SlabAlloc, r: Ref) -> CoreResult<bool> {
    let bytes: [u8; 8] = alloc
        .read_bytes(r, 0, 8)?
        .try_into()
        .map_err(|_| CoreError::InvalidRef(r))?;
    Ok(ArrayHeader::decode(&bytes)?.is_inner_node)
}

/// First key stored under a node (cluster or inner).
fn node_first_key(alloc: &SlabAlloc, spec: &TableSpec, r: Ref) -> CoreResult<Option<i64>> {
    if node_is_inner(alloc, r)? {
        let node = Array::load(alloc, r)?;
        if node.is_empty() {
            return Ok(None);
        }
        Ok(Some(untag_int(node.get(0))))
    } else {
        Ok(Cluster::load(alloc, spec, r)?.first_key())
    }
}

/// Outcome of a keyed insert below the root.
enum KeyedInsert {
    Done(Ref),
    Split { left: Ref, right: Ref, right_key: i64 },
}

/// The B+-tree of clusters for one table.
///
/// The union of the cluster key ranges is a disjoint cover of the
/// table's live keys; lookup is O(log N).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ClusterTree {
    root: Ref,
}

impl ClusterTree {
    /// Creates a tree with a single empty cluster.
    ///
    /// # Errors
    ///
    /// Fails on allocator I/O errors.
    pub fn create(alloc: &mut SlabAlloc, spec: &TableSpec) -> CoreResult<Self> {
        let root = Cluster::new(spec).store(alloc)?;
        Ok(Self { root })
    }

    /// Attaches to an existing tree.
    #[must_use]
    pub fn attach(root: Ref) -> Self {
        Self { root }
    }

    /// The current root ref.
    #[must_use]
    pub fn root_ref(&self) -> Ref {
        self.root
    }

    /// True if the tree holds `key`.
    ///
    /// # Errors
    ///
    /// Fails on load errors.
    pub fn contains(&self, alloc: &SlabAlloc, spec: &TableSpec, key: ObjKey) -> CoreResult<bool> {
        Ok(self.locate(alloc, spec, key)?.is_some())
    }

    /// Locates `key`, returning its cluster ref and row position.
    pub(crate) fn locate(
        &self,
        alloc: &SlabAlloc,
        spec: &TableSpec,
        key: ObjKey,
    ) -> CoreResult<Option<(Ref, usize)>> {
        let mut r = self.root;
        loop {
            if node_is_inner(alloc, r)? {
                let node = Array::load(alloc, r)?;
                let mut target = 0usize;
                for pair in 0..node.len() / 2 {
                    if untag_int(node.get(pair * 2)) <= key.value() {
                        target = pair;
                    } else {
                        break;
                    }
                }
                r = node.get_ref(target * 2 + 1);
            } else {
                let cluster = Cluster::load(alloc, spec, r)?;
                return Ok(cluster.position_of(key).map(|pos| (r, pos)));
            }
        }
    }

    /// Creates a row for `key` with default cells.
    ///
    /// # Errors
    ///
    /// Fails with [`CoreError::KeyAlreadyUsed`] on a duplicate key.
    pub fn insert(
        &mut self,
        alloc: &mut SlabAlloc,
        spec: &TableSpec,
        key: ObjKey,
    ) -> CoreResult<()> {
        match Self::insert_in(alloc, spec, self.root, key)? {
            KeyedInsert::Done(root) => {
                self.root = root;
            }
            KeyedInsert::Split {
                left,
                right,
                right_key,
            } => {
                let left_key =
                    node_first_key(alloc, spec, left)?.unwrap_or(i64::MIN);
                let mut node = Array::new_inner();
                node.push(tag_int(left_key));
                node.push(left.offset() as i64);
                node.push(tag_int(right_key));
                node.push(right.offset() as i64);
                self.root = node.store(alloc)?;
            }
        }
        Ok(())
    }

    fn insert_in(
        alloc: &mut SlabAlloc,
        spec: &TableSpec,
        r: Ref,
        key: ObjKey,
    ) -> CoreResult<KeyedInsert> {
        if node_is_inner(alloc, r)? {
            let mut node = Array::load(alloc, r)?;
            let mut target = 0usize;
            for pair in 0..node.len() / 2 {
                if untag_int(node.get(pair * 2)) <= key.value() {
                    target = pair;
                } else {
                    break;
                }
            }
            let child = node.get_ref(target * 2 + 1);
            match Self::insert_in(alloc, spec, child, key)? {
                KeyedInsert::Done(new_child) => {
                    node.set(target * 2 + 1, new_child.offset() as i64);
                    // The inserted key may precede the recorded first key.
                    let first = node_first_key(alloc, spec, new_child)?
                        .unwrap_or_else(|| untag_int(node.get(target * 2)));
                    node.set(target * 2, tag_int(first));
                    Ok(KeyedInsert::Done(node.store(alloc)?))
                }
                KeyedInsert::Split {
                    left,
                    right,
                    right_key,
                } => {
                    node.set(target * 2 + 1, left.offset() as i64);
                    let first = node_first_key(alloc, spec, left)?
                        .unwrap_or_else(|| untag_int(node.get(target * 2)));
                    node.set(target * 2, tag_int(first));
                    node.insert(target * 2 + 2, tag_int(right_key));
                    node.insert(target * 2 + 3, right.offset() as i64);
                    if node.len() / 2 <= crate::bptree::INNER_MAX {
                        return Ok(KeyedInsert::Done(node.store(alloc)?));
                    }
                    let split_pair = node.len() / 2 / 2;
                    let mut right_node = Array::new_inner();
                    for i in split_pair * 2..node.len() {
                        right_node.push(node.get(i));
                    }
                    node.truncate(split_pair * 2);
                    let right_key = untag_int(right_node.get(0));
                    Ok(KeyedInsert::Split {
                        left: node.store(alloc)?,
                        right: right_node.store(alloc)?,
                        right_key,
                    })
                }
            }
        } else {
            let mut cluster = Cluster::load(alloc, spec, r)?;
            cluster.insert_row(spec, key)?;
            if cluster.row_count() <= CLUSTER_MAX {
                return Ok(KeyedInsert::Done(cluster.store(alloc)?));
            }
            let mut right = cluster.split(spec);
            let right_key = right.first_key().expect("split half is non-empty");
            Ok(KeyedInsert::Split {
                left: cluster.store(alloc)?,
                right: right.store(alloc)?,
                right_key,
            })
        }
    }

    /// Erases the row for `key`, returning its cells.
    ///
    /// The caller is responsible for tearing down collection roots and
    /// backlink bookkeeping held in the returned cells.
    ///
    /// # Errors
    ///
    /// Fails with [`CoreError::KeyNotFound`] if the key is absent.
    pub(crate) fn erase(
        &mut self,
        alloc: &mut SlabAlloc,
        spec: &TableSpec,
        key: ObjKey,
    ) -> CoreResult<Vec<Cell>> {
        let (new_root, cells) = Self::erase_in(alloc, spec, self.root, key)?;
        if let Some(root) = new_root {
            self.root = root;
        } else {
            // The last cluster emptied; keep a single empty cluster.
            self.root = Cluster::new(spec).store(alloc)?;
        }
        Ok(cells)
    }

    fn erase_in(
        alloc: &mut SlabAlloc,
        spec: &TableSpec,
        r: Ref,
        key: ObjKey,
    ) -> CoreResult<(Option<Ref>, Vec<Cell>)> {
        if node_is_inner(alloc, r)? {
            let mut node = Array::load(alloc, r)?;
            let mut target = 0usize;
            for pair in 0..node.len() / 2 {
                if untag_int(node.get(pair * 2)) <= key.value() {
                    target = pair;
                } else {
                    break;
                }
            }
            let child = node.get_ref(target * 2 + 1);
            let (new_child, cells) = Self::erase_in(alloc, spec, child, key)?;
            match new_child {
                Some(new_child) => {
                    node.set(target * 2 + 1, new_child.offset() as i64);
                    if let Some(first) = node_first_key(alloc, spec, new_child)? {
                        node.set(target * 2, tag_int(first));
                    }
                }
                None => {
                    node.erase(target * 2);
                    node.erase(target * 2);
                }
            }
            if node.is_empty() {
                node.destroy(alloc);
                return Ok((None, cells));
            }
            if node.len() == 2 {
                // A single child makes the inner node redundant.
                let only = node.get_ref(1);
                node.destroy(alloc);
                return Ok((Some(only), cells));
            }
            Ok((Some(node.store(alloc)?), cells))
        } else {
            let mut cluster = Cluster::load(alloc, spec, r)?;
            let pos = cluster
                .position_of(key)
                .ok_or(CoreError::KeyNotFound(key))?;
            let cells = cluster.erase_row(pos);
            if cluster.row_count() == 0 {
                cluster.destroy_shallow(alloc);
                return Ok((None, cells));
            }
            Ok((Some(cluster.store(alloc)?), cells))
        }
    }

    /// Reads one cell.
    ///
    /// # Errors
    ///
    /// Fails if the key is absent.
    pub(crate) fn get_cell(
        &self,
        alloc: &SlabAlloc,
        spec: &TableSpec,
        key: ObjKey,
        col_ndx: usize,
    ) -> CoreResult<Cell> {
        let (cluster_ref, pos) = self
            .locate(alloc, spec, key)?
            .ok_or(CoreError::KeyNotFound(key))?;
        let cluster = Cluster::load(alloc, spec, cluster_ref)?;
        Ok(cluster.leaves[col_ndx].get(pos))
    }

    /// Writes one cell, copy-on-write along the path.
    ///
    /// # Errors
    ///
    /// Fails if the key is absent.
    pub(crate) fn set_cell(
        &mut self,
        alloc: &mut SlabAlloc,
        spec: &TableSpec,
        key: ObjKey,
        col_ndx: usize,
        cell: &Cell,
    ) -> CoreResult<()> {
        self.root = Self::set_cell_in(alloc, spec, self.root, key, col_ndx, cell)?;
        Ok(())
    }

    fn set_cell_in(
        alloc: &mut SlabAlloc,
        spec: &TableSpec,
        r: Ref,
        key: ObjKey,
        col_ndx: usize,
        cell: &Cell,
    ) -> CoreResult<Ref> {
        if node_is_inner(alloc, r)? {
            let mut node = Array::load(alloc, r)?;
            let mut target = 0usize;
            for pair in 0..node.len() / 2 {
                if untag_int(node.get(pair * 2)) <= key.value() {
                    target = pair;
                } else {
                    break;
                }
            }
            let child = node.get_ref(target * 2 + 1);
            let new_child = Self::set_cell_in(alloc, spec, child, key, col_ndx, cell)?;
            node.set(target * 2 + 1, new_child.offset() as i64);
            node.store(alloc)
        } else {
            let mut cluster = Cluster::load(alloc, spec, r)?;
            let pos = cluster
                .position_of(key)
                .ok_or(CoreError::KeyNotFound(key))?;
            cluster.leaves[col_ndx].set(pos, cell);
            cluster.store(alloc)
        }
    }

    /// Reads every cell of a row.
    ///
    /// # Errors
    ///
    /// Fails if the key is absent.
    pub(crate) fn get_row(
        &self,
        alloc: &SlabAlloc,
        spec: &TableSpec,
        key: ObjKey,
    ) -> CoreResult<Vec<Cell>> {
        let (cluster_ref, pos) = self
            .locate(alloc, spec, key)?
            .ok_or(CoreError::KeyNotFound(key))?;
        let cluster = Cluster::load(alloc, spec, cluster_ref)?;
        Ok(cluster
            .leaves
            .iter()
            .map(|leaf| leaf.get(pos))
            .collect())
    }

    /// Moves a row to a new key, preserving its cells.
    ///
    /// Used when an object is invalidated to a tombstone or a tombstone
    /// is resolved back to its real key.
    ///
    /// # Errors
    ///
    /// Fails if `old_key` is absent or `new_key` is taken.
    pub(crate) fn change_key(
        &mut self,
        alloc: &mut SlabAlloc,
        spec: &TableSpec,
        old_key: ObjKey,
        new_key: ObjKey,
    ) -> CoreResult<()> {
        if self.contains(alloc, spec, new_key)? {
            return Err(CoreError::KeyAlreadyUsed(new_key));
        }
        let cells = self.erase(alloc, spec, old_key)?;
        self.insert(alloc, spec, new_key)?;
        for (col_ndx, cell) in cells.iter().enumerate() {
            self.set_cell(alloc, spec, new_key, col_ndx, cell)?;
        }
        Ok(())
    }

    /// Calls `visit` with every key in ascending order. Returning
    /// `false` stops the traversal.
    ///
    /// # Errors
    ///
    /// Fails on load errors.
    pub fn for_each_key(
        &self,
        alloc: &SlabAlloc,
        spec: &TableSpec,
        visit: &mut impl FnMut(ObjKey) -> bool,
    ) -> CoreResult<()> {
        Self::for_each_key_in(alloc, spec, self.root, visit)?;
        Ok(())
    }

    fn for_each_key_in(
        alloc: &SlabAlloc,
        spec: &TableSpec,
        r: Ref,
        visit: &mut impl FnMut(ObjKey) -> bool,
    ) -> CoreResult<bool> {
        if node_is_inner(alloc, r)? {
            let node = Array::load(alloc, r)?;
            for pair in 0..node.len() / 2 {
                if !Self::for_each_key_in(alloc, spec, node.get_ref(pair * 2 + 1), visit)? {
                    return Ok(false);
                }
            }
            Ok(true)
        } else {
            let cluster = Cluster::load(alloc, spec, r)?;
            for i in 0..cluster.row_count() {
                if !visit(ObjKey::new(cluster.keys.get(i))) {
                    return Ok(false);
                }
            }
            Ok(true)
        }
    }

    /// Number of rows, by traversal.
    ///
    /// # Errors
    ///
    /// Fails on load errors.
    pub fn count(&self, alloc: &SlabAlloc, spec: &TableSpec) -> CoreResult<usize> {
        let mut count = 0usize;
        self.for_each_key(alloc, spec, &mut |_| {
            count += 1;
            true
        })?;
        Ok(count)
    }

    /// Appends a default-valued leaf for a newly added column to every
    /// cluster. `new_spec` must already contain the column.
    ///
    /// # Errors
    ///
    /// Fails on load or store errors.
    pub(crate) fn add_column(
        &mut self,
        alloc: &mut SlabAlloc,
        old_spec: &TableSpec,
        new_col: &ColumnSpec,
    ) -> CoreResult<()> {
        self.root = Self::add_column_in(alloc, old_spec, new_col, self.root)?;
        Ok(())
    }

    fn add_column_in(
        alloc: &mut SlabAlloc,
        old_spec: &TableSpec,
        new_col: &ColumnSpec,
        r: Ref,
    ) -> CoreResult<Ref> {
        if node_is_inner(alloc, r)? {
            let mut node = Array::load(alloc, r)?;
            for pair in 0..node.len() / 2 {
                let child = node.get_ref(pair * 2 + 1);
                let new_child = Self::add_column_in(alloc, old_spec, new_col, child)?;
                node.set(pair * 2 + 1, new_child.offset() as i64);
            }
            node.store(alloc)
        } else {
            let mut cluster = Cluster::load(alloc, old_spec, r)?;
            let mut leaf = Leaf::new(leaf_kind(new_col));
            let default = default_cell(new_col);
            for i in 0..cluster.row_count() {
                leaf.insert(i, &default);
            }
            cluster.leaves.push(leaf);
            cluster.store(alloc)
        }
    }

    /// Removes the leaf of a dropped column from every cluster.
    ///
    /// # Errors
    ///
    /// Fails on load or store errors.
    pub(crate) fn remove_column(
        &mut self,
        alloc: &mut SlabAlloc,
        old_spec: &TableSpec,
        col_ndx: usize,
    ) -> CoreResult<()> {
        self.root = Self::remove_column_in(alloc, old_spec, col_ndx, self.root)?;
        Ok(())
    }

    fn remove_column_in(
        alloc: &mut SlabAlloc,
        old_spec: &TableSpec,
        col_ndx: usize,
        r: Ref,
    ) -> CoreResult<Ref> {
        if node_is_inner(alloc, r)? {
            let mut node = Array::load(alloc, r)?;
            for pair in 0..node.len() / 2 {
                let child = node.get_ref(pair * 2 + 1);
                let new_child = Self::remove_column_in(alloc, old_spec, col_ndx, child)?;
                node.set(pair * 2 + 1, new_child.offset() as i64);
            }
            node.store(alloc)
        } else {
            let mut cluster = Cluster::load(alloc, old_spec, r)?;
            let leaf = cluster.leaves.remove(col_ndx);
            leaf.destroy(alloc);
            cluster.store(alloc)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::ColumnSpec;
    use terndb_storage::InMemoryBackend;

    fn new_alloc() -> SlabAlloc {
        SlabAlloc::open(Box::new(InMemoryBackend::new()), false).unwrap()
    }

    fn int_string_spec() -> TableSpec {
        TableSpec {
            columns: vec![ColumnSpec::int("v"), ColumnSpec::string("s")],
        }
    }

    #[test]
    fn insert_and_locate() {
        let mut alloc = new_alloc();
        let spec = int_string_spec();
        let mut tree = ClusterTree::create(&mut alloc, &spec).unwrap();

        for key in [5i64, 1, 9, 3] {
            tree.insert(&mut alloc, &spec, ObjKey::new(key)).unwrap();
        }
        assert!(tree.contains(&alloc, &spec, ObjKey::new(3)).unwrap());
        assert!(!tree.contains(&alloc, &spec, ObjKey::new(4)).unwrap());
        assert_eq!(tree.count(&alloc, &spec).unwrap(), 4);
    }

    #[test]
    fn duplicate_key_rejected() {
        let mut alloc = new_alloc();
        let spec = int_string_spec();
        let mut tree = ClusterTree::create(&mut alloc, &spec).unwrap();
        tree.insert(&mut alloc, &spec, ObjKey::new(1)).unwrap();
        let result = tree.insert(&mut alloc, &spec, ObjKey::new(1));
        assert!(matches!(result, Err(CoreError::KeyAlreadyUsed(_))));
    }

    #[test]
    fn keys_iterate_sorted() {
        let mut alloc = new_alloc();
        let spec = int_string_spec();
        let mut tree = ClusterTree::create(&mut alloc, &spec).unwrap();
        for key in [50, 20, 90, 10, 70, 30] {
            tree.insert(&mut alloc, &spec, ObjKey::new(key)).unwrap();
        }
        let mut keys = Vec::new();
        tree.for_each_key(&alloc, &spec, &mut |key| {
            keys.push(key.value());
            true
        })
        .unwrap();
        assert_eq!(keys, vec![10, 20, 30, 50, 70, 90]);
    }

    #[test]
    fn cells_roundtrip() {
        let mut alloc = new_alloc();
        let spec = int_string_spec();
        let mut tree = ClusterTree::create(&mut alloc, &spec).unwrap();
        let key = ObjKey::new(7);
        tree.insert(&mut alloc, &spec, key).unwrap();

        tree.set_cell(&mut alloc, &spec, key, 0, &Cell::Int(42))
            .unwrap();
        tree.set_cell(&mut alloc, &spec, key, 1, &Cell::Str(Some(b"tern".to_vec())))
            .unwrap();

        assert_eq!(tree.get_cell(&alloc, &spec, key, 0).unwrap(), Cell::Int(42));
        assert_eq!(
            tree.get_cell(&alloc, &spec, key, 1).unwrap(),
            Cell::Str(Some(b"tern".to_vec()))
        );
    }

    #[test]
    fn erase_returns_cells() {
        let mut alloc = new_alloc();
        let spec = int_string_spec();
        let mut tree = ClusterTree::create(&mut alloc, &spec).unwrap();
        let key = ObjKey::new(1);
        tree.insert(&mut alloc, &spec, key).unwrap();
        tree.set_cell(&mut alloc, &spec, key, 0, &Cell::Int(13))
            .unwrap();

        let cells = tree.erase(&mut alloc, &spec, key).unwrap();
        assert_eq!(cells[0], Cell::Int(13));
        assert!(!tree.contains(&alloc, &spec, key).unwrap());
        assert_eq!(tree.count(&alloc, &spec).unwrap(), 0);
    }

    #[test]
    fn erase_missing_fails() {
        let mut alloc = new_alloc();
        let spec = int_string_spec();
        let mut tree = ClusterTree::create(&mut alloc, &spec).unwrap();
        let result = tree.erase(&mut alloc, &spec, ObjKey::new(4));
        assert!(matches!(result, Err(CoreError::KeyNotFound(_))));
    }

    #[test]
    fn grows_past_cluster_max() {
        let mut alloc = new_alloc();
        let spec = int_string_spec();
        let mut tree = ClusterTree::create(&mut alloc, &spec).unwrap();
        let n = CLUSTER_MAX * 3 + 11;
        for key in 0..n as i64 {
            tree.insert(&mut alloc, &spec, ObjKey::new(key)).unwrap();
        }
        assert_eq!(tree.count(&alloc, &spec).unwrap(), n);
        for key in [0, 255, 256, 257, n as i64 - 1] {
            assert!(tree.contains(&alloc, &spec, ObjKey::new(key)).unwrap());
        }
        // Cells stay addressable after splits.
        tree.set_cell(&mut alloc, &spec, ObjKey::new(300), 0, &Cell::Int(-5))
            .unwrap();
        assert_eq!(
            tree.get_cell(&alloc, &spec, ObjKey::new(300), 0).unwrap(),
            Cell::Int(-5)
        );
    }

    #[test]
    fn erase_down_to_empty_and_reuse() {
        let mut alloc = new_alloc();
        let spec = int_string_spec();
        let mut tree = ClusterTree::create(&mut alloc, &spec).unwrap();
        for key in 0..600i64 {
            tree.insert(&mut alloc, &spec, ObjKey::new(key)).unwrap();
        }
        for key in 0..600i64 {
            tree.erase(&mut alloc, &spec, ObjKey::new(key)).unwrap();
        }
        assert_eq!(tree.count(&alloc, &spec).unwrap(), 0);
        tree.insert(&mut alloc, &spec, ObjKey::new(1000)).unwrap();
        assert!(tree.contains(&alloc, &spec, ObjKey::new(1000)).unwrap());
    }

    #[test]
    fn change_key_preserves_cells() {
        let mut alloc = new_alloc();
        let spec = int_string_spec();
        let mut tree = ClusterTree::create(&mut alloc, &spec).unwrap();
        let key = ObjKey::new(2);
        tree.insert(&mut alloc, &spec, key).unwrap();
        tree.set_cell(&mut alloc, &spec, key, 0, &Cell::Int(77))
            .unwrap();

        let tombstone = key.as_unresolved();
        tree.change_key(&mut alloc, &spec, key, tombstone).unwrap();
        assert!(!tree.contains(&alloc, &spec, key).unwrap());
        assert_eq!(
            tree.get_cell(&alloc, &spec, tombstone, 0).unwrap(),
            Cell::Int(77)
        );
    }

    #[test]
    fn add_and_remove_column() {
        let mut alloc = new_alloc();
        let mut spec = int_string_spec();
        let mut tree = ClusterTree::create(&mut alloc, &spec).unwrap();
        for key in 0..300i64 {
            tree.insert(&mut alloc, &spec, ObjKey::new(key)).unwrap();
        }

        let new_col = ColumnSpec::int("extra").nullable();
        tree.add_column(&mut alloc, &spec, &new_col).unwrap();
        spec.columns.push(new_col);

        assert_eq!(
            tree.get_cell(&alloc, &spec, ObjKey::new(299), 2).unwrap(),
            Cell::Int(INT_NULL)
        );

        tree.remove_column(&mut alloc, &spec, 2).unwrap();
        spec.columns.pop();
        assert_eq!(tree.count(&alloc, &spec).unwrap(), 300);
    }

    /// Every leaf kind in one cluster: packed scalars, string leaves,
    /// collection refs, and a backlink column stay index-aligned with
    /// the key vector through inserts and erases.
    #[test]
    fn all_column_kinds_stay_aligned() {
        use crate::schema::{ColumnAttr, ColumnType};

        let mut alloc = new_alloc();
        let spec = TableSpec {
            columns: vec![
                ColumnSpec::int("i"),
                ColumnSpec::int("ni").nullable(),
                ColumnSpec::bool("b").nullable(),
                ColumnSpec::string("s"),
                ColumnSpec::binary("blob").nullable(),
                ColumnSpec::link("to", crate::keys::TableKey::new(9)),
                ColumnSpec::int("xs").list(),
                ColumnSpec::string("tags").set(),
                ColumnSpec::int("meta").dictionary(),
                ColumnSpec {
                    name: "!backlink_9_0".into(),
                    col_type: ColumnType::Link,
                    attrs: ColumnAttr::BACKLINK,
                    target_table: Some(crate::keys::TableKey::new(9)),
                    backlink_origin: Some(crate::keys::ColKey::new(0)),
                },
            ],
        };

        let mut tree = ClusterTree::create(&mut alloc, &spec).unwrap();
        for key in 0..40i64 {
            tree.insert(&mut alloc, &spec, ObjKey::new(key)).unwrap();
        }
        for key in (0..40i64).step_by(3) {
            tree.erase(&mut alloc, &spec, ObjKey::new(key)).unwrap();
        }

        // Loading re-validates the alignment invariant of every leaf.
        let probe = ObjKey::new(25);
        assert!(tree.contains(&alloc, &spec, probe).unwrap());
        for col in 0..spec.column_count() {
            let cell = tree.get_cell(&alloc, &spec, probe, col).unwrap();
            match leaf_kind(&spec.columns[col]) {
                LeafKind::Strings => assert!(matches!(cell, Cell::Str(_))),
                _ => assert!(matches!(cell, Cell::Int(_))),
            }
        }

        // Defaults landed per column kind.
        assert_eq!(tree.get_cell(&alloc, &spec, probe, 0).unwrap(), Cell::Int(0));
        assert_eq!(
            tree.get_cell(&alloc, &spec, probe, 1).unwrap(),
            Cell::Int(INT_NULL)
        );
        assert_eq!(
            tree.get_cell(&alloc, &spec, probe, 2).unwrap(),
            Cell::Int(BOOL_NULL)
        );
        assert_eq!(
            tree.get_cell(&alloc, &spec, probe, 3).unwrap(),
            Cell::Str(Some(Vec::new()))
        );
        assert_eq!(tree.get_cell(&alloc, &spec, probe, 4).unwrap(), Cell::Str(None));
        assert_eq!(
            tree.get_cell(&alloc, &spec, probe, 5).unwrap(),
            Cell::Int(encode_link(None))
        );
    }

    #[test]
    fn link_encoding() {
        assert_eq!(encode_link(None), 0);
        assert_eq!(decode_link(0), None);
        let key = ObjKey::new(5);
        assert_eq!(decode_link(encode_link(Some(key))), Some(key));
        let tombstone = key.as_unresolved();
        assert_eq!(decode_link(encode_link(Some(tombstone))), Some(tombstone));
    }
}
