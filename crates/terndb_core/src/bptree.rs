//! Position-ordered B+-tree.
//!
//! Backs every list and every cluster column that outgrows a single
//! leaf. Inner nodes are arrays of `(tagged subtree size, child ref)`
//! pairs, so descent by index is O(log N) and never needs cumulative
//! sums. Leaves are array leaves of the element type.
//!
//! Leaves split at a fixed maximum and never merge on erase; empty
//! leaves are tolerated and skipped during descent.

use crate::alloc::SlabAlloc;
use crate::array::{tag_int, untag_int, Array, ArrayHeader, StringLeaf};
use crate::error::{CoreError, CoreResult};
use crate::keys::Ref;
use std::marker::PhantomData;

/// Maximum number of elements in a leaf before it splits.
pub const LEAF_MAX: usize = 256;

/// Maximum number of children in an inner node before it splits.
pub const INNER_MAX: usize = 64;

/// Storage operations of a leaf node.
///
/// Implemented by the concrete leaf kinds; the tree is generic over
/// this trait.
pub trait LeafNode: Sized {
    /// Element type held by the leaf.
    type Value: Clone + PartialEq;

    /// Creates an empty detached leaf.
    fn new_leaf() -> Self;
    /// Loads a leaf from storage.
    fn load_leaf(alloc: &SlabAlloc, r: Ref) -> CoreResult<Self>;
    /// Stores the leaf, returning its new ref.
    fn store_leaf(&mut self, alloc: &mut SlabAlloc) -> CoreResult<Ref>;
    /// Frees the leaf's blocks without storing.
    fn destroy_leaf(self, alloc: &mut SlabAlloc);
    /// Number of elements.
    fn leaf_len(&self) -> usize;
    /// Returns the element at `index`.
    fn leaf_get(&self, index: usize) -> Self::Value;
    /// Overwrites the element at `index`.
    fn leaf_set(&mut self, index: usize, value: Self::Value);
    /// Inserts an element at `index`.
    fn leaf_insert(&mut self, index: usize, value: Self::Value);
    /// Erases the element at `index`.
    fn leaf_erase(&mut self, index: usize);
    /// Splits off the elements at `at..` into a new leaf.
    fn split_off(&mut self, at: usize) -> Self;
    /// The context flag on the leaf's root block.
    fn context_flag(&self) -> bool;
    /// Sets the context flag on the leaf's root block.
    fn set_context_flag(&mut self, value: bool);
}

/// Leaf of packed integers. Also used for refs and object keys.
#[derive(Debug)]
pub struct IntLeaf {
    array: Array,
}

impl LeafNode for IntLeaf {
    type Value = i64;

    fn new_leaf() -> Self {
        Self {
            array: Array::new(false),
        }
    }

    fn load_leaf(alloc: &SlabAlloc, r: Ref) -> CoreResult<Self> {
        Ok(Self {
            array: Array::load(alloc, r)?,
        })
    }

    fn store_leaf(&mut self, alloc: &mut SlabAlloc) -> CoreResult<Ref> {
        self.array.store(alloc)
    }

    fn destroy_leaf(self, alloc: &mut SlabAlloc) {
        self.array.destroy(alloc);
    }

    fn leaf_len(&self) -> usize {
        self.array.len()
    }

    fn leaf_get(&self, index: usize) -> i64 {
        self.array.get(index)
    }

    fn leaf_set(&mut self, index: usize, value: i64) {
        self.array.set(index, value);
    }

    fn leaf_insert(&mut self, index: usize, value: i64) {
        self.array.insert(index, value);
    }

    fn leaf_erase(&mut self, index: usize) {
        self.array.erase(index);
    }

    fn split_off(&mut self, at: usize) -> Self {
        let tail: Vec<i64> = (at..self.array.len()).map(|i| self.array.get(i)).collect();
        self.array.truncate(at);
        Self {
            array: Array::from_values(false, tail),
        }
    }

    fn context_flag(&self) -> bool {
        self.array.context_flag()
    }

    fn set_context_flag(&mut self, value: bool) {
        self.array.set_context_flag(value);
    }
}

/// Leaf of optional byte strings.
#[derive(Debug)]
pub struct StrLeaf {
    leaf: StringLeaf,
}

impl LeafNode for StrLeaf {
    type Value = Option<Vec<u8>>;

    fn new_leaf() -> Self {
        Self {
            leaf: StringLeaf::new(),
        }
    }

    fn load_leaf(alloc: &SlabAlloc, r: Ref) -> CoreResult<Self> {
        Ok(Self {
            leaf: StringLeaf::load(alloc, r)?,
        })
    }

    fn store_leaf(&mut self, alloc: &mut SlabAlloc) -> CoreResult<Ref> {
        self.leaf.store(alloc)
    }

    fn destroy_leaf(self, alloc: &mut SlabAlloc) {
        self.leaf.destroy(alloc);
    }

    fn leaf_len(&self) -> usize {
        self.leaf.len()
    }

    fn leaf_get(&self, index: usize) -> Option<Vec<u8>> {
        self.leaf.get(index).map(<[u8]>::to_vec)
    }

    fn leaf_set(&mut self, index: usize, value: Option<Vec<u8>>) {
        self.leaf.set(index, value.as_deref());
    }

    fn leaf_insert(&mut self, index: usize, value: Option<Vec<u8>>) {
        self.leaf.insert(index, value.as_deref());
    }

    fn leaf_erase(&mut self, index: usize) {
        self.leaf.erase(index);
    }

    fn split_off(&mut self, at: usize) -> Self {
        let mut tail = StringLeaf::new();
        for i in at..self.leaf.len() {
            let owned = self.leaf.get(i).map(<[u8]>::to_vec);
            tail.push(owned.as_deref());
        }
        let keep = at;
        while self.leaf.len() > keep {
            self.leaf.erase(keep);
        }
        Self { leaf: tail }
    }

    fn context_flag(&self) -> bool {
        false
    }

    fn set_context_flag(&mut self, _value: bool) {}
}

fn is_inner_node(alloc: &SlabAlloc, r: Ref) -> CoreResult<bool> {
    let bytes: [u8; 8] = alloc
        .read_bytes(r, 0, 8)?
        .try_into()
        .map_err(|_| CoreError::InvalidRef(r))?;
    Ok(ArrayHeader::decode(&bytes)?.is_inner_node)
}

/// Outcome of an insert below the root.
enum InsertResult {
    /// No split; the child's new ref and size delta applied by caller.
    Done(Ref),
    /// The child split; a new right sibling must be linked after it.
    Split {
        left: Ref,
        left_size: usize,
        right: Ref,
        right_size: usize,
    },
}

/// A position-ordered B+-tree rooted at a ref.
///
/// The wrapper owns only the root ref; all node data lives in the
/// allocator. Mutating operations replace nodes copy-on-write along the
/// descent path and update the root ref in place - the caller persists
/// the new root in the parent slot it came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BPlusTree<L: LeafNode> {
    root: Ref,
    _leaf: PhantomData<L>,
}

impl<L: LeafNode> BPlusTree<L> {
    /// Creates an empty tree: a single stored empty leaf.
    ///
    /// # Errors
    ///
    /// Fails on allocator I/O errors.
    pub fn create(alloc: &mut SlabAlloc) -> CoreResult<Self> {
        let mut leaf = L::new_leaf();
        let root = leaf.store_leaf(alloc)?;
        Ok(Self {
            root,
            _leaf: PhantomData,
        })
    }

    /// Attaches to an existing tree.
    #[must_use]
    pub fn attach(root: Ref) -> Self {
        Self {
            root,
            _leaf: PhantomData,
        }
    }

    /// The current root ref.
    #[must_use]
    pub fn root_ref(&self) -> Ref {
        self.root
    }

    /// Total number of elements.
    ///
    /// # Errors
    ///
    /// Fails on load errors.
    pub fn size(&self, alloc: &SlabAlloc) -> CoreResult<usize> {
        if is_inner_node(alloc, self.root)? {
            let node = Array::load(alloc, self.root)?;
            let mut total = 0usize;
            for pair in 0..node.len() / 2 {
                total += untag_int(node.get(pair * 2)) as usize;
            }
            Ok(total)
        } else {
            Ok(L::load_leaf(alloc, self.root)?.leaf_len())
        }
    }

    /// Returns the element at `index`.
    ///
    /// # Errors
    ///
    /// Fails if `index` is out of bounds.
    pub fn get(&self, alloc: &SlabAlloc, index: usize) -> CoreResult<L::Value> {
        let mut r = self.root;
        let mut index = index;
        loop {
            if is_inner_node(alloc, r)? {
                let node = Array::load(alloc, r)?;
                let mut found = None;
                for pair in 0..node.len() / 2 {
                    let child_size = untag_int(node.get(pair * 2)) as usize;
                    if index < child_size {
                        found = Some(node.get_ref(pair * 2 + 1));
                        break;
                    }
                    index -= child_size;
                }
                r = found.ok_or(CoreError::ListIndexOutOfBounds {
                    index,
                    size: 0,
                })?;
            } else {
                let leaf = L::load_leaf(alloc, r)?;
                if index >= leaf.leaf_len() {
                    return Err(CoreError::ListIndexOutOfBounds {
                        index,
                        size: leaf.leaf_len(),
                    });
                }
                return Ok(leaf.leaf_get(index));
            }
        }
    }

    /// Overwrites the element at `index`.
    ///
    /// # Errors
    ///
    /// Fails if `index` is out of bounds.
    pub fn set(&mut self, alloc: &mut SlabAlloc, index: usize, value: L::Value) -> CoreResult<()> {
        self.root = Self::set_in(alloc, self.root, index, value)?;
        Ok(())
    }

    fn set_in(
        alloc: &mut SlabAlloc,
        r: Ref,
        index: usize,
        value: L::Value,
    ) -> CoreResult<Ref> {
        if is_inner_node(alloc, r)? {
            let mut node = Array::load(alloc, r)?;
            let mut index = index;
            for pair in 0..node.len() / 2 {
                let child_size = untag_int(node.get(pair * 2)) as usize;
                if index < child_size {
                    let child = node.get_ref(pair * 2 + 1);
                    let new_child = Self::set_in(alloc, child, index, value)?;
                    node.set(pair * 2 + 1, new_child.offset() as i64);
                    return node.store(alloc);
                }
                index -= child_size;
            }
            Err(CoreError::ListIndexOutOfBounds { index, size: 0 })
        } else {
            let mut leaf = L::load_leaf(alloc, r)?;
            if index >= leaf.leaf_len() {
                return Err(CoreError::ListIndexOutOfBounds {
                    index,
                    size: leaf.leaf_len(),
                });
            }
            leaf.leaf_set(index, value);
            leaf.store_leaf(alloc)
        }
    }

    /// Inserts an element at `index`.
    ///
    /// # Errors
    ///
    /// Fails if `index` is greater than the current size.
    pub fn insert(
        &mut self,
        alloc: &mut SlabAlloc,
        index: usize,
        value: L::Value,
    ) -> CoreResult<()> {
        let size = self.size(alloc)?;
        if index > size {
            return Err(CoreError::ListIndexOutOfBounds { index, size });
        }
        match Self::insert_in(alloc, self.root, index, value)? {
            InsertResult::Done(new_root) => {
                self.root = new_root;
            }
            InsertResult::Split {
                left,
                left_size,
                right,
                right_size,
            } => {
                // Grow the tree by one level.
                let mut node = Array::new_inner();
                node.push(tag_int(left_size as i64));
                node.push(left.offset() as i64);
                node.push(tag_int(right_size as i64));
                node.push(right.offset() as i64);
                self.root = node.store(alloc)?;
            }
        }
        Ok(())
    }

    fn insert_in(
        alloc: &mut SlabAlloc,
        r: Ref,
        index: usize,
        value: L::Value,
    ) -> CoreResult<InsertResult> {
        if is_inner_node(alloc, r)? {
            let mut node = Array::load(alloc, r)?;
            let pair_count = node.len() / 2;
            let mut index = index;
            let mut target = pair_count - 1;
            for pair in 0..pair_count {
                let child_size = untag_int(node.get(pair * 2)) as usize;
                let is_last = pair + 1 == pair_count;
                // An append (index == size) goes into the last child.
                if index < child_size || (index == child_size && is_last) {
                    target = pair;
                    break;
                }
                index -= child_size;
            }
            let child = node.get_ref(target * 2 + 1);
            match Self::insert_in(alloc, child, index, value)? {
                InsertResult::Done(new_child) => {
                    let size = untag_int(node.get(target * 2)) + 1;
                    node.set(target * 2, tag_int(size));
                    node.set(target * 2 + 1, new_child.offset() as i64);
                    Ok(InsertResult::Done(node.store(alloc)?))
                }
                InsertResult::Split {
                    left,
                    left_size,
                    right,
                    right_size,
                } => {
                    node.set(target * 2, tag_int(left_size as i64));
                    node.set(target * 2 + 1, left.offset() as i64);
                    node.insert(target * 2 + 2, tag_int(right_size as i64));
                    node.insert(target * 2 + 3, right.offset() as i64);
                    if node.len() / 2 <= INNER_MAX {
                        return Ok(InsertResult::Done(node.store(alloc)?));
                    }
                    // Split the inner node itself.
                    let split_pair = node.len() / 2 / 2;
                    let mut right_node = Array::new_inner();
                    for i in split_pair * 2..node.len() {
                        right_node.push(node.get(i));
                    }
                    node.truncate(split_pair * 2);
                    let left_size: usize = (0..node.len() / 2)
                        .map(|p| untag_int(node.get(p * 2)) as usize)
                        .sum();
                    let right_size: usize = (0..right_node.len() / 2)
                        .map(|p| untag_int(right_node.get(p * 2)) as usize)
                        .sum();
                    let left_ref = node.store(alloc)?;
                    let right_ref = right_node.store(alloc)?;
                    Ok(InsertResult::Split {
                        left: left_ref,
                        left_size,
                        right: right_ref,
                        right_size,
                    })
                }
            }
        } else {
            let mut leaf = L::load_leaf(alloc, r)?;
            if index > leaf.leaf_len() {
                return Err(CoreError::ListIndexOutOfBounds {
                    index,
                    size: leaf.leaf_len(),
                });
            }
            leaf.leaf_insert(index, value);
            if leaf.leaf_len() <= LEAF_MAX {
                return Ok(InsertResult::Done(leaf.store_leaf(alloc)?));
            }
            let mut right = leaf.split_off(leaf.leaf_len() / 2);
            let left_size = leaf.leaf_len();
            let right_size = right.leaf_len();
            let left_ref = leaf.store_leaf(alloc)?;
            let right_ref = right.store_leaf(alloc)?;
            Ok(InsertResult::Split {
                left: left_ref,
                left_size,
                right: right_ref,
                right_size,
            })
        }
    }

    /// Appends an element.
    ///
    /// # Errors
    ///
    /// Fails on load or store errors.
    pub fn push(&mut self, alloc: &mut SlabAlloc, value: L::Value) -> CoreResult<()> {
        let size = self.size(alloc)?;
        self.insert(alloc, size, value)
    }

    /// Erases the element at `index`.
    ///
    /// Leaves are never merged; an emptied leaf stays in place.
    ///
    /// # Errors
    ///
    /// Fails if `index` is out of bounds.
    pub fn erase(&mut self, alloc: &mut SlabAlloc, index: usize) -> CoreResult<()> {
        self.root = Self::erase_in(alloc, self.root, index)?;
        Ok(())
    }

    fn erase_in(alloc: &mut SlabAlloc, r: Ref, index: usize) -> CoreResult<Ref> {
        if is_inner_node(alloc, r)? {
            let mut node = Array::load(alloc, r)?;
            let mut index = index;
            for pair in 0..node.len() / 2 {
                let child_size = untag_int(node.get(pair * 2)) as usize;
                if index < child_size {
                    let child = node.get_ref(pair * 2 + 1);
                    let new_child = Self::erase_in(alloc, child, index)?;
                    node.set(pair * 2, tag_int(child_size as i64 - 1));
                    node.set(pair * 2 + 1, new_child.offset() as i64);
                    return node.store(alloc);
                }
                index -= child_size;
            }
            Err(CoreError::ListIndexOutOfBounds { index, size: 0 })
        } else {
            let mut leaf = L::load_leaf(alloc, r)?;
            if index >= leaf.leaf_len() {
                return Err(CoreError::ListIndexOutOfBounds {
                    index,
                    size: leaf.leaf_len(),
                });
            }
            leaf.leaf_erase(index);
            leaf.store_leaf(alloc)
        }
    }

    /// Removes every element, leaving an empty leaf as the root.
    ///
    /// # Errors
    ///
    /// Fails on load or store errors.
    pub fn clear(&mut self, alloc: &mut SlabAlloc) -> CoreResult<()> {
        Self::destroy_in(alloc, self.root)?;
        let mut leaf = L::new_leaf();
        self.root = leaf.store_leaf(alloc)?;
        Ok(())
    }

    /// Frees every node of the tree.
    ///
    /// # Errors
    ///
    /// Fails on load errors.
    pub fn destroy(self, alloc: &mut SlabAlloc) -> CoreResult<()> {
        Self::destroy_in(alloc, self.root)
    }

    fn destroy_in(alloc: &mut SlabAlloc, r: Ref) -> CoreResult<()> {
        if is_inner_node(alloc, r)? {
            let node = Array::load(alloc, r)?;
            for pair in 0..node.len() / 2 {
                Self::destroy_in(alloc, node.get_ref(pair * 2 + 1))?;
            }
            node.destroy(alloc);
        } else {
            L::load_leaf(alloc, r)?.destroy_leaf(alloc);
        }
        Ok(())
    }

    /// Calls `visit` with each `(index, value)` in order. Returning
    /// `false` stops the traversal.
    ///
    /// # Errors
    ///
    /// Fails on load errors.
    pub fn for_each(
        &self,
        alloc: &SlabAlloc,
        visit: &mut impl FnMut(usize, L::Value) -> bool,
    ) -> CoreResult<()> {
        let mut next_index = 0;
        Self::for_each_in(alloc, self.root, &mut next_index, visit)?;
        Ok(())
    }

    fn for_each_in(
        alloc: &SlabAlloc,
        r: Ref,
        next_index: &mut usize,
        visit: &mut impl FnMut(usize, L::Value) -> bool,
    ) -> CoreResult<bool> {
        if is_inner_node(alloc, r)? {
            let node = Array::load(alloc, r)?;
            for pair in 0..node.len() / 2 {
                if !Self::for_each_in(alloc, node.get_ref(pair * 2 + 1), next_index, visit)? {
                    return Ok(false);
                }
            }
            Ok(true)
        } else {
            let leaf = L::load_leaf(alloc, r)?;
            for i in 0..leaf.leaf_len() {
                if !visit(*next_index, leaf.leaf_get(i)) {
                    return Ok(false);
                }
                *next_index += 1;
            }
            Ok(true)
        }
    }

    /// Calls `visit` with each `(index, value)` in `range`, in order.
    /// Returning `false` stops the traversal.
    ///
    /// # Errors
    ///
    /// Fails on load errors.
    pub fn for_each_in_range(
        &self,
        alloc: &SlabAlloc,
        range: std::ops::Range<usize>,
        visit: &mut impl FnMut(usize, L::Value) -> bool,
    ) -> CoreResult<()> {
        self.for_each(alloc, &mut |index, value| {
            if index < range.start {
                return true;
            }
            if index >= range.end {
                return false;
            }
            visit(index, value)
        })
    }

    /// Index of the first element equal to `value`, if any.
    ///
    /// # Errors
    ///
    /// Fails on load errors.
    pub fn find_first(&self, alloc: &SlabAlloc, value: &L::Value) -> CoreResult<Option<usize>> {
        let mut found = None;
        self.for_each(alloc, &mut |index, element| {
            if &element == value {
                found = Some(index);
                false
            } else {
                true
            }
        })?;
        Ok(found)
    }

    /// Collects every element into a vector.
    ///
    /// # Errors
    ///
    /// Fails on load errors.
    pub fn to_vec(&self, alloc: &SlabAlloc) -> CoreResult<Vec<L::Value>> {
        let mut values = Vec::new();
        self.for_each(alloc, &mut |_, value| {
            values.push(value);
            true
        })?;
        Ok(values)
    }

    /// Reads the context flag on the root block.
    ///
    /// # Errors
    ///
    /// Fails on load errors.
    pub fn context_flag(&self, alloc: &SlabAlloc) -> CoreResult<bool> {
        let bytes: [u8; 8] = alloc
            .read_bytes(self.root, 0, 8)?
            .try_into()
            .map_err(|_| CoreError::InvalidRef(self.root))?;
        Ok(ArrayHeader::decode(&bytes)?.context)
    }

    /// Sets the context flag on the root block.
    ///
    /// # Errors
    ///
    /// Fails on load or store errors.
    pub fn set_context_flag(&mut self, alloc: &mut SlabAlloc, value: bool) -> CoreResult<()> {
        if is_inner_node(alloc, self.root)? {
            let mut node = Array::load(alloc, self.root)?;
            node.set_context_flag(value);
            self.root = node.store(alloc)?;
        } else {
            let mut leaf = L::load_leaf(alloc, self.root)?;
            leaf.set_context_flag(value);
            self.root = leaf.store_leaf(alloc)?;
        }
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

    #[test]
    fn empty_tree() {
        let mut alloc = new_alloc();
        let tree: BPlusTree<IntLeaf> = BPlusTree::create(&mut alloc).unwrap();
        assert_eq!(tree.size(&alloc).unwrap(), 0);
    }

    #[test]
    fn push_and_get() {
        let mut alloc = new_alloc();
        let mut tree: BPlusTree<IntLeaf> = BPlusTree::create(&mut alloc).unwrap();
        for i in 0..10 {
            tree.push(&mut alloc, i * 10).unwrap();
        }
        assert_eq!(tree.size(&alloc).unwrap(), 10);
        assert_eq!(tree.get(&alloc, 0).unwrap(), 0);
        assert_eq!(tree.get(&alloc, 9).unwrap(), 90);
    }

    #[test]
    fn grows_past_leaf_max() {
        let mut alloc = new_alloc();
        let mut tree: BPlusTree<IntLeaf> = BPlusTree::create(&mut alloc).unwrap();
        let n = LEAF_MAX * 3 + 17;
        for i in 0..n {
            tree.push(&mut alloc, i as i64).unwrap();
        }
        assert_eq!(tree.size(&alloc).unwrap(), n);
        for i in [0, 1, LEAF_MAX - 1, LEAF_MAX, LEAF_MAX + 1, n - 1] {
            assert_eq!(tree.get(&alloc, i).unwrap(), i as i64, "index {i}");
        }
    }

    #[test]
    fn insert_in_middle() {
        let mut alloc = new_alloc();
        let mut tree: BPlusTree<IntLeaf> = BPlusTree::create(&mut alloc).unwrap();
        for i in 0..600 {
            tree.push(&mut alloc, i).unwrap();
        }
        tree.insert(&mut alloc, 300, -1).unwrap();
        assert_eq!(tree.size(&alloc).unwrap(), 601);
        assert_eq!(tree.get(&alloc, 299).unwrap(), 299);
        assert_eq!(tree.get(&alloc, 300).unwrap(), -1);
        assert_eq!(tree.get(&alloc, 301).unwrap(), 300);
    }

    #[test]
    fn set_deep() {
        let mut alloc = new_alloc();
        let mut tree: BPlusTree<IntLeaf> = BPlusTree::create(&mut alloc).unwrap();
        for i in 0..1000 {
            tree.push(&mut alloc, i).unwrap();
        }
        tree.set(&mut alloc, 777, -777).unwrap();
        assert_eq!(tree.get(&alloc, 777).unwrap(), -777);
        assert_eq!(tree.get(&alloc, 776).unwrap(), 776);
    }

    #[test]
    fn erase_everywhere() {
        let mut alloc = new_alloc();
        let mut tree: BPlusTree<IntLeaf> = BPlusTree::create(&mut alloc).unwrap();
        for i in 0..600 {
            tree.push(&mut alloc, i).unwrap();
        }
        tree.erase(&mut alloc, 0).unwrap();
        tree.erase(&mut alloc, 100).unwrap();
        let last_index = tree.size(&alloc).unwrap() - 1;
        tree.erase(&mut alloc, last_index).unwrap();
        assert_eq!(tree.size(&alloc).unwrap(), 597);
        assert_eq!(tree.get(&alloc, 0).unwrap(), 1);
        // 0 erased, then element at position 100 (value 101) erased.
        assert_eq!(tree.get(&alloc, 100).unwrap(), 102);
    }

    #[test]
    fn erase_all_leaves_empty_tree() {
        let mut alloc = new_alloc();
        let mut tree: BPlusTree<IntLeaf> = BPlusTree::create(&mut alloc).unwrap();
        for i in 0..300 {
            tree.push(&mut alloc, i).unwrap();
        }
        for _ in 0..300 {
            tree.erase(&mut alloc, 0).unwrap();
        }
        assert_eq!(tree.size(&alloc).unwrap(), 0);
        // Insert into the emptied tree still works.
        tree.push(&mut alloc, 42).unwrap();
        assert_eq!(tree.get(&alloc, 0).unwrap(), 42);
    }

    #[test]
    fn clear_resets() {
        let mut alloc = new_alloc();
        let mut tree: BPlusTree<IntLeaf> = BPlusTree::create(&mut alloc).unwrap();
        for i in 0..500 {
            tree.push(&mut alloc, i).unwrap();
        }
        tree.clear(&mut alloc).unwrap();
        assert_eq!(tree.size(&alloc).unwrap(), 0);
    }

    #[test]
    fn for_each_in_order() {
        let mut alloc = new_alloc();
        let mut tree: BPlusTree<IntLeaf> = BPlusTree::create(&mut alloc).unwrap();
        for i in 0..400 {
            tree.push(&mut alloc, i * 2).unwrap();
        }
        let values = tree.to_vec(&alloc).unwrap();
        assert_eq!(values.len(), 400);
        assert!(values.windows(2).all(|w| w[0] < w[1]));
    }

    #[test]
    fn for_each_in_range_visits_window() {
        let mut alloc = new_alloc();
        let mut tree: BPlusTree<IntLeaf> = BPlusTree::create(&mut alloc).unwrap();
        for i in 0..500 {
            tree.push(&mut alloc, i).unwrap();
        }
        let mut seen = Vec::new();
        tree.for_each_in_range(&alloc, 250..260, &mut |index, value| {
            seen.push((index, value));
            true
        })
        .unwrap();
        assert_eq!(seen.len(), 10);
        assert_eq!(seen[0], (250, 250));
        assert_eq!(seen[9], (259, 259));
    }

    #[test]
    fn find_first() {
        let mut alloc = new_alloc();
        let mut tree: BPlusTree<IntLeaf> = BPlusTree::create(&mut alloc).unwrap();
        for i in 0..300 {
            tree.push(&mut alloc, i % 7).unwrap();
        }
        assert_eq!(tree.find_first(&alloc, &5).unwrap(), Some(5));
        assert_eq!(tree.find_first(&alloc, &100).unwrap(), None);
    }

    #[test]
    fn context_flag_roundtrip() {
        let mut alloc = new_alloc();
        let mut tree: BPlusTree<IntLeaf> = BPlusTree::create(&mut alloc).unwrap();
        assert!(!tree.context_flag(&alloc).unwrap());
        tree.set_context_flag(&mut alloc, true).unwrap();
        assert!(tree.context_flag(&alloc).unwrap());
        tree.set_context_flag(&mut alloc, false).unwrap();
        assert!(!tree.context_flag(&alloc).unwrap());
    }

    #[test]
    fn string_tree() {
        let mut alloc = new_alloc();
        let mut tree: BPlusTree<StrLeaf> = BPlusTree::create(&mut alloc).unwrap();
        for i in 0..300usize {
            tree.push(&mut alloc, Some(format!("value-{i}").into_bytes()))
                .unwrap();
        }
        tree.set(&mut alloc, 5, None).unwrap();
        assert_eq!(tree.size(&alloc).unwrap(), 300);
        assert_eq!(
            tree.get(&alloc, 299).unwrap(),
            Some(b"value-299".to_vec())
        );
        assert_eq!(tree.get(&alloc, 5).unwrap(), None);
    }

    #[test]
    fn out_of_bounds_errors() {
        let mut alloc = new_alloc();
        let mut tree: BPlusTree<IntLeaf> = BPlusTree::create(&mut alloc).unwrap();
        tree.push(&mut alloc, 1).unwrap();
        assert!(tree.get(&alloc, 1).is_err());
        assert!(tree.set(&mut alloc, 1, 0).is_err());
        assert!(tree.erase(&mut alloc, 1).is_err());
        assert!(tree.insert(&mut alloc, 5, 0).is_err());
    }
}
