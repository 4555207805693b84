//! Key and identifier newtypes used throughout the engine.

use std::fmt;

/// An 8-byte-aligned offset into the database file.
///
/// Refs are the universal pointer of the storage engine. Zero means
/// "none". A ref below the committed file size addresses the read-only
/// region; a ref at or above it addresses the writer's slab.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct Ref(pub u64);

impl Ref {
    /// The null ref.
    pub const NULL: Self = Self(0);

    /// Creates a ref from a raw offset.
    #[must_use]
    pub const fn new(offset: u64) -> Self {
        Self(offset)
    }

    /// Returns the raw offset.
    #[must_use]
    pub const fn offset(self) -> u64 {
        self.0
    }

    /// True if this is the null ref.
    #[must_use]
    pub const fn is_null(self) -> bool {
        self.0 == 0
    }

    /// True if the offset is 8-byte aligned.
    #[must_use]
    pub const fn is_aligned(self) -> bool {
        self.0 % 8 == 0
    }
}

impl fmt::Display for Ref {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ref:{:#x}", self.0)
    }
}

/// Bit marking an object key as an unresolved tombstone.
const UNRESOLVED_BIT: i64 = 1 << 62;

/// Stable identifier for an object within a table.
///
/// Keys are signed 62-bit values, unique within a table for its entire
/// lifetime and never reused after erase. Bit 62 marks "unresolved"
/// tombstone keys: placeholders for objects referenced by links whose
/// target has not been received yet.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ObjKey(pub i64);

impl ObjKey {
    /// Creates a key from its raw value.
    #[must_use]
    pub const fn new(value: i64) -> Self {
        Self(value)
    }

    /// Returns the raw value.
    #[must_use]
    pub const fn value(self) -> i64 {
        self.0
    }

    /// True if this key is an unresolved tombstone.
    #[must_use]
    pub const fn is_unresolved(self) -> bool {
        self.0 & UNRESOLVED_BIT != 0
    }

    /// Returns the tombstone form of this key.
    #[must_use]
    pub const fn as_unresolved(self) -> Self {
        Self(self.0 | UNRESOLVED_BIT)
    }

    /// Returns the resolved form of an unresolved key.
    #[must_use]
    pub const fn as_resolved(self) -> Self {
        Self(self.0 & !UNRESOLVED_BIT)
    }
}

impl fmt::Display for ObjKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_unresolved() {
            write!(f, "key:~{}", self.as_resolved().0)
        } else {
            write!(f, "key:{}", self.0)
        }
    }
}

/// Identifier for a table within a group.
///
/// Table keys are indexes into the group's table directory. The
/// directory is append-only, so keys are stable for the file's lifetime.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct TableKey(pub u32);

impl TableKey {
    /// Creates a table key.
    #[must_use]
    pub const fn new(index: u32) -> Self {
        Self(index)
    }

    /// Returns the directory index.
    #[must_use]
    pub const fn index(self) -> u32 {
        self.0
    }
}

impl fmt::Display for TableKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "table:{}", self.0)
    }
}

/// Identifier for a column within a table's spec.
///
/// Column keys are spec indexes. Backlink columns occupy indexes past
/// the public columns and are hidden from ordinary iteration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ColKey(pub u32);

impl ColKey {
    /// Creates a column key.
    #[must_use]
    pub const fn new(index: u32) -> Self {
        Self(index)
    }

    /// Returns the spec index.
    #[must_use]
    pub const fn index(self) -> u32 {
        self.0
    }
}

impl fmt::Display for ColKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "col:{}", self.0)
    }
}

/// A committed database version.
///
/// Versions increase by one per committed write transaction. A reader
/// holds the version it started on until it is dropped.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct Version(pub u64);

impl Version {
    /// Creates a version from its raw value.
    #[must_use]
    pub const fn new(value: u64) -> Self {
        Self(value)
    }

    /// Returns the raw value.
    #[must_use]
    pub const fn number(self) -> u64 {
        self.0
    }

    /// Returns the next version.
    #[must_use]
    pub const fn next(self) -> Self {
        Self(self.0 + 1)
    }
}

impl fmt::Display for Version {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "v{}", self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ref_alignment() {
        assert!(Ref::new(0).is_aligned());
        assert!(Ref::new(64).is_aligned());
        assert!(!Ref::new(65).is_aligned());
    }

    #[test]
    fn ref_null() {
        assert!(Ref::NULL.is_null());
        assert!(!Ref::new(8).is_null());
    }

    #[test]
    fn obj_key_unresolved_roundtrip() {
        let key = ObjKey::new(42);
        assert!(!key.is_unresolved());

        let tombstone = key.as_unresolved();
        assert!(tombstone.is_unresolved());
        assert_eq!(tombstone.as_resolved(), key);
    }

    #[test]
    fn obj_key_display() {
        assert_eq!(format!("{}", ObjKey::new(7)), "key:7");
        assert_eq!(format!("{}", ObjKey::new(7).as_unresolved()), "key:~7");
    }

    #[test]
    fn version_ordering() {
        let v1 = Version::new(1);
        assert!(v1 < v1.next());
    }
}
