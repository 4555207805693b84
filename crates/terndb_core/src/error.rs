//! Error types for the storage engine.

use crate::keys::{ObjKey, Ref};
use std::io;
use thiserror::Error;

/// Result type for core operations.
pub type CoreResult<T> = Result<T, CoreError>;

/// Maximum size of a string cell in bytes.
pub const MAX_STRING_SIZE: usize = 16 * 1024 * 1024;

/// Maximum size of a binary cell in bytes.
pub const MAX_BINARY_SIZE: usize = 16 * 1024 * 1024;

/// Errors that can occur in storage engine operations.
#[derive(Debug, Error)]
pub enum CoreError {
    /// Storage backend error.
    #[error("storage error: {0}")]
    Storage(#[from] terndb_storage::StorageError),

    /// Changeset codec error.
    #[error("changeset error: {0}")]
    Changeset(#[from] terndb_changeset::ChangesetError),

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// The device is out of space.
    #[error("out of disk space")]
    OutOfDisk,

    /// The database file is corrupted. Not recoverable.
    #[error("file corrupt: {message}")]
    FileCorrupt {
        /// Description of the corruption.
        message: String,
    },

    /// A ref points outside the file or is misaligned.
    #[error("invalid ref {0:?}")]
    InvalidRef(Ref),

    /// The file header does not match this engine's format.
    #[error("format mismatch: {message}")]
    FormatMismatch {
        /// Description of the mismatch.
        message: String,
    },

    /// The requested table does not exist.
    #[error("no such table: {name}")]
    NoSuchTable {
        /// Name of the table.
        name: String,
    },

    /// A table with this name already exists.
    #[error("table exists: {name}")]
    TableExists {
        /// Name of the table.
        name: String,
    },

    /// The requested object does not exist.
    #[error("key not found: {0}")]
    KeyNotFound(ObjKey),

    /// An object with this key already exists.
    #[error("key already exists: {0}")]
    KeyAlreadyUsed(ObjKey),

    /// Column index out of range for the table's spec.
    #[error("column index out of range: {index}")]
    ColumnIndexOutOfRange {
        /// The offending index.
        index: u32,
    },

    /// The requested column does not exist.
    #[error("no such column: {name}")]
    NoSuchColumn {
        /// Name of the column.
        name: String,
    },

    /// A value of the wrong type was supplied for a column.
    #[error("type mismatch on column {column}: {message}")]
    TypeMismatch {
        /// Name of the column.
        column: String,
        /// Description of the mismatch.
        message: String,
    },

    /// Null was written to a column that is not nullable.
    #[error("column not nullable: {column}")]
    ColumnNotNullable {
        /// Name of the column.
        column: String,
    },

    /// A string exceeded the maximum cell size.
    #[error("string too big: {size} bytes (max {max})")]
    StringTooBig {
        /// Size of the rejected string.
        size: usize,
        /// The maximum allowed.
        max: usize,
    },

    /// A binary blob exceeded the maximum cell size.
    #[error("binary too big: {size} bytes (max {max})")]
    BinaryTooBig {
        /// Size of the rejected blob.
        size: usize,
        /// The maximum allowed.
        max: usize,
    },

    /// A collection operation was issued against the wrong collection kind.
    #[error("collection type mismatch on column {column}")]
    CollectionTypeMismatch {
        /// Name of the column.
        column: String,
    },

    /// Index out of bounds in a list operation.
    #[error("list index {index} out of bounds (size {size})")]
    ListIndexOutOfBounds {
        /// The offending index.
        index: usize,
        /// The list size.
        size: usize,
    },

    /// An operation that requires a write transaction ran outside one.
    #[error("not in a write transaction")]
    NotWritable,

    /// Another process holds the write lock.
    #[error("database locked: another process has exclusive access")]
    DatabaseLocked,

    /// Operation not permitted in current state.
    #[error("invalid operation: {message}")]
    InvalidOperation {
        /// Description of why the operation is invalid.
        message: String,
    },

    /// Embedded-table rule violation.
    #[error("embedded object violation: {message}")]
    EmbeddedViolation {
        /// Description of the violation.
        message: String,
    },

    /// History log corruption.
    #[error("history corruption: {message}")]
    HistoryCorruption {
        /// Description of the corruption.
        message: String,
    },

    /// A downloaded changeset failed to apply.
    #[error("bad changeset: {message}")]
    BadChangeset {
        /// Description of the failure.
        message: String,
    },
}

impl CoreError {
    /// Creates a file corruption error.
    pub fn file_corrupt(message: impl Into<String>) -> Self {
        Self::FileCorrupt {
            message: message.into(),
        }
    }

    /// Creates a format mismatch error.
    pub fn format_mismatch(message: impl Into<String>) -> Self {
        Self::FormatMismatch {
            message: message.into(),
        }
    }

    /// Creates an invalid operation error.
    pub fn invalid_operation(message: impl Into<String>) -> Self {
        Self::InvalidOperation {
            message: message.into(),
        }
    }

    /// Creates an embedded violation error.
    pub fn embedded_violation(message: impl Into<String>) -> Self {
        Self::EmbeddedViolation {
            message: message.into(),
        }
    }

    /// Creates a history corruption error.
    pub fn history_corruption(message: impl Into<String>) -> Self {
        Self::HistoryCorruption {
            message: message.into(),
        }
    }

    /// Creates a bad changeset error.
    pub fn bad_changeset(message: impl Into<String>) -> Self {
        Self::BadChangeset {
            message: message.into(),
        }
    }
}
