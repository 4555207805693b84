//! # TernDB Core
//!
//! Copy-on-write storage engine for TernDB.
//!
//! This crate provides:
//! - An append-only, copy-on-write page file hosting width-packed arrays
//! - A position-ordered B+-tree used by every list and every column
//! - Clusters (row groups) addressed by stable object keys
//! - Tables with typed columns, links, backlinks, and search indexes
//! - Snapshot-isolated read/write transactions with a single writer
//! - An append-only history of committed changesets for synchronization
//!
//! The unit of storage is the [`Array`](array::Array): a width-packed
//! leaf identified by a `Ref` (an 8-byte-aligned file offset). Everything
//! above - B+-trees, clusters, tables, the group directory - is a forest
//! of arrays reachable from a single top ref that is swapped atomically
//! at commit.

#![deny(unsafe_code)]
#![warn(missing_docs)]

pub mod alloc;
pub mod array;
pub mod bptree;
pub mod cluster;
mod db;
mod error;
mod group;
pub mod history;
mod keys;
mod list;
mod metrics;
mod obj;
mod replay;
mod schema;
mod table;
mod transaction;
mod value;

pub use db::{Db, DbConfig};
pub use error::{CoreError, CoreResult};
pub use history::{FileIdent, HistoryEntry, SyncProgress};
pub use keys::{ColKey, ObjKey, Ref, TableKey, Version};
pub use list::{Dictionary, LinkList, List, Set};
pub use metrics::{Counter, Metrics};
pub use obj::Obj;
pub use replay::apply_changeset;
pub use schema::{ColumnAttr, ColumnSpec, ColumnType, TableType};
pub use table::Table;
pub use transaction::{ReadTransaction, Transaction, WriteTransaction};
pub use value::Value;
