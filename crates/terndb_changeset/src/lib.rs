//! # TernDB Changeset
//!
//! Changeset instruction model and binary codec for TernDB.
//!
//! A changeset is the sequence of instructions recording one committed
//! write transaction. Changesets are appended to the local history by the
//! storage engine's replication layer, uploaded to the sync server, and
//! replayed against a database when integrating remote changes.
//!
//! The encoding is deterministic: identical instruction sequences produce
//! identical bytes, so changeset identity can be compared bytewise.
//!
//! ## Usage
//!
//! ```
//! use terndb_changeset::{encode_instructions, decode_instructions, Instruction};
//!
//! let instructions = vec![Instruction::CreateObject {
//!     table: "person".into(),
//!     key: 7,
//! }];
//! let bytes = encode_instructions(&instructions);
//! let decoded = decode_instructions(&bytes).unwrap();
//! assert_eq!(instructions, decoded);
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod error;
mod instruction;
mod wire;

pub use error::{ChangesetError, ChangesetResult};
pub use instruction::{
    decode_instructions, encode_instructions, CollectionKind, Instruction, WireColumnType,
    WireValue,
};
pub use wire::{WireReader, WireWriter};
