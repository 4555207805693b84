//! Error types for the changeset codec.

use thiserror::Error;

/// Result type for changeset operations.
pub type ChangesetResult<T> = Result<T, ChangesetError>;

/// Errors that can occur while encoding or decoding a changeset.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ChangesetError {
    /// Unexpected end of input.
    #[error("unexpected end of changeset data")]
    UnexpectedEof,

    /// Unknown instruction opcode.
    #[error("unknown instruction opcode: {opcode}")]
    UnknownOpcode {
        /// The offending opcode byte.
        opcode: u8,
    },

    /// Unknown value tag.
    #[error("unknown value tag: {tag}")]
    UnknownValueTag {
        /// The offending tag byte.
        tag: u8,
    },

    /// A varint exceeded 64 bits.
    #[error("varint overflow")]
    VarintOverflow,

    /// A string field was not valid UTF-8.
    #[error("invalid UTF-8 in string field")]
    InvalidUtf8,

    /// A declared length exceeds the remaining input.
    #[error("declared length {declared} exceeds remaining input {remaining}")]
    LengthOutOfBounds {
        /// The declared length.
        declared: u64,
        /// Bytes remaining in the input.
        remaining: usize,
    },
}
