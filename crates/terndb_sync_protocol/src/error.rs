//! Protocol errors and server error codes.

use thiserror::Error;

/// Result type for protocol operations.
pub type ProtocolResult<T> = Result<T, ProtocolError>;

/// Errors detected while encoding or decoding protocol messages.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ProtocolError {
    /// An unknown message kind token.
    #[error("unknown message: {kind}")]
    UnknownMessage {
        /// The offending token.
        kind: String,
    },

    /// A malformed header line or body.
    #[error("bad syntax: {message}")]
    BadSyntax {
        /// Description of the malformation.
        message: String,
    },

    /// A header field or body exceeds protocol limits.
    #[error("limits exceeded: {message}")]
    LimitsExceeded {
        /// Description of the exceeded limit.
        message: String,
    },

    /// A compressed body could not be expanded.
    #[error("bad compression: {message}")]
    BadCompression {
        /// Description of the failure.
        message: String,
    },

    /// A changeset entry inside a body was malformed.
    #[error("bad changeset header: {message}")]
    BadChangesetHeader {
        /// Description of the malformation.
        message: String,
    },
}

impl ProtocolError {
    /// Creates a bad-syntax error.
    pub fn bad_syntax(message: impl Into<String>) -> Self {
        Self::BadSyntax {
            message: message.into(),
        }
    }
}

/// Error codes carried by server ERROR messages.
///
/// `try_again` travels separately in the message; codes only identify
/// the condition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum ErrorCode {
    /// The server did not understand a message kind.
    UnknownMessage = 101,
    /// A message failed to parse.
    BadSyntax = 102,
    /// A message exceeded protocol limits.
    LimitsExceeded = 103,
    /// A session identifier did not match an open session.
    BadSessionIdent = 104,
    /// A message arrived out of protocol order.
    BadMessageOrder = 105,
    /// The client presented an identity the server does not recognize.
    BadClientFileIdent = 106,
    /// Upload or download progress violated monotonicity.
    BadProgress = 107,
    /// A changeset failed to parse or apply.
    BadChangeset = 108,
    /// A server version was out of range.
    BadServerVersion = 109,
    /// A compressed body could not be expanded.
    BadCompression = 110,
    /// A client version was out of range.
    BadClientVersion = 111,
    /// The protocol versions are incompatible.
    ProtocolMismatch = 112,
    /// The client lacks permission for the operation.
    PermissionDenied = 206,
    /// The session's access token expired.
    TokenExpired = 207,
    /// Any other server-side condition.
    Other = 299,
}

impl ErrorCode {
    /// Decodes a wire code; unknown codes map to [`ErrorCode::Other`].
    #[must_use]
    pub fn from_wire(code: u32) -> Self {
        match code {
            101 => Self::UnknownMessage,
            102 => Self::BadSyntax,
            103 => Self::LimitsExceeded,
            104 => Self::BadSessionIdent,
            105 => Self::BadMessageOrder,
            106 => Self::BadClientFileIdent,
            107 => Self::BadProgress,
            108 => Self::BadChangeset,
            109 => Self::BadServerVersion,
            110 => Self::BadCompression,
            111 => Self::BadClientVersion,
            112 => Self::ProtocolMismatch,
            206 => Self::PermissionDenied,
            207 => Self::TokenExpired,
            _ => Self::Other,
        }
    }

    /// The numeric wire form.
    #[must_use]
    pub fn to_wire(self) -> u32 {
        self as u32
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_code_roundtrip() {
        for code in [
            ErrorCode::UnknownMessage,
            ErrorCode::BadChangeset,
            ErrorCode::ProtocolMismatch,
            ErrorCode::TokenExpired,
        ] {
            assert_eq!(ErrorCode::from_wire(code.to_wire()), code);
        }
    }

    #[test]
    fn unknown_code_maps_to_other() {
        assert_eq!(ErrorCode::from_wire(9999), ErrorCode::Other);
    }
}
