//! # TernDB Sync Protocol
//!
//! Wire protocol messages and framing for TernDB synchronization.
//!
//! Each message begins with an ASCII kind token followed by
//! space-separated header fields terminated by `\n`, optionally
//! followed by a body of declared byte length. Bodies above a size
//! threshold are wrapped in a compression envelope
//! `{algorithm, flags, payload}`.
//!
//! The protocol is symmetric in framing but asymmetric in vocabulary:
//! clients send BIND/IDENT/UPLOAD/MARK/UNBIND/REFRESH/PING, servers
//! send IDENT/DOWNLOAD/MARK/ERROR/UNBOUND/PONG.

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod compression;
mod error;
mod messages;

pub use compression::{compress_body, decompress_body, CompressionAlgorithm, COMPRESS_THRESHOLD};
pub use error::{ErrorCode, ProtocolError, ProtocolResult};
pub use messages::{
    ClientMessage, DownloadProgress, MessageParser, RemoteChangeset, ServerMessage,
    UploadChangeset, PROTOCOL_VERSION,
};
