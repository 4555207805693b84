//! Protocol messages and their wire codec.

use crate::compression::{compress_body, decompress_body, CompressionAlgorithm};
use crate::error::{ErrorCode, ProtocolError, ProtocolResult};
use terndb_changeset::{WireReader, WireWriter};

/// The protocol version spoken by this crate.
pub const PROTOCOL_VERSION: u32 = 1;

/// Maximum length of a message header line.
const MAX_HEADER_LINE: usize = 4096;

/// Maximum length of a message body on the wire.
const MAX_WIRE_BODY: usize = 256 * 1024 * 1024;

/// Download position and server state carried by a DOWNLOAD message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct DownloadProgress {
    /// Server version this batch ends at.
    pub server_version: u64,
    /// Last client version the server has integrated.
    pub last_integrated_client_version: u64,
    /// Latest version that exists on the server.
    pub latest_server_version: u64,
    /// Salt attached to `latest_server_version`.
    pub latest_server_salt: u64,
    /// Upload progress echo: client version.
    pub upload_client_version: u64,
    /// Upload progress echo: server version.
    pub upload_server_version: u64,
    /// Bytes remaining until the download is complete.
    pub downloadable_bytes: u64,
}

/// One local changeset in an UPLOAD body.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UploadChangeset {
    /// Local version produced by the changeset.
    pub client_version: u64,
    /// Server version integrated locally when it was produced.
    pub last_integrated_server_version: u64,
    /// Origin timestamp, milliseconds since the epoch.
    pub origin_timestamp: i64,
    /// Origin file identity; zero for this client.
    pub origin_file_ident: u64,
    /// The encoded changeset.
    pub changeset: Vec<u8>,
}

/// One remote changeset in a DOWNLOAD body.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteChangeset {
    /// Server version produced by the changeset.
    pub server_version: u64,
    /// Last local version integrated into it.
    pub last_integrated_client_version: u64,
    /// Origin timestamp, milliseconds since the epoch.
    pub origin_timestamp: i64,
    /// Identity of the file that originated the change.
    pub origin_file_ident: u64,
    /// Size before server-side transformation.
    pub original_size: u64,
    /// The encoded changeset.
    pub changeset: Vec<u8>,
}

/// Messages sent by the client.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClientMessage {
    /// Opens a session on an activated connection.
    Bind {
        /// Session identifier, unique per connection.
        session: u32,
        /// Server path of the file to synchronize.
        path: String,
        /// True if the client has no file identity yet.
        need_file_ident: bool,
        /// Signed access token.
        access_token: String,
    },
    /// Claims a client file identity and announces resume points.
    Ident {
        /// Session identifier.
        session: u32,
        /// The client file identity.
        client_file_ident: u64,
        /// Salt proving the identity assignment.
        client_file_ident_salt: u64,
        /// Download resume point: server version.
        download_server_version: u64,
        /// Download resume point: client version.
        download_client_version: u64,
        /// Latest server version known to the client.
        latest_server_version: u64,
        /// Salt attached to `latest_server_version`.
        latest_server_salt: u64,
    },
    /// Delivers a batch of local changesets.
    Upload {
        /// Session identifier.
        session: u32,
        /// Upload cursor: client version before this batch.
        progress_client_version: u64,
        /// Upload cursor: server version integrated at that point.
        progress_server_version: u64,
        /// Server version the client wants kept alive.
        locked_server_version: u64,
        /// The changesets, covering ascending client versions.
        changesets: Vec<UploadChangeset>,
    },
    /// Requests a download-completion watermark.
    Mark {
        /// Session identifier.
        session: u32,
        /// Caller-chosen serial echoed by the server.
        request_ident: u64,
    },
    /// Ends the session.
    Unbind {
        /// Session identifier.
        session: u32,
    },
    /// Supplies a fresh access token.
    Refresh {
        /// Session identifier.
        session: u32,
        /// The new signed access token.
        access_token: String,
    },
    /// Heartbeat.
    Ping {
        /// Sender timestamp, milliseconds.
        timestamp: u64,
        /// Last measured round-trip time, milliseconds.
        rtt: u64,
    },
}

/// Messages sent by the server.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ServerMessage {
    /// Assigns a client file identity.
    Ident {
        /// Session identifier.
        session: u32,
        /// The assigned identity.
        client_file_ident: u64,
        /// Salt proving the assignment.
        client_file_ident_salt: u64,
    },
    /// Delivers a batch of remote changesets.
    Download {
        /// Session identifier.
        session: u32,
        /// Progress and server state.
        progress: DownloadProgress,
        /// The changesets, covering ascending server versions.
        changesets: Vec<RemoteChangeset>,
    },
    /// Acknowledges a MARK request.
    Mark {
        /// Session identifier.
        session: u32,
        /// The serial from the MARK request.
        request_ident: u64,
    },
    /// Reports a protocol or session error.
    Error {
        /// Session identifier; zero for connection-level errors.
        session: u32,
        /// The error code.
        code: ErrorCode,
        /// Human-readable description.
        message: String,
        /// True if the client may retry after a delay.
        try_again: bool,
    },
    /// Confirms an UNBIND.
    Unbound {
        /// Session identifier.
        session: u32,
    },
    /// Heartbeat response.
    Pong {
        /// The timestamp echoed from the PING.
        timestamp: u64,
    },
}

fn write_header(out: &mut Vec<u8>, kind: &str, fields: &[u64]) {
    out.extend_from_slice(kind.as_bytes());
    for field in fields {
        out.push(b' ');
        out.extend_from_slice(field.to_string().as_bytes());
    }
    out.push(b'\n');
}

/// Encodes a body, returning `(is_compressed, wire_body,
/// uncompressed_size, compressed_size)`.
fn encode_body(body: Vec<u8>) -> ProtocolResult<(bool, Vec<u8>, u64, u64)> {
    let uncompressed_size = body.len() as u64;
    let envelope = compress_body(&body)?;
    if envelope.first() == Some(&(CompressionAlgorithm::Deflate as u8)) {
        let compressed_size = envelope.len() as u64;
        Ok((true, envelope, uncompressed_size, compressed_size))
    } else {
        Ok((false, body, uncompressed_size, 0))
    }
}

impl ClientMessage {
    /// Encodes this message into wire bytes.
    ///
    /// # Errors
    ///
    /// Fails on compression errors.
    pub fn encode(&self) -> ProtocolResult<Vec<u8>> {
        let mut out = Vec::new();
        match self {
            Self::Bind {
                session,
                path,
                need_file_ident,
                access_token,
            } => {
                write_header(
                    &mut out,
                    "bind",
                    &[
                        u64::from(*session),
                        path.len() as u64,
                        u64::from(*need_file_ident),
                        access_token.len() as u64,
                    ],
                );
                out.extend_from_slice(path.as_bytes());
                out.extend_from_slice(access_token.as_bytes());
            }
            Self::Ident {
                session,
                client_file_ident,
                client_file_ident_salt,
                download_server_version,
                download_client_version,
                latest_server_version,
                latest_server_salt,
            } => {
                write_header(
                    &mut out,
                    "ident",
                    &[
                        u64::from(*session),
                        *client_file_ident,
                        *client_file_ident_salt,
                        *download_server_version,
                        *download_client_version,
                        *latest_server_version,
                        *latest_server_salt,
                    ],
                );
            }
            Self::Upload {
                session,
                progress_client_version,
                progress_server_version,
                locked_server_version,
                changesets,
            } => {
                let mut writer = WireWriter::new();
                for changeset in changesets {
                    writer.write_u64(changeset.client_version);
                    writer.write_u64(changeset.last_integrated_server_version);
                    writer.write_i64(changeset.origin_timestamp);
                    writer.write_u64(changeset.origin_file_ident);
                    writer.write_bytes(&changeset.changeset);
                }
                let (is_compressed, body, uncompressed_size, compressed_size) =
                    encode_body(writer.into_bytes())?;
                write_header(
                    &mut out,
                    "upload",
                    &[
                        u64::from(*session),
                        u64::from(is_compressed),
                        uncompressed_size,
                        compressed_size,
                        *progress_client_version,
                        *progress_server_version,
                        *locked_server_version,
                    ],
                );
                out.extend_from_slice(&body);
            }
            Self::Mark {
                session,
                request_ident,
            } => {
                write_header(&mut out, "mark", &[u64::from(*session), *request_ident]);
            }
            Self::Unbind { session } => {
                write_header(&mut out, "unbind", &[u64::from(*session)]);
            }
            Self::Refresh {
                session,
                access_token,
            } => {
                write_header(
                    &mut out,
                    "refresh",
                    &[u64::from(*session), access_token.len() as u64],
                );
                out.extend_from_slice(access_token.as_bytes());
            }
            Self::Ping { timestamp, rtt } => {
                write_header(&mut out, "ping", &[*timestamp, *rtt]);
            }
        }
        Ok(out)
    }
}

impl ServerMessage {
    /// Encodes this message into wire bytes.
    ///
    /// # Errors
    ///
    /// Fails on compression errors.
    pub fn encode(&self) -> ProtocolResult<Vec<u8>> {
        let mut out = Vec::new();
        match self {
            Self::Ident {
                session,
                client_file_ident,
                client_file_ident_salt,
            } => {
                write_header(
                    &mut out,
                    "ident",
                    &[
                        u64::from(*session),
                        *client_file_ident,
                        *client_file_ident_salt,
                    ],
                );
            }
            Self::Download {
                session,
                progress,
                changesets,
            } => {
                let mut writer = WireWriter::new();
                for changeset in changesets {
                    writer.write_u64(changeset.server_version);
                    writer.write_u64(changeset.last_integrated_client_version);
                    writer.write_i64(changeset.origin_timestamp);
                    writer.write_u64(changeset.origin_file_ident);
                    writer.write_u64(changeset.original_size);
                    writer.write_bytes(&changeset.changeset);
                }
                let (is_compressed, body, uncompressed_size, compressed_size) =
                    encode_body(writer.into_bytes())?;
                write_header(
                    &mut out,
                    "download",
                    &[
                        u64::from(*session),
                        progress.server_version,
                        progress.last_integrated_client_version,
                        progress.latest_server_version,
                        progress.latest_server_salt,
                        progress.upload_client_version,
                        progress.upload_server_version,
                        progress.downloadable_bytes,
                        u64::from(is_compressed),
                        uncompressed_size,
                        compressed_size,
                    ],
                );
                out.extend_from_slice(&body);
            }
            Self::Mark {
                session,
                request_ident,
            } => {
                write_header(&mut out, "mark", &[u64::from(*session), *request_ident]);
            }
            Self::Error {
                session,
                code,
                message,
                try_again,
            } => {
                write_header(
                    &mut out,
                    "error",
                    &[
                        u64::from(code.to_wire()),
                        message.len() as u64,
                        u64::from(*try_again),
                        u64::from(*session),
                    ],
                );
                out.extend_from_slice(message.as_bytes());
            }
            Self::Unbound { session } => {
                write_header(&mut out, "unbound", &[u64::from(*session)]);
            }
            Self::Pong { timestamp } => {
                write_header(&mut out, "pong", &[*timestamp]);
            }
        }
        Ok(out)
    }
}

/// Parsed header line: the kind token and its numeric fields.
struct Header {
    kind: String,
    fields: Vec<u64>,
}

impl Header {
    fn field(&self, index: usize) -> ProtocolResult<u64> {
        self.fields
            .get(index)
            .copied()
            .ok_or_else(|| ProtocolError::bad_syntax("missing header field"))
    }

    fn session(&self, index: usize) -> ProtocolResult<u32> {
        u32::try_from(self.field(index)?)
            .map_err(|_| ProtocolError::bad_syntax("session ident out of range"))
    }
}

/// Incremental message parser over a byte stream.
///
/// Feed arbitrarily sized chunks; complete messages come out as they
/// become available.
#[derive(Debug, Default)]
pub struct MessageParser {
    buffer: Vec<u8>,
}

impl MessageParser {
    /// Creates an empty parser.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends received bytes.
    pub fn feed(&mut self, bytes: &[u8]) {
        self.buffer.extend_from_slice(bytes);
    }

    /// Bytes currently buffered.
    #[must_use]
    pub fn buffered(&self) -> usize {
        self.buffer.len()
    }

    fn peek_header(&self) -> ProtocolResult<Option<(Header, usize)>> {
        let Some(newline) = self.buffer.iter().position(|&b| b == b'\n') else {
            if self.buffer.len() > MAX_HEADER_LINE {
                return Err(ProtocolError::LimitsExceeded {
                    message: "header line too long".into(),
                });
            }
            return Ok(None);
        };
        if newline > MAX_HEADER_LINE {
            return Err(ProtocolError::LimitsExceeded {
                message: "header line too long".into(),
            });
        }
        let line = std::str::from_utf8(&self.buffer[..newline])
            .map_err(|_| ProtocolError::bad_syntax("header is not ASCII"))?;
        let mut tokens = line.split(' ');
        let kind = tokens
            .next()
            .filter(|kind| !kind.is_empty())
            .ok_or_else(|| ProtocolError::bad_syntax("empty header"))?
            .to_owned();
        let mut fields = Vec::new();
        for token in tokens {
            fields.push(
                token
                    .parse::<u64>()
                    .map_err(|_| ProtocolError::bad_syntax("non-numeric header field"))?,
            );
        }
        Ok(Some((Header { kind, fields }, newline + 1)))
    }

    /// Extracts a message body of `len` bytes following the header, if
    /// fully buffered. Consumes header and body on success.
    fn take_with_body(&mut self, header_len: usize, body_len: usize) -> ProtocolResult<Option<Vec<u8>>> {
        if body_len > MAX_WIRE_BODY {
            return Err(ProtocolError::LimitsExceeded {
                message: "body too large".into(),
            });
        }
        if self.buffer.len() < header_len + body_len {
            return Ok(None);
        }
        let body = self.buffer[header_len..header_len + body_len].to_vec();
        self.buffer.drain(..header_len + body_len);
        Ok(Some(body))
    }

    /// Parses the next client-sent message, if complete.
    ///
    /// # Errors
    ///
    /// Fails on malformed input; the connection must be torn down.
    pub fn next_client_message(&mut self) -> ProtocolResult<Option<ClientMessage>> {
        let Some((header, header_len)) = self.peek_header()? else {
            return Ok(None);
        };
        match header.kind.as_str() {
            "bind" => {
                let path_len = header.field(1)? as usize;
                let token_len = header.field(3)? as usize;
                let Some(body) = self.take_with_body(header_len, path_len + token_len)? else {
                    return Ok(None);
                };
                let path = String::from_utf8(body[..path_len].to_vec())
                    .map_err(|_| ProtocolError::bad_syntax("path is not UTF-8"))?;
                let access_token = String::from_utf8(body[path_len..].to_vec())
                    .map_err(|_| ProtocolError::bad_syntax("token is not UTF-8"))?;
                Ok(Some(ClientMessage::Bind {
                    session: header.session(0)?,
                    path,
                    need_file_ident: header.field(2)? != 0,
                    access_token,
                }))
            }
            "ident" => {
                self.buffer.drain(..header_len);
                Ok(Some(ClientMessage::Ident {
                    session: header.session(0)?,
                    client_file_ident: header.field(1)?,
                    client_file_ident_salt: header.field(2)?,
                    download_server_version: header.field(3)?,
                    download_client_version: header.field(4)?,
                    latest_server_version: header.field(5)?,
                    latest_server_salt: header.field(6)?,
                }))
            }
            "upload" => {
                let is_compressed = header.field(1)? != 0;
                let uncompressed_size = header.field(2)? as usize;
                let compressed_size = header.field(3)? as usize;
                let wire_len = if is_compressed {
                    compressed_size
                } else {
                    uncompressed_size
                };
                let Some(wire_body) = self.take_with_body(header_len, wire_len)? else {
                    return Ok(None);
                };
                let body = if is_compressed {
                    decompress_body(&wire_body)?
                } else {
                    wire_body
                };
                if body.len() != uncompressed_size {
                    return Err(ProtocolError::bad_syntax("body size mismatch"));
                }
                let changesets = decode_upload_changesets(&body)?;
                Ok(Some(ClientMessage::Upload {
                    session: header.session(0)?,
                    progress_client_version: header.field(4)?,
                    progress_server_version: header.field(5)?,
                    locked_server_version: header.field(6)?,
                    changesets,
                }))
            }
            "mark" => {
                self.buffer.drain(..header_len);
                Ok(Some(ClientMessage::Mark {
                    session: header.session(0)?,
                    request_ident: header.field(1)?,
                }))
            }
            "unbind" => {
                self.buffer.drain(..header_len);
                Ok(Some(ClientMessage::Unbind {
                    session: header.session(0)?,
                }))
            }
            "refresh" => {
                let token_len = header.field(1)? as usize;
                let Some(body) = self.take_with_body(header_len, token_len)? else {
                    return Ok(None);
                };
                let access_token = String::from_utf8(body)
                    .map_err(|_| ProtocolError::bad_syntax("token is not UTF-8"))?;
                Ok(Some(ClientMessage::Refresh {
                    session: header.session(0)?,
                    access_token,
                }))
            }
            "ping" => {
                self.buffer.drain(..header_len);
                Ok(Some(ClientMessage::Ping {
                    timestamp: header.field(0)?,
                    rtt: header.field(1)?,
                }))
            }
            kind => Err(ProtocolError::UnknownMessage {
                kind: kind.to_owned(),
            }),
        }
    }

    /// Parses the next server-sent message, if complete.
    ///
    /// # Errors
    ///
    /// Fails on malformed input; the connection must be torn down.
    pub fn next_server_message(&mut self) -> ProtocolResult<Option<ServerMessage>> {
        let Some((header, header_len)) = self.peek_header()? else {
            return Ok(None);
        };
        match header.kind.as_str() {
            "ident" => {
                self.buffer.drain(..header_len);
                Ok(Some(ServerMessage::Ident {
                    session: header.session(0)?,
                    client_file_ident: header.field(1)?,
                    client_file_ident_salt: header.field(2)?,
                }))
            }
            "download" => {
                let is_compressed = header.field(8)? != 0;
                let uncompressed_size = header.field(9)? as usize;
                let compressed_size = header.field(10)? as usize;
                let wire_len = if is_compressed {
                    compressed_size
                } else {
                    uncompressed_size
                };
                let Some(wire_body) = self.take_with_body(header_len, wire_len)? else {
                    return Ok(None);
                };
                let body = if is_compressed {
                    decompress_body(&wire_body)?
                } else {
                    wire_body
                };
                if body.len() != uncompressed_size {
                    return Err(ProtocolError::bad_syntax("body size mismatch"));
                }
                let changesets = decode_remote_changesets(&body)?;
                Ok(Some(ServerMessage::Download {
                    session: header.session(0)?,
                    progress: DownloadProgress {
                        server_version: header.field(1)?,
                        last_integrated_client_version: header.field(2)?,
                        latest_server_version: header.field(3)?,
                        latest_server_salt: header.field(4)?,
                        upload_client_version: header.field(5)?,
                        upload_server_version: header.field(6)?,
                        downloadable_bytes: header.field(7)?,
                    },
                    changesets,
                }))
            }
            "mark" => {
                self.buffer.drain(..header_len);
                Ok(Some(ServerMessage::Mark {
                    session: header.session(0)?,
                    request_ident: header.field(1)?,
                }))
            }
            "error" => {
                let message_len = header.field(1)? as usize;
                let Some(body) = self.take_with_body(header_len, message_len)? else {
                    return Ok(None);
                };
                let message = String::from_utf8(body)
                    .map_err(|_| ProtocolError::bad_syntax("error message is not UTF-8"))?;
                Ok(Some(ServerMessage::Error {
                    session: header.session(3)?,
                    code: ErrorCode::from_wire(header.field(0)? as u32),
                    message,
                    try_again: header.field(2)? != 0,
                }))
            }
            "unbound" => {
                self.buffer.drain(..header_len);
                Ok(Some(ServerMessage::Unbound {
                    session: header.session(0)?,
                }))
            }
            "pong" => {
                self.buffer.drain(..header_len);
                Ok(Some(ServerMessage::Pong {
                    timestamp: header.field(0)?,
                }))
            }
            kind => Err(ProtocolError::UnknownMessage {
                kind: kind.to_owned(),
            }),
        }
    }
}

fn decode_upload_changesets(body: &[u8]) -> ProtocolResult<Vec<UploadChangeset>> {
    let mut reader = WireReader::new(body);
    let mut changesets = Vec::new();
    while !reader.is_at_end() {
        let entry = (|| -> Result<UploadChangeset, terndb_changeset::ChangesetError> {
            Ok(UploadChangeset {
                client_version: reader.read_u64()?,
                last_integrated_server_version: reader.read_u64()?,
                origin_timestamp: reader.read_i64()?,
                origin_file_ident: reader.read_u64()?,
                changeset: reader.read_bytes()?,
            })
        })()
        .map_err(|err| ProtocolError::BadChangesetHeader {
            message: err.to_string(),
        })?;
        changesets.push(entry);
    }
    Ok(changesets)
}

fn decode_remote_changesets(body: &[u8]) -> ProtocolResult<Vec<RemoteChangeset>> {
    let mut reader = WireReader::new(body);
    let mut changesets = Vec::new();
    while !reader.is_at_end() {
        let entry = (|| -> Result<RemoteChangeset, terndb_changeset::ChangesetError> {
            Ok(RemoteChangeset {
                server_version: reader.read_u64()?,
                last_integrated_client_version: reader.read_u64()?,
                origin_timestamp: reader.read_i64()?,
                origin_file_ident: reader.read_u64()?,
                original_size: reader.read_u64()?,
                changeset: reader.read_bytes()?,
            })
        })()
        .map_err(|err| ProtocolError::BadChangesetHeader {
            message: err.to_string(),
        })?;
        changesets.push(entry);
    }
    Ok(changesets)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn roundtrip_client(message: ClientMessage) {
        let bytes = message.encode().unwrap();
        let mut parser = MessageParser::new();
        parser.feed(&bytes);
        let decoded = parser.next_client_message().unwrap().unwrap();
        assert_eq!(decoded, message);
        assert_eq!(parser.buffered(), 0);
    }

    fn roundtrip_server(message: ServerMessage) {
        let bytes = message.encode().unwrap();
        let mut parser = MessageParser::new();
        parser.feed(&bytes);
        let decoded = parser.next_server_message().unwrap().unwrap();
        assert_eq!(decoded, message);
        assert_eq!(parser.buffered(), 0);
    }

    #[test]
    fn bind_roundtrip() {
        roundtrip_client(ClientMessage::Bind {
            session: 3,
            path: "/app/default".into(),
            need_file_ident: true,
            access_token: "token-xyz".into(),
        });
    }

    #[test]
    fn ident_roundtrip() {
        roundtrip_client(ClientMessage::Ident {
            session: 3,
            client_file_ident: 77,
            client_file_ident_salt: 0x5a17,
            download_server_version: 10,
            download_client_version: 4,
            latest_server_version: 12,
            latest_server_salt: 9,
        });
    }

    #[test]
    fn upload_roundtrip() {
        roundtrip_client(ClientMessage::Upload {
            session: 1,
            progress_client_version: 9,
            progress_server_version: 4,
            locked_server_version: 4,
            changesets: vec![
                UploadChangeset {
                    client_version: 10,
                    last_integrated_server_version: 4,
                    origin_timestamp: 1_700_000_000_000,
                    origin_file_ident: 0,
                    changeset: vec![1, 2, 3],
                },
                UploadChangeset {
                    client_version: 11,
                    last_integrated_server_version: 4,
                    origin_timestamp: 1_700_000_000_500,
                    origin_file_ident: 0,
                    changeset: vec![],
                },
            ],
        });
    }

    #[test]
    fn upload_large_body_compresses() {
        let message = ClientMessage::Upload {
            session: 1,
            progress_client_version: 0,
            progress_server_version: 0,
            locked_server_version: 0,
            changesets: vec![UploadChangeset {
                client_version: 1,
                last_integrated_server_version: 0,
                origin_timestamp: 0,
                origin_file_ident: 0,
                changeset: vec![0u8; 32 * 1024],
            }],
        };
        let bytes = message.encode().unwrap();
        assert!(bytes.len() < 16 * 1024);
        let mut parser = MessageParser::new();
        parser.feed(&bytes);
        assert_eq!(parser.next_client_message().unwrap().unwrap(), message);
    }

    #[test]
    fn download_roundtrip() {
        roundtrip_server(ServerMessage::Download {
            session: 2,
            progress: DownloadProgress {
                server_version: 100,
                last_integrated_client_version: 15,
                latest_server_version: 100,
                latest_server_salt: 7,
                upload_client_version: 15,
                upload_server_version: 98,
                downloadable_bytes: 0,
            },
            changesets: vec![RemoteChangeset {
                server_version: 100,
                last_integrated_client_version: 15,
                origin_timestamp: 1_700_000_001_000,
                origin_file_ident: 9,
                original_size: 3,
                changeset: vec![7, 8, 9],
            }],
        });
    }

    #[test]
    fn error_roundtrip() {
        roundtrip_server(ServerMessage::Error {
            session: 5,
            code: ErrorCode::BadChangeset,
            message: "changeset failed to apply".into(),
            try_again: false,
        });
    }

    #[test]
    fn ping_pong_roundtrip() {
        roundtrip_client(ClientMessage::Ping {
            timestamp: 123_456,
            rtt: 42,
        });
        roundtrip_server(ServerMessage::Pong { timestamp: 123_456 });
    }

    #[test]
    fn mark_unbind_unbound() {
        roundtrip_client(ClientMessage::Mark {
            session: 1,
            request_ident: 7,
        });
        roundtrip_client(ClientMessage::Unbind { session: 1 });
        roundtrip_server(ServerMessage::Unbound { session: 1 });
        roundtrip_server(ServerMessage::Mark {
            session: 1,
            request_ident: 7,
        });
    }

    #[test]
    fn partial_feed_waits_for_completion() {
        let message = ClientMessage::Bind {
            session: 1,
            path: "/p".into(),
            need_file_ident: false,
            access_token: "tok".into(),
        };
        let bytes = message.encode().unwrap();
        let mut parser = MessageParser::new();
        let (first, second) = bytes.split_at(bytes.len() / 2);
        parser.feed(first);
        assert!(parser.next_client_message().unwrap().is_none());
        parser.feed(second);
        assert_eq!(parser.next_client_message().unwrap().unwrap(), message);
    }

    #[test]
    fn pipelined_messages_parse_in_order() {
        let first = ClientMessage::Ping {
            timestamp: 1,
            rtt: 0,
        };
        let second = ClientMessage::Unbind { session: 9 };
        let mut bytes = first.encode().unwrap();
        bytes.extend(second.encode().unwrap());
        let mut parser = MessageParser::new();
        parser.feed(&bytes);
        assert_eq!(parser.next_client_message().unwrap().unwrap(), first);
        assert_eq!(parser.next_client_message().unwrap().unwrap(), second);
        assert!(parser.next_client_message().unwrap().is_none());
    }

    #[test]
    fn unknown_kind_rejected() {
        let mut parser = MessageParser::new();
        parser.feed(b"warble 1 2\n");
        assert!(matches!(
            parser.next_server_message(),
            Err(ProtocolError::UnknownMessage { .. })
        ));
    }

    #[test]
    fn non_numeric_field_rejected() {
        let mut parser = MessageParser::new();
        parser.feed(b"pong abc\n");
        assert!(matches!(
            parser.next_server_message(),
            Err(ProtocolError::BadSyntax { .. })
        ));
    }

    #[test]
    fn oversized_header_rejected() {
        let mut parser = MessageParser::new();
        parser.feed(&vec![b'a'; 8192]);
        assert!(matches!(
            parser.next_client_message(),
            Err(ProtocolError::LimitsExceeded { .. })
        ));
    }
}
