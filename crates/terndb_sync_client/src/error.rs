//! Sync client errors and connection state reporting.

use std::time::Duration;
use terndb_sync_protocol::ErrorCode;
use thiserror::Error;

/// Result type for sync operations.
pub type SyncResult<T> = Result<T, SyncError>;

/// Errors raised by the sync client.
#[derive(Debug, Error)]
pub enum SyncError {
    /// The transport is not connected.
    #[error("not connected")]
    NotConnected,

    /// The transport was closed by the peer.
    #[error("connection closed by peer")]
    ConnectionClosed,

    /// The connect watchdog fired.
    #[error("connect timed out after {0:?}")]
    ConnectTimeout(Duration),

    /// No PONG arrived within the keepalive timeout.
    #[error("pong timed out")]
    PongTimeout,

    /// A protocol-level failure; the connection must be torn down.
    #[error("protocol error: {0}")]
    Protocol(#[from] terndb_sync_protocol::ProtocolError),

    /// A downloaded changeset failed to integrate.
    #[error("bad changeset: {0}")]
    BadChangeset(String),

    /// The server reported an error for a session.
    #[error("server error {code:?}: {message}")]
    ServerError {
        /// The reported code.
        code: ErrorCode,
        /// The human-readable description.
        message: String,
        /// True if retrying later may succeed.
        try_again: bool,
    },

    /// A storage operation failed while integrating or scanning.
    #[error("storage error: {0}")]
    Storage(#[from] terndb_core::CoreError),

    /// The operation was cancelled because the session deactivated.
    #[error("operation cancelled")]
    Cancelled,

    /// A cross-thread wait timed out.
    #[error("wait timed out")]
    WaitTimeout,

    /// The client is shutting down.
    #[error("client stopped")]
    Stopped,
}

impl SyncError {
    /// True if the condition is permanent for this session.
    #[must_use]
    pub fn is_fatal(&self) -> bool {
        match self {
            Self::ServerError { try_again, .. } => !try_again,
            Self::BadChangeset(_) | Self::Protocol(_) => true,
            _ => false,
        }
    }
}

/// A session-level error surfaced to state listeners.
#[derive(Debug, Clone)]
pub struct SessionError {
    /// The reported code.
    pub code: ErrorCode,
    /// True if the session will not recover without intervention.
    pub is_fatal: bool,
    /// Human-readable description.
    pub detailed_message: String,
}

/// Why a connection was terminated.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TerminationReason {
    /// The client closed the connection on purpose (shutdown, linger
    /// expiry). Reconnects are immediate.
    Voluntary,
    /// The transport failed or was closed by the peer.
    ConnectionLost,
    /// The connect watchdog fired.
    ConnectTimeout,
    /// The heartbeat went unanswered.
    PongTimeout,
    /// The client detected a protocol violation.
    ProtocolViolation,
    /// The server reported a fatal condition; reconnects are pushed
    /// out to the long backoff cap.
    ServerFatal,
}

impl TerminationReason {
    /// True if the reconnect delay is waived.
    #[must_use]
    pub fn is_voluntary(self) -> bool {
        self == Self::Voluntary
    }
}

/// Connection state as reported to listeners.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// No transport; a reconnect may be scheduled.
    Disconnected,
    /// The transport handshake is in flight.
    Connecting,
    /// The transport is established.
    Connected,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fatality() {
        assert!(SyncError::BadChangeset("x".into()).is_fatal());
        assert!(SyncError::ServerError {
            code: ErrorCode::PermissionDenied,
            message: String::new(),
            try_again: false,
        }
        .is_fatal());
        assert!(!SyncError::ServerError {
            code: ErrorCode::Other,
            message: String::new(),
            try_again: true,
        }
        .is_fatal());
        assert!(!SyncError::PongTimeout.is_fatal());
    }

    #[test]
    fn voluntary_reasons() {
        assert!(TerminationReason::Voluntary.is_voluntary());
        assert!(!TerminationReason::PongTimeout.is_voluntary());
    }
}
