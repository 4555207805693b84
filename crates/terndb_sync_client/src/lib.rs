//! # TernDB Sync Client
//!
//! Client-side synchronization engine for TernDB.
//!
//! The client runs one service thread per instance. All connection and
//! session objects live on that thread; public methods post commands to
//! it and cross-thread waiters block on condition variables it signals.
//!
//! A [`Session`] is the protocol context for one local database file: a
//! BIND/IDENT/UPLOAD/DOWNLOAD/MARK/UNBIND state machine with an upload
//! cursor into the local history and a download cursor persisted with
//! every integrated batch. A [`Connection`] multiplexes sessions over
//! one framed transport with heartbeat and reconnect-with-backoff.

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod client;
mod config;
mod error;
mod history;
mod session;
mod connection;
mod transport;
mod waiter;

pub use client::{Client, SessionHandle};
pub use config::{ClientConfig, ReconnectMode};
pub use error::{ConnectionState, SessionError, SyncError, SyncResult, TerminationReason};
pub use history::ClientHistory;
pub use session::{Session, SessionConfig, SessionLifecycle};
pub use connection::{Connection, ReconnectInfo};
pub use transport::{duplex_pair, DuplexTransport, Transport, TransportFactory};
pub use waiter::CompletionWaiter;
