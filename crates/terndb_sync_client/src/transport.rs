//! The framed transport abstraction.
//!
//! The real TLS/WebSocket stack lives outside this crate; the client
//! only needs a byte pipe with connect, send, timed receive, and close.
//! An in-process duplex pair backed by channels serves tests and the
//! scripted server in the testkit.

use crate::error::{SyncError, SyncResult};
use std::sync::mpsc::{channel, Receiver, RecvTimeoutError, Sender};
use std::time::Duration;

/// A bidirectional byte pipe to one server endpoint.
pub trait Transport: Send {
    /// Establishes the transport.
    ///
    /// # Errors
    ///
    /// Fails if the endpoint is unreachable within `timeout`.
    fn connect(&mut self, timeout: Duration) -> SyncResult<()>;

    /// Sends bytes.
    ///
    /// # Errors
    ///
    /// Fails if the transport is closed.
    fn send(&mut self, bytes: &[u8]) -> SyncResult<()>;

    /// Receives available bytes, waiting up to `timeout`.
    ///
    /// `Ok(None)` means nothing arrived in time; an error means the
    /// transport is gone.
    ///
    /// # Errors
    ///
    /// Fails with [`SyncError::ConnectionClosed`] on EOF.
    fn recv(&mut self, timeout: Duration) -> SyncResult<Option<Vec<u8>>>;

    /// Closes the transport.
    fn close(&mut self);
}

/// Creates a transport per connection attempt.
pub trait TransportFactory: Send {
    /// A fresh, unconnected transport.
    fn create(&mut self) -> Box<dyn Transport>;
}

impl<F> TransportFactory for F
where
    F: FnMut() -> Box<dyn Transport> + Send,
{
    fn create(&mut self) -> Box<dyn Transport> {
        self()
    }
}

/// One end of an in-process duplex byte pipe.
pub struct DuplexTransport {
    tx: Sender<Vec<u8>>,
    rx: Receiver<Vec<u8>>,
    connected: bool,
    /// When false, `connect` fails; lets tests simulate an unreachable
    /// endpoint.
    reachable: bool,
}

/// Creates a connected pair of duplex transports.
#[must_use]
pub fn duplex_pair() -> (DuplexTransport, DuplexTransport) {
    let (tx_a, rx_b) = channel();
    let (tx_b, rx_a) = channel();
    (
        DuplexTransport {
            tx: tx_a,
            rx: rx_a,
            connected: false,
            reachable: true,
        },
        DuplexTransport {
            tx: tx_b,
            rx: rx_b,
            connected: false,
            reachable: true,
        },
    )
}

impl DuplexTransport {
    /// Makes `connect` fail, simulating an unreachable endpoint.
    pub fn set_unreachable(&mut self) {
        self.reachable = false;
    }
}

impl Transport for DuplexTransport {
    fn connect(&mut self, timeout: Duration) -> SyncResult<()> {
        if !self.reachable {
            return Err(SyncError::ConnectTimeout(timeout));
        }
        self.connected = true;
        Ok(())
    }

    fn send(&mut self, bytes: &[u8]) -> SyncResult<()> {
        if !self.connected {
            return Err(SyncError::NotConnected);
        }
        self.tx
            .send(bytes.to_vec())
            .map_err(|_| SyncError::ConnectionClosed)
    }

    fn recv(&mut self, timeout: Duration) -> SyncResult<Option<Vec<u8>>> {
        if !self.connected {
            return Err(SyncError::NotConnected);
        }
        match self.rx.recv_timeout(timeout) {
            Ok(bytes) => Ok(Some(bytes)),
            Err(RecvTimeoutError::Timeout) => Ok(None),
            Err(RecvTimeoutError::Disconnected) => Err(SyncError::ConnectionClosed),
        }
    }

    fn close(&mut self) {
        self.connected = false;
    }
}
