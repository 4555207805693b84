//! A scripted sync server.
//!
//! Drives the far end of the in-process duplex transport with a small,
//! deterministic server implementation: enough protocol to exercise the
//! client's BIND/IDENT/UPLOAD/DOWNLOAD/MARK/UNBIND flow, plus knobs to
//! misbehave on purpose (drop PONGs, acknowledge uploads only
//! partially, drop the connection after an upload).

use parking_lot::Mutex;
use std::sync::mpsc::{channel, Sender};
use std::sync::Arc;
use std::time::Duration;
use terndb_sync_client::{duplex_pair, DuplexTransport, Transport, TransportFactory};
use terndb_sync_protocol::{
    ClientMessage, DownloadProgress, MessageParser, RemoteChangeset, ServerMessage,
    UploadChangeset,
};
use tracing::debug;

/// Behavioral switches for the scripted server.
#[derive(Debug, Clone, Default)]
pub struct ServerKnobs {
    /// Never answer PING.
    pub drop_pongs: bool,
    /// Acknowledge uploaded client versions only up to this bound.
    pub ack_limit: Option<u64>,
    /// Drop the connection right after the first UPLOAD batch.
    pub disconnect_after_first_upload: bool,
}

/// Observable counters and received data.
#[derive(Debug, Clone, Default)]
pub struct ServerStats {
    /// Connections accepted.
    pub connections_accepted: usize,
    /// BIND messages received.
    pub binds: usize,
    /// MARK requests received.
    pub marks: usize,
    /// UPLOAD batches received, in order.
    pub upload_batches: Vec<Vec<UploadChangeset>>,
}

struct ServerState {
    knobs: ServerKnobs,
    stats: ServerStats,
    server_version: u64,
    server_salt: u64,
    next_file_ident: u64,
    integrated_client_version: u64,
    queued_downloads: Vec<RemoteChangeset>,
    disconnected_once: bool,
}

/// The scripted server. Hand its transport factory to a
/// [`Client`](terndb_sync_client::Client); every connection the client
/// makes is served by a dedicated thread.
pub struct ScriptedServer {
    state: Arc<Mutex<ServerState>>,
    incoming_tx: Sender<DuplexTransport>,
}

impl ScriptedServer {
    /// Starts a server with the given knobs.
    #[must_use]
    pub fn new(knobs: ServerKnobs) -> Self {
        let state = Arc::new(Mutex::new(ServerState {
            knobs,
            stats: ServerStats::default(),
            server_version: 0,
            server_salt: 0x7e41,
            next_file_ident: 1,
            integrated_client_version: 0,
            queued_downloads: Vec::new(),
            disconnected_once: false,
        }));

        let (incoming_tx, incoming_rx) = channel::<DuplexTransport>();
        let accept_state = Arc::clone(&state);
        std::thread::Builder::new()
            .name("scripted-server-accept".into())
            .spawn(move || {
                while let Ok(transport) = incoming_rx.recv() {
                    accept_state.lock().stats.connections_accepted += 1;
                    let conn_state = Arc::clone(&accept_state);
                    let _ = std::thread::Builder::new()
                        .name("scripted-server-conn".into())
                        .spawn(move || serve_connection(transport, &conn_state));
                }
            })
            .expect("spawn scripted server");

        Self { state, incoming_tx }
    }

    /// A snapshot of the observable state.
    #[must_use]
    pub fn stats(&self) -> ServerStats {
        self.state.lock().stats.clone()
    }

    /// The server's current version.
    #[must_use]
    pub fn server_version(&self) -> u64 {
        self.state.lock().server_version
    }

    /// Queues a changeset to be delivered in the first DOWNLOAD after
    /// the next IDENT. Returns the server version it was given.
    pub fn queue_download(&self, changeset: Vec<u8>, origin_file_ident: u64) -> u64 {
        let mut state = self.state.lock();
        state.server_version += 1;
        let version = state.server_version;
        let size = changeset.len() as u64;
        let last_integrated_client_version = state.integrated_client_version;
        state.queued_downloads.push(RemoteChangeset {
            server_version: version,
            last_integrated_client_version,
            origin_timestamp: 0,
            origin_file_ident,
            original_size: size,
            changeset,
        });
        version
    }

    /// A transport factory for the client side.
    #[must_use]
    pub fn transport_factory(&self) -> Box<dyn TransportFactory> {
        let incoming_tx = self.incoming_tx.clone();
        Box::new(move || -> Box<dyn Transport> {
            let (client_end, server_end) = duplex_pair();
            let _ = incoming_tx.send(server_end);
            Box::new(client_end)
        })
    }
}

fn progress_snapshot(state: &ServerState) -> DownloadProgress {
    DownloadProgress {
        server_version: state.server_version,
        last_integrated_client_version: state.integrated_client_version,
        latest_server_version: state.server_version,
        latest_server_salt: state.server_salt,
        upload_client_version: state.integrated_client_version,
        upload_server_version: state.server_version,
        downloadable_bytes: 0,
    }
}

fn serve_connection(mut transport: DuplexTransport, state: &Arc<Mutex<ServerState>>) {
    if transport.connect(Duration::from_millis(10)).is_err() {
        return;
    }
    let mut parser = MessageParser::new();
    loop {
        let bytes = match transport.recv(Duration::from_millis(20)) {
            Ok(Some(bytes)) => bytes,
            Ok(None) => continue,
            Err(_) => return,
        };
        parser.feed(&bytes);
        loop {
            let message = match parser.next_client_message() {
                Ok(Some(message)) => message,
                Ok(None) => break,
                Err(_) => return,
            };
            if !handle_message(message, &mut transport, state) {
                return;
            }
        }
    }
}

fn send(transport: &mut DuplexTransport, message: &ServerMessage) -> bool {
    message
        .encode()
        .ok()
        .map(|bytes| transport.send(&bytes).is_ok())
        .unwrap_or(false)
}

/// Returns false when the connection should drop.
fn handle_message(
    message: ClientMessage,
    transport: &mut DuplexTransport,
    state: &Arc<Mutex<ServerState>>,
) -> bool {
    match message {
        ClientMessage::Bind {
            session,
            need_file_ident,
            ..
        } => {
            let mut state = state.lock();
            state.stats.binds += 1;
            if need_file_ident {
                let ident = state.next_file_ident;
                state.next_file_ident += 1;
                let salt = state.server_salt;
                drop(state);
                return send(
                    transport,
                    &ServerMessage::Ident {
                        session,
                        client_file_ident: ident,
                        client_file_ident_salt: salt,
                    },
                );
            }
            true
        }
        ClientMessage::Ident { session, .. } => {
            let mut state = state.lock();
            let changesets: Vec<RemoteChangeset> = state.queued_downloads.drain(..).collect();
            let progress = progress_snapshot(&state);
            drop(state);
            send(
                transport,
                &ServerMessage::Download {
                    session,
                    progress,
                    changesets,
                },
            )
        }
        ClientMessage::Upload {
            session,
            changesets,
            ..
        } => {
            let mut state = state.lock();
            let last_version = changesets
                .last()
                .map_or(state.integrated_client_version, |c| c.client_version);
            state.server_version += changesets.len() as u64;
            state.stats.upload_batches.push(changesets);
            let acked = match state.knobs.ack_limit {
                Some(limit) => last_version.min(limit),
                None => last_version,
            };
            state.integrated_client_version = state.integrated_client_version.max(acked);
            debug!(acked, "server acknowledged upload");
            let progress = progress_snapshot(&state);
            let drop_now =
                state.knobs.disconnect_after_first_upload && !state.disconnected_once;
            if drop_now {
                state.disconnected_once = true;
            }
            drop(state);
            if !send(
                transport,
                &ServerMessage::Download {
                    session,
                    progress,
                    changesets: Vec::new(),
                },
            ) {
                return false;
            }
            if drop_now {
                transport.close();
                return false;
            }
            true
        }
        ClientMessage::Mark {
            session,
            request_ident,
        } => {
            state.lock().stats.marks += 1;
            send(
                transport,
                &ServerMessage::Mark {
                    session,
                    request_ident,
                },
            )
        }
        ClientMessage::Unbind { session } => send(transport, &ServerMessage::Unbound { session }),
        ClientMessage::Refresh { .. } => true,
        ClientMessage::Ping { timestamp, .. } => {
            if state.lock().knobs.drop_pongs {
                true
            } else {
                send(transport, &ServerMessage::Pong { timestamp })
            }
        }
    }
}
