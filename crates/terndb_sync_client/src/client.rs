//! The sync client: one service thread owning every connection and
//! session.
//!
//! Public methods never touch protocol state directly; they post
//! commands to the service thread and, where a result is needed, block
//! on a completion waiter the service thread resolves.

use crate::config::ClientConfig;
use crate::connection::Connection;
use crate::error::{SyncError, SyncResult};
use crate::history::ClientHistory;
use crate::session::{Session, SessionConfig};
use crate::transport::{Transport, TransportFactory};
use crate::waiter::CompletionWaiter;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::mpsc::{channel, RecvTimeoutError, Sender};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;
use terndb_core::Db;
use tracing::debug;

/// How long the service loop blocks waiting for commands.
const TICK: Duration = Duration::from_millis(5);

/// How long each pump blocks on the transport.
const IDLE: Duration = Duration::from_millis(2);

enum Command {
    BindSession {
        db: Db,
        path: String,
        access_token: String,
        reply: Sender<u32>,
    },
    DeactivateSession {
        ident: u32,
    },
    RefreshToken {
        ident: u32,
        access_token: String,
    },
    RequestUploadCompletion {
        ident: u32,
        reply: Sender<CompletionWaiter>,
    },
    RequestDownloadCompletion {
        ident: u32,
        reply: Sender<CompletionWaiter>,
    },
    LocalCommit,
    Stop,
}

/// Shares one transport factory between connections.
struct SharedFactory(Arc<Mutex<Box<dyn TransportFactory>>>);

impl TransportFactory for SharedFactory {
    fn create(&mut self) -> Box<dyn Transport> {
        self.0.lock().create()
    }
}

/// The sync client.
///
/// Dropping the client initiates an orderly shutdown: sessions unbind,
/// connections close voluntarily, and the service thread exits.
pub struct Client {
    command_tx: Sender<Command>,
    thread: Option<JoinHandle<()>>,
}

impl Client {
    /// Starts a client with the given transport factory.
    #[must_use]
    pub fn new(config: ClientConfig, factory: Box<dyn TransportFactory>) -> Self {
        let (command_tx, command_rx) = channel::<Command>();
        let thread_config = config;
        let thread = std::thread::Builder::new()
            .name("terndb-sync".into())
            .spawn(move || {
                let factory = Arc::new(Mutex::new(factory));
                let mut connections: Vec<Connection> = Vec::new();
                let mut session_homes: HashMap<u32, usize> = HashMap::new();
                let mut next_session_ident: u32 = 1;
                let mut stop_deadline: Option<std::time::Instant> = None;

                loop {
                    let command = command_rx.recv_timeout(TICK);
                    match command {
                        Ok(Command::BindSession {
                            db,
                            path,
                            access_token,
                            reply,
                        }) => {
                            let ident = next_session_ident;
                            next_session_ident += 1;
                            let session = Session::new(
                                ident,
                                ClientHistory::new(db),
                                SessionConfig::from_client(&thread_config, path, access_token),
                            );
                            let home = if thread_config.one_connection_per_session
                                || connections.is_empty()
                            {
                                connections.push(Connection::new(
                                    thread_config.clone(),
                                    Box::new(SharedFactory(Arc::clone(&factory))),
                                ));
                                connections.len() - 1
                            } else {
                                0
                            };
                            connections[home].add_session(session);
                            session_homes.insert(ident, home);
                            let _ = reply.send(ident);
                        }
                        Ok(Command::DeactivateSession { ident }) => {
                            if let Some(&home) = session_homes.get(&ident) {
                                connections[home].initiate_session_deactivation(ident);
                            }
                        }
                        Ok(Command::RefreshToken {
                            ident,
                            access_token,
                        }) => {
                            if let Some(&home) = session_homes.get(&ident) {
                                if let Some(session) = connections[home].session_mut(ident) {
                                    session.refresh_access_token(access_token);
                                }
                                connections[home].on_local_commit();
                            }
                        }
                        Ok(Command::RequestUploadCompletion { ident, reply }) => {
                            let waiter = session_homes
                                .get(&ident)
                                .and_then(|&home| connections[home].session_mut(ident))
                                .map(Session::request_upload_completion);
                            match waiter {
                                Some(waiter) => {
                                    let _ = reply.send(waiter);
                                }
                                None => {
                                    let waiter = CompletionWaiter::new();
                                    waiter.cancel();
                                    let _ = reply.send(waiter);
                                }
                            }
                            if let Some(&home) = session_homes.get(&ident) {
                                connections[home].on_local_commit();
                            }
                        }
                        Ok(Command::RequestDownloadCompletion { ident, reply }) => {
                            let waiter = session_homes
                                .get(&ident)
                                .and_then(|&home| connections[home].session_mut(ident))
                                .map(Session::request_download_completion);
                            match waiter {
                                Some(waiter) => {
                                    let _ = reply.send(waiter);
                                }
                                None => {
                                    let waiter = CompletionWaiter::new();
                                    waiter.cancel();
                                    let _ = reply.send(waiter);
                                }
                            }
                            if let Some(&home) = session_homes.get(&ident) {
                                connections[home].on_local_commit();
                            }
                        }
                        Ok(Command::LocalCommit) => {
                            for connection in &mut connections {
                                connection.on_local_commit();
                            }
                        }
                        Ok(Command::Stop) => {
                            stop_deadline = Some(
                                std::time::Instant::now() + Duration::from_secs(2),
                            );
                            let idents: Vec<u32> = session_homes.keys().copied().collect();
                            for ident in idents {
                                if let Some(&home) = session_homes.get(&ident) {
                                    connections[home].initiate_session_deactivation(ident);
                                }
                            }
                        }
                        Err(RecvTimeoutError::Timeout) => {}
                        Err(RecvTimeoutError::Disconnected) => break,
                    }

                    for connection in &mut connections {
                        connection.pump(IDLE);
                    }
                    session_homes.retain(|&ident, &mut home| {
                        connections[home].session(ident).is_some()
                    });

                    if let Some(deadline) = stop_deadline {
                        let drained = connections
                            .iter()
                            .all(|connection| connection.session_count() == 0);
                        if drained || std::time::Instant::now() >= deadline {
                            break;
                        }
                    }
                }
                debug!("sync client service thread exiting");
            })
            .expect("spawn sync client thread");

        Self {
            command_tx,
            thread: Some(thread),
        }
    }

    /// Binds a session for the database file at `path`.
    ///
    /// # Errors
    ///
    /// Fails if the client is stopping.
    pub fn bind_session(
        &self,
        db: &Db,
        path: impl Into<String>,
        access_token: impl Into<String>,
    ) -> SyncResult<SessionHandle> {
        let (reply, response) = channel();
        self.command_tx
            .send(Command::BindSession {
                db: db.clone(),
                path: path.into(),
                access_token: access_token.into(),
                reply,
            })
            .map_err(|_| SyncError::Stopped)?;
        let ident = response.recv().map_err(|_| SyncError::Stopped)?;

        // Local commits wake the service thread so uploads get
        // scheduled promptly.
        let command_tx = self.command_tx.clone();
        db.add_commit_listener(move |_| {
            let _ = command_tx.send(Command::LocalCommit);
        });

        Ok(SessionHandle {
            ident,
            command_tx: self.command_tx.clone(),
        })
    }

    /// Initiates an orderly shutdown and waits for the service thread.
    pub fn stop(mut self) {
        self.shutdown();
    }

    fn shutdown(&mut self) {
        let _ = self.command_tx.send(Command::Stop);
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}

impl Drop for Client {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl std::fmt::Debug for Client {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Client").finish_non_exhaustive()
    }
}

/// A handle to one bound session.
#[derive(Clone)]
pub struct SessionHandle {
    ident: u32,
    command_tx: Sender<Command>,
}

impl SessionHandle {
    /// The session identifier.
    #[must_use]
    pub fn ident(&self) -> u32 {
        self.ident
    }

    /// Blocks until everything committed so far has been acknowledged
    /// by the server, or `timeout` elapses.
    ///
    /// # Errors
    ///
    /// [`SyncError::Cancelled`] if the session deactivates first,
    /// [`SyncError::WaitTimeout`] on timeout.
    pub fn wait_for_upload_completion(&self, timeout: Duration) -> SyncResult<()> {
        let (reply, response) = channel();
        self.command_tx
            .send(Command::RequestUploadCompletion {
                ident: self.ident,
                reply,
            })
            .map_err(|_| SyncError::Stopped)?;
        let waiter = response.recv().map_err(|_| SyncError::Stopped)?;
        waiter.wait(timeout)
    }

    /// Blocks until the client has downloaded and integrated everything
    /// the server had when this call was made, or `timeout` elapses.
    ///
    /// # Errors
    ///
    /// [`SyncError::Cancelled`] if the session deactivates first,
    /// [`SyncError::WaitTimeout`] on timeout.
    pub fn wait_for_download_completion(&self, timeout: Duration) -> SyncResult<()> {
        let (reply, response) = channel();
        self.command_tx
            .send(Command::RequestDownloadCompletion {
                ident: self.ident,
                reply,
            })
            .map_err(|_| SyncError::Stopped)?;
        let waiter = response.recv().map_err(|_| SyncError::Stopped)?;
        waiter.wait(timeout)
    }

    /// Supplies a fresh access token for the session.
    pub fn refresh_token(&self, access_token: impl Into<String>) {
        let _ = self.command_tx.send(Command::RefreshToken {
            ident: self.ident,
            access_token: access_token.into(),
        });
    }

    /// Begins deactivating the session.
    pub fn close(&self) {
        let _ = self.command_tx.send(Command::DeactivateSession { ident: self.ident });
    }
}

impl std::fmt::Debug for SessionHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionHandle")
            .field("ident", &self.ident)
            .finish()
    }
}
