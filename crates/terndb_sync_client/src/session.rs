//! The per-file session state machine.
//!
//! Lifecycle: Unactivated → Active → Deactivating → Deactivated, with
//! an orthogonal Suspended flag. Inside Active the protocol progresses
//! through BIND, IDENT, then interleaved UPLOAD/MARK until UNBIND.
//!
//! Every state change is a pure function of one input event, so the
//! machine is directly testable without a connection: events come in
//! through the `receive_*` and `connection_*` methods, and output
//! messages come out of [`Session::next_message`] when the connection
//! grants a write slot.
//!
//! Upload cursor discipline: a history entry is selected for UPLOAD at
//! most once per connection incarnation. On connection loss the cursor
//! rewinds to the last server-acknowledged progress, so delivery is
//! at-least-once and the server deduplicates.

use crate::config::ClientConfig;
use crate::error::SessionError;
use crate::history::ClientHistory;
use crate::waiter::CompletionWaiter;
use terndb_core::{FileIdent, SyncProgress};
use terndb_sync_protocol::{
    ClientMessage, DownloadProgress, ErrorCode, RemoteChangeset,
};
use tracing::{debug, warn};

/// Maximum changesets per UPLOAD message.
const UPLOAD_BATCH_LIMIT: usize = 128;

/// Per-session configuration, mostly inherited from the client.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Server path of the file.
    pub path: String,
    /// Signed access token presented in BIND.
    pub access_token: String,
    /// Upload without waiting for the first download completion.
    pub disable_upload_activation_delay: bool,
    /// Send empty changesets instead of skipping them.
    pub disable_upload_compaction: bool,
    /// Run the protocol without integrating or uploading data.
    pub dry_run: bool,
}

impl SessionConfig {
    /// Builds a session config from the client config.
    #[must_use]
    pub fn from_client(config: &ClientConfig, path: impl Into<String>, token: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            access_token: token.into(),
            disable_upload_activation_delay: config.disable_upload_activation_delay,
            disable_upload_compaction: config.disable_upload_compaction,
            dry_run: config.dry_run,
        }
    }
}

/// The externally visible lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionLifecycle {
    /// Created, not yet activated.
    Unactivated,
    /// Participating in the protocol.
    Active,
    /// UNBIND initiated, awaiting confirmation.
    Deactivating,
    /// Finished; the connection discards the session.
    Deactivated,
}

/// The per-file protocol state machine.
pub struct Session {
    ident: u32,
    config: SessionConfig,
    history: ClientHistory,

    // Lifecycle: the two booleans below encode the four states.
    active_or_deactivating: bool,
    deactivation_initiated: bool,
    finalized: bool,
    suspended: bool,

    // Protocol substate, reset per connection incarnation.
    bind_sent: bool,
    ident_sent: bool,
    allow_upload: bool,
    unbind_sent: bool,
    unbind_sent_2: bool,
    error_received: bool,
    unbound_received: bool,

    client_file_ident: FileIdent,

    /// Upload scan cursor: every local version up to here has been
    /// selected for upload during this incarnation.
    upload_cursor: u64,
    /// Server version integrated at the cursor, echoed in UPLOAD.
    upload_server_progress: u64,

    target_download_mark: u64,
    last_download_mark_sent: u64,
    last_download_mark_received: u64,

    download_waiters: Vec<(u64, CompletionWaiter)>,
    upload_waiters: Vec<(u64, CompletionWaiter)>,

    /// A new access token waiting to go out in a REFRESH message.
    pending_token_refresh: bool,

    last_error: Option<SessionError>,
}

impl Session {
    /// Creates an unactivated session.
    #[must_use]
    pub fn new(ident: u32, history: ClientHistory, config: SessionConfig) -> Self {
        let progress = history.progress();
        Self {
            ident,
            config,
            history,
            active_or_deactivating: false,
            deactivation_initiated: false,
            finalized: false,
            suspended: false,
            bind_sent: false,
            ident_sent: false,
            allow_upload: false,
            unbind_sent: false,
            unbind_sent_2: false,
            error_received: false,
            unbound_received: false,
            client_file_ident: FileIdent::default(),
            upload_cursor: progress.upload_client_version,
            upload_server_progress: progress.upload_server_version,
            target_download_mark: 0,
            last_download_mark_sent: 0,
            last_download_mark_received: 0,
            download_waiters: Vec::new(),
            upload_waiters: Vec::new(),
            pending_token_refresh: false,
            last_error: None,
        }
    }

    /// The session identifier on its connection.
    #[must_use]
    pub fn ident(&self) -> u32 {
        self.ident
    }

    /// The session's history bridge.
    #[must_use]
    pub fn history(&self) -> &ClientHistory {
        &self.history
    }

    /// The current lifecycle state.
    #[must_use]
    pub fn lifecycle(&self) -> SessionLifecycle {
        match (
            self.active_or_deactivating,
            self.deactivation_initiated,
            self.finalized,
        ) {
            (_, _, true) => SessionLifecycle::Deactivated,
            (false, _, _) => SessionLifecycle::Unactivated,
            (true, false, _) => SessionLifecycle::Active,
            (true, true, _) => SessionLifecycle::Deactivating,
        }
    }

    /// The orthogonal suspended flag.
    #[must_use]
    pub fn is_suspended(&self) -> bool {
        self.suspended
    }

    /// The last session-level error received.
    #[must_use]
    pub fn last_error(&self) -> Option<&SessionError> {
        self.last_error.as_ref()
    }

    /// Activates the session.
    pub fn activate(&mut self) {
        self.active_or_deactivating = true;
    }

    /// Begins deactivation. If BIND was never sent there is nothing to
    /// unwind and the session finalizes immediately.
    pub fn initiate_deactivation(&mut self) {
        if self.deactivation_initiated {
            return;
        }
        self.deactivation_initiated = true;
        if !self.bind_sent {
            self.finalize();
        }
    }

    /// Suspends the session: no messages until resumed.
    pub fn suspend(&mut self, error: SessionError) {
        warn!(session = self.ident, code = ?error.code, "session suspended");
        self.suspended = true;
        self.last_error = Some(error);
    }

    /// Clears the suspended flag.
    pub fn resume(&mut self) {
        self.suspended = false;
    }

    /// True once the unwinding handshake has fully completed and the
    /// connection may discard the session (and rebind the file).
    #[must_use]
    pub fn is_finalized(&self) -> bool {
        self.finalized
    }

    fn finalize(&mut self) {
        self.finalized = true;
        for (_, waiter) in self.download_waiters.drain(..) {
            waiter.cancel();
        }
        for (_, waiter) in self.upload_waiters.drain(..) {
            waiter.cancel();
        }
    }

    /// Called when the connection comes up (or the session is added to
    /// a live connection). Resets per-incarnation protocol state and
    /// rewinds the upload cursor to the acknowledged progress.
    pub fn connection_established(&mut self, fast_reconnect: bool) {
        let progress = self.history.progress();
        self.bind_sent = false;
        self.ident_sent = false;
        self.unbind_sent = false;
        self.unbind_sent_2 = false;
        self.error_received = false;
        self.unbound_received = false;
        self.allow_upload = self.config.disable_upload_activation_delay || fast_reconnect;
        self.upload_cursor = progress.upload_client_version;
        self.upload_server_progress = progress.upload_server_version;
        self.last_download_mark_sent = 0;
        self.client_file_ident = self.history.file_ident();
    }

    /// Called when the connection is lost.
    pub fn connection_lost(&mut self) {
        self.bind_sent = false;
        self.ident_sent = false;
        self.allow_upload = false;
        self.unbind_sent = false;
        self.unbind_sent_2 = false;
        if self.deactivation_initiated {
            // Nothing left to unwind without a connection.
            self.finalize();
        }
    }

    fn upload_target_version(&self) -> u64 {
        self.history.last_local_version()
    }

    fn has_upload_work(&self) -> bool {
        self.allow_upload && self.ident_sent && self.upload_cursor < self.upload_target_version()
    }

    fn has_mark_work(&self) -> bool {
        self.ident_sent && self.last_download_mark_sent < self.target_download_mark
    }

    /// Supplies a fresh access token, to be sent in a REFRESH message.
    /// Also resumes a session suspended by a token-expiry error.
    pub fn refresh_access_token(&mut self, token: impl Into<String>) {
        self.config.access_token = token.into();
        self.pending_token_refresh = true;
        if self
            .last_error
            .as_ref()
            .is_some_and(|error| error.code == ErrorCode::TokenExpired)
        {
            self.resume();
        }
    }

    /// True if the session would produce a message given a write slot.
    #[must_use]
    pub fn has_work(&self) -> bool {
        if self.finalized || self.suspended || !self.active_or_deactivating || self.unbind_sent {
            return false;
        }
        if !self.bind_sent {
            return true;
        }
        if self.deactivation_initiated {
            return true;
        }
        if !self.ident_sent {
            // Waiting for the server to assign an identity.
            return self.client_file_ident.ident != 0;
        }
        self.pending_token_refresh || self.has_mark_work() || self.has_upload_work()
    }

    /// Produces the next message for a write slot, updating protocol
    /// flags. Returns `None` when there is nothing to send.
    ///
    /// Once UNBIND has been produced no further message ever is.
    pub fn next_message(&mut self) -> Option<ClientMessage> {
        if self.finalized || self.suspended || !self.active_or_deactivating || self.unbind_sent {
            return None;
        }

        if !self.bind_sent {
            self.bind_sent = true;
            return Some(ClientMessage::Bind {
                session: self.ident,
                path: self.config.path.clone(),
                need_file_ident: self.client_file_ident.ident == 0,
                access_token: self.config.access_token.clone(),
            });
        }

        if self.deactivation_initiated {
            self.unbind_sent = true;
            self.unbind_sent_2 = true;
            if self.error_received || self.unbound_received {
                self.finalize();
            }
            return Some(ClientMessage::Unbind {
                session: self.ident,
            });
        }

        if !self.ident_sent {
            if self.client_file_ident.ident == 0 {
                return None;
            }
            self.ident_sent = true;
            let progress = self.history.progress();
            return Some(ClientMessage::Ident {
                session: self.ident,
                client_file_ident: self.client_file_ident.ident,
                client_file_ident_salt: self.client_file_ident.salt,
                download_server_version: progress.download_server_version,
                download_client_version: progress.download_client_version,
                latest_server_version: progress.latest_server_version,
                latest_server_salt: progress.latest_server_salt,
            });
        }

        if self.pending_token_refresh {
            self.pending_token_refresh = false;
            return Some(ClientMessage::Refresh {
                session: self.ident,
                access_token: self.config.access_token.clone(),
            });
        }

        if self.has_mark_work() {
            self.last_download_mark_sent = self.target_download_mark;
            return Some(ClientMessage::Mark {
                session: self.ident,
                request_ident: self.last_download_mark_sent,
            });
        }

        if self.has_upload_work() && !self.config.dry_run {
            let target = self.upload_target_version();
            let entries = self.history.uploadable_entries(
                self.upload_cursor,
                target,
                !self.config.disable_upload_compaction,
            );
            let batch: Vec<_> = entries.into_iter().take(UPLOAD_BATCH_LIMIT).collect();
            // A full batch leaves a tail to scan; otherwise the cursor
            // covers the whole range, skipped entries included.
            let covered_to = if batch.len() == UPLOAD_BATCH_LIMIT {
                batch.last().expect("full batch").version.number()
            } else {
                target
            };
            let progress_client_version = self.upload_cursor;
            self.upload_cursor = covered_to;
            let changesets = ClientHistory::to_upload_changesets(&batch);
            debug!(
                session = self.ident,
                from = progress_client_version,
                to = covered_to,
                count = changesets.len(),
                "upload batch"
            );
            return Some(ClientMessage::Upload {
                session: self.ident,
                progress_client_version,
                progress_server_version: self.upload_server_progress,
                locked_server_version: self.history.progress().download_server_version,
                changesets,
            });
        }

        None
    }

    /// Handles a server IDENT: persists the assigned identity.
    ///
    /// # Errors
    ///
    /// Fails on history I/O errors.
    pub fn receive_ident(&mut self, ident: FileIdent) -> crate::error::SyncResult<()> {
        self.history.set_file_ident(ident)?;
        self.client_file_ident = ident;
        Ok(())
    }

    /// Handles a DOWNLOAD: integrates the batch and advances both
    /// progress axes.
    ///
    /// # Errors
    ///
    /// Surfaces integration failures; the connection must terminate
    /// with a bad-changeset error.
    pub fn receive_download(
        &mut self,
        progress: DownloadProgress,
        changesets: &[RemoteChangeset],
    ) -> crate::error::SyncResult<()> {
        let current = self.history.progress();
        let merged = SyncProgress {
            download_server_version: progress
                .server_version
                .max(current.download_server_version),
            download_client_version: progress
                .last_integrated_client_version
                .max(current.download_client_version),
            upload_client_version: progress
                .upload_client_version
                .max(current.upload_client_version),
            upload_server_version: progress
                .upload_server_version
                .max(current.upload_server_version),
            latest_server_version: progress
                .latest_server_version
                .max(current.latest_server_version),
            latest_server_salt: progress.latest_server_salt,
        };

        if self.config.dry_run {
            self.history.set_progress(merged)?;
        } else {
            self.history.integrate_changesets(changesets, merged)?;
        }
        self.upload_server_progress = merged.download_server_version;

        // Upload acknowledgements unblock upload completion waiters.
        let acked = merged.upload_client_version;
        self.upload_waiters.retain(|(target, waiter)| {
            if *target <= acked {
                waiter.complete();
                false
            } else {
                true
            }
        });

        // The first download completion activates uploads.
        if progress.downloadable_bytes == 0 {
            self.allow_upload = true;
        }
        Ok(())
    }

    /// Handles a MARK response.
    pub fn receive_mark(&mut self, request_ident: u64) {
        self.last_download_mark_received = self.last_download_mark_received.max(request_ident);
        let received = self.last_download_mark_received;
        self.download_waiters.retain(|(serial, waiter)| {
            if *serial <= received {
                waiter.complete();
                false
            } else {
                true
            }
        });
    }

    /// Handles a session-level ERROR message.
    pub fn receive_error(&mut self, code: ErrorCode, message: String, try_again: bool) {
        self.error_received = true;
        let error = SessionError {
            code,
            is_fatal: !try_again,
            detailed_message: message,
        };
        self.suspend(error);
        if self.unbind_sent_2 {
            self.finalize();
        }
    }

    /// Handles an UNBOUND confirmation.
    pub fn receive_unbound(&mut self) {
        self.unbound_received = true;
        if self.unbind_sent_2 {
            self.finalize();
        }
    }

    /// Registers a download-completion waiter. The waiter fires when a
    /// MARK response for a serial issued now (or later) arrives.
    pub fn request_download_completion(&mut self) -> CompletionWaiter {
        self.target_download_mark += 1;
        let waiter = CompletionWaiter::new();
        self.download_waiters
            .push((self.target_download_mark, waiter.clone()));
        waiter
    }

    /// Registers an upload-completion waiter for every local-origin
    /// change committed so far. Resolves immediately if the server
    /// already acknowledged them (integration commits need no
    /// acknowledgement).
    pub fn request_upload_completion(&mut self) -> CompletionWaiter {
        let target = self.history.last_uploadable_version();
        let waiter = CompletionWaiter::new();
        if self.history.progress().upload_client_version >= target {
            waiter.complete();
        } else {
            self.upload_waiters.push((target, waiter.clone()));
        }
        waiter
    }
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("ident", &self.ident)
            .field("lifecycle", &self.lifecycle())
            .field("suspended", &self.suspended)
            .field("bind_sent", &self.bind_sent)
            .field("ident_sent", &self.ident_sent)
            .field("allow_upload", &self.allow_upload)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use terndb_core::{ColumnSpec, Db, TableType, Value};

    fn test_config() -> SessionConfig {
        SessionConfig {
            path: "/files/default".into(),
            access_token: "token".into(),
            disable_upload_activation_delay: true,
            disable_upload_compaction: false,
            dry_run: false,
        }
    }

    fn session_with_db() -> (Session, Db) {
        let db = Db::open_in_memory().unwrap();
        let history = ClientHistory::new(db.clone());
        let session = Session::new(1, history, test_config());
        (session, db)
    }

    fn commit_change(db: &Db) -> u64 {
        let mut txn = db.begin_write().unwrap();
        let table = txn.get_or_add_table("t", TableType::TopLevel).unwrap();
        if txn.spec(table.key()).unwrap().column_by_name("v").is_none() {
            txn.add_column(table.key(), ColumnSpec::int("v")).unwrap();
        }
        let col = txn.spec(table.key()).unwrap().column_by_name("v").unwrap();
        let obj = txn.create_object(table.key()).unwrap();
        txn.set_value(table.key(), obj.key(), col, Value::Int(3))
            .unwrap();
        txn.commit().unwrap().number()
    }

    fn establish(session: &mut Session) {
        session.activate();
        session.connection_established(false);
    }

    fn assigned_ident(session: &mut Session) {
        session
            .receive_ident(FileIdent {
                ident: 7,
                salt: 0x5a17,
            })
            .unwrap();
    }

    #[test]
    fn lifecycle_progression() {
        let (mut session, _db) = session_with_db();
        assert_eq!(session.lifecycle(), SessionLifecycle::Unactivated);
        establish(&mut session);
        assert_eq!(session.lifecycle(), SessionLifecycle::Active);

        // BIND must go out before deactivation needs an UNBIND.
        let first = session.next_message().unwrap();
        assert!(matches!(first, ClientMessage::Bind { .. }));

        session.initiate_deactivation();
        assert_eq!(session.lifecycle(), SessionLifecycle::Deactivating);
        let unbind = session.next_message().unwrap();
        assert!(matches!(unbind, ClientMessage::Unbind { .. }));

        session.receive_unbound();
        assert_eq!(session.lifecycle(), SessionLifecycle::Deactivated);
    }

    #[test]
    fn deactivation_before_bind_finalizes_immediately() {
        let (mut session, _db) = session_with_db();
        establish(&mut session);
        session.initiate_deactivation();
        assert!(session.is_finalized());
    }

    #[test]
    fn bind_requests_ident_when_unassigned() {
        let (mut session, _db) = session_with_db();
        establish(&mut session);
        let bind = session.next_message().unwrap();
        match bind {
            ClientMessage::Bind {
                need_file_ident, ..
            } => assert!(need_file_ident),
            other => panic!("expected BIND, got {other:?}"),
        }
        // No IDENT until the server assigns one.
        assert!(session.next_message().is_none());
        assigned_ident(&mut session);
        let ident = session.next_message().unwrap();
        assert!(matches!(
            ident,
            ClientMessage::Ident {
                client_file_ident: 7,
                ..
            }
        ));
    }

    #[test]
    fn upload_covers_new_commits() {
        let (mut session, db) = session_with_db();
        establish(&mut session);
        session.next_message().unwrap(); // BIND
        assigned_ident(&mut session);
        session.next_message().unwrap(); // IDENT

        commit_change(&db);
        commit_change(&db);

        let upload = session.next_message().unwrap();
        match upload {
            ClientMessage::Upload {
                progress_client_version,
                changesets,
                ..
            } => {
                assert_eq!(progress_client_version, 0);
                assert_eq!(changesets.len(), 2);
                assert_eq!(changesets[0].client_version, 1);
                assert_eq!(changesets[1].client_version, 2);
            }
            other => panic!("expected UPLOAD, got {other:?}"),
        }
        // Each entry is selected at most once per incarnation.
        assert!(session.next_message().is_none());
    }

    #[test]
    fn upload_resumes_from_acknowledged_progress() {
        let (mut session, db) = session_with_db();
        for _ in 0..6 {
            commit_change(&db);
        }
        establish(&mut session);
        session.next_message().unwrap(); // BIND
        assigned_ident(&mut session);
        session.next_message().unwrap(); // IDENT
        session.next_message().unwrap(); // UPLOAD 1..=6

        // The server acknowledges through version 4 in a DOWNLOAD echo,
        // then the connection drops.
        session
            .receive_download(
                DownloadProgress {
                    server_version: 10,
                    last_integrated_client_version: 4,
                    latest_server_version: 10,
                    latest_server_salt: 1,
                    upload_client_version: 4,
                    upload_server_version: 10,
                    downloadable_bytes: 0,
                },
                &[],
            )
            .unwrap();
        session.connection_lost();
        session.connection_established(false);

        session.next_message().unwrap(); // BIND
        session.next_message().unwrap(); // IDENT (identity persisted)
        let upload = session.next_message().unwrap();
        match upload {
            ClientMessage::Upload {
                progress_client_version,
                changesets,
                ..
            } => {
                assert_eq!(progress_client_version, 4);
                assert_eq!(changesets[0].client_version, 5);
                assert_eq!(changesets.len(), 2);
            }
            other => panic!("expected UPLOAD, got {other:?}"),
        }
    }

    #[test]
    fn upload_waits_for_download_completion_by_default() {
        let db = Db::open_in_memory().unwrap();
        let history = ClientHistory::new(db.clone());
        let mut config = test_config();
        config.disable_upload_activation_delay = false;
        let mut session = Session::new(1, history, config);
        commit_change(&db);

        session.activate();
        session.connection_established(false);
        session.next_message().unwrap(); // BIND
        assigned_ident(&mut session);
        session.next_message().unwrap(); // IDENT

        // Not allowed to upload yet.
        assert!(session.next_message().is_none());

        // Download completion arrives; uploads unlock.
        session
            .receive_download(
                DownloadProgress {
                    server_version: 3,
                    downloadable_bytes: 0,
                    ..DownloadProgress::default()
                },
                &[],
            )
            .unwrap();
        assert!(matches!(
            session.next_message(),
            Some(ClientMessage::Upload { .. })
        ));
    }

    #[test]
    fn mark_flow_fires_download_waiter() {
        let (mut session, _db) = session_with_db();
        establish(&mut session);
        session.next_message().unwrap(); // BIND
        assigned_ident(&mut session);
        session.next_message().unwrap(); // IDENT

        let waiter = session.request_download_completion();
        let mark = session.next_message().unwrap();
        let serial = match mark {
            ClientMessage::Mark { request_ident, .. } => request_ident,
            other => panic!("expected MARK, got {other:?}"),
        };
        assert!(!waiter.is_resolved());

        // A stale MARK response does not fire the waiter.
        session.receive_mark(serial - 1);
        assert!(!waiter.is_resolved());

        session.receive_mark(serial);
        assert!(waiter.is_resolved());
        waiter.wait(std::time::Duration::from_millis(10)).unwrap();
    }

    #[test]
    fn mark_waiter_fires_exactly_once() {
        let (mut session, _db) = session_with_db();
        establish(&mut session);
        session.next_message().unwrap();
        assigned_ident(&mut session);
        session.next_message().unwrap();

        let waiter = session.request_download_completion();
        let serial = match session.next_message().unwrap() {
            ClientMessage::Mark { request_ident, .. } => request_ident,
            other => panic!("expected MARK, got {other:?}"),
        };
        session.receive_mark(serial);
        session.receive_mark(serial);
        assert!(waiter.wait(std::time::Duration::from_millis(10)).is_ok());
        assert!(session.download_waiters.is_empty());
    }

    #[test]
    fn error_suspends_session() {
        let (mut session, _db) = session_with_db();
        establish(&mut session);
        session.next_message().unwrap();
        session.receive_error(ErrorCode::PermissionDenied, "denied".into(), false);
        assert!(session.is_suspended());
        assert!(session.next_message().is_none());
        assert!(session.last_error().unwrap().is_fatal);
    }

    #[test]
    fn no_message_after_unbind() {
        let (mut session, db) = session_with_db();
        establish(&mut session);
        session.next_message().unwrap(); // BIND
        assigned_ident(&mut session);
        session.next_message().unwrap(); // IDENT
        session.initiate_deactivation();
        let unbind = session.next_message().unwrap();
        assert!(matches!(unbind, ClientMessage::Unbind { .. }));

        commit_change(&db);
        assert!(session.next_message().is_none());
        assert!(!session.has_work());
    }

    #[test]
    fn deactivation_cancels_waiters() {
        let (mut session, _db) = session_with_db();
        establish(&mut session);
        session.next_message().unwrap(); // BIND
        let waiter = session.request_download_completion();
        session.initiate_deactivation();
        session.next_message().unwrap(); // UNBIND
        session.receive_unbound();
        assert!(matches!(
            waiter.wait(std::time::Duration::from_millis(10)),
            Err(crate::error::SyncError::Cancelled)
        ));
    }

    #[test]
    fn upload_completion_waiter() {
        let (mut session, db) = session_with_db();
        establish(&mut session);
        session.next_message().unwrap();
        assigned_ident(&mut session);
        session.next_message().unwrap();

        commit_change(&db);
        let waiter = session.request_upload_completion();
        assert!(!waiter.is_resolved());
        session.next_message().unwrap(); // UPLOAD

        session
            .receive_download(
                DownloadProgress {
                    server_version: 1,
                    upload_client_version: 1,
                    downloadable_bytes: 0,
                    ..DownloadProgress::default()
                },
                &[],
            )
            .unwrap();
        assert!(waiter.is_resolved());
    }

    #[test]
    fn progress_axes_never_regress() {
        let (mut session, _db) = session_with_db();
        establish(&mut session);
        session
            .receive_download(
                DownloadProgress {
                    server_version: 10,
                    last_integrated_client_version: 2,
                    downloadable_bytes: 0,
                    ..DownloadProgress::default()
                },
                &[],
            )
            .unwrap();
        // A stale echo must not roll anything back.
        session
            .receive_download(
                DownloadProgress {
                    server_version: 8,
                    last_integrated_client_version: 1,
                    downloadable_bytes: 0,
                    ..DownloadProgress::default()
                },
                &[],
            )
            .unwrap();
        let progress = session.history().progress();
        assert_eq!(progress.download_server_version, 10);
        assert_eq!(progress.download_client_version, 2);
    }
}
