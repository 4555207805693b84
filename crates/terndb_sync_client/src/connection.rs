//! The per-endpoint connection.
//!
//! A connection owns one transport and multiplexes any number of
//! sessions over it. Sessions enlist to send; the write loop grants one
//! message per slot in FIFO order and a session with more work
//! re-enlists at the tail, so no session starves the others.
//!
//! Reconnect policy: voluntary terminations reconnect immediately;
//! involuntary ones back off exponentially up to five minutes, and a
//! server-reported fatal condition pushes the delay to an hour.

use crate::config::{ClientConfig, ReconnectMode};
use crate::error::{ConnectionState, SessionError, SyncError, TerminationReason};
use crate::session::Session;
use crate::transport::{Transport, TransportFactory};
use rand::Rng;
use std::collections::{HashMap, HashSet, VecDeque};
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};
use terndb_sync_protocol::{ClientMessage, ErrorCode, MessageParser, ServerMessage};
use tracing::{debug, warn};

/// Ceiling for the ordinary reconnect backoff.
const MAX_BACKOFF: Duration = Duration::from_secs(300);

/// Delay applied after a server-reported fatal condition.
const FATAL_BACKOFF: Duration = Duration::from_secs(3600);

/// First delay of the exponential schedule.
const INITIAL_BACKOFF: Duration = Duration::from_secs(1);

/// Reconnect state for one endpoint.
#[derive(Debug, Clone)]
pub struct ReconnectInfo {
    /// Why the last termination happened.
    pub reason: Option<TerminationReason>,
    /// When it happened.
    pub time_point: Instant,
    /// Delay before the next attempt.
    pub delay: Duration,
    /// Reset the schedule on the next update.
    pub scheduled_reset: bool,
}

impl ReconnectInfo {
    fn new() -> Self {
        Self {
            reason: None,
            time_point: Instant::now(),
            delay: Duration::ZERO,
            scheduled_reset: false,
        }
    }

    fn update(&mut self, reason: TerminationReason, mode: ReconnectMode) {
        self.time_point = Instant::now();
        self.delay = match (mode, reason) {
            (ReconnectMode::Testing, _) => Duration::ZERO,
            (_, TerminationReason::Voluntary) => Duration::ZERO,
            (_, TerminationReason::ServerFatal) => FATAL_BACKOFF,
            _ => {
                if self.scheduled_reset
                    || self.reason.map_or(true, TerminationReason::is_voluntary)
                {
                    INITIAL_BACKOFF
                } else {
                    (self.delay * 2).clamp(INITIAL_BACKOFF, MAX_BACKOFF)
                }
            }
        };
        self.reason = Some(reason);
        self.scheduled_reset = false;
    }

    /// The earliest instant a reconnect may be attempted.
    #[must_use]
    pub fn next_attempt_at(&self) -> Instant {
        self.time_point + self.delay
    }
}

fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

/// A multiplexing connection to one server endpoint.
pub struct Connection {
    config: ClientConfig,
    factory: Box<dyn TransportFactory>,
    transport: Option<Box<dyn Transport>>,
    state: ConnectionState,
    parser: MessageParser,
    sessions: HashMap<u32, Session>,
    /// FIFO of sessions enlisted to send. The set makes "at most once
    /// in the queue" structural.
    enlisted: VecDeque<u32>,
    enlisted_set: HashSet<u32>,
    reconnect: ReconnectInfo,
    next_ping_at: Instant,
    pong_deadline: Option<Instant>,
    last_ping_timestamp: u64,
    round_trip: Option<Duration>,
    last_disconnect_at: Option<Instant>,
    linger_deadline: Option<Instant>,
}

impl Connection {
    /// Creates a disconnected connection.
    #[must_use]
    pub fn new(config: ClientConfig, factory: Box<dyn TransportFactory>) -> Self {
        Self {
            next_ping_at: Instant::now() + config.ping_keepalive_period,
            config,
            factory,
            transport: None,
            state: ConnectionState::Disconnected,
            parser: MessageParser::new(),
            sessions: HashMap::new(),
            enlisted: VecDeque::new(),
            enlisted_set: HashSet::new(),
            reconnect: ReconnectInfo::new(),
            pong_deadline: None,
            last_ping_timestamp: 0,
            round_trip: None,
            last_disconnect_at: None,
            linger_deadline: None,
        }
    }

    /// The connection state.
    #[must_use]
    pub fn state(&self) -> ConnectionState {
        self.state
    }

    /// The reconnect bookkeeping.
    #[must_use]
    pub fn reconnect_info(&self) -> &ReconnectInfo {
        &self.reconnect
    }

    /// Last measured heartbeat round-trip time.
    #[must_use]
    pub fn round_trip_time(&self) -> Option<Duration> {
        self.round_trip
    }

    /// Number of attached sessions.
    #[must_use]
    pub fn session_count(&self) -> usize {
        self.sessions.len()
    }

    /// A session by identifier.
    #[must_use]
    pub fn session(&self, ident: u32) -> Option<&Session> {
        self.sessions.get(&ident)
    }

    /// Mutable access to a session.
    pub fn session_mut(&mut self, ident: u32) -> Option<&mut Session> {
        self.sessions.get_mut(&ident)
    }

    /// Attaches and activates a session.
    pub fn add_session(&mut self, mut session: Session) {
        session.activate();
        self.linger_deadline = None;
        if self.state == ConnectionState::Connected {
            session.connection_established(self.in_fast_reconnect_window());
        }
        let ident = session.ident();
        self.sessions.insert(ident, session);
        self.enlist_if_work(ident);
    }

    /// Begins deactivating a session.
    pub fn initiate_session_deactivation(&mut self, ident: u32) {
        if let Some(session) = self.sessions.get_mut(&ident) {
            session.initiate_deactivation();
            if session.is_finalized() {
                self.discard_session(ident);
            } else {
                self.enlist_if_work(ident);
            }
        }
    }

    fn discard_session(&mut self, ident: u32) {
        self.sessions.remove(&ident);
        self.enlisted_set.remove(&ident);
        self.enlisted.retain(|&queued| queued != ident);
    }

    fn enlist_if_work(&mut self, ident: u32) {
        let Some(session) = self.sessions.get(&ident) else {
            return;
        };
        if session.has_work() && self.enlisted_set.insert(ident) {
            self.enlisted.push_back(ident);
        }
    }

    fn in_fast_reconnect_window(&self) -> bool {
        self.last_disconnect_at
            .is_some_and(|at| at.elapsed() < self.config.fast_reconnect_limit)
    }

    /// Drives the connection: connects when due, grants write slots,
    /// reads and dispatches messages, and services timers. `idle` caps
    /// the time spent blocked on the transport.
    pub fn pump(&mut self, idle: Duration) {
        match self.state {
            ConnectionState::Disconnected => self.maybe_connect(),
            ConnectionState::Connecting => {}
            ConnectionState::Connected => {
                self.write_slots();
                self.read_incoming(idle);
                if self.state == ConnectionState::Connected {
                    self.service_timers();
                }
            }
        }
    }

    fn maybe_connect(&mut self) {
        if self.sessions.is_empty() {
            return;
        }
        if Instant::now() < self.reconnect.next_attempt_at() {
            return;
        }
        self.state = ConnectionState::Connecting;
        let mut transport = self.factory.create();
        match transport.connect(self.config.connect_timeout) {
            Ok(()) => {
                debug!("connection established");
                self.state = ConnectionState::Connected;
                self.transport = Some(transport);
                self.parser = MessageParser::new();
                self.pong_deadline = None;
                self.next_ping_at = Instant::now() + self.ping_period_with_jitter();
                let fast = self.in_fast_reconnect_window();
                let idents: Vec<u32> = self.sessions.keys().copied().collect();
                for ident in idents {
                    if let Some(session) = self.sessions.get_mut(&ident) {
                        session.resume();
                        session.connection_established(fast);
                    }
                    self.enlist_if_work(ident);
                }
            }
            Err(err) => {
                warn!(error = %err, "connect failed");
                self.state = ConnectionState::Disconnected;
                self.reconnect
                    .update(TerminationReason::ConnectTimeout, self.config.reconnect_mode);
            }
        }
    }

    fn ping_period_with_jitter(&self) -> Duration {
        let period = self.config.ping_keepalive_period;
        let jitter = period / 4;
        if jitter.is_zero() {
            return period;
        }
        period + Duration::from_millis(rand::thread_rng().gen_range(0..=jitter.as_millis() as u64))
    }

    /// Grants one write slot to each currently enlisted session, in
    /// FIFO order. A session with more work re-enlists at the tail.
    fn write_slots(&mut self) {
        let slots = self.enlisted.len();
        for _ in 0..slots {
            let Some(ident) = self.enlisted.pop_front() else {
                break;
            };
            self.enlisted_set.remove(&ident);
            let Some(session) = self.sessions.get_mut(&ident) else {
                continue;
            };
            let Some(message) = session.next_message() else {
                continue;
            };
            if session.is_finalized() {
                // UNBIND completed against an earlier ERROR/UNBOUND.
                let bytes = message.encode().ok();
                if let (Some(bytes), Some(transport)) = (bytes, self.transport.as_mut()) {
                    let _ = transport.send(&bytes);
                }
                self.discard_session(ident);
                continue;
            }
            match message.encode() {
                Ok(bytes) => {
                    let Some(transport) = self.transport.as_mut() else {
                        return;
                    };
                    if transport.send(&bytes).is_err() {
                        self.terminate(TerminationReason::ConnectionLost);
                        return;
                    }
                }
                Err(err) => {
                    warn!(error = %err, "failed to encode message");
                    self.terminate(TerminationReason::ProtocolViolation);
                    return;
                }
            }
            self.enlist_if_work(ident);
        }
    }

    fn read_incoming(&mut self, idle: Duration) {
        let Some(transport) = self.transport.as_mut() else {
            return;
        };
        match transport.recv(idle) {
            Ok(Some(bytes)) => {
                self.parser.feed(&bytes);
                self.dispatch_messages();
            }
            Ok(None) => {}
            Err(_) => self.terminate(TerminationReason::ConnectionLost),
        }
    }

    fn dispatch_messages(&mut self) {
        loop {
            match self.parser.next_server_message() {
                Ok(Some(message)) => {
                    if let Err(reason) = self.handle_message(message) {
                        self.terminate(reason);
                        return;
                    }
                }
                Ok(None) => return,
                Err(err) => {
                    warn!(error = %err, "protocol violation");
                    self.terminate(TerminationReason::ProtocolViolation);
                    return;
                }
            }
        }
    }

    fn handle_message(&mut self, message: ServerMessage) -> Result<(), TerminationReason> {
        match message {
            ServerMessage::Ident {
                session,
                client_file_ident,
                client_file_ident_salt,
            } => {
                if let Some(state) = self.sessions.get_mut(&session) {
                    if state
                        .receive_ident(terndb_core::FileIdent {
                            ident: client_file_ident,
                            salt: client_file_ident_salt,
                        })
                        .is_err()
                    {
                        return Err(TerminationReason::ProtocolViolation);
                    }
                }
                self.enlist_if_work(session);
                Ok(())
            }
            ServerMessage::Download {
                session,
                progress,
                changesets,
            } => {
                if let Some(state) = self.sessions.get_mut(&session) {
                    match state.receive_download(progress, &changesets) {
                        Ok(()) => {}
                        Err(SyncError::BadChangeset(message)) => {
                            warn!(session, %message, "bad changeset");
                            return Err(TerminationReason::ProtocolViolation);
                        }
                        Err(err) => {
                            warn!(session, error = %err, "download integration failed");
                            return Err(TerminationReason::ProtocolViolation);
                        }
                    }
                }
                self.enlist_if_work(session);
                Ok(())
            }
            ServerMessage::Mark {
                session,
                request_ident,
            } => {
                if let Some(state) = self.sessions.get_mut(&session) {
                    state.receive_mark(request_ident);
                }
                Ok(())
            }
            ServerMessage::Error {
                session,
                code,
                message,
                try_again,
            } => {
                if session == 0 {
                    warn!(?code, %message, "connection-level error");
                    return Err(if try_again {
                        TerminationReason::ConnectionLost
                    } else {
                        TerminationReason::ServerFatal
                    });
                }
                if let Some(state) = self.sessions.get_mut(&session) {
                    state.receive_error(code, message, try_again);
                    if state.is_finalized() {
                        self.discard_session(session);
                    }
                }
                Ok(())
            }
            ServerMessage::Unbound { session } => {
                if let Some(state) = self.sessions.get_mut(&session) {
                    state.receive_unbound();
                    if state.is_finalized() {
                        self.discard_session(session);
                    }
                }
                Ok(())
            }
            ServerMessage::Pong { timestamp } => {
                if timestamp == self.last_ping_timestamp {
                    let sent_at = self.pong_deadline.map(|deadline| {
                        deadline - self.config.pong_keepalive_timeout
                    });
                    if let Some(sent_at) = sent_at {
                        self.round_trip = Some(sent_at.elapsed());
                    }
                    self.pong_deadline = None;
                }
                Ok(())
            }
        }
    }

    fn service_timers(&mut self) {
        let now = Instant::now();

        if let Some(deadline) = self.pong_deadline {
            if now >= deadline {
                self.terminate(TerminationReason::PongTimeout);
                return;
            }
        }

        if self.pong_deadline.is_none() && now >= self.next_ping_at {
            self.last_ping_timestamp = now_millis();
            let message = ClientMessage::Ping {
                timestamp: self.last_ping_timestamp,
                rtt: self.round_trip.map_or(0, |rtt| rtt.as_millis() as u64),
            };
            if let Ok(bytes) = message.encode() {
                if let Some(transport) = self.transport.as_mut() {
                    if transport.send(&bytes).is_err() {
                        self.terminate(TerminationReason::ConnectionLost);
                        return;
                    }
                }
            }
            self.pong_deadline = Some(now + self.config.pong_keepalive_timeout);
            self.next_ping_at = now + self.ping_period_with_jitter();
        }

        // An idle connection lingers briefly, then closes voluntarily.
        if self.sessions.is_empty() {
            match self.linger_deadline {
                None => {
                    self.linger_deadline = Some(now + self.config.connection_linger_time);
                }
                Some(deadline) if now >= deadline => {
                    self.terminate(TerminationReason::Voluntary);
                }
                Some(_) => {}
            }
        } else {
            self.linger_deadline = None;
        }
    }

    /// Tears down the transport and schedules the reconnect.
    pub fn terminate(&mut self, reason: TerminationReason) {
        debug!(?reason, "connection terminated");
        if let Some(mut transport) = self.transport.take() {
            transport.close();
        }
        self.state = ConnectionState::Disconnected;
        self.parser = MessageParser::new();
        self.pong_deadline = None;
        self.last_disconnect_at = Some(Instant::now());
        self.enlisted.clear();
        self.enlisted_set.clear();
        self.reconnect.update(reason, self.config.reconnect_mode);

        let suspend = !reason.is_voluntary();
        for session in self.sessions.values_mut() {
            session.connection_lost();
            if suspend {
                session.suspend(SessionError {
                    code: ErrorCode::Other,
                    is_fatal: reason == TerminationReason::ServerFatal,
                    detailed_message: format!("connection terminated: {reason:?}"),
                });
            }
        }
        self.sessions.retain(|_, session| !session.is_finalized());
    }

    /// Notifies sessions of a local commit so upload work gets
    /// scheduled.
    pub fn on_local_commit(&mut self) {
        let idents: Vec<u32> = self.sessions.keys().copied().collect();
        for ident in idents {
            self.enlist_if_work(ident);
        }
    }
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("state", &self.state)
            .field("sessions", &self.sessions.len())
            .field("enlisted", &self.enlisted.len())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_schedule() {
        let mut info = ReconnectInfo::new();

        info.update(TerminationReason::Voluntary, ReconnectMode::Normal);
        assert_eq!(info.delay, Duration::ZERO);

        info.update(TerminationReason::PongTimeout, ReconnectMode::Normal);
        assert_eq!(info.delay, INITIAL_BACKOFF);

        info.update(TerminationReason::PongTimeout, ReconnectMode::Normal);
        assert_eq!(info.delay, INITIAL_BACKOFF * 2);

        for _ in 0..20 {
            info.update(TerminationReason::ConnectionLost, ReconnectMode::Normal);
        }
        assert_eq!(info.delay, MAX_BACKOFF);

        info.update(TerminationReason::ServerFatal, ReconnectMode::Normal);
        assert_eq!(info.delay, FATAL_BACKOFF);
    }

    #[test]
    fn testing_mode_reconnects_immediately() {
        let mut info = ReconnectInfo::new();
        info.update(TerminationReason::PongTimeout, ReconnectMode::Testing);
        assert_eq!(info.delay, Duration::ZERO);
    }

    #[test]
    fn voluntary_after_backoff_resets() {
        let mut info = ReconnectInfo::new();
        info.update(TerminationReason::PongTimeout, ReconnectMode::Normal);
        info.update(TerminationReason::Voluntary, ReconnectMode::Normal);
        assert_eq!(info.delay, Duration::ZERO);
        // The next involuntary delay starts from the beginning again.
        info.update(TerminationReason::PongTimeout, ReconnectMode::Normal);
        assert_eq!(info.delay, INITIAL_BACKOFF);
    }
}
