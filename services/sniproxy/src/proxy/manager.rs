//! Session manager: the routing state machine.
//!
//! The manager owns one [`ConnectionSession`] per accepted connection,
//! indexed by [`ConnectionId`]. The reactor feeds it typed
//! [`SessionEvent`]s and executes the [`Command`]s it returns; the manager
//! itself performs no I/O, which keeps every transition testable without a
//! network.
//!
//! ```text
//!  ClientData ──► Buffering ──(record complete, SNI, route)──► Dial
//!                     │                                          │
//!                     │                            BackendConnected
//!                     │                                          ▼
//!                     │              SendToBackend(buffer), BeginForwarding
//!                     ▼                                          │
//!                  Closed ◄───────── close / error ───────── Forwarding
//! ```
//!
//! The tokio listener hands both sockets to its byte pump on
//! `BeginForwarding` and reports only the end of the copy, as
//! `ForwardingFinished`. The `ClientData` and `BackendData` arms for
//! forwarding sessions serve reactors that relay every chunk through the
//! manager instead.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::Ordering;
use std::sync::Arc;

use bytes::Bytes;
use sniproxy_tls::{extract_sni, Extraction, RecordHeader, MAX_PLAINTEXT_RECORD_LEN, RECORD_HEADER_LEN};
use tracing::{debug, error, info, warn};

use super::router::{normalize_hostname, RoutingTable};
use super::session::{ConnectionId, ConnectionSession, Phase};
use super::stats::ListenerStats;
use super::target::BackendTarget;
use crate::error::CloseReason;

/// Default inspection buffer ceiling: one maximum-size plaintext record.
pub const DEFAULT_MAX_BUFFER_BYTES: usize = RECORD_HEADER_LEN + MAX_PLAINTEXT_RECORD_LEN;

/// Per-session policy.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Maximum bytes buffered before the handoff.
    pub max_buffer_bytes: usize,
    /// Lowercase and strip the trailing dot before routing.
    pub normalize_hostnames: bool,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            max_buffer_bytes: DEFAULT_MAX_BUFFER_BYTES,
            normalize_hostnames: false,
        }
    }
}

/// Something that happened on a connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionEvent {
    /// Bytes received from the client.
    ClientData(Bytes),
    /// The client closed its side.
    ClientClosed,
    /// The client socket failed.
    ClientError(String),
    /// The dialed backend accepted the connection.
    BackendConnected,
    /// Bytes received from the backend.
    BackendData(Bytes),
    /// The backend could not be reached, or failed later.
    BackendError(String),
    /// The backend closed its side.
    BackendClosed,
    /// The handshake deadline passed.
    HandshakeTimeout,
    /// The byte pump finished copying.
    ForwardingFinished {
        to_backend: u64,
        from_backend: u64,
        error: Option<String>,
    },
}

/// Something the reactor must do for a connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    /// Open the backend connection.
    Dial(BackendTarget),
    /// Write bytes to the backend.
    SendToBackend(Bytes),
    /// Write bytes to the client.
    SendToClient(Bytes),
    /// Hand both connections to the byte pump.
    BeginForwarding,
    CloseClient,
    CloseBackend,
}

/// Which side is already gone when a session closes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Gone {
    Client,
    Backend,
    Both,
    Neither,
}

/// Result of looking at the buffered bytes.
enum Inspection {
    Wait,
    Reject(CloseReason),
    Route(BackendTarget),
}

/// Owns all sessions of a listener and drives their state machines.
pub struct SessionManager {
    sessions: HashMap<ConnectionId, ConnectionSession>,
    routes: Arc<RoutingTable>,
    config: SessionConfig,
    stats: Arc<ListenerStats>,
}

impl SessionManager {
    pub fn new(
        routes: Arc<RoutingTable>,
        config: SessionConfig,
        stats: Arc<ListenerStats>,
    ) -> Self {
        Self {
            sessions: HashMap::new(),
            routes,
            config,
            stats,
        }
    }

    /// Register a newly accepted connection.
    pub fn accept(&mut self, id: ConnectionId, peer: SocketAddr) {
        debug!(conn = %id, peer = %peer, "New connection");
        self.sessions.insert(id, ConnectionSession::new(peer));
    }

    /// Current phase of a session, `None` once it has been released.
    pub fn phase(&self, id: ConnectionId) -> Option<Phase> {
        self.sessions.get(&id).map(ConnectionSession::phase)
    }

    pub fn session(&self, id: ConnectionId) -> Option<&ConnectionSession> {
        self.sessions.get(&id)
    }

    /// Number of live sessions.
    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    /// Close every live session. Returns the commands per connection.
    pub fn close_all(&mut self) -> Vec<(ConnectionId, Vec<Command>)> {
        let ids: Vec<ConnectionId> = self.sessions.keys().copied().collect();
        ids.into_iter()
            .map(|id| (id, self.close(id, CloseReason::Shutdown, Gone::Neither)))
            .collect()
    }

    /// Apply an event to a session and return the commands to execute, in
    /// order. Events for unknown or released sessions are ignored.
    pub fn handle(&mut self, id: ConnectionId, event: SessionEvent) -> Vec<Command> {
        match event {
            SessionEvent::ClientData(chunk) => self.on_client_data(id, chunk),
            SessionEvent::ClientClosed => self.close(id, CloseReason::PeerClosed, Gone::Client),
            SessionEvent::ClientError(message) => {
                self.close(id, CloseReason::ClientFailure(message), Gone::Client)
            }
            SessionEvent::BackendConnected => self.on_backend_connected(id),
            SessionEvent::BackendData(chunk) => match self.phase(id) {
                Some(Phase::Forwarding) => vec![Command::SendToClient(chunk)],
                _ => Vec::new(),
            },
            SessionEvent::BackendError(message) => self.on_backend_error(id, message),
            SessionEvent::BackendClosed => self.close(id, CloseReason::PeerClosed, Gone::Backend),
            SessionEvent::HandshakeTimeout => match self.phase(id) {
                Some(Phase::Buffering) => {
                    ListenerStats::incr(&self.stats.sni_failed);
                    self.close(id, CloseReason::HandshakeTimeout, Gone::Neither)
                }
                _ => Vec::new(),
            },
            SessionEvent::ForwardingFinished {
                to_backend,
                from_backend,
                error,
            } => {
                self.stats
                    .bytes_to_backend
                    .fetch_add(to_backend, Ordering::Relaxed);
                self.stats
                    .bytes_from_backend
                    .fetch_add(from_backend, Ordering::Relaxed);
                debug!(
                    conn = %id,
                    bytes_to_backend = to_backend,
                    bytes_from_backend = from_backend,
                    "Forwarding finished"
                );
                let reason = match error {
                    Some(message) => CloseReason::ForwardingFailed(message),
                    None => CloseReason::PeerClosed,
                };
                self.close(id, reason, Gone::Both)
            }
        }
    }

    fn on_client_data(&mut self, id: ConnectionId, chunk: Bytes) -> Vec<Command> {
        let limit = self.config.max_buffer_bytes;
        let over_limit = {
            let Some(session) = self.sessions.get_mut(&id) else {
                return Vec::new();
            };
            match session.phase() {
                Phase::Forwarding => return vec![Command::SendToBackend(chunk)],
                Phase::Closed => return Vec::new(),
                Phase::Buffering => {}
            }

            let needed = session.buffered_len() + chunk.len();
            if needed > limit {
                Some(needed)
            } else {
                session.append(&chunk);
                if session.is_dialing() {
                    debug!(conn = %id, buffered = needed, "Buffered bytes while dialing backend");
                    return Vec::new();
                }
                None
            }
        };

        if let Some(needed) = over_limit {
            ListenerStats::incr(&self.stats.sni_failed);
            return self.close(
                id,
                CloseReason::BufferLimitExceeded { needed, limit },
                Gone::Neither,
            );
        }

        let inspection = match self.sessions.get(&id) {
            Some(session) => self.inspect(id, session),
            None => return Vec::new(),
        };

        match inspection {
            Inspection::Wait => Vec::new(),
            Inspection::Reject(reason) => self.close(id, reason, Gone::Neither),
            Inspection::Route(target) => {
                let paired = self
                    .sessions
                    .get_mut(&id)
                    .is_some_and(|session| session.pair(target.clone()));
                if !paired {
                    return Vec::new();
                }
                debug!(conn = %id, backend = %target, "Dialing backend");
                vec![Command::Dial(target)]
            }
        }
    }

    /// Decide what the buffered bytes of a session allow.
    fn inspect(&self, id: ConnectionId, session: &ConnectionSession) -> Inspection {
        let buffer = session.buffer();
        let Some(header) = RecordHeader::parse(buffer) else {
            debug!(conn = %id, buffered = buffer.len(), "Waiting for TLS record header");
            return Inspection::Wait;
        };

        if header.is_handshake() {
            let record_len = header.record_len();
            if record_len > self.config.max_buffer_bytes {
                ListenerStats::incr(&self.stats.sni_failed);
                return Inspection::Reject(CloseReason::BufferLimitExceeded {
                    needed: record_len,
                    limit: self.config.max_buffer_bytes,
                });
            }
            if buffer.len() < record_len {
                debug!(
                    conn = %id,
                    needed = record_len,
                    buffered = buffer.len(),
                    "Incomplete TLS record"
                );
                return Inspection::Wait;
            }
        }

        let hostname = match extract_sni(buffer) {
            Extraction::Found(hostname) => hostname,
            Extraction::NeedMoreData => {
                ListenerStats::incr(&self.stats.sni_failed);
                return Inspection::Reject(CloseReason::MalformedHandshake(
                    "ClientHello truncated within its record",
                ));
            }
            Extraction::NoSni if !header.is_handshake() => {
                ListenerStats::incr(&self.stats.sni_failed);
                return Inspection::Reject(CloseReason::MalformedHandshake(
                    "not a TLS handshake record",
                ));
            }
            Extraction::NoSni => {
                ListenerStats::incr(&self.stats.sni_failed);
                return Inspection::Reject(CloseReason::NoServerName);
            }
        };

        ListenerStats::incr(&self.stats.sni_found);
        info!(conn = %id, peer = %session.peer(), hostname = %hostname, "SNI hostname extracted");

        let hostname = if self.config.normalize_hostnames {
            normalize_hostname(&hostname)
        } else {
            hostname
        };

        match self.routes.resolve(&hostname) {
            Some(target) => {
                ListenerStats::incr(&self.stats.routes_matched);
                Inspection::Route(target)
            }
            None => {
                ListenerStats::incr(&self.stats.routes_rejected);
                Inspection::Reject(CloseReason::HostNotAllowed(hostname))
            }
        }
    }

    fn on_backend_connected(&mut self, id: ConnectionId) -> Vec<Command> {
        let Some(session) = self.sessions.get_mut(&id) else {
            // The client left while the dial was in flight.
            return vec![Command::CloseBackend];
        };
        let peer = session.peer();
        let backend = session.backend().map(ToString::to_string).unwrap_or_default();
        let Some(buffered) = session.begin_forwarding() else {
            return Vec::new();
        };

        ListenerStats::incr(&self.stats.backend_connected);
        info!(
            conn = %id,
            peer = %peer,
            backend = %backend,
            flushed = buffered.len(),
            "Backend connection established"
        );

        let mut commands = Vec::with_capacity(2);
        if !buffered.is_empty() {
            commands.push(Command::SendToBackend(buffered));
        }
        commands.push(Command::BeginForwarding);
        commands
    }

    fn on_backend_error(&mut self, id: ConnectionId, message: String) -> Vec<Command> {
        let Some(session) = self.sessions.get(&id) else {
            return Vec::new();
        };
        let target = session.backend().map(ToString::to_string).unwrap_or_default();
        let reason = match session.phase() {
            Phase::Forwarding => CloseReason::BackendFailure { target, message },
            _ => {
                ListenerStats::incr(&self.stats.backend_failed);
                CloseReason::BackendDialFailure { target, message }
            }
        };
        self.close(id, reason, Gone::Backend)
    }

    /// Release a session and close whatever side is still open, within the
    /// same call.
    fn close(&mut self, id: ConnectionId, reason: CloseReason, gone: Gone) -> Vec<Command> {
        let Some(mut session) = self.sessions.remove(&id) else {
            return Vec::new();
        };
        let phase = session.phase();
        let peer = session.peer();
        let age_ms = session.age().as_millis() as u64;
        let backend = session.close();
        let backend_name = backend.as_ref().map(ToString::to_string).unwrap_or_default();

        match &reason {
            CloseReason::PeerClosed => info!(
                conn = %id,
                peer = %peer,
                backend = %backend_name,
                age_ms,
                "Connection closed"
            ),
            CloseReason::BackendDialFailure { .. }
            | CloseReason::BackendFailure { .. }
            | CloseReason::ForwardingFailed(_) => error!(
                conn = %id,
                peer = %peer,
                reason = reason.reason_code(),
                error = %reason,
                "Backend connection error"
            ),
            CloseReason::ClientFailure(_) => warn!(
                conn = %id,
                peer = %peer,
                reason = reason.reason_code(),
                error = %reason,
                "Client connection error"
            ),
            CloseReason::Shutdown => info!(
                conn = %id,
                peer = %peer,
                ?phase,
                "Connection closed by shutdown"
            ),
            _ if reason.is_rejection() => warn!(
                conn = %id,
                peer = %peer,
                reason = reason.reason_code(),
                error = %reason,
                "Connection rejected"
            ),
            _ => warn!(
                conn = %id,
                peer = %peer,
                ?phase,
                reason = reason.reason_code(),
                error = %reason,
                "Closing connection"
            ),
        }

        let mut commands = Vec::with_capacity(2);
        if !matches!(gone, Gone::Client | Gone::Both) {
            commands.push(Command::CloseClient);
        }
        if backend.is_some() && !matches!(gone, Gone::Backend | Gone::Both) {
            commands.push(Command::CloseBackend);
        }
        commands
    }
}
