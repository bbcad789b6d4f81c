//! Per-connection session state.
//!
//! A [`ConnectionSession`] holds everything the proxy knows about one client
//! connection: the bytes received before routing, the lifecycle phase and
//! the backend it has been paired with. It is owned by the session manager
//! and never shared between connections.

use std::fmt;
use std::net::SocketAddr;
use std::time::{Duration, Instant};

use bytes::{Bytes, BytesMut};

use super::target::BackendTarget;

/// Stable identifier of an accepted connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionId(u64);

impl ConnectionId {
    pub const fn new(raw: u64) -> Self {
        Self(raw)
    }

    pub fn get(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "conn-{}", self.0)
    }
}

/// Session lifecycle phase.
///
/// `Buffering` -> `Forwarding` happens at most once. `Closed` is reachable
/// from both and is terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    /// Collecting bytes until the ClientHello can be inspected, then waiting
    /// for the backend connection.
    Buffering,
    /// Bytes flow untouched between client and backend.
    Forwarding,
    /// Nothing more happens on this session.
    Closed,
}

/// State of one client connection.
#[derive(Debug)]
pub struct ConnectionSession {
    peer: SocketAddr,
    buffer: BytesMut,
    phase: Phase,
    backend: Option<BackendTarget>,
    accepted_at: Instant,
}

impl ConnectionSession {
    pub fn new(peer: SocketAddr) -> Self {
        Self {
            peer,
            buffer: BytesMut::new(),
            phase: Phase::Buffering,
            backend: None,
            accepted_at: Instant::now(),
        }
    }

    pub fn peer(&self) -> SocketAddr {
        self.peer
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    /// The backend this session was paired with, once selected.
    pub fn backend(&self) -> Option<&BackendTarget> {
        self.backend.as_ref()
    }

    /// Bytes received before the handoff.
    pub fn buffer(&self) -> &[u8] {
        &self.buffer
    }

    pub fn buffered_len(&self) -> usize {
        self.buffer.len()
    }

    pub fn age(&self) -> Duration {
        self.accepted_at.elapsed()
    }

    /// Append inbound bytes. Ignored outside `Buffering`.
    pub fn append(&mut self, chunk: &[u8]) {
        if self.phase == Phase::Buffering {
            self.buffer.extend_from_slice(chunk);
        }
    }

    /// True while a backend has been selected but is not connected yet.
    pub fn is_dialing(&self) -> bool {
        self.phase == Phase::Buffering && self.backend.is_some()
    }

    /// Pair the session with its backend.
    ///
    /// Returns false if the session already has a backend or is no longer
    /// buffering; a session is paired at most once.
    pub fn pair(&mut self, target: BackendTarget) -> bool {
        if self.phase != Phase::Buffering || self.backend.is_some() {
            return false;
        }
        self.backend = Some(target);
        true
    }

    /// Switch to `Forwarding` and hand out the buffered bytes.
    ///
    /// Only valid while dialing; returns `None` otherwise.
    pub fn begin_forwarding(&mut self) -> Option<Bytes> {
        if !self.is_dialing() {
            return None;
        }
        self.phase = Phase::Forwarding;
        Some(std::mem::take(&mut self.buffer).freeze())
    }

    /// Close the session, release its buffer and return the paired backend.
    pub fn close(&mut self) -> Option<BackendTarget> {
        self.phase = Phase::Closed;
        self.buffer = BytesMut::new();
        self.backend.take()
    }
}
