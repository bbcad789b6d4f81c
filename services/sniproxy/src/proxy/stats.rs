//! Listener counters.

use std::sync::atomic::{AtomicU64, Ordering};

/// Statistics for a listener and its sessions.
#[derive(Debug, Default)]
pub struct ListenerStats {
    /// Total connections accepted.
    pub connections_accepted: AtomicU64,
    /// Total connections currently active.
    pub connections_active: AtomicU64,
    /// Total connections closed.
    pub connections_closed: AtomicU64,
    /// Connections rejected due to max limit.
    pub connections_rejected: AtomicU64,
    /// SNI extraction successes.
    pub sni_found: AtomicU64,
    /// SNI extraction failures (not TLS, no SNI, malformed, timeout).
    pub sni_failed: AtomicU64,
    /// Hostnames accepted by the routing table.
    pub routes_matched: AtomicU64,
    /// Hostnames rejected by the routing table.
    pub routes_rejected: AtomicU64,
    /// Backend connection successes.
    pub backend_connected: AtomicU64,
    /// Backend connection failures.
    pub backend_failed: AtomicU64,
    /// Bytes proxied to backend.
    pub bytes_to_backend: AtomicU64,
    /// Bytes proxied from backend.
    pub bytes_from_backend: AtomicU64,
}

impl ListenerStats {
    pub(crate) fn incr(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    /// Point-in-time copy of all counters.
    pub fn snapshot(&self) -> StatsSnapshot {
        let load = |c: &AtomicU64| c.load(Ordering::Relaxed);
        StatsSnapshot {
            connections_accepted: load(&self.connections_accepted),
            connections_active: load(&self.connections_active),
            connections_closed: load(&self.connections_closed),
            connections_rejected: load(&self.connections_rejected),
            sni_found: load(&self.sni_found),
            sni_failed: load(&self.sni_failed),
            routes_matched: load(&self.routes_matched),
            routes_rejected: load(&self.routes_rejected),
            backend_connected: load(&self.backend_connected),
            backend_failed: load(&self.backend_failed),
            bytes_to_backend: load(&self.bytes_to_backend),
            bytes_from_backend: load(&self.bytes_from_backend),
        }
    }
}

/// Plain copy of [`ListenerStats`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StatsSnapshot {
    pub connections_accepted: u64,
    pub connections_active: u64,
    pub connections_closed: u64,
    pub connections_rejected: u64,
    pub sni_found: u64,
    pub sni_failed: u64,
    pub routes_matched: u64,
    pub routes_rejected: u64,
    pub backend_connected: u64,
    pub backend_failed: u64,
    pub bytes_to_backend: u64,
    pub bytes_from_backend: u64,
}
