//! SNI routing proxy implementation.
//!
//! This module provides:
//! - Backend targets and the hostname routing table
//! - Per-connection session state
//! - The session manager, a sans-IO state machine driven by events
//! - The tokio listener that feeds the manager and runs its commands
//! - The byte pump used once a connection is handed off
//!
//! ## Architecture
//!
//! ```text
//! Client -> Listener -> SessionManager -> extract_sni -> RoutingTable
//!              |              |
//!              |           Dial / SendToBackend / BeginForwarding
//!              v
//!           byte pump <-> Backend
//! ```
//!
//! ## Usage
//!
//! ```ignore
//! use sniproxy::proxy::{Listener, ListenerConfig, RoutingTable, SessionConfig};
//!
//! let routes = Arc::new(RoutingTable::new(vec!["example.com:443".parse()?]));
//! let config = ListenerConfig::new("[::]:443".parse()?);
//! let listener = Arc::new(Listener::bind(config, routes, SessionConfig::default()).await?);
//! listener.run(shutdown_rx).await?;
//! ```

mod listener;
mod manager;
mod pump;
mod router;
mod session;
mod stats;
mod target;

pub use listener::{
    Listener, ListenerConfig, DEFAULT_CONNECT_TIMEOUT, DEFAULT_HANDSHAKE_TIMEOUT,
    DEFAULT_IDLE_TIMEOUT, DEFAULT_MAX_CONNECTIONS,
};
pub use manager::{Command, SessionConfig, SessionEvent, SessionManager, DEFAULT_MAX_BUFFER_BYTES};
pub use pump::{proxy_bidirectional, PumpError, Transfer, HALF_CLOSE_LINGER};
pub use router::{normalize_hostname, RoutingTable};
pub use session::{ConnectionId, ConnectionSession, Phase};
pub use stats::{ListenerStats, StatsSnapshot};
pub use target::{BackendTarget, DEFAULT_PORT};
