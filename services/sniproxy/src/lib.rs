pub mod config;
pub mod error;
pub mod proxy;

pub use config::{LogFormat, ProxyConfig, Settings};
pub use error::{CloseReason, ConfigError, TargetParseError};
pub use proxy::{
    BackendTarget, Command, ConnectionId, Listener, ListenerConfig, ListenerStats, Phase,
    RoutingTable, SessionConfig, SessionEvent, SessionManager,
};
