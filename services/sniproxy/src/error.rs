//! Error types for the SNI proxy.

use thiserror::Error;

/// A `hostname[:port]` string that cannot be turned into a backend target.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum TargetParseError {
    /// Host part is empty.
    #[error("empty host in target '{0}'")]
    EmptyHost(String),

    /// Port is not a number in 1..=65535.
    #[error("invalid port in target '{input}': {reason}")]
    InvalidPort { input: String, reason: String },

    /// `[` without a matching `]`.
    #[error("unterminated IPv6 bracket in target '{0}'")]
    UnterminatedBracket(String),

    /// Bracketed host is not an IPv6 address.
    #[error("invalid IPv6 literal in target '{0}'")]
    InvalidIpv6(String),

    /// Several colons but not a bare IPv6 address.
    #[error("ambiguous target '{0}': wrap IPv6 literals in brackets to add a port")]
    AmbiguousIpv6(String),
}

/// Invalid proxy configuration, detected before any connection is accepted.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid bind host '{0}': expected an IP address")]
    InvalidBindHost(String),

    #[error("invalid remote target: {0}")]
    InvalidTarget(#[from] TargetParseError),

    /// Empty host list without the explicit allow-all opt-in.
    #[error("no remote targets configured; pass --allow-all to route every SNI hostname")]
    AllowAllNotConfirmed,

    #[error("--allow-all cannot be combined with an explicit remote target list")]
    ConflictingPolicy,

    #[error("{name} must be greater than zero")]
    ZeroLimit { name: &'static str },
}

/// Why a session ended.
///
/// Every variant is fatal for its own session only. Reasons are logged,
/// never sent to the client: the client just sees the connection close.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum CloseReason {
    /// Structurally invalid TLS data or not a TLS handshake at all.
    #[error("malformed TLS handshake: {0}")]
    MalformedHandshake(&'static str),

    /// A well-formed ClientHello without a usable server_name.
    #[error("no server name in ClientHello")]
    NoServerName,

    /// SNI hostname rejected by the routing policy.
    #[error("host '{0}' is not allowed")]
    HostNotAllowed(String),

    /// The backend could not be reached.
    #[error("backend {target} unreachable: {message}")]
    BackendDialFailure { target: String, message: String },

    /// The backend failed after it was connected.
    #[error("backend {target} failed: {message}")]
    BackendFailure { target: String, message: String },

    /// Reading from or writing to the client failed.
    #[error("client connection failed: {0}")]
    ClientFailure(String),

    /// Copying bytes between the two peers failed.
    #[error("forwarding failed: {0}")]
    ForwardingFailed(String),

    /// Either side closed normally.
    #[error("peer closed the connection")]
    PeerClosed,

    /// The ClientHello does not fit in the inspection buffer.
    #[error("ClientHello needs {needed} bytes, buffer limit is {limit}")]
    BufferLimitExceeded { needed: usize, limit: usize },

    /// No complete ClientHello before the handshake deadline.
    #[error("no complete ClientHello before the handshake deadline")]
    HandshakeTimeout,

    /// The proxy is shutting down.
    #[error("proxy shutting down")]
    Shutdown,
}

impl CloseReason {
    /// Stable reason code for logs.
    pub fn reason_code(&self) -> &'static str {
        match self {
            CloseReason::MalformedHandshake(_) => "malformed_handshake",
            CloseReason::NoServerName => "no_server_name",
            CloseReason::HostNotAllowed(_) => "host_not_allowed",
            CloseReason::BackendDialFailure { .. } => "backend_dial_failure",
            CloseReason::BackendFailure { .. } => "backend_failure",
            CloseReason::ClientFailure(_) => "client_failure",
            CloseReason::ForwardingFailed(_) => "forwarding_failed",
            CloseReason::PeerClosed => "peer_closed",
            CloseReason::BufferLimitExceeded { .. } => "buffer_limit_exceeded",
            CloseReason::HandshakeTimeout => "handshake_timeout",
            CloseReason::Shutdown => "shutdown",
        }
    }

    /// Whether the session was rejected before any backend was selected.
    pub fn is_rejection(&self) -> bool {
        matches!(
            self,
            CloseReason::MalformedHandshake(_)
                | CloseReason::NoServerName
                | CloseReason::HostNotAllowed(_)
                | CloseReason::BufferLimitExceeded { .. }
                | CloseReason::HandshakeTimeout
        )
    }
}
