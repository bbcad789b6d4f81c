//! Proxy configuration.
//!
//! Flags and `SNIPROXY_*` environment variables are parsed into [`Settings`],
//! then validated into a [`ProxyConfig`] before anything is bound.

use std::net::{IpAddr, SocketAddr};
use std::time::Duration;

use clap::{Parser, ValueEnum};

use crate::error::ConfigError;
use crate::proxy::{
    BackendTarget, ListenerConfig, RoutingTable, SessionConfig, DEFAULT_CONNECT_TIMEOUT,
    DEFAULT_HANDSHAKE_TIMEOUT, DEFAULT_MAX_BUFFER_BYTES, DEFAULT_MAX_CONNECTIONS,
};

/// Log output format.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum LogFormat {
    Json,
    Pretty,
}

/// TLS passthrough proxy routing by SNI hostname.
#[derive(Debug, Clone, Parser)]
#[command(name = "sniproxy")]
#[command(author, version, about, long_about = None)]
pub struct Settings {
    /// IP address to listen on.
    #[arg(long, env = "SNIPROXY_BIND_HOST", default_value = "0.0.0.0")]
    pub bind_host: String,

    /// Port to listen on.
    #[arg(long, env = "SNIPROXY_BIND_PORT", default_value_t = 443)]
    pub bind_port: u16,

    /// Allowed backends as `hostname[:port]`, repeated or comma-separated.
    #[arg(long = "remote", env = "SNIPROXY_REMOTES", value_delimiter = ',')]
    pub remotes: Vec<String>,

    /// Route every SNI hostname to itself on port 443.
    #[arg(long, env = "SNIPROXY_ALLOW_ALL")]
    pub allow_all: bool,

    /// Lowercase hostnames and strip a trailing dot before lookup.
    #[arg(long, env = "SNIPROXY_NORMALIZE_HOSTNAMES")]
    pub normalize_hostnames: bool,

    /// Maximum bytes buffered per connection before routing.
    #[arg(long, env = "SNIPROXY_MAX_BUFFER_BYTES", default_value_t = DEFAULT_MAX_BUFFER_BYTES)]
    pub max_buffer_bytes: usize,

    /// Time a client has to send a complete ClientHello.
    #[arg(long, env = "SNIPROXY_HANDSHAKE_TIMEOUT_MS", default_value_t = DEFAULT_HANDSHAKE_TIMEOUT.as_millis() as u64)]
    pub handshake_timeout_ms: u64,

    /// Backend connect timeout.
    #[arg(long, env = "SNIPROXY_CONNECT_TIMEOUT_MS", default_value_t = DEFAULT_CONNECT_TIMEOUT.as_millis() as u64)]
    pub connect_timeout_ms: u64,

    /// Close forwarded connections idle for this long.
    #[arg(long, env = "SNIPROXY_IDLE_TIMEOUT_MS")]
    pub idle_timeout_ms: Option<u64>,

    /// Maximum concurrent connections.
    #[arg(long, env = "SNIPROXY_MAX_CONNECTIONS", default_value_t = DEFAULT_MAX_CONNECTIONS)]
    pub max_connections: usize,

    /// Runtime worker threads (default: number of CPUs).
    #[arg(long, env = "SNIPROXY_WORKERS")]
    pub workers: Option<usize>,

    /// Log level (trace, debug, info, warn, error). RUST_LOG takes precedence.
    #[arg(long, env = "SNIPROXY_LOG_LEVEL", default_value = "info")]
    pub log_level: String,

    #[arg(long, env = "SNIPROXY_LOG_FORMAT", value_enum, default_value_t = LogFormat::Json)]
    pub log_format: LogFormat,
}

/// Validated configuration.
#[derive(Debug, Clone)]
pub struct ProxyConfig {
    pub listener: ListenerConfig,
    pub routes: RoutingTable,
    pub session: SessionConfig,
}

impl Settings {
    /// Validate the settings and build the proxy configuration.
    pub fn proxy_config(&self) -> Result<ProxyConfig, ConfigError> {
        let bind_ip: IpAddr = self
            .bind_host
            .trim()
            .trim_start_matches('[')
            .trim_end_matches(']')
            .parse()
            .map_err(|_| ConfigError::InvalidBindHost(self.bind_host.clone()))?;

        let targets = self
            .remotes
            .iter()
            .map(|remote| remote.trim())
            .filter(|remote| !remote.is_empty())
            .map(str::parse::<BackendTarget>)
            .collect::<Result<Vec<_>, _>>()?;

        match (targets.is_empty(), self.allow_all) {
            (true, false) => return Err(ConfigError::AllowAllNotConfirmed),
            (false, true) => return Err(ConfigError::ConflictingPolicy),
            _ => {}
        }

        if self.max_connections == 0 {
            return Err(ConfigError::ZeroLimit {
                name: "max-connections",
            });
        }
        if self.max_buffer_bytes == 0 {
            return Err(ConfigError::ZeroLimit {
                name: "max-buffer-bytes",
            });
        }
        if self.handshake_timeout_ms == 0 {
            return Err(ConfigError::ZeroLimit {
                name: "handshake-timeout-ms",
            });
        }
        if self.connect_timeout_ms == 0 {
            return Err(ConfigError::ZeroLimit {
                name: "connect-timeout-ms",
            });
        }
        if self.workers == Some(0) {
            return Err(ConfigError::ZeroLimit { name: "workers" });
        }

        let mut listener = ListenerConfig::new(SocketAddr::new(bind_ip, self.bind_port));
        listener.max_connections = self.max_connections;
        listener.handshake_timeout = Duration::from_millis(self.handshake_timeout_ms);
        listener.connect_timeout = Duration::from_millis(self.connect_timeout_ms);
        listener.idle_timeout = self
            .idle_timeout_ms
            .filter(|ms| *ms > 0)
            .map(Duration::from_millis);

        Ok(ProxyConfig {
            listener,
            routes: RoutingTable::new(targets),
            session: SessionConfig {
                max_buffer_bytes: self.max_buffer_bytes,
                normalize_hostnames: self.normalize_hostnames,
            },
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    fn settings(args: &[&str]) -> Settings {
        let mut argv = vec!["sniproxy"];
        argv.extend_from_slice(args);
        Settings::try_parse_from(argv).unwrap()
    }

    #[test]
    fn test_defaults() {
        let config = settings(&["--allow-all"]).proxy_config().unwrap();
        assert_eq!(config.listener.bind_addr, "0.0.0.0:443".parse().unwrap());
        assert_eq!(config.listener.max_connections, DEFAULT_MAX_CONNECTIONS);
        assert_eq!(config.listener.handshake_timeout, DEFAULT_HANDSHAKE_TIMEOUT);
        assert_eq!(config.listener.connect_timeout, DEFAULT_CONNECT_TIMEOUT);
        assert!(config.listener.idle_timeout.is_none());
        assert!(config.routes.is_allow_all());
        assert_eq!(config.session.max_buffer_bytes, DEFAULT_MAX_BUFFER_BYTES);
        assert!(!config.session.normalize_hostnames);
    }

    #[test]
    fn test_remote_list() {
        let config = settings(&[
            "--remote",
            "www.baidu.com:443,ip.sb",
            "--remote",
            "[2001:db8::1]:8443",
            "--bind-host",
            "::",
            "--bind-port",
            "8443",
        ])
        .proxy_config()
        .unwrap();

        assert_eq!(config.listener.bind_addr, "[::]:8443".parse().unwrap());
        assert_eq!(config.routes.targets().len(), 3);
        assert_eq!(
            config.routes.resolve("ip.sb"),
            Some(BackendTarget::new("ip.sb", 443))
        );
        assert_eq!(
            config.routes.resolve("2001:db8::1"),
            Some(BackendTarget::new("2001:db8::1", 8443))
        );
    }

    #[test]
    fn test_empty_list_requires_allow_all() {
        let err = settings(&[]).proxy_config().unwrap_err();
        assert!(matches!(err, ConfigError::AllowAllNotConfirmed));
    }

    #[test]
    fn test_allow_all_conflicts_with_list() {
        let err = settings(&["--allow-all", "--remote", "example.com"])
            .proxy_config()
            .unwrap_err();
        assert!(matches!(err, ConfigError::ConflictingPolicy));
    }

    #[rstest]
    #[case(&["--remote", "example.com:0"])]
    #[case(&["--remote", "example.com:99999"])]
    #[case(&["--remote", "[::1"])]
    #[case(&["--allow-all", "--bind-host", "localhost"])]
    #[case(&["--allow-all", "--max-connections", "0"])]
    #[case(&["--allow-all", "--max-buffer-bytes", "0"])]
    #[case(&["--allow-all", "--workers", "0"])]
    fn test_invalid_settings(#[case] args: &[&str]) {
        assert!(settings(args).proxy_config().is_err());
    }

    #[test]
    fn test_timeouts_and_flags() {
        let config = settings(&[
            "--allow-all",
            "--normalize-hostnames",
            "--handshake-timeout-ms",
            "1500",
            "--idle-timeout-ms",
            "60000",
        ])
        .proxy_config()
        .unwrap();
        assert!(config.session.normalize_hostnames);
        assert_eq!(config.listener.handshake_timeout, Duration::from_millis(1500));
        assert_eq!(config.listener.idle_timeout, Some(Duration::from_secs(60)));
    }

    #[test]
    fn test_log_format() {
        assert_eq!(settings(&[]).log_format, LogFormat::Json);
        assert_eq!(
            settings(&["--log-format", "pretty"]).log_format,
            LogFormat::Pretty
        );
    }
}
