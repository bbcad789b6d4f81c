//! Backend targets.
//!
//! A target is the `(hostname, port)` pair a client is routed to. Targets
//! are parsed once from configuration and shared read-only afterwards.

use std::fmt;
use std::net::Ipv6Addr;
use std::str::FromStr;

use crate::error::TargetParseError;

/// Port used when a target or an allow-all hostname carries none.
pub const DEFAULT_PORT: u16 = 443;

/// A backend endpoint identified by hostname and port.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct BackendTarget {
    host: String,
    port: u16,
}

impl BackendTarget {
    /// Create a new target. `host` may be a DNS name or an IP literal
    /// (IPv6 without brackets).
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    /// Connection address in `host:port` form, IPv6 literals bracketed.
    pub fn address(&self) -> String {
        self.to_string()
    }

    fn is_ipv6_literal(&self) -> bool {
        self.host.parse::<Ipv6Addr>().is_ok()
    }
}

impl fmt::Display for BackendTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_ipv6_literal() {
            write!(f, "[{}]:{}", self.host, self.port)
        } else {
            write!(f, "{}:{}", self.host, self.port)
        }
    }
}

impl FromStr for BackendTarget {
    type Err = TargetParseError;

    /// Parse `host`, `host:port`, `[v6]`, `[v6]:port` or a bare IPv6 literal.
    fn from_str(input: &str) -> Result<Self, Self::Err> {
        let s = input.trim();
        if s.is_empty() {
            return Err(TargetParseError::EmptyHost(input.to_string()));
        }

        if let Some(rest) = s.strip_prefix('[') {
            let (host, after) = rest
                .split_once(']')
                .ok_or_else(|| TargetParseError::UnterminatedBracket(input.to_string()))?;
            if host.is_empty() {
                return Err(TargetParseError::EmptyHost(input.to_string()));
            }
            if host.parse::<Ipv6Addr>().is_err() {
                return Err(TargetParseError::InvalidIpv6(input.to_string()));
            }
            let port = match after {
                "" => DEFAULT_PORT,
                _ => match after.strip_prefix(':') {
                    Some(port) => parse_port(input, port)?,
                    None => {
                        return Err(TargetParseError::InvalidPort {
                            input: input.to_string(),
                            reason: format!("unexpected '{}' after ']'", after),
                        })
                    }
                },
            };
            return Ok(Self::new(host, port));
        }

        match s.matches(':').count() {
            0 => Ok(Self::new(s, DEFAULT_PORT)),
            1 => {
                let (host, port) = s.split_once(':').unwrap_or((s, ""));
                if host.is_empty() {
                    return Err(TargetParseError::EmptyHost(input.to_string()));
                }
                Ok(Self::new(host, parse_port(input, port)?))
            }
            _ if s.parse::<Ipv6Addr>().is_ok() => Ok(Self::new(s, DEFAULT_PORT)),
            _ => Err(TargetParseError::AmbiguousIpv6(input.to_string())),
        }
    }
}

fn parse_port(input: &str, port: &str) -> Result<u16, TargetParseError> {
    let invalid = |reason: String| TargetParseError::InvalidPort {
        input: input.to_string(),
        reason,
    };
    let port: u16 = port.parse().map_err(|e| invalid(format!("{}", e)))?;
    if port == 0 {
        return Err(invalid("port must be between 1 and 65535".to_string()));
    }
    Ok(port)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case("example.com:8443", "example.com", 8443)]
    #[case("example.com", "example.com", 443)]
    #[case("  ip.sb:443 ", "ip.sb", 443)]
    #[case("10.0.0.7:9000", "10.0.0.7", 9000)]
    #[case("[2001:db8::1]:8443", "2001:db8::1", 8443)]
    #[case("[::1]", "::1", 443)]
    #[case("2001:db8::1", "2001:db8::1", 443)]
    fn test_parse_target(#[case] input: &str, #[case] host: &str, #[case] port: u16) {
        let target: BackendTarget = input.parse().unwrap();
        assert_eq!(target.host(), host);
        assert_eq!(target.port(), port);
    }

    #[rstest]
    #[case("")]
    #[case(":443")]
    #[case("example.com:")]
    #[case("example.com:0")]
    #[case("example.com:65536")]
    #[case("example.com:https")]
    #[case("[::1")]
    #[case("[]:443")]
    #[case("[not-v6]:443")]
    #[case("[::1]443")]
    #[case("2001:db8::1:8443x")]
    fn test_parse_target_rejects(#[case] input: &str) {
        assert!(input.parse::<BackendTarget>().is_err(), "{input:?} parsed");
    }

    #[test]
    fn test_ambiguous_ipv6_error() {
        let err = "fe80::1::2:443".parse::<BackendTarget>().unwrap_err();
        assert!(matches!(err, TargetParseError::AmbiguousIpv6(_)));
    }

    #[test]
    fn test_address() {
        assert_eq!(
            BackendTarget::new("example.com", 443).address(),
            "example.com:443"
        );
        assert_eq!(BackendTarget::new("::1", 8443).address(), "[::1]:8443");
    }

    #[test]
    fn test_identity() {
        let a: BackendTarget = "example.com".parse().unwrap();
        let b = BackendTarget::new("example.com", DEFAULT_PORT);
        assert_eq!(a, b);
        assert_ne!(a, BackendTarget::new("example.com", 8443));
    }
}
