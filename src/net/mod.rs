//! Outbound connection establishment.
//!
//! This module owns everything needed to get a live TCP stream to a
//! destination before any TLS happens:
//! - [`Destination`] parsing from CONNECT authorities
//! - [`MultiDestinationRacer`] for racing several resolved addresses
//! - [`TargetConnector`] for DNS resolution, bounded connects and optional
//!   upstream proxy tunnelling (HTTP CONNECT or SOCKS5)
//!
//! # Example
//!
//! ```ignore
//! use vantage::net::{Destination, TargetConnector};
//! use std::time::Duration;
//!
//! let connector = TargetConnector::new(Duration::from_secs(5), Duration::from_secs(10));
//! let destination: Destination = "example.com:443".parse()?;
//! let connected = connector.connect(&destination, None).await?;
//! println!("connected to {}", connected.peer);
//! ```

pub mod connector;
pub mod error;
pub mod racer;
pub mod tunnel;

pub use connector::{Connected, TargetConnector};
pub use error::{ConnectError, RaceError};
pub use racer::{MultiDestinationRacer, RaceWinner};
pub use tunnel::UpstreamProxy;

use std::fmt;
use std::net::IpAddr;
use std::str::FromStr;

/// Port assumed when a CONNECT authority carries none.
pub const DEFAULT_TLS_PORT: u16 = 443;

/// A `(host, port)` pair requested by a client. Immutable per session.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Destination {
    /// Host name or IP literal, without IPv6 brackets.
    pub host: String,
    /// TCP port.
    pub port: u16,
}

impl Destination {
    /// Create a destination from parts.
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }

    /// Whether the host is an IP literal rather than a DNS name.
    pub fn is_ip_literal(&self) -> bool {
        self.host.parse::<IpAddr>().is_ok()
    }

    /// The `host:port` target string used in logs and verdicts.
    pub fn target(&self) -> String {
        self.to_string()
    }
}

impl fmt::Display for Destination {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.host.contains(':') {
            write!(f, "[{}]:{}", self.host, self.port)
        } else {
            write!(f, "{}:{}", self.host, self.port)
        }
    }
}

/// Error returned when an authority string cannot be parsed.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("invalid authority '{authority}': {message}")]
pub struct InvalidAuthority {
    /// The rejected input.
    pub authority: String,
    /// Why it was rejected.
    pub message: String,
}

impl FromStr for Destination {
    type Err = InvalidAuthority;

    /// Parse a CONNECT authority.
    ///
    /// - `api.example.com:443` -> ("api.example.com", 443)
    /// - `api.example.com` -> ("api.example.com", 443)
    /// - `[::1]:8443` -> ("::1", 8443)
    fn from_str(authority: &str) -> Result<Self, Self::Err> {
        let invalid = |message: &str| InvalidAuthority {
            authority: authority.to_string(),
            message: message.to_string(),
        };

        if authority.is_empty() {
            return Err(invalid("empty authority"));
        }

        if let Some(rest) = authority.strip_prefix('[') {
            let (host, tail) = rest
                .split_once(']')
                .ok_or_else(|| invalid("unterminated IPv6 literal"))?;
            let port = match tail.strip_prefix(':') {
                Some(port_str) => port_str
                    .parse::<u16>()
                    .map_err(|_| invalid("invalid port"))?,
                None if tail.is_empty() => DEFAULT_TLS_PORT,
                None => return Err(invalid("unexpected data after IPv6 literal")),
            };
            return Ok(Destination::new(host, port));
        }

        match authority.rsplit_once(':') {
            Some((host, port_str)) => {
                if host.is_empty() {
                    return Err(invalid("missing host"));
                }
                let port = port_str
                    .parse::<u16>()
                    .map_err(|_| invalid("invalid port"))?;
                Ok(Destination::new(host, port))
            }
            None => Ok(Destination::new(authority, DEFAULT_TLS_PORT)),
        }
    }
}
