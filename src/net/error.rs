//! Error types for outbound connection establishment.

use thiserror::Error;

/// Failure of a [`super::MultiDestinationRacer`] invocation.
#[derive(Debug, Error)]
pub enum RaceError {
    /// No candidate completed a TCP handshake.
    #[error("all {attempted} candidate(s) failed{}", if *.timed_out { " (budget exhausted)" } else { "" })]
    AllCandidatesFailed {
        /// Number of candidates that were attempted.
        attempted: usize,
        /// Whether the race ended because the time budget ran out.
        timed_out: bool,
    },
}

/// Failure of [`super::TargetConnector::connect`].
///
/// The socket, if one was opened, is always dropped before this error is
/// returned.
#[derive(Debug, Error)]
pub enum ConnectError {
    /// Name resolution failed or returned no addresses.
    #[error("DNS lookup for '{host}' failed: {message}")]
    DnsFailure {
        /// The host that was being resolved.
        host: String,
        /// Resolver error message.
        message: String,
    },

    /// No address answered within the connect budget.
    #[error("Connection to {target} timed out")]
    ConnectTimeout {
        /// `host:port` we were trying to reach.
        target: String,
    },

    /// Every resolved address refused or errored before the budget ran out.
    #[error("Connection to {target} failed: {source}")]
    Unreachable {
        /// `host:port` we were trying to reach.
        target: String,
        /// The racer failure.
        #[source]
        source: RaceError,
    },

    /// The upstream proxy refused to open the tunnel.
    #[error("Upstream proxy rejected tunnel to {target}: {message}")]
    TunnelRejected {
        /// `host:port` the tunnel was requested for.
        target: String,
        /// Status line or SOCKS reply description.
        message: String,
    },

    /// I/O failure while talking to the upstream proxy.
    #[error("I/O error while connecting to {target}: {source}")]
    Io {
        /// `host:port` we were trying to reach.
        target: String,
        /// The underlying I/O error.
        #[source]
        source: std::io::Error,
    },
}

impl ConnectError {
    /// Stable short code for logs and audit events.
    pub fn kind(&self) -> &'static str {
        match self {
            ConnectError::DnsFailure { .. } => "dns_failure",
            ConnectError::ConnectTimeout { .. } => "connect_timeout",
            ConnectError::Unreachable { .. } => "all_candidates_failed",
            ConnectError::TunnelRejected { .. } => "tunnel_rejected",
            ConnectError::Io { .. } => "io",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_race_error_display() {
        let err = RaceError::AllCandidatesFailed {
            attempted: 3,
            timed_out: true,
        };
        assert!(err.to_string().contains("all 3 candidate(s) failed"));
        assert!(err.to_string().contains("budget exhausted"));
    }

    #[test]
    fn test_connect_error_kind() {
        let err = ConnectError::TunnelRejected {
            target: "example.com:443".into(),
            message: "HTTP/1.1 403 Forbidden".into(),
        };
        assert_eq!(err.kind(), "tunnel_rejected");
        assert!(err.to_string().contains("example.com:443"));
        assert!(err.to_string().contains("403"));
    }
}
