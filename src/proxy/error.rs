//! Error types for proxy operations.
//!
//! This module defines structured error types for the interception proxy:
//! - Server errors (binding, accept, HTTP front end)
//! - TLS errors (configuration, certificate minting)
//! - Per-connection pipeline failures, each with a stable `kind()` code

use thiserror::Error;

use crate::ca::CaError;
use crate::net::ConnectError;

/// Unified error type for proxy operations.
#[derive(Debug, Error)]
pub enum ProxyError {
    /// I/O error (socket operations, file access).
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Hyper HTTP error.
    #[error("HTTP error: {0}")]
    Http(#[from] hyper::Error),

    /// Invalid CONNECT request.
    #[error("Invalid CONNECT request: {0}")]
    InvalidConnect(String),

    /// TLS error during configuration or certificate operations.
    #[error("TLS error: {0}")]
    Tls(String),

    /// Certificate generation failed.
    #[error("Certificate generation failed: {0}")]
    CertGeneration(#[from] CaError),

    /// Upgrade to tunnel failed.
    #[error("HTTP upgrade failed: {0}")]
    UpgradeFailed(String),
}

/// Result type for proxy operations.
pub type ProxyResult<T> = Result<T, ProxyError>;

impl From<rustls::Error> for ProxyError {
    fn from(err: rustls::Error) -> Self {
        ProxyError::Tls(err.to_string())
    }
}

/// Terminal failure of one intercepted connection.
///
/// Contained in the task that owns the connection: streams are dropped,
/// the error is logged, and nothing else is affected.
#[derive(Debug, Error)]
pub enum PipelineError {
    /// The target could not be reached.
    #[error(transparent)]
    Connect(#[from] ConnectError),

    /// TLS toward the target failed or produced no usable certificate.
    #[error("TLS handshake with target {target} failed: {message}")]
    TargetTlsHandshake {
        /// `host:port`.
        target: String,
        /// What went wrong.
        message: String,
    },

    /// The substitute certificate could not be minted or loaded.
    #[error("Failed to prepare substitute certificate: {0}")]
    SubstituteCertificate(#[from] ProxyError),

    /// TLS toward the client failed.
    #[error("TLS handshake with client failed: {0}")]
    ClientTlsHandshake(String),

    /// The connection deadline expired before relaying started.
    #[error("Connection to {0} timed out before relaying")]
    Timeout(String),

    /// Writing the tunnel status line failed.
    #[error("I/O error toward client: {0}")]
    ClientIo(#[source] std::io::Error),
}

impl PipelineError {
    /// Stable snake_case code for logs and audit events.
    pub fn kind(&self) -> &'static str {
        match self {
            PipelineError::Connect(e) => e.kind(),
            PipelineError::TargetTlsHandshake { .. } => "target_tls_handshake_failure",
            PipelineError::SubstituteCertificate(_) => "substitute_certificate",
            PipelineError::ClientTlsHandshake(_) => "client_tls_handshake_failure",
            PipelineError::Timeout(_) => "timeout",
            PipelineError::ClientIo(_) => "client_io",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_proxy_error_display() {
        let err = ProxyError::InvalidConnect("missing authority".to_string());
        assert!(err.to_string().contains("missing authority"));
    }

    #[test]
    fn test_tls_error() {
        let err = ProxyError::Tls("handshake failed".to_string());
        assert!(err.to_string().contains("handshake failed"));
    }

    #[test]
    fn test_io_error_conversion() {
        let io_err = std::io::Error::new(std::io::ErrorKind::ConnectionRefused, "refused");
        let proxy_err: ProxyError = io_err.into();
        assert!(matches!(proxy_err, ProxyError::Io(_)));
    }

    #[test]
    fn test_pipeline_error_kinds() {
        let err = PipelineError::from(ConnectError::ConnectTimeout {
            target: "example.com:443".to_string(),
        });
        assert_eq!(err.kind(), "connect_timeout");

        let err = PipelineError::TargetTlsHandshake {
            target: "example.com:443".to_string(),
            message: "alert".to_string(),
        };
        assert_eq!(err.kind(), "target_tls_handshake_failure");
        assert!(err.to_string().contains("example.com:443"));

        assert_eq!(
            PipelineError::ClientTlsHandshake("eof".to_string()).kind(),
            "client_tls_handshake_failure"
        );
        assert_eq!(PipelineError::Timeout("x:1".to_string()).kind(), "timeout");
    }
}
