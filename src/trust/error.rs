//! Error types for trust decisions.

use std::path::PathBuf;
use thiserror::Error;

use crate::net::ConnectError;

/// Errors from parsing or classifying certificates.
#[derive(Debug, Error)]
pub enum CertificateError {
    /// The destination sent no certificate.
    #[error("Peer presented an empty certificate chain")]
    EmptyChain,

    /// DER or PEM data could not be parsed.
    #[error("Failed to parse certificate: {0}")]
    Parse(String),

    /// None of the configured local anchors could be used.
    #[error("No usable local trust anchors")]
    NoAnchors,

    /// Reading an anchor file failed.
    #[error("Failed to read trust anchor {path:?}: {source}")]
    ReadAnchor {
        /// Anchor file path.
        path: PathBuf,
        /// Underlying I/O error.
        #[source]
        source: std::io::Error,
    },

    /// The webpki verifier could not be built.
    #[error("Failed to build local PKI verifier: {0}")]
    Verifier(String),
}

/// Errors from the fingerprint cache's durable storage.
#[derive(Debug, Error)]
pub enum CacheError {
    /// SQLite reported an error.
    #[error("Cache storage error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    /// Creating the cache directory failed.
    #[error("Failed to create cache directory {path:?}: {source}")]
    CreateDir {
        /// Directory path.
        path: PathBuf,
        /// Underlying I/O error.
        #[source]
        source: std::io::Error,
    },
}

/// Errors from notary bundle parsing and registry persistence.
#[derive(Debug, Error)]
pub enum BundleError {
    /// The bundle declares a format version this build cannot read.
    #[error("Unsupported notary bundle version {0}")]
    UnsupportedBundleVersion(u64),

    /// The bundle is structurally invalid.
    #[error("Invalid notary bundle: {0}")]
    Invalid(String),

    /// JSON (de)serialization failed.
    #[error("Notary bundle JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Reading or writing a record file failed.
    #[error("Notary registry I/O error at {path:?}: {source}")]
    Io {
        /// File or directory path.
        path: PathBuf,
        /// Underlying I/O error.
        #[source]
        source: std::io::Error,
    },

    /// No record with that name exists.
    #[error("Notary '{0}' not found")]
    NotFound(String),

    /// Fetching a bundle for refresh failed.
    #[error("Failed to fetch bundle from {url}: {message}")]
    Fetch {
        /// Bundle location.
        url: String,
        /// What went wrong.
        message: String,
    },
}

/// Failure of a single notary query.
///
/// Always non-fatal: the quorum treats it as an absent vote.
#[derive(Debug, Error)]
pub enum NotaryError {
    /// No TCP connection could be made.
    #[error("connect failed: {0}")]
    Connect(#[from] ConnectError),

    /// TLS handshake failed, including pin mismatches.
    #[error("TLS handshake failed: {0}")]
    Tls(String),

    /// HTTP exchange failed.
    #[error("HTTP error: {0}")]
    Http(String),

    /// The notary answered with an unexpected status.
    #[error("unexpected status {0}")]
    Status(u16),

    /// The response body could not be understood.
    #[error("malformed response: {0}")]
    MalformedResponse(String),

    /// The query did not finish within its timeout.
    #[error("timed out")]
    Timeout,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bundle_error_display() {
        let err = BundleError::UnsupportedBundleVersion(2);
        assert_eq!(err.to_string(), "Unsupported notary bundle version 2");

        let err = BundleError::NotFound("Example".into());
        assert!(err.to_string().contains("Example"));
    }

    #[test]
    fn test_notary_error_display() {
        assert_eq!(NotaryError::Status(503).to_string(), "unexpected status 503");
        assert_eq!(NotaryError::Timeout.to_string(), "timed out");
    }
}
