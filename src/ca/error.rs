//! Error types for the local signing authority.

use std::path::PathBuf;
use thiserror::Error;

/// Errors from loading, generating or using the local CA.
#[derive(Debug, Error)]
pub enum CaError {
    /// Failed to create the CA directory.
    #[error("Failed to create CA directory {path:?}: {source}")]
    CreateDir {
        /// Directory path.
        path: PathBuf,
        /// Underlying I/O error.
        #[source]
        source: std::io::Error,
    },

    /// Failed to set file permissions.
    #[error("Failed to set permissions: {0}")]
    Permissions(#[source] std::io::Error),

    /// Failed to generate key pair.
    #[error("Failed to generate key pair: {0}")]
    KeyGeneration(String),

    /// Failed to generate certificate.
    #[error("Failed to generate certificate: {0}")]
    CertGeneration(String),

    /// Failed to sign a leaf certificate.
    #[error("Failed to sign certificate: {0}")]
    Signing(String),

    /// Stored CA material could not be parsed.
    #[error("Failed to load CA from {path:?}: {message}")]
    Load {
        /// File that failed to load.
        path: PathBuf,
        /// What went wrong.
        message: String,
    },

    /// Failed to read a CA file.
    #[error("Failed to read file: {0}")]
    ReadFile(#[source] std::io::Error),

    /// Failed to write a CA file.
    #[error("Failed to write file: {0}")]
    WriteFile(#[source] std::io::Error),

    /// A name cannot be placed in a certificate.
    #[error("Invalid certificate name '{0}'")]
    InvalidName(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ca_error_display() {
        let err = CaError::InvalidName("bad name".into());
        assert!(err.to_string().contains("bad name"));

        let err = CaError::Load {
            path: PathBuf::from("/tmp/ca.key"),
            message: "not PEM".into(),
        };
        assert!(err.to_string().contains("ca.key"));
    }
}
