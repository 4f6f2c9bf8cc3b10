//! The outcome of validating one certificate.

use serde::Serialize;

use super::certificate::Certificate;

/// How a verdict was reached.
///
/// Only the first three variants mean "trusted"; there is no other way for a
/// result to become trusted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TrustOutcome {
    /// The chain verified against a configured local anchor.
    LocalPki,
    /// The fingerprint matched the cache.
    Cache,
    /// Every notary that answered confirmed the fingerprint.
    QuorumConfirmed,
    /// At least one notary saw a different certificate.
    NotaryConflict,
    /// No notary gave a usable answer, or none are configured.
    QuorumUnreachable,
}

impl TrustOutcome {
    /// Whether this outcome means the certificate is trusted.
    pub fn is_trusted(self) -> bool {
        matches!(
            self,
            TrustOutcome::LocalPki | TrustOutcome::Cache | TrustOutcome::QuorumConfirmed
        )
    }
}

/// One line of evidence behind a verdict.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ValidationDetail {
    /// Which notary (or `"cache"`, `"local PKI"`) produced this line.
    pub source: String,
    /// Whether this source vouched for the certificate.
    pub trusted: bool,
    /// Human-readable reason.
    pub explanation: String,
}

/// Verdict for a destination certificate.
#[derive(Debug, Clone, Serialize)]
pub struct ValidationResult {
    trusted: bool,
    outcome: TrustOutcome,
    target: String,
    certificate: Certificate,
    details: Vec<ValidationDetail>,
}

impl ValidationResult {
    pub(crate) fn new(
        outcome: TrustOutcome,
        target: String,
        certificate: Certificate,
        details: Vec<ValidationDetail>,
    ) -> Self {
        Self {
            trusted: outcome.is_trusted(),
            outcome,
            target,
            certificate,
            details,
        }
    }

    /// Trusted because the chain is locally anchored.
    pub fn local_pki(target: String, certificate: Certificate) -> Self {
        Self::new(
            TrustOutcome::LocalPki,
            target,
            certificate,
            vec![ValidationDetail {
                source: "local PKI".to_string(),
                trusted: true,
                explanation: "certificate chains to a local trust anchor".to_string(),
            }],
        )
    }

    /// Trusted because the fingerprint was cached.
    pub fn cached(target: String, certificate: Certificate) -> Self {
        Self::new(
            TrustOutcome::Cache,
            target,
            certificate,
            vec![ValidationDetail {
                source: "cache".to_string(),
                trusted: true,
                explanation: "fingerprint matches cached entry".to_string(),
            }],
        )
    }

    /// Whether the certificate is trusted.
    pub fn trusted(&self) -> bool {
        self.trusted
    }

    /// How the verdict was reached.
    pub fn outcome(&self) -> TrustOutcome {
        self.outcome
    }

    /// `host:port` the verdict is about.
    pub fn target(&self) -> &str {
        &self.target
    }

    /// The certificate the destination presented.
    pub fn certificate(&self) -> &Certificate {
        &self.certificate
    }

    /// Evidence, one entry per source consulted.
    pub fn details(&self) -> &[ValidationDetail] {
        &self.details
    }
}
