//! Certificate validation: local PKI exemption, then cache, then quorum.

use std::net::IpAddr;
use std::sync::Arc;

use tracing::{debug, warn};

use super::cache::CertificateCache;
use super::certificate::Certificate;
use super::quorum::NotaryQuorum;
use super::result::{TrustOutcome, ValidationResult};
use crate::net::Destination;
use crate::telemetry::{AuditEvent, AuditLogger};

/// Decides whether a destination certificate is trusted.
#[derive(Debug)]
pub struct CertificateValidator {
    cache: Arc<CertificateCache>,
    quorum: NotaryQuorum,
    audit: Arc<AuditLogger>,
}

impl CertificateValidator {
    /// Create a validator.
    pub fn new(cache: Arc<CertificateCache>, quorum: NotaryQuorum, audit: Arc<AuditLogger>) -> Self {
        Self {
            cache,
            quorum,
            audit,
        }
    }

    /// The fingerprint cache this validator reads and writes.
    pub fn cache(&self) -> &Arc<CertificateCache> {
        &self.cache
    }

    /// Validate `certificate` as presented by `destination`.
    ///
    /// The first source that vouches wins: a locally anchored chain (only
    /// when `private_pki_exempt`), a cached fingerprint, then the notary
    /// quorum. A quorum-confirmed fingerprint is written to the cache; a
    /// failed write is logged and does not change the verdict.
    pub async fn validate(
        &self,
        destination: &Destination,
        observed_ip: Option<IpAddr>,
        certificate: Certificate,
        private_pki_exempt: bool,
    ) -> ValidationResult {
        let target = destination.target();

        if private_pki_exempt && certificate.is_local_pki() {
            debug!("{} chains to a local anchor", target);
            return ValidationResult::local_pki(target, certificate);
        }

        if self
            .cache
            .is_cached(&destination.host, destination.port, certificate.fingerprint())
        {
            debug!("{} fingerprint found in cache", target);
            return ValidationResult::cached(target, certificate);
        }

        let result = self
            .quorum
            .check_validity(&destination.host, destination.port, observed_ip, certificate)
            .await;

        if result.outcome() == TrustOutcome::QuorumConfirmed && self.cache.is_enabled() {
            let fingerprint = result.certificate().fingerprint();
            match self
                .cache
                .store(&destination.host, destination.port, fingerprint)
            {
                Ok(()) => self.audit.log(AuditEvent::CacheStore {
                    target: result.target().to_string(),
                    fingerprint: fingerprint.to_string(),
                }),
                Err(e) => warn!("Failed to cache fingerprint for {}: {}", result.target(), e),
            }
        }

        result
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::trust::registry::NotaryRegistry;
    use crate::trust::testing::{certificate, records, Script, ScriptedTransport};

    struct Fixture {
        validator: CertificateValidator,
        cache: Arc<CertificateCache>,
        transport: Arc<ScriptedTransport>,
        audit: Arc<AuditLogger>,
    }

    fn fixture(scripts: &[(&str, Script)]) -> Fixture {
        let hosts: Vec<&str> = scripts.iter().map(|(host, _)| *host).collect();
        let registry = Arc::new(NotaryRegistry::in_memory(records(&hosts)));
        let transport = Arc::new(ScriptedTransport::new(scripts));
        let cache = Arc::new(CertificateCache::open_in_memory(true).unwrap());
        let audit = Arc::new(AuditLogger::new_memory());
        let quorum = NotaryQuorum::new(registry, transport.clone(), Duration::from_secs(1));
        Fixture {
            validator: CertificateValidator::new(cache.clone(), quorum, audit.clone()),
            cache,
            transport,
            audit,
        }
    }

    #[tokio::test]
    async fn test_second_validation_is_served_from_cache() {
        let f = fixture(&[("n1", Script::Confirm), ("n2", Script::Confirm)]);
        let dest = Destination::new("example.com", 443);
        let cert = certificate("example.com", false);

        let first = f.validator.validate(&dest, None, cert.clone(), true).await;
        assert!(first.trusted());
        assert_eq!(first.outcome(), TrustOutcome::QuorumConfirmed);
        assert_eq!(f.transport.calls(), 2);
        assert!(f.cache.is_cached("example.com", 443, cert.fingerprint()));

        let second = f.validator.validate(&dest, None, cert, true).await;
        assert!(second.trusted());
        assert_eq!(second.outcome(), TrustOutcome::Cache);
        assert_eq!(second.details().len(), 1);
        assert_eq!(second.details()[0].source, "cache");
        assert_eq!(f.transport.calls(), 2);

        let events = f.audit.recorded();
        assert_eq!(events.len(), 1);
        assert!(events[0].contains("\"event\":\"cache_store\""));
    }

    #[tokio::test]
    async fn test_distrusted_result_is_not_cached() {
        let f = fixture(&[("n1", Script::Confirm), ("n2", Script::Conflict)]);
        let dest = Destination::new("example.com", 443);
        let cert = certificate("example.com", false);

        let result = f.validator.validate(&dest, None, cert.clone(), true).await;
        assert!(!result.trusted());
        assert!(!f.cache.is_cached("example.com", 443, cert.fingerprint()));
        assert!(f.cache.is_empty());
        assert!(f.audit.recorded().is_empty());
    }

    #[tokio::test]
    async fn test_unreachable_quorum_is_not_cached() {
        let f = fixture(&[("n1", Script::Unreachable)]);
        let dest = Destination::new("example.com", 443);

        let result = f
            .validator
            .validate(&dest, None, certificate("example.com", false), true)
            .await;
        assert_eq!(result.outcome(), TrustOutcome::QuorumUnreachable);
        assert!(f.cache.is_empty());
    }

    #[tokio::test]
    async fn test_local_pki_skips_cache_and_notaries() {
        let f = fixture(&[("n1", Script::Conflict)]);
        let dest = Destination::new("intranet.corp", 443);

        let result = f
            .validator
            .validate(&dest, None, certificate("intranet.corp", true), true)
            .await;

        assert!(result.trusted());
        assert_eq!(result.outcome(), TrustOutcome::LocalPki);
        assert_eq!(result.details()[0].source, "local PKI");
        assert_eq!(f.cache.lookups(), 0);
        assert_eq!(f.transport.calls(), 0);
        assert!(f.cache.is_empty());
    }

    #[tokio::test]
    async fn test_local_pki_needs_exemption_enabled() {
        let f = fixture(&[("n1", Script::Conflict)]);
        let dest = Destination::new("intranet.corp", 443);

        let result = f
            .validator
            .validate(&dest, None, certificate("intranet.corp", true), false)
            .await;

        assert!(!result.trusted());
        assert_eq!(result.outcome(), TrustOutcome::NotaryConflict);
        assert_eq!(f.cache.lookups(), 1);
        assert_eq!(f.transport.calls(), 1);
    }

    #[tokio::test]
    async fn test_rotated_certificate_goes_back_to_quorum() {
        let f = fixture(&[("n1", Script::Confirm)]);
        let dest = Destination::new("example.com", 443);
        f.cache.store("example.com", 443, "aa:bb").unwrap();

        let cert = certificate("example.com", false);
        let result = f.validator.validate(&dest, None, cert.clone(), true).await;

        assert_eq!(result.outcome(), TrustOutcome::QuorumConfirmed);
        assert_eq!(f.transport.calls(), 1);
        assert!(f.cache.is_cached("example.com", 443, cert.fingerprint()));
    }

    #[tokio::test]
    async fn test_disabled_cache_always_asks_quorum() {
        let registry = Arc::new(NotaryRegistry::in_memory(records(&["n1"])));
        let transport = Arc::new(ScriptedTransport::new(&[("n1", Script::Confirm)]));
        let cache = Arc::new(CertificateCache::open_in_memory(false).unwrap());
        let quorum = NotaryQuorum::new(registry, transport.clone(), Duration::from_secs(1));
        let validator = CertificateValidator::new(cache, quorum, Arc::new(AuditLogger::new_null()));
        let dest = Destination::new("example.com", 443);
        let cert = certificate("example.com", false);

        validator.validate(&dest, None, cert.clone(), true).await;
        let second = validator.validate(&dest, None, cert, true).await;

        assert_eq!(second.outcome(), TrustOutcome::QuorumConfirmed);
        assert_eq!(transport.calls(), 2);
    }
}
