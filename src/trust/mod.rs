//! Trust decisions for destination certificates.
//!
//! Certificates are never validated against CA chains. A certificate is
//! trusted only if:
//! - it chains to a locally configured anchor (when that exemption is on),
//! - its fingerprint matches the one cached for the destination, or
//! - every notary that answers reports seeing the same fingerprint.
//!
//! # Example
//!
//! ```ignore
//! use vantage::trust::{CertificateCache, CertificateValidator, NotaryQuorum, NotaryRegistry};
//!
//! let quorum = NotaryQuorum::new(registry, transport, Duration::from_secs(10));
//! let validator = CertificateValidator::new(cache, quorum, audit);
//! let result = validator.validate(&destination, Some(ip), certificate, true).await;
//! if result.trusted() { /* present the real host name */ }
//! ```

pub mod bundle;
pub mod cache;
pub mod certificate;
pub mod error;
pub mod quorum;
pub mod registry;
pub mod result;
pub mod transport;
pub mod validator;

pub use bundle::{parse_bundle, NotaryRecord, PhysicalNotary, BUNDLE_VERSION};
pub use cache::{CacheEntry, CertificateCache};
pub use certificate::{fingerprint_of, Certificate, LocalPki};
pub use error::{BundleError, CacheError, CertificateError, NotaryError};
pub use quorum::{NotaryOutcome, NotaryQuorum};
pub use registry::{BundleFetcher, NotaryRegistry, RefreshReport};
pub use result::{TrustOutcome, ValidationDetail, ValidationResult};
pub use transport::{
    HttpsBundleFetcher, HttpsNotaryTransport, NotaryRequest, NotaryTransport, NotaryVerdict,
};
pub use validator::CertificateValidator;

#[cfg(test)]
pub(crate) mod testing {
    //! Scripted notaries and throwaway certificates for unit tests.

    use std::collections::HashMap;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    use async_trait::async_trait;
    use chrono::Utc;

    use super::*;

    /// How a scripted notary host answers.
    #[derive(Debug, Clone, Copy)]
    pub(crate) enum Script {
        Confirm,
        Conflict,
        Unreachable,
        Hang,
    }

    /// Transport whose answers are keyed by notary host name.
    #[derive(Debug, Default)]
    pub(crate) struct ScriptedTransport {
        scripts: HashMap<String, Script>,
        calls: AtomicUsize,
    }

    impl ScriptedTransport {
        pub(crate) fn new(scripts: &[(&str, Script)]) -> Self {
            Self {
                scripts: scripts
                    .iter()
                    .map(|(host, script)| (host.to_string(), *script))
                    .collect(),
                calls: AtomicUsize::new(0),
            }
        }

        pub(crate) fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl NotaryTransport for ScriptedTransport {
        async fn query(
            &self,
            notary: &PhysicalNotary,
            _request: &NotaryRequest,
        ) -> Result<NotaryVerdict, NotaryError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            match self.scripts.get(&notary.host) {
                Some(Script::Confirm) => Ok(NotaryVerdict::Confirmed),
                Some(Script::Conflict) => Ok(NotaryVerdict::Conflict),
                Some(Script::Hang) => {
                    tokio::time::sleep(Duration::from_secs(3600)).await;
                    Err(NotaryError::Timeout)
                }
                Some(Script::Unreachable) | None => Err(NotaryError::Status(503)),
            }
        }
    }

    /// One enabled record per host, named after the host.
    pub(crate) fn records(hosts: &[&str]) -> Vec<NotaryRecord> {
        hosts
            .iter()
            .map(|host| NotaryRecord {
                name: host.to_string(),
                version: BUNDLE_VERSION,
                region: None,
                bundle_location: None,
                enabled: true,
                updated_at: Utc::now(),
                notaries: vec![PhysicalNotary {
                    host: host.to_string(),
                    http_port: 80,
                    ssl_port: 443,
                    pinned_key_fingerprint: "00".to_string(),
                }],
            })
            .collect()
    }

    /// A freshly generated self-signed certificate for `host`.
    pub(crate) fn certificate(host: &str, is_local_pki: bool) -> Certificate {
        let key = rcgen::KeyPair::generate().unwrap();
        let cert = rcgen::CertificateParams::new(vec![host.to_string()])
            .unwrap()
            .self_signed(&key)
            .unwrap();
        Certificate::from_der(cert.der().clone(), is_local_pki).unwrap()
    }
}
