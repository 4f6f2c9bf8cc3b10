//! TLS configuration for both legs of an intercepted connection.
//!
//! This module provides:
//! - Leaf certificate caching so the local CA does not mint one per connection
//! - A fixed-certificate resolver and acceptor for the client leg
//! - A connector for the target leg that accepts any certificate so it can be
//!   judged by the validator instead of by CA chains
//! - A pinned connector for notary queries
//! - A system-roots connector for bundle refresh
//!
//! # Critical ALPN Note
//!
//! We **must** force HTTP/1.1 via ALPN on both legs. The relay copies bytes
//! blindly, so both ends have to agree on one protocol. Letting the client
//! negotiate h2 with us while the target speaks http/1.1 breaks the stream.
//!
//! # Handshake signatures
//!
//! Accepting any certificate is not the same as skipping verification. The
//! target and notary verifiers still check the TLS 1.2/1.3 handshake
//! signature against the presented certificate, so a peer cannot replay a
//! certificate whose private key it does not hold.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use std::time::{Duration, Instant};

use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::crypto::{CryptoProvider, verify_tls12_signature, verify_tls13_signature};
use rustls::server::{ClientHello, ResolvesServerCert};
use rustls::sign::CertifiedKey;
use rustls::{ClientConfig, DigitallySignedStruct, ServerConfig, SignatureScheme};
use rustls_pki_types::{CertificateDer, ServerName, UnixTime};
use tokio_rustls::{TlsAcceptor, TlsConnector};
use tracing::{debug, trace};

use super::error::ProxyError;
use crate::ca::LocalCa;
use crate::trust::certificate::{fingerprint_of, normalize_fingerprint};

/// Leaf certificates older than this are minted again.
pub const LEAF_REFRESH_AFTER: Duration = Duration::from_secs(12 * 60 * 60);

const HTTP11_ALPN: &[u8] = b"http/1.1";

/// The crypto provider used for every TLS configuration in the crate.
pub fn crypto_provider() -> Arc<CryptoProvider> {
    Arc::new(rustls::crypto::aws_lc_rs::default_provider())
}

struct CachedLeaf {
    key: Arc<CertifiedKey>,
    issued: Instant,
}

/// Cache of substitute leaf certificates minted by the local CA.
///
/// Keyed by lowercased common name. Entries are re-minted once they are
/// older than [`LEAF_REFRESH_AFTER`], well inside the leaf validity.
pub struct LeafCertCache {
    cache: RwLock<HashMap<String, CachedLeaf>>,
    ca: Arc<LocalCa>,
    max_age: Duration,
}

impl LeafCertCache {
    /// Create a new leaf cache backed by `ca`.
    pub fn new(ca: Arc<LocalCa>) -> Self {
        Self::with_max_age(ca, LEAF_REFRESH_AFTER)
    }

    /// Create a leaf cache with a custom re-mint age.
    pub fn with_max_age(ca: Arc<LocalCa>, max_age: Duration) -> Self {
        Self {
            cache: RwLock::new(HashMap::new()),
            ca,
            max_age,
        }
    }

    /// Get or mint a leaf for `common_name` with the given SANs.
    pub fn get_or_issue(
        &self,
        common_name: &str,
        alt_names: &[String],
    ) -> Result<Arc<CertifiedKey>, ProxyError> {
        let key_name = common_name.to_lowercase();

        {
            let cache = self.cache.read().unwrap();
            if let Some(entry) = cache.get(&key_name)
                && entry.issued.elapsed() < self.max_age
            {
                trace!("Leaf certificate cache hit for {}", common_name);
                return Ok(entry.key.clone());
            }
        }

        debug!("Minting substitute certificate for {}", common_name);
        let issued = self.ca.issue(common_name, alt_names)?;

        let signing_key = rustls::crypto::aws_lc_rs::sign::any_supported_type(&issued.key)
            .map_err(|e| ProxyError::Tls(format!("Failed to create signing key: {}", e)))?;
        let certified_key = Arc::new(CertifiedKey::new(issued.chain, signing_key));

        self.cache.write().unwrap().insert(
            key_name,
            CachedLeaf {
                key: certified_key.clone(),
                issued: Instant::now(),
            },
        );

        Ok(certified_key)
    }

    /// Drop every cached leaf.
    pub fn clear(&self) {
        self.cache.write().unwrap().clear();
        debug!("Leaf certificate cache cleared");
    }

    /// Number of cached leaves.
    pub fn len(&self) -> usize {
        self.cache.read().unwrap().len()
    }

    /// Whether the cache is empty.
    pub fn is_empty(&self) -> bool {
        self.cache.read().unwrap().is_empty()
    }
}

impl std::fmt::Debug for LeafCertCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LeafCertCache")
            .field("cached", &self.len())
            .field("max_age", &self.max_age)
            .finish()
    }
}

/// Resolver that always presents one certificate, whatever the SNI.
///
/// The substitute is chosen before the client handshake starts, from the
/// validation result, so there is nothing left to decide per ClientHello.
#[derive(Debug)]
pub struct FixedCertResolver {
    key: Arc<CertifiedKey>,
}

impl FixedCertResolver {
    /// Wrap a certified key.
    pub fn new(key: Arc<CertifiedKey>) -> Self {
        Self { key }
    }
}

impl ResolvesServerCert for FixedCertResolver {
    fn resolve(&self, client_hello: ClientHello<'_>) -> Option<Arc<CertifiedKey>> {
        trace!("Presenting substitute for SNI {:?}", client_hello.server_name());
        Some(self.key.clone())
    }
}

/// Create a TLS acceptor for the client leg presenting `key`.
pub fn create_client_acceptor(key: Arc<CertifiedKey>) -> Result<TlsAcceptor, ProxyError> {
    let mut config = ServerConfig::builder_with_provider(crypto_provider())
        .with_safe_default_protocol_versions()?
        .with_no_client_auth()
        .with_cert_resolver(Arc::new(FixedCertResolver::new(key)));

    // CRITICAL: Force HTTP/1.1 so the client cannot negotiate h2 with us.
    config.alpn_protocols = vec![HTTP11_ALPN.to_vec()];

    Ok(TlsAcceptor::from(Arc::new(config)))
}

/// Verifier for the target leg: any chain is accepted so the validator can
/// judge it, but handshake signatures are still checked.
#[derive(Debug)]
pub struct AcceptAnyCertVerifier {
    provider: Arc<CryptoProvider>,
}

impl AcceptAnyCertVerifier {
    /// Create a verifier using `provider` for signature checks.
    pub fn new(provider: Arc<CryptoProvider>) -> Self {
        Self { provider }
    }
}

impl ServerCertVerifier for AcceptAnyCertVerifier {
    fn verify_server_cert(
        &self,
        _end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: UnixTime,
    ) -> Result<ServerCertVerified, rustls::Error> {
        Ok(ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        verify_tls12_signature(
            message,
            cert,
            dss,
            &self.provider.signature_verification_algorithms,
        )
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        verify_tls13_signature(
            message,
            cert,
            dss,
            &self.provider.signature_verification_algorithms,
        )
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.provider
            .signature_verification_algorithms
            .supported_schemes()
    }
}

/// Verifier for notary connections: only a certificate whose SHA-256
/// fingerprint matches the pin is accepted.
#[derive(Debug)]
pub struct PinnedCertVerifier {
    fingerprint: String,
    inner: AcceptAnyCertVerifier,
}

impl PinnedCertVerifier {
    /// Pin `fingerprint` (colon hex, any case).
    pub fn new(fingerprint: &str, provider: Arc<CryptoProvider>) -> Self {
        Self {
            fingerprint: normalize_fingerprint(fingerprint),
            inner: AcceptAnyCertVerifier::new(provider),
        }
    }
}

impl ServerCertVerifier for PinnedCertVerifier {
    fn verify_server_cert(
        &self,
        end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: UnixTime,
    ) -> Result<ServerCertVerified, rustls::Error> {
        let presented = fingerprint_of(end_entity.as_ref());
        if presented == self.fingerprint {
            Ok(ServerCertVerified::assertion())
        } else {
            debug!(
                "Notary pin mismatch: expected {}, got {}",
                self.fingerprint, presented
            );
            Err(rustls::Error::InvalidCertificate(
                rustls::CertificateError::ApplicationVerificationFailure,
            ))
        }
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        self.inner.verify_tls12_signature(message, cert, dss)
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        self.inner.verify_tls13_signature(message, cert, dss)
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.inner.supported_verify_schemes()
    }
}

/// Create the TLS connector for the target leg.
pub fn create_target_connector() -> Result<TlsConnector, ProxyError> {
    let provider = crypto_provider();
    let mut config = ClientConfig::builder_with_provider(provider.clone())
        .with_safe_default_protocol_versions()?
        .dangerous()
        .with_custom_certificate_verifier(Arc::new(AcceptAnyCertVerifier::new(provider)))
        .with_no_client_auth();

    config.alpn_protocols = vec![HTTP11_ALPN.to_vec()];

    Ok(TlsConnector::from(Arc::new(config)))
}

/// Create a TLS connector that only trusts a certificate with `fingerprint`.
pub fn create_pinned_connector(fingerprint: &str) -> Result<TlsConnector, ProxyError> {
    let provider = crypto_provider();
    let mut config = ClientConfig::builder_with_provider(provider.clone())
        .with_safe_default_protocol_versions()?
        .dangerous()
        .with_custom_certificate_verifier(Arc::new(PinnedCertVerifier::new(
            fingerprint,
            provider,
        )))
        .with_no_client_auth();

    config.alpn_protocols = vec![HTTP11_ALPN.to_vec()];

    Ok(TlsConnector::from(Arc::new(config)))
}

/// Create a TLS connector verifying against system root CAs.
///
/// Used only to fetch notary bundles from their published location.
pub fn create_tls_connector() -> Result<TlsConnector, ProxyError> {
    let mut root_store = rustls::RootCertStore::empty();

    let native_certs = rustls_native_certs::load_native_certs();

    // Log any errors but continue with successfully loaded certs
    for err in native_certs.errors {
        debug!("Warning loading native cert: {}", err);
    }

    let (added, ignored) = root_store.add_parsable_certificates(native_certs.certs);
    if ignored > 0 {
        debug!("Ignored {} unparsable root certificate(s)", ignored);
    }

    if added == 0 {
        return Err(ProxyError::Tls(
            "No system root certificates found".into(),
        ));
    }

    debug!("Loaded {} root certificates", added);

    let config = ClientConfig::builder_with_provider(crypto_provider())
        .with_safe_default_protocol_versions()?
        .with_root_certificates(root_store)
        .with_no_client_auth();

    Ok(TlsConnector::from(Arc::new(config)))
}

/// Convert a host string to a ServerName for a TLS connection.
///
/// IP literals become `ServerName::IpAddress`, for which no SNI is sent.
pub fn domain_to_server_name(domain: &str) -> Result<ServerName<'static>, ProxyError> {
    ServerName::try_from(domain.to_string())
        .map_err(|_| ProxyError::Tls(format!("Invalid server name: {}", domain)))
}
