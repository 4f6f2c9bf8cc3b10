//! Observed certificates and their fingerprints.

use std::path::Path;
use std::sync::Arc;

use rustls::client::WebPkiServerVerifier;
use rustls::client::danger::ServerCertVerifier;
use rustls::RootCertStore;
use rustls_pki_types::{CertificateDer, ServerName, UnixTime};
use serde::Serialize;
use sha2::{Digest, Sha256};
use x509_parser::extensions::GeneralName;

use super::error::CertificateError;

/// SHA-256 fingerprint of DER bytes as lowercase colon-separated hex.
pub fn fingerprint_of(der: &[u8]) -> String {
    let digest = Sha256::digest(der);
    digest
        .iter()
        .map(|b| hex::encode([*b]))
        .collect::<Vec<_>>()
        .join(":")
}

/// Canonical form used for fingerprint comparisons.
pub fn normalize_fingerprint(fingerprint: &str) -> String {
    fingerprint.trim().to_ascii_lowercase()
}

/// A certificate presented by a destination.
///
/// Owned by the session that observed it. Only `common_name` and
/// `alt_names` are ever overwritten, when building the substitute that is
/// presented to the client.
#[derive(Debug, Clone, Serialize)]
pub struct Certificate {
    #[serde(skip)]
    der: CertificateDer<'static>,
    fingerprint: String,
    common_name: Option<String>,
    alt_names: Vec<String>,
    is_local_pki: bool,
}

impl Certificate {
    /// Parse an end-entity certificate.
    pub fn from_der(der: CertificateDer<'static>, is_local_pki: bool) -> Result<Self, CertificateError> {
        let (_, parsed) = x509_parser::parse_x509_certificate(der.as_ref())
            .map_err(|e| CertificateError::Parse(e.to_string()))?;

        let common_name = parsed
            .subject()
            .iter_common_name()
            .next()
            .and_then(|cn| cn.as_str().ok())
            .map(str::to_string);

        let alt_names = match parsed.subject_alternative_name() {
            Ok(Some(san)) => san
                .value
                .general_names
                .iter()
                .filter_map(|name| match name {
                    GeneralName::DNSName(dns) => Some(dns.to_string()),
                    GeneralName::IPAddress(bytes) => ip_from_bytes(bytes),
                    _ => None,
                })
                .collect(),
            _ => Vec::new(),
        };

        Ok(Self {
            fingerprint: fingerprint_of(der.as_ref()),
            der,
            common_name,
            alt_names,
            is_local_pki,
        })
    }

    /// Build from the chain a destination presented during the handshake.
    ///
    /// `is_local_pki` is set when the chain verifies against `local_pki`.
    pub fn from_peer_chain(
        chain: &[CertificateDer<'_>],
        server_name: &ServerName<'_>,
        local_pki: Option<&LocalPki>,
    ) -> Result<Self, CertificateError> {
        let (end_entity, intermediates) = chain.split_first().ok_or(CertificateError::EmptyChain)?;
        let is_local_pki = local_pki
            .map(|pki| pki.verifies(end_entity, intermediates, server_name))
            .unwrap_or(false);
        Self::from_der(end_entity.clone().into_owned(), is_local_pki)
    }

    /// DER encoding.
    pub fn der(&self) -> &CertificateDer<'static> {
        &self.der
    }

    /// SHA-256 fingerprint (lowercase colon hex).
    pub fn fingerprint(&self) -> &str {
        &self.fingerprint
    }

    /// Subject common name, if any.
    pub fn common_name(&self) -> Option<&str> {
        self.common_name.as_deref()
    }

    /// Subject alternative names (DNS names and IP addresses).
    pub fn alt_names(&self) -> &[String] {
        &self.alt_names
    }

    /// Whether the chain verified against a configured local trust anchor.
    pub fn is_local_pki(&self) -> bool {
        self.is_local_pki
    }
}

fn ip_from_bytes(bytes: &[u8]) -> Option<String> {
    match bytes.len() {
        4 => {
            let octets: [u8; 4] = bytes.try_into().ok()?;
            Some(std::net::Ipv4Addr::from(octets).to_string())
        }
        16 => {
            let octets: [u8; 16] = bytes.try_into().ok()?;
            Some(std::net::Ipv6Addr::from(octets).to_string())
        }
        _ => None,
    }
}

/// Locally configured trust anchors (enterprise or private CAs).
///
/// A destination whose chain verifies against one of these anchors can be
/// trusted without consulting notaries.
#[derive(Debug, Clone)]
pub struct LocalPki {
    verifier: Arc<WebPkiServerVerifier>,
    anchors: usize,
}

impl LocalPki {
    /// Build from DER-encoded anchor certificates.
    pub fn from_anchors(anchors: Vec<CertificateDer<'static>>) -> Result<Self, CertificateError> {
        let mut roots = RootCertStore::empty();
        let (added, _ignored) = roots.add_parsable_certificates(anchors);
        if added == 0 {
            return Err(CertificateError::NoAnchors);
        }

        let provider = Arc::new(rustls::crypto::aws_lc_rs::default_provider());
        let verifier = WebPkiServerVerifier::builder_with_provider(Arc::new(roots), provider)
            .build()
            .map_err(|e| CertificateError::Verifier(e.to_string()))?;

        Ok(Self {
            verifier,
            anchors: added,
        })
    }

    /// Load every certificate from a list of PEM files.
    pub fn from_pem_files<P: AsRef<Path>>(paths: &[P]) -> Result<Self, CertificateError> {
        let mut anchors = Vec::new();
        for path in paths {
            let path = path.as_ref();
            let pem = std::fs::read(path).map_err(|e| CertificateError::ReadAnchor {
                path: path.to_path_buf(),
                source: e,
            })?;
            anchors.extend(parse_pem_certificates(&pem)?);
        }
        Self::from_anchors(anchors)
    }

    /// Number of usable anchors.
    pub fn anchor_count(&self) -> usize {
        self.anchors
    }

    /// Whether the chain verifies against a local anchor for `server_name`.
    pub fn verifies(
        &self,
        end_entity: &CertificateDer<'_>,
        intermediates: &[CertificateDer<'_>],
        server_name: &ServerName<'_>,
    ) -> bool {
        self.verifier
            .verify_server_cert(end_entity, intermediates, server_name, &[], UnixTime::now())
            .is_ok()
    }
}

/// Parse every `CERTIFICATE` block in a PEM document.
pub fn parse_pem_certificates(pem: &[u8]) -> Result<Vec<CertificateDer<'static>>, CertificateError> {
    let mut reader = std::io::BufReader::new(pem);
    let certs = rustls_pemfile::certs(&mut reader)
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| CertificateError::Parse(e.to_string()))?;
    if certs.is_empty() {
        return Err(CertificateError::Parse(
            "no CERTIFICATE block found".to_string(),
        ));
    }
    Ok(certs)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rcgen::{BasicConstraints, CertificateParams, IsCa, Issuer, KeyPair};

    fn self_signed(names: &[&str]) -> CertificateDer<'static> {
        let names: Vec<String> = names.iter().map(|s| s.to_string()).collect();
        let params = CertificateParams::new(names).unwrap();
        let key = KeyPair::generate().unwrap();
        let cert = params.self_signed(&key).unwrap();
        cert.der().clone()
    }

    /// Returns (anchor PEM, leaf DER signed by that anchor).
    fn private_ca_and_leaf(host: &str) -> (String, CertificateDer<'static>) {
        let ca_key = KeyPair::generate().unwrap();
        let mut ca_params = CertificateParams::new(Vec::<String>::new()).unwrap();
        ca_params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
        let ca_cert = ca_params.clone().self_signed(&ca_key).unwrap();

        let issuer = Issuer::from_params(&ca_params, &ca_key);
        let leaf_key = KeyPair::generate().unwrap();
        let leaf = CertificateParams::new(vec![host.to_string()])
            .unwrap()
            .signed_by(&leaf_key, &issuer)
            .unwrap();
        (ca_cert.pem(), leaf.der().clone())
    }

    #[test]
    fn test_fingerprint_format() {
        let fp = fingerprint_of(b"hello");
        // 32 bytes -> 32 hex pairs joined by 31 colons
        assert_eq!(fp.len(), 32 * 2 + 31);
        assert!(fp.starts_with("2c:f2:4d:ba"));
        assert_eq!(fp, fp.to_ascii_lowercase());
    }

    #[test]
    fn test_normalize_fingerprint() {
        assert_eq!(normalize_fingerprint(" AB:CD "), "ab:cd");
    }

    #[test]
    fn test_from_der_extracts_names() {
        let der = self_signed(&["example.com", "www.example.com"]);
        let cert = Certificate::from_der(der.clone(), false).unwrap();

        assert_eq!(cert.fingerprint(), fingerprint_of(der.as_ref()));
        assert_eq!(
            cert.alt_names(),
            &["example.com".to_string(), "www.example.com".to_string()]
        );
        assert!(!cert.is_local_pki());
    }

    #[test]
    fn test_from_der_rejects_garbage() {
        let result = Certificate::from_der(CertificateDer::from(vec![1, 2, 3]), false);
        assert!(matches!(result, Err(CertificateError::Parse(_))));
    }

    #[test]
    fn test_local_pki_detects_anchor() {
        let (pem, der) = private_ca_and_leaf("intranet.corp");
        let dir = tempfile::tempdir().unwrap();
        let anchor_path = dir.path().join("anchor.pem");
        std::fs::write(&anchor_path, pem).unwrap();

        let pki = LocalPki::from_pem_files(&[&anchor_path]).unwrap();
        assert_eq!(pki.anchor_count(), 1);

        let name = ServerName::try_from("intranet.corp").unwrap();
        let local = Certificate::from_peer_chain(&[der], &name, Some(&pki)).unwrap();
        assert!(local.is_local_pki());

        let (_, other) = private_ca_and_leaf("intranet.corp");
        let foreign = Certificate::from_peer_chain(&[other], &name, Some(&pki)).unwrap();
        assert!(!foreign.is_local_pki());
    }

    #[test]
    fn test_from_peer_chain_empty() {
        let name = ServerName::try_from("example.com").unwrap();
        assert!(matches!(
            Certificate::from_peer_chain(&[], &name, None),
            Err(CertificateError::EmptyChain)
        ));
    }
}
