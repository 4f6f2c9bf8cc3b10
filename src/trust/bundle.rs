//! Notary bundle format.
//!
//! A bundle is a small JSON document published by a notary operator that
//! names one logical notary and the physical hosts serving it:
//!
//! ```json
//! {
//!   "version": 1,
//!   "name": "notary.example.org",
//!   "region": "eu",
//!   "bundle_location": "https://notary.example.org/notary.bundle",
//!   "hosts": [
//!     {"host": "notary.example.org", "http_port": 80, "ssl_port": 443,
//!      "certificate": "-----BEGIN CERTIFICATE-----\n..."}
//!   ]
//! }
//! ```
//!
//! The PEM certificate of each host is reduced to its fingerprint, which the
//! transport pins when connecting.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::certificate::{fingerprint_of, parse_pem_certificates};
use super::error::BundleError;

/// The only bundle format version understood.
pub const BUNDLE_VERSION: u64 = 1;

/// One physical host serving a notary.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PhysicalNotary {
    /// Host name.
    pub host: String,
    /// Plain HTTP port, used only to recognise the notary as an endpoint.
    pub http_port: u16,
    /// HTTPS port queries are sent to.
    pub ssl_port: u16,
    /// SHA-256 fingerprint of the notary's own certificate.
    pub pinned_key_fingerprint: String,
}

/// A named notary with its physical hosts.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NotaryRecord {
    /// Display name, unique within the registry.
    pub name: String,
    /// Bundle format version the record was imported from.
    pub version: u64,
    /// Optional region label.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub region: Option<String>,
    /// Where to fetch updated bundles from.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bundle_location: Option<String>,
    /// Whether the notary takes part in quorums.
    pub enabled: bool,
    /// When the record was imported or last refreshed.
    pub updated_at: DateTime<Utc>,
    /// Physical hosts.
    pub notaries: Vec<PhysicalNotary>,
}

impl NotaryRecord {
    /// Whether `host:port` is one of this record's endpoints.
    pub fn serves(&self, host: &str, port: u16) -> bool {
        self.notaries.iter().any(|n| {
            n.host.eq_ignore_ascii_case(host) && (n.ssl_port == port || n.http_port == port)
        })
    }
}

#[derive(Debug, Deserialize)]
struct BundleDocument {
    name: String,
    #[serde(default)]
    region: Option<String>,
    #[serde(default)]
    bundle_location: Option<String>,
    #[serde(default)]
    hosts: Vec<BundleHost>,
}

#[derive(Debug, Deserialize)]
struct BundleHost {
    host: String,
    http_port: u16,
    ssl_port: u16,
    certificate: String,
}

/// Parse a bundle document into an enabled [`NotaryRecord`].
///
/// The version is checked before anything else so an unknown format fails
/// with [`BundleError::UnsupportedBundleVersion`] no matter what else it
/// contains.
pub fn parse_bundle(bytes: &[u8]) -> Result<NotaryRecord, BundleError> {
    let value: serde_json::Value = serde_json::from_slice(bytes)?;

    let version = value
        .get("version")
        .and_then(serde_json::Value::as_u64)
        .ok_or_else(|| BundleError::Invalid("missing numeric 'version'".to_string()))?;
    if version != BUNDLE_VERSION {
        return Err(BundleError::UnsupportedBundleVersion(version));
    }

    let document: BundleDocument = serde_json::from_value(value)?;
    if document.name.trim().is_empty() {
        return Err(BundleError::Invalid("empty 'name'".to_string()));
    }
    if document.hosts.is_empty() {
        return Err(BundleError::Invalid(format!(
            "bundle '{}' lists no hosts",
            document.name
        )));
    }

    let mut notaries = Vec::with_capacity(document.hosts.len());
    for host in document.hosts {
        let certs = parse_pem_certificates(host.certificate.as_bytes()).map_err(|e| {
            BundleError::Invalid(format!("certificate for {}: {}", host.host, e))
        })?;
        notaries.push(PhysicalNotary {
            pinned_key_fingerprint: fingerprint_of(certs[0].as_ref()),
            host: host.host,
            http_port: host.http_port,
            ssl_port: host.ssl_port,
        });
    }

    Ok(NotaryRecord {
        name: document.name,
        version,
        region: document.region,
        bundle_location: document.bundle_location,
        enabled: true,
        updated_at: Utc::now(),
        notaries,
    })
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    pub(crate) fn sample_pem() -> String {
        let key = rcgen::KeyPair::generate().unwrap();
        rcgen::CertificateParams::new(vec!["notary.example.org".to_string()])
            .unwrap()
            .self_signed(&key)
            .unwrap()
            .pem()
    }

    pub(crate) fn sample_bundle(version: u64, name: &str) -> String {
        serde_json::json!({
            "version": version,
            "name": name,
            "region": "eu",
            "bundle_location": "https://notary.example.org/notary.bundle",
            "hosts": [{
                "host": "notary.example.org",
                "http_port": 80,
                "ssl_port": 443,
                "certificate": sample_pem(),
            }]
        })
        .to_string()
    }

    #[test]
    fn test_parse_valid_bundle() {
        let record = parse_bundle(sample_bundle(1, "Example Notary").as_bytes()).unwrap();
        assert_eq!(record.name, "Example Notary");
        assert_eq!(record.version, 1);
        assert_eq!(record.region.as_deref(), Some("eu"));
        assert!(record.enabled);
        assert_eq!(record.notaries.len(), 1);

        let host = &record.notaries[0];
        assert_eq!(host.host, "notary.example.org");
        assert_eq!(host.ssl_port, 443);
        assert_eq!(host.pinned_key_fingerprint.split(':').count(), 32);
    }

    #[test]
    fn test_unsupported_version_fails_fast() {
        let result = parse_bundle(sample_bundle(2, "Future").as_bytes());
        assert!(matches!(
            result,
            Err(BundleError::UnsupportedBundleVersion(2))
        ));

        // Version is checked before the rest of the document.
        let result = parse_bundle(br#"{"version": 3}"#);
        assert!(matches!(
            result,
            Err(BundleError::UnsupportedBundleVersion(3))
        ));
    }

    #[test]
    fn test_missing_hosts_is_invalid() {
        let result = parse_bundle(br#"{"version": 1, "name": "Empty"}"#);
        assert!(matches!(result, Err(BundleError::Invalid(_))));
    }

    #[test]
    fn test_bad_certificate_is_invalid() {
        let doc = serde_json::json!({
            "version": 1,
            "name": "Broken",
            "hosts": [{"host": "n", "http_port": 80, "ssl_port": 443, "certificate": "nope"}]
        });
        let result = parse_bundle(doc.to_string().as_bytes());
        assert!(matches!(result, Err(BundleError::Invalid(_))));
    }

    #[test]
    fn test_record_serves_endpoints() {
        let record = parse_bundle(sample_bundle(1, "Example").as_bytes()).unwrap();
        assert!(record.serves("notary.example.org", 443));
        assert!(record.serves("NOTARY.example.org", 80));
        assert!(!record.serves("notary.example.org", 8443));
        assert!(!record.serves("example.org", 443));
    }
}
