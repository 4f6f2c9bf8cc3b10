//! Local signing authority for substitute certificates.
//!
//! The CA is generated once and kept in the data directory so the user only
//! has to install it in their client trust store once. It mints the
//! short-lived leaf certificates the proxy presents to clients.
//!
//! # Security Model
//!
//! - CA private key is stored with 0600 permissions
//! - CA directory has 0700 permissions
//! - Leaf certificates have short validity (24 hours)
//!
//! # Example
//!
//! ```ignore
//! use vantage::ca::LocalCa;
//!
//! let ca = LocalCa::load_or_generate(Path::new("/home/me/.local/share/vantage/ca"))?;
//! let leaf = ca.issue("api.example.com", &["api.example.com".to_string()])?;
//! ```

pub mod error;

pub use error::CaError;

use std::fs::{self, OpenOptions};
use std::io::Write;
use std::net::IpAddr;
use std::os::unix::fs::{OpenOptionsExt, PermissionsExt};
use std::path::{Path, PathBuf};

use rcgen::{
    BasicConstraints, CertificateParams, DistinguishedName, DnType, DnValue, IsCa, Issuer,
    KeyPair, KeyUsagePurpose, SanType,
};
use rustls_pki_types::{CertificateDer, PrivateKeyDer, PrivatePkcs8KeyDer};
use time::{Duration, OffsetDateTime};
use tracing::{debug, info};

/// Validity of minted leaf certificates.
const LEAF_VALIDITY: Duration = Duration::hours(24);

/// Validity of a freshly generated CA.
const CA_VALIDITY_DAYS: i64 = 3650;

/// Backdating applied to `not_before` to absorb clock skew.
const CLOCK_SKEW: Duration = Duration::minutes(5);

const CA_CERT_FILE: &str = "ca.crt";
const CA_KEY_FILE: &str = "ca.key";

/// A leaf certificate minted by the CA.
#[derive(Debug)]
pub struct IssuedLeaf {
    /// Leaf followed by the CA certificate.
    pub chain: Vec<CertificateDer<'static>>,
    /// Private key of the leaf.
    pub key: PrivateKeyDer<'static>,
}

/// Persistent local CA.
pub struct LocalCa {
    /// Directory the CA lives in, if persisted.
    dir: Option<PathBuf>,
    /// The CA key pair (for signing leaves).
    ca_key_pair: KeyPair,
    /// The CA certificate parameters (for creating an Issuer).
    ca_params: CertificateParams,
    /// PEM-encoded CA certificate.
    ca_cert_pem: String,
    /// DER-encoded CA certificate, appended to every leaf chain.
    ca_cert_der: CertificateDer<'static>,
}

impl std::fmt::Debug for LocalCa {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LocalCa").field("dir", &self.dir).finish()
    }
}

impl LocalCa {
    /// Load the CA from `dir`, generating and saving one on first run.
    pub fn load_or_generate(dir: &Path) -> Result<Self, CaError> {
        let cert_path = dir.join(CA_CERT_FILE);
        let key_path = dir.join(CA_KEY_FILE);

        if cert_path.exists() && key_path.exists() {
            return Self::load(dir);
        }

        info!("Generating local CA in {:?}", dir);
        fs::create_dir_all(dir).map_err(|e| CaError::CreateDir {
            path: dir.to_path_buf(),
            source: e,
        })?;
        fs::set_permissions(dir, fs::Permissions::from_mode(0o700))
            .map_err(CaError::Permissions)?;

        let (ca_key_pair, ca_params, ca_cert_pem, ca_cert_der) = generate_ca()?;

        fs::write(&cert_path, &ca_cert_pem).map_err(CaError::WriteFile)?;
        write_restricted_file(&key_path, &ca_key_pair.serialize_pem())?;
        debug!("Local CA written: cert={:?}, key={:?}", cert_path, key_path);

        Ok(Self {
            dir: Some(dir.to_path_buf()),
            ca_key_pair,
            ca_params,
            ca_cert_pem,
            ca_cert_der,
        })
    }

    fn load(dir: &Path) -> Result<Self, CaError> {
        let cert_path = dir.join(CA_CERT_FILE);
        let key_path = dir.join(CA_KEY_FILE);

        let ca_cert_pem = fs::read_to_string(&cert_path).map_err(CaError::ReadFile)?;
        let key_pem = fs::read_to_string(&key_path).map_err(CaError::ReadFile)?;

        let ca_key_pair = KeyPair::from_pem(&key_pem).map_err(|e| CaError::Load {
            path: key_path.clone(),
            message: e.to_string(),
        })?;
        let ca_params =
            CertificateParams::from_ca_cert_pem(&ca_cert_pem).map_err(|e| CaError::Load {
                path: cert_path.clone(),
                message: e.to_string(),
            })?;
        let ca_cert_der = rustls_pemfile::certs(&mut ca_cert_pem.as_bytes())
            .next()
            .and_then(Result::ok)
            .ok_or_else(|| CaError::Load {
                path: cert_path.clone(),
                message: "no CERTIFICATE block".to_string(),
            })?;

        debug!("Loaded local CA from {:?}", dir);
        Ok(Self {
            dir: Some(dir.to_path_buf()),
            ca_key_pair,
            ca_params,
            ca_cert_pem,
            ca_cert_der,
        })
    }

    /// Generate a CA that is never written to disk (for testing).
    pub fn ephemeral() -> Result<Self, CaError> {
        let (ca_key_pair, ca_params, ca_cert_pem, ca_cert_der) = generate_ca()?;
        Ok(Self {
            dir: None,
            ca_key_pair,
            ca_params,
            ca_cert_pem,
            ca_cert_der,
        })
    }

    /// Get CA certificate as PEM string.
    pub fn cert_pem(&self) -> &str {
        &self.ca_cert_pem
    }

    /// Get CA certificate as DER.
    pub fn cert_der(&self) -> &CertificateDer<'static> {
        &self.ca_cert_der
    }

    /// Path of the CA certificate, if persisted.
    pub fn cert_path(&self) -> Option<PathBuf> {
        self.dir.as_ref().map(|d| d.join(CA_CERT_FILE))
    }

    /// Path of the CA key, if persisted.
    pub fn key_path(&self) -> Option<PathBuf> {
        self.dir.as_ref().map(|d| d.join(CA_KEY_FILE))
    }

    /// Write the CA certificate (never the key) to `path`.
    pub fn export(&self, path: &Path) -> Result<(), CaError> {
        fs::write(path, &self.ca_cert_pem).map_err(CaError::WriteFile)
    }

    /// Mint a 24-hour leaf certificate.
    ///
    /// `alt_names` may be empty, in which case the leaf carries no SAN
    /// extension and will not match any host name.
    pub fn issue(&self, common_name: &str, alt_names: &[String]) -> Result<IssuedLeaf, CaError> {
        debug!("Issuing leaf for CN={} SAN={:?}", common_name, alt_names);

        let leaf_key_pair = KeyPair::generate_for(&rcgen::PKCS_ECDSA_P384_SHA384)
            .map_err(|e| CaError::KeyGeneration(e.to_string()))?;

        let mut params = CertificateParams::default();
        let mut dn = DistinguishedName::new();
        dn.push(
            DnType::CommonName,
            DnValue::Utf8String(common_name.to_string()),
        );
        params.distinguished_name = dn;

        params.subject_alt_names = alt_names
            .iter()
            .map(|name| match name.parse::<IpAddr>() {
                Ok(ip) => Ok(SanType::IpAddress(ip)),
                Err(_) => name
                    .as_str()
                    .try_into()
                    .map(SanType::DnsName)
                    .map_err(|_| CaError::InvalidName(name.clone())),
            })
            .collect::<Result<Vec<_>, _>>()?;

        let now = OffsetDateTime::now_utc();
        params.not_before = now - CLOCK_SKEW;
        params.not_after = now + LEAF_VALIDITY;

        let issuer = Issuer::from_params(&self.ca_params, &self.ca_key_pair);
        let leaf = params
            .signed_by(&leaf_key_pair, &issuer)
            .map_err(|e| CaError::Signing(e.to_string()))?;

        Ok(IssuedLeaf {
            chain: vec![leaf.der().clone(), self.ca_cert_der.clone()],
            key: PrivatePkcs8KeyDer::from(leaf_key_pair.serialize_der()).into(),
        })
    }
}

fn generate_ca() -> Result<(KeyPair, CertificateParams, String, CertificateDer<'static>), CaError> {
    // Generate CA key pair using ECDSA P-384
    let ca_key_pair = KeyPair::generate_for(&rcgen::PKCS_ECDSA_P384_SHA384)
        .map_err(|e| CaError::KeyGeneration(e.to_string()))?;

    let mut ca_params = CertificateParams::default();

    let mut dn = DistinguishedName::new();
    dn.push(
        DnType::CommonName,
        DnValue::Utf8String("vantage Local CA".to_string()),
    );
    dn.push(
        DnType::OrganizationName,
        DnValue::Utf8String("vantage".to_string()),
    );
    ca_params.distinguished_name = dn;

    ca_params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
    ca_params.key_usages = vec![KeyUsagePurpose::KeyCertSign, KeyUsagePurpose::CrlSign];

    let now = OffsetDateTime::now_utc();
    ca_params.not_before = now - CLOCK_SKEW;
    ca_params.not_after = now + Duration::days(CA_VALIDITY_DAYS);

    let ca_cert = ca_params
        .clone()
        .self_signed(&ca_key_pair)
        .map_err(|e| CaError::CertGeneration(e.to_string()))?;

    Ok((ca_key_pair, ca_params, ca_cert.pem(), ca_cert.der().clone()))
}

/// Write a file with restricted permissions (0600).
fn write_restricted_file(path: &Path, content: &str) -> Result<(), CaError> {
    let mut file = OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(true)
        .mode(0o600)
        .open(path)
        .map_err(CaError::WriteFile)?;

    file.write_all(content.as_bytes())
        .map_err(CaError::WriteFile)?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ca_generation_persists() {
        let dir = tempfile::tempdir().unwrap();
        let ca_dir = dir.path().join("ca");
        let ca = LocalCa::load_or_generate(&ca_dir).unwrap();

        assert!(ca.cert_path().unwrap().exists());
        assert!(ca.key_path().unwrap().exists());
        assert!(ca.cert_pem().contains("-----BEGIN CERTIFICATE-----"));
    }

    #[test]
    fn test_reload_keeps_same_ca() {
        let dir = tempfile::tempdir().unwrap();
        let first = LocalCa::load_or_generate(dir.path()).unwrap();
        let second = LocalCa::load_or_generate(dir.path()).unwrap();
        assert_eq!(first.cert_pem(), second.cert_pem());

        // A reloaded CA can still sign.
        let leaf = second.issue("example.com", &["example.com".into()]).unwrap();
        assert_eq!(leaf.chain.len(), 2);
        assert_eq!(&leaf.chain[1], first.cert_der());
    }

    #[test]
    fn test_restricted_permissions() {
        let dir = tempfile::tempdir().unwrap();
        let ca_dir = dir.path().join("ca");
        let ca = LocalCa::load_or_generate(&ca_dir).unwrap();

        let key_mode = fs::metadata(ca.key_path().unwrap())
            .unwrap()
            .permissions()
            .mode();
        assert_eq!(key_mode & 0o777, 0o600, "Key file should have 0600 permissions");

        let dir_mode = fs::metadata(&ca_dir).unwrap().permissions().mode();
        assert_eq!(dir_mode & 0o777, 0o700, "CA directory should have 0700 permissions");
    }

    #[test]
    fn test_issue_trusted_leaf() {
        let ca = LocalCa::ephemeral().unwrap();
        let leaf = ca
            .issue("example.com", &["example.com".to_string(), "10.0.0.1".to_string()])
            .unwrap();

        let (_, parsed) = x509_parser::parse_x509_certificate(leaf.chain[0].as_ref()).unwrap();
        let cn = parsed.subject().iter_common_name().next().unwrap();
        assert_eq!(cn.as_str().unwrap(), "example.com");
        let san = parsed.subject_alternative_name().unwrap().unwrap();
        assert_eq!(san.value.general_names.len(), 2);
    }

    #[test]
    fn test_issue_invalid_leaf_has_no_san() {
        let ca = LocalCa::ephemeral().unwrap();
        let leaf = ca.issue("Invalid Certificate", &[]).unwrap();

        let (_, parsed) = x509_parser::parse_x509_certificate(leaf.chain[0].as_ref()).unwrap();
        let cn = parsed.subject().iter_common_name().next().unwrap();
        assert_eq!(cn.as_str().unwrap(), "Invalid Certificate");
        assert!(parsed.subject_alternative_name().unwrap().is_none());
    }

    #[test]
    fn test_export_writes_certificate_only() {
        let dir = tempfile::tempdir().unwrap();
        let ca = LocalCa::ephemeral().unwrap();
        let out = dir.path().join("vantage-ca.pem");
        ca.export(&out).unwrap();

        let exported = fs::read_to_string(&out).unwrap();
        assert_eq!(exported, ca.cert_pem());
        assert!(!exported.contains("PRIVATE KEY"));
    }
}
