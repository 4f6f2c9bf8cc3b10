//! Talking to notaries.
//!
//! A notary is asked whether it sees the same certificate for a target as
//! we do:
//!
//! ```text
//! POST /target/example.com+443 HTTP/1.1
//! Content-Type: application/x-www-form-urlencoded
//!
//! fingerprint=ab%3Acd%3A...
//! ```
//!
//! A `200` whose `fingerprintList` contains our fingerprint is a
//! confirmation, a `409` is a conflict. Anything else means the notary did
//! not give a usable answer.
//!
//! The connection to the notary is authenticated by pinning the fingerprint
//! of its certificate from the bundle. No CA is involved.

use std::net::IpAddr;

use async_trait::async_trait;
use bytes::Bytes;
use http_body_util::{BodyExt, Full, Limited};
use hyper::header::{CONTENT_TYPE, HOST};
use hyper::{Method, Request, StatusCode, Uri};
use hyper_util::rt::TokioIo;
use serde::Deserialize;
use tokio_rustls::TlsConnector;
use tracing::{debug, trace};

use super::bundle::PhysicalNotary;
use super::certificate::normalize_fingerprint;
use super::error::{BundleError, NotaryError};
use super::registry::BundleFetcher;
use crate::net::{Destination, TargetConnector, UpstreamProxy};
use crate::proxy::tls::{create_pinned_connector, create_tls_connector, domain_to_server_name};

/// Largest notary response body accepted.
const MAX_RESPONSE_BODY: usize = 64 * 1024;

/// Largest bundle document accepted.
const MAX_BUNDLE_BODY: usize = 1024 * 1024;

/// What one notary is asked about.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NotaryRequest {
    /// Target host.
    pub host: String,
    /// Target port.
    pub port: u16,
    /// IP the proxy connected to, for diagnostics.
    pub observed_ip: Option<IpAddr>,
    /// Fingerprint the proxy observed.
    pub fingerprint: String,
}

/// A notary's answer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NotaryVerdict {
    /// The notary observed the same certificate.
    Confirmed,
    /// The notary observed a different certificate.
    Conflict,
}

/// Sends a single query to a single notary host.
#[async_trait]
pub trait NotaryTransport: Send + Sync {
    /// Ask `notary` about `request`. Errors count as absent votes.
    async fn query(
        &self,
        notary: &PhysicalNotary,
        request: &NotaryRequest,
    ) -> Result<NotaryVerdict, NotaryError>;
}

#[derive(Debug, Deserialize)]
struct NotaryResponse {
    #[serde(rename = "fingerprintList", default)]
    fingerprint_list: Vec<FingerprintObservation>,
}

#[derive(Debug, Deserialize)]
struct FingerprintObservation {
    fingerprint: String,
}

/// Map a notary HTTP response to a verdict.
pub fn interpret_response(
    status: StatusCode,
    body: &[u8],
    fingerprint: &str,
) -> Result<NotaryVerdict, NotaryError> {
    match status {
        StatusCode::OK => {
            let response: NotaryResponse = serde_json::from_slice(body)
                .map_err(|e| NotaryError::MalformedResponse(e.to_string()))?;
            let wanted = normalize_fingerprint(fingerprint);
            if response
                .fingerprint_list
                .iter()
                .any(|o| normalize_fingerprint(&o.fingerprint) == wanted)
            {
                Ok(NotaryVerdict::Confirmed)
            } else {
                Ok(NotaryVerdict::Conflict)
            }
        }
        StatusCode::CONFLICT => Ok(NotaryVerdict::Conflict),
        other => Err(NotaryError::Status(other.as_u16())),
    }
}

/// Percent-encode a value for an `application/x-www-form-urlencoded` body.
fn form_encode(value: &str) -> String {
    let mut out = String::with_capacity(value.len() * 3);
    for byte in value.bytes() {
        match byte {
            b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'-' | b'_' | b'.' | b'*' => {
                out.push(byte as char)
            }
            b' ' => out.push('+'),
            _ => out.push_str(&format!("%{:02X}", byte)),
        }
    }
    out
}

/// Path of the query resource for a target.
pub fn target_path(host: &str, port: u16) -> String {
    format!("/target/{}+{}", host, port)
}

/// Real transport: HTTPS with a pinned certificate.
#[derive(Debug, Clone)]
pub struct HttpsNotaryTransport {
    connector: TargetConnector,
    upstream: Option<UpstreamProxy>,
}

impl HttpsNotaryTransport {
    /// Create a transport that connects with `connector`, optionally through
    /// an upstream proxy.
    pub fn new(connector: TargetConnector, upstream: Option<UpstreamProxy>) -> Self {
        Self {
            connector,
            upstream,
        }
    }
}

#[async_trait]
impl NotaryTransport for HttpsNotaryTransport {
    async fn query(
        &self,
        notary: &PhysicalNotary,
        request: &NotaryRequest,
    ) -> Result<NotaryVerdict, NotaryError> {
        trace!(
            "Asking {}:{} about {}:{} (observed at {:?})",
            notary.host, notary.ssl_port, request.host, request.port, request.observed_ip
        );

        let tls = create_pinned_connector(&notary.pinned_key_fingerprint)
            .map_err(|e| NotaryError::Tls(e.to_string()))?;
        let body = format!("fingerprint={}", form_encode(&request.fingerprint));
        let http_request = Request::builder()
            .method(Method::POST)
            .uri(target_path(&request.host, request.port))
            .header(HOST, notary.host.as_str())
            .header(CONTENT_TYPE, "application/x-www-form-urlencoded")
            .body(Full::new(Bytes::from(body)))
            .map_err(|e| NotaryError::Http(e.to_string()))?;

        let (status, body) = https_exchange(
            &self.connector,
            self.upstream.as_ref(),
            &tls,
            &Destination::new(notary.host.clone(), notary.ssl_port),
            http_request,
            MAX_RESPONSE_BODY,
        )
        .await?;

        let verdict = interpret_response(status, &body, &request.fingerprint);
        debug!(
            "Notary {} answered {} -> {:?}",
            notary.host, status, verdict
        );
        verdict
    }
}

/// Fetches bundles from their published HTTPS location using system roots.
#[derive(Debug, Clone)]
pub struct HttpsBundleFetcher {
    connector: TargetConnector,
    upstream: Option<UpstreamProxy>,
}

impl HttpsBundleFetcher {
    /// Create a fetcher.
    pub fn new(connector: TargetConnector, upstream: Option<UpstreamProxy>) -> Self {
        Self {
            connector,
            upstream,
        }
    }
}

#[async_trait]
impl BundleFetcher for HttpsBundleFetcher {
    async fn fetch(&self, url: &str) -> Result<Vec<u8>, BundleError> {
        let fail = |message: String| BundleError::Fetch {
            url: url.to_string(),
            message,
        };

        let uri = url.parse::<Uri>().map_err(|e| fail(e.to_string()))?;
        if uri.scheme_str() != Some("https") {
            return Err(fail("only https bundle locations are supported".to_string()));
        }
        let host = uri
            .host()
            .ok_or_else(|| fail("missing host".to_string()))?
            .trim_start_matches('[')
            .trim_end_matches(']')
            .to_string();
        let port = uri.port_u16().unwrap_or(443);
        let path = uri
            .path_and_query()
            .map(|pq| pq.as_str().to_string())
            .unwrap_or_else(|| "/".to_string());

        let tls = create_tls_connector().map_err(|e| fail(e.to_string()))?;
        let request = Request::builder()
            .method(Method::GET)
            .uri(path)
            .header(HOST, host.as_str())
            .body(Full::new(Bytes::new()))
            .map_err(|e| fail(e.to_string()))?;

        let (status, body) = https_exchange(
            &self.connector,
            self.upstream.as_ref(),
            &tls,
            &Destination::new(host, port),
            request,
            MAX_BUNDLE_BODY,
        )
        .await
        .map_err(|e| fail(e.to_string()))?;

        if status != StatusCode::OK {
            return Err(fail(format!("unexpected status {}", status)));
        }
        Ok(body.to_vec())
    }
}

/// One HTTP/1.1 request over a fresh TLS connection.
async fn https_exchange(
    connector: &TargetConnector,
    upstream: Option<&UpstreamProxy>,
    tls: &TlsConnector,
    destination: &Destination,
    request: Request<Full<Bytes>>,
    body_limit: usize,
) -> Result<(StatusCode, Bytes), NotaryError> {
    let connected = connector.connect(destination, upstream).await?;
    let server_name =
        domain_to_server_name(&destination.host).map_err(|e| NotaryError::Tls(e.to_string()))?;
    let stream = tls
        .connect(server_name, connected.stream)
        .await
        .map_err(|e| NotaryError::Tls(e.to_string()))?;

    let (mut sender, conn) = hyper::client::conn::http1::handshake(TokioIo::new(stream))
        .await
        .map_err(|e| NotaryError::Http(e.to_string()))?;
    let conn_task = tokio::spawn(async move {
        if let Err(e) = conn.await {
            trace!("Notary connection closed with error: {}", e);
        }
    });

    let result = async {
        let response = sender
            .send_request(request)
            .await
            .map_err(|e| NotaryError::Http(e.to_string()))?;
        let status = response.status();
        let body = Limited::new(response.into_body(), body_limit)
            .collect()
            .await
            .map_err(|e| NotaryError::Http(e.to_string()))?
            .to_bytes();
        Ok((status, body))
    }
    .await;

    conn_task.abort();
    result
}
