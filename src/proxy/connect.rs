//! HTTP CONNECT method handling.
//!
//! The flow for each CONNECT request is:
//!
//! 1. Client sends: `CONNECT api.example.com:443 HTTP/1.1`
//! 2. The interception policy decides whether to intercept
//! 3. Passthrough: connect, return `200` and splice TCP after the upgrade
//! 4. Intercept: connect, handshake and validate *before* answering, so an
//!    unreachable target becomes `502 Bad Gateway` instead of a dead tunnel
//! 5. After the `200` the pipeline terminates TLS toward the client with the
//!    substitute certificate and relays
//!
//! Anything other than CONNECT gets `405 Method Not Allowed`: this proxy
//! only handles TLS.

use std::sync::Arc;

use bytes::Bytes;
use http_body_util::{combinators::BoxBody, BodyExt, Empty, Full};
use hyper::body::Incoming;
use hyper::header::{HeaderValue, ALLOW};
use hyper::{Method, Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use tracing::{debug, info, warn};

use super::error::ProxyError;
use super::pipeline::{ConnectionPipeline, PipelineContext};
use super::policy::{InterceptionPolicy, PolicyDecision};
use super::relay;
use crate::net::Destination;
use crate::telemetry::AuditEvent;

/// Response type served by the CONNECT front end.
pub type ProxyResponse = Response<BoxBody<Bytes, hyper::Error>>;

/// Handle HTTP CONNECT request for HTTPS tunneling.
pub async fn handle_connect(
    req: Request<Incoming>,
    ctx: Arc<PipelineContext>,
    policy: Arc<InterceptionPolicy>,
) -> Result<ProxyResponse, ProxyError> {
    let destination = match connect_destination(&req) {
        Ok(destination) => destination,
        Err(e) => {
            debug!("Rejecting CONNECT: {}", e);
            return Ok(text_response(StatusCode::BAD_REQUEST, e.to_string()));
        }
    };

    debug!("CONNECT request to {}", destination);

    match policy.evaluate(&destination) {
        PolicyDecision::Passthrough(reason) => {
            info!("Passing {} through ({:?})", destination, reason);
            ctx.audit.log(AuditEvent::ConnectionPassthrough {
                target: destination.target(),
                reason,
            });
            passthrough(req, ctx, destination).await
        }
        PolicyDecision::Intercept => intercept(req, ctx, destination).await,
    }
}

/// Answer a non-CONNECT request.
pub fn handle_other(req: &Request<Incoming>) -> ProxyResponse {
    debug!("Refusing {} {}", req.method(), req.uri());
    let mut response = text_response(
        StatusCode::METHOD_NOT_ALLOWED,
        "Only CONNECT is supported".to_string(),
    );
    response
        .headers_mut()
        .insert(ALLOW, HeaderValue::from_static("CONNECT"));
    response
}

/// Validate the target, then hand the upgraded stream to the pipeline.
async fn intercept(
    req: Request<Incoming>,
    ctx: Arc<PipelineContext>,
    destination: Destination,
) -> Result<ProxyResponse, ProxyError> {
    let mut pipeline = ConnectionPipeline::new(ctx, destination);
    let established = match pipeline.establish().await {
        Ok(established) => established,
        Err(e) => {
            return Ok(text_response(
                StatusCode::BAD_GATEWAY,
                format!("{} ({})", e, e.kind()),
            ));
        }
    };

    tokio::spawn(async move {
        match hyper::upgrade::on(req).await {
            Ok(upgraded) => {
                let session = pipeline.session();
                if let Ok(stats) = pipeline.complete(established, TokioIo::new(upgraded)).await {
                    debug!(
                        "[{}] Closed ({} bytes up, {} bytes down)",
                        session, stats.client_to_target, stats.target_to_client
                    );
                }
            }
            Err(e) => {
                warn!("HTTP upgrade failed for {}: {}", pipeline.destination(), e);
            }
        }
    });

    Ok(established_response())
}

/// Splice TCP without interception.
async fn passthrough(
    req: Request<Incoming>,
    ctx: Arc<PipelineContext>,
    destination: Destination,
) -> Result<ProxyResponse, ProxyError> {
    let connected = match ctx
        .connector
        .connect(&destination, ctx.settings.upstream.as_ref())
        .await
    {
        Ok(connected) => connected,
        Err(e) => {
            warn!("Passthrough to {} failed: {}", destination, e);
            return Ok(text_response(
                StatusCode::BAD_GATEWAY,
                format!("{} ({})", e, e.kind()),
            ));
        }
    };

    tokio::spawn(async move {
        match hyper::upgrade::on(req).await {
            Ok(upgraded) => {
                let stats = relay::shuffle(TokioIo::new(upgraded), connected.stream).await;
                debug!(
                    "Passthrough to {} closed ({} bytes up, {} bytes down)",
                    destination, stats.client_to_target, stats.target_to_client
                );
            }
            Err(e) => {
                warn!("HTTP upgrade failed for {}: {}", destination, e);
            }
        }
    });

    Ok(established_response())
}

/// Extract the destination from a CONNECT request's authority.
fn connect_destination<B>(req: &Request<B>) -> Result<Destination, ProxyError> {
    let authority = req
        .uri()
        .authority()
        .ok_or_else(|| ProxyError::InvalidConnect("Missing authority in CONNECT request".into()))?;
    authority
        .as_str()
        .parse::<Destination>()
        .map_err(|e| ProxyError::InvalidConnect(e.to_string()))
}

/// Whether `req` is a CONNECT request.
pub fn is_connect<B>(req: &Request<B>) -> bool {
    req.method() == Method::CONNECT
}

/// Create an empty response body.
fn empty_body() -> BoxBody<Bytes, hyper::Error> {
    Empty::<Bytes>::new()
        .map_err(|never| match never {})
        .boxed()
}

/// Create a response body with content.
fn full_body(content: String) -> BoxBody<Bytes, hyper::Error> {
    Full::new(Bytes::from(content))
        .map_err(|never| match never {})
        .boxed()
}

fn established_response() -> ProxyResponse {
    let mut response = Response::new(empty_body());
    *response.status_mut() = StatusCode::OK;
    response
}

fn text_response(status: StatusCode, message: String) -> ProxyResponse {
    let mut response = Response::new(full_body(message));
    *response.status_mut() = status;
    response.headers_mut().insert(
        hyper::header::CONTENT_TYPE,
        HeaderValue::from_static("text/plain"),
    );
    response
}

#[cfg(test)]
mod tests {
    use super::*;

    fn connect_request(authority: &str) -> Request<()> {
        Request::builder()
            .method(Method::CONNECT)
            .uri(authority)
            .body(())
            .unwrap()
    }

    #[test]
    fn test_connect_destination_with_port() {
        let dest = connect_destination(&connect_request("api.example.com:8443")).unwrap();
        assert_eq!(dest, Destination::new("api.example.com", 8443));
    }

    #[test]
    fn test_connect_destination_ipv6() {
        let dest = connect_destination(&connect_request("[::1]:443")).unwrap();
        assert_eq!(dest, Destination::new("::1", 443));
    }

    #[test]
    fn test_connect_destination_missing_authority() {
        let req = Request::builder()
            .method(Method::CONNECT)
            .uri("/")
            .body(())
            .unwrap();
        assert!(matches!(
            connect_destination(&req),
            Err(ProxyError::InvalidConnect(_))
        ));
    }

    #[test]
    fn test_is_connect() {
        assert!(is_connect(&connect_request("example.com:443")));
        let get = Request::builder().uri("/").body(()).unwrap();
        assert!(!is_connect(&get));
    }

    #[test]
    fn test_text_response() {
        let response = text_response(StatusCode::BAD_GATEWAY, "down".to_string());
        assert_eq!(response.status(), StatusCode::BAD_GATEWAY);
        assert_eq!(response.headers()[hyper::header::CONTENT_TYPE], "text/plain");
    }
}
