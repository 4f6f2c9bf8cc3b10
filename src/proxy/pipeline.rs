//! Per-connection interception pipeline.
//!
//! One pipeline owns one intercepted connection from the tunnel request to
//! the end of the relay:
//!
//! ```text
//! Start -> TargetConnecting -> TargetHandshaking -> Validating
//!       -> ClientHandshaking -> Relaying -> Closed
//! ```
//!
//! `Failed` is reachable from every non-terminal state. A failure drops
//! whatever streams are open, is logged with the destination and error
//! kind, and goes no further than the task that owns the pipeline.
//!
//! The target is contacted first. Its certificate is validated, and only
//! then does the client get a substitute: a leaf minted by the local CA
//! naming the destination host when trusted, or `"Invalid Certificate"`
//! with no SAN when not, which any client will refuse.

use std::fmt;
use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;

use rustls::sign::CertifiedKey;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio_rustls::TlsConnector;
use tokio_rustls::client::TlsStream;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::error::PipelineError;
use super::relay::{self, RelayStats};
use super::tls::{LeafCertCache, create_client_acceptor, domain_to_server_name};
use super::verdicts::VerdictBoard;
use crate::net::{Destination, TargetConnector, UpstreamProxy};
use crate::telemetry::{AuditEvent, AuditLogger};
use crate::trust::{Certificate, CertificateValidator, LocalPki, ValidationResult};

/// Common name of the substitute presented for untrusted destinations.
pub const INVALID_CERTIFICATE_CN: &str = "Invalid Certificate";

/// Status line written on a raw interception stream before the client
/// handshake.
pub const TUNNEL_ESTABLISHED: &[u8] = b"HTTP/1.0 200 Connection established\r\n\r\n";

/// Default deadline for everything before relaying starts.
pub const DEFAULT_CONNECTION_TIMEOUT: Duration = Duration::from_secs(30);

/// Per-proxy switches that affect every pipeline.
#[derive(Debug, Clone)]
pub struct PipelineSettings {
    /// Trust certificates that chain to a local anchor without asking anyone.
    pub private_pki_exempt: bool,
    /// Upstream proxy for target connections.
    pub upstream: Option<UpstreamProxy>,
    /// Deadline for each phase before relaying.
    pub connection_timeout: Duration,
}

impl Default for PipelineSettings {
    fn default() -> Self {
        Self {
            private_pki_exempt: true,
            upstream: None,
            connection_timeout: DEFAULT_CONNECTION_TIMEOUT,
        }
    }
}

/// Everything pipelines share. Built once per proxy.
pub struct PipelineContext {
    /// Opens target connections.
    pub connector: TargetConnector,
    /// Judges target certificates.
    pub validator: CertificateValidator,
    /// Substitute certificates.
    pub leaf_certs: LeafCertCache,
    /// TLS origination toward targets.
    pub target_tls: TlsConnector,
    /// Local anchors for the private PKI exemption.
    pub local_pki: Option<LocalPki>,
    /// Where verdicts are published.
    pub verdicts: Arc<VerdictBoard>,
    /// Audit trail.
    pub audit: Arc<AuditLogger>,
    /// Switches.
    pub settings: PipelineSettings,
}

impl fmt::Debug for PipelineContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PipelineContext")
            .field("settings", &self.settings)
            .field("leaf_certs", &self.leaf_certs)
            .finish()
    }
}

/// Where a pipeline is.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PipelineState {
    /// Created, nothing opened yet.
    Start,
    /// Opening TCP to the target.
    TargetConnecting,
    /// TLS handshake with the target.
    TargetHandshaking,
    /// Waiting on the validator.
    Validating,
    /// TLS handshake with the client using the substitute.
    ClientHandshaking,
    /// Bytes flowing.
    Relaying,
    /// Relay finished.
    Closed,
    /// Carries the error kind.
    Failed(&'static str),
}

impl PipelineState {
    /// Whether no further transition is possible.
    pub fn is_terminal(self) -> bool {
        matches!(self, PipelineState::Closed | PipelineState::Failed(_))
    }
}

/// A target connection whose certificate has been judged.
pub struct EstablishedTarget {
    stream: TlsStream<TcpStream>,
    result: ValidationResult,
    substitute: Arc<CertifiedKey>,
}

impl EstablishedTarget {
    /// The verdict on the target's certificate.
    pub fn result(&self) -> &ValidationResult {
        &self.result
    }
}

impl fmt::Debug for EstablishedTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EstablishedTarget")
            .field("target", &self.result.target())
            .field("trusted", &self.result.trusted())
            .finish()
    }
}

/// State machine for one intercepted connection.
pub struct ConnectionPipeline {
    ctx: Arc<PipelineContext>,
    destination: Destination,
    session: Uuid,
    state: PipelineState,
}

impl fmt::Debug for ConnectionPipeline {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionPipeline")
            .field("destination", &self.destination)
            .field("session", &self.session)
            .field("state", &self.state)
            .finish()
    }
}

impl ConnectionPipeline {
    /// Create a pipeline for a tunnel request to `destination`.
    pub fn new(ctx: Arc<PipelineContext>, destination: Destination) -> Self {
        Self {
            ctx,
            destination,
            session: Uuid::new_v4(),
            state: PipelineState::Start,
        }
    }

    /// Current state.
    pub fn state(&self) -> PipelineState {
        self.state
    }

    /// Session id used in logs and audit events.
    pub fn session(&self) -> Uuid {
        self.session
    }

    /// The requested destination.
    pub fn destination(&self) -> &Destination {
        &self.destination
    }

    /// Drive a raw interception stream to completion.
    ///
    /// Connects and validates first, then writes the tunnel status line,
    /// terminates TLS toward `client` and relays. On failure the client is
    /// dropped without a status line.
    pub async fn run<S>(mut self, mut client: S) -> Result<RelayStats, PipelineError>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        let established = self.establish().await?;

        let status = async {
            client.write_all(TUNNEL_ESTABLISHED).await?;
            client.flush().await
        };
        if let Err(e) = status.await {
            return Err(self.fail(PipelineError::ClientIo(e)));
        }

        self.complete(established, client).await
    }

    /// Connect to the target, handshake, validate and prepare a substitute.
    ///
    /// Runs under the connection deadline.
    pub async fn establish(&mut self) -> Result<EstablishedTarget, PipelineError> {
        let deadline = self.ctx.settings.connection_timeout;
        let steps = tokio::time::timeout(deadline, self.establish_steps()).await;
        let outcome = match steps {
            Ok(outcome) => outcome,
            Err(_) => Err(PipelineError::Timeout(self.destination.target())),
        };
        outcome.map_err(|e| self.fail(e))
    }

    /// Terminate TLS toward `client` with the substitute and relay.
    pub async fn complete<S>(
        &mut self,
        established: EstablishedTarget,
        client: S,
    ) -> Result<RelayStats, PipelineError>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        self.state = PipelineState::ClientHandshaking;
        let EstablishedTarget {
            stream: target,
            substitute,
            ..
        } = established;

        let acceptor = create_client_acceptor(substitute).map_err(|e| self.fail(e.into()))?;
        let deadline = self.ctx.settings.connection_timeout;
        let client = match tokio::time::timeout(deadline, acceptor.accept(client)).await {
            Ok(Ok(client)) => client,
            Ok(Err(e)) => {
                return Err(self.fail(PipelineError::ClientTlsHandshake(e.to_string())));
            }
            Err(_) => return Err(self.fail(PipelineError::Timeout(self.destination.target()))),
        };

        self.state = PipelineState::Relaying;
        debug!("[{}] Relaying {}", self.session, self.destination);
        let stats = relay::shuffle(client, target).await;
        self.state = PipelineState::Closed;
        Ok(stats)
    }

    async fn establish_steps(&mut self) -> Result<EstablishedTarget, PipelineError> {
        let ctx = self.ctx.clone();
        let target = self.destination.target();

        self.state = PipelineState::TargetConnecting;
        let connected = ctx
            .connector
            .connect(&self.destination, ctx.settings.upstream.as_ref())
            .await?;
        // Behind a proxy the TCP peer is the proxy, not the destination.
        let observed_ip: Option<IpAddr> =
            (!connected.via_proxy).then(|| connected.observed_ip());

        self.state = PipelineState::TargetHandshaking;
        let tls_failure = |message: String| PipelineError::TargetTlsHandshake {
            target: target.clone(),
            message,
        };
        let server_name =
            domain_to_server_name(&self.destination.host).map_err(|e| tls_failure(e.to_string()))?;
        let stream = ctx
            .target_tls
            .connect(server_name.clone(), connected.stream)
            .await
            .map_err(|e| tls_failure(e.to_string()))?;
        let chain = stream
            .get_ref()
            .1
            .peer_certificates()
            .ok_or_else(|| tls_failure("no peer certificate".to_string()))?;
        let certificate = Certificate::from_peer_chain(chain, &server_name, ctx.local_pki.as_ref())
            .map_err(|e| tls_failure(e.to_string()))?;
        debug!(
            "[{}] {} presented {}",
            self.session,
            target,
            certificate.fingerprint()
        );

        self.state = PipelineState::Validating;
        let result = ctx
            .validator
            .validate(
                &self.destination,
                observed_ip,
                certificate,
                ctx.settings.private_pki_exempt,
            )
            .await;

        let substitute = if result.trusted() {
            let host = self.destination.host.clone();
            ctx.leaf_certs.get_or_issue(&host, &[host.clone()])?
        } else {
            ctx.leaf_certs.get_or_issue(INVALID_CERTIFICATE_CN, &[])?
        };

        self.report(&result);
        Ok(EstablishedTarget {
            stream,
            result,
            substitute,
        })
    }

    fn report(&self, result: &ValidationResult) {
        let fingerprint = result.certificate().fingerprint().to_string();
        if result.trusted() {
            info!(
                "[{}] Trusted {} ({:?})",
                self.session,
                result.target(),
                result.outcome()
            );
            self.ctx.audit.log(AuditEvent::ConnectionTrusted {
                session: self.session.to_string(),
                target: result.target().to_string(),
                fingerprint,
                outcome: result.outcome(),
                details: result.details().to_vec(),
            });
        } else {
            warn!(
                "[{}] Not trusting {} ({:?})",
                self.session,
                result.target(),
                result.outcome()
            );
            self.ctx.audit.log(AuditEvent::ConnectionDistrusted {
                session: self.session.to_string(),
                target: result.target().to_string(),
                fingerprint,
                outcome: result.outcome(),
                details: result.details().to_vec(),
            });
        }
        self.ctx.verdicts.publish(result.clone());
    }

    fn fail(&mut self, error: PipelineError) -> PipelineError {
        let kind = error.kind();
        self.state = PipelineState::Failed(kind);
        warn!(
            "[{}] Connection to {} failed ({}): {}",
            self.session, self.destination, kind, error
        );
        self.ctx.audit.log(AuditEvent::ConnectionFailed {
            session: self.session.to_string(),
            target: self.destination.target(),
            kind: kind.to_string(),
            message: error.to_string(),
        });
        error
    }
}
