//! HTTP CONNECT proxy server.
//!
//! This module provides the main proxy server that:
//! - Listens for client connections on a loopback TCP port
//! - Handles HTTP CONNECT and feeds intercepted tunnels to the pipeline
//! - Refreshes notary bundles in the background
//!
//! # Architecture
//!
//! The proxy uses hyper's HTTP/1.1 server with upgrade support for CONNECT.
//! Each connection is handled in a separate Tokio task.
//!
//! # Example
//!
//! ```ignore
//! use vantage::proxy::{ProxyConfig, ProxyServer};
//!
//! let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);
//! let server = ProxyServer::bind(config, shutdown_rx).await?;
//! println!("listening on {}", server.local_addr()?);
//! server.run().await?;
//!
//! // To shutdown:
//! shutdown_tx.send(true)?;
//! ```

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use hyper::body::Incoming;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::Request;
use hyper_util::rt::TokioIo;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tracing::{debug, info, warn};

use super::connect::{handle_connect, handle_other, is_connect, ProxyResponse};
use super::error::ProxyError;
use super::pipeline::PipelineContext;
use super::policy::InterceptionPolicy;
use crate::telemetry::AuditEvent;
use crate::trust::{BundleFetcher, NotaryRegistry};

/// Default interval between notary bundle refresh passes.
pub const DEFAULT_REFRESH_INTERVAL: Duration = Duration::from_secs(24 * 60 * 60);

/// Configuration for the proxy server.
#[derive(Clone)]
pub struct ProxyConfig {
    /// Address to listen on.
    pub listen: SocketAddr,
    /// Shared pipeline state.
    pub ctx: Arc<PipelineContext>,
    /// Which destinations bypass interception.
    pub policy: Arc<InterceptionPolicy>,
    /// Configured notaries.
    pub registry: Arc<NotaryRegistry>,
    /// Fetcher for bundle refresh. `None` disables background refresh.
    pub fetcher: Option<Arc<dyn BundleFetcher>>,
    /// Time between refresh passes.
    pub refresh_interval: Duration,
}

/// The main proxy server.
pub struct ProxyServer {
    config: ProxyConfig,
    listener: TcpListener,
    /// Shutdown signal receiver.
    shutdown_rx: watch::Receiver<bool>,
}

impl ProxyServer {
    /// Bind the listening socket.
    pub async fn bind(
        config: ProxyConfig,
        shutdown_rx: watch::Receiver<bool>,
    ) -> Result<Self, ProxyError> {
        let listener = TcpListener::bind(config.listen).await?;
        Ok(Self {
            config,
            listener,
            shutdown_rx,
        })
    }

    /// The address actually bound (useful with port 0).
    pub fn local_addr(&self) -> Result<SocketAddr, ProxyError> {
        Ok(self.listener.local_addr()?)
    }

    /// Run the proxy server.
    ///
    /// Returns when the shutdown signal is received.
    pub async fn run(self) -> Result<(), ProxyError> {
        let started = Instant::now();
        let listen = self.local_addr()?;
        let notaries = self
            .config
            .registry
            .snapshot()
            .iter()
            .filter(|r| r.enabled)
            .count();

        info!("Proxy listening on {} with {} enabled notaries", listen, notaries);
        self.config.ctx.audit.log(AuditEvent::ProxyStart {
            listen: listen.to_string(),
            notaries,
            pid: std::process::id(),
        });

        let refresh_handle = self.spawn_bundle_refresh();

        // Accept loop
        let mut shutdown_rx = self.shutdown_rx.clone();
        loop {
            tokio::select! {
                accept_result = self.listener.accept() => {
                    match accept_result {
                        Ok((stream, addr)) => {
                            debug!("Accepted connection from {}", addr);
                            self.spawn_connection_handler(stream);
                        }
                        Err(e) => {
                            warn!("Failed to accept connection: {}", e);
                        }
                    }
                }
                _ = shutdown_rx.changed() => {
                    if *shutdown_rx.borrow() {
                        info!("Proxy shutting down");
                        break;
                    }
                }
            }
        }

        if let Some(handle) = refresh_handle {
            handle.abort();
        }

        self.config.ctx.audit.log(AuditEvent::ProxyStop {
            uptime_sec: started.elapsed().as_secs(),
        });
        Ok(())
    }

    /// Spawn a task to handle a single connection.
    fn spawn_connection_handler(&self, stream: TcpStream) {
        let ctx = self.config.ctx.clone();
        let policy = self.config.policy.clone();

        tokio::spawn(async move {
            if let Err(e) = handle_connection(stream, ctx, policy).await {
                // Don't log connection resets as errors - they're common
                let err_str = e.to_string();
                if err_str.contains("connection reset")
                    || err_str.contains("broken pipe")
                    || err_str.contains("Connection reset")
                {
                    debug!("Connection ended: {}", e);
                } else {
                    warn!("Connection error: {}", e);
                }
            }
        });
    }

    /// Spawn a task to periodically refresh notary bundles.
    fn spawn_bundle_refresh(&self) -> Option<tokio::task::JoinHandle<()>> {
        let fetcher = self.config.fetcher.clone()?;
        let registry = self.config.registry.clone();
        let audit = self.config.ctx.audit.clone();
        let period = self.config.refresh_interval;
        let mut shutdown_rx = self.shutdown_rx.clone();

        Some(tokio::spawn(async move {
            loop {
                let delay = jittered(period, jitter_seed());
                debug!("Next notary refresh in {:?}", delay);
                tokio::select! {
                    _ = tokio::time::sleep(delay) => {
                        let report = registry.refresh(fetcher.as_ref()).await;
                        if report.refreshed.is_empty() && report.failed.is_empty() {
                            continue;
                        }
                        info!(
                            "Notary refresh: {} refreshed, {} failed",
                            report.refreshed.len(),
                            report.failed.len()
                        );
                        audit.log(AuditEvent::NotaryBundleRefresh {
                            refreshed: report.refreshed,
                            failed: report.failed,
                        });
                    }
                    _ = shutdown_rx.changed() => {
                        if *shutdown_rx.borrow() {
                            break;
                        }
                    }
                }
            }
        }))
    }
}

/// Stretch `period` by up to half of itself so proxies started together
/// do not refresh in lockstep. A 24 h period lands in [24 h, 36 h].
fn jittered(period: Duration, seed: u64) -> Duration {
    let spread = u64::try_from(period.as_millis() / 2).unwrap_or(u64::MAX);
    let extra = if spread == 0 { 0 } else { seed % (spread + 1) };
    period + Duration::from_millis(extra)
}

fn jitter_seed() -> u64 {
    let (high, _) = uuid::Uuid::new_v4().as_u64_pair();
    high
}

/// Handle a single client connection.
async fn handle_connection(
    stream: TcpStream,
    ctx: Arc<PipelineContext>,
    policy: Arc<InterceptionPolicy>,
) -> Result<(), ProxyError> {
    let io = TokioIo::new(stream);

    // Create the service that handles each request
    let service = service_fn(move |req: Request<Incoming>| {
        let ctx = ctx.clone();
        let policy = policy.clone();

        async move { proxy_request(req, ctx, policy).await }
    });

    // Serve HTTP/1.1 with support for upgrades (needed for CONNECT)
    http1::Builder::new()
        .preserve_header_case(true)
        .title_case_headers(true)
        .serve_connection(io, service)
        .with_upgrades()
        .await
        .map_err(ProxyError::from)
}

/// Process a single proxy request.
async fn proxy_request(
    req: Request<Incoming>,
    ctx: Arc<PipelineContext>,
    policy: Arc<InterceptionPolicy>,
) -> Result<ProxyResponse, ProxyError> {
    if is_connect(&req) {
        handle_connect(req, ctx, policy).await
    } else {
        Ok(handle_other(&req))
    }
}
