//! Interception proxy.
//!
//! This module provides the local TLS interception proxy:
//! - HTTP CONNECT front end on a loopback port
//! - Passthrough policy for notaries, whitelisted hosts and private addresses
//! - The per-connection pipeline: connect, handshake, validate, substitute,
//!   relay
//! - Substitute certificate minting and caching
//! - A verdict board exposing every trust decision
//!
//! # Architecture
//!
//! ```text
//!  client ──CONNECT──▶ ProxyServer ──▶ InterceptionPolicy
//!                                         │ intercept
//!                                         ▼
//!                                  ConnectionPipeline
//!                      ┌──────────────────┼───────────────────┐
//!                      ▼                  ▼                   ▼
//!               TargetConnector   CertificateValidator   LeafCertCache
//!                 (race + TLS)     (PKI, cache, quorum)  (substitute)
//!                      │                                      │
//!                      └────────────── relay ◀────────────────┘
//! ```
//!
//! # Example
//!
//! ```ignore
//! use vantage::proxy::{ConnectionPipeline, PipelineContext};
//!
//! let pipeline = ConnectionPipeline::new(ctx, "example.com:443".parse()?);
//! let stats = pipeline.run(client_stream).await?;
//! ```

pub mod connect;
pub mod error;
pub mod pipeline;
pub mod policy;
pub mod relay;
pub mod server;
pub mod tls;
pub mod verdicts;

// Re-export main types for convenient access
pub use error::{PipelineError, ProxyError};
pub use pipeline::{
    ConnectionPipeline, EstablishedTarget, PipelineContext, PipelineSettings, PipelineState,
};
pub use policy::{InterceptionPolicy, PassthroughReason, PolicyDecision};
pub use relay::{shuffle, RelayStats};
pub use server::{ProxyConfig, ProxyServer};
pub use tls::{create_target_connector, LeafCertCache};
pub use verdicts::VerdictBoard;
