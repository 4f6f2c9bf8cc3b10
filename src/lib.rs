//! vantage: local TLS interception proxy with notary-quorum trust
//!
//! Clients point their HTTPS proxy at vantage. For every tunnel it connects
//! to the destination itself, takes the certificate the destination presents,
//! and asks a configured set of independent notaries whether they observe the
//! same certificate from their vantage points. The client then receives a
//! certificate minted by a local CA: one naming the host when the quorum
//! agrees, and one that no client will accept when it does not.
//!
//! # Security Model
//!
//! The model is **fail-closed**: a single dissenting notary distrusts the
//! certificate, and silence from every notary is not agreement.
//!
//! # Architecture
//!
//! - **Net**: Target connection, address racing and upstream proxy tunnels
//! - **Trust**: Fingerprint cache, notary registry, quorum and validator
//! - **Proxy**: CONNECT front end, interception pipeline and relay
//! - **CA**: Local certificate authority for substitute certificates
//! - **Config**: Hierarchical TOML configuration
//! - **Telemetry**: Structured syslog logging for audit trails

#![warn(clippy::all)]
#![warn(missing_docs)]

pub mod ca;
pub mod cli;
pub mod cli_handler;
pub mod config;
pub mod net;
pub mod proxy;
pub mod telemetry;
pub mod trust;
