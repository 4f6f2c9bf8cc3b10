//! Telemetry and audit logging for vantage.
//!
//! This module provides structured logging to syslog with the `VANTAGE` tag.
//! Every trust decision and every failed interception is logged.
//!
//! # Architecture
//!
//! - **Audit logging** (syslog): Trust decisions go to syslog, never stdout/stderr
//! - **Debug logging** (tracing): Development logs go to stderr via `tracing`
//! - These are completely separate concerns
//!
//! # Usage
//!
//! ```ignore
//! use vantage::telemetry::{AuditEvent, AuditLogger};
//! use std::sync::Arc;
//!
//! let audit = Arc::new(AuditLogger::new()?);
//! audit.log(AuditEvent::ProxyStop { uptime_sec: 60 });
//! ```
//!
//! # Event Format
//!
//! Events are logged as JSON with an ISO8601 timestamp:
//!
//! ```json
//! {"ts":"2026-01-07T14:32:01Z","event":"connection_trusted","session":"...","target":"example.com:443","fingerprint":"ab:cd:...","outcome":"quorum_confirmed"}
//! ```

mod error;
mod events;
mod syslog;

pub use error::TelemetryError;
pub use events::{AuditEvent, TimestampedEvent};
pub use syslog::{AuditLogger, SYSLOG_TAG};
