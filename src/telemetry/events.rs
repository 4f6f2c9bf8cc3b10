//! Audit event types for structured logging.
//!
//! These events are logged to syslog with the `VANTAGE` tag so every trust
//! decision the proxy makes leaves an audit trail.

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::proxy::policy::PassthroughReason;
use crate::trust::{TrustOutcome, ValidationDetail};

/// Audit events for security logging.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum AuditEvent {
    /// Proxy started listening.
    ProxyStart {
        /// Listen address.
        listen: String,
        /// Number of enabled notaries.
        notaries: usize,
        /// Process ID.
        pid: u32,
    },

    /// Proxy stopped.
    ProxyStop {
        /// Uptime in seconds.
        uptime_sec: u64,
    },

    /// A target certificate was trusted.
    ConnectionTrusted {
        /// Session id.
        session: String,
        /// `host:port`.
        target: String,
        /// Observed fingerprint.
        fingerprint: String,
        /// How trust was established.
        outcome: TrustOutcome,
        /// Per-notary answers, or the cache or local PKI line.
        details: Vec<ValidationDetail>,
    },

    /// A target certificate was not trusted. The client is still connected,
    /// but sees a certificate that will fail its own verification.
    ConnectionDistrusted {
        /// Session id.
        session: String,
        /// `host:port`.
        target: String,
        /// Observed fingerprint.
        fingerprint: String,
        /// Why trust was withheld.
        outcome: TrustOutcome,
        /// Per-notary answers.
        details: Vec<ValidationDetail>,
    },

    /// An intercepted connection failed before relaying.
    ConnectionFailed {
        /// Session id.
        session: String,
        /// `host:port`.
        target: String,
        /// Stable error code.
        kind: String,
        /// Error message.
        message: String,
    },

    /// A connection was tunnelled without interception.
    ConnectionPassthrough {
        /// `host:port`.
        target: String,
        /// Why interception was skipped.
        reason: PassthroughReason,
    },

    /// A newly trusted fingerprint was cached.
    CacheStore {
        /// `host:port`.
        target: String,
        /// Cached fingerprint.
        fingerprint: String,
    },

    /// A notary bundle was imported.
    NotaryBundleImport {
        /// Notary name.
        name: String,
        /// Number of physical hosts.
        hosts: usize,
    },

    /// A background bundle refresh pass finished.
    NotaryBundleRefresh {
        /// Names refreshed.
        refreshed: Vec<String>,
        /// Names whose refresh failed.
        failed: Vec<String>,
    },
}

/// Wrapper for serializing events with timestamp.
#[derive(Debug, Clone, Serialize)]
pub struct TimestampedEvent<'a> {
    /// ISO8601 timestamp.
    #[serde(rename = "ts")]
    pub timestamp: DateTime<Utc>,

    /// The actual event (flattened into this struct).
    #[serde(flatten)]
    pub event: &'a AuditEvent,
}

impl AuditEvent {
    /// Wrap this event with a timestamp for serialization.
    pub fn with_timestamp(&self) -> TimestampedEvent<'_> {
        TimestampedEvent {
            timestamp: Utc::now(),
            event: self,
        }
    }

    /// The snake_case event name.
    pub fn name(&self) -> &'static str {
        match self {
            AuditEvent::ProxyStart { .. } => "proxy_start",
            AuditEvent::ProxyStop { .. } => "proxy_stop",
            AuditEvent::ConnectionTrusted { .. } => "connection_trusted",
            AuditEvent::ConnectionDistrusted { .. } => "connection_distrusted",
            AuditEvent::ConnectionFailed { .. } => "connection_failed",
            AuditEvent::ConnectionPassthrough { .. } => "connection_passthrough",
            AuditEvent::CacheStore { .. } => "cache_store",
            AuditEvent::NotaryBundleImport { .. } => "notary_bundle_import",
            AuditEvent::NotaryBundleRefresh { .. } => "notary_bundle_refresh",
        }
    }
}
