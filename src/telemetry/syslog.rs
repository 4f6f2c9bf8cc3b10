//! Syslog integration for audit logging.
//!
//! All audit events are logged to syslog with the `VANTAGE` tag. The logger
//! is created once at startup and handed to every component that needs it
//! as an `Arc<AuditLogger>`.

use std::sync::Mutex;

use syslog::{Facility, Formatter3164};
use tracing::{debug, error};

use super::error::TelemetryError;
use super::events::AuditEvent;

/// Syslog tag for all audit events.
pub const SYSLOG_TAG: &str = "VANTAGE";

enum Sink {
    /// Local syslog daemon.
    Syslog(Mutex<syslog::Logger<syslog::LoggerBackend, Formatter3164>>),
    /// Kept in memory (for testing).
    Memory(Mutex<Vec<String>>),
    /// Discarded.
    Null,
}

/// Audit logger that writes structured JSON events to syslog.
pub struct AuditLogger {
    sink: Sink,
}

impl std::fmt::Debug for AuditLogger {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let kind = match self.sink {
            Sink::Syslog(_) => "syslog",
            Sink::Memory(_) => "memory",
            Sink::Null => "null",
        };
        f.debug_struct("AuditLogger").field("sink", &kind).finish()
    }
}

impl AuditLogger {
    /// Create a new audit logger connected to syslog.
    ///
    /// Uses Unix socket connection to local syslog daemon.
    pub fn new() -> Result<Self, TelemetryError> {
        let formatter = Formatter3164 {
            facility: Facility::LOG_USER,
            hostname: None,
            process: SYSLOG_TAG.to_string(),
            pid: std::process::id(),
        };

        let writer = syslog::unix(formatter).map_err(|e| {
            TelemetryError::SyslogConnection(format!("Failed to connect to syslog: {}", e))
        })?;

        debug!("Connected to syslog with tag '{}'", SYSLOG_TAG);
        Ok(Self {
            sink: Sink::Syslog(Mutex::new(writer)),
        })
    }

    /// Create a null audit logger that discards all events.
    pub fn new_null() -> Self {
        Self { sink: Sink::Null }
    }

    /// Create a logger that keeps serialized events in memory.
    pub fn new_memory() -> Self {
        Self {
            sink: Sink::Memory(Mutex::new(Vec::new())),
        }
    }

    /// Log an audit event.
    ///
    /// The event is serialized to JSON with an ISO8601 timestamp.
    /// If this is a null logger, the event is silently discarded.
    pub fn log(&self, event: AuditEvent) {
        if matches!(self.sink, Sink::Null) {
            return;
        }

        let json = match serde_json::to_string(&event.with_timestamp()) {
            Ok(json) => json,
            Err(e) => {
                error!("Failed to serialize audit event: {}", e);
                return;
            }
        };

        match &self.sink {
            Sink::Syslog(writer) => match writer.lock() {
                Ok(mut writer) => {
                    if let Err(e) = writer.info(&json) {
                        error!("Failed to write to syslog: {}", e);
                    }
                }
                Err(e) => {
                    error!("Failed to acquire syslog writer lock: {}", e);
                }
            },
            Sink::Memory(events) => {
                if let Ok(mut events) = events.lock() {
                    events.push(json.clone());
                }
            }
            Sink::Null => {}
        }
        debug!("Logged audit event: {}", json);
    }

    /// Events recorded by a memory logger, oldest first.
    pub fn recorded(&self) -> Vec<String> {
        match &self.sink {
            Sink::Memory(events) => events.lock().map(|e| e.clone()).unwrap_or_default(),
            _ => Vec::new(),
        }
    }

    /// Check if this is a null logger.
    pub fn is_null(&self) -> bool {
        matches!(self.sink, Sink::Null)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_syslog_tag() {
        assert_eq!(SYSLOG_TAG, "VANTAGE");
    }

    #[test]
    fn test_null_logger_discards() {
        let logger = AuditLogger::new_null();
        assert!(logger.is_null());
        logger.log(AuditEvent::ProxyStop { uptime_sec: 1 });
        assert!(logger.recorded().is_empty());
    }

    #[test]
    fn test_memory_logger_records() {
        let logger = AuditLogger::new_memory();
        logger.log(AuditEvent::ProxyStop { uptime_sec: 42 });

        let recorded = logger.recorded();
        assert_eq!(recorded.len(), 1);
        assert!(recorded[0].contains("\"event\":\"proxy_stop\""));
        assert!(recorded[0].contains("\"uptime_sec\":42"));
    }

    // Integration test - requires syslog daemon
    #[test]
    #[ignore = "Requires running syslog daemon"]
    fn test_logger_creation() {
        let logger = AuditLogger::new();
        assert!(logger.is_ok());
    }
}
