//! Notary quorum.
//!
//! Every enabled notary host is asked at once. The verdict is unanimous
//! among those that answer: a single conflict is never outvoted, and
//! silence is an absent vote rather than a "no". When nobody answers there
//! is nothing to trust.

use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinSet;
use tracing::{debug, warn};

use super::certificate::Certificate;
use super::error::NotaryError;
use super::registry::NotaryRegistry;
use super::result::{TrustOutcome, ValidationDetail, ValidationResult};
use super::transport::{NotaryRequest, NotaryTransport, NotaryVerdict};
use crate::net::Destination;

/// Default per-notary query timeout.
pub const DEFAULT_QUERY_TIMEOUT: Duration = Duration::from_secs(10);

/// What one notary host contributed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NotaryOutcome {
    /// Same fingerprint observed.
    Confirmed,
    /// Different fingerprint observed.
    Conflict,
    /// No usable answer.
    Unreachable(String),
}

impl From<Result<NotaryVerdict, NotaryError>> for NotaryOutcome {
    fn from(result: Result<NotaryVerdict, NotaryError>) -> Self {
        match result {
            Ok(NotaryVerdict::Confirmed) => NotaryOutcome::Confirmed,
            Ok(NotaryVerdict::Conflict) => NotaryOutcome::Conflict,
            Err(e) => NotaryOutcome::Unreachable(e.to_string()),
        }
    }
}

impl NotaryOutcome {
    fn detail(&self, source: String) -> ValidationDetail {
        let (trusted, explanation) = match self {
            NotaryOutcome::Confirmed => (true, "fingerprint confirmed".to_string()),
            NotaryOutcome::Conflict => (
                false,
                "notary observed a different certificate".to_string(),
            ),
            NotaryOutcome::Unreachable(reason) => (false, format!("unreachable: {}", reason)),
        };
        ValidationDetail {
            source,
            trusted,
            explanation,
        }
    }
}

/// Combine per-notary outcomes into a verdict.
///
/// Trusted only if at least one notary answered and every answer was a
/// confirmation.
pub fn tally(outcomes: &[NotaryOutcome]) -> TrustOutcome {
    if outcomes.iter().any(|o| *o == NotaryOutcome::Conflict) {
        TrustOutcome::NotaryConflict
    } else if outcomes.iter().any(|o| *o == NotaryOutcome::Confirmed) {
        TrustOutcome::QuorumConfirmed
    } else {
        TrustOutcome::QuorumUnreachable
    }
}

/// Asks every enabled notary and tallies the answers.
pub struct NotaryQuorum {
    registry: Arc<NotaryRegistry>,
    transport: Arc<dyn NotaryTransport>,
    query_timeout: Duration,
}

impl std::fmt::Debug for NotaryQuorum {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NotaryQuorum")
            .field("query_timeout", &self.query_timeout)
            .finish()
    }
}

impl NotaryQuorum {
    /// Create a quorum over `registry`, querying through `transport`.
    pub fn new(
        registry: Arc<NotaryRegistry>,
        transport: Arc<dyn NotaryTransport>,
        query_timeout: Duration,
    ) -> Self {
        Self {
            registry,
            transport,
            query_timeout,
        }
    }

    /// Ask every enabled notary about `certificate` for `host:port`.
    ///
    /// Waits for every query to settle (answer, error or timeout). Details
    /// are returned in configuration order.
    pub async fn check_validity(
        &self,
        host: &str,
        port: u16,
        observed_ip: Option<IpAddr>,
        certificate: Certificate,
    ) -> ValidationResult {
        let target = Destination::new(host, port).target();
        let snapshot = self.registry.snapshot();

        let hosts: Vec<_> = snapshot
            .iter()
            .filter(|record| record.enabled)
            .flat_map(|record| {
                record.notaries.iter().map(move |notary| {
                    let label = if record.notaries.len() == 1 {
                        record.name.clone()
                    } else {
                        format!("{} ({})", record.name, notary.host)
                    };
                    (label, notary.clone())
                })
            })
            .collect();

        if hosts.is_empty() {
            debug!("No enabled notaries for {}", target);
            return ValidationResult::new(
                TrustOutcome::QuorumUnreachable,
                target,
                certificate,
                vec![ValidationDetail {
                    source: "quorum".to_string(),
                    trusted: false,
                    explanation: "no enabled notaries".to_string(),
                }],
            );
        }

        let request = Arc::new(NotaryRequest {
            host: host.to_string(),
            port,
            observed_ip,
            fingerprint: certificate.fingerprint().to_string(),
        });

        let mut queries = JoinSet::new();
        for (index, (_, notary)) in hosts.iter().enumerate() {
            let transport = self.transport.clone();
            let request = request.clone();
            let notary = notary.clone();
            let timeout = self.query_timeout;
            queries.spawn(async move {
                let result = match tokio::time::timeout(timeout, transport.query(&notary, &request)).await {
                    Ok(result) => result,
                    Err(_) => Err(NotaryError::Timeout),
                };
                (index, NotaryOutcome::from(result))
            });
        }

        let mut outcomes: Vec<Option<NotaryOutcome>> = vec![None; hosts.len()];
        while let Some(joined) = queries.join_next().await {
            match joined {
                Ok((index, outcome)) => outcomes[index] = Some(outcome),
                Err(e) => warn!("Notary query task failed: {}", e),
            }
        }

        let outcomes: Vec<NotaryOutcome> = outcomes
            .into_iter()
            .map(|o| o.unwrap_or_else(|| NotaryOutcome::Unreachable("query aborted".to_string())))
            .collect();

        let verdict = tally(&outcomes);
        let details = hosts
            .into_iter()
            .zip(outcomes.iter())
            .map(|((label, _), outcome)| outcome.detail(label))
            .collect();

        debug!("Quorum for {}: {:?}", target, verdict);
        ValidationResult::new(verdict, target, certificate, details)
    }
}
