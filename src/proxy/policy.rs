//! Interception policy.
//!
//! Decides which CONNECT destinations are tunnelled straight through
//! without TLS interception or validation.
//!
//! # Evaluation Order
//!
//! 1. Notary endpoints (their TLS is pinned by the notary transport)
//! 2. Whitelist patterns
//! 3. RFC 1918 IPv4 literals, when `private_ip_exempt` is set
//! 4. Everything else is intercepted
//!
//! # Pattern Matching
//!
//! Whitelist entries are case-insensitive regular expressions tested
//! against the host, unanchored unless the pattern anchors itself:
//!
//! - `^.*\.corp\.example$` matches every host under `corp.example`
//! - `^bank\.example$` matches that host only
//! - `*.github.com` is shorthand for `^.+\.github\.com$`
//!
//! An entry may hold several patterns, one per line. Blank lines and lines
//! starting with `#` are skipped. Patterns that fail to compile are logged
//! and skipped.

use std::net::{IpAddr, Ipv4Addr};
use std::sync::Arc;

use regex::{Regex, RegexBuilder};
use serde::Serialize;
use tracing::warn;

use crate::net::Destination;
use crate::trust::NotaryRegistry;

/// Why a destination bypasses interception.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PassthroughReason {
    /// The destination is one of the configured notaries.
    NotaryEndpoint,
    /// The host matches a whitelist pattern.
    Whitelisted,
    /// The host is a private IPv4 literal.
    PrivateAddress,
}

/// Result of policy evaluation for a destination.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PolicyDecision {
    /// Run the full validation pipeline.
    Intercept,
    /// Splice TCP without touching the stream.
    Passthrough(PassthroughReason),
}

/// Policy engine for interception decisions.
pub struct InterceptionPolicy {
    whitelist: Vec<Regex>,
    private_ip_exempt: bool,
    registry: Arc<NotaryRegistry>,
}

impl InterceptionPolicy {
    /// Create a policy from whitelist patterns and the notary registry.
    pub fn new(whitelist: &[String], private_ip_exempt: bool, registry: Arc<NotaryRegistry>) -> Self {
        Self {
            whitelist: compile_patterns(whitelist),
            private_ip_exempt,
            registry,
        }
    }

    /// Evaluate policy for a destination. Host matching is case-insensitive.
    pub fn evaluate(&self, destination: &Destination) -> PolicyDecision {
        let host = destination.host.to_lowercase();

        if self.registry.is_notary_endpoint(&host, destination.port) {
            return PolicyDecision::Passthrough(PassthroughReason::NotaryEndpoint);
        }

        if self.matches_whitelist(&host) {
            return PolicyDecision::Passthrough(PassthroughReason::Whitelisted);
        }

        if self.private_ip_exempt
            && let Ok(IpAddr::V4(ip)) = host.parse::<IpAddr>()
            && is_rfc1918(ip)
        {
            return PolicyDecision::Passthrough(PassthroughReason::PrivateAddress);
        }

        PolicyDecision::Intercept
    }

    fn matches_whitelist(&self, host: &str) -> bool {
        self.whitelist.iter().any(|re| re.is_match(host))
    }
}

fn is_rfc1918(ip: Ipv4Addr) -> bool {
    let [a, b, ..] = ip.octets();
    a == 10 || (a == 172 && (16..=31).contains(&b)) || (a == 192 && b == 168)
}

/// Compile whitelist entries, one pattern per line.
fn compile_patterns(entries: &[String]) -> Vec<Regex> {
    entries
        .iter()
        .flat_map(|entry| entry.lines())
        .map(str::trim)
        .filter(|line| !line.is_empty() && !line.starts_with('#'))
        .filter_map(|line| {
            let source = match line.strip_prefix("*.") {
                Some(suffix) => format!("^.+\\.{}$", regex::escape(suffix)),
                None => line.to_string(),
            };
            match RegexBuilder::new(&source).case_insensitive(true).build() {
                Ok(re) => Some(re),
                Err(e) => {
                    warn!("Skipping whitelist pattern '{}': {}", line, e);
                    None
                }
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::trust::testing::records;

    fn policy(private_ip_exempt: bool) -> InterceptionPolicy {
        let registry = Arc::new(NotaryRegistry::in_memory(records(&["notary.example.org"])));
        InterceptionPolicy::new(
            &[r"^bank\.example$".to_string(), "*.internal.example".to_string()],
            private_ip_exempt,
            registry,
        )
    }

    fn matches(pattern: &str, host: &str) -> bool {
        compile_patterns(&[pattern.to_string()])
            .iter()
            .any(|re| re.is_match(host))
    }

    #[test]
    fn test_wildcard_shorthand() {
        assert!(matches("*.example.com", "sub.example.com"));
        assert!(matches("*.example.com", "deep.sub.example.com"));
        assert!(!matches("*.example.com", "example.com"));
        assert!(!matches("*.example.com", "fakeexample.com"));
        assert!(!matches("*.example.com", "sub.example.com.evil"));
    }

    #[test]
    fn test_regex_patterns_case_insensitive() {
        assert!(matches(r"^.*\.corp\.example$", "git.CORP.example"));
        assert!(!matches(r"^.*\.corp\.example$", "corp.example.net"));
        // Unanchored patterns match anywhere in the host.
        assert!(matches("intranet", "my-intranet.example"));
    }

    #[test]
    fn test_comments_blank_lines_and_invalid_patterns_skipped() {
        let entries = vec![
            "# internal hosts\n\n^wiki\\.corp$\n   \n([unclosed\n^git\\.corp$".to_string(),
            "# only a comment".to_string(),
        ];
        let compiled = compile_patterns(&entries);
        assert_eq!(compiled.len(), 2);
        assert!(compiled.iter().any(|re| re.is_match("wiki.corp")));
        assert!(compiled.iter().any(|re| re.is_match("GIT.corp")));
    }

    #[test]
    fn test_notary_endpoint_passes_through() {
        let policy = policy(false);
        assert_eq!(
            policy.evaluate(&Destination::new("notary.example.org", 443)),
            PolicyDecision::Passthrough(PassthroughReason::NotaryEndpoint)
        );
        assert_eq!(
            policy.evaluate(&Destination::new("notary.example.org", 8443)),
            PolicyDecision::Intercept
        );
    }

    #[test]
    fn test_whitelist_exact_and_wildcard() {
        let policy = policy(false);
        assert_eq!(
            policy.evaluate(&Destination::new("BANK.example", 443)),
            PolicyDecision::Passthrough(PassthroughReason::Whitelisted)
        );
        assert_eq!(
            policy.evaluate(&Destination::new("git.internal.example", 443)),
            PolicyDecision::Passthrough(PassthroughReason::Whitelisted)
        );
        assert_eq!(
            policy.evaluate(&Destination::new("internal.example", 443)),
            PolicyDecision::Intercept
        );
    }

    #[test]
    fn test_private_addresses() {
        let exempt = policy(true);
        for host in ["10.1.2.3", "172.16.0.1", "172.31.255.255", "192.168.1.1"] {
            assert_eq!(
                exempt.evaluate(&Destination::new(host, 443)),
                PolicyDecision::Passthrough(PassthroughReason::PrivateAddress),
                "{host}"
            );
        }
        for host in ["172.32.0.1", "8.8.8.8", "example.com", "::1"] {
            assert_eq!(
                exempt.evaluate(&Destination::new(host, 443)),
                PolicyDecision::Intercept,
                "{host}"
            );
        }

        let strict = policy(false);
        assert_eq!(
            strict.evaluate(&Destination::new("10.1.2.3", 443)),
            PolicyDecision::Intercept
        );
    }
}
