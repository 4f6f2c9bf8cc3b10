//! Target connection establishment.
//!
//! [`TargetConnector`] resolves a destination, races every resolved address
//! and optionally tunnels through an upstream proxy. Direct and proxied
//! connects use separate timeouts because a proxy adds its own round trip.

use std::net::{IpAddr, SocketAddr};
use std::time::Duration;

use tokio::net::TcpStream;
use tracing::debug;

use super::error::{ConnectError, RaceError};
use super::racer::{DEFAULT_RACE_BUDGET, MultiDestinationRacer};
use super::tunnel::{self, TunnelFailure, UpstreamProxy};
use super::Destination;

/// Default budget for a direct connect.
pub const DEFAULT_DIRECT_TIMEOUT: Duration = Duration::from_millis(5000);
/// Default budget for a connect through an upstream proxy.
pub const DEFAULT_PROXIED_TIMEOUT: Duration = Duration::from_millis(10000);

/// A live TCP stream to a destination (or to the proxy tunnelling to it).
#[derive(Debug)]
pub struct Connected {
    /// The connected socket, positioned at the start of tunnel data.
    pub stream: TcpStream,
    /// Address of the TCP peer actually connected to.
    pub peer: SocketAddr,
    /// Whether the stream goes through an upstream proxy.
    pub via_proxy: bool,
}

impl Connected {
    /// IP of the TCP peer, reported to notaries as the observed address.
    pub fn observed_ip(&self) -> IpAddr {
        self.peer.ip()
    }
}

/// Opens TCP connections to destinations.
#[derive(Debug, Clone)]
pub struct TargetConnector {
    direct_timeout: Duration,
    proxied_timeout: Duration,
    race_budget: Duration,
}

impl Default for TargetConnector {
    fn default() -> Self {
        Self::new(DEFAULT_DIRECT_TIMEOUT, DEFAULT_PROXIED_TIMEOUT)
    }
}

impl TargetConnector {
    /// Create a connector with explicit timeouts.
    pub fn new(direct_timeout: Duration, proxied_timeout: Duration) -> Self {
        Self {
            direct_timeout,
            proxied_timeout,
            race_budget: DEFAULT_RACE_BUDGET,
        }
    }

    /// Cap the time spent racing resolved addresses of a direct target.
    pub fn with_race_budget(mut self, budget: Duration) -> Self {
        self.race_budget = budget;
        self
    }

    /// Connect to `destination`, through `upstream` if given.
    ///
    /// On failure the partially opened socket is dropped before returning.
    pub async fn connect(
        &self,
        destination: &Destination,
        upstream: Option<&UpstreamProxy>,
    ) -> Result<Connected, ConnectError> {
        match upstream {
            None => {
                let target = destination.target();
                let (stream, peer) = self
                    .connect_racing(destination, self.direct_timeout, false, &target)
                    .await?;
                Ok(Connected {
                    stream,
                    peer,
                    via_proxy: false,
                })
            }
            Some(proxy) => self.connect_via(destination, proxy).await,
        }
    }

    async fn connect_via(
        &self,
        destination: &Destination,
        proxy: &UpstreamProxy,
    ) -> Result<Connected, ConnectError> {
        let target = destination.target();
        let started = tokio::time::Instant::now();
        let (mut stream, peer) = self
            .connect_racing(proxy.endpoint(), self.proxied_timeout, true, &target)
            .await?;

        debug!("Opening tunnel to {} through {}", target, proxy);
        let remaining = self.proxied_timeout.saturating_sub(started.elapsed());
        let handshake = async {
            match proxy {
                UpstreamProxy::Http(_) => tunnel::http_connect(&mut stream, destination).await,
                UpstreamProxy::Socks5(_) => tunnel::socks5_connect(&mut stream, destination).await,
            }
        };

        match tokio::time::timeout(remaining, handshake).await {
            Err(_) => Err(ConnectError::ConnectTimeout { target }),
            Ok(Err(TunnelFailure::Rejected(message))) => {
                Err(ConnectError::TunnelRejected { target, message })
            }
            Ok(Err(TunnelFailure::Io(source))) => Err(ConnectError::Io { target, source }),
            Ok(Ok(())) => Ok(Connected {
                stream,
                peer,
                via_proxy: true,
            }),
        }
    }

    /// Budget for racing the resolved addresses. Connects to an upstream
    /// proxy get whatever is left of the proxied timeout.
    fn race_budget_for(&self, remaining: Duration, via_proxy: bool) -> Duration {
        if via_proxy {
            remaining
        } else {
            remaining.min(self.race_budget)
        }
    }

    /// Resolve `endpoint` and race every address it resolves to.
    async fn connect_racing(
        &self,
        endpoint: &Destination,
        budget: Duration,
        via_proxy: bool,
        target: &str,
    ) -> Result<(TcpStream, SocketAddr), ConnectError> {
        let started = tokio::time::Instant::now();
        let candidates = resolve(endpoint, budget).await.map_err(|e| match e {
            ResolveFailure::Timeout => ConnectError::ConnectTimeout {
                target: target.to_string(),
            },
            ResolveFailure::Lookup(message) => ConnectError::DnsFailure {
                host: endpoint.host.clone(),
                message,
            },
        })?;

        let remaining = budget.saturating_sub(started.elapsed());
        let racer = MultiDestinationRacer::new(self.race_budget_for(remaining, via_proxy));
        match racer.race(&candidates).await {
            Ok(winner) => {
                debug!(
                    "Connected to {} via {} (candidate {} of {})",
                    target,
                    winner.addr,
                    winner.index + 1,
                    candidates.len()
                );
                Ok((winner.stream, winner.addr))
            }
            Err(e) => {
                if matches!(
                    e,
                    RaceError::AllCandidatesFailed {
                        timed_out: true,
                        ..
                    }
                ) {
                    Err(ConnectError::ConnectTimeout {
                        target: target.to_string(),
                    })
                } else {
                    Err(ConnectError::Unreachable {
                        target: target.to_string(),
                        source: e,
                    })
                }
            }
        }
    }
}

enum ResolveFailure {
    Timeout,
    Lookup(String),
}

async fn resolve(
    endpoint: &Destination,
    budget: Duration,
) -> Result<Vec<SocketAddr>, ResolveFailure> {
    if let Ok(ip) = endpoint.host.parse::<IpAddr>() {
        return Ok(vec![SocketAddr::new(ip, endpoint.port)]);
    }

    let lookup = tokio::net::lookup_host((endpoint.host.as_str(), endpoint.port));
    let addrs: Vec<SocketAddr> = tokio::time::timeout(budget, lookup)
        .await
        .map_err(|_| ResolveFailure::Timeout)?
        .map_err(|e| ResolveFailure::Lookup(e.to_string()))?
        .collect();

    if addrs.is_empty() {
        return Err(ResolveFailure::Lookup("no addresses returned".to_string()));
    }
    Ok(addrs)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    #[test]
    fn test_race_budget_for_proxied_uses_remaining() {
        let connector = TargetConnector::new(Duration::from_secs(5), Duration::from_secs(10))
            .with_race_budget(Duration::from_secs(5));

        assert_eq!(
            connector.race_budget_for(Duration::from_secs(9), true),
            Duration::from_secs(9)
        );
        assert_eq!(
            connector.race_budget_for(Duration::from_secs(9), false),
            Duration::from_secs(5)
        );
        assert_eq!(
            connector.race_budget_for(Duration::from_secs(2), false),
            Duration::from_secs(2)
        );
    }

    #[tokio::test]
    async fn test_connect_direct_ip_literal() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let connector = TargetConnector::default();
        let destination = Destination::new("127.0.0.1", addr.port());
        let connected = connector.connect(&destination, None).await.unwrap();

        assert_eq!(connected.peer, addr);
        assert_eq!(connected.observed_ip(), addr.ip());
        assert!(!connected.via_proxy);
    }

    #[tokio::test]
    async fn test_connect_refused_is_unreachable() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let connector = TargetConnector::default();
        let err = connector
            .connect(&Destination::new("127.0.0.1", port), None)
            .await
            .unwrap_err();
        assert_eq!(err.kind(), "all_candidates_failed");
    }

    #[tokio::test]
    async fn test_connect_dns_failure() {
        let connector = TargetConnector::default();
        let err = connector
            .connect(&Destination::new("nonexistent.invalid", 443), None)
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            ConnectError::DnsFailure { .. } | ConnectError::ConnectTimeout { .. }
        ));
    }

    #[tokio::test]
    async fn test_connect_through_http_proxy() {
        let proxy_listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let proxy_addr = proxy_listener.local_addr().unwrap();

        tokio::spawn(async move {
            let (mut socket, _) = proxy_listener.accept().await.unwrap();
            let mut buf = vec![0u8; 1024];
            let n = socket.read(&mut buf).await.unwrap();
            assert!(String::from_utf8_lossy(&buf[..n]).starts_with("CONNECT target.test:443"));
            socket
                .write_all(b"HTTP/1.0 200 Connection established\r\n\r\n")
                .await
                .unwrap();
        });

        let connector = TargetConnector::default();
        let proxy = UpstreamProxy::Http(Destination::new("127.0.0.1", proxy_addr.port()));
        let connected = connector
            .connect(&Destination::new("target.test", 443), Some(&proxy))
            .await
            .unwrap();

        assert!(connected.via_proxy);
        assert_eq!(connected.peer, proxy_addr);
    }

    #[tokio::test]
    async fn test_connect_through_proxy_rejected() {
        let proxy_listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let proxy_addr = proxy_listener.local_addr().unwrap();

        tokio::spawn(async move {
            let (mut socket, _) = proxy_listener.accept().await.unwrap();
            let mut buf = vec![0u8; 1024];
            let _ = socket.read(&mut buf).await.unwrap();
            socket
                .write_all(b"HTTP/1.1 407 Proxy Authentication Required\r\n\r\n")
                .await
                .unwrap();
        });

        let connector = TargetConnector::default();
        let proxy = UpstreamProxy::Http(Destination::new("127.0.0.1", proxy_addr.port()));
        let err = connector
            .connect(&Destination::new("target.test", 443), Some(&proxy))
            .await
            .unwrap_err();

        match err {
            ConnectError::TunnelRejected { target, message } => {
                assert_eq!(target, "target.test:443");
                assert!(message.contains("407"));
            }
            other => panic!("expected TunnelRejected, got {:?}", other),
        }
    }
}
