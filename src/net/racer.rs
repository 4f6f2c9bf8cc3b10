//! Concurrent TCP connect racing.
//!
//! Given the addresses a host resolved to, open a connection to each of
//! them at once and keep whichever finishes its handshake first. Every
//! other in-flight attempt is aborted and every losing socket is dropped
//! before [`MultiDestinationRacer::race`] returns.

use std::net::SocketAddr;
use std::time::Duration;

use tokio::net::TcpStream;
use tokio::task::JoinSet;
use tokio::time::Instant;
use tracing::{debug, trace};

use super::error::RaceError;

/// Default total time budget for a race.
pub const DEFAULT_RACE_BUDGET: Duration = Duration::from_millis(5000);

/// The first candidate to complete a TCP handshake.
#[derive(Debug)]
pub struct RaceWinner {
    /// Position of the winning address in the candidate list.
    pub index: usize,
    /// The winning address.
    pub addr: SocketAddr,
    /// The connected stream. The caller owns it exclusively.
    pub stream: TcpStream,
}

/// Races TCP connects to a list of candidate addresses.
#[derive(Debug, Clone)]
pub struct MultiDestinationRacer {
    budget: Duration,
}

impl Default for MultiDestinationRacer {
    fn default() -> Self {
        Self::new(DEFAULT_RACE_BUDGET)
    }
}

impl MultiDestinationRacer {
    /// Create a racer with the given total time budget.
    pub fn new(budget: Duration) -> Self {
        Self { budget }
    }

    /// The total time budget of one race.
    pub fn budget(&self) -> Duration {
        self.budget
    }

    /// Connect to every candidate concurrently and return the first success.
    ///
    /// Returns [`RaceError::AllCandidatesFailed`] immediately for an empty
    /// list, as soon as every attempt has failed, or when the budget runs
    /// out. Attempts that complete after the winner are closed.
    pub async fn race(&self, candidates: &[SocketAddr]) -> Result<RaceWinner, RaceError> {
        if candidates.is_empty() {
            return Err(RaceError::AllCandidatesFailed {
                attempted: 0,
                timed_out: false,
            });
        }

        let mut attempts = JoinSet::new();
        for (index, addr) in candidates.iter().copied().enumerate() {
            attempts.spawn(async move { (index, addr, TcpStream::connect(addr).await) });
        }

        let deadline = Instant::now() + self.budget;
        let mut remaining = candidates.len();

        let outcome = loop {
            match tokio::time::timeout_at(deadline, attempts.join_next()).await {
                Err(_) => {
                    debug!(
                        "Race budget of {:?} exhausted with {} attempt(s) pending",
                        self.budget, remaining
                    );
                    break Err(RaceError::AllCandidatesFailed {
                        attempted: candidates.len(),
                        timed_out: true,
                    });
                }
                Ok(None) => {
                    break Err(RaceError::AllCandidatesFailed {
                        attempted: candidates.len(),
                        timed_out: false,
                    });
                }
                Ok(Some(Ok((index, addr, Ok(stream))))) => {
                    trace!("Candidate {} ({}) won the race", index, addr);
                    break Ok(RaceWinner {
                        index,
                        addr,
                        stream,
                    });
                }
                Ok(Some(Ok((index, addr, Err(e))))) => {
                    debug!("Candidate {} ({}) failed: {}", index, addr, e);
                    remaining -= 1;
                }
                Ok(Some(Err(join_err))) => {
                    debug!("Connect attempt task failed: {}", join_err);
                    remaining -= 1;
                }
            }

            if remaining == 0 {
                break Err(RaceError::AllCandidatesFailed {
                    attempted: candidates.len(),
                    timed_out: false,
                });
            }
        };

        // Abort the stragglers and drop any sockets that finished but were
        // never claimed, so no loser outlives the race.
        attempts.shutdown().await;

        outcome
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    async fn refused_addr() -> SocketAddr {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);
        addr
    }

    #[tokio::test]
    async fn test_race_empty_list_fails_immediately() {
        let racer = MultiDestinationRacer::default();
        let started = std::time::Instant::now();
        let err = racer.race(&[]).await.unwrap_err();
        assert!(started.elapsed() < Duration::from_millis(100));
        match err {
            RaceError::AllCandidatesFailed {
                attempted,
                timed_out,
            } => {
                assert_eq!(attempted, 0);
                assert!(!timed_out);
            }
        }
    }

    #[tokio::test]
    async fn test_race_single_reachable_candidate() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let racer = MultiDestinationRacer::default();
        let winner = racer.race(&[addr]).await.unwrap();
        assert_eq!(winner.index, 0);
        assert_eq!(winner.addr, addr);
        assert_eq!(winner.stream.peer_addr().unwrap(), addr);
    }

    #[tokio::test]
    async fn test_race_picks_reachable_among_refused() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let live = listener.local_addr().unwrap();
        let dead_a = refused_addr().await;
        let dead_b = refused_addr().await;

        let racer = MultiDestinationRacer::default();
        let started = std::time::Instant::now();
        let winner = racer.race(&[dead_a, dead_b, live]).await.unwrap();

        assert_eq!(winner.index, 2);
        assert_eq!(winner.addr, live);
        assert!(started.elapsed() < Duration::from_secs(2));
    }

    #[tokio::test]
    async fn test_race_losing_socket_is_closed() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let racer = MultiDestinationRacer::default();
        let mut winner = racer.race(&[addr, addr]).await.unwrap();
        let winner_local = winner.stream.local_addr().unwrap();

        // Every handshake that reached the listener belongs to either the
        // winner, which stays open, or a loser, which must read EOF.
        let mut saw_winner = false;
        while let Ok(Ok((mut accepted, peer))) =
            tokio::time::timeout(Duration::from_millis(500), listener.accept()).await
        {
            let mut buf = [0u8; 8];
            if peer == winner_local {
                saw_winner = true;
                winner.stream.write_all(b"hi").await.unwrap();
                let n = accepted.read(&mut buf).await.unwrap();
                assert_eq!(&buf[..n], b"hi");
            } else {
                let n = tokio::time::timeout(Duration::from_secs(2), accepted.read(&mut buf))
                    .await
                    .expect("losing socket left open")
                    .unwrap_or(0);
                assert_eq!(n, 0);
            }
        }
        assert!(saw_winner);
    }

    #[tokio::test]
    async fn test_race_does_not_wait_for_pending_candidate() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let live = listener.local_addr().unwrap();
        // Nothing answers on this address: the attempt either hangs or fails.
        let blackhole: SocketAddr = "10.255.255.1:9".parse().unwrap();

        let racer = MultiDestinationRacer::new(Duration::from_secs(10));
        let started = std::time::Instant::now();
        let winner = racer.race(&[blackhole, live]).await.unwrap();

        assert_eq!(winner.index, 1);
        assert_eq!(winner.addr, live);
        assert!(started.elapsed() < Duration::from_secs(2));
    }

    #[tokio::test]
    async fn test_race_all_refused() {
        let dead_a = refused_addr().await;
        let dead_b = refused_addr().await;

        let racer = MultiDestinationRacer::default();
        let started = std::time::Instant::now();
        let err = racer.race(&[dead_a, dead_b]).await.unwrap_err();

        // Refusals end the race early instead of waiting for the budget.
        assert!(started.elapsed() < Duration::from_secs(2));
        match err {
            RaceError::AllCandidatesFailed { attempted, .. } => assert_eq!(attempted, 2),
        }
    }

    #[tokio::test]
    async fn test_race_respects_budget() {
        // Non-routable TEST-NET addresses either hang or fail fast depending
        // on the host; both must finish within the budget.
        let blackholes: Vec<SocketAddr> = vec![
            "192.0.2.1:9".parse().unwrap(),
            "198.51.100.1:9".parse().unwrap(),
        ];
        let racer = MultiDestinationRacer::new(Duration::from_millis(200));
        let started = std::time::Instant::now();
        let result = racer.race(&blackholes).await;

        assert!(result.is_err());
        assert!(started.elapsed() < Duration::from_millis(1200));
    }
}
