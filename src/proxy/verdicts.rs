//! Latest validation verdict per target.
//!
//! Whatever sits on the client side of the proxy (a browser extension, a
//! status UI) needs to know why a certificate was or was not trusted. The
//! board keeps the most recent [`ValidationResult`] per `host:port` and
//! broadcasts every new one to subscribers.

use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;

use tokio::sync::broadcast;

use crate::trust::ValidationResult;

/// Default number of targets remembered.
pub const DEFAULT_BOARD_CAPACITY: usize = 1024;

const CHANNEL_CAPACITY: usize = 256;

#[derive(Default)]
struct BoardState {
    latest: HashMap<String, ValidationResult>,
    lru: VecDeque<String>,
}

/// Typed channel for validation verdicts.
pub struct VerdictBoard {
    state: Mutex<BoardState>,
    capacity: usize,
    tx: broadcast::Sender<ValidationResult>,
}

impl std::fmt::Debug for VerdictBoard {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VerdictBoard")
            .field("capacity", &self.capacity)
            .field("targets", &self.len())
            .finish()
    }
}

impl Default for VerdictBoard {
    fn default() -> Self {
        Self::new(DEFAULT_BOARD_CAPACITY)
    }
}

impl VerdictBoard {
    /// Create a board remembering at most `capacity` targets.
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(CHANNEL_CAPACITY);
        Self {
            state: Mutex::new(BoardState::default()),
            capacity: capacity.max(1),
            tx,
        }
    }

    /// Record a verdict and send it to subscribers.
    pub fn publish(&self, result: ValidationResult) {
        let target = result.target().to_string();
        {
            let mut state = self.state.lock().unwrap();
            touch_lru(&mut state.lru, &target);
            state.latest.insert(target, result.clone());
            while state.latest.len() > self.capacity {
                match state.lru.pop_front() {
                    Some(oldest) => {
                        state.latest.remove(&oldest);
                    }
                    None => break,
                }
            }
        }
        // No subscribers is fine.
        let _ = self.tx.send(result);
    }

    /// The most recent verdict for `target` (`host:port`).
    pub fn latest(&self, target: &str) -> Option<ValidationResult> {
        self.state.lock().unwrap().latest.get(target).cloned()
    }

    /// Receive every verdict published from now on.
    pub fn subscribe(&self) -> broadcast::Receiver<ValidationResult> {
        self.tx.subscribe()
    }

    /// Number of targets remembered.
    pub fn len(&self) -> usize {
        self.state.lock().unwrap().latest.len()
    }

    /// Whether no verdict has been recorded.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

fn touch_lru(lru: &mut VecDeque<String>, key: &str) {
    if let Some(position) = lru.iter().position(|entry| entry == key) {
        lru.remove(position);
    }
    lru.push_back(key.to_string());
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::trust::testing::certificate;

    fn verdict(host: &str) -> ValidationResult {
        ValidationResult::cached(format!("{host}:443"), certificate(host, false))
    }

    #[test]
    fn test_latest_replaces_previous() {
        let board = VerdictBoard::default();
        board.publish(verdict("a.example"));
        board.publish(verdict("a.example"));

        assert_eq!(board.len(), 1);
        assert!(board.latest("a.example:443").unwrap().trusted());
        assert!(board.latest("b.example:443").is_none());
    }

    #[test]
    fn test_evicts_least_recently_published() {
        let board = VerdictBoard::new(2);
        board.publish(verdict("a.example"));
        board.publish(verdict("b.example"));
        board.publish(verdict("a.example"));
        board.publish(verdict("c.example"));

        assert_eq!(board.len(), 2);
        assert!(board.latest("a.example:443").is_some());
        assert!(board.latest("b.example:443").is_none());
        assert!(board.latest("c.example:443").is_some());
    }

    #[tokio::test]
    async fn test_subscribers_receive_verdicts() {
        let board = VerdictBoard::default();
        let mut rx = board.subscribe();

        board.publish(verdict("a.example"));

        let received = rx.recv().await.unwrap();
        assert_eq!(received.target(), "a.example:443");
    }
}
