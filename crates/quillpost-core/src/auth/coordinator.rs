//! Single-flight gate for token refresh.
//!
//! The first caller to `join` becomes the leader and performs the refresh;
//! everyone arriving before it settles gets a receiver and is handed the
//! leader's outcome. The in-flight marker is cleared on every exit path,
//! including the leader's future being dropped.

use std::sync::Mutex;

use thiserror::Error;
use tokio::sync::oneshot;
use tracing::debug;

use crate::utils::lock;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RefreshError {
    #[error("No session to refresh")]
    NoSession,

    #[error("Refresh token rejected by server")]
    Rejected,

    #[error("Network error during refresh: {0}")]
    Network(String),

    #[error("Refresh failed: {0}")]
    Failed(String),

    #[error("Refresh was abandoned before completing")]
    Abandoned,
}

pub type RefreshOutcome = Result<String, RefreshError>;

type Waiters = Vec<oneshot::Sender<RefreshOutcome>>;

#[derive(Default)]
pub struct RefreshCoordinator {
    /// `Some` while a refresh is in flight; holds the queued waiters.
    in_flight: Mutex<Option<Waiters>>,
}

pub enum Flight<'a> {
    /// Caller must perform the refresh and `settle` the guard.
    Leader(FlightGuard<'a>),
    /// A refresh is already running; await its outcome.
    Follower(oneshot::Receiver<RefreshOutcome>),
}

impl RefreshCoordinator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_refreshing(&self) -> bool {
        lock(&self.in_flight).is_some()
    }

    pub fn join(&self) -> Flight<'_> {
        let mut in_flight = lock(&self.in_flight);
        match in_flight.as_mut() {
            Some(waiters) => {
                let (tx, rx) = oneshot::channel();
                waiters.push(tx);
                debug!(waiters = waiters.len(), "Queued behind in-flight refresh");
                Flight::Follower(rx)
            }
            None => {
                *in_flight = Some(Vec::new());
                Flight::Leader(FlightGuard {
                    coordinator: self,
                    settled: false,
                })
            }
        }
    }

    /// Clear the in-flight marker and hand `outcome` to every waiter.
    fn broadcast(&self, outcome: &RefreshOutcome) {
        let waiters = lock(&self.in_flight).take().unwrap_or_default();
        if !waiters.is_empty() {
            debug!(waiters = waiters.len(), ok = outcome.is_ok(), "Releasing refresh waiters");
        }
        for waiter in waiters {
            // Waiter may have been dropped; nothing to do.
            let _ = waiter.send(outcome.clone());
        }
    }
}

pub struct FlightGuard<'a> {
    coordinator: &'a RefreshCoordinator,
    settled: bool,
}

impl FlightGuard<'_> {
    pub fn settle(mut self, outcome: &RefreshOutcome) {
        self.settled = true;
        self.coordinator.broadcast(outcome);
    }
}

impl Drop for FlightGuard<'_> {
    fn drop(&mut self) {
        if !self.settled {
            self.coordinator.broadcast(&Err(RefreshError::Abandoned));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_first_join_leads() {
        let coordinator = RefreshCoordinator::new();
        assert!(!coordinator.is_refreshing());
        let flight = coordinator.join();
        assert!(matches!(flight, Flight::Leader(_)));
        assert!(coordinator.is_refreshing());
    }

    #[tokio::test]
    async fn test_followers_receive_leader_outcome() {
        let coordinator = RefreshCoordinator::new();
        let Flight::Leader(guard) = coordinator.join() else {
            panic!("expected leader");
        };
        let Flight::Follower(rx1) = coordinator.join() else {
            panic!("expected follower");
        };
        let Flight::Follower(rx2) = coordinator.join() else {
            panic!("expected follower");
        };

        guard.settle(&Ok("new-token".to_string()));
        assert!(!coordinator.is_refreshing());
        assert_eq!(rx1.await.unwrap(), Ok("new-token".to_string()));
        assert_eq!(rx2.await.unwrap(), Ok("new-token".to_string()));
    }

    #[tokio::test]
    async fn test_dropped_leader_releases_waiters() {
        let coordinator = RefreshCoordinator::new();
        let leader = coordinator.join();
        let Flight::Follower(rx) = coordinator.join() else {
            panic!("expected follower");
        };

        drop(leader);
        assert!(!coordinator.is_refreshing());
        assert_eq!(rx.await.unwrap(), Err(RefreshError::Abandoned));
        assert!(matches!(coordinator.join(), Flight::Leader(_)));
    }

    #[test]
    fn test_failure_clears_flag() {
        let coordinator = RefreshCoordinator::new();
        if let Flight::Leader(guard) = coordinator.join() {
            guard.settle(&Err(RefreshError::Rejected));
        }
        assert!(!coordinator.is_refreshing());
    }
}
