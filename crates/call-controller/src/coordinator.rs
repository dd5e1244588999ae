//! Lease-based leader election.
//!
//! Exactly one process cluster-wide runs the background matching sweep.
//! Leadership is a time-limited lease in the shared store: acquire with a
//! set-if-absent, renew before expiry with an owner-compared extend, and
//! on process crash the lease simply expires so another process acquires
//! it within one lease interval.
//!
//! Leadership is an explicit state machine `Follower -> Candidate ->
//! Leader` whose only transition trigger is lease acquisition/expiry.
//! The brief dual-leader window during an expiry/renewal race is tolerated
//! because match claims themselves are idempotent store operations.

use crate::config::CoordinatorConfig;
use crate::errors::CallError;
use crate::lifecycle::Component;
use crate::observability::metrics;
use crate::store::SharedStore;
use async_trait::async_trait;
use rand::Rng;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Lease key for the matching sweep leadership.
pub const MATCHING_LEASE_KEY: &str = "leader:matching";

/// Leadership state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum LeaderState {
    /// Not holding the lease; waiting for the next acquisition attempt.
    Follower = 0,
    /// Acquisition attempt in flight.
    Candidate = 1,
    /// Holding the lease; renewing at a third of the TTL.
    Leader = 2,
}

impl LeaderState {
    fn from_u8(v: u8) -> Self {
        match v {
            2 => LeaderState::Leader,
            1 => LeaderState::Candidate,
            _ => LeaderState::Follower,
        }
    }
}

/// Cluster-wide leader election over a store lease.
///
/// Cheaply cloneable; clones share the election task and observed state.
#[derive(Clone)]
pub struct LeaderCoordinator {
    store: Arc<dyn SharedStore>,
    node_id: String,
    lease_key: String,
    config: CoordinatorConfig,
    state: Arc<AtomicU8>,
    cancel: CancellationToken,
    task: Arc<Mutex<Option<JoinHandle<()>>>>,
}

impl LeaderCoordinator {
    pub fn new(
        store: Arc<dyn SharedStore>,
        node_id: String,
        config: CoordinatorConfig,
    ) -> Self {
        Self {
            store,
            node_id,
            lease_key: MATCHING_LEASE_KEY.to_string(),
            config,
            state: Arc::new(AtomicU8::new(LeaderState::Follower as u8)),
            cancel: CancellationToken::new(),
            task: Arc::new(Mutex::new(None)),
        }
    }

    /// Cheap local check: is this process the current leader?
    #[must_use]
    pub fn is_leader(&self) -> bool {
        self.leader_state() == LeaderState::Leader
    }

    /// Current state of the leadership state machine.
    #[must_use]
    pub fn leader_state(&self) -> LeaderState {
        LeaderState::from_u8(self.state.load(Ordering::Relaxed))
    }

    fn set_state(&self, state: LeaderState) {
        self.state.store(state as u8, Ordering::Relaxed);
        metrics::set_leader(state == LeaderState::Leader);
    }

    /// One acquisition attempt. Separated from the loop for direct testing.
    pub async fn try_acquire(&self) -> bool {
        self.set_state(LeaderState::Candidate);
        match self
            .store
            .lease_acquire(&self.lease_key, &self.node_id, self.config.lease_ttl)
            .await
        {
            Ok(true) => {
                info!(
                    target: "cc.coordinator",
                    node_id = %self.node_id,
                    lease_ttl_ms = self.config.lease_ttl.as_millis() as u64,
                    "Acquired matching leadership"
                );
                self.set_state(LeaderState::Leader);
                true
            }
            Ok(false) => {
                debug!(target: "cc.coordinator", "Lease held by another node");
                self.set_state(LeaderState::Follower);
                false
            }
            Err(e) => {
                warn!(
                    target: "cc.coordinator",
                    error = %e,
                    "Lease acquisition failed"
                );
                self.set_state(LeaderState::Follower);
                false
            }
        }
    }

    /// One renewal attempt. Any failure demotes to follower: when the
    /// store is unreachable the lease will expire on its own, and a
    /// demoted node stops sweeping before another node can take over.
    pub async fn renew(&self) {
        match self
            .store
            .lease_renew(&self.lease_key, &self.node_id, self.config.lease_ttl)
            .await
        {
            Ok(true) => {}
            Ok(false) => {
                warn!(
                    target: "cc.coordinator",
                    node_id = %self.node_id,
                    "Lost matching leadership (lease expired or taken)"
                );
                self.set_state(LeaderState::Follower);
            }
            Err(e) => {
                warn!(
                    target: "cc.coordinator",
                    error = %e,
                    "Lease renewal failed, demoting to follower"
                );
                self.set_state(LeaderState::Follower);
            }
        }
    }

    fn renew_interval(&self) -> Duration {
        self.config.lease_ttl / 3
    }

    /// Randomized wait added to follower acquisition attempts so a cluster
    /// restart does not produce a thundering herd on the lease key.
    fn jitter(&self) -> Duration {
        let max_ms = (self.renew_interval().as_millis() / 2).max(1);
        let max_ms = u64::try_from(max_ms).unwrap_or(u64::MAX);
        Duration::from_millis(rand::thread_rng().gen_range(0..max_ms))
    }

    async fn election_loop(self) {
        info!(
            target: "cc.coordinator",
            node_id = %self.node_id,
            "Starting leader election task"
        );

        // Take the lease right away so a fresh cluster elects a leader
        // within one pass rather than one lease interval.
        self.try_acquire().await;

        loop {
            let wait = if self.is_leader() {
                self.renew_interval()
            } else {
                self.renew_interval() + self.jitter()
            };

            tokio::select! {
                () = self.cancel.cancelled() => break,
                () = tokio::time::sleep(wait) => {}
            }

            if self.is_leader() {
                self.renew().await;
            } else {
                self.try_acquire().await;
            }
        }

        // Hand leadership off promptly instead of waiting out the TTL
        if self.is_leader() {
            if let Err(e) = self
                .store
                .lease_release(&self.lease_key, &self.node_id)
                .await
            {
                warn!(
                    target: "cc.coordinator",
                    error = %e,
                    "Lease release failed, lease will expire on its own"
                );
            }
        }
        self.set_state(LeaderState::Follower);
        info!(target: "cc.coordinator", "Leader election task stopped");
    }
}

#[async_trait]
impl Component for LeaderCoordinator {
    fn name(&self) -> &'static str {
        "coordinator"
    }

    async fn start(&self) -> Result<(), CallError> {
        let mut task = self.task.lock().await;
        if task.is_some() {
            return Ok(());
        }
        let coordinator = self.clone();
        *task = Some(tokio::spawn(coordinator.election_loop()));
        Ok(())
    }

    async fn stop(&self) {
        self.cancel.cancel();
        if let Some(handle) = self.task.lock().await.take() {
            if let Err(e) = handle.await {
                warn!(target: "cc.coordinator", error = %e, "Election task join failed");
            }
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::test_support::MemoryStore;

    fn coordinator(store: &Arc<MemoryStore>, node: &str, ttl: Duration) -> LeaderCoordinator {
        LeaderCoordinator::new(
            store.clone(),
            node.to_string(),
            CoordinatorConfig { lease_ttl: ttl },
        )
    }

    #[tokio::test]
    async fn test_single_node_acquires_leadership() {
        let store = Arc::new(MemoryStore::new());
        let a = coordinator(&store, "node-a", Duration::from_secs(15));

        assert_eq!(a.leader_state(), LeaderState::Follower);
        assert!(a.try_acquire().await);
        assert!(a.is_leader());
    }

    #[tokio::test]
    async fn test_second_node_stays_follower_while_lease_held() {
        let store = Arc::new(MemoryStore::new());
        let a = coordinator(&store, "node-a", Duration::from_secs(15));
        let b = coordinator(&store, "node-b", Duration::from_secs(15));

        assert!(a.try_acquire().await);
        assert!(!b.try_acquire().await);
        assert!(!b.is_leader());
        assert_eq!(b.leader_state(), LeaderState::Follower);
    }

    #[tokio::test]
    async fn test_leadership_moves_after_lease_expiry() {
        let store = Arc::new(MemoryStore::new());
        let a = coordinator(&store, "node-a", Duration::from_millis(50));
        let b = coordinator(&store, "node-b", Duration::from_millis(50));

        assert!(a.try_acquire().await);
        assert!(!b.try_acquire().await);

        // Simulated crash of node-a: no renewal, lease expires
        tokio::time::sleep(Duration::from_millis(80)).await;
        assert!(b.try_acquire().await);
        assert!(b.is_leader());

        // node-a discovers the loss on its next renewal
        a.renew().await;
        assert!(!a.is_leader());
    }

    #[tokio::test]
    async fn test_renewal_keeps_leadership() {
        let store = Arc::new(MemoryStore::new());
        let a = coordinator(&store, "node-a", Duration::from_millis(100));

        assert!(a.try_acquire().await);
        for _ in 0..3 {
            tokio::time::sleep(Duration::from_millis(40)).await;
            a.renew().await;
            assert!(a.is_leader());
        }
    }

    #[tokio::test]
    async fn test_stop_releases_lease_for_failover() {
        let store = Arc::new(MemoryStore::new());
        let a = coordinator(&store, "node-a", Duration::from_secs(15));
        let b = coordinator(&store, "node-b", Duration::from_secs(15));

        a.start().await.unwrap();
        // The election loop acquires immediately on start
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(a.is_leader());

        a.stop().await;
        assert!(!a.is_leader());

        // Released, not expired: node-b can take over immediately
        assert!(b.try_acquire().await);
    }
}
