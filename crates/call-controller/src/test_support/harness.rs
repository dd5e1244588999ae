//! Fully wired call core over the in-memory store.
//!
//! One `TestCore` is one controller process. Build several against the
//! same `MemoryStore` to simulate a cluster coordinating through one
//! shared Redis:
//!
//! ```rust,ignore
//! let store = Arc::new(MemoryStore::new());
//! let node_a = TestCore::builder().node_id("node-a").store(store.clone()).build();
//! let node_b = TestCore::builder().node_id("node-b").store(store.clone()).build();
//! ```

use super::{MemoryDurable, MemoryStore};
use call_controller::config::{
    CoordinatorConfig, MatchingConfig, QueueConfig, StateConfig,
};
use call_controller::coordinator::LeaderCoordinator;
use call_controller::events::BroadcastBus;
use call_controller::manager::CallManager;
use call_controller::matching::MatchingEngine;
use call_controller::queue::QueueManager;
use call_controller::state::CallStateStore;
use std::sync::Arc;
use std::time::Duration;

/// A fully wired call core over in-memory infrastructure.
pub struct TestCore {
    pub manager: CallManager,
    pub queue: QueueManager,
    pub matching: MatchingEngine,
    pub coordinator: LeaderCoordinator,
    pub state: CallStateStore,
    pub store: Arc<MemoryStore>,
    pub durable: Arc<MemoryDurable>,
    pub bus: Arc<BroadcastBus>,
}

impl TestCore {
    #[must_use]
    pub fn builder() -> TestCoreBuilder {
        TestCoreBuilder::default()
    }
}

/// Builder for [`TestCore`].
pub struct TestCoreBuilder {
    node_id: String,
    store: Option<Arc<MemoryStore>>,
    durable: Option<Arc<MemoryDurable>>,
    queue: QueueConfig,
    matching: MatchingConfig,
    coordinator: CoordinatorConfig,
    state: StateConfig,
}

impl Default for TestCoreBuilder {
    fn default() -> Self {
        Self {
            node_id: "test-node".to_string(),
            store: None,
            durable: None,
            queue: QueueConfig {
                timeout: Duration::from_secs(1800),
                capacity: 100,
                priority_weight_ms: -60_000,
                cleanup_interval: Duration::from_secs(60),
            },
            matching: MatchingConfig {
                sweep_interval: Duration::from_millis(50),
                cooldown: Duration::from_secs(300),
                age_gap_threshold: Duration::from_secs(300),
                age_grace_period: Duration::from_secs(600),
            },
            coordinator: CoordinatorConfig {
                lease_ttl: Duration::from_millis(200),
            },
            state: StateConfig {
                call_timeout: Duration::from_secs(7200),
                ended_retention: Duration::from_secs(3600),
                flagged_retention: Duration::from_secs(172_800),
            },
        }
    }
}

impl TestCoreBuilder {
    /// Node id for this simulated process.
    #[must_use]
    pub fn node_id(mut self, node_id: impl Into<String>) -> Self {
        self.node_id = node_id.into();
        self
    }

    /// Share a store with another core (multi-process simulation).
    #[must_use]
    pub fn store(mut self, store: Arc<MemoryStore>) -> Self {
        self.store = Some(store);
        self
    }

    /// Share a durable archive with another core.
    #[must_use]
    pub fn durable(mut self, durable: Arc<MemoryDurable>) -> Self {
        self.durable = Some(durable);
        self
    }

    #[must_use]
    pub fn queue_config(mut self, config: QueueConfig) -> Self {
        self.queue = config;
        self
    }

    #[must_use]
    pub fn matching_config(mut self, config: MatchingConfig) -> Self {
        self.matching = config;
        self
    }

    #[must_use]
    pub fn coordinator_config(mut self, config: CoordinatorConfig) -> Self {
        self.coordinator = config;
        self
    }

    #[must_use]
    pub fn state_config(mut self, config: StateConfig) -> Self {
        self.state = config;
        self
    }

    /// Wire everything together.
    #[must_use]
    pub fn build(self) -> TestCore {
        let store = self.store.unwrap_or_default();
        let durable = self.durable.unwrap_or_default();
        let bus = Arc::new(BroadcastBus::default());

        let state =
            CallStateStore::new(store.clone(), durable.clone(), bus.clone(), self.state);
        let coordinator =
            LeaderCoordinator::new(store.clone(), self.node_id.clone(), self.coordinator);
        let queue = QueueManager::new(store.clone(), bus.clone(), self.queue);
        let matching = MatchingEngine::new(
            store.clone(),
            queue.clone(),
            state.clone(),
            coordinator.clone(),
            bus.clone(),
            self.matching,
        );
        let manager = CallManager::new(
            queue.clone(),
            matching.clone(),
            state.clone(),
            coordinator.clone(),
            bus.clone(),
            self.node_id,
        );

        TestCore {
            manager,
            queue,
            matching,
            coordinator,
            state,
            store,
            durable,
            bus,
        }
    }
}
