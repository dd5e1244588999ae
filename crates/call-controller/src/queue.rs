//! Queue manager: per-process facade over the shared wait queue.
//!
//! Enforces one-request-per-channel and the cluster-wide capacity limit
//! (both store-side, not in-process), computes queue positions, and runs
//! the periodic cleanup task that purges timed-out entries and reconciles
//! orphaned index entries.
//!
//! # Expiry
//!
//! The payload key's TTL (set from the queue timeout) is the authoritative
//! expiry. The cleanup pass reconciles ordered-set entries whose payload
//! has TTL'd away, and additionally sweeps by score with the priority
//! slack subtracted, so a prioritized request is never expired early by
//! its score offset.

use crate::config::QueueConfig;
use crate::errors::CallError;
use crate::events::{CallEvent, EventBus};
use crate::lifecycle::Component;
use crate::models::{CallRequest, QueueStatus};
use crate::observability::metrics;
use crate::store::{EnqueueOutcome, SharedStore};
use async_trait::async_trait;
use chrono::Utc;
use common::{ChannelId, RequestId};
use std::sync::Arc;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

/// Priority levels the cleanup score sweep leaves headroom for.
const CLEANUP_PRIORITY_SLACK_LEVELS: i64 = 10;

/// Per-process facade over the shared wait queue.
///
/// Cheaply cloneable; clones share the cleanup task and cancellation
/// token.
#[derive(Clone)]
pub struct QueueManager {
    store: Arc<dyn SharedStore>,
    bus: Arc<dyn EventBus>,
    config: QueueConfig,
    cancel: CancellationToken,
    task: Arc<Mutex<Option<JoinHandle<()>>>>,
}

impl QueueManager {
    pub fn new(store: Arc<dyn SharedStore>, bus: Arc<dyn EventBus>, config: QueueConfig) -> Self {
        Self {
            store,
            bus,
            config,
            cancel: CancellationToken::new(),
            task: Arc::new(Mutex::new(None)),
        }
    }

    /// Queue ordering score: FIFO by enqueue time with a priority offset.
    #[must_use]
    pub fn score(&self, request: &CallRequest) -> f64 {
        let base = request.queued_at.timestamp_millis();
        let offset = i64::from(request.priority) * self.config.priority_weight_ms;
        #[allow(clippy::cast_precision_loss)]
        let score = (base + offset) as f64;
        score
    }

    /// Add a request to the shared queue.
    ///
    /// Also persists the full payload keyed by channel with a TTL equal to
    /// the queue timeout and emits a `Queued` event for immediate-match
    /// attempts.
    ///
    /// # Errors
    ///
    /// - `AlreadyQueued` if the channel already has an entry
    /// - `QueueFull` if the shared queue is at capacity
    #[instrument(skip_all, fields(channel = %request.channel_id, request_id = %request.id))]
    pub async fn enqueue(&self, request: &CallRequest) -> Result<QueueStatus, CallError> {
        let payload = serde_json::to_string(request)?;
        let outcome = self
            .store
            .queue_insert(
                request.channel_id,
                request.id,
                self.score(request),
                &payload,
                self.config.timeout,
                self.config.capacity,
            )
            .await?;

        match outcome {
            EnqueueOutcome::AlreadyQueued => {
                Err(CallError::AlreadyQueued(request.channel_id))
            }
            EnqueueOutcome::Full => Err(CallError::QueueFull),
            EnqueueOutcome::Queued => {
                metrics::incr_enqueued();
                debug!(
                    target: "cc.queue",
                    channel = %request.channel_id,
                    priority = request.priority,
                    "Request queued"
                );
                self.bus.publish(CallEvent::Queued {
                    request: request.clone(),
                });

                let status = self
                    .queue_status(request.channel_id)
                    .await?
                    .unwrap_or(QueueStatus {
                        // Raced with an immediate match or cancellation;
                        // report the tail position rather than failing.
                        position: 1,
                        queue_length: 1,
                    });
                Ok(status)
            }
        }
    }

    /// Remove a request by id.
    ///
    /// Idempotent: returns `false` if the request is no longer present
    /// (already matched or removed). This is the claim primitive that
    /// prevents two concurrent match attempts from both taking the same
    /// request.
    pub async fn dequeue(&self, request_id: RequestId) -> Result<bool, CallError> {
        self.store.queue_remove(request_id).await
    }

    /// Remove a channel's request (cancellation path). Same idempotency
    /// guarantee as [`QueueManager::dequeue`].
    pub async fn dequeue_by_channel(&self, channel: ChannelId) -> Result<bool, CallError> {
        self.store.queue_remove_channel(channel).await
    }

    /// All currently queued requests in rank order.
    ///
    /// Corrupted payloads are purged and skipped rather than failing the
    /// whole read.
    pub async fn pending_requests(&self) -> Result<Vec<CallRequest>, CallError> {
        let entries = self.store.queue_entries().await?;
        let mut requests = Vec::with_capacity(entries.len());

        for entry in entries {
            let Some(payload) = self.store.queue_payload(entry.channel_id).await? else {
                // Payload TTL'd away; the cleanup pass reconciles the
                // ordered-set entry.
                continue;
            };
            match serde_json::from_str::<CallRequest>(&payload) {
                Ok(request) => requests.push(request),
                Err(e) => {
                    warn!(
                        target: "cc.queue",
                        channel = %entry.channel_id,
                        error = %e,
                        "Purging corrupted queue payload"
                    );
                    let _ = self.store.queue_remove_channel(entry.channel_id).await;
                }
            }
        }
        Ok(requests)
    }

    /// Whether the channel has a queued request.
    pub async fn is_in_queue(&self, channel: ChannelId) -> Result<bool, CallError> {
        Ok(self.store.queue_rank(channel).await?.is_some())
    }

    /// Number of queued requests.
    pub async fn queue_len(&self) -> Result<u64, CallError> {
        self.store.queue_len().await
    }

    /// Derived queue position for a channel, if queued.
    pub async fn queue_status(
        &self,
        channel: ChannelId,
    ) -> Result<Option<QueueStatus>, CallError> {
        let Some(rank) = self.store.queue_rank(channel).await? else {
            return Ok(None);
        };
        let queue_length = self.store.queue_len().await?;
        Ok(Some(QueueStatus {
            position: rank + 1,
            queue_length,
        }))
    }

    /// Run a single cleanup pass. Returns the number of entries removed.
    ///
    /// Separated from the task loop for direct testing.
    pub async fn run_cleanup(&self) -> Result<u64, CallError> {
        let timeout_ms = i64::try_from(self.config.timeout.as_millis()).unwrap_or(i64::MAX);
        let slack_ms = self
            .config
            .priority_weight_ms
            .abs()
            .saturating_mul(CLEANUP_PRIORITY_SLACK_LEVELS);
        let cutoff = Utc::now().timestamp_millis() - timeout_ms - slack_ms;

        #[allow(clippy::cast_precision_loss)]
        let removed = self.store.queue_cleanup(cutoff as f64).await?;
        if removed > 0 {
            metrics::incr_requests_expired(removed);
        }
        if let Ok(len) = self.store.queue_len().await {
            metrics::set_queue_length(len);
        }
        Ok(removed)
    }

    async fn cleanup_loop(self) {
        info!(
            target: "cc.queue",
            interval_seconds = self.config.cleanup_interval.as_secs(),
            timeout_seconds = self.config.timeout.as_secs(),
            "Starting queue cleanup task"
        );

        let mut interval = tokio::time::interval(self.config.cleanup_interval);

        loop {
            tokio::select! {
                _ = interval.tick() => {
                    match self.run_cleanup().await {
                        Ok(removed) if removed > 0 => {
                            info!(
                                target: "cc.queue",
                                removed = removed,
                                "Purged timed-out queue entries"
                            );
                        }
                        Ok(_) => {}
                        Err(e) => {
                            // Store might recover; keep the loop alive
                            error!(
                                target: "cc.queue",
                                error = %e,
                                "Queue cleanup pass failed"
                            );
                        }
                    }
                }
                () = self.cancel.cancelled() => {
                    info!(
                        target: "cc.queue",
                        "Queue cleanup task received shutdown signal, exiting"
                    );
                    break;
                }
            }
        }
    }
}

#[async_trait]
impl Component for QueueManager {
    fn name(&self) -> &'static str {
        "queue-manager"
    }

    async fn start(&self) -> Result<(), CallError> {
        let mut task = self.task.lock().await;
        if task.is_some() {
            return Ok(());
        }
        let manager = self.clone();
        *task = Some(tokio::spawn(manager.cleanup_loop()));
        Ok(())
    }

    async fn stop(&self) {
        self.cancel.cancel();
        if let Some(handle) = self.task.lock().await.take() {
            if let Err(e) = handle.await {
                warn!(target: "cc.queue", error = %e, "Cleanup task join failed");
            }
        }
        info!(target: "cc.queue", "Queue manager stopped");
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]
mod tests {
    use super::*;
    use crate::events::BroadcastBus;
    use crate::test_support::fixtures::TestRequest;
    use crate::test_support::MemoryStore;
    use std::time::Duration;

    fn test_config() -> QueueConfig {
        QueueConfig {
            timeout: Duration::from_secs(1800),
            capacity: 100,
            priority_weight_ms: 0,
            cleanup_interval: Duration::from_secs(60),
        }
    }

    fn manager_with(config: QueueConfig) -> (QueueManager, Arc<MemoryStore>) {
        let store = Arc::new(MemoryStore::new());
        let bus = Arc::new(BroadcastBus::default());
        (
            QueueManager::new(store.clone(), bus, config),
            store,
        )
    }

    #[tokio::test]
    async fn test_enqueue_then_dequeue_exactly_once() {
        let (manager, _) = manager_with(test_config());
        let request = TestRequest::for_channel(1).build();

        manager.enqueue(&request).await.unwrap();

        assert!(manager.dequeue(request.id).await.unwrap());
        // Second dequeue of the same id must observe nothing to claim
        assert!(!manager.dequeue(request.id).await.unwrap());
    }

    #[tokio::test]
    async fn test_duplicate_enqueue_rejected() {
        let (manager, _) = manager_with(test_config());
        let request = TestRequest::for_channel(1).build();

        manager.enqueue(&request).await.unwrap();

        let second = TestRequest::for_channel(1).build();
        let result = manager.enqueue(&second).await;
        assert!(matches!(result, Err(CallError::AlreadyQueued(c)) if c == ChannelId(1)));
    }

    #[tokio::test]
    async fn test_capacity_limit() {
        let config = QueueConfig {
            capacity: 2,
            ..test_config()
        };
        let (manager, _) = manager_with(config);

        manager
            .enqueue(&TestRequest::for_channel(1).build())
            .await
            .unwrap();
        manager
            .enqueue(&TestRequest::for_channel(2).build())
            .await
            .unwrap();

        let result = manager.enqueue(&TestRequest::for_channel(3).build()).await;
        assert!(matches!(result, Err(CallError::QueueFull)));
    }

    #[tokio::test]
    async fn test_queue_status_positions_follow_enqueue_order() {
        let (manager, _) = manager_with(test_config());

        for n in 1..=3 {
            manager
                .enqueue(&TestRequest::for_channel(n).build())
                .await
                .unwrap();
        }

        let status = manager.queue_status(ChannelId(1)).await.unwrap().unwrap();
        assert_eq!(status.position, 1);
        assert_eq!(status.queue_length, 3);

        let status = manager.queue_status(ChannelId(3)).await.unwrap().unwrap();
        assert_eq!(status.position, 3);

        assert!(manager.queue_status(ChannelId(99)).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_priority_jumps_ahead_of_fifo() {
        let config = QueueConfig {
            priority_weight_ms: -60_000,
            ..test_config()
        };
        let (manager, _) = manager_with(config);

        manager
            .enqueue(&TestRequest::for_channel(1).build())
            .await
            .unwrap();
        manager
            .enqueue(&TestRequest::for_channel(2).priority(5).build())
            .await
            .unwrap();

        let pending = manager.pending_requests().await.unwrap();
        let first = pending.first().unwrap();
        assert_eq!(first.channel_id, ChannelId(2));
    }

    #[tokio::test]
    async fn test_dequeue_by_channel_idempotent() {
        let (manager, _) = manager_with(test_config());
        let request = TestRequest::for_channel(5).build();

        manager.enqueue(&request).await.unwrap();

        assert!(manager.dequeue_by_channel(ChannelId(5)).await.unwrap());
        assert!(!manager.dequeue_by_channel(ChannelId(5)).await.unwrap());
        // The id index entry is gone too
        assert!(!manager.dequeue(request.id).await.unwrap());
    }

    #[tokio::test]
    async fn test_expired_entries_absent_after_cleanup() {
        let config = QueueConfig {
            timeout: Duration::from_millis(50),
            ..test_config()
        };
        let (manager, _) = manager_with(config);

        manager
            .enqueue(&TestRequest::for_channel(1).build())
            .await
            .unwrap();

        tokio::time::sleep(Duration::from_millis(80)).await;

        let removed = manager.run_cleanup().await.unwrap();
        assert!(removed >= 1, "expired entry should be purged");
        assert!(manager.pending_requests().await.unwrap().is_empty());
        assert_eq!(manager.queue_len().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_corrupted_payload_is_purged_not_fatal() {
        let (manager, store) = manager_with(test_config());

        manager
            .enqueue(&TestRequest::for_channel(1).build())
            .await
            .unwrap();
        // Corrupt a second entry behind the manager's back
        store.inject_queue_entry(ChannelId(2), 2.0, "{not json");

        let pending = manager.pending_requests().await.unwrap();
        assert_eq!(pending.len(), 1);
        let first = pending.first().unwrap();
        assert_eq!(first.channel_id, ChannelId(1));

        // The corrupted entry was purged entirely
        assert!(!manager.is_in_queue(ChannelId(2)).await.unwrap());
    }

    #[tokio::test]
    async fn test_enqueue_emits_queued_event() {
        let store: Arc<MemoryStore> = Arc::new(MemoryStore::new());
        let bus = Arc::new(BroadcastBus::default());
        let manager = QueueManager::new(store, bus.clone(), test_config());
        let mut rx = bus.subscribe();

        let request = TestRequest::for_channel(7).build();
        manager.enqueue(&request).await.unwrap();

        match rx.recv().await.unwrap() {
            CallEvent::Queued { request: queued } => {
                assert_eq!(queued.id, request.id);
            }
            other => panic!("unexpected event: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_cleanup_task_starts_and_stops() {
        let config = QueueConfig {
            cleanup_interval: Duration::from_millis(10),
            ..test_config()
        };
        let (manager, _) = manager_with(config);

        manager.start().await.unwrap();
        tokio::time::sleep(Duration::from_millis(30)).await;
        manager.stop().await;
    }
}
