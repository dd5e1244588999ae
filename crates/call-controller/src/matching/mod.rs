//! Matching engine.
//!
//! Pairs compatible queued requests two ways:
//! - **Immediate match**: attempted on every enqueue (any process), so the
//!   common case resolves well under the sweep interval.
//! - **Background sweep**: interval-driven pass that pairs as many
//!   compatible requests as possible in queue order. Runs only on the
//!   cluster-wide leader.
//!
//! Both paths claim requests through the queue's idempotent dequeue, so
//! racing processes resolve every claim to exactly one winner.
//!
//! # Claim order
//!
//! Both sides of a pair are claimed in a canonical cross-process order
//! (older request first, request id as tie-break). Two processes racing
//! over the same pair therefore collide on the FIRST claim: the loser
//! backs off having consumed nothing, and exactly one call is created -
//! never zero, never two. The residual asymmetric race (a third process
//! steals the second claim) can consume a request without producing a
//! call; the error model tolerates that, since re-initiating is cheap.

pub mod compatibility;
pub mod stats;

pub use stats::{MatchStats, MatchStatsSnapshot};

use crate::config::MatchingConfig;
use crate::coordinator::LeaderCoordinator;
use crate::errors::CallError;
use crate::events::{CallEvent, EventBus, MatchedSide};
use crate::lifecycle::Component;
use crate::models::CallRequest;
use crate::observability::metrics;
use crate::queue::QueueManager;
use crate::state::CallStateStore;
use crate::store::SharedStore;
use async_trait::async_trait;
use chrono::Utc;
use common::{CallId, ChannelId, RequestId};
use compatibility::{cooldown_key, rules_allow};
use std::collections::HashSet;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

/// Result of a match attempt for one request.
#[derive(Debug, Clone)]
pub struct MatchOutcome {
    pub matched: bool,
    pub call_id: Option<CallId>,
    pub participants: Option<[ChannelId; 2]>,
    /// Wall time the attempt took.
    pub match_time: Duration,
}

impl MatchOutcome {
    fn unmatched(match_time: Duration) -> Self {
        Self {
            matched: false,
            call_id: None,
            participants: None,
            match_time,
        }
    }
}

/// Canonical cross-process claim order: the older request is claimed
/// first, with the request id breaking ties. Every process uses the same
/// order, so symmetric races collide on the first claim.
fn claims_first(x: &CallRequest, y: &CallRequest) -> bool {
    (x.queued_at, x.id.0) < (y.queued_at, y.id.0)
}

/// Pairs compatible queued requests and creates call sessions.
///
/// Cheaply cloneable; clones share the sweep task, statistics and
/// cancellation token.
#[derive(Clone)]
pub struct MatchingEngine {
    store: Arc<dyn SharedStore>,
    queue: QueueManager,
    state: CallStateStore,
    coordinator: LeaderCoordinator,
    bus: Arc<dyn EventBus>,
    config: MatchingConfig,
    stats: MatchStats,
    cancel: CancellationToken,
    task: Arc<Mutex<Option<JoinHandle<()>>>>,
}

impl MatchingEngine {
    pub fn new(
        store: Arc<dyn SharedStore>,
        queue: QueueManager,
        state: CallStateStore,
        coordinator: LeaderCoordinator,
        bus: Arc<dyn EventBus>,
        config: MatchingConfig,
    ) -> Self {
        Self {
            store,
            queue,
            state,
            coordinator,
            bus,
            config,
            stats: MatchStats::new(),
            cancel: CancellationToken::new(),
            task: Arc::new(Mutex::new(None)),
        }
    }

    /// Running match statistics for this process.
    #[must_use]
    pub fn stats(&self) -> &MatchStats {
        &self.stats
    }

    /// Whether the pair passes the async cooldown rule.
    async fn outside_cooldown(
        &self,
        a: &CallRequest,
        b: &CallRequest,
    ) -> Result<bool, CallError> {
        let key = cooldown_key(a.initiator_id, b.initiator_id);
        Ok(!self.store.cooldown_exists(&key).await?)
    }

    /// Attempt a single match for `request` against the current queue.
    ///
    /// On success both requests have been atomically removed from the
    /// queue and the call exists in the state store. Runs on any process;
    /// the idempotent dequeue resolves races with sweeps, hangups and
    /// other immediate attempts.
    #[instrument(skip_all, fields(channel = %request.channel_id, request_id = %request.id))]
    pub async fn find_match(&self, request: &CallRequest) -> Result<MatchOutcome, CallError> {
        let started = Instant::now();
        self.stats.record_attempt();

        let pending = self.queue.pending_requests().await?;
        let now = Utc::now();
        let mut request_claimed = false;

        for candidate in pending.iter().filter(|c| c.id != request.id) {
            if !rules_allow(request, candidate, now, &self.config) {
                continue;
            }
            if !self.outside_cooldown(request, candidate).await? {
                debug!(
                    target: "cc.matching",
                    candidate = %candidate.channel_id,
                    "Skipping candidate inside cooldown window"
                );
                continue;
            }

            if claims_first(request, candidate) {
                if !request_claimed {
                    if !self.queue.dequeue(request.id).await? {
                        // Another process already matched the requester;
                        // nothing was consumed here.
                        return Ok(MatchOutcome::unmatched(started.elapsed()));
                    }
                    request_claimed = true;
                }
                if !self.queue.dequeue(candidate.id).await? {
                    debug!(
                        target: "cc.matching",
                        candidate = %candidate.channel_id,
                        "Candidate claimed elsewhere, trying next"
                    );
                    continue;
                }
            } else {
                if !self.queue.dequeue(candidate.id).await? {
                    debug!(
                        target: "cc.matching",
                        candidate = %candidate.channel_id,
                        "Candidate claimed elsewhere, trying next"
                    );
                    continue;
                }
                if !request_claimed {
                    if !self.queue.dequeue(request.id).await? {
                        // The candidate's claim is consumed but the
                        // requester was matched concurrently; the
                        // candidate must re-initiate.
                        warn!(
                            target: "cc.matching",
                            channel = %request.channel_id,
                            candidate = %candidate.channel_id,
                            "Requester claimed concurrently, abandoning match"
                        );
                        self.record_abandoned();
                        return Ok(MatchOutcome::unmatched(started.elapsed()));
                    }
                    request_claimed = true;
                }
            }

            let call_id = self.finalize_match(request, candidate).await?;
            return Ok(MatchOutcome {
                matched: true,
                call_id: Some(call_id),
                participants: Some([request.channel_id, candidate.channel_id]),
                match_time: started.elapsed(),
            });
        }

        if request_claimed {
            // The requester was claimed while pursuing candidates that all
            // slipped away; it must be re-submitted.
            warn!(
                target: "cc.matching",
                channel = %request.channel_id,
                "Request consumed without a partner"
            );
            self.record_abandoned();
        }
        Ok(MatchOutcome::unmatched(started.elapsed()))
    }

    /// One background sweep pass: pair as many compatible requests as
    /// possible in queue order, skipping entries already claimed within
    /// the pass. Returns the number of calls created.
    ///
    /// Normally driven by the leader's sweep task; exposed for direct
    /// invocation by tests and operational tooling.
    pub async fn run_sweep(&self) -> Result<u64, CallError> {
        let pending = self.queue.pending_requests().await?;
        if pending.len() < 2 {
            return Ok(0);
        }

        let now = Utc::now();
        let mut claimed: HashSet<RequestId> = HashSet::new();
        let mut pairs = 0u64;

        for (i, a) in pending.iter().enumerate() {
            if claimed.contains(&a.id) {
                continue;
            }
            self.stats.record_attempt();

            let mut a_claimed = false;
            let mut partner: Option<&CallRequest> = None;

            for b in pending.iter().skip(i + 1) {
                if claimed.contains(&b.id) || !rules_allow(a, b, now, &self.config) {
                    continue;
                }
                if !self.outside_cooldown(a, b).await? {
                    continue;
                }

                if claims_first(a, b) {
                    if !a_claimed {
                        if !self.queue.dequeue(a.id).await? {
                            claimed.insert(a.id);
                            break;
                        }
                        a_claimed = true;
                    }
                    if !self.queue.dequeue(b.id).await? {
                        claimed.insert(b.id);
                        continue;
                    }
                } else {
                    if !self.queue.dequeue(b.id).await? {
                        claimed.insert(b.id);
                        continue;
                    }
                    if !a_claimed {
                        if !self.queue.dequeue(a.id).await? {
                            warn!(
                                target: "cc.matching",
                                channel = %a.channel_id,
                                candidate = %b.channel_id,
                                "Sweep lost a claimed request to a concurrent match"
                            );
                            self.record_abandoned();
                            claimed.insert(a.id);
                            claimed.insert(b.id);
                            break;
                        }
                        a_claimed = true;
                    }
                }

                partner = Some(b);
                break;
            }

            if let Some(b) = partner {
                claimed.insert(a.id);
                claimed.insert(b.id);
                match self.finalize_match(a, b).await {
                    Ok(_) => pairs += 1,
                    Err(e) => {
                        // Both requests are already consumed; the callers
                        // re-initiate. Nothing dangling remains.
                        error!(
                            target: "cc.matching",
                            error = %e,
                            channel_a = %a.channel_id,
                            channel_b = %b.channel_id,
                            "Failed to create call for matched pair"
                        );
                    }
                }
            } else if a_claimed {
                claimed.insert(a.id);
                warn!(
                    target: "cc.matching",
                    channel = %a.channel_id,
                    "Sweep consumed a request without a partner"
                );
                self.record_abandoned();
            }
        }

        Ok(pairs)
    }

    fn record_abandoned(&self) {
        self.stats.record_abandoned();
        metrics::incr_matches_abandoned();
    }

    /// Create the call for two claimed requests and record the bookkeeping
    /// around it (cooldown, statistics, events).
    async fn finalize_match(
        &self,
        a: &CallRequest,
        b: &CallRequest,
    ) -> Result<CallId, CallError> {
        let call = self.state.create_call(a, b).await?;
        let now = Utc::now();

        // Cooldown is advisory; a write failure must not undo the match
        let key = cooldown_key(a.initiator_id, b.initiator_id);
        if let Err(e) = self.store.cooldown_put(&key, self.config.cooldown).await {
            warn!(
                target: "cc.matching",
                error = %e,
                "Failed to record match cooldown"
            );
        }

        let wait_a = (now - a.queued_at).to_std().unwrap_or_default();
        let wait_b = (now - b.queued_at).to_std().unwrap_or_default();
        self.stats.record_match([wait_a, wait_b]);
        metrics::incr_matches();
        metrics::record_match_latency(wait_a);
        metrics::record_match_latency(wait_b);

        self.bus.publish(CallEvent::Matched {
            call_id: call.id,
            sides: [
                MatchedSide {
                    channel_id: a.channel_id,
                    guild_id: a.guild_id,
                    webhook_url: a.webhook_url.clone(),
                },
                MatchedSide {
                    channel_id: b.channel_id,
                    guild_id: b.guild_id,
                    webhook_url: b.webhook_url.clone(),
                },
            ],
        });

        info!(
            target: "cc.matching",
            call_id = %call.id,
            channel_a = %a.channel_id,
            channel_b = %b.channel_id,
            wait_a_ms = wait_a.as_millis() as u64,
            wait_b_ms = wait_b.as_millis() as u64,
            "Matched two requests"
        );
        Ok(call.id)
    }

    async fn sweep_loop(self) {
        info!(
            target: "cc.matching",
            interval_ms = self.config.sweep_interval.as_millis() as u64,
            "Starting matching sweep task"
        );

        let mut interval = tokio::time::interval(self.config.sweep_interval);

        loop {
            tokio::select! {
                _ = interval.tick() => {
                    // Only the elected leader sweeps; immediate matches
                    // still run everywhere.
                    if !self.coordinator.is_leader() {
                        continue;
                    }
                    let started = Instant::now();
                    match self.run_sweep().await {
                        Ok(pairs) => {
                            metrics::record_sweep_duration(started.elapsed());
                            if pairs > 0 {
                                info!(
                                    target: "cc.matching",
                                    pairs = pairs,
                                    "Sweep created calls"
                                );
                            }
                        }
                        Err(e) => {
                            error!(
                                target: "cc.matching",
                                error = %e,
                                "Matching sweep failed"
                            );
                        }
                    }
                }
                () = self.cancel.cancelled() => {
                    info!(
                        target: "cc.matching",
                        "Matching sweep task received shutdown signal, exiting"
                    );
                    break;
                }
            }
        }
    }
}

#[async_trait]
impl Component for MatchingEngine {
    fn name(&self) -> &'static str {
        "matching-engine"
    }

    async fn start(&self) -> Result<(), CallError> {
        let mut task = self.task.lock().await;
        if task.is_some() {
            return Ok(());
        }
        let engine = self.clone();
        *task = Some(tokio::spawn(engine.sweep_loop()));
        Ok(())
    }

    async fn stop(&self) {
        self.cancel.cancel();
        if let Some(handle) = self.task.lock().await.take() {
            if let Err(e) = handle.await {
                warn!(target: "cc.matching", error = %e, "Sweep task join failed");
            }
        }
        info!(target: "cc.matching", "Matching engine stopped");
    }
}
