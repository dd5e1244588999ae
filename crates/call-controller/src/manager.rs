//! Call manager facade.
//!
//! The only surface the external command layer talks to. Wraps the queue,
//! matching engine, coordinator and state store into the public lifecycle
//! API, translating every error into a uniform [`CallResult`] with a
//! client-safe message. Starts the components in dependency order and
//! stops them in reverse.

use crate::coordinator::LeaderCoordinator;
use crate::errors::CallError;
use crate::events::{CallEvent, EventBus};
use crate::lifecycle::Component;
use crate::matching::{MatchingEngine, MatchStatsSnapshot};
use crate::models::{
    ActiveCall, CallMessage, CallRequest, EndReason, EndedCall, QueueStatus,
};
use crate::queue::QueueManager;
use crate::state::{CallStateStore, ParticipantUpdate};
use common::{CallId, ChannelId, GuildId, RequestId, UserId};
use chrono::Utc;
use std::sync::Arc;
use tracing::{error, info, instrument, warn};

/// Identity of a channel as handed over by the command layer.
#[derive(Debug, Clone)]
pub struct ChannelRef {
    pub channel_id: ChannelId,
    pub guild_id: GuildId,
    pub webhook_url: String,
}

/// Uniform result for lifecycle operations.
#[derive(Debug, Clone)]
pub struct CallResult {
    pub success: bool,
    pub message: String,
}

impl CallResult {
    fn ok(message: impl Into<String>) -> Self {
        Self {
            success: true,
            message: message.into(),
        }
    }

    fn failure(err: &CallError, operation: &'static str) -> Self {
        if err.error_code() == 6 {
            error!(
                target: "cc.manager",
                operation = operation,
                error = %err,
                "Operation failed"
            );
        } else {
            info!(
                target: "cc.manager",
                operation = operation,
                error = %err,
                "Operation rejected"
            );
        }
        Self {
            success: false,
            message: err.client_message(),
        }
    }
}

/// Cluster-view statistics for observability consumers.
#[derive(Debug, Clone)]
pub struct DistributedStats {
    pub node_id: String,
    pub is_leader: bool,
    pub queue_length: u64,
    pub active_calls: u64,
    pub total_participants: u64,
    pub matching: MatchStatsSnapshot,
}

enum InitiateOutcome {
    Matched,
    Queued(QueueStatus),
}

/// Orchestrates the call core behind the public lifecycle API.
#[derive(Clone)]
pub struct CallManager {
    queue: QueueManager,
    matching: MatchingEngine,
    state: CallStateStore,
    coordinator: LeaderCoordinator,
    bus: Arc<dyn EventBus>,
    node_id: String,
}

impl CallManager {
    pub fn new(
        queue: QueueManager,
        matching: MatchingEngine,
        state: CallStateStore,
        coordinator: LeaderCoordinator,
        bus: Arc<dyn EventBus>,
        node_id: String,
    ) -> Self {
        Self {
            queue,
            matching,
            state,
            coordinator,
            bus,
            node_id,
        }
    }

    /// Start all components in dependency order.
    pub async fn start(&self) -> Result<(), CallError> {
        for component in self.components() {
            info!(
                target: "cc.manager",
                component = component.name(),
                "Starting component"
            );
            component.start().await?;
        }
        Ok(())
    }

    /// Stop all components in reverse dependency order.
    pub async fn stop(&self) {
        for component in self.components().into_iter().rev() {
            info!(
                target: "cc.manager",
                component = component.name(),
                "Stopping component"
            );
            component.stop().await;
        }
    }

    fn components(&self) -> Vec<&dyn Component> {
        vec![
            &self.state,
            &self.coordinator,
            &self.queue,
            &self.matching,
        ]
    }

    /// Ask for a call: validates the channel is idle, enqueues, and
    /// attempts an immediate match before the next sweep.
    #[instrument(skip_all, fields(channel = %channel.channel_id, initiator = %initiator))]
    pub async fn initiate_call(&self, channel: ChannelRef, initiator: UserId) -> CallResult {
        match self.try_initiate(channel, initiator).await {
            Ok(InitiateOutcome::Matched) => {
                CallResult::ok("Connected to a partner channel. Say hello!")
            }
            Ok(InitiateOutcome::Queued(status)) => CallResult::ok(format!(
                "Waiting for a partner... position {} of {}",
                status.position, status.queue_length
            )),
            Err(e) => CallResult::failure(&e, "initiate_call"),
        }
    }

    async fn try_initiate(
        &self,
        channel: ChannelRef,
        initiator: UserId,
    ) -> Result<InitiateOutcome, CallError> {
        if self
            .state
            .active_call_by_channel(channel.channel_id)
            .await?
            .is_some()
        {
            return Err(CallError::AlreadyInCall(channel.channel_id));
        }

        let request = CallRequest {
            id: RequestId::new(),
            channel_id: channel.channel_id,
            guild_id: channel.guild_id,
            webhook_url: channel.webhook_url,
            initiator_id: initiator,
            queued_at: Utc::now(),
            priority: 0,
        };

        let status = self.queue.enqueue(&request).await?;

        // Immediate match attempt; a failure here leaves the request
        // queued for the next sweep rather than failing the initiate.
        match self.matching.find_match(&request).await {
            Ok(outcome) if outcome.matched => Ok(InitiateOutcome::Matched),
            Ok(_) => Ok(InitiateOutcome::Queued(status)),
            Err(e) => {
                warn!(
                    target: "cc.manager",
                    error = %e,
                    "Immediate match attempt failed, request stays queued"
                );
                Ok(InitiateOutcome::Queued(status))
            }
        }
    }

    /// Leave the queue or end the active call.
    ///
    /// A hangup racing a concurrent match resolves through the same
    /// idempotent dequeue the match uses: exactly one of "cancelled" or
    /// "matched" wins.
    #[instrument(skip_all, fields(channel = %channel_id))]
    pub async fn hangup_call(&self, channel_id: ChannelId) -> CallResult {
        match self.try_hangup(channel_id).await {
            Ok(message) => CallResult::ok(message),
            Err(e) => CallResult::failure(&e, "hangup_call"),
        }
    }

    async fn try_hangup(&self, channel_id: ChannelId) -> Result<&'static str, CallError> {
        if self.queue.dequeue_by_channel(channel_id).await? {
            return Ok("Left the call queue");
        }

        let Some(call) = self.state.active_call_by_channel(channel_id).await? else {
            return Err(CallError::NotInCallOrQueue(channel_id));
        };

        if let Some(other) = call.other_side(channel_id) {
            let notify_channel = other.channel_id;
            if self
                .state
                .end_call(call.id, EndReason::Hangup, false)
                .await?
                .is_some()
            {
                self.bus.publish(CallEvent::Ended {
                    call_id: call.id,
                    notify_channel,
                    reason: EndReason::Hangup,
                });
            }
        }
        Ok("Call ended")
    }

    /// End the current call for this channel only and immediately queue a
    /// new request for it.
    #[instrument(skip_all, fields(channel = %channel_id, user = %user_id))]
    pub async fn skip_call(&self, channel_id: ChannelId, user_id: UserId) -> CallResult {
        match self.try_skip(channel_id, user_id).await {
            Ok(InitiateOutcome::Matched) => {
                CallResult::ok("Skipped. Connected to a new partner channel!")
            }
            Ok(InitiateOutcome::Queued(status)) => CallResult::ok(format!(
                "Skipped. Waiting for a new partner... position {} of {}",
                status.position, status.queue_length
            )),
            Err(e) => CallResult::failure(&e, "skip_call"),
        }
    }

    async fn try_skip(
        &self,
        channel_id: ChannelId,
        user_id: UserId,
    ) -> Result<InitiateOutcome, CallError> {
        let Some(call) = self.state.active_call_by_channel(channel_id).await? else {
            return Err(CallError::NotInCallOrQueue(channel_id));
        };
        let me = call
            .participant(channel_id)
            .ok_or_else(|| CallError::ParticipantNotFound(channel_id.to_string()))?
            .clone();

        if let Some(other) = call.other_side(channel_id) {
            let notify_channel = other.channel_id;
            if self
                .state
                .end_call(call.id, EndReason::Skip, false)
                .await?
                .is_some()
            {
                self.bus.publish(CallEvent::Ended {
                    call_id: call.id,
                    notify_channel,
                    reason: EndReason::Skip,
                });
            }
        }

        self.try_initiate(
            ChannelRef {
                channel_id,
                guild_id: me.guild_id,
                webhook_url: me.webhook_url,
            },
            user_id,
        )
        .await
    }

    /// A user joined the channel side of an active call.
    pub async fn add_participant(&self, channel_id: ChannelId, user_id: UserId) -> CallResult {
        match self.try_update_participant(channel_id, user_id, ParticipantUpdate::Joined).await {
            Ok(_) => CallResult::ok("Joined the call"),
            Err(e) => CallResult::failure(&e, "add_participant"),
        }
    }

    /// A user left the channel side of an active call. Ends the call when
    /// the side's user set drains.
    pub async fn remove_participant(&self, channel_id: ChannelId, user_id: UserId) -> CallResult {
        match self.try_update_participant(channel_id, user_id, ParticipantUpdate::Left).await {
            Ok(true) => CallResult::ok("Call ended (everyone left)"),
            Ok(false) => CallResult::ok("Left the call"),
            Err(e) => CallResult::failure(&e, "remove_participant"),
        }
    }

    /// Returns `true` when the mutation drained the side and ended the
    /// call.
    async fn try_update_participant(
        &self,
        channel_id: ChannelId,
        user_id: UserId,
        update: ParticipantUpdate,
    ) -> Result<bool, CallError> {
        let Some(call) = self.state.active_call_by_channel(channel_id).await? else {
            return Err(CallError::NotInCallOrQueue(channel_id));
        };

        let change = self
            .state
            .update_participant(call.id, channel_id, user_id, update)
            .await?;

        if update == ParticipantUpdate::Left && change.remaining == 0 {
            if let Some(other) = call.other_side(channel_id) {
                let notify_channel = other.channel_id;
                if self
                    .state
                    .end_call(call.id, EndReason::Drained, false)
                    .await?
                    .is_some()
                {
                    self.bus.publish(CallEvent::Ended {
                        call_id: call.id,
                        notify_channel,
                        reason: EndReason::Drained,
                    });
                }
            }
            return Ok(true);
        }
        Ok(false)
    }

    /// Relay entry point for in-call chat: append to the call log.
    pub async fn update_call_message(
        &self,
        channel_id: ChannelId,
        message: CallMessage,
    ) -> CallResult {
        match self.try_update_message(channel_id, &message).await {
            Ok(()) => CallResult::ok("Message relayed"),
            Err(e) => CallResult::failure(&e, "update_call_message"),
        }
    }

    async fn try_update_message(
        &self,
        channel_id: ChannelId,
        message: &CallMessage,
    ) -> Result<(), CallError> {
        let Some(call) = self.state.active_call_by_channel(channel_id).await? else {
            return Err(CallError::NotInCallOrQueue(channel_id));
        };
        self.state.add_message(call.id, channel_id, message).await?;
        Ok(())
    }

    /// The active call a channel currently belongs to.
    pub async fn get_active_call(
        &self,
        channel_id: ChannelId,
    ) -> Result<Option<ActiveCall>, CallError> {
        self.state.active_call_by_channel(channel_id).await
    }

    /// Derived queue position for a channel.
    pub async fn get_queue_status(
        &self,
        channel_id: ChannelId,
    ) -> Result<Option<QueueStatus>, CallError> {
        self.queue.queue_status(channel_id).await
    }

    /// Ended-call lookup: hot cache first, then the durable archive.
    pub async fn get_ended_call_data(
        &self,
        call_id: CallId,
    ) -> Result<Option<EndedCall>, CallError> {
        self.state.ended_call(call_id).await
    }

    /// Cluster-view statistics.
    pub async fn get_distributed_stats(&self) -> Result<DistributedStats, CallError> {
        let queue_length = self.queue.queue_len().await?;
        let state = self.state.state_stats().await?;
        Ok(DistributedStats {
            node_id: self.node_id.clone(),
            is_leader: self.coordinator.is_leader(),
            queue_length,
            active_calls: state.active_calls,
            total_participants: state.total_participants,
            matching: self.matching.stats().snapshot(),
        })
    }
}
