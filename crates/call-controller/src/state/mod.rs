//! Distributed active-call state.
//!
//! The authoritative copy of every active call lives in the shared store
//! so any process can read or mutate it: an immutable creation record,
//! a status key carrying the one allowed terminal transition, native sets
//! for each side's users, and a list for the message log. This module
//! assembles those pieces into domain types and owns the ended-call flow
//! (atomic end, hot retention copy, durable archive).

pub mod durable;

pub use durable::{DurableCallStore, PgCallArchive};

use crate::config::StateConfig;
use crate::errors::CallError;
use crate::events::{CallEvent, EventBus};
use crate::lifecycle::Component;
use crate::models::{
    ActiveCall, CallMessage, CallParticipant, CallRequest, CallStatus, EndReason, EndedCall,
};
use crate::observability::metrics;
use crate::store::SharedStore;
use async_trait::async_trait;
use chrono::{DateTime, Duration as ChronoDuration, TimeZone, Utc};
use common::{CallId, ChannelId, GuildId, UserId};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, instrument, warn};

/// How often the call-expiry pass runs.
const CALL_EXPIRY_CHECK_INTERVAL: Duration = Duration::from_secs(60);

/// Immutable creation record stored at `call:{id}`.
///
/// Mutable call state (status, users, messages, counts) lives in separate
/// store structures so no JSON is ever rewritten in place.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub(crate) struct CallRecord {
    pub id: CallId,
    #[serde(with = "chrono::serde::ts_milliseconds")]
    pub started_at: DateTime<Utc>,
    pub sides: [SideRecord; 2],
}

/// One side of a call as captured at creation time.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub(crate) struct SideRecord {
    pub channel_id: ChannelId,
    pub guild_id: GuildId,
    pub webhook_url: String,
    pub initiator_id: UserId,
    #[serde(with = "chrono::serde::ts_milliseconds")]
    pub joined_at: DateTime<Utc>,
}

impl SideRecord {
    fn from_request(request: &CallRequest, joined_at: DateTime<Utc>) -> Self {
        Self {
            channel_id: request.channel_id,
            guild_id: request.guild_id,
            webhook_url: request.webhook_url.clone(),
            initiator_id: request.initiator_id,
            joined_at,
        }
    }
}

/// Participant mutation kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParticipantUpdate {
    Joined,
    Left,
}

/// Result of a participant mutation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ParticipantChange {
    /// Whether the user set actually changed.
    pub changed: bool,
    /// Users remaining on the affected side.
    pub remaining: u64,
}

/// Aggregate state counts for observability.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StateStats {
    pub active_calls: u64,
    pub total_participants: u64,
}

/// Authoritative record of active calls, readable and writable from any
/// process.
///
/// Cheaply cloneable; clones share the expiry task and cancellation
/// token.
#[derive(Clone)]
pub struct CallStateStore {
    store: Arc<dyn SharedStore>,
    durable: Arc<dyn DurableCallStore>,
    bus: Arc<dyn EventBus>,
    config: StateConfig,
    cancel: CancellationToken,
    task: Arc<Mutex<Option<JoinHandle<()>>>>,
}

impl CallStateStore {
    pub fn new(
        store: Arc<dyn SharedStore>,
        durable: Arc<dyn DurableCallStore>,
        bus: Arc<dyn EventBus>,
        config: StateConfig,
    ) -> Self {
        Self {
            store,
            durable,
            bus,
            config,
            cancel: CancellationToken::new(),
            task: Arc::new(Mutex::new(None)),
        }
    }

    /// Create an active call from two matched requests.
    ///
    /// Each side starts with its initiating user present, so a side only
    /// drains when every user has left.
    #[instrument(skip_all, fields(channel_a = %a.channel_id, channel_b = %b.channel_id))]
    pub async fn create_call(
        &self,
        a: &CallRequest,
        b: &CallRequest,
    ) -> Result<ActiveCall, CallError> {
        let call_id = CallId::new();
        let started_at = Utc::now();
        let record = CallRecord {
            id: call_id,
            started_at,
            sides: [
                SideRecord::from_request(a, started_at),
                SideRecord::from_request(b, started_at),
            ],
        };
        let json = serde_json::to_string(&record)?;

        self.store
            .call_create(call_id, &json, [a.channel_id, b.channel_id])
            .await?;
        self.store
            .call_user_add(call_id, a.channel_id, a.initiator_id)
            .await?;
        self.store
            .call_user_add(call_id, b.channel_id, b.initiator_id)
            .await?;

        info!(
            target: "cc.state",
            call_id = %call_id,
            channel_a = %a.channel_id,
            channel_b = %b.channel_id,
            "Call created"
        );

        let [side_a, side_b] = &record.sides;
        Ok(ActiveCall {
            id: call_id,
            participants: [
                participant_from(side_a, HashSet::from([a.initiator_id]), 0),
                participant_from(side_b, HashSet::from([b.initiator_id]), 0),
            ],
            started_at,
            ended_at: None,
            messages: Vec::new(),
            status: CallStatus::Active,
        })
    }

    /// The active call a channel currently belongs to, if any.
    pub async fn active_call_by_channel(
        &self,
        channel: ChannelId,
    ) -> Result<Option<ActiveCall>, CallError> {
        let Some(call_id) = self.store.call_for_channel(channel).await? else {
            return Ok(None);
        };
        match self.get_call(call_id).await? {
            Some(call) if call.status == CallStatus::Active => Ok(Some(call)),
            _ => Ok(None),
        }
    }

    /// Assemble the full call view from store structures.
    ///
    /// Returns ended calls too while their keys are within the grace
    /// window; corrupted records resolve to `None` rather than failing.
    pub async fn get_call(&self, call_id: CallId) -> Result<Option<ActiveCall>, CallError> {
        let Some(record) = self.load_record(call_id).await? else {
            return Ok(None);
        };

        let status = match self.store.call_status(call_id).await?.as_deref() {
            Some("ended") => CallStatus::Ended,
            _ => CallStatus::Active,
        };
        let ended_at = match status {
            CallStatus::Ended => self
                .store
                .call_end_info(call_id)
                .await?
                .and_then(|info| Utc.timestamp_millis_opt(info.ended_at_ms).single()),
            CallStatus::Active => None,
        };

        let participants = self.load_participants(call_id, &record).await?;
        let messages = self.load_messages(call_id).await?;

        Ok(Some(ActiveCall {
            id: call_id,
            participants,
            started_at: record.started_at,
            ended_at,
            messages,
            status,
        }))
    }

    /// Add or remove a user on one side of a call.
    ///
    /// A side whose user set drains to empty makes the call eligible for
    /// automatic termination by the call manager.
    #[instrument(skip_all, fields(call_id = %call_id, channel = %channel, user = %user))]
    pub async fn update_participant(
        &self,
        call_id: CallId,
        channel: ChannelId,
        user: UserId,
        update: ParticipantUpdate,
    ) -> Result<ParticipantChange, CallError> {
        let Some(record) = self.load_record(call_id).await? else {
            return Err(CallError::CallNotFound(call_id.to_string()));
        };
        if !record.sides.iter().any(|s| s.channel_id == channel) {
            return Err(CallError::ParticipantNotFound(format!(
                "channel {channel} is not part of call {call_id}"
            )));
        }

        match update {
            ParticipantUpdate::Joined => {
                let added = self.store.call_user_add(call_id, channel, user).await?;
                let remaining = self.store.call_users(call_id, channel).await?.len() as u64;
                Ok(ParticipantChange {
                    changed: added,
                    remaining,
                })
            }
            ParticipantUpdate::Left => {
                let removal = self.store.call_user_remove(call_id, channel, user).await?;
                Ok(ParticipantChange {
                    changed: removal.removed,
                    remaining: removal.remaining,
                })
            }
        }
    }

    /// Append a relayed message to the call log and bump the originating
    /// side's count. Returns the side's new count.
    ///
    /// Ordering within one side is arrival order; concurrent messages from
    /// both sides may interleave, which is acceptable since each message
    /// carries its own timestamp.
    pub async fn add_message(
        &self,
        call_id: CallId,
        channel: ChannelId,
        message: &CallMessage,
    ) -> Result<u64, CallError> {
        let json = serde_json::to_string(message)?;
        self.store.call_message_push(call_id, channel, &json).await
    }

    /// Atomically end a call.
    ///
    /// Exactly one of multiple racing enders observes `Some(record)`; the
    /// rest get `None`. The winner writes the assembled record to the hot
    /// cache and to durable storage (best effort).
    #[instrument(skip_all, fields(call_id = %call_id, reason = %reason, flagged = flagged))]
    pub async fn end_call(
        &self,
        call_id: CallId,
        reason: EndReason,
        flagged: bool,
    ) -> Result<Option<EndedCall>, CallError> {
        let Some(record) = self.load_record(call_id).await? else {
            return Err(CallError::CallNotFound(call_id.to_string()));
        };

        let retention = if flagged {
            self.config.flagged_retention
        } else {
            self.config.ended_retention
        };
        let ended_at = Utc::now();
        let [side_a, side_b] = &record.sides;
        let channels = [side_a.channel_id, side_b.channel_id];

        let ended = self
            .store
            .call_end(
                call_id,
                channels,
                ended_at.timestamp_millis(),
                reason.as_str(),
                flagged,
                retention,
            )
            .await?;
        if !ended {
            return Ok(None);
        }

        // The winner assembles the final record while the call keys are
        // still within the grace window.
        let participants = self.load_participants(call_id, &record).await?;
        let messages = self.load_messages(call_id).await?;
        let final_record = EndedCall {
            id: call_id,
            participants,
            started_at: record.started_at,
            ended_at,
            reason,
            flagged,
            messages,
        };

        match serde_json::to_string(&final_record) {
            Ok(json) => {
                if let Err(e) = self.store.ended_put(call_id, &json, retention).await {
                    warn!(
                        target: "cc.state",
                        call_id = %call_id,
                        error = %e,
                        "Failed to write ended-call hot copy"
                    );
                }
            }
            Err(e) => {
                warn!(
                    target: "cc.state",
                    call_id = %call_id,
                    error = %e,
                    "Failed to serialize ended-call record"
                );
            }
        }

        if let Err(e) = self.durable.record(&final_record).await {
            // Best effort: the hot copy still serves reads for the
            // retention window
            error!(
                target: "cc.state",
                call_id = %call_id,
                error = %e,
                "Failed to archive ended call"
            );
        }

        metrics::incr_calls_ended(reason.as_str());
        info!(
            target: "cc.state",
            call_id = %call_id,
            reason = %reason,
            "Call ended"
        );
        Ok(Some(final_record))
    }

    /// Ended-call lookup: hot cache first, then the durable archive.
    pub async fn ended_call(&self, call_id: CallId) -> Result<Option<EndedCall>, CallError> {
        if let Some(json) = self.store.ended_get(call_id).await? {
            match serde_json::from_str::<EndedCall>(&json) {
                Ok(record) => return Ok(Some(record)),
                Err(e) => {
                    warn!(
                        target: "cc.state",
                        call_id = %call_id,
                        error = %e,
                        "Corrupted hot ended-call record, falling back to archive"
                    );
                }
            }
        }
        self.durable.fetch(call_id).await
    }

    /// Aggregate counts for observability.
    pub async fn state_stats(&self) -> Result<StateStats, CallError> {
        let ids = self.store.call_ids().await?;
        let active_calls = ids.len() as u64;
        let mut total_participants = 0u64;

        for call_id in ids {
            let Some(record) = self.load_record(call_id).await? else {
                continue;
            };
            for side in &record.sides {
                total_participants += self
                    .store
                    .call_users(call_id, side.channel_id)
                    .await?
                    .len() as u64;
            }
        }

        metrics::set_active_calls(active_calls);
        Ok(StateStats {
            active_calls,
            total_participants,
        })
    }

    /// Run one call-expiry pass: end calls older than the configured
    /// maximum lifetime and notify both sides. Returns the number of
    /// calls ended by THIS pass.
    ///
    /// Safe to run on every process concurrently: the terminal transition
    /// is idempotent, so each expired call is finalized exactly once.
    /// Separated from the task loop for direct testing.
    pub async fn run_expiry(&self) -> Result<u64, CallError> {
        let cutoff = Utc::now()
            - ChronoDuration::from_std(self.config.call_timeout).unwrap_or(ChronoDuration::MAX);
        let mut ended = 0u64;

        for call_id in self.store.call_ids().await? {
            let Some(record) = self.load_record(call_id).await? else {
                continue;
            };
            if record.started_at > cutoff {
                continue;
            }
            let final_record = match self.end_call(call_id, EndReason::Timeout, false).await {
                Ok(Some(record)) => record,
                // Already ended, or torn down between the scan and here
                Ok(None) | Err(CallError::CallNotFound(_)) => continue,
                Err(e) => return Err(e),
            };
            ended += 1;
            for participant in &final_record.participants {
                self.bus.publish(CallEvent::Ended {
                    call_id,
                    notify_channel: participant.channel_id,
                    reason: EndReason::Timeout,
                });
            }
        }
        Ok(ended)
    }

    async fn expiry_loop(self) {
        info!(
            target: "cc.state",
            call_timeout_seconds = self.config.call_timeout.as_secs(),
            "Starting call expiry task"
        );

        let mut interval = tokio::time::interval(CALL_EXPIRY_CHECK_INTERVAL);

        loop {
            tokio::select! {
                _ = interval.tick() => {
                    match self.run_expiry().await {
                        Ok(ended) if ended > 0 => {
                            info!(
                                target: "cc.state",
                                ended = ended,
                                "Ended calls past their maximum lifetime"
                            );
                        }
                        Ok(_) => {}
                        Err(e) => {
                            error!(
                                target: "cc.state",
                                error = %e,
                                "Call expiry pass failed"
                            );
                        }
                    }
                }
                () = self.cancel.cancelled() => {
                    info!(
                        target: "cc.state",
                        "Call expiry task received shutdown signal, exiting"
                    );
                    break;
                }
            }
        }
    }

    async fn load_record(&self, call_id: CallId) -> Result<Option<CallRecord>, CallError> {
        let Some(raw) = self.store.call_meta(call_id).await? else {
            return Ok(None);
        };
        match serde_json::from_str::<CallRecord>(&raw) {
            Ok(record) => Ok(Some(record)),
            Err(e) => {
                error!(
                    target: "cc.state",
                    call_id = %call_id,
                    error = %e,
                    "Corrupted call record"
                );
                Ok(None)
            }
        }
    }

    async fn load_participants(
        &self,
        call_id: CallId,
        record: &CallRecord,
    ) -> Result<[CallParticipant; 2], CallError> {
        let [side_a, side_b] = &record.sides;
        let a = self.load_participant(call_id, side_a).await?;
        let b = self.load_participant(call_id, side_b).await?;
        Ok([a, b])
    }

    async fn load_participant(
        &self,
        call_id: CallId,
        side: &SideRecord,
    ) -> Result<CallParticipant, CallError> {
        let users: HashSet<UserId> = self
            .store
            .call_users(call_id, side.channel_id)
            .await?
            .into_iter()
            .collect();
        let message_count = self
            .store
            .call_message_count(call_id, side.channel_id)
            .await?;
        Ok(participant_from(side, users, message_count))
    }

    async fn load_messages(&self, call_id: CallId) -> Result<Vec<CallMessage>, CallError> {
        let raw = self.store.call_messages(call_id).await?;
        let mut messages = Vec::with_capacity(raw.len());
        for entry in raw {
            match serde_json::from_str::<CallMessage>(&entry) {
                Ok(message) => messages.push(message),
                Err(e) => {
                    // Never fail the read path over one bad entry
                    warn!(
                        target: "cc.state",
                        call_id = %call_id,
                        error = %e,
                        "Skipping corrupted call message"
                    );
                }
            }
        }
        Ok(messages)
    }
}

fn participant_from(
    side: &SideRecord,
    users: HashSet<UserId>,
    message_count: u64,
) -> CallParticipant {
    CallParticipant {
        channel_id: side.channel_id,
        guild_id: side.guild_id,
        webhook_url: side.webhook_url.clone(),
        users,
        message_count,
        joined_at: side.joined_at,
    }
}

#[async_trait]
impl Component for CallStateStore {
    fn name(&self) -> &'static str {
        "state-store"
    }

    async fn start(&self) -> Result<(), CallError> {
        // Verify the store answers before the facade reports ready
        self.store.ping().await?;

        let mut task = self.task.lock().await;
        if task.is_some() {
            return Ok(());
        }
        let state = self.clone();
        *task = Some(tokio::spawn(state.expiry_loop()));
        Ok(())
    }

    async fn stop(&self) {
        self.cancel.cancel();
        if let Some(handle) = self.task.lock().await.take() {
            if let Err(e) = handle.await {
                warn!(target: "cc.state", error = %e, "Expiry task join failed");
            }
        }
        info!(target: "cc.state", "State store stopped");
    }
}
