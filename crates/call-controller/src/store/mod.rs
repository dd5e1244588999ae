//! Shared store seam.
//!
//! All cross-process state lives behind [`SharedStore`]: the ordered wait
//! queue, request payloads, recent-match cooldowns, the leader lease, and
//! active/ended call records. Every multi-step mutation that can race
//! across processes (enqueue, dequeue, lease renewal, call termination) is
//! a single atomic store operation, so racing callers always resolve to
//! exactly one winner.
//!
//! # Key Layout (Redis implementation)
//!
//! - `q:queue` - ZSET, channel id -> score (`queued_at_ms + priority*weight`)
//! - `q:req:{channel}` - request payload (JSON), TTL = queue timeout
//! - `q:ids` - HASH, request id -> channel id
//! - `cooldown:{lo}:{hi}` - recent-match marker for a user pair, TTL'd
//! - `leader:{name}` - lease key, value = owner node id, TTL'd
//! - `call:{id}` - creation record (JSON, immutable)
//! - `call:{id}:status` - `active` | `ended` (atomic terminal transition)
//! - `call:{id}:end` - HASH with `ended_at`, `reason`, `flagged`
//! - `call:{id}:users:{channel}` - SET of user ids on that side
//! - `call:{id}:messages` - LIST of message JSON, arrival order
//! - `call:{id}:counts` - HASH, channel id -> relayed message count
//! - `call:by_channel:{channel}` - channel -> call id
//! - `call:index` - SET of active call ids
//! - `call:ended:{id}` - assembled ended-call record, retention TTL
//!
//! The in-memory implementation used by tests (`cc-test-utils`) mirrors
//! these semantics exactly, including TTL expiry and claim atomicity.

pub mod lua_scripts;
pub mod redis;

pub use self::redis::RedisStore;

use crate::errors::CallError;
use async_trait::async_trait;
use common::{CallId, ChannelId, RequestId, UserId};
use std::time::Duration;

/// Result of an enqueue attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnqueueOutcome {
    /// The request was added to the queue.
    Queued,
    /// The channel already has a queued request.
    AlreadyQueued,
    /// The queue is at capacity.
    Full,
}

/// One entry of the ordered queue.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct QueueEntry {
    pub channel_id: ChannelId,
    pub score: f64,
}

/// Result of removing a user from a call side.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UserRemoval {
    /// Whether the user was present and removed.
    pub removed: bool,
    /// Users remaining on that side after the removal.
    pub remaining: u64,
}

/// Information recorded when a call ended.
#[derive(Debug, Clone)]
pub struct CallEndInfo {
    pub ended_at_ms: i64,
    pub reason: String,
    pub flagged: bool,
}

/// The shared store every controller process coordinates through.
///
/// Operations returning `bool` are the idempotent claim primitives: they
/// report whether THIS caller performed the mutation. A `false` from
/// `queue_remove` or `call_end` means another process (a concurrent match,
/// hangup, or cleanup) got there first, and the caller must abandon its
/// branch rather than retry.
#[async_trait]
pub trait SharedStore: Send + Sync {
    /// Verify the store is reachable.
    async fn ping(&self) -> Result<(), CallError>;

    // --- Queue ---

    /// Atomically insert a request if the channel has no entry and the
    /// queue is below `capacity`.
    async fn queue_insert(
        &self,
        channel: ChannelId,
        request_id: RequestId,
        score: f64,
        payload: &str,
        ttl: Duration,
        capacity: u64,
    ) -> Result<EnqueueOutcome, CallError>;

    /// Atomically remove a request by id. Returns `false` if it is no
    /// longer queued (already matched or removed).
    async fn queue_remove(&self, request_id: RequestId) -> Result<bool, CallError>;

    /// Atomically remove a channel's request. Same idempotency guarantee
    /// as [`SharedStore::queue_remove`].
    async fn queue_remove_channel(&self, channel: ChannelId) -> Result<bool, CallError>;

    /// All queue entries in rank order.
    async fn queue_entries(&self) -> Result<Vec<QueueEntry>, CallError>;

    /// Raw payload for a queued channel.
    async fn queue_payload(&self, channel: ChannelId) -> Result<Option<String>, CallError>;

    /// 0-based rank of a channel in the queue.
    async fn queue_rank(&self, channel: ChannelId) -> Result<Option<u64>, CallError>;

    /// Number of queued requests.
    async fn queue_len(&self) -> Result<u64, CallError>;

    /// Remove entries with score below `cutoff_score` and reconcile
    /// orphans (queue entries without payloads, id-index entries without
    /// queue entries). Returns the number of queue entries removed.
    async fn queue_cleanup(&self, cutoff_score: f64) -> Result<u64, CallError>;

    // --- Recent-match cooldown ---

    /// Record a recent match for a user pair.
    async fn cooldown_put(&self, key: &str, ttl: Duration) -> Result<(), CallError>;

    /// Whether the user pair is still inside the cooldown window.
    async fn cooldown_exists(&self, key: &str) -> Result<bool, CallError>;

    // --- Leader lease ---

    /// Acquire the lease if nobody holds it. Returns `true` on success.
    async fn lease_acquire(&self, key: &str, owner: &str, ttl: Duration)
        -> Result<bool, CallError>;

    /// Extend the lease if `owner` still holds it. Returns `false` if the
    /// lease expired or another owner took it.
    async fn lease_renew(&self, key: &str, owner: &str, ttl: Duration) -> Result<bool, CallError>;

    /// Release the lease if `owner` holds it.
    async fn lease_release(&self, key: &str, owner: &str) -> Result<(), CallError>;

    // --- Calls ---

    /// Create a call record and map both channels to it.
    async fn call_create(
        &self,
        call_id: CallId,
        meta: &str,
        channels: [ChannelId; 2],
    ) -> Result<(), CallError>;

    /// Raw creation record for a call.
    async fn call_meta(&self, call_id: CallId) -> Result<Option<String>, CallError>;

    /// Current status string (`active` / `ended`) for a call.
    async fn call_status(&self, call_id: CallId) -> Result<Option<String>, CallError>;

    /// End-of-call info, present once the call has ended.
    async fn call_end_info(&self, call_id: CallId) -> Result<Option<CallEndInfo>, CallError>;

    /// Call id the channel currently belongs to.
    async fn call_for_channel(&self, channel: ChannelId) -> Result<Option<CallId>, CallError>;

    /// Ids of all active calls.
    async fn call_ids(&self) -> Result<Vec<CallId>, CallError>;

    /// Atomically transition a call from active to ended. Releases both
    /// channel mappings and puts the call's keys on a grace TTL. Returns
    /// `false` if the call was already ended (or does not exist).
    #[allow(clippy::too_many_arguments)]
    async fn call_end(
        &self,
        call_id: CallId,
        channels: [ChannelId; 2],
        ended_at_ms: i64,
        reason: &str,
        flagged: bool,
        grace: Duration,
    ) -> Result<bool, CallError>;

    /// Add a user to a call side. Returns `false` if already present.
    async fn call_user_add(
        &self,
        call_id: CallId,
        channel: ChannelId,
        user: UserId,
    ) -> Result<bool, CallError>;

    /// Remove a user from a call side.
    async fn call_user_remove(
        &self,
        call_id: CallId,
        channel: ChannelId,
        user: UserId,
    ) -> Result<UserRemoval, CallError>;

    /// Users currently on a call side.
    async fn call_users(
        &self,
        call_id: CallId,
        channel: ChannelId,
    ) -> Result<Vec<UserId>, CallError>;

    /// Append a message and bump the side's count. Returns the new count.
    async fn call_message_push(
        &self,
        call_id: CallId,
        channel: ChannelId,
        message: &str,
    ) -> Result<u64, CallError>;

    /// All messages of a call in arrival order (raw JSON).
    async fn call_messages(&self, call_id: CallId) -> Result<Vec<String>, CallError>;

    /// Relayed message count for a call side.
    async fn call_message_count(
        &self,
        call_id: CallId,
        channel: ChannelId,
    ) -> Result<u64, CallError>;

    // --- Ended-call hot cache ---

    /// Store the assembled ended-call record with a retention TTL.
    async fn ended_put(
        &self,
        call_id: CallId,
        record: &str,
        ttl: Duration,
    ) -> Result<(), CallError>;

    /// Fetch an ended-call record from the hot cache.
    async fn ended_get(&self, call_id: CallId) -> Result<Option<String>, CallError>;
}
