//! In-memory shared store for testing.
//!
//! Implements `SharedStore` with the same observable semantics as the
//! Redis implementation: idempotent claims (dequeue, call end, lease
//! ownership), TTL expiry for queue payloads, cooldowns and leases, and
//! rank ordering by `(score, channel)`.
//!
//! Sharing one `MemoryStore` between several components (or several whole
//! cores via `TestCore`) simulates multiple controller processes behind
//! one Redis.

use async_trait::async_trait;
use call_controller::errors::CallError;
use call_controller::store::{
    CallEndInfo, EnqueueOutcome, QueueEntry, SharedStore, UserRemoval,
};
use chrono::Utc;
use common::{CallId, ChannelId, RequestId, UserId};
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};
use std::time::Duration;

fn now_ms() -> i64 {
    Utc::now().timestamp_millis()
}

fn expiry(ttl: Duration) -> i64 {
    now_ms().saturating_add(i64::try_from(ttl.as_millis()).unwrap_or(i64::MAX))
}

#[derive(Debug, Default)]
struct Inner {
    /// channel -> score
    queue: HashMap<ChannelId, f64>,
    /// channel -> (payload, expires_at_ms)
    payloads: HashMap<ChannelId, (String, i64)>,
    /// request id -> channel
    ids: HashMap<RequestId, ChannelId>,
    /// cooldown key -> expires_at_ms
    cooldowns: HashMap<String, i64>,
    /// lease key -> (owner, expires_at_ms)
    leases: HashMap<String, (String, i64)>,
    /// call id -> creation record JSON
    calls: HashMap<CallId, String>,
    /// call id -> "active" | "ended"
    statuses: HashMap<CallId, String>,
    /// call id -> (ended_at_ms, reason, flagged)
    end_info: HashMap<CallId, (i64, String, bool)>,
    /// (call id, channel) -> user set
    users: HashMap<(CallId, ChannelId), HashSet<UserId>>,
    /// call id -> messages in arrival order
    messages: HashMap<CallId, Vec<String>>,
    /// (call id, channel) -> relayed message count
    counts: HashMap<(CallId, ChannelId), u64>,
    /// channel -> call id
    by_channel: HashMap<ChannelId, CallId>,
    /// active call ids
    index: HashSet<CallId>,
    /// call id -> (record, expires_at_ms, retention)
    ended: HashMap<CallId, (String, i64, Duration)>,
}

impl Inner {
    fn payload_live(&self, channel: ChannelId) -> bool {
        self.payloads
            .get(&channel)
            .is_some_and(|(_, expires)| *expires > now_ms())
    }
}

/// In-memory shared store.
#[derive(Debug, Clone, Default)]
pub struct MemoryStore {
    inner: Arc<Mutex<Inner>>,
}

impl MemoryStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Inject a raw queue entry (e.g. a corrupted payload) behind the
    /// queue manager's back.
    pub fn inject_queue_entry(&self, channel: ChannelId, score: f64, payload: &str) {
        let mut inner = self.inner.lock().unwrap();
        inner.queue.insert(channel, score);
        inner
            .payloads
            .insert(channel, (payload.to_string(), i64::MAX));
    }

    /// Evict the hot ended-call copy, forcing the durable fallback.
    pub fn evict_ended(&self, call_id: CallId) {
        let mut inner = self.inner.lock().unwrap();
        inner.ended.remove(&call_id);
    }

    /// Retention the hot ended-call copy was stored with.
    #[must_use]
    pub fn ended_ttl(&self, call_id: CallId) -> Option<Duration> {
        let inner = self.inner.lock().unwrap();
        inner.ended.get(&call_id).map(|(_, _, ttl)| *ttl)
    }

    /// Current lease owner, if the lease is live.
    #[must_use]
    pub fn lease_owner(&self, key: &str) -> Option<String> {
        let inner = self.inner.lock().unwrap();
        inner
            .leases
            .get(key)
            .filter(|(_, expires)| *expires > now_ms())
            .map(|(owner, _)| owner.clone())
    }
}

#[async_trait]
impl SharedStore for MemoryStore {
    async fn ping(&self) -> Result<(), CallError> {
        Ok(())
    }

    async fn queue_insert(
        &self,
        channel: ChannelId,
        request_id: RequestId,
        score: f64,
        payload: &str,
        ttl: Duration,
        capacity: u64,
    ) -> Result<EnqueueOutcome, CallError> {
        let mut inner = self.inner.lock().unwrap();
        if inner.queue.contains_key(&channel) || inner.payload_live(channel) {
            return Ok(EnqueueOutcome::AlreadyQueued);
        }
        if inner.queue.len() as u64 >= capacity {
            return Ok(EnqueueOutcome::Full);
        }
        inner.queue.insert(channel, score);
        inner
            .payloads
            .insert(channel, (payload.to_string(), expiry(ttl)));
        inner.ids.insert(request_id, channel);
        Ok(EnqueueOutcome::Queued)
    }

    async fn queue_remove(&self, request_id: RequestId) -> Result<bool, CallError> {
        let mut inner = self.inner.lock().unwrap();
        let Some(channel) = inner.ids.remove(&request_id) else {
            return Ok(false);
        };
        let removed = inner.queue.remove(&channel).is_some();
        inner.payloads.remove(&channel);
        Ok(removed)
    }

    async fn queue_remove_channel(&self, channel: ChannelId) -> Result<bool, CallError> {
        let mut inner = self.inner.lock().unwrap();
        inner.ids.retain(|_, c| *c != channel);
        let removed = inner.queue.remove(&channel).is_some();
        inner.payloads.remove(&channel);
        Ok(removed)
    }

    async fn queue_entries(&self) -> Result<Vec<QueueEntry>, CallError> {
        let inner = self.inner.lock().unwrap();
        let mut entries: Vec<QueueEntry> = inner
            .queue
            .iter()
            .map(|(channel, score)| QueueEntry {
                channel_id: *channel,
                score: *score,
            })
            .collect();
        entries.sort_by(|a, b| {
            a.score
                .partial_cmp(&b.score)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then(a.channel_id.cmp(&b.channel_id))
        });
        Ok(entries)
    }

    async fn queue_payload(&self, channel: ChannelId) -> Result<Option<String>, CallError> {
        let inner = self.inner.lock().unwrap();
        Ok(inner
            .payloads
            .get(&channel)
            .filter(|(_, expires)| *expires > now_ms())
            .map(|(payload, _)| payload.clone()))
    }

    async fn queue_rank(&self, channel: ChannelId) -> Result<Option<u64>, CallError> {
        let entries = self.queue_entries().await?;
        Ok(entries
            .iter()
            .position(|e| e.channel_id == channel)
            .map(|p| p as u64))
    }

    async fn queue_len(&self) -> Result<u64, CallError> {
        let inner = self.inner.lock().unwrap();
        Ok(inner.queue.len() as u64)
    }

    async fn queue_cleanup(&self, cutoff_score: f64) -> Result<u64, CallError> {
        let mut inner = self.inner.lock().unwrap();
        let now = now_ms();
        let mut removed = 0u64;

        let expired: Vec<ChannelId> = inner
            .queue
            .iter()
            .filter(|&(channel, score)| {
                *score < cutoff_score
                    || !inner
                        .payloads
                        .get(channel)
                        .is_some_and(|(_, expires)| *expires > now)
            })
            .map(|(channel, _)| *channel)
            .collect();

        for channel in expired {
            inner.queue.remove(&channel);
            inner.payloads.remove(&channel);
            removed += 1;
        }

        let queued: HashSet<ChannelId> = inner.queue.keys().copied().collect();
        inner.ids.retain(|_, channel| queued.contains(channel));
        Ok(removed)
    }

    async fn cooldown_put(&self, key: &str, ttl: Duration) -> Result<(), CallError> {
        let mut inner = self.inner.lock().unwrap();
        inner.cooldowns.insert(key.to_string(), expiry(ttl));
        Ok(())
    }

    async fn cooldown_exists(&self, key: &str) -> Result<bool, CallError> {
        let inner = self.inner.lock().unwrap();
        Ok(inner
            .cooldowns
            .get(key)
            .is_some_and(|expires| *expires > now_ms()))
    }

    async fn lease_acquire(
        &self,
        key: &str,
        owner: &str,
        ttl: Duration,
    ) -> Result<bool, CallError> {
        let mut inner = self.inner.lock().unwrap();
        let live = inner
            .leases
            .get(key)
            .is_some_and(|(_, expires)| *expires > now_ms());
        if live {
            return Ok(false);
        }
        inner
            .leases
            .insert(key.to_string(), (owner.to_string(), expiry(ttl)));
        Ok(true)
    }

    async fn lease_renew(&self, key: &str, owner: &str, ttl: Duration) -> Result<bool, CallError> {
        let mut inner = self.inner.lock().unwrap();
        let held = inner
            .leases
            .get(key)
            .is_some_and(|(o, expires)| o == owner && *expires > now_ms());
        if !held {
            return Ok(false);
        }
        inner
            .leases
            .insert(key.to_string(), (owner.to_string(), expiry(ttl)));
        Ok(true)
    }

    async fn lease_release(&self, key: &str, owner: &str) -> Result<(), CallError> {
        let mut inner = self.inner.lock().unwrap();
        if inner.leases.get(key).is_some_and(|(o, _)| o == owner) {
            inner.leases.remove(key);
        }
        Ok(())
    }

    async fn call_create(
        &self,
        call_id: CallId,
        meta: &str,
        channels: [ChannelId; 2],
    ) -> Result<(), CallError> {
        let mut inner = self.inner.lock().unwrap();
        inner.calls.insert(call_id, meta.to_string());
        inner.statuses.insert(call_id, "active".to_string());
        inner.index.insert(call_id);
        let [a, b] = channels;
        inner.by_channel.insert(a, call_id);
        inner.by_channel.insert(b, call_id);
        Ok(())
    }

    async fn call_meta(&self, call_id: CallId) -> Result<Option<String>, CallError> {
        let inner = self.inner.lock().unwrap();
        Ok(inner.calls.get(&call_id).cloned())
    }

    async fn call_status(&self, call_id: CallId) -> Result<Option<String>, CallError> {
        let inner = self.inner.lock().unwrap();
        Ok(inner.statuses.get(&call_id).cloned())
    }

    async fn call_end_info(&self, call_id: CallId) -> Result<Option<CallEndInfo>, CallError> {
        let inner = self.inner.lock().unwrap();
        Ok(inner
            .end_info
            .get(&call_id)
            .map(|(ended_at_ms, reason, flagged)| CallEndInfo {
                ended_at_ms: *ended_at_ms,
                reason: reason.clone(),
                flagged: *flagged,
            }))
    }

    async fn call_for_channel(&self, channel: ChannelId) -> Result<Option<CallId>, CallError> {
        let inner = self.inner.lock().unwrap();
        Ok(inner.by_channel.get(&channel).copied())
    }

    async fn call_ids(&self) -> Result<Vec<CallId>, CallError> {
        let inner = self.inner.lock().unwrap();
        Ok(inner.index.iter().copied().collect())
    }

    async fn call_end(
        &self,
        call_id: CallId,
        channels: [ChannelId; 2],
        ended_at_ms: i64,
        reason: &str,
        flagged: bool,
        _grace: Duration,
    ) -> Result<bool, CallError> {
        let mut inner = self.inner.lock().unwrap();
        if inner.statuses.get(&call_id).map(String::as_str) != Some("active") {
            return Ok(false);
        }
        inner.statuses.insert(call_id, "ended".to_string());
        inner
            .end_info
            .insert(call_id, (ended_at_ms, reason.to_string(), flagged));
        inner.index.remove(&call_id);
        for channel in channels {
            if inner.by_channel.get(&channel) == Some(&call_id) {
                inner.by_channel.remove(&channel);
            }
        }
        Ok(true)
    }

    async fn call_user_add(
        &self,
        call_id: CallId,
        channel: ChannelId,
        user: UserId,
    ) -> Result<bool, CallError> {
        let mut inner = self.inner.lock().unwrap();
        Ok(inner.users.entry((call_id, channel)).or_default().insert(user))
    }

    async fn call_user_remove(
        &self,
        call_id: CallId,
        channel: ChannelId,
        user: UserId,
    ) -> Result<UserRemoval, CallError> {
        let mut inner = self.inner.lock().unwrap();
        let set = inner.users.entry((call_id, channel)).or_default();
        let removed = set.remove(&user);
        Ok(UserRemoval {
            removed,
            remaining: set.len() as u64,
        })
    }

    async fn call_users(
        &self,
        call_id: CallId,
        channel: ChannelId,
    ) -> Result<Vec<UserId>, CallError> {
        let inner = self.inner.lock().unwrap();
        Ok(inner
            .users
            .get(&(call_id, channel))
            .map(|set| set.iter().copied().collect())
            .unwrap_or_default())
    }

    async fn call_message_push(
        &self,
        call_id: CallId,
        channel: ChannelId,
        message: &str,
    ) -> Result<u64, CallError> {
        let mut inner = self.inner.lock().unwrap();
        inner
            .messages
            .entry(call_id)
            .or_default()
            .push(message.to_string());
        let count = inner.counts.entry((call_id, channel)).or_insert(0);
        *count += 1;
        Ok(*count)
    }

    async fn call_messages(&self, call_id: CallId) -> Result<Vec<String>, CallError> {
        let inner = self.inner.lock().unwrap();
        Ok(inner.messages.get(&call_id).cloned().unwrap_or_default())
    }

    async fn call_message_count(
        &self,
        call_id: CallId,
        channel: ChannelId,
    ) -> Result<u64, CallError> {
        let inner = self.inner.lock().unwrap();
        Ok(inner.counts.get(&(call_id, channel)).copied().unwrap_or(0))
    }

    async fn ended_put(
        &self,
        call_id: CallId,
        record: &str,
        ttl: Duration,
    ) -> Result<(), CallError> {
        let mut inner = self.inner.lock().unwrap();
        inner
            .ended
            .insert(call_id, (record.to_string(), expiry(ttl), ttl));
        Ok(())
    }

    async fn ended_get(&self, call_id: CallId) -> Result<Option<String>, CallError> {
        let inner = self.inner.lock().unwrap();
        Ok(inner
            .ended
            .get(&call_id)
            .filter(|(_, expires, _)| *expires > now_ms())
            .map(|(record, _, _)| record.clone()))
    }
}
