//! Domain model for the call core.
//!
//! Types here are the in-process representation. Timestamps serialize as
//! epoch milliseconds and participant user sets are proper set types;
//! converting to store structures happens at the store boundary, never in
//! domain logic.

use chrono::{DateTime, Utc};
use common::{CallId, ChannelId, GuildId, RequestId, UserId};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fmt;

/// A channel's pending request to be paired into a call.
///
/// Created when a channel asks to start a call; owned by the queue until
/// matched or withdrawn. Immutable once enqueued.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CallRequest {
    /// Globally unique request ID, never reused.
    pub id: RequestId,
    /// Channel asking for a call.
    pub channel_id: ChannelId,
    /// Community the channel belongs to.
    pub guild_id: GuildId,
    /// Webhook used by the relay layer to deliver messages into the channel.
    pub webhook_url: String,
    /// User who initiated the request.
    pub initiator_id: UserId,
    /// When the request was queued.
    #[serde(with = "chrono::serde::ts_milliseconds")]
    pub queued_at: DateTime<Utc>,
    /// Priority override; positive values sort ahead of FIFO order.
    pub priority: i32,
}

/// Derived queue position. Computed on demand from store rank, never stored.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueueStatus {
    /// 1-based position in the queue.
    pub position: u64,
    /// Total queued requests.
    pub queue_length: u64,
}

/// Call session status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CallStatus {
    Active,
    Ended,
}

/// Why a call ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EndReason {
    /// One side hung up.
    Hangup,
    /// One side skipped to a new partner.
    Skip,
    /// A side's user set drained to empty.
    Drained,
    /// The call exceeded its maximum lifetime.
    Timeout,
}

impl EndReason {
    /// Stable string form used at the store boundary.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            EndReason::Hangup => "hangup",
            EndReason::Skip => "skip",
            EndReason::Drained => "drained",
            EndReason::Timeout => "timeout",
        }
    }

    /// Parse the stable string form; unknown values map to `Hangup`.
    #[must_use]
    pub fn from_str_lossy(s: &str) -> Self {
        match s {
            "skip" => EndReason::Skip,
            "drained" => EndReason::Drained,
            "timeout" => EndReason::Timeout,
            _ => EndReason::Hangup,
        }
    }
}

impl fmt::Display for EndReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One side of a call: a channel and the users currently present in it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CallParticipant {
    pub channel_id: ChannelId,
    pub guild_id: GuildId,
    pub webhook_url: String,
    /// Users currently present on this side.
    pub users: HashSet<UserId>,
    /// Messages relayed from this side.
    pub message_count: u64,
    #[serde(with = "chrono::serde::ts_milliseconds")]
    pub joined_at: DateTime<Utc>,
}

/// A message relayed during a call. Appended in arrival order, never
/// mutated or removed.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CallMessage {
    pub author_id: UserId,
    pub author_username: String,
    pub content: String,
    #[serde(with = "chrono::serde::ts_milliseconds")]
    pub timestamp: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub attachment_url: Option<String>,
}

/// Assembled view of a call session.
///
/// Built from store structures on read; the authoritative copy lives in
/// the shared store so any process sees the same call.
#[derive(Debug, Clone)]
pub struct ActiveCall {
    pub id: CallId,
    pub participants: [CallParticipant; 2],
    pub started_at: DateTime<Utc>,
    pub ended_at: Option<DateTime<Utc>>,
    pub messages: Vec<CallMessage>,
    pub status: CallStatus,
}

impl ActiveCall {
    /// The participant entry for the given channel, if it is one of the
    /// two sides.
    #[must_use]
    pub fn participant(&self, channel_id: ChannelId) -> Option<&CallParticipant> {
        self.participants.iter().find(|p| p.channel_id == channel_id)
    }

    /// The participant entry for the side opposite the given channel.
    #[must_use]
    pub fn other_side(&self, channel_id: ChannelId) -> Option<&CallParticipant> {
        self.participants.iter().find(|p| p.channel_id != channel_id)
    }
}

/// Final record of an ended call, written once to durable storage and kept
/// hot in the shared store for a retention window.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EndedCall {
    pub id: CallId,
    pub participants: [CallParticipant; 2],
    #[serde(with = "chrono::serde::ts_milliseconds")]
    pub started_at: DateTime<Utc>,
    #[serde(with = "chrono::serde::ts_milliseconds")]
    pub ended_at: DateTime<Utc>,
    pub reason: EndReason,
    /// Flagged for moderation review; extends hot-cache retention.
    pub flagged: bool,
    pub messages: Vec<CallMessage>,
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn participant(channel: u64, guild: u64) -> CallParticipant {
        CallParticipant {
            channel_id: ChannelId(channel),
            guild_id: GuildId(guild),
            webhook_url: format!("https://hooks.example/{channel}"),
            users: HashSet::from([UserId(1)]),
            message_count: 0,
            joined_at: Utc.timestamp_millis_opt(1_700_000_000_000).unwrap(),
        }
    }

    #[test]
    fn test_call_request_round_trip() {
        let request = CallRequest {
            id: RequestId::new(),
            channel_id: ChannelId(111),
            guild_id: GuildId(222),
            webhook_url: "https://hooks.example/111".to_string(),
            initiator_id: UserId(333),
            queued_at: Utc.timestamp_millis_opt(1_700_000_000_000).unwrap(),
            priority: 2,
        };

        let json = serde_json::to_string(&request).unwrap();
        let parsed: CallRequest = serde_json::from_str(&json).unwrap();

        assert_eq!(parsed.id, request.id);
        assert_eq!(parsed.channel_id, ChannelId(111));
        assert_eq!(parsed.queued_at, request.queued_at);
        assert_eq!(parsed.priority, 2);
    }

    #[test]
    fn test_timestamps_serialize_as_millis() {
        let request = CallRequest {
            id: RequestId::new(),
            channel_id: ChannelId(1),
            guild_id: GuildId(2),
            webhook_url: String::new(),
            initiator_id: UserId(3),
            queued_at: Utc.timestamp_millis_opt(1_700_000_000_000).unwrap(),
            priority: 0,
        };

        let json = serde_json::to_string(&request).unwrap();
        assert!(json.contains("\"queued_at\":1700000000000"));
    }

    #[test]
    fn test_end_reason_string_round_trip() {
        for reason in [
            EndReason::Hangup,
            EndReason::Skip,
            EndReason::Drained,
            EndReason::Timeout,
        ] {
            assert_eq!(EndReason::from_str_lossy(reason.as_str()), reason);
        }
        // Unknown values degrade to hangup rather than failing the read
        assert_eq!(EndReason::from_str_lossy("???"), EndReason::Hangup);
    }

    #[test]
    fn test_other_side_lookup() {
        let call = ActiveCall {
            id: CallId::new(),
            participants: [participant(1, 10), participant(2, 20)],
            started_at: Utc::now(),
            ended_at: None,
            messages: Vec::new(),
            status: CallStatus::Active,
        };

        assert_eq!(
            call.other_side(ChannelId(1)).unwrap().channel_id,
            ChannelId(2)
        );
        assert_eq!(
            call.participant(ChannelId(2)).unwrap().guild_id,
            GuildId(20)
        );
        assert!(call.participant(ChannelId(3)).is_none());
    }

    #[test]
    fn test_call_message_attachment_optional() {
        let msg = CallMessage {
            author_id: UserId(5),
            author_username: "anon".to_string(),
            content: "hello".to_string(),
            timestamp: Utc::now(),
            attachment_url: None,
        };

        let json = serde_json::to_string(&msg).unwrap();
        assert!(!json.contains("attachment_url"));

        let parsed: CallMessage = serde_json::from_str(&json).unwrap();
        assert!(parsed.attachment_url.is_none());
    }
}
