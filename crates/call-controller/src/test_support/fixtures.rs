//! Pre-configured test data fixtures.

use call_controller::models::{CallMessage, CallRequest};
use chrono::{Duration as ChronoDuration, Utc};
use common::{ChannelId, GuildId, RequestId, UserId};

/// Builder for test call requests.
///
/// Defaults derive the guild and initiator from the channel number, so two
/// requests for different channels are compatible unless a test says
/// otherwise.
#[derive(Debug, Clone)]
pub struct TestRequest {
    channel: u64,
    guild: u64,
    initiator: u64,
    priority: i32,
    queued_secs_ago: i64,
    webhook_url: Option<String>,
}

impl TestRequest {
    /// Start a request for the given channel. Guild and initiator default
    /// to channel-derived values.
    #[must_use]
    pub fn for_channel(channel: u64) -> Self {
        Self {
            channel,
            guild: channel + 1000,
            initiator: channel + 5000,
            priority: 0,
            queued_secs_ago: 0,
            webhook_url: None,
        }
    }

    /// Set the guild.
    #[must_use]
    pub fn guild(mut self, guild: u64) -> Self {
        self.guild = guild;
        self
    }

    /// Set the initiating user.
    #[must_use]
    pub fn initiator(mut self, user: u64) -> Self {
        self.initiator = user;
        self
    }

    /// Set the priority.
    #[must_use]
    pub fn priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    /// Backdate the queue time by the given number of seconds.
    #[must_use]
    pub fn queued_secs_ago(mut self, secs: i64) -> Self {
        self.queued_secs_ago = secs;
        self
    }

    /// Set the webhook URL.
    #[must_use]
    pub fn webhook_url(mut self, url: impl Into<String>) -> Self {
        self.webhook_url = Some(url.into());
        self
    }

    /// Build the request.
    #[must_use]
    pub fn build(self) -> CallRequest {
        CallRequest {
            id: RequestId::new(),
            channel_id: ChannelId(self.channel),
            guild_id: GuildId(self.guild),
            webhook_url: self
                .webhook_url
                .unwrap_or_else(|| format!("https://hooks.example/{}", self.channel)),
            initiator_id: UserId(self.initiator),
            queued_at: Utc::now() - ChronoDuration::seconds(self.queued_secs_ago),
            priority: self.priority,
        }
    }
}

/// A relayed message with throwaway content.
#[must_use]
pub fn test_message(author: u64, content: &str) -> CallMessage {
    CallMessage {
        author_id: UserId(author),
        author_username: format!("user-{author}"),
        content: content.to_string(),
        timestamp: Utc::now(),
        attachment_url: None,
    }
}
