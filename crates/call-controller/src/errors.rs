//! Call controller error types.
//!
//! Error variants map to uniform error codes for the command layer.
//! Internal details are logged server-side but never exposed to callers.

use common::ChannelId;
use thiserror::Error;

/// Call controller error type.
///
/// Maps to command-layer error codes:
/// - `AlreadyQueued`, `AlreadyInCall`: `CONFLICT` (5)
/// - `NotInCallOrQueue`, `CallNotFound`, `ParticipantNotFound`: `NOT_FOUND` (4)
/// - `QueueFull`: `CAPACITY_EXCEEDED` (7)
/// - Store, Database, Serialization, Config, Internal: `INTERNAL_ERROR` (6)
#[derive(Debug, Error)]
pub enum CallError {
    /// Shared store operation failed.
    #[error("Store error: {0}")]
    Store(String),

    /// Durable database operation failed.
    #[error("Database error: {0}")]
    Database(String),

    /// Serialization/deserialization error at the store boundary.
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Configuration error.
    #[error("Configuration error: {0}")]
    Config(String),

    /// The channel already has a pending request in the queue.
    #[error("Channel {0} is already waiting in the queue")]
    AlreadyQueued(ChannelId),

    /// The channel already has an active call.
    #[error("Channel {0} is already in an active call")]
    AlreadyInCall(ChannelId),

    /// The shared queue is at capacity.
    #[error("The call queue is full")]
    QueueFull,

    /// The channel has neither a queued request nor an active call.
    #[error("Channel {0} has no queued request or active call")]
    NotInCallOrQueue(ChannelId),

    /// Call not found.
    #[error("Call not found: {0}")]
    CallNotFound(String),

    /// Participant not found in the call.
    #[error("Participant not found: {0}")]
    ParticipantNotFound(String),

    /// Internal error.
    #[error("Internal error: {0}")]
    Internal(String),
}

impl CallError {
    /// Returns the uniform error code for this error.
    pub fn error_code(&self) -> i32 {
        match self {
            CallError::Store(_)
            | CallError::Database(_)
            | CallError::Serialization(_)
            | CallError::Config(_)
            | CallError::Internal(_) => 6, // INTERNAL_ERROR
            CallError::NotInCallOrQueue(_)
            | CallError::CallNotFound(_)
            | CallError::ParticipantNotFound(_) => 4, // NOT_FOUND
            CallError::AlreadyQueued(_) | CallError::AlreadyInCall(_) => 5, // CONFLICT
            CallError::QueueFull => 7, // CAPACITY_EXCEEDED
        }
    }

    /// Returns a client-safe message (no internal details).
    pub fn client_message(&self) -> String {
        match self {
            CallError::Store(_)
            | CallError::Database(_)
            | CallError::Serialization(_)
            | CallError::Config(_)
            | CallError::Internal(_) => "An internal error occurred".to_string(),
            CallError::AlreadyQueued(_) => {
                "This channel is already waiting for a call".to_string()
            }
            CallError::AlreadyInCall(_) => "This channel is already in a call".to_string(),
            CallError::QueueFull => "The call queue is full, please try again later".to_string(),
            CallError::NotInCallOrQueue(_) => {
                "This channel has no active call or queued request".to_string()
            }
            CallError::CallNotFound(_) => "Call not found".to_string(),
            CallError::ParticipantNotFound(_) => "Participant not found".to_string(),
        }
    }
}

impl From<sqlx::Error> for CallError {
    fn from(err: sqlx::Error) -> Self {
        CallError::Database(err.to_string())
    }
}

impl From<serde_json::Error> for CallError {
    fn from(err: serde_json::Error) -> Self {
        CallError::Serialization(err.to_string())
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn test_error_code_mapping() {
        // Internal errors -> 6
        assert_eq!(CallError::Store("conn refused".to_string()).error_code(), 6);
        assert_eq!(CallError::Database("timeout".to_string()).error_code(), 6);
        assert_eq!(
            CallError::Serialization("bad json".to_string()).error_code(),
            6
        );
        assert_eq!(CallError::Internal("oops".to_string()).error_code(), 6);

        // Not found -> 4
        assert_eq!(
            CallError::NotInCallOrQueue(ChannelId(1)).error_code(),
            4
        );
        assert_eq!(CallError::CallNotFound("c-1".to_string()).error_code(), 4);

        // Conflict -> 5
        assert_eq!(CallError::AlreadyQueued(ChannelId(1)).error_code(), 5);
        assert_eq!(CallError::AlreadyInCall(ChannelId(1)).error_code(), 5);

        // Capacity -> 7
        assert_eq!(CallError::QueueFull.error_code(), 7);
    }

    #[test]
    fn test_client_messages_hide_internal_details() {
        let store_err = CallError::Store("connection refused at 10.0.0.5:6379".to_string());
        assert!(!store_err.client_message().contains("10.0.0.5"));
        assert_eq!(store_err.client_message(), "An internal error occurred");

        let db_err = CallError::Database("password authentication failed".to_string());
        assert!(!db_err.client_message().contains("password"));
    }

    #[test]
    fn test_display_formatting() {
        assert_eq!(
            format!("{}", CallError::AlreadyQueued(ChannelId(42))),
            "Channel 42 is already waiting in the queue"
        );
        assert_eq!(
            format!("{}", CallError::QueueFull),
            "The call queue is full"
        );
    }

    #[test]
    fn test_serde_error_conversion() {
        let err = serde_json::from_str::<serde_json::Value>("{not json").unwrap_err();
        let call_err: CallError = err.into();
        assert!(matches!(call_err, CallError::Serialization(_)));
        assert_eq!(call_err.error_code(), 6);
    }
}
