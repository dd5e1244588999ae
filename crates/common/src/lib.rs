//! Common types shared across Partyline components.
//!
//! This crate holds the identifier newtypes used throughout the call core
//! and the secret-string types used to protect connection URLs from
//! accidental logging. It deliberately carries no I/O: everything with a
//! suspension point lives in `call-controller`.

pub mod secret;
pub mod types;

pub use types::{CallId, ChannelId, GuildId, RequestId, UserId};
