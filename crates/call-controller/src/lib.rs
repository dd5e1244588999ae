//! Partyline Call Controller Library
//!
//! This library provides the core functionality for the Partyline call
//! controller - the service responsible for pairing two chat channels from
//! different communities into an ephemeral anonymous call and relaying
//! state between them:
//!
//! - Distributed wait-queue over a shared Redis store
//! - Background matching engine with compatibility rules
//! - Lease-based leader election so exactly one process cluster-wide runs
//!   the matching sweep
//! - Authoritative active-call state with a durable archive for ended calls
//! - A facade (`CallManager`) that is the only surface the command layer
//!   talks to
//!
//! # Architecture
//!
//! Many controller processes run concurrently and share no memory; the
//! only coordination medium is the shared store. Every cross-process claim
//! (dequeueing a request, ending a call, holding the leader lease) is a
//! single atomic store operation, so racing processes resolve every
//! conflict to exactly one winner:
//!
//! ```text
//! command layer -> CallManager
//!                  |-- QueueManager  -> SharedStore (ordered queue + payloads)
//!                  |-- MatchingEngine-> SharedStore (idempotent claims)
//!                  |-- LeaderCoordinator -> SharedStore (lease key)
//!                  `-- CallStateStore -> SharedStore (call records) + Postgres archive
//! ```
//!
//! # Key Design Decisions
//!
//! - **Idempotent dequeue as the claim primitive**: a hangup racing a
//!   match attempt both go through the same atomic removal; exactly one
//!   side observes `true`.
//! - **Leader-only sweep**: the periodic matching pass runs on the single
//!   lease holder; immediate match attempts run on any process because
//!   claims are idempotent.
//! - **Sets and logs live in native store structures**: participant user
//!   sets and the message log are store sets/lists, serialized only at
//!   the store boundary; the domain layer never handles raw JSON text.
//!
//! # Modules
//!
//! - [`manager`] - Public lifecycle facade (`CallManager`)
//! - [`queue`] - Queue manager and cleanup task
//! - [`matching`] - Matching engine, compatibility rules, statistics
//! - [`coordinator`] - Lease-based leader election
//! - [`state`] - Active-call state store and durable archive
//! - [`store`] - Shared store seam and Redis implementation
//! - [`events`] - Event bus consumed by notification/relay collaborators
//! - [`config`] - Service configuration from environment
//! - [`errors`] - Error types with error codes and client-safe messages

// Allow this crate to refer to itself as `call_controller` so the
// test-support helpers (which name the crate explicitly, matching their
// external `cc-test-utils` home) resolve their paths when compiled here.
#[cfg(any(test, feature = "test-support"))]
extern crate self as call_controller;

/// In-memory mocks, fixtures, and a wired `TestCore` for tests.
#[cfg(any(test, feature = "test-support"))]
pub mod test_support;

pub mod config;
pub mod coordinator;
pub mod errors;
pub mod events;
pub mod lifecycle;
pub mod manager;
pub mod matching;
pub mod models;
pub mod observability;
pub mod queue;
pub mod state;
pub mod store;
