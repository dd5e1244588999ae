//! # Call Controller Test Utilities
//!
//! Shared test utilities for the Partyline call controller.
//!
//! This crate provides mock implementations and test fixtures for
//! isolated testing without requiring real infrastructure (no Redis, no
//! Postgres).
//!
//! The implementations live in `call_controller::test_support` (behind
//! that crate's `test-support` feature) so that the call controller's own
//! in-crate unit tests and these external re-exports share a single crate
//! copy of the domain types. This crate simply re-exports them.
//!
//! ## Modules
//!
//! - `memory_store` - In-memory `SharedStore` with the same claim
//!   atomicity and TTL semantics as the Redis implementation
//! - `memory_durable` - In-memory ended-call archive
//! - `fixtures` - Request builders
//! - `harness` - Fully wired core over the in-memory store; share one
//!   store between several harnesses to simulate multiple processes
//!
//! ## Usage
//!
//! ```rust,ignore
//! use cc_test_utils::{fixtures::TestRequest, TestCore};
//!
//! #[tokio::test]
//! async fn test_example() {
//!     let core = TestCore::builder().build();
//!     let request = TestRequest::for_channel(1).build();
//!     core.queue.enqueue(&request).await.unwrap();
//! }
//! ```

pub use call_controller::test_support::{fixtures, harness, memory_durable, memory_store};

pub use call_controller::test_support::TestCore;
pub use call_controller::test_support::{MemoryDurable, MemoryStore};
