//! Observability: metrics definitions and health endpoints.

pub mod health;
pub mod metrics;

pub use health::{observability_router, HealthState};
