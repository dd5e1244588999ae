//! Durable ended-call archive.
//!
//! Ended calls are written once to Postgres and read back when the hot
//! copy has been evicted. The archive is behind a trait so tests can
//! substitute an in-memory implementation.
//!
//! All queries use parameterized statements; the record itself is stored
//! as the serialized JSON the hot cache carries, with the columns the
//! retention tooling filters on broken out.

use crate::errors::CallError;
use crate::models::EndedCall;
use async_trait::async_trait;
use common::CallId;
use sqlx::PgPool;
use tracing::instrument;

/// Durable storage for ended-call records.
#[async_trait]
pub trait DurableCallStore: Send + Sync {
    /// Write the record. Idempotent: re-recording an archived call is a
    /// no-op.
    async fn record(&self, call: &EndedCall) -> Result<(), CallError>;

    /// Fetch an archived record.
    async fn fetch(&self, call_id: CallId) -> Result<Option<EndedCall>, CallError>;
}

/// Postgres-backed ended-call archive.
#[derive(Clone)]
pub struct PgCallArchive {
    pool: PgPool,
}

impl PgCallArchive {
    #[must_use]
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl DurableCallStore for PgCallArchive {
    #[instrument(skip_all, fields(call_id = %call.id))]
    async fn record(&self, call: &EndedCall) -> Result<(), CallError> {
        let json = serde_json::to_string(call)?;

        sqlx::query(
            r#"
            INSERT INTO ended_calls (call_id, started_at, ended_at, flagged, record)
            VALUES ($1, $2, $3, $4, $5)
            ON CONFLICT (call_id) DO NOTHING
            "#,
        )
        .bind(call.id.0)
        .bind(call.started_at)
        .bind(call.ended_at)
        .bind(call.flagged)
        .bind(json)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    #[instrument(skip_all, fields(call_id = %call_id))]
    async fn fetch(&self, call_id: CallId) -> Result<Option<EndedCall>, CallError> {
        let row: Option<(String,)> =
            sqlx::query_as("SELECT record FROM ended_calls WHERE call_id = $1")
                .bind(call_id.0)
                .fetch_optional(&self.pool)
                .await?;

        row.map(|(json,)| serde_json::from_str(&json))
            .transpose()
            .map_err(Into::into)
    }
}
