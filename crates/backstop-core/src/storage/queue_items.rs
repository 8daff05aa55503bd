//! Repository for the `live_queue` table.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use sqlx::{types::Json, PgPool};

use crate::{error::Result, models::QueueEnvelope};

/// Repository for live queue items.
#[derive(Debug)]
pub struct Repository {
    pool: Arc<PgPool>,
}

impl Repository {
    /// Creates a new repository instance.
    pub fn new(pool: Arc<PgPool>) -> Self {
        Self { pool }
    }

    /// Appends an envelope that becomes visible at `visible_at`.
    ///
    /// # Errors
    ///
    /// Returns error if the insert fails.
    pub async fn push(
        &self,
        envelope: &QueueEnvelope,
        visible_at: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO live_queue (message_id, envelope, visible_at, enqueued_at, deliveries)
            VALUES ($1, $2, $3, $4, 0)
            "#,
        )
        .bind(&envelope.message_id)
        .bind(Json(envelope))
        .bind(visible_at)
        .bind(now)
        .execute(&*self.pool)
        .await?;

        Ok(())
    }

    /// Leases the earliest visible item until `lease_until`.
    ///
    /// Concurrent consumers skip rows another transaction already locked, so
    /// each item goes to exactly one of them per lease.
    ///
    /// # Errors
    ///
    /// Returns error if the update fails.
    pub async fn lease_next(
        &self,
        now: DateTime<Utc>,
        lease_until: DateTime<Utc>,
    ) -> Result<Option<(i64, QueueEnvelope)>> {
        let leased: Option<(i64, Json<QueueEnvelope>)> = sqlx::query_as(
            r#"
            UPDATE live_queue
            SET visible_at = $2, deliveries = deliveries + 1
            WHERE id = (
                SELECT id FROM live_queue
                WHERE visible_at <= $1
                ORDER BY visible_at ASC, id ASC
                LIMIT 1
                FOR UPDATE SKIP LOCKED
            )
            RETURNING id, envelope
            "#,
        )
        .bind(now)
        .bind(lease_until)
        .fetch_optional(&*self.pool)
        .await?;

        Ok(leased.map(|(id, Json(envelope))| (id, envelope)))
    }

    /// Removes an item.
    ///
    /// # Errors
    ///
    /// Returns error if the delete fails.
    pub async fn delete(&self, id: i64) -> Result<()> {
        sqlx::query("DELETE FROM live_queue WHERE id = $1").bind(id).execute(&*self.pool).await?;
        Ok(())
    }

    /// Number of items, leased or not.
    ///
    /// # Errors
    ///
    /// Returns error if the query fails.
    pub async fn count(&self) -> Result<i64> {
        let count: i64 =
            sqlx::query_scalar("SELECT COUNT(*) FROM live_queue").fetch_one(&*self.pool).await?;
        Ok(count)
    }
}
