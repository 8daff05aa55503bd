//! Repository for the `dlq_messages` table.
//!
//! Lock handling relies on single-statement conditional updates: the
//! `WHERE` clause carries the expected lock owner (or its absence), and the
//! affected row count tells the caller whether it won.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use sqlx::{types::Json, PgPool};

use super::{ClosingUpdate, FailureUpdate};
use crate::{
    error::Result,
    models::{DlqId, DlqMessage, DlqStats, DlqStatus, ErrorTypeCount, ReplayAttempt},
};

const COLUMNS: &str = "id, message_id, original_message, error_reason, error_stack, error_type, \
                       retry_count, dlq_retry_count, first_failed_at, last_failed_at, status, \
                       locked_by, locked_at, next_retry_at, metadata, replay_attempts, \
                       resolved_at, resolved_by, resolution_notes, created_at, updated_at";

/// Repository for dead-lettered messages.
#[derive(Debug)]
pub struct Repository {
    pool: Arc<PgPool>,
}

impl Repository {
    /// Creates a new repository instance.
    pub fn new(pool: Arc<PgPool>) -> Self {
        Self { pool }
    }

    /// Returns a reference to the database pool.
    pub fn pool(&self) -> Arc<PgPool> {
        self.pool.clone()
    }

    /// Inserts a message.
    ///
    /// # Errors
    ///
    /// Returns a constraint violation when the message id already exists.
    pub async fn insert(&self, message: &DlqMessage) -> Result<DlqMessage> {
        let sql = format!(
            r#"
            INSERT INTO dlq_messages ({COLUMNS})
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11,
                    $12, $13, $14, $15, $16, $17, $18, $19, $20, $21)
            RETURNING {COLUMNS}
            "#
        );

        let stored = sqlx::query_as::<_, DlqMessage>(&sql)
            .bind(message.id)
            .bind(&message.message_id)
            .bind(&message.original_message)
            .bind(&message.error_reason)
            .bind(&message.error_stack)
            .bind(&message.error_type)
            .bind(message.retry_count)
            .bind(message.dlq_retry_count)
            .bind(message.first_failed_at)
            .bind(message.last_failed_at)
            .bind(message.status)
            .bind(&message.locked_by)
            .bind(message.locked_at)
            .bind(message.next_retry_at)
            .bind(&message.metadata)
            .bind(&message.replay_attempts)
            .bind(message.resolved_at)
            .bind(&message.resolved_by)
            .bind(&message.resolution_notes)
            .bind(message.created_at)
            .bind(message.updated_at)
            .fetch_one(&*self.pool)
            .await?;

        Ok(stored)
    }

    /// Finds a message by record id.
    ///
    /// # Errors
    ///
    /// Returns error if the query fails.
    pub async fn find_by_id(&self, id: DlqId) -> Result<Option<DlqMessage>> {
        let sql = format!("SELECT {COLUMNS} FROM dlq_messages WHERE id = $1");
        let message =
            sqlx::query_as::<_, DlqMessage>(&sql).bind(id).fetch_optional(&*self.pool).await?;
        Ok(message)
    }

    /// Finds a message by message id.
    ///
    /// # Errors
    ///
    /// Returns error if the query fails.
    pub async fn find_by_message_id(&self, message_id: &str) -> Result<Option<DlqMessage>> {
        let sql = format!("SELECT {COLUMNS} FROM dlq_messages WHERE message_id = $1");
        let message = sqlx::query_as::<_, DlqMessage>(&sql)
            .bind(message_id)
            .fetch_optional(&*self.pool)
            .await?;
        Ok(message)
    }

    /// Messages eligible for a worker, most urgent first.
    ///
    /// # Errors
    ///
    /// Returns error if the query fails.
    pub async fn find_pending(&self, limit: usize, now: DateTime<Utc>) -> Result<Vec<DlqMessage>> {
        let sql = format!(
            r#"
            SELECT {COLUMNS} FROM dlq_messages
            WHERE status = 'pending'
              AND locked_by IS NULL
              AND (next_retry_at IS NULL OR next_retry_at <= $1)
            ORDER BY (metadata->>'priority')::int ASC, created_at ASC
            LIMIT $2
            "#
        );

        let messages = sqlx::query_as::<_, DlqMessage>(&sql)
            .bind(now)
            .bind(i64::try_from(limit).unwrap_or(i64::MAX))
            .fetch_all(&*self.pool)
            .await?;

        Ok(messages)
    }

    /// Clears locks taken before `cutoff`, and locks with no timestamp.
    ///
    /// # Errors
    ///
    /// Returns error if the update fails.
    pub async fn clear_stale_locks(&self, cutoff: DateTime<Utc>, now: DateTime<Utc>) -> Result<u64> {
        let result = sqlx::query(
            r#"
            UPDATE dlq_messages
            SET status = 'pending', locked_by = NULL, locked_at = NULL, updated_at = $2
            WHERE locked_by IS NOT NULL AND (locked_at IS NULL OR locked_at < $1)
            "#,
        )
        .bind(cutoff)
        .bind(now)
        .execute(&*self.pool)
        .await?;

        Ok(result.rows_affected())
    }

    /// Takes the lock if nobody holds it.
    ///
    /// # Errors
    ///
    /// Returns error if the update fails.
    pub async fn acquire_lock(&self, id: DlqId, worker_id: &str, now: DateTime<Utc>) -> Result<bool> {
        let result = sqlx::query(
            r#"
            UPDATE dlq_messages
            SET status = 'processing', locked_by = $2, locked_at = $3, updated_at = $3
            WHERE id = $1 AND locked_by IS NULL AND status = 'pending'
            "#,
        )
        .bind(id)
        .bind(worker_id)
        .bind(now)
        .execute(&*self.pool)
        .await?;

        Ok(result.rows_affected() == 1)
    }

    /// Gives the lock back without recording an outcome.
    ///
    /// # Errors
    ///
    /// Returns error if the update fails.
    pub async fn release_lock(&self, id: DlqId, worker_id: &str, now: DateTime<Utc>) -> Result<bool> {
        let result = sqlx::query(
            r#"
            UPDATE dlq_messages
            SET status = 'pending', locked_by = NULL, locked_at = NULL, updated_at = $3
            WHERE id = $1 AND locked_by = $2
            "#,
        )
        .bind(id)
        .bind(worker_id)
        .bind(now)
        .execute(&*self.pool)
        .await?;

        Ok(result.rows_affected() == 1)
    }

    /// Reschedules a locked message and releases the lock.
    ///
    /// # Errors
    ///
    /// Returns error if the update fails.
    pub async fn schedule_retry(
        &self,
        id: DlqId,
        worker_id: &str,
        next_retry_at: DateTime<Utc>,
        attempt: &ReplayAttempt,
        now: DateTime<Utc>,
    ) -> Result<bool> {
        let result = sqlx::query(
            r#"
            UPDATE dlq_messages
            SET status = 'pending',
                locked_by = NULL,
                locked_at = NULL,
                dlq_retry_count = dlq_retry_count + 1,
                next_retry_at = $3,
                replay_attempts = replay_attempts || $4,
                updated_at = $5
            WHERE id = $1 AND locked_by = $2
            "#,
        )
        .bind(id)
        .bind(worker_id)
        .bind(next_retry_at)
        .bind(Json([attempt]))
        .bind(now)
        .execute(&*self.pool)
        .await?;

        Ok(result.rows_affected() == 1)
    }

    /// Records the outcome of a locked message and releases the lock.
    ///
    /// # Errors
    ///
    /// Returns error if the update fails.
    pub async fn complete(
        &self,
        id: DlqId,
        worker_id: &str,
        status: DlqStatus,
        attempt: &ReplayAttempt,
        now: DateTime<Utc>,
    ) -> Result<bool> {
        let result = sqlx::query(
            r#"
            UPDATE dlq_messages
            SET status = $3,
                locked_by = NULL,
                locked_at = NULL,
                replay_attempts = replay_attempts || $4,
                resolved_at = CASE WHEN $3 = 'resolved' THEN $5 ELSE resolved_at END,
                resolved_by = CASE WHEN $3 = 'resolved' THEN $2 ELSE resolved_by END,
                updated_at = $5
            WHERE id = $1 AND locked_by = $2
            "#,
        )
        .bind(id)
        .bind(worker_id)
        .bind(status)
        .bind(Json([attempt]))
        .bind(now)
        .execute(&*self.pool)
        .await?;

        Ok(result.rows_affected() == 1)
    }

    /// Overwrites the last-failure fields.
    ///
    /// # Errors
    ///
    /// Returns error if the update fails.
    pub async fn record_failure(&self, id: DlqId, update: &FailureUpdate) -> Result<bool> {
        let result = sqlx::query(
            r#"
            UPDATE dlq_messages
            SET last_failed_at = $2,
                error_reason = $3,
                error_type = $4,
                error_stack = $5,
                updated_at = $2
            WHERE id = $1
            "#,
        )
        .bind(id)
        .bind(update.failed_at)
        .bind(&update.error_reason)
        .bind(&update.error_type)
        .bind(&update.error_stack)
        .execute(&*self.pool)
        .await?;

        Ok(result.rows_affected() == 1)
    }

    /// Closes an unlocked, open message for an operator.
    ///
    /// # Errors
    ///
    /// Returns error if the update fails.
    pub async fn close(&self, id: DlqId, update: &ClosingUpdate, now: DateTime<Utc>) -> Result<bool> {
        let result = sqlx::query(
            r#"
            UPDATE dlq_messages
            SET status = $2,
                resolved_at = $5,
                resolved_by = $3,
                resolution_notes = $4,
                replay_attempts = replay_attempts || $6,
                updated_at = $5
            WHERE id = $1
              AND locked_by IS NULL
              AND status IN ('pending', 'failed', 'manual')
            "#,
        )
        .bind(id)
        .bind(update.status)
        .bind(&update.resolved_by)
        .bind(&update.resolution_notes)
        .bind(now)
        .bind(Json([&update.attempt]))
        .execute(&*self.pool)
        .await?;

        Ok(result.rows_affected() == 1)
    }

    /// Status counts and most frequent error types.
    ///
    /// # Errors
    ///
    /// Returns error if either aggregate query fails.
    pub async fn stats(&self, top_error_types: usize) -> Result<DlqStats> {
        let by_status: Vec<(DlqStatus, i64)> =
            sqlx::query_as("SELECT status, COUNT(*) FROM dlq_messages GROUP BY status")
                .fetch_all(&*self.pool)
                .await?;

        let by_type: Vec<(String, i64)> = sqlx::query_as(
            r#"
            SELECT error_type, COUNT(*) AS occurrences
            FROM dlq_messages
            GROUP BY error_type
            ORDER BY occurrences DESC, error_type ASC
            LIMIT $1
            "#,
        )
        .bind(i64::try_from(top_error_types).unwrap_or(i64::MAX))
        .fetch_all(&*self.pool)
        .await?;

        let mut stats = DlqStats::default();
        for (status, count) in by_status {
            stats.add(status, u64::try_from(count).unwrap_or(0));
        }
        stats.top_error_types = by_type
            .into_iter()
            .map(|(error_type, count)| ErrorTypeCount {
                error_type,
                count: u64::try_from(count).unwrap_or(0),
            })
            .collect();

        Ok(stats)
    }
}
