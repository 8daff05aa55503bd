//! Durable storage for dead-lettered messages and the live queue.
//!
//! [`DlqStore`] is the narrow set of operations the router and the DLQ
//! worker are allowed to perform. Every mutation is a single conditional
//! update: the lock fields are only ever changed by `acquire_lock` (when no
//! one holds the lock), by the lock holder, or by `clear_stale_locks`. No
//! caller reads a record, edits it in memory, and writes it back.
//!
//! Two implementations ship: [`PostgresDlqStore`] over the repositories in
//! this module, and [`memory::InMemoryDlqStore`] for tests and single-process
//! use.

use std::{future::Future, pin::Pin, sync::Arc};

use chrono::{DateTime, Utc};
use sqlx::PgPool;

pub mod dlq_messages;
pub mod memory;
pub mod queue_items;

use crate::{
    error::{CoreError, Result},
    models::{DlqId, DlqMessage, DlqStats, DlqStatus, ReplayAttempt},
};

/// Boxed future returned by [`DlqStore`] operations.
pub type StoreFuture<'a, T> = Pin<Box<dyn Future<Output = Result<T>> + Send + 'a>>;

/// Operator-driven close of an unlocked record (replay or resolution).
#[derive(Debug, Clone, PartialEq)]
pub struct ClosingUpdate {
    /// `Resolved` or `Replayed`.
    pub status: DlqStatus,
    /// Who closed it.
    pub resolved_by: String,
    /// Free-form notes.
    pub resolution_notes: Option<String>,
    /// Audit entry appended with the change.
    pub attempt: ReplayAttempt,
}

/// Latest failure of a replay, written back onto the record it came from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FailureUpdate {
    /// Error message.
    pub error_reason: String,
    /// Classified error type.
    pub error_type: String,
    /// Stack or trace, if captured.
    pub error_stack: Option<String>,
    /// When the replay failed.
    pub failed_at: DateTime<Utc>,
}

/// Storage operations over dead-lettered messages.
pub trait DlqStore: Send + Sync + std::fmt::Debug + 'static {
    /// Persists a new message.
    ///
    /// Fails with [`CoreError::ConstraintViolation`] when the message id is
    /// already stored.
    fn insert(&self, message: DlqMessage) -> StoreFuture<'_, DlqMessage>;

    /// Looks a message up by record id.
    fn find_by_id(&self, id: DlqId) -> StoreFuture<'_, Option<DlqMessage>>;

    /// Looks a message up by message id.
    fn find_by_message_id<'a>(&'a self, message_id: &'a str)
        -> StoreFuture<'a, Option<DlqMessage>>;

    /// Messages a worker may pick up at `now`.
    ///
    /// Only `Pending`, unlocked messages whose `next_retry_at` is unset or
    /// due. Ordered by priority ascending, then creation time ascending.
    fn find_pending(&self, limit: usize, now: DateTime<Utc>) -> StoreFuture<'_, Vec<DlqMessage>>;

    /// Resets every lock taken before `cutoff` back to `Pending`.
    ///
    /// Returns the number of locks cleared. Safe to run concurrently from
    /// several workers: a second pass finds nothing to clear.
    fn clear_stale_locks(
        &self,
        cutoff: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> StoreFuture<'_, u64>;

    /// Atomically locks a pending, unlocked message for `worker_id` and
    /// moves it to `Processing`. Returns `false` when someone else won.
    fn acquire_lock<'a>(
        &'a self,
        id: DlqId,
        worker_id: &'a str,
        now: DateTime<Utc>,
    ) -> StoreFuture<'a, bool>;

    /// Returns a message locked by `worker_id` to `Pending` and clears the
    /// lock. Returns `false` when `worker_id` does not hold the lock.
    fn release_lock<'a>(
        &'a self,
        id: DlqId,
        worker_id: &'a str,
        now: DateTime<Utc>,
    ) -> StoreFuture<'a, bool>;

    /// Reschedules a message locked by `worker_id`: increments the DLQ retry
    /// count, sets `next_retry_at`, returns it to `Pending`, clears the lock
    /// and appends `attempt`.
    fn schedule_retry<'a>(
        &'a self,
        id: DlqId,
        worker_id: &'a str,
        next_retry_at: DateTime<Utc>,
        attempt: ReplayAttempt,
        now: DateTime<Utc>,
    ) -> StoreFuture<'a, bool>;

    /// Moves a message locked by `worker_id` to `Resolved`, `Failed` or
    /// `Manual`, clears the lock and appends `attempt`.
    fn complete<'a>(
        &'a self,
        id: DlqId,
        worker_id: &'a str,
        status: DlqStatus,
        attempt: ReplayAttempt,
        now: DateTime<Utc>,
    ) -> StoreFuture<'a, bool>;

    /// Closes an unlocked `Pending`, `Failed` or `Manual` message on behalf
    /// of an operator. Returns `false` when the message is locked or already
    /// closed.
    fn close(&self, id: DlqId, update: ClosingUpdate, now: DateTime<Utc>)
        -> StoreFuture<'_, bool>;

    /// Overwrites the last-failure fields of a message. Status and lock are
    /// left alone. Returns `false` when the message does not exist.
    fn record_failure(&self, id: DlqId, update: FailureUpdate) -> StoreFuture<'_, bool>;

    /// Counts per status plus the `top_error_types` most frequent error
    /// types.
    fn stats(&self, top_error_types: usize) -> StoreFuture<'_, DlqStats>;
}

pub(crate) fn ensure_completion_status(status: DlqStatus) -> Result<()> {
    match status {
        DlqStatus::Resolved | DlqStatus::Failed | DlqStatus::Manual => Ok(()),
        other => Err(CoreError::InvalidInput(format!(
            "{other} is not a completion status for a locked message"
        ))),
    }
}

pub(crate) fn ensure_closing_status(status: DlqStatus) -> Result<()> {
    match status {
        DlqStatus::Resolved | DlqStatus::Replayed => Ok(()),
        other => Err(CoreError::InvalidInput(format!("{other} cannot be set by an operator"))),
    }
}

/// Container for the Postgres repositories.
#[derive(Clone)]
pub struct Storage {
    /// Dead-lettered messages.
    pub dlq_messages: Arc<dlq_messages::Repository>,

    /// Live queue items.
    pub queue_items: Arc<queue_items::Repository>,
}

impl Storage {
    /// Creates repositories sharing one pool.
    pub fn new(pool: PgPool) -> Self {
        let pool = Arc::new(pool);
        Self {
            dlq_messages: Arc::new(dlq_messages::Repository::new(pool.clone())),
            queue_items: Arc::new(queue_items::Repository::new(pool)),
        }
    }

    /// Verifies the database answers.
    ///
    /// # Errors
    ///
    /// Returns error if the query fails.
    pub async fn health_check(&self) -> Result<()> {
        sqlx::query("SELECT 1").execute(&*self.dlq_messages.pool()).await?;
        Ok(())
    }
}

/// [`DlqStore`] over the `dlq_messages` table.
#[derive(Debug, Clone)]
pub struct PostgresDlqStore {
    repository: Arc<dlq_messages::Repository>,
}

impl PostgresDlqStore {
    /// Wraps a repository.
    pub fn new(repository: Arc<dlq_messages::Repository>) -> Self {
        Self { repository }
    }
}

impl DlqStore for PostgresDlqStore {
    fn insert(&self, message: DlqMessage) -> StoreFuture<'_, DlqMessage> {
        Box::pin(async move { self.repository.insert(&message).await })
    }

    fn find_by_id(&self, id: DlqId) -> StoreFuture<'_, Option<DlqMessage>> {
        Box::pin(async move { self.repository.find_by_id(id).await })
    }

    fn find_by_message_id<'a>(
        &'a self,
        message_id: &'a str,
    ) -> StoreFuture<'a, Option<DlqMessage>> {
        Box::pin(async move { self.repository.find_by_message_id(message_id).await })
    }

    fn find_pending(&self, limit: usize, now: DateTime<Utc>) -> StoreFuture<'_, Vec<DlqMessage>> {
        Box::pin(async move { self.repository.find_pending(limit, now).await })
    }

    fn clear_stale_locks(
        &self,
        cutoff: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> StoreFuture<'_, u64> {
        Box::pin(async move { self.repository.clear_stale_locks(cutoff, now).await })
    }

    fn acquire_lock<'a>(
        &'a self,
        id: DlqId,
        worker_id: &'a str,
        now: DateTime<Utc>,
    ) -> StoreFuture<'a, bool> {
        Box::pin(async move { self.repository.acquire_lock(id, worker_id, now).await })
    }

    fn release_lock<'a>(
        &'a self,
        id: DlqId,
        worker_id: &'a str,
        now: DateTime<Utc>,
    ) -> StoreFuture<'a, bool> {
        Box::pin(async move { self.repository.release_lock(id, worker_id, now).await })
    }

    fn schedule_retry<'a>(
        &'a self,
        id: DlqId,
        worker_id: &'a str,
        next_retry_at: DateTime<Utc>,
        attempt: ReplayAttempt,
        now: DateTime<Utc>,
    ) -> StoreFuture<'a, bool> {
        Box::pin(async move {
            self.repository.schedule_retry(id, worker_id, next_retry_at, &attempt, now).await
        })
    }

    fn complete<'a>(
        &'a self,
        id: DlqId,
        worker_id: &'a str,
        status: DlqStatus,
        attempt: ReplayAttempt,
        now: DateTime<Utc>,
    ) -> StoreFuture<'a, bool> {
        Box::pin(async move {
            ensure_completion_status(status)?;
            self.repository.complete(id, worker_id, status, &attempt, now).await
        })
    }

    fn close(
        &self,
        id: DlqId,
        update: ClosingUpdate,
        now: DateTime<Utc>,
    ) -> StoreFuture<'_, bool> {
        Box::pin(async move {
            ensure_closing_status(update.status)?;
            self.repository.close(id, &update, now).await
        })
    }

    fn record_failure(&self, id: DlqId, update: FailureUpdate) -> StoreFuture<'_, bool> {
        Box::pin(async move { self.repository.record_failure(id, &update).await })
    }

    fn stats(&self, top_error_types: usize) -> StoreFuture<'_, DlqStats> {
        Box::pin(async move { self.repository.stats(top_error_types).await })
    }
}
