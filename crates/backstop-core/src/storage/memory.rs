//! In-memory [`DlqStore`] for tests and single-process deployments.
//!
//! All mutations happen under one write lock, which gives the same
//! compare-and-set guarantees as the conditional updates in Postgres.
//! Errors can be injected per operation to exercise recovery paths.

use std::{collections::HashMap, sync::Arc};

use chrono::{DateTime, Utc};
use tokio::sync::RwLock;

use super::{
    ensure_closing_status, ensure_completion_status, ClosingUpdate, DlqStore, FailureUpdate,
    StoreFuture,
};
use crate::{
    error::{CoreError, Result},
    models::{DlqId, DlqMessage, DlqStats, DlqStatus, ErrorTypeCount, ReplayAttempt},
};

/// Store operation an injected error applies to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StoreOperation {
    /// [`DlqStore::insert`].
    Insert,
    /// [`DlqStore::find_pending`].
    FindPending,
    /// [`DlqStore::clear_stale_locks`].
    ClearStaleLocks,
    /// [`DlqStore::acquire_lock`].
    AcquireLock,
    /// [`DlqStore::release_lock`].
    ReleaseLock,
    /// [`DlqStore::schedule_retry`].
    ScheduleRetry,
    /// [`DlqStore::complete`].
    Complete,
    /// [`DlqStore::close`].
    Close,
    /// [`DlqStore::record_failure`].
    RecordFailure,
}

/// Map-backed store.
#[derive(Debug, Clone, Default)]
pub struct InMemoryDlqStore {
    messages: Arc<RwLock<HashMap<DlqId, DlqMessage>>>,
    injected: Arc<RwLock<HashMap<StoreOperation, String>>>,
}

impl InMemoryDlqStore {
    /// Creates an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes the next call to `operation` fail with a database error.
    pub async fn inject_error(&self, operation: StoreOperation, error: impl Into<String>) {
        self.injected.write().await.insert(operation, error.into());
    }

    /// Every stored message, oldest first.
    pub async fn all(&self) -> Vec<DlqMessage> {
        let mut messages: Vec<_> = self.messages.read().await.values().cloned().collect();
        messages.sort_by_key(|message| message.created_at);
        messages
    }

    /// Number of stored messages.
    pub async fn len(&self) -> usize {
        self.messages.read().await.len()
    }

    /// Returns true when nothing is stored.
    pub async fn is_empty(&self) -> bool {
        self.messages.read().await.is_empty()
    }

    /// Overwrites a stored message, bypassing every check. Test setup only.
    pub async fn put(&self, message: DlqMessage) {
        self.messages.write().await.insert(message.id, message);
    }

    async fn check_injected(&self, operation: StoreOperation) -> Result<()> {
        match self.injected.write().await.remove(&operation) {
            Some(error) => Err(CoreError::Database(error)),
            None => Ok(()),
        }
    }

    /// Applies `update` to the message if `guard` accepts it.
    #[allow(clippy::significant_drop_tightening)]
    async fn update_if(
        &self,
        id: DlqId,
        guard: impl FnOnce(&DlqMessage) -> bool,
        update: impl FnOnce(&mut DlqMessage),
    ) -> bool {
        let mut messages = self.messages.write().await;
        match messages.get_mut(&id) {
            Some(message) if guard(message) => {
                update(message);
                true
            },
            _ => false,
        }
    }
}

impl DlqStore for InMemoryDlqStore {
    fn insert(&self, message: DlqMessage) -> StoreFuture<'_, DlqMessage> {
        Box::pin(async move {
            self.check_injected(StoreOperation::Insert).await?;

            let mut messages = self.messages.write().await;
            if messages.values().any(|existing| existing.message_id == message.message_id) {
                return Err(CoreError::ConstraintViolation(format!(
                    "message {} is already dead-lettered",
                    message.message_id
                )));
            }
            messages.insert(message.id, message.clone());
            Ok(message)
        })
    }

    fn find_by_id(&self, id: DlqId) -> StoreFuture<'_, Option<DlqMessage>> {
        Box::pin(async move { Ok(self.messages.read().await.get(&id).cloned()) })
    }

    fn find_by_message_id<'a>(
        &'a self,
        message_id: &'a str,
    ) -> StoreFuture<'a, Option<DlqMessage>> {
        Box::pin(async move {
            let messages = self.messages.read().await;
            Ok(messages.values().find(|message| message.message_id == message_id).cloned())
        })
    }

    fn find_pending(&self, limit: usize, now: DateTime<Utc>) -> StoreFuture<'_, Vec<DlqMessage>> {
        Box::pin(async move {
            self.check_injected(StoreOperation::FindPending).await?;

            let mut eligible: Vec<DlqMessage> = self
                .messages
                .read()
                .await
                .values()
                .filter(|message| message.is_eligible(now))
                .cloned()
                .collect();
            eligible.sort_by_key(|message| (message.priority(), message.created_at));
            eligible.truncate(limit);
            Ok(eligible)
        })
    }

    fn clear_stale_locks(
        &self,
        cutoff: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> StoreFuture<'_, u64> {
        Box::pin(async move {
            self.check_injected(StoreOperation::ClearStaleLocks).await?;

            let mut cleared = 0;
            for message in self.messages.write().await.values_mut() {
                if message.has_stale_lock(cutoff) {
                    message.status = DlqStatus::Pending;
                    message.locked_by = None;
                    message.locked_at = None;
                    message.updated_at = now;
                    cleared += 1;
                }
            }
            Ok(cleared)
        })
    }

    fn acquire_lock<'a>(
        &'a self,
        id: DlqId,
        worker_id: &'a str,
        now: DateTime<Utc>,
    ) -> StoreFuture<'a, bool> {
        Box::pin(async move {
            self.check_injected(StoreOperation::AcquireLock).await?;

            Ok(self
                .update_if(
                    id,
                    |message| message.locked_by.is_none() && message.status == DlqStatus::Pending,
                    |message| {
                        message.status = DlqStatus::Processing;
                        message.locked_by = Some(worker_id.to_string());
                        message.locked_at = Some(now);
                        message.updated_at = now;
                    },
                )
                .await)
        })
    }

    fn release_lock<'a>(
        &'a self,
        id: DlqId,
        worker_id: &'a str,
        now: DateTime<Utc>,
    ) -> StoreFuture<'a, bool> {
        Box::pin(async move {
            self.check_injected(StoreOperation::ReleaseLock).await?;

            Ok(self
                .update_if(
                    id,
                    |message| message.locked_by.as_deref() == Some(worker_id),
                    |message| {
                        message.status = DlqStatus::Pending;
                        message.locked_by = None;
                        message.locked_at = None;
                        message.updated_at = now;
                    },
                )
                .await)
        })
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
            self.check_injected(StoreOperation::ScheduleRetry).await?;

            Ok(self
                .update_if(
                    id,
                    |message| message.locked_by.as_deref() == Some(worker_id),
                    |message| {
                        message.status = DlqStatus::Pending;
                        message.locked_by = None;
                        message.locked_at = None;
                        message.dlq_retry_count += 1;
                        message.next_retry_at = Some(next_retry_at);
                        message.replay_attempts.0.push(attempt);
                        message.updated_at = now;
                    },
                )
                .await)
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
            self.check_injected(StoreOperation::Complete).await?;

            Ok(self
                .update_if(
                    id,
                    |message| message.locked_by.as_deref() == Some(worker_id),
                    |message| {
                        message.status = status;
                        message.locked_by = None;
                        message.locked_at = None;
                        message.replay_attempts.0.push(attempt);
                        if status == DlqStatus::Resolved {
                            message.resolved_at = Some(now);
                            message.resolved_by = Some(worker_id.to_string());
                        }
                        message.updated_at = now;
                    },
                )
                .await)
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
            self.check_injected(StoreOperation::Close).await?;

            Ok(self
                .update_if(
                    id,
                    |message| {
                        message.locked_by.is_none() && message.status.accepts_operator_action()
                    },
                    |message| {
                        message.status = update.status;
                        message.resolved_at = Some(now);
                        message.resolved_by = Some(update.resolved_by);
                        message.resolution_notes = update.resolution_notes;
                        message.replay_attempts.0.push(update.attempt);
                        message.updated_at = now;
                    },
                )
                .await)
        })
    }

    fn record_failure(&self, id: DlqId, update: FailureUpdate) -> StoreFuture<'_, bool> {
        Box::pin(async move {
            self.check_injected(StoreOperation::RecordFailure).await?;

            Ok(self
                .update_if(
                    id,
                    |_| true,
                    |message| {
                        message.last_failed_at = update.failed_at;
                        message.error_reason = update.error_reason;
                        message.error_type = update.error_type;
                        message.error_stack = update.error_stack;
                        message.updated_at = update.failed_at;
                    },
                )
                .await)
        })
    }

    fn stats(&self, top_error_types: usize) -> StoreFuture<'_, DlqStats> {
        Box::pin(async move {
            let messages = self.messages.read().await;
            let mut stats = DlqStats::default();
            let mut by_type: HashMap<&str, u64> = HashMap::new();

            for message in messages.values() {
                stats.add(message.status, 1);
                *by_type.entry(message.error_type.as_str()).or_default() += 1;
            }

            let mut counts: Vec<ErrorTypeCount> = by_type
                .into_iter()
                .map(|(error_type, count)| ErrorTypeCount { error_type: error_type.to_string(), count })
                .collect();
            counts.sort_by(|a, b| b.count.cmp(&a.count).then_with(|| a.error_type.cmp(&b.error_type)));
            counts.truncate(top_error_types);
            stats.top_error_types = counts;

            Ok(stats)
        })
    }
}

#[cfg(test)]
mod tests {
    use chrono::Duration;
    use serde_json::json;
    use sqlx::types::Json;

    use super::*;
    use crate::models::{MessageMetadata, RecoveryStrategy, ReplayOutcome};

    fn message(message_id: &str, priority: i32, created_at: DateTime<Utc>) -> DlqMessage {
        DlqMessage {
            id: DlqId::new(),
            message_id: message_id.to_string(),
            original_message: Json(json!({"id": message_id})),
            error_reason: "Connection timeout".to_string(),
            error_stack: None,
            error_type: "TIMEOUT".to_string(),
            retry_count: 3,
            dlq_retry_count: 0,
            first_failed_at: created_at,
            last_failed_at: created_at,
            status: DlqStatus::Pending,
            locked_by: None,
            locked_at: None,
            next_retry_at: None,
            metadata: Json(MessageMetadata { priority, ..MessageMetadata::default() }),
            replay_attempts: Json(Vec::new()),
            resolved_at: None,
            resolved_by: None,
            resolution_notes: None,
            created_at,
            updated_at: created_at,
        }
    }

    fn attempt(worker_id: &str, now: DateTime<Utc>) -> ReplayAttempt {
        ReplayAttempt {
            timestamp: now,
            worker_id: worker_id.to_string(),
            strategy: RecoveryStrategy::ImmediateRetry,
            result: ReplayOutcome::Scheduled,
            notes: None,
        }
    }

    #[tokio::test]
    async fn pending_ordered_by_priority_then_age() {
        let store = InMemoryDlqStore::new();
        let t0 = Utc::now();
        store.insert(message("low-old", 3, t0)).await.unwrap();
        store.insert(message("urgent-new", 1, t0 + Duration::seconds(5))).await.unwrap();
        store.insert(message("normal-old", 2, t0)).await.unwrap();
        store.insert(message("normal-new", 2, t0 + Duration::seconds(1))).await.unwrap();

        let pending = store.find_pending(10, t0 + Duration::minutes(1)).await.unwrap();
        let order: Vec<_> = pending.iter().map(|m| m.message_id.as_str()).collect();

        assert_eq!(order, vec!["urgent-new", "normal-old", "normal-new", "low-old"]);
    }

    #[tokio::test]
    async fn pending_skips_future_retries_and_locked() {
        let store = InMemoryDlqStore::new();
        let now = Utc::now();
        let mut later = message("later", 1, now);
        later.next_retry_at = Some(now + Duration::minutes(5));
        let mut locked = message("locked", 1, now);
        locked.status = DlqStatus::Processing;
        locked.locked_by = Some("worker-a".to_string());
        locked.locked_at = Some(now);
        store.put(later).await;
        store.put(locked).await;
        store.put(message("ready", 2, now)).await;

        let pending = store.find_pending(10, now).await.unwrap();

        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].message_id, "ready");
    }

    #[tokio::test]
    async fn duplicate_message_id_is_rejected() {
        let store = InMemoryDlqStore::new();
        let now = Utc::now();
        store.insert(message("dup", 2, now)).await.unwrap();

        let err = store.insert(message("dup", 2, now)).await.unwrap_err();

        assert!(matches!(err, CoreError::ConstraintViolation(_)));
        assert_eq!(store.len().await, 1);
    }

    #[tokio::test]
    async fn only_one_worker_wins_the_lock() {
        let store = InMemoryDlqStore::new();
        let now = Utc::now();
        let stored = store.insert(message("contended", 2, now)).await.unwrap();

        let attempts = (0..8).map(|i| {
            let store = store.clone();
            tokio::spawn(async move { store.acquire_lock(stored.id, &format!("w{i}"), now).await })
        });
        let wins = futures::future::join_all(attempts)
            .await
            .into_iter()
            .filter(|result| matches!(result, Ok(Ok(true))))
            .count();

        assert_eq!(wins, 1);
        let locked = store.find_by_id(stored.id).await.unwrap().unwrap();
        assert_eq!(locked.status, DlqStatus::Processing);
        assert!(locked.locked_by.is_some());
    }

    #[tokio::test]
    async fn only_holder_can_release_or_reschedule() {
        let store = InMemoryDlqStore::new();
        let now = Utc::now();
        let stored = store.insert(message("held", 2, now)).await.unwrap();
        assert!(store.acquire_lock(stored.id, "owner", now).await.unwrap());

        assert!(!store.release_lock(stored.id, "intruder", now).await.unwrap());
        assert!(!store
            .schedule_retry(stored.id, "intruder", now, attempt("intruder", now), now)
            .await
            .unwrap());

        let next = now + Duration::minutes(1);
        assert!(store.schedule_retry(stored.id, "owner", next, attempt("owner", now), now).await.unwrap());

        let rescheduled = store.find_by_id(stored.id).await.unwrap().unwrap();
        assert_eq!(rescheduled.status, DlqStatus::Pending);
        assert_eq!(rescheduled.dlq_retry_count, 1);
        assert_eq!(rescheduled.next_retry_at, Some(next));
        assert_eq!(rescheduled.replay_attempts.0.len(), 1);
        assert!(rescheduled.locked_by.is_none());
    }

    #[tokio::test]
    async fn stale_lock_clearing_is_idempotent() {
        let store = InMemoryDlqStore::new();
        let now = Utc::now();
        let stored = store.insert(message("stuck", 2, now)).await.unwrap();
        store.acquire_lock(stored.id, "crashed", now - Duration::minutes(10)).await.unwrap();
        let cutoff = now - Duration::minutes(5);

        assert_eq!(store.clear_stale_locks(cutoff, now).await.unwrap(), 1);
        assert_eq!(store.clear_stale_locks(cutoff, now).await.unwrap(), 0);

        let cleared = store.find_by_id(stored.id).await.unwrap().unwrap();
        assert_eq!(cleared.status, DlqStatus::Pending);
        assert!(cleared.locked_by.is_none() && cleared.locked_at.is_none());
    }

    #[tokio::test]
    async fn lock_without_timestamp_is_cleared() {
        let store = InMemoryDlqStore::new();
        let now = Utc::now();
        let mut orphaned = message("orphaned", 2, now);
        orphaned.status = DlqStatus::Processing;
        orphaned.locked_by = Some("vanished".to_string());
        let id = orphaned.id;
        store.put(orphaned).await;

        assert_eq!(store.clear_stale_locks(now - Duration::minutes(5), now).await.unwrap(), 1);

        let cleared = store.find_by_id(id).await.unwrap().unwrap();
        assert_eq!(cleared.status, DlqStatus::Pending);
        assert!(cleared.locked_by.is_none());
        assert!(cleared.is_eligible(now));
    }

    #[tokio::test]
    async fn fresh_locks_survive_clearing() {
        let store = InMemoryDlqStore::new();
        let now = Utc::now();
        let stored = store.insert(message("busy", 2, now)).await.unwrap();
        store.acquire_lock(stored.id, "alive", now).await.unwrap();

        assert_eq!(store.clear_stale_locks(now - Duration::minutes(5), now).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn completion_rejects_non_terminal_status() {
        let store = InMemoryDlqStore::new();
        let now = Utc::now();
        let stored = store.insert(message("bad", 2, now)).await.unwrap();
        store.acquire_lock(stored.id, "w", now).await.unwrap();

        let err = store
            .complete(stored.id, "w", DlqStatus::Pending, attempt("w", now), now)
            .await
            .unwrap_err();

        assert!(matches!(err, CoreError::InvalidInput(_)));
    }

    #[tokio::test]
    async fn resolving_completion_records_resolver() {
        let store = InMemoryDlqStore::new();
        let now = Utc::now();
        let stored = store.insert(message("ok", 2, now)).await.unwrap();
        store.acquire_lock(stored.id, "w", now).await.unwrap();

        assert!(store.complete(stored.id, "w", DlqStatus::Resolved, attempt("w", now), now).await.unwrap());

        let resolved = store.find_by_id(stored.id).await.unwrap().unwrap();
        assert_eq!(resolved.resolved_by.as_deref(), Some("w"));
        assert_eq!(resolved.resolved_at, Some(now));
    }

    #[tokio::test]
    async fn close_refuses_locked_messages() {
        let store = InMemoryDlqStore::new();
        let now = Utc::now();
        let stored = store.insert(message("in-flight", 2, now)).await.unwrap();
        store.acquire_lock(stored.id, "w", now).await.unwrap();
        let update = ClosingUpdate {
            status: DlqStatus::Resolved,
            resolved_by: "ops".to_string(),
            resolution_notes: Some("fixed upstream".to_string()),
            attempt: attempt("ops", now),
        };

        assert!(!store.close(stored.id, update.clone(), now).await.unwrap());

        store.release_lock(stored.id, "w", now).await.unwrap();
        assert!(store.close(stored.id, update, now).await.unwrap());
        let closed = store.find_by_id(stored.id).await.unwrap().unwrap();
        assert_eq!(closed.status, DlqStatus::Resolved);
        assert_eq!(closed.resolution_notes.as_deref(), Some("fixed upstream"));
    }

    #[tokio::test]
    async fn recording_a_failure_keeps_status_and_lock() {
        let store = InMemoryDlqStore::new();
        let now = Utc::now();
        let stored = store.insert(message("replayed", 2, now)).await.unwrap();
        store.acquire_lock(stored.id, "w", now).await.unwrap();
        let later = now + Duration::minutes(3);

        let update = FailureUpdate {
            error_reason: "Connection refused".to_string(),
            error_type: "NETWORK".to_string(),
            error_stack: Some("at connect".to_string()),
            failed_at: later,
        };
        assert!(store.record_failure(stored.id, update.clone()).await.unwrap());
        assert!(!store.record_failure(DlqId::new(), update).await.unwrap());

        let touched = store.find_by_id(stored.id).await.unwrap().unwrap();
        assert_eq!(touched.last_failed_at, later);
        assert_eq!(touched.first_failed_at, now);
        assert_eq!(touched.error_type, "NETWORK");
        assert_eq!(touched.error_stack.as_deref(), Some("at connect"));
        assert_eq!(touched.status, DlqStatus::Processing);
        assert_eq!(touched.locked_by.as_deref(), Some("w"));
    }

    #[tokio::test]
    async fn injected_error_fires_once() {
        let store = InMemoryDlqStore::new();
        store.inject_error(StoreOperation::FindPending, "connection reset").await;

        let err = store.find_pending(10, Utc::now()).await.unwrap_err();
        assert!(matches!(err, CoreError::Database(ref msg) if msg == "connection reset"));
        assert!(store.find_pending(10, Utc::now()).await.is_ok());
    }

    #[tokio::test]
    async fn stats_count_status_and_error_types() {
        let store = InMemoryDlqStore::new();
        let now = Utc::now();
        for i in 0..3 {
            store.insert(message(&format!("t{i}"), 2, now)).await.unwrap();
        }
        let mut validation = message("v", 2, now);
        validation.error_type = "VALIDATION".to_string();
        validation.status = DlqStatus::Failed;
        store.put(validation).await;

        let stats = store.stats(1).await.unwrap();

        assert_eq!(stats.total, 4);
        assert_eq!(stats.pending, 3);
        assert_eq!(stats.failed, 1);
        assert_eq!(stats.top_error_types, vec![ErrorTypeCount { error_type: "TIMEOUT".into(), count: 3 }]);
    }
}
