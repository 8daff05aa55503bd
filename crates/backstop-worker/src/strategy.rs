//! Recovery strategy execution.
//!
//! Each strategy is a short sequence of store and queue calls made on a
//! message this worker has locked. The store's conditional updates refuse
//! any change once the lock is gone, which surfaces as
//! [`WorkerError::LockLost`]. Whatever goes wrong, the lock is released
//! before the error propagates so the message never stays stuck in
//! `Processing` until the stale-lock sweep.

use std::{sync::Arc, time::Duration};

use backstop_core::{
    backoff::{format_duration, next_off_peak, scheduled_delay, to_chrono},
    Clock, DlqMessage, DlqStatus, DlqStore, LiveQueue, QueueEnvelope, RecoveryStrategy,
    ReplayAttempt, ReplayOutcome, DLQ_RETRY_TAG,
};
use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, error, info, warn};

use crate::{
    config::WorkerConfig,
    error::{Result, WorkerError},
};

/// What a strategy did to a message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StrategyOutcome {
    /// Strategy recorded in the audit trail.
    pub strategy: RecoveryStrategy,
    /// Audit result.
    pub result: ReplayOutcome,
    /// Status the message was left in.
    pub status: DlqStatus,
    /// When the message becomes eligible again, for retries.
    pub next_retry_at: Option<DateTime<Utc>>,
    /// Id of the envelope re-injected into the live queue, for retries.
    pub replay_message_id: Option<String>,
}

/// Builds the envelope that re-injects `message` into the live queue.
///
/// The envelope starts a fresh primary-path attempt: retry count zero, the
/// original payload, and a back-reference to the DLQ record. Source and
/// priority fall back to the configured replay defaults.
pub fn replay_envelope(
    message: &DlqMessage,
    config: &WorkerConfig,
    now: DateTime<Utc>,
) -> QueueEnvelope {
    let metadata = &message.metadata.0;

    let mut envelope = QueueEnvelope::new(
        format!("dlq_retry_{}_{}", message.message_id, now.timestamp_millis()),
        message.original_message.0.clone(),
    );
    envelope.source = if metadata.source.trim().is_empty() {
        config.replay_source.clone()
    } else {
        metadata.source.clone()
    };
    envelope.priority =
        if metadata.priority > 0 { metadata.priority } else { config.replay_priority };
    envelope.tags = metadata.tags.clone();
    if !envelope.tags.iter().any(|tag| tag == DLQ_RETRY_TAG) {
        envelope.tags.push(DLQ_RETRY_TAG.to_string());
    }
    envelope.headers = metadata.request_headers.clone();
    envelope.original_dlq_id = Some(message.id);
    envelope
}

/// Executes recovery strategies on behalf of one worker.
#[derive(Debug, Clone)]
pub struct StrategyExecutor {
    worker_id: String,
    config: Arc<WorkerConfig>,
    store: Arc<dyn DlqStore>,
    queue: Arc<dyn LiveQueue>,
    clock: Arc<dyn Clock>,
}

impl StrategyExecutor {
    /// Creates an executor acting as `worker_id`.
    pub fn new(
        worker_id: impl Into<String>,
        config: Arc<WorkerConfig>,
        store: Arc<dyn DlqStore>,
        queue: Arc<dyn LiveQueue>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self { worker_id: worker_id.into(), config, store, queue, clock }
    }

    /// Identity used for locks and audit entries.
    pub fn worker_id(&self) -> &str {
        &self.worker_id
    }

    /// Applies `strategy` to a message locked by this worker.
    ///
    /// `ManualReplay` is an operator action; selected here it is treated as
    /// manual intervention.
    ///
    /// # Errors
    ///
    /// Returns error if a store or queue call fails or the lock was lost.
    /// The lock is released before returning.
    pub async fn execute(
        &self,
        message: &DlqMessage,
        strategy: RecoveryStrategy,
    ) -> Result<StrategyOutcome> {
        info!(
            message_id = %message.message_id,
            %strategy,
            dlq_retry_count = message.dlq_retry_count,
            "executing recovery strategy"
        );

        let result = match strategy {
            RecoveryStrategy::ImmediateRetry => self.immediate_retry(message).await,
            RecoveryStrategy::ScheduledRetry => self.scheduled_retry(message).await,
            RecoveryStrategy::MarkAsFailed => self.mark_failed(message).await,
            RecoveryStrategy::ManualIntervention => self.flag_manual(message).await,
            RecoveryStrategy::ManualReplay => {
                warn!(
                    message_id = %message.message_id,
                    "manual replay is operator-only, flagging for manual intervention"
                );
                self.flag_manual(message).await
            },
        };

        if let Err(e) = &result {
            error!(
                message_id = %message.message_id,
                %strategy,
                error = %e,
                "recovery strategy failed"
            );
            self.release(message).await;
        }

        result
    }

    /// Re-injects after the schedule-indexed delay.
    async fn immediate_retry(&self, message: &DlqMessage) -> Result<StrategyOutcome> {
        let index = u32::try_from(message.dlq_retry_count).unwrap_or(0);
        let delay = scheduled_delay(index, &self.config.backoff_schedule);
        let now = self.clock.now_utc();
        let next_retry_at = now + to_chrono(delay);

        let notes = format!(
            "retry attempt {} scheduled for {}",
            message.dlq_retry_count.saturating_add(1),
            next_retry_at.to_rfc3339_opts(SecondsFormat::Millis, true)
        );
        self.reinject(message, RecoveryStrategy::ImmediateRetry, delay, next_retry_at, notes)
            .await
    }

    /// Re-injects at the next off-peak hour.
    async fn scheduled_retry(&self, message: &DlqMessage) -> Result<StrategyOutcome> {
        let now = self.clock.now_utc();
        let next_retry_at = next_off_peak(now, self.config.off_peak_hour);
        let delay = (next_retry_at - now).to_std().unwrap_or(Duration::ZERO);

        let notes = format!(
            "scheduled for off-peak retry at {}",
            next_retry_at.to_rfc3339_opts(SecondsFormat::Millis, true)
        );
        self.reinject(message, RecoveryStrategy::ScheduledRetry, delay, next_retry_at, notes)
            .await
    }

    async fn reinject(
        &self,
        message: &DlqMessage,
        strategy: RecoveryStrategy,
        delay: Duration,
        next_retry_at: DateTime<Utc>,
        notes: String,
    ) -> Result<StrategyOutcome> {
        let now = self.clock.now_utc();
        let envelope = replay_envelope(message, &self.config, now);
        let replay_message_id = envelope.message_id.clone();

        self.queue.enqueue(envelope, delay).await?;
        debug!(
            message_id = %message.message_id,
            replay_message_id,
            delay = %format_duration(delay),
            "replay envelope enqueued"
        );

        let attempt = self.attempt(strategy, ReplayOutcome::Scheduled, notes, now);
        let updated = self
            .store
            .schedule_retry(message.id, &self.worker_id, next_retry_at, attempt, now)
            .await?;
        if !updated {
            return Err(WorkerError::lock_lost(&message.message_id));
        }

        info!(
            message_id = %message.message_id,
            %strategy,
            replay_message_id,
            %next_retry_at,
            "dlq retry scheduled"
        );

        Ok(StrategyOutcome {
            strategy,
            result: ReplayOutcome::Scheduled,
            status: DlqStatus::Pending,
            next_retry_at: Some(next_retry_at),
            replay_message_id: Some(replay_message_id),
        })
    }

    async fn mark_failed(&self, message: &DlqMessage) -> Result<StrategyOutcome> {
        let notes =
            format!("permanently failed after {} retry attempts", message.dlq_retry_count);
        self.complete(message, RecoveryStrategy::MarkAsFailed, DlqStatus::Failed, ReplayOutcome::Failed, notes)
            .await?;

        warn!(
            message_id = %message.message_id,
            error_type = %message.error_type,
            dlq_retry_count = message.dlq_retry_count,
            "dlq message marked as permanently failed"
        );
        Ok(StrategyOutcome {
            strategy: RecoveryStrategy::MarkAsFailed,
            result: ReplayOutcome::Failed,
            status: DlqStatus::Failed,
            next_retry_at: None,
            replay_message_id: None,
        })
    }

    async fn flag_manual(&self, message: &DlqMessage) -> Result<StrategyOutcome> {
        let notes = format!(
            "flagged for manual intervention, error type {} is not handled automatically",
            message.error_type
        );
        self.complete(
            message,
            RecoveryStrategy::ManualIntervention,
            DlqStatus::Manual,
            ReplayOutcome::Flagged,
            notes,
        )
        .await?;

        warn!(
            message_id = %message.message_id,
            error_type = %message.error_type,
            dlq_retry_count = message.dlq_retry_count,
            "dlq message flagged for manual intervention"
        );
        Ok(StrategyOutcome {
            strategy: RecoveryStrategy::ManualIntervention,
            result: ReplayOutcome::Flagged,
            status: DlqStatus::Manual,
            next_retry_at: None,
            replay_message_id: None,
        })
    }

    async fn complete(
        &self,
        message: &DlqMessage,
        strategy: RecoveryStrategy,
        status: DlqStatus,
        result: ReplayOutcome,
        notes: String,
    ) -> Result<()> {
        let now = self.clock.now_utc();
        let attempt = self.attempt(strategy, result, notes, now);
        let updated =
            self.store.complete(message.id, &self.worker_id, status, attempt, now).await?;
        if updated {
            Ok(())
        } else {
            Err(WorkerError::lock_lost(&message.message_id))
        }
    }

    /// Releases the lock after a failure. Errors are logged, not returned.
    async fn release(&self, message: &DlqMessage) {
        match self.store.release_lock(message.id, &self.worker_id, self.clock.now_utc()).await {
            Ok(true) => debug!(message_id = %message.message_id, "lock released after error"),
            Ok(false) => debug!(message_id = %message.message_id, "lock already gone"),
            Err(e) => error!(
                message_id = %message.message_id,
                error = %e,
                "failed to release lock"
            ),
        }
    }

    fn attempt(
        &self,
        strategy: RecoveryStrategy,
        result: ReplayOutcome,
        notes: String,
        now: DateTime<Utc>,
    ) -> ReplayAttempt {
        ReplayAttempt {
            timestamp: now,
            worker_id: self.worker_id.clone(),
            strategy,
            result,
            notes: Some(notes),
        }
    }
}
