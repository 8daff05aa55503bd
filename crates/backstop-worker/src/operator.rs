//! Operator actions on dead-lettered messages.
//!
//! These act on unlocked records only: a message a worker currently holds
//! is refused rather than raced.

use std::{sync::Arc, time::Duration};

use backstop_core::{
    Clock, ClosingUpdate, DlqId, DlqMessage, DlqStatus, DlqStore, LiveQueue, RecoveryStrategy,
    ReplayAttempt, ReplayOutcome,
};
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::{
    config::WorkerConfig,
    error::{Result, WorkerError},
    strategy::replay_envelope,
};

/// Result of a manual replay.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReplayReceipt {
    /// Replayed record.
    pub dlq_id: DlqId,
    /// Envelope put on the live queue.
    pub replay_message_id: String,
}

/// Manual replay and resolution.
#[derive(Debug, Clone)]
pub struct OperatorActions {
    config: Arc<WorkerConfig>,
    store: Arc<dyn DlqStore>,
    queue: Arc<dyn LiveQueue>,
    clock: Arc<dyn Clock>,
}

impl OperatorActions {
    /// Creates the action set.
    pub fn new(
        config: Arc<WorkerConfig>,
        store: Arc<dyn DlqStore>,
        queue: Arc<dyn LiveQueue>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self { config, store, queue, clock }
    }

    /// Re-injects a message into the live queue right away and marks the
    /// record `Replayed`.
    ///
    /// The envelope is enqueued before the record is closed, so a failure
    /// in between can replay twice but never loses the message.
    ///
    /// # Errors
    ///
    /// Returns error if the message does not exist, is locked or already
    /// closed, or a store or queue call fails.
    pub async fn replay(&self, message_id: &str, operator: &str) -> Result<ReplayReceipt> {
        let message = self.actionable(message_id).await?;
        let now = self.clock.now_utc();

        let envelope = replay_envelope(&message, &self.config, now);
        let replay_message_id = envelope.message_id.clone();
        self.queue.enqueue(envelope, Duration::ZERO).await?;

        let update = ClosingUpdate {
            status: DlqStatus::Replayed,
            resolved_by: operator.to_string(),
            resolution_notes: Some(format!("manually replayed as {replay_message_id}")),
            attempt: ReplayAttempt {
                timestamp: now,
                worker_id: operator.to_string(),
                strategy: RecoveryStrategy::ManualReplay,
                result: ReplayOutcome::Replayed,
                notes: Some(format!("replay envelope {replay_message_id} enqueued")),
            },
        };
        self.close(&message, update).await?;

        info!(message_id, operator, replay_message_id, "dlq message replayed");
        Ok(ReplayReceipt { dlq_id: message.id, replay_message_id })
    }

    /// Closes a message as resolved without replaying it.
    ///
    /// # Errors
    ///
    /// Returns error if the message does not exist, is locked or already
    /// closed, or the store fails.
    pub async fn resolve(
        &self,
        message_id: &str,
        operator: &str,
        notes: Option<String>,
    ) -> Result<DlqMessage> {
        let message = self.actionable(message_id).await?;
        let now = self.clock.now_utc();

        let update = ClosingUpdate {
            status: DlqStatus::Resolved,
            resolved_by: operator.to_string(),
            resolution_notes: notes.clone(),
            attempt: ReplayAttempt {
                timestamp: now,
                worker_id: operator.to_string(),
                strategy: RecoveryStrategy::ManualIntervention,
                result: ReplayOutcome::Resolved,
                notes,
            },
        };
        self.close(&message, update).await?;
        info!(message_id, operator, "dlq message resolved");

        self.store
            .find_by_id(message.id)
            .await?
            .ok_or_else(|| WorkerError::not_found(message_id))
    }

    async fn actionable(&self, message_id: &str) -> Result<DlqMessage> {
        let message = self
            .store
            .find_by_message_id(message_id)
            .await?
            .ok_or_else(|| WorkerError::not_found(message_id))?;

        if message.locked_by.is_some() || !message.status.accepts_operator_action() {
            return Err(WorkerError::InvalidState {
                message_id: message_id.to_string(),
                status: message.status,
            });
        }
        Ok(message)
    }

    async fn close(&self, message: &DlqMessage, update: ClosingUpdate) -> Result<()> {
        let closed = self.store.close(message.id, update, self.clock.now_utc()).await?;
        if closed {
            return Ok(());
        }

        let status = self
            .store
            .find_by_id(message.id)
            .await?
            .map_or(message.status, |current| current.status);
        Err(WorkerError::InvalidState { message_id: message.message_id.clone(), status })
    }
}
