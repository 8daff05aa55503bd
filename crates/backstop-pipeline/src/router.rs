//! Dead-letter routing.
//!
//! Persists messages that left the primary path for good, with a host
//! snapshot for forensics and a short entry delay so the DLQ worker does not
//! pick them up in the same instant.

use std::{
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
    time::Duration,
};

use backstop_core::{
    backoff::to_chrono,
    events::{DeadLetterFailedEvent, DeadLetteredEvent, EventHandler, MonitoringEvent},
    Clock, DlqId, DlqMessage, DlqStats, DlqStatus, DlqStore, ErrorSignal, FailureUpdate,
    MessageMetadata, QueueEnvelope, SystemProbe, DEFAULT_PRIORITY,
};
use serde::{Deserialize, Serialize};
use sqlx::types::Json;
use tracing::{error, info, warn};

use crate::{error::Result, retry::RetryDecision};

/// Number of error types reported in [`RouterStats`].
const TOP_ERROR_TYPES: usize = 10;

/// Router defaults.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RouterConfig {
    /// Time before a new record becomes eligible for the worker.
    pub entry_delay: Duration,
    /// Source stored when the envelope has none.
    pub default_source: String,
    /// Priority stored when the envelope carries a non-positive one.
    pub default_priority: i32,
}

impl Default for RouterConfig {
    fn default() -> Self {
        Self {
            entry_delay: Duration::from_secs(60),
            default_source: "api".to_string(),
            default_priority: DEFAULT_PRIORITY,
        }
    }
}

/// Store statistics plus what this process routed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RouterStats {
    /// Aggregate view of the DLQ.
    #[serde(flatten)]
    pub store: DlqStats,
    /// Messages routed by this router since it was created.
    pub routed_in_session: u64,
}

/// Persists failed messages to the DLQ.
#[derive(Debug)]
pub struct DlqRouter {
    config: RouterConfig,
    store: Arc<dyn DlqStore>,
    probe: Arc<dyn SystemProbe>,
    events: Arc<dyn EventHandler>,
    clock: Arc<dyn Clock>,
    routed: AtomicU64,
}

impl DlqRouter {
    /// Creates a router.
    pub fn new(
        config: RouterConfig,
        store: Arc<dyn DlqStore>,
        probe: Arc<dyn SystemProbe>,
        events: Arc<dyn EventHandler>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self { config, store, probe, events, clock, routed: AtomicU64::new(0) }
    }

    /// Persists `envelope` as a pending DLQ record.
    ///
    /// The stored error type is the signal's code when it has one, otherwise
    /// the classification from `decision`.
    ///
    /// # Errors
    ///
    /// Returns error if the store rejects the insert. A routing failure is
    /// also reported to the monitoring sink, since the message may be lost.
    pub async fn route(
        &self,
        envelope: &QueueEnvelope,
        error: &ErrorSignal,
        decision: &RetryDecision,
    ) -> Result<DlqMessage> {
        let message = self.build_record(envelope, error, decision);
        let retry_count = envelope.retry_count;

        match self.store.insert(message).await {
            Ok(stored) => {
                self.routed.fetch_add(1, Ordering::Relaxed);
                info!(
                    message_id = %stored.message_id,
                    dlq_id = %stored.id,
                    error_type = %stored.error_type,
                    reason = %decision.reason,
                    retry_count,
                    "message persisted to dlq"
                );
                self.events
                    .handle_event(MonitoringEvent::DeadLettered(DeadLetteredEvent {
                        dlq_id: stored.id,
                        message_id: stored.message_id.clone(),
                        error_type: stored.error_type.clone(),
                        retry_count,
                        routed_at: stored.created_at,
                    }))
                    .await;
                if let Some(original_id) = envelope.original_dlq_id {
                    self.touch_original(original_id, &stored).await;
                }
                Ok(stored)
            },
            Err(e) => {
                error!(
                    message_id = %envelope.message_id,
                    error = %e,
                    "failed to route message to dlq"
                );
                self.events
                    .handle_event(MonitoringEvent::DeadLetterFailed(DeadLetterFailedEvent {
                        message_id: envelope.message_id.clone(),
                        error: e.to_string(),
                        occurred_at: self.clock.now_utc(),
                    }))
                    .await;
                Err(e.into())
            },
        }
    }

    /// Carries a failed replay's error onto the record it was replayed
    /// from. Best effort: the new record is already stored.
    async fn touch_original(&self, original_id: DlqId, replay: &DlqMessage) {
        let update = FailureUpdate {
            error_reason: replay.error_reason.clone(),
            error_type: replay.error_type.clone(),
            error_stack: replay.error_stack.clone(),
            failed_at: replay.last_failed_at,
        };
        match self.store.record_failure(original_id, update).await {
            Ok(true) => {},
            Ok(false) => warn!(
                original_dlq_id = %original_id,
                message_id = %replay.message_id,
                "original dlq record not found for failed replay"
            ),
            Err(e) => warn!(
                original_dlq_id = %original_id,
                message_id = %replay.message_id,
                error = %e,
                "failed to record replay failure on original dlq record"
            ),
        }
    }

    /// Store statistics plus the session counter.
    ///
    /// # Errors
    ///
    /// Returns error if the store cannot aggregate.
    pub async fn stats(&self) -> Result<RouterStats> {
        let store = self.store.stats(TOP_ERROR_TYPES).await?;
        Ok(RouterStats { store, routed_in_session: self.routed_in_session() })
    }

    /// Messages routed by this router.
    pub fn routed_in_session(&self) -> u64 {
        self.routed.load(Ordering::Relaxed)
    }

    fn build_record(
        &self,
        envelope: &QueueEnvelope,
        error: &ErrorSignal,
        decision: &RetryDecision,
    ) -> DlqMessage {
        let now = self.clock.now_utc();
        let error_type = error
            .code
            .clone()
            .filter(|code| !code.trim().is_empty())
            .unwrap_or_else(|| decision.error_class.as_error_type().to_string());
        let source = if envelope.source.trim().is_empty() {
            self.config.default_source.clone()
        } else {
            envelope.source.clone()
        };
        let priority =
            if envelope.priority > 0 { envelope.priority } else { self.config.default_priority };

        DlqMessage {
            id: DlqId::new(),
            message_id: envelope.message_id.clone(),
            original_message: Json(envelope.payload.clone()),
            error_reason: error.message.clone(),
            error_stack: error.stack.clone(),
            error_type,
            retry_count: i32::try_from(envelope.retry_count).unwrap_or(i32::MAX),
            dlq_retry_count: 0,
            first_failed_at: envelope.first_failed_at.unwrap_or(now),
            last_failed_at: now,
            status: DlqStatus::Pending,
            locked_by: None,
            locked_at: None,
            next_retry_at: Some(now + to_chrono(self.config.entry_delay)),
            metadata: Json(MessageMetadata {
                source,
                priority,
                tags: envelope.tags.clone(),
                request_headers: envelope.headers.clone(),
                system_state: Some(self.probe.capture()),
            }),
            replay_attempts: Json(Vec::new()),
            resolved_at: None,
            resolved_by: None,
            resolution_notes: None,
            created_at: now,
            updated_at: now,
        }
    }
}
