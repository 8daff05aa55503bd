//! Builders for DLQ records and queue envelopes.

use backstop_core::{
    DlqId, DlqMessage, DlqStatus, MessageMetadata, QueueEnvelope, ReplayAttempt,
};
use chrono::{DateTime, Utc};
use serde_json::{json, Value};
use sqlx::types::Json;

/// Builder for [`DlqMessage`] records, pending and unlocked by default.
#[derive(Debug, Clone)]
pub struct DlqMessageBuilder {
    message: DlqMessage,
}

impl DlqMessageBuilder {
    /// Starts a pending `TIMEOUT_ERROR` record created at `now`.
    pub fn new(message_id: impl Into<String>, now: DateTime<Utc>) -> Self {
        let message_id = message_id.into();
        Self {
            message: DlqMessage {
                id: DlqId::new(),
                original_message: Json(json!({ "messageId": message_id })),
                message_id,
                error_reason: "External API timeout after 5000ms".to_string(),
                error_stack: None,
                error_type: "TIMEOUT_ERROR".to_string(),
                retry_count: 3,
                dlq_retry_count: 0,
                first_failed_at: now,
                last_failed_at: now,
                status: DlqStatus::Pending,
                locked_by: None,
                locked_at: None,
                next_retry_at: None,
                metadata: Json(MessageMetadata::default()),
                replay_attempts: Json(Vec::new()),
                resolved_at: None,
                resolved_by: None,
                resolution_notes: None,
                created_at: now,
                updated_at: now,
            },
        }
    }

    /// Sets the error type and reason.
    #[must_use]
    pub fn error(mut self, error_type: impl Into<String>, reason: impl Into<String>) -> Self {
        self.message.error_type = error_type.into();
        self.message.error_reason = reason.into();
        self
    }

    /// Sets the error type only.
    #[must_use]
    pub fn error_type(mut self, error_type: impl Into<String>) -> Self {
        self.message.error_type = error_type.into();
        self
    }

    /// Sets the payload.
    #[must_use]
    pub fn payload(mut self, payload: Value) -> Self {
        self.message.original_message = Json(payload);
        self
    }

    /// Sets the status.
    #[must_use]
    pub fn status(mut self, status: DlqStatus) -> Self {
        self.message.status = status;
        self
    }

    /// Sets the DLQ retry count.
    #[must_use]
    pub fn dlq_retry_count(mut self, count: i32) -> Self {
        self.message.dlq_retry_count = count;
        self
    }

    /// Sets the priority.
    #[must_use]
    pub fn priority(mut self, priority: i32) -> Self {
        self.message.metadata.0.priority = priority;
        self
    }

    /// Sets the source.
    #[must_use]
    pub fn source(mut self, source: impl Into<String>) -> Self {
        self.message.metadata.0.source = source.into();
        self
    }

    /// Sets the tags.
    #[must_use]
    pub fn tags(mut self, tags: &[&str]) -> Self {
        self.message.metadata.0.tags = tags.iter().map(ToString::to_string).collect();
        self
    }

    /// Sets the creation time.
    #[must_use]
    pub fn created_at(mut self, at: DateTime<Utc>) -> Self {
        self.message.created_at = at;
        self.message.updated_at = at;
        self
    }

    /// Makes the record eligible only from `at`.
    #[must_use]
    pub fn next_retry_at(mut self, at: DateTime<Utc>) -> Self {
        self.message.next_retry_at = Some(at);
        self
    }

    /// Locks the record, as a worker that took it at `at` would have.
    #[must_use]
    pub fn locked_by(mut self, worker_id: impl Into<String>, at: DateTime<Utc>) -> Self {
        self.message.locked_by = Some(worker_id.into());
        self.message.locked_at = Some(at);
        self.message.status = DlqStatus::Processing;
        self
    }

    /// Appends an audit entry.
    #[must_use]
    pub fn attempt(mut self, attempt: ReplayAttempt) -> Self {
        self.message.replay_attempts.0.push(attempt);
        self
    }

    /// Finishes the record.
    pub fn build(self) -> DlqMessage {
        self.message
    }
}

/// Builder for [`QueueEnvelope`]s.
#[derive(Debug, Clone)]
pub struct EnvelopeBuilder {
    envelope: QueueEnvelope,
}

impl EnvelopeBuilder {
    /// Starts an envelope with an empty object payload.
    pub fn new(message_id: impl Into<String>) -> Self {
        Self { envelope: QueueEnvelope::new(message_id, json!({})) }
    }

    /// Sets the payload.
    #[must_use]
    pub fn payload(mut self, payload: Value) -> Self {
        self.envelope.payload = payload;
        self
    }

    /// Makes the simulated handler fail with `error_type`.
    #[must_use]
    pub fn simulate_error(mut self, error_type: &str) -> Self {
        self.envelope.payload = json!({ "simulateError": true, "errorType": error_type });
        self
    }

    /// Sets the primary-path retry count.
    #[must_use]
    pub fn retry_count(mut self, retry_count: u32) -> Self {
        self.envelope.retry_count = retry_count;
        self
    }

    /// Sets the priority.
    #[must_use]
    pub fn priority(mut self, priority: i32) -> Self {
        self.envelope.priority = priority;
        self
    }

    /// Sets the source.
    #[must_use]
    pub fn source(mut self, source: impl Into<String>) -> Self {
        self.envelope.source = source.into();
        self
    }

    /// Sets the tags.
    #[must_use]
    pub fn tags(mut self, tags: &[&str]) -> Self {
        self.envelope.tags = tags.iter().map(ToString::to_string).collect();
        self
    }

    /// Adds a captured request header.
    #[must_use]
    pub fn header(mut self, name: &str, value: &str) -> Self {
        self.envelope.headers.insert(name.to_string(), value.to_string());
        self
    }

    /// Marks the envelope as a replay of `dlq_id`.
    #[must_use]
    pub fn replay_of(mut self, dlq_id: DlqId) -> Self {
        self.envelope.original_dlq_id = Some(dlq_id);
        self
    }

    /// Finishes the envelope.
    pub fn build(self) -> QueueEnvelope {
        self.envelope
    }
}
