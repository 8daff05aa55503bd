//! Core domain models and strongly-typed identifiers.
//!
//! Defines the dead-lettered message record, its status lifecycle, the
//! replay audit trail, and the envelope carried on the live queue. Includes
//! the database mappings used by the Postgres repositories.

use std::{collections::HashMap, fmt, str::FromStr};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sqlx::types::Json;
use uuid::Uuid;

type PgDb = sqlx::Postgres;
type PgValueRef<'r> = sqlx::postgres::PgValueRef<'r>;
type PgTypeInfo = sqlx::postgres::PgTypeInfo;
type PgArgumentBuffer = sqlx::postgres::PgArgumentBuffer;
type EncodeResult =
    Result<sqlx::encode::IsNull, Box<dyn std::error::Error + Send + Sync + 'static>>;
type BoxDynError = sqlx::error::BoxDynError;

/// Default priority for messages that do not carry one. Lower is more urgent.
pub const DEFAULT_PRIORITY: i32 = 2;

/// Tag added to envelopes re-injected by the DLQ worker.
pub const DLQ_RETRY_TAG: &str = "dlq_retry";

/// Identity of a dead-lettered record.
///
/// Distinct from the message id: the record id is what re-injected envelopes
/// point back to through `original_dlq_id`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DlqId(pub Uuid);

impl DlqId {
    /// Creates a new random record id.
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for DlqId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for DlqId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<Uuid> for DlqId {
    fn from(uuid: Uuid) -> Self {
        Self(uuid)
    }
}

impl sqlx::Type<PgDb> for DlqId {
    fn type_info() -> PgTypeInfo {
        <Uuid as sqlx::Type<PgDb>>::type_info()
    }
}

impl<'r> sqlx::Decode<'r, PgDb> for DlqId {
    fn decode(value: PgValueRef<'r>) -> Result<Self, BoxDynError> {
        let uuid = <Uuid as sqlx::Decode<PgDb>>::decode(value)?;
        Ok(Self(uuid))
    }
}

impl sqlx::Encode<'_, PgDb> for DlqId {
    fn encode_by_ref(&self, buf: &mut PgArgumentBuffer) -> EncodeResult {
        <Uuid as sqlx::Encode<PgDb>>::encode_by_ref(&self.0, buf)
    }
}

/// Lifecycle of a dead-lettered message.
///
/// ```text
/// Pending --(lock acquired)--> Processing --> Pending (rescheduled)
///    ^                                    \-> Resolved | Failed | Manual
///    \---- stale lock cleared ------------/
///
/// Replayed: operator replay only.   Archived: external retention only.
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DlqStatus {
    /// Waiting for a worker; eligible once `next_retry_at` has passed.
    Pending,
    /// Locked by a worker.
    Processing,
    /// Closed successfully.
    Resolved,
    /// Permanently failed.
    Failed,
    /// Waiting on a human.
    Manual,
    /// Moved out by retention.
    Archived,
    /// Re-injected by an operator.
    Replayed,
}

impl DlqStatus {
    /// All statuses, in lifecycle order.
    pub const ALL: [Self; 7] = [
        Self::Pending,
        Self::Processing,
        Self::Resolved,
        Self::Failed,
        Self::Manual,
        Self::Archived,
        Self::Replayed,
    ];

    /// Returns true when the record is closed for good.
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Resolved | Self::Archived | Self::Replayed)
    }

    /// Returns true when an operator may replay or resolve the message.
    pub const fn accepts_operator_action(self) -> bool {
        matches!(self, Self::Pending | Self::Failed | Self::Manual)
    }

    /// Text form used in storage and logs.
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Processing => "processing",
            Self::Resolved => "resolved",
            Self::Failed => "failed",
            Self::Manual => "manual",
            Self::Archived => "archived",
            Self::Replayed => "replayed",
        }
    }
}

impl fmt::Display for DlqStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for DlqStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|status| status.as_str() == s)
            .ok_or_else(|| format!("invalid dlq status: {s}"))
    }
}

impl sqlx::Type<PgDb> for DlqStatus {
    fn type_info() -> PgTypeInfo {
        <&str as sqlx::Type<PgDb>>::type_info()
    }
}

impl<'r> sqlx::Decode<'r, PgDb> for DlqStatus {
    fn decode(value: PgValueRef<'r>) -> Result<Self, BoxDynError> {
        let s = <&str as sqlx::Decode<PgDb>>::decode(value)?;
        Ok(s.parse::<Self>()?)
    }
}

impl sqlx::Encode<'_, PgDb> for DlqStatus {
    fn encode_by_ref(&self, buf: &mut PgArgumentBuffer) -> EncodeResult {
        <&str as sqlx::Encode<PgDb>>::encode_by_ref(&self.as_str(), buf)
    }
}

/// Circuit breaker state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    /// Normal operation, requests allowed.
    Closed,

    /// Failure rate tripped the breaker; requests blocked.
    Open,

    /// Probing recovery with a bounded number of trial requests.
    HalfOpen,
}

impl CircuitState {
    /// Legal edges: Closed -> Open, Open -> HalfOpen, HalfOpen -> Closed,
    /// HalfOpen -> Open.
    pub const fn can_transition_to(self, next: Self) -> bool {
        matches!(
            (self, next),
            (Self::Closed, Self::Open)
                | (Self::Open, Self::HalfOpen)
                | (Self::HalfOpen, Self::Closed)
                | (Self::HalfOpen, Self::Open)
        )
    }
}

impl fmt::Display for CircuitState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Closed => write!(f, "closed"),
            Self::Open => write!(f, "open"),
            Self::HalfOpen => write!(f, "half_open"),
        }
    }
}

/// Recovery strategy applied to a dead-lettered message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RecoveryStrategy {
    /// Re-inject into the live queue after a schedule-indexed delay.
    ImmediateRetry,
    /// Re-inject at the next off-peak hour.
    ScheduledRetry,
    /// Flag for a human.
    ManualIntervention,
    /// Give up permanently.
    MarkAsFailed,
    /// Operator-triggered replay.
    ManualReplay,
}

impl RecoveryStrategy {
    /// Text form used in audit entries and configuration.
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::ImmediateRetry => "IMMEDIATE_RETRY",
            Self::ScheduledRetry => "SCHEDULED_RETRY",
            Self::ManualIntervention => "MANUAL_INTERVENTION",
            Self::MarkAsFailed => "MARK_AS_FAILED",
            Self::ManualReplay => "MANUAL_REPLAY",
        }
    }

    /// Parses a strategy name, falling back to manual intervention for
    /// anything unrecognised so a message is never dropped on a typo.
    pub fn parse_or_manual(value: &str) -> Self {
        value.parse().unwrap_or_else(|_| {
            tracing::warn!(strategy = value, "unknown recovery strategy, using manual intervention");
            Self::ManualIntervention
        })
    }
}

impl fmt::Display for RecoveryStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RecoveryStrategy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let normalized = s.trim().to_ascii_uppercase();
        [
            Self::ImmediateRetry,
            Self::ScheduledRetry,
            Self::ManualIntervention,
            Self::MarkAsFailed,
            Self::ManualReplay,
        ]
        .into_iter()
        .find(|strategy| strategy.as_str() == normalized)
        .ok_or_else(|| format!("invalid recovery strategy: {s}"))
    }
}

/// Result recorded for a replay attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReplayOutcome {
    /// Re-injected with a delay.
    Scheduled,
    /// Flagged for manual handling.
    Flagged,
    /// Marked permanently failed.
    Failed,
    /// Re-injected by an operator.
    Replayed,
    /// Closed as resolved.
    Resolved,
}

/// One entry of the append-only replay audit trail.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReplayAttempt {
    /// When the attempt happened.
    pub timestamp: DateTime<Utc>,
    /// Worker or operator that performed it.
    pub worker_id: String,
    /// Strategy that was applied.
    pub strategy: RecoveryStrategy,
    /// What came of it.
    pub result: ReplayOutcome,
    /// Free-form details.
    pub notes: Option<String>,
}

/// Host resource snapshot captured when a message is dead-lettered.
///
/// Forensic context only; nothing makes decisions on these numbers.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct SystemState {
    /// Fraction of CPU time spent non-idle since boot, 0.0 to 1.0.
    pub cpu_usage: f64,
    /// Fraction of physical memory in use, 0.0 to 1.0.
    pub memory_usage: f64,
    /// Physical memory in megabytes.
    pub total_memory_mb: u64,
    /// Memory in use in megabytes.
    pub used_memory_mb: u64,
    /// Seconds since the process started.
    pub uptime_seconds: f64,
    /// When the snapshot was taken.
    pub captured_at: DateTime<Utc>,
}

/// Descriptive metadata stored with a dead-lettered message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MessageMetadata {
    /// Producer tag.
    pub source: String,
    /// 1 is the most urgent.
    pub priority: i32,
    /// Free-form tags.
    #[serde(default)]
    pub tags: Vec<String>,
    /// Headers captured from the original request.
    #[serde(default)]
    pub request_headers: HashMap<String, String>,
    /// Host snapshot at dead-letter time.
    pub system_state: Option<SystemState>,
}

impl Default for MessageMetadata {
    fn default() -> Self {
        Self {
            source: "api".to_string(),
            priority: DEFAULT_PRIORITY,
            tags: Vec::new(),
            request_headers: HashMap::new(),
            system_state: None,
        }
    }
}

/// A message that exhausted the primary path, with its recovery state.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct DlqMessage {
    /// Record identity.
    pub id: DlqId,
    /// Globally unique message id, immutable.
    pub message_id: String,
    /// Opaque original payload, immutable.
    pub original_message: Json<Value>,
    /// Failure message that triggered dead-lettering.
    pub error_reason: String,
    /// Stack or trace text, if the executor supplied one.
    pub error_stack: Option<String>,
    /// Error type code; drives worker classification.
    pub error_type: String,
    /// Retries spent on the primary path before routing.
    pub retry_count: i32,
    /// Retries spent by the DLQ worker.
    pub dlq_retry_count: i32,
    /// First failure of the message.
    pub first_failed_at: DateTime<Utc>,
    /// Most recent failure.
    pub last_failed_at: DateTime<Utc>,
    /// Current lifecycle status.
    pub status: DlqStatus,
    /// Worker holding the lock, if any.
    pub locked_by: Option<String>,
    /// When the lock was taken.
    pub locked_at: Option<DateTime<Utc>>,
    /// Earliest time the worker may pick the message up.
    pub next_retry_at: Option<DateTime<Utc>>,
    /// Source, priority, tags, headers and host snapshot.
    pub metadata: Json<MessageMetadata>,
    /// Append-only audit trail.
    pub replay_attempts: Json<Vec<ReplayAttempt>>,
    /// When the message was resolved.
    pub resolved_at: Option<DateTime<Utc>>,
    /// Who resolved it.
    pub resolved_by: Option<String>,
    /// Resolution notes.
    pub resolution_notes: Option<String>,
    /// Insert time.
    pub created_at: DateTime<Utc>,
    /// Last modification time.
    pub updated_at: DateTime<Utc>,
}

impl DlqMessage {
    /// Priority from metadata.
    pub fn priority(&self) -> i32 {
        self.metadata.priority
    }

    /// Returns true when a worker may pick the message up at `now`.
    pub fn is_eligible(&self, now: DateTime<Utc>) -> bool {
        self.status == DlqStatus::Pending
            && self.locked_by.is_none()
            && self.next_retry_at.is_none_or(|at| at <= now)
    }

    /// Returns true when the lock is older than `cutoff`. A lock with no
    /// timestamp cannot be aged and counts as stale.
    pub fn has_stale_lock(&self, cutoff: DateTime<Utc>) -> bool {
        self.locked_by.is_some() && self.locked_at.is_none_or(|at| at < cutoff)
    }
}

/// Last failure recorded on an envelope before it was re-enqueued.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LastError {
    /// Error message.
    pub message: String,
    /// Error name or class, if known.
    pub name: Option<String>,
    /// When it happened.
    pub occurred_at: DateTime<Utc>,
}

/// One primary-path retry of an envelope.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryHistoryEntry {
    /// Retry number, starting at 1.
    pub attempt: u32,
    /// Error that caused the retry.
    pub error: String,
    /// When the retry was scheduled.
    pub timestamp: DateTime<Utc>,
}

/// Item carried on the live queue.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueueEnvelope {
    /// Message id, unique per envelope.
    pub message_id: String,
    /// Business payload.
    pub payload: Value,
    /// Producer tag.
    pub source: String,
    /// 1 is the most urgent.
    pub priority: i32,
    /// Free-form tags.
    #[serde(default)]
    pub tags: Vec<String>,
    /// Primary-path retries already spent.
    #[serde(default)]
    pub retry_count: u32,
    /// Back-reference to the DLQ record this envelope replays.
    #[serde(default)]
    pub original_dlq_id: Option<DlqId>,
    /// Headers captured from the original request.
    #[serde(default)]
    pub headers: HashMap<String, String>,
    /// First failure on the primary path.
    #[serde(default)]
    pub first_failed_at: Option<DateTime<Utc>>,
    /// Most recent failure on the primary path.
    #[serde(default)]
    pub last_error: Option<LastError>,
    /// Retries already spent, oldest first.
    #[serde(default)]
    pub retry_history: Vec<RetryHistoryEntry>,
}

impl QueueEnvelope {
    /// Creates a fresh envelope with default source and priority.
    pub fn new(message_id: impl Into<String>, payload: Value) -> Self {
        Self {
            message_id: message_id.into(),
            payload,
            source: "api".to_string(),
            priority: DEFAULT_PRIORITY,
            tags: Vec::new(),
            retry_count: 0,
            original_dlq_id: None,
            headers: HashMap::new(),
            first_failed_at: None,
            last_error: None,
            retry_history: Vec::new(),
        }
    }

    /// Returns true when this envelope was re-injected by the DLQ worker.
    pub fn is_dlq_retry(&self) -> bool {
        self.tags.iter().any(|tag| tag == DLQ_RETRY_TAG)
    }
}

/// Number of messages sharing an error type.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorTypeCount {
    /// Error type code.
    pub error_type: String,
    /// Messages with that type.
    pub count: u64,
}

/// Aggregate view of the DLQ.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DlqStats {
    /// All messages.
    pub total: u64,
    /// Waiting for a worker.
    pub pending: u64,
    /// Locked by a worker.
    pub processing: u64,
    /// Resolved.
    pub resolved: u64,
    /// Permanently failed.
    pub failed: u64,
    /// Waiting on a human.
    pub manual: u64,
    /// Archived.
    pub archived: u64,
    /// Replayed by an operator.
    pub replayed: u64,
    /// Most frequent error types, descending.
    pub top_error_types: Vec<ErrorTypeCount>,
}

impl DlqStats {
    /// Adds `count` messages with `status` to the totals.
    pub fn add(&mut self, status: DlqStatus, count: u64) {
        self.total += count;
        let slot = match status {
            DlqStatus::Pending => &mut self.pending,
            DlqStatus::Processing => &mut self.processing,
            DlqStatus::Resolved => &mut self.resolved,
            DlqStatus::Failed => &mut self.failed,
            DlqStatus::Manual => &mut self.manual,
            DlqStatus::Archived => &mut self.archived,
            DlqStatus::Replayed => &mut self.replayed,
        };
        *slot += count;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_text_round_trips() {
        for status in DlqStatus::ALL {
            assert_eq!(status.as_str().parse::<DlqStatus>(), Ok(status));
        }
        assert!("dlq_pending".parse::<DlqStatus>().is_err());
    }

    #[test]
    fn only_documented_circuit_edges_are_legal() {
        use CircuitState::{Closed, HalfOpen, Open};

        assert!(Closed.can_transition_to(Open));
        assert!(Open.can_transition_to(HalfOpen));
        assert!(HalfOpen.can_transition_to(Closed));
        assert!(HalfOpen.can_transition_to(Open));

        assert!(!Closed.can_transition_to(HalfOpen));
        assert!(!Open.can_transition_to(Closed));
        assert!(!Closed.can_transition_to(Closed));
    }

    #[test]
    fn unknown_strategy_falls_back_to_manual() {
        assert_eq!(RecoveryStrategy::parse_or_manual("scheduled_retry"), RecoveryStrategy::ScheduledRetry);
        assert_eq!(RecoveryStrategy::parse_or_manual("RETRY_LATER"), RecoveryStrategy::ManualIntervention);
    }

    #[test]
    fn strategy_serializes_screaming_snake_case() {
        let json = serde_json::to_string(&RecoveryStrategy::MarkAsFailed).unwrap();
        assert_eq!(json, "\"MARK_AS_FAILED\"");
    }

    #[test]
    fn stats_add_tracks_total_and_bucket() {
        let mut stats = DlqStats::default();
        stats.add(DlqStatus::Pending, 3);
        stats.add(DlqStatus::Failed, 2);

        assert_eq!(stats.total, 5);
        assert_eq!(stats.pending, 3);
        assert_eq!(stats.failed, 2);
    }

    #[test]
    fn envelope_detects_dlq_retry_tag() {
        let mut envelope = QueueEnvelope::new("msg-1", serde_json::json!({}));
        assert!(!envelope.is_dlq_retry());
        envelope.tags.push(DLQ_RETRY_TAG.to_string());
        assert!(envelope.is_dlq_retry());
    }
}
