//! Primary-path retry decisions.
//!
//! Decides, for a message whose handler just failed, whether to re-enqueue
//! it with exponential backoff or hand it to the DLQ router. Unknown errors
//! are retried: the primary path is optimistic for a bounded number of
//! attempts and leaves escalation to the DLQ worker.

use std::{fmt, time::Duration};

use backstop_core::{
    backoff::exponential_backoff, classify, ErrorClass, ErrorSignal, LastError, QueueEnvelope,
    RetryHistoryEntry,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::debug;

/// Retry policy for live traffic.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Retries allowed before routing to the DLQ.
    pub max_retries: u32,

    /// Delay before the first retry; doubles with each one.
    pub base_backoff: Duration,

    /// Upper bound on the un-jittered delay.
    pub max_backoff: Duration,

    /// Symmetric jitter as a percentage (0 to 100) of the capped delay.
    pub jitter_percent: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_backoff: Duration::from_millis(1000),
            max_backoff: Duration::from_millis(30_000),
            jitter_percent: 20.0,
        }
    }
}

/// What to do with a failed message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RetryAction {
    /// Re-enqueue after the computed delay.
    Retry,
    /// Persist to the DLQ.
    RouteToDlq,
}

/// Why the decision was made.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RouteReason {
    /// Retry budget spent.
    MaxRetriesExceeded,
    /// Error will not go away on retry.
    PermanentError,
    /// Error looks transient or is unknown.
    TransientError,
}

impl fmt::Display for RouteReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::MaxRetriesExceeded => write!(f, "MAX_RETRIES_EXCEEDED"),
            Self::PermanentError => write!(f, "PERMANENT_ERROR"),
            Self::TransientError => write!(f, "TRANSIENT_ERROR"),
        }
    }
}

/// Outcome of [`RetryManager::decide`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryDecision {
    /// Retry or route.
    pub action: RetryAction,
    /// Why.
    pub reason: RouteReason,
    /// Classification of the error.
    pub error_class: ErrorClass,
    /// Delay before the retry; zero when routing.
    pub delay: Duration,
    /// Retry count the re-enqueued message carries; `None` when routing.
    pub next_retry_count: Option<u32>,
}

impl RetryDecision {
    /// Returns true when the message should be re-enqueued.
    pub fn is_retry(&self) -> bool {
        self.action == RetryAction::Retry
    }

    fn route(reason: RouteReason, error_class: ErrorClass) -> Self {
        Self {
            action: RetryAction::RouteToDlq,
            reason,
            error_class,
            delay: Duration::ZERO,
            next_retry_count: None,
        }
    }
}

/// Applies a [`RetryPolicy`] to failed messages.
#[derive(Debug, Clone, Default)]
pub struct RetryManager {
    policy: RetryPolicy,
}

impl RetryManager {
    /// Creates a manager for `policy`.
    pub fn new(policy: RetryPolicy) -> Self {
        Self { policy }
    }

    /// Policy in use.
    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    /// Returns true while the retry budget is not spent.
    pub fn should_retry(&self, retry_count: u32) -> bool {
        retry_count < self.policy.max_retries
    }

    /// Jittered, capped exponential delay for the given retry count.
    pub fn calculate_backoff(&self, retry_count: u32) -> Duration {
        let delay = exponential_backoff(
            retry_count,
            self.policy.base_backoff,
            self.policy.max_backoff,
            self.policy.jitter_percent,
        );
        debug!(retry_count, delay_ms = delay.as_millis(), "calculated backoff");
        delay
    }

    /// Retry or route for a message that failed with `error` after
    /// `retry_count` retries.
    ///
    /// The budget check comes first, so an exhausted message is routed even
    /// when its error is transient.
    pub fn decide(&self, retry_count: u32, error: &ErrorSignal) -> RetryDecision {
        let error_class = classify(error);

        if !self.should_retry(retry_count) {
            return RetryDecision::route(RouteReason::MaxRetriesExceeded, error_class);
        }
        if !error_class.is_retryable() {
            return RetryDecision::route(RouteReason::PermanentError, error_class);
        }

        RetryDecision {
            action: RetryAction::Retry,
            reason: RouteReason::TransientError,
            error_class,
            delay: self.calculate_backoff(retry_count),
            next_retry_count: Some(retry_count.saturating_add(1)),
        }
    }

    /// Envelope to re-enqueue after a failed attempt.
    ///
    /// Bumps the retry count, records the error as `last_error`, appends a
    /// history entry, and stamps `first_failed_at` on the first failure.
    pub fn prepare_retry(
        &self,
        envelope: &QueueEnvelope,
        error: &ErrorSignal,
        now: DateTime<Utc>,
    ) -> QueueEnvelope {
        let mut next = envelope.clone();
        next.retry_count = envelope.retry_count.saturating_add(1);
        next.first_failed_at.get_or_insert(now);
        next.last_error = Some(LastError {
            message: error.message.clone(),
            name: error.name.clone(),
            occurred_at: now,
        });
        next.retry_history.push(RetryHistoryEntry {
            attempt: next.retry_count,
            error: error.message.clone(),
            timestamp: now,
        });
        next
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    fn no_jitter() -> RetryManager {
        RetryManager::new(RetryPolicy { jitter_percent: 0.0, ..RetryPolicy::default() })
    }

    #[test]
    fn timeout_on_first_attempt_is_retried() {
        let manager = RetryManager::default();
        let error = ErrorSignal::new("External API timeout after 5000ms").with_code("TIMEOUT_ERROR");

        let decision = manager.decide(0, &error);

        assert_eq!(decision.action, RetryAction::Retry);
        assert_eq!(decision.next_retry_count, Some(1));
        assert_eq!(decision.error_class, ErrorClass::Transient);
        assert!(decision.delay <= manager.policy().max_backoff);
    }

    #[test]
    fn exhausted_budget_routes_even_transient_errors() {
        let decision = RetryManager::default().decide(3, &"ETIMEDOUT".into());

        assert_eq!(decision.action, RetryAction::RouteToDlq);
        assert_eq!(decision.reason, RouteReason::MaxRetriesExceeded);
        assert_eq!(decision.delay, Duration::ZERO);
        assert_eq!(decision.next_retry_count, None);
    }

    #[test]
    fn permanent_errors_route_immediately() {
        let decision =
            RetryManager::default().decide(0, &"Invalid payload: missing required field".into());

        assert_eq!(decision.action, RetryAction::RouteToDlq);
        assert_eq!(decision.reason, RouteReason::PermanentError);
        assert_eq!(decision.error_class, ErrorClass::Permanent);
    }

    #[test]
    fn unknown_errors_are_retried_optimistically() {
        let decision = RetryManager::default().decide(1, &"weird custom fault".into());

        assert!(decision.is_retry());
        assert_eq!(decision.error_class, ErrorClass::Unknown);
        assert_eq!(decision.next_retry_count, Some(2));
    }

    #[test]
    fn unjittered_backoff_doubles() {
        let manager = no_jitter();

        assert_eq!(manager.calculate_backoff(0), Duration::from_millis(1000));
        assert_eq!(manager.calculate_backoff(1), Duration::from_millis(2000));
        assert_eq!(manager.calculate_backoff(2), Duration::from_millis(4000));
        assert_eq!(manager.calculate_backoff(10), Duration::from_millis(30_000));
    }

    #[test]
    fn prepare_retry_accumulates_history() {
        let manager = RetryManager::default();
        let first = Utc::now();
        let second = first + chrono::Duration::seconds(2);
        let envelope = QueueEnvelope::new("msg-1", json!({"n": 1}));

        let once = manager.prepare_retry(&envelope, &"timeout".into(), first);
        let twice = manager.prepare_retry(&once, &"ECONNRESET".into(), second);

        assert_eq!(twice.retry_count, 2);
        assert_eq!(twice.first_failed_at, Some(first));
        assert_eq!(twice.last_error.as_ref().map(|e| e.message.as_str()), Some("ECONNRESET"));
        let attempts: Vec<u32> = twice.retry_history.iter().map(|h| h.attempt).collect();
        assert_eq!(attempts, vec![1, 2]);
        assert_eq!(twice.payload, envelope.payload);
    }
}
