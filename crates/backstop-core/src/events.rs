//! Monitoring events and the alerting sink interface.
//!
//! The breaker and the DLQ router report what they do through
//! [`EventHandler`]. Handlers are fire-and-forget: they return nothing, so
//! a broken sink can never change the outcome of processing.
//!
//! ```text
//! ┌────────────────┐  CircuitTransition  ┌──────────────────────┐
//! │ CircuitBreaker │ ──────────────────▶ │                      │     ┌─────────────────┐
//! └────────────────┘                     │ MulticastEventHandler│ ──▶ │ TracingHandler  │
//! ┌────────────────┐    DeadLettered     │                      │ ──▶ │ pager, metrics… │
//! │   DlqRouter    │ ──────────────────▶ │                      │     └─────────────────┘
//! └────────────────┘                     └──────────────────────┘
//! ```

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{error, info, warn};

use crate::models::{CircuitState, DlqId};

/// Events emitted for monitoring and alerting.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum MonitoringEvent {
    /// The circuit breaker changed state.
    CircuitTransition(CircuitTransitionEvent),

    /// A message was persisted to the DLQ.
    DeadLettered(DeadLetteredEvent),

    /// Routing a message to the DLQ failed; the message may be lost.
    DeadLetterFailed(DeadLetterFailedEvent),
}

/// Kind of breaker transition, as seen by an alerting system.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransitionKind {
    /// Closed or half-open to open.
    Trip,
    /// Open to half-open.
    Probe,
    /// Half-open to closed.
    Recovery,
}

impl TransitionKind {
    /// Classifies a transition by its target state.
    pub const fn for_target(to: CircuitState) -> Self {
        match to {
            CircuitState::Open => Self::Trip,
            CircuitState::HalfOpen => Self::Probe,
            CircuitState::Closed => Self::Recovery,
        }
    }
}

/// Breaker state change.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CircuitTransitionEvent {
    /// State before the transition.
    pub from: CircuitState,
    /// State after the transition.
    pub to: CircuitState,
    /// Trip, probe or recovery.
    pub kind: TransitionKind,
    /// Failure rate over the window when the transition happened.
    pub failure_rate: f64,
    /// Number of events in the window.
    pub sample_count: usize,
    /// When it happened.
    pub occurred_at: DateTime<Utc>,
}

/// Message persisted to the DLQ.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeadLetteredEvent {
    /// Record id.
    pub dlq_id: DlqId,
    /// Message id.
    pub message_id: String,
    /// Error type stored on the record.
    pub error_type: String,
    /// Primary-path retries spent.
    pub retry_count: u32,
    /// When it was routed.
    pub routed_at: DateTime<Utc>,
}

/// DLQ routing failure.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeadLetterFailedEvent {
    /// Message id.
    pub message_id: String,
    /// Why routing failed.
    pub error: String,
    /// When it happened.
    pub occurred_at: DateTime<Utc>,
}

/// Receiver of monitoring events.
///
/// Implementations must not block processing for long and must swallow
/// their own failures.
#[async_trait::async_trait]
pub trait EventHandler: Send + Sync + std::fmt::Debug {
    /// Handles one event.
    async fn handle_event(&self, event: MonitoringEvent);
}

/// Discards every event.
#[derive(Debug, Default)]
pub struct NoOpEventHandler;

impl NoOpEventHandler {
    /// Creates a new no-op handler.
    pub fn new() -> Self {
        Self
    }
}

#[async_trait::async_trait]
impl EventHandler for NoOpEventHandler {
    async fn handle_event(&self, _event: MonitoringEvent) {}
}

/// Renders events as structured log lines.
///
/// Trips and routing failures are logged at error level so they surface
/// in whatever alerting watches the logs.
#[derive(Debug, Default)]
pub struct TracingEventHandler;

#[async_trait::async_trait]
impl EventHandler for TracingEventHandler {
    async fn handle_event(&self, event: MonitoringEvent) {
        match event {
            MonitoringEvent::CircuitTransition(t) => match t.kind {
                TransitionKind::Trip => error!(
                    from = %t.from,
                    to = %t.to,
                    failure_rate = t.failure_rate,
                    sample_count = t.sample_count,
                    "circuit breaker tripped"
                ),
                TransitionKind::Probe => info!(from = %t.from, to = %t.to, "circuit breaker probing"),
                TransitionKind::Recovery => warn!(
                    from = %t.from,
                    to = %t.to,
                    "circuit breaker closed, primary path recovered"
                ),
            },
            MonitoringEvent::DeadLettered(e) => warn!(
                dlq_id = %e.dlq_id,
                message_id = %e.message_id,
                error_type = %e.error_type,
                retry_count = e.retry_count,
                "message routed to dlq"
            ),
            MonitoringEvent::DeadLetterFailed(e) => error!(
                message_id = %e.message_id,
                error = %e.error,
                "critical: failed to route message to dlq"
            ),
        }
    }
}

/// Forwards events to every subscriber concurrently.
#[derive(Debug, Clone, Default)]
pub struct MulticastEventHandler {
    handlers: Vec<Arc<dyn EventHandler>>,
}

impl MulticastEventHandler {
    /// Creates a handler with no subscribers.
    pub fn new() -> Self {
        Self { handlers: Vec::new() }
    }

    /// Adds a subscriber.
    pub fn add_subscriber(&mut self, handler: Arc<dyn EventHandler>) {
        self.handlers.push(handler);
    }

    /// Number of subscribers.
    pub fn subscriber_count(&self) -> usize {
        self.handlers.len()
    }
}

#[async_trait::async_trait]
impl EventHandler for MulticastEventHandler {
    async fn handle_event(&self, event: MonitoringEvent) {
        let deliveries = self.handlers.iter().map(|handler| {
            let event = event.clone();
            async move { handler.handle_event(event).await }
        });
        futures::future::join_all(deliveries).await;
    }
}
